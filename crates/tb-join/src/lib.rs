#![forbid(unsafe_code)]

use std::mem::size_of;

use bumpalo::{Bump, collections::Vec as BumpVec};
use tb_columnar::ColumnError;
use tb_frame::{Frame, FrameError};
use tb_groupby::{GroupByError, GroupIndex};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum JoinError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    GroupBy(#[from] GroupByError),
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for JoinExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JoinExecutionTrace {
    used_arena: bool,
    output_rows: usize,
    estimated_bytes: usize,
}

/// Rows whose key appears on both sides: the full cross product of each
/// matching left and right bucket.
pub fn innerjoin(
    left: &Frame,
    left_key: usize,
    right: &Frame,
    right_key: usize,
) -> Result<Frame, JoinError> {
    join(left, left_key, right, right_key, JoinType::Inner)
}

/// Like [`innerjoin`], plus each left row whose key has no right match,
/// paired with a right row of default/absent values.
pub fn leftjoin(
    left: &Frame,
    left_key: usize,
    right: &Frame,
    right_key: usize,
) -> Result<Frame, JoinError> {
    join(left, left_key, right, right_key, JoinType::Left)
}

pub fn join(
    left: &Frame,
    left_key: usize,
    right: &Frame,
    right_key: usize,
    join_type: JoinType,
) -> Result<Frame, JoinError> {
    join_with_options(
        left,
        left_key,
        right,
        right_key,
        join_type,
        JoinExecutionOptions::default(),
    )
}

pub fn join_with_options(
    left: &Frame,
    left_key: usize,
    right: &Frame,
    right_key: usize,
    join_type: JoinType,
    options: JoinExecutionOptions,
) -> Result<Frame, JoinError> {
    let (joined, _) = join_with_trace(left, left_key, right, right_key, join_type, options)?;
    Ok(joined)
}

fn join_with_trace(
    left: &Frame,
    left_key: usize,
    right: &Frame,
    right_key: usize,
    join_type: JoinType,
    options: JoinExecutionOptions,
) -> Result<(Frame, JoinExecutionTrace), JoinError> {
    let left_index = GroupIndex::build(left, &[left_key])?;
    let right_index = GroupIndex::build(right, &[right_key])?;

    let output_rows = estimate_output_rows(&left_index, &right_index, join_type);
    let estimated_bytes = estimate_intermediate_bytes(output_rows);
    let use_arena = options.use_arena && estimated_bytes <= options.arena_budget_bytes;

    let joined = if use_arena {
        join_with_arena(left, right, &left_index, &right_index, join_type, output_rows)?
    } else {
        join_with_global_allocator(left, right, &left_index, &right_index, join_type, output_rows)?
    };
    debug!(
        ?join_type,
        left_rows = left_index.rows(),
        right_rows = right_index.rows(),
        output_rows,
        used_arena = use_arena,
        "join evaluated"
    );

    Ok((
        joined,
        JoinExecutionTrace {
            used_arena: use_arena,
            output_rows,
            estimated_bytes,
        },
    ))
}

fn estimate_output_rows(left: &GroupIndex, right: &GroupIndex, join_type: JoinType) -> usize {
    left.buckets()
        .iter()
        .map(|bucket| match right.get(bucket.key()) {
            Some(matches) => bucket.len() * matches.len(),
            None if join_type == JoinType::Left => bucket.len(),
            None => 0,
        })
        .sum()
}

fn estimate_intermediate_bytes(output_rows: usize) -> usize {
    output_rows.saturating_mul(size_of::<usize>().saturating_add(size_of::<Option<usize>>()))
}

/// Walk left buckets in first-seen order and report every output row as a
/// `(left_row, right_row)` pair; `None` marks an unmatched left row.
fn plan_pairs(
    left: &GroupIndex,
    right: &GroupIndex,
    join_type: JoinType,
    mut emit: impl FnMut(usize, Option<usize>),
) {
    for bucket in left.buckets() {
        match right.get(bucket.key()) {
            Some(matches) => {
                for &left_row in bucket.rows() {
                    for &right_row in matches.rows() {
                        emit(left_row, Some(right_row));
                    }
                }
            }
            None if join_type == JoinType::Left => {
                for &left_row in bucket.rows() {
                    emit(left_row, None);
                }
            }
            None => {}
        }
    }
}

fn assemble(
    left: &Frame,
    right: &Frame,
    left_positions: &[usize],
    right_positions: &[Option<usize>],
) -> Result<Frame, JoinError> {
    let left_part = left.take_rows(left_positions)?;
    let right_part = right.take_rows_or_default(right_positions)?;
    Ok(left_part.hcat(&right_part)?)
}

fn join_with_global_allocator(
    left: &Frame,
    right: &Frame,
    left_index: &GroupIndex,
    right_index: &GroupIndex,
    join_type: JoinType,
    output_rows: usize,
) -> Result<Frame, JoinError> {
    let mut left_positions = Vec::<usize>::with_capacity(output_rows);
    let mut right_positions = Vec::<Option<usize>>::with_capacity(output_rows);
    plan_pairs(left_index, right_index, join_type, |l, r| {
        left_positions.push(l);
        right_positions.push(r);
    });
    assemble(left, right, &left_positions, &right_positions)
}

fn join_with_arena(
    left: &Frame,
    right: &Frame,
    left_index: &GroupIndex,
    right_index: &GroupIndex,
    join_type: JoinType,
    output_rows: usize,
) -> Result<Frame, JoinError> {
    let arena = Bump::new();
    let mut left_positions = BumpVec::<usize>::with_capacity_in(output_rows, &arena);
    let mut right_positions = BumpVec::<Option<usize>>::with_capacity_in(output_rows, &arena);
    plan_pairs(left_index, right_index, join_type, |l, r| {
        left_positions.push(l);
        right_positions.push(r);
    });
    assemble(
        left,
        right,
        left_positions.as_slice(),
        right_positions.as_slice(),
    )
}
