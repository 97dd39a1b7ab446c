#![forbid(unsafe_code)]

use std::cell::OnceCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::mem::size_of;

use bumpalo::{Bump, collections::Vec as BumpVec};
use tb_columnar::{AnyColumn, ColumnError, column_from_scalars};
use tb_frame::{Frame, FrameError};
use tb_types::{BinaryOp, Scalar, ScalarKey, TypeError, apply_binary};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GroupByError {
    #[error("group index was built at frame version {indexed}; the frame is now at {current}")]
    StaleIndex { indexed: u64, current: u64 },
    #[error("grouping needs at least one key column")]
    NoKeys,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Type(#[from] TypeError),
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupByExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for GroupByExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AggregateTrace {
    used_arena: bool,
    buckets: usize,
    estimated_bytes: usize,
}

// ── Group index ────────────────────────────────────────────────────────

/// Rows sharing one key-row, in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    key: Vec<Scalar>,
    rows: Vec<usize>,
}

impl Bucket {
    #[must_use]
    pub fn key(&self) -> &[Scalar] {
        &self.key
    }

    #[must_use]
    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Key-row to bucket mapping over one frame snapshot. Buckets are kept in
/// first-seen order.
#[derive(Debug, Clone)]
pub struct GroupIndex {
    keys: Vec<usize>,
    buckets: Vec<Bucket>,
    lookup: HashMap<Vec<ScalarKey>, usize>,
    rows: usize,
    version: u64,
}

impl GroupIndex {
    pub fn build(frame: &Frame, keys: &[usize]) -> Result<Self, GroupByError> {
        if keys.is_empty() {
            return Err(GroupByError::NoKeys);
        }
        let rows = frame.size()?;
        let columns = keys
            .iter()
            .map(|&index| frame.column(index))
            .collect::<Result<Vec<_>, _>>()?;

        let mut buckets: Vec<Bucket> = Vec::new();
        let mut lookup = HashMap::<Vec<ScalarKey>, usize>::new();
        for row in 0..rows {
            let key = columns
                .iter()
                .map(|column| column.scalar_at(row))
                .collect::<Result<Vec<_>, _>>()?;
            let hashed: Vec<ScalarKey> = key.iter().map(ScalarKey::from).collect();
            match lookup.entry(hashed) {
                Entry::Occupied(slot) => buckets[*slot.get()].rows.push(row),
                Entry::Vacant(slot) => {
                    slot.insert(buckets.len());
                    buckets.push(Bucket {
                        key,
                        rows: vec![row],
                    });
                }
            }
        }
        debug!(rows, keys = keys.len(), buckets = buckets.len(), "group index built");

        Ok(Self {
            keys: keys.to_vec(),
            buckets,
            lookup,
            rows,
            version: frame.version(),
        })
    }

    #[must_use]
    pub fn keys(&self) -> &[usize] {
        &self.keys
    }

    #[must_use]
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Number of rows the index was built over.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether `frame` is unchanged since this index was built.
    #[must_use]
    pub fn is_current(&self, frame: &Frame) -> bool {
        frame.version() == self.version
    }

    #[must_use]
    pub fn get(&self, key: &[Scalar]) -> Option<&Bucket> {
        let hashed: Vec<ScalarKey> = key.iter().map(ScalarKey::from).collect();
        self.lookup.get(&hashed).map(|&slot| &self.buckets[slot])
    }

    fn check_current(&self, frame: &Frame) -> Result<(), GroupByError> {
        if self.is_current(frame) {
            return Ok(());
        }
        Err(GroupByError::StaleIndex {
            indexed: self.version,
            current: frame.version(),
        })
    }
}

// ── Aggregations ───────────────────────────────────────────────────────

/// Per-bucket reduction; the payload is the source column position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Sum(usize),
    Min(usize),
    Max(usize),
    Mean(usize),
    StdDev(usize),
    Count,
}

impl Aggregation {
    #[must_use]
    pub fn op_name(self) -> &'static str {
        match self {
            Self::Sum(_) => "sum",
            Self::Min(_) => "min",
            Self::Max(_) => "max",
            Self::Mean(_) => "mean",
            Self::StdDev(_) => "stddev",
            Self::Count => "count",
        }
    }

    #[must_use]
    pub fn column(self) -> Option<usize> {
        match self {
            Self::Sum(c) | Self::Min(c) | Self::Max(c) | Self::Mean(c) | Self::StdDev(c) => {
                Some(c)
            }
            Self::Count => None,
        }
    }

    fn output_name(self, frame: &Frame) -> Result<String, GroupByError> {
        Ok(match self.column() {
            Some(index) => format!("{}( {} )", self.op_name(), frame.column(index)?.name()),
            None => "count(*)".to_owned(),
        })
    }

    fn reduce(self, values: &[Scalar], bucket_len: usize) -> Result<Scalar, GroupByError> {
        match self {
            Self::Sum(_) => fold_sum(values),
            Self::Min(_) => Ok(fold_extreme(values, Ordering::Less)),
            Self::Max(_) => Ok(fold_extreme(values, Ordering::Greater)),
            Self::Mean(_) => Ok(moments(values)?
                .map_or(Scalar::Absent, |(mean, _)| Scalar::Float64(mean))),
            Self::StdDev(_) => Ok(moments(values)?
                .map_or(Scalar::Absent, |(_, var)| Scalar::Float64(var.sqrt()))),
            Self::Count => Ok(Scalar::Int64(i64::try_from(bucket_len).unwrap_or(i64::MAX))),
        }
    }
}

#[must_use]
pub fn sum(column: usize) -> Aggregation {
    Aggregation::Sum(column)
}

#[must_use]
pub fn min(column: usize) -> Aggregation {
    Aggregation::Min(column)
}

#[must_use]
pub fn max(column: usize) -> Aggregation {
    Aggregation::Max(column)
}

#[must_use]
pub fn mean(column: usize) -> Aggregation {
    Aggregation::Mean(column)
}

#[must_use]
pub fn stddev(column: usize) -> Aggregation {
    Aggregation::StdDev(column)
}

#[must_use]
pub fn count() -> Aggregation {
    Aggregation::Count
}

/// Additive fold through the lifted `+`, so an absent input makes the sum
/// absent and integer sums stay integers.
fn fold_sum(values: &[Scalar]) -> Result<Scalar, GroupByError> {
    let mut iter = values.iter();
    let Some(first) = iter.next() else {
        return Ok(Scalar::Absent);
    };
    iter.try_fold(first.clone(), |acc, value| {
        apply_binary(BinaryOp::Add, &acc, value).map_err(GroupByError::from)
    })
}

/// Keep the first value that is not beaten by a later one under the total
/// order, where absent sorts before everything.
fn fold_extreme(values: &[Scalar], keep: Ordering) -> Scalar {
    values
        .iter()
        .fold(None::<&Scalar>, |best, value| match best {
            Some(best) if value.total_cmp(best) != keep => Some(best),
            _ => Some(value),
        })
        .cloned()
        .unwrap_or(Scalar::Absent)
}

/// Mean and population variance, widened to f64. `None` if any input is
/// absent.
fn moments(values: &[Scalar]) -> Result<Option<(f64, f64)>, GroupByError> {
    if values.is_empty() || values.iter().any(Scalar::is_absent) {
        return Ok(None);
    }
    let xs = values
        .iter()
        .map(Scalar::to_f64)
        .collect::<Result<Vec<_>, _>>()?;
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
    Ok(Some((mean, var)))
}

/// Estimate scratch memory for one gathered bucket.
fn estimate_aggregate_scratch_bytes(largest_bucket: usize) -> usize {
    largest_bucket.saturating_mul(size_of::<Scalar>())
}

fn gather_into<E: Extend<Scalar>>(
    scratch: &mut E,
    column: &dyn AnyColumn,
    rows: &[usize],
) -> Result<(), GroupByError> {
    for &row in rows {
        scratch.extend(std::iter::once(column.scalar_at(row)?));
    }
    Ok(())
}

fn reduce_with_global_allocator(
    column: Option<&dyn AnyColumn>,
    index: &GroupIndex,
    aggregation: Aggregation,
) -> Result<Vec<Scalar>, GroupByError> {
    let mut out = Vec::with_capacity(index.len());
    let mut scratch = Vec::<Scalar>::new();
    for bucket in index.buckets() {
        scratch.clear();
        if let Some(column) = column {
            gather_into(&mut scratch, column, bucket.rows())?;
        }
        out.push(aggregation.reduce(&scratch, bucket.len())?);
    }
    Ok(out)
}

fn reduce_with_arena(
    column: Option<&dyn AnyColumn>,
    index: &GroupIndex,
    aggregation: Aggregation,
) -> Result<Vec<Scalar>, GroupByError> {
    // Scratch is reused per bucket, so the arena grows only to the largest one.
    let arena = Bump::new();
    let mut scratch = BumpVec::<Scalar>::new_in(&arena);
    let mut out = Vec::with_capacity(index.len());
    for bucket in index.buckets() {
        scratch.clear();
        if let Some(column) = column {
            gather_into(&mut scratch, column, bucket.rows())?;
        }
        out.push(aggregation.reduce(scratch.as_slice(), bucket.len())?);
    }
    Ok(out)
}

fn aggregate_with_trace(
    frame: &Frame,
    index: &GroupIndex,
    aggregations: &[Aggregation],
    options: GroupByExecutionOptions,
) -> Result<(Frame, AggregateTrace), GroupByError> {
    let largest_bucket = index.buckets().iter().map(Bucket::len).max().unwrap_or(0);
    let estimated_bytes = estimate_aggregate_scratch_bytes(largest_bucket);
    let use_arena = options.use_arena && estimated_bytes <= options.arena_budget_bytes;

    let first_rows: Vec<usize> = index.buckets().iter().map(|bucket| bucket.rows[0]).collect();
    let mut columns = index
        .keys()
        .iter()
        .map(|&key| Ok(frame.column(key)?.take(&first_rows)?))
        .collect::<Result<Vec<_>, GroupByError>>()?;

    for &aggregation in aggregations {
        let source = aggregation
            .column()
            .map(|position| frame.column(position))
            .transpose()?;
        let values = if use_arena {
            reduce_with_arena(source, index, aggregation)?
        } else {
            reduce_with_global_allocator(source, index, aggregation)?
        };
        columns.push(column_from_scalars(aggregation.output_name(frame)?, &values)?);
    }

    debug!(
        buckets = index.len(),
        aggregations = aggregations.len(),
        used_arena = use_arena,
        "aggregate evaluated"
    );
    Ok((
        Frame::from_columns(columns)?,
        AggregateTrace {
            used_arena: use_arena,
            buckets: index.len(),
            estimated_bytes,
        },
    ))
}

/// One output row per bucket in first-occurrence order: the grouping columns
/// followed by one column per aggregation.
///
/// Fails with [`GroupByError::StaleIndex`] if `frame` changed after `index`
/// was built.
pub fn aggregate_index(
    frame: &Frame,
    index: &GroupIndex,
    aggregations: &[Aggregation],
) -> Result<Frame, GroupByError> {
    aggregate_index_with_options(
        frame,
        index,
        aggregations,
        GroupByExecutionOptions::default(),
    )
}

pub fn aggregate_index_with_options(
    frame: &Frame,
    index: &GroupIndex,
    aggregations: &[Aggregation],
    options: GroupByExecutionOptions,
) -> Result<Frame, GroupByError> {
    index.check_current(frame)?;
    let (out, _trace) = aggregate_with_trace(frame, index, aggregations, options)?;
    Ok(out)
}

// ── Lazy view ──────────────────────────────────────────────────────────

/// Grouping view over a borrowed frame. The index is built on first use and
/// cached; the borrow keeps the frame from changing underneath it.
#[derive(Debug)]
pub struct GroupBy<'a> {
    frame: &'a Frame,
    keys: Vec<usize>,
    index: OnceCell<GroupIndex>,
    options: GroupByExecutionOptions,
}

pub fn group_by<'a>(frame: &'a Frame, keys: &[usize]) -> GroupBy<'a> {
    GroupBy {
        frame,
        keys: keys.to_vec(),
        index: OnceCell::new(),
        options: GroupByExecutionOptions::default(),
    }
}

impl<'a> GroupBy<'a> {
    #[must_use]
    pub fn with_options(mut self, options: GroupByExecutionOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn frame(&self) -> &'a Frame {
        self.frame
    }

    pub fn index(&self) -> Result<&GroupIndex, GroupByError> {
        if let Some(index) = self.index.get() {
            return Ok(index);
        }
        let built = GroupIndex::build(self.frame, &self.keys)?;
        Ok(self.index.get_or_init(|| built))
    }

    pub fn aggregate(&self, aggregations: &[Aggregation]) -> Result<Frame, GroupByError> {
        let index = self.index()?;
        let (out, _trace) = aggregate_with_trace(self.frame, index, aggregations, self.options)?;
        Ok(out)
    }

    /// Detach the index from the borrow, e.g. to keep it across mutations.
    pub fn into_index(self) -> Result<GroupIndex, GroupByError> {
        match self.index.into_inner() {
            Some(index) => Ok(index),
            None => GroupIndex::build(self.frame, &self.keys),
        }
    }
}

#[cfg(test)]
mod tests {
    use tb_columnar::Series;
    use tb_frame::Frame;
    use tb_types::{Missing, Scalar, TypeError};

    use super::{
        GroupByError, GroupByExecutionOptions, GroupIndex, aggregate_index, aggregate_with_trace,
        count, group_by, max, mean, min, stddev, sum,
    };

    /// Nine rows whose keys form buckets of sizes 1, 2, 3, 1, 2.
    fn ledger() -> Frame {
        let keys = ["a", "b", "c", "b", "c", "c", "d", "e", "e"];
        Frame::new()
            .with_series(Series::from_vec(
                "key",
                keys.iter().map(|k| (*k).to_owned()).collect(),
            ))
            .expect("key")
            .with_series(Series::from_vec("amt", (1_i64..=9).collect()))
            .expect("amt")
            .with_series(Series::from_vec(
                "px",
                vec![
                    Missing::Present(2.0_f64),
                    Missing::Present(1.0),
                    Missing::Present(3.0),
                    Missing::Absent,
                    Missing::Present(5.0),
                    Missing::Present(4.0),
                    Missing::Absent,
                    Missing::Present(6.0),
                    Missing::Present(8.0),
                ],
            ))
            .expect("px")
    }

    fn int_column(frame: &Frame, index: usize) -> Vec<i64> {
        frame.series::<i64>(index).expect("i64 column").as_slice().to_vec()
    }

    #[test]
    fn sum_and_count_per_bucket_in_first_seen_order() {
        let frame = ledger();
        let out = group_by(&frame, &[0])
            .aggregate(&[sum(1), count()])
            .expect("aggregate");
        assert_eq!(out.column_names(), vec!["key", "sum( amt )", "count(*)"]);
        assert_eq!(
            out.series::<String>(0).expect("key").as_slice(),
            &["a", "b", "c", "d", "e"]
        );
        assert_eq!(int_column(&out, 1), vec![1, 6, 14, 7, 17]);
        let counts = int_column(&out, 2);
        assert_eq!(counts, vec![1, 2, 3, 1, 2]);
        assert_eq!(counts.iter().sum::<i64>(), 9);
    }

    #[test]
    fn min_max_follow_absent_ordering() {
        let frame = ledger();
        let out = group_by(&frame, &[0])
            .aggregate(&[min(2), max(2)])
            .expect("aggregate");
        let mins = out.series::<Missing<f64>>(1).expect("min").as_slice().to_vec();
        let maxs = out.series::<Missing<f64>>(2).expect("max").as_slice().to_vec();
        assert_eq!(mins[1], Missing::Absent, "absent sorts first");
        assert_eq!(maxs[1], Missing::Present(1.0), "max skips absent");
        assert_eq!(maxs[3], Missing::Absent, "all absent stays absent");
        assert_eq!(mins[2], Missing::Present(3.0));
        assert_eq!(maxs[2], Missing::Present(5.0));
    }

    #[test]
    fn mean_and_stddev_widen_to_f64() {
        let frame = ledger();
        let out = group_by(&frame, &[0])
            .aggregate(&[mean(1), stddev(1), mean(2)])
            .expect("aggregate");
        assert_eq!(out.column_names()[1], "mean( amt )");
        let means = out.series::<f64>(1).expect("mean is f64").as_slice().to_vec();
        assert_eq!(means, vec![1.0, 3.0, 14.0 / 3.0, 7.0, 8.5]);
        let sds = out.series::<f64>(2).expect("stddev").as_slice().to_vec();
        assert!((sds[1] - 1.0).abs() < 1e-12);
        assert!((sds[4] - 0.5).abs() < 1e-12);
        assert_eq!(sds[0], 0.0);

        let px = out.series::<Missing<f64>>(3).expect("gappy mean");
        assert_eq!(px.as_slice()[1], Missing::Absent);
        assert_eq!(px.as_slice()[4], Missing::Present(7.0));
    }

    #[test]
    fn multi_key_grouping_and_lookup() {
        let frame = Frame::new()
            .with_series(Series::from_vec("a", vec![1_i64, 1, 2, 1]))
            .expect("a")
            .with_series(Series::from_vec("b", vec![true, false, true, true]))
            .expect("b")
            .with_series(Series::from_vec("v", vec![1.5_f64, 2.5, 3.5, 4.5]))
            .expect("v");
        let view = group_by(&frame, &[0, 1]);
        let index = view.index().expect("index");
        assert_eq!(index.len(), 3);
        let bucket = index
            .get(&[Scalar::Int64(1), Scalar::Bool(true)])
            .expect("bucket exists");
        assert_eq!(bucket.rows(), &[0, 3]);
        assert!(index.get(&[Scalar::Int64(2), Scalar::Bool(false)]).is_none());
        assert!(std::ptr::eq(index, view.index().expect("cached")));

        let out = view.aggregate(&[sum(2)]).expect("aggregate");
        assert_eq!(out.series::<f64>(2).expect("sum").as_slice(), &[6.0, 2.5, 3.5]);
    }

    #[test]
    fn detached_index_detects_mutation() {
        let mut frame = ledger();
        let index = group_by(&frame, &[0]).into_index().expect("index");
        assert!(index.is_current(&frame));
        aggregate_index(&frame, &index, &[count()]).expect("current index");

        frame
            .push_row(&[Scalar::from("a"), Scalar::Int64(10), Scalar::Absent])
            .expect("push");
        assert!(!index.is_current(&frame));
        assert!(matches!(
            aggregate_index(&frame, &index, &[count()]),
            Err(GroupByError::StaleIndex { .. })
        ));

        let rebuilt = GroupIndex::build(&frame, &[0]).expect("rebuild");
        let out = aggregate_index(&frame, &rebuilt, &[count()]).expect("fresh index");
        assert_eq!(int_column(&out, 1), vec![2, 2, 3, 1, 2]);
    }

    #[test]
    fn index_rejects_unrelated_and_rebuilt_frames() {
        let small = |keys: &[&str], amts: Vec<i64>| {
            Frame::new()
                .with_series(Series::from_vec(
                    "key",
                    keys.iter().map(|k| (*k).to_owned()).collect(),
                ))
                .and_then(|frame| frame.with_series(Series::from_vec("amt", amts)))
                .expect("equal lengths")
        };
        let indexed = small(&["x", "x", "y"], vec![1, 2, 3]);
        let other = small(&["p", "q", "r", "s"], vec![10, 20, 30, 40]);
        let index = GroupIndex::build(&indexed, &[0]).expect("index");
        assert_ne!(indexed.version(), other.version());
        assert!(!index.is_current(&other));
        assert!(matches!(
            aggregate_index(&other, &index, &[sum(1)]),
            Err(GroupByError::StaleIndex { .. })
        ));

        // Row subsets and column selections are new frame states too.
        let mut narrowed = indexed.take_rows(&[1, 2]).expect("take");
        narrowed
            .add_column(Box::new(Series::from_vec("extra", vec![0_i64, 0])))
            .expect("add");
        narrowed
            .add_column(Box::new(Series::from_vec("more", vec![0_i64, 0])))
            .expect("add");
        assert!(!index.is_current(&narrowed));
        assert!(matches!(
            aggregate_index(&narrowed, &index, &[sum(1)]),
            Err(GroupByError::StaleIndex { .. })
        ));
        let selected = indexed.columns(&[0, 1]).expect("select");
        assert!(!index.is_current(&selected));
        assert!(index.is_current(&indexed));
    }

    #[test]
    fn arena_aggregate_matches_global_allocator() {
        let frame = ledger();
        let index = GroupIndex::build(&frame, &[0]).expect("index");
        let aggs = [sum(1), min(2), max(2), mean(2), stddev(1), count()];
        let (arena, arena_trace) =
            aggregate_with_trace(&frame, &index, &aggs, GroupByExecutionOptions::default())
                .expect("arena");
        let (global, global_trace) = aggregate_with_trace(
            &frame,
            &index,
            &aggs,
            GroupByExecutionOptions {
                use_arena: false,
                arena_budget_bytes: 0,
            },
        )
        .expect("global");
        assert!(arena_trace.used_arena);
        assert!(!global_trace.used_arena);
        assert_eq!(arena_trace.buckets, 5);
        for row in 0..5 {
            assert_eq!(
                arena.row(row).expect("arena row"),
                global.row(row).expect("global row")
            );
        }
    }

    #[test]
    fn arena_falls_back_when_budget_too_small() {
        let frame = ledger();
        let index = GroupIndex::build(&frame, &[0]).expect("index");
        let (_, trace) = aggregate_with_trace(
            &frame,
            &index,
            &[sum(1)],
            GroupByExecutionOptions {
                use_arena: true,
                arena_budget_bytes: 1,
            },
        )
        .expect("fallback");
        assert!(!trace.used_arena);
        assert!(trace.estimated_bytes > 1);
    }

    #[test]
    fn invalid_requests_fail() {
        let frame = ledger();
        assert!(matches!(
            group_by(&frame, &[]).aggregate(&[count()]),
            Err(GroupByError::NoKeys)
        ));
        assert!(matches!(
            group_by(&frame, &[1]).aggregate(&[mean(0)]),
            Err(GroupByError::Type(TypeError::NonNumeric { .. }))
        ));
        assert!(group_by(&frame, &[9]).index().is_err());
    }
}
