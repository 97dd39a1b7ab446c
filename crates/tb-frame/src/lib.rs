#![forbid(unsafe_code)]

use std::any::type_name;
use std::cmp::Ordering;
use std::ops::Add;
use std::sync::atomic::{self, AtomicU64};

use tb_columnar::{AnyColumn, ColumnError, Series};
use tb_types::{Element, Missing, Scalar};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error(
        "inconsistent column sizes: column {column} ({name}) has {found} rows, expected {expected}"
    )]
    InconsistentSizes {
        column: usize,
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("column position {index} out of range for width {width}")]
    ColumnOutOfRange { index: usize, width: usize },
    #[error("column {index} holds {found}, not {expected}")]
    ColumnType {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },
    #[error("row has {found} values but the frame has {width} columns")]
    RowTooWide { width: usize, found: usize },
    #[error("frame widths differ: {left} vs {right}")]
    WidthMismatch { left: usize, right: usize },
    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// Ordered tuple of equal-length, independently typed columns.
///
/// Cloning is O(width): every column shares its buffer with the clone until
/// one side writes. `version` is a process-wide stamp renewed on every
/// construction and mutation, so detached derived state (group indices) can
/// tell when it went stale. A clone keeps the stamp until either side writes.
#[derive(Debug, Clone)]
pub struct Frame {
    columns: Vec<Box<dyn AnyColumn>>,
    version: u64,
}

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, atomic::Ordering::Relaxed)
}

impl Default for Frame {
    fn default() -> Self {
        Self::with_columns(Vec::new())
    }
}

impl Frame {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_columns(columns: Vec<Box<dyn AnyColumn>>) -> Self {
        Self {
            columns,
            version: next_version(),
        }
    }

    pub fn from_columns(columns: Vec<Box<dyn AnyColumn>>) -> Result<Self, FrameError> {
        let mut frame = Self::new();
        frame.populate(columns)?;
        Ok(frame)
    }

    /// Builder form of [`Frame::add_column`] for typed series.
    pub fn with_series<T: Element>(mut self, series: Series<T>) -> Result<Self, FrameError> {
        self.add_column(Box::new(series))?;
        Ok(self)
    }

    /// Replace the frame's contents with already-typed columns, as handed
    /// over by a loader.
    pub fn populate(&mut self, columns: Vec<Box<dyn AnyColumn>>) -> Result<(), FrameError> {
        check_lengths(&columns)?;
        self.columns = columns;
        self.touch();
        Ok(())
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Row count, after checking every column agrees on it.
    pub fn size(&self) -> Result<usize, FrameError> {
        check_lengths(&self.columns)
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name()).collect()
    }

    #[must_use]
    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name() == name)
    }

    pub fn column(&self, index: usize) -> Result<&dyn AnyColumn, FrameError> {
        self.columns
            .get(index)
            .map(|column| &**column)
            .ok_or(FrameError::ColumnOutOfRange {
                index,
                width: self.columns.len(),
            })
    }

    /// Mutable access to one column. Keeping the frame's lengths consistent
    /// is the caller's job; [`Frame::size`] reports any drift.
    pub fn column_mut(
        &mut self,
        index: usize,
    ) -> Result<&mut (dyn AnyColumn + 'static), FrameError> {
        let width = self.columns.len();
        let Some(column) = self.columns.get_mut(index) else {
            return Err(FrameError::ColumnOutOfRange { index, width });
        };
        self.version = next_version();
        Ok(column.as_mut())
    }

    pub fn series<T: Element>(&self, index: usize) -> Result<&Series<T>, FrameError> {
        let column = self.column(index)?;
        column
            .as_any()
            .downcast_ref::<Series<T>>()
            .ok_or(FrameError::ColumnType {
                index,
                expected: type_name::<T>(),
                found: column.type_name(),
            })
    }

    pub fn series_mut<T: Element>(&mut self, index: usize) -> Result<&mut Series<T>, FrameError> {
        let found = self.column(index)?.type_name();
        self.column_mut(index)?
            .as_any_mut()
            .downcast_mut::<Series<T>>()
            .ok_or(FrameError::ColumnType {
                index,
                expected: type_name::<T>(),
                found,
            })
    }

    // ── Column mechanics ───────────────────────────────────────────────

    pub fn add_column(&mut self, column: Box<dyn AnyColumn>) -> Result<(), FrameError> {
        let end = self.columns.len();
        self.insert_column(end, column)
    }

    pub fn prepend_column(&mut self, column: Box<dyn AnyColumn>) -> Result<(), FrameError> {
        self.insert_column(0, column)
    }

    pub fn insert_column(
        &mut self,
        position: usize,
        column: Box<dyn AnyColumn>,
    ) -> Result<(), FrameError> {
        if position > self.columns.len() {
            return Err(FrameError::ColumnOutOfRange {
                index: position,
                width: self.columns.len(),
            });
        }
        if !self.columns.is_empty() {
            let rows = self.size()?;
            if column.len() != rows {
                return Err(FrameError::InconsistentSizes {
                    column: position,
                    name: column.name().to_owned(),
                    expected: rows,
                    found: column.len(),
                });
            }
        }
        self.columns.insert(position, column);
        self.touch();
        Ok(())
    }

    pub fn remove_column(&mut self, index: usize) -> Result<Box<dyn AnyColumn>, FrameError> {
        self.column(index)?;
        self.touch();
        Ok(self.columns.remove(index))
    }

    /// New frame over `selection` (positions may repeat or reorder). The
    /// selected columns share their buffers with this frame.
    pub fn columns(&self, selection: &[usize]) -> Result<Self, FrameError> {
        let columns = selection
            .iter()
            .map(|&index| self.column(index).map(AnyColumn::clone_box))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::with_columns(columns))
    }

    /// Promote column `index` from `T` to `Missing<T>`.
    pub fn allow_missing<T: Element>(&mut self, index: usize) -> Result<(), FrameError> {
        let promoted = self.series::<T>(index)?.clone().allow_missing();
        self.columns[index] = Box::new(promoted);
        self.touch();
        Ok(())
    }

    /// Demote column `index` from `Missing<T>` to `T`, filling gaps with the
    /// default value.
    pub fn disallow_missing<T: Element>(&mut self, index: usize) -> Result<(), FrameError> {
        let demoted = self.series::<Missing<T>>(index)?.clone().disallow_missing()?;
        self.columns[index] = Box::new(demoted);
        self.touch();
        Ok(())
    }

    // ── Row mechanics ──────────────────────────────────────────────────

    /// Snapshot of row `row` as scalars, one per column.
    pub fn row(&self, row: usize) -> Result<Vec<Scalar>, FrameError> {
        self.size()?;
        self.columns
            .iter()
            .map(|column| column.scalar_at(row).map_err(FrameError::from))
            .collect()
    }

    pub fn rows(&self) -> Rows<'_> {
        Rows {
            frame: self,
            next: 0,
            end: self.columns.first().map_or(0, |column| column.len()),
        }
    }

    pub fn push_row(&mut self, values: &[Scalar]) -> Result<(), FrameError> {
        let end = self.size()?;
        self.insert_row(end, values)
    }

    /// Insert one row at `pos`. A short row fills its missing trailing
    /// columns with each column's default (or absent) value.
    pub fn insert_row(&mut self, pos: usize, values: &[Scalar]) -> Result<(), FrameError> {
        if values.len() > self.columns.len() {
            return Err(FrameError::RowTooWide {
                width: self.columns.len(),
                found: values.len(),
            });
        }
        self.lockstep_insert(pos, 1, |index, column| match values.get(index) {
            Some(value) => column.insert_scalar(pos, value),
            None => column.insert_default(pos, 1),
        })
    }

    pub fn push_row_from(&mut self, source: &Self, row: usize) -> Result<(), FrameError> {
        let end = self.size()?;
        self.insert_row_from(end, source, row)
    }

    /// Insert a copy of `source`'s row `row` at `pos`, column by column
    /// without going through scalars.
    pub fn insert_row_from(
        &mut self,
        pos: usize,
        source: &Self,
        row: usize,
    ) -> Result<(), FrameError> {
        if source.width() != self.width() {
            return Err(FrameError::WidthMismatch {
                left: self.width(),
                right: source.width(),
            });
        }
        self.lockstep_insert(pos, 1, |index, column| {
            column.insert_from(pos, source.columns[index].as_ref(), row)
        })
    }

    /// Insert a copy of this frame's own row `row` at `pos`.
    pub fn insert_row_within(&mut self, pos: usize, row: usize) -> Result<(), FrameError> {
        self.lockstep_insert(pos, 1, |_, column| column.insert_within(pos, row..row + 1))
    }

    /// Insert `count` rows of defaults at `pos`.
    pub fn insert_default_rows(&mut self, pos: usize, count: usize) -> Result<(), FrameError> {
        self.lockstep_insert(pos, count, |_, column| column.insert_default(pos, count))
    }

    /// Erase rows `[first, last)` from every column.
    pub fn erase_rows(&mut self, first: usize, last: usize) -> Result<usize, FrameError> {
        let rows = self.size()?;
        if last < first {
            return Err(ColumnError::InvalidArgument(format!(
                "row range end {last} precedes start {first}"
            ))
            .into());
        }
        if last > rows {
            return Err(ColumnError::IndexOutOfRange {
                index: last,
                len: rows,
            }
            .into());
        }
        for column in &mut self.columns {
            column.erase(first, last)?;
        }
        self.touch();
        Ok(last - first)
    }

    /// Remove and return the last row, or `None` when the frame is empty.
    pub fn pop_row(&mut self) -> Result<Option<Vec<Scalar>>, FrameError> {
        let rows = self.size()?;
        if rows == 0 || self.columns.is_empty() {
            return Ok(None);
        }
        let last = self.row(rows - 1)?;
        self.erase_rows(rows - 1, rows)?;
        Ok(Some(last))
    }

    /// Gather `rows` (in the given order) into a frame with fresh buffers.
    pub fn take_rows(&self, rows: &[usize]) -> Result<Self, FrameError> {
        self.size()?;
        let columns = self
            .columns
            .iter()
            .map(|column| column.take(rows))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::with_columns(columns))
    }

    /// Like [`Frame::take_rows`]; `None` positions become default/absent rows.
    pub fn take_rows_or_default(&self, rows: &[Option<usize>]) -> Result<Self, FrameError> {
        self.size()?;
        let columns = self
            .columns
            .iter()
            .map(|column| column.take_or_default(rows))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::with_columns(columns))
    }

    pub fn set(&mut self, row: usize, column: usize, value: &Scalar) -> Result<(), FrameError> {
        self.column_mut(column)?.set_scalar(row, value)?;
        Ok(())
    }

    fn lockstep_insert(
        &mut self,
        pos: usize,
        count: usize,
        mut insert: impl FnMut(usize, &mut Box<dyn AnyColumn>) -> Result<(), ColumnError>,
    ) -> Result<(), FrameError> {
        let rows = self.size()?;
        if pos > rows {
            return Err(ColumnError::IndexOutOfRange {
                index: pos,
                len: rows,
            }
            .into());
        }
        for index in 0..self.columns.len() {
            if let Err(err) = insert(index, &mut self.columns[index]) {
                for done in &mut self.columns[..index] {
                    // The insert just succeeded, so `[pos, pos + count)` is in range.
                    let undone = done.erase(pos, pos + count);
                    debug_assert!(undone.is_ok(), "rollback erase failed: {undone:?}");
                }
                return Err(err.into());
            }
        }
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.version = next_version();
    }

    // ── Whole-frame operations ─────────────────────────────────────────

    /// Side-by-side concatenation. The shorter frame is padded with
    /// default/absent rows first; unpadded columns stay shared.
    pub fn hcat(&self, other: &Self) -> Result<Self, FrameError> {
        let left_rows = self.size()?;
        let right_rows = other.size()?;
        let mut left = self.clone();
        let mut right = other.clone();
        if !left.columns.is_empty() && left_rows < right_rows {
            left.insert_default_rows(left_rows, right_rows - left_rows)?;
        }
        if !right.columns.is_empty() && right_rows < left_rows {
            right.insert_default_rows(right_rows, left_rows - right_rows)?;
        }
        left.columns.append(&mut right.columns);
        left.touch();
        Ok(left)
    }

    /// Vertical concatenation: a copy of this frame with every row of
    /// `other` appended column by column.
    pub fn vcat(&self, other: &Self) -> Result<Self, FrameError> {
        if self.columns.is_empty() {
            return Ok(other.clone());
        }
        if other.width() != self.width() {
            return Err(FrameError::WidthMismatch {
                left: self.width(),
                right: other.width(),
            });
        }
        self.size()?;
        other.size()?;
        let mut out = self.clone();
        for (column, source) in out.columns.iter_mut().zip(&other.columns) {
            column.extend_from(source.as_ref())?;
        }
        out.touch();
        Ok(out)
    }

    /// Stable ascending sort, lexicographic over the listed column positions.
    pub fn sort(&mut self, by: &[usize]) -> Result<(), FrameError> {
        self.sort_with(by, false)
    }

    pub fn reverse_sort(&mut self, by: &[usize]) -> Result<(), FrameError> {
        self.sort_with(by, true)
    }

    fn sort_with(&mut self, by: &[usize], descending: bool) -> Result<(), FrameError> {
        let rows = self.size()?;
        let keys = by
            .iter()
            .map(|&index| {
                let column = self.column(index)?;
                (0..rows)
                    .map(|row| column.scalar_at(row).map_err(FrameError::from))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut order: Vec<usize> = (0..rows).collect();
        order.sort_by(|&a, &b| {
            let ord = keys
                .iter()
                .map(|key| key[a].total_cmp(&key[b]))
                .find(|ord| *ord != Ordering::Equal)
                .unwrap_or(Ordering::Equal);
            if descending { ord.reverse() } else { ord }
        });
        debug!(rows, keys = by.len(), descending, "frame sorted");

        let columns = self
            .columns
            .iter()
            .map(|column| column.take(&order))
            .collect::<Result<Vec<_>, _>>()?;
        self.columns = columns;
        self.touch();
        Ok(())
    }

    // ── Rendering hooks ────────────────────────────────────────────────

    /// One rendered string per element of column `index`.
    pub fn to_strings(&self, index: usize) -> Result<Vec<String>, FrameError> {
        Ok(self.column(index)?.render_all())
    }

    /// Render a typed column through a caller-supplied hook.
    pub fn to_strings_with<T: Element>(
        &self,
        index: usize,
        hook: impl Fn(&T) -> String,
    ) -> Result<Vec<String>, FrameError> {
        Ok(self.series::<T>(index)?.to_strings_with(hook))
    }

    /// Widest rendered cell per column, header included, in characters.
    #[must_use]
    pub fn column_widths(&self) -> Vec<usize> {
        self.columns
            .iter()
            .map(|column| {
                column
                    .render_all()
                    .iter()
                    .map(|cell| cell.chars().count())
                    .chain(std::iter::once(column.name().chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect()
    }
}

impl Add<&Frame> for &Frame {
    type Output = Result<Frame, FrameError>;

    fn add(self, rhs: &Frame) -> Self::Output {
        self.vcat(rhs)
    }
}

fn check_lengths(columns: &[Box<dyn AnyColumn>]) -> Result<usize, FrameError> {
    let Some(first) = columns.first() else {
        return Ok(0);
    };
    let expected = first.len();
    for (index, column) in columns.iter().enumerate().skip(1) {
        if column.len() != expected {
            return Err(FrameError::InconsistentSizes {
                column: index,
                name: column.name().to_owned(),
                expected,
                found: column.len(),
            });
        }
    }
    Ok(expected)
}

/// Row-snapshot iterator returned by [`Frame::rows`].
pub struct Rows<'a> {
    frame: &'a Frame,
    next: usize,
    end: usize,
}

impl Iterator for Rows<'_> {
    type Item = Result<Vec<Scalar>, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let row = self.frame.row(self.next);
        self.next += 1;
        Some(row)
    }
}
