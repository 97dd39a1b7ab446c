#![forbid(unsafe_code)]

use std::any::{Any, type_name};
use std::fmt;
use std::iter;
use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tb_types::{Element, Missing, Scalar, TypeError};
use thiserror::Error;
use tracing::trace;

/// Capacity of the first block a buffer allocates when it grows from empty.
pub const DEFAULT_CAPACITY: usize = 32;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ColumnError {
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("element type {type_name} has no default value")]
    TypeNotDefaultConstructible { type_name: &'static str },
    #[error("minmax of an empty column of {type_name}, which has no default value")]
    EmptyNotDefaultConstructible { type_name: &'static str },
    #[error("element type {type_name} has no scalar projection")]
    Opaque { type_name: &'static str },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("column of {column} cannot hold {found}")]
    TypeMismatch { column: &'static str, found: String },
    #[error("column length mismatch: left={left}, right={right}")]
    LengthMismatch { left: usize, right: usize },
    #[error(transparent)]
    Type(#[from] TypeError),
}

// ── Column buffer ──────────────────────────────────────────────────────

/// Growable element array with a power-of-two capacity policy.
///
/// `capacity` is the logical block size: it only grows through [`reserve`],
/// never shrinks implicitly, and drops to zero on [`clear`].
///
/// [`reserve`]: ColumnBuffer::reserve
/// [`clear`]: ColumnBuffer::clear
#[derive(Debug)]
pub struct ColumnBuffer<T> {
    data: Vec<T>,
    capacity: usize,
}

impl<T> Default for ColumnBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ColumnBuffer<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            capacity: 0,
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            0
        } else {
            capacity.checked_next_power_of_two().unwrap_or(usize::MAX)
        };
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[must_use]
    pub fn from_vec(values: Vec<T>) -> Self {
        let mut buffer = Self::with_capacity(values.len());
        buffer.data = values;
        buffer.data.reserve_exact(buffer.capacity - buffer.data.len());
        buffer
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.data.iter()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    pub fn at(&self, index: usize) -> Result<&T, ColumnError> {
        let len = self.data.len();
        self.data
            .get(index)
            .ok_or(ColumnError::IndexOutOfRange { index, len })
    }

    pub fn at_mut(&mut self, index: usize) -> Result<&mut T, ColumnError> {
        let len = self.data.len();
        self.data
            .get_mut(index)
            .ok_or(ColumnError::IndexOutOfRange { index, len })
    }

    /// Grow the block to the next power of two `>= n`, moving every element
    /// across in order. A buffer growing from nothing allocates at least
    /// [`DEFAULT_CAPACITY`].
    pub fn reserve(&mut self, n: usize) {
        if n <= self.capacity {
            return;
        }
        let target = if self.capacity == 0 {
            n.max(DEFAULT_CAPACITY)
        } else {
            n
        };
        let new_capacity = target.checked_next_power_of_two().unwrap_or(usize::MAX);
        let mut block = Vec::with_capacity(new_capacity);
        block.extend(self.data.drain(..));
        trace!(
            old_capacity = self.capacity,
            new_capacity,
            len = block.len(),
            "column buffer reallocated"
        );
        self.data = block;
        self.capacity = new_capacity;
    }

    /// Insert `values` so the first lands at `pos`, shifting the tail right.
    /// Returns the number of inserted elements.
    pub fn insert<I>(&mut self, pos: usize, values: I) -> Result<usize, ColumnError>
    where
        I: IntoIterator<Item = T>,
    {
        self.check_insert_position(pos)?;
        Ok(self.splice_in(pos, values))
    }

    pub fn push_back(&mut self, value: T) {
        let end = self.data.len();
        self.splice_in(end, iter::once(value));
    }

    pub fn pop_back(&mut self) -> Option<T> {
        self.data.pop()
    }

    /// Remove `[first, last)`, shifting the surviving tail left.
    /// Returns the number of erased elements.
    pub fn erase(&mut self, first: usize, last: usize) -> Result<usize, ColumnError> {
        self.check_range(&(first..last))?;
        self.data.drain(first..last);
        Ok(last - first)
    }

    pub fn resize_with(&mut self, len: usize, fill: impl FnMut() -> T) {
        if len < self.data.len() {
            self.data.truncate(len);
            return;
        }
        self.reserve(len);
        self.data.resize_with(len, fill);
    }

    /// Drop every element and release the block.
    pub fn clear(&mut self) {
        self.data = Vec::new();
        self.capacity = 0;
    }

    fn splice_in<I>(&mut self, pos: usize, values: I) -> usize
    where
        I: IntoIterator<Item = T>,
    {
        let values = values.into_iter();
        let old_len = self.data.len();
        self.reserve(old_len + values.size_hint().0);
        for value in values {
            self.reserve(self.data.len() + 1);
            self.data.push(value);
        }
        let count = self.data.len() - old_len;
        self.data[pos..].rotate_right(count);
        count
    }

    fn check_insert_position(&self, pos: usize) -> Result<(), ColumnError> {
        if pos > self.data.len() {
            return Err(ColumnError::IndexOutOfRange {
                index: pos,
                len: self.data.len(),
            });
        }
        Ok(())
    }

    fn check_range(&self, range: &Range<usize>) -> Result<(), ColumnError> {
        if range.end < range.start {
            return Err(ColumnError::InvalidArgument(format!(
                "range end {} precedes start {}",
                range.end, range.start
            )));
        }
        if range.end > self.data.len() {
            return Err(ColumnError::IndexOutOfRange {
                index: range.end,
                len: self.data.len(),
            });
        }
        Ok(())
    }
}

impl<T: Clone> ColumnBuffer<T> {
    /// Insert a copy of `source` (a range of this same buffer) at `pos`.
    ///
    /// The source elements are copied out before anything shifts, so ranges
    /// that straddle `pos` are read in their original state.
    pub fn insert_within(
        &mut self,
        pos: usize,
        source: Range<usize>,
    ) -> Result<usize, ColumnError> {
        self.check_insert_position(pos)?;
        self.check_range(&source)?;
        let count = source.len();
        self.reserve(self.data.len() + count);
        self.data.extend_from_within(source);
        self.data[pos..].rotate_right(count);
        Ok(count)
    }
}

impl<T: Element> ColumnBuffer<T> {
    pub fn resize(&mut self, len: usize) -> Result<(), ColumnError> {
        if len <= self.data.len() {
            self.data.truncate(len);
            return Ok(());
        }
        let fill = T::default_value().ok_or(ColumnError::TypeNotDefaultConstructible {
            type_name: type_name::<T>(),
        })?;
        self.reserve(len);
        self.data.resize(len, fill);
        Ok(())
    }
}

impl<T: Clone> Clone for ColumnBuffer<T> {
    fn clone(&self) -> Self {
        let mut data = Vec::with_capacity(self.capacity);
        data.extend_from_slice(&self.data);
        Self {
            data,
            capacity: self.capacity,
        }
    }
}

impl<T: PartialEq> PartialEq for ColumnBuffer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl<T> FromIterator<T> for ColumnBuffer<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut buffer = Self::new();
        buffer.splice_in(0, iter);
        buffer
    }
}

impl<T: Serialize> Serialize for ColumnBuffer<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.data.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for ColumnBuffer<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<T>::deserialize(deserializer).map(Self::from_vec)
    }
}

// ── Series ─────────────────────────────────────────────────────────────

/// Named column sharing its buffer with every copy until one of them writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series<T> {
    name: String,
    #[serde(rename = "values")]
    buffer: Arc<ColumnBuffer<T>>,
}

impl<T: Element> Series<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffer: Arc::new(ColumnBuffer::new()),
        }
    }

    pub fn from_vec(name: impl Into<String>, values: Vec<T>) -> Self {
        Self {
            name: name.into(),
            buffer: Arc::new(ColumnBuffer::from_vec(values)),
        }
    }

    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            buffer: Arc::new(ColumnBuffer::with_capacity(capacity)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Number of series currently sharing this buffer.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.buffer)
    }

    #[must_use]
    pub fn shares_buffer_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    #[must_use]
    pub fn buffer(&self) -> &ColumnBuffer<T> {
        &self.buffer
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        self.buffer.as_slice()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.buffer.iter()
    }

    pub fn at(&self, index: usize) -> Result<&T, ColumnError> {
        self.buffer.at(index)
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.buffer.as_slice().get(index)
    }

    /// Privatize the buffer before a write: a shared buffer is deep-copied
    /// and this series keeps the copy.
    fn unref(&mut self) -> &mut ColumnBuffer<T> {
        if Arc::strong_count(&self.buffer) > 1 {
            trace!(
                series = %self.name,
                len = self.buffer.len(),
                "forking shared column buffer"
            );
        }
        Arc::make_mut(&mut self.buffer)
    }

    pub fn at_mut(&mut self, index: usize) -> Result<&mut T, ColumnError> {
        let len = self.len();
        if index >= len {
            return Err(ColumnError::IndexOutOfRange { index, len });
        }
        self.unref().at_mut(index)
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.unref().as_mut_slice()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.unref().as_mut_slice().iter_mut()
    }

    pub fn reserve(&mut self, n: usize) {
        if n > self.capacity() {
            self.unref().reserve(n);
        }
    }

    pub fn push_back(&mut self, value: T) {
        self.unref().push_back(value);
    }

    pub fn pop_back(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        self.unref().pop_back()
    }

    pub fn insert<I>(&mut self, pos: usize, values: I) -> Result<usize, ColumnError>
    where
        I: IntoIterator<Item = T>,
    {
        self.unref().insert(pos, values)
    }

    pub fn insert_within(
        &mut self,
        pos: usize,
        source: Range<usize>,
    ) -> Result<usize, ColumnError> {
        self.unref().insert_within(pos, source)
    }

    pub fn erase(&mut self, first: usize, last: usize) -> Result<usize, ColumnError> {
        self.unref().erase(first, last)
    }

    pub fn resize(&mut self, len: usize) -> Result<(), ColumnError> {
        self.unref().resize(len)
    }

    pub fn resize_with(&mut self, len: usize, fill: impl FnMut() -> T) {
        self.unref().resize_with(len, fill);
    }

    /// Detach from any shared buffer and release storage.
    pub fn clear(&mut self) {
        self.buffer = Arc::new(ColumnBuffer::new());
    }

    /// Promote every value to `Present`.
    #[must_use]
    pub fn allow_missing(self) -> Series<Missing<T>> {
        let values = self.buffer.iter().cloned().map(Missing::Present).collect();
        Series::from_vec(self.name, values)
    }

    #[must_use]
    pub fn to_strings(&self) -> Vec<String> {
        self.buffer.iter().map(Element::render).collect()
    }

    /// Render with a caller-supplied stringify hook.
    pub fn to_strings_with(&self, hook: impl Fn(&T) -> String) -> Vec<String> {
        self.buffer.iter().map(hook).collect()
    }

    /// Smallest and largest element. An empty series yields the type's
    /// default for both ends.
    pub fn minmax(&self) -> Result<(T, T), ColumnError>
    where
        T: PartialOrd,
    {
        let mut values = self.buffer.iter();
        let Some(first) = values.next() else {
            return T::default_value()
                .map(|value| (value.clone(), value))
                .ok_or(ColumnError::EmptyNotDefaultConstructible {
                    type_name: type_name::<T>(),
                });
        };
        let (min, max) = values.fold((first, first), |(min, max), value| {
            (
                if value < min { value } else { min },
                if value > max { value } else { max },
            )
        });
        Ok((min.clone(), max.clone()))
    }

    fn into_values(self) -> Vec<T> {
        Arc::try_unwrap(self.buffer)
            .unwrap_or_else(|shared| (*shared).clone())
            .into_vec()
    }
}

impl<T: Element> Series<Missing<T>> {
    /// Unwrap `Present` values and replace `Absent` with the type's default.
    pub fn disallow_missing(self) -> Result<Series<T>, ColumnError> {
        let fill = T::default_value().ok_or(ColumnError::TypeNotDefaultConstructible {
            type_name: type_name::<T>(),
        })?;
        let name = self.name.clone();
        let values = self
            .into_values()
            .into_iter()
            .map(|value| value.unwrap_or(fill.clone()))
            .collect();
        Ok(Series::from_vec(name, values))
    }
}

// ── Numeric reductions ─────────────────────────────────────────────────

/// Element types the numeric reductions accept.
pub trait Numeric: Element + Copy {
    /// Whether sums over this type go through the lane-split kernel.
    const VECTORIZE: bool = false;

    fn to_f64(self) -> f64;
}

macro_rules! scalar_numeric {
    ($($ty:ty),*) => {
        $(
            impl Numeric for $ty {
                fn to_f64(self) -> f64 {
                    self as f64
                }
            }
        )*
    };
}

scalar_numeric!(i8, i16, i32, i64, u8, u16, u32);

impl Numeric for f64 {
    const VECTORIZE: bool = true;

    fn to_f64(self) -> f64 {
        self
    }
}

impl Numeric for f32 {
    const VECTORIZE: bool = true;

    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

const LANES: usize = 8;

/// Sum `term(0..len)` with independent per-lane accumulators so the loop
/// body has no cross-iteration dependency.
fn lane_sum(len: usize, term: impl Fn(usize) -> f64) -> f64 {
    let mut acc = [0.0_f64; LANES];
    let full = len - len % LANES;
    let mut base = 0;
    while base < full {
        for (lane, slot) in acc.iter_mut().enumerate() {
            *slot += term(base + lane);
        }
        base += LANES;
    }
    let tail: f64 = (full..len).map(&term).sum();
    acc.iter().sum::<f64>() + tail
}

fn summation(len: usize, vectorize: bool, term: impl Fn(usize) -> f64) -> f64 {
    if vectorize {
        lane_sum(len, term)
    } else {
        (0..len).map(term).sum()
    }
}

impl<T: Numeric> Series<T> {
    #[must_use]
    pub fn sum(&self) -> f64 {
        let values = self.as_slice();
        summation(values.len(), T::VECTORIZE, |i| values[i].to_f64())
    }

    /// Arithmetic mean; NaN for an empty series.
    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.is_empty() {
            return f64::NAN;
        }
        self.sum() / self.len() as f64
    }

    /// Population standard deviation, `sqrt(mean((x - mean(x))^2))`.
    #[must_use]
    pub fn stddev(&self) -> f64 {
        let values = self.as_slice();
        if values.is_empty() {
            return f64::NAN;
        }
        let mean = self.mean();
        let sq = summation(values.len(), T::VECTORIZE, |i| {
            let d = values[i].to_f64() - mean;
            d * d
        });
        (sq / values.len() as f64).sqrt()
    }

    /// Pearson correlation of two equal-length series.
    pub fn correlate<U: Numeric>(&self, other: &Series<U>) -> Result<f64, ColumnError> {
        if self.len() != other.len() {
            return Err(ColumnError::LengthMismatch {
                left: self.len(),
                right: other.len(),
            });
        }
        let xs = self.as_slice();
        let ys = other.as_slice();
        if xs.is_empty() {
            return Ok(f64::NAN);
        }
        let vectorize = T::VECTORIZE && U::VECTORIZE;
        let mx = self.mean();
        let my = other.mean();
        let cov = summation(xs.len(), vectorize, |i| {
            (xs[i].to_f64() - mx) * (ys[i].to_f64() - my)
        });
        let vx = summation(xs.len(), vectorize, |i| (xs[i].to_f64() - mx).powi(2));
        let vy = summation(ys.len(), vectorize, |i| (ys[i].to_f64() - my).powi(2));
        Ok(cov / (vx * vy).sqrt())
    }
}

// ── Type-erased columns ────────────────────────────────────────────────

/// Column whose element type is only known at runtime. Frames, expressions,
/// group indices and joins work through this trait; typed access goes
/// through [`AnyColumn::as_any`] downcasts to `Series<T>`.
pub trait AnyColumn: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;
    fn set_name(&mut self, name: String);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn type_name(&self) -> &'static str;
    fn allows_missing(&self) -> bool;

    fn scalar_at(&self, row: usize) -> Result<Scalar, ColumnError>;
    fn default_scalar(&self) -> Option<Scalar>;
    fn render_at(&self, row: usize) -> Result<String, ColumnError>;
    fn render_all(&self) -> Vec<String>;

    fn set_scalar(&mut self, row: usize, value: &Scalar) -> Result<(), ColumnError>;
    fn insert_scalar(&mut self, pos: usize, value: &Scalar) -> Result<(), ColumnError>;
    fn insert_default(&mut self, pos: usize, count: usize) -> Result<(), ColumnError>;
    fn insert_from(
        &mut self,
        pos: usize,
        source: &dyn AnyColumn,
        row: usize,
    ) -> Result<(), ColumnError>;
    fn insert_within(&mut self, pos: usize, source: Range<usize>) -> Result<(), ColumnError>;
    fn extend_from(&mut self, source: &dyn AnyColumn) -> Result<(), ColumnError>;
    fn erase(&mut self, first: usize, last: usize) -> Result<usize, ColumnError>;
    fn resize(&mut self, len: usize) -> Result<(), ColumnError>;

    /// Gather `rows` into a new column with its own buffer.
    fn take(&self, rows: &[usize]) -> Result<Box<dyn AnyColumn>, ColumnError>;
    /// Like [`AnyColumn::take`], with `None` slots filled by the default
    /// (or absent) value.
    fn take_or_default(&self, rows: &[Option<usize>]) -> Result<Box<dyn AnyColumn>, ColumnError>;

    /// Copy sharing the same buffer.
    fn clone_box(&self) -> Box<dyn AnyColumn>;
    fn shares_buffer_with(&self, other: &dyn AnyColumn) -> bool;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl Clone for Box<dyn AnyColumn> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

impl<T: Element> Series<T> {
    fn from_scalar_checked(value: &Scalar) -> Result<T, ColumnError> {
        T::from_scalar(value).ok_or_else(|| ColumnError::TypeMismatch {
            column: type_name::<T>(),
            found: value.dtype_name().to_owned(),
        })
    }

    fn default_checked() -> Result<T, ColumnError> {
        T::default_value().ok_or(ColumnError::TypeNotDefaultConstructible {
            type_name: type_name::<T>(),
        })
    }

    fn downcast_source(source: &dyn AnyColumn) -> Result<&Self, ColumnError> {
        source
            .as_any()
            .downcast_ref::<Self>()
            .ok_or_else(|| ColumnError::TypeMismatch {
                column: type_name::<T>(),
                found: source.type_name().to_owned(),
            })
    }
}

impl<T: Element> AnyColumn for Series<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn len(&self) -> usize {
        self.buffer.len()
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn allows_missing(&self) -> bool {
        T::ALLOWS_MISSING
    }

    fn scalar_at(&self, row: usize) -> Result<Scalar, ColumnError> {
        self.at(row)?.to_scalar().ok_or(ColumnError::Opaque {
            type_name: type_name::<T>(),
        })
    }

    fn default_scalar(&self) -> Option<Scalar> {
        T::default_value().and_then(|value| value.to_scalar())
    }

    fn render_at(&self, row: usize) -> Result<String, ColumnError> {
        self.at(row).map(Element::render)
    }

    fn render_all(&self) -> Vec<String> {
        self.to_strings()
    }

    fn set_scalar(&mut self, row: usize, value: &Scalar) -> Result<(), ColumnError> {
        let value = Self::from_scalar_checked(value)?;
        *self.at_mut(row)? = value;
        Ok(())
    }

    fn insert_scalar(&mut self, pos: usize, value: &Scalar) -> Result<(), ColumnError> {
        let value = Self::from_scalar_checked(value)?;
        self.insert(pos, iter::once(value)).map(|_| ())
    }

    fn insert_default(&mut self, pos: usize, count: usize) -> Result<(), ColumnError> {
        if count == 0 {
            return Ok(());
        }
        let fill = Self::default_checked()?;
        self.insert(pos, iter::repeat_n(fill, count)).map(|_| ())
    }

    fn insert_from(
        &mut self,
        pos: usize,
        source: &dyn AnyColumn,
        row: usize,
    ) -> Result<(), ColumnError> {
        let value = Self::downcast_source(source)?.at(row)?.clone();
        self.insert(pos, iter::once(value)).map(|_| ())
    }

    fn insert_within(&mut self, pos: usize, source: Range<usize>) -> Result<(), ColumnError> {
        Series::insert_within(self, pos, source).map(|_| ())
    }

    fn extend_from(&mut self, source: &dyn AnyColumn) -> Result<(), ColumnError> {
        let source = Self::downcast_source(source)?;
        let end = self.len();
        self.insert(end, source.iter().cloned()).map(|_| ())
    }

    fn erase(&mut self, first: usize, last: usize) -> Result<usize, ColumnError> {
        Series::erase(self, first, last)
    }

    fn resize(&mut self, len: usize) -> Result<(), ColumnError> {
        Series::resize(self, len)
    }

    fn take(&self, rows: &[usize]) -> Result<Box<dyn AnyColumn>, ColumnError> {
        let values = rows
            .iter()
            .map(|&row| self.at(row).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Box::new(Series::from_vec(self.name.clone(), values)))
    }

    fn take_or_default(&self, rows: &[Option<usize>]) -> Result<Box<dyn AnyColumn>, ColumnError> {
        let fill = if rows.iter().any(Option::is_none) {
            Some(Self::default_checked()?)
        } else {
            None
        };
        let values = rows
            .iter()
            .map(|slot| match (slot, &fill) {
                (Some(row), _) => self.at(*row).cloned(),
                (None, Some(fill)) => Ok(fill.clone()),
                (None, None) => Err(ColumnError::TypeNotDefaultConstructible {
                    type_name: type_name::<T>(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Box::new(Series::from_vec(self.name.clone(), values)))
    }

    fn clone_box(&self) -> Box<dyn AnyColumn> {
        Box::new(self.clone())
    }

    fn shares_buffer_with(&self, other: &dyn AnyColumn) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|other| Series::shares_buffer_with(self, other))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Build a typed series from scalars, rejecting values `T` cannot hold.
pub fn series_from_scalars<T: Element>(
    name: impl Into<String>,
    values: &[Scalar],
) -> Result<Series<T>, ColumnError> {
    let values = values
        .iter()
        .map(Series::<T>::from_scalar_checked)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Series::from_vec(name, values))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InferredKind {
    Bool,
    Int64,
    Float64,
    Utf8,
}

fn infer_kind(values: &[Scalar]) -> Result<Option<InferredKind>, ColumnError> {
    let mut current = None;
    for value in values {
        let kind = match value {
            Scalar::Absent => continue,
            Scalar::Bool(_) => InferredKind::Bool,
            Scalar::Int64(_) => InferredKind::Int64,
            Scalar::Float64(_) => InferredKind::Float64,
            Scalar::Utf8(_) => InferredKind::Utf8,
        };
        current = Some(match (current, kind) {
            (None, kind) => kind,
            (Some(a), b) if a == b => a,
            (Some(InferredKind::Int64), InferredKind::Float64)
            | (Some(InferredKind::Float64), InferredKind::Int64) => InferredKind::Float64,
            (Some(a), _) => {
                return Err(ColumnError::TypeMismatch {
                    column: match a {
                        InferredKind::Bool => "bool",
                        InferredKind::Int64 => "int64",
                        InferredKind::Float64 => "float64",
                        InferredKind::Utf8 => "utf8",
                    },
                    found: value.dtype_name().to_owned(),
                });
            }
        });
    }
    Ok(current)
}

/// Build a column of the narrowest native type that holds `values`.
///
/// Integers mixed with floats widen to `f64`; any absent value makes the
/// column `Missing`-typed. An all-absent or empty input becomes an `f64`
/// column.
pub fn column_from_scalars(
    name: impl Into<String>,
    values: &[Scalar],
) -> Result<Box<dyn AnyColumn>, ColumnError> {
    let name = name.into();
    let any_absent = values.iter().any(Scalar::is_absent);
    let kind = infer_kind(values)?.unwrap_or(InferredKind::Float64);

    fn boxed<T: Element>(
        name: String,
        values: &[Scalar],
    ) -> Result<Box<dyn AnyColumn>, ColumnError> {
        Ok(Box::new(series_from_scalars::<T>(name, values)?))
    }

    match (kind, any_absent) {
        (InferredKind::Bool, false) => boxed::<bool>(name, values),
        (InferredKind::Bool, true) => boxed::<Missing<bool>>(name, values),
        (InferredKind::Int64, false) => boxed::<i64>(name, values),
        (InferredKind::Int64, true) => boxed::<Missing<i64>>(name, values),
        (InferredKind::Float64, false) => boxed::<f64>(name, values),
        (InferredKind::Float64, true) => boxed::<Missing<f64>>(name, values),
        (InferredKind::Utf8, false) => boxed::<String>(name, values),
        (InferredKind::Utf8, true) => boxed::<Missing<String>>(name, values),
    }
}
