#![forbid(unsafe_code)]

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Not, Rem, Sub};
use std::sync::Arc;

use tb_columnar::{AnyColumn, ColumnError, column_from_scalars, series_from_scalars};
use tb_frame::{Frame, FrameError};
use tb_types::{BinaryOp, Element, Scalar, TypeError, UnaryOp, apply_binary, apply_unary};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExprError {
    #[error("row window begin={begin} current={current} end={end} is malformed")]
    InvalidWindow {
        begin: usize,
        current: usize,
        end: usize,
    },
    #[error("function {name} failed: {message}")]
    Function { name: String, message: String },
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Caller-supplied function applied to evaluated arguments.
pub type UserFn = Arc<dyn Fn(&[Scalar]) -> Result<Scalar, ExprError> + Send + Sync>;

/// Immutable expression tree. Evaluation reads the frame and never mutates it.
#[derive(Clone)]
pub enum Expr {
    Constant(Scalar),
    /// Column `index` read at `current + offset`.
    Column {
        index: usize,
        offset: isize,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Func {
        name: String,
        func: UserFn,
        args: Vec<Expr>,
    },
    RowNumber,
    FrameLength,
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            Self::Column { index, offset } => f
                .debug_struct("Column")
                .field("index", index)
                .field("offset", offset)
                .finish(),
            Self::Unary { op, expr } => f
                .debug_struct("Unary")
                .field("op", op)
                .field("expr", expr)
                .finish(),
            Self::Binary { op, left, right } => f
                .debug_struct("Binary")
                .field("op", op)
                .field("left", left)
                .field("right", right)
                .finish(),
            Self::Func { name, args, .. } => f
                .debug_struct("Func")
                .field("name", name)
                .field("args", args)
                .finish_non_exhaustive(),
            Self::RowNumber => f.write_str("RowNumber"),
            Self::FrameLength => f.write_str("FrameLength"),
        }
    }
}

/// `(begin, current, end)` with `begin <= current < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowWindow {
    begin: usize,
    current: usize,
    end: usize,
}

impl RowWindow {
    pub fn new(begin: usize, current: usize, end: usize) -> Result<Self, ExprError> {
        if begin > current || current >= end {
            return Err(ExprError::InvalidWindow {
                begin,
                current,
                end,
            });
        }
        Ok(Self {
            begin,
            current,
            end,
        })
    }

    #[must_use]
    pub fn begin(&self) -> usize {
        self.begin
    }

    #[must_use]
    pub fn current(&self) -> usize {
        self.current
    }

    #[must_use]
    pub fn end(&self) -> usize {
        self.end
    }

    fn contains_offset(&self, offset: isize) -> Option<usize> {
        let target = self.current.checked_add_signed(offset)?;
        (self.begin..self.end).contains(&target).then_some(target)
    }
}

fn count_scalar(n: usize) -> Scalar {
    Scalar::Int64(i64::try_from(n).unwrap_or(i64::MAX))
}

/// Value a column yields when an offset reference falls outside the window.
fn boundary_value(column: &dyn AnyColumn) -> Scalar {
    if column.allows_missing() {
        return Scalar::Absent;
    }
    column.default_scalar().unwrap_or(Scalar::Absent)
}

pub fn evaluate(expr: &Expr, frame: &Frame, window: RowWindow) -> Result<Scalar, ExprError> {
    match expr {
        Expr::Constant(value) => Ok(value.clone()),
        Expr::Column { index, offset } => {
            let column = frame.column(*index)?;
            match window.contains_offset(*offset) {
                Some(row) => Ok(column.scalar_at(row)?),
                None => Ok(boundary_value(column)),
            }
        }
        Expr::Unary { op, expr } => {
            let operand = evaluate(expr, frame, window)?;
            Ok(apply_unary(*op, &operand)?)
        }
        Expr::Binary { op, left, right } => {
            let lhs = evaluate(left, frame, window)?;
            let rhs = evaluate(right, frame, window)?;
            Ok(apply_binary(*op, &lhs, &rhs)?)
        }
        Expr::Func { func, args, .. } => {
            let values = args
                .iter()
                .map(|arg| evaluate(arg, frame, window))
                .collect::<Result<Vec<_>, _>>()?;
            func(&values)
        }
        Expr::RowNumber => Ok(count_scalar(window.current - window.begin)),
        Expr::FrameLength => Ok(count_scalar(window.end - window.begin)),
    }
}

// ── Builders ───────────────────────────────────────────────────────────

#[must_use]
pub fn col(index: usize) -> Expr {
    Expr::Column { index, offset: 0 }
}

/// Column `index`, `n` rows back.
#[must_use]
pub fn lag(index: usize, n: usize) -> Expr {
    Expr::Column {
        index,
        offset: isize::try_from(n).map_or(isize::MIN, |n| -n),
    }
}

/// Column `index`, `n` rows ahead.
#[must_use]
pub fn lead(index: usize, n: usize) -> Expr {
    Expr::Column {
        index,
        offset: isize::try_from(n).unwrap_or(isize::MAX),
    }
}

pub fn lit(value: impl Into<Scalar>) -> Expr {
    Expr::Constant(value.into())
}

pub fn func<F>(name: impl Into<String>, f: F, args: Vec<Expr>) -> Expr
where
    F: Fn(&[Scalar]) -> Result<Scalar, ExprError> + Send + Sync + 'static,
{
    Expr::Func {
        name: name.into(),
        func: Arc::new(f),
        args,
    }
}

#[must_use]
pub fn row_number() -> Expr {
    Expr::RowNumber
}

#[must_use]
pub fn frame_length() -> Expr {
    Expr::FrameLength
}

impl Expr {
    fn binary(op: BinaryOp, left: Self, right: impl Into<Self>) -> Self {
        Self::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right.into()),
        }
    }

    pub fn gt(self, rhs: impl Into<Self>) -> Self {
        Self::binary(BinaryOp::Gt, self, rhs)
    }

    pub fn ge(self, rhs: impl Into<Self>) -> Self {
        Self::binary(BinaryOp::Ge, self, rhs)
    }

    pub fn lt(self, rhs: impl Into<Self>) -> Self {
        Self::binary(BinaryOp::Lt, self, rhs)
    }

    pub fn le(self, rhs: impl Into<Self>) -> Self {
        Self::binary(BinaryOp::Le, self, rhs)
    }

    pub fn equals(self, rhs: impl Into<Self>) -> Self {
        Self::binary(BinaryOp::Eq, self, rhs)
    }

    pub fn not_equals(self, rhs: impl Into<Self>) -> Self {
        Self::binary(BinaryOp::Ne, self, rhs)
    }

    pub fn and(self, rhs: impl Into<Self>) -> Self {
        Self::binary(BinaryOp::And, self, rhs)
    }

    pub fn or(self, rhs: impl Into<Self>) -> Self {
        Self::binary(BinaryOp::Or, self, rhs)
    }
}

impl From<Scalar> for Expr {
    fn from(value: Scalar) -> Self {
        Self::Constant(value)
    }
}

macro_rules! literal_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Expr {
                fn from(value: $ty) -> Self {
                    Self::Constant(Scalar::from(value))
                }
            }
        )*
    };
}

literal_from!(bool, i64, f64, &str, String);

macro_rules! binary_sugar {
    ($($trait:ident :: $method:ident => $op:ident),* $(,)?) => {
        $(
            impl<R: Into<Expr>> $trait<R> for Expr {
                type Output = Expr;

                fn $method(self, rhs: R) -> Expr {
                    Expr::binary(BinaryOp::$op, self, rhs)
                }
            }
        )*
    };
}

binary_sugar!(
    Add::add => Add,
    Sub::sub => Sub,
    Mul::mul => Mul,
    Div::div => Div,
    Rem::rem => Rem,
);

impl Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Neg,
            expr: Box::new(self),
        }
    }
}

impl Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(self),
        }
    }
}

// ── Consumers ──────────────────────────────────────────────────────────

/// Where [`derive`] places the new column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    #[default]
    Append,
    Prepend,
}

/// Evaluate `expr` once per row, each row seeing the whole frame as its window.
pub fn apply(frame: &Frame, expr: &Expr) -> Result<Vec<Scalar>, ExprError> {
    let rows = frame.size()?;
    evaluate_range(frame, expr, 0, rows)
}

/// Evaluate `expr` for rows `[begin, end)` with the window narrowed to that
/// range, so offsets that leave it hit the boundary rule.
pub fn evaluate_range(
    frame: &Frame,
    expr: &Expr,
    begin: usize,
    end: usize,
) -> Result<Vec<Scalar>, ExprError> {
    let rows = frame.size()?;
    if begin > end || end > rows {
        return Err(ExprError::InvalidWindow {
            begin,
            current: begin,
            end,
        });
    }
    (begin..end)
        .map(|current| evaluate(expr, frame, RowWindow::new(begin, current, end)?))
        .collect()
}

fn truthy_rows(frame: &Frame, predicate: &Expr) -> Result<Vec<bool>, ExprError> {
    Ok(apply(frame, predicate)?
        .iter()
        .map(Scalar::is_truthy)
        .collect())
}

/// New frame holding the rows where `predicate` is truthy.
pub fn filter(frame: &Frame, predicate: &Expr) -> Result<Frame, ExprError> {
    let keep = truthy_rows(frame, predicate)?;
    let positions: Vec<usize> = keep
        .iter()
        .enumerate()
        .filter_map(|(row, keep)| keep.then_some(row))
        .collect();
    debug!(rows = keep.len(), kept = positions.len(), "filter evaluated");
    Ok(frame.take_rows(&positions)?)
}

/// Drop, in place, the rows where `predicate` is not truthy. Returns the
/// number of rows removed.
pub fn retain(frame: &mut Frame, predicate: &Expr) -> Result<usize, ExprError> {
    let keep = truthy_rows(frame, predicate)?;
    let mut removed = 0;
    let mut end = keep.len();
    while end > 0 {
        if keep[end - 1] {
            end -= 1;
            continue;
        }
        let mut start = end - 1;
        while start > 0 && !keep[start - 1] {
            start -= 1;
        }
        removed += frame.erase_rows(start, end)?;
        end = start;
    }
    debug!(rows = keep.len(), removed, "retain evaluated");
    Ok(removed)
}

/// Evaluate `expr` per row and add the results as column `name`, typed by
/// what the values hold.
pub fn derive(
    frame: &mut Frame,
    name: impl Into<String>,
    expr: &Expr,
    placement: Placement,
) -> Result<(), ExprError> {
    let values = apply(frame, expr)?;
    let column = column_from_scalars(name, &values)?;
    place(frame, column, placement)
}

/// Like [`derive`], into a column of element type `T`.
pub fn derive_as<T: Element>(
    frame: &mut Frame,
    name: impl Into<String>,
    expr: &Expr,
    placement: Placement,
) -> Result<(), ExprError> {
    let values = apply(frame, expr)?;
    let column = series_from_scalars::<T>(name, &values)?;
    place(frame, Box::new(column), placement)
}

fn place(
    frame: &mut Frame,
    column: Box<dyn AnyColumn>,
    placement: Placement,
) -> Result<(), ExprError> {
    debug!(column = column.name(), rows = column.len(), ?placement, "derived column");
    match placement {
        Placement::Append => frame.add_column(column)?,
        Placement::Prepend => frame.prepend_column(column)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tb_columnar::Series;
    use tb_frame::{Frame, FrameError};
    use tb_types::{Element, Missing, Scalar, TypeError};

    use super::{
        ExprError, Placement, RowWindow, apply, col, derive, derive_as, evaluate, evaluate_range,
        filter, frame_length, func, lag, lead, lit, retain, row_number,
    };

    #[derive(Debug, Clone)]
    struct Tag;

    impl Element for Tag {}

    fn ticks() -> Frame {
        Frame::new()
            .with_series(Series::from_vec("px", vec![10_i64, 12, 11, 15]))
            .expect("px")
            .with_series(Series::from_vec(
                "vol",
                vec![
                    Missing::Present(1.0_f64),
                    Missing::Absent,
                    Missing::Present(3.0),
                    Missing::Present(4.0),
                ],
            ))
            .expect("vol")
            .with_series(Series::from_vec("tag", vec![Tag, Tag, Tag, Tag]))
            .expect("tag")
    }

    fn ints(values: &[i64]) -> Vec<Scalar> {
        values.iter().copied().map(Scalar::Int64).collect()
    }

    #[test]
    fn lag_and_lead_degrade_at_boundaries() {
        let frame = ticks();
        assert_eq!(
            apply(&frame, &lag(0, 1)).expect("lag"),
            ints(&[0, 10, 12, 11]),
            "non-missing column yields its default"
        );
        assert_eq!(
            apply(&frame, &lead(0, 1)).expect("lead"),
            ints(&[12, 11, 15, 0]),
            "past the last row too"
        );
        assert_eq!(
            apply(&frame, &lead(1, 1)).expect("lead"),
            vec![
                Scalar::Absent,
                Scalar::Float64(3.0),
                Scalar::Float64(4.0),
                Scalar::Absent
            ]
        );
    }

    #[test]
    fn boundary_of_column_without_default_is_absent() {
        let frame = ticks();
        let window = RowWindow::new(0, 0, 4).expect("window");
        assert_eq!(
            evaluate(&lag(2, 1), &frame, window).expect("boundary"),
            Scalar::Absent
        );
        assert!(matches!(
            evaluate(&col(2), &frame, window),
            Err(ExprError::Column(_))
        ));
    }

    #[test]
    fn operators_build_and_evaluate() {
        let frame = ticks();
        let change = col(0) - lag(0, 1);
        let values = evaluate_range(&frame, &change, 1, 4).expect("range");
        assert_eq!(
            values,
            ints(&[12, -1, 4]),
            "row 1 lags out of the narrowed window onto the default"
        );

        let scaled = -(col(0) * 2_i64) + 1_i64;
        assert_eq!(apply(&frame, &scaled).expect("scaled")[0], Scalar::Int64(-19));

        let mixed = col(0) / 4.0_f64;
        assert_eq!(apply(&frame, &mixed).expect("mixed")[0], Scalar::Float64(2.5));

        let gappy = col(1) + col(0);
        assert_eq!(apply(&frame, &gappy).expect("gappy")[1], Scalar::Absent);
    }

    #[test]
    fn row_number_and_frame_length_follow_the_window() {
        let frame = ticks();
        let values = evaluate_range(&frame, &(row_number() * 10_i64 + frame_length()), 1, 3)
            .expect("narrowed");
        assert_eq!(values, ints(&[2, 12]));
        assert!(matches!(
            RowWindow::new(2, 1, 3),
            Err(ExprError::InvalidWindow { .. })
        ));
        assert!(evaluate_range(&frame, &row_number(), 0, 9).is_err());
    }

    #[test]
    fn user_functions_receive_evaluated_arguments() {
        let frame = ticks();
        let clamp = func(
            "clamp",
            |args: &[Scalar]| {
                let value = args[0].to_f64()?;
                let ceiling = args[1].to_f64()?;
                Ok(Scalar::Float64(value.min(ceiling)))
            },
            vec![col(0), lit(11.5)],
        );
        assert_eq!(
            apply(&frame, &clamp).expect("clamp"),
            vec![
                Scalar::Float64(10.0),
                Scalar::Float64(11.5),
                Scalar::Float64(11.0),
                Scalar::Float64(11.5)
            ]
        );
        assert!(format!("{clamp:?}").contains("clamp"));
    }

    #[test]
    fn type_errors_surface_from_evaluation() {
        let frame = ticks();
        let bad = col(0) - "x";
        assert!(matches!(
            apply(&frame, &bad),
            Err(ExprError::Type(TypeError::IncompatibleOperands { .. }))
        ));
        assert!(matches!(
            apply(&frame, &col(7)),
            Err(ExprError::Frame(FrameError::ColumnOutOfRange { index: 7, .. }))
        ));
    }

    #[test]
    fn filter_keeps_truthy_rows() {
        let frame = ticks();
        let rising = col(0).gt(lag(0, 1)).and(col(1).ge(2.0));
        let kept = filter(&frame, &rising).expect("filter");
        assert_eq!(
            kept.series::<i64>(0).expect("px").as_slice(),
            &[15],
            "row 1 rises but its vol is absent"
        );
        assert_eq!(frame.size().expect("untouched"), 4);
    }

    #[test]
    fn retain_erases_runs_in_place() {
        let mut frame = ticks();
        let removed = retain(&mut frame, &col(0).not_equals(12_i64).and(col(0).lt(15_i64)))
            .expect("retain");
        assert_eq!(removed, 2);
        assert_eq!(frame.series::<i64>(0).expect("px").as_slice(), &[10, 11]);
        assert_eq!(frame.size().expect("consistent"), 2);
    }

    #[test]
    fn derive_appends_or_prepends() {
        let mut frame = ticks();
        derive(&mut frame, "delta", &(col(0) - lag(0, 1)), Placement::Append).expect("append");
        assert_eq!(frame.column_names(), vec!["px", "vol", "tag", "delta"]);
        assert_eq!(
            frame.series::<i64>(3).expect("delta").as_slice(),
            &[10, 2, -1, 4]
        );

        derive(&mut frame, "vol2", &(col(1) * 2.0), Placement::Prepend).expect("prepend");
        assert_eq!(frame.column_names()[0], "vol2");
        assert!(frame.column(0).expect("vol2").allows_missing());

        derive_as::<f32>(&mut frame, "ratio", &(col(0) / 2_i64), Placement::Append)
            .expect_err("absent cannot become f32");
        derive_as::<Missing<f32>>(&mut frame, "ratio", &(col(0) / 2_i64), Placement::Append)
            .expect("missing-aware target");
        assert_eq!(frame.width(), 6);
    }

    #[test]
    fn boolean_negation_and_truthiness() {
        let frame = ticks();
        let values = apply(&frame, &!col(0).gt(11_i64)).expect("not");
        assert_eq!(
            values,
            vec![
                Scalar::Bool(true),
                Scalar::Bool(false),
                Scalar::Bool(true),
                Scalar::Bool(false)
            ]
        );
    }
}
