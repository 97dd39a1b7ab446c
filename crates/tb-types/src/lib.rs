#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Not, Rem, Sub};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rendered form of an absent value.
pub const ABSENT_LITERAL: &str = "NA";

/// Rendered form of an element type that has no scalar projection.
pub const OPAQUE_LITERAL: &str = "<?>";

/// Type-erased cell value used wherever the element type of a column is not
/// known statically: expression evaluation, group keys, rendering and
/// row-level frame edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Absent,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl Scalar {
    #[must_use]
    pub fn dtype_name(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Bool(_) => "bool",
            Self::Int64(_) => "int64",
            Self::Float64(_) => "float64",
            Self::Utf8(_) => "utf8",
        }
    }

    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Filter truthiness: `true`, non-zero numbers and non-empty strings.
    /// Absent and NaN are never truthy.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Absent => false,
            Self::Bool(v) => *v,
            Self::Int64(v) => *v != 0,
            Self::Float64(v) => *v != 0.0 && !v.is_nan(),
            Self::Utf8(v) => !v.is_empty(),
        }
    }

    pub fn to_f64(&self) -> Result<f64, TypeError> {
        match self {
            Self::Int64(v) => Ok(*v as f64),
            Self::Float64(v) => Ok(*v),
            other => Err(TypeError::NonNumeric {
                dtype: other.dtype_name(),
            }),
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Self::Absent => 0,
            Self::Bool(_) => 1,
            Self::Int64(_) | Self::Float64(_) => 2,
            Self::Utf8(_) => 3,
        }
    }

    /// Total order used for sorting and min/max folds. Absent sorts before
    /// every present value; values of unrelated kinds order by kind.
    #[must_use]
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int64(a), Self::Int64(b)) => a.cmp(b),
            (Self::Int64(a), Self::Float64(b)) => (*a as f64).total_cmp(b),
            (Self::Float64(a), Self::Int64(b)) => a.total_cmp(&(*b as f64)),
            (Self::Float64(a), Self::Float64(b)) => a.total_cmp(b),
            (Self::Utf8(a), Self::Utf8(b)) => a.cmp(b),
            (a, b) => a.kind_rank().cmp(&b.kind_rank()),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str(ABSENT_LITERAL),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => f.write_str(v),
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

/// Hashable projection of a [`Scalar`], used for group and join keys.
/// Floats hash by bit pattern with every NaN collapsed onto one key.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum ScalarKey {
    Absent,
    Bool(bool),
    Int64(i64),
    FloatBits(u64),
    Utf8(String),
}

impl From<&Scalar> for ScalarKey {
    fn from(value: &Scalar) -> Self {
        match value {
            Scalar::Absent => Self::Absent,
            Scalar::Bool(v) => Self::Bool(*v),
            Scalar::Int64(v) => Self::Int64(*v),
            Scalar::Float64(v) => Self::FloatBits(if v.is_nan() {
                f64::NAN.to_bits()
            } else if *v == 0.0 {
                0.0_f64.to_bits()
            } else {
                v.to_bits()
            }),
            Scalar::Utf8(v) => Self::Utf8(v.clone()),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("operator {op} is not defined for {left} and {right}")]
    IncompatibleOperands {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
    #[error("operator {op} is not defined for {operand}")]
    IncompatibleOperand {
        op: &'static str,
        operand: &'static str,
    },
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("value of dtype {dtype} is not numeric")]
    NonNumeric { dtype: &'static str },
}

// ── Operators ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Not,
}

impl UnaryOp {
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Neg => "-",
            Self::Not => "!",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::And => "&&",
            Self::Or => "||",
        }
    }

    #[must_use]
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Gt | Self::Ge | Self::Lt | Self::Le | Self::Eq | Self::Ne
        )
    }
}

pub fn apply_unary(op: UnaryOp, operand: &Scalar) -> Result<Scalar, TypeError> {
    match (op, operand) {
        (_, Scalar::Absent) => Ok(Scalar::Absent),
        (UnaryOp::Neg, Scalar::Int64(v)) => Ok(Scalar::Int64(v.wrapping_neg())),
        (UnaryOp::Neg, Scalar::Float64(v)) => Ok(Scalar::Float64(-v)),
        (UnaryOp::Not, Scalar::Bool(v)) => Ok(Scalar::Bool(!v)),
        (op, other) => Err(TypeError::IncompatibleOperand {
            op: op.symbol(),
            operand: other.dtype_name(),
        }),
    }
}

/// Apply a binary operator with missing-value lifting.
///
/// Arithmetic and boolean operators yield `Absent` when either side is
/// absent. Comparisons treat `Absent` as smaller than every present value
/// and equal only to itself, so they always produce a `Bool`.
pub fn apply_binary(op: BinaryOp, left: &Scalar, right: &Scalar) -> Result<Scalar, TypeError> {
    if op.is_comparison() {
        return compare(op, left, right).map(Scalar::Bool);
    }
    if left.is_absent() || right.is_absent() {
        return Ok(Scalar::Absent);
    }

    let incompatible = || TypeError::IncompatibleOperands {
        op: op.symbol(),
        left: left.dtype_name(),
        right: right.dtype_name(),
    };

    match op {
        BinaryOp::And | BinaryOp::Or => match (left, right) {
            (Scalar::Bool(a), Scalar::Bool(b)) => Ok(Scalar::Bool(if op == BinaryOp::And {
                *a && *b
            } else {
                *a || *b
            })),
            _ => Err(incompatible()),
        },
        _ => match (left, right) {
            (Scalar::Int64(a), Scalar::Int64(b)) => int_arithmetic(op, *a, *b).map(Scalar::Int64),
            (Scalar::Int64(_) | Scalar::Float64(_), Scalar::Int64(_) | Scalar::Float64(_)) => {
                let a = left.to_f64()?;
                let b = right.to_f64()?;
                Ok(Scalar::Float64(match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Rem => a % b,
                    _ => return Err(incompatible()),
                }))
            }
            (Scalar::Utf8(a), Scalar::Utf8(b)) if op == BinaryOp::Add => {
                Ok(Scalar::Utf8(format!("{a}{b}")))
            }
            _ => Err(incompatible()),
        },
    }
}

fn int_arithmetic(op: BinaryOp, a: i64, b: i64) -> Result<i64, TypeError> {
    match op {
        BinaryOp::Add => Ok(a.wrapping_add(b)),
        BinaryOp::Sub => Ok(a.wrapping_sub(b)),
        BinaryOp::Mul => Ok(a.wrapping_mul(b)),
        BinaryOp::Div if b == 0 => Err(TypeError::DivisionByZero),
        BinaryOp::Div => Ok(a.wrapping_div(b)),
        BinaryOp::Rem if b == 0 => Err(TypeError::DivisionByZero),
        BinaryOp::Rem => Ok(a.wrapping_rem(b)),
        other => Err(TypeError::IncompatibleOperands {
            op: other.symbol(),
            left: "int64",
            right: "int64",
        }),
    }
}

fn compare(op: BinaryOp, left: &Scalar, right: &Scalar) -> Result<bool, TypeError> {
    let ordering = match (left, right) {
        (Scalar::Absent, Scalar::Absent) => Some(Ordering::Equal),
        (Scalar::Absent, _) => Some(Ordering::Less),
        (_, Scalar::Absent) => Some(Ordering::Greater),
        (Scalar::Bool(a), Scalar::Bool(b)) => Some(a.cmp(b)),
        (Scalar::Int64(a), Scalar::Int64(b)) => Some(a.cmp(b)),
        (Scalar::Int64(_) | Scalar::Float64(_), Scalar::Int64(_) | Scalar::Float64(_)) => {
            left.to_f64()?.partial_cmp(&right.to_f64()?)
        }
        (Scalar::Utf8(a), Scalar::Utf8(b)) => Some(a.cmp(b)),
        _ => {
            return Err(TypeError::IncompatibleOperands {
                op: op.symbol(),
                left: left.dtype_name(),
                right: right.dtype_name(),
            });
        }
    };

    // Unordered (NaN) operands compare unequal to everything.
    Ok(match op {
        BinaryOp::Gt => ordering == Some(Ordering::Greater),
        BinaryOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        BinaryOp::Lt => ordering == Some(Ordering::Less),
        BinaryOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        BinaryOp::Eq => ordering == Some(Ordering::Equal),
        BinaryOp::Ne => ordering != Some(Ordering::Equal),
        _ => false,
    })
}

// ── Missing<T> ─────────────────────────────────────────────────────────

/// A value that may be absent.
///
/// `Absent` is declared first so the derived ordering places it before every
/// present value, and derived equality makes `Absent == Absent`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Missing<T> {
    #[default]
    Absent,
    Present(T),
}

impl<T> Missing<T> {
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    #[must_use]
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    pub fn present(self) -> Option<T> {
        match self {
            Self::Present(v) => Some(v),
            Self::Absent => None,
        }
    }

    pub fn as_ref(&self) -> Missing<&T> {
        match self {
            Self::Present(v) => Missing::Present(v),
            Self::Absent => Missing::Absent,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Missing<U> {
        match self {
            Self::Present(v) => Missing::Present(f(v)),
            Self::Absent => Missing::Absent,
        }
    }

    pub fn unwrap_or(self, fallback: T) -> T {
        match self {
            Self::Present(v) => v,
            Self::Absent => fallback,
        }
    }
}

impl Missing<bool> {
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::Present(a), Self::Present(b)) => Self::Present(a && b),
            _ => Self::Absent,
        }
    }

    #[must_use]
    pub fn or(self, other: Self) -> Self {
        match (self, other) {
            (Self::Present(a), Self::Present(b)) => Self::Present(a || b),
            _ => Self::Absent,
        }
    }
}

impl<T> From<Option<T>> for Missing<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Absent, Self::Present)
    }
}

impl<T> From<Missing<T>> for Option<T> {
    fn from(value: Missing<T>) -> Self {
        value.present()
    }
}

macro_rules! lift_binary_op {
    ($trait:ident, $method:ident) => {
        impl<T: $trait<Output = T>> $trait for Missing<T> {
            type Output = Missing<T>;

            fn $method(self, rhs: Self) -> Self::Output {
                match (self, rhs) {
                    (Missing::Present(a), Missing::Present(b)) => Missing::Present(a.$method(b)),
                    _ => Missing::Absent,
                }
            }
        }
    };
}

lift_binary_op!(Add, add);
lift_binary_op!(Sub, sub);
lift_binary_op!(Mul, mul);
lift_binary_op!(Div, div);
lift_binary_op!(Rem, rem);

impl<T: Neg<Output = T>> Neg for Missing<T> {
    type Output = Missing<T>;

    fn neg(self) -> Self::Output {
        self.map(|v| -v)
    }
}

impl<T: Not<Output = T>> Not for Missing<T> {
    type Output = Missing<T>;

    fn not(self) -> Self::Output {
        self.map(|v| !v)
    }
}

// ── Element ────────────────────────────────────────────────────────────

/// Contract every column element type satisfies.
///
/// Types without a natural default keep the provided `default_value`,
/// which makes grow-resizes and missing-value demotion fail at runtime
/// instead of fabricating values. Types without a scalar projection keep
/// `to_scalar`/`from_scalar`; such columns can be stored, copied and joined
/// but not used as keys or in expressions.
pub trait Element: Clone + fmt::Debug + Send + Sync + 'static {
    const ALLOWS_MISSING: bool = false;

    fn default_value() -> Option<Self> {
        None
    }

    fn to_scalar(&self) -> Option<Scalar> {
        None
    }

    fn from_scalar(_value: &Scalar) -> Option<Self> {
        None
    }

    fn render(&self) -> String {
        self.to_scalar()
            .map_or_else(|| OPAQUE_LITERAL.to_owned(), |scalar| scalar.to_string())
    }
}

macro_rules! int_element {
    ($($ty:ty),*) => {
        $(
            impl Element for $ty {
                fn default_value() -> Option<Self> {
                    Some(0)
                }

                fn to_scalar(&self) -> Option<Scalar> {
                    Some(Scalar::Int64(i64::from(*self)))
                }

                fn from_scalar(value: &Scalar) -> Option<Self> {
                    match value {
                        Scalar::Int64(v) => <$ty>::try_from(*v).ok(),
                        _ => None,
                    }
                }
            }
        )*
    };
}

int_element!(i8, i16, i32, i64, u8, u16, u32);

impl Element for f64 {
    fn default_value() -> Option<Self> {
        Some(0.0)
    }

    fn to_scalar(&self) -> Option<Scalar> {
        Some(Scalar::Float64(*self))
    }

    fn from_scalar(value: &Scalar) -> Option<Self> {
        match value {
            Scalar::Float64(v) => Some(*v),
            Scalar::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl Element for f32 {
    fn default_value() -> Option<Self> {
        Some(0.0)
    }

    fn to_scalar(&self) -> Option<Scalar> {
        Some(Scalar::Float64(f64::from(*self)))
    }

    fn from_scalar(value: &Scalar) -> Option<Self> {
        match value {
            Scalar::Float64(v) => Some(*v as f32),
            Scalar::Int64(v) => Some(*v as f32),
            _ => None,
        }
    }
}

impl Element for bool {
    fn default_value() -> Option<Self> {
        Some(false)
    }

    fn to_scalar(&self) -> Option<Scalar> {
        Some(Scalar::Bool(*self))
    }

    fn from_scalar(value: &Scalar) -> Option<Self> {
        match value {
            Scalar::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl Element for String {
    fn default_value() -> Option<Self> {
        Some(String::new())
    }

    fn to_scalar(&self) -> Option<Scalar> {
        Some(Scalar::Utf8(self.clone()))
    }

    fn from_scalar(value: &Scalar) -> Option<Self> {
        match value {
            Scalar::Utf8(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl<T: Element> Element for Missing<T> {
    const ALLOWS_MISSING: bool = true;

    fn default_value() -> Option<Self> {
        Some(Self::Absent)
    }

    fn to_scalar(&self) -> Option<Scalar> {
        match self {
            Self::Absent => Some(Scalar::Absent),
            Self::Present(v) => v.to_scalar(),
        }
    }

    fn from_scalar(value: &Scalar) -> Option<Self> {
        match value {
            Scalar::Absent => Some(Self::Absent),
            other => T::from_scalar(other).map(Self::Present),
        }
    }

    fn render(&self) -> String {
        match self {
            Self::Absent => ABSENT_LITERAL.to_owned(),
            Self::Present(v) => v.render(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ABSENT_LITERAL, BinaryOp, Element, Missing, OPAQUE_LITERAL, Scalar, ScalarKey, TypeError,
        UnaryOp, apply_binary, apply_unary,
    };

    #[derive(Debug, Clone)]
    struct Opaque;

    impl Element for Opaque {}

    #[test]
    fn absent_sorts_before_every_present_value() {
        assert!(Missing::Absent < Missing::Present(i64::MIN));
        assert!(Missing::Absent < Missing::Present(f64::NEG_INFINITY));
        assert_eq!(Missing::<i32>::Absent, Missing::Absent);
        assert_ne!(Missing::Absent, Missing::Present(0));
    }

    #[test]
    fn lifted_arithmetic_propagates_absent() {
        let a = Missing::Present(6);
        let b = Missing::<i32>::Absent;
        assert_eq!(a + b, Missing::Absent);
        assert_eq!(b * a, Missing::Absent);
        assert_eq!(a - Missing::Present(2), Missing::Present(4));
        assert_eq!(a % Missing::Present(4), Missing::Present(2));
        assert_eq!(-b, Missing::Absent);
        assert_eq!(!Missing::Present(true), Missing::Present(false));
        assert_eq!(Missing::Present(true).and(Missing::Absent), Missing::Absent);
        assert_eq!(
            Missing::Present(false).or(Missing::Present(true)),
            Missing::Present(true)
        );
    }

    #[test]
    fn scalar_arithmetic_promotes_and_propagates() {
        let out = apply_binary(BinaryOp::Add, &Scalar::Int64(2), &Scalar::Float64(0.5))
            .expect("mixed add");
        assert_eq!(out, Scalar::Float64(2.5));

        let out = apply_binary(BinaryOp::Mul, &Scalar::Absent, &Scalar::Int64(3)).expect("mul");
        assert_eq!(out, Scalar::Absent);

        let out = apply_binary(BinaryOp::Add, &Scalar::from("ab"), &Scalar::from("cd"))
            .expect("concat");
        assert_eq!(out, Scalar::from("abcd"));
    }

    #[test]
    fn scalar_comparison_orders_absent_first() {
        let absent = Scalar::Absent;
        let present = Scalar::Int64(-5);
        for (left, right, op, expected) in [
            (&absent, &present, BinaryOp::Lt, true),
            (&present, &absent, BinaryOp::Gt, true),
            (&absent, &present, BinaryOp::Eq, false),
            (&absent, &absent, BinaryOp::Eq, true),
            (&absent, &absent, BinaryOp::Le, true),
            (&present, &absent, BinaryOp::Ne, true),
        ] {
            let out = apply_binary(op, left, right).expect("comparison");
            assert_eq!(out, Scalar::Bool(expected), "{left:?} {op:?} {right:?}");
        }
    }

    #[test]
    fn nan_compares_unequal() {
        let nan = Scalar::Float64(f64::NAN);
        let out = apply_binary(BinaryOp::Eq, &nan, &nan).expect("eq");
        assert_eq!(out, Scalar::Bool(false));
        let out = apply_binary(BinaryOp::Ne, &nan, &Scalar::Int64(1)).expect("ne");
        assert_eq!(out, Scalar::Bool(true));
    }

    #[test]
    fn incompatible_operands_are_rejected() {
        let err = apply_binary(BinaryOp::Sub, &Scalar::from("a"), &Scalar::Int64(1))
            .expect_err("must fail");
        assert_eq!(
            err.to_string(),
            "operator - is not defined for utf8 and int64"
        );

        let err = apply_binary(BinaryOp::Div, &Scalar::Int64(1), &Scalar::Int64(0))
            .expect_err("division by zero");
        assert_eq!(err, TypeError::DivisionByZero);

        let err = apply_unary(UnaryOp::Not, &Scalar::Int64(1)).expect_err("not on int");
        assert!(matches!(err, TypeError::IncompatibleOperand { .. }));
    }

    #[test]
    fn unary_ops_lift_absent() {
        assert_eq!(
            apply_unary(UnaryOp::Neg, &Scalar::Absent).expect("neg"),
            Scalar::Absent
        );
        assert_eq!(
            apply_unary(UnaryOp::Neg, &Scalar::Float64(1.5)).expect("neg"),
            Scalar::Float64(-1.5)
        );
    }

    #[test]
    fn truthiness() {
        assert!(Scalar::Bool(true).is_truthy());
        assert!(Scalar::Int64(-1).is_truthy());
        assert!(!Scalar::Int64(0).is_truthy());
        assert!(!Scalar::Float64(f64::NAN).is_truthy());
        assert!(!Scalar::Absent.is_truthy());
    }

    #[test]
    fn element_projection_round_trips_through_scalar() {
        assert_eq!(7_u8.to_scalar(), Some(Scalar::Int64(7)));
        assert_eq!(u8::from_scalar(&Scalar::Int64(300)), None);
        assert_eq!(f64::from_scalar(&Scalar::Int64(3)), Some(3.0));
        assert_eq!(
            Missing::<i32>::from_scalar(&Scalar::Absent),
            Some(Missing::Absent)
        );
        assert_eq!(
            Missing::<String>::from_scalar(&Scalar::from("x")),
            Some(Missing::Present("x".to_owned()))
        );
        assert_eq!(Opaque::default_value().map(|_| ()), None);
    }

    #[test]
    fn render_hook_defaults() {
        assert_eq!(true.render(), "true");
        assert_eq!(42_i8.render(), "42");
        assert_eq!(Missing::<f64>::Absent.render(), ABSENT_LITERAL);
        assert_eq!(Missing::Present(1.5_f64).render(), "1.5");
        assert_eq!(Opaque.render(), OPAQUE_LITERAL);
    }

    #[test]
    fn float_keys_collapse_nan_and_signed_zero() {
        assert_eq!(
            ScalarKey::from(&Scalar::Float64(f64::NAN)),
            ScalarKey::from(&Scalar::Float64(-f64::NAN))
        );
        assert_eq!(
            ScalarKey::from(&Scalar::Float64(0.0)),
            ScalarKey::from(&Scalar::Float64(-0.0))
        );
    }

    #[test]
    fn scalar_serde_round_trip() {
        let values = vec![Scalar::Absent, Scalar::Int64(3), Scalar::from("k")];
        let json = serde_json::to_string(&values).expect("serialize");
        let back: Vec<Scalar> = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(values, back);
        let missing: Missing<i32> = serde_json::from_str("\"absent\"").expect("absent");
        assert_eq!(missing, Missing::Absent);
    }
}
