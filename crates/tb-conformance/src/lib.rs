#![forbid(unsafe_code)]

//! Fixture-driven conformance cases for the table engine.
//!
//! A case names an input frame, one operation and either the expected output
//! frame or a fragment of the expected error message. Cases are plain JSON so
//! new ones can be added without touching Rust code.

use serde::{Deserialize, Serialize};
use tb_columnar::{ColumnError, Series, column_from_scalars};
use tb_expr::{Expr, ExprError, Placement, col, derive, filter};
use tb_frame::{Frame, FrameError};
use tb_groupby::{Aggregation, GroupByError, group_by};
use tb_join::{JoinError, JoinType, join};
use tb_types::{BinaryOp, Missing, Scalar};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("case {case_id} needs a right-hand frame")]
    MissingRightFrame { case_id: String },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Expr(#[from] ExprError),
    #[error(transparent)]
    GroupBy(#[from] GroupByError),
    #[error(transparent)]
    Join(#[from] JoinError),
}

// ── Fixture model ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureColumn {
    pub name: String,
    pub values: Vec<Scalar>,
}

/// Frame described column by column; element types are inferred from the
/// scalars.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FixtureFrame {
    pub columns: Vec<FixtureColumn>,
}

impl FixtureFrame {
    pub fn to_frame(&self) -> Result<Frame, HarnessError> {
        let columns = self
            .columns
            .iter()
            .map(|column| column_from_scalars(column.name.clone(), &column.values))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Frame::from_columns(columns)?)
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, HarnessError> {
        let rows = frame.size()?;
        let columns = (0..frame.width())
            .map(|index| {
                let column = frame.column(index)?;
                let values = (0..rows)
                    .map(|row| column.scalar_at(row))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(FixtureColumn {
                    name: column.name().to_owned(),
                    values,
                })
            })
            .collect::<Result<Vec<_>, HarnessError>>()?;
        Ok(Self { columns })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "column", rename_all = "snake_case")]
pub enum FixtureAggregation {
    Sum(usize),
    Min(usize),
    Max(usize),
    Mean(usize),
    #[serde(rename = "stddev", alias = "std_dev")]
    StdDev(usize),
    Count,
}

impl From<FixtureAggregation> for Aggregation {
    fn from(value: FixtureAggregation) -> Self {
        match value {
            FixtureAggregation::Sum(c) => Self::Sum(c),
            FixtureAggregation::Min(c) => Self::Min(c),
            FixtureAggregation::Max(c) => Self::Max(c),
            FixtureAggregation::Mean(c) => Self::Mean(c),
            FixtureAggregation::StdDev(c) => Self::StdDev(c),
            FixtureAggregation::Count => Self::Count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureJoinType {
    Inner,
    Left,
}

impl From<FixtureJoinType> for JoinType {
    fn from(value: FixtureJoinType) -> Self {
        match value {
            FixtureJoinType::Inner => Self::Inner,
            FixtureJoinType::Left => Self::Left,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum FixtureOperation {
    /// Keep rows where `column <op> value` is truthy.
    Filter {
        column: usize,
        op: BinaryOp,
        value: Scalar,
    },
    /// Append column `name` holding `column` read at `offset` rows away.
    Shift {
        column: usize,
        offset: isize,
        name: String,
    },
    Sort {
        by: Vec<usize>,
        #[serde(default)]
        descending: bool,
    },
    GroupBy {
        keys: Vec<usize>,
        aggregations: Vec<FixtureAggregation>,
    },
    Join {
        left_key: usize,
        right_key: usize,
        join_type: FixtureJoinType,
    },
    Hcat,
    Vcat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConformanceCase {
    pub case_id: String,
    #[serde(flatten)]
    pub operation: FixtureOperation,
    pub frame: FixtureFrame,
    #[serde(default)]
    pub right: Option<FixtureFrame>,
    #[serde(default)]
    pub expected: Option<FixtureFrame>,
    #[serde(default)]
    pub expected_error_contains: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub status: CaseStatus,
    pub mismatch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<CaseResult>,
}

impl SuiteReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.failed == 0
    }
}

// ── Execution ──────────────────────────────────────────────────────────

pub fn load_cases(json: &str) -> Result<Vec<ConformanceCase>, HarnessError> {
    Ok(serde_json::from_str(json)?)
}

fn right_frame(case: &ConformanceCase) -> Result<Frame, HarnessError> {
    case.right
        .as_ref()
        .ok_or_else(|| HarnessError::MissingRightFrame {
            case_id: case.case_id.clone(),
        })?
        .to_frame()
}

/// Run the case's operation and return the produced frame.
pub fn execute_case(case: &ConformanceCase) -> Result<Frame, HarnessError> {
    let mut frame = case.frame.to_frame()?;
    match &case.operation {
        FixtureOperation::Filter { column, op, value } => {
            let predicate = Expr::Binary {
                op: *op,
                left: Box::new(col(*column)),
                right: Box::new(Expr::Constant(value.clone())),
            };
            Ok(filter(&frame, &predicate)?)
        }
        FixtureOperation::Shift {
            column,
            offset,
            name,
        } => {
            let shifted = Expr::Column {
                index: *column,
                offset: *offset,
            };
            derive(&mut frame, name.clone(), &shifted, Placement::Append)?;
            Ok(frame)
        }
        FixtureOperation::Sort { by, descending } => {
            if *descending {
                frame.reverse_sort(by)?;
            } else {
                frame.sort(by)?;
            }
            Ok(frame)
        }
        FixtureOperation::GroupBy { keys, aggregations } => {
            let aggregations: Vec<Aggregation> =
                aggregations.iter().copied().map(Aggregation::from).collect();
            Ok(group_by(&frame, keys).aggregate(&aggregations)?)
        }
        FixtureOperation::Join {
            left_key,
            right_key,
            join_type,
        } => {
            let right = right_frame(case)?;
            Ok(join(&frame, *left_key, &right, *right_key, (*join_type).into())?)
        }
        FixtureOperation::Hcat => Ok(frame.hcat(&right_frame(case)?)?),
        FixtureOperation::Vcat => Ok((&frame + &right_frame(case)?)?),
    }
}

fn compare(case: &ConformanceCase, outcome: Result<Frame, HarnessError>) -> Option<String> {
    match (outcome, &case.expected, &case.expected_error_contains) {
        (Ok(frame), Some(expected), _) => match FixtureFrame::from_frame(&frame) {
            Ok(actual) if actual == *expected => None,
            Ok(actual) => Some(format!("expected {expected:?}, got {actual:?}")),
            Err(err) => Some(format!("output could not be projected: {err}")),
        },
        (Ok(_), None, Some(fragment)) => Some(format!("expected error containing {fragment:?}")),
        (Ok(_), None, None) => None,
        (Err(err), _, Some(fragment)) if err.to_string().contains(fragment.as_str()) => None,
        (Err(err), _, _) => Some(format!("unexpected error: {err}")),
    }
}

#[must_use]
pub fn run_case(case: &ConformanceCase) -> CaseResult {
    let mismatch = compare(case, execute_case(case));
    CaseResult {
        case_id: case.case_id.clone(),
        status: if mismatch.is_none() {
            CaseStatus::Pass
        } else {
            CaseStatus::Fail
        },
        mismatch,
    }
}

#[must_use]
pub fn run_cases(cases: &[ConformanceCase]) -> SuiteReport {
    let results: Vec<CaseResult> = cases.iter().map(run_case).collect();
    let failed = results
        .iter()
        .filter(|result| result.status == CaseStatus::Fail)
        .count();
    SuiteReport {
        passed: results.len() - failed,
        failed,
        results,
    }
}

// ── Shared fixtures ────────────────────────────────────────────────────

/// Keys of the nine-row ledger; buckets have sizes 1, 2, 3, 1, 2.
pub const LEDGER_KEYS: [&str; 9] = ["a", "b", "c", "b", "c", "c", "d", "e", "e"];

/// Nine-row frame: `key` (utf8), `amt` (1..=9), `px` (f64 with gaps at
/// rows 3 and 6).
pub fn ledger() -> Result<Frame, FrameError> {
    let px: Vec<Missing<f64>> = (1_i32..=9)
        .map(|n| {
            if n % 3 == 1 && n > 1 {
                Missing::Absent
            } else {
                Missing::Present(f64::from(n) / 2.0)
            }
        })
        .collect();
    Frame::new()
        .with_series(Series::from_vec(
            "key",
            LEDGER_KEYS.iter().map(|key| (*key).to_owned()).collect(),
        ))?
        .with_series(Series::from_vec("amt", (1_i64..=9).collect()))?
        .with_series(Series::from_vec("px", px))
}
