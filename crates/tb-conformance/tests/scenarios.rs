#![forbid(unsafe_code)]

//! Fixture suite and end-to-end scenarios over the shared ledger frame.

use tb_conformance::{CaseStatus, FixtureFrame, LEDGER_KEYS, ledger, load_cases, run_cases};
use tb_expr::{Placement, col, derive, filter, lag};
use tb_groupby::{
    GroupByError, GroupIndex, aggregate_index, count, group_by, max, mean, min, sum,
};
use tb_join::leftjoin;
use tb_types::{Missing, Scalar};

const CASES: &str = include_str!("../fixtures/cases.json");

#[test]
fn fixture_suite_is_green() {
    let cases = load_cases(CASES).expect("fixtures parse");
    assert!(cases.len() >= 10, "fixture file lost cases");
    let report = run_cases(&cases);
    let failures: Vec<_> = report
        .results
        .iter()
        .filter(|result| result.status == CaseStatus::Fail)
        .collect();
    assert!(report.is_green(), "failing cases: {failures:#?}");
    assert_eq!(report.passed, cases.len());
}

#[test]
fn ledger_groups_by_key_in_first_seen_order() {
    let frame = ledger().expect("ledger");
    let index = GroupIndex::build(&frame, &[0]).expect("index");
    let sizes: Vec<usize> = index.buckets().iter().map(|b| b.len()).collect();
    assert_eq!(sizes, vec![1, 2, 3, 1, 2]);
    assert_eq!(index.rows(), LEDGER_KEYS.len());

    let out = group_by(&frame, &[0])
        .aggregate(&[sum(1), min(2), max(2), mean(1), count()])
        .expect("aggregate");
    assert_eq!(
        out.column_names(),
        vec!["key", "sum( amt )", "min( px )", "max( px )", "mean( amt )", "count(*)"]
    );
    let sums = out.series::<i64>(1).expect("sums").as_slice().to_vec();
    assert_eq!(sums, vec![1, 2 + 4, 3 + 5 + 6, 7, 8 + 9]);
    let mins = out.series::<Missing<f64>>(2).expect("mins").as_slice().to_vec();
    let maxs = out.series::<Missing<f64>>(3).expect("maxs").as_slice().to_vec();
    // Bucket "b" holds px 1.0 and a gap.
    assert_eq!(mins[1], Missing::Absent);
    assert_eq!(maxs[1], Missing::Present(1.0));
    assert_eq!(mins[2], Missing::Present(1.5));
    assert_eq!(maxs[2], Missing::Present(3.0));
    let means = out.series::<f64>(4).expect("means").as_slice().to_vec();
    assert!((means[2] - 14.0 / 3.0).abs() < 1e-12);
}

#[test]
fn filtered_ledger_keeps_row_order() {
    let frame = ledger().expect("ledger");
    let kept = filter(&frame, &col(1).gt(5_i64)).expect("filter");
    assert_eq!(kept.size().expect("consistent"), 4);
    let keys = kept.series::<String>(0).expect("keys").as_slice().to_vec();
    assert_eq!(keys, vec!["c", "d", "e", "e"]);
}

#[test]
fn running_difference_then_join_back() {
    let mut frame = ledger().expect("ledger");
    derive(&mut frame, "delta", &(col(1) - lag(1, 1)), Placement::Append).expect("derive");
    let delta = frame.series::<i64>(3).expect("delta").as_slice().to_vec();
    assert_eq!(delta, vec![1, 1, 1, 1, 1, 1, 1, 1, 1]);

    let totals = group_by(&frame, &[0]).aggregate(&[sum(1)]).expect("totals");
    let joined = leftjoin(&frame, 0, &totals, 0).expect("join");
    assert_eq!(joined.size().expect("consistent"), 9);
    assert_eq!(joined.width(), frame.width() + totals.width());

    // Rows come out bucket by bucket, so both "c" rows sit together.
    let fixture = FixtureFrame::from_frame(&joined).expect("fixture");
    let keys = &fixture.columns[0].values;
    assert_eq!(keys[3], Scalar::from("c"));
    assert_eq!(keys[4], Scalar::from("c"));
    assert_eq!(fixture.columns[5].values[3], Scalar::Int64(14));
}

#[test]
fn missing_values_survive_the_pipeline() {
    let frame = ledger().expect("ledger");
    let kept = filter(&frame, &col(0).equals("b")).expect("filter");
    let px = kept.series::<Missing<f64>>(2).expect("px").as_slice().to_vec();
    assert_eq!(px, vec![Missing::Present(1.0), Missing::Absent]);
}

#[test]
fn filtered_and_derived_frame_invalidates_detached_index() {
    let mut frame = ledger().expect("ledger");
    let index = GroupIndex::build(&frame, &[0]).expect("index");
    frame = filter(&frame, &col(1).gt(1_i64)).expect("filter");
    derive(&mut frame, "twice", &(col(1) * 2_i64), Placement::Append).expect("derive");
    derive(&mut frame, "thrice", &(col(1) * 3_i64), Placement::Append).expect("derive");

    assert!(!index.is_current(&frame));
    assert!(matches!(
        aggregate_index(&frame, &index, &[sum(1)]),
        Err(GroupByError::StaleIndex { .. })
    ));
}
