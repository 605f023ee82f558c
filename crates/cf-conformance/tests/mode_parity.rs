use cf_conformance::{
    FixtureCase, FixtureProgram, PARITY_SCHEMA_VERSION, default_fixture_cases, emit_parity_json,
    emit_parity_markdown, run_case, run_mode, run_parity,
};
use cf_core::CompatibilityMode;
use cf_test_utils::{
    ExecutionKind, TEST_LOG_SCHEMA_VERSION, TestResult, init_test_tracing,
    property_test_case_count,
};
use proptest::prelude::*;

#[test]
fn default_fixtures_agree_across_modes() {
    init_test_tracing();
    for mode in [CompatibilityMode::Strict, CompatibilityMode::Hardened] {
        let report = run_parity(&default_fixture_cases(), mode);
        let failures: Vec<_> = report.reports.iter().filter(|r| !r.matched).collect();
        assert!(failures.is_empty(), "{mode:?} mismatches: {failures:#?}");
        assert_eq!(report.total_cases, default_fixture_cases().len() * 3);
        assert!(report.all_matched());
    }
}

#[test]
fn every_arity_up_to_nine_runs_in_every_mode() {
    for arity in 1..=9_i64 {
        let case = FixtureCase::new(
            format!("arity_{arity}"),
            FixtureProgram::CountUp { limit: 3 },
            vec![(0..arity).collect()],
        );
        let expected: Vec<i64> = (0..arity).map(|x| x + 3).collect();
        for execution in [ExecutionKind::Eager, ExecutionKind::Trace, ExecutionKind::Batched] {
            let out = run_mode(&case, CompatibilityMode::Strict, execution)
                .unwrap_or_else(|err| panic!("arity {arity} {execution:?}: {err}"));
            assert_eq!(out, vec![expected.clone()], "arity {arity} {execution:?}");
        }
    }
}

#[test]
fn ten_operands_fail_in_every_mode() {
    let case = FixtureCase::new(
        "arity_10",
        FixtureProgram::CountUp { limit: 3 },
        vec![(0..10).collect()],
    );
    let reports = run_case(&case, CompatibilityMode::Strict);
    assert_eq!(reports.len(), 3);
    for report in reports {
        assert!(!report.matched);
        let error = report.error.expect("error recorded");
        assert!(error.contains("10"), "{error}");
    }
}

#[test]
fn diverging_lanes_finish_independently() {
    let case = FixtureCase::new(
        "diverging",
        FixtureProgram::CountUp { limit: 10 },
        vec![vec![0], vec![5], vec![9]],
    );
    for execution in [ExecutionKind::Eager, ExecutionKind::Trace, ExecutionKind::Batched] {
        let out = run_mode(&case, CompatibilityMode::Strict, execution).expect("run");
        assert_eq!(out, vec![vec![10], vec![10], vec![10]], "{execution:?}");
    }
}

#[test]
fn sign_branch_selects_per_lane() {
    let case = FixtureCase::new(
        "sign",
        FixtureProgram::SignBranch,
        vec![vec![1, 3], vec![0, 3], vec![-2, 5]],
    );
    let out = run_mode(&case, CompatibilityMode::Strict, ExecutionKind::Batched).expect("run");
    assert_eq!(out, vec![vec![6], vec![-3], vec![10]]);
}

#[test]
fn parity_report_json_and_markdown() {
    let cases = default_fixture_cases();
    let report = run_parity(&cases[..2], CompatibilityMode::Strict);
    let json = emit_parity_json(&report).expect("serialize");
    let parsed: serde_json::Value = serde_json::from_str(&json).expect("valid JSON");
    assert_eq!(parsed["schema_version"], PARITY_SCHEMA_VERSION);
    assert_eq!(parsed["total_cases"], 6);
    assert_eq!(parsed["reports"][1]["execution"], "trace");

    let markdown = emit_parity_markdown(&report);
    assert!(markdown.starts_with("# Mode Parity Report"));
    assert!(markdown.contains("| count_up_arity_1 | count_up | Batched | true |"));
}

#[test]
fn case_reports_become_test_logs() {
    let case = &default_fixture_cases()[0];
    let reports = run_case(case, CompatibilityMode::Strict);
    let log = reports[2].to_test_log(case).expect("log");
    assert_eq!(log.schema_version, TEST_LOG_SCHEMA_VERSION);
    assert_eq!(log.execution, ExecutionKind::Batched);
    assert_eq!(log.result, TestResult::Pass);
    assert_eq!(log.fixture_id.len(), 64);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(property_test_case_count()))]

    #[test]
    fn count_up_matches_eager(
        limit in -2_i64..12,
        lanes in proptest::collection::vec(proptest::collection::vec(-5_i64..15, 2), 1..5),
    ) {
        let case = FixtureCase::new("prop_count_up", FixtureProgram::CountUp { limit }, lanes);
        let eager =
            run_mode(&case, CompatibilityMode::Strict, ExecutionKind::Eager).expect("eager");
        for execution in [ExecutionKind::Trace, ExecutionKind::Batched] {
            let out = run_mode(&case, CompatibilityMode::Strict, execution).expect("run");
            prop_assert_eq!(&out, &eager);
        }
    }

    #[test]
    fn sign_branch_matches_eager(
        lanes in proptest::collection::vec(proptest::collection::vec(-3_i64..3, 3), 1..5),
    ) {
        let case = FixtureCase::new("prop_sign", FixtureProgram::SignBranch, lanes);
        let eager =
            run_mode(&case, CompatibilityMode::Strict, ExecutionKind::Eager).expect("eager");
        for execution in [ExecutionKind::Trace, ExecutionKind::Batched] {
            let out = run_mode(&case, CompatibilityMode::Strict, execution).expect("run");
            prop_assert_eq!(&out, &eager);
        }
    }
}
