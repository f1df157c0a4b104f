/// Test Output Normalizer
///
/// Turns whatever the test framework printed into a `TestSuiteResult`.
///
/// **Tiers:**
/// 1. Structured: the output holds a mocha JSON report. Per-test results,
///    counts tallied from the flattened list.
/// 2. Degraded: no report, but console markers or a summary line were found.
///    A single synthetic "Test Suite" entry carries the raw output.
/// 3. Empty: nothing recognisable. Zero tests.
///
/// Pure function of the output text; knows nothing about how it was produced.
use labrunner_common::report::{ReportTest, StructuredTestReport};
use labrunner_common::types::{ExerciseType, TestCaseResult, TestSuiteResult};
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

const PASS_MARKERS: &[&str] = &["✔", "✓"];
const FAIL_MARKERS: &[&str] = &["✗", "✖"];
const REPORT_KEYS: &[&str] = &["stats", "passes", "failures", "tests"];

/// Name of the single entry produced by the degraded tier.
pub const SUITE_ENTRY_NAME: &str = "Test Suite";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportTier {
    Structured,
    Degraded,
    Empty,
}

#[derive(Debug, Clone)]
pub struct Normalized {
    pub tier: ReportTier,
    pub suite: TestSuiteResult,
}

fn expected_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"expected\s+(.+?)\s+to").expect("valid regex"))
}

fn actual_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"got\s+(.+?)$").expect("valid regex"))
}

fn passing_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+)\s+passing").expect("valid regex"))
}

fn failing_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+)\s+failing").expect("valid regex"))
}

/// Normalize captured test output for `module_id`.
pub fn normalize(
    module_id: &str,
    exercise_type: ExerciseType,
    output: &str,
    execution_time_ms: u64,
) -> Normalized {
    if output.trim().is_empty() {
        return Normalized {
            tier: ReportTier::Empty,
            suite: TestSuiteResult::from_results(module_id, exercise_type, Vec::new(), execution_time_ms),
        };
    }

    if let Some(report) = locate_report(output) {
        let results = flatten_report(&report);
        debug!(module_id, tests = results.len(), "Decoded structured test report");
        return Normalized {
            tier: ReportTier::Structured,
            suite: TestSuiteResult::from_results(module_id, exercise_type, results, execution_time_ms),
        };
    }

    let (passed, failed) = count_markers(output).unwrap_or_else(|| count_summary(output));
    let total = passed + failed;
    if total == 0 {
        warn!(module_id, "No tests detected in test output");
        return Normalized {
            tier: ReportTier::Empty,
            suite: TestSuiteResult::from_results(module_id, exercise_type, Vec::new(), execution_time_ms),
        };
    }

    warn!(module_id, passed, failed, "Structured report missing; using console summary");
    let entry = TestCaseResult {
        name: SUITE_ENTRY_NAME.to_string(),
        passed: failed == 0,
        error: Some(output.to_string()),
        expected: None,
        actual: None,
    };

    Normalized {
        tier: ReportTier::Degraded,
        suite: TestSuiteResult {
            module_id: module_id.to_string(),
            total_tests: total,
            passed_tests: passed,
            failed_tests: failed,
            results: vec![entry],
            execution_time_ms,
            exercise_type,
        },
    }
}

/// Find a mocha report in `output`: the whole text first, then the first JSON
/// object that opens a line. Text after the object is ignored.
pub fn locate_report(output: &str) -> Option<StructuredTestReport> {
    let trimmed = output.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(report) = as_report(value) {
            return Some(report);
        }
    }

    let mut offset = 0;
    for line in output.split_inclusive('\n') {
        if line.trim_start().starts_with('{') {
            let start = offset + (line.len() - line.trim_start().len());
            let mut stream = serde_json::Deserializer::from_str(&output[start..]).into_iter::<serde_json::Value>();
            if let Some(report) = stream.next().and_then(Result::ok).and_then(as_report) {
                return Some(report);
            }
        }
        offset += line.len();
    }

    None
}

/// Only objects carrying at least one reporter section count as a report;
/// any other JSON a program logs is skipped.
fn as_report(value: serde_json::Value) -> Option<StructuredTestReport> {
    let object = value.as_object()?;
    if !REPORT_KEYS.iter().any(|key| object.contains_key(*key)) {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// Passes first, then failures, each in report order.
pub fn flatten_report(report: &StructuredTestReport) -> Vec<TestCaseResult> {
    let passes = report.passes.iter().map(|test| TestCaseResult::passed(&test.title));
    let failures = report.failures.iter().map(failed_case);
    passes.chain(failures).collect()
}

fn failed_case(test: &ReportTest) -> TestCaseResult {
    let mut result = TestCaseResult::failed(&test.title, None);

    if let Some(err) = &test.err {
        let (expected, actual) = extract_comparison(&err.message);
        result.error = Some(err.message.clone());
        result.expected = expected.map(serde_json::Value::String);
        result.actual = actual.map(serde_json::Value::String);
    }

    result
}

/// Pull "expected X to ..." and "... got Y" fragments out of an assertion message.
/// Either side may be missing.
pub fn extract_comparison(message: &str) -> (Option<String>, Option<String>) {
    let expected = expected_pattern()
        .captures(message)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());
    let actual = actual_pattern()
        .captures(message)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());
    (expected, actual)
}

fn count_markers(output: &str) -> Option<(usize, usize)> {
    let mut passed = 0;
    let mut failed = 0;

    for line in output.lines() {
        if PASS_MARKERS.iter().any(|m| line.contains(m)) {
            passed += 1;
        } else if FAIL_MARKERS.iter().any(|m| line.contains(m)) {
            failed += 1;
        }
    }

    (passed + failed > 0).then_some((passed, failed))
}

/// Reads "N passing" and an optional "M failing", on the same line or a later one.
/// The last summary wins.
fn count_summary(output: &str) -> (usize, usize) {
    let mut summary: Option<(usize, usize)> = None;

    for line in output.lines() {
        let passing = capture_count(passing_pattern(), line);
        let failing = capture_count(failing_pattern(), line);

        if let Some(passed) = passing {
            summary = Some((passed, failing.unwrap_or(0)));
        } else if let (Some(failed), Some(current)) = (failing, summary.as_mut()) {
            current.1 = failed;
        }
    }

    summary.unwrap_or((0, 0))
}

fn capture_count(pattern: &Regex, line: &str) -> Option<usize> {
    pattern
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(output: &str) -> Normalized {
        normalize("module-2", ExerciseType::Server, output, 10)
    }

    #[test]
    fn test_structured_pass_and_failure() {
        let report = json!({
            "stats": {"suites": 1, "tests": 2, "passes": 1, "pending": 0, "failures": 1, "duration": 5},
            "tests": [],
            "passes": [{"title": "adds", "fullTitle": "calc adds", "duration": 1, "err": {}}],
            "failures": [{"title": "subtracts", "fullTitle": "calc subtracts", "duration": 1,
                          "err": {"message": "expected 5 to equal got 4", "stack": ""}}],
            "pending": []
        });

        let normalized = run(&report.to_string());
        let suite = normalized.suite;

        assert_eq!(normalized.tier, ReportTier::Structured);
        assert_eq!(suite.total_tests, 2);
        assert_eq!(suite.passed_tests, 1);
        assert_eq!(suite.failed_tests, 1);
        assert_eq!(suite.results[0].name, "adds");
        assert!(suite.results[0].passed);
        assert!(!suite.results[1].passed);
        assert_eq!(suite.results[1].expected, Some(json!("5")));
        assert_eq!(suite.results[1].actual, Some(json!("4")));
        assert_eq!(suite.results[1].error.as_deref(), Some("expected 5 to equal got 4"));
    }

    #[test]
    fn test_counts_ignore_report_stats() {
        let report = json!({
            "stats": {"tests": 99, "passes": 50, "failures": 49},
            "passes": [{"title": "only one"}],
            "failures": []
        });

        let suite = run(&report.to_string()).suite;
        assert_eq!(suite.total_tests, 1);
        assert_eq!(suite.passed_tests, 1);
        assert_eq!(suite.failed_tests, 0);
    }

    #[test]
    fn test_failure_without_comparison_phrasing() {
        let report = json!({
            "failures": [{"title": "responds", "err": {"message": "connect ECONNREFUSED 127.0.0.1:3000"}}]
        });

        let suite = run(&report.to_string()).suite;
        assert_eq!(suite.failed_tests, 1);
        assert_eq!(suite.results[0].expected, None);
        assert_eq!(suite.results[0].actual, None);
        assert!(suite.results[0].error.as_deref().unwrap().contains("ECONNREFUSED"));
    }

    #[test]
    fn test_failure_without_error_object() {
        let report = json!({"failures": [{"title": "hangs"}]});
        let suite = run(&report.to_string()).suite;
        assert_eq!(suite.results[0].error, None);
        assert!(!suite.results[0].passed);
    }

    #[test]
    fn test_report_surrounded_by_shell_chatter() {
        let report = json!({"passes": [{"title": "a"}, {"title": "b"}], "failures": []});
        let output = format!("\n> exercise@1.0.0 test\n> mocha\n\n{}\nStopping server...\nDone", report);

        let normalized = run(&output);
        assert_eq!(normalized.tier, ReportTier::Structured);
        assert_eq!(normalized.suite.passed_tests, 2);
    }

    #[test]
    fn test_unrelated_json_is_not_a_report() {
        let report = json!({"passes": [{"title": "a"}], "failures": []});
        let output = format!("{{\"port\":3000}}\n{}", report);

        let normalized = run(&output);
        assert_eq!(normalized.tier, ReportTier::Structured);
        assert_eq!(normalized.suite.total_tests, 1);

        assert_eq!(run(r#"{"level":"info","msg":"listening"}"#).tier, ReportTier::Empty);
    }

    #[test]
    fn test_empty_output() {
        let normalized = run("   \n");
        assert_eq!(normalized.tier, ReportTier::Empty);
        assert_eq!(normalized.suite.total_tests, 0);
        assert_eq!(normalized.suite.passed_tests, 0);
        assert_eq!(normalized.suite.failed_tests, 0);
        assert!(normalized.suite.results.is_empty());
    }

    #[test]
    fn test_degraded_markers() {
        let output = "  Books API\n    ✔ lists books\n    ✓ gets a book\n    ✖ deletes a book\n";
        let normalized = run(output);

        assert_eq!(normalized.tier, ReportTier::Degraded);
        assert_eq!(normalized.suite.total_tests, 3);
        assert_eq!(normalized.suite.passed_tests, 2);
        assert_eq!(normalized.suite.failed_tests, 1);
        assert_eq!(normalized.suite.results.len(), 1);
        assert_eq!(normalized.suite.results[0].name, SUITE_ENTRY_NAME);
        assert!(!normalized.suite.results[0].passed);
        assert_eq!(normalized.suite.results[0].error.as_deref(), Some(output));
    }

    #[test]
    fn test_degraded_summary_same_line() {
        let normalized = run("0 passing, 7 failing");
        assert_eq!(normalized.suite.passed_tests, 0);
        assert_eq!(normalized.suite.failed_tests, 7);
        assert_eq!(normalized.suite.total_tests, 7);
        assert!(!normalized.suite.results[0].passed);
    }

    #[test]
    fn test_degraded_summary_split_lines() {
        let normalized = run("\n  5 passing (31ms)\n  2 failing\n\n  1) something broke");
        assert_eq!(normalized.tier, ReportTier::Degraded);
        assert_eq!(normalized.suite.passed_tests, 5);
        assert_eq!(normalized.suite.failed_tests, 2);
    }

    #[test]
    fn test_degraded_summary_all_passing() {
        let normalized = run("  7 passing (123ms)");
        assert_eq!(normalized.suite.total_tests, 7);
        assert_eq!(normalized.suite.failed_tests, 0);
        assert!(normalized.suite.results[0].passed);
    }

    #[test]
    fn test_unrecognised_output_is_empty() {
        let normalized = run("Error: Cannot find module 'express'");
        assert_eq!(normalized.tier, ReportTier::Empty);
        assert_eq!(normalized.suite.total_tests, 0);
    }

    #[test]
    fn test_extract_comparison_partial() {
        assert_eq!(
            extract_comparison("expected 'a' to equal 'b'"),
            (Some("'a'".to_string()), None)
        );
        assert_eq!(extract_comparison("got nothing useful"), (None, Some("nothing useful".to_string())));
        assert_eq!(extract_comparison("timeout of 2000ms exceeded"), (None, None));
    }
}
