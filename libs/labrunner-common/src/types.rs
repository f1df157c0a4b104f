use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A single submission for one exercise module.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub request_id: Uuid,
    pub module_id: String,
    pub code: String,
}

impl ExecutionRequest {
    pub fn new(module_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            module_id: module_id.into(),
            code: code.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExerciseType {
    /// One-shot script, judged by its output
    Function,
    /// Long-lived HTTP server, judged by probing and live tests
    Server,
}

impl fmt::Display for ExerciseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExerciseType::Function => write!(f, "function"),
            ExerciseType::Server => write!(f, "server"),
        }
    }
}

/// Result of a plain run. Exactly one of `output` / `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub module_id: String,
    pub success: bool,
    pub message: String,
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub exercise_type: ExerciseType,
}

impl RunResult {
    pub fn succeeded(
        module_id: &str,
        exercise_type: ExerciseType,
        message: impl Into<String>,
        output: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            module_id: module_id.to_string(),
            success: true,
            message: message.into(),
            execution_time_ms,
            output: Some(output.into()),
            error: None,
            exercise_type,
        }
    }

    pub fn failed(
        module_id: &str,
        exercise_type: ExerciseType,
        message: impl Into<String>,
        error: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            module_id: module_id.to_string(),
            success: false,
            message: message.into(),
            execution_time_ms,
            output: None,
            error: Some(error.into()),
            exercise_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseResult {
    #[serde(rename = "testName")]
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<serde_json::Value>,
}

impl TestCaseResult {
    pub fn passed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            error: None,
            expected: None,
            actual: None,
        }
    }

    pub fn failed(name: impl Into<String>, error: Option<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            error,
            expected: None,
            actual: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSuiteResult {
    pub module_id: String,
    pub total_tests: usize,
    pub passed_tests: usize,
    pub failed_tests: usize,
    pub results: Vec<TestCaseResult>,
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,
    pub exercise_type: ExerciseType,
}

impl TestSuiteResult {
    /// Builds a suite from test-level results, tallying the counts from the list.
    pub fn from_results(
        module_id: &str,
        exercise_type: ExerciseType,
        results: Vec<TestCaseResult>,
        execution_time_ms: u64,
    ) -> Self {
        let passed_tests = results.iter().filter(|r| r.passed).count();
        Self {
            module_id: module_id.to_string(),
            total_tests: results.len(),
            passed_tests,
            failed_tests: results.len() - passed_tests,
            results,
            execution_time_ms,
            exercise_type,
        }
    }

    /// A run that never produced test results: zero counts and one failed entry
    /// named after the phase that broke.
    pub fn phase_failure(
        module_id: &str,
        exercise_type: ExerciseType,
        phase: &str,
        error: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            module_id: module_id.to_string(),
            total_tests: 0,
            passed_tests: 0,
            failed_tests: 0,
            results: vec![TestCaseResult::failed(phase, Some(error.into()))],
            execution_time_ms,
            exercise_type,
        }
    }
}
