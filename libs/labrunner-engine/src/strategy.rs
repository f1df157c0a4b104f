// Seam between the orchestrator and the two execution backends.
use async_trait::async_trait;
use labrunner_common::types::{ExecutionRequest, ExerciseType, RunResult, TestSuiteResult};
use std::path::PathBuf;
use std::time::Instant;

/// A request whose exercise has already been resolved on disk.
#[derive(Debug)]
pub struct Submission<'a> {
    pub request: &'a ExecutionRequest,
    pub exercise_dir: PathBuf,
    pub exercise_type: ExerciseType,
    pub started: Instant,
}

impl<'a> Submission<'a> {
    pub fn module_id(&self) -> &str {
        &self.request.module_id
    }

    pub fn code(&self) -> &str {
        &self.request.code
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// An execution backend. Implementations never fail: every problem ends up in
/// the returned result, and every process or container they start is gone
/// before they return.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, submission: &Submission<'_>) -> RunResult;

    async fn test(&self, submission: &Submission<'_>) -> TestSuiteResult;
}
