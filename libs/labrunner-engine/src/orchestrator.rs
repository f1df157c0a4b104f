/// Execution Orchestrator
///
/// **Responsibility:**
/// Turn `(module_id, code)` into a terminal result. Nothing here returns an
/// error: a missing module, a failed build or a crashed submission all become
/// `success = false` results or a failed synthetic test entry.
///
/// **Architecture:**
/// 1. Resolve the exercise directory through the catalog
/// 2. Classify the exercise (function or server)
/// 3. Hand off to the strategy picked once at startup (sandbox or direct)
///
/// The orchestrator knows nothing about containers or processes.
use crate::catalog::ModuleCatalog;
use crate::error::ExecutionError;
use crate::process::DirectRunner;
use crate::sandbox::SandboxManager;
use crate::strategy::{ExecutionStrategy, Submission};
use labrunner_common::config::{EngineConfig, SandboxConfig};
use labrunner_common::types::{ExecutionRequest, ExerciseType, RunResult, TestSuiteResult};
use std::sync::Arc;
use std::time::Instant;
use tracing::{field, info, instrument, warn, Span};

pub struct Executor {
    catalog: ModuleCatalog,
    config: EngineConfig,
    strategy: Arc<dyn ExecutionStrategy>,
}

impl Executor {
    /// Pick the strategy once: the sandbox if isolation is enabled and the
    /// container engine answers, the direct runner otherwise.
    pub async fn initialize(sandbox: SandboxConfig, config: EngineConfig) -> Self {
        let strategy: Arc<dyn ExecutionStrategy> = if sandbox.enabled {
            match SandboxManager::connect(sandbox, &config).await {
                Ok(manager) => {
                    info!(
                        memory_limit = manager.config().memory_limit,
                        timeout_secs = manager.config().execution_timeout_secs,
                        "Container engine reachable, using sandbox"
                    );
                    Arc::new(manager)
                }
                Err(e) => {
                    warn!(error = %e, "Container engine unavailable, falling back to direct process runner");
                    Arc::new(DirectRunner::new(config.clone()))
                }
            }
        } else {
            info!("Container isolation disabled, using direct process runner");
            Arc::new(DirectRunner::new(config.clone()))
        };

        Self::with_strategy(config, strategy)
    }

    pub fn with_strategy(config: EngineConfig, strategy: Arc<dyn ExecutionStrategy>) -> Self {
        Self {
            catalog: ModuleCatalog::new(config.modules_path.clone()),
            config,
            strategy,
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn catalog(&self) -> &ModuleCatalog {
        &self.catalog
    }

    pub fn exercise_type(&self, module_id: &str) -> ExerciseType {
        if self.config.is_function_module(module_id) {
            ExerciseType::Function
        } else {
            ExerciseType::Server
        }
    }

    #[instrument(
        skip(self, code),
        fields(request_id = field::Empty, strategy = self.strategy.name(), code_len = code.len())
    )]
    pub async fn run_code(&self, module_id: &str, code: &str) -> RunResult {
        let request = ExecutionRequest::new(module_id, code);
        Span::current().record("request_id", field::display(request.request_id));
        let started = Instant::now();
        let exercise_type = self.exercise_type(module_id);

        let Some(exercise_dir) = self.catalog.resolve_exercise_path(module_id) else {
            let err = ExecutionError::NotFound(module_id.to_string());
            warn!(error = %err, "Run rejected");
            return RunResult::failed(
                module_id,
                exercise_type,
                err.summary(),
                err.to_string(),
                started.elapsed().as_millis() as u64,
            );
        };

        let submission = Submission {
            request: &request,
            exercise_dir,
            exercise_type,
            started,
        };
        let result = self.strategy.run(&submission).await;

        info!(
            success = result.success,
            exercise_type = %result.exercise_type,
            execution_time_ms = result.execution_time_ms,
            "Run finished"
        );
        result
    }

    #[instrument(
        skip(self, code),
        fields(request_id = field::Empty, strategy = self.strategy.name(), code_len = code.len())
    )]
    pub async fn run_tests(&self, module_id: &str, code: &str) -> TestSuiteResult {
        let request = ExecutionRequest::new(module_id, code);
        Span::current().record("request_id", field::display(request.request_id));
        let started = Instant::now();
        let exercise_type = self.exercise_type(module_id);

        let Some(exercise_dir) = self.catalog.resolve_exercise_path(module_id) else {
            let err = ExecutionError::NotFound(module_id.to_string());
            warn!(error = %err, "Test run rejected");
            return TestSuiteResult::phase_failure(
                module_id,
                exercise_type,
                err.phase(),
                err.to_string(),
                started.elapsed().as_millis() as u64,
            );
        };

        let submission = Submission {
            request: &request,
            exercise_dir,
            exercise_type,
            started,
        };
        let suite = self.strategy.test(&submission).await;

        info!(
            total = suite.total_tests,
            passed = suite.passed_tests,
            failed = suite.failed_tests,
            execution_time_ms = suite.execution_time_ms,
            "Test run finished"
        );
        suite
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use labrunner_common::types::TestCaseResult;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records what it was asked to run and echoes the code back.
    #[derive(Default)]
    struct RecordingStrategy {
        calls: Mutex<Vec<(String, ExerciseType)>>,
    }

    #[async_trait]
    impl ExecutionStrategy for RecordingStrategy {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn run(&self, submission: &Submission<'_>) -> RunResult {
            self.calls
                .lock()
                .unwrap()
                .push((submission.module_id().to_string(), submission.exercise_type));
            RunResult::succeeded(
                submission.module_id(),
                submission.exercise_type,
                "ok",
                submission.code(),
                submission.elapsed_ms(),
            )
        }

        async fn test(&self, submission: &Submission<'_>) -> TestSuiteResult {
            self.calls
                .lock()
                .unwrap()
                .push((submission.module_id().to_string(), submission.exercise_type));
            TestSuiteResult::from_results(
                submission.module_id(),
                submission.exercise_type,
                vec![TestCaseResult::passed("works")],
                submission.elapsed_ms(),
            )
        }
    }

    fn modules_root(ids: &[&str]) -> TempDir {
        let root = TempDir::new().unwrap();
        for id in ids {
            fs::create_dir_all(root.path().join(id).join("exercise")).unwrap();
        }
        root
    }

    fn config_for(root: &Path) -> EngineConfig {
        EngineConfig {
            modules_path: root.to_path_buf(),
            runtime_bin: "sh".to_string(),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_unknown_module_run() {
        let root = modules_root(&["module-1"]);
        let strategy = Arc::new(RecordingStrategy::default());
        let executor = Executor::with_strategy(config_for(root.path()), strategy.clone());

        let result = executor.run_code("module-42", "console.log(1)").await;

        assert!(!result.success);
        assert!(result.message.contains("not found"));
        assert!(result.error.unwrap().contains("module-42"));
        assert!(strategy.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_module_tests() {
        let root = modules_root(&[]);
        let executor =
            Executor::with_strategy(config_for(root.path()), Arc::new(RecordingStrategy::default()));

        let suite = executor.run_tests("module-7", "x").await;

        assert_eq!(suite.total_tests, 0);
        assert_eq!(suite.results.len(), 1);
        assert_eq!(suite.results[0].name, "Module Setup");
        assert!(suite.results[0].error.as_deref().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_exercise_type_dispatch() {
        let root = modules_root(&["module-1", "module-3"]);
        let strategy = Arc::new(RecordingStrategy::default());
        let executor = Executor::with_strategy(config_for(root.path()), strategy.clone());

        let function = executor.run_code("module-1", "a").await;
        let server = executor.run_tests("module-3", "b").await;

        assert_eq!(function.exercise_type, ExerciseType::Function);
        assert_eq!(server.exercise_type, ExerciseType::Server);
        assert_eq!(
            *strategy.calls.lock().unwrap(),
            vec![
                ("module-1".to_string(), ExerciseType::Function),
                ("module-3".to_string(), ExerciseType::Server),
            ]
        );
    }

    #[tokio::test]
    async fn test_disabled_sandbox_uses_direct_runner() {
        let root = modules_root(&["module-1"]);
        let sandbox = SandboxConfig {
            enabled: false,
            ..SandboxConfig::default()
        };
        let executor = Executor::initialize(sandbox, config_for(root.path())).await;
        assert_eq!(executor.strategy_name(), "direct");

        let result = executor.run_code("module-1", "echo hello").await;
        assert!(result.success);
        assert_eq!(result.output.as_deref(), Some("hello"));
        assert_eq!(result.exercise_type, ExerciseType::Function);
    }

    #[tokio::test]
    async fn test_repeated_runs_are_independent() {
        let root = modules_root(&["module-1"]);
        let executor = Executor::with_strategy(
            config_for(root.path()),
            Arc::new(DirectRunner::new(config_for(root.path()))),
        );

        let first = executor.run_code("module-1", "echo same").await;
        let second = executor.run_code("module-1", "echo same").await;

        assert_eq!(first.output, second.output);
        assert_eq!(first.success, second.success);
    }
}
