use std::time::Duration;
use thiserror::Error;

/// Every way an execution can fail before it produces a result.
///
/// Strategies convert these into `RunResult` / `TestSuiteResult` values at their
/// boundary; nothing here reaches the request layer as an error.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("module {0} not found")]
    NotFound(String),
    #[error("failed to assemble build context: {0}")]
    ContextAssembly(String),
    #[error("failed to build image: {0}")]
    BuildFailure(String),
    #[error("build operation timed out after {0}s")]
    BuildTimeout(u64),
    #[error("failed to create container: {0}")]
    CreationFailure(String),
    #[error("failed to copy code to container: {0}")]
    InjectionFailure(String),
    #[error("failed to start container: {0}")]
    StartFailure(String),
    #[error("container is not running, state: {state}, error: {error}")]
    NotRunning { state: String, error: String },
    #[error("container wait timed out after {0}s")]
    RunTimeout(u64),
    #[error("container wait error: {0}")]
    WaitError(String),
    #[error("failed to get container logs: {0}")]
    LogRetrievalFailure(String),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{}process timed out after {:?}", output_prefix(.output), .limit)]
    ProcessTimeout { limit: Duration, output: String },
    #[error("Server failed to start. Output: {0}")]
    StartupTimeout(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn output_prefix(output: &str) -> String {
    if output.is_empty() {
        String::new()
    } else {
        format!("{}\n", output)
    }
}

impl ExecutionError {
    /// Short label used as the `message` of a failed run.
    pub fn summary(&self) -> &'static str {
        match self {
            ExecutionError::NotFound(_) => "Module not found",
            ExecutionError::ContextAssembly(_)
            | ExecutionError::BuildFailure(_)
            | ExecutionError::BuildTimeout(_) => "Failed to build module image",
            ExecutionError::CreationFailure(_) | ExecutionError::InjectionFailure(_) => {
                "Failed to create container"
            }
            ExecutionError::RunTimeout(_) | ExecutionError::ProcessTimeout { .. } => {
                "Code execution timed out"
            }
            ExecutionError::StartFailure(_)
            | ExecutionError::NotRunning { .. }
            | ExecutionError::WaitError(_)
            | ExecutionError::LogRetrievalFailure(_) => "Container execution failed",
            ExecutionError::StartupTimeout(_) => "Server startup timeout",
            ExecutionError::Spawn { .. } | ExecutionError::Io(_) => "Code execution failed",
        }
    }

    /// Name of the synthetic test entry reported when a test run fails in this phase.
    pub fn phase(&self) -> &'static str {
        match self {
            ExecutionError::NotFound(_) => "Module Setup",
            ExecutionError::ContextAssembly(_)
            | ExecutionError::BuildFailure(_)
            | ExecutionError::BuildTimeout(_)
            | ExecutionError::CreationFailure(_)
            | ExecutionError::InjectionFailure(_) => "Setup",
            ExecutionError::StartupTimeout(_) => "Server Startup",
            _ => "Execution",
        }
    }
}
