/// Direct Process Runner
///
/// Fallback strategy when no container engine is reachable. Submissions run as
/// local child processes inside the exercise directory.
///
/// **Shared state:**
/// The staged entry file and the server port are the same for every request,
/// so the whole runner is serialized on one async mutex.
///
/// **Flows:**
/// - function run: stage, run in the foreground under `run` timeout
/// - server run: free the port, stage, launch in background, poll until ready
/// - function test: stage, run the test command
/// - server test: as server run, then the test command against the live server
///
/// Every child started here is killed and reaped before the call returns.
use crate::error::ExecutionError;
use crate::normalizer::{self, ReportTier};
use crate::strategy::{ExecutionStrategy, Submission};
use crate::ENTRY_POINT;
use async_trait::async_trait;
use labrunner_common::config::EngineConfig;
use labrunner_common::types::{ExerciseType, RunResult, TestSuiteResult};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// How long to wait for an HTTP answer from a freshly started server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerTimeouts {
    pub run: Duration,
    pub function_test: Duration,
    pub server_test: Duration,
}

impl Default for RunnerTimeouts {
    fn default() -> Self {
        Self {
            run: Duration::from_secs(5),
            function_test: Duration::from_secs(10),
            server_test: Duration::from_secs(15),
        }
    }
}

#[derive(Debug)]
struct ProcessOutput {
    success: bool,
    code: Option<i32>,
    /// stdout and stderr in arrival order, trimmed
    output: String,
}

/// stdout/stderr of a child copied into one buffer as they arrive.
struct OutputCapture {
    buffer: Arc<StdMutex<Vec<u8>>>,
    readers: Vec<JoinHandle<()>>,
}

impl OutputCapture {
    fn attach(child: &mut Child) -> Self {
        let buffer = Arc::new(StdMutex::new(Vec::new()));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(copy_into(stdout, buffer.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(copy_into(stderr, buffer.clone())));
        }
        Self { buffer, readers }
    }

    /// Wait for the pipes to close and return what was printed.
    async fn drain(mut self) -> String {
        for mut reader in self.readers.drain(..) {
            // A grandchild may still hold the pipe open
            if tokio::time::timeout(Duration::from_secs(1), &mut reader).await.is_err() {
                debug!("Output reader did not finish after exit");
                reader.abort();
            }
        }
        let bytes = lock_buffer(&self.buffer);
        String::from_utf8_lossy(&bytes).trim().to_string()
    }
}

fn spawn_piped(program: &str, args: &[&str], dir: &Path) -> Result<Child, ExecutionError> {
    Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecutionError::Spawn {
            program: program.to_string(),
            source,
        })
}

/// A long-running child with its output captured in the background.
struct BackgroundProcess {
    child: Child,
    capture: OutputCapture,
}

impl BackgroundProcess {
    fn spawn(program: &str, args: &[&str], dir: &Path) -> Result<Self, ExecutionError> {
        let mut child = spawn_piped(program, args, dir)?;
        let capture = OutputCapture::attach(&mut child);
        Ok(Self { child, capture })
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Kill, reap, and return everything the process printed.
    async fn stop(mut self) -> String {
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "Background process already gone");
        }
        self.capture.drain().await
    }
}

fn lock_buffer(buffer: &StdMutex<Vec<u8>>) -> Vec<u8> {
    match buffer.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

async fn copy_into<R: AsyncRead + Unpin>(mut pipe: R, buffer: Arc<StdMutex<Vec<u8>>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => match buffer.lock() {
                Ok(mut guard) => guard.extend_from_slice(&chunk[..n]),
                Err(poisoned) => poisoned.into_inner().extend_from_slice(&chunk[..n]),
            },
        }
    }
}

/// Run to completion within `limit`. On expiry the child is killed and the
/// output printed so far travels with the timeout error.
async fn run_foreground(
    program: &str,
    args: &[&str],
    dir: &Path,
    limit: Duration,
) -> Result<ProcessOutput, ExecutionError> {
    let mut child = spawn_piped(program, args, dir)?;
    let capture = OutputCapture::attach(&mut child);

    let status = match tokio::time::timeout(limit, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "Failed to kill timed out process");
            }
            let output = capture.drain().await;
            return Err(ExecutionError::ProcessTimeout { limit, output });
        }
    };

    Ok(ProcessOutput {
        success: status.success(),
        code: status.code(),
        output: capture.drain().await,
    })
}

/// Best effort: kill whatever listens on `port`.
#[cfg(unix)]
async fn free_port(port: u16) {
    let target = format!("tcp:{}", port);
    let lookup = Command::new("lsof")
        .args(["-ti", target.as_str(), "-sTCP:LISTEN"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await;

    let pids = match lookup {
        Ok(output) => String::from_utf8_lossy(&output.stdout).into_owned(),
        Err(e) => {
            debug!(port, error = %e, "Port lookup unavailable");
            return;
        }
    };

    let own_pid = std::process::id().to_string();
    for pid in pids
        .lines()
        .map(str::trim)
        .filter(|pid| !pid.is_empty() && *pid != own_pid)
    {
        match Command::new("kill").args(["-9", pid]).status().await {
            Ok(_) => info!(port, pid, "Killed process holding server port"),
            Err(e) => warn!(port, pid, error = %e, "Failed to kill process holding server port"),
        }
    }
}

#[cfg(not(unix))]
async fn free_port(_port: u16) {}

pub struct DirectRunner {
    config: EngineConfig,
    readiness: ReadinessPolicy,
    timeouts: RunnerTimeouts,
    http: reqwest::Client,
    lock: Mutex<()>,
}

impl DirectRunner {
    pub fn new(config: EngineConfig) -> Self {
        // No idle connections: a pooled socket to the port would make this
        // process show up as a holder of it.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(0)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            config,
            readiness: ReadinessPolicy::default(),
            timeouts: RunnerTimeouts::default(),
            http,
            lock: Mutex::new(()),
        }
    }

    pub fn with_readiness_policy(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_timeouts(mut self, timeouts: RunnerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    async fn stage(&self, submission: &Submission<'_>) -> Result<(), ExecutionError> {
        tokio::fs::write(submission.exercise_dir.join(ENTRY_POINT), submission.code()).await?;
        Ok(())
    }

    fn launch_server(&self, dir: &Path) -> Result<BackgroundProcess, ExecutionError> {
        BackgroundProcess::spawn(&self.config.runtime_bin, &[ENTRY_POINT], dir)
    }

    /// Poll the server root until anything answers. A process that exits
    /// early ends the wait.
    async fn wait_until_ready(&self, server: &mut BackgroundProcess) -> bool {
        let url = format!("http://localhost:{}/", self.config.server_port);
        for attempt in 1..=self.readiness.attempts {
            tokio::time::sleep(self.readiness.interval).await;
            if self.http.get(&url).send().await.is_ok() {
                debug!(attempt, "Server answered readiness check");
                return true;
            }
            if server.has_exited() {
                debug!(attempt, "Server process exited before answering");
                return false;
            }
        }
        false
    }

    /// Free the port, stage, launch and wait. On failure the process is already stopped.
    async fn start_server(&self, submission: &Submission<'_>) -> Result<BackgroundProcess, (&'static str, ExecutionError)> {
        free_port(self.config.server_port).await;
        self.stage(submission).await.map_err(|e| ("Server Setup", e))?;

        let mut server = self
            .launch_server(&submission.exercise_dir)
            .map_err(|e| ("Server Setup", e))?;

        if self.wait_until_ready(&mut server).await {
            info!(port = self.config.server_port, "Server started successfully");
            Ok(server)
        } else {
            let output = server.stop().await;
            warn!(port = self.config.server_port, "Server startup timeout");
            Err(("Server Startup", ExecutionError::StartupTimeout(output)))
        }
    }

    async fn run_test_command(&self, dir: &Path, limit: Duration) -> Result<ProcessOutput, ExecutionError> {
        let Some((program, args)) = self.config.test_command.split_first() else {
            return Err(ExecutionError::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty test command"),
            });
        };
        let args = args.iter().map(String::as_str).collect::<Vec<_>>();
        run_foreground(program, &args, dir, limit).await
    }

    async fn run_function(&self, submission: &Submission<'_>) -> RunResult {
        let module_id = submission.module_id();
        let exercise_type = submission.exercise_type;

        if let Err(e) = self.stage(submission).await {
            return RunResult::failed(
                module_id,
                exercise_type,
                "Failed to write code to file",
                e.to_string(),
                submission.elapsed_ms(),
            );
        }

        let outcome = run_foreground(
            &self.config.runtime_bin,
            &[ENTRY_POINT],
            &submission.exercise_dir,
            self.timeouts.run,
        )
        .await;

        match outcome {
            Ok(out) if out.success => RunResult::succeeded(
                module_id,
                exercise_type,
                "Code executed successfully",
                out.output,
                submission.elapsed_ms(),
            ),
            Ok(out) => {
                let error = if out.output.is_empty() {
                    format!("process exited with status {}", out.code.unwrap_or(-1))
                } else {
                    out.output
                };
                RunResult::failed(module_id, exercise_type, "Code execution failed", error, submission.elapsed_ms())
            }
            Err(e) => RunResult::failed(module_id, exercise_type, e.summary(), e.to_string(), submission.elapsed_ms()),
        }
    }

    async fn run_server(&self, submission: &Submission<'_>) -> RunResult {
        let module_id = submission.module_id();
        let exercise_type = submission.exercise_type;

        match self.start_server(submission).await {
            Ok(server) => {
                let output = server.stop().await;
                RunResult::succeeded(
                    module_id,
                    exercise_type,
                    "Server started successfully",
                    output,
                    submission.elapsed_ms(),
                )
            }
            Err((_, e)) => RunResult::failed(module_id, exercise_type, e.summary(), e.to_string(), submission.elapsed_ms()),
        }
    }

    fn normalize(&self, submission: &Submission<'_>, output: &str) -> TestSuiteResult {
        let normalized = normalizer::normalize(
            submission.module_id(),
            submission.exercise_type,
            output,
            submission.elapsed_ms(),
        );
        if normalized.tier != ReportTier::Structured {
            warn!(module_id = submission.module_id(), tier = ?normalized.tier, "Test report was not structured");
        }
        normalized.suite
    }

    async fn test_function(&self, submission: &Submission<'_>) -> TestSuiteResult {
        if let Err(e) = self.stage(submission).await {
            return self.phase_failure(submission, "Function Setup", e);
        }

        match self.run_test_command(&submission.exercise_dir, self.timeouts.function_test).await {
            // Test frameworks exit non-zero on failures; the report decides
            Ok(out) => self.normalize(submission, &out.output),
            Err(e) => self.phase_failure(submission, "Test Execution", e),
        }
    }

    async fn test_server(&self, submission: &Submission<'_>) -> TestSuiteResult {
        let server = match self.start_server(submission).await {
            Ok(server) => server,
            Err((phase, e)) => return self.phase_failure(submission, phase, e),
        };

        let outcome = self
            .run_test_command(&submission.exercise_dir, self.timeouts.server_test)
            .await;
        let server_output = server.stop().await;
        debug!(bytes = server_output.len(), "Server stopped after tests");

        match outcome {
            Ok(out) => self.normalize(submission, &out.output),
            Err(e) => self.phase_failure(submission, "Test Execution", e),
        }
    }

    fn phase_failure(&self, submission: &Submission<'_>, phase: &str, error: ExecutionError) -> TestSuiteResult {
        warn!(module_id = submission.module_id(), phase, error = %error, "Test run failed");
        TestSuiteResult::phase_failure(
            submission.module_id(),
            submission.exercise_type,
            phase,
            error.to_string(),
            submission.elapsed_ms(),
        )
    }
}

#[async_trait]
impl ExecutionStrategy for DirectRunner {
    fn name(&self) -> &'static str {
        "direct"
    }

    #[instrument(skip_all, fields(module_id = %submission.module_id(), exercise_type = %submission.exercise_type))]
    async fn run(&self, submission: &Submission<'_>) -> RunResult {
        let _guard = self.lock.lock().await;
        match submission.exercise_type {
            ExerciseType::Function => self.run_function(submission).await,
            ExerciseType::Server => self.run_server(submission).await,
        }
    }

    #[instrument(skip_all, fields(module_id = %submission.module_id(), exercise_type = %submission.exercise_type))]
    async fn test(&self, submission: &Submission<'_>) -> TestSuiteResult {
        let _guard = self.lock.lock().await;
        match submission.exercise_type {
            ExerciseType::Function => self.test_function(submission).await,
            ExerciseType::Server => self.test_server(submission).await,
        }
    }
}
