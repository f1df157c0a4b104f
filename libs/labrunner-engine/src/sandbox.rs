/// Isolated Sandbox Manager
///
/// Runs a submission inside a throwaway container built from the exercise tree.
///
/// **Per-request lifecycle:**
/// `ImageBuilding → ContainerCreated → CodeInjected → Running → Completed|Failed → Removed`
///
/// **Container rules:**
/// 1. Image built from the deterministic build context, bounded by `BUILD_TIMEOUT`
/// 2. Fixed working dir and non-root user, network per config
/// 3. Memory limit with swap pinned to it (test runs get twice the memory)
/// 4. CPU quota/period from config
/// 5. Submission uploaded as a single-file archive, independent of the image layout
/// 6. Wait bounded by the request deadline
/// 7. Forced removal on every exit path; removal failures are only logged
///
/// Holds no per-request state: containers are uniquely named and owned by the
/// call that created them.
use crate::build_context::{self, single_file_archive};
use crate::error::ExecutionError;
use crate::normalizer::{self, ReportTier};
use crate::strategy::{ExecutionStrategy, Submission};
use crate::ENTRY_POINT;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::image::BuildImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use bollard::Docker;
use futures_util::stream::StreamExt;
use labrunner_common::config::{EngineConfig, SandboxConfig};
use labrunner_common::types::{ExerciseType, RunResult, TestSuiteResult};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Ceiling for image builds, independent of the execution timeout.
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const WORKDIR: &str = "/app";
const SANDBOX_USER: &str = "1001:1001";
const SERVER_WARM_UP_SECS: u64 = 3;
const TEST_SCRIPT: &str = "npm run --silent test -- --reporter json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Run,
    Test,
}

impl RunMode {
    fn label(self) -> &'static str {
        match self {
            RunMode::Run => "run",
            RunMode::Test => "test",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    ImageBuilding,
    ContainerCreated,
    CodeInjected,
    Running,
    Completed,
    Failed,
    Removed,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxState::ImageBuilding => "image_building",
            SandboxState::ContainerCreated => "container_created",
            SandboxState::CodeInjected => "code_injected",
            SandboxState::Running => "running",
            SandboxState::Completed => "completed",
            SandboxState::Failed => "failed",
            SandboxState::Removed => "removed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
}

impl ResourceLimits {
    /// Test runs also host the test framework, so they get double the memory.
    pub fn for_mode(config: &SandboxConfig, mode: RunMode) -> Self {
        let factor = match mode {
            RunMode::Run => 1,
            RunMode::Test => 2,
        };
        Self {
            memory_bytes: config.memory_limit * factor,
            cpu_quota: config.cpu_quota,
            cpu_period: config.cpu_period,
        }
    }
}

/// What a finished container left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerOutcome {
    pub exit_code: i64,
    /// Combined stdout + stderr, trimmed
    pub output: String,
}

/// A created container. Removal is explicit through `remove`; if the owning
/// future is dropped first, `Drop` schedules a forced removal instead.
pub struct SandboxInstance {
    docker: Docker,
    pub id: String,
    pub name: String,
    pub image: String,
    pub limits: ResourceLimits,
    state: SandboxState,
}

impl SandboxInstance {
    pub fn state(&self) -> SandboxState {
        self.state
    }

    fn transition(&mut self, next: SandboxState) {
        debug!(container = %self.name, from = %self.state, to = %next, "Sandbox state change");
        self.state = next;
    }

    /// Force-remove the container. Never fails; problems are logged.
    pub async fn remove(mut self) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(&self.id, Some(options)).await {
            warn!(container = %self.name, error = %e, "Failed to remove container");
        }
        self.transition(SandboxState::Removed);
    }
}

impl Drop for SandboxInstance {
    fn drop(&mut self) {
        if self.state == SandboxState::Removed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container = %self.name, "No runtime available to remove container");
            return;
        };

        let docker = self.docker.clone();
        let id = self.id.clone();
        let name = self.name.clone();
        handle.spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&id, Some(options)).await {
                warn!(container = %name, error = %e, "Failed to clean up abandoned container");
            }
        });
    }
}

pub struct SandboxManager {
    docker: Docker,
    config: SandboxConfig,
    recipe_path: PathBuf,
    server_port: u16,
}

impl SandboxManager {
    /// Connect to the local container engine and make sure it answers.
    pub async fn connect(config: SandboxConfig, engine: &EngineConfig) -> Result<Self, bollard::errors::Error> {
        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;
        Ok(Self {
            docker,
            config,
            recipe_path: engine.recipe_path.clone(),
            server_port: engine.server_port,
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Per-module image tag; identical contexts hit the engine's build cache.
    pub fn image_tag(module_id: &str, mode: RunMode) -> String {
        format!("labrunner-{}:{}", mode.label(), module_id)
    }

    /// Unique per request, down to the nanosecond.
    pub fn container_name(module_id: &str, mode: RunMode) -> String {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        format!("labrunner-{}-{}-{}", mode.label(), module_id, nanos)
    }

    /// Entry command of the container.
    pub fn command(mode: RunMode, exercise_type: ExerciseType) -> Vec<String> {
        match (mode, exercise_type) {
            (RunMode::Run, _) => vec!["node".to_string(), ENTRY_POINT.to_string()],
            (RunMode::Test, ExerciseType::Function) => {
                vec!["sh".to_string(), "-c".to_string(), TEST_SCRIPT.to_string()]
            }
            (RunMode::Test, ExerciseType::Server) => vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "node {} > /dev/null 2>&1 & SERVER_PID=$!; sleep {}; {}; kill $SERVER_PID 2>/dev/null || true",
                    ENTRY_POINT, SERVER_WARM_UP_SECS, TEST_SCRIPT
                ),
            ],
        }
    }

    pub fn container_config(
        &self,
        image: &str,
        mode: RunMode,
        exercise_type: ExerciseType,
    ) -> Config<String> {
        let limits = ResourceLimits::for_mode(&self.config, mode);
        let cmd = Self::command(mode, exercise_type);
        build_container_config(&self.config, image, limits, cmd, self.server_port)
    }

    /// Deadline for waiting on the container.
    pub fn deadline(&self, mode: RunMode) -> Duration {
        let secs = match mode {
            RunMode::Run => self.config.execution_timeout_secs,
            RunMode::Test => self.config.execution_timeout_secs * 2,
        };
        Duration::from_secs(secs)
    }

    /// Build `tag` from the exercise directory. The build stream is drained on
    /// its own task and raced against `BUILD_TIMEOUT`.
    #[instrument(skip(self, exercise_dir), fields(tag = %tag))]
    pub async fn build_image(&self, exercise_dir: &Path, tag: &str) -> Result<(), ExecutionError> {
        debug!(state = %SandboxState::ImageBuilding, "Building module image");

        let dir = exercise_dir.to_path_buf();
        let recipe = self.recipe_path.clone();
        let context = tokio::task::spawn_blocking(move || build_context::assemble(&dir, &recipe))
            .await
            .map_err(|e| ExecutionError::ContextAssembly(e.to_string()))??;

        let options = BuildImageOptions {
            dockerfile: build_context::RECIPE_NAME.to_string(),
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };

        let docker = self.docker.clone();
        let mut drain = tokio::spawn(async move {
            let mut stream = Box::pin(docker.build_image(options, None, Some(context.archive.into())));
            while let Some(item) = stream.next().await {
                let info = item.map_err(|e| ExecutionError::BuildFailure(e.to_string()))?;
                if let Some(error) = info.error {
                    return Err(ExecutionError::BuildFailure(error));
                }
                if let Some(line) = info.stream {
                    let line = line.trim();
                    if !line.is_empty() {
                        debug!(build = line);
                    }
                }
            }
            Ok(())
        });

        tokio::select! {
            joined = &mut drain => {
                joined.map_err(|e| ExecutionError::BuildFailure(format!("build task failed: {}", e)))??;
                info!("Module image ready");
                Ok(())
            }
            _ = tokio::time::sleep(BUILD_TIMEOUT) => {
                drain.abort();
                warn!(timeout_secs = BUILD_TIMEOUT.as_secs(), "Image build timed out");
                Err(ExecutionError::BuildTimeout(BUILD_TIMEOUT.as_secs()))
            }
        }
    }

    async fn create(
        &self,
        submission: &Submission<'_>,
        image: &str,
        mode: RunMode,
    ) -> Result<SandboxInstance, ExecutionError> {
        let name = Self::container_name(submission.module_id(), mode);
        let config = self.container_config(image, mode, submission.exercise_type);

        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| ExecutionError::CreationFailure(e.to_string()))?;

        let mut instance = SandboxInstance {
            docker: self.docker.clone(),
            id: response.id,
            name,
            image: image.to_string(),
            limits: ResourceLimits::for_mode(&self.config, mode),
            state: SandboxState::ImageBuilding,
        };
        instance.transition(SandboxState::ContainerCreated);
        Ok(instance)
    }

    async fn inject(&self, instance: &mut SandboxInstance, code: &str) -> Result<(), ExecutionError> {
        let archive = single_file_archive(ENTRY_POINT, code.as_bytes())
            .map_err(|e| ExecutionError::InjectionFailure(e.to_string()))?;
        let options = UploadToContainerOptions {
            path: WORKDIR,
            ..Default::default()
        };
        self.docker
            .upload_to_container(&instance.id, Some(options), archive.into())
            .await
            .map_err(|e| ExecutionError::InjectionFailure(e.to_string()))?;
        instance.transition(SandboxState::CodeInjected);
        Ok(())
    }

    async fn start_and_wait(
        &self,
        instance: &mut SandboxInstance,
        deadline: Duration,
    ) -> Result<ContainerOutcome, ExecutionError> {
        self.docker
            .start_container(&instance.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ExecutionError::StartFailure(e.to_string()))?;
        instance.transition(SandboxState::Running);

        match self.docker.inspect_container(&instance.id, None::<InspectContainerOptions>).await {
            Ok(inspect) => {
                let state = inspect.state.unwrap_or_default();
                let running = state.running.unwrap_or(false);
                // A short script may already have finished; only other states are failures.
                let finished = state.status == Some(ContainerStateStatusEnum::EXITED)
                    && state.error.as_deref().unwrap_or_default().is_empty();
                if !running && !finished {
                    return Err(ExecutionError::NotRunning {
                        state: state.status.map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string()),
                        error: state.error.unwrap_or_default(),
                    });
                }
            }
            Err(e) => warn!(container = %instance.name, error = %e, "Failed to inspect container"),
        }

        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait_stream = self.docker.wait_container(&instance.id, Some(wait_options));

        let exit_code = tokio::select! {
            next = wait_stream.next() => match next {
                Some(Ok(response)) => response.status_code,
                // Non-zero exits arrive as errors; they are still completions
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
                Some(Err(e)) => return Err(ExecutionError::WaitError(e.to_string())),
                None => return Err(ExecutionError::WaitError("wait stream ended without a status".to_string())),
            },
            _ = tokio::time::sleep(deadline) => {
                warn!(container = %instance.name, timeout_secs = deadline.as_secs(), "Container wait timed out");
                return Err(ExecutionError::RunTimeout(deadline.as_secs()));
            }
        };

        let output = self.collect_logs(&instance.id).await?;
        debug!(container = %instance.name, exit_code, "Container finished");

        Ok(ContainerOutcome { exit_code, output })
    }

    async fn collect_logs(&self, container_id: &str) -> Result<String, ExecutionError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut logs = self.docker.logs(container_id, Some(options));

        let mut combined = String::new();
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    combined.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdIn { .. }) => {}
                Err(e) => return Err(ExecutionError::LogRetrievalFailure(e.to_string())),
            }
        }

        Ok(combined.trim().to_string())
    }

    /// Full pipeline for one submission. The container, once created, is
    /// removed before this returns whatever happens in between.
    #[instrument(
        skip(self, submission),
        fields(
            request_id = %submission.request.request_id,
            module_id = %submission.module_id(),
            mode = mode.label()
        )
    )]
    pub async fn execute(
        &self,
        submission: &Submission<'_>,
        mode: RunMode,
    ) -> Result<ContainerOutcome, ExecutionError> {
        if !submission.exercise_dir.is_dir() {
            return Err(ExecutionError::NotFound(submission.module_id().to_string()));
        }

        let image = Self::image_tag(submission.module_id(), mode);
        self.build_image(&submission.exercise_dir, &image).await?;

        let mut instance = self.create(submission, &image, mode).await?;

        if let Err(e) = self.inject(&mut instance, submission.code()).await {
            instance.transition(SandboxState::Failed);
            instance.remove().await;
            return Err(e);
        }

        let outcome = self.start_and_wait(&mut instance, self.deadline(mode)).await;
        instance.transition(match outcome {
            Ok(_) => SandboxState::Completed,
            Err(_) => SandboxState::Failed,
        });
        instance.remove().await;

        outcome
    }
}

fn build_container_config(
    config: &SandboxConfig,
    image: &str,
    limits: ResourceLimits,
    cmd: Vec<String>,
    server_port: u16,
) -> Config<String> {
    Config {
        image: Some(image.to_string()),
        cmd: Some(cmd),
        env: Some(vec![format!("PORT={}", server_port)]),
        working_dir: Some(WORKDIR.to_string()),
        user: Some(SANDBOX_USER.to_string()),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        network_disabled: Some(config.network_disabled),
        host_config: Some(HostConfig {
            memory: Some(limits.memory_bytes),
            memory_swap: Some(limits.memory_bytes),
            cpu_quota: Some(limits.cpu_quota),
            cpu_period: Some(limits.cpu_period),
            readonly_rootfs: Some(config.read_only_root_fs),
            auto_remove: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn describe_exit(outcome: &ContainerOutcome) -> String {
    let mut error = if outcome.output.is_empty() {
        format!("process exited with status {}", outcome.exit_code)
    } else {
        outcome.output.clone()
    };
    match outcome.exit_code {
        137 => error.push_str("\n[Container killed: likely OOM or exceeded memory limit]"),
        139 => error.push_str("\n[Container killed: segmentation fault]"),
        _ => {}
    }
    error
}

#[async_trait]
impl ExecutionStrategy for SandboxManager {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    async fn run(&self, submission: &Submission<'_>) -> RunResult {
        let module_id = submission.module_id();
        let exercise_type = submission.exercise_type;

        match self.execute(submission, RunMode::Run).await {
            Ok(outcome) if outcome.exit_code == 0 => RunResult::succeeded(
                module_id,
                exercise_type,
                "Code executed successfully",
                outcome.output,
                submission.elapsed_ms(),
            ),
            Ok(outcome) => RunResult::failed(
                module_id,
                exercise_type,
                "Code execution failed",
                describe_exit(&outcome),
                submission.elapsed_ms(),
            ),
            Err(e) => {
                warn!(module_id, error = %e, "Sandbox run failed");
                RunResult::failed(module_id, exercise_type, e.summary(), e.to_string(), submission.elapsed_ms())
            }
        }
    }

    async fn test(&self, submission: &Submission<'_>) -> TestSuiteResult {
        let module_id = submission.module_id();
        let exercise_type = submission.exercise_type;

        match self.execute(submission, RunMode::Test).await {
            // The test framework exits non-zero on failing tests; only the report matters
            Ok(outcome) => {
                let normalized =
                    normalizer::normalize(module_id, exercise_type, &outcome.output, submission.elapsed_ms());
                if normalized.tier != ReportTier::Structured {
                    warn!(module_id, tier = ?normalized.tier, "Test report was not structured");
                }
                normalized.suite
            }
            Err(e) => {
                warn!(module_id, error = %e, "Sandbox test run failed");
                TestSuiteResult::phase_failure(
                    module_id,
                    exercise_type,
                    e.phase(),
                    e.to_string(),
                    submission.elapsed_ms(),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_double_for_tests() {
        let config = SandboxConfig::default();
        let run = ResourceLimits::for_mode(&config, RunMode::Run);
        let test = ResourceLimits::for_mode(&config, RunMode::Test);

        assert_eq!(run.memory_bytes, 128 * 1024 * 1024);
        assert_eq!(test.memory_bytes, 256 * 1024 * 1024);
        assert_eq!(test.cpu_quota, run.cpu_quota);
        assert_eq!(run.cpu_period, 100_000);
    }

    #[test]
    fn test_container_config_policy() {
        let config = SandboxConfig::default();
        let limits = ResourceLimits::for_mode(&config, RunMode::Test);
        let container = build_container_config(&config, "labrunner-test:module-4", limits, vec![], 4100);
        let host = container.host_config.unwrap();

        assert_eq!(container.env, Some(vec!["PORT=4100".to_string()]));

        assert_eq!(container.working_dir.as_deref(), Some("/app"));
        assert_eq!(container.user.as_deref(), Some("1001:1001"));
        assert_eq!(container.network_disabled, Some(true));
        assert_eq!(host.memory, host.memory_swap);
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.cpu_quota, Some(50_000));
        assert_eq!(host.cpu_period, Some(100_000));
        assert_eq!(host.auto_remove, Some(false));
        assert_eq!(host.readonly_rootfs, Some(false));
    }

    #[test]
    fn test_names_and_tags() {
        assert_eq!(SandboxManager::image_tag("module-3", RunMode::Run), "labrunner-run:module-3");
        assert_eq!(SandboxManager::image_tag("module-3", RunMode::Test), "labrunner-test:module-3");

        let name = SandboxManager::container_name("module-3", RunMode::Test);
        assert!(name.starts_with("labrunner-test-module-3-"));
        let first_suffix: i64 = name.rsplit('-').next().unwrap().parse().unwrap();
        assert!(first_suffix > 0);
    }

    #[test]
    fn test_commands() {
        assert_eq!(
            SandboxManager::command(RunMode::Run, ExerciseType::Server),
            vec!["node", ENTRY_POINT]
        );

        let function_test = SandboxManager::command(RunMode::Test, ExerciseType::Function);
        assert!(!function_test[2].contains("SERVER_PID"));
        assert!(function_test[2].contains("--reporter json"));

        let server_test = SandboxManager::command(RunMode::Test, ExerciseType::Server);
        let script = &server_test[2];
        assert!(script.starts_with("node tmp-server.js"));
        assert!(script.contains("sleep 3"));
        assert!(script.ends_with("kill $SERVER_PID 2>/dev/null || true"));
    }

    #[test]
    fn test_describe_exit() {
        let oom = ContainerOutcome {
            exit_code: 137,
            output: "partial".to_string(),
        };
        assert!(describe_exit(&oom).starts_with("partial"));
        assert!(describe_exit(&oom).contains("OOM"));

        let silent = ContainerOutcome {
            exit_code: 1,
            output: String::new(),
        };
        assert_eq!(describe_exit(&silent), "process exited with status 1");
    }
}
