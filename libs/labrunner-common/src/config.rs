// Environment-sourced configuration, read once at boot.
use std::path::PathBuf;
use std::str::FromStr;

/// Fixed local port HTTP-serving exercises bind to.
pub const DEFAULT_SERVER_PORT: u16 = 3000;

/// Read `key` and parse it, falling back to `default` when unset or unparseable.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

/// Boolean variant accepting the usual spellings (`1`, `true`, `yes`, `on`, ...).
pub fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => parse_flag(&value).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Some(true),
        "0" | "f" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Container limits and policy for the isolated sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    pub enabled: bool,
    /// Memory ceiling for plain runs, in bytes. Test runs get twice this.
    pub memory_limit: i64,
    /// CPU quota per `cpu_period` microseconds.
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub execution_timeout_secs: u64,
    pub network_disabled: bool,
    pub read_only_root_fs: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_limit: 128 * 1024 * 1024,
            cpu_quota: 50_000,
            cpu_period: 100_000,
            execution_timeout_secs: 30,
            network_disabled: true,
            read_only_root_fs: false,
        }
    }
}

impl SandboxConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_flag("DOCKER_ENABLED", defaults.enabled),
            memory_limit: env_or("DOCKER_MEMORY_LIMIT", defaults.memory_limit),
            cpu_quota: env_or("DOCKER_CPU_LIMIT", defaults.cpu_quota),
            cpu_period: defaults.cpu_period,
            execution_timeout_secs: env_or("DOCKER_EXECUTION_TIMEOUT", defaults.execution_timeout_secs),
            network_disabled: env_flag("DOCKER_NETWORK_DISABLED", defaults.network_disabled),
            read_only_root_fs: env_flag("DOCKER_READONLY_ROOTFS", defaults.read_only_root_fs),
        }
    }
}

/// Where exercises live and how submissions are launched.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub modules_path: PathBuf,
    /// Shared build recipe, stored as `Dockerfile` in every build context.
    pub recipe_path: PathBuf,
    /// Module ids treated as one-shot function exercises.
    pub function_modules: Vec<String>,
    /// Interpreter used by the direct process runner.
    pub runtime_bin: String,
    /// Test framework invocation used by the direct process runner.
    pub test_command: Vec<String>,
    pub server_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            modules_path: PathBuf::from("modules"),
            recipe_path: PathBuf::from("Dockerfile.module-runner"),
            function_modules: vec!["module-1".to_string()],
            runtime_bin: "node".to_string(),
            test_command: ["npx", "mocha", "test.js", "--reporter", "json"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            server_port: DEFAULT_SERVER_PORT,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let function_modules = std::env::var("FUNCTION_MODULES")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or(defaults.function_modules);

        let test_command = std::env::var("TEST_COMMAND")
            .ok()
            .map(|raw| raw.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|cmd| !cmd.is_empty())
            .unwrap_or(defaults.test_command);

        Self {
            modules_path: std::env::var("MODULES_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.modules_path),
            recipe_path: std::env::var("MODULE_RUNNER_DOCKERFILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.recipe_path),
            function_modules,
            runtime_bin: std::env::var("RUNTIME_BIN").unwrap_or(defaults.runtime_bin),
            test_command,
            server_port: env_or("SERVER_PORT", defaults.server_port),
        }
    }

    pub fn is_function_module(&self, module_id: &str) -> bool {
        self.function_modules.iter().any(|id| id == module_id)
    }
}
