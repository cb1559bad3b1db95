use crate::pidfile::DEFAULT_PID_FILE;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration file for the `railvisor` binary
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// How the upstream process is started and controlled
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// How the upstream is probed before it is considered ready for traffic
    #[serde(default)]
    pub readiness: ReadinessConfig,
}

/// Configuration for a single supervised upstream
///
/// # Security Warning
///
/// `command`, `args` and `launcher` are executed directly. Configuration
/// files must only be writable by the user the supervisor runs as.
#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Command to execute. When unset, `launcher` is used if it exists.
    pub command: Option<String>,

    /// Arguments to pass to `command`
    #[serde(default)]
    pub args: Vec<String>,

    /// Block in `run` until the upstream exits (default: true)
    #[serde(default = "default_synchronous")]
    pub synchronous: bool,

    /// PID file written by the upstream (default: tmp/pids/server.pid)
    pub pid_file: Option<String>,

    /// Working directory for the command; relative paths resolve against it
    pub working_dir: Option<String>,

    /// Environment variables to set on the spawned command
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Port the upstream should listen on, exported as PORT
    pub target_port: Option<u16>,

    /// Wait for the PID file after spawning and look up worker processes
    #[serde(default)]
    pub discover_workers: bool,

    /// Executable probed when no command is given (default: bin/rails)
    #[serde(default = "default_launcher")]
    pub launcher: String,

    /// Arguments for the launcher (default: ["server"])
    #[serde(default = "default_launcher_args")]
    pub launcher_args: Vec<String>,

    /// How long to wait for the PID file after spawning, in milliseconds
    #[serde(default = "default_pid_file_timeout")]
    pub pid_file_timeout_ms: u64,

    /// How often to check for the PID file, in milliseconds
    #[serde(default = "default_pid_file_poll_interval")]
    pub pid_file_poll_interval_ms: u64,

    /// How often to check whether an attached process is still alive, in milliseconds
    #[serde(default = "default_liveness_poll_interval")]
    pub liveness_poll_interval_ms: u64,

    /// How long `stop` waits for the process to exit after SIGTERM, in milliseconds
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            synchronous: default_synchronous(),
            pid_file: None,
            working_dir: None,
            env: HashMap::new(),
            target_port: None,
            discover_workers: false,
            launcher: default_launcher(),
            launcher_args: default_launcher_args(),
            pid_file_timeout_ms: default_pid_file_timeout(),
            pid_file_poll_interval_ms: default_pid_file_poll_interval(),
            liveness_poll_interval_ms: default_liveness_poll_interval(),
            stop_timeout_ms: default_stop_timeout(),
        }
    }
}

impl SupervisorConfig {
    /// Configuration mirroring the classic constructor arguments
    pub fn new(command: &str, args: Vec<String>, synchronous: bool, pid_file: Option<&str>) -> Self {
        Self {
            command: (!command.is_empty()).then(|| command.to_string()),
            args,
            synchronous,
            pid_file: pid_file.map(str::to_string),
            ..Self::default()
        }
    }

    /// Spawn `command` synchronously
    pub fn command(command: &str) -> Self {
        Self::new(command, Vec::new(), true, None)
    }

    /// Supervise whatever process the PID file at `pid_file` names
    pub fn attach(pid_file: &str) -> Self {
        Self {
            pid_file: Some(pid_file.to_string()),
            ..Self::default()
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the PID file path (builder pattern)
    pub fn with_pid_file(mut self, path: &str) -> Self {
        self.pid_file = Some(path.to_string());
        self
    }

    /// Set synchronous mode (builder pattern)
    pub fn with_synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    /// Set working directory (builder pattern)
    pub fn with_working_dir(mut self, dir: &str) -> Self {
        self.working_dir = Some(dir.to_string());
        self
    }

    /// Set the target port (builder pattern)
    pub fn with_target_port(mut self, port: u16) -> Self {
        self.target_port = Some(port);
        self
    }

    /// Enable worker discovery (builder pattern)
    pub fn with_worker_discovery(mut self, enabled: bool) -> Self {
        self.discover_workers = enabled;
        self
    }

    /// Resolve `path` against the working directory when it is relative
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match &self.working_dir {
            Some(dir) if path.is_relative() => Path::new(dir).join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Effective PID file location
    pub fn pid_file_path(&self) -> PathBuf {
        let pid_file = self
            .pid_file
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_PID_FILE);
        self.resolve_path(pid_file)
    }

    /// Effective launcher location
    pub fn launcher_path(&self) -> PathBuf {
        self.resolve_path(&self.launcher)
    }

    pub fn pid_file_timeout(&self) -> Duration {
        Duration::from_millis(self.pid_file_timeout_ms)
    }

    pub fn pid_file_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pid_file_poll_interval_ms)
    }

    pub fn liveness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Validate the supervisor configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.pid_file_poll_interval_ms == 0 {
            return Err("'pid_file_poll_interval_ms' must be greater than 0".to_string());
        }
        if self.liveness_poll_interval_ms == 0 {
            return Err("'liveness_poll_interval_ms' must be greater than 0".to_string());
        }
        if self.target_port == Some(0) {
            return Err("'target_port' must be greater than 0".to_string());
        }
        if self.launcher.is_empty() {
            return Err("'launcher' must not be empty".to_string());
        }
        Ok(())
    }
}

/// Readiness probing of the upstream's target port
#[derive(Debug, Deserialize, Clone)]
pub struct ReadinessConfig {
    /// HTTP path that must answer 2xx; plain TCP connect when unset
    pub health_path: Option<String>,

    /// Delay between probes in milliseconds
    #[serde(default = "default_readiness_interval")]
    pub interval_ms: u64,

    /// Give up after this many seconds
    #[serde(default = "default_readiness_timeout")]
    pub timeout_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            health_path: None,
            interval_ms: default_readiness_interval(),
            timeout_secs: default_readiness_timeout(),
        }
    }
}

impl ReadinessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// Default value functions
fn default_synchronous() -> bool {
    true
}

fn default_launcher() -> String {
    "bin/rails".to_string()
}

fn default_launcher_args() -> Vec<String> {
    vec!["server".to_string()]
}

fn default_pid_file_timeout() -> u64 {
    20_000 // Rails boot can take a while before the PID file appears
}

fn default_pid_file_poll_interval() -> u64 {
    1000
}

fn default_liveness_poll_interval() -> u64 {
    500
}

fn default_stop_timeout() -> u64 {
    5000
}

fn default_readiness_interval() -> u64 {
    100
}

fn default_readiness_timeout() -> u64 {
    30
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.supervisor.validate() {
            errors.push(format!("supervisor: {}", e));
        }
        if self.readiness.interval_ms == 0 {
            errors.push("readiness: 'interval_ms' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[supervisor]
command = "bundle"
args = ["exec", "puma", "-C", "config/puma.rb"]
pid_file = "tmp/pids/puma.pid"
working_dir = "/srv/app"
target_port = 3000
discover_workers = true
stop_timeout_ms = 10000

[supervisor.env]
RAILS_ENV = "production"

[readiness]
health_path = "/up"
timeout_secs = 60
"#;

        let config: Config = toml::from_str(toml).unwrap();
        let sup = &config.supervisor;
        assert_eq!(sup.command.as_deref(), Some("bundle"));
        assert_eq!(sup.args.len(), 4);
        assert!(sup.synchronous);
        assert!(sup.discover_workers);
        assert_eq!(sup.target_port, Some(3000));
        assert_eq!(sup.env.get("RAILS_ENV").map(String::as_str), Some("production"));
        assert_eq!(sup.stop_timeout(), Duration::from_secs(10));
        assert_eq!(sup.pid_file_path(), PathBuf::from("/srv/app/tmp/pids/puma.pid"));
        assert_eq!(config.readiness.health_path.as_deref(), Some("/up"));
        assert_eq!(config.readiness.timeout(), Duration::from_secs(60));
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.supervisor.command.is_none());
        assert_eq!(config.readiness.interval(), Duration::from_millis(100));
        config.validate().unwrap();
    }

    #[test]
    fn test_default_supervisor_config() {
        let config = SupervisorConfig::default();
        assert!(config.synchronous);
        assert!(!config.discover_workers);
        assert_eq!(config.launcher, "bin/rails");
        assert_eq!(config.launcher_args, vec!["server".to_string()]);
        assert_eq!(config.pid_file_path(), PathBuf::from("tmp/pids/server.pid"));
        assert_eq!(config.pid_file_timeout(), Duration::from_secs(20));
        assert_eq!(config.pid_file_poll_interval(), Duration::from_secs(1));
        assert_eq!(config.liveness_poll_interval(), Duration::from_millis(500));
        assert_eq!(config.stop_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_new_treats_empty_command_as_absent() {
        let config = SupervisorConfig::new("", Vec::new(), false, Some(""));
        assert!(config.command.is_none());
        assert!(!config.synchronous);
        // Empty PID file path falls back to the default
        assert_eq!(config.pid_file_path(), PathBuf::from(DEFAULT_PID_FILE));

        let config = SupervisorConfig::new("sleep", vec!["1".to_string()], true, Some("/run/app.pid"));
        assert_eq!(config.command.as_deref(), Some("sleep"));
        assert_eq!(config.pid_file_path(), PathBuf::from("/run/app.pid"));
    }

    #[test]
    fn test_resolve_path_respects_absolute_paths() {
        let config = SupervisorConfig::attach("/var/run/app.pid").with_working_dir("/srv/app");
        assert_eq!(config.pid_file_path(), PathBuf::from("/var/run/app.pid"));
        assert_eq!(config.launcher_path(), PathBuf::from("/srv/app/bin/rails"));
    }

    #[test]
    fn test_builder_helpers() {
        let config = SupervisorConfig::command("bin/dev")
            .with_args(vec!["web".to_string()])
            .with_synchronous(false)
            .with_pid_file("pids/web.pid")
            .with_target_port(4000)
            .with_worker_discovery(true);

        assert_eq!(config.command.as_deref(), Some("bin/dev"));
        assert_eq!(config.args, vec!["web".to_string()]);
        assert!(!config.synchronous);
        assert_eq!(config.target_port, Some(4000));
        assert!(config.discover_workers);
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config = SupervisorConfig::default();
        config.pid_file_poll_interval_ms = 0;
        assert!(config.validate().unwrap_err().contains("pid_file_poll_interval_ms"));

        let config = SupervisorConfig::default().with_target_port(0);
        assert!(config.validate().unwrap_err().contains("target_port"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[supervisor]
liveness_poll_interval_ms = 0

[readiness]
interval_ms = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("liveness_poll_interval_ms"));
        assert!(err.contains("readiness"));
    }
}
