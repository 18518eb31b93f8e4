use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config location, relative to the daemon's working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/global.toml";

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GlobalConfig {
    pub ipc_listen: String,
    /// Holds the SQLite job database.
    pub data_dir: PathBuf,
    /// Root of per-owner job workspaces.
    pub projects_dir: PathBuf,
    pub supervisor: SupervisorConfig,
    pub backend: BackendConfig,
    pub dependencies: DependencyConfig,
    pub reaper: ReaperConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Global slot ceiling.
    pub max_concurrent: usize,
    pub log_cap_chars: usize,
    /// Tail length returned by `read_logs`.
    pub log_read_chars: usize,
    pub grace_period_ms: u64,
    pub restart_backoff_ms: u64,
    pub recovery_policy: RecoveryPolicy,
    /// Archive entry files tried in order before walking the tree.
    pub entry_candidates: Vec<String>,
    pub script_extension: String,
}

/// What recovery does with a job persisted as running.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPolicy {
    /// Re-attach to a still-alive execution; otherwise respawn if
    /// `auto_restart` is set.
    Reattach,
    /// Always discard the old execution; respawn if `auto_restart` is set.
    Respawn,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Native,
    Docker,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    pub docker_binary: String,
    pub docker_image: String,
    /// Poll interval for executions re-attached after a supervisor restart.
    pub liveness_poll_ms: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DependencyConfig {
    /// Program and leading arguments; package names are appended.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub install_on_start: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ReaperConfig {
    pub enabled: bool,
    pub max_idle_days: u64,
    pub interval_hours: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            ipc_listen: "127.0.0.1:57480".to_string(),
            data_dir: PathBuf::from("./data"),
            projects_dir: PathBuf::from("./projects"),
            supervisor: SupervisorConfig::default(),
            backend: BackendConfig::default(),
            dependencies: DependencyConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            log_cap_chars: 10_000,
            log_read_chars: 4_000,
            grace_period_ms: 5_000,
            restart_backoff_ms: 5_000,
            recovery_policy: RecoveryPolicy::Reattach,
            entry_candidates: vec!["main.py".into(), "app.py".into(), "bot.py".into()],
            script_extension: "py".to_string(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Native,
            interpreter: "python".to_string(),
            interpreter_args: Vec::new(),
            docker_binary: "docker".to_string(),
            docker_image: "python:3.12-slim".to_string(),
            liveness_poll_ms: 1_000,
        }
    }
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "python".into(),
                "-m".into(),
                "pip".into(),
                "install".into(),
                "--user".into(),
            ],
            timeout_secs: 120,
            install_on_start: true,
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_idle_days: 30,
            interval_hours: 24,
        }
    }
}

impl GlobalConfig {
    /// Load from `CODEHOST_CONFIG` or `config/global.toml`.
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CODEHOST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)?;
        Self::from_toml(&s)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))
    }

    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("codehost.db")
    }
}

impl SupervisorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }
}

impl DependencyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ReaperConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_days * 24 * 60 * 60)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours * 60 * 60)
    }
}
