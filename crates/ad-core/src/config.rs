use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::RunMode;

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "AD_CONFIG";

/// Top-level configuration loaded from `~/.auto-deliver/config.toml`.
///
/// Secrets never live here: the API key is read from the environment
/// variable named by [`DaemonConfig::api_key_env`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl Config {
    /// Load from `$AD_CONFIG` or `~/.auto-deliver/config.toml`, falling back
    /// to defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that types alone cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        if self.daemon.port == 0 {
            return Err(ConfigError::Validation("daemon.port must be non-zero".into()));
        }
        self.worker.validate()?;
        self.verification.validate()?;
        if self.remote.login_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "remote.login_timeout_secs must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
            if !explicit.is_empty() {
                return PathBuf::from(explicit);
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".auto-deliver")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

fn non_zero(name: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::Validation(format!("{name} must be non-zero")))
    } else {
        Ok(())
    }
}

fn absolute(name: &str, path: &Path) -> Result<(), ConfigError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!(
            "{name} must be an absolute path, got {}",
            path.display()
        )))
    }
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl GeneralConfig {
    pub fn json_logs(&self) -> bool {
        self.log_format == "json"
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.log_format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "general.log_format must be \"pretty\" or \"json\", got {other:?}"
            ))),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Name of the env var holding the API key. Auth is off when it is unset.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key_env: default_api_key_env(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl DaemonConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The API key from the environment, if one is set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    9180
}
fn default_api_key_env() -> String {
    "AD_API_KEY".into()
}
fn default_shutdown_grace_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Executable launched for local runs.
    #[serde(default = "default_worker_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Parent of the per-tenant cookie/session stores.
    #[serde(default = "default_session_root")]
    pub session_root: PathBuf,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    #[serde(default = "default_full_run_timeout_secs")]
    pub full_run_timeout_secs: u64,
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,
    /// How long output capture may keep draining after the worker exits.
    #[serde(default = "default_output_grace_secs")]
    pub output_grace_secs: u64,
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: default_worker_program(),
            args: Vec::new(),
            working_dir: None,
            log_dir: default_log_dir(),
            session_root: default_session_root(),
            memory_limit_mb: default_memory_limit_mb(),
            full_run_timeout_secs: default_full_run_timeout_secs(),
            login_timeout_secs: default_login_timeout_secs(),
            output_grace_secs: default_output_grace_secs(),
            extra_env: BTreeMap::new(),
        }
    }
}

impl WorkerConfig {
    /// Hard timeout for a run of the given mode.
    pub fn timeout_for(&self, mode: RunMode) -> Duration {
        match mode {
            RunMode::LoginOnly => Duration::from_secs(self.login_timeout_secs),
            RunMode::FullRun => Duration::from_secs(self.full_run_timeout_secs),
        }
    }

    pub fn output_grace(&self) -> Duration {
        Duration::from_secs(self.output_grace_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.program.trim().is_empty() {
            return Err(ConfigError::Validation("worker.program must be set".into()));
        }
        non_zero("worker.full_run_timeout_secs", self.full_run_timeout_secs)?;
        non_zero("worker.login_timeout_secs", self.login_timeout_secs)?;
        non_zero("worker.memory_limit_mb", self.memory_limit_mb)?;
        absolute("worker.session_root", &self.session_root)?;
        Ok(())
    }
}

fn default_worker_program() -> String {
    "auto-deliver-worker".into()
}
fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".auto-deliver")
        .join("logs")
}
fn default_session_root() -> PathBuf {
    PathBuf::from("/tmp/auto-deliver/sessions")
}
fn default_memory_limit_mb() -> u64 {
    1024
}
fn default_full_run_timeout_secs() -> u64 {
    60 * 60
}
fn default_login_timeout_secs() -> u64 {
    10 * 60
}
fn default_output_grace_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Transient challenge screenshots; served only from inside this dir.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Upper bound on a single worker long-poll.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    /// How long swept request ids still answer "expired".
    #[serde(default = "default_tombstone_secs")]
    pub tombstone_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            artifact_dir: default_artifact_dir(),
            expiry_secs: default_expiry_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_wait_secs: default_max_wait_secs(),
            tombstone_secs: default_tombstone_secs(),
        }
    }
}

impl VerificationConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }

    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_secs(self.tombstone_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        absolute("verification.artifact_dir", &self.artifact_dir)?;
        non_zero("verification.expiry_secs", self.expiry_secs)?;
        non_zero("verification.sweep_interval_secs", self.sweep_interval_secs)?;
        non_zero("verification.max_wait_secs", self.max_wait_secs)?;
        Ok(())
    }
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("/tmp/auto-deliver/challenges")
}
fn default_expiry_secs() -> u64 {
    5 * 60
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_max_wait_secs() -> u64 {
    5 * 60
}
fn default_tombstone_secs() -> u64 {
    60 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_login_timeout_secs")]
    pub login_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            login_timeout_secs: default_remote_login_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

impl RemoteConfig {
    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }
}

fn default_remote_login_timeout_secs() -> u64 {
    5 * 60
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
