use crate::CoreError;
use overseer_runtime::WaitBudget;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Supervisor tuning, read from `~/.config/overseer/overseer.toml`.
/// Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Liveness polls per wait before a deployment counts as stuck.
    pub wait_cycles: u32,
    pub wait_interval_ms: u64,
    pub ready_poll_interval_ms: u64,
    /// Readiness timeout used when the caller does not pass one.
    pub ready_timeout_ms: u64,
    /// Root of the marker-file readiness directory.
    pub registry_dir: PathBuf,
    /// Log directory for redirected output. Unset means "ask the bundle".
    pub log_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let budget = WaitBudget::default();
        Self {
            wait_cycles: budget.cycles,
            wait_interval_ms: budget.interval.as_millis() as u64,
            ready_poll_interval_ms: 10,
            ready_timeout_ms: 30_000,
            registry_dir: default_registry_dir(),
            log_dir: None,
        }
    }
}

impl SupervisorConfig {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load the default config file if it exists, otherwise use defaults.
    pub fn load_default() -> Result<Self, CoreError> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn parse(content: &str) -> Result<Self, CoreError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CoreError::Config(format!("invalid supervisor config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, CoreError> {
        toml::to_string_pretty(self)
            .map_err(|e| CoreError::Config(format!("could not serialize config: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.wait_cycles == 0 {
            return Err(CoreError::Config("wait_cycles must be greater than 0".to_owned()));
        }
        if self.wait_interval_ms == 0 {
            return Err(CoreError::Config(
                "wait_interval_ms must be greater than 0".to_owned(),
            ));
        }
        if self.ready_poll_interval_ms == 0 {
            return Err(CoreError::Config(
                "ready_poll_interval_ms must be greater than 0".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn wait_budget(&self) -> WaitBudget {
        WaitBudget::new(self.wait_cycles, Duration::from_millis(self.wait_interval_ms))
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".config/overseer/overseer.toml"))
}

fn default_registry_dir() -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime) if !runtime.is_empty() => PathBuf::from(runtime).join("overseer/registry"),
        _ => PathBuf::from("/tmp/overseer/registry"),
    }
}
