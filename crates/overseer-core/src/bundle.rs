use crate::CoreError;
use std::path::PathBuf;

/// Source of the directory redirected deployment output is written to.
pub trait Bundle: Send + Sync {
    fn log_directory(&self) -> Result<PathBuf, CoreError>;
}

/// Bundle with an explicit log directory. The directory is used as is.
#[derive(Debug, Clone)]
pub struct FixedBundle {
    log_dir: PathBuf,
}

impl FixedBundle {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }
}

impl Bundle for FixedBundle {
    fn log_directory(&self) -> Result<PathBuf, CoreError> {
        Ok(self.log_dir.clone())
    }
}

/// Bundle that takes its log directory from `OVERSEER_LOG_DIR`, falling back
/// to `~/.local/share/overseer/logs`. The directory is created on request.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvBundle;

pub const LOG_DIR_ENV: &str = "OVERSEER_LOG_DIR";

impl Bundle for EnvBundle {
    fn log_directory(&self) -> Result<PathBuf, CoreError> {
        let dir = match std::env::var(LOG_DIR_ENV) {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => default_log_root(),
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

fn default_log_root() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local/share/overseer/logs")
    } else {
        PathBuf::from("/tmp/overseer/logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_bundle_returns_its_path() {
        let bundle = FixedBundle::new("/var/log/overseer");
        assert_eq!(
            bundle.log_directory().unwrap(),
            PathBuf::from("/var/log/overseer")
        );
    }

    #[test]
    fn default_log_root_is_absolute() {
        assert!(default_log_root().is_absolute());
    }
}
