use crate::CoreError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory that tasks register with once they are initialized.
/// Registration is the only readiness signal the supervisor uses.
pub trait ReadinessDirectory: Send + Sync {
    fn connect(&self) -> Result<(), CoreError>;

    fn is_registered(&self, task_name: &str) -> bool;
}

/// Readiness directory backed by marker files: a task is registered once a
/// file named after it exists under `root`. Slashes in task names map to `_`.
#[derive(Debug, Clone)]
pub struct MarkerDirectory {
    root: PathBuf,
}

impl MarkerDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn marker_path(&self, task_name: &str) -> PathBuf {
        self.root.join(task_name.replace('/', "_"))
    }

    pub fn register(&self, task_name: &str) -> Result<(), CoreError> {
        std::fs::write(self.marker_path(task_name), b"")?;
        Ok(())
    }

    pub fn unregister(&self, task_name: &str) -> Result<(), CoreError> {
        match std::fs::remove_file(self.marker_path(task_name)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

impl ReadinessDirectory for MarkerDirectory {
    fn connect(&self) -> Result<(), CoreError> {
        std::fs::create_dir_all(&self.root).map_err(|e| {
            CoreError::Connect(format!(
                "cannot create registry directory {}: {e}",
                self.root.display()
            ))
        })?;
        debug!("using readiness directory {}", self.root.display());
        Ok(())
    }

    fn is_registered(&self, task_name: &str) -> bool {
        self.marker_path(task_name).exists()
    }
}
