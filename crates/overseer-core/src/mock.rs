//! In-memory readiness directories for tests and dry runs.

use crate::readiness::ReadinessDirectory;
use crate::CoreError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Readiness directory driven by a fixed script: each known task registers a
/// set delay after the directory was created. Unknown tasks never register.
#[derive(Debug)]
pub struct ScriptedReadiness {
    created: Instant,
    schedule: HashMap<String, Duration>,
    fail_connect: bool,
}

impl Default for ScriptedReadiness {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedReadiness {
    pub fn new() -> Self {
        Self {
            created: Instant::now(),
            schedule: HashMap::new(),
            fail_connect: false,
        }
    }

    #[must_use]
    pub fn registers_immediately(self, task_name: &str) -> Self {
        self.registers_after(task_name, Duration::ZERO)
    }

    #[must_use]
    pub fn registers_after(mut self, task_name: &str, delay: Duration) -> Self {
        self.schedule.insert(task_name.to_owned(), delay);
        self
    }

    /// Make `connect` fail, as if the directory service were unreachable.
    #[must_use]
    pub fn unreachable(mut self) -> Self {
        self.fail_connect = true;
        self
    }
}

impl ReadinessDirectory for ScriptedReadiness {
    fn connect(&self) -> Result<(), CoreError> {
        if self.fail_connect {
            return Err(CoreError::Connect("scripted directory is unreachable".to_owned()));
        }
        Ok(())
    }

    fn is_registered(&self, task_name: &str) -> bool {
        self.schedule
            .get(task_name)
            .is_some_and(|delay| self.created.elapsed() >= *delay)
    }
}

/// Readiness directory whose registrations are made by hand. Clones share
/// state, so a test can keep one clone and hand the other to a supervisor.
#[derive(Debug, Clone, Default)]
pub struct SharedReadiness {
    registered: Arc<Mutex<HashSet<String>>>,
}

impl SharedReadiness {
    pub fn register(&self, task_name: &str) {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_name.to_owned());
    }

    pub fn unregister(&self, task_name: &str) {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_name);
    }
}

impl ReadinessDirectory for SharedReadiness {
    fn connect(&self) -> Result<(), CoreError> {
        Ok(())
    }

    fn is_registered(&self, task_name: &str) -> bool {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(task_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_registration_follows_schedule() {
        let readiness = ScriptedReadiness::new()
            .registers_immediately("fast")
            .registers_after("slow", Duration::from_millis(50));
        assert!(readiness.is_registered("fast"));
        assert!(!readiness.is_registered("slow"));
        assert!(!readiness.is_registered("never"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(readiness.is_registered("slow"));
        assert!(!readiness.is_registered("never"));
    }

    #[test]
    fn unreachable_directory_fails_connect() {
        let err = ScriptedReadiness::new().unreachable().connect().unwrap_err();
        assert!(matches!(err, CoreError::Connect(_)));
    }

    #[test]
    fn shared_readiness_clones_share_state() {
        let a = SharedReadiness::default();
        let b = a.clone();
        a.register("task");
        assert!(b.is_registered("task"));
        b.unregister("task");
        assert!(!a.is_registered("task"));
    }
}
