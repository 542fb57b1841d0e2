use crate::bundle::Bundle;
use crate::config::SupervisorConfig;
use crate::readiness::ReadinessDirectory;
use crate::CoreError;
use overseer_runtime::sys::{BlockedSignals, SHUTDOWN_REQUEST_SIGNALS};
use overseer_runtime::{Deployment, DeploymentResolver, ProcessHandle, RuntimeError, WaitBudget};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

type ProcessMap = BTreeMap<String, Arc<ProcessHandle>>;
type Tracked = Vec<(String, Arc<ProcessHandle>)>;

/// Tracks spawned deployments by name and drives readiness waits and
/// escalating shutdown.
///
/// All state sits behind mutexes so that one instance can be shared
/// process-wide and reached from the shutdown signal path. No lock is held
/// while sleeping.
pub struct Supervisor {
    readiness: Box<dyn ReadinessDirectory>,
    bundle: Box<dyn Bundle>,
    resolver: Option<Box<dyn DeploymentResolver>>,
    config: SupervisorConfig,
    processes: Mutex<ProcessMap>,
    not_ready: Mutex<Vec<String>>,
    log_dir: Mutex<Option<PathBuf>>,
    /// Handles detached by `kill_all` and not yet confirmed dead. The signal
    /// path kills these too, since the escalation it interrupted never resumes.
    draining: Mutex<Tracked>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn try_lock<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

impl Supervisor {
    pub fn new(
        readiness: impl ReadinessDirectory + 'static,
        bundle: impl Bundle + 'static,
    ) -> Self {
        Self::with_config(readiness, bundle, SupervisorConfig::default())
    }

    pub fn with_config(
        readiness: impl ReadinessDirectory + 'static,
        bundle: impl Bundle + 'static,
        config: SupervisorConfig,
    ) -> Self {
        let log_dir = config.log_dir.clone();
        Self {
            readiness: Box::new(readiness),
            bundle: Box::new(bundle),
            resolver: None,
            config,
            processes: Mutex::new(BTreeMap::new()),
            not_ready: Mutex::new(Vec::new()),
            log_dir: Mutex::new(log_dir),
            draining: Mutex::new(Vec::new()),
        }
    }

    /// Enable `spawn_by_name`.
    #[must_use]
    pub fn with_resolver(mut self, resolver: impl DeploymentResolver + 'static) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn connect(&self) -> Result<(), CoreError> {
        self.readiness.connect()
    }

    /// Start `deployment` and track it under its name. Its task names join the
    /// not-ready list. With `redirect_output`, stdout and stderr go to
    /// `<log dir>/<name>-<pid>.txt`; the log directory is asked from the bundle
    /// the first time it is needed.
    pub fn spawn(
        &self,
        deployment: Arc<dyn Deployment>,
        redirect_output: bool,
    ) -> Result<Arc<ProcessHandle>, CoreError> {
        let name = deployment.name().to_owned();
        if lock(&self.processes).contains_key(&name) {
            return Err(CoreError::DuplicateDeployment(name));
        }

        let log_dir = if redirect_output {
            Some(self.resolve_log_dir()?)
        } else {
            None
        };

        // A shutdown signal arriving before the handle is in the registry
        // would miss the new child; keep them pending until it is.
        let blocked = BlockedSignals::new(&SHUTDOWN_REQUEST_SIGNALS).map_err(|e| {
            RuntimeError::Setup(format!("could not block shutdown signals: {e}"))
        })?;
        let handle = Arc::new(ProcessHandle::spawn_blocked(
            Arc::clone(&deployment),
            log_dir.as_deref(),
            blocked.previous(),
        )?);

        match lock(&self.processes).entry(name.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
            }
            Entry::Occupied(_) => {
                // Lost a race against a concurrent spawn of the same name.
                handle.send_sigkill();
                let _ = handle.wait(self.config.wait_budget());
                return Err(CoreError::DuplicateDeployment(name));
            }
        }

        let tasks = deployment.task_names();
        info!(
            "spawned deployment '{name}' as pid {} with {} task(s)",
            handle.pid(),
            tasks.len()
        );
        lock(&self.not_ready).extend(tasks);
        drop(blocked);

        Ok(handle)
    }

    /// Resolve `name` through the configured resolver and spawn it.
    pub fn spawn_by_name(
        &self,
        name: &str,
        redirect_output: bool,
    ) -> Result<Arc<ProcessHandle>, CoreError> {
        let deployment = self
            .resolver
            .as_ref()
            .and_then(|resolver| resolver.resolve(name))
            .ok_or_else(|| CoreError::DeploymentNotFound(name.to_owned()))?;
        self.spawn(deployment, redirect_output)
    }

    fn resolve_log_dir(&self) -> Result<PathBuf, CoreError> {
        let mut log_dir = lock(&self.log_dir);
        if let Some(dir) = log_dir.as_ref() {
            return Ok(dir.clone());
        }
        let dir = self.bundle.log_directory()?;
        debug!("log directory resolved from bundle: {}", dir.display());
        *log_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Override the log directory. Only affects spawns made afterwards.
    pub fn set_log_directory(&self, dir: impl Into<PathBuf>) {
        *lock(&self.log_dir) = Some(dir.into());
    }

    pub fn log_directory(&self) -> Option<PathBuf> {
        lock(&self.log_dir).clone()
    }

    /// One pass over the not-ready list, dropping every task the readiness
    /// directory reports as registered. Cheap to call repeatedly.
    pub fn all_ready(&self) -> bool {
        let mut not_ready = lock(&self.not_ready);
        not_ready.retain(|task| {
            let registered = self.readiness.is_registered(task);
            if registered {
                debug!("task '{task}' registered");
            }
            !registered
        });
        not_ready.is_empty()
    }

    /// Block until every task registered. A deployment set that does not come
    /// up within `timeout` is torn down with `kill_all` before the error is
    /// returned.
    pub fn wait_until_all_ready(&self, timeout: Duration) -> Result<(), CoreError> {
        let start = Instant::now();
        while !self.all_ready() {
            if start.elapsed() > timeout {
                let pending = self.pending_tasks();
                error!("tasks did not register within {timeout:?}:");
                for task in &pending {
                    error!("    {task}");
                }
                self.kill_all();
                return Err(CoreError::ReadinessTimeout { pending, timeout });
            }
            std::thread::sleep(self.config.ready_poll_interval());
        }
        debug!("all tasks registered after {:?}", start.elapsed());
        Ok(())
    }

    /// `wait_until_all_ready` with the configured default timeout.
    pub fn wait_until_all_ready_default(&self) -> Result<(), CoreError> {
        self.wait_until_all_ready(self.config.ready_timeout())
    }

    /// SIGINT, then SIGKILL if the deployment outlives the wait budget.
    /// Returns `Ok(false)` and keeps tracking it if even SIGKILL did not
    /// take effect in time.
    pub fn kill_deployment(&self, name: &str) -> Result<bool, CoreError> {
        let handle = lock(&self.processes)
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::DeploymentNotFound(name.to_owned()))?;
        let budget = self.config.wait_budget();

        handle.send_sigint();
        if !handle.wait(budget)? {
            warn!("failed to terminate deployment '{name}', trying to kill...");
            handle.send_sigkill();
            if !handle.wait(budget)? {
                error!("failed to kill deployment '{name}' (pid {})", handle.pid());
                return Ok(false);
            }
        }

        self.forget(name, &handle);
        info!("deployment '{name}' stopped");
        Ok(true)
    }

    fn forget(&self, name: &str, handle: &Arc<ProcessHandle>) {
        let mut processes = lock(&self.processes);
        if processes
            .get(name)
            .is_some_and(|tracked| Arc::ptr_eq(tracked, handle))
        {
            processes.remove(name);
        }
        drop(processes);

        let tasks = handle.deployment().task_names();
        lock(&self.not_ready).retain(|task| !tasks.contains(task));
    }

    /// Stop every tracked deployment as fast as possible while giving each one
    /// a chance to exit cleanly. The registry is empty afterwards even if some
    /// processes could not be confirmed dead; those pids leave supervision.
    pub fn kill_all(&self) {
        let tracked = {
            let mut processes = lock(&self.processes);
            let tracked: Tracked = std::mem::take(&mut *processes).into_iter().collect();
            lock(&self.draining).extend(tracked.iter().cloned());
            tracked
        };
        lock(&self.not_ready).clear();

        escalate(&tracked, self.config.wait_budget());
        lock(&self.draining).retain(|(_, handle)| !contains_handle(&tracked, handle));
    }

    /// `kill_all` for the signal path: never blocks on a lock. Deployments a
    /// `kill_all` was still escalating get SIGKILL right away. Returns false
    /// when the registry was busy and its entries were left alone.
    pub fn kill_all_from_signal(&self) -> bool {
        let tracked: Option<Tracked> = try_lock(&self.processes)
            .map(|mut processes| std::mem::take(&mut *processes).into_iter().collect());

        let interrupted = match try_lock(&self.draining) {
            Some(mut draining) => {
                let interrupted = draining.clone();
                if let Some(tracked) = &tracked {
                    draining.extend(tracked.iter().cloned());
                }
                interrupted
            }
            None => Vec::new(),
        };
        if let Some(mut not_ready) = try_lock(&self.not_ready) {
            not_ready.clear();
        }

        let budget = self.config.wait_budget();
        force_kill(&interrupted, budget);
        if let Some(tracked) = &tracked {
            escalate(tracked, budget);
        }
        if let Some(mut draining) = try_lock(&self.draining) {
            draining.retain(|(_, handle)| {
                !contains_handle(&interrupted, handle)
                    && !tracked.as_ref().is_some_and(|t| contains_handle(t, handle))
            });
        }
        tracked.is_some()
    }

    /// Deployments `kill_all` detached and is still stopping.
    pub fn draining(&self) -> Vec<String> {
        lock(&self.draining)
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Probe every tracked process. Does not stop at the first dead one, so
    /// each dead deployment gets reaped and reported.
    pub fn check_all_processes(&self) -> bool {
        let handles: Vec<_> = lock(&self.processes)
            .iter()
            .map(|(name, handle)| (name.clone(), Arc::clone(handle)))
            .collect();

        let mut all_alive = true;
        for (name, handle) in handles {
            match handle.alive() {
                Ok(true) => {}
                Ok(false) => {
                    all_alive = false;
                    match handle.termination() {
                        Some(termination) => warn!(
                            "deployment '{name}' (pid {}) {termination}",
                            handle.pid()
                        ),
                        None => warn!("deployment '{name}' (pid {}) is gone", handle.pid()),
                    }
                }
                Err(e) => {
                    all_alive = false;
                    warn!("could not probe deployment '{name}': {e}");
                }
            }
        }
        all_alive
    }

    pub fn running_deployments(&self) -> Vec<Arc<dyn Deployment>> {
        lock(&self.processes)
            .values()
            .map(|handle| Arc::clone(handle.deployment()))
            .collect()
    }

    pub fn handle(&self, name: &str) -> Option<Arc<ProcessHandle>> {
        lock(&self.processes).get(name).cloned()
    }

    /// Task names still waiting for registration, in spawn order.
    pub fn pending_tasks(&self) -> Vec<String> {
        lock(&self.not_ready).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.processes).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.processes).is_empty()
    }
}

fn contains_handle(tracked: &[(String, Arc<ProcessHandle>)], handle: &Arc<ProcessHandle>) -> bool {
    tracked.iter().any(|(_, h)| Arc::ptr_eq(h, handle))
}

/// The three shutdown phases of `kill_all`, run on handles already detached
/// from the registry.
fn escalate(tracked: &[(String, Arc<ProcessHandle>)], budget: WaitBudget) {
    if tracked.is_empty() {
        debug!("kill_all: no deployments tracked");
        return;
    }

    // Ask everything that still runs to shut down cleanly.
    let mut interrupted = Vec::with_capacity(tracked.len());
    for (name, handle) in tracked {
        match handle.alive() {
            Ok(true) => {
                handle.send_sigint();
                interrupted.push((name, handle));
            }
            Ok(false) => debug!("deployment '{name}' had already exited"),
            Err(e) => warn!("could not probe deployment '{name}', dropping it: {e}"),
        }
    }

    let mut killed = Vec::new();
    for (name, handle) in interrupted {
        if matches!(handle.wait(budget), Ok(true)) {
            info!("successfully terminated deployment '{name}'");
        } else {
            warn!("escalating to SIGKILL for deployment '{name}'");
            handle.send_sigkill();
            killed.push((name, handle));
        }
    }

    for (name, handle) in killed {
        confirm_killed(name, handle, budget);
    }
}

/// SIGKILL whatever is left of an escalation that was cut short.
fn force_kill(tracked: &[(String, Arc<ProcessHandle>)], budget: WaitBudget) {
    let mut killed = Vec::with_capacity(tracked.len());
    for (name, handle) in tracked {
        if matches!(handle.alive(), Ok(false)) {
            continue;
        }
        warn!("killing deployment '{name}' left over from an interrupted shutdown");
        handle.send_sigkill();
        killed.push((name, handle));
    }
    for (name, handle) in killed {
        confirm_killed(name, handle, budget);
    }
}

fn confirm_killed(name: &str, handle: &ProcessHandle, budget: WaitBudget) {
    match handle.wait(budget) {
        Ok(true) => info!("killed deployment '{name}'"),
        Ok(false) => error!(
            "deployment '{name}' (pid {}) could not be terminated",
            handle.pid()
        ),
        Err(e) => error!("deployment '{name}' could not be confirmed dead: {e}"),
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("processes", &*lock(&self.processes))
            .field("not_ready", &*lock(&self.not_ready))
            .field("log_dir", &*lock(&self.log_dir))
            .field("draining", &*lock(&self.draining))
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
