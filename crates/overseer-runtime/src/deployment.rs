use crate::RuntimeError;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Command line a deployment is started with. `command` is looked up in
/// `PATH` and also becomes `argv[0]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    pub command: String,
    pub args: Vec<String>,
}

/// A named bundle of tasks that runs as one OS process.
pub trait Deployment: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Tasks this deployment registers at the readiness directory once it is up.
    fn task_names(&self) -> Vec<String>;

    fn exec_spec(&self) -> Result<ExecSpec, RuntimeError>;
}

/// Looks up deployment descriptors by name.
pub trait DeploymentResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Deployment>>;
}

/// Deployment defined directly by its command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDeployment {
    name: String,
    tasks: Vec<String>,
    command: String,
    args: Vec<String>,
}

impl CommandDeployment {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_owned(),
            tasks: Vec::new(),
            command: command.to_owned(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_task(mut self, task: &str) -> Self {
        self.tasks.push(task.to_owned());
        self
    }

    #[must_use]
    pub fn with_tasks<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tasks.extend(tasks.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl Deployment for CommandDeployment {
    fn name(&self) -> &str {
        &self.name
    }

    fn task_names(&self) -> Vec<String> {
        self.tasks.clone()
    }

    fn exec_spec(&self) -> Result<ExecSpec, RuntimeError> {
        if self.command.trim().is_empty() {
            return Err(RuntimeError::Resolution {
                deployment: self.name.clone(),
                reason: "command is empty".to_owned(),
            });
        }
        Ok(ExecSpec {
            command: self.command.clone(),
            args: self.args.clone(),
        })
    }
}

/// In-memory `DeploymentResolver`.
#[derive(Debug, Default)]
pub struct DeploymentTable {
    entries: BTreeMap<String, Arc<dyn Deployment>>,
}

impl DeploymentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor under its own name, replacing any previous entry.
    pub fn insert(&mut self, deployment: Arc<dyn Deployment>) -> Option<Arc<dyn Deployment>> {
        self.entries.insert(deployment.name().to_owned(), deployment)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DeploymentResolver for DeploymentTable {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Deployment>> {
        self.entries.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_deployment_resolves_exec_spec() {
        let dpl = CommandDeployment::new("camera", "/usr/bin/camera_driver")
            .with_args(["--rate", "30"])
            .with_tasks(["camera", "camera_logger"]);

        let spec = dpl.exec_spec().unwrap();
        assert_eq!(spec.command, "/usr/bin/camera_driver");
        assert_eq!(spec.args, vec!["--rate", "30"]);
        assert_eq!(dpl.task_names(), vec!["camera", "camera_logger"]);
        assert_eq!(dpl.name(), "camera");
    }

    #[test]
    fn empty_command_fails_resolution() {
        let dpl = CommandDeployment::new("broken", "  ");
        match dpl.exec_spec() {
            Err(RuntimeError::Resolution { deployment, .. }) => assert_eq!(deployment, "broken"),
            other => panic!("expected resolution error, got {other:?}"),
        }
    }

    #[test]
    fn table_resolves_by_name() {
        let mut table = DeploymentTable::new();
        assert!(table.is_empty());
        table.insert(Arc::new(CommandDeployment::new("a", "true")));
        let previous = table.insert(Arc::new(CommandDeployment::new("a", "false")));
        assert!(previous.is_some());
        table.insert(Arc::new(CommandDeployment::new("b", "true")));

        assert_eq!(table.len(), 2);
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["a", "b"]);
        let resolved = table.resolve("a").unwrap();
        assert_eq!(resolved.exec_spec().unwrap().command, "false");
        assert!(table.resolve("missing").is_none());
    }
}
