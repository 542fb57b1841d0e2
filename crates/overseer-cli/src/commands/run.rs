use super::{json_pretty, EXIT_SUCCESS};
use overseer_core::{
    install_global, CommandDeployment, EnvBundle, MarkerDirectory, Supervisor, SupervisorConfig,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

pub struct RunOptions {
    pub name: String,
    pub tasks: Vec<String>,
    pub command: Vec<String>,
    pub redirect: bool,
    pub log_dir: Option<PathBuf>,
    pub registry_dir: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
    pub monitor: bool,
}

#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    deployment: &'a str,
    pid: i32,
    tasks: &'a [String],
    log_file: Option<PathBuf>,
}

pub fn run(mut config: SupervisorConfig, opts: &RunOptions, json: bool) -> Result<u8, String> {
    if let Some(dir) = &opts.registry_dir {
        config.registry_dir.clone_from(dir);
    }
    if let Some(dir) = &opts.log_dir {
        config.log_dir = Some(dir.clone());
    }
    if let Some(ms) = opts.timeout_ms {
        config.ready_timeout_ms = ms;
    }
    config.validate().map_err(|e| e.to_string())?;

    let (command, args) = opts
        .command
        .split_first()
        .ok_or_else(|| "no command given".to_owned())?;
    let deployment = CommandDeployment::new(&opts.name, command)
        .with_args(args.iter().cloned())
        .with_tasks(opts.tasks.iter().cloned());

    let readiness = MarkerDirectory::new(config.registry_dir.clone());
    let supervisor = install_global(Supervisor::with_config(readiness, EnvBundle, config))
        .map_err(|e| e.to_string())?;

    let handle = supervisor
        .spawn(Arc::new(deployment), opts.redirect)
        .map_err(|e| e.to_string())?;
    supervisor
        .wait_until_all_ready_default()
        .map_err(|e| e.to_string())?;

    let log_file = if opts.redirect {
        supervisor
            .log_directory()
            .map(|dir| dir.join(format!("{}-{}.txt", opts.name, handle.pid())))
    } else {
        None
    };
    let summary = RunSummary {
        deployment: &opts.name,
        pid: handle.pid(),
        tasks: &opts.tasks,
        log_file,
    };
    if json {
        println!("{}", json_pretty(&summary)?);
    } else {
        println!("deployment '{}' ready (pid {})", summary.deployment, summary.pid);
        if let Some(path) = &summary.log_file {
            println!("  output: {}", path.display());
        }
    }

    if !opts.monitor {
        supervisor.kill_all();
        return Ok(EXIT_SUCCESS);
    }

    info!("supervising deployment '{}'", opts.name);
    loop {
        std::thread::sleep(MONITOR_INTERVAL);
        if !supervisor.check_all_processes() {
            supervisor.kill_all();
            return Err(format!("deployment '{}' exited", opts.name));
        }
    }
}
