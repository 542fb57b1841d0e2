mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_TIMEOUT};
use overseer_core::SupervisorConfig;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "overseer",
    version,
    about = "Spawn deployments, wait for their tasks, tear them down cleanly"
)]
struct Cli {
    /// Configuration file (defaults to ~/.config/overseer/overseer.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Spawn a deployment, wait until its tasks registered and supervise it.
    Run {
        /// Deployment name; also names the log file.
        #[arg(long)]
        name: String,
        /// Task that must register before the deployment counts as ready.
        #[arg(long = "task")]
        tasks: Vec<String>,
        /// Send stdout and stderr to <log dir>/<name>-<pid>.txt.
        #[arg(long, default_value_t = false)]
        redirect: bool,
        /// Log directory (overrides config and OVERSEER_LOG_DIR).
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// Readiness marker directory (overrides config).
        #[arg(long)]
        registry_dir: Option<PathBuf>,
        /// Readiness timeout in milliseconds (overrides config).
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Stop the deployment again once it is ready instead of supervising it.
        #[arg(long, default_value_t = false)]
        no_monitor: bool,
        /// Command and arguments to run.
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },
    /// Print the effective configuration, or write it to a file.
    Config {
        /// Write the configuration as TOML to this path.
        #[arg(long)]
        write: Option<PathBuf>,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("OVERSEER_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let json_output = cli.json;

    let config_path = cli.config;
    let result = match cli.command {
        Commands::Run {
            name,
            tasks,
            redirect,
            log_dir,
            registry_dir,
            timeout_ms,
            no_monitor,
            command,
        } => load_config(config_path.as_deref()).and_then(|config| {
            commands::run::run(
                config,
                &commands::run::RunOptions {
                    name,
                    tasks,
                    command,
                    redirect,
                    log_dir,
                    registry_dir,
                    timeout_ms,
                    monitor: !no_monitor,
                },
                json_output,
            )
        }),
        Commands::Config { write } => load_config(config_path.as_deref())
            .and_then(|config| commands::config::run(&config, write.as_deref(), json_output)),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("config error:") {
                EXIT_CONFIG_ERROR
            } else if msg.starts_with("timed out") {
                EXIT_TIMEOUT
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<SupervisorConfig, String> {
    match path {
        Some(path) => SupervisorConfig::load(path),
        None => SupervisorConfig::load_default(),
    }
    .map_err(|e| e.to_string())
}
