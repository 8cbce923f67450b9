use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::manager::task_manager::EngineSettings;

#[derive(Parser, Debug)]
#[command(name = "scan-engine", about = "Runs scan modules and streams their output")]
pub struct Args {
    /// Address the HTTP API listens on.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub addr: String,
    #[arg(long, default_value = "modules")]
    pub modules_dir: PathBuf,
    #[arg(long, default_value = "scan-engine.db")]
    pub database: PathBuf,
    /// Root for task working directories.
    #[arg(long, default_value = "workspace")]
    pub workspace: PathBuf,
    #[arg(long, default_value = "sh")]
    pub shell: String,
    #[arg(long, default_value_t = 5)]
    pub stop_grace_secs: u64,
    #[arg(long, default_value_t = 8 * 1024 * 1024)]
    pub max_output_bytes: usize,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    /// Run the interactive console alongside the API.
    #[arg(long, default_value_t = false)]
    pub console: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub modules_dir: PathBuf,
    pub database: PathBuf,
    pub shell: String,
    pub debug: bool,
    pub console: bool,
    pub engine: EngineSettings,
}

impl Config {
    pub fn from_args(args: Args) -> anyhow::Result<Self> {
        let addr: SocketAddr = args
            .addr
            .parse()
            .with_context(|| format!("invalid listen address '{}'", args.addr))?;
        if args.shell.trim().is_empty() {
            bail!("--shell must not be empty");
        }
        if args.max_output_bytes == 0 {
            bail!("--max-output-bytes must be greater than zero");
        }

        let engine = EngineSettings {
            workspace: args.workspace,
            stop_grace: Duration::from_secs(args.stop_grace_secs),
            max_output_bytes: args.max_output_bytes,
            ..EngineSettings::default()
        };

        Ok(Config {
            addr,
            modules_dir: args.modules_dir,
            database: args.database,
            shell: args.shell,
            debug: args.debug || env_true("SCAN_ENGINE_DEBUG"),
            console: args.console,
            engine,
        })
    }
}

fn env_true(key: &str) -> bool {
    std::env::var(key)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Installs the stderr subscriber. `log` records from the engine are
/// forwarded into it.
pub fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    if let Err(e) = installed {
        eprintln!("logging already initialised: {}", e);
    }
}
