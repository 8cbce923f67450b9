mod app;
mod error;
mod manager;
mod models;
mod registry;
mod store;
mod worker;

#[cfg(test)]
mod test_support;

use std::{fs, sync::Arc, thread};

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use tokio::sync::oneshot;

use app::cli;
use app::config::{init_logging, Args, Config};
use manager::task_manager::TaskManager;
use registry::ModuleRegistry;
use store::Store;
use worker::process::ShellLauncher;

fn main() -> anyhow::Result<()> {
    let config = Config::from_args(Args::parse())?;
    init_logging(config.debug);

    fs::create_dir_all(&config.engine.workspace).with_context(|| {
        format!(
            "cannot create workspace '{}'",
            config.engine.workspace.display()
        )
    })?;
    let store = Store::open(&config.database)
        .with_context(|| format!("cannot open database '{}'", config.database.display()))?;
    let registry = ModuleRegistry::load(&config.modules_dir);
    let manager = Arc::new(TaskManager::new(
        Arc::new(store),
        Arc::new(registry),
        Arc::new(ShellLauncher::new(config.shell.clone())),
        config.engine.clone(),
    )?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot start async runtime")?;
    runtime.block_on(serve(&config, Arc::clone(&manager)))?;

    manager.shutdown();
    info!("Scan engine stopped.");
    Ok(())
}

async fn serve(config: &Config, manager: Arc<TaskManager>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("cannot listen on {}", config.addr))?;
    info!("Scan engine listening on http://{}.", config.addr);

    let console_done = if config.console {
        let (tx, rx) = oneshot::channel();
        let console_manager = Arc::clone(&manager);
        thread::Builder::new()
            .name("console".to_string())
            .spawn(move || {
                if let Err(e) = cli::run_console(console_manager) {
                    error!("Console failed: {}", e);
                }
                let _ = tx.send(());
            })
            .context("cannot start console")?;
        Some(rx)
    } else {
        None
    };

    let shutdown = async move {
        match console_done {
            Some(rx) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = rx => {}
                }
            }
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        info!("Shutting down.");
    };

    axum::serve(listener, app::server::router(manager))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server failed")
}
