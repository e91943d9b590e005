use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use taskpool_core::PoolBuilder;

mod config;
mod http;
mod logging;
mod simulate;

use config::ServerConfig;

#[derive(Debug, Parser)]
#[command(name = "taskpool", version, about = "Volunteer computing task pool")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (defaults to ./taskpool.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP coordinator
    Serve {
        /// Listen address, overrides config and TASKPOOL_BIND
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run an in-process simulation with push dispatch
    Simulate(simulate::SimulateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ServerConfig::load(cli.config.as_deref())?;
    logging::init_logging(&config.logging, cli.verbose)?;

    match cli.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            serve(config).await
        }
        Command::Simulate(args) => simulate::run(args).await,
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    let pool = PoolBuilder::new()
        .config(config.pool.clone())
        .build()
        .context("building pool")?;
    let scheduler = pool.spawn_scheduler();

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!(
        bind = %config.bind,
        queue_capacity = config.pool.queue_capacity,
        mode = ?config.pool.dispatch_mode,
        "taskpool listening"
    );

    axum::serve(listener, http::router(pool))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    scheduler.shutdown_and_join().await;
    info!("taskpool stopped");
    Ok(())
}

async fn shutdown_signal() {
    // ctrl_c only fails when no handler can be installed; serve until killed then
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
