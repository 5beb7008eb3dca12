mod config;
mod setup;
mod telemetry;
mod tmux;

use anyhow::Result;
use clap::Parser;
use config::Config;
use orchestrator_core::store::StateStore;
use telemetry::{init_telemetry, log_startup_info};
use tracing::info;

#[derive(Parser)]
#[command(name = "maestro")]
#[command(about = "Multi-agent orchestrator over terminal sessions")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<String>,

    /// Database URL override
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Log level override
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Run recovery and a health check, then exit
    #[arg(long)]
    recover_only: bool,

    /// Delete terminal tasks and events older than N days, then exit
    #[arg(long, value_name = "DAYS")]
    cleanup: Option<u32>,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(config_file) => Config::from_file(config_file)?,
        None => Config::from_env()?,
    };

    if let Some(ref database_url) = cli.database_url {
        config.database.url = Some(database_url.clone());
    }
    if let Some(ref log_level) = cli.log_level {
        config.logging.level = log_level.clone();
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_telemetry(&config.logging)?;
    log_startup_info(&config.database_url(), config.agents.len());

    let components = setup::build(&config).await?;

    if let Some(days) = cli.cleanup {
        let removed = components.store.cleanup_old_data(days).await?;
        info!(days, removed, "Cleanup finished");
        return Ok(());
    }

    setup::start(&components, &config).await?;

    if cli.recover_only {
        let health = components.recovery.health_check().await;
        info!(
            healthy = health.healthy,
            bus_running = health.bus_running,
            store_reachable = health.store_reachable,
            stale_tasks = health.stale_tasks,
            "Health check"
        );
        for (session, exists) in &health.sessions {
            info!(session = %session, exists, "Session status");
        }
        setup::shutdown(&components).await;
        return Ok(());
    }

    info!("maestro running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    setup::shutdown(&components).await;
    Ok(())
}
