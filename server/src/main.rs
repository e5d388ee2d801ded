// EchoVault - conditional message delivery service
// Entry point and server setup

use echovault::api;
use echovault::app::AppState;
use echovault::clock::{SharedClock, SystemClock};
use echovault::config::ServerConfig;
use echovault::database::create_pool;
use echovault::services::{SchedulerService, TriggerSchedule};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "echovault=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting EchoVault v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    tracing::info!(?config.http_addr, ?config.database_path, "Loaded configuration");

    let pool = create_pool(&config.database_path).await?;
    let clock: SharedClock = Arc::new(SystemClock);
    let http_addr = config.http_addr;
    let evaluator_cron = config.evaluator_cron.clone();
    let state = AppState::new(config, pool, clock)?;

    // Optional in-process trigger; otherwise an external caller drives /notify.
    let scheduler = match evaluator_cron {
        Some(expr) => {
            let schedule: TriggerSchedule = expr
                .parse()
                .map_err(|e: String| anyhow::anyhow!("Invalid EVALUATOR_CRON: {}", e))?;
            let scheduler = SchedulerService::new(state.runner.clone()).await?;
            scheduler.schedule(&schedule).await?;
            scheduler.start().await?;
            Some(scheduler)
        }
        None => {
            tracing::info!("EVALUATOR_CRON not set; waiting for external POST /notify calls");
            None
        }
    };

    tokio::select! {
        result = api::serve(state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down");
        }
    }

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await?;
    }

    Ok(())
}
