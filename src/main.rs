//! Courier Worker - route optimization and call reminders
//!
//! `serve` runs the call scheduler; `optimize` plans a single courier day.

mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courier_worker::config::Config;
use courier_worker::db::{self, InMemoryRepository, PgRepository, Repository};
use courier_worker::services::call_scheduler::CallScheduler;
use courier_worker::services::call_state::RetryPolicy;
use courier_worker::services::maps::{NominatimClient, RoadMaps, ValhallaClient, ValhallaConfig};
use courier_worker::services::notifier::{LogNotifier, NatsNotifier, Notifier};
use courier_worker::services::planner::{OptimizeOptions, RoutePlanner};
use courier_worker::types::CourierDay;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs directory - use LOGS_DIR env var or default to ../logs (relative to worker)
    let logs_dir = std::env::var("LOGS_DIR").unwrap_or_else(|_| "../logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    // File appender for persistent logs (daily rotation)
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &logs_dir, "worker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,courier_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer()) // stdout
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false)) // file
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    info!("Configuration loaded");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required for migrations"))?;
            let pool = db::create_pool(url).await?;
            db::run_migrations(&pool).await?;
        }
        Command::Optimize {
            courier,
            date,
            ignore_manual_times,
        } => {
            let repo = connect_repository(&config).await?;
            let planner = RoutePlanner::new(repo, Arc::new(build_maps(&config)?), config.planning.clone(), config.single_flight);
            let options = OptimizeOptions {
                ignore_manual_arrivals: ignore_manual_times,
            };
            let outcome = planner.optimize_with(CourierDay::new(courier, date), options).await?;
            println!("{}", serde_json::to_string_pretty(&outcome.route)?);
            if outcome.diagnostics.used_fallback()
                || outcome.diagnostics.degraded_matrix
                || outcome.diagnostics.manual_arrivals_ignored
            {
                warn!("Diagnostics: {}", serde_json::to_string(&outcome.diagnostics)?);
            }
        }
        Command::Serve => serve(&config).await?,
    }

    Ok(())
}

async fn serve(config: &Config) -> Result<()> {
    info!("Starting Courier Worker...");

    let repo = connect_repository(config).await?;
    let notifier: Arc<dyn Notifier> = match &config.nats_url {
        Some(url) => {
            let client = async_nats::connect(url).await?;
            info!("Connected to NATS at {}", url);
            Arc::new(NatsNotifier::new(client).await?)
        }
        None => {
            warn!("NATS_URL not set, call reminders are only logged");
            Arc::new(LogNotifier)
        }
    };

    let scheduler = Arc::new(CallScheduler::new(
        repo,
        notifier,
        RetryPolicy::from_planning(&config.planning),
        Duration::from_secs(config.scheduler_interval_seconds),
    ));

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(scheduler.run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, finishing current pass");
    shutdown.cancel();

    if let Err(e) = handle.await {
        error!("Call scheduler task failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}

async fn connect_repository(config: &Config) -> Result<Arc<dyn Repository>> {
    match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url).await?;
            info!("Connected to PostgreSQL");
            db::run_migrations(&pool).await?;
            Ok(Arc::new(PgRepository::new(pool)))
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory storage");
            Ok(Arc::new(InMemoryRepository::new()))
        }
    }
}

fn build_maps(config: &Config) -> Result<RoadMaps> {
    let valhalla = match &config.valhalla_url {
        Some(url) => Some(ValhallaClient::new(ValhallaConfig::new(url.clone()))?),
        None => {
            warn!("VALHALLA_URL not set, travel times are straight-line estimates");
            None
        }
    };
    Ok(RoadMaps::new(valhalla, NominatimClient::new(&config.nominatim_url)?))
}
