use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::future::join_all;
use tokio::signal;
use tracing::{info, warn};

use rate_sync::config::RateSyncConfig;
use rate_sync::registry::RateLimiterFactory;
use rate_sync::{store, telemetry, RateLimiter};

/// Drive a shared rate limiter from several concurrent workers.
#[derive(Parser, Debug)]
#[command(name = "rate-sync", version, about)]
struct Args {
    /// Configuration file (YAML); `RATE_SYNC__*` variables override it
    #[arg(short, long, default_value = "rate-sync.yaml")]
    config: String,

    /// Bucket key shared by every process using the same store
    #[arg(short, long, default_value = "rate-sync:demo")]
    key: String,

    #[arg(short, long, default_value_t = 10.0)]
    permits_per_second: f64,

    /// Seconds worth of permits the bucket may bank; configured default when unset
    #[arg(short = 'b', long)]
    max_burst_seconds: Option<u32>,

    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    /// Permits each worker acquires
    #[arg(short, long, default_value_t = 20)]
    requests: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = RateSyncConfig::load(&args.config)?;
    telemetry::init(&config.logging)?;

    info!("Starting rate-sync");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(backend = ?config.store.backend, "Configuration loaded");

    let store = store::connect(&config.store).await?;
    let factory = RateLimiterFactory::from_config(&config, store);
    let limiter = match args.max_burst_seconds {
        Some(burst) => factory.build_with_burst(&args.key, args.permits_per_second, burst)?,
        None => factory.build(&args.key, args.permits_per_second)?,
    };
    info!(limiter = ?limiter, "Rate limiter initialized");

    tokio::select! {
        result = run_workers(limiter, args.workers, args.requests) => result?,
        _ = shutdown_signal() => {}
    }

    info!("rate-sync stopped");
    Ok(())
}

async fn run_workers(limiter: Arc<RateLimiter>, workers: usize, requests: usize) -> anyhow::Result<()> {
    let started = tokio::time::Instant::now();
    let tasks = (0..workers).map(|worker| {
        let limiter = Arc::clone(&limiter);
        async move {
            let mut waited = Duration::ZERO;
            for _ in 0..requests {
                waited += limiter.acquire_one().await?;
            }
            info!(worker, requests, waited_ms = waited.as_millis() as u64, "Worker finished");
            Ok::<_, rate_sync::RateSyncError>(())
        }
    });

    for result in join_all(tasks).await {
        if let Err(e) = result {
            warn!(error = %e, "Worker failed");
            return Err(e.into());
        }
    }

    let elapsed = started.elapsed();
    let total = workers * requests;
    info!(
        total,
        elapsed_ms = elapsed.as_millis() as u64,
        observed_rate = total as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        "All workers finished"
    );
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping workers");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping workers");
        }
    }
}
