use std::process::ExitCode;

use chrono::{DateTime, Duration, Utc};
use linkfetch::{Engine, EngineConfig};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn cleaner_is_due(last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    last_run.map_or(true, |at| now - at >= Duration::hours(1))
}

async fn run_tick(engine: &Engine, now: DateTime<Utc>, clean: bool) -> bool {
    match engine.tick(now, clean).await {
        Ok(report) => {
            match serde_json::to_string(&report) {
                Ok(summary) => info!(%summary, "tick finished"),
                Err(error) => warn!(error = %error, "failed to serialize tick report"),
            }
            match engine.health_report(now).await {
                Ok(health) => info!(?health, "health"),
                Err(error) => warn!(error = %error, "failed to build health report"),
            }
            true
        }
        Err(error) => {
            error!(error = %error, "tick failed");
            false
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let once = std::env::args().skip(1).any(|arg| arg == "--once");

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!(error = %error, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    let engine = match Engine::connect(config).await {
        Ok(engine) => engine,
        Err(error) => {
            error!(error = %error, "failed to start the engine");
            return ExitCode::FAILURE;
        }
    };

    if once {
        return if run_tick(&engine, Utc::now(), true).await {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }

    info!(
        tick_secs = engine.config().tick_interval.as_secs(),
        serie = ?engine.config().serie,
        "worker started"
    );
    let mut ticker = tokio::time::interval(engine.config().tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_clean = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("worker shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                let now = Utc::now();
                let clean = cleaner_is_due(last_clean, now);
                if run_tick(&engine, now, clean).await && clean {
                    last_clean = Some(now);
                }
            }
        }
    }

    ExitCode::SUCCESS
}
