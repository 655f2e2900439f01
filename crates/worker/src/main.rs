// Worker clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! ChoreQuest Background Worker
//!
//! Handles scheduled jobs:
//! - Expired refresh credential sweep (daily at `DAILY_RESET_HOUR` UTC)
//! - Heartbeat (every 5 minutes)

use std::time::Duration;

use chorequest_api::auth::{sweep_expired, PgRefreshTokenStore, RefreshTokenStore};
use chorequest_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
enum WorkerConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("DAILY_RESET_HOUR must be an hour between 0 and 23")]
    InvalidResetHour,
}

#[derive(Debug)]
struct WorkerConfig {
    database_url: String,
    daily_reset_hour: u32,
}

impl WorkerConfig {
    fn from_lookup<F>(lookup: F) -> Result<Self, WorkerConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|value| !value.trim().is_empty())
            .ok_or(WorkerConfigError::Missing("DATABASE_URL"))?;

        let daily_reset_hour = match lookup("DAILY_RESET_HOUR") {
            Some(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|hour| *hour < 24)
                .ok_or(WorkerConfigError::InvalidResetHour)?,
            _ => 0,
        };

        Ok(Self {
            database_url,
            daily_reset_hour,
        })
    }
}

/// Six-field cron expression firing once a day at `hour`:00 UTC
fn daily_at(hour: u32) -> String {
    format!("0 0 {} * * *", hour)
}

async fn sweep_refresh_credentials(store: &dyn RefreshTokenStore) {
    info!("Running expired refresh credential sweep");
    match sweep_expired(store, OffsetDateTime::now_utc()).await {
        Ok(removed) => info!(removed, "Refresh credential sweep complete"),
        Err(e) => error!(error = %e, "Refresh credential sweep failed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let config = match WorkerConfig::from_lookup(|key| std::env::var(key).ok()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("chorequest-worker: configuration error: {}", err);
            std::process::exit(1);
        }
    };

    info!("Starting ChoreQuest Worker");

    let pool = create_pool(&config.database_url).await?;
    let store = PgRefreshTokenStore::new(pool);

    let scheduler = JobScheduler::new().await?;

    // Job 1: delete refresh credentials past their expiry.
    // Delete-only, so it can overlap request-path issuance.
    let sweep_store = store.clone();
    scheduler
        .add(Job::new_async(
            daily_at(config.daily_reset_hour).as_str(),
            move |_uuid, _l| {
                let store = sweep_store.clone();
                Box::pin(async move {
                    sweep_refresh_credentials(&store).await;
                })
            },
        )?)
        .await?;
    info!(
        hour = config.daily_reset_hour,
        "Scheduled: Refresh credential sweep (daily)"
    );

    // Job 2: heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Clear anything that expired while the worker was down
    sweep_refresh_credentials(&store).await;

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("ChoreQuest Worker started successfully with 2 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_reset_hour_defaults_to_midnight() {
        let config = WorkerConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://db")])).unwrap();
        assert_eq!(config.daily_reset_hour, 0);
        assert_eq!(daily_at(config.daily_reset_hour), "0 0 0 * * *");
    }

    #[test]
    fn test_reset_hour_parsed() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db"),
            ("DAILY_RESET_HOUR", "4"),
        ]))
        .unwrap();
        assert_eq!(daily_at(config.daily_reset_hour), "0 0 4 * * *");
    }

    #[test]
    fn test_invalid_reset_hour_rejected() {
        for bad in ["24", "-1", "noon"] {
            let err = WorkerConfig::from_lookup(lookup(&[
                ("DATABASE_URL", "postgres://db"),
                ("DAILY_RESET_HOUR", bad),
            ]))
            .unwrap_err();
            assert_eq!(err, WorkerConfigError::InvalidResetHour);
        }
    }

    #[test]
    fn test_database_url_required() {
        let err = WorkerConfig::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err, WorkerConfigError::Missing("DATABASE_URL"));
    }

    #[tokio::test]
    async fn test_daily_expression_accepted_by_scheduler() {
        assert!(Job::new_async(daily_at(23).as_str(), |_uuid, _l| Box::pin(async {})).is_ok());
    }
}
