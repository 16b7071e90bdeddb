//! FitDesk background worker
//!
//! Applies deferred plan changes once their scheduled date arrives.

mod config;
mod due_changes;

use anyhow::Context;
use fitdesk_billing::{EngineConfig, PgBillingStore, PlanChangeService, TracingNotifier};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::WorkerConfig;

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    init_tracing(config.log_json);

    let engine_config = EngineConfig::from_env().context("invalid billing configuration")?;

    let pool = fitdesk_shared::create_pool(&config.database_url, config.max_connections)
        .await
        .context("failed to connect to database")?;
    fitdesk_shared::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;

    let store = Arc::new(PgBillingStore::new(pool));
    let service = Arc::new(PlanChangeService::new(
        store.clone(),
        store.clone(),
        store,
        Arc::new(TracingNotifier),
        engine_config,
    ));

    // Catch up on anything that fell due while the worker was down
    due_changes::run(&service).await;

    let mut scheduler = JobScheduler::new().await?;
    let job_service = service.clone();
    scheduler
        .add(Job::new_async(
            config.deferred_change_cron.as_str(),
            move |_id, _scheduler| {
                let service = job_service.clone();
                Box::pin(async move {
                    due_changes::run(&service).await;
                })
            },
        )?)
        .await?;
    scheduler.start().await?;

    tracing::info!(
        schedule = %config.deferred_change_cron,
        "Worker started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("Shutting down worker");
    scheduler.shutdown().await?;

    Ok(())
}
