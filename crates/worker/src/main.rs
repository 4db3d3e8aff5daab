//! Tunnelbot background worker
//!
//! Runs the scheduled jobs:
//! - Expiry sweep: revoke lapsed access, send expiry warnings and
//!   drain the provisioning-retry queue (every 5 minutes)
//! - Heartbeat (hourly)
//!
//! The sweep is single-flight inside the process; a cycle that fires
//! while the previous one is still running is skipped. Run one worker
//! instance per deployment.

use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use tunnelbot_engine::{
    ExpirySweeper, Ledger, MarzbanClient, PgLedger, SweepConfig, TelegramNotifier, VpnOrchestrator,
};
use tunnelbot_shared::{create_pool, run_migrations, AppConfig, SystemClock};

fn build_sweeper(pool: sqlx::PgPool, config: &AppConfig) -> anyhow::Result<ExpirySweeper> {
    let ledger: Arc<dyn Ledger> = Arc::new(PgLedger::new(pool));
    let clock = Arc::new(SystemClock);
    let panel = Arc::new(MarzbanClient::new(&config.marzban)?);
    let notifier = Arc::new(TelegramNotifier::new(&config.telegram)?);
    let vpn = Arc::new(VpnOrchestrator::new(
        ledger.clone(),
        panel,
        clock.clone(),
        config.username_salt.clone(),
    ));
    Ok(ExpirySweeper::new(
        ledger,
        vpn,
        notifier,
        clock,
        SweepConfig {
            warning_window: time::Duration::hours(config.expiry_warning_hours),
            ..SweepConfig::default()
        },
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting tunnelbot worker");

    let config = AppConfig::from_env()?;
    let pool = create_pool(&config.database_url).await?;
    info!("Database pool created");

    run_migrations(&pool).await?;
    info!("Database migrations applied");

    let sweeper = Arc::new(build_sweeper(pool, &config)?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Expiry sweep (every 5 minutes)
    let sweep = sweeper.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let sweeper = sweep.clone();
            Box::pin(async move {
                match sweeper.run().await {
                    Ok(Some(report)) => info!(
                        expired = report.expired,
                        warned = report.warned,
                        reconciled = report.reconciled,
                        escalated = report.escalated,
                        errors = report.errors,
                        "Expiry sweep complete"
                    ),
                    Ok(None) => info!("Expiry sweep skipped (previous cycle still running)"),
                    Err(e) => error!(error = %e, "Expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Expiry sweep (every 5 minutes)");

    // Job 2: Heartbeat (hourly)
    scheduler
        .add(Job::new_async("0 0 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (hourly)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    // One sweep right away so a restart doesn't wait for the next tick.
    match sweeper.run().await {
        Ok(Some(report)) => info!(
            expired = report.expired,
            warned = report.warned,
            reconciled = report.reconciled,
            escalated = report.escalated,
            errors = report.errors,
            "Initial sweep complete"
        ),
        Ok(None) => {}
        Err(e) => error!(error = %e, "Initial sweep failed"),
    }

    // The scheduler runs jobs in background tasks.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
