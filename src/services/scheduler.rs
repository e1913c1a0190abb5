use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use sqlx::PgPool;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

use crate::db::models::JobSchedule;
use crate::error::AppError;
use crate::services::reconciliation::ReconciliationService;

pub const CLEANUP_SCHEDULE_NAME: &str = "cleanup-expired-pending-clearing";
/// Top of every hour (sec min hour dom mon dow).
pub const CLEANUP_CRON: &str = "0 0 * * * *";

const TICK_INTERVAL: Duration = Duration::from_secs(30);

fn next_occurrence(cron_expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
    let schedule = Schedule::from_str(cron_expr)
        .map_err(|e| AppError::Internal(format!("invalid cron expression {:?}: {}", cron_expr, e)))?;

    schedule.after(&after).next().ok_or_else(|| {
        AppError::Internal(format!("cron expression {:?} never fires", cron_expr))
    })
}

/// Installs the hourly sweep of expired pending clearing transactions.
/// Any existing schedule entry of the same name is removed first, so
/// re-installation across process restarts sharing the database is
/// idempotent and never double-registers.
pub async fn install_cleanup_schedule(pool: &PgPool) -> Result<(), AppError> {
    let next_run_at = next_occurrence(CLEANUP_CRON, Utc::now())?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM job_schedules WHERE name = $1")
        .bind(CLEANUP_SCHEDULE_NAME)
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO job_schedules (name, cron_expr, next_run_at) VALUES ($1, $2, $3)")
        .bind(CLEANUP_SCHEDULE_NAME)
        .bind(CLEANUP_CRON)
        .bind(next_run_at)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    info!(
        schedule = CLEANUP_SCHEDULE_NAME,
        "scheduled hourly cleanup of expired pending clearing transactions"
    );

    Ok(())
}

/// Scheduler loop. `next_run_at` in the database is the source of truth, so
/// a slow or missed tick delays a sweep but never duplicates it.
pub async fn run_scheduler(pool: PgPool, service: ReconciliationService) {
    info!("cleanup scheduler started");

    loop {
        if let Err(e) = tick(&pool, &service).await {
            error!(error = %e, "scheduler tick failed");
        }

        sleep(TICK_INTERVAL).await;
    }
}

/// Claims due schedule rows with `SKIP LOCKED` so exactly one process runs
/// a given sweep; `next_run_at` is advanced before the sweep runs.
async fn tick(pool: &PgPool, service: &ReconciliationService) -> Result<(), AppError> {
    let mut tx = pool.begin().await?;

    let due: Vec<JobSchedule> = sqlx::query_as(
        "SELECT * FROM job_schedules WHERE next_run_at <= NOW() FOR UPDATE SKIP LOCKED",
    )
    .fetch_all(&mut *tx)
    .await?;

    for schedule in &due {
        let next_run_at = next_occurrence(&schedule.cron_expr, Utc::now())?;
        sqlx::query("UPDATE job_schedules SET next_run_at = $2, updated_at = NOW() WHERE name = $1")
            .bind(&schedule.name)
            .bind(next_run_at)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;

    for schedule in due {
        if schedule.name == CLEANUP_SCHEDULE_NAME {
            match service.cleanup_expired_pending_clearing().await {
                Ok(deleted) => info!(deleted, "cleanup sweep completed"),
                Err(e) => error!(error = %e, "cleanup sweep failed"),
            }
        }
    }

    Ok(())
}
