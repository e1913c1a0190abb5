use chrono::Utc;
use sqlx::PgPool;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::models::{JobStatus, TransactionJob};
use crate::domain::{TransactionDetails, TransactionType};
use crate::error::AppError;
use crate::services::reconciliation::ReconciliationService;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const BASE_RETRY_DELAY_MS: u64 = 2000;
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// One logical unit of work per key: a retried authorization and its
/// duplicate submissions all collapse onto the same in-flight job.
pub fn dedup_key(details: &TransactionDetails) -> String {
    format!(
        "{}-{}-{}",
        details.kind, details.processor_id, details.transaction_correlation_id
    )
}

/// Delay before retry `attempt` (1-based): 2s, 4s, 8s, ...
fn backoff_delay(attempt: i32) -> chrono::Duration {
    let exponent = attempt.saturating_sub(1).max(0).min(16) as u32;
    chrono::Duration::milliseconds((BASE_RETRY_DELAY_MS << exponent) as i64)
}

/// Durable work queue over the `transaction_jobs` table. Workers claim rows
/// with `FOR UPDATE SKIP LOCKED`, so any number of processes can consume
/// concurrently without double-claiming. Jobs are retained after completion
/// and terminal failure for operational inspection.
#[derive(Clone)]
pub struct JobQueue {
    pool: PgPool,
}

impl JobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueues one canonical record. Returns `None` when an in-flight job
    /// with the same dedup key absorbed the submission.
    pub async fn enqueue(
        &self,
        details: &TransactionDetails,
    ) -> Result<Option<TransactionJob>, AppError> {
        let payload = serde_json::to_value(details)?;
        let key = dedup_key(details);

        let job = sqlx::query_as::<_, TransactionJob>(
            r#"
            INSERT INTO transaction_jobs (id, dedup_key, payload, status, max_attempts)
            VALUES ($1, $2, $3, 'queued', $4)
            ON CONFLICT (dedup_key) WHERE status IN ('queued', 'running') DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&key)
        .bind(&payload)
        .bind(DEFAULT_MAX_ATTEMPTS)
        .fetch_optional(&self.pool)
        .await?;

        if job.is_none() {
            info!(dedup_key = %key, "duplicate submission collapsed into in-flight job");
        }

        Ok(job)
    }

    /// Claims the oldest due job, marking it running and consuming one
    /// attempt.
    pub async fn claim_next(&self) -> Result<Option<TransactionJob>, AppError> {
        let job = sqlx::query_as::<_, TransactionJob>(
            r#"
            UPDATE transaction_jobs
            SET status = 'running', attempts = attempts + 1, updated_at = NOW()
            WHERE id = (
                SELECT id FROM transaction_jobs
                WHERE status = 'queued' AND run_at <= NOW()
                ORDER BY run_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    pub async fn complete(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE transaction_jobs SET status = 'completed', updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Requeues with exponential backoff until the attempt limit, then
    /// parks the job in a terminal failed state.
    pub async fn fail(&self, job: &TransactionJob, error: &str) -> Result<JobStatus, AppError> {
        if job.attempts >= job.max_attempts {
            sqlx::query(
                r#"
                UPDATE transaction_jobs
                SET status = 'failed', last_error = $2, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job.id)
            .bind(error)
            .execute(&self.pool)
            .await?;
            return Ok(JobStatus::Failed);
        }

        let run_at = Utc::now() + backoff_delay(job.attempts);
        sqlx::query(
            r#"
            UPDATE transaction_jobs
            SET status = 'queued', last_error = $2, run_at = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(error)
        .bind(run_at)
        .execute(&self.pool)
        .await?;

        Ok(JobStatus::Queued)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<TransactionJob>, AppError> {
        let job = sqlx::query_as::<_, TransactionJob>(
            "SELECT * FROM transaction_jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }
}

/// Worker loop: claim, dispatch, settle the job's fate, repeat. Runs until
/// the process exits.
pub async fn run_worker(queue: JobQueue, service: ReconciliationService) {
    info!("transaction job worker started");

    loop {
        match queue.claim_next().await {
            Ok(Some(job)) => {
                if let Err(e) = handle_job(&queue, &service, &job).await {
                    error!(job_id = %job.id, error = %e, "transaction job failed");
                }
            }
            Ok(None) => sleep(POLL_INTERVAL).await,
            Err(e) => {
                error!(error = %e, "failed to claim next job");
                sleep(POLL_INTERVAL).await;
            }
        }
    }
}

/// Processes one claimed job and records the outcome on the queue row.
/// Split out from the loop so tests can drive jobs deterministically.
pub async fn handle_job(
    queue: &JobQueue,
    service: &ReconciliationService,
    job: &TransactionJob,
) -> Result<(), AppError> {
    info!(job_id = %job.id, attempt = job.attempts, "processing transaction job");

    match dispatch(service, job).await {
        Ok(()) => queue.complete(job.id).await,
        Err(e) => {
            match queue.fail(job, &e.to_string()).await? {
                JobStatus::Failed => {
                    warn!(job_id = %job.id, "job exhausted its attempts, retained as failed");
                }
                _ => {
                    info!(job_id = %job.id, "job requeued with backoff");
                }
            }
            Err(e)
        }
    }
}

async fn dispatch(service: &ReconciliationService, job: &TransactionJob) -> Result<(), AppError> {
    let details: TransactionDetails = serde_json::from_value(job.payload.clone())?;

    if !details.is_successful {
        // Unsuccessful records never reach the ledger.
        warn!(
            processor_id = %details.processor_id,
            correlation_id = %details.transaction_correlation_id,
            "dropping unsuccessful transaction record"
        );
        return Ok(());
    }

    match details.kind {
        TransactionType::Authorization => service.process_authorization(&details).await,
        TransactionType::Clearing => service.process_clearing(&details).await,
    }
}
