use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Upper bound for a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(6 * 60 * 60);

/// Job status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

/// Exponential backoff: `base_delay × 2^(attempt − 1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub base_delay: Duration,
}

impl Backoff {
    pub fn exponential(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 20) as u32;
        self.base_delay
            .checked_mul(2u32.pow(exponent))
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

/// Retry policy and routing declared by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub queue: String,
    pub max_attempts: i32,
    pub backoff: Backoff,
}

/// A named job with a JSON payload, ready to enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,
    pub payload: Value,
    pub options: JobOptions,
}

impl JobRequest {
    pub fn new<T: Serialize>(
        name: impl Into<String>,
        payload: &T,
        options: JobOptions,
    ) -> BillingResult<Self> {
        Ok(Self {
            name: name.into(),
            payload: serde_json::to_value(payload)?,
            options,
        })
    }
}

/// Job model mapping the `jobs` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub queue: String,
    pub payload: Value,
    pub status: JobStatus,
    /// Deliveries so far, including the current one
    pub attempts: i32,
    pub max_attempts: i32,
    pub backoff_base_ms: i64,
    pub run_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn backoff(&self) -> Backoff {
        Backoff::exponential(Duration::from_millis(self.backoff_base_ms.max(0) as u64))
    }

    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> BillingResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Anything that can accept follow-up jobs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueues `request` to run after `delay`.
    async fn enqueue(&self, request: JobRequest, delay: Duration) -> BillingResult<Uuid>;
}

const JOB_COLUMNS: &str = "id, name, queue, payload, status, attempts, max_attempts, \
     backoff_base_ms, run_at, locked_until, last_error, created_at, updated_at";

fn run_at(delay: Duration) -> BillingResult<DateTime<Utc>> {
    let delay = chrono::Duration::from_std(delay)
        .map_err(|_| BillingError::validation("job delay out of range"))?;
    Ok(Utc::now() + delay)
}

/// Durable job queue on the `jobs` table.
///
/// Delivery is at-least-once: a claimed job carries a lease, and a job whose
/// lease expires (worker crashed) is handed out again.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    lease: Duration,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, lease: Duration) -> Self {
        Self { pool, lease }
    }

    /// Enqueues inside an existing transaction, so the job only exists if
    /// the surrounding write commits.
    pub async fn enqueue_tx(
        tx: &mut Transaction<'_, Postgres>,
        request: JobRequest,
        delay: Duration,
    ) -> BillingResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO jobs (id, name, queue, payload, status, max_attempts, backoff_base_ms, run_at)
            VALUES ($1, $2, $3, $4, 'queued', $5, $6, $7)
            "#,
        )
        .bind(id)
        .bind(&request.name)
        .bind(&request.options.queue)
        .bind(&request.payload)
        .bind(request.options.max_attempts)
        .bind(request.options.backoff.base_delay.as_millis() as i64)
        .bind(run_at(delay)?)
        .execute(&mut **tx)
        .await?;

        info!(job_id = %id, job = %request.name, delay_secs = delay.as_secs(), "Job enqueued");
        Ok(id)
    }

    /// Claims the next due job on `queue`, if any.
    pub async fn claim(&self, queue: &str) -> BillingResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'running',
                attempts = attempts + 1,
                locked_until = $2,
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = $1
                  AND ((status = 'queued' AND run_at <= NOW())
                       OR (status = 'running' AND locked_until < NOW()))
                ORDER BY run_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(queue)
        .bind(run_at(self.lease)?)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Marks the delivery `job` done.
    ///
    /// Outcome writes only apply to the delivery that is still running: a
    /// worker whose lease expired and whose job was handed out again gets
    /// `Ok(false)` and must leave the job to the newer delivery.
    pub async fn complete(&self, job: &Job) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'done', locked_until = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND attempts = $2
            "#,
        )
        .bind(job.id)
        .bind(job.attempts)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn retry(&self, job: &Job, delay: Duration, error: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', run_at = $3, locked_until = NULL, last_error = $4, updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND attempts = $2
            "#,
        )
        .bind(job.id)
        .bind(job.attempts)
        .bind(run_at(delay)?)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn fail(&self, job: &Job, error: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', locked_until = NULL, last_error = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND attempts = $2
            "#,
        )
        .bind(job.id)
        .bind(job.attempts)
        .bind(error)
        .execute(&self.pool)
        .await?;
        let failed = result.rows_affected() == 1;
        if failed {
            warn!(job_id = %job.id, error = %error, "Job moved to failed");
        }
        Ok(failed)
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, request: JobRequest, delay: Duration) -> BillingResult<Uuid> {
        let mut tx = self.pool.begin().await?;
        let id = Self::enqueue_tx(&mut tx, request, delay).await?;
        tx.commit().await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let backoff = Backoff::exponential(Duration::from_secs(30));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(60));
        assert_eq!(backoff.delay_for(4), Duration::from_secs(240));
    }

    #[test]
    fn test_backoff_is_capped() {
        let backoff = Backoff::exponential(Duration::from_secs(30));
        assert_eq!(backoff.delay_for(30), MAX_BACKOFF);
    }

    #[test]
    fn test_job_request_serializes_payload() {
        #[derive(Serialize)]
        struct Payload {
            invoice_id: Uuid,
        }
        let id = Uuid::new_v4();
        let request = JobRequest::new(
            "fiscal.authorize_invoice",
            &Payload { invoice_id: id },
            JobOptions {
                queue: "fiscal".to_string(),
                max_attempts: 5,
                backoff: Backoff::exponential(Duration::from_secs(30)),
            },
        )
        .unwrap();
        assert_eq!(request.payload["invoice_id"], serde_json::json!(id));
    }
}
