//! Job record persistence
//!
//! Every enqueued job is mirrored by a row describing its lifecycle. The
//! subsystem owns all status mutations but never deletes rows; retention is
//! an external concern. The store is consumed through the narrow [`JobStore`]
//! trait so tests can run against an in-memory implementation.

use crate::error::{QueueError, QueueResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::str::FromStr;
use strum::{Display, EnumIter, EnumString};

/// Job lifecycle status.
///
/// Transitions: `pending → processing → completed`;
/// `processing → failed` (handler error); `pending → failed` (publish
/// failure); `failed → pending` (manual retry while under `max_attempts`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A persisted job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Identifier assigned by the store on insert; embedded in the wire
    /// message as `job_id` so deliveries correlate back to the record.
    pub id: i64,
    pub queue: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub error: Option<String>,
    pub available_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Whether this record is eligible for another retry.
    pub fn retryable(&self) -> bool {
        self.status == JobStatus::Failed && self.attempts < self.max_attempts
    }
}

/// Fields required to create a record.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
}

/// Aggregate job counts grouped by status. Statuses absent from the store
/// default to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl QueueStats {
    pub fn from_counts(counts: &[(JobStatus, i64)]) -> Self {
        let mut stats = Self::default();
        for (status, count) in counts {
            match status {
                JobStatus::Pending => stats.pending = *count,
                JobStatus::Processing => stats.processing = *count,
                JobStatus::Completed => stats.completed = *count,
                JobStatus::Failed => stats.failed = *count,
            }
        }
        stats
    }
}

/// Data access interface for job records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` record and return it with its assigned id.
    async fn insert(&self, job: NewJob) -> QueueResult<JobRecord>;

    /// Idempotent status write. Sets `started_at` and consumes one attempt
    /// for `processing`, `completed_at` for `completed`, and `error` for
    /// `failed`.
    async fn update_status(
        &self,
        id: i64,
        status: JobStatus,
        error: Option<String>,
    ) -> QueueResult<()>;

    /// Records eligible for retry (`failed` and under `max_attempts`),
    /// oldest first.
    async fn select_retryable(&self, limit: i64) -> QueueResult<Vec<JobRecord>>;

    /// Increment `attempts` and flip the record back to `pending`.
    async fn mark_retry(&self, id: i64) -> QueueResult<()>;

    /// Counts grouped by status.
    async fn counts_by_status(&self) -> QueueResult<Vec<(JobStatus, i64)>>;

    /// Fetch a single record.
    async fn get(&self, id: i64) -> QueueResult<Option<JobRecord>>;
}

/// DDL for the jobs table. The schema is owned by the application's
/// migration pipeline; this constant exists for local development and tests.
pub const JOBS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id           BIGSERIAL PRIMARY KEY,
    queue        TEXT NOT NULL,
    data         JSONB NOT NULL,
    status       TEXT NOT NULL DEFAULT 'pending',
    attempts     INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    error        TEXT,
    available_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    started_at   TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at   TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS jobs_status_available_at_idx ON jobs (status, available_at);
CREATE INDEX IF NOT EXISTS jobs_queue_status_idx ON jobs (queue, status);
"#;

/// Apply [`JOBS_SCHEMA`] to the given pool.
pub async fn ensure_schema(pool: &PgPool) -> QueueResult<()> {
    sqlx::raw_sql(JOBS_SCHEMA).execute(pool).await?;
    Ok(())
}

/// Row shape as stored; status travels as text and is parsed on read.
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    queue: String,
    data: serde_json::Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    error: Option<String>,
    available_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::from_str(&row.status).map_err(|_| {
            QueueError::internal(format!("Unknown job status in store: {}", row.status))
        })?;

        Ok(JobRecord {
            id: row.id,
            queue: row.queue,
            payload: row.data,
            status,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            error: row.error,
            available_at: row.available_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, queue, data, status, attempts, max_attempts, error, \
     available_at, started_at, completed_at, created_at, updated_at";

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: NewJob) -> QueueResult<JobRecord> {
        let sql = format!(
            "INSERT INTO jobs (queue, data, status, attempts, max_attempts) \
             VALUES ($1, $2, 'pending', 0, $3) \
             RETURNING {JOB_COLUMNS}"
        );
        let row: JobRow = sqlx::query_as(&sql)
            .bind(&job.queue)
            .bind(&job.payload)
            .bind(job.max_attempts)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn update_status(
        &self,
        id: i64,
        status: JobStatus,
        error: Option<String>,
    ) -> QueueResult<()> {
        sqlx::query(
            "UPDATE jobs SET \
                status = $2, \
                started_at = CASE WHEN $2 = 'processing' THEN now() ELSE started_at END, \
                attempts = attempts + CASE WHEN $2 = 'processing' THEN 1 ELSE 0 END, \
                completed_at = CASE WHEN $2 = 'completed' THEN now() ELSE completed_at END, \
                error = CASE WHEN $2 = 'failed' THEN $3 ELSE error END, \
                updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.to_string())
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn select_retryable(&self, limit: i64) -> QueueResult<Vec<JobRecord>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status = 'failed' AND attempts < max_attempts \
             ORDER BY created_at ASC \
             LIMIT $1"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql).bind(limit).fetch_all(&self.pool).await?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn mark_retry(&self, id: i64) -> QueueResult<()> {
        sqlx::query(
            "UPDATE jobs SET \
                attempts = attempts + 1, \
                status = 'pending', \
                error = NULL, \
                updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn counts_by_status(&self) -> QueueResult<Vec<(JobStatus, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for (raw_status, count) in rows {
            let status = JobStatus::from_str(&raw_status).map_err(|_| {
                QueueError::internal(format!("Unknown job status in store: {raw_status}"))
            })?;
            counts.push((status, count));
        }
        Ok(counts)
    }

    async fn get(&self, id: i64) -> QueueResult<Option<JobRecord>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(JobRecord::try_from).transpose()
    }
}
