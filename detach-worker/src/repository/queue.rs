//! Queue Repository
//!
//! Claims pending rows of the shared job queue. Claiming selects the
//! oldest pending row with `FOR UPDATE SKIP LOCKED` and marks it claimed in
//! the same transaction, so concurrent workers each get a distinct row or
//! nothing, without waiting on each other's locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use detach_core::domain::{QueueRow, QueueStatus};
use sqlx::PgPool;

use crate::error::QueueError;

/// Shared job queue as seen by one worker
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Atomically claims the oldest pending row for `worker_id`
    async fn claim_next(&self, worker_id: &str) -> Result<Option<QueueRow>, QueueError>;

    /// Returns a claimed row to `pending`; false if it was not claimed
    async fn release(&self, id: i64) -> Result<bool, QueueError>;

    /// Marks a claimed row `done`; false if it was not claimed
    async fn complete(&self, id: i64) -> Result<bool, QueueError>;

    /// Adds a pending row
    async fn enqueue(&self, payload: serde_json::Value) -> Result<QueueRow, QueueError>;

    /// Rows currently claimed by `worker_id`, oldest first
    async fn list_claimed(&self, worker_id: &str) -> Result<Vec<QueueRow>, QueueError>;
}

/// PostgreSQL-backed queue
#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn claim_next(&self, worker_id: &str) -> Result<Option<QueueRow>, QueueError> {
        let mut tx = self.pool.begin().await?;

        let candidate = sqlx::query_as::<_, QueueRecord>(
            r#"
            SELECT id, payload, status, claimed_by, created_at, updated_at
            FROM job_queue
            WHERE status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(candidate) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        let claimed = sqlx::query_as::<_, QueueRecord>(
            r#"
            UPDATE job_queue
            SET status = 'claimed', claimed_by = $1, updated_at = now()
            WHERE id = $2
            RETURNING id, payload, status, claimed_by, created_at, updated_at
            "#,
        )
        .bind(worker_id)
        .bind(candidate.id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!("Worker {} claimed queue row {}", worker_id, claimed.id);
        claimed.try_into().map(Some)
    }

    async fn release(&self, id: i64) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'pending', claimed_by = NULL, updated_at = now()
            WHERE id = $1 AND status = 'claimed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete(&self, id: i64) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'done', updated_at = now()
            WHERE id = $1 AND status = 'claimed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn enqueue(&self, payload: serde_json::Value) -> Result<QueueRow, QueueError> {
        let record = sqlx::query_as::<_, QueueRecord>(
            r#"
            INSERT INTO job_queue (payload, status)
            VALUES ($1, 'pending')
            RETURNING id, payload, status, claimed_by, created_at, updated_at
            "#,
        )
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        record.try_into()
    }

    async fn list_claimed(&self, worker_id: &str) -> Result<Vec<QueueRow>, QueueError> {
        let records = sqlx::query_as::<_, QueueRecord>(
            r#"
            SELECT id, payload, status, claimed_by, created_at, updated_at
            FROM job_queue
            WHERE status = 'claimed' AND claimed_by = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        records.into_iter().map(TryInto::try_into).collect()
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct QueueRecord {
    id: i64,
    payload: serde_json::Value,
    status: String,
    claimed_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<QueueRecord> for QueueRow {
    type Error = QueueError;

    fn try_from(record: QueueRecord) -> Result<Self, QueueError> {
        let status = record
            .status
            .parse::<QueueStatus>()
            .map_err(|e| QueueError::Malformed {
                id: record.id,
                reason: e.to_string(),
            })?;

        Ok(QueueRow {
            id: record.id,
            payload: record.payload,
            status,
            claimed_by: record.claimed_by,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}
