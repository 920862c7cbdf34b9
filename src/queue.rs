//! Source-sync work queue.
//!
//! A request moves through `queued → processing → completed | failed`.
//! Delivery is at-least-once: a handler failure re-queues the request with
//! exponential backoff (`backoff_base * 2^(attempts - 1)`) until
//! `max_attempts` is reached, and requests left `processing` by a stopped
//! worker are released back to `queued` on the next start.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::sqlite_store::{from_millis, to_millis};

const ENQUEUE_ATTEMPTS: usize = 3;

/// Result of an enqueue call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    Created(String),
    /// A queued or processing request already exists for the source.
    Duplicate(String),
}

impl EnqueueResult {
    pub fn request_id(&self) -> &str {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// A claimed request.
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub request_id: String,
    pub source_id: String,
    pub requested_at: DateTime<Utc>,
    /// Attempt number of this delivery, starting at 1.
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    RetryAt(DateTime<Utc>),
    Exhausted,
}

/// Stored state of a request.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub id: String,
    pub source_id: String,
    pub status: String,
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[async_trait]
pub trait SyncQueue: Send + Sync {
    /// Request a sync of `source_id`.
    async fn enqueue(&self, source_id: &str, now: DateTime<Utc>) -> Result<EnqueueResult>;

    /// Claim the oldest available request, marking it `processing`.
    async fn claim(&self, now: DateTime<Utc>) -> Result<Option<SyncJob>>;

    /// Mark a request `completed`. `error` carries non-fatal run errors.
    async fn complete(&self, request_id: &str, error: Option<&str>, now: DateTime<Utc>)
        -> Result<()>;

    /// Record a failed attempt and schedule a retry if attempts remain.
    async fn fail(&self, request_id: &str, error: &str, now: DateTime<Utc>)
        -> Result<FailOutcome>;

    /// Return every `processing` request to `queued`. Returns how many.
    async fn release_in_flight(&self) -> Result<u64>;
}

/// Delay before the retry that follows attempt number `attempts`.
pub fn retry_delay(base: Duration, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    base * 2u32.pow(exponent)
}

/// [`SyncQueue`] on the `source_sync_request` table.
pub struct SqliteQueue {
    pool: SqlitePool,
    max_attempts: u32,
    backoff_base: Duration,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, config: &WorkerConfig) -> Self {
        Self {
            pool,
            max_attempts: config.max_attempts,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        }
    }

    pub async fn get(&self, request_id: &str) -> Result<Option<SyncRequest>> {
        let row = sqlx::query(
            "SELECT id, source_id, status, attempts, available_at, processed_at, error FROM source_sync_request WHERE id = ?",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| SyncRequest {
            id: r.get("id"),
            source_id: r.get("source_id"),
            status: r.get("status"),
            attempts: r.get::<i64, _>("attempts") as u32,
            available_at: from_millis(r.get("available_at")),
            processed_at: r.get::<Option<i64>, _>("processed_at").map(from_millis),
            error: r.get("error"),
        }))
    }
}

#[async_trait]
impl SyncQueue for SqliteQueue {
    async fn enqueue(&self, source_id: &str, now: DateTime<Utc>) -> Result<EnqueueResult> {
        // The partial unique index allows one pending request per source.
        for _ in 0..ENQUEUE_ATTEMPTS {
            let id = Uuid::new_v4().to_string();
            let inserted = sqlx::query(
                r#"
                INSERT INTO source_sync_request (id, source_id, requested_at, status, attempts, available_at)
                VALUES (?, ?, ?, 'queued', 0, ?)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&id)
            .bind(source_id)
            .bind(to_millis(now))
            .bind(to_millis(now))
            .execute(&self.pool)
            .await?
            .rows_affected();

            if inserted == 1 {
                tracing::debug!(source = %source_id, request_id = %id, "enqueued sync request");
                return Ok(EnqueueResult::Created(id));
            }

            let pending: Option<String> = sqlx::query_scalar(
                "SELECT id FROM source_sync_request WHERE source_id = ? AND status IN ('queued', 'processing') LIMIT 1",
            )
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(id) = pending {
                return Ok(EnqueueResult::Duplicate(id));
            }
            // The pending request finished between the two statements.
        }
        anyhow::bail!("could not enqueue a sync request for {}", source_id)
    }

    async fn claim(&self, now: DateTime<Utc>) -> Result<Option<SyncJob>> {
        let row = sqlx::query(
            r#"
            UPDATE source_sync_request
            SET status = 'processing', attempts = attempts + 1, processed_at = NULL, error = NULL
            WHERE id = (
                SELECT id FROM source_sync_request
                WHERE status = 'queued' AND available_at <= ?
                ORDER BY available_at ASC, requested_at ASC
                LIMIT 1
            )
            RETURNING id, source_id, requested_at, attempts
            "#,
        )
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| SyncJob {
            request_id: r.get("id"),
            source_id: r.get("source_id"),
            requested_at: from_millis(r.get("requested_at")),
            attempts: r.get::<i64, _>("attempts") as u32,
        }))
    }

    async fn complete(
        &self,
        request_id: &str,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE source_sync_request SET status = 'completed', processed_at = ?, error = ? WHERE id = ?",
        )
        .bind(to_millis(now))
        .bind(error)
        .bind(request_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, request_id: &str, error: &str, now: DateTime<Utc>) -> Result<FailOutcome> {
        let attempts: i64 =
            sqlx::query_scalar("SELECT attempts FROM source_sync_request WHERE id = ?")
                .bind(request_id)
                .fetch_one(&self.pool)
                .await?;
        let attempts = attempts.max(0) as u32;

        if attempts < self.max_attempts {
            let delay = chrono::Duration::from_std(retry_delay(self.backoff_base, attempts))?;
            let retry_at = now + delay;
            sqlx::query(
                "UPDATE source_sync_request SET status = 'queued', available_at = ?, processed_at = ?, error = ? WHERE id = ?",
            )
            .bind(to_millis(retry_at))
            .bind(to_millis(now))
            .bind(error)
            .bind(request_id)
            .execute(&self.pool)
            .await?;
            return Ok(FailOutcome::RetryAt(retry_at));
        }

        sqlx::query(
            "UPDATE source_sync_request SET status = 'failed', processed_at = ?, error = ? WHERE id = ?",
        )
        .bind(to_millis(now))
        .bind(error)
        .bind(request_id)
        .execute(&self.pool)
        .await?;
        Ok(FailOutcome::Exhausted)
    }

    async fn release_in_flight(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE source_sync_request SET status = 'queued' WHERE status = 'processing'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_schema;
    use tempfile::TempDir;

    async fn queue(max_attempts: u32) -> (TempDir, SqliteQueue) {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect_path(&tmp.path().join("queue.sqlite"))
            .await
            .unwrap();
        apply_schema(&pool).await.unwrap();
        let config = WorkerConfig {
            max_attempts,
            backoff_base_ms: 1000,
            ..Default::default()
        };
        (tmp, SqliteQueue::new(pool, &config))
    }

    #[test]
    fn test_retry_delay_is_exponential() {
        let base = Duration::from_millis(3000);
        assert_eq!(retry_delay(base, 1), Duration::from_millis(3000));
        assert_eq!(retry_delay(base, 2), Duration::from_millis(6000));
        assert_eq!(retry_delay(base, 3), Duration::from_millis(12000));
    }

    #[tokio::test]
    async fn test_enqueue_dedupes_pending_requests() {
        let (_tmp, q) = queue(3).await;
        let now = Utc::now();
        let first = q.enqueue("stripe", now).await.unwrap();
        assert!(first.is_created());
        let second = q.enqueue("stripe", now).await.unwrap();
        assert_eq!(second, EnqueueResult::Duplicate(first.request_id().to_string()));
        assert!(q.enqueue("plaid", now).await.unwrap().is_created());
    }

    #[tokio::test]
    async fn test_claim_complete_lifecycle() {
        let (_tmp, q) = queue(3).await;
        let now = Utc::now();
        let id = q.enqueue("stripe", now).await.unwrap().request_id().to_string();

        let job = q.claim(now).await.unwrap().unwrap();
        assert_eq!(job.request_id, id);
        assert_eq!(job.attempts, 1);
        assert_eq!(q.get(&id).await.unwrap().unwrap().status, "processing");
        assert!(q.claim(now).await.unwrap().is_none());

        q.complete(&id, Some("https://a: sanitized 1 suspicious line(s) [x]"), now)
            .await
            .unwrap();
        let req = q.get(&id).await.unwrap().unwrap();
        assert_eq!(req.status, "completed");
        assert!(req.processed_at.is_some());
        assert!(req.error.unwrap().contains("sanitized"));

        // A finished request no longer blocks a new one.
        assert!(q.enqueue("stripe", now).await.unwrap().is_created());
    }

    #[tokio::test]
    async fn test_fail_retries_with_backoff_then_exhausts() {
        let (_tmp, q) = queue(2).await;
        let now = Utc::now();
        let id = q.enqueue("stripe", now).await.unwrap().request_id().to_string();

        q.claim(now).await.unwrap().unwrap();
        let outcome = q.fail(&id, "boom", now).await.unwrap();
        let retry_at = match outcome {
            FailOutcome::RetryAt(at) => at,
            FailOutcome::Exhausted => panic!("expected a retry"),
        };
        assert_eq!(to_millis(retry_at) - to_millis(now), 1000);
        assert!(q.claim(now).await.unwrap().is_none());

        let job = q.claim(retry_at).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(q.fail(&id, "boom again", retry_at).await.unwrap(), FailOutcome::Exhausted);

        let req = q.get(&id).await.unwrap().unwrap();
        assert_eq!(req.status, "failed");
        assert_eq!(req.error.as_deref(), Some("boom again"));
    }

    #[tokio::test]
    async fn test_release_in_flight_requeues() {
        let (_tmp, q) = queue(3).await;
        let now = Utc::now();
        q.enqueue("stripe", now).await.unwrap();
        q.claim(now).await.unwrap().unwrap();
        assert_eq!(q.release_in_flight().await.unwrap(), 1);
        let job = q.claim(now).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn test_concurrent_enqueue_creates_one_request() {
        let (_tmp, q) = queue(3).await;
        let q = std::sync::Arc::new(q);
        let now = Utc::now();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let q = q.clone();
            tasks.spawn(async move { q.enqueue("stripe", now).await.unwrap() });
        }
        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.unwrap());
        }

        assert_eq!(results.iter().filter(|r| r.is_created()).count(), 1);
        let id = results[0].request_id().to_string();
        assert!(results.iter().all(|r| r.request_id() == id));
    }

    #[tokio::test]
    async fn test_pending_index_rejects_second_pending_row() {
        let (_tmp, q) = queue(3).await;
        q.enqueue("stripe", Utc::now()).await.unwrap();
        let raw = sqlx::query(
            "INSERT INTO source_sync_request (id, source_id, requested_at, status, attempts, available_at) VALUES ('x', 'stripe', 0, 'processing', 1, 0)",
        )
        .execute(&q.pool)
        .await;
        assert!(raw.is_err());
    }
}
