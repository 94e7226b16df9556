//! Send job repository
//!
//! Item status updates are guarded by the expected current status, so
//! an item only ever moves forward (`pending → queued → sent|failed`).

use crate::db::DatabasePool;
use crate::models::{
    ItemStatus, JobStats, JobStatus, NewJobItem, NewSendJob, Page, SendJob, SendJobItem,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaymail_common::types::{JobId, JobItemId};
use relaymail_common::{Error, Result};
use uuid::Uuid;

/// Send job repository trait
#[async_trait]
pub trait SendJobRepository: Send + Sync {
    /// Create a job together with its items
    async fn create(&self, input: NewSendJob, items: Vec<NewJobItem>) -> Result<SendJob>;

    /// Get a job by ID
    async fn get(&self, id: JobId) -> Result<Option<SendJob>>;

    /// List jobs, newest first
    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Page<SendJob>>;

    /// All jobs in a status, oldest first
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<SendJob>>;

    /// Scheduled jobs whose start time is at or before `now`
    async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<SendJob>>;

    /// Move a job to `to` if its current status is one of `from`.
    ///
    /// Returns `None` when the job is missing or in another status.
    async fn transition(
        &self,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<Option<SendJob>>;

    /// Up to `limit` pending items of a job
    async fn pending_items(&self, job_id: JobId, limit: i64) -> Result<Vec<SendJobItem>>;

    /// Up to `limit` queued items with a remote message id, least recently checked first.
    ///
    /// Items never checked come before all others.
    async fn queued_items(&self, limit: i64) -> Result<Vec<SendJobItem>>;

    /// Stamp `last_checked_at` on items about to be reconciled
    async fn mark_items_checked(&self, ids: &[JobItemId]) -> Result<()>;

    /// Get an item by ID
    async fn get_item(&self, id: JobItemId) -> Result<Option<SendJobItem>>;

    /// `pending → queued`, recording the remote message id
    async fn mark_item_queued(&self, id: JobItemId, remote_message_id: &str) -> Result<bool>;

    /// `from → failed`, recording the error text
    async fn mark_item_failed(&self, id: JobItemId, from: ItemStatus, error: &str)
        -> Result<bool>;

    /// `queued → sent`
    async fn mark_item_sent(&self, id: JobItemId) -> Result<bool>;

    /// Reset failed items of a job to pending, clearing error and remote id
    async fn reset_failed_items(&self, job_id: JobId) -> Result<u64>;

    /// Count items per status and persist the counters on the job
    async fn refresh_stats(&self, job_id: JobId) -> Result<JobStats>;
}

/// Database send job repository
pub struct DbSendJobRepository {
    pool: DatabasePool,
}

impl DbSendJobRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn status_list(statuses: &[JobStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl SendJobRepository for DbSendJobRepository {
    async fn create(&self, input: NewSendJob, items: Vec<NewJobItem>) -> Result<SendJob> {
        let id = Uuid::now_v7();
        let now = Utc::now();
        let total = items.len() as i64;
        let servers = serde_json::to_value(&input.servers).unwrap_or_default();
        let started_at = (input.status == JobStatus::Running).then_some(now);

        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let job = sqlx::query_as::<_, SendJob>(
            r#"
            INSERT INTO send_jobs (
                id, campaign_id, status, servers, strategy, dry_run_limit, scheduled_at,
                total, pending, created_at, updated_at, started_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8, $9, $9, $10)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.campaign_id)
        .bind(input.status.to_string())
        .bind(&servers)
        .bind(input.strategy.to_string())
        .bind(input.dry_run_limit)
        .bind(input.scheduled_at)
        .bind(total)
        .bind(now)
        .bind(started_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO send_job_items (
                    id, job_id, recipient_id, variant_id, server_name, status,
                    created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, 'pending', $6, $6)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(id)
            .bind(item.recipient_id)
            .bind(item.variant_id)
            .bind(&item.server_name)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<SendJob>> {
        sqlx::query_as::<_, SendJob>("SELECT * FROM send_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Page<SendJob>> {
        let status = status.map(|s| s.to_string());

        let items = sqlx::query_as::<_, SendJob>(
            r#"
            SELECT * FROM send_jobs
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(&status)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let (total,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM send_jobs WHERE ($1::TEXT IS NULL OR status = $1)",
        )
        .bind(&status)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Page::new(items, total))
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<SendJob>> {
        sqlx::query_as::<_, SendJob>(
            "SELECT * FROM send_jobs WHERE status = $1 ORDER BY created_at ASC",
        )
        .bind(status.to_string())
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<SendJob>> {
        sqlx::query_as::<_, SendJob>(
            r#"
            SELECT * FROM send_jobs
            WHERE status = 'scheduled' AND (scheduled_at IS NULL OR scheduled_at <= $1)
            ORDER BY scheduled_at ASC NULLS FIRST
            "#,
        )
        .bind(now)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn transition(
        &self,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<Option<SendJob>> {
        let now = Utc::now();

        sqlx::query_as::<_, SendJob>(
            r#"
            UPDATE send_jobs
            SET status = $3,
                updated_at = $4,
                started_at = CASE WHEN $3 = 'running' THEN COALESCE(started_at, $4) ELSE started_at END,
                completed_at = CASE
                    WHEN $3 IN ('completed', 'failed', 'cancelled') THEN $4
                    WHEN $3 = 'running' THEN NULL
                    ELSE completed_at
                END
            WHERE id = $1 AND status = ANY($2)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status_list(from))
        .bind(to.to_string())
        .bind(now)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn pending_items(&self, job_id: JobId, limit: i64) -> Result<Vec<SendJobItem>> {
        sqlx::query_as::<_, SendJobItem>(
            r#"
            SELECT * FROM send_job_items
            WHERE job_id = $1 AND status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn queued_items(&self, limit: i64) -> Result<Vec<SendJobItem>> {
        sqlx::query_as::<_, SendJobItem>(
            r#"
            SELECT * FROM send_job_items
            WHERE status = 'queued' AND remote_message_id IS NOT NULL
            ORDER BY last_checked_at ASC NULLS FIRST, updated_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn mark_items_checked(&self, ids: &[JobItemId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        sqlx::query("UPDATE send_job_items SET last_checked_at = $2 WHERE id = ANY($1)")
            .bind(ids)
            .bind(Utc::now())
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn get_item(&self, id: JobItemId) -> Result<Option<SendJobItem>> {
        sqlx::query_as::<_, SendJobItem>("SELECT * FROM send_job_items WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn mark_item_queued(&self, id: JobItemId, remote_message_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE send_job_items
            SET status = 'queued', remote_message_id = $2, last_error = NULL, updated_at = $3
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(remote_message_id)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_item_failed(
        &self,
        id: JobItemId,
        from: ItemStatus,
        error: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE send_job_items
            SET status = 'failed', last_error = $3, updated_at = $4
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.to_string())
        .bind(error)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_item_sent(&self, id: JobItemId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE send_job_items
            SET status = 'sent', updated_at = $2
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn reset_failed_items(&self, job_id: JobId) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE send_job_items
            SET status = 'pending', last_error = NULL, remote_message_id = NULL,
                last_checked_at = NULL, updated_at = $2
            WHERE job_id = $1 AND status = 'failed'
            "#,
        )
        .bind(job_id)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn refresh_stats(&self, job_id: JobId) -> Result<JobStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM send_job_items WHERE job_id = $1 GROUP BY status",
        )
        .bind(job_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let stats = stats_from_counts(rows.iter().map(|(s, c)| (s.as_str(), *c)));

        sqlx::query(
            r#"
            UPDATE send_jobs
            SET total = $2, pending = $3, queued = $4, sent = $5, failed = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(stats.total)
        .bind(stats.pending)
        .bind(stats.queued)
        .bind(stats.sent)
        .bind(stats.failed)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(stats)
    }
}

/// Fold `(status, count)` pairs into job stats; unknown statuses only add to the total
pub fn stats_from_counts<'a>(counts: impl IntoIterator<Item = (&'a str, i64)>) -> JobStats {
    let mut stats = JobStats::default();
    for (status, count) in counts {
        stats.total += count;
        match status.parse::<ItemStatus>() {
            Ok(ItemStatus::Pending) => stats.pending += count,
            Ok(ItemStatus::Queued) => stats.queued += count,
            Ok(ItemStatus::Sent) => stats.sent += count,
            Ok(ItemStatus::Failed) => stats.failed += count,
            Err(_) => {}
        }
    }
    stats
}
