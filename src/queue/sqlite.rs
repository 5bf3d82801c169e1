//! SQLite-backed queue.
//!
//! The claim is a single `UPDATE ... WHERE id IN (SELECT ...) RETURNING`
//! statement, so two workers racing on the same database can never lease
//! the same job. Timestamps are stored as unix milliseconds so availability
//! and lease-expiry comparisons are plain integer comparisons.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::time::Duration;

use super::{EnqueueRequest, JobQueue, QueueStats};
use crate::models::{generate_id, Job, JobKind, JobStatus};
use crate::{GyreError, Result};

#[derive(Debug, Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for SqliteQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Job> {
        let id = generate_id();
        let now = now_ms();
        let available_at = now + request.delay.as_millis() as i64;

        sqlx::query(
            "INSERT INTO jobs (id, kind, ref_id, status, payload, attempts, max_attempts,
                               priority, available_at, created_at, updated_at)
             VALUES (?, ?, ?, 'queued', ?, 0, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(request.kind.as_str())
        .bind(&request.ref_id)
        .bind(serde_json::to_string(&request.payload)?)
        .bind(request.max_attempts.max(1) as i64)
        .bind(request.priority as i64)
        .bind(available_at)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(&id)
            .await?
            .ok_or_else(|| GyreError::Queue(format!("job not found after insert: {id}")))
    }

    async fn dequeue(&self, worker_id: &str, visibility_timeout: Duration) -> Result<Option<Job>> {
        let now = now_ms();
        let lease_cutoff = now - visibility_timeout.as_millis() as i64;

        // One statement claims and returns the job; rowid breaks created_at
        // ties so FIFO holds within a priority even at millisecond
        // resolution.
        let row = sqlx::query(
            "UPDATE jobs
             SET status = 'running', attempts = attempts + 1,
                 locked_at = ?, locked_by = ?, updated_at = ?
             WHERE id IN (
                 SELECT id FROM jobs
                 WHERE (status = 'queued' AND available_at <= ?)
                    OR (status = 'running' AND locked_at < ?)
                 ORDER BY priority DESC, created_at ASC, rowid ASC
                 LIMIT 1
             )
             RETURNING *",
        )
        .bind(now)
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .bind(lease_cutoff)
        .fetch_optional(&self.pool)
        .await?;

        row.map(job_from_row).transpose()
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs
             SET status = 'succeeded', locked_at = NULL, locked_by = NULL,
                 last_error = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(now_ms())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(
        &self,
        job_id: &str,
        error: &str,
        retry: bool,
        retry_delay: Duration,
    ) -> Result<()> {
        let Some(job) = self.get(job_id).await? else {
            return Ok(());
        };
        let now = now_ms();

        if retry && job.attempts < job.max_attempts {
            let available_at = now + retry_delay.as_millis() as i64;
            sqlx::query(
                "UPDATE jobs
                 SET status = 'queued', available_at = ?, locked_at = NULL,
                     locked_by = NULL, last_error = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(available_at)
            .bind(error)
            .bind(now)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE jobs
                 SET status = 'failed', locked_at = NULL, locked_by = NULL,
                     last_error = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(error)
            .bind(now)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn cancel(&self, job_id: &str, reason: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE jobs
             SET status = 'canceled', locked_at = NULL, locked_by = NULL,
                 last_error = ?, updated_at = ?
             WHERE id = ? AND status IN ('queued', 'running')",
        )
        .bind(reason)
        .bind(now_ms())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(job_from_row).transpose()
    }

    async fn get_latest_by_ref(&self, kind: JobKind, ref_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT * FROM jobs WHERE kind = ? AND ref_id = ?
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(kind.as_str())
        .bind(ref_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(job_from_row).transpose()
    }

    async fn cancel_queued_by_ref(&self, kind: JobKind, ref_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'canceled', updated_at = ?
             WHERE kind = ? AND ref_id = ? AND status = 'queued'",
        )
        .bind(now_ms())
        .bind(kind.as_str())
        .bind(ref_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn extend_visibility(&self, job_id: &str, additional: Duration) -> Result<bool> {
        // The effective lease deadline is locked_at + visibility_timeout;
        // moving locked_at into the future pushes the deadline out.
        let new_locked_at = now_ms() + additional.as_millis() as i64;
        let result = sqlx::query(
            "UPDATE jobs SET locked_at = ?, updated_at = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(new_locked_at)
        .bind(now_ms())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail_all_running(&self, error: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'failed', locked_at = NULL, locked_by = NULL,
                 last_error = ?, updated_at = ?
             WHERE status = 'running'",
        )
        .bind(error)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();

        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let count = row.get::<i64, _>("count") as u64;
            match row.get::<String, _>("status").as_str() {
                "queued" => stats.queued = count,
                "running" => stats.running = count,
                "succeeded" => stats.succeeded = count,
                "failed" => stats.failed = count,
                "canceled" => stats.canceled = count,
                _ => {}
            }
        }

        let rows = sqlx::query(
            "SELECT kind, COUNT(*) AS count FROM jobs
             WHERE status IN ('queued', 'running') GROUP BY kind",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            stats
                .by_kind
                .insert(row.get("kind"), row.get::<i64, _>("count") as u64);
        }

        Ok(stats)
    }
}

fn job_from_row(row: SqliteRow) -> Result<Job> {
    let payload = serde_json::from_str(row.get::<String, _>("payload").as_str())
        .unwrap_or(serde_json::Value::Object(Default::default()));
    let kind = row
        .get::<String, _>("kind")
        .parse::<JobKind>()
        .map_err(GyreError::Queue)?;
    let status = row
        .get::<String, _>("status")
        .parse::<JobStatus>()
        .map_err(GyreError::Queue)?;

    Ok(Job {
        id: row.get("id"),
        kind,
        ref_id: row.get("ref_id"),
        status,
        payload,
        attempts: row.get::<i64, _>("attempts") as u32,
        max_attempts: row.get::<i64, _>("max_attempts") as u32,
        priority: row.get::<i64, _>("priority") as i32,
        available_at: ms_to_datetime(row.get::<i64, _>("available_at")),
        locked_at: row.get::<Option<i64>, _>("locked_at").map(ms_to_datetime),
        locked_by: row.get("locked_by"),
        last_error: row.get("last_error"),
        created_at: ms_to_datetime(row.get::<i64, _>("created_at")),
        updated_at: ms_to_datetime(row.get::<i64, _>("updated_at")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use std::collections::HashSet;
    use std::sync::Arc;

    async fn queue() -> (Database, SqliteQueue) {
        let db = Database::connect_memory().await.unwrap();
        let queue = SqliteQueue::new(db.pool().clone());
        (db, queue)
    }

    #[tokio::test]
    async fn enqueue_dequeue_complete_round_trip() {
        let (_db, queue) = queue().await;

        let job = queue
            .enqueue(EnqueueRequest::new(JobKind::RunExecute, "run-1"))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);

        let leased = queue
            .dequeue("w1", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, job.id);
        assert_eq!(leased.status, JobStatus::Running);
        assert_eq!(leased.attempts, 1);
        assert_eq!(leased.locked_by.as_deref(), Some("w1"));

        queue.complete(&job.id).await.unwrap();
        let done = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.attempts, 1);
        assert!(done.locked_by.is_none());
    }

    #[tokio::test]
    async fn fail_requeues_until_attempts_exhausted() {
        let (_db, queue) = queue().await;

        let job = queue
            .enqueue(EnqueueRequest::new(JobKind::RunExecute, "run-1").max_attempts(3))
            .await
            .unwrap();

        let leased = queue
            .dequeue("w1", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        queue
            .fail(&leased.id, "boom", true, Duration::ZERO)
            .await
            .unwrap();
        let requeued = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert_eq!(requeued.attempts, 1);
        assert_eq!(requeued.last_error.as_deref(), Some("boom"));

        let leased = queue
            .dequeue("w1", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.attempts, 2);
        queue.complete(&leased.id).await.unwrap();
        let done = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.attempts, 2);
    }

    #[tokio::test]
    async fn fail_without_retry_is_permanent() {
        let (_db, queue) = queue().await;

        let job = queue
            .enqueue(EnqueueRequest::new(JobKind::RunExecute, "run-1").max_attempts(5))
            .await
            .unwrap();
        queue.dequeue("w1", Duration::from_secs(60)).await.unwrap();
        queue
            .fail(&job.id, "precondition violated", false, Duration::ZERO)
            .await
            .unwrap();

        let failed = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn priority_dominates_then_fifo() {
        let (_db, queue) = queue().await;

        let low = queue
            .enqueue(EnqueueRequest::new(JobKind::RunExecute, "low").priority(0))
            .await
            .unwrap();
        let high_first = queue
            .enqueue(EnqueueRequest::new(JobKind::RunExecute, "high-1").priority(5))
            .await
            .unwrap();
        let high_second = queue
            .enqueue(EnqueueRequest::new(JobKind::RunExecute, "high-2").priority(5))
            .await
            .unwrap();

        let order: Vec<String> = [
            queue.dequeue("w", Duration::from_secs(60)).await.unwrap(),
            queue.dequeue("w", Duration::from_secs(60)).await.unwrap(),
            queue.dequeue("w", Duration::from_secs(60)).await.unwrap(),
        ]
        .into_iter()
        .map(|j| j.unwrap().id)
        .collect();

        assert_eq!(order, vec![high_first.id, high_second.id, low.id]);
    }

    #[tokio::test]
    async fn delayed_job_is_invisible_until_available() {
        let (_db, queue) = queue().await;

        queue
            .enqueue(EnqueueRequest::new(JobKind::RunExecute, "run-1").delay(Duration::from_millis(150)))
            .await
            .unwrap();

        assert!(queue
            .dequeue("w", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(queue
            .dequeue("w", Duration::from_secs(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_with_attempt_count() {
        let (_db, queue) = queue().await;

        let job = queue
            .enqueue(EnqueueRequest::new(JobKind::RunExecute, "run-1").max_attempts(3))
            .await
            .unwrap();

        // Worker 1 leases with a tiny visibility timeout, then "dies".
        queue
            .dequeue("w1", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let reclaimed = queue
            .dequeue("w2", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.attempts, 2);
        assert_eq!(reclaimed.locked_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn extend_visibility_defers_reclaim() {
        let (_db, queue) = queue().await;

        queue
            .enqueue(EnqueueRequest::new(JobKind::RunExecute, "run-1"))
            .await
            .unwrap();
        let leased = queue
            .dequeue("w1", Duration::from_millis(80))
            .await
            .unwrap()
            .unwrap();

        assert!(queue
            .extend_visibility(&leased.id, Duration::from_secs(60))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(120)).await;

        // Lease was extended, so the job is not reclaimable.
        assert!(queue
            .dequeue("w2", Duration::from_millis(80))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_only_pre_terminal() {
        let (_db, queue) = queue().await;

        let job = queue
            .enqueue(EnqueueRequest::new(JobKind::RunExecute, "run-1"))
            .await
            .unwrap();
        queue.cancel(&job.id, Some("user request")).await.unwrap();
        let canceled = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);
        assert_eq!(canceled.last_error.as_deref(), Some("user request"));

        // Second cancel is a no-op and does not overwrite the reason.
        queue.cancel(&job.id, Some("other")).await.unwrap();
        let still = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(still.last_error.as_deref(), Some("user request"));
    }

    #[tokio::test]
    async fn cancel_queued_by_ref_leaves_running_jobs() {
        let (_db, queue) = queue().await;

        let running = queue
            .enqueue(EnqueueRequest::new(JobKind::RunExecute, "run-1"))
            .await
            .unwrap();
        queue.dequeue("w1", Duration::from_secs(60)).await.unwrap();
        let queued = queue
            .enqueue(EnqueueRequest::new(JobKind::RunExecute, "run-1"))
            .await
            .unwrap();

        assert!(queue
            .cancel_queued_by_ref(JobKind::RunExecute, "run-1")
            .await
            .unwrap());
        assert_eq!(
            queue.get(&queued.id).await.unwrap().unwrap().status,
            JobStatus::Canceled
        );
        assert_eq!(
            queue.get(&running.id).await.unwrap().unwrap().status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn fail_all_running_clears_leases() {
        let (_db, queue) = queue().await;

        for n in 0..3 {
            queue
                .enqueue(EnqueueRequest::new(JobKind::RunExecute, format!("run-{n}")))
                .await
                .unwrap();
        }
        queue.dequeue("w1", Duration::from_secs(60)).await.unwrap();
        queue.dequeue("w1", Duration::from_secs(60)).await.unwrap();

        let failed = queue.fail_all_running("process restart").await.unwrap();
        assert_eq!(failed, 2);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.queued, 1);
    }

    #[tokio::test]
    async fn concurrent_dequeues_never_share_a_job() {
        // At-most-one-lease under racing workers: file-backed DB so multiple
        // pool connections contend on the same store.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let db = Database::connect(path.to_str().unwrap()).await.unwrap();
        let queue = Arc::new(SqliteQueue::new(db.pool().clone()));

        const JOBS: usize = 20;
        for n in 0..JOBS {
            queue
                .enqueue(EnqueueRequest::new(JobKind::RunExecute, format!("run-{n}")))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut leased = Vec::new();
                loop {
                    match queue
                        .dequeue(&format!("w{w}"), Duration::from_secs(60))
                        .await
                        .unwrap()
                    {
                        Some(job) => leased.push(job.id),
                        None => break,
                    }
                }
                leased
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), JOBS);
        assert_eq!(unique.len(), JOBS);
    }
}
