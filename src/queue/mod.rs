//! Durable job queue with atomic lease, retry, delay, priority, and
//! visibility timeouts.
//!
//! Two interchangeable backends share this surface: an embedded SQLite
//! implementation (single claim statement inside the shared database) and a
//! Redis implementation (sorted sets plus Lua scripts). Selection happens in
//! configuration.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::models::{Job, JobKind};
use crate::Result;

mod redis_backend;
mod sqlite;

pub use redis_backend::RedisQueue;
pub use sqlite::SqliteQueue;

/// Parameters for a new job.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub kind: JobKind,
    pub ref_id: String,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
    pub delay: Duration,
    pub priority: i32,
}

impl EnqueueRequest {
    pub fn new(kind: JobKind, ref_id: impl Into<String>) -> Self {
        Self {
            kind,
            ref_id: ref_id.into(),
            payload: serde_json::json!({}),
            max_attempts: 1,
            delay: Duration::ZERO,
            priority: 0,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub canceled: u64,
    pub by_kind: HashMap<String, u64>,
}

/// Backend-neutral queue operations.
///
/// Delivery is at-least-once: a worker that crashes mid-job has its lease
/// expire after the visibility timeout and the job becomes claimable again,
/// so handlers must be idempotent.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a new job, visible after `delay`.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Job>;

    /// Atomically claim the next available job: the highest-priority queued
    /// job whose `available_at` has passed, or any running job whose lease
    /// has timed out. Returns None when nothing is claimable.
    async fn dequeue(&self, worker_id: &str, visibility_timeout: Duration) -> Result<Option<Job>>;

    async fn complete(&self, job_id: &str) -> Result<()>;

    /// Record a failure. With `retry` and remaining attempts, the job is
    /// requeued with `available_at = now + retry_delay`; otherwise it is
    /// marked failed.
    async fn fail(&self, job_id: &str, error: &str, retry: bool, retry_delay: Duration)
        -> Result<()>;

    /// Cancel a job. No-op once the job is terminal.
    async fn cancel(&self, job_id: &str, reason: Option<&str>) -> Result<()>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>>;

    async fn get_latest_by_ref(&self, kind: JobKind, ref_id: &str) -> Result<Option<Job>>;

    /// Cancel all still-queued jobs for a reference id. Returns whether any
    /// job was canceled.
    async fn cancel_queued_by_ref(&self, kind: JobKind, ref_id: &str) -> Result<bool>;

    /// Push the lease deadline of a running job further out.
    async fn extend_visibility(&self, job_id: &str, additional: Duration) -> Result<bool>;

    /// Startup recovery: mark every running job failed so a fresh process
    /// starts clean. Returns the number of jobs transitioned.
    async fn fail_all_running(&self, error: &str) -> Result<u64>;

    async fn stats(&self) -> Result<QueueStats>;
}
