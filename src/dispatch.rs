//! Creates domain records and their queue jobs, and provides the cancel and
//! await-terminal flows shared by the API surface and the cycle engine.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::models::{ExecutorKind, JobKind, JobStatus, Review, Run, RunStatus};
use crate::queue::{EnqueueRequest, JobQueue};
use crate::storage::{ReviewDao, ReviewUpdate, RunDao, RunUpdate};
use crate::{GyreError, Result};

/// Payload key carrying the resume token into the run handler.
pub const PAYLOAD_RESUME_SESSION: &str = "resume_session_id";

#[derive(Clone)]
pub struct Dispatcher {
    runs: RunDao,
    reviews: ReviewDao,
    queue: Arc<dyn JobQueue>,
    default_max_attempts: u32,
}

impl Dispatcher {
    pub fn new(
        runs: RunDao,
        reviews: ReviewDao,
        queue: Arc<dyn JobQueue>,
        default_max_attempts: u32,
    ) -> Self {
        Self {
            runs,
            reviews,
            queue,
            default_max_attempts,
        }
    }

    /// Create a run record and enqueue its job.
    ///
    /// Runs for one (task, executor) pair share a workspace, so a new run is
    /// refused while a previous one is still in flight.
    pub async fn create_run(
        &self,
        task_id: &str,
        instruction: &str,
        executor_kind: ExecutorKind,
        base_ref: &str,
        triggering_message_id: Option<&str>,
    ) -> Result<Run> {
        let existing = self.runs.list_by_task(task_id).await?;
        if existing
            .iter()
            .any(|r| r.executor_kind == executor_kind && !r.status.is_terminal())
        {
            return Err(GyreError::Precondition(format!(
                "a {} run is already in flight for task {task_id}",
                executor_kind.as_str()
            )));
        }

        // Conversation continuity: hand the latest session id to the worker.
        let resume_session_id = self
            .runs
            .get_latest_session_id(task_id, executor_kind)
            .await?;

        let run = self
            .runs
            .create(task_id, instruction, executor_kind, base_ref, triggering_message_id)
            .await?;

        self.queue
            .enqueue(
                EnqueueRequest::new(JobKind::RunExecute, run.id.clone())
                    .payload(json!({ PAYLOAD_RESUME_SESSION: resume_session_id }))
                    .max_attempts(self.default_max_attempts),
            )
            .await?;

        info!("Dispatched run {} for task {task_id}", run.id);
        Ok(run)
    }

    /// Create a review record targeting one or more succeeded runs and
    /// enqueue its job.
    pub async fn create_review(
        &self,
        task_id: &str,
        target_run_ids: &[String],
        executor_kind: ExecutorKind,
    ) -> Result<Review> {
        if target_run_ids.is_empty() {
            return Err(GyreError::Precondition(
                "a review needs at least one target run".to_string(),
            ));
        }
        for run_id in target_run_ids {
            let run = self
                .runs
                .get(run_id)
                .await?
                .ok_or_else(|| GyreError::Precondition(format!("target run not found: {run_id}")))?;
            if run.status != RunStatus::Succeeded {
                return Err(GyreError::Precondition(format!(
                    "target run {run_id} is {}, not succeeded",
                    run.status.as_str()
                )));
            }
        }

        let review = self
            .reviews
            .create(task_id, target_run_ids, executor_kind)
            .await?;

        self.queue
            .enqueue(
                EnqueueRequest::new(JobKind::ReviewExecute, review.id.clone())
                    .max_attempts(self.default_max_attempts),
            )
            .await?;

        info!("Dispatched review {} for task {task_id}", review.id);
        Ok(review)
    }

    /// Cancel a run. A still-queued job is canceled directly; a running job
    /// is flagged canceled so the worker unwinds at its next checkpoint.
    pub async fn cancel_run(&self, run_id: &str, reason: &str) -> Result<bool> {
        let Some(run) = self.runs.get(run_id).await? else {
            return Ok(false);
        };
        if run.status.is_terminal() {
            return Ok(false);
        }

        let canceled_queued = self
            .queue
            .cancel_queued_by_ref(JobKind::RunExecute, run_id)
            .await?;
        if canceled_queued && run.status == RunStatus::Queued {
            self.runs
                .update_status(
                    run_id,
                    RunStatus::Canceled,
                    RunUpdate {
                        error: Some(reason.to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(true);
        }

        // Running: flag the job; the lease-holding worker observes the flag
        // between steps and records the terminal run status itself.
        if let Some(job) = self
            .queue
            .get_latest_by_ref(JobKind::RunExecute, run_id)
            .await?
        {
            if job.status == JobStatus::Running {
                self.queue.cancel(&job.id, Some(reason)).await?;
                return Ok(true);
            }
        }
        Ok(canceled_queued)
    }

    pub async fn cancel_review(&self, review_id: &str, reason: &str) -> Result<bool> {
        let Some(review) = self.reviews.get(review_id).await? else {
            return Ok(false);
        };
        if review.status.is_terminal() {
            return Ok(false);
        }

        let canceled_queued = self
            .queue
            .cancel_queued_by_ref(JobKind::ReviewExecute, review_id)
            .await?;
        if canceled_queued && review.status == RunStatus::Queued {
            self.reviews
                .update_status(
                    review_id,
                    RunStatus::Canceled,
                    ReviewUpdate {
                        error: Some(reason.to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(true);
        }

        if let Some(job) = self
            .queue
            .get_latest_by_ref(JobKind::ReviewExecute, review_id)
            .await?
        {
            if job.status == JobStatus::Running {
                self.queue.cancel(&job.id, Some(reason)).await?;
                return Ok(true);
            }
        }
        Ok(canceled_queued)
    }

    /// Poll until the run reaches a terminal status.
    pub async fn await_run_terminal(&self, run_id: &str, timeout: Duration) -> Result<Run> {
        let started = Utc::now();
        loop {
            let run = self
                .runs
                .get(run_id)
                .await?
                .ok_or_else(|| GyreError::NotFound(format!("run {run_id}")))?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            if (Utc::now() - started).to_std().unwrap_or_default() > timeout {
                return Err(GyreError::Timeout {
                    message: format!("run {run_id} did not finish within {timeout:?}"),
                });
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Poll until the review reaches a terminal status.
    pub async fn await_review_terminal(&self, review_id: &str, timeout: Duration) -> Result<Review> {
        let started = Utc::now();
        loop {
            let review = self
                .reviews
                .get(review_id)
                .await?
                .ok_or_else(|| GyreError::NotFound(format!("review {review_id}")))?;
            if review.status.is_terminal() {
                return Ok(review);
            }
            if (Utc::now() - started).to_std().unwrap_or_default() > timeout {
                return Err(GyreError::Timeout {
                    message: format!("review {review_id} did not finish within {timeout:?}"),
                });
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CodingMode, KanbanState, Task};
    use crate::queue::SqliteQueue;
    use crate::storage::{Database, TaskDao};

    async fn fixtures() -> (Database, Dispatcher, Arc<SqliteQueue>) {
        let db = Database::connect_memory().await.unwrap();
        let queue = Arc::new(SqliteQueue::new(db.pool().clone()));
        let dispatcher = Dispatcher::new(
            RunDao::new(db.pool().clone()),
            ReviewDao::new(db.pool().clone()),
            queue.clone(),
            3,
        );
        let tasks = TaskDao::new(db.pool().clone());
        tasks
            .create(&Task {
                id: "task-1".into(),
                repository_id: "repo-1".into(),
                title: "demo".into(),
                coding_mode: CodingMode::FullAuto,
                kanban_state: KanbanState::Todo,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        (db, dispatcher, queue)
    }

    #[tokio::test]
    async fn create_run_enqueues_a_job_with_session_payload() {
        let (db, dispatcher, queue) = fixtures().await;
        let runs = RunDao::new(db.pool().clone());

        let run = dispatcher
            .create_run("task-1", "do it", ExecutorKind::ClaudeCode, "main", None)
            .await
            .unwrap();

        let job = queue
            .get_latest_by_ref(JobKind::RunExecute, &run.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.max_attempts, 3);
        assert!(job.payload[PAYLOAD_RESUME_SESSION].is_null());

        // Finish the run with a session id; the next run carries it.
        runs.update_status(
            &run.id,
            RunStatus::Succeeded,
            RunUpdate {
                session_id: Some("sess-7".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let second = dispatcher
            .create_run("task-1", "again", ExecutorKind::ClaudeCode, "main", None)
            .await
            .unwrap();
        let job = queue
            .get_latest_by_ref(JobKind::RunExecute, &second.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.payload[PAYLOAD_RESUME_SESSION], "sess-7");
    }

    #[tokio::test]
    async fn concurrent_run_for_same_executor_is_refused() {
        let (_db, dispatcher, _queue) = fixtures().await;

        dispatcher
            .create_run("task-1", "first", ExecutorKind::ClaudeCode, "main", None)
            .await
            .unwrap();

        let err = dispatcher
            .create_run("task-1", "second", ExecutorKind::ClaudeCode, "main", None)
            .await
            .unwrap_err();
        assert!(err.is_permanent());

        // A different executor kind has its own workspace and is fine.
        dispatcher
            .create_run("task-1", "other", ExecutorKind::CodexCli, "main", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn review_requires_succeeded_targets() {
        let (db, dispatcher, _queue) = fixtures().await;
        let runs = RunDao::new(db.pool().clone());

        let run = dispatcher
            .create_run("task-1", "work", ExecutorKind::ClaudeCode, "main", None)
            .await
            .unwrap();

        let err = dispatcher
            .create_review("task-1", &[run.id.clone()], ExecutorKind::CodexCli)
            .await
            .unwrap_err();
        assert!(err.is_permanent());

        runs.update_status(&run.id, RunStatus::Succeeded, RunUpdate::default())
            .await
            .unwrap();
        dispatcher
            .create_review("task-1", &[run.id], ExecutorKind::CodexCli)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_queued_run_marks_record_canceled() {
        let (db, dispatcher, _queue) = fixtures().await;
        let runs = RunDao::new(db.pool().clone());

        let run = dispatcher
            .create_run("task-1", "work", ExecutorKind::ClaudeCode, "main", None)
            .await
            .unwrap();
        assert!(dispatcher.cancel_run(&run.id, "user canceled").await.unwrap());

        let canceled = runs.get(&run.id).await.unwrap().unwrap();
        assert_eq!(canceled.status, RunStatus::Canceled);
        assert_eq!(canceled.error.as_deref(), Some("user canceled"));

        // Canceling again is a no-op.
        assert!(!dispatcher.cancel_run(&run.id, "again").await.unwrap());
    }

    #[tokio::test]
    async fn cancel_running_run_flags_the_job() {
        let (db, dispatcher, queue) = fixtures().await;
        let runs = RunDao::new(db.pool().clone());

        let run = dispatcher
            .create_run("task-1", "work", ExecutorKind::ClaudeCode, "main", None)
            .await
            .unwrap();
        // A worker leases the job and starts the run.
        let job = queue
            .dequeue("w1", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        runs.update_status(&run.id, RunStatus::Running, RunUpdate::default())
            .await
            .unwrap();

        assert!(dispatcher.cancel_run(&run.id, "abort").await.unwrap());
        let flagged = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(flagged.status, JobStatus::Canceled);
        // The run record stays running until the worker unwinds.
        assert_eq!(
            runs.get(&run.id).await.unwrap().unwrap().status,
            RunStatus::Running
        );
    }

    #[tokio::test]
    async fn await_run_terminal_times_out() {
        let (_db, dispatcher, _queue) = fixtures().await;
        let run = dispatcher
            .create_run("task-1", "work", ExecutorKind::ClaudeCode, "main", None)
            .await
            .unwrap();

        let err = dispatcher
            .await_run_terminal(&run.id, Duration::from_millis(400))
            .await
            .unwrap_err();
        assert!(matches!(err, GyreError::Timeout { .. }));
    }
}
