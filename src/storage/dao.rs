//! Data access objects for the domain tables.
//!
//! Every DAO is a thin handle over the shared pool. Status updates use
//! read-modify-write: a run or review is only ever mutated by the single
//! worker holding its job lease, so there is no concurrent writer to race.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::models::{
    CiResult, CodingMode, CyclePhase, CycleState, ExecutorKind, FileDiff, KanbanState, PrStatus,
    PullRequest, Repository, Review, ReviewFeedback, Run, RunStatus, Task, generate_id,
};
use crate::{GyreError, Result};

fn decode_err(message: impl Into<String>) -> GyreError {
    let message: String = message.into();
    GyreError::Database(sqlx::Error::Decode(message.into()))
}

fn parse_text<T: FromStr<Err = String>>(value: &str) -> Result<T> {
    value.parse::<T>().map_err(decode_err)
}

fn parse_json<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    serde_json::from_str(value).map_err(GyreError::from)
}

// ---------------------------------------------------------------------------
// Repositories

#[derive(Debug, Clone)]
pub struct RepoDao {
    pool: SqlitePool,
}

impl RepoDao {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, repo: &Repository) -> Result<()> {
        sqlx::query(
            "INSERT INTO repositories (id, remote_url, default_branch, local_mirror_path)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&repo.id)
        .bind(&repo.remote_url)
        .bind(&repo.default_branch)
        .bind(&repo.local_mirror_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Repository>> {
        let row = sqlx::query("SELECT * FROM repositories WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(Repository {
                id: r.get("id"),
                remote_url: r.get("remote_url"),
                default_branch: r.get("default_branch"),
                local_mirror_path: r.get("local_mirror_path"),
            })
        })
        .transpose()
    }
}

// ---------------------------------------------------------------------------
// Tasks

#[derive(Debug, Clone)]
pub struct TaskDao {
    pool: SqlitePool,
}

impl TaskDao {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "INSERT INTO tasks (id, repository_id, title, coding_mode, kanban_state, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.repository_id)
        .bind(&task.title)
        .bind(task.coding_mode.as_str())
        .bind(task.kanban_state.as_str())
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(task_from_row).transpose()
    }

    pub async fn touch(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn task_from_row(row: SqliteRow) -> Result<Task> {
    Ok(Task {
        id: row.get("id"),
        repository_id: row.get("repository_id"),
        title: row.get("title"),
        coding_mode: parse_text::<CodingMode>(row.get::<String, _>("coding_mode").as_str())?,
        kanban_state: parse_text::<KanbanState>(row.get::<String, _>("kanban_state").as_str())?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

// ---------------------------------------------------------------------------
// Runs

/// Optional fields applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub error: Option<String>,
    pub summary: Option<String>,
    pub patch: Option<String>,
    pub files_changed: Option<Vec<FileDiff>>,
    pub logs: Option<Vec<String>>,
    pub warnings: Option<Vec<String>>,
    pub session_id: Option<String>,
    pub commit_sha: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunDao {
    pool: SqlitePool,
}

impl RunDao {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        task_id: &str,
        instruction: &str,
        executor_kind: ExecutorKind,
        base_ref: &str,
        triggering_message_id: Option<&str>,
    ) -> Result<Run> {
        let run = Run {
            id: generate_id(),
            task_id: task_id.to_string(),
            triggering_message_id: triggering_message_id.map(str::to_string),
            executor_kind,
            model_profile_id: None,
            status: RunStatus::Queued,
            instruction: instruction.to_string(),
            base_ref: base_ref.to_string(),
            working_branch: None,
            workspace_path: None,
            session_id: None,
            commit_sha: None,
            patch: None,
            files_changed: Vec::new(),
            summary: None,
            warnings: Vec::new(),
            logs: Vec::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        sqlx::query(
            "INSERT INTO runs (id, task_id, triggering_message_id, executor_kind, model_profile_id,
                               status, instruction, base_ref, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(&run.task_id)
        .bind(&run.triggering_message_id)
        .bind(run.executor_kind.as_str())
        .bind(&run.model_profile_id)
        .bind(run.status.as_str())
        .bind(&run.instruction)
        .bind(&run.base_ref)
        .bind(run.created_at)
        .execute(&self.pool)
        .await?;

        Ok(run)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(run_from_row).transpose()
    }

    pub async fn list_by_task(&self, task_id: &str) -> Result<Vec<Run>> {
        let rows = sqlx::query("SELECT * FROM runs WHERE task_id = ? ORDER BY created_at DESC")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(run_from_row).collect()
    }

    pub async fn latest_succeeded(&self, task_id: &str) -> Result<Option<Run>> {
        let row = sqlx::query(
            "SELECT * FROM runs WHERE task_id = ? AND status = 'succeeded'
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(run_from_row).transpose()
    }

    /// Latest non-empty session id for a (task, executor) pair, enabling
    /// conversation continuation across runs.
    pub async fn get_latest_session_id(
        &self,
        task_id: &str,
        executor_kind: ExecutorKind,
    ) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT session_id FROM runs
             WHERE task_id = ? AND executor_kind = ? AND session_id IS NOT NULL
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(task_id)
        .bind(executor_kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|r| r.get::<Option<String>, _>("session_id")))
    }

    /// Latest run for a (task, executor) pair that recorded a workspace
    /// path; drives the workspace reuse policy.
    pub async fn get_latest_workspace_run(
        &self,
        task_id: &str,
        executor_kind: ExecutorKind,
    ) -> Result<Option<Run>> {
        let row = sqlx::query(
            "SELECT * FROM runs
             WHERE task_id = ? AND executor_kind = ? AND workspace_path IS NOT NULL
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(task_id)
        .bind(executor_kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(run_from_row).transpose()
    }

    pub async fn update_workspace(
        &self,
        id: &str,
        working_branch: &str,
        workspace_path: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE runs SET working_branch = ?, workspace_path = ? WHERE id = ?")
            .bind(working_branch)
            .bind(workspace_path)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transition status and merge optional result fields.
    pub async fn update_status(&self, id: &str, status: RunStatus, update: RunUpdate) -> Result<()> {
        let mut run = self
            .get(id)
            .await?
            .ok_or_else(|| GyreError::NotFound(format!("run {id}")))?;

        run.status = status;
        if status == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            run.completed_at = Some(Utc::now());
        }
        if let Some(error) = update.error {
            run.error = Some(error);
        }
        if let Some(summary) = update.summary {
            run.summary = Some(summary);
        }
        if let Some(patch) = update.patch {
            run.patch = Some(patch);
        }
        if let Some(files) = update.files_changed {
            run.files_changed = files;
        }
        if let Some(logs) = update.logs {
            run.logs = logs;
        }
        if let Some(warnings) = update.warnings {
            run.warnings = warnings;
        }
        if let Some(session_id) = update.session_id {
            run.session_id = Some(session_id);
        }
        if let Some(sha) = update.commit_sha {
            run.commit_sha = Some(sha);
        }

        sqlx::query(
            "UPDATE runs SET status = ?, error = ?, summary = ?, patch = ?, files_changed = ?,
                             logs = ?, warnings = ?, session_id = ?, commit_sha = ?,
                             started_at = ?, completed_at = ?
             WHERE id = ?",
        )
        .bind(run.status.as_str())
        .bind(&run.error)
        .bind(&run.summary)
        .bind(&run.patch)
        .bind(serde_json::to_string(&run.files_changed)?)
        .bind(serde_json::to_string(&run.logs)?)
        .bind(serde_json::to_string(&run.warnings)?)
        .bind(&run.session_id)
        .bind(&run.commit_sha)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Startup/operator recovery: flip all non-terminal runs to failed.
    pub async fn reset_non_terminal(&self, error: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE runs SET status = 'failed', error = ?, completed_at = ?
             WHERE status IN ('queued', 'running')",
        )
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn run_from_row(row: SqliteRow) -> Result<Run> {
    Ok(Run {
        id: row.get("id"),
        task_id: row.get("task_id"),
        triggering_message_id: row.get("triggering_message_id"),
        executor_kind: parse_text::<ExecutorKind>(row.get::<String, _>("executor_kind").as_str())?,
        model_profile_id: row.get("model_profile_id"),
        status: parse_text::<RunStatus>(row.get::<String, _>("status").as_str())?,
        instruction: row.get("instruction"),
        base_ref: row.get("base_ref"),
        working_branch: row.get("working_branch"),
        workspace_path: row.get("workspace_path"),
        session_id: row.get("session_id"),
        commit_sha: row.get("commit_sha"),
        patch: row.get("patch"),
        files_changed: parse_json(row.get::<String, _>("files_changed").as_str())?,
        summary: row.get("summary"),
        warnings: parse_json(row.get::<String, _>("warnings").as_str())?,
        logs: parse_json(row.get::<String, _>("logs").as_str())?,
        error: row.get("error"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

// ---------------------------------------------------------------------------
// Reviews

#[derive(Debug, Clone, Default)]
pub struct ReviewUpdate {
    pub error: Option<String>,
    pub summary: Option<String>,
    pub overall_score: Option<f64>,
    pub feedbacks: Option<Vec<ReviewFeedback>>,
    pub logs: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ReviewDao {
    pool: SqlitePool,
}

impl ReviewDao {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        task_id: &str,
        target_run_ids: &[String],
        executor_kind: ExecutorKind,
    ) -> Result<Review> {
        let review = Review {
            id: generate_id(),
            task_id: task_id.to_string(),
            target_run_ids: target_run_ids.to_vec(),
            executor_kind,
            status: RunStatus::Queued,
            overall_score: None,
            summary: None,
            feedbacks: Vec::new(),
            logs: Vec::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        sqlx::query(
            "INSERT INTO reviews (id, task_id, target_run_ids, executor_kind, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&review.id)
        .bind(&review.task_id)
        .bind(serde_json::to_string(&review.target_run_ids)?)
        .bind(review.executor_kind.as_str())
        .bind(review.status.as_str())
        .bind(review.created_at)
        .execute(&self.pool)
        .await?;

        Ok(review)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Review>> {
        let row = sqlx::query("SELECT * FROM reviews WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(review_from_row).transpose()
    }

    pub async fn list_by_task(&self, task_id: &str) -> Result<Vec<Review>> {
        let rows = sqlx::query("SELECT * FROM reviews WHERE task_id = ? ORDER BY created_at DESC")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(review_from_row).collect()
    }

    pub async fn update_status(
        &self,
        id: &str,
        status: RunStatus,
        update: ReviewUpdate,
    ) -> Result<()> {
        let mut review = self
            .get(id)
            .await?
            .ok_or_else(|| GyreError::NotFound(format!("review {id}")))?;

        review.status = status;
        if status == RunStatus::Running && review.started_at.is_none() {
            review.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            review.completed_at = Some(Utc::now());
        }
        if let Some(error) = update.error {
            review.error = Some(error);
        }
        if let Some(summary) = update.summary {
            review.summary = Some(summary);
        }
        if let Some(score) = update.overall_score {
            review.overall_score = Some(score);
        }
        if let Some(feedbacks) = update.feedbacks {
            review.feedbacks = feedbacks;
        }
        if let Some(logs) = update.logs {
            review.logs = logs;
        }

        sqlx::query(
            "UPDATE reviews SET status = ?, error = ?, summary = ?, overall_score = ?,
                                feedbacks = ?, logs = ?, started_at = ?, completed_at = ?
             WHERE id = ?",
        )
        .bind(review.status.as_str())
        .bind(&review.error)
        .bind(&review.summary)
        .bind(review.overall_score)
        .bind(serde_json::to_string(&review.feedbacks)?)
        .bind(serde_json::to_string(&review.logs)?)
        .bind(review.started_at)
        .bind(review.completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn reset_non_terminal(&self, error: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE reviews SET status = 'failed', error = ?, completed_at = ?
             WHERE status IN ('queued', 'running')",
        )
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn review_from_row(row: SqliteRow) -> Result<Review> {
    Ok(Review {
        id: row.get("id"),
        task_id: row.get("task_id"),
        target_run_ids: parse_json(row.get::<String, _>("target_run_ids").as_str())?,
        executor_kind: parse_text::<ExecutorKind>(row.get::<String, _>("executor_kind").as_str())?,
        status: parse_text::<RunStatus>(row.get::<String, _>("status").as_str())?,
        overall_score: row.get("overall_score"),
        summary: row.get("summary"),
        feedbacks: parse_json(row.get::<String, _>("feedbacks").as_str())?,
        logs: parse_json(row.get::<String, _>("logs").as_str())?,
        error: row.get("error"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

// ---------------------------------------------------------------------------
// Pull requests

#[derive(Debug, Clone)]
pub struct PrDao {
    pool: SqlitePool,
}

impl PrDao {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, pr: &PullRequest) -> Result<()> {
        sqlx::query(
            "INSERT INTO pull_requests (id, task_id, number, branch, base_branch, title, body, head_sha, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(number) DO UPDATE SET
                 title = excluded.title,
                 body = excluded.body,
                 head_sha = excluded.head_sha,
                 status = excluded.status",
        )
        .bind(&pr.id)
        .bind(&pr.task_id)
        .bind(pr.number as i64)
        .bind(&pr.branch)
        .bind(&pr.base_branch)
        .bind(&pr.title)
        .bind(&pr.body)
        .bind(&pr.head_sha)
        .bind(pr.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_by_task(&self, task_id: &str) -> Result<Option<PullRequest>> {
        let row = sqlx::query(
            "SELECT * FROM pull_requests WHERE task_id = ? ORDER BY number DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(pr_from_row).transpose()
    }

    pub async fn get_by_number(&self, number: u64) -> Result<Option<PullRequest>> {
        let row = sqlx::query("SELECT * FROM pull_requests WHERE number = ?")
            .bind(number as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.map(pr_from_row).transpose()
    }
}

fn pr_from_row(row: SqliteRow) -> Result<PullRequest> {
    Ok(PullRequest {
        id: row.get("id"),
        task_id: row.get("task_id"),
        number: row.get::<i64, _>("number") as u64,
        branch: row.get("branch"),
        base_branch: row.get("base_branch"),
        title: row.get("title"),
        body: row.get("body"),
        head_sha: row.get("head_sha"),
        status: parse_text::<PrStatus>(row.get::<String, _>("status").as_str())?,
    })
}

// ---------------------------------------------------------------------------
// Cycle states

#[derive(Debug, Clone)]
pub struct CycleDao {
    pool: SqlitePool,
}

impl CycleDao {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, state: &CycleState) -> Result<()> {
        let last_ci = state
            .last_ci_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO cycle_states (task_id, mode, phase, iteration, ci_iterations,
                                       review_iterations, pr_number, current_head_sha,
                                       last_ci_result, last_review_score, human_approved,
                                       error, started_at, last_activity_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(task_id) DO UPDATE SET
                 mode = excluded.mode,
                 phase = excluded.phase,
                 iteration = excluded.iteration,
                 ci_iterations = excluded.ci_iterations,
                 review_iterations = excluded.review_iterations,
                 pr_number = excluded.pr_number,
                 current_head_sha = excluded.current_head_sha,
                 last_ci_result = excluded.last_ci_result,
                 last_review_score = excluded.last_review_score,
                 human_approved = excluded.human_approved,
                 error = excluded.error,
                 last_activity_at = excluded.last_activity_at",
        )
        .bind(&state.task_id)
        .bind(state.mode.as_str())
        .bind(state.phase.as_str())
        .bind(state.iteration as i64)
        .bind(state.ci_iterations as i64)
        .bind(state.review_iterations as i64)
        .bind(state.pr_number.map(|n| n as i64))
        .bind(&state.current_head_sha)
        .bind(last_ci)
        .bind(state.last_review_score)
        .bind(state.human_approved)
        .bind(&state.error)
        .bind(state.started_at)
        .bind(state.last_activity_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_by_task(&self, task_id: &str) -> Result<Option<CycleState>> {
        let row = sqlx::query("SELECT * FROM cycle_states WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(cycle_from_row).transpose()
    }

    pub async fn reset_non_terminal(&self, error: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE cycle_states SET phase = 'failed', error = ?, last_activity_at = ?
             WHERE phase NOT IN ('completed', 'failed')",
        )
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn cycle_from_row(row: SqliteRow) -> Result<CycleState> {
    let last_ci_result = row
        .get::<Option<String>, _>("last_ci_result")
        .map(|s| parse_json::<CiResult>(&s))
        .transpose()?;
    Ok(CycleState {
        task_id: row.get("task_id"),
        mode: parse_text::<CodingMode>(row.get::<String, _>("mode").as_str())?,
        phase: parse_text::<CyclePhase>(row.get::<String, _>("phase").as_str())?,
        iteration: row.get::<i64, _>("iteration") as u32,
        ci_iterations: row.get::<i64, _>("ci_iterations") as u32,
        review_iterations: row.get::<i64, _>("review_iterations") as u32,
        pr_number: row.get::<Option<i64>, _>("pr_number").map(|n| n as u64),
        current_head_sha: row.get("current_head_sha"),
        last_ci_result,
        last_review_score: row.get("last_review_score"),
        human_approved: row.get("human_approved"),
        error: row.get("error"),
        started_at: row.get("started_at"),
        last_activity_at: row.get("last_activity_at"),
    })
}

// ---------------------------------------------------------------------------
// Output lines

/// Durable store for streamed output lines, keyed by (stream_id,
/// line_number) so numbering is consistent across processes.
#[derive(Debug, Clone)]
pub struct OutputLineDao {
    pool: SqlitePool,
}

impl OutputLineDao {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        stream_id: &str,
        line_number: u64,
        content: &str,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO output_lines (stream_id, line_number, content, ts)
             VALUES (?, ?, ?, ?)",
        )
        .bind(stream_id)
        .bind(line_number as i64)
        .bind(content)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn max_line_number(&self, stream_id: &str) -> Result<Option<u64>> {
        let row = sqlx::query("SELECT MAX(line_number) AS max_ln FROM output_lines WHERE stream_id = ?")
            .bind(stream_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<Option<i64>, _>("max_ln").map(|n| n as u64))
    }

    pub async fn list_from(
        &self,
        stream_id: &str,
        from_line: u64,
    ) -> Result<Vec<(u64, String, DateTime<Utc>)>> {
        let rows = sqlx::query(
            "SELECT line_number, content, ts FROM output_lines
             WHERE stream_id = ? AND line_number >= ?
             ORDER BY line_number ASC",
        )
        .bind(stream_id)
        .bind(from_line as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.get::<i64, _>("line_number") as u64,
                    r.get::<String, _>("content"),
                    r.get::<DateTime<Utc>, _>("ts"),
                )
            })
            .collect())
    }
}
