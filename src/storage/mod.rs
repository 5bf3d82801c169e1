//! Relational persistence on SQLite.
//!
//! All domain records (tasks, runs, reviews, pull requests, jobs, cycle
//! states, output lines) live in one database file shared by every worker
//! process. The schema is created idempotently at startup.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

pub mod dao;

pub use dao::{
    CycleDao, OutputLineDao, PrDao, RepoDao, ReviewDao, ReviewUpdate, RunDao, RunUpdate, TaskDao,
};

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database file and apply the schema.
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            // Immediate busy handling keeps the claim transaction short even
            // when several worker processes share the file.
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn connect_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?;
        // A single connection so every query sees the same in-memory store.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        // raw_sql runs the whole multi-statement schema script.
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS repositories (
    id                TEXT PRIMARY KEY,
    remote_url        TEXT NOT NULL,
    default_branch    TEXT NOT NULL,
    local_mirror_path TEXT
);

CREATE TABLE IF NOT EXISTS tasks (
    id            TEXT PRIMARY KEY,
    repository_id TEXT NOT NULL,
    title         TEXT NOT NULL,
    coding_mode   TEXT NOT NULL,
    kanban_state  TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    id                    TEXT PRIMARY KEY,
    task_id               TEXT NOT NULL,
    triggering_message_id TEXT,
    executor_kind         TEXT NOT NULL,
    model_profile_id      TEXT,
    status                TEXT NOT NULL,
    instruction           TEXT NOT NULL,
    base_ref              TEXT NOT NULL,
    working_branch        TEXT,
    workspace_path        TEXT,
    session_id            TEXT,
    commit_sha            TEXT,
    patch                 TEXT,
    files_changed         TEXT NOT NULL DEFAULT '[]',
    summary               TEXT,
    warnings              TEXT NOT NULL DEFAULT '[]',
    logs                  TEXT NOT NULL DEFAULT '[]',
    error                 TEXT,
    created_at            TEXT NOT NULL,
    started_at            TEXT,
    completed_at          TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_task_created ON runs(task_id, created_at);

CREATE TABLE IF NOT EXISTS reviews (
    id             TEXT PRIMARY KEY,
    task_id        TEXT NOT NULL,
    target_run_ids TEXT NOT NULL DEFAULT '[]',
    executor_kind  TEXT NOT NULL,
    status         TEXT NOT NULL,
    overall_score  REAL,
    summary        TEXT,
    feedbacks      TEXT NOT NULL DEFAULT '[]',
    logs           TEXT NOT NULL DEFAULT '[]',
    error          TEXT,
    created_at     TEXT NOT NULL,
    started_at     TEXT,
    completed_at   TEXT
);
CREATE INDEX IF NOT EXISTS idx_reviews_task_created ON reviews(task_id, created_at);

CREATE TABLE IF NOT EXISTS pull_requests (
    id          TEXT PRIMARY KEY,
    task_id     TEXT NOT NULL,
    number      INTEGER NOT NULL,
    branch      TEXT NOT NULL,
    base_branch TEXT NOT NULL,
    title       TEXT NOT NULL,
    body        TEXT NOT NULL DEFAULT '',
    head_sha    TEXT NOT NULL,
    status      TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_prs_number ON pull_requests(number);
CREATE INDEX IF NOT EXISTS idx_prs_task ON pull_requests(task_id);

CREATE TABLE IF NOT EXISTS jobs (
    id           TEXT PRIMARY KEY,
    kind         TEXT NOT NULL,
    ref_id       TEXT NOT NULL,
    status       TEXT NOT NULL,
    payload      TEXT NOT NULL DEFAULT '{}',
    attempts     INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 1,
    priority     INTEGER NOT NULL DEFAULT 0,
    available_at INTEGER NOT NULL,
    locked_at    INTEGER,
    locked_by    TEXT,
    last_error   TEXT,
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, available_at, priority);
CREATE INDEX IF NOT EXISTS idx_jobs_ref ON jobs(kind, ref_id, created_at);

CREATE TABLE IF NOT EXISTS cycle_states (
    task_id           TEXT PRIMARY KEY,
    mode              TEXT NOT NULL,
    phase             TEXT NOT NULL,
    iteration         INTEGER NOT NULL DEFAULT 0,
    ci_iterations     INTEGER NOT NULL DEFAULT 0,
    review_iterations INTEGER NOT NULL DEFAULT 0,
    pr_number         INTEGER,
    current_head_sha  TEXT,
    last_ci_result    TEXT,
    last_review_score REAL,
    human_approved    INTEGER NOT NULL DEFAULT 0,
    error             TEXT,
    started_at        TEXT NOT NULL,
    last_activity_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS output_lines (
    stream_id   TEXT NOT NULL,
    line_number INTEGER NOT NULL,
    content     TEXT NOT NULL,
    ts          TEXT NOT NULL,
    PRIMARY KEY (stream_id, line_number)
);
"#;
