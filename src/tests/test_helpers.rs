//! Harness for cycle scenarios: a real database, queue, dispatcher, and
//! engine, with agent execution replaced by a scripted in-process worker
//! and GitHub replaced by a mock server.

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::CycleConfig;
use crate::cycle::CycleEngine;
use crate::dispatch::Dispatcher;
use crate::github::GitHubClient;
use crate::models::{
    generate_id, CodingMode, CyclePhase, JobKind, KanbanState, MergeMethod, Repository,
    ReviewCategory, ReviewFeedback, ReviewSeverity, Run, RunStatus, Task,
};
use crate::notify::Notifier;
use crate::queue::{JobQueue, SqliteQueue};
use crate::storage::{
    CycleDao, Database, PrDao, RepoDao, ReviewDao, ReviewUpdate, RunDao, RunUpdate, TaskDao,
};

pub const REPO_FULL_NAME: &str = "acme/widgets";
pub const WORK_BRANCH: &str = "gyre/abc12345";

/// Scripted outcomes for the fake agent worker.
pub struct Script {
    /// Review scores handed out in order; later reviews reuse the last.
    pub review_scores: Mutex<VecDeque<f64>>,
}

pub struct Harness {
    pub db: Database,
    pub queue: Arc<SqliteQueue>,
    pub engine: Arc<CycleEngine>,
    pub runs: RunDao,
    pub reviews: ReviewDao,
    pub prs: PrDao,
    pub server: mockito::ServerGuard,
    worker: JoinHandle<()>,
    event_loop: JoinHandle<()>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.worker.abort();
        self.event_loop.abort();
    }
}

fn cycle_config(max_ci_iterations: u32) -> CycleConfig {
    CycleConfig {
        ci_poll_interval_secs: 1,
        ci_poll_timeout_secs: 60,
        max_ci_iterations,
        max_review_iterations: 3,
        max_total_iterations: 10,
        warn_iteration_threshold: 8,
        min_review_score: 0.7,
        merge_method: MergeMethod::Squash,
        merge_delete_branch: false,
        phase_timeout_secs: 60,
    }
}

/// Mock the PR surface: lookup by head branch, mergeability, and merge.
pub async fn mock_pull_request(server: &mut mockito::ServerGuard) {
    let pr_body = format!(
        r#"{{"number": 7, "state": "open", "title": "demo", "merged": false, "mergeable": true,
             "head": {{"ref": "{WORK_BRANCH}", "sha": "sha1"}},
             "base": {{"ref": "main", "sha": "basesha"}}}}"#
    );
    server
        .mock(
            "GET",
            format!("/repos/{REPO_FULL_NAME}/pulls?state=open&head=acme:{WORK_BRANCH}").as_str(),
        )
        .with_status(200)
        .with_body(format!("[{pr_body}]"))
        .create_async()
        .await;
    server
        .mock("GET", format!("/repos/{REPO_FULL_NAME}/pulls/7").as_str())
        .with_status(200)
        .with_body(pr_body)
        .create_async()
        .await;
    server
        .mock("PUT", format!("/repos/{REPO_FULL_NAME}/pulls/7/merge").as_str())
        .with_status(200)
        .with_body(r#"{"merged": true, "message": "merged", "sha": "mergesha"}"#)
        .create_async()
        .await;
}

/// Mock the CI result for one head commit.
pub async fn mock_ci(server: &mut mockito::ServerGuard, sha: &str, green: bool) {
    let (conclusion, state) = if green {
        ("success", "success")
    } else {
        ("failure", "failure")
    };
    server
        .mock(
            "GET",
            format!("/repos/{REPO_FULL_NAME}/commits/{sha}/check-runs").as_str(),
        )
        .with_status(200)
        .with_body(format!(
            r#"{{"check_runs": [{{"name": "unit-tests", "status": "completed",
                 "conclusion": "{conclusion}",
                 "output": {{"title": "unit-tests", "summary": "AssertionError: 1 != 2"}}}}]}}"#
        ))
        .create_async()
        .await;
    server
        .mock(
            "GET",
            format!("/repos/{REPO_FULL_NAME}/commits/{sha}/status").as_str(),
        )
        .with_status(200)
        .with_body(format!(r#"{{"state": "{state}", "statuses": []}}"#))
        .create_async()
        .await;
}

async fn seed_task(db: &Database, mode: CodingMode) -> Task {
    let repos = RepoDao::new(db.pool().clone());
    let tasks = TaskDao::new(db.pool().clone());
    repos
        .create(&Repository {
            id: "repo-1".into(),
            remote_url: format!("https://github.com/{REPO_FULL_NAME}.git"),
            default_branch: "main".into(),
            local_mirror_path: None,
        })
        .await
        .unwrap();
    let task = Task {
        id: "task-1".into(),
        repository_id: "repo-1".into(),
        title: "demo".into(),
        coding_mode: mode,
        kanban_state: KanbanState::Todo,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    tasks.create(&task).await.unwrap();
    task
}

/// In-process worker standing in for the real job handlers: every run
/// "succeeds" with a fresh commit sha; reviews score from the script.
fn spawn_fake_worker(
    queue: Arc<SqliteQueue>,
    runs: RunDao,
    reviews: ReviewDao,
    script: Arc<Script>,
) -> JoinHandle<()> {
    let run_counter = Arc::new(AtomicU32::new(0));
    tokio::spawn(async move {
        loop {
            let job = match queue.dequeue("fake-worker", Duration::from_secs(60)).await {
                Ok(Some(job)) => job,
                _ => {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    continue;
                }
            };

            match job.kind {
                JobKind::RunExecute => {
                    let n = run_counter.fetch_add(1, Ordering::SeqCst) + 1;
                    runs.update_status(&job.ref_id, RunStatus::Running, RunUpdate::default())
                        .await
                        .unwrap();
                    runs.update_workspace(&job.ref_id, WORK_BRANCH, "/tmp/fake-workspace")
                        .await
                        .unwrap();
                    runs.update_status(
                        &job.ref_id,
                        RunStatus::Succeeded,
                        RunUpdate {
                            summary: Some(format!("change {n}")),
                            commit_sha: Some(format!("sha{n}")),
                            session_id: Some("sess-1".into()),
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap();
                }
                JobKind::ReviewExecute => {
                    let score = {
                        let mut scores = script.review_scores.lock().await;
                        if scores.len() > 1 {
                            scores.pop_front().unwrap()
                        } else {
                            scores.front().copied().unwrap_or(0.9)
                        }
                    };
                    let feedbacks = if score < 0.7 {
                        vec![ReviewFeedback {
                            id: generate_id(),
                            severity: ReviewSeverity::High,
                            category: ReviewCategory::Correctness,
                            file_path: "src/lib.rs".into(),
                            line_start: Some(1),
                            line_end: None,
                            title: "wrong result".into(),
                            description: "the function returns the wrong value".into(),
                            suggestion: None,
                            code_snippet: None,
                        }]
                    } else {
                        Vec::new()
                    };
                    reviews
                        .update_status(
                            &job.ref_id,
                            RunStatus::Succeeded,
                            ReviewUpdate {
                                overall_score: Some(score),
                                summary: Some("scripted review".into()),
                                feedbacks: Some(feedbacks),
                                ..Default::default()
                            },
                        )
                        .await
                        .unwrap();
                }
            }
            queue.complete(&job.id).await.unwrap();
        }
    })
}

impl Harness {
    pub async fn new(
        mode: CodingMode,
        max_ci_iterations: u32,
        review_scores: Vec<f64>,
    ) -> Self {
        let server = mockito::Server::new_async().await;
        let db = Database::connect_memory().await.unwrap();
        seed_task(&db, mode).await;

        let queue = Arc::new(SqliteQueue::new(db.pool().clone()));
        let runs = RunDao::new(db.pool().clone());
        let reviews = ReviewDao::new(db.pool().clone());
        let prs = PrDao::new(db.pool().clone());

        let script = Arc::new(Script {
            review_scores: Mutex::new(review_scores.into()),
        });
        let worker = spawn_fake_worker(
            queue.clone(),
            runs.clone(),
            reviews.clone(),
            script,
        );

        let dispatcher = Dispatcher::new(
            runs.clone(),
            reviews.clone(),
            queue.clone() as Arc<dyn JobQueue>,
            1,
        );
        let github = Arc::new(GitHubClient::new(server.url(), Some("test-token".into())));
        let (engine, events) = CycleEngine::new(
            cycle_config(max_ci_iterations),
            dispatcher,
            runs.clone(),
            TaskDao::new(db.pool().clone()),
            RepoDao::new(db.pool().clone()),
            prs.clone(),
            CycleDao::new(db.pool().clone()),
            github,
            Notifier::new(&crate::config::NotifyConfig { webhook_url: None }),
        );
        let event_loop = CycleEngine::spawn_event_loop(engine.clone(), events);

        Self {
            db,
            queue,
            engine,
            runs,
            reviews,
            prs,
            server,
            worker,
            event_loop,
        }
    }

    /// Wait until the cycle reaches a terminal phase.
    pub async fn await_terminal(&self, task_id: &str, timeout: Duration) -> crate::models::CycleState {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(state) = self.engine.status(task_id).await.unwrap() {
                if state.phase.is_terminal() {
                    return state;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "cycle for {task_id} did not reach a terminal phase in time"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn await_phase(
        &self,
        task_id: &str,
        phase: CyclePhase,
        timeout: Duration,
    ) -> crate::models::CycleState {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(state) = self.engine.status(task_id).await.unwrap() {
                if state.phase == phase {
                    return state;
                }
                assert!(
                    !state.phase.is_terminal(),
                    "cycle ended in {:?} while waiting for {:?} (error: {:?})",
                    state.phase,
                    phase,
                    state.error
                );
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "cycle for {task_id} never reached {phase:?}"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn succeeded_runs(&self, task_id: &str) -> Vec<Run> {
        self.runs
            .list_by_task(task_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.status == RunStatus::Succeeded)
            .collect()
    }
}
