//! Autonomous development cycle engine.
//!
//! Per task in semi- or full-auto mode, one [`CycleState`] advances through
//! coding, CI, review, and merge phases. Every transition happens under the
//! task's state lock, is persisted, and launches at most one background
//! phase task through the [`TaskSupervisor`]. CI outcomes arrive as events
//! from the [`CiPoller`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::CycleConfig;
use crate::constants::CI_ERROR_LOG_MAX_CHARS;
use crate::dispatch::Dispatcher;
use crate::executors::review::build_fix_instruction;
use crate::github::GitHubClient;
use crate::models::{
    generate_id, AgentConstraints, CiJobResult, CiResult, CodingMode, CyclePhase, CycleState,
    ExecutorKind, PrStatus, PullRequest, Repository, Review, ReviewSeverity, RunStatus, Task,
};
use crate::notify::Notifier;
use crate::storage::{CycleDao, PrDao, RepoDao, RunDao, TaskDao};
use crate::{GyreError, Result};

pub mod ci_poller;
pub mod supervisor;

pub use ci_poller::{CiPollEvent, CiPoller};
pub use supervisor::TaskSupervisor;

pub struct CycleEngine {
    config: CycleConfig,
    dispatcher: Dispatcher,
    runs: RunDao,
    tasks: TaskDao,
    repos: RepoDao,
    prs: PrDao,
    states_dao: CycleDao,
    github: Arc<GitHubClient>,
    notifier: Notifier,
    supervisor: TaskSupervisor,
    ci_poller: CiPoller,
    states: Mutex<HashMap<String, Arc<Mutex<CycleState>>>>,
}

impl CycleEngine {
    /// Build the engine together with the receiver its CI poller feeds;
    /// pass the receiver to [`CycleEngine::spawn_event_loop`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CycleConfig,
        dispatcher: Dispatcher,
        runs: RunDao,
        tasks: TaskDao,
        repos: RepoDao,
        prs: PrDao,
        states_dao: CycleDao,
        github: Arc<GitHubClient>,
        notifier: Notifier,
    ) -> (Arc<Self>, mpsc::Receiver<CiPollEvent>) {
        let (events_tx, events_rx) = mpsc::channel(32);
        let ci_poller = CiPoller::new(
            github.clone(),
            Duration::from_secs(config.ci_poll_interval_secs),
            Duration::from_secs(config.ci_poll_timeout_secs),
            events_tx,
        );
        let engine = Arc::new(Self {
            config,
            dispatcher,
            runs,
            tasks,
            repos,
            prs,
            states_dao,
            github,
            notifier,
            supervisor: TaskSupervisor::new(),
            ci_poller,
            states: Mutex::new(HashMap::new()),
        });
        (engine, events_rx)
    }

    /// Consume CI poll events for the lifetime of the process.
    pub fn spawn_event_loop(
        engine: Arc<Self>,
        mut events: mpsc::Receiver<CiPollEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    CiPollEvent::Completed { task_id, result } => {
                        if let Err(e) = engine.clone().handle_ci_result(&task_id, result).await {
                            error!("[{task_id}] CI result handling failed: {e}");
                        }
                    }
                    CiPollEvent::TimedOut { task_id } => {
                        engine.fail_state(&task_id, "CI polling timed out").await;
                    }
                }
            }
        })
    }

    // -----------------------------------------------------------------
    // Public API

    /// Start the autonomous cycle for a task. Interactive tasks are
    /// refused; the cycle engine only drives semi- and full-auto modes.
    pub async fn start_task(self: Arc<Self>, task_id: &str, instruction: &str) -> Result<CycleState> {
        let task = self
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| GyreError::Precondition(format!("task not found: {task_id}")))?;
        if task.coding_mode == CodingMode::Interactive {
            return Err(GyreError::Precondition(
                "interactive tasks are not driven by the cycle engine".to_string(),
            ));
        }

        let state = CycleState::new(task_id, task.coding_mode);
        {
            let mut states = self.states.lock().await;
            states.insert(task_id.to_string(), Arc::new(Mutex::new(state.clone())));
        }
        self.states_dao.upsert(&state).await?;
        info!("[{task_id}] Starting autonomous cycle in {} mode", state.mode.as_str());

        let engine = self.clone();
        let task_id_owned = task_id.to_string();
        let instruction_owned = instruction.to_string();
        self.start_phase(task_id, "Coding phase", async move {
            engine.coding_phase(task_id_owned, instruction_owned).await
        })
        .await;

        Ok(state)
    }

    /// Current state, from memory or the store.
    pub async fn status(&self, task_id: &str) -> Result<Option<CycleState>> {
        if let Some(state) = self.states.lock().await.get(task_id) {
            return Ok(Some(state.lock().await.clone()));
        }
        self.states_dao.get_by_task(task_id).await
    }

    /// Cancel the cycle: stop polling, abort the background phase, fail the
    /// state.
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        let exists = { self.states.lock().await.contains_key(task_id) };
        if !exists {
            return Ok(false);
        }
        self.ci_poller.stop_polling(task_id).await;
        self.supervisor.cancel(task_id).await;
        self.fail_state(task_id, "Canceled by user").await;
        Ok(true)
    }

    /// Human approves the merge (semi-auto, awaiting-human only).
    pub async fn approve_merge(self: Arc<Self>, task_id: &str) -> Result<CycleState> {
        let state_arc = self.state_arc(task_id).await?;
        let snapshot = {
            let mut state = state_arc.lock().await;
            if state.mode != CodingMode::SemiAuto {
                return Err(GyreError::Precondition(
                    "approve_merge is only for semi-auto mode".to_string(),
                ));
            }
            if state.phase != CyclePhase::AwaitingHuman {
                return Err(GyreError::Precondition(format!(
                    "cannot approve merge in phase {}",
                    state.phase.as_str()
                )));
            }
            state.human_approved = true;
            state.phase = CyclePhase::MergeCheck;
            state.touch();
            self.states_dao.upsert(&state).await?;
            state.clone()
        };

        let engine = self.clone();
        let task_id_owned = task_id.to_string();
        self.start_phase(task_id, "Merge phase (approved)", async move {
            engine.merge_phase(task_id_owned).await
        })
        .await;
        Ok(snapshot)
    }

    /// Human rejects the merge. With feedback the cycle re-enters coding on
    /// that feedback; without it the task fails.
    pub async fn reject_merge(
        self: Arc<Self>,
        task_id: &str,
        feedback: Option<String>,
    ) -> Result<CycleState> {
        let state_arc = self.state_arc(task_id).await?;
        {
            let state = state_arc.lock().await;
            if state.mode != CodingMode::SemiAuto {
                return Err(GyreError::Precondition(
                    "reject_merge is only for semi-auto mode".to_string(),
                ));
            }
            if state.phase != CyclePhase::AwaitingHuman {
                return Err(GyreError::Precondition(format!(
                    "cannot reject merge in phase {}",
                    state.phase.as_str()
                )));
            }
        }

        match feedback {
            Some(feedback) => {
                {
                    let mut state = state_arc.lock().await;
                    state.phase = CyclePhase::Coding;
                    state.touch();
                    self.states_dao.upsert(&state).await?;
                }
                let engine = self.clone();
                let task_id_owned = task_id.to_string();
                self.start_phase(task_id, "Coding phase (human feedback)", async move {
                    engine.coding_phase(task_id_owned, feedback).await
                })
                .await;
            }
            None => {
                self.fail_state(task_id, "Human rejected without feedback")
                    .await;
            }
        }

        let state = state_arc.lock().await;
        Ok(state.clone())
    }

    /// React to a terminal CI outcome.
    pub async fn handle_ci_result(self: Arc<Self>, task_id: &str, result: CiResult) -> Result<()> {
        let state_arc = self.state_arc(task_id).await?;

        enum Next {
            Review,
            FixCi(Vec<CiJobResult>),
            Exhausted,
        }

        let next = {
            let mut state = state_arc.lock().await;
            state.last_ci_result = Some(result.clone());
            state.touch();

            if result.success {
                state.phase = CyclePhase::Reviewing;
                self.states_dao.upsert(&state).await?;
                Next::Review
            } else {
                state.ci_iterations += 1;
                if state.ci_iterations > self.config.max_ci_iterations {
                    state.phase = CyclePhase::Failed;
                    state.error = Some("Exceeded max CI fix iterations".to_string());
                    self.states_dao.upsert(&state).await?;
                    Next::Exhausted
                } else {
                    state.phase = CyclePhase::FixingCi;
                    self.states_dao.upsert(&state).await?;
                    Next::FixCi(result.failed_jobs.clone())
                }
            }
        };

        match next {
            Next::Review => {
                let engine = self.clone();
                let task_id_owned = task_id.to_string();
                self.start_phase(task_id, "Review phase", async move {
                    engine.review_phase(task_id_owned).await
                })
                .await;
            }
            Next::FixCi(failed_jobs) => {
                let engine = self.clone();
                let task_id_owned = task_id.to_string();
                self.start_phase(task_id, "CI fix phase", async move {
                    let instruction = build_ci_fix_instruction(&failed_jobs);
                    engine.coding_phase(task_id_owned, instruction).await
                })
                .await;
            }
            Next::Exhausted => {
                let state = state_arc.lock().await.clone();
                self.notifier.failed(&state).await;
            }
        }
        Ok(())
    }

    /// React to a finished review.
    pub async fn handle_review_result(
        self: Arc<Self>,
        task_id: &str,
        score: f64,
        approved: bool,
        review: &Review,
    ) -> Result<()> {
        let state_arc = self.state_arc(task_id).await?;

        enum Next {
            AwaitHuman,
            Merge,
            FixReview(String),
            Exhausted,
        }

        let next = {
            let mut state = state_arc.lock().await;
            state.last_review_score = Some(score);
            state.touch();

            if approved && score >= self.config.min_review_score {
                if state.mode == CodingMode::SemiAuto {
                    state.phase = CyclePhase::AwaitingHuman;
                    self.states_dao.upsert(&state).await?;
                    Next::AwaitHuman
                } else {
                    state.phase = CyclePhase::MergeCheck;
                    self.states_dao.upsert(&state).await?;
                    Next::Merge
                }
            } else {
                state.review_iterations += 1;
                if state.review_iterations > self.config.max_review_iterations {
                    state.phase = CyclePhase::Failed;
                    state.error = Some("Exceeded max review fix iterations".to_string());
                    self.states_dao.upsert(&state).await?;
                    Next::Exhausted
                } else {
                    state.phase = CyclePhase::FixingReview;
                    self.states_dao.upsert(&state).await?;

                    // Critical and high findings drive the fix; fall back to
                    // everything, then to a generic nudge.
                    let mut instruction = build_fix_instruction(
                        &review.feedbacks,
                        &[ReviewSeverity::Critical, ReviewSeverity::High],
                        None,
                    );
                    if review.feedbacks.iter().all(|f| {
                        !matches!(f.severity, ReviewSeverity::Critical | ReviewSeverity::High)
                    }) {
                        instruction = if review.feedbacks.is_empty() {
                            "Address the review feedback and fix the issues.".to_string()
                        } else {
                            build_fix_instruction(&review.feedbacks, &[], None)
                        };
                    }
                    Next::FixReview(instruction)
                }
            }
        };

        match next {
            Next::AwaitHuman => {
                let state = state_arc.lock().await.clone();
                self.notifier.ready_for_merge(&state).await;
            }
            Next::Merge => {
                let engine = self.clone();
                let task_id_owned = task_id.to_string();
                self.start_phase(task_id, "Merge phase", async move {
                    engine.merge_phase(task_id_owned).await
                })
                .await;
            }
            Next::FixReview(instruction) => {
                let engine = self.clone();
                let task_id_owned = task_id.to_string();
                self.start_phase(task_id, "Review fix phase", async move {
                    engine.coding_phase(task_id_owned, instruction).await
                })
                .await;
            }
            Next::Exhausted => {
                let state = state_arc.lock().await.clone();
                self.notifier.failed(&state).await;
            }
        }
        Ok(())
    }

    pub async fn active_background_tasks(&self) -> usize {
        self.supervisor.active_count().await
    }

    // -----------------------------------------------------------------
    // Phase implementations

    async fn coding_phase(self: Arc<Self>, task_id: String, instruction: String) -> Result<()> {
        let state_arc = self.state_arc(&task_id).await?;

        let (snapshot, over_budget, warn) = {
            let mut state = state_arc.lock().await;
            state.phase = CyclePhase::Coding;
            state.iteration += 1;
            state.touch();

            let over_budget = state.iteration > self.config.max_total_iterations;
            if over_budget {
                state.phase = CyclePhase::Failed;
                state.error = Some("Exceeded max total iterations".to_string());
            }
            let warn = !over_budget && state.iteration >= self.config.warn_iteration_threshold;
            self.states_dao.upsert(&state).await?;
            (state.clone(), over_budget, warn)
        };

        if over_budget {
            self.notifier.failed(&snapshot).await;
            return Ok(());
        }
        if warn {
            self.notifier
                .warning(&snapshot, format!("High iteration count: {}", snapshot.iteration))
                .await;
        }

        let (task, repo) = self.task_and_repo(&task_id).await?;
        let enhanced = self.enhance_instruction(&instruction, &snapshot);

        let run = self
            .dispatcher
            .create_run(
                &task_id,
                &enhanced,
                ExecutorKind::ClaudeCode,
                &repo.default_branch,
                None,
            )
            .await?;
        let run = self
            .dispatcher
            .await_run_terminal(&run.id, Duration::from_secs(self.config.phase_timeout_secs))
            .await?;

        if run.status != RunStatus::Succeeded {
            let reason = format!(
                "Coding run failed: {}",
                run.error.as_deref().unwrap_or("unknown error")
            );
            self.fail_state(&task_id, &reason).await;
            return Ok(());
        }

        // Pin down the PR and head commit that CI will be judged on. With
        // no new commit but an existing PR, CI is re-checked on the
        // previous head.
        let head_sha = match &run.commit_sha {
            Some(sha) => Some(sha.clone()),
            None => {
                let state = state_arc.lock().await;
                if state.pr_number.is_some() {
                    state.current_head_sha.clone()
                } else {
                    None
                }
            }
        };
        let Some(head_sha) = head_sha else {
            self.fail_state(&task_id, "Coding run produced no commit")
                .await;
            return Ok(());
        };

        let repo_full_name = repo_full_name(&repo)?;
        let pr_number = match run.working_branch.as_deref() {
            Some(branch) => {
                self.ensure_pull_request(&task, &repo_full_name, branch, &instruction, &head_sha)
                    .await?
            }
            None => {
                let state = state_arc.lock().await;
                state.pr_number.ok_or_else(|| GyreError::Cycle {
                    task_id: task_id.clone(),
                    message: "no working branch and no existing PR".to_string(),
                })?
            }
        };

        {
            let mut state = state_arc.lock().await;
            state.current_head_sha = Some(head_sha.clone());
            state.pr_number = Some(pr_number);
            state.phase = CyclePhase::WaitingCi;
            state.touch();
            self.states_dao.upsert(&state).await?;
        }

        self.ci_poller
            .start_polling(&task_id, pr_number, &repo_full_name, &head_sha)
            .await;
        Ok(())
    }

    async fn review_phase(self: Arc<Self>, task_id: String) -> Result<()> {
        let latest = self
            .runs
            .latest_succeeded(&task_id)
            .await?
            .ok_or_else(|| GyreError::Cycle {
                task_id: task_id.clone(),
                message: "no successful run found for review".to_string(),
            })?;

        let review = self
            .dispatcher
            .create_review(&task_id, &[latest.id.clone()], ExecutorKind::CodexCli)
            .await?;
        let review = self
            .dispatcher
            .await_review_terminal(&review.id, Duration::from_secs(self.config.phase_timeout_secs))
            .await?;

        let approved = review.status == RunStatus::Succeeded;
        let score = review.overall_score.unwrap_or(0.0);
        self.handle_review_result(&task_id, score, approved, &review)
            .await
    }

    async fn merge_phase(self: Arc<Self>, task_id: String) -> Result<()> {
        let pr_number = {
            let state_arc = self.state_arc(&task_id).await?;
            let state = state_arc.lock().await;
            state.pr_number.ok_or_else(|| GyreError::Cycle {
                task_id: task_id.clone(),
                message: "no PR number in state".to_string(),
            })?
        };

        let (_task, repo) = self.task_and_repo(&task_id).await?;
        let repo_full_name = repo_full_name(&repo)?;

        if !self.github.is_pr_mergeable(&repo_full_name, pr_number).await? {
            self.fail_state(&task_id, &format!("PR #{pr_number} is not mergeable"))
                .await;
            return Ok(());
        }

        {
            let state_arc = self.state_arc(&task_id).await?;
            let mut state = state_arc.lock().await;
            state.phase = CyclePhase::Merging;
            state.touch();
            self.states_dao.upsert(&state).await?;
        }

        let merge = self
            .github
            .merge_pr(&repo_full_name, pr_number, self.config.merge_method)
            .await?;
        if !merge.merged {
            self.fail_state(&task_id, &format!("Merge failed: {}", merge.message))
                .await;
            return Ok(());
        }

        if let Some(mut pr) = self.prs.get_by_number(pr_number).await? {
            if self.config.merge_delete_branch {
                if let Err(e) = self.github.delete_branch(&repo_full_name, &pr.branch).await {
                    warn!("[{task_id}] Could not delete branch {}: {e}", pr.branch);
                }
            }
            pr.status = PrStatus::Merged;
            self.prs.upsert(&pr).await?;
        }

        let snapshot = {
            let state_arc = self.state_arc(&task_id).await?;
            let mut state = state_arc.lock().await;
            state.phase = CyclePhase::Completed;
            state.touch();
            self.states_dao.upsert(&state).await?;
            state.clone()
        };
        info!("[{task_id}] Cycle completed, PR #{pr_number} merged");
        self.notifier.completed(&snapshot).await;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Helpers

    async fn state_arc(&self, task_id: &str) -> Result<Arc<Mutex<CycleState>>> {
        let states = self.states.lock().await;
        states
            .get(task_id)
            .cloned()
            .ok_or_else(|| GyreError::NotFound(format!("no active cycle for task {task_id}")))
    }

    async fn task_and_repo(&self, task_id: &str) -> Result<(Task, Repository)> {
        let task = self
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| GyreError::Precondition(format!("task not found: {task_id}")))?;
        let repo = self
            .repos
            .get(&task.repository_id)
            .await?
            .ok_or_else(|| {
                GyreError::Precondition(format!("repository not found: {}", task.repository_id))
            })?;
        Ok((task, repo))
    }

    /// Find the open PR for the working branch, or open one.
    async fn ensure_pull_request(
        &self,
        task: &Task,
        repo_full_name: &str,
        branch: &str,
        instruction: &str,
        head_sha: &str,
    ) -> Result<u64> {
        if let Some(existing) = self
            .github
            .find_pull_request_by_head(repo_full_name, branch)
            .await?
        {
            let mut record = self
                .prs
                .get_by_number(existing.number)
                .await?
                .unwrap_or(PullRequest {
                    id: generate_id(),
                    task_id: task.id.clone(),
                    number: existing.number,
                    branch: branch.to_string(),
                    base_branch: existing.base.branch.clone(),
                    title: existing.title.clone(),
                    body: existing.body.clone().unwrap_or_default(),
                    head_sha: head_sha.to_string(),
                    status: PrStatus::Open,
                });
            record.head_sha = head_sha.to_string();
            self.prs.upsert(&record).await?;
            return Ok(existing.number);
        }

        let title = if task.title.is_empty() {
            instruction.lines().next().unwrap_or("Automated change").to_string()
        } else {
            task.title.clone()
        };
        let body = format!(
            "Automated change for task `{}`.\n\n## Instruction\n{}",
            task.id,
            instruction.lines().take(20).collect::<Vec<_>>().join("\n")
        );

        let created = self
            .github
            .create_pull_request(
                repo_full_name,
                branch,
                &self.default_base_branch(task).await?,
                &title,
                &body,
            )
            .await?;
        self.prs
            .upsert(&PullRequest {
                id: generate_id(),
                task_id: task.id.clone(),
                number: created.number,
                branch: branch.to_string(),
                base_branch: created.base.branch.clone(),
                title,
                body,
                head_sha: head_sha.to_string(),
                status: PrStatus::Open,
            })
            .await?;
        info!("[{}] Opened PR #{}", task.id, created.number);
        Ok(created.number)
    }

    async fn default_base_branch(&self, task: &Task) -> Result<String> {
        let repo = self
            .repos
            .get(&task.repository_id)
            .await?
            .ok_or_else(|| {
                GyreError::Precondition(format!("repository not found: {}", task.repository_id))
            })?;
        Ok(repo.default_branch)
    }

    fn enhance_instruction(&self, instruction: &str, state: &CycleState) -> String {
        let mut parts = vec![instruction.to_string(), String::new(), AgentConstraints.to_prompt()];
        if state.iteration > 1 {
            parts.push(format!(
                "\n---\nThis is iteration {}.\nCI fix attempts: {}\nReview fix attempts: {}",
                state.iteration, state.ci_iterations, state.review_iterations
            ));
        }
        if let Some(score) = state.last_review_score {
            parts.push(format!("Previous review score: {score:.2}"));
        }
        parts.join("\n")
    }

    /// Run a phase in the background with the configured timeout; the
    /// supervisor guarantees one live phase per task.
    async fn start_phase<F>(self: Arc<Self>, task_id: &str, phase_name: &'static str, fut: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let engine = self.clone();
        let task_id_owned = task_id.to_string();
        let phase_timeout = Duration::from_secs(self.config.phase_timeout_secs);

        let handle = tokio::spawn(async move {
            match tokio::time::timeout(phase_timeout, fut).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("[{task_id_owned}] {phase_name} failed: {e}");
                    engine
                        .fail_state(&task_id_owned, &format!("{phase_name} error: {e}"))
                        .await;
                }
                Err(_) => {
                    error!(
                        "[{task_id_owned}] {phase_name} timed out after {}s",
                        phase_timeout.as_secs()
                    );
                    engine
                        .fail_state(
                            &task_id_owned,
                            &format!("{phase_name} timed out after {}s", phase_timeout.as_secs()),
                        )
                        .await;
                }
            }
        });
        self.supervisor.start(task_id, handle).await;
    }

    /// Transition a cycle to failed (idempotent) and notify.
    async fn fail_state(&self, task_id: &str, error: &str) {
        let Ok(state_arc) = self.state_arc(task_id).await else {
            warn!("[{task_id}] No active cycle state to fail: {error}");
            return;
        };
        let snapshot = {
            let mut state = state_arc.lock().await;
            if state.phase.is_terminal() {
                return;
            }
            state.phase = CyclePhase::Failed;
            state.error = Some(error.to_string());
            state.touch();
            if let Err(e) = self.states_dao.upsert(&state).await {
                error!("[{task_id}] Could not persist failed state: {e}");
            }
            state.clone()
        };
        warn!("[{task_id}] Cycle failed: {error}");
        self.notifier.failed(&snapshot).await;
    }
}

fn repo_full_name(repo: &Repository) -> Result<String> {
    repo.full_name()
        .map(|(owner, name)| format!("{owner}/{name}"))
        .ok_or_else(|| {
            GyreError::Precondition(format!(
                "repository URL is not a GitHub URL: {}",
                repo.remote_url
            ))
        })
}

/// Instruction for fixing CI failures: each failing job's name and error
/// log, a per-job strategy hint, and a closing checklist.
pub fn build_ci_fix_instruction(failed_jobs: &[CiJobResult]) -> String {
    let mut parts = vec!["Fix the following CI failures:\n".to_string()];

    for job in failed_jobs {
        parts.push(format!("\n## {} (FAILED)\n", job.job_name));
        if let Some(log) = &job.error_log {
            let truncated: String = log.chars().take(CI_ERROR_LOG_MAX_CHARS).collect();
            parts.push(format!("```\n{truncated}\n```\n"));
        }
        parts.push(format!("Hint: {}\n", fix_strategy(&job.job_name)));
    }

    parts.push(
        "\nPlease:\n\
         1. Analyze each error carefully\n\
         2. Fix the root cause (not just the symptoms)\n\
         3. Ensure your fixes don't break other tests\n\
         4. Run the relevant checks locally before committing\n"
            .to_string(),
    );
    parts.join("")
}

fn fix_strategy(job_name: &str) -> &'static str {
    let lower = job_name.to_lowercase();
    if lower.contains("test") {
        "run the failing tests locally and fix the code (or outdated tests)"
    } else if lower.contains("lint") || lower.contains("fmt") || lower.contains("format") {
        "run the linter/formatter locally and apply its fixes"
    } else if lower.contains("build") || lower.contains("compile") {
        "fix the compilation errors reported in the log"
    } else {
        "reproduce the failure locally using the job's command"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ci_fix_instruction_includes_jobs_logs_and_hints() {
        let jobs = vec![
            CiJobResult {
                job_name: "unit-tests".into(),
                error_log: Some("AssertionError: 1 != 2".into()),
            },
            CiJobResult {
                job_name: "lint".into(),
                error_log: None,
            },
        ];
        let instruction = build_ci_fix_instruction(&jobs);
        assert!(instruction.contains("## unit-tests (FAILED)"));
        assert!(instruction.contains("AssertionError: 1 != 2"));
        assert!(instruction.contains("## lint (FAILED)"));
        assert!(instruction.contains("linter"));
        assert!(instruction.contains("root cause"));
    }

    #[test]
    fn ci_error_logs_are_truncated() {
        let jobs = vec![CiJobResult {
            job_name: "unit-tests".into(),
            error_log: Some("x".repeat(10_000)),
        }];
        let instruction = build_ci_fix_instruction(&jobs);
        let log_len = instruction.matches('x').count();
        assert_eq!(log_len, CI_ERROR_LOG_MAX_CHARS);
    }
}
