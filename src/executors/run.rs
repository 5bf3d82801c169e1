//! Run job handler: one agent execution from workspace sync to push.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::agents::{is_session_error, AgentCli, AgentInvocation, AgentResult, AgentRunner};
use crate::commit_message::CommitMessageTranslator;
use crate::config::{AgentConfig, WorkspaceConfig};
use crate::constants::{COMMIT_SUBJECT_MAX_LEN, SUMMARY_FILE_NAME};
use crate::diff::parse_unified_diff;
use crate::dispatch::PAYLOAD_RESUME_SESSION;
use crate::github::GitHubClient;
use crate::models::{
    short_id, AgentConstraints, ExecutorKind, FileDiff, Job, JobStatus, Repository, Run, RunStatus,
};
use crate::output::OutputMultiplexer;
use crate::queue::JobQueue;
use crate::storage::{RepoDao, RunDao, RunUpdate, TaskDao};
use crate::worker::JobHandler;
use crate::workspace::{WorkspaceInfo, WorkspaceManager};
use crate::{GyreError, Result};

pub struct RunJobHandler {
    runs: RunDao,
    tasks: TaskDao,
    repos: RepoDao,
    workspaces: WorkspaceManager,
    agents: HashMap<ExecutorKind, Arc<dyn AgentCli>>,
    agent_config: AgentConfig,
    workspace_config: WorkspaceConfig,
    output: Arc<OutputMultiplexer>,
    github: Arc<GitHubClient>,
    queue: Arc<dyn JobQueue>,
    translator: Option<CommitMessageTranslator>,
}

impl RunJobHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runs: RunDao,
        tasks: TaskDao,
        repos: RepoDao,
        workspaces: WorkspaceManager,
        agents: HashMap<ExecutorKind, Arc<dyn AgentCli>>,
        agent_config: AgentConfig,
        workspace_config: WorkspaceConfig,
        output: Arc<OutputMultiplexer>,
        github: Arc<GitHubClient>,
        queue: Arc<dyn JobQueue>,
        translator: Option<CommitMessageTranslator>,
    ) -> Self {
        Self {
            runs,
            tasks,
            repos,
            workspaces,
            agents,
            agent_config,
            workspace_config,
            output,
            github,
            queue,
            translator,
        }
    }

    async fn log(&self, run_id: &str, logs: &mut Vec<String>, line: impl Into<String>) {
        let line = line.into();
        info!("[{}] {line}", short_id(run_id));
        self.output.publish(run_id, line.clone()).await;
        logs.push(line);
    }

    /// The worker observes out-of-band cancelation between steps.
    async fn check_canceled(&self, job: &Job) -> Result<()> {
        if let Some(current) = self.queue.get(&job.id).await? {
            if current.status == JobStatus::Canceled {
                return Err(GyreError::Canceled(
                    current
                        .last_error
                        .unwrap_or_else(|| "job canceled".to_string()),
                ));
            }
        }
        Ok(())
    }

    fn auth_url(&self, repo: &Repository) -> Option<String> {
        let (owner, name) = repo.full_name()?;
        self.github.auth_clone_url(&owner, &name).ok()
    }

    /// Reuse the previous workspace for this (task, executor) pair when it
    /// still validates and, for default-branch work, is not stale; create a
    /// fresh clone otherwise.
    async fn resolve_workspace(
        &self,
        run: &Run,
        repo: &Repository,
        logs: &mut Vec<String>,
    ) -> Result<WorkspaceInfo> {
        if let Some(previous) = self
            .runs
            .get_latest_workspace_run(&run.task_id, run.executor_kind)
            .await?
        {
            if let Some(path_str) = &previous.workspace_path {
                let path = PathBuf::from(path_str);
                if self.workspaces.is_valid(&path).await {
                    let fresh = if run.base_ref == repo.default_branch {
                        self.workspaces
                            .is_fresh_against_default(&path, &repo.default_branch)
                            .await
                    } else {
                        true
                    };
                    if fresh {
                        let branch = match &previous.working_branch {
                            Some(branch) => branch.clone(),
                            None => self.workspaces.get_current_branch(&path).await?,
                        };
                        self.log(&run.id, logs, format!("Reusing workspace {path_str}"))
                            .await;
                        return Ok(WorkspaceInfo {
                            path,
                            branch_name: branch,
                            base_branch: previous.base_ref.clone(),
                            created_at: previous.created_at,
                        });
                    }
                    self.log(
                        &run.id,
                        logs,
                        "Existing workspace is behind the default branch, creating a new one",
                    )
                    .await;
                } else {
                    warn!("Workspace invalid or broken, will create new: {path_str}");
                }
            }
        }

        let auth_url = self.auth_url(repo);
        let workspace = self
            .workspaces
            .create(
                &repo.remote_url,
                &run.base_ref,
                &run.id,
                self.workspace_config.branch_prefix.as_deref(),
                auth_url.as_deref(),
                self.workspace_config.use_shallow_clone,
            )
            .await?;
        self.log(
            &run.id,
            logs,
            format!(
                "Created workspace {} on branch {}",
                workspace.path.display(),
                workspace.branch_name
            ),
        )
        .await;
        Ok(workspace)
    }

    async fn invoke_agent(
        &self,
        run: &Run,
        adapter: &Arc<dyn AgentCli>,
        workspace: &Path,
        instruction: &str,
        resume_session_id: Option<String>,
    ) -> Result<AgentResult> {
        let invocation = AgentInvocation {
            workspace: workspace.to_path_buf(),
            instruction: instruction.to_string(),
            resume_session_id,
            read_only: false,
        };

        // Forward stream lines to the multiplexer while the agent runs.
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let forward = {
            let output = self.output.clone();
            let run_id = run.id.to_string();
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    output.publish(&run_id, line).await;
                }
            })
        };

        let result = AgentRunner::run(
            adapter.as_ref(),
            &invocation,
            self.agent_config.timeout_for(run.executor_kind),
            Some(tx),
        )
        .await;
        let _ = forward.await;
        result
    }

    async fn read_and_remove_summary_file(
        &self,
        run_id: &str,
        workspace: &Path,
        logs: &mut Vec<String>,
    ) -> Option<String> {
        let summary_path = workspace.join(SUMMARY_FILE_NAME);
        if !summary_path.exists() {
            return None;
        }
        match tokio::fs::read_to_string(&summary_path).await {
            Ok(content) => {
                let _ = tokio::fs::remove_file(&summary_path).await;
                self.log(
                    run_id,
                    logs,
                    format!("Read summary from {SUMMARY_FILE_NAME} and removed it"),
                )
                .await;
                let trimmed = content.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Err(e) => {
                logs.push(format!("Warning: could not read summary file: {e}"));
                None
            }
        }
    }

    async fn execute(&self, job: &Job, run: &Run, logs: &mut Vec<String>) -> Result<()> {
        let adapter = self
            .agents
            .get(&run.executor_kind)
            .ok_or_else(|| {
                GyreError::Precondition(format!(
                    "no agent adapter for {}",
                    run.executor_kind.as_str()
                ))
            })?
            .clone();

        self.runs
            .update_status(&run.id, RunStatus::Running, RunUpdate::default())
            .await?;
        self.log(
            &run.id,
            logs,
            format!("Starting {} execution...", adapter.display_name()),
        )
        .await;

        let task = self
            .tasks
            .get(&run.task_id)
            .await?
            .ok_or_else(|| GyreError::Precondition(format!("task not found: {}", run.task_id)))?;
        let repo = self
            .repos
            .get(&task.repository_id)
            .await?
            .ok_or_else(|| {
                GyreError::Precondition(format!("repository not found: {}", task.repository_id))
            })?;

        let workspace = self.resolve_workspace(run, &repo, logs).await?;
        self.runs
            .update_workspace(
                &run.id,
                &workspace.branch_name,
                &workspace.path.to_string_lossy(),
            )
            .await?;
        self.check_canceled(job).await?;

        let auth_url = self.auth_url(&repo);
        let mut conflict_instruction: Option<String> = None;

        // Pre-sync: pull remote updates to the working branch; a conflict is
        // reshaped into part of the agent's instruction.
        match self
            .workspaces
            .is_behind_remote(&workspace.path, &workspace.branch_name, auth_url.as_deref())
            .await
        {
            Ok(true) => {
                self.log(&run.id, logs, "Detected remote updates, pulling latest changes...")
                    .await;
                let sync = self
                    .workspaces
                    .sync_with_remote(&workspace.path, &workspace.branch_name, auth_url.as_deref())
                    .await?;
                if sync.success {
                    self.log(
                        &run.id,
                        logs,
                        format!("Pulled {} commit(s) from remote", sync.commits_pulled),
                    )
                    .await;
                } else if sync.has_conflicts() {
                    self.log(
                        &run.id,
                        logs,
                        format!(
                            "Merge conflicts detected in: {}. The agent will be asked to resolve them.",
                            sync.conflict_files.join(", ")
                        ),
                    )
                    .await;
                    conflict_instruction =
                        Some(build_sync_conflict_instruction(&sync.conflict_files));
                } else {
                    logs.push(format!("Pull failed: {}", sync.error.unwrap_or_default()));
                }
            }
            Ok(false) => {}
            Err(e) => logs.push(format!("Remote sync warning: {e}")),
        }

        // Base-branch merge when the user asked for conflict resolution.
        if conflict_instruction.is_none() && is_conflict_resolution_request(&run.instruction) {
            self.log(
                &run.id,
                logs,
                format!("Merging base branch {} into working branch", workspace.base_branch),
            )
            .await;
            let merge = self
                .workspaces
                .merge_base_branch(&workspace.path, &workspace.base_branch, auth_url.as_deref())
                .await?;
            if merge.has_conflicts {
                conflict_instruction = Some(build_base_conflict_instruction(
                    &merge.conflict_files,
                    &workspace.base_branch,
                ));
            }
        }

        self.check_canceled(job).await?;

        // Final instruction: constraints, conflict preamble, user task.
        let constraints = AgentConstraints.to_prompt();
        let instruction = match &conflict_instruction {
            Some(conflict) => format!("{constraints}\n\n{conflict}\n\n## Task\n{}", run.instruction),
            None => format!("{constraints}\n\n## Task\n{}", run.instruction),
        };

        let resume_session_id = job.payload[PAYLOAD_RESUME_SESSION]
            .as_str()
            .map(str::to_string);

        self.log(
            &run.id,
            logs,
            format!("Launching {} CLI...", adapter.display_name()),
        )
        .await;
        let mut result = self
            .invoke_agent(
                run,
                &adapter,
                &workspace.path,
                &instruction,
                resume_session_id.clone(),
            )
            .await?;

        // A rejected resume token gets one retry without it.
        if !result.success && resume_session_id.is_some() {
            if let Some(error) = &result.error {
                if is_session_error(error) {
                    self.log(
                        &run.id,
                        logs,
                        format!("Session continuation failed ({error}). Retrying without session."),
                    )
                    .await;
                    result = self
                        .invoke_agent(run, &adapter, &workspace.path, &instruction, None)
                        .await?;
                }
            }
        }

        self.check_canceled(job).await?;

        if !result.success {
            let mut all_logs = logs.clone();
            all_logs.extend(result.logs.clone());
            self.runs
                .update_status(
                    &run.id,
                    RunStatus::Failed,
                    RunUpdate {
                        error: result.error.clone(),
                        logs: Some(all_logs),
                        warnings: Some(result.warnings.clone()),
                        session_id: result.session_id.clone().or(resume_session_id),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }

        let summary_from_file = self
            .read_and_remove_summary_file(&run.id, &workspace.path, logs)
            .await;

        self.workspaces.stage_all(&workspace.path).await?;
        let patch = self.workspaces.get_diff(&workspace.path, true).await?;

        if patch.trim().is_empty() {
            self.log(&run.id, logs, "No changes detected, skipping commit/push")
                .await;
            let mut all_logs = logs.clone();
            all_logs.extend(result.logs.clone());
            self.runs
                .update_status(
                    &run.id,
                    RunStatus::Succeeded,
                    RunUpdate {
                        summary: Some("No changes made".to_string()),
                        patch: Some(String::new()),
                        files_changed: Some(Vec::new()),
                        logs: Some(all_logs),
                        warnings: Some(result.warnings.clone()),
                        session_id: result.session_id.clone().or(resume_session_id),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }

        let files_changed = parse_unified_diff(&patch);
        self.log(
            &run.id,
            logs,
            format!("Detected {} changed file(s)", files_changed.len()),
        )
        .await;

        self.check_canceled(job).await?;

        let summary = summary_from_file
            .or_else(|| result.summary.clone())
            .unwrap_or_else(|| summarize_files(&files_changed));
        let mut message = generate_commit_message(&run.instruction, &summary);
        if let Some(translator) = &self.translator {
            message = translator.ensure_english(&message).await;
        }

        let commit_sha = self.workspaces.commit(&workspace.path, &message).await?;
        self.log(&run.id, logs, format!("Committed: {}", short_id(&commit_sha)))
            .await;

        let push = self
            .workspaces
            .push(&workspace.path, &workspace.branch_name, auth_url.as_deref())
            .await?;
        if push.success {
            let note = if push.required_pull {
                format!(
                    "Pulled remote changes and pushed to branch: {}",
                    workspace.branch_name
                )
            } else {
                format!("Pushed to branch: {}", workspace.branch_name)
            };
            self.log(&run.id, logs, note).await;
        } else {
            self.log(
                &run.id,
                logs,
                format!(
                    "Push failed (will retry on PR creation): {}",
                    push.error.unwrap_or_default()
                ),
            )
            .await;
        }

        let mut all_logs = logs.clone();
        all_logs.extend(result.logs.clone());
        self.runs
            .update_status(
                &run.id,
                RunStatus::Succeeded,
                RunUpdate {
                    summary: Some(summary),
                    patch: Some(patch),
                    files_changed: Some(files_changed),
                    logs: Some(all_logs),
                    warnings: Some(result.warnings.clone()),
                    session_id: result.session_id.clone().or(resume_session_id),
                    commit_sha: Some(commit_sha),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for RunJobHandler {
    async fn handle(&self, job: &Job) -> Result<()> {
        let run = self
            .runs
            .get(&job.ref_id)
            .await?
            .ok_or_else(|| GyreError::Precondition(format!("run not found: {}", job.ref_id)))?;

        // A redelivered job whose run already finished has nothing to do.
        if run.status.is_terminal() {
            return Ok(());
        }

        let mut logs = Vec::new();
        let outcome = self.execute(job, &run, &mut logs).await;
        self.output.mark_complete(&run.id).await;

        match outcome {
            Ok(()) => Ok(()),
            Err(GyreError::Canceled(reason)) => {
                logs.push("Execution canceled".to_string());
                self.runs
                    .update_status(
                        &run.id,
                        RunStatus::Canceled,
                        RunUpdate {
                            error: Some(reason.clone()),
                            logs: Some(logs),
                            ..Default::default()
                        },
                    )
                    .await?;
                Err(GyreError::Canceled(reason))
            }
            Err(e) => {
                // Keep the run claimable for another attempt until the last
                // one; then the failure is the run's failure.
                if job.attempts >= job.max_attempts {
                    logs.push(format!("Execution failed: {e}"));
                    self.runs
                        .update_status(
                            &run.id,
                            RunStatus::Failed,
                            RunUpdate {
                                error: Some(e.to_string()),
                                logs: Some(logs),
                                ..Default::default()
                            },
                        )
                        .await?;
                } else if e.is_permanent() {
                    self.runs
                        .update_status(
                            &run.id,
                            RunStatus::Failed,
                            RunUpdate {
                                error: Some(e.to_string()),
                                logs: Some(logs),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                Err(e)
            }
        }
    }
}

/// Commit subject from the instruction's first line, body from the summary.
pub fn generate_commit_message(instruction: &str, summary: &str) -> String {
    let first_line: String = instruction
        .lines()
        .next()
        .unwrap_or("")
        .chars()
        .take(COMMIT_SUBJECT_MAX_LEN)
        .collect();
    if summary.is_empty() {
        first_line
    } else {
        format!("{first_line}\n\n{summary}")
    }
}

/// Fallback summary synthesized from diff stats.
pub fn summarize_files(files: &[FileDiff]) -> String {
    if files.is_empty() {
        return "No files were modified.".to_string();
    }
    let added: u32 = files.iter().map(|f| f.added_lines).sum();
    let removed: u32 = files.iter().map(|f| f.removed_lines).sum();
    let listed: Vec<&str> = files.iter().take(5).map(|f| f.path.as_str()).collect();
    let mut file_list = listed.join(", ");
    if files.len() > 5 {
        file_list.push_str(&format!(" and {} more", files.len() - 5));
    }
    format!(
        "Modified {} file(s). +{added} -{removed} lines. Files: {file_list}.",
        files.len()
    )
}

const CONFLICT_KEYWORDS: [&str; 7] = [
    "conflict",
    "merge",
    "rebase",
    "main",
    "master",
    "base branch",
    "update branch",
];
const RESOLUTION_KEYWORDS: [&str; 3] = ["resolve", "fix", "sync"];

/// Keyword heuristic for "the user asked to resolve base-branch conflicts".
/// A documented approximation: one conflict keyword plus one resolution
/// keyword.
pub fn is_conflict_resolution_request(instruction: &str) -> bool {
    let lower = instruction.to_lowercase();
    CONFLICT_KEYWORDS.iter().any(|k| lower.contains(k))
        && RESOLUTION_KEYWORDS.iter().any(|k| lower.contains(k))
}

pub fn build_sync_conflict_instruction(conflict_files: &[String]) -> String {
    let files_list: String = conflict_files
        .iter()
        .map(|f| format!("- {f}\n"))
        .collect();
    format!(
        "## IMPORTANT: Merge Conflict Resolution Required\n\
         \n\
         The following files have merge conflicts that MUST be resolved before \
         proceeding with the task:\n\
         \n\
         {files_list}\
         \n\
         ### Instructions for Conflict Resolution:\n\
         1. Open each conflicted file listed above\n\
         2. Look for conflict markers: `<<<<<<<`, `=======`, and `>>>>>>>`\n\
         3. Understand both versions of the conflicting code\n\
         4. Resolve each conflict by keeping the correct code (you may combine \
         both versions if appropriate)\n\
         5. Remove ALL conflict markers completely\n\
         6. Ensure the resolved code is syntactically correct and functional\n\
         \n\
         After resolving ALL conflicts, proceed with the original task below."
    )
}

pub fn build_base_conflict_instruction(conflict_files: &[String], base_branch: &str) -> String {
    let files_list: String = conflict_files
        .iter()
        .map(|f| format!("- {f}\n"))
        .collect();
    format!(
        "## IMPORTANT: Base Branch Merge Conflicts\n\
         \n\
         Merging `origin/{base_branch}` into the working branch produced \
         conflicts in the following files:\n\
         \n\
         {files_list}\
         \n\
         Resolve every conflict (remove all `<<<<<<<`/`=======`/`>>>>>>>` \
         markers, keep the correct code from both sides) and make sure the \
         result is syntactically valid. Then continue with the task below."
    )
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_message_truncates_subject_and_appends_summary() {
        let long = "x".repeat(100);
        let message = generate_commit_message(&long, "the summary");
        let mut lines = message.lines();
        assert_eq!(lines.next().unwrap().len(), COMMIT_SUBJECT_MAX_LEN);
        assert_eq!(lines.next(), Some(""));
        assert_eq!(lines.next(), Some("the summary"));

        assert_eq!(generate_commit_message("short task", ""), "short task");
    }

    #[test]
    fn conflict_heuristic_needs_both_keyword_groups() {
        assert!(is_conflict_resolution_request(
            "Please resolve the merge conflicts with main"
        ));
        assert!(is_conflict_resolution_request("sync with the base branch"));
        assert!(!is_conflict_resolution_request("merge the two structs"));
        assert!(!is_conflict_resolution_request("fix the login bug"));
    }

    #[test]
    fn file_summary_lists_first_five_files() {
        let files: Vec<FileDiff> = (0..7)
            .map(|n| FileDiff {
                path: format!("src/file{n}.rs"),
                added_lines: 2,
                removed_lines: 1,
            })
            .collect();
        let summary = summarize_files(&files);
        assert!(summary.contains("Modified 7 file(s)"));
        assert!(summary.contains("+14 -7 lines"));
        assert!(summary.contains("and 2 more"));
        assert_eq!(summarize_files(&[]), "No files were modified.");
    }

    #[test]
    fn conflict_instructions_name_the_files() {
        let files = vec!["src/a.rs".to_string(), "src/b.rs".to_string()];
        let sync = build_sync_conflict_instruction(&files);
        assert!(sync.contains("- src/a.rs"));
        assert!(sync.contains("<<<<<<<"));

        let base = build_base_conflict_instruction(&files, "main");
        assert!(base.contains("origin/main"));
        assert!(base.contains("- src/b.rs"));
    }
}
