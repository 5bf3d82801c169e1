//! Review job handler: read-only agent execution over one or more run
//! patches, producing a structured verdict.
//!
//! The agent's output is not trusted to be pure JSON: the verdict is dug
//! out of the stream by scanning balanced objects from the end (the real
//! response follows the prompt, which itself contains an example object),
//! and the echoed prompt template is explicitly rejected.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::agents::{AgentCli, AgentInvocation, AgentRunner};
use crate::config::AgentConfig;
use crate::constants::{
    MAX_INLINE_PATCH_CHARS, REVIEW_PATCH_FILE_NAME, REVIEW_TEMPLATE_EXAMPLE_PATH,
};
use crate::models::{
    generate_id, short_id, AgentConstraints, ExecutorKind, Job, JobStatus, Review, ReviewCategory,
    ReviewFeedback, ReviewSeverity, Run, RunStatus,
};
use crate::output::OutputMultiplexer;
use crate::queue::JobQueue;
use crate::storage::{ReviewDao, ReviewUpdate, RunDao};
use crate::worker::JobHandler;
use crate::workspace::WorkspaceManager;
use crate::{GyreError, Result};

/// Parsed verdict, before persistence.
#[derive(Debug, Clone, Default)]
pub struct ParsedReview {
    pub summary: String,
    pub score: Option<f64>,
    pub feedbacks: Vec<ReviewFeedback>,
}

const REVIEW_FORMAT_PROMPT: &str = r#"## Code Review
You are reviewing the patch below. Respond with exactly ONE JSON object in
this shape (no markdown fences around it):

{
  "overall_summary": "one paragraph assessment",
  "overall_score": 0.8,
  "feedbacks": [
    {
      "severity": "high",
      "category": "correctness",
      "file_path": "src/example.py",
      "line_start": 42,
      "line_end": 45,
      "title": "Potential null pointer exception",
      "description": "explain the problem",
      "suggestion": "how to fix it",
      "code_snippet": "optional offending code"
    }
  ]
}

severity is one of critical, high, medium, low. category is one of
correctness, security, performance, maintainability, style, testing.
overall_score is between 0.0 and 1.0."#;

pub struct ReviewJobHandler {
    reviews: ReviewDao,
    runs: RunDao,
    workspaces: WorkspaceManager,
    agents: HashMap<ExecutorKind, Arc<dyn AgentCli>>,
    agent_config: AgentConfig,
    output: Arc<OutputMultiplexer>,
    queue: Arc<dyn JobQueue>,
}

impl ReviewJobHandler {
    pub fn new(
        reviews: ReviewDao,
        runs: RunDao,
        workspaces: WorkspaceManager,
        agents: HashMap<ExecutorKind, Arc<dyn AgentCli>>,
        agent_config: AgentConfig,
        output: Arc<OutputMultiplexer>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            reviews,
            runs,
            workspaces,
            agents,
            agent_config,
            output,
            queue,
        }
    }

    async fn log(&self, review_id: &str, logs: &mut Vec<String>, line: impl Into<String>) {
        let line = line.into();
        info!("[{}] {line}", short_id(review_id));
        self.output.publish(review_id, line.clone()).await;
        logs.push(line);
    }

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

    /// Every target run must exist and have succeeded.
    async fn load_targets(&self, review: &Review) -> Result<Vec<Run>> {
        let mut targets = Vec::new();
        for run_id in &review.target_run_ids {
            let run = self.runs.get(run_id).await?.ok_or_else(|| {
                GyreError::Precondition(format!("target run not found: {run_id}"))
            })?;
            if run.status != RunStatus::Succeeded {
                return Err(GyreError::Precondition(format!(
                    "target run {run_id} is {}, not succeeded",
                    run.status.as_str()
                )));
            }
            targets.push(run);
        }
        if targets.is_empty() {
            return Err(GyreError::Precondition(
                "review has no target runs".to_string(),
            ));
        }
        Ok(targets)
    }

    fn combine_patches(targets: &[Run]) -> String {
        targets
            .iter()
            .filter_map(|run| {
                run.patch.as_ref().map(|patch| {
                    format!("# Changes from Run {}\n{patch}", short_id(&run.id))
                })
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    async fn execute(&self, job: &Job, review: &Review, logs: &mut Vec<String>) -> Result<()> {
        let adapter = self
            .agents
            .get(&review.executor_kind)
            .ok_or_else(|| {
                GyreError::Precondition(format!(
                    "no agent adapter for {}",
                    review.executor_kind.as_str()
                ))
            })?
            .clone();

        self.reviews
            .update_status(&review.id, RunStatus::Running, ReviewUpdate::default())
            .await?;
        self.log(
            &review.id,
            logs,
            format!("Starting {} review...", adapter.display_name()),
        )
        .await;

        let targets = self.load_targets(review).await?;
        let patch = Self::combine_patches(&targets);
        self.log(&review.id, logs, format!("Patch size: {} characters", patch.len()))
            .await;

        // Working directory: the first target's workspace when it still
        // validates, a scratch directory otherwise.
        let mut temp_dir: Option<tempfile::TempDir> = None;
        let mut reused_workspace: Option<PathBuf> = None;
        if let Some(path_str) = targets[0].workspace_path.as_ref() {
            if self.workspaces.is_valid(Path::new(path_str)).await {
                self.log(&review.id, logs, format!("Using workspace: {path_str}"))
                    .await;
                reused_workspace = Some(PathBuf::from(path_str));
            }
        }
        let work_dir: PathBuf = match &reused_workspace {
            Some(path) => path.clone(),
            None => {
                let dir = tempfile::Builder::new().prefix("review_").tempdir()?;
                let path = dir.path().to_path_buf();
                self.log(
                    &review.id,
                    logs,
                    format!("Using temporary directory: {}", path.display()),
                )
                .await;
                temp_dir = Some(dir);
                path
            }
        };
        let reused_workspace = reused_workspace.is_some();

        self.check_canceled(job).await?;

        // Large patches are spilled to a file and referenced by path.
        let constraints = AgentConstraints.to_prompt();
        let mut patch_file: Option<PathBuf> = None;
        let prompt = if patch.len() > MAX_INLINE_PATCH_CHARS {
            let spill = work_dir.join(REVIEW_PATCH_FILE_NAME);
            tokio::fs::write(&spill, &patch).await?;
            self.log(
                &review.id,
                logs,
                format!("Patch too large for inline, written to: {}", spill.display()),
            )
            .await;
            let spill_display = spill.display().to_string();
            patch_file = Some(spill);
            format!(
                "{constraints}\n\n{REVIEW_FORMAT_PROMPT}\n\nThe patch to review is in \
                 the file `{spill_display}`. Read it and review its contents."
            )
        } else {
            format!("{constraints}\n\n{REVIEW_FORMAT_PROMPT}\n\n## Patch\n```diff\n{patch}\n```")
        };

        let invocation = AgentInvocation {
            workspace: work_dir.clone(),
            instruction: prompt,
            resume_session_id: None,
            read_only: true,
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let forward = {
            let output = self.output.clone();
            let review_id = review.id.clone();
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    output.publish(&review_id, line).await;
                }
            })
        };
        let result = AgentRunner::run(
            adapter.as_ref(),
            &invocation,
            self.agent_config.timeout_for(review.executor_kind),
            Some(tx),
        )
        .await;
        let _ = forward.await;
        let result = result?;

        // Sanitation runs regardless of the agent outcome: review-phase
        // edits must never leak into subsequent runs.
        if let Some(file) = &patch_file {
            let _ = tokio::fs::remove_file(file).await;
        }
        if reused_workspace {
            if let Err(e) = self.workspaces.discard_changes(&work_dir).await {
                logs.push(format!("Warning: failed to reset workspace: {e}"));
            } else {
                logs.push("Reset workspace to clean state after review".to_string());
            }
        }
        drop(temp_dir);

        if !result.success {
            let mut all_logs = logs.clone();
            all_logs.extend(result.logs.clone());
            self.reviews
                .update_status(
                    &review.id,
                    RunStatus::Failed,
                    ReviewUpdate {
                        error: result.error.clone(),
                        logs: Some(all_logs),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }

        let response_text = result.logs.join("\n");
        let parsed = parse_review_response(&response_text, logs);
        self.log(
            &review.id,
            logs,
            format!("Parsed {} feedback item(s)", parsed.feedbacks.len()),
        )
        .await;

        let mut all_logs = logs.clone();
        all_logs.extend(result.logs.clone());
        self.reviews
            .update_status(
                &review.id,
                RunStatus::Succeeded,
                ReviewUpdate {
                    summary: Some(parsed.summary),
                    overall_score: parsed.score,
                    feedbacks: Some(parsed.feedbacks),
                    logs: Some(all_logs),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for ReviewJobHandler {
    async fn handle(&self, job: &Job) -> Result<()> {
        let review = self
            .reviews
            .get(&job.ref_id)
            .await?
            .ok_or_else(|| GyreError::Precondition(format!("review not found: {}", job.ref_id)))?;

        if review.status.is_terminal() {
            return Ok(());
        }

        let mut logs = Vec::new();
        let outcome = self.execute(job, &review, &mut logs).await;
        self.output.mark_complete(&review.id).await;

        match outcome {
            Ok(()) => Ok(()),
            Err(GyreError::Canceled(reason)) => {
                self.reviews
                    .update_status(
                        &review.id,
                        RunStatus::Canceled,
                        ReviewUpdate {
                            error: Some(reason.clone()),
                            logs: Some(logs),
                            ..Default::default()
                        },
                    )
                    .await?;
                Err(GyreError::Canceled(reason))
            }
            Err(e) => {
                if job.attempts >= job.max_attempts || e.is_permanent() {
                    self.reviews
                        .update_status(
                            &review.id,
                            RunStatus::Failed,
                            ReviewUpdate {
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

/// Extract balanced `{...}` substrings, honoring strings and escapes.
pub fn extract_json_objects(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut objects = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        let start = i;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        while i < bytes.len() {
            let c = bytes[i];
            if escaped {
                escaped = false;
            } else if c == b'\\' {
                escaped = true;
            } else if c == b'"' {
                in_string = !in_string;
            } else if !in_string {
                if c == b'{' {
                    depth += 1;
                } else if c == b'}' {
                    depth -= 1;
                    if depth == 0 {
                        objects.push(&text[start..=i]);
                        break;
                    }
                }
            }
            i += 1;
        }
        i += 1;
    }

    objects
}

/// Whether a parsed object is the example from the prompt rather than a
/// real verdict: every feedback references the template example path.
fn is_template_example(data: &Value) -> bool {
    let Some(feedbacks) = data.get("feedbacks").and_then(Value::as_array) else {
        return false;
    };
    if feedbacks.is_empty() {
        return false;
    }
    feedbacks.iter().all(|fb| {
        fb.get("file_path").and_then(Value::as_str) == Some(REVIEW_TEMPLATE_EXAMPLE_PATH)
    })
}

fn looks_like_review(data: &Value) -> bool {
    data.is_object() && (data.get("feedbacks").is_some() || data.get("overall_summary").is_some())
}

fn process_review_data(data: &Value, logs: &mut Vec<String>) -> ParsedReview {
    let mut feedbacks = Vec::new();
    if let Some(items) = data.get("feedbacks").and_then(Value::as_array) {
        for item in items {
            let Some(obj) = item.as_object() else {
                logs.push("Warning: skipped non-object feedback entry".to_string());
                continue;
            };
            let severity = obj
                .get("severity")
                .and_then(Value::as_str)
                .and_then(|s| s.to_lowercase().parse::<ReviewSeverity>().ok())
                .unwrap_or(ReviewSeverity::Medium);
            let category = obj
                .get("category")
                .and_then(Value::as_str)
                .and_then(|s| s.to_lowercase().parse::<ReviewCategory>().ok())
                .unwrap_or(ReviewCategory::Maintainability);
            feedbacks.push(ReviewFeedback {
                id: generate_id(),
                severity,
                category,
                file_path: obj
                    .get("file_path")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                line_start: obj.get("line_start").and_then(Value::as_u64).map(|n| n as u32),
                line_end: obj.get("line_end").and_then(Value::as_u64).map(|n| n as u32),
                title: obj
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or("Review finding")
                    .to_string(),
                description: obj
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                suggestion: obj
                    .get("suggestion")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                code_snippet: obj
                    .get("code_snippet")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
    }

    ParsedReview {
        summary: data
            .get("overall_summary")
            .and_then(Value::as_str)
            .unwrap_or("Review completed")
            .to_string(),
        score: data
            .get("overall_score")
            .and_then(Value::as_f64)
            .map(|s| s.clamp(0.0, 1.0)),
        feedbacks,
    }
}

fn default_review_result() -> ParsedReview {
    ParsedReview {
        summary: "Review completed. Please check the logs for details.".to_string(),
        score: None,
        feedbacks: Vec::new(),
    }
}

/// Dig the verdict out of the raw agent output.
pub fn parse_review_response(response_text: &str, logs: &mut Vec<String>) -> ParsedReview {
    // Strategy A: balanced objects, scanned from the end of the output,
    // because the real response follows the prompt echo.
    let candidates = extract_json_objects(response_text);
    logs.push(format!(
        "Review parse: found {} potential JSON object(s)",
        candidates.len()
    ));

    for candidate in candidates.iter().rev() {
        let Ok(data) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        if !looks_like_review(&data) {
            continue;
        }
        if is_template_example(&data) {
            logs.push("Review parse: skipping template example".to_string());
            continue;
        }
        return process_review_data(&data, logs);
    }

    // Strategy B: progressively shorter slices from each `{`, last first,
    // for outputs where trailing junk breaks the balanced scan.
    logs.push("Review parse: strategy A failed, trying trailing slices".to_string());
    let bytes = response_text.as_bytes();
    let brace_positions: Vec<usize> = bytes
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'{')
        .map(|(i, _)| i)
        .collect();
    for &start in brace_positions.iter().rev() {
        for end in (start + 1..=bytes.len()).rev() {
            if bytes[end - 1] != b'}' {
                continue;
            }
            let Ok(data) = serde_json::from_str::<Value>(&response_text[start..end]) else {
                continue;
            };
            if !looks_like_review(&data) {
                continue;
            }
            if is_template_example(&data) {
                break;
            }
            logs.push(format!("Review parse: recovered JSON at offset {start}"));
            return process_review_data(&data, logs);
        }
    }

    logs.push("Review parse: no valid review JSON found".to_string());
    default_review_result()
}

/// Build a coding instruction from review feedbacks, most severe first.
pub fn build_fix_instruction(
    feedbacks: &[ReviewFeedback],
    severity_filter: &[ReviewSeverity],
    additional: Option<&str>,
) -> String {
    let mut selected: Vec<&ReviewFeedback> = feedbacks
        .iter()
        .filter(|f| severity_filter.is_empty() || severity_filter.contains(&f.severity))
        .collect();
    selected.sort_by_key(|f| f.severity);

    let mut parts = vec!["Please fix the following issues identified in the code review:\n".to_string()];
    for (n, fb) in selected.iter().enumerate() {
        parts.push(format!(
            "\n## Issue {}: [{}] {}",
            n + 1,
            fb.severity.as_str().to_uppercase(),
            fb.title
        ));
        parts.push(format!("**File**: `{}`", fb.file_path));
        if let Some(start) = fb.line_start {
            let mut location = format!("Line {start}");
            if let Some(end) = fb.line_end {
                if end != start {
                    location.push_str(&format!("-{end}"));
                }
            }
            parts.push(format!("**Location**: {location}"));
        }
        parts.push(format!("**Category**: {}", fb.category.as_str()));
        parts.push(format!("\n{}", fb.description));
        if let Some(suggestion) = &fb.suggestion {
            parts.push(format!("\n**Suggested fix**: {suggestion}"));
        }
    }

    if let Some(additional) = additional {
        parts.push(format!("\n---\n**Additional instructions**: {additional}"));
    }
    parts.push(
        "\n---\nPlease address all the issues above and ensure the code is correct and secure."
            .to_string(),
    );
    parts.join("\n")
}

#[cfg(test)]
mod handler_tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::git::GitDriver;
    use crate::output::OutputMultiplexer;
    use crate::queue::{EnqueueRequest, SqliteQueue};
    use crate::storage::{Database, RunUpdate};
    use std::process::Stdio;
    use tokio::process::Command;

    struct VerdictAgent {
        verdict: String,
    }

    impl AgentCli for VerdictAgent {
        fn kind(&self) -> ExecutorKind {
            ExecutorKind::CodexCli
        }

        fn display_name(&self) -> &'static str {
            "Verdict"
        }

        fn build_command(&self, invocation: &AgentInvocation) -> Command {
            let mode = if invocation.read_only { "READONLY" } else { "WRITABLE" };
            let mut command = Command::new("sh");
            command
                .args(["-c", &format!("echo {mode}; echo '{}'", self.verdict)])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .current_dir(&invocation.workspace);
            command
        }

        fn extract_session_id(&self, _line: &str) -> Option<String> {
            None
        }
    }

    async fn run_review(verdict: &str) -> (Database, Review) {
        let db = Database::connect_memory().await.unwrap();
        let queue = Arc::new(SqliteQueue::new(db.pool().clone()));
        let runs = RunDao::new(db.pool().clone());
        let reviews = ReviewDao::new(db.pool().clone());

        let run = runs
            .create("task-1", "add it", ExecutorKind::ClaudeCode, "main", None)
            .await
            .unwrap();
        runs.update_status(
            &run.id,
            RunStatus::Succeeded,
            RunUpdate {
                patch: Some("diff --git a/src/lib.rs b/src/lib.rs\n+++ b/src/lib.rs\n+fn add() {}\n".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let review = reviews
            .create("task-1", &[run.id.clone()], ExecutorKind::CodexCli)
            .await
            .unwrap();
        queue
            .enqueue(EnqueueRequest::new(
                crate::models::JobKind::ReviewExecute,
                review.id.clone(),
            ))
            .await
            .unwrap();
        let job = queue
            .dequeue("test-worker", std::time::Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let mut agents: HashMap<ExecutorKind, Arc<dyn AgentCli>> = HashMap::new();
        agents.insert(
            ExecutorKind::CodexCli,
            Arc::new(VerdictAgent {
                verdict: verdict.to_string(),
            }),
        );
        let handler = ReviewJobHandler::new(
            reviews.clone(),
            runs,
            WorkspaceManager::new("unused-workspaces", GitDriver::new()),
            agents,
            AgentConfig {
                claude_binary: "sh".into(),
                codex_binary: "sh".into(),
                gemini_binary: "sh".into(),
                claude_timeout_secs: 30,
                codex_timeout_secs: 30,
                gemini_timeout_secs: 30,
                anthropic_api_key: None,
                anthropic_base_url: "https://api.anthropic.com".into(),
                translation_model: "claude-3-5-haiku-latest".into(),
            },
            Arc::new(OutputMultiplexer::new(
                &crate::config::OutputConfig {
                    max_history: 1000,
                    cleanup_after_secs: 3600,
                    max_queue_size: 100,
                },
                None,
            )),
            queue.clone(),
        );

        handler.handle(&job).await.unwrap();
        let persisted = reviews.get(&review.id).await.unwrap().unwrap();
        (db, persisted)
    }

    #[tokio::test]
    async fn verdict_is_parsed_and_persisted() {
        let (_db, review) = run_review(
            r#"{"overall_summary": "solid work", "overall_score": 0.88, "feedbacks": [
                {"severity": "medium", "category": "style", "file_path": "src/lib.rs",
                 "title": "naming", "description": "rename add to sum"}]}"#
                .replace('\n', " ")
                .as_str(),
        )
        .await;

        assert_eq!(review.status, RunStatus::Succeeded);
        assert_eq!(review.overall_score, Some(0.88));
        assert_eq!(review.summary.as_deref(), Some("solid work"));
        assert_eq!(review.feedbacks.len(), 1);
        assert_eq!(review.feedbacks[0].severity, ReviewSeverity::Medium);
        // The agent ran with the read-only switch.
        assert!(review.logs.iter().any(|l| l == "READONLY"));
    }

    #[tokio::test]
    async fn unparseable_output_falls_back_to_default_verdict() {
        let (_db, review) = run_review("not json at all").await;
        assert_eq!(review.status, RunStatus::Succeeded);
        assert!(review.overall_score.is_none());
        assert!(review.feedbacks.is_empty());
        assert!(review.summary.unwrap().contains("check the logs"));
    }
}
