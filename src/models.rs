use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::constants::SHORT_ID_LEN;

/// Generate a 16-character hex id used for jobs, runs, and reviews.
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// Shorten an id for branch names and log prefixes.
pub fn short_id(id: &str) -> &str {
    &id[..id.len().min(SHORT_ID_LEN)]
}

/// Autonomy level of a task.
///
/// `Interactive` tasks never enter the cycle engine; `SemiAuto` pauses at
/// `AwaitingHuman` before merge; `FullAuto` merges without human approval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CodingMode {
    Interactive,
    SemiAuto,
    FullAuto,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum KanbanState {
    Backlog,
    Todo,
    Archived,
}

/// Which external CLI executes a run or review.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    ClaudeCode,
    CodexCli,
    GeminiCli,
    PatchAgent,
}

/// Status shared by runs and reviews.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    RunExecute,
    ReviewExecute,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PrStatus {
    Open,
    Merged,
    Closed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ReviewSeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReviewCategory {
    Correctness,
    Security,
    Performance,
    Maintainability,
    Style,
    Testing,
}

/// Phases of the autonomous development cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CyclePhase {
    Coding,
    WaitingCi,
    FixingCi,
    Reviewing,
    FixingReview,
    AwaitingHuman,
    MergeCheck,
    Merging,
    Completed,
    Failed,
}

impl CyclePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CyclePhase::Completed | CyclePhase::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    Merge,
    Squash,
    Rebase,
}

// String forms for persistence. Enums are stored as TEXT columns, so every
// variant needs a stable round-trippable name.
macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    _ => Err(format!(concat!("unknown ", stringify!($ty), ": {}"), s)),
                }
            }
        }
    };
}

text_enum!(CodingMode {
    Interactive => "interactive",
    SemiAuto => "semi-auto",
    FullAuto => "full-auto",
});

text_enum!(KanbanState {
    Backlog => "backlog",
    Todo => "todo",
    Archived => "archived",
});

text_enum!(ExecutorKind {
    ClaudeCode => "claude-code",
    CodexCli => "codex-cli",
    GeminiCli => "gemini-cli",
    PatchAgent => "patch-agent",
});

text_enum!(RunStatus {
    Queued => "queued",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    Canceled => "canceled",
});

text_enum!(JobKind {
    RunExecute => "run-execute",
    ReviewExecute => "review-execute",
});

text_enum!(JobStatus {
    Queued => "queued",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    Canceled => "canceled",
});

text_enum!(PrStatus {
    Open => "open",
    Merged => "merged",
    Closed => "closed",
});

text_enum!(ReviewSeverity {
    Critical => "critical",
    High => "high",
    Medium => "medium",
    Low => "low",
});

text_enum!(ReviewCategory {
    Correctness => "correctness",
    Security => "security",
    Performance => "performance",
    Maintainability => "maintainability",
    Style => "style",
    Testing => "testing",
});

text_enum!(CyclePhase {
    Coding => "coding",
    WaitingCi => "waiting-ci",
    FixingCi => "fixing-ci",
    Reviewing => "reviewing",
    FixingReview => "fixing-review",
    AwaitingHuman => "awaiting-human",
    MergeCheck => "merge-check",
    Merging => "merging",
    Completed => "completed",
    Failed => "failed",
});

text_enum!(MergeMethod {
    Merge => "merge",
    Squash => "squash",
    Rebase => "rebase",
});

/// A registered target repository. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub remote_url: String,
    pub default_branch: String,
    pub local_mirror_path: Option<String>,
}

impl Repository {
    /// Extract `owner/repo` from an HTTPS or SSH GitHub URL.
    pub fn full_name(&self) -> Option<(String, String)> {
        let url = self.remote_url.trim_end_matches(".git");
        let rest = url.split("github.com").nth(1)?;
        let rest = rest.trim_start_matches(['/', ':']);
        let mut parts = rest.splitn(2, '/');
        let owner = parts.next()?.to_string();
        let repo = parts.next()?.to_string();
        if owner.is_empty() || repo.is_empty() {
            return None;
        }
        Some((owner, repo))
    }
}

/// A long-lived unit of user intent containing runs, reviews, at most one
/// pull request, and at most one cycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub repository_id: String,
    pub title: String,
    pub coding_mode: CodingMode,
    pub kanban_state: KanbanState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One file touched by a patch, with line counts from the unified diff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileDiff {
    pub path: String,
    pub added_lines: u32,
    pub removed_lines: u32,
}

/// One execution of a coding agent.
///
/// Created `queued` by the dispatcher and mutated by exactly one worker
/// between `queued` → `running` → terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub task_id: String,
    pub triggering_message_id: Option<String>,
    pub executor_kind: ExecutorKind,
    pub model_profile_id: Option<String>,
    pub status: RunStatus,
    pub instruction: String,
    pub base_ref: String,
    pub working_branch: Option<String>,
    pub workspace_path: Option<String>,
    /// Opaque token from the agent CLI that resumes the prior conversation.
    pub session_id: Option<String>,
    pub commit_sha: Option<String>,
    pub patch: Option<String>,
    pub files_changed: Vec<FileDiff>,
    pub summary: Option<String>,
    pub warnings: Vec<String>,
    pub logs: Vec<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A single review finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewFeedback {
    pub id: String,
    pub severity: ReviewSeverity,
    pub category: ReviewCategory,
    pub file_path: String,
    pub line_start: Option<u32>,
    pub line_end: Option<u32>,
    pub title: String,
    pub description: String,
    pub suggestion: Option<String>,
    pub code_snippet: Option<String>,
}

/// One read-only agent execution producing a structured verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub task_id: String,
    pub target_run_ids: Vec<String>,
    pub executor_kind: ExecutorKind,
    pub status: RunStatus,
    pub overall_score: Option<f64>,
    pub summary: Option<String>,
    pub feedbacks: Vec<ReviewFeedback>,
    pub logs: Vec<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: String,
    pub task_id: String,
    pub number: u64,
    pub branch: String,
    pub base_branch: String,
    pub title: String,
    pub body: String,
    pub head_sha: String,
    pub status: PrStatus,
}

/// Durable queue record pointing at a run or review by reference id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub ref_id: String,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub priority: i32,
    pub available_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of one CI job within a combined CI outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiJobResult {
    pub job_name: String,
    pub error_log: Option<String>,
}

/// Combined CI outcome for a head commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiResult {
    pub success: bool,
    pub head_sha: String,
    pub failed_jobs: Vec<CiJobResult>,
}

/// Per-task state of the autonomous cycle. Singleton per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleState {
    pub task_id: String,
    pub mode: CodingMode,
    pub phase: CyclePhase,
    /// Total coding phases entered, including fix re-entries.
    pub iteration: u32,
    pub ci_iterations: u32,
    pub review_iterations: u32,
    pub pr_number: Option<u64>,
    pub current_head_sha: Option<String>,
    pub last_ci_result: Option<CiResult>,
    pub last_review_score: Option<f64>,
    pub human_approved: bool,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl CycleState {
    pub fn new(task_id: impl Into<String>, mode: CodingMode) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            mode,
            phase: CyclePhase::Coding,
            iteration: 0,
            ci_iterations: 0,
            review_iterations: 0,
            pr_number: None,
            current_head_sha: None,
            last_ci_result: None,
            last_review_score: None,
            human_approved: false,
            error: None,
            started_at: now,
            last_activity_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

/// Standing constraints prepended to every agent instruction.
///
/// The worker owns commit and push; an agent that commits on its own would
/// desynchronize the run record from the workspace.
#[derive(Debug, Clone, Default)]
pub struct AgentConstraints;

impl AgentConstraints {
    pub fn to_prompt(&self) -> String {
        [
            "## Execution Constraints",
            "- Only edit files inside the working directory.",
            "- Do NOT run `git commit`, `git push`, or any other command that \
             rewrites repository history; the orchestrator commits and pushes \
             your changes after you finish.",
            "- Do NOT create or switch branches.",
            "- Do NOT modify files outside the working directory.",
        ]
        .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_enums_round_trip() {
        for kind in [
            ExecutorKind::ClaudeCode,
            ExecutorKind::CodexCli,
            ExecutorKind::GeminiCli,
            ExecutorKind::PatchAgent,
        ] {
            assert_eq!(kind.as_str().parse::<ExecutorKind>().unwrap(), kind);
        }
        for phase in [
            CyclePhase::Coding,
            CyclePhase::WaitingCi,
            CyclePhase::FixingCi,
            CyclePhase::Reviewing,
            CyclePhase::FixingReview,
            CyclePhase::AwaitingHuman,
            CyclePhase::MergeCheck,
            CyclePhase::Merging,
            CyclePhase::Completed,
            CyclePhase::Failed,
        ] {
            assert_eq!(phase.as_str().parse::<CyclePhase>().unwrap(), phase);
        }
        assert_eq!("run-execute".parse::<JobKind>().unwrap(), JobKind::RunExecute);
        assert!("bogus".parse::<JobKind>().is_err());
    }

    #[test]
    fn repository_full_name_parses_https_and_ssh() {
        let https = Repository {
            id: "r1".into(),
            remote_url: "https://github.com/acme/widgets.git".into(),
            default_branch: "main".into(),
            local_mirror_path: None,
        };
        assert_eq!(
            https.full_name(),
            Some(("acme".to_string(), "widgets".to_string()))
        );

        let ssh = Repository {
            id: "r2".into(),
            remote_url: "git@github.com:acme/widgets.git".into(),
            default_branch: "main".into(),
            local_mirror_path: None,
        };
        assert_eq!(
            ssh.full_name(),
            Some(("acme".to_string(), "widgets".to_string()))
        );
    }

    #[test]
    fn generated_ids_are_short_hex() {
        let id = generate_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(short_id(&id).len(), 8);
    }

    #[test]
    fn constraints_forbid_history_rewrites() {
        let prompt = AgentConstraints.to_prompt();
        assert!(prompt.contains("git commit"));
        assert!(prompt.contains("git push"));
    }
}
