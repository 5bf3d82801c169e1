use crate::models::MergeMethod;
use crate::{GyreError, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub workspace: WorkspaceConfig,
    pub agents: AgentConfig,
    pub github: GitHubConfig,
    pub cycle: CycleConfig,
    pub output: OutputConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    pub database_path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackendKind {
    Sqlite,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub backend: QueueBackendKind,
    pub redis_url: String,
    pub visibility_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub retry_delay_secs: u64,
    pub default_max_attempts: u32,
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub max_concurrent_jobs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Directory under which per-run clones are created.
    pub workspaces_dir: String,
    pub use_shallow_clone: bool,
    pub branch_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub claude_binary: String,
    pub codex_binary: String,
    pub gemini_binary: String,
    /// Wall-clock budget per agent kind, seconds.
    pub claude_timeout_secs: u64,
    pub codex_timeout_secs: u64,
    pub gemini_timeout_secs: u64,
    /// Optional key for the commit-message translation helper.
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: String,
    pub translation_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    pub token: Option<String>,
    pub api_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    pub ci_poll_interval_secs: u64,
    pub ci_poll_timeout_secs: u64,
    pub max_ci_iterations: u32,
    pub max_review_iterations: u32,
    pub max_total_iterations: u32,
    pub warn_iteration_threshold: u32,
    pub min_review_score: f64,
    pub merge_method: MergeMethod,
    pub merge_delete_branch: bool,
    /// Overall timeout for one background phase.
    pub phase_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub max_history: usize,
    pub cleanup_after_secs: u64,
    pub max_queue_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file when present
        match dotenv() {
            Ok(path) => tracing::info!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file found"),
        }

        let storage = StorageConfig {
            database_path: env_string("DATABASE_PATH", "gyre.db"),
        };

        let backend = match env_string("QUEUE_BACKEND", "sqlite").to_lowercase().as_str() {
            "sqlite" => QueueBackendKind::Sqlite,
            "redis" => QueueBackendKind::Redis,
            other => {
                return Err(GyreError::Configuration(format!(
                    "QUEUE_BACKEND must be 'sqlite' or 'redis', got '{other}'"
                )))
            }
        };

        let queue = QueueConfig {
            backend,
            redis_url: env_string("REDIS_URL", "redis://127.0.0.1:6379"),
            visibility_timeout_secs: env_parse("QUEUE_VISIBILITY_TIMEOUT", 300),
            poll_interval_ms: env_parse("QUEUE_POLL_INTERVAL_MS", 500),
            retry_delay_secs: env_parse("QUEUE_RETRY_DELAY", 10),
            default_max_attempts: env_parse("QUEUE_MAX_ATTEMPTS", 3),
        };

        if queue.visibility_timeout_secs == 0 {
            return Err(GyreError::Configuration(
                "QUEUE_VISIBILITY_TIMEOUT must be greater than zero".to_string(),
            ));
        }

        let worker = WorkerConfig {
            max_concurrent_jobs: env_parse("MAX_CONCURRENT_JOBS", 2usize).max(1),
        };

        let workspace = WorkspaceConfig {
            workspaces_dir: env_string("WORKSPACES_DIR", "workspaces"),
            use_shallow_clone: env_bool("USE_SHALLOW_CLONE", true),
            branch_prefix: env::var("BRANCH_PREFIX").ok().filter(|s| !s.trim().is_empty()),
        };

        let agents = AgentConfig {
            claude_binary: env_string("CLAUDE_BINARY", "claude"),
            codex_binary: env_string("CODEX_BINARY", "codex"),
            gemini_binary: env_string("GEMINI_BINARY", "gemini"),
            claude_timeout_secs: env_parse("CLAUDE_TIMEOUT_SECS", 1800),
            codex_timeout_secs: env_parse("CODEX_TIMEOUT_SECS", 900),
            gemini_timeout_secs: env_parse("GEMINI_TIMEOUT_SECS", 900),
            anthropic_api_key: env::var("ANTHROPIC_API_KEY").ok().filter(|s| !s.is_empty()),
            anthropic_base_url: env_string("ANTHROPIC_BASE_URL", "https://api.anthropic.com"),
            translation_model: env_string("TRANSLATION_MODEL", "claude-3-5-haiku-latest"),
        };

        let github = GitHubConfig {
            token: env::var("GITHUB_TOKEN").ok().filter(|s| !s.is_empty()),
            api_base: env_string("GITHUB_API_BASE", "https://api.github.com"),
        };

        let merge_method = env_string("MERGE_METHOD", "squash")
            .parse::<MergeMethod>()
            .map_err(GyreError::Configuration)?;

        let cycle = CycleConfig {
            ci_poll_interval_secs: env_parse("CI_POLL_INTERVAL", 30),
            ci_poll_timeout_secs: env_parse("CI_POLL_TIMEOUT", 1800),
            max_ci_iterations: env_parse("MAX_CI_ITERATIONS", 3),
            max_review_iterations: env_parse("MAX_REVIEW_ITERATIONS", 3),
            max_total_iterations: env_parse("MAX_TOTAL_ITERATIONS", 10),
            warn_iteration_threshold: env_parse("WARN_ITERATION_THRESHOLD", 7),
            min_review_score: env_parse("MIN_REVIEW_SCORE", 0.7f64),
            merge_method,
            merge_delete_branch: env_bool("MERGE_DELETE_BRANCH", true),
            phase_timeout_secs: env_parse("CYCLE_PHASE_TIMEOUT", 3600),
        };

        if !(0.0..=1.0).contains(&cycle.min_review_score) {
            return Err(GyreError::Configuration(
                "MIN_REVIEW_SCORE must be within 0.0..=1.0".to_string(),
            ));
        }

        let output = OutputConfig {
            max_history: env_parse("OUTPUT_MAX_HISTORY", 10_000usize),
            cleanup_after_secs: env_parse("OUTPUT_CLEANUP_AFTER", 3600),
            max_queue_size: env_parse("OUTPUT_MAX_QUEUE_SIZE", 5_000usize),
        };

        let notify = NotifyConfig {
            webhook_url: env::var("NOTIFY_WEBHOOK_URL").ok().filter(|s| !s.is_empty()),
        };

        Ok(Config {
            storage,
            queue,
            worker,
            workspace,
            agents,
            github,
            cycle,
            output,
            notify,
        })
    }
}

impl AgentConfig {
    pub fn timeout_for(&self, kind: crate::models::ExecutorKind) -> Duration {
        use crate::models::ExecutorKind::*;
        let secs = match kind {
            ClaudeCode | PatchAgent => self.claude_timeout_secs,
            CodexCli => self.codex_timeout_secs,
            GeminiCli => self.gemini_timeout_secs,
        };
        Duration::from_secs(secs)
    }
}
