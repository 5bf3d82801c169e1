//! External coding agents, one adapter per CLI.
//!
//! Each agent is a black-box subprocess. An adapter knows how to build the
//! invocation (flags, stdin vs argument instruction, read-only switch) and
//! how to recognize a session id in the stream; the [`runner`] spawns the
//! process, streams stdout line by line, and enforces the wall-clock
//! timeout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;

use crate::config::AgentConfig;
use crate::models::ExecutorKind;

pub mod claude_code;
pub mod codex;
pub mod gemini;
pub mod runner;

pub use claude_code::ClaudeCodeCli;
pub use codex::CodexCli;
pub use gemini::GeminiCli;
pub use runner::{AgentResult, AgentRunner};

/// One agent invocation inside a workspace.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub workspace: PathBuf,
    pub instruction: String,
    /// Continue the prior conversation when the CLI supports it.
    pub resume_session_id: Option<String>,
    /// Review mode: the adapter must pass the CLI's no-edit switch.
    pub read_only: bool,
}

/// Adapter for one agent CLI kind.
pub trait AgentCli: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    fn display_name(&self) -> &'static str;

    /// Build the subprocess command for an invocation.
    fn build_command(&self, invocation: &AgentInvocation) -> Command;

    /// Whether the instruction is delivered on stdin rather than as an
    /// argument.
    fn instruction_on_stdin(&self) -> bool {
        false
    }

    /// Extract a session id from one output line, if present.
    fn extract_session_id(&self, line: &str) -> Option<String>;

    /// Extract an in-stream summary from one output line, if present.
    fn extract_summary(&self, _line: &str) -> Option<String> {
        None
    }
}

/// Registry mapping executor kinds to their adapters.
pub fn build_registry(config: &AgentConfig) -> HashMap<ExecutorKind, Arc<dyn AgentCli>> {
    let mut registry: HashMap<ExecutorKind, Arc<dyn AgentCli>> = HashMap::new();
    registry.insert(
        ExecutorKind::ClaudeCode,
        Arc::new(ClaudeCodeCli::new(config.claude_binary.clone())),
    );
    registry.insert(
        ExecutorKind::CodexCli,
        Arc::new(CodexCli::new(config.codex_binary.clone())),
    );
    registry.insert(
        ExecutorKind::GeminiCli,
        Arc::new(GeminiCli::new(config.gemini_binary.clone())),
    );
    registry
}

/// Loose substring patterns that mean a resume token was rejected. The run
/// executor retries once without the token when one matches.
pub const SESSION_ERROR_PATTERNS: [&str; 5] = [
    "already in use",
    "no conversation found",
    "not found",
    "invalid session",
    "session expired",
];

/// Whether an agent error looks like a rejected resume token.
pub fn is_session_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("session") && SESSION_ERROR_PATTERNS.iter().any(|p| lower.contains(p))
}
