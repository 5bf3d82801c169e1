//! Gemini CLI adapter.
//!
//! Runs the CLI with the instruction via `--prompt`. The CLI has no resume
//! support, so session ids are never produced and a supplied resume token
//! is ignored.

use std::process::Stdio;
use tokio::process::Command;

use super::{AgentCli, AgentInvocation};
use crate::models::ExecutorKind;

pub struct GeminiCli {
    binary: String,
}

impl GeminiCli {
    pub fn new(binary: String) -> Self {
        Self { binary }
    }
}

impl AgentCli for GeminiCli {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::GeminiCli
    }

    fn display_name(&self) -> &'static str {
        "Gemini"
    }

    fn build_command(&self, invocation: &AgentInvocation) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&invocation.workspace);

        if invocation.read_only {
            command.arg("--sandbox");
        } else {
            command.arg("--yolo");
        }

        command.args(["--prompt", &invocation.instruction]);
        command
    }

    fn extract_session_id(&self, _line: &str) -> Option<String> {
        None
    }
}
