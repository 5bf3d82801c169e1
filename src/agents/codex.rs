//! Codex CLI adapter.
//!
//! Runs `codex exec` with the instruction as an argument. Output is plain
//! text; the session id appears in a `session id: <uuid>` banner line.

use regex::Regex;
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;

use super::{AgentCli, AgentInvocation};
use crate::models::ExecutorKind;

pub struct CodexCli {
    binary: String,
}

impl CodexCli {
    pub fn new(binary: String) -> Self {
        Self { binary }
    }
}

fn session_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)session id:\s*([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})")
            .unwrap()
    })
}

impl AgentCli for CodexCli {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::CodexCli
    }

    fn display_name(&self) -> &'static str {
        "Codex"
    }

    fn build_command(&self, invocation: &AgentInvocation) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("exec")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&invocation.workspace);

        let workspace = invocation.workspace.to_string_lossy().to_string();
        command.args(["--cd", &workspace]);

        if invocation.read_only {
            command.args(["--sandbox", "read-only"]);
        } else {
            command.args(["--sandbox", "workspace-write"]);
        }

        if let Some(session_id) = &invocation.resume_session_id {
            command.args(["resume", session_id]);
        }

        command.arg(&invocation.instruction);
        command
    }

    fn extract_session_id(&self, line: &str) -> Option<String> {
        session_regex()
            .captures(line)
            .map(|c| c[1].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn read_only_uses_read_only_sandbox() {
        let cli = CodexCli::new("codex".into());
        let command = cli.build_command(&AgentInvocation {
            workspace: PathBuf::from("/tmp/ws"),
            instruction: "review this".into(),
            resume_session_id: None,
            read_only: true,
        });
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(args.contains(&"read-only".to_string()));
        assert_eq!(args.last().unwrap(), "review this");
    }

    #[test]
    fn session_id_parses_from_banner_line() {
        let cli = CodexCli::new("codex".into());
        assert_eq!(
            cli.extract_session_id("session id: 0e9b1a2c-3d4e-5f60-7181-92a3b4c5d6e7"),
            Some("0e9b1a2c-3d4e-5f60-7181-92a3b4c5d6e7".to_string())
        );
        assert_eq!(cli.extract_session_id("working on it..."), None);
    }
}
