//! Claude Code CLI adapter.
//!
//! Invoked in streaming JSON mode so every event arrives as one line. The
//! `system/init` event carries the session id; the final `result` event
//! carries the response summary. The instruction goes in on stdin.

use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;

use super::{AgentCli, AgentInvocation};
use crate::models::ExecutorKind;

pub struct ClaudeCodeCli {
    binary: String,
}

impl ClaudeCodeCli {
    pub fn new(binary: String) -> Self {
        Self { binary }
    }
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    subtype: Option<String>,
    session_id: Option<String>,
    result: Option<String>,
    is_error: Option<bool>,
}

impl AgentCli for ClaudeCodeCli {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::ClaudeCode
    }

    fn display_name(&self) -> &'static str {
        "Claude Code"
    }

    fn build_command(&self, invocation: &AgentInvocation) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(["--print", "--verbose", "--output-format", "stream-json"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&invocation.workspace);

        if invocation.read_only {
            // Plan mode reads the tree but refuses edits.
            command.args(["--permission-mode", "plan"]);
        } else {
            command.args(["--permission-mode", "acceptEdits"]);
        }

        if let Some(session_id) = &invocation.resume_session_id {
            command.args(["--resume", session_id]);
        }

        let workspace = invocation.workspace.to_string_lossy().to_string();
        command.args(["--add-dir", &workspace]);

        command
    }

    fn instruction_on_stdin(&self) -> bool {
        true
    }

    fn extract_session_id(&self, line: &str) -> Option<String> {
        let event: StreamEvent = serde_json::from_str(line).ok()?;
        if event.event_type == "system" && event.subtype.as_deref() == Some("init") {
            return event.session_id;
        }
        None
    }

    fn extract_summary(&self, line: &str) -> Option<String> {
        let event: StreamEvent = serde_json::from_str(line).ok()?;
        if event.event_type == "result" && event.is_error != Some(true) {
            return event.result;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn invocation(read_only: bool, resume: Option<&str>) -> AgentInvocation {
        AgentInvocation {
            workspace: PathBuf::from("/tmp/ws"),
            instruction: "do the task".into(),
            resume_session_id: resume.map(str::to_string),
            read_only,
        }
    }

    fn args_of(command: &Command) -> Vec<String> {
        command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn command_streams_json_and_resumes_session() {
        let cli = ClaudeCodeCli::new("claude".into());
        let command = cli.build_command(&invocation(false, Some("sess-42")));
        let args = args_of(&command);
        assert!(args.contains(&"--print".to_string()));
        assert!(args.contains(&"stream-json".to_string()));
        assert!(args.contains(&"acceptEdits".to_string()));
        let resume_pos = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume_pos + 1], "sess-42");
    }

    #[test]
    fn read_only_maps_to_plan_mode() {
        let cli = ClaudeCodeCli::new("claude".into());
        let args = args_of(&cli.build_command(&invocation(true, None)));
        assert!(args.contains(&"plan".to_string()));
        assert!(!args.contains(&"--resume".to_string()));
    }

    #[test]
    fn session_id_comes_from_init_event() {
        let cli = ClaudeCodeCli::new("claude".into());
        let line = r#"{"type":"system","subtype":"init","session_id":"abc-123","tools":[]}"#;
        assert_eq!(cli.extract_session_id(line), Some("abc-123".to_string()));
        assert_eq!(cli.extract_session_id("plain text line"), None);
        assert_eq!(
            cli.extract_session_id(r#"{"type":"assistant","session_id":"abc-123"}"#),
            None
        );
    }

    #[test]
    fn summary_comes_from_result_event() {
        let cli = ClaudeCodeCli::new("claude".into());
        let line = r#"{"type":"result","subtype":"success","is_error":false,"result":"Added the function."}"#;
        assert_eq!(
            cli.extract_summary(line),
            Some("Added the function.".to_string())
        );
        let error_line = r#"{"type":"result","subtype":"error","is_error":true,"result":"boom"}"#;
        assert_eq!(cli.extract_summary(error_line), None);
    }
}
