//! Agent subprocess execution: spawn, stream, bound, classify.

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

use super::{AgentCli, AgentInvocation};
use crate::constants::AGENT_KILL_GRACE_SECS;
use crate::{GyreError, Result};

/// Structured outcome of one agent invocation.
#[derive(Debug, Clone, Default)]
pub struct AgentResult {
    pub success: bool,
    pub summary: Option<String>,
    pub logs: Vec<String>,
    pub warnings: Vec<String>,
    pub session_id: Option<String>,
    pub error: Option<String>,
}

pub struct AgentRunner;

impl AgentRunner {
    /// Run the agent in its workspace, delivering every stdout line to
    /// `output_tx` in order, bounded by `wall_clock`.
    ///
    /// A timeout terminates the process (SIGTERM, then SIGKILL after a
    /// grace period) and yields a failed result rather than an error; the
    /// caller decides whether the run as a whole failed.
    pub async fn run(
        adapter: &dyn AgentCli,
        invocation: &AgentInvocation,
        wall_clock: Duration,
        output_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<AgentResult> {
        let mut command = adapter.build_command(invocation);
        let mut child = command.spawn().map_err(|e| {
            GyreError::agent(format!(
                "failed to spawn {} process: {e}",
                adapter.display_name()
            ))
        })?;

        if adapter.instruction_on_stdin() {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| GyreError::agent("agent stdin was not piped"))?;
            stdin
                .write_all(invocation.instruction.as_bytes())
                .await
                .map_err(|e| GyreError::agent(format!("failed to write agent stdin: {e}")))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| GyreError::agent(format!("failed to close agent stdin: {e}")))?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GyreError::agent("agent stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GyreError::agent("agent stderr was not piped"))?;

        // Stderr drains on its own task so a chatty stderr can never stall
        // the stdout stream.
        let mut stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut collected = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push(line);
            }
            collected
        });

        let mut result = AgentResult {
            session_id: invocation.resume_session_id.clone(),
            ..Default::default()
        };

        let mut stdout_lines = BufReader::new(stdout).lines();
        let streamed = timeout(wall_clock, async {
            while let Some(line) = stdout_lines.next_line().await? {
                if let Some(session_id) = adapter.extract_session_id(&line) {
                    result.session_id = Some(session_id);
                }
                if let Some(summary) = adapter.extract_summary(&line) {
                    result.summary = Some(summary);
                }
                if let Some(tx) = &output_tx {
                    let _ = tx.send(line.clone());
                }
                result.logs.push(line);
            }
            Ok::<(), std::io::Error>(())
        })
        .await;

        match streamed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("{} stream read failed: {e}", adapter.display_name());
            }
            Err(_) => {
                // Wall clock exceeded: terminate, then kill after grace.
                warn!(
                    "{} exceeded wall clock of {:?}, terminating",
                    adapter.display_name(),
                    wall_clock
                );
                terminate(&mut child).await;
                // Orphaned grandchildren can keep the stderr pipe open, so
                // give the drain a moment and then abandon it.
                match timeout(Duration::from_secs(1), &mut stderr_task).await {
                    Ok(lines) => result.warnings = lines.unwrap_or_default(),
                    Err(_) => stderr_task.abort(),
                }
                result.success = false;
                result.error = Some(format!(
                    "{} timed out after {} seconds",
                    adapter.display_name(),
                    wall_clock.as_secs()
                ));
                return Ok(result);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| GyreError::agent(format!("agent process wait failed: {e}")))?;
        let stderr_lines = stderr_task.await.unwrap_or_default();

        result.success = status.success();
        result.warnings = stderr_lines.clone();
        if !status.success() {
            // Best-effort error text: tail of stderr, else the last stdout
            // line (some CLIs report failures on stdout only).
            let tail: Vec<&String> = stderr_lines.iter().rev().take(5).collect();
            let mut detail: Vec<&str> = tail.into_iter().rev().map(String::as_str).collect();
            if detail.is_empty() {
                if let Some(last) = result.logs.last() {
                    detail.push(last);
                }
            }
            let detail = if detail.is_empty() {
                format!("exited with {status}")
            } else {
                detail.join("\n")
            };
            result.error = Some(format!(
                "{} execution failed: {detail}",
                adapter.display_name()
            ));
        }

        info!(
            "{} finished (success: {}, {} lines)",
            adapter.display_name(),
            result.success,
            result.logs.len()
        );
        Ok(result)
    }
}

async fn terminate(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
    let grace = Duration::from_secs(AGENT_KILL_GRACE_SECS);
    if timeout(grace, child.wait()).await.is_err() {
        warn!("Agent ignored SIGTERM, sending SIGKILL");
        let _ = child.kill().await;
    }
}
