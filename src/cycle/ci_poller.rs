//! CI status polling: one polling task per task id, superseding semantics.
//!
//! Completion and timeout are delivered as events on a channel rather than
//! callbacks; the cycle engine consumes them in one place.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::github::GitHubClient;
use crate::models::CiResult;

#[derive(Debug, Clone)]
pub enum CiPollEvent {
    Completed { task_id: String, result: CiResult },
    TimedOut { task_id: String },
}

pub struct CiPoller {
    github: Arc<GitHubClient>,
    interval: Duration,
    overall_timeout: Duration,
    events: mpsc::Sender<CiPollEvent>,
    pollers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl CiPoller {
    pub fn new(
        github: Arc<GitHubClient>,
        interval: Duration,
        overall_timeout: Duration,
        events: mpsc::Sender<CiPollEvent>,
    ) -> Self {
        Self {
            github,
            interval,
            overall_timeout,
            events,
            pollers: Mutex::new(HashMap::new()),
        }
    }

    /// Start polling CI for a task's head commit. A new poll for the same
    /// task supersedes any prior one.
    pub async fn start_polling(
        &self,
        task_id: &str,
        pr_number: u64,
        repo_full_name: &str,
        head_sha: &str,
    ) {
        let mut pollers = self.pollers.lock().await;
        if let Some(previous) = pollers.remove(task_id) {
            previous.abort();
        }

        info!("[{task_id}] Polling CI for PR #{pr_number} at {head_sha}");
        let github = self.github.clone();
        let events = self.events.clone();
        let interval = self.interval;
        let deadline = Instant::now() + self.overall_timeout;
        let task_id_owned = task_id.to_string();
        let repo = repo_full_name.to_string();
        let sha = head_sha.to_string();

        let handle = tokio::spawn(async move {
            loop {
                if Instant::now() >= deadline {
                    let _ = events
                        .send(CiPollEvent::TimedOut {
                            task_id: task_id_owned.clone(),
                        })
                        .await;
                    return;
                }

                match github.ci_outcome(&repo, &sha).await {
                    Ok(Some(result)) => {
                        debug!(
                            "[{task_id_owned}] CI terminal (success: {})",
                            result.success
                        );
                        let _ = events
                            .send(CiPollEvent::Completed {
                                task_id: task_id_owned.clone(),
                                result,
                            })
                            .await;
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("[{task_id_owned}] CI poll failed: {e}"),
                }

                tokio::time::sleep(interval).await;
            }
        });
        pollers.insert(task_id.to_string(), handle);
    }

    pub async fn stop_polling(&self, task_id: &str) -> bool {
        let mut pollers = self.pollers.lock().await;
        if let Some(handle) = pollers.remove(task_id) {
            handle.abort();
            return true;
        }
        false
    }

    pub async fn active_count(&self) -> usize {
        let pollers = self.pollers.lock().await;
        pollers.values().filter(|h| !h.is_finished()).count()
    }
}
