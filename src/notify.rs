//! Task-level notifications: ready-for-merge, completed, failed, warnings.
//!
//! Events are posted as JSON to an optional webhook; without one they are
//! only logged. Delivery is best effort and never fails the caller.

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::NotifyConfig;
use crate::models::{CodingMode, CycleState};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    ReadyForMerge,
    Completed,
    Failed,
    Warning,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub task_id: String,
    pub mode: CodingMode,
    pub iterations: u32,
    pub pr_number: Option<u64>,
    pub message: Option<String>,
    pub review_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Notifier {
    http: reqwest::Client,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(config: &NotifyConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            webhook_url: config.webhook_url.clone(),
        }
    }

    pub async fn ready_for_merge(&self, state: &CycleState) {
        self.send(Notification {
            kind: NotificationKind::ReadyForMerge,
            task_id: state.task_id.clone(),
            mode: state.mode,
            iterations: state.iteration,
            pr_number: state.pr_number,
            message: None,
            review_score: state.last_review_score,
        })
        .await;
    }

    pub async fn completed(&self, state: &CycleState) {
        self.send(Notification {
            kind: NotificationKind::Completed,
            task_id: state.task_id.clone(),
            mode: state.mode,
            iterations: state.iteration,
            pr_number: state.pr_number,
            message: None,
            review_score: state.last_review_score,
        })
        .await;
    }

    pub async fn failed(&self, state: &CycleState) {
        self.send(Notification {
            kind: NotificationKind::Failed,
            task_id: state.task_id.clone(),
            mode: state.mode,
            iterations: state.iteration,
            pr_number: state.pr_number,
            message: state.error.clone(),
            review_score: state.last_review_score,
        })
        .await;
    }

    pub async fn warning(&self, state: &CycleState, message: impl Into<String>) {
        self.send(Notification {
            kind: NotificationKind::Warning,
            task_id: state.task_id.clone(),
            mode: state.mode,
            iterations: state.iteration,
            pr_number: state.pr_number,
            message: Some(message.into()),
            review_score: state.last_review_score,
        })
        .await;
    }

    async fn send(&self, notification: Notification) {
        info!(
            "Notification {:?} for task {} (iterations: {})",
            notification.kind, notification.task_id, notification.iterations
        );
        let Some(url) = &self.webhook_url else {
            return;
        };
        let result = self
            .http
            .post(url)
            .json(&json!(notification))
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(e) = result {
            warn!("Notification webhook failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn webhook_receives_failure_event() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_body(mockito::Matcher::PartialJson(json!({
                "kind": "failed",
                "task_id": "task-1",
                "message": "Exceeded max CI fix iterations",
            })))
            .with_status(200)
            .create_async()
            .await;

        let notifier = Notifier::new(&NotifyConfig {
            webhook_url: Some(format!("{}/hook", server.url())),
        });
        let mut state = CycleState::new("task-1", CodingMode::FullAuto);
        state.error = Some("Exceeded max CI fix iterations".to_string());
        notifier.failed(&state).await;

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_webhook_is_a_no_op() {
        let notifier = Notifier::new(&NotifyConfig { webhook_url: None });
        let state = CycleState::new("task-1", CodingMode::SemiAuto);
        // Must not error or panic.
        notifier.completed(&state).await;
    }
}
