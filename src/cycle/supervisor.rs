//! Per-task background-task supervision: a single slot per task id.
//!
//! Starting a task for an id aborts whatever was running there before, so
//! a task never has two phase coroutines alive at once.

use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Default)]
pub struct TaskSupervisor {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `handle` as the task's current background work, canceling any
    /// previous one.
    pub async fn start(&self, task_id: &str, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().await;
        if let Some(previous) = tasks.insert(task_id.to_string(), handle) {
            if !previous.is_finished() {
                debug!("[{task_id}] Canceling previous background task");
                previous.abort();
            }
        }
    }

    /// Cancel the task's current background work, if any.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let mut tasks = self.tasks.lock().await;
        if let Some(handle) = tasks.remove(task_id) {
            let was_running = !handle.is_finished();
            handle.abort();
            return was_running;
        }
        false
    }

    /// Number of currently live background tasks.
    pub async fn active_count(&self) -> usize {
        let tasks = self.tasks.lock().await;
        tasks.values().filter(|h| !h.is_finished()).count()
    }
}
