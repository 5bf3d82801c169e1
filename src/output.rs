//! Per-stream pub/sub fan-out for agent output.
//!
//! Publishers append lines; subscribers replay history and then follow live
//! lines until the stream is marked complete. Each subscriber owns a bounded
//! queue: a slow subscriber drops lines instead of ever blocking the
//! publisher. When a durable store is configured, lines are also persisted
//! and numbering continues from the persisted maximum, so cross-process
//! readers see one consistent sequence.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::OutputConfig;
use crate::storage::OutputLineDao;
use crate::Result;

/// A single line of captured agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub line_number: u64,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StreamState {
    history: VecDeque<OutputLine>,
    subscribers: Vec<mpsc::Sender<Option<OutputLine>>>,
    next_line: u64,
    counter_loaded: bool,
    completed_at: Option<Instant>,
    dropped: u64,
}

pub struct OutputMultiplexer {
    max_history: usize,
    cleanup_after: Duration,
    max_queue_size: usize,
    dao: Option<OutputLineDao>,
    // Guards only creation and deletion of per-stream state; all per-stream
    // work happens under the inner lock.
    streams: Mutex<HashMap<String, Arc<Mutex<StreamState>>>>,
}

impl OutputMultiplexer {
    pub fn new(config: &OutputConfig, dao: Option<OutputLineDao>) -> Self {
        Self {
            max_history: config.max_history,
            cleanup_after: Duration::from_secs(config.cleanup_after_secs),
            max_queue_size: config.max_queue_size.max(1),
            dao,
            streams: Mutex::new(HashMap::new()),
        }
    }

    async fn stream(&self, stream_id: &str) -> Arc<Mutex<StreamState>> {
        let mut streams = self.streams.lock().await;
        streams
            .entry(stream_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(StreamState::default())))
            .clone()
    }

    async fn ensure_counter(&self, stream_id: &str, state: &mut StreamState) {
        if state.counter_loaded {
            return;
        }
        state.counter_loaded = true;
        if let Some(dao) = &self.dao {
            match dao.max_line_number(stream_id).await {
                Ok(Some(max)) => state.next_line = max + 1,
                Ok(None) => {}
                // Streaming beats failing; fall back to a process-local
                // counter when the store is unavailable.
                Err(e) => warn!("Could not load line counter for {stream_id}: {e}"),
            }
        }
    }

    /// Append a line, notify live subscribers, optionally persist.
    pub async fn publish(&self, stream_id: &str, content: impl Into<String>) {
        let content = content.into();
        let stream = self.stream(stream_id).await;

        let (line, subscribers) = {
            let mut state = stream.lock().await;
            self.ensure_counter(stream_id, &mut state).await;

            let line = OutputLine {
                line_number: state.next_line,
                content,
                timestamp: Utc::now(),
            };
            state.next_line += 1;

            state.history.push_back(line.clone());
            while state.history.len() > self.max_history {
                state.history.pop_front();
            }

            if let Some(dao) = &self.dao {
                if let Err(e) = dao
                    .insert(stream_id, line.line_number, &line.content, line.timestamp)
                    .await
                {
                    warn!("Failed to persist output line for {stream_id}: {e}");
                }
            }

            (line, state.subscribers.clone())
        };

        // Deliver outside the stream lock. A full queue drops the line for
        // that subscriber only.
        let mut dropped = 0u64;
        let mut any_closed = false;
        for sender in &subscribers {
            match sender.try_send(Some(line.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => dropped += 1,
                Err(mpsc::error::TrySendError::Closed(_)) => any_closed = true,
            }
        }

        if dropped > 0 || any_closed {
            let mut state = stream.lock().await;
            state.dropped += dropped;
            if any_closed {
                state.subscribers.retain(|s| !s.is_closed());
            }
            if dropped > 0 {
                warn!(
                    "Queue full for {dropped}/{} subscribers of stream {stream_id}",
                    subscribers.len()
                );
            }
        }
    }

    /// Subscribe from `from_line`. Historical lines are replayed first, then
    /// live lines until the stream completes and the queue drains.
    pub async fn subscribe(&self, stream_id: &str, from_line: u64) -> OutputSubscription {
        let stream = self.stream(stream_id).await;
        let (tx, rx) = mpsc::channel(self.max_queue_size);

        let mut state = stream.lock().await;
        state.subscribers.push(tx);
        let pending: VecDeque<OutputLine> = state
            .history
            .iter()
            .filter(|l| l.line_number >= from_line)
            .cloned()
            .collect();
        let completed = state.completed_at.is_some();
        debug!(
            "Subscriber joined stream {stream_id}: history={} completed={completed}",
            pending.len()
        );
        drop(state);

        OutputSubscription {
            stream: stream.clone(),
            pending,
            rx,
            finished: false,
            completed_at_join: completed,
        }
    }

    /// Signal end-of-stream to all subscribers. Idempotent.
    pub async fn mark_complete(&self, stream_id: &str) {
        let stream = self.stream(stream_id).await;
        let subscribers = {
            let mut state = stream.lock().await;
            if state.completed_at.is_some() {
                return;
            }
            state.completed_at = Some(Instant::now());
            state.subscribers.clone()
        };

        for sender in subscribers {
            // Best effort: a full queue misses the sentinel, and the
            // subscriber's completion probe ends the iteration instead.
            let _ = sender.try_send(None);
        }
        info!("Marked stream {stream_id} as complete");
    }

    /// Snapshot of historical lines, preferring the durable store so reads
    /// work across processes.
    pub async fn get_history(&self, stream_id: &str, from_line: u64) -> Result<Vec<OutputLine>> {
        if let Some(dao) = &self.dao {
            match dao.list_from(stream_id, from_line).await {
                Ok(rows) => {
                    return Ok(rows
                        .into_iter()
                        .map(|(line_number, content, timestamp)| OutputLine {
                            line_number,
                            content,
                            timestamp,
                        })
                        .collect())
                }
                Err(e) => warn!("Failed to read persisted output for {stream_id}: {e}"),
            }
        }

        let stream = self.stream(stream_id).await;
        let state = stream.lock().await;
        Ok(state
            .history
            .iter()
            .filter(|l| l.line_number >= from_line)
            .cloned()
            .collect())
    }

    pub async fn is_complete(&self, stream_id: &str) -> bool {
        let stream = self.stream(stream_id).await;
        let state = stream.lock().await;
        state.completed_at.is_some()
    }

    /// Lines dropped so far across all subscribers of a stream.
    pub async fn dropped_lines(&self, stream_id: &str) -> u64 {
        let stream = self.stream(stream_id).await;
        let state = stream.lock().await;
        state.dropped
    }

    /// Drop in-memory state for streams completed longer than the retention
    /// window. Returns the number of streams removed.
    pub async fn cleanup_old_streams(&self) -> usize {
        let mut to_remove = Vec::new();
        {
            let streams = self.streams.lock().await;
            for (id, stream) in streams.iter() {
                let state = stream.lock().await;
                if let Some(completed_at) = state.completed_at {
                    if completed_at.elapsed() > self.cleanup_after {
                        to_remove.push(id.clone());
                    }
                }
            }
        }

        let mut streams = self.streams.lock().await;
        for id in &to_remove {
            streams.remove(id);
        }
        if !to_remove.is_empty() {
            info!("Cleaned up {} old output streams", to_remove.len());
        }
        to_remove.len()
    }

    pub async fn active_stream_count(&self) -> usize {
        self.streams.lock().await.len()
    }
}

/// Iterator over one subscriber's view of a stream.
pub struct OutputSubscription {
    stream: Arc<Mutex<StreamState>>,
    pending: VecDeque<OutputLine>,
    rx: mpsc::Receiver<Option<OutputLine>>,
    finished: bool,
    completed_at_join: bool,
}

impl OutputSubscription {
    /// Next line, or None once the stream is complete and drained.
    pub async fn next(&mut self) -> Option<OutputLine> {
        if let Some(line) = self.pending.pop_front() {
            return Some(line);
        }
        if self.finished || self.completed_at_join {
            return None;
        }

        loop {
            match tokio::time::timeout(Duration::from_secs(1), self.rx.recv()).await {
                Ok(Some(Some(line))) => return Some(line),
                Ok(Some(None)) | Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Err(_) => {
                    // The completion sentinel can be lost to a full queue;
                    // probe the stream state instead of waiting forever.
                    let state = self.stream.lock().await;
                    if state.completed_at.is_some() {
                        self.finished = true;
                        return None;
                    }
                }
            }
        }
    }
}
