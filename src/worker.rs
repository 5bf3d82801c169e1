//! Worker pool: leases jobs from the queue and dispatches them to the
//! handler registered for their kind.
//!
//! Each worker executes jobs sequentially; parallelism comes from the
//! number of workers. While a handler runs, a heartbeat extends the job's
//! visibility every third of the timeout so a healthy worker never loses
//! its lease.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::{generate_id, Job, JobKind};
use crate::queue::JobQueue;
use crate::{GyreError, Result};

/// A job-kind-specific handler. Must be idempotent: delivery is
/// at-least-once and a crashed attempt is re-run.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    pub retry_delay: Duration,
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    config: WorkerPoolConfig,
}

/// Running pool; dropping it does not stop workers, call [`shutdown`].
pub struct WorkerPoolHandle {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// Signal all workers and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("Worker pool stopped");
    }
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn JobQueue>, config: WorkerPoolConfig) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            config,
        }
    }

    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn start(self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handlers = Arc::new(self.handlers);
        let mut workers = Vec::new();

        for n in 0..self.config.worker_count.max(1) {
            let worker = Worker {
                id: format!("worker-{}-{n}", &generate_id()[..8]),
                queue: self.queue.clone(),
                handlers: handlers.clone(),
                config: self.config.clone(),
                shutdown: shutdown_rx.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }

        info!("Started {} workers", workers.len());
        WorkerPoolHandle {
            shutdown_tx,
            workers,
        }
    }
}

struct Worker {
    id: String,
    queue: Arc<dyn JobQueue>,
    handlers: Arc<HashMap<JobKind, Arc<dyn JobHandler>>>,
    config: WorkerPoolConfig,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        debug!("Worker {} started", self.id);
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self
                .queue
                .dequeue(&self.id, self.config.visibility_timeout)
                .await
            {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {
                    if !self.idle().await {
                        break;
                    }
                }
                Err(e) => {
                    error!("Worker {} dequeue failed: {e}", self.id);
                    if !self.idle().await {
                        break;
                    }
                }
            }
        }
        debug!("Worker {} stopped", self.id);
    }

    /// Sleep one poll interval; returns false when the pool is gone and the
    /// worker should stop.
    async fn idle(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.config.poll_interval);
        tokio::pin!(sleep);
        tokio::select! {
            _ = &mut sleep => true,
            changed = self.shutdown.changed() => changed.is_ok(),
        }
    }

    async fn process(&self, job: Job) {
        info!(
            "Worker {} picked up {} job {} (attempt {}/{})",
            self.id,
            job.kind.as_str(),
            job.id,
            job.attempts,
            job.max_attempts
        );

        let Some(handler) = self.handlers.get(&job.kind) else {
            error!("No handler registered for kind {}", job.kind.as_str());
            let _ = self
                .queue
                .fail(
                    &job.id,
                    &format!("no handler registered for kind {}", job.kind.as_str()),
                    false,
                    self.config.retry_delay,
                )
                .await;
            return;
        };

        // Heartbeat: keep the lease alive while the handler works.
        let heartbeat = {
            let queue = self.queue.clone();
            let job_id = job.id.clone();
            let visibility = self.config.visibility_timeout;
            tokio::spawn(async move {
                let interval = visibility / 3;
                loop {
                    tokio::time::sleep(interval).await;
                    match queue.extend_visibility(&job_id, visibility).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => warn!("Heartbeat for job {job_id} failed: {e}"),
                    }
                }
            })
        };

        let outcome = handler.handle(&job).await;
        heartbeat.abort();

        match outcome {
            Ok(()) => {
                if let Err(e) = self.queue.complete(&job.id).await {
                    error!("Failed to complete job {}: {e}", job.id);
                }
            }
            // The job was already canceled out of band; the handler has
            // recorded the terminal domain status.
            Err(GyreError::Canceled(reason)) => {
                info!("Job {} unwound after cancelation: {reason}", job.id);
            }
            Err(e) => {
                let retry = !e.is_permanent();
                warn!(
                    "Job {} failed (retry: {retry}): {e}",
                    job.id
                );
                if let Err(e) = self
                    .queue
                    .fail(&job.id, &e.to_string(), retry, self.config.retry_delay)
                    .await
                {
                    error!("Failed to record failure for job {}: {e}", job.id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EnqueueRequest, SqliteQueue};
    use crate::storage::Database;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            worker_count: 2,
            poll_interval: Duration::from_millis(20),
            visibility_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_millis(10),
        }
    }

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: bool,
        delay: Duration,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &Job) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail_first && call == 0 {
                return Err(GyreError::agent("transient failure"));
            }
            Ok(())
        }
    }

    async fn queue() -> (Database, Arc<SqliteQueue>) {
        let db = Database::connect_memory().await.unwrap();
        let queue = Arc::new(SqliteQueue::new(db.pool().clone()));
        (db, queue)
    }

    async fn await_terminal(queue: &SqliteQueue, job_id: &str) -> Job {
        for _ in 0..200 {
            let job = queue.get(job_id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {job_id} never reached a terminal status");
    }

    #[tokio::test]
    async fn jobs_dispatch_to_registered_handler() {
        let (_db, queue) = queue().await;
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: false,
            delay: Duration::ZERO,
        });

        let mut pool = WorkerPool::new(queue.clone(), config());
        pool.register(JobKind::RunExecute, handler.clone());
        let running = pool.start();

        let job = queue
            .enqueue(EnqueueRequest::new(JobKind::RunExecute, "run-1"))
            .await
            .unwrap();
        let done = await_terminal(&queue, &job.id).await;
        running.shutdown().await;

        assert_eq!(done.status, crate::models::JobStatus::Succeeded);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_handler_failure_is_retried() {
        let (_db, queue) = queue().await;
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: true,
            delay: Duration::ZERO,
        });

        let mut pool = WorkerPool::new(queue.clone(), config());
        pool.register(JobKind::RunExecute, handler.clone());
        let running = pool.start();

        let job = queue
            .enqueue(EnqueueRequest::new(JobKind::RunExecute, "run-1").max_attempts(3))
            .await
            .unwrap();
        let done = await_terminal(&queue, &job.id).await;
        running.shutdown().await;

        assert_eq!(done.status, crate::models::JobStatus::Succeeded);
        assert_eq!(done.attempts, 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    struct PermanentFailureHandler;

    #[async_trait]
    impl JobHandler for PermanentFailureHandler {
        async fn handle(&self, _job: &Job) -> Result<()> {
            Err(GyreError::Precondition("unknown task".to_string()))
        }
    }

    #[tokio::test]
    async fn precondition_violations_are_not_retried() {
        let (_db, queue) = queue().await;
        let mut pool = WorkerPool::new(queue.clone(), config());
        pool.register(JobKind::RunExecute, Arc::new(PermanentFailureHandler));
        let running = pool.start();

        let job = queue
            .enqueue(EnqueueRequest::new(JobKind::RunExecute, "run-1").max_attempts(5))
            .await
            .unwrap();
        let done = await_terminal(&queue, &job.id).await;
        running.shutdown().await;

        assert_eq!(done.status, crate::models::JobStatus::Failed);
        assert_eq!(done.attempts, 1);
        assert!(done.last_error.unwrap().contains("unknown task"));
    }

    #[tokio::test]
    async fn missing_handler_fails_the_job_permanently() {
        let (_db, queue) = queue().await;
        let pool = WorkerPool::new(queue.clone(), config());
        let running = pool.start();

        let job = queue
            .enqueue(EnqueueRequest::new(JobKind::ReviewExecute, "rev-1").max_attempts(5))
            .await
            .unwrap();
        let done = await_terminal(&queue, &job.id).await;
        running.shutdown().await;

        assert_eq!(done.status, crate::models::JobStatus::Failed);
        assert!(done.last_error.unwrap().contains("no handler"));
    }

    #[tokio::test]
    async fn heartbeat_keeps_slow_jobs_leased() {
        let (_db, queue) = queue().await;
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: false,
            delay: Duration::from_millis(400),
        });

        // Visibility shorter than the handler runtime: without the
        // heartbeat the other worker would reclaim and re-run the job.
        let mut pool_config = config();
        pool_config.visibility_timeout = Duration::from_millis(150);
        let mut pool = WorkerPool::new(queue.clone(), pool_config);
        pool.register(JobKind::RunExecute, handler.clone());
        let running = pool.start();

        let job = queue
            .enqueue(EnqueueRequest::new(JobKind::RunExecute, "run-1").max_attempts(5))
            .await
            .unwrap();
        let done = await_terminal(&queue, &job.id).await;
        // Allow any stray second execution to surface before asserting.
        tokio::time::sleep(Duration::from_millis(200)).await;
        running.shutdown().await;

        assert_eq!(done.status, crate::models::JobStatus::Succeeded);
        assert_eq!(done.attempts, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
