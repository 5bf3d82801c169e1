use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gyre::agents::build_registry;
use gyre::commit_message::CommitMessageTranslator;
use gyre::config::{Config, QueueBackendKind};
use gyre::constants::RESET_BY_RECOVERY;
use gyre::cycle::CycleEngine;
use gyre::dispatch::Dispatcher;
use gyre::executors::{ReviewJobHandler, RunJobHandler};
use gyre::git::GitDriver;
use gyre::github::GitHubClient;
use gyre::models::JobKind;
use gyre::notify::Notifier;
use gyre::output::OutputMultiplexer;
use gyre::queue::{JobQueue, RedisQueue, SqliteQueue};
use gyre::storage::{
    CycleDao, Database, OutputLineDao, PrDao, RepoDao, ReviewDao, RunDao, TaskDao,
};
use gyre::worker::{WorkerPool, WorkerPoolConfig};
use gyre::workspace::WorkspaceManager;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Starting Gyre orchestrator");

    let config = Config::load()?;
    let db = Database::connect(&config.storage.database_path).await?;

    let queue: Arc<dyn JobQueue> = match config.queue.backend {
        QueueBackendKind::Sqlite => Arc::new(SqliteQueue::new(db.pool().clone())),
        QueueBackendKind::Redis => Arc::new(RedisQueue::connect(&config.queue.redis_url).await?),
    };

    let runs = RunDao::new(db.pool().clone());
    let tasks = TaskDao::new(db.pool().clone());
    let repos = RepoDao::new(db.pool().clone());
    let reviews = ReviewDao::new(db.pool().clone());
    let prs = PrDao::new(db.pool().clone());
    let cycles = CycleDao::new(db.pool().clone());

    // Startup recovery: a fresh process never inherits "running" work.
    let recovered_jobs = queue.fail_all_running(RESET_BY_RECOVERY).await?;
    let recovered_runs = runs.reset_non_terminal(RESET_BY_RECOVERY).await?;
    let recovered_reviews = reviews.reset_non_terminal(RESET_BY_RECOVERY).await?;
    let recovered_cycles = cycles.reset_non_terminal(RESET_BY_RECOVERY).await?;
    if recovered_jobs + recovered_runs + recovered_reviews + recovered_cycles > 0 {
        warn!(
            "Startup recovery: failed {recovered_jobs} job(s), {recovered_runs} run(s), \
             {recovered_reviews} review(s), {recovered_cycles} cycle state(s)"
        );
    }

    let git = GitDriver::new();
    git.verify_available().await?;
    let workspaces = WorkspaceManager::new(config.workspace.workspaces_dir.clone(), git);
    let github = Arc::new(GitHubClient::new(
        config.github.api_base.clone(),
        config.github.token.clone(),
    ));
    let output = Arc::new(OutputMultiplexer::new(
        &config.output,
        Some(OutputLineDao::new(db.pool().clone())),
    ));
    let agents = build_registry(&config.agents);
    let translator = CommitMessageTranslator::from_config(&config.agents);
    let notifier = Notifier::new(&config.notify);

    let dispatcher = Dispatcher::new(
        runs.clone(),
        reviews.clone(),
        queue.clone(),
        config.queue.default_max_attempts,
    );

    let run_handler = Arc::new(RunJobHandler::new(
        runs.clone(),
        tasks.clone(),
        repos.clone(),
        workspaces.clone(),
        agents.clone(),
        config.agents.clone(),
        config.workspace.clone(),
        output.clone(),
        github.clone(),
        queue.clone(),
        translator,
    ));
    let review_handler = Arc::new(ReviewJobHandler::new(
        reviews.clone(),
        runs.clone(),
        workspaces.clone(),
        agents,
        config.agents.clone(),
        output.clone(),
        queue.clone(),
    ));

    let mut pool = WorkerPool::new(
        queue.clone(),
        WorkerPoolConfig {
            worker_count: config.worker.max_concurrent_jobs,
            poll_interval: config.queue.poll_interval(),
            visibility_timeout: config.queue.visibility_timeout(),
            retry_delay: config.queue.retry_delay(),
        },
    );
    pool.register(JobKind::RunExecute, run_handler);
    pool.register(JobKind::ReviewExecute, review_handler);
    let pool = pool.start();

    let (engine, ci_events) = CycleEngine::new(
        config.cycle.clone(),
        dispatcher,
        runs,
        tasks,
        repos,
        prs,
        cycles,
        github,
        notifier,
    );
    let event_loop = CycleEngine::spawn_event_loop(engine, ci_events);

    // Periodic in-memory stream cleanup.
    let cleanup = {
        let output = output.clone();
        let every = std::time::Duration::from_secs(config.output.cleanup_after_secs.max(60));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                output.cleanup_old_streams().await;
            }
        })
    };

    info!("Gyre is running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    cleanup.abort();
    event_loop.abort();
    pool.shutdown().await;
    Ok(())
}
