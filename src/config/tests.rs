use super::*;
use serial_test::serial;

fn clear_env() {
    for name in [
        "DATABASE_PATH",
        "QUEUE_BACKEND",
        "QUEUE_VISIBILITY_TIMEOUT",
        "QUEUE_POLL_INTERVAL_MS",
        "QUEUE_RETRY_DELAY",
        "MAX_CONCURRENT_JOBS",
        "MERGE_METHOD",
        "MIN_REVIEW_SCORE",
        "USE_SHALLOW_CLONE",
        "BRANCH_PREFIX",
    ] {
        std::env::remove_var(name);
    }
}

#[test]
#[serial]
fn load_uses_defaults() {
    clear_env();
    let config = Config::load().unwrap();

    assert_eq!(config.storage.database_path, "gyre.db");
    assert_eq!(config.queue.backend, QueueBackendKind::Sqlite);
    assert_eq!(config.queue.visibility_timeout_secs, 300);
    assert_eq!(config.queue.poll_interval_ms, 500);
    assert_eq!(config.worker.max_concurrent_jobs, 2);
    assert_eq!(config.cycle.merge_method, MergeMethod::Squash);
    assert!(config.workspace.use_shallow_clone);
    assert!(config.workspace.branch_prefix.is_none());
}

#[test]
#[serial]
fn load_respects_overrides() {
    clear_env();
    std::env::set_var("QUEUE_BACKEND", "redis");
    std::env::set_var("QUEUE_VISIBILITY_TIMEOUT", "60");
    std::env::set_var("MAX_CONCURRENT_JOBS", "4");
    std::env::set_var("MERGE_METHOD", "rebase");
    std::env::set_var("BRANCH_PREFIX", "feature work");

    let config = Config::load().unwrap();
    assert_eq!(config.queue.backend, QueueBackendKind::Redis);
    assert_eq!(config.queue.visibility_timeout_secs, 60);
    assert_eq!(config.worker.max_concurrent_jobs, 4);
    assert_eq!(config.cycle.merge_method, MergeMethod::Rebase);
    assert_eq!(config.workspace.branch_prefix.as_deref(), Some("feature work"));

    clear_env();
}

#[test]
#[serial]
fn load_rejects_unknown_queue_backend() {
    clear_env();
    std::env::set_var("QUEUE_BACKEND", "rabbitmq");
    let err = Config::load().unwrap_err();
    assert!(err.to_string().contains("QUEUE_BACKEND"));
    clear_env();
}

#[test]
#[serial]
fn load_rejects_out_of_range_review_score() {
    clear_env();
    std::env::set_var("MIN_REVIEW_SCORE", "1.5");
    let err = Config::load().unwrap_err();
    assert!(err.to_string().contains("MIN_REVIEW_SCORE"));
    clear_env();
}

#[test]
#[serial]
fn agent_timeouts_map_by_kind() {
    clear_env();
    let config = Config::load().unwrap();
    use crate::models::ExecutorKind;
    assert_eq!(
        config.agents.timeout_for(ExecutorKind::ClaudeCode).as_secs(),
        1800
    );
    assert_eq!(
        config.agents.timeout_for(ExecutorKind::CodexCli).as_secs(),
        900
    );
}
