use thiserror::Error;

/// Convenience type alias for Results with GyreError
pub type Result<T> = std::result::Result<T, GyreError>;

/// Main error type for Gyre
///
/// This enum represents all possible errors that can occur within
/// the orchestrator, providing detailed error context for debugging
/// and error handling.
#[derive(Error, Debug)]
pub enum GyreError {
    #[error("GitHub API error: {0}")]
    GitHubApi(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Agent error: {message}")]
    Agent { message: String },

    #[error("Git error: {message}")]
    Git { message: String },

    #[error("Workspace error: {message}")]
    Workspace { message: String },

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("GitHub error: {0}")]
    GitHub(String),

    #[error("Timeout: {message}")]
    Timeout { message: String },

    #[error("Cycle error: {task_id} - {message}")]
    Cycle { task_id: String, message: String },

    /// A handler precondition does not hold (unknown task, invalid target
    /// run status, missing workspace info). Never retried by the worker.
    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("Canceled: {0}")]
    Canceled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl GyreError {
    /// Whether the worker should fail the job permanently instead of
    /// requeueing it for another attempt.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            GyreError::Precondition(_) | GyreError::Canceled(_) | GyreError::NotFound(_)
        )
    }

    pub fn agent(message: impl Into<String>) -> Self {
        GyreError::Agent {
            message: message.into(),
        }
    }

    pub fn git(message: impl Into<String>) -> Self {
        GyreError::Git {
            message: message.into(),
        }
    }

    pub fn workspace(message: impl Into<String>) -> Self {
        GyreError::Workspace {
            message: message.into(),
        }
    }
}
