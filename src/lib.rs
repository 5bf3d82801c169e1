//! # Gyre
//!
//! Gyre is an autonomous development orchestrator: it drives external CLI
//! coding agents (Claude Code, Codex, Gemini) through a full development
//! cycle — code, CI, review, and merge — against a target repository.
//!
//! ## Architecture
//!
//! - **Durable queue**: persistent job store with atomic leases, retries,
//!   delays, priorities, and visibility timeouts (SQLite or Redis backed)
//! - **Worker pool**: leases jobs and dispatches them to kind-specific
//!   handlers, renewing visibility while they run
//! - **Workspace manager**: isolated per-run repository clones with reuse
//!   across runs of the same task and executor
//! - **Agent runner**: spawns agent subprocesses, streams their output,
//!   captures session ids, enforces wall-clock timeouts
//! - **Output multiplexer**: per-stream pub/sub fan-out with bounded
//!   subscriber queues and optional durable persistence
//! - **Cycle engine**: per-task state machine driving coding, CI, review,
//!   and merge phases with iteration budgets
//!
//! The system runs as a standalone worker process over a shared database;
//! several worker processes may share the same store.

/// External agent CLIs and the subprocess runner
pub mod agents;
/// Commit-message translation helper
pub mod commit_message;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Autonomous cycle engine, CI poller, and task supervisor
pub mod cycle;
/// Unified-diff parsing
pub mod diff;
/// Run/review creation and queue dispatch
pub mod dispatch;
/// Error types and handling
pub mod error;
/// Run and review job handlers
pub mod executors;
/// Git command-line driver
pub mod git;
/// GitHub REST client
pub mod github;
/// Core data models
pub mod models;
/// Task-level notifications
pub mod notify;
/// Output streaming and fan-out
pub mod output;
/// Durable job queue backends
pub mod queue;
/// Relational persistence and DAOs
pub mod storage;
/// Worker pool
pub mod worker;
/// Workspace lifecycle management
pub mod workspace;

#[cfg(test)]
mod tests;

pub use error::{GyreError, Result};
