//! System-wide constants shared across the orchestrator.

/// Anthropic API version header sent by the commit-message translator.
pub const ANTHROPIC_API_VERSION: &str = "2023-06-01";

/// Well-known file an agent may write its run summary to. Read and deleted
/// before staging so it is never committed.
pub const SUMMARY_FILE_NAME: &str = ".gyre-summary.md";

/// Branch prefix used when the configured prefix normalizes to empty.
pub const DEFAULT_BRANCH_PREFIX: &str = "gyre";

/// Short id length used for branch names, log prefixes, and job ids.
pub const SHORT_ID_LEN: usize = 8;

/// Commit subject line is truncated to this many characters.
pub const COMMIT_SUBJECT_MAX_LEN: usize = 72;

/// Patches larger than this are written to a file inside the review
/// working directory and referenced by path instead of inlined.
pub const MAX_INLINE_PATCH_CHARS: usize = 50_000;

/// Name of the spilled patch file inside the review working directory.
pub const REVIEW_PATCH_FILE_NAME: &str = "review_patch.diff";

/// CI error logs embedded in fix instructions are truncated to this size.
pub const CI_ERROR_LOG_MAX_CHARS: usize = 2_000;

/// Example file path used in the review prompt's JSON template. A parsed
/// verdict whose feedbacks all reference this path is the echoed prompt,
/// not a real verdict.
pub const REVIEW_TEMPLATE_EXAMPLE_PATH: &str = "src/example.py";

/// Grace period between SIGTERM and SIGKILL when an agent times out.
pub const AGENT_KILL_GRACE_SECS: u64 = 10;

/// Error text recorded by startup recovery and the operator CLI.
pub const RESET_BY_RECOVERY: &str = "reset by startup recovery";
pub const RESET_BY_ADMIN: &str = "reset by admin";
