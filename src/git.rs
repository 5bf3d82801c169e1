//! Thin adapter around the `git` command-line tool.
//!
//! Every operation shells out via `tokio::process::Command` with explicit
//! argument arrays (no shell strings) so the scheduler stays responsive and
//! nothing is subject to shell expansion.

use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{GyreError, Result};

/// Outcome of a merge-like operation (pull or merge).
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub success: bool,
    pub has_conflicts: bool,
    pub error: Option<String>,
}

/// Outcome of `push_with_retry`.
#[derive(Debug, Clone, Default)]
pub struct PushOutcome {
    pub success: bool,
    /// Whether a pull was required before the push went through.
    pub required_pull: bool,
    pub error: Option<String>,
}

/// Error fragments that mean the remote moved underneath us and a pull plus
/// retry may succeed.
const NON_FAST_FORWARD_PATTERNS: [&str; 5] = [
    "non-fast-forward",
    "rejected",
    "failed to push some refs",
    "updates were rejected",
    "fetch first",
];

fn is_conflict(text: &str) -> bool {
    text.contains("CONFLICT") || text.contains("Automatic merge failed")
}

#[derive(Debug, Clone, Default)]
pub struct GitDriver;

impl GitDriver {
    pub fn new() -> Self {
        Self
    }

    async fn output(&self, dir: Option<&Path>, args: &[&str]) -> Result<std::process::Output> {
        let mut command = Command::new("git");
        command.args(args);
        if let Some(dir) = dir {
            command.current_dir(dir);
        }
        command
            .output()
            .await
            .map_err(|e| GyreError::git(format!("failed to invoke git {}: {e}", args.join(" "))))
    }

    /// Run git and require success; returns trimmed stdout.
    async fn run(&self, dir: Option<&Path>, args: &[&str]) -> Result<String> {
        let output = self.output(dir, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GyreError::git(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run git and report success without treating failure as an error.
    async fn try_run(&self, dir: Option<&Path>, args: &[&str]) -> Result<(bool, String)> {
        let output = self.output(dir, args).await?;
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        Ok((output.status.success(), combined))
    }

    pub async fn verify_available(&self) -> Result<()> {
        self.run(None, &["--version"]).await.map(|_| ())
    }

    pub async fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        branch: &str,
        shallow: bool,
    ) -> Result<()> {
        let dest_str = dest.to_string_lossy().to_string();
        let mut args = vec!["clone"];
        if shallow {
            args.extend(["--depth", "1", "--single-branch"]);
        }
        args.extend(["--branch", branch, url, &dest_str]);
        info!("Cloning {branch} into {dest_str}");
        self.run(None, &args).await.map(|_| ())
    }

    pub async fn fetch(&self, path: &Path) -> Result<()> {
        self.run(Some(path), &["fetch", "origin"]).await.map(|_| ())
    }

    pub async fn fetch_unshallow(&self, path: &Path) -> Result<()> {
        self.run(Some(path), &["fetch", "--unshallow"])
            .await
            .map(|_| ())
    }

    pub async fn is_shallow(&self, path: &Path) -> bool {
        path.join(".git").join("shallow").exists()
    }

    /// Whether the path is a repository whose status command succeeds.
    pub async fn status_ok(&self, path: &Path) -> bool {
        if !path.exists() {
            return false;
        }
        matches!(
            self.try_run(Some(path), &["status", "--porcelain"]).await,
            Ok((true, _))
        )
    }

    pub async fn has_changes(&self, path: &Path) -> Result<bool> {
        let out = self.run(Some(path), &["status", "--porcelain"]).await?;
        Ok(!out.is_empty())
    }

    pub async fn changed_files(&self, path: &Path) -> Result<Vec<String>> {
        let out = self.run(Some(path), &["status", "--porcelain"]).await?;
        Ok(out
            .lines()
            .filter_map(|line| line.get(3..).map(str::to_string))
            .collect())
    }

    pub async fn rev_parse(&self, path: &Path, rev: &str) -> Result<String> {
        self.run(Some(path), &["rev-parse", rev]).await
    }

    pub async fn head_sha(&self, path: &Path) -> Result<String> {
        self.rev_parse(path, "HEAD").await
    }

    pub async fn current_branch(&self, path: &Path) -> Result<String> {
        self.run(Some(path), &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
    }

    /// Number of commits in `from..to`.
    pub async fn rev_list_count(&self, path: &Path, from: &str, to: &str) -> Result<u32> {
        let out = self
            .run(Some(path), &["rev-list", "--count", &format!("{from}..{to}")])
            .await?;
        out.parse()
            .map_err(|_| GyreError::git(format!("unparseable rev-list count: {out}")))
    }

    pub async fn remote_ref_exists(&self, path: &Path, remote_ref: &str) -> bool {
        matches!(
            self.try_run(
                Some(path),
                &[
                    "show-ref",
                    "--verify",
                    &format!("refs/remotes/{remote_ref}"),
                ],
            )
            .await,
            Ok((true, _))
        )
    }

    /// True iff `ancestor` is an ancestor of `descendant`.
    pub async fn is_ancestor(&self, path: &Path, ancestor: &str, descendant: &str) -> Result<bool> {
        let (ok, _) = self
            .try_run(
                Some(path),
                &["merge-base", "--is-ancestor", ancestor, descendant],
            )
            .await?;
        Ok(ok)
    }

    pub async fn checkout_new_branch(&self, path: &Path, name: &str) -> Result<()> {
        self.run(Some(path), &["checkout", "-b", name])
            .await
            .map(|_| ())
    }

    /// Force-set a branch to the current head and switch to it.
    pub async fn checkout_force_branch(&self, path: &Path, name: &str) -> Result<()> {
        self.run(Some(path), &["checkout", "-B", name])
            .await
            .map(|_| ())
    }

    pub async fn pull(&self, path: &Path, branch: &str) -> Result<MergeOutcome> {
        let (ok, output) = self
            .try_run(Some(path), &["pull", "--no-rebase", "origin", branch])
            .await?;
        if ok {
            return Ok(MergeOutcome {
                success: true,
                ..Default::default()
            });
        }
        Ok(MergeOutcome {
            success: false,
            has_conflicts: is_conflict(&output),
            error: Some(output.trim().to_string()),
        })
    }

    pub async fn merge(&self, path: &Path, target_ref: &str) -> Result<MergeOutcome> {
        let (ok, output) = self.try_run(Some(path), &["merge", target_ref]).await?;
        if ok {
            return Ok(MergeOutcome {
                success: true,
                ..Default::default()
            });
        }
        Ok(MergeOutcome {
            success: false,
            has_conflicts: is_conflict(&output),
            error: Some(output.trim().to_string()),
        })
    }

    pub async fn merge_in_progress(&self, path: &Path) -> bool {
        path.join(".git").join("MERGE_HEAD").exists()
    }

    pub async fn merge_abort(&self, path: &Path) -> Result<()> {
        self.run(Some(path), &["merge", "--abort"]).await.map(|_| ())
    }

    /// Files currently in unmerged state.
    pub async fn unmerged_files(&self, path: &Path) -> Result<Vec<String>> {
        let out = self
            .run(Some(path), &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    pub async fn stage_all(&self, path: &Path) -> Result<()> {
        self.run(Some(path), &["add", "-A"]).await.map(|_| ())
    }

    pub async fn diff(&self, path: &Path, staged: bool) -> Result<String> {
        let args: &[&str] = if staged {
            &["diff", "--cached"]
        } else {
            &["diff"]
        };
        self.run(Some(path), args).await
    }

    pub async fn commit(&self, path: &Path, message: &str) -> Result<String> {
        self.run(Some(path), &["commit", "-m", message]).await?;
        self.head_sha(path).await
    }

    pub async fn push(&self, path: &Path, branch: &str, force: bool) -> Result<()> {
        let mut args = vec!["push", "origin", branch];
        if force {
            args.push("--force");
        }
        self.run(Some(path), &args).await.map(|_| ())
    }

    /// Push, and on a non-fast-forward style rejection pull once and retry.
    pub async fn push_with_retry(&self, path: &Path, branch: &str) -> Result<PushOutcome> {
        let (ok, output) = self
            .try_run(Some(path), &["push", "origin", branch])
            .await?;
        if ok {
            return Ok(PushOutcome {
                success: true,
                ..Default::default()
            });
        }

        let lower = output.to_lowercase();
        if !NON_FAST_FORWARD_PATTERNS.iter().any(|p| lower.contains(p)) {
            return Ok(PushOutcome {
                success: false,
                required_pull: false,
                error: Some(output.trim().to_string()),
            });
        }

        warn!("Push rejected (remote moved), pulling and retrying");
        let pull = self.pull(path, branch).await?;
        if !pull.success {
            return Ok(PushOutcome {
                success: false,
                required_pull: true,
                error: pull.error,
            });
        }

        let (ok, output) = self
            .try_run(Some(path), &["push", "origin", branch])
            .await?;
        Ok(PushOutcome {
            success: ok,
            required_pull: true,
            error: (!ok).then(|| output.trim().to_string()),
        })
    }

    pub async fn delete_remote_branch(&self, path: &Path, branch: &str) -> Result<()> {
        self.run(Some(path), &["push", "origin", "--delete", branch])
            .await
            .map(|_| ())
    }

    pub async fn remote_url(&self, path: &Path) -> Result<String> {
        self.run(Some(path), &["remote", "get-url", "origin"]).await
    }

    pub async fn set_remote_url(&self, path: &Path, url: &str) -> Result<()> {
        self.run(Some(path), &["remote", "set-url", "origin", url])
            .await
            .map(|_| ())
    }

    /// Discard uncommitted edits to tracked files.
    pub async fn checkout_all(&self, path: &Path) -> Result<()> {
        self.run(Some(path), &["checkout", "--", "."])
            .await
            .map(|_| ())
    }

    /// Remove untracked files and directories.
    pub async fn clean_untracked(&self, path: &Path) -> Result<()> {
        debug!("Removing untracked files under {}", path.display());
        self.run(Some(path), &["clean", "-fd"]).await.map(|_| ())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// A bare "remote" plus one working clone seeded with an initial commit.
    pub struct GitFixture {
        pub dir: TempDir,
        pub remote: PathBuf,
        pub driver: GitDriver,
    }

    pub async fn git(dir: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    pub async fn configure_identity(dir: &Path) {
        git(dir, &["config", "user.email", "tester@example.com"]).await;
        git(dir, &["config", "user.name", "Tester"]).await;
        git(dir, &["config", "commit.gpgsign", "false"]).await;
    }

    impl GitFixture {
        /// Create a bare remote with `main` holding one commit.
        pub async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let remote = dir.path().join("remote.git");
            let seed = dir.path().join("seed");

            git(dir.path(), &["init", "--bare", "-b", "main", "remote.git"]).await;
            git(dir.path(), &["init", "-b", "main", "seed"]).await;
            configure_identity(&seed).await;
            tokio::fs::write(seed.join("README.md"), "# fixture\n")
                .await
                .unwrap();
            git(&seed, &["add", "-A"]).await;
            git(&seed, &["commit", "-m", "initial commit"]).await;
            git(
                &seed,
                &["remote", "add", "origin", remote.to_str().unwrap()],
            )
            .await;
            git(&seed, &["push", "origin", "main"]).await;

            Self {
                dir,
                remote,
                driver: GitDriver::new(),
            }
        }

        pub fn remote_url(&self) -> String {
            self.remote.to_string_lossy().to_string()
        }

        /// Clone the remote into a fresh working directory.
        pub async fn clone_to(&self, name: &str) -> PathBuf {
            let dest = self.dir.path().join(name);
            self.driver
                .clone_repo(&self.remote_url(), &dest, "main", false)
                .await
                .unwrap();
            configure_identity(&dest).await;
            dest
        }
    }
}
