//! Isolated workspace lifecycle for agent execution.
//!
//! A workspace is a clone of the target repository on a dedicated branch,
//! created under `workspaces_dir/run_<id>`. Workspaces are the unit of
//! isolation between concurrent agent invocations and may be reused by
//! later runs of the same task and executor kind.
//!
//! Credentials never persist: operations that need an authenticated remote
//! temporarily swap the origin URL and restore it afterwards.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::constants::DEFAULT_BRANCH_PREFIX;
use crate::git::{GitDriver, PushOutcome};
use crate::models::short_id;
use crate::Result;

#[derive(Debug, Clone)]
pub struct WorkspaceInfo {
    pub path: PathBuf,
    pub branch_name: String,
    pub base_branch: String,
    pub created_at: DateTime<Utc>,
}

/// Result of syncing a workspace with its remote tracking branch.
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub success: bool,
    pub commits_pulled: u32,
    pub conflict_files: Vec<String>,
    pub error: Option<String>,
}

impl SyncResult {
    pub fn has_conflicts(&self) -> bool {
        !self.conflict_files.is_empty()
    }
}

/// Result of merging the base branch into the working branch.
#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    pub success: bool,
    pub has_conflicts: bool,
    pub conflict_files: Vec<String>,
    pub error: Option<String>,
}

/// Normalize a user-supplied branch prefix: trim, collapse internal
/// whitespace to `-`, strip surrounding slashes, fall back to the default
/// when nothing remains.
pub fn normalize_branch_prefix(prefix: Option<&str>) -> String {
    let collapsed = prefix
        .unwrap_or("")
        .trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-");
    let trimmed = collapsed.trim_matches('/');
    if trimmed.is_empty() {
        DEFAULT_BRANCH_PREFIX.to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    git: GitDriver,
    workspaces_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(workspaces_dir: impl Into<PathBuf>, git: GitDriver) -> Self {
        Self {
            git,
            workspaces_dir: workspaces_dir.into(),
        }
    }

    pub fn workspace_path(&self, run_id: &str) -> PathBuf {
        self.workspaces_dir.join(format!("run_{run_id}"))
    }

    pub fn branch_name(&self, run_id: &str, branch_prefix: Option<&str>) -> String {
        format!(
            "{}/{}",
            normalize_branch_prefix(branch_prefix),
            short_id(run_id)
        )
    }

    /// Swap the origin URL for an authenticated one, returning the original
    /// so the caller can restore it.
    async fn set_auth(&self, path: &Path, auth_url: Option<&str>) -> Option<String> {
        let auth_url = auth_url?;
        match self.git.remote_url(path).await {
            Ok(original) if original != auth_url => {
                if self.git.set_remote_url(path, auth_url).await.is_ok() {
                    Some(original)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    async fn restore_auth(&self, path: &Path, original: Option<String>) {
        if let Some(url) = original {
            if let Err(e) = self.git.set_remote_url(path, &url).await {
                warn!("Failed to restore origin URL for {}: {e}", path.display());
            }
        }
    }

    /// Create a fresh workspace: clone the base branch and switch to a new
    /// working branch named `<prefix>/<short_run_id>`. An existing directory
    /// at the target path is removed first.
    pub async fn create(
        &self,
        repo_url: &str,
        base_branch: &str,
        run_id: &str,
        branch_prefix: Option<&str>,
        auth_url: Option<&str>,
        shallow: bool,
    ) -> Result<WorkspaceInfo> {
        let path = self.workspace_path(run_id);
        let branch_name = self.branch_name(run_id, branch_prefix);

        if path.exists() {
            tokio::fs::remove_dir_all(&path).await?;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let clone_url = auth_url.unwrap_or(repo_url);
        self.git
            .clone_repo(clone_url, &path, base_branch, shallow)
            .await?;

        // Scrub credentials from the persisted remote.
        if auth_url.is_some() && clone_url != repo_url {
            self.git.set_remote_url(&path, repo_url).await?;
        }

        self.git.checkout_new_branch(&path, &branch_name).await?;
        info!(
            "Created workspace {} on branch {branch_name}",
            path.display()
        );

        Ok(WorkspaceInfo {
            path,
            branch_name,
            base_branch: base_branch.to_string(),
            created_at: Utc::now(),
        })
    }

    /// Whether the path is a readable repository whose status command
    /// succeeds.
    pub async fn is_valid(&self, path: &Path) -> bool {
        self.git.status_ok(path).await
    }

    /// Whether a reused workspace for the default branch is still fresh:
    /// `origin/<default>` must be an ancestor of the workspace head.
    pub async fn is_fresh_against_default(&self, path: &Path, default_branch: &str) -> bool {
        self.git
            .is_ancestor(path, &format!("origin/{default_branch}"), "HEAD")
            .await
            .unwrap_or(false)
    }

    /// True iff the remote tracking branch has commits the local head lacks.
    pub async fn is_behind_remote(
        &self,
        path: &Path,
        branch: &str,
        auth_url: Option<&str>,
    ) -> Result<bool> {
        let original = self.set_auth(path, auth_url).await;
        let fetch_result = self.git.fetch(path).await;
        self.restore_auth(path, original).await;
        fetch_result?;

        let remote_ref = format!("origin/{branch}");
        if !self.git.remote_ref_exists(path, &remote_ref).await {
            return Ok(false);
        }

        let local = self.git.head_sha(path).await?;
        let remote = self.git.rev_parse(path, &remote_ref).await?;
        if local == remote {
            return Ok(false);
        }
        Ok(!self.git.is_ancestor(path, &remote, &local).await?)
    }

    /// Fetch and pull. Conflicts are reported, not resolved; the workspace
    /// is left in the conflicted state for the next agent invocation.
    pub async fn sync_with_remote(
        &self,
        path: &Path,
        branch: &str,
        auth_url: Option<&str>,
    ) -> Result<SyncResult> {
        let original = self.set_auth(path, auth_url).await;
        let result = self.sync_inner(path, branch).await;
        self.restore_auth(path, original).await;
        result
    }

    async fn sync_inner(&self, path: &Path, branch: &str) -> Result<SyncResult> {
        self.git.fetch(path).await?;

        let before = self.git.head_sha(path).await?;
        let remote_ref = format!("origin/{branch}");
        if self.git.remote_ref_exists(path, &remote_ref).await {
            let remote = self.git.rev_parse(path, &remote_ref).await?;
            if before == remote {
                return Ok(SyncResult {
                    success: true,
                    ..Default::default()
                });
            }
        }

        let pull = self.git.pull(path, branch).await?;
        if pull.success {
            let after = self.git.head_sha(path).await?;
            let commits_pulled = if before == after {
                0
            } else {
                self.git.rev_list_count(path, &before, &after).await.unwrap_or(0)
            };
            return Ok(SyncResult {
                success: true,
                commits_pulled,
                ..Default::default()
            });
        }

        if pull.has_conflicts {
            let conflict_files = self.git.unmerged_files(path).await?;
            return Ok(SyncResult {
                success: false,
                conflict_files,
                error: Some("Merge conflicts detected".to_string()),
                ..Default::default()
            });
        }

        Ok(SyncResult {
            success: false,
            error: pull.error,
            ..Default::default()
        })
    }

    /// Convert a shallow clone into a full one. Required before operations
    /// needing full history. Idempotent.
    pub async fn unshallow(&self, path: &Path, auth_url: Option<&str>) -> Result<()> {
        if !self.git.is_shallow(path).await {
            return Ok(());
        }
        let original = self.set_auth(path, auth_url).await;
        let result = self.git.fetch_unshallow(path).await;
        self.restore_auth(path, original).await;
        result
    }

    /// Merge `origin/<base_branch>` into the working branch. On conflict the
    /// workspace stays in the conflicted state so the agent can resolve it.
    pub async fn merge_base_branch(
        &self,
        path: &Path,
        base_branch: &str,
        auth_url: Option<&str>,
    ) -> Result<MergeResult> {
        self.unshallow(path, auth_url).await?;

        let original = self.set_auth(path, auth_url).await;
        let fetch_result = self.git.fetch(path).await;
        self.restore_auth(path, original).await;
        fetch_result?;

        let merge = self.git.merge(path, &format!("origin/{base_branch}")).await?;
        if merge.success {
            return Ok(MergeResult {
                success: true,
                ..Default::default()
            });
        }
        if merge.has_conflicts {
            let conflict_files = self.git.unmerged_files(path).await?;
            return Ok(MergeResult {
                success: false,
                has_conflicts: true,
                conflict_files,
                error: Some("Merge conflicts detected".to_string()),
            });
        }
        Ok(MergeResult {
            success: false,
            has_conflicts: false,
            conflict_files: Vec::new(),
            error: merge.error,
        })
    }

    pub async fn get_conflict_files(&self, path: &Path) -> Result<Vec<String>> {
        self.git.unmerged_files(path).await
    }

    pub async fn is_merge_in_progress(&self, path: &Path) -> bool {
        self.git.merge_in_progress(path).await
    }

    /// Stage everything and commit the in-progress merge.
    pub async fn complete_merge(&self, path: &Path, message: Option<&str>) -> Result<String> {
        self.git.stage_all(path).await?;
        self.git
            .commit(path, message.unwrap_or("Merge base branch"))
            .await
    }

    pub async fn abort_merge(&self, path: &Path) -> Result<()> {
        self.git.merge_abort(path).await
    }

    pub async fn stage_all(&self, path: &Path) -> Result<()> {
        self.git.stage_all(path).await
    }

    pub async fn get_diff(&self, path: &Path, staged: bool) -> Result<String> {
        self.git.diff(path, staged).await
    }

    pub async fn commit(&self, path: &Path, message: &str) -> Result<String> {
        self.git.commit(path, message).await
    }

    /// Push the working branch, pulling and retrying once on a
    /// non-fast-forward rejection.
    pub async fn push(
        &self,
        path: &Path,
        branch: &str,
        auth_url: Option<&str>,
    ) -> Result<PushOutcome> {
        let original = self.set_auth(path, auth_url).await;
        let result = self.git.push_with_retry(path, branch).await;
        self.restore_auth(path, original).await;
        result
    }

    pub async fn get_current_branch(&self, path: &Path) -> Result<String> {
        self.git.current_branch(path).await
    }

    pub async fn get_head_sha(&self, path: &Path) -> Result<String> {
        self.git.head_sha(path).await
    }

    pub async fn get_changed_files(&self, path: &Path) -> Result<Vec<String>> {
        self.git.changed_files(path).await
    }

    /// Discard uncommitted edits and untracked files. Used after reviews so
    /// review-phase pollution cannot leak into subsequent runs.
    pub async fn discard_changes(&self, path: &Path) -> Result<()> {
        self.git.checkout_all(path).await?;
        self.git.clean_untracked(path).await
    }

    /// Remove the workspace directory; optionally delete the remote branch
    /// first.
    pub async fn cleanup(
        &self,
        path: &Path,
        branch: Option<&str>,
        delete_remote_branch: bool,
        auth_url: Option<&str>,
    ) -> Result<()> {
        if delete_remote_branch {
            if let Some(branch) = branch {
                let original = self.set_auth(path, auth_url).await;
                if let Err(e) = self.git.delete_remote_branch(path, branch).await {
                    warn!("Failed to delete remote branch {branch}: {e}");
                }
                self.restore_auth(path, original).await;
            }
        }
        if path.exists() {
            tokio::fs::remove_dir_all(path).await?;
        }
        info!("Cleaned up workspace {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::{configure_identity, git, GitFixture};

    #[test]
    fn branch_prefix_normalization() {
        assert_eq!(normalize_branch_prefix(None), "gyre");
        assert_eq!(normalize_branch_prefix(Some("")), "gyre");
        assert_eq!(normalize_branch_prefix(Some("   ")), "gyre");
        assert_eq!(normalize_branch_prefix(Some("/feature/")), "feature");
        assert_eq!(normalize_branch_prefix(Some("my branch  name")), "my-branch-name");
        assert_eq!(normalize_branch_prefix(Some(" / ")), "gyre");
    }

    async fn manager(fixture: &GitFixture) -> WorkspaceManager {
        WorkspaceManager::new(fixture.dir.path().join("workspaces"), fixture.driver.clone())
    }

    #[tokio::test]
    async fn create_clones_and_switches_to_run_branch() {
        let fixture = GitFixture::new().await;
        let manager = manager(&fixture).await;

        let ws = manager
            .create(
                &fixture.remote_url(),
                "main",
                "abcdef1234567890",
                Some("feat work"),
                None,
                true,
            )
            .await
            .unwrap();

        assert_eq!(ws.branch_name, "feat-work/abcdef12");
        assert!(manager.is_valid(&ws.path).await);
        assert_eq!(
            manager.get_current_branch(&ws.path).await.unwrap(),
            "feat-work/abcdef12"
        );
    }

    #[tokio::test]
    async fn create_replaces_existing_directory() {
        let fixture = GitFixture::new().await;
        let manager = manager(&fixture).await;

        let run_id = "1111222233334444";
        let first = manager
            .create(&fixture.remote_url(), "main", run_id, None, None, false)
            .await
            .unwrap();
        tokio::fs::write(first.path.join("stale.txt"), "stale")
            .await
            .unwrap();

        let second = manager
            .create(&fixture.remote_url(), "main", run_id, None, None, false)
            .await
            .unwrap();
        assert!(!second.path.join("stale.txt").exists());
    }

    #[tokio::test]
    async fn sync_with_remote_reports_behind_and_pulls() {
        let fixture = GitFixture::new().await;
        let manager = manager(&fixture).await;

        // Workspace tracking main directly so the remote can move under it.
        let other = fixture.clone_to("other").await;
        let ws_path = fixture.dir.path().join("ws");
        fixture
            .driver
            .clone_repo(&fixture.remote_url(), &ws_path, "main", false)
            .await
            .unwrap();
        configure_identity(&ws_path).await;

        assert!(!manager.is_behind_remote(&ws_path, "main", None).await.unwrap());

        tokio::fs::write(other.join("update.txt"), "update\n")
            .await
            .unwrap();
        git(&other, &["add", "-A"]).await;
        git(&other, &["commit", "-m", "remote update"]).await;
        git(&other, &["push", "origin", "main"]).await;

        assert!(manager.is_behind_remote(&ws_path, "main", None).await.unwrap());

        let sync = manager.sync_with_remote(&ws_path, "main", None).await.unwrap();
        assert!(sync.success);
        assert_eq!(sync.commits_pulled, 1);
        assert!(!manager.is_behind_remote(&ws_path, "main", None).await.unwrap());
    }

    #[tokio::test]
    async fn merge_base_branch_surfaces_conflicts() {
        let fixture = GitFixture::new().await;
        let manager = manager(&fixture).await;

        let ws = manager
            .create(&fixture.remote_url(), "main", "aaaabbbbccccdddd", None, None, false)
            .await
            .unwrap();

        // Base branch moves with a conflicting change.
        let other = fixture.clone_to("other").await;
        tokio::fs::write(other.join("README.md"), "# upstream\n")
            .await
            .unwrap();
        git(&other, &["add", "-A"]).await;
        git(&other, &["commit", "-m", "upstream change"]).await;
        git(&other, &["push", "origin", "main"]).await;

        // Workspace edits the same file.
        tokio::fs::write(ws.path.join("README.md"), "# local\n")
            .await
            .unwrap();
        manager.stage_all(&ws.path).await.unwrap();
        manager.commit(&ws.path, "local change").await.unwrap();

        let merge = manager
            .merge_base_branch(&ws.path, "main", None)
            .await
            .unwrap();
        assert!(!merge.success);
        assert!(merge.has_conflicts);
        assert_eq!(merge.conflict_files, vec!["README.md".to_string()]);
        assert!(manager.is_merge_in_progress(&ws.path).await);

        // Resolve and complete the merge.
        tokio::fs::write(ws.path.join("README.md"), "# merged\n")
            .await
            .unwrap();
        let sha = manager.complete_merge(&ws.path, None).await.unwrap();
        assert_eq!(sha.len(), 40);
        assert!(!manager.is_merge_in_progress(&ws.path).await);
    }

    #[tokio::test]
    async fn freshness_check_against_default_branch() {
        let fixture = GitFixture::new().await;
        let manager = manager(&fixture).await;

        let ws = manager
            .create(&fixture.remote_url(), "main", "ffff0000ffff0000", None, None, false)
            .await
            .unwrap();
        assert!(manager.is_fresh_against_default(&ws.path, "main").await);

        // Default branch advances; the stale workspace no longer qualifies.
        let other = fixture.clone_to("other").await;
        tokio::fs::write(other.join("ahead.txt"), "ahead\n")
            .await
            .unwrap();
        git(&other, &["add", "-A"]).await;
        git(&other, &["commit", "-m", "ahead"]).await;
        git(&other, &["push", "origin", "main"]).await;

        fixture.driver.fetch(&ws.path).await.unwrap();
        assert!(!manager.is_fresh_against_default(&ws.path, "main").await);
    }

    #[tokio::test]
    async fn discard_changes_resets_review_pollution() {
        let fixture = GitFixture::new().await;
        let manager = manager(&fixture).await;

        let ws = manager
            .create(&fixture.remote_url(), "main", "1234123412341234", None, None, false)
            .await
            .unwrap();
        tokio::fs::write(ws.path.join("README.md"), "scribbled\n")
            .await
            .unwrap();
        tokio::fs::write(ws.path.join("junk.txt"), "junk\n")
            .await
            .unwrap();

        manager.discard_changes(&ws.path).await.unwrap();
        assert!(!ws.path.join("junk.txt").exists());
        assert!(!fixture.driver.has_changes(&ws.path).await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_removes_directory_and_remote_branch() {
        let fixture = GitFixture::new().await;
        let manager = manager(&fixture).await;

        let ws = manager
            .create(&fixture.remote_url(), "main", "9999888877776666", None, None, false)
            .await
            .unwrap();
        tokio::fs::write(ws.path.join("work.txt"), "w\n").await.unwrap();
        manager.stage_all(&ws.path).await.unwrap();
        manager.commit(&ws.path, "work").await.unwrap();
        manager
            .push(&ws.path, &ws.branch_name, None)
            .await
            .unwrap();

        manager
            .cleanup(&ws.path, Some(&ws.branch_name), true, None)
            .await
            .unwrap();
        assert!(!ws.path.exists());

        // The remote branch is gone too.
        let check = fixture.clone_to("check").await;
        assert!(!fixture
            .driver
            .remote_ref_exists(&check, &format!("origin/{}", ws.branch_name))
            .await);
    }
}
