//! Fetching project sources.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::domain::{CoreError, CoreResult};

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Clone `branch` of `url` into `dest`, which must not exist yet.
    async fn clone_repo(&self, url: &str, branch: &str, dest: &Path) -> CoreResult<()>;

    /// Refresh an existing checkout.
    async fn pull(&self, dir: &Path) -> CoreResult<()>;
}

/// Runs the `git` CLI.
#[derive(Debug, Default, Clone)]
pub struct GitFetcher;

impl GitFetcher {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, args: &[&str], cwd: &Path) -> CoreResult<()> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CoreError::RuntimeUnavailable(format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoreError::InvalidRequest(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn clone_repo(&self, url: &str, branch: &str, dest: &Path) -> CoreResult<()> {
        let parent = dest.parent().ok_or_else(|| {
            CoreError::InvalidRequest(format!("invalid checkout path {}", dest.display()))
        })?;
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            CoreError::RuntimeUnavailable(format!("cannot create {}: {e}", parent.display()))
        })?;

        let dest_str = dest.to_string_lossy();
        self.run(
            &["clone", "--branch", branch, "--single-branch", "--", url, &dest_str],
            parent,
        )
        .await
    }

    async fn pull(&self, dir: &Path) -> CoreResult<()> {
        if !dir.is_dir() {
            return Err(CoreError::NotFound(format!(
                "checkout {} does not exist",
                dir.display()
            )));
        }
        self.run(&["pull", "--ff-only"], dir).await
    }
}
