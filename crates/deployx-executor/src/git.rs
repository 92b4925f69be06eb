//! Workspace materialization with the `git` CLI.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use deployx_core::Result;
use deployx_core::executor::{Materializer, SourceSpec};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{ExecutorError, ExecutorResult};

/// Ref recording the revision a pipeline workspace was first checked out at.
const PINNED_REF: &str = "refs/deployx/pinned";

/// Clones the repository into the workspace on first use and updates it in
/// place afterwards. Build outputs left by earlier steps are kept.
///
/// Without an explicit commit, every step of a pipeline builds the revision
/// the first step cloned, even if the branch moves in between.
pub struct GitMaterializer {
    git: String,
}

impl Default for GitMaterializer {
    fn default() -> Self {
        Self::new()
    }
}

impl GitMaterializer {
    pub fn new() -> Self {
        Self {
            git: "git".to_string(),
        }
    }

    /// Run git and return its trimmed stdout.
    async fn git<I, S>(
        &self,
        operation: &'static str,
        cwd: Option<&Path>,
        args: I,
    ) -> ExecutorResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.git);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let output = command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(operation, "Git command failed");
            return Err(ExecutorError::Git { operation, stderr });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn rev_parse(&self, workspace: &Path, revision: &str) -> ExecutorResult<String> {
        let spec = format!("{}^{{commit}}", revision);
        self.git(
            "rev-parse",
            Some(workspace),
            ["rev-parse", "--verify", spec.as_str()],
        )
        .await
    }

    async fn pinned(&self, workspace: &Path) -> ExecutorResult<Option<String>> {
        match self.rev_parse(workspace, PINNED_REF).await {
            Ok(sha) => Ok(Some(sha)),
            Err(ExecutorError::Git { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn pin_head(&self, workspace: &Path) -> ExecutorResult<()> {
        self.git(
            "update-ref",
            Some(workspace),
            ["update-ref", PINNED_REF, "HEAD"],
        )
        .await?;
        Ok(())
    }

    async fn clone_fresh(&self, source: &SourceSpec, workspace: &Path) -> ExecutorResult<()> {
        if let Some(parent) = workspace.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        info!(url = %source.url, path = %workspace.display(), "Cloning repository");

        let mut args: Vec<&OsStr> = vec![OsStr::new("clone")];
        if let Some(branch) = &source.branch {
            args.extend([OsStr::new("--branch"), OsStr::new(branch)]);
        }
        args.extend([OsStr::new("--"), OsStr::new(&source.url), workspace.as_os_str()]);
        self.git("clone", None, args).await?;

        if let Some(commit) = &source.commit_id {
            let args = ["checkout", "--force", "--detach", commit.as_str()];
            self.git("checkout", Some(workspace), args).await?;
        }
        self.pin_head(workspace).await
    }

    async fn update(&self, source: &SourceSpec, workspace: &Path) -> ExecutorResult<()> {
        debug!(path = %workspace.display(), "Updating existing checkout");
        self.git("fetch", Some(workspace), ["fetch", "--prune", "origin"])
            .await?;

        let target = match (&source.commit_id, self.pinned(workspace).await?) {
            (Some(commit), _) => commit.clone(),
            (None, Some(pinned)) => pinned,
            (None, None) => match &source.branch {
                Some(branch) => format!("origin/{}", branch),
                None => "origin/HEAD".to_string(),
            },
        };
        let target = self.rev_parse(workspace, &target).await?;
        let head = self.rev_parse(workspace, "HEAD").await?;
        if head == target {
            // keep changes earlier steps made to tracked files
            debug!(revision = %target, "Workspace already at revision");
            return Ok(());
        }

        let args = ["checkout", "--force", "--detach", target.as_str()];
        self.git("checkout", Some(workspace), args).await?;
        self.pin_head(workspace).await
    }
}

/// Reject URLs git would parse as an option.
fn validate_url(url: &str) -> ExecutorResult<()> {
    if url.trim().is_empty() || url.starts_with('-') {
        return Err(ExecutorError::InvalidUrl(url.to_string()));
    }
    Ok(())
}

#[async_trait]
impl Materializer for GitMaterializer {
    async fn materialize(&self, source: &SourceSpec, workspace: &Path) -> Result<()> {
        validate_url(&source.url)?;
        if workspace.join(".git").exists() {
            self.update(source, workspace).await?;
        } else {
            self.clone_fresh(source, workspace).await?;
        }
        Ok(())
    }
}
