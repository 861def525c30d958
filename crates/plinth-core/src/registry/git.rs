//! Git-hosted registry.
//!
//! A git repository whose `packages/` subtree uses the local registry layout.
//! The checkout is cloned on first use and only refreshed by an explicit
//! [`GitRegistry::update`]; reads never touch the network after that.

use async_trait::async_trait;
use plinth_schema::{PackageIdentity, PackageMetadata, PackageSummary, TagName, Version};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::Mutex;

use super::{ArchiveHandle, LocalRegistry, Registry};
use crate::error::{Error, Result};

/// A shallow working copy of one branch of a remote repository.
#[derive(Debug)]
pub struct GitCheckout {
    url: String,
    branch: String,
    dir: PathBuf,
    ready: Mutex<bool>,
}

impl GitCheckout {
    /// Checkout of `branch` from `url`, kept in `dir`. Nothing is cloned yet.
    pub fn new(url: impl Into<String>, branch: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            branch: branch.into(),
            dir: dir.into(),
            ready: Mutex::new(false),
        }
    }

    /// Working tree location.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Clone URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn git(&self, args: &[&str], cwd: Option<&Path>) -> Result<String> {
        let git = which::which("git").map_err(|e| Error::Git(format!("git executable not found: {e}")))?;
        let mut cmd = Command::new(git);
        cmd.args(args).env("GIT_TERMINAL_PROMPT", "0");
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        tracing::debug!(?args, "running git");
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(Error::Git(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Clone the branch if no checkout exists yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Git`] if git is missing or the clone fails.
    pub async fn ensure(&self) -> Result<()> {
        let mut ready = self.ready.lock().await;
        if *ready {
            return Ok(());
        }
        if !tokio::fs::try_exists(self.dir.join(".git")).await.unwrap_or(false) {
            if let Some(parent) = self.dir.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let dir = self.dir.to_string_lossy();
            self.git(
                &["clone", "--depth", "1", "--branch", &self.branch, &self.url, &dir],
                None,
            )
            .await?;
            tracing::info!(url = %self.url, branch = %self.branch, "cloned source");
        }
        *ready = true;
        Ok(())
    }

    /// Fetch the branch tip and reset the checkout to it. Returns the new head.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Git`] if any git step fails.
    pub async fn update(&self) -> Result<String> {
        self.ensure().await?;
        let _ready = self.ready.lock().await;
        self.git(&["fetch", "--depth", "1", "origin", &self.branch], Some(&self.dir))
            .await?;
        self.git(&["reset", "--hard", "FETCH_HEAD"], Some(&self.dir)).await?;
        self.git(&["rev-parse", "HEAD"], Some(&self.dir)).await
    }

    /// Commit currently checked out.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Git`] if the checkout cannot be read.
    pub async fn head(&self) -> Result<String> {
        self.ensure().await?;
        self.git(&["rev-parse", "HEAD"], Some(&self.dir)).await
    }

    /// Commit at the tip of the remote branch, without fetching.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Git`] if the remote cannot be listed or lacks the branch.
    pub async fn remote_head(&self) -> Result<String> {
        let reference = format!("refs/heads/{}", self.branch);
        let listing = self.git(&["ls-remote", &self.url, &reference], None).await?;
        listing
            .split_whitespace()
            .next()
            .map(str::to_string)
            .ok_or_else(|| Error::Git(format!("{} has no branch {}", self.url, self.branch)))
    }
}

/// Read-only registry served from a git checkout.
#[derive(Debug)]
pub struct GitRegistry {
    name: String,
    checkout: GitCheckout,
    index: LocalRegistry,
}

impl GitRegistry {
    /// `subtree` is the directory inside the repository holding the registry layout.
    pub fn new(name: impl Into<String>, checkout: GitCheckout, subtree: impl AsRef<Path>) -> Self {
        let name = name.into();
        let index = LocalRegistry::new(name.clone(), checkout.dir().join(subtree));
        Self {
            name,
            checkout,
            index,
        }
    }

    /// Pull the latest registry contents. Returns the new head commit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Git`] if fetching fails.
    pub async fn update(&self) -> Result<String> {
        let head = self.checkout.update().await?;
        tracing::info!(registry = %self.name, %head, "updated");
        Ok(head)
    }
}

#[async_trait]
impl Registry for GitRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, query: &str) -> Result<Vec<PackageSummary>> {
        self.checkout.ensure().await?;
        self.index.search(query).await
    }

    async fn get_metadata(&self, identity: &PackageIdentity) -> Result<PackageMetadata> {
        self.checkout.ensure().await?;
        self.index.get_metadata(identity).await
    }

    async fn resolve_tag(&self, identity: &PackageIdentity, tag: &TagName) -> Result<Version> {
        self.checkout.ensure().await?;
        self.index.resolve_tag(identity, tag).await
    }

    async fn fetch_archive(
        &self,
        identity: &PackageIdentity,
        version: &Version,
        dest: &Path,
    ) -> Result<ArchiveHandle> {
        self.checkout.ensure().await?;
        self.index.fetch_archive(identity, version, dest).await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::process::Command;

    /// Run git synchronously in `dir`, panicking on failure.
    pub(crate) fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(["-c", "user.name=plinth", "-c", "user.email=plinth@example.com"])
            .args(["-c", "init.defaultBranch=main", "-c", "commit.gpgsign=false"])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&output.stderr));
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Initialise a repository on `main` and commit everything in it.
    pub(crate) fn commit_all(dir: &Path, message: &str) -> String {
        if !dir.join(".git").exists() {
            git(dir, &["init", "--quiet"]);
            git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        }
        git(dir, &["add", "--all"]);
        git(dir, &["commit", "--quiet", "--allow-empty", "-m", message]);
        git(dir, &["rev-parse", "HEAD"])
    }
}
