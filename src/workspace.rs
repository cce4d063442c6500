//! Workspace preparation and cleanup.
//!
//! Source checkout itself belongs to the trigger; this module fetches the
//! target branch next to it, installs the kitchen bundle, loads the SSH
//! identity used to reach the VM and removes scratch directories.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::RunConfig;
use crate::error::Result;
use crate::process::{CommandRunner, CommandSpec};
use crate::secrets::SecretScope;

/// Operations on the job's working copy.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Removes leftovers of a previous run and fetches the target branch.
    async fn checkout(&self) -> Result<()>;

    /// Installs the Ruby bundle kitchen runs from.
    async fn setup_bundle(&self) -> Result<()>;

    /// Adds the VM access key to the SSH agent.
    async fn load_ssh_identity(&self) -> Result<()>;

    /// Removes the key added by [`Workspace::load_ssh_identity`].
    async fn unload_ssh_identity(&self) -> Result<()>;

    /// Removes scratch directories.
    async fn clean(&self) -> Result<()>;
}

/// A workspace on the local filesystem, driven through external commands.
pub struct LocalWorkspace {
    runner: Arc<dyn CommandRunner>,
    root: PathBuf,
    git_remote: String,
    target_branch: String,
    bundle_with: Vec<String>,
    bundle_without: Vec<String>,
    ssh_key: PathBuf,
    scratch_dirs: Vec<PathBuf>,
}

impl LocalWorkspace {
    pub fn new(runner: Arc<dyn CommandRunner>, root: impl Into<PathBuf>, config: &RunConfig) -> Self {
        Self {
            runner,
            root: root.into(),
            git_remote: config.workspace.git_remote.clone(),
            target_branch: config.job.target_branch.clone(),
            bundle_with: config.kitchen.bundle_with.clone(),
            bundle_without: config.kitchen.bundle_without.clone(),
            ssh_key: config.secrets.ssh_key.clone(),
            scratch_dirs: config.workspace.scratch_dirs.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn fetch_spec(&self) -> CommandSpec {
        CommandSpec::new("git").args([
            "fetch".to_string(),
            "--no-tags".to_string(),
            self.git_remote.clone(),
            format!(
                "+refs/heads/{0}:refs/remotes/origin/{0}",
                self.target_branch
            ),
        ])
    }

    fn bundle_spec(&self) -> CommandSpec {
        let mut spec = CommandSpec::new("bundle").arg("install");
        if !self.bundle_with.is_empty() {
            spec = spec.arg("--with").args(self.bundle_with.iter().cloned());
        }
        if !self.bundle_without.is_empty() {
            spec = spec.arg("--without").args(self.bundle_without.iter().cloned());
        }
        spec
    }

    fn remove_scratch_dirs(&self) -> Result<()> {
        for dir in &self.scratch_dirs {
            let path = self.root.join(dir);
            match std::fs::remove_dir_all(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed scratch directory"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Workspace for LocalWorkspace {
    async fn checkout(&self) -> Result<()> {
        if let Err(e) = self.remove_scratch_dirs() {
            tracing::warn!(error = %e, "failed to clean workspace before checkout");
        }
        self.runner
            .run(&self.fetch_spec(), &SecretScope::empty())
            .await?
            .into_result()?;
        Ok(())
    }

    async fn setup_bundle(&self) -> Result<()> {
        self.runner
            .run(&self.bundle_spec(), &SecretScope::empty())
            .await?
            .into_result()?;
        Ok(())
    }

    async fn load_ssh_identity(&self) -> Result<()> {
        let key = expand_home(&self.ssh_key);
        let spec = CommandSpec::new("ssh-add").arg(key.display().to_string());
        self.runner
            .run(&spec, &SecretScope::empty())
            .await?
            .into_result()?;
        Ok(())
    }

    async fn unload_ssh_identity(&self) -> Result<()> {
        let key = expand_home(&self.ssh_key);
        let spec = CommandSpec::new("ssh-add")
            .arg("-d")
            .arg(key.display().to_string());
        self.runner
            .run(&spec, &SecretScope::empty())
            .await?
            .into_result()?;
        Ok(())
    }

    async fn clean(&self) -> Result<()> {
        self.remove_scratch_dirs()
    }
}

/// Expands a leading `~/` using `$HOME`.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}
