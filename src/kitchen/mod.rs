//! VM lifecycle driver.
//!
//! The [`VmDriver`] trait is the contract the pipeline needs from the
//! test-kitchen tooling; [`KitchenCli`] implements it by shelling out to
//! `bundle exec kitchen`.

mod cli;
mod logs;

pub use cli::KitchenCli;
pub use logs::KitchenLogs;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::process::CommandOutput;

/// Kitchen instance name, `{suite}-{platform}`.
///
/// Globally shared: two runs with the same key must not overlap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmKey {
    pub suite: String,
    pub platform: String,
}

impl VmKey {
    pub fn new(suite: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            platform: platform.into(),
        }
    }
}

impl fmt::Display for VmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.suite, self.platform)
    }
}

/// Kitchen actions, also used to name rotated log files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KitchenPhase {
    Create,
    Converge,
    Verify,
    Download,
    Destroy,
}

impl KitchenPhase {
    /// The kitchen subcommand that implements this phase.
    pub fn action(&self) -> &'static str {
        match self {
            KitchenPhase::Create => "create",
            KitchenPhase::Converge => "converge",
            KitchenPhase::Verify | KitchenPhase::Download => "verify",
            KitchenPhase::Destroy => "destroy",
        }
    }

    /// Suffix of the log files kept for this phase.
    pub fn log_suffix(&self) -> &'static str {
        match self {
            KitchenPhase::Create => "create",
            KitchenPhase::Converge => "converge",
            KitchenPhase::Verify => "verify",
            KitchenPhase::Download => "download",
            KitchenPhase::Destroy => "destroy",
        }
    }
}

/// Operations on the ephemeral test VM.
///
/// Each call returns the invocation's output whether or not it exited with
/// zero; callers decide what a non-zero status means for their stage.
#[async_trait]
pub trait VmDriver: Send + Sync {
    /// Provisions the VM.
    async fn create(&self, key: &VmKey) -> Result<CommandOutput>;

    /// Applies configuration management to the VM.
    async fn converge(&self, key: &VmKey) -> Result<CommandOutput>;

    /// Runs the test suite without fetching artifacts.
    async fn verify(&self, key: &VmKey) -> Result<CommandOutput>;

    /// Fetches test artifacts from the VM without running tests.
    async fn download_artifacts(&self, key: &VmKey) -> Result<CommandOutput>;

    /// Tears the VM down.
    async fn destroy(&self, key: &VmKey) -> Result<CommandOutput>;

    /// Returns the name of this driver.
    fn name(&self) -> &str;
}
