//! Kitchen Pipeline - CI executor for ephemeral test-kitchen VM jobs
//!
//! This library sequences one kitchen job: workspace preparation, VM creation
//! with retry, converge and test under nested timeouts, artifact collection,
//! guaranteed VM teardown, coverage upload and result notification. Every
//! substantive action is delegated to an external command behind a trait.

pub mod artifacts;
pub mod config;
pub mod coverage;
pub mod environment;
pub mod error;
pub mod kitchen;
pub mod notify;
pub mod pipeline;
pub mod process;
pub mod report;
pub mod retry;
pub mod secrets;
pub mod stage;
pub mod timeout;
pub mod workspace;

pub use error::{Error, Result};

pub use artifacts::{ArtifactStore, JUnitSummary, LocalArtifactStore};
pub use config::{RunConfig, RunParameters, Validate, ValidationResult};
pub use coverage::{CodecovUploader, CoverageGate, CoverageUpload, CoverageUploader};
pub use environment::EnvironmentBindings;
pub use kitchen::{KitchenCli, KitchenLogs, KitchenPhase, VmDriver, VmKey};
pub use notify::{
    ChatNotifier, CommitStatus, GhStatusNotifier, Notifier, SlackNotifier, StatusNotifier,
};
pub use pipeline::{Collaborators, Phase, Pipeline};
pub use process::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use report::{BuildResult, RunReport};
pub use retry::{retry, RetryPolicy};
pub use secrets::{SecretError, SecretRef, SecretScope, SecretSource};
pub use stage::{Stage, StageOutcome, StageRecord, StageRunner};
pub use timeout::{with_timeout, Deadline};
pub use workspace::{LocalWorkspace, Workspace};
