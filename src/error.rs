//! Error types for the kitchen pipeline.

use std::time::Duration;

use thiserror::Error;

use crate::secrets::SecretError;

/// Top-level error type for pipeline operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error while touching the workspace.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An external program could not be started.
    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    /// An external program ran but exited unsuccessfully.
    #[error("{program} exited with status {}: {stderr}", code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// A guarded block did not finish in time.
    #[error("{label} timed out after {after:?}")]
    Timeout { label: String, after: Duration },

    /// Every attempt of a retried block failed.
    #[error("{label} failed after {attempts} attempts: {last}")]
    RetryExhausted {
        label: String,
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    /// A secret handle could not be resolved.
    #[error(transparent)]
    Secret(#[from] SecretError),

    /// Archiving or publishing artifacts failed.
    #[error("artifact error: {0}")]
    Artifact(String),

    /// Published test results contain failures.
    #[error("test results report {failures} failures and {errors} errors")]
    TestsFailed { failures: u64, errors: u64 },

    /// Posting a status or chat message failed.
    #[error("notification failed: {0}")]
    Notify(String),
}

impl Error {
    /// Returns true if this fault came from a timeout guard.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::RetryExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
