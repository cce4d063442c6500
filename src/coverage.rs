//! Coverage upload.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::process::{CommandRunner, CommandSpec};
use crate::secrets::{SecretRef, SecretScope};

/// One coverage upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageUpload {
    pub working_dir: PathBuf,
    pub report_path: PathBuf,
    /// Flag label, e.g. `ubuntu1604,py2`.
    pub flags: String,
}

/// Whether an upload should happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverageGate {
    Upload,
    SkipNotFull,
    SkipMissingReport,
}

impl CoverageGate {
    /// Uploads only happen for full runs that produced a report.
    pub fn decide(run_full: bool, report: &Path) -> Self {
        if !run_full {
            CoverageGate::SkipNotFull
        } else if !report.is_file() {
            CoverageGate::SkipMissingReport
        } else {
            CoverageGate::Upload
        }
    }

    pub fn skip_reason(&self) -> Option<&'static str> {
        match self {
            CoverageGate::Upload => None,
            CoverageGate::SkipNotFull => Some("not a full run"),
            CoverageGate::SkipMissingReport => Some("no coverage report"),
        }
    }
}

/// Sends a coverage report to the coverage service.
#[async_trait]
pub trait CoverageUploader: Send + Sync {
    async fn upload(&self, request: &CoverageUpload) -> Result<()>;
}

/// Uploads through the `codecov` command line uploader.
pub struct CodecovUploader {
    runner: Arc<dyn CommandRunner>,
    program: String,
    token: SecretRef,
}

impl CodecovUploader {
    pub fn new(runner: Arc<dyn CommandRunner>, token: SecretRef) -> Self {
        Self {
            runner,
            program: "codecov".to_string(),
            token,
        }
    }

    /// Overrides the uploader binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn spec(&self, request: &CoverageUpload) -> CommandSpec {
        let report_dir = request
            .report_path
            .parent()
            .unwrap_or_else(|| Path::new("."));
        CommandSpec::new(self.program.clone())
            .arg("-R")
            .arg(request.working_dir.display().to_string())
            .arg("-s")
            .arg(report_dir.display().to_string())
            .arg("-F")
            .arg(request.flags.clone())
            .current_dir(request.working_dir.clone())
    }
}

#[async_trait]
impl CoverageUploader for CodecovUploader {
    async fn upload(&self, request: &CoverageUpload) -> Result<()> {
        let scope = SecretScope::resolve(std::slice::from_ref(&self.token))?;
        self.runner
            .run(&self.spec(request), &scope)
            .await?
            .into_result()?;
        tracing::info!(flags = %request.flags, "coverage uploaded");
        Ok(())
    }
}
