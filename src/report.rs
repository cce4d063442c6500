//! Build result and the per-run report.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::kitchen::VmKey;
use crate::stage::{Stage, StageOutcome, StageRecord};

/// Overall result of a run.
///
/// Ordered `Failure < Pending < Success` so "at or better than success" is a
/// comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildResult {
    Failure,
    #[default]
    Pending,
    Success,
}

impl BuildResult {
    pub fn is_success(&self) -> bool {
        *self >= BuildResult::Success
    }

    /// Marks the run failed. Once failed, the result never changes back.
    pub fn fail(&mut self) {
        *self = BuildResult::Failure;
    }

    /// Final value: a run that never failed succeeded.
    pub fn resolve(self) -> Self {
        match self {
            BuildResult::Pending => BuildResult::Success,
            other => other,
        }
    }

    /// Process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

/// Everything a run did, in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub vm_key: String,
    pub result: BuildResult,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub stages: Vec<StageRecord>,
}

impl RunReport {
    pub fn new(
        vm_key: &VmKey,
        result: BuildResult,
        started_at: DateTime<Utc>,
        duration: Duration,
        stages: Vec<StageRecord>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            vm_key: vm_key.to_string(),
            result,
            started_at,
            duration,
            stages,
        }
    }

    /// Number of times `stage` actually ran.
    pub fn executions(&self, stage: Stage) -> usize {
        self.stages
            .iter()
            .filter(|r| r.stage == stage && !matches!(r.outcome, StageOutcome::Skipped(_)))
            .count()
    }

    /// Outcome of the last record for `stage`.
    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .rev()
            .find(|r| r.stage == stage)
            .map(|r| &r.outcome)
    }

    /// Stages in the order they were recorded.
    pub fn stage_order(&self) -> Vec<Stage> {
        self.stages.iter().map(|r| r.stage).collect()
    }

    /// Writes the report as pretty JSON, creating parent directories.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
