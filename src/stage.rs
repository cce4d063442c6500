//! Named pipeline stages and the runner that records them.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::Instrument;

use crate::error::{Error, Result};

/// Every step a run can pass through, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    NotifyPending,
    CheckoutScm,
    SetupBundle,
    CreateVm,
    SshIdentity,
    ConvergeVm,
    RunTests,
    DropSshIdentity,
    DownloadArtifacts,
    ArchiveArtifacts,
    DestroyVm,
    UploadCoverage,
    CleanWorkspace,
    NotifyResult,
}

impl Stage {
    /// Stage name used in logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::NotifyPending => "notify-pending",
            Stage::CheckoutScm => "checkout-scm",
            Stage::SetupBundle => "setup-bundle",
            Stage::CreateVm => "create-vm",
            Stage::SshIdentity => "ssh-identity",
            Stage::ConvergeVm => "converge-vm",
            Stage::RunTests => "run-tests",
            Stage::DropSshIdentity => "drop-ssh-identity",
            Stage::DownloadArtifacts => "download-artifacts",
            Stage::ArchiveArtifacts => "archive-artifacts",
            Stage::DestroyVm => "destroy-vm",
            Stage::UploadCoverage => "upload-coverage",
            Stage::CleanWorkspace => "clean-workspace",
            Stage::NotifyResult => "notify-result",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a stage ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded,
    /// The fault propagated to the pipeline.
    Failed(String),
    /// The stage was cut off by a timeout guard; the fault propagated.
    TimedOut(String),
    /// The fault was logged and swallowed.
    Tolerated(String),
    /// The stage did not run.
    Skipped(String),
}

impl StageOutcome {
    /// Whether this outcome propagated a fault.
    pub fn is_fault(&self) -> bool {
        matches!(self, StageOutcome::Failed(_) | StageOutcome::TimedOut(_))
    }
}

/// One stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub outcome: StageOutcome,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

/// Runs stages and keeps their records in execution order.
#[derive(Debug, Default)]
pub struct StageRunner {
    records: Vec<StageRecord>,
}

impl StageRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` as `stage`, returning its result unchanged.
    pub async fn run<T, F>(&mut self, stage: Stage, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let Timed {
            result,
            started_at,
            duration,
            span,
        } = Timed::run(stage, work).await;
        match result {
            Ok(value) => {
                self.push_success(stage, started_at, duration, &span);
                Ok(value)
            }
            Err(e) => {
                self.push_fault(stage, started_at, duration, &span, &e);
                Err(e)
            }
        }
    }

    /// Runs `work` as `stage`; faults for which `tolerate` returns true are
    /// logged, recorded as tolerated and turned into `Ok(None)`.
    pub async fn run_tolerating<T, F, P>(
        &mut self,
        stage: Stage,
        tolerate: P,
        work: F,
    ) -> Result<Option<T>>
    where
        F: Future<Output = Result<T>>,
        P: Fn(&Error) -> bool,
    {
        let Timed {
            result,
            started_at,
            duration,
            span,
        } = Timed::run(stage, work).await;
        match result {
            Ok(value) => {
                self.push_success(stage, started_at, duration, &span);
                Ok(Some(value))
            }
            Err(e) if tolerate(&e) => {
                tracing::warn!(parent: &span, error = %e, "stage failed, continuing");
                self.records.push(StageRecord {
                    stage,
                    outcome: StageOutcome::Tolerated(e.to_string()),
                    started_at,
                    duration,
                });
                Ok(None)
            }
            Err(e) => {
                self.push_fault(stage, started_at, duration, &span, &e);
                Err(e)
            }
        }
    }

    fn push_success(
        &mut self,
        stage: Stage,
        started_at: DateTime<Utc>,
        duration: Duration,
        span: &tracing::Span,
    ) {
        tracing::info!(parent: span, duration_ms = duration.as_millis() as u64, "stage succeeded");
        self.records.push(StageRecord {
            stage,
            outcome: StageOutcome::Succeeded,
            started_at,
            duration,
        });
    }

    fn push_fault(
        &mut self,
        stage: Stage,
        started_at: DateTime<Utc>,
        duration: Duration,
        span: &tracing::Span,
        error: &Error,
    ) {
        tracing::error!(parent: span, error = %error, "stage failed");
        let outcome = if error.is_timeout() {
            StageOutcome::TimedOut(error.to_string())
        } else {
            StageOutcome::Failed(error.to_string())
        };
        self.records.push(StageRecord {
            stage,
            outcome,
            started_at,
            duration,
        });
    }

    /// Runs a cleanup stage whose fault must not abort the caller.
    pub async fn run_best_effort<T, F>(&mut self, stage: Stage, work: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.run_tolerating(stage, |_| true, work)
            .await
            .unwrap_or_default()
    }

    /// Records that `stage` did not run.
    pub fn skip(&mut self, stage: Stage, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::info!(stage = stage.name(), reason = %reason, "stage skipped");
        self.records.push(StageRecord {
            stage,
            outcome: StageOutcome::Skipped(reason),
            started_at: Utc::now(),
            duration: Duration::ZERO,
        });
    }

    pub fn records(&self) -> &[StageRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<StageRecord> {
        self.records
    }

    /// Number of times `stage` actually ran (skips excluded).
    pub fn executions(&self, stage: Stage) -> usize {
        self.records
            .iter()
            .filter(|r| r.stage == stage && !matches!(r.outcome, StageOutcome::Skipped(_)))
            .count()
    }

    /// Outcome of the most recent record for `stage`.
    pub fn last_outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.records
            .iter()
            .rev()
            .find(|r| r.stage == stage)
            .map(|r| &r.outcome)
    }
}

/// A stage's work awaited inside its span, with timing.
struct Timed<T> {
    result: Result<T>,
    started_at: DateTime<Utc>,
    duration: Duration,
    span: tracing::Span,
}

impl<T> Timed<T> {
    async fn run<F>(stage: Stage, work: F) -> Self
    where
        F: Future<Output = Result<T>>,
    {
        let started_at = Utc::now();
        let start = Instant::now();
        let span = tracing::info_span!("stage", name = stage.name());

        tracing::info!(parent: &span, "stage started");
        let result = work.instrument(span.clone()).await;

        Self {
            result,
            started_at,
            duration: start.elapsed(),
            span,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_are_kebab_case() {
        assert_eq!(Stage::CreateVm.name(), "create-vm");
        assert_eq!(Stage::DownloadArtifacts.to_string(), "download-artifacts");
        assert_eq!(
            serde_json::to_string(&Stage::UploadCoverage).unwrap(),
            "\"upload-coverage\""
        );
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let json = serde_json::to_string(&StageOutcome::Skipped("not full".to_string())).unwrap();
        assert_eq!(json, r#"{"status":"skipped","detail":"not full"}"#);
        assert_eq!(
            serde_json::to_string(&StageOutcome::Succeeded).unwrap(),
            r#"{"status":"succeeded"}"#
        );
    }

    #[tokio::test]
    async fn run_records_success_and_returns_value() {
        let mut runner = StageRunner::new();
        let value = runner.run(Stage::CheckoutScm, async { Ok(5) }).await.unwrap();

        assert_eq!(value, 5);
        assert_eq!(runner.records().len(), 1);
        assert_eq!(runner.last_outcome(Stage::CheckoutScm), Some(&StageOutcome::Succeeded));
    }

    #[tokio::test]
    async fn run_propagates_fault_unchanged() {
        let mut runner = StageRunner::new();
        let err = runner
            .run(Stage::ConvergeVm, async {
                Err::<(), _>(Error::Command {
                    program: "kitchen".to_string(),
                    code: Some(2),
                    stderr: String::new(),
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Command { code: Some(2), .. }));
        assert!(matches!(
            runner.last_outcome(Stage::ConvergeVm),
            Some(StageOutcome::Failed(_))
        ));
    }

    #[tokio::test]
    async fn timeout_faults_are_recorded_as_timed_out() {
        let mut runner = StageRunner::new();
        let _ = runner
            .run(Stage::RunTests, async {
                Err::<(), _>(Error::Timeout {
                    label: "converge-and-test".to_string(),
                    after: Duration::from_secs(1),
                })
            })
            .await;
        assert!(matches!(
            runner.last_outcome(Stage::RunTests),
            Some(StageOutcome::TimedOut(_))
        ));
    }

    #[tokio::test]
    async fn best_effort_swallows_fault() {
        let mut runner = StageRunner::new();
        let value: Option<()> = runner
            .run_best_effort(Stage::UploadCoverage, async {
                Err(Error::Notify("down".to_string()))
            })
            .await;

        assert!(value.is_none());
        assert!(matches!(
            runner.last_outcome(Stage::UploadCoverage),
            Some(StageOutcome::Tolerated(_))
        ));
        assert!(!runner.records()[0].outcome.is_fault());
    }

    #[tokio::test]
    async fn tolerating_predicate_selects_faults() {
        let mut runner = StageRunner::new();
        let result: Result<Option<()>> = runner
            .run_tolerating(
                Stage::ArchiveArtifacts,
                |e| !matches!(e, Error::TestsFailed { .. }),
                async { Err(Error::TestsFailed { failures: 1, errors: 0 }) },
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn tolerated_fault_keeps_timing() {
        let mut runner = StageRunner::new();
        let result: Result<Option<()>> = runner
            .run_tolerating(
                Stage::ArchiveArtifacts,
                |e| matches!(e, Error::Artifact(_)),
                async {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    Err(Error::Artifact("no files matched".to_string()))
                },
            )
            .await;

        assert!(matches!(result, Ok(None)));
        let record = &runner.records()[0];
        assert!(matches!(record.outcome, StageOutcome::Tolerated(ref m) if m.contains("no files matched")));
        assert!(record.duration >= Duration::from_secs(3));
    }

    #[test]
    fn skips_do_not_count_as_executions() {
        let mut runner = StageRunner::new();
        runner.skip(Stage::UploadCoverage, "run_full is false");
        assert_eq!(runner.executions(Stage::UploadCoverage), 0);
        assert_eq!(runner.records().len(), 1);
    }
}
