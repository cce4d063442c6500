//! The run state machine.
//!
//! A run walks through a fixed list of phases. A fault in a phase marks the
//! build failed and picks the next phase from the transition table, which
//! never skips VM destroy once creation was attempted and always ends with
//! workspace cleanup and notification.
//!
//! ```text
//! PREPARE ──ok──> CREATE ──ok──> CONVERGE_TEST ──> ARTIFACTS ──> DESTROY ──> COVERAGE ──> FINALIZE
//!    │               └──fault──────────────────────────────────────^                       ^
//!    └──fault──────────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::Instrument;

use crate::artifacts::{ArtifactStore, JUnitSummary, LocalArtifactStore};
use crate::config::{RunConfig, RunParameters};
use crate::coverage::{CodecovUploader, CoverageGate, CoverageUpload, CoverageUploader};
use crate::environment::EnvironmentBindings;
use crate::error::{Error, Result};
use crate::kitchen::{KitchenCli, KitchenLogs, VmDriver, VmKey};
use crate::notify::{GhStatusNotifier, Notifier, SlackNotifier};
use crate::process::{CommandRunner, ProcessRunner};
use crate::report::{BuildResult, RunReport};
use crate::retry::retry;
use crate::stage::{Stage, StageRunner};
use crate::timeout::{with_timeout, Deadline};
use crate::workspace::{LocalWorkspace, Workspace};

/// Phases of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prepare,
    Create,
    ConvergeTest,
    Artifacts,
    Destroy,
    Coverage,
    Finalize,
    Done,
}

impl Phase {
    /// The phase that follows this one, given whether it faulted.
    pub fn next(self, faulted: bool) -> Phase {
        match (self, faulted) {
            (Phase::Prepare, true) => Phase::Finalize,
            (Phase::Prepare, false) => Phase::Create,
            (Phase::Create, true) => Phase::Destroy,
            (Phase::Create, false) => Phase::ConvergeTest,
            (Phase::ConvergeTest, _) => Phase::Artifacts,
            (Phase::Artifacts, _) => Phase::Destroy,
            (Phase::Destroy, _) => Phase::Coverage,
            (Phase::Coverage, _) => Phase::Finalize,
            (Phase::Finalize, _) | (Phase::Done, _) => Phase::Done,
        }
    }

    /// Stages that belong to this phase.
    pub fn stages(self) -> &'static [Stage] {
        match self {
            Phase::Prepare => &[Stage::CheckoutScm, Stage::SetupBundle],
            Phase::Create => &[Stage::CreateVm],
            Phase::ConvergeTest => &[
                Stage::SshIdentity,
                Stage::ConvergeVm,
                Stage::RunTests,
                Stage::DropSshIdentity,
            ],
            Phase::Artifacts => &[Stage::DownloadArtifacts, Stage::ArchiveArtifacts],
            Phase::Destroy => &[Stage::DestroyVm],
            Phase::Coverage => &[Stage::UploadCoverage],
            Phase::Finalize => &[Stage::CleanWorkspace, Stage::NotifyResult],
            Phase::Done => &[],
        }
    }

    /// Phases passed over when moving from `self` straight to `target`.
    pub fn skipped_until(self, target: Phase) -> Vec<Phase> {
        let mut skipped = Vec::new();
        let mut phase = self.next(false);
        while phase != target && phase != Phase::Done {
            skipped.push(phase);
            phase = phase.next(false);
        }
        skipped
    }
}

/// External collaborators a run delegates to.
pub struct Collaborators {
    pub workspace: Box<dyn Workspace>,
    pub driver: Box<dyn VmDriver>,
    pub artifacts: Box<dyn ArtifactStore>,
    pub coverage: Box<dyn CoverageUploader>,
    pub notifier: Notifier,
}

impl Collaborators {
    /// Wires the command-line tools and webhook used on a real executor.
    pub fn production(
        config: &RunConfig,
        params: &RunParameters,
        root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let root = root.into();
        let bindings = Arc::new(EnvironmentBindings::from_config(config, params));
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new(bindings, root.clone()));

        let status = GhStatusNotifier::new(
            runner.clone(),
            config.notify.gh_program.clone(),
            config.notify.github_repo.clone(),
            params.commit_sha.clone(),
            config.secrets.github_token.clone(),
        );
        let chat = SlackNotifier::new(config.secrets.chat_webhook.clone())?;

        Ok(Self {
            workspace: Box::new(LocalWorkspace::new(runner.clone(), root.clone(), config)),
            driver: Box::new(KitchenCli::new(
                runner.clone(),
                config.kitchen.command.clone(),
                config.secrets.cloud.clone(),
                KitchenLogs::new(root.join(&config.kitchen.logs_dir)),
            )),
            artifacts: Box::new(LocalArtifactStore::new(root, &config.artifacts.archive_dir)),
            coverage: Box::new(CodecovUploader::new(
                runner,
                config.secrets.codecov_token.clone(),
            )),
            notifier: Notifier::new(Box::new(status), Box::new(chat), config, params),
        })
    }
}

/// One kitchen job run.
pub struct Pipeline {
    config: RunConfig,
    params: RunParameters,
    root: PathBuf,
    key: VmKey,
    parts: Collaborators,
}

impl Pipeline {
    pub fn new(
        config: RunConfig,
        params: RunParameters,
        root: impl Into<PathBuf>,
        parts: Collaborators,
    ) -> Self {
        let key = config.vm_key();
        Self {
            config,
            params,
            root: root.into(),
            key,
            parts,
        }
    }

    pub fn key(&self) -> &VmKey {
        &self.key
    }

    /// Runs every phase and returns the report. Never fails: faults end up
    /// in the report's result and stage records.
    pub async fn run(&self) -> RunReport {
        let span = tracing::info_span!("pipeline", key = %self.key);
        self.run_phases().instrument(span).await
    }

    async fn run_phases(&self) -> RunReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let deadline = Deadline::after(self.config.global_timeout());
        let mut stages = StageRunner::new();
        let mut result = BuildResult::default();

        tracing::info!(
            testrun_timeout_secs = self.config.testrun_timeout().as_secs(),
            global_timeout_secs = deadline.budget().as_secs(),
            run_full = self.params.run_full,
            "pipeline started"
        );

        if self.parts.notifier.posts_statuses() {
            stages
                .run_best_effort(Stage::NotifyPending, self.parts.notifier.pending())
                .await;
        } else {
            stages.skip(Stage::NotifyPending, "not a PR runner");
        }

        let mut phase = Phase::Prepare;
        while phase != Phase::Done {
            tracing::debug!(?phase, "entering phase");
            let outcome = match phase {
                Phase::Prepare => self.prepare(&mut stages, &deadline).await,
                Phase::Create => self.create(&mut stages, &deadline).await,
                Phase::ConvergeTest => self.converge_test(&mut stages, &deadline).await,
                Phase::Artifacts => self.collect_artifacts(&mut stages, &deadline).await,
                Phase::Destroy => self.destroy(&mut stages).await,
                Phase::Coverage => {
                    self.upload_coverage(&mut stages).await;
                    Ok(())
                }
                Phase::Finalize => {
                    result = result.resolve();
                    self.finalize(&mut stages, result).await;
                    Ok(())
                }
                Phase::Done => Ok(()),
            };

            let faulted = outcome.is_err();
            if let Err(e) = outcome {
                tracing::error!(?phase, error = %e, "phase failed");
                result.fail();
            }

            let next = phase.next(faulted);
            for skipped in phase.skipped_until(next) {
                for stage in skipped.stages() {
                    stages.skip(*stage, format!("{:?} phase failed", phase));
                }
            }
            phase = next;
        }

        let report = RunReport::new(
            &self.key,
            result,
            started_at,
            start.elapsed(),
            stages.into_records(),
        );
        tracing::info!(
            result = ?report.result,
            duration_secs = report.duration.as_secs(),
            "pipeline finished"
        );
        report
    }

    async fn prepare(&self, stages: &mut StageRunner, deadline: &Deadline) -> Result<()> {
        let workspace = self.parts.workspace.as_ref();
        let checkout = stages
            .run(
                Stage::CheckoutScm,
                deadline.guard(Stage::CheckoutScm.name(), workspace.checkout()),
            )
            .await;
        if let Err(e) = checkout {
            stages.skip(Stage::SetupBundle, "checkout failed");
            return Err(e);
        }
        stages
            .run(
                Stage::SetupBundle,
                deadline.guard(Stage::SetupBundle.name(), workspace.setup_bundle()),
            )
            .await
    }

    async fn create(&self, stages: &mut StageRunner, deadline: &Deadline) -> Result<()> {
        let driver = self.parts.driver.as_ref();
        let key = &self.key;
        let policy = self.config.retry_policy();
        let label = Stage::CreateVm.name();

        let attempts = retry(&policy, label, move |attempt| async move {
            tracing::info!(attempt, driver = driver.name(), "creating VM");
            driver.create(key).await?.into_result().map(|_| ())
        });
        stages
            .run(Stage::CreateVm, deadline.guard(label, attempts))
            .await
    }

    async fn converge_test(&self, stages: &mut StageRunner, deadline: &Deadline) -> Result<()> {
        let testrun = Deadline::after(self.config.testrun_timeout());
        let outcome = self.converge_test_steps(stages, deadline, &testrun).await;

        // The identity leaves the agent on every exit path once loading was tried.
        if stages.executions(Stage::SshIdentity) > 0 {
            stages
                .run_best_effort(
                    Stage::DropSshIdentity,
                    with_timeout(
                        self.config.finalizer_timeout(),
                        Stage::DropSshIdentity.name(),
                        self.parts.workspace.unload_ssh_identity(),
                    ),
                )
                .await;
        }

        if outcome.is_err() {
            for stage in Phase::ConvergeTest.stages() {
                if stages.last_outcome(*stage).is_none() {
                    stages.skip(*stage, "an earlier stage failed");
                }
            }
        }
        outcome
    }

    async fn converge_test_steps(
        &self,
        stages: &mut StageRunner,
        deadline: &Deadline,
        testrun: &Deadline,
    ) -> Result<()> {
        let driver = self.parts.driver.as_ref();
        let key = &self.key;

        stages
            .run(
                Stage::SshIdentity,
                deadline.guard(
                    "pipeline",
                    testrun.guard("converge-and-test", self.parts.workspace.load_ssh_identity()),
                ),
            )
            .await?;

        stages
            .run(
                Stage::ConvergeVm,
                deadline.guard(
                    "pipeline",
                    testrun.guard("converge-and-test", async move {
                        driver.converge(key).await?.into_result().map(|_| ())
                    }),
                ),
            )
            .await?;

        stages
            .run(
                Stage::RunTests,
                deadline.guard(
                    "pipeline",
                    testrun.guard("converge-and-test", async move {
                        driver.verify(key).await?.into_result().map(|_| ())
                    }),
                ),
            )
            .await
    }

    async fn collect_artifacts(&self, stages: &mut StageRunner, deadline: &Deadline) -> Result<()> {
        let driver = self.parts.driver.as_ref();
        let key = &self.key;

        stages
            .run_best_effort(
                Stage::DownloadArtifacts,
                deadline.guard(Stage::DownloadArtifacts.name(), async move {
                    driver.download_artifacts(key).await?.into_result().map(|_| ())
                }),
            )
            .await;

        let artifacts = &self.config.artifacts;
        let strict = artifacts.fail_on_publish_error;
        let store = self.parts.artifacts.as_ref();
        let publish = async move {
            store.archive(&artifacts.patterns).await?;
            let summary = store.publish_test_results(&artifacts.junit_pattern).await?;
            check_test_results(summary)
        };

        stages
            .run_tolerating(
                Stage::ArchiveArtifacts,
                |e| !strict && !e.is_timeout() && !matches!(e, Error::TestsFailed { .. }),
                deadline.guard(Stage::ArchiveArtifacts.name(), publish),
            )
            .await
            .map(|_| ())
    }

    async fn destroy(&self, stages: &mut StageRunner) -> Result<()> {
        let driver = self.parts.driver.as_ref();
        let key = &self.key;
        stages
            .run(
                Stage::DestroyVm,
                with_timeout(
                    self.config.destroy_timeout(),
                    Stage::DestroyVm.name(),
                    async move { driver.destroy(key).await?.into_result().map(|_| ()) },
                ),
            )
            .await
    }

    async fn upload_coverage(&self, stages: &mut StageRunner) {
        let report_path = self.root.join(&self.config.artifacts.coverage_report);
        let gate = CoverageGate::decide(self.params.run_full, &report_path);
        if let Some(reason) = gate.skip_reason() {
            stages.skip(Stage::UploadCoverage, reason);
            return;
        }

        let request = CoverageUpload {
            working_dir: self.root.clone(),
            report_path,
            flags: self.config.coverage_flags(),
        };
        stages
            .run_best_effort(
                Stage::UploadCoverage,
                with_timeout(
                    self.config.finalizer_timeout(),
                    Stage::UploadCoverage.name(),
                    self.parts.coverage.upload(&request),
                ),
            )
            .await;
    }

    async fn finalize(&self, stages: &mut StageRunner, result: BuildResult) {
        stages
            .run_best_effort(
                Stage::CleanWorkspace,
                with_timeout(
                    self.config.finalizer_timeout(),
                    Stage::CleanWorkspace.name(),
                    self.parts.workspace.clean(),
                ),
            )
            .await;
        stages
            .run_best_effort(Stage::NotifyResult, self.parts.notifier.finish(result))
            .await;
    }
}

/// Failed or errored test cases fail the build.
fn check_test_results(summary: JUnitSummary) -> Result<JUnitSummary> {
    if summary.has_failures() {
        Err(Error::TestsFailed {
            failures: summary.failures,
            errors: summary.errors,
        })
    } else {
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_visits_every_phase_in_order() {
        let mut phase = Phase::Prepare;
        let mut visited = vec![phase];
        while phase != Phase::Done {
            phase = phase.next(false);
            visited.push(phase);
        }
        assert_eq!(
            visited,
            vec![
                Phase::Prepare,
                Phase::Create,
                Phase::ConvergeTest,
                Phase::Artifacts,
                Phase::Destroy,
                Phase::Coverage,
                Phase::Finalize,
                Phase::Done,
            ]
        );
    }

    #[test]
    fn prepare_fault_goes_straight_to_finalize() {
        assert_eq!(Phase::Prepare.next(true), Phase::Finalize);
        assert_eq!(
            Phase::Prepare.skipped_until(Phase::Finalize),
            vec![
                Phase::Create,
                Phase::ConvergeTest,
                Phase::Artifacts,
                Phase::Destroy,
                Phase::Coverage,
            ]
        );
    }

    #[test]
    fn create_fault_still_destroys() {
        assert_eq!(Phase::Create.next(true), Phase::Destroy);
        assert_eq!(
            Phase::Create.skipped_until(Phase::Destroy),
            vec![Phase::ConvergeTest, Phase::Artifacts]
        );
    }

    #[test]
    fn later_faults_continue_the_cascade() {
        for phase in [Phase::ConvergeTest, Phase::Artifacts, Phase::Destroy, Phase::Coverage] {
            assert_eq!(phase.next(true), phase.next(false));
            assert!(phase.skipped_until(phase.next(true)).is_empty());
        }
    }

    #[test]
    fn every_stage_belongs_to_one_phase() {
        let mut all: Vec<Stage> = [
            Phase::Prepare,
            Phase::Create,
            Phase::ConvergeTest,
            Phase::Artifacts,
            Phase::Destroy,
            Phase::Coverage,
            Phase::Finalize,
        ]
        .iter()
        .flat_map(|p| p.stages().iter().copied())
        .collect();
        let total = all.len();
        all.dedup();
        assert_eq!(all.len(), total);
        assert!(!all.contains(&Stage::NotifyPending));
    }

    #[test]
    fn test_failures_become_a_fault() {
        let clean = JUnitSummary {
            files: 1,
            tests: 10,
            failures: 0,
            errors: 0,
        };
        assert!(check_test_results(clean).is_ok());

        let failing = JUnitSummary { errors: 2, ..clean };
        assert!(matches!(
            check_test_results(failing),
            Err(Error::TestsFailed { failures: 0, errors: 2 })
        ));
    }
}
