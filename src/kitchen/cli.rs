//! [`VmDriver`] backed by the `kitchen` command line.

use std::sync::Arc;

use async_trait::async_trait;

use super::{KitchenLogs, KitchenPhase, VmDriver, VmKey};
use crate::error::Result;
use crate::process::{CommandOutput, CommandRunner, CommandSpec};
use crate::secrets::{SecretRef, SecretScope};

/// Drives the VM through `bundle exec kitchen <action> <key>`.
///
/// Cloud credentials are resolved afresh for every invocation and dropped
/// when it returns. Kitchen logs are rotated after every phase but destroy.
pub struct KitchenCli {
    runner: Arc<dyn CommandRunner>,
    command: Vec<String>,
    cloud: Vec<SecretRef>,
    logs: KitchenLogs,
}

impl KitchenCli {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        command: Vec<String>,
        cloud: Vec<SecretRef>,
        logs: KitchenLogs,
    ) -> Self {
        Self {
            runner,
            command,
            cloud,
            logs,
        }
    }

    fn spec(&self, phase: KitchenPhase, key: &VmKey) -> Result<CommandSpec> {
        let spec = CommandSpec::from_argv(&self.command)?
            .arg(phase.action())
            .arg(key.to_string());
        Ok(match phase {
            KitchenPhase::Verify => spec.env("DONT_DOWNLOAD_ARTEFACTS", "1"),
            KitchenPhase::Download => spec.env("ONLY_DOWNLOAD_ARTEFACTS", "1"),
            _ => spec,
        })
    }

    async fn invoke(&self, phase: KitchenPhase, key: &VmKey) -> Result<CommandOutput> {
        let spec = self.spec(phase, key)?;
        let scope = SecretScope::resolve(&self.cloud)?;
        let output = self.runner.run(&spec, &scope).await;

        if phase != KitchenPhase::Destroy {
            if let Err(e) = self.logs.rotate(key, phase) {
                tracing::warn!(
                    phase = phase.log_suffix(),
                    dir = %self.logs.dir().display(),
                    error = %e,
                    "failed to rotate kitchen logs"
                );
            }
        }

        output
    }
}

#[async_trait]
impl VmDriver for KitchenCli {
    async fn create(&self, key: &VmKey) -> Result<CommandOutput> {
        self.invoke(KitchenPhase::Create, key).await
    }

    async fn converge(&self, key: &VmKey) -> Result<CommandOutput> {
        self.invoke(KitchenPhase::Converge, key).await
    }

    async fn verify(&self, key: &VmKey) -> Result<CommandOutput> {
        self.invoke(KitchenPhase::Verify, key).await
    }

    async fn download_artifacts(&self, key: &VmKey) -> Result<CommandOutput> {
        self.invoke(KitchenPhase::Download, key).await
    }

    async fn destroy(&self, key: &VmKey) -> Result<CommandOutput> {
        self.invoke(KitchenPhase::Destroy, key).await
    }

    fn name(&self) -> &str {
        "kitchen"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::SecretSource;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every spec and the secret names bound to it.
    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<(CommandSpec, Vec<String>)>>,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, spec: &CommandSpec, secrets: &SecretScope) -> Result<CommandOutput> {
            let mut names: Vec<String> = secrets.environment().keys().cloned().collect();
            names.sort();
            self.calls.lock().unwrap().push((spec.clone(), names));
            Ok(CommandOutput {
                program: spec.program.clone(),
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
                duration: Duration::ZERO,
            })
        }
    }

    fn driver(runner: Arc<RecordingRunner>, logs: &std::path::Path) -> KitchenCli {
        KitchenCli::new(
            runner,
            vec!["bundle".to_string(), "exec".to_string(), "kitchen".to_string()],
            vec![SecretRef {
                name: "AWS_SECRET_ACCESS_KEY".to_string(),
                source: SecretSource::Direct("s3cr3t".to_string()),
            }],
            KitchenLogs::new(logs),
        )
    }

    #[tokio::test]
    async fn actions_target_the_instance() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let kitchen = driver(runner.clone(), dir.path());
        let key = VmKey::new("py2", "ubuntu-1604");

        kitchen.create(&key).await.unwrap();
        kitchen.converge(&key).await.unwrap();
        kitchen.destroy(&key).await.unwrap();

        let calls = runner.calls.lock().unwrap();
        let lines: Vec<String> = calls.iter().map(|(spec, _)| spec.display()).collect();
        assert_eq!(
            lines,
            vec![
                "bundle exec kitchen create py2-ubuntu-1604",
                "bundle exec kitchen converge py2-ubuntu-1604",
                "bundle exec kitchen destroy py2-ubuntu-1604",
            ]
        );
        assert!(calls
            .iter()
            .all(|(_, secrets)| secrets == &vec!["AWS_SECRET_ACCESS_KEY".to_string()]));
    }

    #[tokio::test]
    async fn verify_and_download_split_artifact_handling() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let kitchen = driver(runner.clone(), dir.path());
        let key = VmKey::new("py3", "centos-7");

        kitchen.verify(&key).await.unwrap();
        kitchen.download_artifacts(&key).await.unwrap();

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].0.args.last().unwrap(), "py3-centos-7");
        assert_eq!(
            calls[0].0.env,
            vec![("DONT_DOWNLOAD_ARTEFACTS".to_string(), "1".to_string())]
        );
        assert_eq!(calls[1].0.args[2], "verify");
        assert_eq!(
            calls[1].0.env,
            vec![("ONLY_DOWNLOAD_ARTEFACTS".to_string(), "1".to_string())]
        );
    }

    #[tokio::test]
    async fn logs_are_rotated_after_converge() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("py2-ubuntu-1604.log"), "converged\n").unwrap();
        let kitchen = driver(Arc::new(RecordingRunner::default()), dir.path());

        kitchen
            .converge(&VmKey::new("py2", "ubuntu-1604"))
            .await
            .unwrap();

        assert!(dir.path().join("py2-ubuntu-1604-converge.log").exists());
    }

    #[tokio::test]
    async fn missing_cloud_secret_fails_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let kitchen = KitchenCli::new(
            runner.clone(),
            vec!["kitchen".to_string()],
            vec![SecretRef::env("KP_TEST_UNSET_CLOUD_SECRET_VAR")],
            KitchenLogs::new(dir.path()),
        );

        let result = kitchen.create(&VmKey::new("py2", "ubuntu-1604")).await;
        assert!(result.is_err());
        assert!(runner.calls.lock().unwrap().is_empty());
    }
}
