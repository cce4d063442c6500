//! Commit statuses through the GitHub CLI.

use std::sync::Arc;

use async_trait::async_trait;

use super::{CommitStatus, StatusNotifier};
use crate::error::{Error, Result};
use crate::process::{CommandRunner, CommandSpec};
use crate::secrets::{SecretRef, SecretScope};

/// Posts statuses with `gh api repos/{repo}/statuses/{sha}`.
pub struct GhStatusNotifier {
    runner: Arc<dyn CommandRunner>,
    program: String,
    repo: String,
    commit: Option<String>,
    token: SecretRef,
}

impl GhStatusNotifier {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        program: impl Into<String>,
        repo: impl Into<String>,
        commit: Option<String>,
        token: SecretRef,
    ) -> Self {
        Self {
            runner,
            program: program.into(),
            repo: repo.into(),
            commit,
            token,
        }
    }

    fn spec(&self, sha: &str, context: &str, status: CommitStatus, description: &str) -> CommandSpec {
        CommandSpec::new(self.program.clone()).args([
            "api".to_string(),
            format!("repos/{}/statuses/{}", self.repo, sha),
            "-f".to_string(),
            format!("state={}", status.as_str()),
            "-f".to_string(),
            format!("context={}", context),
            "-f".to_string(),
            format!("description={}", description),
        ])
    }
}

#[async_trait]
impl StatusNotifier for GhStatusNotifier {
    async fn notify(&self, context: &str, status: CommitStatus, description: &str) -> Result<()> {
        let sha = self
            .commit
            .as_deref()
            .ok_or_else(|| Error::Notify("no commit to attach the status to".to_string()))?;

        let scope = SecretScope::resolve(std::slice::from_ref(&self.token))?;
        self.runner
            .run(&self.spec(sha, context, status, description), &scope)
            .await?
            .into_result()
            .map_err(|e| Error::Notify(format!("posting {} status: {}", status.as_str(), e)))?;

        tracing::info!(context, state = status.as_str(), sha, "commit status posted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandOutput;
    use crate::secrets::SecretSource;
    use std::sync::Mutex;
    use std::time::Duration;

    struct GhFake {
        code: i32,
        calls: Mutex<Vec<(Vec<String>, bool)>>,
    }

    #[async_trait]
    impl CommandRunner for GhFake {
        async fn run(&self, spec: &CommandSpec, secrets: &SecretScope) -> Result<CommandOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((spec.args.clone(), secrets.get("GH_TOKEN").is_some()));
            Ok(CommandOutput {
                program: spec.program.clone(),
                code: Some(self.code),
                stdout: String::new(),
                stderr: "HTTP 422\n".to_string(),
                duration: Duration::ZERO,
            })
        }
    }

    fn token() -> SecretRef {
        SecretRef {
            name: "GH_TOKEN".to_string(),
            source: SecretSource::Direct("ghp_test".to_string()),
        }
    }

    #[tokio::test]
    async fn posts_state_context_and_description() {
        let fake = Arc::new(GhFake {
            code: 0,
            calls: Mutex::new(Vec::new()),
        });
        let notifier = GhStatusNotifier::new(
            fake.clone(),
            "gh",
            "saltstack/salt",
            Some("abc123".to_string()),
            token(),
        );

        notifier
            .notify(
                "jenkins/pr/py2-ubuntu-1604",
                CommitStatus::Failure,
                "The py2-ubuntu-1604 job has failed",
            )
            .await
            .unwrap();

        let calls = fake.calls.lock().unwrap();
        let (args, had_token) = &calls[0];
        assert!(*had_token);
        assert_eq!(
            args,
            &vec![
                "api",
                "repos/saltstack/salt/statuses/abc123",
                "-f",
                "state=failure",
                "-f",
                "context=jenkins/pr/py2-ubuntu-1604",
                "-f",
                "description=The py2-ubuntu-1604 job has failed",
            ]
        );
    }

    #[tokio::test]
    async fn missing_commit_is_a_notify_fault() {
        let fake = Arc::new(GhFake {
            code: 0,
            calls: Mutex::new(Vec::new()),
        });
        let notifier = GhStatusNotifier::new(fake.clone(), "gh", "saltstack/salt", None, token());

        let err = notifier
            .notify("ctx", CommitStatus::Pending, "desc")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Notify(_)));
        assert!(fake.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn api_rejection_is_a_notify_fault() {
        let fake = Arc::new(GhFake {
            code: 1,
            calls: Mutex::new(Vec::new()),
        });
        let notifier = GhStatusNotifier::new(
            fake,
            "gh",
            "saltstack/salt",
            Some("abc123".to_string()),
            token(),
        );

        let err = notifier
            .notify("ctx", CommitStatus::Success, "desc")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("HTTP 422"));
    }
}
