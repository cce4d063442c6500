//! Result notification.
//!
//! PR runners report a commit status on the job's context when the run
//! starts and when it ends. Failed runs are also announced in chat. Neither
//! channel can change the build result; their faults are logged.

mod github;
mod slack;

pub use github::GhStatusNotifier;
pub use slack::SlackNotifier;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{RunConfig, RunParameters};
use crate::error::Result;
use crate::kitchen::VmKey;
use crate::report::BuildResult;
use crate::timeout::with_timeout;

/// Commit status states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitStatus {
    Pending,
    Success,
    Failure,
}

impl CommitStatus {
    /// State name as the status API expects it.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitStatus::Pending => "pending",
            CommitStatus::Success => "success",
            CommitStatus::Failure => "failure",
        }
    }
}

/// Posts commit statuses to the source-control host.
#[async_trait]
pub trait StatusNotifier: Send + Sync {
    async fn notify(&self, context: &str, status: CommitStatus, description: &str) -> Result<()>;
}

/// Sends messages to a chat channel.
#[async_trait]
pub trait ChatNotifier: Send + Sync {
    async fn send(&self, channel: &str, color: &str, message: &str) -> Result<()>;
}

/// Routes run start and completion to the status and chat channels.
pub struct Notifier {
    status: Box<dyn StatusNotifier>,
    chat: Box<dyn ChatNotifier>,
    key: VmKey,
    pr_runner: bool,
    channel: String,
    color: String,
    job_name: String,
    build_number: String,
    build_url: String,
    /// Bound on each status post and chat send.
    timeout: Duration,
}

impl Notifier {
    pub fn new(
        status: Box<dyn StatusNotifier>,
        chat: Box<dyn ChatNotifier>,
        config: &RunConfig,
        params: &RunParameters,
    ) -> Self {
        Self {
            status,
            chat,
            key: config.vm_key(),
            pr_runner: params.is_pr_runner(&config.notify.pr_node_prefix),
            channel: config.notify.chat_channel.clone(),
            color: config.notify.chat_color.clone(),
            job_name: params.job_name.clone(),
            build_number: params.build_number.clone(),
            build_url: params.build_url.clone(),
            timeout: config.finalizer_timeout(),
        }
    }

    /// Whether commit statuses are posted for this run.
    pub fn posts_statuses(&self) -> bool {
        self.pr_runner
    }

    /// Status context, e.g. `jenkins/pr/py2-ubuntu-1604`.
    pub fn context(&self) -> String {
        format!("jenkins/pr/{}", self.key)
    }

    /// Posts the in-progress status. No-op off PR runners.
    pub async fn pending(&self) -> Result<()> {
        if !self.pr_runner {
            return Ok(());
        }
        let description = format!("The {} job is in progress", self.key);
        self.post_status(CommitStatus::Pending, &description).await
    }

    /// Posts the final status and, on failure, the chat message.
    ///
    /// A chat fault is logged and dropped. A status fault is returned after
    /// chat has been attempted.
    pub async fn finish(&self, result: BuildResult) -> Result<()> {
        let passed = result.is_success();

        let status_result = if self.pr_runner {
            let (status, description) = if passed {
                (CommitStatus::Success, format!("The {} job has passed", self.key))
            } else {
                (CommitStatus::Failure, format!("The {} job has failed", self.key))
            };
            self.post_status(status, &description).await
        } else {
            tracing::debug!("not a PR runner, no commit status");
            Ok(())
        };

        if !passed {
            let message = self.failure_message();
            let sent = with_timeout(
                self.timeout,
                "notify-chat",
                self.chat.send(&self.channel, &self.color, &message),
            )
            .await;
            if let Err(e) = sent {
                tracing::warn!(channel = %self.channel, error = %e, "chat notification failed");
            }
        }

        status_result
    }

    async fn post_status(&self, status: CommitStatus, description: &str) -> Result<()> {
        let context = self.context();
        with_timeout(
            self.timeout,
            "notify-status",
            self.status.notify(&context, status, description),
        )
        .await
    }

    /// Chat text for a failed run.
    pub fn failure_message(&self) -> String {
        format!(
            "FAILED: PR-Job: '{} [{}]' ({})",
            self.job_name, self.build_number, self.build_url
        )
    }
}
