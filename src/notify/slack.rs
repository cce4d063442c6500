//! Chat messages through a Slack incoming webhook.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::ChatNotifier;
use crate::error::{Error, Result};
use crate::secrets::{SecretRef, SecretScope};

/// Posts attachments to the webhook URL held by a secret handle.
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook: SecretRef,
}

impl SlackNotifier {
    pub fn new(webhook: SecretRef) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Notify(format!("cannot build http client: {}", e)))?;
        Ok(Self { client, webhook })
    }
}

/// Webhook payload with a single coloured attachment.
fn message_body(channel: &str, color: &str, message: &str) -> serde_json::Value {
    json!({
        "channel": channel,
        "attachments": [{
            "color": color,
            "text": message,
            "fallback": message,
        }],
    })
}

#[async_trait]
impl ChatNotifier for SlackNotifier {
    async fn send(&self, channel: &str, color: &str, message: &str) -> Result<()> {
        let scope = SecretScope::resolve(std::slice::from_ref(&self.webhook))?;
        let url = scope
            .get(&self.webhook.name)
            .ok_or_else(|| Error::Notify("webhook URL is empty".to_string()))?;

        let response = self
            .client
            .post(url)
            .json(&message_body(channel, color, message))
            .send()
            .await
            .map_err(|e| Error::Notify(scope.redact(&e.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Notify(format!("webhook returned {}", status)));
        }

        tracing::info!(channel, "chat notification sent");
        Ok(())
    }
}
