//! The `NotificationSink` port (SPEC_FULL.md §6.3): templated member
//! notifications (deposit confirmations, reminder offsets, default notices).
//! The core never formats message bodies itself — it passes a template key
//! and variables, leaving rendering and delivery channel to the adapter.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use tanda_core::Error;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(
        &self,
        recipient_ref: &str,
        template_key: &str,
        variables: HashMap<String, String>,
    ) -> Result<(), Error>;
}

/// Production adapter: posts to an operator-configured webhook, leaving
/// templating and delivery (SMS/push/email) to whatever consumes the hook.
pub struct WebhookNotificationSink {
    client: reqwest::Client,
    webhook_url: String,
}

impl WebhookNotificationSink {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookNotificationSink {
    async fn notify(
        &self,
        recipient_ref: &str,
        template_key: &str,
        variables: HashMap<String, String>,
    ) -> Result<(), Error> {
        let payload = serde_json::json!({
            "recipient_ref": recipient_ref,
            "template_key": template_key,
            "variables": variables,
        });
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Notification(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::Notification(format!(
                "webhook returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Local/dev adapter: logs instead of delivering. Useful when no webhook is
/// configured and notification failures must never block the core.
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(
        &self,
        recipient_ref: &str,
        template_key: &str,
        variables: HashMap<String, String>,
    ) -> Result<(), Error> {
        info!(recipient_ref, template_key, ?variables, "notification");
        Ok(())
    }
}

/// Test adapter: records every notification for assertion.
#[derive(Default)]
pub struct StubNotificationSink {
    pub sent: Mutex<Vec<(String, String, HashMap<String, String>)>>,
}

impl StubNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationSink for StubNotificationSink {
    async fn notify(
        &self,
        recipient_ref: &str,
        template_key: &str,
        variables: HashMap<String, String>,
    ) -> Result<(), Error> {
        self.sent.lock().expect("stub sink poisoned").push((
            recipient_ref.to_string(),
            template_key.to_string(),
            variables,
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_sink_records_notifications() {
        let sink = StubNotificationSink::new();
        sink.notify("user-1", "deposit_confirmed", HashMap::new())
            .await
            .unwrap();
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "user-1");
        assert_eq!(sent[0].1, "deposit_confirmed");
    }
}
