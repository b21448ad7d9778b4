//! Webhook notification sink.
//!
//! Posts each record as JSON to a configured endpoint (a Slack bridge
//! or any dashboard collector). Delivery is best-effort: a failed post
//! is logged and dropped, never propagated into the control loop.

use super::{NotificationRecord, Notifier};
use crate::Result;
use std::time::Duration;
use tracing::warn;

/// Fire-and-forget JSON webhook sink.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, record: NotificationRecord) -> Result<()> {
        let response = self.client.post(&self.url).json(&record).send().await;
        match response {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                warn!(
                    "[Notify] Webhook returned {} for {:?} notification",
                    resp.status(),
                    record.kind
                );
            }
            Err(e) => {
                warn!("[Notify] Webhook delivery failed: {}", e);
            }
        }
        Ok(())
    }
}
