//! Webhook notification sink

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::Notifier;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// POSTs `{"text": .., "extra": ..}` to a webhook; disabled without a URL
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: Option<String>,
}

impl WebhookNotifier {
    /// An empty or blank URL disables delivery
    pub fn new(url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.filter(|u| !u.trim().is_empty()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, message: &str, payload: &Value) {
        let Some(url) = &self.url else {
            debug!(message, "Webhook disabled, notification dropped");
            return;
        };

        let body = json!({ "text": message, "extra": payload });
        let result = self
            .client
            .post(url)
            .timeout(WEBHOOK_TIMEOUT)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match result {
            Ok(_) => debug!(message, "Notification delivered"),
            Err(e) => warn!(message, error = %e, "Notification failed"),
        }
    }
}
