//! Outbound collaborators: promotion notifications and the serving reload signal

pub mod reload;
pub mod webhook;

use async_trait::async_trait;
use serde_json::Value;

pub use reload::{HttpReloadSignal, LogOnlyReload, ReloadError};
pub use webhook::WebhookNotifier;

/// Fire-and-forget notification sink. Implementations swallow their own failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str, payload: &Value);
}

/// One-way "adopt this version" call to the serving process
#[async_trait]
pub trait ReloadSignal: Send + Sync {
    async fn reload(&self, version: &str) -> Result<(), ReloadError>;
}
