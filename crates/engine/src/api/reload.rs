//! Reload signal sent to the serving process after a promotion

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use thiserror::Error;
use tracing::info;

use super::ReloadSignal;

const RELOAD_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("invalid reload endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("reload request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// POSTs `<base><path>?version=<label>`
#[derive(Clone)]
pub struct HttpReloadSignal {
    client: Client,
    endpoint: String,
}

impl HttpReloadSignal {
    pub fn new(base_url: &str, path: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), path),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Full request URL for a version label
    pub fn request_url(&self, version: &str) -> Result<Url, ReloadError> {
        Url::parse_with_params(&self.endpoint, &[("version", version)]).map_err(|e| {
            ReloadError::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            }
        })
    }
}

#[async_trait]
impl ReloadSignal for HttpReloadSignal {
    async fn reload(&self, version: &str) -> Result<(), ReloadError> {
        let url = self.request_url(version)?;
        self.client
            .post(url)
            .timeout(RELOAD_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        info!(version, endpoint = %self.endpoint, "Serving layer reloaded");
        Ok(())
    }
}

/// Reload signal that only logs, for runs without a serving process
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnlyReload;

#[async_trait]
impl ReloadSignal for LogOnlyReload {
    async fn reload(&self, version: &str) -> Result<(), ReloadError> {
        info!(version, "Reload skipped (no serving process)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_url_carries_version() {
        let signal = HttpReloadSignal::new("http://localhost:8000/", "/reload");
        assert_eq!(signal.endpoint(), "http://localhost:8000/reload");

        let url = signal.request_url("v1700000000").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8000/reload?version=v1700000000");
    }

    #[test]
    fn test_bad_endpoint_is_an_error() {
        let signal = HttpReloadSignal::new("not a url", "/reload");
        assert!(matches!(
            signal.request_url("v1"),
            Err(ReloadError::InvalidEndpoint { .. })
        ));
    }

    #[tokio::test]
    async fn test_log_only_reload_succeeds() {
        assert!(LogOnlyReload.reload("v1").await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_error() {
        let signal = HttpReloadSignal::new("http://127.0.0.1:1", "/reload");
        assert!(matches!(signal.reload("v1").await, Err(ReloadError::Http(_))));
    }
}
