//! Run-completion listeners

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use super::RunListener;
use crate::models::RunId;

/// Logs finished runs
#[derive(Clone, Debug, Default)]
pub struct LogListener;

#[async_trait]
impl RunListener for LogListener {
    fn name(&self) -> &str {
        "log"
    }

    async fn on_run_completion(&self, status_url: &str, run_id: RunId) -> Result<()> {
        info!("Run {} finished: {}", run_id, status_url);
        Ok(())
    }
}

#[derive(Serialize)]
struct CompletionPayload<'a> {
    run_id: RunId,
    status_url: &'a str,
}

/// POSTs a JSON notice to a URL
#[derive(Clone, Debug)]
pub struct WebhookListener {
    client: Client,
    url: String,
}

impl WebhookListener {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(url, 30)
    }

    /// Create listener with custom timeout
    pub fn with_timeout(url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RunListener for WebhookListener {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn on_run_completion(&self, status_url: &str, run_id: RunId) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&CompletionPayload { run_id, status_url })
            .send()
            .await
            .with_context(|| format!("Failed to POST to {}", self.url))?
            .error_for_status()
            .with_context(|| format!("Webhook {} rejected run {}", self.url, run_id))?;

        info!("Notified {} of run {}", self.url, run_id);
        Ok(())
    }
}

/// Runs several listeners in order
///
/// Every listener runs even if an earlier one fails; the last error is
/// returned after all of them ran.
#[derive(Clone, Default)]
pub struct CompoundListener {
    listeners: Vec<Arc<dyn RunListener>>,
}

impl CompoundListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, listener: Arc<dyn RunListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

#[async_trait]
impl RunListener for CompoundListener {
    fn name(&self) -> &str {
        "compound"
    }

    async fn on_run_completion(&self, status_url: &str, run_id: RunId) -> Result<()> {
        let mut last_error = None;
        for listener in &self.listeners {
            if let Err(e) = listener.on_run_completion(status_url, run_id).await {
                error!(
                    "Listener {} failed for run {}: {:#}",
                    listener.name(),
                    run_id,
                    e
                );
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingListener;

    #[tokio::test]
    async fn test_compound_runs_every_listener() {
        let first = Arc::new(RecordingListener::failing("first down"));
        let second = Arc::new(RecordingListener::new());
        let third = Arc::new(RecordingListener::failing("third down"));
        let compound = CompoundListener::new()
            .with(first.clone())
            .with(second.clone())
            .with(third.clone());
        assert_eq!(compound.len(), 3);

        let err = compound
            .on_run_completion("http://x/runs/4", 4)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "third down");

        for listener in [&first, &second, &third] {
            assert_eq!(listener.notifications(), vec![(4, "http://x/runs/4".to_string())]);
        }
    }

    #[tokio::test]
    async fn test_empty_compound_succeeds() {
        let compound = CompoundListener::new();
        assert!(compound.is_empty());
        assert!(compound.on_run_completion("u", 1).await.is_ok());
        assert!(LogListener.on_run_completion("u", 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_webhook_unreachable() {
        let listener = WebhookListener::with_timeout("http://127.0.0.1:9/hook", 1).unwrap();
        assert_eq!(listener.name(), "webhook");
        assert!(listener.on_run_completion("u", 1).await.is_err());
    }
}
