//! Best-effort Slack notification of run results.
//!
//! A missing webhook or a failed request is logged and swallowed; it never
//! aborts a run.

use std::sync::Arc;

use crate::config::SlackConfig;
use crate::http::{HttpRequest, HttpTransport};

/// Format the end-of-run message.
pub fn result_message(score: f64, loss: f64, model_name: &str) -> String {
    format!("score: {score:.5}, loss: {loss:.5}, model: {model_name}")
}

/// Posts `{"text": ...}` to an incoming-webhook URL.
pub struct SlackNotifier {
    transport: Arc<dyn HttpTransport>,
    webhook_url: Option<String>,
}

impl SlackNotifier {
    pub fn new(transport: Arc<dyn HttpTransport>, webhook_url: Option<String>) -> Self {
        Self {
            transport,
            webhook_url: webhook_url.filter(|u| !u.trim().is_empty()),
        }
    }

    /// Resolve the webhook from the environment variable named in `config`.
    pub fn from_config(config: &SlackConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let url = if config.enabled {
            std::env::var(&config.webhook_env).ok()
        } else {
            None
        };
        Self::new(transport, url)
    }

    pub fn is_configured(&self) -> bool {
        self.webhook_url.is_some()
    }

    /// Send `text`. Returns whether the webhook accepted it.
    pub async fn send(&self, text: &str) -> bool {
        let Some(url) = &self.webhook_url else {
            tracing::debug!("Slack webhook not configured, skipping notification");
            return false;
        };
        let request = HttpRequest::post_json(url.clone(), serde_json::json!({ "text": text }));
        match self.transport.send(request).await {
            Ok(resp) if resp.is_success() => true,
            Ok(resp) => {
                tracing::warn!(status = resp.status, "Failed to send message to slack.");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to send message to slack.");
                false
            }
        }
    }
}
