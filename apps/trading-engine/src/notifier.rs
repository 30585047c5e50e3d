//! Critical-alert notifier.
//!
//! Posts to a Slack-compatible webhook when one is configured; otherwise
//! falls back to a warn log. A notifier failure is logged and never halts
//! the engine.

use serde_json::json;

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Something degraded but the engine continues.
    Warning,
    /// An operation failed.
    Error,
    /// Trading is affected; operator attention needed.
    Critical,
}

impl Severity {
    const fn label(self) -> &'static str {
        match self {
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }

    const fn color(self) -> &'static str {
        match self {
            Self::Warning => "#FFCC00",
            Self::Error => "#FF6600",
            Self::Critical => "#FF0000",
        }
    }
}

/// Sends critical alerts to a webhook sink.
pub struct AlertNotifier {
    webhook_url: Option<String>,
    http: reqwest::Client,
}

impl AlertNotifier {
    /// Create a notifier; `None` disables delivery and logs instead.
    #[must_use]
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            webhook_url,
            http: reqwest::Client::new(),
        }
    }

    /// Whether a sink is configured.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    /// Send an alert. Returns true when delivered to the sink.
    pub async fn send_alert(&self, title: &str, message: &str, severity: Severity) -> bool {
        let Some(url) = &self.webhook_url else {
            tracing::warn!(severity = severity.label(), title, message, "Alert (no sink)");
            return false;
        };

        let payload = json!({
            "attachments": [{
                "color": severity.color(),
                "title": format!("[{}] {title}", severity.label()),
                "text": message,
                "footer": "trading-engine",
            }]
        });

        match self.http.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::error!(status = %response.status(), title, "Alert delivery rejected");
                false
            }
            Err(err) => {
                tracing::error!(error = %err, title, "Alert delivery failed");
                false
            }
        }
    }
}
