// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Built-in notification sinks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tally_config::model::{NotifyBackend, NotifyConfig};
use tally_core::{LowBalanceNotice, NotificationSink, TallyError};
use tracing::{debug, warn};

/// Writes each notice to the log as a structured warning.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, notice: &LowBalanceNotice) -> Result<(), TallyError> {
        warn!(
            notification_id = notice.notification_id,
            user_id = %notice.user_id,
            provider = %notice.provider,
            balance = %notice.balance,
            threshold = %notice.threshold,
            currency = %notice.currency,
            "{}",
            notice.summary()
        );
        Ok(())
    }
}

/// JSON body posted by [`WebhookSink`].
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: &'static str,
    message: String,
    notification: &'a LowBalanceNotice,
}

/// POSTs each notice as JSON to a fixed URL.
///
/// Any non-2xx response is a delivery failure.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TallyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TallyError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, notice: &LowBalanceNotice) -> Result<(), TallyError> {
        let payload = WebhookPayload {
            event: "low_balance",
            message: notice.summary(),
            notification: notice,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| TallyError::Delivery {
                notification_id: notice.notification_id,
                message: format!("webhook request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TallyError::Delivery {
                notification_id: notice.notification_id,
                message: format!("webhook returned {status}: {}", body.trim()),
            });
        }

        debug!(
            notification_id = notice.notification_id,
            status = status.as_u16(),
            "webhook accepted notification"
        );
        Ok(())
    }
}

/// Build the sink selected by the `[notify]` section.
pub fn sink_from_config(config: &NotifyConfig) -> Result<Arc<dyn NotificationSink>, TallyError> {
    match config.backend {
        NotifyBackend::Log => Ok(Arc::new(LogSink)),
        NotifyBackend::Webhook => {
            let url = config.webhook_url.as_deref().ok_or_else(|| {
                TallyError::Config("notify.backend = \"webhook\" requires notify.webhook_url".into())
            })?;
            Ok(Arc::new(WebhookSink::new(
                url,
                Duration::from_secs(config.timeout_secs),
            )?))
        }
    }
}
