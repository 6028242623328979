//! Outbound chat messages
//!
//! The chat transport itself lives outside the daemon. `WebhookMessenger`
//! POSTs each message as JSON to a bridge; the bridge may answer with
//! `{"message_ref": "..."}` so replies threaded to the notification can be
//! matched. Replies come back through `POST /messages`.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tapeloop_common::OutboundMessage;
use tracing::info;

use super::Messenger;
use crate::error::{OrchestratorError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Default, Deserialize)]
struct WebhookReply {
    #[serde(default)]
    message_ref: Option<String>,
}

pub struct WebhookMessenger {
    client: reqwest::Client,
    url: String,
}

impl WebhookMessenger {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("tapeloop/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| OrchestratorError::Collaborator(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Messenger for WebhookMessenger {
    async fn notify(&self, message: &OutboundMessage) -> Result<Option<String>> {
        let response = self
            .client
            .post(&self.url)
            .json(message)
            .send()
            .await
            .map_err(|e| OrchestratorError::Collaborator(format!("webhook unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchestratorError::Collaborator(format!(
                "webhook returned {}",
                status
            )));
        }

        // An empty or non-JSON body just means no reference
        let reply = response.json::<WebhookReply>().await.unwrap_or_default();
        Ok(reply.message_ref)
    }
}

/// Writes messages to the log; used when no webhook is configured
#[derive(Debug, Default)]
pub struct LogMessenger;

#[async_trait]
impl Messenger for LogMessenger {
    async fn notify(&self, message: &OutboundMessage) -> Result<Option<String>> {
        info!(kind = ?message.kind, "{}", message.text);
        Ok(None)
    }
}
