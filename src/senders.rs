//! Channel sender contract and the registry the pipeline dispatches through.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use tokio::time::timeout;
use tracing::debug;

use crate::{
    Error, Result,
    models::notification::{ChannelRequest, ChannelType},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendReceipt {
    pub channel: ChannelType,
    pub provider_message_id: Option<String>,
    pub sent_at: DateTime<Utc>,
}

impl SendReceipt {
    pub fn new(channel: ChannelType) -> Self {
        Self {
            channel,
            provider_message_id: None,
            sent_at: Utc::now(),
        }
    }

    pub fn with_provider_message_id(mut self, id: impl Into<String>) -> Self {
        self.provider_message_id = Some(id.into());
        self
    }
}

/// Delivers one channel's requests. Failures must be reported as
/// [`Error::TransientDelivery`] or [`Error::PermanentDelivery`].
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> ChannelType;

    async fn send(&self, request: &ChannelRequest) -> Result<SendReceipt>;
}

pub struct SenderRegistry {
    senders: HashMap<ChannelType, Arc<dyn ChannelSender>>,
    send_timeout: Duration,
}

impl SenderRegistry {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            senders: HashMap::new(),
            send_timeout,
        }
    }

    pub fn register(mut self, sender: Arc<dyn ChannelSender>) -> Self {
        self.senders.insert(sender.channel(), sender);
        self
    }

    pub fn get(&self, channel: ChannelType) -> Option<&Arc<dyn ChannelSender>> {
        self.senders.get(&channel)
    }

    /// Sends under the per-attempt deadline; running out of time is transient.
    pub async fn send(&self, request: &ChannelRequest) -> Result<SendReceipt> {
        let channel = request.channel();
        let sender = self.get(channel).ok_or_else(|| {
            Error::permanent(format!("no sender registered for channel {}", channel))
        })?;

        match timeout(self.send_timeout, sender.send(request)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(%channel, timeout_ms = self.send_timeout.as_millis() as u64, "Send timed out");
                Err(Error::Timeout(self.send_timeout))
            }
        }
    }
}

/// Maps a provider HTTP status onto the delivery error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }

    let message = format!("provider responded {}: {}", status, truncate(body, 256));

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Err(Error::transient(message))
    } else {
        Err(Error::permanent(message))
    }
}

pub fn classify_transport_error(err: reqwest::Error) -> Error {
    if err.is_builder() {
        return Error::permanent(format!("invalid provider request: {}", err));
    }
    Error::transient(format!("provider request failed: {}", err))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
