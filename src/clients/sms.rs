use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    Error, Result,
    models::notification::{ChannelRequest, ChannelType},
    senders::{ChannelSender, SendReceipt, classify_status, classify_transport_error},
};

#[derive(Debug, Serialize)]
struct SmsRequest<'a> {
    to: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct SmsResponse {
    #[serde(default, alias = "message_id", alias = "sid")]
    id: Option<String>,
}

/// Sends SMS through an HTTP provider accepting `{to, body}` JSON.
pub struct SmsSender {
    http_client: Client,
    provider_url: String,
    api_key: String,
}

impl SmsSender {
    pub fn new(http_client: Client, provider_url: String, api_key: String) -> Self {
        info!(provider_url = %provider_url, "SMS sender initialized");

        Self {
            http_client,
            provider_url,
            api_key,
        }
    }
}

#[async_trait]
impl ChannelSender for SmsSender {
    fn channel(&self) -> ChannelType {
        ChannelType::Sms
    }

    async fn send(&self, request: &ChannelRequest) -> Result<SendReceipt> {
        let ChannelRequest::Sms { recipient, body } = request else {
            return Err(Error::permanent(format!(
                "SMS sender cannot deliver {} requests",
                request.channel()
            )));
        };

        debug!(recipient = %recipient, "Sending SMS");

        let response = self
            .http_client
            .post(&self.provider_url)
            .bearer_auth(&self.api_key)
            .json(&SmsRequest {
                to: recipient,
                body,
            })
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_transport_error)?;
        classify_status(status, &text)?;

        let mut receipt = SendReceipt::new(ChannelType::Sms);
        if let Some(id) = serde_json::from_str::<SmsResponse>(&text)
            .ok()
            .and_then(|r| r.id)
        {
            receipt = receipt.with_provider_message_id(id);
        }

        info!(recipient = %recipient, "SMS sent successfully");
        Ok(receipt)
    }
}
