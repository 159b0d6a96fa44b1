use async_trait::async_trait;
use reqwest::{
    Client,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use tracing::{debug, info};

use crate::{
    Error, Result,
    models::notification::{ChannelRequest, ChannelType},
    senders::{ChannelSender, SendReceipt, classify_status, classify_transport_error},
    trace::TraceContext,
};

pub struct WebhookSender {
    http_client: Client,
}

impl WebhookSender {
    pub fn new(http_client: Client) -> Self {
        Self { http_client }
    }
}

fn build_headers(custom: &std::collections::HashMap<String, String>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    for (name, value) in custom {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::permanent(format!("invalid webhook header '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::permanent(format!("invalid value for header {}: {}", name, e)))?;
        headers.insert(name, value);
    }

    if let Some(trace) = TraceContext::current() {
        if let Ok(value) = HeaderValue::from_str(&trace.trace_id) {
            headers.insert(HeaderName::from_static("x-trace-id"), value);
        }
    }

    Ok(headers)
}

#[async_trait]
impl ChannelSender for WebhookSender {
    fn channel(&self) -> ChannelType {
        ChannelType::Webhook
    }

    async fn send(&self, request: &ChannelRequest) -> Result<SendReceipt> {
        let ChannelRequest::Webhook { url, body, headers } = request else {
            return Err(Error::permanent(format!(
                "webhook sender cannot deliver {} requests",
                request.channel()
            )));
        };

        debug!(url = %url, "Posting webhook");

        let response = self
            .http_client
            .post(url)
            .headers(build_headers(headers)?)
            .json(body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_transport_error)?;
        classify_status(status, &text)?;

        info!(url = %url, status = status.as_u16(), "Webhook delivered");
        Ok(SendReceipt::new(ChannelType::Webhook))
    }
}
