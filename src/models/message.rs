use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::notification::{ChannelRequest, NewNotification, Priority};

/// Domain event consumed from the broker asking for a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub trace_id: String,
    pub tenant_id: String,

    #[serde(default)]
    pub idempotency_key: Option<String>,

    #[serde(default)]
    pub priority: Priority,

    #[serde(flatten)]
    pub request: ChannelRequest,

    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl NotificationMessage {
    pub fn into_new_notification(self) -> NewNotification {
        NewNotification {
            tenant_id: self.tenant_id,
            priority: self.priority,
            request: self.request,
            idempotency_key: self.idempotency_key,
            scheduled_for: self.scheduled_for,
            expires_at: self.expires_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}
