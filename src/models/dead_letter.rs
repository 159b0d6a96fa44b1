use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::notification::{ChannelRequest, NewNotification, Notification, Priority};

/// Snapshot of a notification that exhausted its delivery budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedNotification {
    pub id: Uuid,
    pub original_id: Uuid,
    pub tenant_id: String,
    pub priority: Priority,
    pub request: ChannelRequest,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl FailedNotification {
    pub fn snapshot(notification: &Notification, error: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            original_id: notification.id,
            tenant_id: notification.tenant_id.clone(),
            priority: notification.priority,
            request: notification.request.clone(),
            error: error.into(),
            failed_at: Utc::now(),
            retry_count: notification.retry_count,
        }
    }

    /// A fresh submission carrying the snapshot's content.
    pub fn to_new_notification(&self) -> NewNotification {
        NewNotification::new(self.tenant_id.clone(), self.request.clone())
            .with_priority(self.priority)
    }
}
