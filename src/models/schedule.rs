use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::notification::{ChannelRequest, NewNotification, Priority};

/// Recurring notification definition driven by a cron expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledNotification {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub tenant_id: String,
    /// Six or seven field expression, seconds first.
    pub cron_expression: String,
    #[serde(default)]
    pub priority: Priority,
    pub request: ChannelRequest,
}

impl ScheduledNotification {
    pub fn notification_for(&self, fire_time: DateTime<Utc>) -> NewNotification {
        NewNotification::new(self.tenant_id.clone(), self.request.clone())
            .with_priority(self.priority)
            .with_idempotency_key(format!("schedule:{}:{}", self.id, fire_time.timestamp()))
    }
}
