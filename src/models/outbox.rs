use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use uuid::Uuid;

use crate::{
    Error, Result,
    models::{
        notification::Notification,
        status::{NotificationStatus, OutboxStatus},
    },
    trace::TraceContext,
};

pub const NOTIFICATION_AGGREGATE: &str = "notification";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxEventType {
    Created,
    StatusChanged,
    Updated,
    Deleted,
    Restored,
}

impl OutboxEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxEventType::Created => "created",
            OutboxEventType::StatusChanged => "status_changed",
            OutboxEventType::Updated => "updated",
            OutboxEventType::Deleted => "deleted",
            OutboxEventType::Restored => "restored",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(OutboxEventType::Created),
            "status_changed" => Ok(OutboxEventType::StatusChanged),
            "updated" => Ok(OutboxEventType::Updated),
            "deleted" => Ok(OutboxEventType::Deleted),
            "restored" => Ok(OutboxEventType::Restored),
            other => Err(Error::validation(format!(
                "Unknown outbox event type '{}'",
                other
            ))),
        }
    }
}

impl Display for OutboxEventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Change record co-written with the aggregate mutation it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub tenant_id: String,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: OutboxEventType,
    pub payload: JsonValue,
    pub status: OutboxStatus,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub version: i64,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// Builds the event for a notification mutation. `previous` is the
    /// committed state the mutation started from, if any.
    pub fn for_notification(
        event_type: OutboxEventType,
        previous: Option<&Notification>,
        current: &Notification,
    ) -> Result<Self> {
        let previous_status: Option<NotificationStatus> = previous.map(|n| n.status);

        let payload = json!({
            "version": current.version,
            "status": current.status,
            "previous_status": previous_status,
            "notification": serde_json::to_value(current)?,
        });

        let trace = TraceContext::current();

        Ok(Self {
            id: Uuid::new_v4(),
            tenant_id: current.tenant_id.clone(),
            aggregate_type: NOTIFICATION_AGGREGATE.to_string(),
            aggregate_id: current.id,
            event_type,
            payload,
            status: OutboxStatus::Pending,
            error_count: 0,
            last_error: None,
            version: 1,
            trace_id: trace.as_ref().map(|t| t.trace_id.clone()),
            span_id: trace.map(|t| t.span_id),
            created_at: Utc::now(),
            processed_at: None,
        })
    }
}
