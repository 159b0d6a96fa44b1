use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    models::notification::{ChannelRequest, Notification, Priority},
    trace::TraceContext,
};

/// In-memory unit of work; the notification record remains the durable copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub notification_id: Uuid,
    pub tenant_id: String,
    pub priority: Priority,
    pub request: ChannelRequest,
    /// Record version the job was built from.
    pub version: i64,
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl DispatchJob {
    /// Builds the job from the record, carrying the ambient trace id.
    pub fn for_notification(notification: &Notification) -> Self {
        Self {
            notification_id: notification.id,
            tenant_id: notification.tenant_id.clone(),
            priority: notification.priority,
            request: notification.request.clone(),
            version: notification.version,
            trace_id: TraceContext::current().map(|trace| trace.trace_id),
        }
    }

    /// Trace to run the job under: the submitter's, or a fresh one.
    pub fn trace(&self) -> TraceContext {
        match &self.trace_id {
            Some(trace_id) => TraceContext::new(trace_id.clone()),
            None => TraceContext::root(),
        }
    }
}
