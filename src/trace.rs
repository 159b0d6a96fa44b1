//! Correlation identifiers carried into outbox events.
//!
//! A [`TraceContext`] is scoped to the task processing one inbound message or
//! request, so code deep in the write path can stamp events without threading
//! the ids through every call.

use std::future::Future;

use uuid::Uuid;

tokio::task_local! {
    static CURRENT: TraceContext;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

impl TraceContext {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: new_span_id(),
        }
    }

    /// Starts a fresh trace for work that has no upstream correlation id.
    pub fn root() -> Self {
        Self::new(Uuid::new_v4().simple().to_string())
    }

    /// Same trace, new span.
    pub fn child(&self) -> Self {
        Self::new(self.trace_id.clone())
    }

    pub fn current() -> Option<TraceContext> {
        CURRENT.try_with(|ctx| ctx.clone()).ok()
    }

    pub async fn scope<F>(self, future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(self, future).await
    }
}

fn new_span_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..16].to_string()
}
