//! Error taxonomy for the delivery pipeline.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::models::status::NotificationStatus;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limit exceeded for tenant {tenant_id}")]
    AdmissionRejected { tenant_id: String },

    #[error("Idempotency key '{key}' already used by notification {existing_id}")]
    DuplicateIdempotencyKey { key: String, existing_id: Uuid },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Optimistic lock conflict on {entity} {id}: expected version {expected}")]
    OptimisticLockConflict {
        entity: &'static str,
        id: Uuid,
        expected: i64,
    },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: &'static str, id: Uuid },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        from: NotificationStatus,
        to: NotificationStatus,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Transient delivery failure: {0}")]
    TransientDelivery(String),

    #[error("Permanent delivery failure: {0}")]
    PermanentDelivery(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity_type: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity_type, id }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientDelivery(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::PermanentDelivery(msg.into())
    }

    /// Duplicate keys and stale versions mean "already handled" or "re-read and retry".
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::DuplicateIdempotencyKey { .. }
                | Self::Conflict(_)
                | Self::OptimisticLockConflict { .. }
        )
    }

    /// Whether a later attempt at the same operation can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AdmissionRejected { .. }
                | Self::OptimisticLockConflict { .. }
                | Self::TransientDelivery(_)
                | Self::Timeout(_)
                | Self::Store(_)
                | Self::Broker(_)
                | Self::Pool(_)
        )
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::PermanentDelivery(_) | Self::Validation(_))
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION) {
            return Self::Conflict(err.to_string());
        }
        Self::Store(err.to_string())
    }
}

impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Self::Broker(err.to_string())
    }
}
