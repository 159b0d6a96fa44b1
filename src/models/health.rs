use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered from best to worst, so `max` folds component states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Degraded still accepts traffic.
    pub fn is_serving(self) -> bool {
        self != HealthStatus::Unhealthy
    }
}

/// Dependencies the service reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Database,
    MessageBroker,
    SmtpPool,
}

impl Component {
    /// Without a critical component nothing can be accepted or relayed.
    pub fn is_critical(self) -> bool {
        matches!(self, Component::Database | Component::MessageBroker)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<serde_json::Value>,
}

impl ComponentHealth {
    fn with_status(status: HealthStatus) -> Self {
        Self {
            status,
            latency_ms: None,
            reason: None,
            stats: None,
        }
    }

    pub fn up() -> Self {
        Self::with_status(HealthStatus::Healthy)
    }

    pub fn degraded(reason: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Degraded).with_reason(reason)
    }

    pub fn down(reason: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Unhealthy).with_reason(reason)
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_stats(mut self, stats: serde_json::Value) -> Self {
        self.stats = Some(stats);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub components: BTreeMap<Component, ComponentHealth>,
}

impl HealthReport {
    /// A failed critical component makes the service unhealthy; any other
    /// failure only degrades it.
    pub fn from_components(components: BTreeMap<Component, ComponentHealth>) -> Self {
        let status = components
            .iter()
            .map(|(component, health)| match health.status {
                HealthStatus::Unhealthy if !component.is_critical() => HealthStatus::Degraded,
                status => status,
            })
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            checked_at: Utc::now(),
            components,
        }
    }
}
