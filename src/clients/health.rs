use std::{collections::BTreeMap, sync::Arc, time::Instant};

use tracing::{debug, warn};

use crate::{
    clients::{rbmq::RabbitMqPublisher, smtp::SmtpConnector, store::DocumentStore},
    models::health::{Component, ComponentHealth, HealthReport},
    pool::ConnectionPool,
};

/// Checks the store and, when wired, the broker and SMTP pool.
pub struct HealthChecker {
    store: Arc<dyn DocumentStore>,
    broker: Option<Arc<RabbitMqPublisher>>,
    smtp_pool: Option<ConnectionPool<SmtpConnector>>,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            broker: None,
            smtp_pool: None,
        }
    }

    pub fn with_broker(mut self, broker: Arc<RabbitMqPublisher>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_smtp_pool(mut self, pool: ConnectionPool<SmtpConnector>) -> Self {
        self.smtp_pool = Some(pool);
        self
    }

    pub async fn check_all(&self) -> HealthReport {
        let mut components = BTreeMap::new();

        components.insert(Component::Database, self.check_store().await);

        if let Some(broker) = &self.broker {
            components.insert(Component::MessageBroker, check_broker(broker));
        }

        if let Some(pool) = &self.smtp_pool {
            components.insert(Component::SmtpPool, check_smtp_pool(pool));
        }

        HealthReport::from_components(components)
    }

    async fn check_store(&self) -> ComponentHealth {
        let start = Instant::now();

        match self.store.ping().await {
            Ok(()) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                debug!(latency_ms, "Store ping succeeded");
                ComponentHealth::up().with_latency(latency_ms)
            }
            Err(e) => {
                warn!(error = %e, "Store ping failed");
                ComponentHealth::down(format!("store ping failed: {}", e))
            }
        }
    }
}

fn check_broker(broker: &RabbitMqPublisher) -> ComponentHealth {
    if broker.is_connected() {
        ComponentHealth::up()
    } else {
        warn!("Broker connection is not open");
        ComponentHealth::down("broker connection is not open")
    }
}

/// Spilling into temporary connections means the pool is undersized.
fn check_smtp_pool(pool: &ConnectionPool<SmtpConnector>) -> ComponentHealth {
    let stats = pool.stats();

    let health = if stats.closed {
        ComponentHealth::down("pool is closed")
    } else if stats.temporary_leased > 0 {
        ComponentHealth::degraded(format!(
            "{} temporary connections in use",
            stats.temporary_leased
        ))
    } else {
        ComponentHealth::up()
    };

    match serde_json::to_value(stats) {
        Ok(value) => health.with_stats(value),
        Err(_) => health,
    }
}
