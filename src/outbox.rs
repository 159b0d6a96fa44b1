//! Transactional outbox and the relay that drains it.
//!
//! Events are only ever appended through an open [`StoreTransaction`]; the
//! aggregate write and its event commit together or not at all. Status
//! updates after publication are single-document writes guarded by the
//! event's own version.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tokio::{task::JoinHandle, time::interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    Error, Result,
    clients::store::{DocumentStore, StoreTransaction},
    metrics::Metrics,
    models::{outbox::OutboxEvent, status::OutboxStatus},
};

#[derive(Clone)]
pub struct Outbox {
    store: Arc<dyn DocumentStore>,
}

impl Outbox {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Stages `event` inside `tx`; it becomes visible when `tx` commits.
    pub async fn append_within_transaction(
        tx: &mut dyn StoreTransaction,
        event: &OutboxEvent,
    ) -> Result<()> {
        if event.status != OutboxStatus::Pending {
            return Err(Error::InvalidState(format!(
                "outbox event {} must be appended as pending, got {}",
                event.id, event.status
            )));
        }

        tx.insert_outbox_event(event).await?;

        debug!(
            event_id = %event.id,
            tenant_id = %event.tenant_id,
            aggregate_id = %event.aggregate_id,
            event_type = %event.event_type,
            "Outbox event staged"
        );

        Ok(())
    }

    pub async fn find_unprocessed(&self, tenant_id: &str, limit: usize) -> Result<Vec<OutboxEvent>> {
        self.store.find_unprocessed_events(tenant_id, limit).await
    }

    pub async fn find_by_aggregate(
        &self,
        tenant_id: &str,
        aggregate_id: Uuid,
    ) -> Result<Vec<OutboxEvent>> {
        self.store
            .find_events_by_aggregate(tenant_id, aggregate_id)
            .await
    }

    pub async fn pending_tenants(&self, limit: usize) -> Result<Vec<String>> {
        self.store.pending_event_tenants(limit).await
    }

    pub async fn mark_processed(&self, event: &OutboxEvent) -> Result<OutboxEvent> {
        let mut next = event.clone();
        next.status = OutboxStatus::Processed;
        next.processed_at = Some(Utc::now());

        self.write_status(event, next).await
    }

    /// Records a relay failure. The event is not retried from here.
    pub async fn mark_failed(&self, event: &OutboxEvent, error: &str) -> Result<OutboxEvent> {
        let mut next = event.clone();
        next.status = OutboxStatus::Failed;
        next.error_count = event.error_count.saturating_add(1);
        next.last_error = Some(error.to_string());

        self.write_status(event, next).await
    }

    async fn write_status(&self, current: &OutboxEvent, mut next: OutboxEvent) -> Result<OutboxEvent> {
        next.version = current.version + 1;

        if !self.store.update_outbox_event(&next, current.version).await? {
            return Err(Error::OptimisticLockConflict {
                entity: "outbox_event",
                id: current.id,
                expected: current.version,
            });
        }

        Ok(next)
    }

    /// Deletes processed events older than `retention_days`. Pending and
    /// failed events are never removed.
    pub async fn cleanup(&self, retention_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let deleted = self.store.delete_processed_events_before(cutoff).await?;

        if deleted > 0 {
            info!(deleted, retention_days, "Outbox cleanup completed");
        }

        Ok(deleted)
    }
}

/// Downstream sink for committed change records.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Returns once the sink has taken the event. A retryable error means
    /// the sink is unreachable, not that the event is bad.
    async fn publish(&self, event: &OutboxEvent) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_tenants_per_poll: usize,
    pub retention_days: u32,
    pub cleanup_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            max_tenants_per_poll: 50,
            retention_days: 7,
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub published: usize,
    pub failed: usize,
    /// Left pending because the sink was unreachable.
    pub deferred: usize,
}

pub struct OutboxRelay {
    outbox: Outbox,
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<Metrics>,
    config: RelayConfig,
}

impl OutboxRelay {
    pub fn new(
        outbox: Outbox,
        publisher: Arc<dyn EventPublisher>,
        metrics: Arc<Metrics>,
        config: RelayConfig,
    ) -> Self {
        Self {
            outbox,
            publisher,
            metrics,
            config,
        }
    }

    /// One pass over every tenant with pending events. The pass stops at the
    /// first retryable publish error and leaves the rest for the next poll.
    pub async fn relay_once(&self) -> Result<RelayReport> {
        let mut report = RelayReport::default();
        let tenants = self
            .outbox
            .pending_tenants(self.config.max_tenants_per_poll)
            .await?;

        for tenant_id in tenants {
            let events = self
                .outbox
                .find_unprocessed(&tenant_id, self.config.batch_size)
                .await?;

            for event in events {
                match self.publisher.publish(&event).await {
                    Ok(()) => {
                        self.outbox.mark_processed(&event).await?;
                        self.metrics
                            .outbox_events_total
                            .with_label_values(&["published"])
                            .inc();
                        report.published += 1;
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(
                            event_id = %event.id,
                            tenant_id = %event.tenant_id,
                            error = %e,
                            "Event sink unavailable, deferring outbox events"
                        );
                        self.metrics
                            .outbox_events_total
                            .with_label_values(&["deferred"])
                            .inc();
                        report.deferred += 1;
                        return Ok(report);
                    }
                    Err(e) => {
                        warn!(
                            event_id = %event.id,
                            tenant_id = %event.tenant_id,
                            error = %e,
                            "Failed to publish outbox event"
                        );
                        self.outbox.mark_failed(&event, &e.to_string()).await?;
                        self.metrics
                            .outbox_events_total
                            .with_label_values(&["failed"])
                            .inc();
                        report.failed += 1;
                    }
                }
            }
        }

        if report.published > 0 || report.failed > 0 {
            debug!(
                published = report.published,
                failed = report.failed,
                "Outbox relay pass finished"
            );
        }

        Ok(report)
    }

    pub async fn run(self, token: CancellationToken) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Outbox relay started"
        );

        let mut poll = interval(self.config.poll_interval);
        let mut cleanup = interval(self.config.cleanup_interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = poll.tick() => {
                    if let Err(e) = self.relay_once().await {
                        error!(error = %e, "Outbox relay pass failed");
                    }
                }
                _ = cleanup.tick() => {
                    if let Err(e) = self.outbox.cleanup(self.config.retention_days).await {
                        error!(error = %e, "Outbox cleanup failed");
                    }
                }
            }
        }

        info!("Outbox relay stopped");
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }
}
