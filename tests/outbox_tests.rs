use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use delivery_service::{
    Error,
    clients::{memory::MemoryStore, store::DocumentStore},
    metrics::Metrics,
    models::{
        outbox::{OutboxEvent, OutboxEventType},
        status::{NotificationStatus, OutboxStatus},
    },
    outbox::{EventPublisher, Outbox, OutboxRelay, RelayConfig},
    repository::NotificationRepository,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::common::{TENANT, new_sms};

fn setup() -> (Arc<dyn DocumentStore>, NotificationRepository, Outbox) {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    (
        Arc::clone(&store),
        NotificationRepository::new(Arc::clone(&store)),
        Outbox::new(store),
    )
}

#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<OutboxEvent>>,
    fail_tenant: Option<String>,
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &OutboxEvent) -> delivery_service::Result<()> {
        if self.fail_tenant.as_deref() == Some(event.tenant_id.as_str()) {
            return Err(Error::validation("message exceeds the frame size"));
        }
        self.published.lock().push(event.clone());
        Ok(())
    }
}

/// Test: Only pending events can be appended
#[tokio::test]
async fn test_append_requires_pending_status() -> Result<()> {
    let (store, repository, _) = setup();
    let created = repository.create(new_sms(TENANT)).await?;

    let mut event = OutboxEvent::for_notification(OutboxEventType::Updated, None, &created)?;
    event.status = OutboxStatus::Processed;

    let mut tx = store.begin().await?;
    let result = Outbox::append_within_transaction(&mut *tx, &event).await;
    tx.rollback().await?;

    assert!(matches!(result, Err(Error::InvalidState(_))));

    Ok(())
}

/// Test: Marking an event bumps its version and stale writers lose
#[tokio::test]
async fn test_mark_processed_and_failed() -> Result<()> {
    let (_, repository, outbox) = setup();
    let created = repository.create(new_sms(TENANT)).await?;

    let event = outbox.find_unprocessed(TENANT, 10).await?.remove(0);
    assert_eq!(event.aggregate_id, created.id);

    let failed = outbox.mark_failed(&event, "broker down").await?;
    assert_eq!(failed.status, OutboxStatus::Failed);
    assert_eq!(failed.error_count, 1);
    assert_eq!(failed.last_error.as_deref(), Some("broker down"));
    assert_eq!(failed.version, event.version + 1);

    let stale = outbox.mark_processed(&event).await;
    assert!(matches!(stale, Err(Error::OptimisticLockConflict { .. })));

    let processed = outbox.mark_processed(&failed).await?;
    assert_eq!(processed.status, OutboxStatus::Processed);
    assert!(processed.processed_at.is_some());
    assert!(outbox.find_unprocessed(TENANT, 10).await?.is_empty());

    Ok(())
}

/// Test: Cleanup removes only processed events past retention
#[tokio::test]
async fn test_cleanup_keeps_pending_and_recent() -> Result<()> {
    let (store, repository, outbox) = setup();
    let old = repository.create(new_sms(TENANT)).await?;
    let recent = repository.create(new_sms(TENANT)).await?;
    let pending = repository.create(new_sms(TENANT)).await?;

    let old_event = outbox.find_by_aggregate(TENANT, old.id).await?.remove(0);
    let mut aged = old_event.clone();
    aged.status = OutboxStatus::Processed;
    aged.processed_at = Some(Utc::now() - chrono::Duration::days(10));
    aged.version = old_event.version + 1;
    assert!(store.update_outbox_event(&aged, old_event.version).await?);

    let recent_event = outbox.find_by_aggregate(TENANT, recent.id).await?.remove(0);
    outbox.mark_processed(&recent_event).await?;

    assert_eq!(outbox.cleanup(7).await?, 1);

    assert!(outbox.find_by_aggregate(TENANT, old.id).await?.is_empty());
    assert_eq!(outbox.find_by_aggregate(TENANT, recent.id).await?.len(), 1);
    assert_eq!(outbox.find_by_aggregate(TENANT, pending.id).await?.len(), 1);

    Ok(())
}

/// Test: The relay publishes in commit order and records failures per tenant
#[tokio::test]
async fn test_relay_once_publishes_in_order() -> Result<()> {
    let (_, repository, outbox) = setup();

    let created = repository.create(new_sms(TENANT)).await?;
    repository
        .update_status(TENANT, created.id, 1, NotificationStatus::Queued)
        .await?;
    repository.create(new_sms("globex")).await?;

    let publisher = Arc::new(RecordingPublisher {
        published: Mutex::new(Vec::new()),
        fail_tenant: Some("globex".to_string()),
    });
    let relay = OutboxRelay::new(
        outbox.clone(),
        publisher.clone(),
        Arc::new(Metrics::new()?),
        RelayConfig::default(),
    );

    let report = relay.relay_once().await?;
    assert_eq!(report.published, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.deferred, 0);

    let published: Vec<OutboxEventType> = publisher
        .published
        .lock()
        .iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        published,
        vec![OutboxEventType::Created, OutboxEventType::StatusChanged]
    );

    assert!(outbox.find_unprocessed(TENANT, 10).await?.is_empty());
    assert!(outbox.find_unprocessed("globex", 10).await?.is_empty());

    let second = relay.relay_once().await?;
    assert_eq!(second.published + second.failed, 0);

    Ok(())
}

/// Publisher whose connection drops for the first `outage` calls.
struct ReconnectingPublisher {
    outage: AtomicUsize,
    published: Mutex<Vec<OutboxEvent>>,
}

#[async_trait]
impl EventPublisher for ReconnectingPublisher {
    async fn publish(&self, event: &OutboxEvent) -> delivery_service::Result<()> {
        let down = self
            .outage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if down {
            return Err(Error::Broker("connection reset by peer".to_string()));
        }
        self.published.lock().push(event.clone());
        Ok(())
    }
}

/// Test: Events survive a broker outage and are published once it reconnects
#[tokio::test]
async fn test_relay_defers_while_broker_is_down() -> Result<()> {
    let (_, repository, outbox) = setup();

    let created = repository.create(new_sms(TENANT)).await?;
    repository
        .update_status(TENANT, created.id, 1, NotificationStatus::Queued)
        .await?;

    let publisher = Arc::new(ReconnectingPublisher {
        outage: AtomicUsize::new(1),
        published: Mutex::new(Vec::new()),
    });
    let relay = OutboxRelay::new(
        outbox.clone(),
        publisher.clone(),
        Arc::new(Metrics::new()?),
        RelayConfig::default(),
    );

    let during_outage = relay.relay_once().await?;
    assert_eq!(during_outage.published, 0);
    assert_eq!(during_outage.failed, 0);
    assert_eq!(during_outage.deferred, 1);

    let still_pending = outbox.find_unprocessed(TENANT, 10).await?;
    assert_eq!(still_pending.len(), 2);
    assert!(still_pending.iter().all(|e| e.status == OutboxStatus::Pending));

    let recovered = relay.relay_once().await?;
    assert_eq!(recovered.published, 2);
    assert_eq!(recovered.deferred, 0);
    assert!(outbox.find_unprocessed(TENANT, 10).await?.is_empty());

    let published: Vec<OutboxEventType> = publisher
        .published
        .lock()
        .iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        published,
        vec![OutboxEventType::Created, OutboxEventType::StatusChanged]
    );

    Ok(())
}

/// Test: The spawned relay picks up new events and stops on cancellation
#[tokio::test]
async fn test_relay_loop_runs_until_cancelled() -> Result<()> {
    let (_, repository, outbox) = setup();
    let publisher = Arc::new(RecordingPublisher::default());

    let token = CancellationToken::new();
    let handle = OutboxRelay::new(
        outbox,
        publisher.clone(),
        Arc::new(Metrics::new()?),
        RelayConfig {
            poll_interval: Duration::from_millis(20),
            ..RelayConfig::default()
        },
    )
    .spawn(token.clone());

    repository.create(new_sms(TENANT)).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while publisher.published.lock().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "event never relayed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle).await??;

    Ok(())
}
