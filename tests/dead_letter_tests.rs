use anyhow::Result;
use delivery_service::{
    Error,
    models::{
        notification::ChannelType, response::PageRequest, status::NotificationStatus,
    },
    pipeline::SubmitOutcome,
};
use uuid::Uuid;

use crate::common::{Outcome, ScriptedSender, TENANT, fast_retry, generous_limits, harness, new_sms};

/// Test: A record is quarantined after exactly max_attempts transient failures
#[tokio::test]
async fn test_quarantine_threshold() -> Result<()> {
    for max_attempts in [1, 3, 5] {
        let sender = ScriptedSender::always(ChannelType::Sms, Outcome::Transient);
        let h = harness(sender.clone(), fast_retry(max_attempts), generous_limits());

        let queued = h.service.submit(new_sms(TENANT)).await?.notification().clone();
        let job = h.queue.try_dequeue().expect("job queued");

        let result = h.service.handle(job).await;
        assert!(matches!(result, Err(Error::TransientDelivery(_))));
        assert_eq!(sender.calls(), max_attempts as usize);

        let failed = h.service.repository().find_by_id(TENANT, queued.id).await?;
        assert_eq!(failed.status, NotificationStatus::Failed);
        assert_eq!(failed.retry_count, max_attempts);

        let entries = h
            .service
            .dead_letters()
            .list(TENANT, PageRequest::default())
            .await?;
        assert_eq!(entries.total, 1, "max_attempts = {}", max_attempts);
        assert_eq!(entries.items[0].original_id, queued.id);
        assert_eq!(entries.items[0].retry_count, max_attempts);
        assert_eq!(h.metrics.dead_letters.get(), 1);
    }

    Ok(())
}

/// Test: should_quarantine compares the attempt count against the budget
#[tokio::test]
async fn test_should_quarantine_boundary() -> Result<()> {
    let sender = ScriptedSender::always(ChannelType::Sms, Outcome::Sent);
    let h = harness(sender, fast_retry(3), generous_limits());
    let dlq = h.service.dead_letters();

    let mut notification = h.service.repository().create(new_sms(TENANT)).await?;
    assert_eq!(dlq.max_retries(), 3);

    notification.retry_count = 2;
    assert!(!dlq.should_quarantine(&notification));
    notification.retry_count = 3;
    assert!(dlq.should_quarantine(&notification));

    Ok(())
}

/// Test: A successful replay sends the original record and removes the entry
#[tokio::test]
async fn test_replay_success_resolves_entry() -> Result<()> {
    let sender = ScriptedSender::new(ChannelType::Sms, [Outcome::Permanent]);
    let h = harness(sender.clone(), fast_retry(3), generous_limits());

    let queued = h.service.submit(new_sms(TENANT)).await?.notification().clone();
    let job = h.queue.try_dequeue().expect("job queued");
    assert!(matches!(
        h.service.handle(job).await,
        Err(Error::PermanentDelivery(_))
    ));
    assert_eq!(sender.calls(), 1, "permanent failures are not retried");

    let entry = h
        .service
        .dead_letters()
        .list(TENANT, PageRequest::default())
        .await?
        .items
        .remove(0);

    let sent = h.service.retry_dead_letter(TENANT, entry.id).await?;
    assert_eq!(sent.id, queued.id);
    assert_eq!(sent.status, NotificationStatus::Sent);
    assert_eq!(sent.retry_count, 0);

    assert!(matches!(
        h.service.dead_letters().get(TENANT, entry.id).await,
        Err(Error::NotFound { .. })
    ));
    assert_eq!(h.metrics.dead_letters.get(), 0);

    Ok(())
}

/// Test: A failed replay refreshes the existing entry instead of adding another
#[tokio::test]
async fn test_replay_failure_is_idempotent() -> Result<()> {
    let sender = ScriptedSender::always(ChannelType::Sms, Outcome::Permanent);
    let h = harness(sender.clone(), fast_retry(2), generous_limits());

    h.service.submit(new_sms(TENANT)).await?;
    let job = h.queue.try_dequeue().expect("job queued");
    let _ = h.service.handle(job).await;

    let entry = h
        .service
        .dead_letters()
        .list(TENANT, PageRequest::default())
        .await?
        .items
        .remove(0);

    for _ in 0..2 {
        let replay = h.service.retry_dead_letter(TENANT, entry.id).await;
        assert!(matches!(replay, Err(Error::PermanentDelivery(_))));
    }

    let entries = h
        .service
        .dead_letters()
        .list(TENANT, PageRequest::default())
        .await?;
    assert_eq!(entries.total, 1);
    assert_eq!(entries.items[0].id, entry.id);
    assert!(entries.items[0].failed_at >= entry.failed_at);
    assert_eq!(sender.calls(), 3);
    assert_eq!(h.metrics.dead_letters.get(), 1);

    Ok(())
}

/// Test: Replaying after the original was deleted creates a fresh record
#[tokio::test]
async fn test_replay_of_deleted_original_creates_new_record() -> Result<()> {
    let sender = ScriptedSender::new(ChannelType::Sms, [Outcome::Permanent]);
    let h = harness(sender, fast_retry(3), generous_limits());

    let original = match h.service.submit(new_sms(TENANT)).await? {
        SubmitOutcome::Accepted(n) => n,
        other => panic!("unexpected outcome {:?}", other),
    };
    let job = h.queue.try_dequeue().expect("job queued");
    let _ = h.service.handle(job).await;

    let failed = h.service.repository().find_by_id(TENANT, original.id).await?;
    h.service
        .repository()
        .soft_delete(TENANT, original.id, failed.version)
        .await?;

    let entry = h
        .service
        .dead_letters()
        .list(TENANT, PageRequest::default())
        .await?
        .items
        .remove(0);

    let sent = h.service.retry_dead_letter(TENANT, entry.id).await?;
    assert_ne!(sent.id, original.id);
    assert_eq!(sent.status, NotificationStatus::Sent);
    assert_eq!(sent.request, original.request);

    Ok(())
}

/// Test: Entries are tenant scoped
#[tokio::test]
async fn test_entries_are_tenant_scoped() -> Result<()> {
    let sender = ScriptedSender::always(ChannelType::Sms, Outcome::Permanent);
    let h = harness(sender, fast_retry(1), generous_limits());

    h.service.submit(new_sms(TENANT)).await?;
    let _ = h.service.handle(h.queue.try_dequeue().expect("job")).await;

    let entry = h
        .service
        .dead_letters()
        .list(TENANT, PageRequest::default())
        .await?
        .items
        .remove(0);

    assert!(matches!(
        h.service.dead_letters().get("globex", entry.id).await,
        Err(Error::NotFound { .. })
    ));
    assert!(matches!(
        h.service.retry_dead_letter("globex", entry.id).await,
        Err(Error::NotFound { .. })
    ));
    assert!(matches!(
        h.service.retry_dead_letter(TENANT, Uuid::new_v4()).await,
        Err(Error::NotFound { .. })
    ));

    Ok(())
}
