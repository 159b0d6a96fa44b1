//! Quarantine for notifications that exhausted their delivery budget.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    Error, Result,
    models::{
        dead_letter::FailedNotification,
        notification::Notification,
        response::{Page, PageRequest},
        status::NotificationStatus,
    },
    repository::{DeadLetterWrite, NotificationRepository},
};

/// Delivery path used for replays. Implementations settle `entry` in the same
/// transaction as the delivery outcome: deleted on success, updated on
/// failure.
#[async_trait]
pub trait Redelivery: Send + Sync {
    async fn redeliver(
        &self,
        notification: Notification,
        entry: &FailedNotification,
    ) -> Result<Notification>;
}

#[derive(Clone)]
pub struct DeadLetterQueue {
    repository: NotificationRepository,
    max_retries: u32,
}

impl DeadLetterQueue {
    pub fn new(repository: NotificationRepository, max_retries: u32) -> Self {
        Self {
            repository,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn should_quarantine(&self, notification: &Notification) -> bool {
        notification.retry_count >= self.max_retries
    }

    /// Moves a `sending` record to `failed` and stores its snapshot, atomically.
    pub async fn add(&self, notification: &Notification, error: &str) -> Result<Notification> {
        let mut snapshot = notification.clone();
        snapshot.error = Some(error.to_string());
        let entry = FailedNotification::snapshot(&snapshot, error);
        let entry_id = entry.id;

        let failed = self
            .repository
            .transition(
                &notification.tenant_id,
                notification.id,
                notification.version,
                NotificationStatus::Failed,
                Some(error.to_string()),
                DeadLetterWrite::Insert(entry),
            )
            .await?;

        warn!(
            notification_id = %notification.id,
            tenant_id = %notification.tenant_id,
            dead_letter_id = %entry_id,
            retry_count = notification.retry_count,
            error,
            "Notification quarantined"
        );

        Ok(failed)
    }

    /// Failure of a replay: the existing entry is refreshed, never duplicated.
    pub async fn record_replay_failure(
        &self,
        notification: &Notification,
        entry: &FailedNotification,
        error: &str,
    ) -> Result<Notification> {
        let mut refreshed = entry.clone();
        refreshed.original_id = notification.id;
        refreshed.error = error.to_string();
        refreshed.failed_at = Utc::now();
        refreshed.retry_count = notification.retry_count;

        self.repository
            .transition(
                &notification.tenant_id,
                notification.id,
                notification.version,
                NotificationStatus::Failed,
                Some(error.to_string()),
                DeadLetterWrite::Update(refreshed),
            )
            .await
    }

    /// Success of a replay: `sent` and the entry removal commit together.
    pub async fn resolve(
        &self,
        notification: &Notification,
        entry: &FailedNotification,
    ) -> Result<Notification> {
        let sent = self
            .repository
            .transition(
                &notification.tenant_id,
                notification.id,
                notification.version,
                NotificationStatus::Sent,
                None,
                DeadLetterWrite::Delete(entry.id),
            )
            .await?;

        info!(
            notification_id = %notification.id,
            tenant_id = %notification.tenant_id,
            dead_letter_id = %entry.id,
            "Dead letter resolved"
        );

        Ok(sent)
    }

    pub async fn get(&self, tenant_id: &str, id: Uuid) -> Result<FailedNotification> {
        self.repository
            .store()
            .find_failed_notification(tenant_id, id)
            .await?
            .ok_or_else(|| Error::not_found("failed_notification", id))
    }

    pub async fn list(
        &self,
        tenant_id: &str,
        page: PageRequest,
    ) -> Result<Page<FailedNotification>> {
        self.repository
            .store()
            .list_failed_notifications(tenant_id, page)
            .await
    }

    /// Replays an entry through `redelivery`. The original record is reopened
    /// when it is still live and failed; otherwise a new record is created
    /// from the snapshot.
    pub async fn retry(
        &self,
        tenant_id: &str,
        id: Uuid,
        redelivery: &dyn Redelivery,
    ) -> Result<Notification> {
        let entry = self.get(tenant_id, id).await?;

        let original = self
            .repository
            .store()
            .find_notification(tenant_id, entry.original_id)
            .await?;

        let notification = match original {
            Some(original)
                if !original.is_deleted() && original.status == NotificationStatus::Failed =>
            {
                self.repository
                    .reopen_for_replay(tenant_id, original.id, original.version)
                    .await?
            }
            _ => self.repository.create(entry.to_new_notification()).await?,
        };

        info!(
            dead_letter_id = %id,
            notification_id = %notification.id,
            tenant_id,
            "Replaying dead letter"
        );

        redelivery.redeliver(notification, &entry).await
    }
}
