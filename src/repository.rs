//! Notification records with optimistic concurrency.
//!
//! Every mutation runs in one store transaction that re-reads the record,
//! checks the caller's expected version, writes version + 1 and stages the
//! matching outbox event. Optional dead letter writes ride along in the same
//! transaction.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    Error, Result,
    clients::store::{DocumentStore, StoreTransaction},
    models::{
        dead_letter::FailedNotification,
        notification::{NewNotification, Notification, NotificationFilter, NotificationUpdate},
        outbox::{OutboxEvent, OutboxEventType},
        response::{Page, PageRequest},
        status::NotificationStatus,
    },
    outbox::Outbox,
};

const ENTITY: &str = "notification";

/// Dead letter write committed together with a status change.
#[derive(Debug, Clone, Default)]
pub enum DeadLetterWrite {
    #[default]
    None,
    Insert(FailedNotification),
    Update(FailedNotification),
    Delete(Uuid),
}

impl DeadLetterWrite {
    async fn apply(self, tx: &mut dyn StoreTransaction, tenant_id: &str) -> Result<()> {
        match self {
            DeadLetterWrite::None => Ok(()),
            DeadLetterWrite::Insert(entry) => tx.insert_failed_notification(&entry).await,
            DeadLetterWrite::Update(entry) => tx.update_failed_notification(&entry).await,
            DeadLetterWrite::Delete(id) => {
                if !tx.delete_failed_notification(tenant_id, id).await? {
                    return Err(Error::not_found("failed_notification", id));
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visibility {
    Live,
    Deleted,
}

struct Mutation {
    event_type: OutboxEventType,
    visibility: Visibility,
    dead_letter: DeadLetterWrite,
}

impl Mutation {
    fn live(event_type: OutboxEventType) -> Self {
        Self {
            event_type,
            visibility: Visibility::Live,
            dead_letter: DeadLetterWrite::None,
        }
    }
}

#[derive(Clone)]
pub struct NotificationRepository {
    store: Arc<dyn DocumentStore>,
}

impl NotificationRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Persists a new record at version 1 together with its `created` event.
    pub async fn create(&self, new: NewNotification) -> Result<Notification> {
        new.validate()?;

        let notification = Notification::from_new(new, Utc::now());
        let mut tx = self.store.begin().await?;

        match Self::create_in(&mut *tx, &notification).await {
            Ok(()) => tx.commit().await?,
            Err(e) => {
                Self::abort(tx).await;
                return Err(e);
            }
        }

        info!(
            notification_id = %notification.id,
            tenant_id = %notification.tenant_id,
            channel = %notification.channel(),
            priority = %notification.priority,
            "Notification created"
        );

        Ok(notification)
    }

    async fn create_in(tx: &mut dyn StoreTransaction, notification: &Notification) -> Result<()> {
        if let Some(key) = notification.idempotency_key.as_deref() {
            if let Some(existing) = tx
                .find_by_idempotency_key(&notification.tenant_id, key)
                .await?
            {
                return Err(Error::DuplicateIdempotencyKey {
                    key: key.to_string(),
                    existing_id: existing.id,
                });
            }
        }

        tx.insert_notification(notification).await?;

        let event = OutboxEvent::for_notification(OutboxEventType::Created, None, notification)?;
        Outbox::append_within_transaction(tx, &event).await
    }

    /// Soft-deleted records are reported as missing.
    pub async fn find_by_id(&self, tenant_id: &str, id: Uuid) -> Result<Notification> {
        match self.store.find_notification(tenant_id, id).await? {
            Some(notification) if !notification.is_deleted() => Ok(notification),
            _ => Err(Error::not_found(ENTITY, id)),
        }
    }

    pub async fn find_by_idempotency_key(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> Result<Option<Notification>> {
        self.store.find_by_idempotency_key(tenant_id, key).await
    }

    pub async fn list(
        &self,
        tenant_id: &str,
        filter: &NotificationFilter,
        page: PageRequest,
    ) -> Result<Page<Notification>> {
        self.store.list_notifications(tenant_id, filter, page).await
    }

    /// Content changes are only accepted before sending starts.
    pub async fn update(
        &self,
        tenant_id: &str,
        id: Uuid,
        expected_version: i64,
        update: NotificationUpdate,
    ) -> Result<Notification> {
        if let Some(request) = &update.request {
            request.validate()?;
        }

        self.mutate(
            tenant_id,
            id,
            expected_version,
            Mutation::live(OutboxEventType::Updated),
            move |n| {
                if !matches!(
                    n.status,
                    NotificationStatus::Pending | NotificationStatus::Queued
                ) {
                    return Err(Error::InvalidState(format!(
                        "notification in status {} can no longer be edited",
                        n.status
                    )));
                }

                if let Some(priority) = update.priority {
                    n.priority = priority;
                }
                if let Some(request) = update.request {
                    n.request = request;
                }
                if update.scheduled_for.is_some() {
                    n.scheduled_for = update.scheduled_for;
                }
                if update.expires_at.is_some() {
                    n.expires_at = update.expires_at;
                }
                Ok(())
            },
        )
        .await
    }

    pub async fn update_status(
        &self,
        tenant_id: &str,
        id: Uuid,
        expected_version: i64,
        status: NotificationStatus,
    ) -> Result<Notification> {
        self.transition(
            tenant_id,
            id,
            expected_version,
            status,
            None,
            DeadLetterWrite::None,
        )
        .await
    }

    /// Status change that also records `error` and applies `dead_letter` in
    /// the same transaction.
    pub async fn transition(
        &self,
        tenant_id: &str,
        id: Uuid,
        expected_version: i64,
        status: NotificationStatus,
        error: Option<String>,
        dead_letter: DeadLetterWrite,
    ) -> Result<Notification> {
        let mutation = Mutation {
            event_type: OutboxEventType::StatusChanged,
            visibility: Visibility::Live,
            dead_letter,
        };

        let updated = self
            .mutate(tenant_id, id, expected_version, mutation, move |n| {
                n.transition(status, Utc::now())?;
                if error.is_some() {
                    n.error = error;
                }
                Ok(())
            })
            .await?;

        debug!(
            notification_id = %id,
            tenant_id,
            status = %updated.status,
            version = updated.version,
            "Notification status updated"
        );

        Ok(updated)
    }

    /// Counts one failed attempt while the record stays in its current status.
    pub async fn increment_retry(
        &self,
        tenant_id: &str,
        id: Uuid,
        expected_version: i64,
        error: &str,
    ) -> Result<Notification> {
        let error = error.to_string();

        self.mutate(
            tenant_id,
            id,
            expected_version,
            Mutation::live(OutboxEventType::Updated),
            move |n| {
                n.retry_count = n.retry_count.saturating_add(1);
                n.error = Some(error);
                Ok(())
            },
        )
        .await
    }

    pub async fn soft_delete(
        &self,
        tenant_id: &str,
        id: Uuid,
        expected_version: i64,
    ) -> Result<Notification> {
        let deleted = self
            .mutate(
                tenant_id,
                id,
                expected_version,
                Mutation::live(OutboxEventType::Deleted),
                |n| {
                    n.deleted_at = Some(Utc::now());
                    Ok(())
                },
            )
            .await?;

        info!(notification_id = %id, tenant_id, "Notification soft-deleted");
        Ok(deleted)
    }

    /// Only valid for a record that is currently soft-deleted.
    pub async fn restore(
        &self,
        tenant_id: &str,
        id: Uuid,
        expected_version: i64,
    ) -> Result<Notification> {
        let mutation = Mutation {
            event_type: OutboxEventType::Restored,
            visibility: Visibility::Deleted,
            dead_letter: DeadLetterWrite::None,
        };

        let restored = self
            .mutate(tenant_id, id, expected_version, mutation, |n| {
                n.deleted_at = None;
                Ok(())
            })
            .await?;

        info!(notification_id = %id, tenant_id, "Notification restored");
        Ok(restored)
    }

    /// `failed -> pending` for a dead letter replay. Resets the attempt budget.
    pub async fn reopen_for_replay(
        &self,
        tenant_id: &str,
        id: Uuid,
        expected_version: i64,
    ) -> Result<Notification> {
        self.mutate(
            tenant_id,
            id,
            expected_version,
            Mutation::live(OutboxEventType::StatusChanged),
            |n| {
                if n.status != NotificationStatus::Failed {
                    return Err(Error::InvalidStateTransition {
                        from: n.status,
                        to: NotificationStatus::Pending,
                    });
                }

                n.status = NotificationStatus::Pending;
                n.retry_count = 0;
                n.error = None;
                Ok(())
            },
        )
        .await
    }

    async fn mutate<F>(
        &self,
        tenant_id: &str,
        id: Uuid,
        expected_version: i64,
        mutation: Mutation,
        apply: F,
    ) -> Result<Notification>
    where
        F: FnOnce(&mut Notification) -> Result<()> + Send,
    {
        let mut tx = self.store.begin().await?;

        let result =
            Self::mutate_in(&mut *tx, tenant_id, id, expected_version, mutation, apply).await;

        match result {
            Ok(next) => {
                tx.commit().await?;
                Ok(next)
            }
            Err(e) => {
                Self::abort(tx).await;
                Err(e)
            }
        }
    }

    async fn mutate_in<F>(
        tx: &mut dyn StoreTransaction,
        tenant_id: &str,
        id: Uuid,
        expected_version: i64,
        mutation: Mutation,
        apply: F,
    ) -> Result<Notification>
    where
        F: FnOnce(&mut Notification) -> Result<()> + Send,
    {
        let current = tx
            .get_notification(tenant_id, id)
            .await?
            .ok_or_else(|| Error::not_found(ENTITY, id))?;

        match mutation.visibility {
            Visibility::Live if current.is_deleted() => return Err(Error::not_found(ENTITY, id)),
            Visibility::Deleted if !current.is_deleted() => {
                return Err(Error::InvalidState(format!(
                    "notification {} is not deleted",
                    id
                )));
            }
            _ => {}
        }

        if current.version != expected_version {
            return Err(Error::OptimisticLockConflict {
                entity: ENTITY,
                id,
                expected: expected_version,
            });
        }

        let mut next = current.clone();
        apply(&mut next)?;
        next.version = current.version + 1;
        next.updated_at = Utc::now();

        if !tx.update_notification(&next, expected_version).await? {
            return Err(Error::OptimisticLockConflict {
                entity: ENTITY,
                id,
                expected: expected_version,
            });
        }

        let event = OutboxEvent::for_notification(mutation.event_type, Some(&current), &next)?;
        Outbox::append_within_transaction(tx, &event).await?;

        mutation.dead_letter.apply(tx, tenant_id).await?;

        Ok(next)
    }

    async fn abort(tx: Box<dyn StoreTransaction>) {
        if let Err(e) = tx.rollback().await {
            warn!(error = %e, "Failed to roll back transaction");
        }
    }
}
