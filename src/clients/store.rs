//! Storage collaborator interfaces.
//!
//! The pipeline is written against these traits so any store offering atomic
//! multi-document writes can back it. Every read and write is scoped by
//! tenant; there are no unscoped lookups by id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    Result,
    models::{
        dead_letter::FailedNotification,
        notification::{Notification, NotificationFilter},
        outbox::OutboxEvent,
        response::{Page, PageRequest},
    },
};

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Opens an atomic unit of work. Dropping it without `commit` discards it.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    /// Returns the record even when soft-deleted; callers decide visibility.
    async fn find_notification(&self, tenant_id: &str, id: Uuid) -> Result<Option<Notification>>;

    /// Only considers records that are not soft-deleted.
    async fn find_by_idempotency_key(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> Result<Option<Notification>>;

    /// Newest first, soft-deleted records excluded.
    async fn list_notifications(
        &self,
        tenant_id: &str,
        filter: &NotificationFilter,
        page: PageRequest,
    ) -> Result<Page<Notification>>;

    /// Tenants with live records in `pending`, `queued` or `sending`.
    async fn undispatched_tenants(&self, limit: usize) -> Result<Vec<String>>;

    /// A tenant's live `pending`, `queued` and `sending` records, oldest first.
    async fn find_undispatched(&self, tenant_id: &str, limit: usize) -> Result<Vec<Notification>>;

    /// Oldest first.
    async fn find_events_by_aggregate(
        &self,
        tenant_id: &str,
        aggregate_id: Uuid,
    ) -> Result<Vec<OutboxEvent>>;

    /// Pending events, oldest first.
    async fn find_unprocessed_events(&self, tenant_id: &str, limit: usize)
    -> Result<Vec<OutboxEvent>>;

    /// Tenants that currently have pending events.
    async fn pending_event_tenants(&self, limit: usize) -> Result<Vec<String>>;

    /// Replaces the event if its stored version still equals `expected_version`.
    async fn update_outbox_event(&self, event: &OutboxEvent, expected_version: i64)
    -> Result<bool>;

    /// Deletes processed events whose `processed_at` is before `cutoff`.
    async fn delete_processed_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn find_failed_notification(
        &self,
        tenant_id: &str,
        id: Uuid,
    ) -> Result<Option<FailedNotification>>;

    /// Most recent failures first.
    async fn list_failed_notifications(
        &self,
        tenant_id: &str,
        page: PageRequest,
    ) -> Result<Page<FailedNotification>>;

    async fn ping(&self) -> Result<()>;
}

#[async_trait]
pub trait StoreTransaction: Send {
    async fn get_notification(&mut self, tenant_id: &str, id: Uuid)
    -> Result<Option<Notification>>;

    async fn find_by_idempotency_key(
        &mut self,
        tenant_id: &str,
        key: &str,
    ) -> Result<Option<Notification>>;

    async fn insert_notification(&mut self, notification: &Notification) -> Result<()>;

    /// Writes `notification` if the stored version equals `expected_version`.
    /// Returns `false` when the stored version has moved on.
    async fn update_notification(
        &mut self,
        notification: &Notification,
        expected_version: i64,
    ) -> Result<bool>;

    async fn insert_outbox_event(&mut self, event: &OutboxEvent) -> Result<()>;

    async fn get_failed_notification(
        &mut self,
        tenant_id: &str,
        id: Uuid,
    ) -> Result<Option<FailedNotification>>;

    async fn insert_failed_notification(&mut self, entry: &FailedNotification) -> Result<()>;

    async fn update_failed_notification(&mut self, entry: &FailedNotification) -> Result<()>;

    async fn delete_failed_notification(&mut self, tenant_id: &str, id: Uuid) -> Result<bool>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
