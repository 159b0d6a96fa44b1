//! In-process document store.
//!
//! Transactions take the store lock for their whole lifetime and stage writes
//! locally, so a transaction is either applied completely on `commit` or not
//! at all.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{
    Error, Result,
    clients::store::{DocumentStore, StoreTransaction},
    models::{
        dead_letter::FailedNotification,
        notification::{Notification, NotificationFilter},
        outbox::OutboxEvent,
        response::{Page, PageRequest},
        status::OutboxStatus,
    },
};

type Key = (String, Uuid);

fn key(tenant_id: &str, id: Uuid) -> Key {
    (tenant_id.to_string(), id)
}

fn awaits_dispatch(notification: &Notification) -> bool {
    !notification.is_deleted() && !notification.status.is_settled()
}

#[derive(Default)]
struct MemoryState {
    notifications: HashMap<Key, Notification>,
    outbox: Vec<OutboxEvent>,
    failed: HashMap<Key, FailedNotification>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let guard = self.state.clone().lock_owned().await;

        Ok(Box::new(MemoryTransaction {
            state: guard,
            notifications: HashMap::new(),
            events: Vec::new(),
            failed: HashMap::new(),
        }))
    }

    async fn find_notification(&self, tenant_id: &str, id: Uuid) -> Result<Option<Notification>> {
        let state = self.state.lock().await;
        Ok(state.notifications.get(&key(tenant_id, id)).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<Notification>> {
        let state = self.state.lock().await;

        Ok(state
            .notifications
            .values()
            .find(|n| {
                n.tenant_id == tenant_id
                    && !n.is_deleted()
                    && n.idempotency_key.as_deref() == Some(idempotency_key)
            })
            .cloned())
    }

    async fn list_notifications(
        &self,
        tenant_id: &str,
        filter: &NotificationFilter,
        page: PageRequest,
    ) -> Result<Page<Notification>> {
        let state = self.state.lock().await;

        let mut items: Vec<Notification> = state
            .notifications
            .values()
            .filter(|n| n.tenant_id == tenant_id && !n.is_deleted() && filter.matches(n))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(Page::from_sorted(items, page))
    }

    async fn undispatched_tenants(&self, limit: usize) -> Result<Vec<String>> {
        let state = self.state.lock().await;

        let mut live: Vec<&Notification> = state
            .notifications
            .values()
            .filter(|n| awaits_dispatch(n))
            .collect();
        live.sort_by_key(|n| n.created_at);

        let mut tenants: Vec<String> = Vec::new();
        for notification in live {
            if tenants.len() >= limit {
                break;
            }
            if !tenants.contains(&notification.tenant_id) {
                tenants.push(notification.tenant_id.clone());
            }
        }

        Ok(tenants)
    }

    async fn find_undispatched(&self, tenant_id: &str, limit: usize) -> Result<Vec<Notification>> {
        let state = self.state.lock().await;

        let mut items: Vec<Notification> = state
            .notifications
            .values()
            .filter(|n| n.tenant_id == tenant_id && awaits_dispatch(n))
            .cloned()
            .collect();
        items.sort_by_key(|n| n.created_at);
        items.truncate(limit);

        Ok(items)
    }

    async fn find_events_by_aggregate(
        &self,
        tenant_id: &str,
        aggregate_id: Uuid,
    ) -> Result<Vec<OutboxEvent>> {
        let state = self.state.lock().await;

        Ok(state
            .outbox
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.aggregate_id == aggregate_id)
            .cloned()
            .collect())
    }

    async fn find_unprocessed_events(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>> {
        let state = self.state.lock().await;

        Ok(state
            .outbox
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.status == OutboxStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn pending_event_tenants(&self, limit: usize) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let mut tenants: Vec<String> = Vec::new();

        for event in state
            .outbox
            .iter()
            .filter(|e| e.status == OutboxStatus::Pending)
        {
            if tenants.len() >= limit {
                break;
            }
            if !tenants.contains(&event.tenant_id) {
                tenants.push(event.tenant_id.clone());
            }
        }

        Ok(tenants)
    }

    async fn update_outbox_event(
        &self,
        event: &OutboxEvent,
        expected_version: i64,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;

        let Some(stored) = state
            .outbox
            .iter_mut()
            .find(|e| e.id == event.id && e.tenant_id == event.tenant_id)
        else {
            return Ok(false);
        };

        if stored.version != expected_version {
            return Ok(false);
        }

        *stored = event.clone();
        Ok(true)
    }

    async fn delete_processed_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.outbox.len();

        state.outbox.retain(|e| {
            !(e.status == OutboxStatus::Processed && e.processed_at.is_some_and(|at| at < cutoff))
        });

        Ok((before - state.outbox.len()) as u64)
    }

    async fn find_failed_notification(
        &self,
        tenant_id: &str,
        id: Uuid,
    ) -> Result<Option<FailedNotification>> {
        let state = self.state.lock().await;
        Ok(state.failed.get(&key(tenant_id, id)).cloned())
    }

    async fn list_failed_notifications(
        &self,
        tenant_id: &str,
        page: PageRequest,
    ) -> Result<Page<FailedNotification>> {
        let state = self.state.lock().await;

        let mut items: Vec<FailedNotification> = state
            .failed
            .values()
            .filter(|f| f.tenant_id == tenant_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));

        Ok(Page::from_sorted(items, page))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

pub struct MemoryTransaction {
    state: OwnedMutexGuard<MemoryState>,
    notifications: HashMap<Key, Notification>,
    events: Vec<OutboxEvent>,
    /// `None` marks a staged delete.
    failed: HashMap<Key, Option<FailedNotification>>,
}

impl MemoryTransaction {
    fn visible(&self, k: &Key) -> Option<&Notification> {
        self.notifications
            .get(k)
            .or_else(|| self.state.notifications.get(k))
    }

    fn visible_notifications(&self) -> impl Iterator<Item = &Notification> {
        self.notifications.values().chain(
            self.state
                .notifications
                .iter()
                .filter(|(k, _)| !self.notifications.contains_key(*k))
                .map(|(_, n)| n),
        )
    }

    fn visible_failed(&self, k: &Key) -> Option<&FailedNotification> {
        match self.failed.get(k) {
            Some(staged) => staged.as_ref(),
            None => self.state.failed.get(k),
        }
    }

    fn check_idempotency_unique(&self, notification: &Notification) -> Result<()> {
        let Some(idempotency_key) = notification.idempotency_key.as_deref() else {
            return Ok(());
        };
        if notification.is_deleted() {
            return Ok(());
        }

        let taken = self.visible_notifications().any(|n| {
            n.id != notification.id
                && n.tenant_id == notification.tenant_id
                && !n.is_deleted()
                && n.idempotency_key.as_deref() == Some(idempotency_key)
        });

        if taken {
            return Err(Error::Conflict(format!(
                "idempotency key '{}' is already in use",
                idempotency_key
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn get_notification(
        &mut self,
        tenant_id: &str,
        id: Uuid,
    ) -> Result<Option<Notification>> {
        Ok(self.visible(&key(tenant_id, id)).cloned())
    }

    async fn find_by_idempotency_key(
        &mut self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<Notification>> {
        Ok(self
            .visible_notifications()
            .find(|n| {
                n.tenant_id == tenant_id
                    && !n.is_deleted()
                    && n.idempotency_key.as_deref() == Some(idempotency_key)
            })
            .cloned())
    }

    async fn insert_notification(&mut self, notification: &Notification) -> Result<()> {
        let k = key(&notification.tenant_id, notification.id);

        if self.visible(&k).is_some() {
            return Err(Error::Conflict(format!(
                "notification {} already exists",
                notification.id
            )));
        }
        self.check_idempotency_unique(notification)?;

        self.notifications.insert(k, notification.clone());
        Ok(())
    }

    async fn update_notification(
        &mut self,
        notification: &Notification,
        expected_version: i64,
    ) -> Result<bool> {
        let k = key(&notification.tenant_id, notification.id);

        match self.visible(&k) {
            Some(stored) if stored.version == expected_version => {}
            _ => return Ok(false),
        }
        self.check_idempotency_unique(notification)?;

        self.notifications.insert(k, notification.clone());
        Ok(true)
    }

    async fn insert_outbox_event(&mut self, event: &OutboxEvent) -> Result<()> {
        self.events.push(event.clone());
        Ok(())
    }

    async fn get_failed_notification(
        &mut self,
        tenant_id: &str,
        id: Uuid,
    ) -> Result<Option<FailedNotification>> {
        Ok(self.visible_failed(&key(tenant_id, id)).cloned())
    }

    async fn insert_failed_notification(&mut self, entry: &FailedNotification) -> Result<()> {
        let k = key(&entry.tenant_id, entry.id);

        if self.visible_failed(&k).is_some() {
            return Err(Error::Conflict(format!(
                "dead letter {} already exists",
                entry.id
            )));
        }

        self.failed.insert(k, Some(entry.clone()));
        Ok(())
    }

    async fn update_failed_notification(&mut self, entry: &FailedNotification) -> Result<()> {
        let k = key(&entry.tenant_id, entry.id);

        if self.visible_failed(&k).is_none() {
            return Err(Error::not_found("failed_notification", entry.id));
        }

        self.failed.insert(k, Some(entry.clone()));
        Ok(())
    }

    async fn delete_failed_notification(&mut self, tenant_id: &str, id: Uuid) -> Result<bool> {
        let k = key(tenant_id, id);

        if self.visible_failed(&k).is_none() {
            return Ok(false);
        }

        self.failed.insert(k, None);
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction {
            mut state,
            notifications,
            events,
            failed,
        } = *self;

        state.notifications.extend(notifications);
        state.outbox.extend(events);

        for (k, entry) in failed {
            match entry {
                Some(entry) => {
                    state.failed.insert(k, entry);
                }
                None => {
                    state.failed.remove(&k);
                }
            }
        }

        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
