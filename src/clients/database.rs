//! PostgreSQL implementation of the document store.
//!
//! Reads and single-row status writes go through a shared reader connection.
//! Transactions run on a dedicated writer connection which is held exclusively
//! between `BEGIN` and `COMMIT`/`ROLLBACK`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{
    runtime::Handle,
    sync::{Mutex, OwnedMutexGuard},
};
use tokio_postgres::{Client, NoTls, Row, types::ToSql};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    Error, Result,
    clients::store::{DocumentStore, StoreTransaction},
    models::{
        dead_letter::FailedNotification,
        notification::{ChannelColumns, ChannelRequest, Notification, NotificationFilter},
        outbox::{OutboxEvent, OutboxEventType},
        response::{Page, PageRequest},
    },
};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const NOTIFICATION_COLUMNS: &str = "id, tenant_id, type, status, priority, recipient, subject, \
    body, headers, idempotency_key, retry_count, version, error, created_at, updated_at, \
    deleted_at, sent_at, delivered_at, read_at, clicked_at, scheduled_for, expires_at";

const OUTBOX_COLUMNS: &str = "id, tenant_id, aggregate_type, aggregate_id, event_type, payload, \
    status, error_count, last_error, version, trace_id, span_id, created_at, processed_at";

const FAILED_COLUMNS: &str = "id, original_id, tenant_id, priority, type, recipient, subject, \
    body, headers, error, failed_at, retry_count";

pub struct PostgresStore {
    reader: Client,
    writer: Arc<Mutex<Client>>,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting to PostgreSQL database");

        let reader = Self::open(database_url).await?;
        let writer = Self::open(database_url).await?;

        reader
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| Error::Store(format!("Failed to apply schema: {}", e)))?;

        info!("PostgreSQL connection established");

        Ok(Self {
            reader,
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    async fn open(database_url: &str) -> Result<Client> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| Error::Store(format!("Failed to connect to database: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection terminated");
            }
        });

        Ok(client)
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let client = self.writer.clone().lock_owned().await;
        client.batch_execute("BEGIN").await?;

        Ok(Box::new(PostgresTransaction {
            client: Some(client),
        }))
    }

    async fn find_notification(&self, tenant_id: &str, id: Uuid) -> Result<Option<Notification>> {
        select_notification(&self.reader, tenant_id, id, false).await
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> Result<Option<Notification>> {
        select_by_idempotency_key(&self.reader, tenant_id, key).await
    }

    async fn list_notifications(
        &self,
        tenant_id: &str,
        filter: &NotificationFilter,
        page: PageRequest,
    ) -> Result<Page<Notification>> {
        let status = filter.status.map(|s| s.as_str());
        let channel = filter.channel.map(|c| c.as_str());
        let recipient = filter.recipient.as_deref();

        let predicate = "tenant_id = $1 AND deleted_at IS NULL \
            AND ($2::text IS NULL OR status = $2) \
            AND ($3::text IS NULL OR type = $3) \
            AND ($4::text IS NULL OR recipient = $4)";

        let total: i64 = self
            .reader
            .query_one(
                &format!("SELECT COUNT(*) FROM notifications WHERE {}", predicate),
                &[&tenant_id, &status, &channel, &recipient],
            )
            .await?
            .try_get(0)?;

        let limit = page.limit as i64;
        let offset = page.offset() as i64;

        let rows = self
            .reader
            .query(
                &format!(
                    "SELECT {} FROM notifications WHERE {} \
                     ORDER BY created_at DESC LIMIT $5 OFFSET $6",
                    NOTIFICATION_COLUMNS, predicate
                ),
                &[&tenant_id, &status, &channel, &recipient, &limit, &offset],
            )
            .await?;

        let items = rows
            .iter()
            .map(notification_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total as u64,
            page: page.page,
            limit: page.limit,
        })
    }

    async fn undispatched_tenants(&self, limit: usize) -> Result<Vec<String>> {
        let limit = limit as i64;

        let rows = self
            .reader
            .query(
                "SELECT tenant_id FROM notifications WHERE deleted_at IS NULL \
                 AND status IN ('pending', 'queued', 'sending') \
                 GROUP BY tenant_id ORDER BY MIN(created_at) LIMIT $1",
                &[&limit],
            )
            .await?;

        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(Error::from))
            .collect()
    }

    async fn find_undispatched(&self, tenant_id: &str, limit: usize) -> Result<Vec<Notification>> {
        let limit = limit as i64;

        let rows = self
            .reader
            .query(
                &format!(
                    "SELECT {} FROM notifications WHERE tenant_id = $1 AND deleted_at IS NULL \
                     AND status IN ('pending', 'queued', 'sending') \
                     ORDER BY created_at LIMIT $2",
                    NOTIFICATION_COLUMNS
                ),
                &[&tenant_id, &limit],
            )
            .await?;

        rows.iter().map(notification_from_row).collect()
    }

    async fn find_events_by_aggregate(
        &self,
        tenant_id: &str,
        aggregate_id: Uuid,
    ) -> Result<Vec<OutboxEvent>> {
        let rows = self
            .reader
            .query(
                &format!(
                    "SELECT {} FROM outbox_events WHERE tenant_id = $1 AND aggregate_id = $2 \
                     ORDER BY seq",
                    OUTBOX_COLUMNS
                ),
                &[&tenant_id, &aggregate_id],
            )
            .await?;

        rows.iter().map(outbox_event_from_row).collect()
    }

    async fn find_unprocessed_events(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>> {
        let limit = limit as i64;

        let rows = self
            .reader
            .query(
                &format!(
                    "SELECT {} FROM outbox_events WHERE tenant_id = $1 AND status = 'pending' \
                     ORDER BY seq LIMIT $2",
                    OUTBOX_COLUMNS
                ),
                &[&tenant_id, &limit],
            )
            .await?;

        rows.iter().map(outbox_event_from_row).collect()
    }

    async fn pending_event_tenants(&self, limit: usize) -> Result<Vec<String>> {
        let limit = limit as i64;

        let rows = self
            .reader
            .query(
                "SELECT tenant_id FROM outbox_events WHERE status = 'pending' \
                 GROUP BY tenant_id ORDER BY MIN(seq) LIMIT $1",
                &[&limit],
            )
            .await?;

        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(Error::from))
            .collect()
    }

    async fn update_outbox_event(
        &self,
        event: &OutboxEvent,
        expected_version: i64,
    ) -> Result<bool> {
        let error_count = event.error_count as i32;
        let status = event.status.as_str();

        let updated = self
            .reader
            .execute(
                "UPDATE outbox_events SET status = $3, error_count = $4, last_error = $5, \
                 version = $6, processed_at = $7 \
                 WHERE tenant_id = $1 AND id = $2 AND version = $8",
                &[
                    &event.tenant_id,
                    &event.id,
                    &status,
                    &error_count,
                    &event.last_error,
                    &event.version,
                    &event.processed_at,
                    &expected_version,
                ],
            )
            .await?;

        Ok(updated == 1)
    }

    async fn delete_processed_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = self
            .reader
            .execute(
                "DELETE FROM outbox_events WHERE status = 'processed' AND processed_at < $1",
                &[&cutoff],
            )
            .await?;

        debug!(deleted, cutoff = %cutoff, "Pruned processed outbox events");

        Ok(deleted)
    }

    async fn find_failed_notification(
        &self,
        tenant_id: &str,
        id: Uuid,
    ) -> Result<Option<FailedNotification>> {
        select_failed(&self.reader, tenant_id, id).await
    }

    async fn list_failed_notifications(
        &self,
        tenant_id: &str,
        page: PageRequest,
    ) -> Result<Page<FailedNotification>> {
        let total: i64 = self
            .reader
            .query_one(
                "SELECT COUNT(*) FROM failed_notifications WHERE tenant_id = $1",
                &[&tenant_id],
            )
            .await?
            .try_get(0)?;

        let limit = page.limit as i64;
        let offset = page.offset() as i64;

        let rows = self
            .reader
            .query(
                &format!(
                    "SELECT {} FROM failed_notifications WHERE tenant_id = $1 \
                     ORDER BY failed_at DESC LIMIT $2 OFFSET $3",
                    FAILED_COLUMNS
                ),
                &[&tenant_id, &limit, &offset],
            )
            .await?;

        let items = rows
            .iter()
            .map(failed_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total as u64,
            page: page.page,
            limit: page.limit,
        })
    }

    async fn ping(&self) -> Result<()> {
        self.reader
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| Error::Store(format!("Database health check failed: {}", e)))?;

        Ok(())
    }
}

pub struct PostgresTransaction {
    client: Option<OwnedMutexGuard<Client>>,
}

impl PostgresTransaction {
    fn client(&self) -> Result<&Client> {
        self.client
            .as_deref()
            .ok_or_else(|| Error::Store("transaction already finished".to_string()))
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.batch_execute("ROLLBACK").await {
                        warn!(error = %e, "Failed to roll back abandoned transaction");
                    }
                });
            }
            Err(_) => warn!("Transaction dropped outside of a runtime; rollback skipped"),
        }
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn get_notification(
        &mut self,
        tenant_id: &str,
        id: Uuid,
    ) -> Result<Option<Notification>> {
        select_notification(self.client()?, tenant_id, id, true).await
    }

    async fn find_by_idempotency_key(
        &mut self,
        tenant_id: &str,
        key: &str,
    ) -> Result<Option<Notification>> {
        select_by_idempotency_key(self.client()?, tenant_id, key).await
    }

    async fn insert_notification(&mut self, notification: &Notification) -> Result<()> {
        let columns = notification.request.to_columns()?;
        let channel = columns.channel.as_str();
        let status = notification.status.as_str();
        let priority = notification.priority.as_str();
        let retry_count = notification.retry_count as i32;

        let params: [&(dyn ToSql + Sync); 22] = [
            &notification.id,
            &notification.tenant_id,
            &channel,
            &status,
            &priority,
            &columns.recipient,
            &columns.subject,
            &columns.body,
            &columns.headers,
            &notification.idempotency_key,
            &retry_count,
            &notification.version,
            &notification.error,
            &notification.created_at,
            &notification.updated_at,
            &notification.deleted_at,
            &notification.sent_at,
            &notification.delivered_at,
            &notification.read_at,
            &notification.clicked_at,
            &notification.scheduled_for,
            &notification.expires_at,
        ];

        self.client()?
            .execute(
                &format!(
                    "INSERT INTO notifications ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, \
                     $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)",
                    NOTIFICATION_COLUMNS
                ),
                &params,
            )
            .await?;

        Ok(())
    }

    async fn update_notification(
        &mut self,
        notification: &Notification,
        expected_version: i64,
    ) -> Result<bool> {
        let columns = notification.request.to_columns()?;
        let channel = columns.channel.as_str();
        let status = notification.status.as_str();
        let priority = notification.priority.as_str();
        let retry_count = notification.retry_count as i32;

        let params: [&(dyn ToSql + Sync); 22] = [
            &notification.tenant_id,
            &notification.id,
            &status,
            &priority,
            &channel,
            &columns.recipient,
            &columns.subject,
            &columns.body,
            &columns.headers,
            &notification.idempotency_key,
            &retry_count,
            &notification.version,
            &notification.error,
            &notification.updated_at,
            &notification.deleted_at,
            &notification.sent_at,
            &notification.delivered_at,
            &notification.read_at,
            &notification.clicked_at,
            &notification.scheduled_for,
            &notification.expires_at,
            &expected_version,
        ];

        let updated = self
            .client()?
            .execute(
                "UPDATE notifications SET status = $3, priority = $4, type = $5, recipient = $6, \
                 subject = $7, body = $8, headers = $9, idempotency_key = $10, \
                 retry_count = $11, version = $12, error = $13, updated_at = $14, \
                 deleted_at = $15, sent_at = $16, delivered_at = $17, read_at = $18, \
                 clicked_at = $19, scheduled_for = $20, expires_at = $21 \
                 WHERE tenant_id = $1 AND id = $2 AND version = $22",
                &params,
            )
            .await?;

        Ok(updated == 1)
    }

    async fn insert_outbox_event(&mut self, event: &OutboxEvent) -> Result<()> {
        let event_type = event.event_type.as_str();
        let status = event.status.as_str();
        let error_count = event.error_count as i32;

        let params: [&(dyn ToSql + Sync); 14] = [
            &event.id,
            &event.tenant_id,
            &event.aggregate_type,
            &event.aggregate_id,
            &event_type,
            &event.payload,
            &status,
            &error_count,
            &event.last_error,
            &event.version,
            &event.trace_id,
            &event.span_id,
            &event.created_at,
            &event.processed_at,
        ];

        self.client()?
            .execute(
                &format!(
                    "INSERT INTO outbox_events ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, \
                     $10, $11, $12, $13, $14)",
                    OUTBOX_COLUMNS
                ),
                &params,
            )
            .await?;

        Ok(())
    }

    async fn get_failed_notification(
        &mut self,
        tenant_id: &str,
        id: Uuid,
    ) -> Result<Option<FailedNotification>> {
        select_failed(self.client()?, tenant_id, id).await
    }

    async fn insert_failed_notification(&mut self, entry: &FailedNotification) -> Result<()> {
        let columns = entry.request.to_columns()?;
        let channel = columns.channel.as_str();
        let priority = entry.priority.as_str();
        let retry_count = entry.retry_count as i32;

        let params: [&(dyn ToSql + Sync); 12] = [
            &entry.id,
            &entry.original_id,
            &entry.tenant_id,
            &priority,
            &channel,
            &columns.recipient,
            &columns.subject,
            &columns.body,
            &columns.headers,
            &entry.error,
            &entry.failed_at,
            &retry_count,
        ];

        self.client()?
            .execute(
                &format!(
                    "INSERT INTO failed_notifications ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, \
                     $8, $9, $10, $11, $12)",
                    FAILED_COLUMNS
                ),
                &params,
            )
            .await?;

        Ok(())
    }

    async fn update_failed_notification(&mut self, entry: &FailedNotification) -> Result<()> {
        let retry_count = entry.retry_count as i32;

        let updated = self
            .client()?
            .execute(
                "UPDATE failed_notifications SET original_id = $3, error = $4, failed_at = $5, \
                 retry_count = $6 WHERE tenant_id = $1 AND id = $2",
                &[
                    &entry.tenant_id,
                    &entry.id,
                    &entry.original_id,
                    &entry.error,
                    &entry.failed_at,
                    &retry_count,
                ],
            )
            .await?;

        if updated == 0 {
            return Err(Error::not_found("failed_notification", entry.id));
        }

        Ok(())
    }

    async fn delete_failed_notification(&mut self, tenant_id: &str, id: Uuid) -> Result<bool> {
        let deleted = self
            .client()?
            .execute(
                "DELETE FROM failed_notifications WHERE tenant_id = $1 AND id = $2",
                &[&tenant_id, &id],
            )
            .await?;

        Ok(deleted == 1)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let Some(client) = self.client.take() else {
            return Err(Error::Store("transaction already finished".to_string()));
        };

        client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };

        client.batch_execute("ROLLBACK").await?;
        Ok(())
    }
}

async fn select_notification(
    client: &Client,
    tenant_id: &str,
    id: Uuid,
    for_update: bool,
) -> Result<Option<Notification>> {
    let lock = if for_update { " FOR UPDATE" } else { "" };

    let row = client
        .query_opt(
            &format!(
                "SELECT {} FROM notifications WHERE tenant_id = $1 AND id = $2{}",
                NOTIFICATION_COLUMNS, lock
            ),
            &[&tenant_id, &id],
        )
        .await?;

    row.as_ref().map(notification_from_row).transpose()
}

async fn select_by_idempotency_key(
    client: &Client,
    tenant_id: &str,
    key: &str,
) -> Result<Option<Notification>> {
    let row = client
        .query_opt(
            &format!(
                "SELECT {} FROM notifications \
                 WHERE tenant_id = $1 AND idempotency_key = $2 AND deleted_at IS NULL",
                NOTIFICATION_COLUMNS
            ),
            &[&tenant_id, &key],
        )
        .await?;

    row.as_ref().map(notification_from_row).transpose()
}

async fn select_failed(
    client: &Client,
    tenant_id: &str,
    id: Uuid,
) -> Result<Option<FailedNotification>> {
    let row = client
        .query_opt(
            &format!(
                "SELECT {} FROM failed_notifications WHERE tenant_id = $1 AND id = $2",
                FAILED_COLUMNS
            ),
            &[&tenant_id, &id],
        )
        .await?;

    row.as_ref().map(failed_from_row).transpose()
}

fn channel_request_from_row(row: &Row) -> Result<ChannelRequest> {
    let channel: String = row.try_get("type")?;

    ChannelRequest::from_columns(ChannelColumns {
        channel: channel.parse()?,
        recipient: row.try_get("recipient")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        headers: row.try_get("headers")?,
    })
}

fn notification_from_row(row: &Row) -> Result<Notification> {
    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;
    let retry_count: i32 = row.try_get("retry_count")?;

    Ok(Notification {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        status: status.parse()?,
        priority: priority.parse()?,
        request: channel_request_from_row(row)?,
        idempotency_key: row.try_get("idempotency_key")?,
        retry_count: retry_count.max(0) as u32,
        version: row.try_get("version")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
        sent_at: row.try_get("sent_at")?,
        delivered_at: row.try_get("delivered_at")?,
        read_at: row.try_get("read_at")?,
        clicked_at: row.try_get("clicked_at")?,
        scheduled_for: row.try_get("scheduled_for")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn outbox_event_from_row(row: &Row) -> Result<OutboxEvent> {
    let event_type: String = row.try_get("event_type")?;
    let status: String = row.try_get("status")?;
    let error_count: i32 = row.try_get("error_count")?;

    Ok(OutboxEvent {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        event_type: OutboxEventType::parse(&event_type)?,
        payload: row.try_get("payload")?,
        status: status.parse()?,
        error_count: error_count.max(0) as u32,
        last_error: row.try_get("last_error")?,
        version: row.try_get("version")?,
        trace_id: row.try_get("trace_id")?,
        span_id: row.try_get("span_id")?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}

fn failed_from_row(row: &Row) -> Result<FailedNotification> {
    let priority: String = row.try_get("priority")?;
    let retry_count: i32 = row.try_get("retry_count")?;

    Ok(FailedNotification {
        id: row.try_get("id")?,
        original_id: row.try_get("original_id")?,
        tenant_id: row.try_get("tenant_id")?,
        priority: priority.parse()?,
        request: channel_request_from_row(row)?,
        error: row.try_get("error")?,
        failed_at: row.try_get("failed_at")?,
        retry_count: retry_count.max(0) as u32,
    })
}
