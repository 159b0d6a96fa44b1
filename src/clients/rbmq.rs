use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    Error, Result,
    config::Config,
    consumer::{BrokerDelivery, EventSource, EventSubscription},
    models::outbox::{OutboxEvent, OutboxEventType},
    outbox::EventPublisher,
};

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub url: String,
    pub notification_queue: String,
    pub outbox_queue: String,
    pub prefetch_count: u16,
}

impl BrokerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.rabbitmq_url.clone(),
            notification_queue: config.notification_queue_name.clone(),
            outbox_queue: config.outbox_queue_name.clone(),
            prefetch_count: config.prefetch_count,
        }
    }
}

pub struct RabbitMqClient {
    connection: Connection,
    channel: Channel,
    settings: BrokerSettings,
}

impl RabbitMqClient {
    pub async fn connect(settings: &BrokerSettings) -> Result<Self> {
        info!("Connecting to RabbitMQ");

        let connection = Connection::connect(&settings.url, ConnectionProperties::default())
            .await
            .map_err(|e| Error::Broker(format!("Failed to connect to RabbitMQ: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::Broker(format!("RabbitMQ channel creation failed: {}", e)))?;

        channel
            .basic_qos(settings.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| Error::Broker(format!("Failed to set up QoS: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| Error::Broker(format!("Failed to enable publisher confirms: {}", e)))?;

        for queue in [&settings.notification_queue, &settings.outbox_queue] {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| Error::Broker(format!("Failed to declare queue {}: {}", queue, e)))?;

            debug!(queue = %queue, "Queue declared");
        }

        info!(
            notification_queue = %settings.notification_queue,
            outbox_queue = %settings.outbox_queue,
            prefetch_count = settings.prefetch_count,
            "RabbitMQ connection established"
        );

        Ok(Self {
            connection,
            channel,
            settings: settings.clone(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    pub async fn create_consumer(&self, consumer_tag: &str) -> Result<Consumer> {
        let consumer = self
            .channel
            .basic_consume(
                &self.settings.notification_queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Broker(format!("Failed to create consumer: {}", e)))?;

        debug!(queue = %self.settings.notification_queue, consumer_tag, "Consumer created");

        Ok(consumer)
    }

    pub async fn acknowledge(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| Error::Broker(format!("Failed to acknowledge message: {}", e)))
    }

    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| Error::Broker(format!("Failed to reject message: {}", e)))
    }

    /// Publishes a persistent JSON message to `queue` on the default exchange
    /// and waits for the broker to confirm it.
    pub async fn publish_json<T: Serialize>(&self, queue: &str, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)?;

        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| Error::Broker(format!("Failed to publish to {}: {}", queue, e)))?
            .await
            .map_err(|e| Error::Broker(format!("Publish to {} was not confirmed: {}", queue, e)))?;

        if confirmation.is_nack() {
            return Err(Error::Broker(format!("Broker nacked message for {}", queue)));
        }

        Ok(())
    }

    pub fn outbox_queue(&self) -> &str {
        &self.settings.outbox_queue
    }
}

/// Opens a fresh connection for every subscription, so a restart after a
/// lost connection reconnects from scratch.
pub struct RabbitMqSource {
    settings: BrokerSettings,
}

impl RabbitMqSource {
    pub fn new(settings: BrokerSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl EventSource for RabbitMqSource {
    async fn subscribe(&self) -> Result<Box<dyn EventSubscription>> {
        let client = RabbitMqClient::connect(&self.settings).await?;
        let consumer_tag = format!("delivery-{}", Uuid::new_v4().simple());
        let consumer = client.create_consumer(&consumer_tag).await?;

        Ok(Box::new(RabbitMqSubscription { client, consumer }))
    }
}

pub struct RabbitMqSubscription {
    client: RabbitMqClient,
    consumer: Consumer,
}

#[async_trait]
impl EventSubscription for RabbitMqSubscription {
    async fn next(&mut self) -> Option<Result<BrokerDelivery>> {
        let delivery = self.consumer.next().await?;

        Some(
            delivery
                .map(|d| BrokerDelivery {
                    delivery_tag: d.delivery_tag,
                    payload: d.data,
                    redelivered: d.redelivered,
                })
                .map_err(Error::from),
        )
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        self.client.acknowledge(delivery_tag).await
    }

    async fn reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.client.reject(delivery_tag, requeue).await
    }
}

#[derive(Debug, Serialize)]
struct OutboxMessage<'a> {
    event_id: Uuid,
    tenant_id: &'a str,
    aggregate_type: &'a str,
    aggregate_id: Uuid,
    event_type: OutboxEventType,
    payload: &'a serde_json::Value,
    trace_id: Option<&'a str>,
    span_id: Option<&'a str>,
    occurred_at: chrono::DateTime<chrono::Utc>,
}

/// Outbox sink. Holds one connection and replaces it once it drops.
pub struct RabbitMqPublisher {
    settings: BrokerSettings,
    client: Mutex<Option<Arc<RabbitMqClient>>>,
}

impl RabbitMqPublisher {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            client: Mutex::new(None),
        }
    }

    /// Starts from an already open connection.
    pub fn with_client(self, client: Arc<RabbitMqClient>) -> Self {
        *self.client.lock() = Some(client);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.client
            .lock()
            .as_ref()
            .is_some_and(|client| client.is_connected())
    }

    async fn connected_client(&self) -> Result<Arc<RabbitMqClient>> {
        let current = self.client.lock().clone();
        if let Some(client) = current {
            if client.is_connected() {
                return Ok(client);
            }
        }

        info!("Reconnecting outbox publisher");
        let client = Arc::new(RabbitMqClient::connect(&self.settings).await?);
        *self.client.lock() = Some(Arc::clone(&client));

        Ok(client)
    }
}

#[async_trait]
impl EventPublisher for RabbitMqPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<()> {
        let message = OutboxMessage {
            event_id: event.id,
            tenant_id: &event.tenant_id,
            aggregate_type: &event.aggregate_type,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type,
            payload: &event.payload,
            trace_id: event.trace_id.as_deref(),
            span_id: event.span_id.as_deref(),
            occurred_at: event.created_at,
        };

        let client = self.connected_client().await?;
        let published = client.publish_json(client.outbox_queue(), &message).await;

        if published.is_err() && !client.is_connected() {
            warn!(event_id = %event.id, "Outbox publisher lost its connection");
            *self.client.lock() = None;
        }

        published
    }
}
