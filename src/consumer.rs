//! Self-healing broker consumer.
//!
//! A subscription that fails, or whose stream ends, is re-opened after an
//! exponential backoff. The stop signal is observed between messages and
//! during the backoff sleep.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    Error, Result,
    metrics::Metrics,
    models::message::{Envelope, NotificationMessage},
    trace::TraceContext,
    utils::Backoff,
};

#[derive(Debug, Clone)]
pub struct BrokerDelivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

#[async_trait]
pub trait EventSubscription: Send {
    /// `None` means the broker closed the stream.
    async fn next(&mut self) -> Option<Result<BrokerDelivery>>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<()>;

    async fn reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<()>;
}

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Declares topology and opens a fresh subscription.
    async fn subscribe(&self) -> Result<Box<dyn EventSubscription>>;
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, message: NotificationMessage) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub message_timeout: Duration,
    /// Pause before requeueing a message its tenant had no budget for.
    pub admission_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            message_timeout: Duration::from_secs(30),
            admission_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ack,
    Requeue,
    Drop,
}

pub struct ResilientConsumer {
    source: Arc<dyn EventSource>,
    handler: Arc<dyn EventHandler>,
    metrics: Arc<Metrics>,
    config: ConsumerConfig,
    token: CancellationToken,
    restarts: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ResilientConsumer {
    pub fn new(
        source: Arc<dyn EventSource>,
        handler: Arc<dyn EventHandler>,
        metrics: Arc<Metrics>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            source,
            handler,
            metrics,
            config,
            token: CancellationToken::new(),
            restarts: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        }
    }

    /// Spawns the consumption loop and returns immediately.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let worker = ConsumerLoop {
            source: Arc::clone(&self.source),
            handler: Arc::clone(&self.handler),
            metrics: Arc::clone(&self.metrics),
            config: self.config.clone(),
            token: self.token.clone(),
            restarts: Arc::clone(&self.restarts),
        };

        *task = Some(tokio::spawn(worker.run()));
    }

    /// Signals shutdown and waits for the loop to exit.
    pub async fn stop(&self) {
        self.token.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Consumer task terminated abnormally");
            }
        }
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }
}

struct ConsumerLoop {
    source: Arc<dyn EventSource>,
    handler: Arc<dyn EventHandler>,
    metrics: Arc<Metrics>,
    config: ConsumerConfig,
    token: CancellationToken,
    restarts: Arc<AtomicU64>,
}

impl ConsumerLoop {
    async fn run(self) {
        let mut backoff = Backoff::new(self.config.base_backoff, self.config.max_backoff);
        info!("Event consumer started");

        while !self.token.is_cancelled() {
            let Err(e) = self.consume(&mut backoff).await else {
                break;
            };

            self.restarts.fetch_add(1, Ordering::SeqCst);
            self.metrics.consumer_restarts_total.inc();

            let delay = backoff.next_delay();
            warn!(
                error = %e,
                delay_ms = delay.as_millis() as u64,
                "Event consumer failed, restarting after backoff"
            );

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Event consumer stopped");
    }

    /// Returns `Ok` only when stopped.
    async fn consume(&self, backoff: &mut Backoff) -> Result<()> {
        let mut subscription = self.source.subscribe().await?;
        backoff.reset();
        debug!("Event subscription opened");

        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                next = subscription.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return Err(e),
                None => return Err(Error::Broker("consumer stream ended".to_string())),
            };

            match self.process(&delivery).await {
                Disposition::Ack => subscription.ack(delivery.delivery_tag).await?,
                Disposition::Requeue => subscription.reject(delivery.delivery_tag, true).await?,
                Disposition::Drop => subscription.reject(delivery.delivery_tag, false).await?,
            }
        }
    }

    async fn process(&self, delivery: &BrokerDelivery) -> Disposition {
        let message = match serde_json::from_slice::<Envelope<NotificationMessage>>(&delivery.payload)
        {
            Ok(envelope) => envelope.data,
            Err(e) => {
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Rejecting malformed message"
                );
                return Disposition::Drop;
            }
        };

        let trace = TraceContext::new(message.trace_id.clone());
        let trace_id = trace.trace_id.clone();
        let tenant_id = message.tenant_id.clone();

        debug!(
            trace_id = %trace_id,
            tenant_id = %tenant_id,
            redelivered = delivery.redelivered,
            "Processing notification message"
        );

        let handled = trace
            .scope(timeout(
                self.config.message_timeout,
                self.handler.handle_event(message),
            ))
            .await;

        match handled {
            Ok(Ok(())) => Disposition::Ack,
            Ok(Err(e)) if e.is_conflict() => {
                debug!(trace_id = %trace_id, error = %e, "Message already handled");
                Disposition::Ack
            }
            Ok(Err(Error::AdmissionRejected { .. })) => {
                debug!(
                    trace_id = %trace_id,
                    tenant_id = %tenant_id,
                    delay_ms = self.config.admission_backoff.as_millis() as u64,
                    "Tenant over its rate limit, delaying requeue"
                );
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep(self.config.admission_backoff) => {}
                }
                Disposition::Requeue
            }
            Ok(Err(e)) if e.is_retryable() => {
                warn!(trace_id = %trace_id, tenant_id = %tenant_id, error = %e, "Message failed, requeueing");
                Disposition::Requeue
            }
            Ok(Err(e)) => {
                warn!(trace_id = %trace_id, tenant_id = %tenant_id, error = %e, "Message rejected");
                Disposition::Drop
            }
            Err(_) => {
                warn!(
                    trace_id = %trace_id,
                    timeout_ms = self.config.message_timeout.as_millis() as u64,
                    "Message processing timed out, requeueing"
                );
                Disposition::Requeue
            }
        }
    }
}
