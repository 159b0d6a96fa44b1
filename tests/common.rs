use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use delivery_service::{
    Error, Result,
    clients::{memory::MemoryStore, store::DocumentStore},
    dispatcher::DispatchQueue,
    metrics::Metrics,
    models::{
        notification::{ChannelRequest, ChannelType, NewNotification},
        retry::RetryConfig,
    },
    pipeline::NotificationService,
    rate_limiter::{RateLimiter, RateLimiterConfig},
    repository::NotificationRepository,
    senders::{ChannelSender, SendReceipt, SenderRegistry},
};
use parking_lot::Mutex;

pub const TENANT: &str = "acme";

pub fn sms_request() -> ChannelRequest {
    ChannelRequest::Sms {
        recipient: "+15550100".to_string(),
        body: "Your code is 1234".to_string(),
    }
}

pub fn email_request() -> ChannelRequest {
    ChannelRequest::Email {
        recipient: "user@example.com".to_string(),
        subject: "Welcome".to_string(),
        body: "Hello there".to_string(),
    }
}

pub fn new_sms(tenant_id: &str) -> NewNotification {
    NewNotification::new(tenant_id, sms_request())
}

pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2,
    }
}

pub fn generous_limits() -> RateLimiterConfig {
    RateLimiterConfig {
        rate: 1_000.0,
        burst: 1_000,
        max_tenants: 100,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    Transient,
    Permanent,
}

/// Sender that replays a script of outcomes, then succeeds.
pub struct ScriptedSender {
    channel: ChannelType,
    script: Mutex<VecDeque<Outcome>>,
    calls: AtomicUsize,
}

impl ScriptedSender {
    pub fn new(channel: ChannelType, script: impl IntoIterator<Item = Outcome>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn always(channel: ChannelType, outcome: Outcome) -> Arc<Self> {
        Self::new(channel, std::iter::repeat_n(outcome, 64))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelSender for ScriptedSender {
    fn channel(&self) -> ChannelType {
        self.channel
    }

    async fn send(&self, _request: &ChannelRequest) -> Result<SendReceipt> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        match self.script.lock().pop_front().unwrap_or(Outcome::Sent) {
            Outcome::Sent => Ok(SendReceipt::new(self.channel).with_provider_message_id("msg-1")),
            Outcome::Transient => Err(Error::transient("provider unavailable")),
            Outcome::Permanent => Err(Error::permanent("recipient rejected")),
        }
    }
}

pub struct Harness {
    pub store: Arc<dyn DocumentStore>,
    pub queue: Arc<DispatchQueue>,
    pub metrics: Arc<Metrics>,
    pub service: Arc<NotificationService>,
}

pub fn harness(
    sender: Arc<dyn ChannelSender>,
    retry: RetryConfig,
    limits: RateLimiterConfig,
) -> Harness {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let queue = Arc::new(DispatchQueue::new());
    let metrics = Arc::new(Metrics::new().expect("metrics registry"));
    let senders = SenderRegistry::new(Duration::from_secs(5)).register(sender);

    let service = Arc::new(NotificationService::new(
        NotificationRepository::new(Arc::clone(&store)),
        Arc::new(RateLimiter::new(limits)),
        Arc::clone(&queue),
        Arc::new(senders),
        Arc::clone(&metrics),
        retry,
    ));

    Harness {
        store,
        queue,
        metrics,
        service,
    }
}
