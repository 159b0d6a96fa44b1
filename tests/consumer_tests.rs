use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use delivery_service::{
    Error,
    consumer::{
        BrokerDelivery, ConsumerConfig, EventHandler, EventSource, EventSubscription,
        ResilientConsumer,
    },
    metrics::Metrics,
    models::message::NotificationMessage,
    trace::TraceContext,
};
use parking_lot::Mutex;
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Settlement {
    Ack(u64),
    Reject { tag: u64, requeue: bool },
}

#[derive(Default)]
struct Ledger {
    settlements: Mutex<Vec<Settlement>>,
    subscribe_attempts: Mutex<Vec<Instant>>,
}

/// Fails the first `failures` subscriptions, then serves `deliveries` and
/// keeps the stream open.
struct FlakySource {
    failures: usize,
    deliveries: Mutex<VecDeque<BrokerDelivery>>,
    ledger: Arc<Ledger>,
}

#[async_trait]
impl EventSource for FlakySource {
    async fn subscribe(&self) -> delivery_service::Result<Box<dyn EventSubscription>> {
        let attempt = {
            let mut attempts = self.ledger.subscribe_attempts.lock();
            attempts.push(Instant::now());
            attempts.len()
        };

        if attempt <= self.failures {
            return Err(Error::Broker("connection refused".to_string()));
        }

        Ok(Box::new(FakeSubscription {
            deliveries: std::mem::take(&mut *self.deliveries.lock()),
            ledger: Arc::clone(&self.ledger),
            end_when_drained: false,
        }))
    }
}

struct FakeSubscription {
    deliveries: VecDeque<BrokerDelivery>,
    ledger: Arc<Ledger>,
    end_when_drained: bool,
}

#[async_trait]
impl EventSubscription for FakeSubscription {
    async fn next(&mut self) -> Option<delivery_service::Result<BrokerDelivery>> {
        match self.deliveries.pop_front() {
            Some(delivery) => Some(Ok(delivery)),
            None if self.end_when_drained => None,
            None => std::future::pending().await,
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> delivery_service::Result<()> {
        self.ledger
            .settlements
            .lock()
            .push(Settlement::Ack(delivery_tag));
        Ok(())
    }

    async fn reject(&mut self, delivery_tag: u64, requeue: bool) -> delivery_service::Result<()> {
        self.ledger.settlements.lock().push(Settlement::Reject {
            tag: delivery_tag,
            requeue,
        });
        Ok(())
    }
}

/// Handler keyed on the message's idempotency key.
#[derive(Default)]
struct KeyedHandler {
    handled: AtomicUsize,
    traces: Mutex<Vec<String>>,
}

#[async_trait]
impl EventHandler for KeyedHandler {
    async fn handle_event(&self, message: NotificationMessage) -> delivery_service::Result<()> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        if let Some(trace) = TraceContext::current() {
            self.traces.lock().push(trace.trace_id);
        }

        match message.idempotency_key.as_deref() {
            Some("transient") => Err(Error::transient("provider down")),
            Some("invalid") => Err(Error::validation("bad recipient")),
            Some("duplicate") => Err(Error::Conflict("already submitted".to_string())),
            Some("limited") => Err(Error::AdmissionRejected {
                tenant_id: message.tenant_id.clone(),
            }),
            Some("slow") => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn delivery(tag: u64, key: &str) -> BrokerDelivery {
    let payload = json!({
        "data": {
            "trace_id": format!("trace-{}", tag),
            "tenant_id": "acme",
            "idempotency_key": key,
            "type": "sms",
            "recipient": "+15550100",
            "body": "hello"
        }
    });

    BrokerDelivery {
        delivery_tag: tag,
        payload: serde_json::to_vec(&payload).unwrap(),
        redelivered: false,
    }
}

fn config() -> ConsumerConfig {
    ConsumerConfig {
        base_backoff: Duration::from_millis(40),
        max_backoff: Duration::from_millis(400),
        message_timeout: Duration::from_millis(100),
        admission_backoff: Duration::from_millis(150),
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Test: Subscription failures are retried with growing gaps until one succeeds
#[tokio::test]
async fn test_restarts_with_increasing_backoff() -> Result<()> {
    let ledger = Arc::new(Ledger::default());
    let source = Arc::new(FlakySource {
        failures: 3,
        deliveries: Mutex::new(VecDeque::from([delivery(1, "ok")])),
        ledger: Arc::clone(&ledger),
    });
    let handler = Arc::new(KeyedHandler::default());

    let consumer = ResilientConsumer::new(
        source,
        handler.clone(),
        Arc::new(Metrics::new()?),
        config(),
    );
    consumer.start();

    wait_for(|| !ledger.settlements.lock().is_empty()).await;
    consumer.stop().await;

    assert_eq!(consumer.restarts(), 3);
    assert_eq!(*ledger.settlements.lock(), vec![Settlement::Ack(1)]);

    let attempts = ledger.subscribe_attempts.lock().clone();
    assert_eq!(attempts.len(), 4);

    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps[0] >= Duration::from_millis(40));
    assert!(gaps[1] > gaps[0], "gaps should grow: {:?}", gaps);
    assert!(gaps[2] > gaps[1], "gaps should grow: {:?}", gaps);

    Ok(())
}

/// Test: Each message is settled according to how the handler failed
#[tokio::test]
async fn test_message_dispositions() -> Result<()> {
    let ledger = Arc::new(Ledger::default());
    let mut poison = delivery(2, "ok");
    poison.payload = b"{not json".to_vec();

    let source = Arc::new(FlakySource {
        failures: 0,
        deliveries: Mutex::new(VecDeque::from([
            delivery(1, "ok"),
            poison,
            delivery(3, "transient"),
            delivery(4, "invalid"),
            delivery(5, "duplicate"),
            delivery(6, "slow"),
        ])),
        ledger: Arc::clone(&ledger),
    });
    let handler = Arc::new(KeyedHandler::default());

    let consumer = ResilientConsumer::new(
        source,
        handler.clone(),
        Arc::new(Metrics::new()?),
        config(),
    );
    consumer.start();

    wait_for(|| ledger.settlements.lock().len() == 6).await;
    consumer.stop().await;

    assert_eq!(
        *ledger.settlements.lock(),
        vec![
            Settlement::Ack(1),
            Settlement::Reject {
                tag: 2,
                requeue: false
            },
            Settlement::Reject {
                tag: 3,
                requeue: true
            },
            Settlement::Reject {
                tag: 4,
                requeue: false
            },
            Settlement::Ack(5),
            Settlement::Reject {
                tag: 6,
                requeue: true
            },
        ]
    );

    // The malformed payload never reaches the handler.
    assert_eq!(handler.handled.load(Ordering::SeqCst), 5);
    assert_eq!(consumer.restarts(), 0);

    let traces = handler.traces.lock().clone();
    assert_eq!(traces[0], "trace-1");

    Ok(())
}

/// Test: Rate-limited messages are requeued only after a pause
#[tokio::test]
async fn test_admission_rejection_delays_requeue() -> Result<()> {
    let ledger = Arc::new(Ledger::default());
    let source = Arc::new(FlakySource {
        failures: 0,
        deliveries: Mutex::new(VecDeque::from([delivery(1, "limited"), delivery(2, "ok")])),
        ledger: Arc::clone(&ledger),
    });

    let consumer = ResilientConsumer::new(
        source,
        Arc::new(KeyedHandler::default()),
        Arc::new(Metrics::new()?),
        config(),
    );

    let started = Instant::now();
    consumer.start();

    wait_for(|| ledger.settlements.lock().len() == 2).await;
    let elapsed = started.elapsed();
    consumer.stop().await;

    assert_eq!(
        *ledger.settlements.lock(),
        vec![
            Settlement::Reject {
                tag: 1,
                requeue: true
            },
            Settlement::Ack(2),
        ]
    );
    assert!(
        elapsed >= Duration::from_millis(150),
        "requeued after {:?}, before the admission pause",
        elapsed
    );

    Ok(())
}

/// Test: A closed stream is treated as a failure and the consumer resubscribes
#[tokio::test]
async fn test_stream_end_triggers_resubscribe() -> Result<()> {
    struct EndingSource {
        ledger: Arc<Ledger>,
    }

    #[async_trait]
    impl EventSource for EndingSource {
        async fn subscribe(&self) -> delivery_service::Result<Box<dyn EventSubscription>> {
            self.ledger.subscribe_attempts.lock().push(Instant::now());
            Ok(Box::new(FakeSubscription {
                deliveries: VecDeque::new(),
                ledger: Arc::clone(&self.ledger),
                end_when_drained: true,
            }))
        }
    }

    let ledger = Arc::new(Ledger::default());
    let consumer = ResilientConsumer::new(
        Arc::new(EndingSource {
            ledger: Arc::clone(&ledger),
        }),
        Arc::new(KeyedHandler::default()),
        Arc::new(Metrics::new()?),
        config(),
    );
    consumer.start();

    wait_for(|| ledger.subscribe_attempts.lock().len() >= 3).await;
    consumer.stop().await;

    assert!(consumer.restarts() >= 2);

    Ok(())
}

/// Test: Stop interrupts the backoff sleep promptly
#[tokio::test]
async fn test_stop_during_backoff() -> Result<()> {
    let ledger = Arc::new(Ledger::default());
    let source = Arc::new(FlakySource {
        failures: usize::MAX,
        deliveries: Mutex::new(VecDeque::new()),
        ledger: Arc::clone(&ledger),
    });

    let consumer = ResilientConsumer::new(
        source,
        Arc::new(KeyedHandler::default()),
        Arc::new(Metrics::new()?),
        ConsumerConfig {
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(60),
            message_timeout: Duration::from_secs(1),
            admission_backoff: Duration::from_secs(1),
        },
    );
    consumer.start();

    wait_for(|| !ledger.subscribe_attempts.lock().is_empty()).await;

    let started = Instant::now();
    tokio::time::timeout(Duration::from_secs(2), consumer.stop()).await?;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(ledger.subscribe_attempts.lock().len(), 1);

    Ok(())
}
