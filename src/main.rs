use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use delivery_service::{
    api::{self, AppState},
    clients::{
        database::PostgresStore,
        health::HealthChecker,
        memory::MemoryStore,
        rbmq::{BrokerSettings, RabbitMqClient, RabbitMqPublisher, RabbitMqSource},
        sms::SmsSender,
        smtp::EmailSender,
        store::DocumentStore,
        webhook::WebhookSender,
    },
    config::{Config, StoreBackend},
    consumer::ResilientConsumer,
    dispatcher::{DispatchQueue, WorkerPool},
    metrics::Metrics,
    outbox::{Outbox, OutboxRelay},
    pipeline::NotificationService,
    pool::ConnectionPool,
    rate_limiter::RateLimiter,
    recovery::DispatchRecovery,
    repository::NotificationRepository,
    scheduler::Scheduler,
    senders::SenderRegistry,
    utils::retry_with_backoff,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::load()?;
    let retry_config = config.retry_config();

    let store: Arc<dyn DocumentStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow!("DATABASE_URL is not set"))?;
            let store = retry_with_backoff(&retry_config, || PostgresStore::connect(url)).await?;
            Arc::new(store)
        }
        StoreBackend::Memory => {
            info!("Using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let broker_settings = BrokerSettings::from_config(&config);
    let broker = Arc::new(
        retry_with_backoff(&retry_config, || RabbitMqClient::connect(&broker_settings)).await?,
    );

    let metrics = Arc::new(Metrics::new()?);
    let queue = Arc::new(DispatchQueue::new());
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limiter_config()));

    let http_client = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()?;
    let smtp_pool = ConnectionPool::new(config.smtp_connector(), config.smtp_pool_size);

    let senders = SenderRegistry::new(config.send_timeout())
        .register(Arc::new(EmailSender::new(
            smtp_pool.clone(),
            &config.smtp_from_address,
        )?))
        .register(Arc::new(SmsSender::new(
            http_client.clone(),
            config.sms_provider_url.clone(),
            config.sms_api_key.clone(),
        )))
        .register(Arc::new(WebhookSender::new(http_client)));

    let repository = NotificationRepository::new(Arc::clone(&store));
    let service = Arc::new(NotificationService::new(
        repository,
        rate_limiter,
        Arc::clone(&queue),
        Arc::new(senders),
        Arc::clone(&metrics),
        retry_config,
    ));

    let workers = WorkerPool::start(
        Arc::clone(&queue),
        service.clone(),
        Arc::clone(&metrics),
        config.worker_concurrency,
    );

    // Nothing submits yet, so in-flight records from the last run are safe to reclaim.
    let recovery = DispatchRecovery::new(service.clone(), config.recovery_config());
    recovery.recover_after_restart().await?;
    let recovery_token = CancellationToken::new();
    let recovery_task = recovery.spawn(recovery_token.clone());

    let publisher = Arc::new(RabbitMqPublisher::new(broker_settings.clone()).with_client(broker));
    let relay_token = CancellationToken::new();
    let relay = OutboxRelay::new(
        Outbox::new(Arc::clone(&store)),
        publisher.clone(),
        Arc::clone(&metrics),
        config.relay_config(),
    )
    .spawn(relay_token.clone());

    let consumer = ResilientConsumer::new(
        Arc::new(RabbitMqSource::new(broker_settings.clone())),
        service.clone(),
        Arc::clone(&metrics),
        config.consumer_config(),
    );
    consumer.start();

    let scheduler = Arc::new(Scheduler::new(service.clone()));

    let state = Arc::new(AppState {
        service,
        scheduler: Arc::clone(&scheduler),
        health_checker: HealthChecker::new(Arc::clone(&store))
            .with_broker(publisher)
            .with_smtp_pool(smtp_pool.clone()),
        metrics,
        queue,
        smtp_pool: Some(smtp_pool.clone()),
    });

    let server_token = CancellationToken::new();
    let server_port = config.server_port;
    let server = {
        let server_token = server_token.clone();
        tokio::spawn(async move {
            if let Err(e) = api::run_api_server(server_port, state, server_token).await {
                error!(error = %e, "HTTP server failed");
            }
        })
    };

    info!("Delivery service started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Producers stop before the queue closes so no accepted record is stranded.
    server_token.cancel();
    if let Err(e) = server.await {
        error!(error = %e, "HTTP server task terminated abnormally");
    }
    consumer.stop().await;
    scheduler.shutdown();

    recovery_token.cancel();
    if let Err(e) = recovery_task.await {
        error!(error = %e, "Dispatch recovery task terminated abnormally");
    }

    workers.shutdown().await;

    relay_token.cancel();
    if let Err(e) = relay.await {
        error!(error = %e, "Outbox relay task terminated abnormally");
    }

    smtp_pool.close().await;

    info!("Delivery service stopped");

    Ok(())
}
