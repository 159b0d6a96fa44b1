//! Delivery pipeline: admission, persistence, queueing and delivery.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    Error, Result,
    consumer::EventHandler,
    dead_letter::{DeadLetterQueue, Redelivery},
    dispatcher::{DispatchQueue, JobHandler},
    metrics::Metrics,
    models::{
        dead_letter::FailedNotification,
        job::DispatchJob,
        message::NotificationMessage,
        notification::{NewNotification, Notification},
        retry::RetryConfig,
        status::NotificationStatus,
    },
    rate_limiter::RateLimiter,
    repository::NotificationRepository,
    scheduler::ScheduledSubmitter,
    senders::SenderRegistry,
    trace::TraceContext,
    utils::jittered,
};

/// Attempts at a feedback write before an optimistic lock conflict is surfaced.
const FEEDBACK_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "notification", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Accepted(Notification),
    /// The idempotency key was already used; carries the existing record.
    Duplicate(Notification),
}

impl SubmitOutcome {
    pub fn notification(&self) -> &Notification {
        match self {
            SubmitOutcome::Accepted(n) | SubmitOutcome::Duplicate(n) => n,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, SubmitOutcome::Duplicate(_))
    }
}

pub struct NotificationService {
    repository: NotificationRepository,
    dead_letters: DeadLetterQueue,
    rate_limiter: Arc<RateLimiter>,
    queue: Arc<DispatchQueue>,
    senders: Arc<SenderRegistry>,
    metrics: Arc<Metrics>,
    retry: RetryConfig,
}

impl NotificationService {
    pub fn new(
        repository: NotificationRepository,
        rate_limiter: Arc<RateLimiter>,
        queue: Arc<DispatchQueue>,
        senders: Arc<SenderRegistry>,
        metrics: Arc<Metrics>,
        retry: RetryConfig,
    ) -> Self {
        let dead_letters = DeadLetterQueue::new(repository.clone(), retry.max_attempts);

        Self {
            repository,
            dead_letters,
            rate_limiter,
            queue,
            senders,
            metrics,
            retry,
        }
    }

    pub fn repository(&self) -> &NotificationRepository {
        &self.repository
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub async fn submit(&self, new: NewNotification) -> Result<SubmitOutcome> {
        new.validate()?;

        // Nothing is written once the queue stops taking jobs.
        if self.queue.is_closed() {
            return Err(Error::InvalidState("dispatch queue is closed".to_string()));
        }

        let tenant_id = new.tenant_id.clone();
        if !self.rate_limiter.allow(&tenant_id) {
            self.metrics
                .rate_limit_rejections_total
                .with_label_values(&[tenant_id.as_str()])
                .inc();
            return Err(Error::AdmissionRejected { tenant_id });
        }

        let idempotency_key = new.idempotency_key.clone();

        let created = match self.repository.create(new).await {
            Ok(created) => created,
            Err(Error::DuplicateIdempotencyKey { existing_id, key }) => {
                debug!(tenant_id = %tenant_id, idempotency_key = %key, "Duplicate submission");
                let existing = self.repository.find_by_id(&tenant_id, existing_id).await?;
                return Ok(SubmitOutcome::Duplicate(existing));
            }
            // A concurrent insert won the unique index.
            Err(Error::Conflict(reason)) if idempotency_key.is_some() => {
                let key = idempotency_key.as_deref().unwrap_or_default();
                return match self.repository.find_by_idempotency_key(&tenant_id, key).await? {
                    Some(existing) => Ok(SubmitOutcome::Duplicate(existing)),
                    None => Err(Error::Conflict(reason)),
                };
            }
            Err(e) => return Err(e),
        };

        match created.scheduled_for {
            Some(at) if at > Utc::now() => {
                self.arm_delayed_enqueue(&created);
                Ok(SubmitOutcome::Accepted(created))
            }
            _ => {
                let queued = self.enqueue(&created).await?;
                Ok(SubmitOutcome::Accepted(queued))
            }
        }
    }

    /// Moves a pending record to `queued` and pushes its job.
    pub(crate) async fn enqueue(&self, notification: &Notification) -> Result<Notification> {
        enqueue(&self.repository, &self.queue, &self.metrics, notification).await
    }

    /// Timers do not survive a restart; `DispatchRecovery` re-arms them.
    pub(crate) fn arm_delayed_enqueue(&self, notification: &Notification) {
        let Some(at) = notification.scheduled_for else {
            return;
        };

        let wait = (at - Utc::now()).to_std().unwrap_or_default();
        let repository = self.repository.clone();
        let queue = Arc::clone(&self.queue);
        let metrics = Arc::clone(&self.metrics);
        let tenant_id = notification.tenant_id.clone();
        let id = notification.id;
        let trace = TraceContext::current().unwrap_or_else(TraceContext::root);

        debug!(notification_id = %id, tenant_id = %tenant_id, scheduled_for = %at, "Delayed enqueue armed");

        tokio::spawn(trace.scope(async move {
            sleep(wait).await;

            let current = match repository.find_by_id(&tenant_id, id).await {
                Ok(current) if current.status == NotificationStatus::Pending => current,
                Ok(_) => return,
                Err(e) => {
                    debug!(notification_id = %id, error = %e, "Scheduled notification gone");
                    return;
                }
            };

            if let Err(e) = enqueue(&repository, &queue, &metrics, &current).await {
                warn!(notification_id = %id, tenant_id = %tenant_id, error = %e, "Delayed enqueue failed");
            }
        }));
    }

    /// Worker entry point.
    pub async fn handle(&self, job: DispatchJob) -> Result<()> {
        let current = self
            .repository
            .store()
            .find_notification(&job.tenant_id, job.notification_id)
            .await?;

        let Some(current) = current else {
            debug!(notification_id = %job.notification_id, "Notification no longer exists");
            return Ok(());
        };

        if current.is_deleted() || current.status.is_settled() {
            debug!(
                notification_id = %current.id,
                status = %current.status,
                deleted = current.is_deleted(),
                "Skipping job for settled notification"
            );
            return Ok(());
        }

        // Another job for the same record is mid-delivery.
        if current.status == NotificationStatus::Sending && current.version != job.version {
            debug!(
                notification_id = %current.id,
                job_version = job.version,
                current_version = current.version,
                "Skipping duplicate job for in-flight notification"
            );
            return Ok(());
        }

        self.deliver(current, None).await.map(|_| ())
    }

    /// Sends `notification`, retrying transient failures until the dead
    /// letter threshold. `replay` is the entry being replayed, if any.
    pub async fn deliver(
        &self,
        notification: Notification,
        replay: Option<&FailedNotification>,
    ) -> Result<Notification> {
        let tenant_id = notification.tenant_id.clone();
        let id = notification.id;
        let channel = notification.channel();

        let mut current = if notification.status == NotificationStatus::Sending {
            notification
        } else {
            self.repository
                .update_status(&tenant_id, id, notification.version, NotificationStatus::Sending)
                .await?
        };

        loop {
            if current.is_expired(Utc::now()) {
                return self
                    .fail(current, Error::permanent("notification expired before delivery"), replay)
                    .await;
            }

            let attempt = current.retry_count + 1;
            debug!(notification_id = %id, tenant_id = %tenant_id, %channel, attempt, "Attempting delivery");

            match self.senders.send(&current.request).await {
                Ok(receipt) => {
                    let sent = match replay {
                        Some(entry) => {
                            let sent = self.dead_letters.resolve(&current, entry).await?;
                            self.metrics.dead_letters.dec();
                            sent
                        }
                        None => {
                            self.repository
                                .update_status(&tenant_id, id, current.version, NotificationStatus::Sent)
                                .await?
                        }
                    };

                    self.record_send(&sent, "sent");
                    info!(
                        notification_id = %id,
                        tenant_id = %tenant_id,
                        %channel,
                        attempt,
                        provider_message_id = ?receipt.provider_message_id,
                        "Notification sent"
                    );
                    return Ok(sent);
                }
                Err(e) if e.is_permanent() || !e.is_retryable() => {
                    return self.fail(current, e, replay).await;
                }
                Err(e) => {
                    current = self
                        .repository
                        .increment_retry(&tenant_id, id, current.version, &e.to_string())
                        .await?;
                    self.record_send(&current, "retrying");

                    if self.dead_letters.should_quarantine(&current) {
                        return self.fail(current, e, replay).await;
                    }

                    let delay = jittered(self.retry.delay_for_attempt(current.retry_count));
                    warn!(
                        notification_id = %id,
                        tenant_id = %tenant_id,
                        %channel,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient delivery failure, backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Terminal failure: `failed` plus the dead letter write, then the
    /// delivery error is returned to the caller.
    async fn fail(
        &self,
        current: Notification,
        error: Error,
        replay: Option<&FailedNotification>,
    ) -> Result<Notification> {
        let message = error.to_string();

        let failed = match replay {
            Some(entry) => {
                self.dead_letters
                    .record_replay_failure(&current, entry, &message)
                    .await?
            }
            None => {
                let failed = self.dead_letters.add(&current, &message).await?;
                self.metrics.dead_letters.inc();
                failed
            }
        };

        self.record_send(&failed, "failed");
        error!(
            notification_id = %failed.id,
            tenant_id = %failed.tenant_id,
            channel = %failed.channel(),
            retry_count = failed.retry_count,
            error = %message,
            "Notification delivery failed"
        );

        Err(error)
    }

    /// Applies provider feedback (`delivered`, `bounced`, `read`, `clicked`).
    pub async fn record_feedback(
        &self,
        tenant_id: &str,
        id: Uuid,
        status: NotificationStatus,
    ) -> Result<Notification> {
        if !matches!(
            status,
            NotificationStatus::Delivered
                | NotificationStatus::Bounced
                | NotificationStatus::Read
                | NotificationStatus::Clicked
        ) {
            return Err(Error::validation(format!(
                "{} is not a delivery feedback status",
                status
            )));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.repository.find_by_id(tenant_id, id).await?;

            match self
                .repository
                .update_status(tenant_id, id, current.version, status)
                .await
            {
                Err(Error::OptimisticLockConflict { .. }) if attempt < FEEDBACK_ATTEMPTS => {
                    debug!(notification_id = %id, tenant_id, attempt, "Feedback lost a version race, re-reading");
                }
                result => return result,
            }
        }
    }

    pub async fn retry_dead_letter(&self, tenant_id: &str, id: Uuid) -> Result<Notification> {
        self.dead_letters.retry(tenant_id, id, self).await
    }

    fn record_send(&self, notification: &Notification, status: &str) {
        self.metrics
            .sends_total
            .with_label_values(&[
                notification.channel().as_str(),
                notification.tenant_id.as_str(),
                status,
            ])
            .inc();
    }
}

async fn enqueue(
    repository: &NotificationRepository,
    queue: &DispatchQueue,
    metrics: &Metrics,
    notification: &Notification,
) -> Result<Notification> {
    let queued = repository
        .update_status(
            &notification.tenant_id,
            notification.id,
            notification.version,
            NotificationStatus::Queued,
        )
        .await?;

    // The record stays `queued`; recovery rebuilds the job from it.
    if let Err(e) = queue.enqueue(DispatchJob::for_notification(&queued)) {
        warn!(
            notification_id = %queued.id,
            tenant_id = %queued.tenant_id,
            error = %e,
            "Job not queued, left for recovery"
        );
        return Ok(queued);
    }
    metrics.queue_depth.set(queue.len() as i64);

    debug!(
        notification_id = %queued.id,
        tenant_id = %queued.tenant_id,
        priority = %queued.priority,
        "Notification queued"
    );

    Ok(queued)
}

#[async_trait]
impl JobHandler for NotificationService {
    async fn handle(&self, job: DispatchJob) -> Result<()> {
        NotificationService::handle(self, job).await
    }
}

#[async_trait]
impl EventHandler for NotificationService {
    async fn handle_event(&self, message: NotificationMessage) -> Result<()> {
        self.submit(message.into_new_notification()).await.map(|_| ())
    }
}

#[async_trait]
impl Redelivery for NotificationService {
    async fn redeliver(
        &self,
        notification: Notification,
        entry: &FailedNotification,
    ) -> Result<Notification> {
        self.deliver(notification, Some(entry)).await
    }
}

#[async_trait]
impl ScheduledSubmitter for NotificationService {
    async fn submit_scheduled(&self, notification: NewNotification) -> Result<()> {
        match self.submit(notification).await? {
            SubmitOutcome::Accepted(n) => {
                debug!(notification_id = %n.id, tenant_id = %n.tenant_id, "Scheduled notification submitted");
            }
            SubmitOutcome::Duplicate(n) => {
                debug!(notification_id = %n.id, "Scheduled fire already submitted");
            }
        }
        Ok(())
    }
}
