//! Rebuilds dispatch jobs from stored records.
//!
//! The dispatch queue lives in memory, so jobs are lost on a crash, a failed
//! push or a shutdown that races a submission. The records are not: anything
//! still `pending`, `queued` or `sending` is re-enqueued from here.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{task::JoinHandle, time::interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    Result,
    models::{job::DispatchJob, notification::Notification, status::NotificationStatus},
    pipeline::NotificationService,
};

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub interval: Duration,
    /// Records untouched for this long are assumed to have lost their job.
    pub stale_after: Duration,
    pub max_tenants: usize,
    pub batch_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            max_tenants: 50,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub armed: usize,
}

pub struct DispatchRecovery {
    service: Arc<NotificationService>,
    config: RecoveryConfig,
}

impl DispatchRecovery {
    pub fn new(service: Arc<NotificationService>, config: RecoveryConfig) -> Self {
        Self { service, config }
    }

    /// Startup pass, run before anything can submit or dispatch. Every
    /// undispatched record is reclaimed, `sending` ones included, and
    /// future schedules are re-armed.
    pub async fn recover_after_restart(&self) -> Result<RecoveryReport> {
        let report = self.pass(true).await?;

        info!(
            requeued = report.requeued,
            armed = report.armed,
            "Dispatch recovery after restart finished"
        );

        Ok(report)
    }

    /// Periodic pass. Only stale `pending` and `queued` records with no job
    /// waiting are reclaimed; `sending` may belong to a live worker.
    pub async fn sweep(&self) -> Result<RecoveryReport> {
        let report = self.pass(false).await?;

        if report.requeued > 0 {
            warn!(requeued = report.requeued, "Recovered notifications that had lost their job");
        }

        Ok(report)
    }

    async fn pass(&self, after_restart: bool) -> Result<RecoveryReport> {
        let store = self.service.repository().store();
        let mut report = RecoveryReport::default();

        let tenants = store.undispatched_tenants(self.config.max_tenants).await?;

        for tenant_id in tenants {
            let records = store
                .find_undispatched(&tenant_id, self.config.batch_size)
                .await?;

            for notification in records {
                if self.service.queue().contains(notification.id) {
                    continue;
                }

                match self.reclaim(&notification, after_restart).await {
                    Ok(Reclaimed::Requeued) => report.requeued += 1,
                    Ok(Reclaimed::Armed) => report.armed += 1,
                    Ok(Reclaimed::Left) => {}
                    Err(e) if e.is_conflict() => {
                        debug!(notification_id = %notification.id, error = %e, "Record moved on during recovery");
                    }
                    Err(e) => {
                        warn!(
                            notification_id = %notification.id,
                            tenant_id = %notification.tenant_id,
                            error = %e,
                            "Failed to recover notification"
                        );
                    }
                }
            }
        }

        Ok(report)
    }

    async fn reclaim(&self, notification: &Notification, after_restart: bool) -> Result<Reclaimed> {
        let now = Utc::now();
        let stale_before = now
            - chrono::Duration::from_std(self.config.stale_after)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let stale = after_restart || notification.updated_at < stale_before;

        match notification.status {
            NotificationStatus::Pending => match notification.scheduled_for {
                Some(at) if at > now => {
                    if !after_restart {
                        return Ok(Reclaimed::Left);
                    }
                    self.service.arm_delayed_enqueue(notification);
                    Ok(Reclaimed::Armed)
                }
                // Still inside the window where submit or a timer is queueing it.
                Some(at) if !after_restart && at >= stale_before => Ok(Reclaimed::Left),
                _ if stale => {
                    self.service.enqueue(notification).await?;
                    Ok(Reclaimed::Requeued)
                }
                _ => Ok(Reclaimed::Left),
            },
            NotificationStatus::Queued if stale => self.push(notification),
            NotificationStatus::Sending if after_restart => self.push(notification),
            _ => Ok(Reclaimed::Left),
        }
    }

    fn push(&self, notification: &Notification) -> Result<Reclaimed> {
        self.service
            .queue()
            .enqueue(DispatchJob::for_notification(notification))?;

        debug!(
            notification_id = %notification.id,
            tenant_id = %notification.tenant_id,
            status = %notification.status,
            "Dispatch job rebuilt"
        );

        Ok(Reclaimed::Requeued)
    }

    pub async fn run(self, token: CancellationToken) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            stale_after_ms = self.config.stale_after.as_millis() as u64,
            "Dispatch recovery started"
        );

        let mut ticker = interval(self.config.interval);
        // The first tick fires immediately; the startup pass already covered it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Dispatch recovery sweep failed");
                    }
                }
            }
        }

        info!("Dispatch recovery stopped");
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }
}

enum Reclaimed {
    Requeued,
    Armed,
    Left,
}
