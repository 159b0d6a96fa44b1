//! Cron-driven recurring notifications.

use std::{collections::HashMap, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    Error, Result,
    models::{notification::NewNotification, schedule::ScheduledNotification, validation},
    trace::TraceContext,
};

/// Receives the notifications produced at each fire time.
#[async_trait]
pub trait ScheduledSubmitter: Send + Sync {
    async fn submit_scheduled(&self, notification: NewNotification) -> Result<()>;
}

struct Entry {
    definition: ScheduledNotification,
    token: CancellationToken,
}

pub struct Scheduler {
    submitter: Arc<dyn ScheduledSubmitter>,
    entries: Mutex<HashMap<Uuid, Entry>>,
    root: CancellationToken,
}

impl Scheduler {
    pub fn new(submitter: Arc<dyn ScheduledSubmitter>) -> Self {
        Self {
            submitter,
            entries: Mutex::new(HashMap::new()),
            root: CancellationToken::new(),
        }
    }

    /// Registers `definition`, replacing any schedule with the same id.
    pub fn add(&self, definition: ScheduledNotification) -> Result<Uuid> {
        validation::validate_tenant_id(&definition.tenant_id)?;
        definition.request.validate()?;

        let schedule = Schedule::from_str(&definition.cron_expression).map_err(|e| {
            Error::validation(format!(
                "Invalid cron expression '{}': {}",
                definition.cron_expression, e
            ))
        })?;

        if self.root.is_cancelled() {
            return Err(Error::InvalidState("scheduler is shut down".to_string()));
        }

        let id = definition.id;
        let token = self.root.child_token();

        // Check and insert under one guard so another tenant cannot claim the id in between.
        let previous = {
            let mut entries = self.entries.lock();

            if let Some(existing) = entries.get(&id) {
                if existing.definition.tenant_id != definition.tenant_id {
                    return Err(Error::Conflict(format!("schedule {} already exists", id)));
                }
            }

            tokio::spawn(run_schedule(
                definition.clone(),
                schedule,
                Arc::clone(&self.submitter),
                token.clone(),
            ));

            entries.insert(id, Entry { definition, token })
        };

        if let Some(previous) = previous {
            previous.token.cancel();
            debug!(schedule_id = %id, "Replaced existing schedule");
        }

        info!(schedule_id = %id, "Schedule registered");
        Ok(id)
    }

    pub fn remove(&self, tenant_id: &str, id: Uuid) -> Result<()> {
        let entry = {
            let mut entries = self.entries.lock();
            match entries.get(&id) {
                Some(entry) if entry.definition.tenant_id == tenant_id => entries.remove(&id),
                _ => None,
            }
        }
        .ok_or_else(|| Error::not_found("schedule", id))?;

        entry.token.cancel();
        info!(schedule_id = %id, "Schedule removed");
        Ok(())
    }

    /// Other tenants' schedules are reported as missing.
    pub fn get(&self, tenant_id: &str, id: Uuid) -> Result<ScheduledNotification> {
        self.entries
            .lock()
            .get(&id)
            .filter(|entry| entry.definition.tenant_id == tenant_id)
            .map(|entry| entry.definition.clone())
            .ok_or_else(|| Error::not_found("schedule", id))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        self.root.cancel();
        self.entries.lock().clear();
        info!("Scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

async fn run_schedule(
    definition: ScheduledNotification,
    schedule: Schedule,
    submitter: Arc<dyn ScheduledSubmitter>,
    token: CancellationToken,
) {
    let mut cursor = Utc::now();

    loop {
        let Some(fire_at) = schedule.after(&cursor).next() else {
            debug!(schedule_id = %definition.id, "Schedule has no upcoming fire time");
            break;
        };

        let wait = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        cursor = fire_at;

        let submitted = TraceContext::root()
            .scope(submitter.submit_scheduled(definition.notification_for(fire_at)))
            .await;

        if let Err(e) = submitted {
            warn!(
                schedule_id = %definition.id,
                tenant_id = %definition.tenant_id,
                fire_at = %fire_at,
                error = %e,
                "Scheduled notification was not submitted"
            );
        }
    }
}
