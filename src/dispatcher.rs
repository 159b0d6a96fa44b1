//! Priority dispatch queue and the worker pool draining it.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::Notify, task::JoinSet};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{Error, Result, metrics::Metrics, models::job::DispatchJob};

struct QueuedJob {
    rank: u8,
    seq: u64,
    job: DispatchJob,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // BinaryHeap is a max-heap: the lowest rank, then the lowest sequence
    // number, must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .rank
            .cmp(&self.rank)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedJob>,
    next_seq: u64,
    closed: bool,
}

/// Unbounded priority queue with a blocking `dequeue`.
#[derive(Default)]
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, job: DispatchJob) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::InvalidState("dispatch queue is closed".to_string()));
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(QueuedJob {
                rank: job.priority.rank(),
                seq,
                job,
            });
        }

        self.available.notify_one();
        Ok(())
    }

    /// Whether a job for `notification_id` is waiting in the queue.
    pub fn contains(&self, notification_id: Uuid) -> bool {
        self.state
            .lock()
            .heap
            .iter()
            .any(|queued| queued.job.notification_id == notification_id)
    }

    pub fn try_dequeue(&self) -> Option<DispatchJob> {
        self.state.lock().heap.pop().map(|queued| queued.job)
    }

    /// Waits for the next job. Returns `None` once the queue is closed and
    /// every remaining job has been handed out.
    pub async fn dequeue(&self) -> Option<DispatchJob> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(queued) = state.heap.pop() {
                    return Some(queued.job);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: DispatchJob) -> Result<()>;
}

pub struct WorkerPool {
    queue: Arc<DispatchQueue>,
    workers: JoinSet<()>,
}

impl WorkerPool {
    pub fn start(
        queue: Arc<DispatchQueue>,
        handler: Arc<dyn JobHandler>,
        metrics: Arc<Metrics>,
        concurrency: usize,
    ) -> Self {
        let mut workers = JoinSet::new();

        for worker_id in 0..concurrency.max(1) {
            workers.spawn(worker_loop(
                worker_id,
                Arc::clone(&queue),
                Arc::clone(&handler),
                Arc::clone(&metrics),
            ));
        }

        info!(concurrency, "Worker pool started");

        Self { queue, workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Closes the queue and waits for the workers to drain it.
    pub async fn shutdown(mut self) {
        self.queue.close();

        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker task terminated abnormally");
            }
        }

        info!("Worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<DispatchQueue>,
    handler: Arc<dyn JobHandler>,
    metrics: Arc<Metrics>,
) {
    debug!(worker_id, "Worker started");

    while let Some(job) = queue.dequeue().await {
        metrics.queue_depth.set(queue.len() as i64);

        let notification_id = job.notification_id;
        let channel = job.request.channel();
        let trace = job.trace();
        let started = Instant::now();

        let outcome = match trace.scope(handler.handle(job)).await {
            Ok(()) => "success",
            Err(e) => {
                debug!(worker_id, %notification_id, error = %e, "Job failed");
                "failure"
            }
        };

        metrics
            .job_duration_seconds
            .with_label_values(&[channel.as_str(), outcome])
            .observe(started.elapsed().as_secs_f64());
    }

    debug!(worker_id, "Worker stopped");
}
