//! The queue-backed worker pool.
//!
//! N workers drain a bounded MPMC submission queue and drive each job
//! through the store's state machine: STARTED on pickup, then exactly one
//! terminal write. The queue carries only job ids; the store owns the
//! record, and the pool owns the job exclusively between dequeue and the
//! terminal write.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use opthub_protocol::ErrorKind;
use opthub_protocol::JobError;
use opthub_protocol::JobId;
use opthub_protocol::JobRecord;
use opthub_protocol::JobState;
use opthub_protocol::OptimizationResult;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::runner::CancelHandle;
use crate::runner::JobRunner;
use crate::store::JobStore;

/// Deadlines and retry policy a worker applies to every job.
#[derive(Debug, Clone)]
struct JobPolicy {
    hard_timeout: Duration,
    soft_grace: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

pub struct WorkerPool {
    queue_tx: async_channel::Sender<JobId>,
    running: Arc<Mutex<HashMap<JobId, CancelHandle>>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `config.workers` worker tasks draining a queue of
    /// `config.queue_capacity` slots.
    pub fn start(config: &Config, store: Arc<JobStore>, runner: Arc<dyn JobRunner>) -> Arc<Self> {
        let (queue_tx, queue_rx) = async_channel::bounded(config.queue_capacity);
        let running = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let policy = JobPolicy {
            hard_timeout: config.hard_timeout,
            soft_grace: config.soft_grace,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
        };

        let mut workers = Vec::with_capacity(config.workers);
        for worker_index in 0..config.workers {
            workers.push(tokio::spawn(worker_loop(
                worker_index,
                queue_rx.clone(),
                Arc::clone(&store),
                Arc::clone(&runner),
                Arc::clone(&running),
                policy.clone(),
                shutdown.clone(),
            )));
        }
        info!("worker pool started with {} workers", config.workers);

        Arc::new(Self {
            queue_tx,
            running,
            shutdown,
            workers: Mutex::new(workers),
        })
    }

    /// Enqueue a job already recorded as PENDING in the store. Over-capacity
    /// submissions are rejected at this boundary; queued jobs are unaffected.
    pub fn submit(&self, id: JobId) -> Result<(), JobError> {
        match self.queue_tx.try_send(id) {
            Ok(()) => Ok(()),
            Err(async_channel::TrySendError::Full(_)) => Err(JobError::validation(
                "submission queue is at capacity, try again later",
            )),
            Err(async_channel::TrySendError::Closed(_)) => {
                Err(JobError::container("worker pool is shut down"))
            }
        }
    }

    /// Cooperatively cancel a STARTED job. Returns false when the job is
    /// not currently held by a worker.
    pub fn cancel(&self, id: JobId) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        match running.get(&id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of jobs currently held by workers.
    pub fn running_jobs(&self) -> usize {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop accepting work and wind the workers down.
    pub async fn shutdown(&self) {
        self.queue_tx.close();
        self.shutdown.cancel();
        let workers = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            let _ = worker.await;
        }
    }
}

async fn worker_loop(
    worker_index: usize,
    queue_rx: async_channel::Receiver<JobId>,
    store: Arc<JobStore>,
    runner: Arc<dyn JobRunner>,
    running: Arc<Mutex<HashMap<JobId, CancelHandle>>>,
    policy: JobPolicy,
    shutdown: CancellationToken,
) {
    loop {
        let id = tokio::select! {
            received = queue_rx.recv() => match received {
                Ok(id) => id,
                Err(_) => break, // queue closed
            },
            _ = shutdown.cancelled() => break,
        };
        run_one(id, &store, runner.as_ref(), &running, &policy).await;
    }
    info!("worker {worker_index} stopped");
}

/// Drive one job from pickup to its terminal state. Exactly one worker
/// executes this for a given id; the queue hands each id out once.
async fn run_one(
    id: JobId,
    store: &JobStore,
    runner: &dyn JobRunner,
    running: &Mutex<HashMap<JobId, CancelHandle>>,
    policy: &JobPolicy,
) {
    // The record may have been evicted while queued.
    let Some(record) = store.get(id) else {
        warn!("job {id} vanished before pickup");
        return;
    };
    if record.state != JobState::Pending {
        warn!("job {id} dequeued in state {}, skipping", record.state);
        return;
    }

    if let Err(err) = store.update(id, |r| {
        r.state = JobState::Started;
        r.started_at = Some(Utc::now());
    }) {
        error!("failed to start job {id}: {err}");
        return;
    }

    let cancel = CancelHandle::new();
    running
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(id, cancel.clone());

    let (outcome, attempts) = run_with_retries(&record, runner, &cancel, policy).await;

    running
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&id);

    let write = match outcome {
        Ok(result) => store.update(id, |r| {
            r.state = JobState::Success;
            r.result = Some(result.clone());
            r.error = None;
            r.finished_at = Some(Utc::now());
            r.attempts = attempts;
        }),
        Err(job_error) => store.update(id, |r| {
            r.state = JobState::Failure;
            r.error = Some(job_error.clone());
            r.result = None;
            r.finished_at = Some(Utc::now());
            r.attempts = attempts;
        }),
    };
    if let Err(err) = write {
        error!("failed to finish job {id}: {err}");
    }
}

/// Execute with soft/hard deadlines, retrying transient failures with
/// exponential backoff. Retries stay within the single STARTED phase; only
/// the final outcome is written back.
async fn run_with_retries(
    record: &JobRecord,
    runner: &dyn JobRunner,
    cancel: &CancelHandle,
    policy: &JobPolicy,
) -> (Result<OptimizationResult, JobError>, u32) {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let outcome = run_with_deadlines(record, runner, cancel, policy).await;

        let retryable = matches!(
            &outcome,
            Err(err) if err.kind.is_transient()
        ) && attempts <= policy.max_retries
            && !cancel.is_cancelled();
        if !retryable {
            return (outcome, attempts);
        }

        let backoff = policy.retry_backoff * 2u32.saturating_pow(attempts - 1);
        let kind = outcome
            .err()
            .map(|e| e.kind)
            .unwrap_or(ErrorKind::Container);
        warn!(
            "job {} attempt {attempts} failed with {kind}, retrying in {:?}",
            record.id, backoff
        );
        tokio::time::sleep(backoff).await;
    }
}

async fn run_with_deadlines(
    record: &JobRecord,
    runner: &dyn JobRunner,
    cancel: &CancelHandle,
    policy: &JobPolicy,
) -> Result<OptimizationResult, JobError> {
    let soft_deadline = policy.hard_timeout.saturating_sub(policy.soft_grace);
    let run = runner.run(record, cancel);
    tokio::pin!(run);

    tokio::select! {
        outcome = &mut run => outcome,
        _ = tokio::time::sleep(soft_deadline) => {
            // Soft deadline: cancel cooperatively, then give the runner the
            // grace window to come back before the hard stop.
            cancel.cancel();
            match tokio::time::timeout(policy.soft_grace, &mut run).await {
                Ok(outcome) => outcome,
                Err(_) => Err(JobError::timeout(format!(
                    "job exceeded the {}s hard deadline",
                    policy.hard_timeout.as_secs()
                ))),
            }
        }
        _ = cancel.token.cancelled() => {
            // Explicit cancellation (client request or eviction).
            cancel.cancel();
            match tokio::time::timeout(policy.soft_grace, &mut run).await {
                Ok(outcome) => outcome,
                Err(_) => Err(JobError::timeout("job cancelled and did not stop in time")),
            }
        }
    }
}
