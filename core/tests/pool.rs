#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use opthub_core::CancelHandle;
use opthub_core::Config;
use opthub_core::JobRunner;
use opthub_core::JobStore;
use opthub_core::WorkerPool;
use opthub_protocol::ErrorKind;
use opthub_protocol::FitnessSelector;
use opthub_protocol::GroupId;
use opthub_protocol::JobError;
use opthub_protocol::JobId;
use opthub_protocol::JobRecord;
use opthub_protocol::JobState;
use opthub_protocol::Objective;
use opthub_protocol::OptimizationResult;
use opthub_protocol::ProblemDescriptor;
use pretty_assertions::assert_eq;

fn test_config(workers: usize, queue_capacity: usize) -> Config {
    Config {
        workers,
        queue_capacity,
        hard_timeout: Duration::from_secs(5),
        soft_grace: Duration::from_millis(200),
        max_retries: 2,
        retry_backoff: Duration::from_millis(10),
        ..Config::default()
    }
}

fn pending_record() -> JobRecord {
    JobRecord::pending(
        JobId::new(),
        GroupId::new(),
        "particle_swarm",
        ProblemDescriptor {
            dim: 1,
            bounds: vec![(-1.0, 1.0)],
            objective: Objective::Minimize,
            fitness: FitnessSelector::Benchmark {
                name: "sphere".to_string(),
            },
        },
        BTreeMap::new(),
        Utc::now(),
    )
}

fn success_result() -> OptimizationResult {
    OptimizationResult {
        best_solution: vec![0.0],
        best_fitness: 0.0,
        convergence_curve: vec![0.0],
        iterations_completed: 1,
        execution_time: 0.0,
        params: BTreeMap::new(),
        algorithm_display_name: "stub".to_string(),
    }
}

async fn wait_for_terminal(store: &JobStore, id: JobId) -> JobRecord {
    for _ in 0..500 {
        if let Some(record) = store.get(id) {
            if record.state.is_terminal() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} did not reach a terminal state in time");
}

/// Runner that sleeps, tracking how many invocations run concurrently.
struct ConcurrencyProbe {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl JobRunner for ConcurrencyProbe {
    async fn run(
        &self,
        _record: &JobRecord,
        _cancel: &CancelHandle,
    ) -> Result<OptimizationResult, JobError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(success_result())
    }
}

#[tokio::test]
async fn started_jobs_never_exceed_pool_size() {
    let store = Arc::new(JobStore::new(16));
    let runner = Arc::new(ConcurrencyProbe {
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let pool = WorkerPool::start(&test_config(2, 16), Arc::clone(&store), runner.clone());

    let mut ids = Vec::new();
    for _ in 0..6 {
        let record = pending_record();
        let id = record.id;
        store.create(record).expect("create");
        pool.submit(id).expect("submit");
        ids.push(id);
    }
    for id in ids {
        let record = wait_for_terminal(&store, id).await;
        assert_eq!(record.state, JobState::Success);
    }
    assert!(runner.peak.load(Ordering::SeqCst) <= 2);
    pool.shutdown().await;
}

/// Runner that fails with a configurable kind for the first N attempts.
struct FlakyRunner {
    failures: AtomicU32,
    kind: ErrorKind,
}

#[async_trait]
impl JobRunner for FlakyRunner {
    async fn run(
        &self,
        _record: &JobRecord,
        _cancel: &CancelHandle,
    ) -> Result<OptimizationResult, JobError> {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(JobError::new(self.kind, "injected failure"));
        }
        Ok(success_result())
    }
}

#[tokio::test]
async fn transient_failures_are_retried_with_attempt_accounting() {
    let store = Arc::new(JobStore::new(16));
    let runner = Arc::new(FlakyRunner {
        failures: AtomicU32::new(2),
        kind: ErrorKind::Container,
    });
    let pool = WorkerPool::start(&test_config(1, 16), Arc::clone(&store), runner);

    let record = pending_record();
    let id = record.id;
    store.create(record).expect("create");
    pool.submit(id).expect("submit");

    let finished = wait_for_terminal(&store, id).await;
    assert_eq!(finished.state, JobState::Success);
    assert_eq!(finished.attempts, 3);
    pool.shutdown().await;
}

#[tokio::test]
async fn retry_budget_is_bounded() {
    let store = Arc::new(JobStore::new(16));
    let runner = Arc::new(FlakyRunner {
        failures: AtomicU32::new(10),
        kind: ErrorKind::Parse,
    });
    let pool = WorkerPool::start(&test_config(1, 16), Arc::clone(&store), runner);

    let record = pending_record();
    let id = record.id;
    store.create(record).expect("create");
    pool.submit(id).expect("submit");

    let finished = wait_for_terminal(&store, id).await;
    assert_eq!(finished.state, JobState::Failure);
    // Initial attempt plus max_retries.
    assert_eq!(finished.attempts, 3);
    assert!(matches!(&finished.error, Some(err) if err.kind == ErrorKind::Parse));
    pool.shutdown().await;
}

#[tokio::test]
async fn deterministic_failures_are_not_retried() {
    let store = Arc::new(JobStore::new(16));
    let runner = Arc::new(FlakyRunner {
        failures: AtomicU32::new(10),
        kind: ErrorKind::Runtime,
    });
    let pool = WorkerPool::start(&test_config(1, 16), Arc::clone(&store), runner);

    let record = pending_record();
    let id = record.id;
    store.create(record).expect("create");
    pool.submit(id).expect("submit");

    let finished = wait_for_terminal(&store, id).await;
    assert_eq!(finished.state, JobState::Failure);
    assert_eq!(finished.attempts, 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn queue_at_capacity_rejects_without_disturbing_queued_jobs() {
    let store = Arc::new(JobStore::new(16));
    // One slow worker so the queue actually fills.
    let runner = Arc::new(ConcurrencyProbe {
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let pool = WorkerPool::start(&test_config(1, 2), Arc::clone(&store), runner);

    let mut accepted = Vec::new();
    let mut rejected = 0;
    for _ in 0..8 {
        let record = pending_record();
        let id = record.id;
        store.create(record).expect("create");
        match pool.submit(id) {
            Ok(()) => accepted.push(id),
            Err(err) => {
                assert_eq!(err.kind, ErrorKind::Validation);
                rejected += 1;
            }
        }
    }
    assert!(rejected > 0, "expected at least one over-capacity rejection");

    for id in accepted {
        let record = wait_for_terminal(&store, id).await;
        assert_eq!(record.state, JobState::Success);
    }
    pool.shutdown().await;
}

/// Runner that cooperates with cancellation: returns the timeout error as
/// soon as its cancel handle fires.
struct CooperativeRunner;

#[async_trait]
impl JobRunner for CooperativeRunner {
    async fn run(
        &self,
        _record: &JobRecord,
        cancel: &CancelHandle,
    ) -> Result<OptimizationResult, JobError> {
        cancel.token.cancelled().await;
        Err(JobError::timeout("run cancelled before completion"))
    }
}

#[tokio::test]
async fn soft_deadline_triggers_cooperative_cancellation() {
    let store = Arc::new(JobStore::new(16));
    let mut config = test_config(1, 4);
    config.hard_timeout = Duration::from_millis(300);
    config.soft_grace = Duration::from_millis(200);
    let pool = WorkerPool::start(&config, Arc::clone(&store), Arc::new(CooperativeRunner));

    let record = pending_record();
    let id = record.id;
    store.create(record).expect("create");
    pool.submit(id).expect("submit");

    let finished = wait_for_terminal(&store, id).await;
    assert_eq!(finished.state, JobState::Failure);
    assert!(matches!(&finished.error, Some(err) if err.kind == ErrorKind::Timeout));
    pool.shutdown().await;
}

/// Runner that ignores cancellation entirely.
struct StubbornRunner;

#[async_trait]
impl JobRunner for StubbornRunner {
    async fn run(
        &self,
        _record: &JobRecord,
        _cancel: &CancelHandle,
    ) -> Result<OptimizationResult, JobError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(success_result())
    }
}

#[tokio::test]
async fn hard_deadline_forces_timeout_failure() {
    let store = Arc::new(JobStore::new(16));
    let mut config = test_config(1, 4);
    config.hard_timeout = Duration::from_millis(300);
    config.soft_grace = Duration::from_millis(100);
    let pool = WorkerPool::start(&config, Arc::clone(&store), Arc::new(StubbornRunner));

    let record = pending_record();
    let id = record.id;
    store.create(record).expect("create");
    pool.submit(id).expect("submit");

    let finished = wait_for_terminal(&store, id).await;
    assert_eq!(finished.state, JobState::Failure);
    assert!(matches!(&finished.error, Some(err) if err.kind == ErrorKind::Timeout));
    // Partial results are discarded on timeout.
    assert_eq!(finished.result, None);
    pool.shutdown().await;
}

#[tokio::test]
async fn explicit_cancel_reaches_a_running_job() {
    let store = Arc::new(JobStore::new(16));
    let pool = WorkerPool::start(
        &test_config(1, 4),
        Arc::clone(&store),
        Arc::new(CooperativeRunner),
    );

    let record = pending_record();
    let id = record.id;
    store.create(record).expect("create");
    pool.submit(id).expect("submit");

    // Wait until the worker has picked the job up, then cancel it.
    for _ in 0..200 {
        if pool.running_jobs() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(pool.cancel(id));

    let finished = wait_for_terminal(&store, id).await;
    assert_eq!(finished.state, JobState::Failure);
    assert!(matches!(&finished.error, Some(err) if err.kind == ErrorKind::Timeout));
    pool.shutdown().await;
}
