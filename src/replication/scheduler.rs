//! Dispatch loop shared by every work scheduler.
//!
//! A [`WorkScheduler`] owns a [`SchedulerQueue`] and borrows permits from a
//! [`WorkerPool`]. The dispatcher task takes a permit, waits for the next
//! eligible batch, and runs it on a tracked task. A successful batch is
//! finalized before its completion resolves; a failed (or panicking) batch
//! freezes its generation.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{ReplicationError, SchedulerError};
use crate::metrics::{ReplicationMetricsSink, SchedulerMetrics, WorkKind};

use super::completion::BatchFuture;
use super::generation::{AttemptId, GenerationId};
use super::queue::{SchedulerBatch, SchedulerQueue};

/// Payload of a batch, as seen by the dispatch loop.
pub trait BatchPayload: Send + Sync + 'static {
    /// Per-index sink the batch's processing is reported to.
    fn metrics_sink(&self) -> Option<&dyn ReplicationMetricsSink> {
        None
    }
}

/// What a scheduler does with a dispatched batch.
#[async_trait]
pub trait BatchStrategy: Send + Sync + 'static {
    type Payload: BatchPayload;

    const KIND: WorkKind;

    /// Processes the batch. Errors are already classified; the scheduler only
    /// tells success from failure.
    async fn process(&self, batch: &SchedulerBatch<Self::Payload>) -> Result<(), ReplicationError>;
}

/// Fixed number of batch slots, shareable by several schedulers.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not currently running a batch.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Paused,
    Running,
    ShutDown,
}

const PAUSED: u8 = 0;
const RUNNING: u8 = 1;
const SHUT_DOWN: u8 = 2;

struct Shared<S: BatchStrategy> {
    name: &'static str,
    queue: SchedulerQueue<S::Payload>,
    strategy: S,
    pool: WorkerPool,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    state: AtomicU8,
}

pub struct WorkScheduler<S: BatchStrategy> {
    shared: Arc<Shared<S>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<S: BatchStrategy> WorkScheduler<S> {
    /// Creates a paused scheduler; nothing is dispatched until [`start`](Self::start).
    pub fn new(
        name: &'static str,
        strategy: S,
        pool: WorkerPool,
        metrics: Arc<SchedulerMetrics>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                queue: SchedulerQueue::new(metrics),
                strategy,
                pool,
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                state: AtomicU8::new(PAUSED),
            }),
            dispatcher: Mutex::new(None),
        }
    }

    /// Creates and starts a scheduler. Must be called inside a tokio runtime.
    pub fn create(
        name: &'static str,
        strategy: S,
        pool: WorkerPool,
        metrics: Arc<SchedulerMetrics>,
    ) -> Self {
        let scheduler = Self::new(name, strategy, pool, metrics);
        scheduler.start();
        scheduler
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub fn state(&self) -> SchedulerState {
        match self.shared.state.load(Ordering::Acquire) {
            PAUSED => SchedulerState::Paused,
            RUNNING => SchedulerState::Running,
            _ => SchedulerState::ShutDown,
        }
    }

    pub fn queue(&self) -> &SchedulerQueue<S::Payload> {
        &self.shared.queue
    }

    pub fn strategy(&self) -> &S {
        &self.shared.strategy
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.shared.pool
    }

    /// Spawns the dispatcher. Starting a running or shut down scheduler does nothing.
    pub fn start(&self) {
        if self
            .shared
            .state
            .compare_exchange(PAUSED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::info!(
            scheduler = self.shared.name,
            workers = self.shared.pool.size(),
            "Work scheduler started"
        );
        let handle = tokio::spawn(dispatch(self.shared.clone()));
        *self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Queues a batch behind the outstanding work of its generation.
    pub fn submit(&self, batch: SchedulerBatch<S::Payload>) -> Result<BatchFuture, SchedulerError> {
        if self.state() == SchedulerState::ShutDown {
            return Err(SchedulerError::ShutDown {
                scheduler: self.shared.name,
            });
        }
        let future = self.shared.queue.add(batch)?;
        if self.state() == SchedulerState::ShutDown {
            // Lost the race with shutdown() after the state check above.
            self.shared.queue.drain_pending(ReplicationError::ShutDown);
        }
        Ok(future)
    }

    /// See [`SchedulerQueue::cancel`].
    pub fn cancel(
        &self,
        generation_id: GenerationId,
        attempt_id: Option<AttemptId>,
        cause: ReplicationError,
    ) -> BatchFuture {
        self.shared.queue.cancel(generation_id, attempt_id, cause)
    }

    pub fn retire_generation(&self, generation_id: GenerationId) {
        self.shared.queue.retire_generation(generation_id);
    }

    /// Stops dispatching, waits for running batches, and fails whatever is
    /// still queued with [`ReplicationError::ShutDown`].
    pub async fn shutdown(&self) {
        if self.shared.state.swap(SHUT_DOWN, Ordering::AcqRel) == SHUT_DOWN {
            return;
        }
        self.shared.shutdown.cancel();

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(scheduler = self.shared.name, "Dispatcher task failed: {}", e);
            }
        }

        self.shared.tracker.close();
        self.shared.tracker.wait().await;

        let drained = self.shared.queue.drain_pending(ReplicationError::ShutDown);
        if drained > 0 {
            tracing::warn!(
                scheduler = self.shared.name,
                batches = drained,
                "Failed queued batches on shutdown"
            );
        }
        tracing::info!(scheduler = self.shared.name, "Work scheduler shut down");
    }
}

impl<S: BatchStrategy> Drop for WorkScheduler<S> {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

/// Takes the next eligible batch, then waits for a pool permit. A scheduler
/// never holds a permit while its queue is empty, so idle schedulers sharing
/// the pool do not starve busy ones.
async fn dispatch<S: BatchStrategy>(shared: Arc<Shared<S>>) {
    loop {
        let batch = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            batch = shared.queue.remove() => batch,
        };

        let permit = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => None,
            permit = shared.pool.permits.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            // Already out of the ready set, so drain_pending would miss it.
            shared.queue.mark_failed(&batch, ReplicationError::ShutDown);
            break;
        };

        shared.queue.metrics().record_dequeue(batch.queued_for());
        tracing::trace!(
            scheduler = shared.name,
            generation = %batch.generation_id(),
            sequence = batch.sequence(),
            size = batch.size(),
            "Dispatching batch"
        );

        let worker = shared.clone();
        shared.tracker.spawn(async move {
            worker.run_batch(batch).await;
            drop(permit);
        });
    }
}

impl<S: BatchStrategy> Shared<S> {
    async fn run_batch(&self, batch: Arc<SchedulerBatch<S::Payload>>) {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.strategy.process(&batch))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ReplicationError::from_panic(panic.as_ref())));
        let elapsed = started.elapsed();

        self.queue
            .metrics()
            .record_batch(batch.size(), elapsed, outcome.is_ok());
        if let Some(sink) = batch.payload().metrics_sink() {
            sink.record_batch(S::KIND, batch.size(), elapsed, outcome.is_ok());
        }

        match outcome {
            Ok(()) => {
                self.queue.finalize_batch(&batch);
                batch.completion().succeed();
            }
            Err(err) => {
                tracing::error!(
                    scheduler = self.name,
                    generation = %batch.generation_id(),
                    attempt = ?batch.attempt_id(),
                    priority = %batch.priority(),
                    sequence = batch.sequence(),
                    size = batch.size(),
                    error = %err,
                    "Batch processing failed"
                );
                self.queue.mark_failed(&batch, err);
            }
        }
    }
}

/// Runs blocking collaborator code on the blocking pool. A panic inside `f`
/// becomes a failed outcome.
pub(crate) async fn run_blocking<F, T>(f: F) -> Result<T, ReplicationError>
where
    F: FnOnce() -> Result<T, ReplicationError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(ReplicationError::from_panic(e.into_panic().as_ref())),
        Err(e) => Err(ReplicationError::failed(format!("blocking task cancelled: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::replication::generation::{IndexId, Priority};

    /// Test payload: waits on `gate` (when given), then returns `outcome`.
    struct Step {
        name: &'static str,
        gate: Option<Arc<Semaphore>>,
        outcome: Result<(), ReplicationError>,
        panic: bool,
    }

    impl BatchPayload for Step {}

    struct Recorder {
        started: mpsc::UnboundedSender<&'static str>,
    }

    #[async_trait]
    impl BatchStrategy for Recorder {
        type Payload = Step;
        const KIND: WorkKind = WorkKind::Indexing;

        async fn process(&self, batch: &SchedulerBatch<Step>) -> Result<(), ReplicationError> {
            let step = batch.payload();
            let _ = self.started.send(step.name);
            if let Some(gate) = &step.gate {
                let _permit = gate.acquire().await;
            }
            if step.panic {
                panic!("step {} exploded", step.name);
            }
            step.outcome.clone()
        }
    }

    fn scheduler(
        pool: WorkerPool,
    ) -> (WorkScheduler<Recorder>, mpsc::UnboundedReceiver<&'static str>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = WorkScheduler::create(
            "testWorkScheduler",
            Recorder { started: tx },
            pool,
            Arc::new(SchedulerMetrics::new("test")),
        );
        (scheduler, rx)
    }

    fn step(gen: GenerationId, name: &'static str, gate: Option<Arc<Semaphore>>) -> SchedulerBatch<Step> {
        step_with(gen, name, gate, Ok(()), false)
    }

    fn step_with(
        gen: GenerationId,
        name: &'static str,
        gate: Option<Arc<Semaphore>>,
        outcome: Result<(), ReplicationError>,
        panic: bool,
    ) -> SchedulerBatch<Step> {
        SchedulerBatch::new(
            gen,
            None,
            Priority::SteadyStateChangeStream,
            1,
            Step {
                name,
                gate,
                outcome,
                panic,
            },
        )
    }

    fn gate() -> Arc<Semaphore> {
        Arc::new(Semaphore::new(0))
    }

    fn generation() -> GenerationId {
        GenerationId::first(IndexId::new())
    }

    async fn next_started(rx: &mut mpsc::UnboundedReceiver<&'static str>) -> &'static str {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("a batch should start")
            .expect("recorder alive")
    }

    async fn assert_nothing_starts(rx: &mut mpsc::UnboundedReceiver<&'static str>) {
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err(),
            "no batch should start"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_bounds_concurrency() {
        let (scheduler, mut started) = scheduler(WorkerPool::new(2));
        let gates = [gate(), gate(), gate()];
        let names = ["a", "b", "c"];
        let mut futures = Vec::new();
        for (name, gate) in names.iter().zip(gates.iter()) {
            futures.push(scheduler.submit(step(generation(), name, Some(gate.clone()))).unwrap());
        }

        let mut running = vec![
            next_started(&mut started).await,
            next_started(&mut started).await,
        ];
        running.sort();
        assert_eq!(running, vec!["a", "b"]);
        assert_nothing_starts(&mut started).await;

        gates[0].add_permits(1);
        assert_eq!(next_started(&mut started).await, "c");
        gates[1].add_permits(1);
        gates[2].add_permits(1);
        for future in futures {
            assert_eq!(future.await, Ok(()));
        }
        assert_eq!(scheduler.pool().available(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_generation_runs_in_order() {
        let (scheduler, mut started) = scheduler(WorkerPool::new(4));
        let gen = generation();
        let gate = gate();
        let first = scheduler.submit(step(gen, "first", Some(gate.clone()))).unwrap();
        let second = scheduler.submit(step(gen, "second", None)).unwrap();

        assert_eq!(next_started(&mut started).await, "first");
        assert_nothing_starts(&mut started).await;
        assert!(!second.is_done());

        gate.add_permits(1);
        assert_eq!(first.await, Ok(()));
        assert_eq!(next_started(&mut started).await, "second");
        assert_eq!(second.await, Ok(()));
        assert!(scheduler.queue().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_is_sticky_until_cancel() {
        let (scheduler, mut started) = scheduler(WorkerPool::new(4));
        let gen = generation();
        let failing = step_with(gen, "b1", None, Err(ReplicationError::transient("io")), false);
        let b1 = scheduler.submit(failing).unwrap();
        let b2 = scheduler.submit(step(gen, "b2", None)).unwrap();

        assert_eq!(next_started(&mut started).await, "b1");
        assert_eq!(b1.await, Err(ReplicationError::transient("io")));
        assert_nothing_starts(&mut started).await;
        assert!(!b2.is_done());

        let cancelled = scheduler.cancel(gen, None, ReplicationError::cancelled("resync"));
        assert_eq!(cancelled.await, Ok(()));
        assert_eq!(b2.await, Err(ReplicationError::cancelled("resync")));

        let b3 = scheduler.submit(step(gen, "b3", None)).unwrap();
        assert_eq!(next_started(&mut started).await, "b3");
        assert_eq!(b3.await, Ok(()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panic_fails_batch() {
        let (scheduler, mut started) = scheduler(WorkerPool::new(1));
        let gen = generation();
        let exploding = step_with(gen, "boom", None, Ok(()), true);

        let future = scheduler.submit(exploding).unwrap();
        assert_eq!(next_started(&mut started).await, "boom");
        match future.await {
            Err(ReplicationError::Failed(msg)) => assert!(msg.contains("step boom exploded")),
            other => panic!("unexpected outcome {:?}", other),
        }

        // The worker slot is returned and other generations proceed.
        let other = scheduler.submit(step(generation(), "next", None)).unwrap();
        assert_eq!(other.await, Ok(()));
    }

    #[tokio::test]
    async fn test_paused_scheduler_waits_for_start() {
        let (tx, mut started) = mpsc::unbounded_channel();
        let scheduler = WorkScheduler::new(
            "pausedWorkScheduler",
            Recorder { started: tx },
            WorkerPool::new(1),
            Arc::new(SchedulerMetrics::new("paused")),
        );
        let future = scheduler.submit(step(generation(), "queued", None)).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Paused);
        assert_nothing_starts(&mut started).await;

        scheduler.start();
        assert_eq!(next_started(&mut started).await, "queued");
        assert_eq!(future.await, Ok(()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_drains_queue_and_rejects_new_work() {
        let (scheduler, mut started) = scheduler(WorkerPool::new(1));
        let gate = gate();
        let running = scheduler.submit(step(generation(), "running", Some(gate.clone()))).unwrap();
        let queued = scheduler.submit(step(generation(), "queued", None)).unwrap();
        assert_eq!(next_started(&mut started).await, "running");

        let releaser = {
            let gate = gate.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                gate.add_permits(1);
            })
        };
        scheduler.shutdown().await;
        releaser.await.unwrap();

        assert_eq!(running.await, Ok(()));
        assert_eq!(queued.await, Err(ReplicationError::ShutDown));
        assert_eq!(scheduler.state(), SchedulerState::ShutDown);
        assert_eq!(
            scheduler.submit(step(generation(), "late", None)).unwrap_err(),
            SchedulerError::ShutDown {
                scheduler: "testWorkScheduler"
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_is_shared_between_schedulers() {
        let pool = WorkerPool::new(1);
        let (first, mut first_started) = scheduler(pool.clone());
        let (second, mut second_started) = scheduler(pool.clone());
        let gate = gate();

        let blocked = first.submit(step(generation(), "first", Some(gate.clone()))).unwrap();
        assert_eq!(next_started(&mut first_started).await, "first");

        let waiting = second.submit(step(generation(), "second", None)).unwrap();
        assert_nothing_starts(&mut second_started).await;

        gate.add_permits(1);
        assert_eq!(blocked.await, Ok(()));
        assert_eq!(next_started(&mut second_started).await, "second");
        assert_eq!(waiting.await, Ok(()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_idle_schedulers_do_not_hold_pool_permits() {
        let pool = WorkerPool::new(2);
        let (_idle, _idle_started) = scheduler(pool.clone());
        let (_also_idle, _also_idle_started) = scheduler(pool.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.available(), 2);

        let (busy, mut started) = scheduler(pool.clone());
        let gates = [gate(), gate()];
        let mut futures = Vec::new();
        for (name, gate) in ["a", "b"].into_iter().zip(gates.iter()) {
            futures.push(busy.submit(step(generation(), name, Some(gate.clone()))).unwrap());
        }

        let mut running = vec![
            next_started(&mut started).await,
            next_started(&mut started).await,
        ];
        running.sort();
        assert_eq!(running, vec!["a", "b"]);
        assert_eq!(pool.available(), 0);

        for gate in &gates {
            gate.add_permits(1);
        }
        for future in futures {
            assert_eq!(future.await, Ok(()));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_fails_batch_waiting_for_permit() {
        let pool = WorkerPool::new(1);
        let (holder, mut holder_started) = scheduler(pool.clone());
        let (waiter, mut waiter_started) = scheduler(pool.clone());
        let gate = gate();

        let held = holder.submit(step(generation(), "held", Some(gate.clone()))).unwrap();
        assert_eq!(next_started(&mut holder_started).await, "held");

        let waiting = waiter.submit(step(generation(), "waiting", None)).unwrap();
        assert_nothing_starts(&mut waiter_started).await;

        tokio::time::timeout(Duration::from_secs(5), waiter.shutdown())
            .await
            .expect("shutdown should not wait for a pool permit");
        assert_eq!(waiting.await, Err(ReplicationError::ShutDown));

        gate.add_permits(1);
        assert_eq!(held.await, Ok(()));
    }

    #[tokio::test]
    async fn test_run_blocking_contains_panics() {
        let result: Result<(), _> = run_blocking(|| -> Result<(), ReplicationError> { panic!("blocking boom") }).await;
        assert!(matches!(result, Err(ReplicationError::Failed(msg)) if msg.contains("blocking boom")));
    }
}
