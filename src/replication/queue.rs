//! Generation-scoped priority queue feeding the work schedulers.
//!
//! Each generation owns a FIFO of pending batches and a single slot that is
//! idle, running one dispatched batch, frozen by a failed one, or draining a
//! batch left running by a cancelled predecessor. A
//! generation is eligible for dispatch when its slot is idle and its FIFO is
//! non-empty; eligible generations are kept in a set ordered by the priority
//! and enqueue sequence of their head batch, so `remove` always pops the most
//! urgent head.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::{ReplicationError, SchedulerError};
use crate::metrics::SchedulerMetrics;

use super::completion::{BatchFuture, Completion};
use super::generation::{AttemptId, GenerationId, Priority};

/// Fences remembered before the oldest ones are forgotten.
pub const DEFAULT_FENCE_CAPACITY: usize = 4096;

/// Unit of work handed to a scheduler.
///
/// The payload is whatever the scheduler's strategy needs to process the
/// batch; the queue never looks at it.
pub struct SchedulerBatch<P> {
    generation_id: GenerationId,
    attempt_id: Option<AttemptId>,
    priority: Priority,
    size: usize,
    payload: P,
    sequence: u64,
    enqueued_at: Instant,
    completion: Completion,
    released: AtomicBool,
}

impl<P> SchedulerBatch<P> {
    pub fn new(
        generation_id: GenerationId,
        attempt_id: Option<AttemptId>,
        priority: Priority,
        size: usize,
        payload: P,
    ) -> Self {
        Self {
            generation_id,
            attempt_id,
            priority,
            size,
            payload,
            sequence: 0,
            enqueued_at: Instant::now(),
            completion: Completion::new(),
            released: AtomicBool::new(false),
        }
    }

    pub fn generation_id(&self) -> GenerationId {
        self.generation_id
    }

    pub fn attempt_id(&self) -> Option<AttemptId> {
        self.attempt_id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Number of events in the batch.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Position in the queue's global enqueue order.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Time spent since the batch was added.
    pub fn queued_for(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    pub fn future(&self) -> BatchFuture {
        self.completion.future()
    }

    pub(crate) fn completion(&self) -> &Completion {
        &self.completion
    }
}

impl<P> std::fmt::Debug for SchedulerBatch<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerBatch")
            .field("generation_id", &self.generation_id)
            .field("attempt_id", &self.attempt_id)
            .field("priority", &self.priority)
            .field("size", &self.size)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Observable state of a generation's slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Running,
    Frozen(ReplicationError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationStatus {
    pub priority: Priority,
    pub pending: usize,
    pub slot: SlotState,
}

enum Slot<P> {
    Idle,
    Running(Arc<SchedulerBatch<P>>),
    /// Still running for a cancelled predecessor of the generation. Its
    /// outcome never freezes the generation.
    Draining(Arc<SchedulerBatch<P>>),
    Frozen {
        batch: Arc<SchedulerBatch<P>>,
        error: ReplicationError,
    },
}

impl<P> Slot<P> {
    fn holds(&self, batch: &Arc<SchedulerBatch<P>>) -> bool {
        match self {
            Slot::Running(running) | Slot::Draining(running) => Arc::ptr_eq(running, batch),
            _ => false,
        }
    }
}

struct GenerationQueue<P> {
    priority: Priority,
    pending: VecDeque<Arc<SchedulerBatch<P>>>,
    slot: Slot<P>,
}

impl<P> GenerationQueue<P> {
    fn ready_key(&self, generation_id: GenerationId) -> Option<ReadyKey> {
        match (&self.slot, self.pending.front()) {
            (Slot::Idle, Some(head)) => Some((self.priority, head.sequence, generation_id)),
            _ => None,
        }
    }
}

type ReadyKey = (Priority, u64, GenerationId);

struct QueueState<P> {
    generations: HashMap<GenerationId, GenerationQueue<P>>,
    ready: BTreeSet<ReadyKey>,
    /// Dispatched batches by generation. Outlives `generations` entries so a
    /// cancelled generation can still hand out its running batch's future.
    in_flight: HashMap<GenerationId, Arc<SchedulerBatch<P>>>,
    fences: HashMap<(GenerationId, AttemptId), ReplicationError>,
    fence_order: VecDeque<(GenerationId, AttemptId)>,
    next_sequence: u64,
}

pub struct SchedulerQueue<P> {
    state: Mutex<QueueState<P>>,
    notify: Notify,
    metrics: Arc<SchedulerMetrics>,
    fence_capacity: usize,
}

impl<P> SchedulerQueue<P> {
    pub fn new(metrics: Arc<SchedulerMetrics>) -> Self {
        Self::with_fence_capacity(metrics, DEFAULT_FENCE_CAPACITY)
    }

    pub fn with_fence_capacity(metrics: Arc<SchedulerMetrics>, fence_capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                generations: HashMap::new(),
                ready: BTreeSet::new(),
                in_flight: HashMap::new(),
                fences: HashMap::new(),
                fence_order: VecDeque::new(),
                next_sequence: 0,
            }),
            notify: Notify::new(),
            metrics,
            fence_capacity: fence_capacity.max(1),
        }
    }

    pub fn metrics(&self) -> &Arc<SchedulerMetrics> {
        &self.metrics
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, batch: &SchedulerBatch<P>) {
        if !batch.released.swap(true, Ordering::AcqRel) {
            self.metrics.batch_released(batch.size);
        }
    }

    /// Appends a batch to its generation's FIFO and returns its completion.
    ///
    /// A batch whose attempt has been fenced by [`cancel`](Self::cancel) is
    /// not enqueued; its completion is resolved with the fence cause. Only
    /// batches that actually join a FIFO count as enqueued in the metrics.
    pub fn add(&self, mut batch: SchedulerBatch<P>) -> Result<BatchFuture, SchedulerError> {
        let generation_id = batch.generation_id;
        let mut state = self.lock();

        if let Some(attempt_id) = batch.attempt_id {
            if let Some(cause) = state.fences.get(&(generation_id, attempt_id)) {
                let future = batch.completion.future();
                batch.completion.fail(cause.clone());
                tracing::debug!(
                    generation = %generation_id,
                    attempt = %attempt_id,
                    "Rejected batch of a fenced attempt"
                );
                return Ok(future);
            }
        }

        if let Some(existing) = state.generations.get(&generation_id) {
            if existing.priority != batch.priority {
                return Err(SchedulerError::PriorityMismatch {
                    generation: generation_id,
                    pinned: existing.priority,
                    batch: batch.priority,
                });
            }
        }

        batch.sequence = state.next_sequence;
        state.next_sequence += 1;
        batch.enqueued_at = Instant::now();
        let batch = Arc::new(batch);
        let future = batch.completion.future();
        self.metrics.batch_queued(batch.size);

        let QueueState {
            generations,
            ready,
            in_flight,
            ..
        } = &mut *state;
        let queue = generations
            .entry(generation_id)
            .or_insert_with(|| GenerationQueue {
                priority: batch.priority,
                pending: VecDeque::new(),
                slot: match in_flight.get(&generation_id) {
                    Some(running) => Slot::Draining(running.clone()),
                    None => Slot::Idle,
                },
            });
        queue.pending.push_back(batch);
        self.metrics.record_enqueue();
        let mut became_ready = false;
        if queue.pending.len() == 1 {
            if let Some(key) = queue.ready_key(generation_id) {
                ready.insert(key);
                became_ready = true;
            }
        }
        drop(state);

        if became_ready {
            self.notify.notify_waiters();
        }
        Ok(future)
    }

    /// Pops the most urgent eligible head without waiting.
    pub fn try_remove(&self) -> Option<Arc<SchedulerBatch<P>>> {
        let mut state = self.lock();
        let QueueState {
            generations,
            ready,
            in_flight,
            ..
        } = &mut *state;

        let key = ready.pop_first()?;
        let generation_id = key.2;
        let queue = generations.get_mut(&generation_id)?;
        let batch = queue.pending.pop_front()?;
        queue.slot = Slot::Running(batch.clone());
        in_flight.insert(generation_id, batch.clone());
        Some(batch)
    }

    /// Waits until some generation has an eligible head and pops the most
    /// urgent one, marking its generation as running. Dropping the returned
    /// future abandons the wait without side effects.
    pub async fn remove(&self) -> Arc<SchedulerBatch<P>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(batch) = self.try_remove() {
                return batch;
            }
            notified.await;
        }
    }

    /// Releases the generation of a successfully processed batch so its next
    /// head becomes eligible. A batch whose generation was cancelled and not
    /// re-created in the meantime leaves the queue untouched.
    pub fn finalize_batch(&self, batch: &Arc<SchedulerBatch<P>>) {
        let generation_id = batch.generation_id;
        let mut state = self.lock();
        let QueueState {
            generations,
            ready,
            in_flight,
            ..
        } = &mut *state;

        if in_flight
            .get(&generation_id)
            .is_some_and(|running| Arc::ptr_eq(running, batch))
        {
            in_flight.remove(&generation_id);
        }

        let mut became_ready = false;
        if let Some(queue) = generations.get_mut(&generation_id) {
            if queue.slot.holds(batch) {
                queue.slot = Slot::Idle;
                match queue.ready_key(generation_id) {
                    Some(key) => {
                        ready.insert(key);
                        became_ready = true;
                    }
                    None => {
                        generations.remove(&generation_id);
                    }
                }
            } else {
                tracing::debug!(
                    generation = %generation_id,
                    sequence = batch.sequence,
                    "Finalized a batch of a cancelled generation"
                );
            }
        }
        drop(state);

        self.release(batch);
        if became_ready {
            self.notify.notify_waiters();
        }
    }

    /// Resolves a dispatched batch with `error` and freezes its generation
    /// until it is cancelled. A batch of a cancelled predecessor only hands
    /// the generation back to its new pending work.
    pub fn mark_failed(&self, batch: &Arc<SchedulerBatch<P>>, error: ReplicationError) {
        let generation_id = batch.generation_id;
        let mut state = self.lock();
        batch.completion.fail(error.clone());

        if state
            .in_flight
            .get(&generation_id)
            .is_some_and(|running| Arc::ptr_eq(running, batch))
        {
            state.in_flight.remove(&generation_id);
        }
        let mut became_ready = false;
        let QueueState {
            generations, ready, ..
        } = &mut *state;
        if let Some(queue) = generations.get_mut(&generation_id) {
            let draining = matches!(&queue.slot, Slot::Draining(_));
            match (queue.slot.holds(batch), draining) {
                (true, false) => {
                    queue.slot = Slot::Frozen {
                        batch: batch.clone(),
                        error,
                    };
                }
                (true, true) => {
                    queue.slot = Slot::Idle;
                    match queue.ready_key(generation_id) {
                        Some(key) => {
                            ready.insert(key);
                            became_ready = true;
                        }
                        None => {
                            generations.remove(&generation_id);
                        }
                    }
                }
                _ => {}
            }
        }
        drop(state);

        self.release(batch);
        if became_ready {
            self.notify.notify_waiters();
        }
    }

    /// Fences `attempt_id` (when given), fails every pending batch of the
    /// generation with `cause`, and drops its queue state.
    ///
    /// Returns the completion of the generation's running batch, if any, so
    /// the caller can wait for it to drain; the running batch itself is never
    /// interrupted. Repeated calls while it runs return the same future.
    /// Otherwise an already successful future is returned.
    ///
    /// Batches added for the generation while that batch still runs are
    /// queued but not dispatched until it is finalized or failed, so a
    /// generation never has two batches running at once.
    pub fn cancel(
        &self,
        generation_id: GenerationId,
        attempt_id: Option<AttemptId>,
        cause: ReplicationError,
    ) -> BatchFuture {
        let mut state = self.lock();

        if let Some(attempt_id) = attempt_id {
            self.record_fence(&mut state, generation_id, attempt_id, cause.clone());
        }

        let mut drained = Vec::new();
        if let Some(queue) = state.generations.remove(&generation_id) {
            if let Some(key) = queue.ready_key(generation_id) {
                state.ready.remove(&key);
            }
            drained.extend(queue.pending);
        }

        let running = state.in_flight.get(&generation_id).cloned();
        let future = match running {
            Some(running) if running.completion.is_failed() => {
                state.in_flight.remove(&generation_id);
                BatchFuture::completed()
            }
            Some(running) => running.completion.future(),
            None => BatchFuture::completed(),
        };
        drop(state);

        if !drained.is_empty() {
            tracing::debug!(
                generation = %generation_id,
                batches = drained.len(),
                cause = %cause,
                "Cancelled pending batches"
            );
        }
        for batch in drained {
            batch.completion.fail(cause.clone());
            self.release(&batch);
        }
        future
    }

    fn record_fence(
        &self,
        state: &mut QueueState<P>,
        generation_id: GenerationId,
        attempt_id: AttemptId,
        cause: ReplicationError,
    ) {
        let key = (generation_id, attempt_id);
        if state.fences.insert(key, cause).is_none() {
            state.fence_order.push_back(key);
        }
        while state.fence_order.len() > self.fence_capacity {
            if let Some(oldest) = state.fence_order.pop_front() {
                state.fences.remove(&oldest);
            }
        }
    }

    /// Forgets every fence of a generation that will never be scheduled again.
    pub fn retire_generation(&self, generation_id: GenerationId) {
        let mut state = self.lock();
        state.fence_order.retain(|(g, _)| *g != generation_id);
        state.fences.retain(|(g, _), _| *g != generation_id);
    }

    /// Fails every pending batch of every generation with `cause`. Running
    /// and frozen slots are left alone. Returns how many batches were failed.
    pub fn drain_pending(&self, cause: ReplicationError) -> usize {
        let mut state = self.lock();
        state.ready.clear();
        let mut drained = Vec::new();
        for queue in state.generations.values_mut() {
            drained.extend(queue.pending.drain(..));
        }
        state
            .generations
            .retain(|_, queue| !matches!(queue.slot, Slot::Idle));
        drop(state);

        let count = drained.len();
        for batch in drained {
            batch.completion.fail(cause.clone());
            self.release(&batch);
        }
        count
    }

    /// No generation has pending, running or frozen work.
    pub fn is_empty(&self) -> bool {
        self.lock().generations.is_empty()
    }

    pub fn contains(&self, generation_id: GenerationId) -> bool {
        self.lock().generations.contains_key(&generation_id)
    }

    pub fn generation_status(&self, generation_id: GenerationId) -> Option<GenerationStatus> {
        let state = self.lock();
        let queue = state.generations.get(&generation_id)?;
        Some(GenerationStatus {
            priority: queue.priority,
            pending: queue.pending.len(),
            slot: match &queue.slot {
                Slot::Idle => SlotState::Idle,
                Slot::Running(_) | Slot::Draining(_) => SlotState::Running,
                Slot::Frozen { error, .. } => SlotState::Frozen(error.clone()),
            },
        })
    }

    pub fn fenced_attempts(&self) -> Vec<(GenerationId, AttemptId)> {
        self.lock().fence_order.iter().copied().collect()
    }

    /// The batch holding a frozen generation, with the error that froze it.
    pub fn frozen_batch(
        &self,
        generation_id: GenerationId,
    ) -> Option<(Arc<SchedulerBatch<P>>, ReplicationError)> {
        match &self.lock().generations.get(&generation_id)?.slot {
            Slot::Frozen { batch, error } => Some((batch.clone(), error.clone())),
            _ => None,
        }
    }
}
