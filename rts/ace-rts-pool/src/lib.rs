//! Worker thread pool for the ACE runtime.
//!
//! The pool owns a fixed number of worker slots. Each slot is backed by one
//! OS thread and runs at most one task at a time. Dispatch is FIFO:
//!
//! - `submit` hands the task to an idle worker if there is one, starts a new
//!   worker if a slot has never been used, and otherwise appends the task to
//!   the queue. It never blocks the caller.
//! - When a worker finishes, it takes the next queued task itself; only when
//!   the queue is empty does it go back to the idle set.
//!
//! At most `max_workers` tasks are in flight, and queued tasks start in the
//! order they were submitted. Completion order across workers is not ordered.
//!
//! # Faults
//!
//! A panicking task is isolated by default: its handle is rejected with
//! [`PoolError::TaskPanicked`] and the worker keeps running. With
//! `isolate_panics` disabled the panic takes the worker down instead; the
//! task is rejected with [`PoolError::WorkerFault`] and the slot is either
//! respawned or retired, depending on `respawn_on_fault`.
//!
//! # Shutdown
//!
//! ```ignore
//! use ace_rts_pool::{PoolConfig, WorkerPool};
//!
//! let pool = WorkerPool::new(PoolConfig::with_workers(4))?;
//! let answer = pool.submit(|| 6 * 7);
//! assert_eq!(answer.wait()?, 42);
//!
//! // Wait up to one second for queued work, then reject what is left.
//! pool.terminate(false, Some(Duration::from_secs(1)));
//! ```

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

mod handle;

pub use handle::{TaskHandle, TaskId};

use crossbeam_channel::{Receiver, SendError, Sender};
use handle::Reject;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors a task can be rejected with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The pool was shut down before the task settled.
    #[error("worker pool terminated")]
    Terminated,

    /// The worker running the task died.
    #[error("worker {worker_id} faulted: {message}")]
    WorkerFault {
        /// Slot of the faulted worker.
        worker_id: usize,
        /// Description of the fault.
        message: String,
    },

    /// The task panicked and the panic was contained.
    #[error("task panicked: {message}")]
    TaskPanicked {
        /// Panic payload, if it was a string.
        message: String,
    },

    /// The queue was at capacity when the task was submitted.
    #[error("task queue is full ({capacity} tasks)")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// Every worker slot has faulted and been retired.
    #[error("no workers left: all slots were retired after faults")]
    Exhausted,

    /// The operating system refused to start a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    /// The handle was polled again after it had yielded its result.
    #[error("task {0} result was already taken")]
    AlreadyTaken(TaskId),
}

// ============================================================================
// Configuration, Stats and Metrics
// ============================================================================

/// Default worker count: one less than the available cores, at least two.
#[must_use]
pub fn default_worker_count() -> usize {
    let cores = thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    cores.saturating_sub(1).max(2)
}

/// Configuration for the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker slots.
    pub max_workers: usize,
    /// Workers started when the pool is created.
    pub min_workers: usize,
    /// Start every worker when the pool is created.
    pub prewarm: bool,
    /// Maximum number of queued tasks; unbounded if `None`.
    pub max_queue: Option<usize>,
    /// Replace a worker that died instead of retiring its slot.
    pub respawn_on_fault: bool,
    /// Contain task panics inside the worker.
    pub isolate_panics: bool,
    /// Stack size for worker threads; the platform default if `None`.
    pub stack_size: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_worker_count(),
            min_workers: 0,
            prewarm: false,
            max_queue: None,
            respawn_on_fault: true,
            isolate_panics: true,
            stack_size: None,
        }
    }
}

impl PoolConfig {
    /// Default configuration with an explicit worker count.
    #[must_use]
    pub fn with_workers(max_workers: usize) -> Self {
        Self {
            max_workers,
            ..Self::default()
        }
    }
}

/// Point-in-time snapshot of the pool.
///
/// Not consistent with concurrent dispatch; diagnostic only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Live worker threads.
    pub total: usize,
    /// Workers running a task.
    pub busy: usize,
    /// Workers waiting for a task.
    pub idle: usize,
    /// Tasks waiting for a worker.
    pub queued: usize,
    /// Tasks submitted and not yet settled by a worker (running plus queued).
    pub active: usize,
}

/// Cumulative execution metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolMetrics {
    /// Tasks that ran to completion or panicked.
    pub tasks_executed: u64,
    /// Wall time spent inside tasks.
    pub total_execution_time: Duration,
    /// `total_execution_time / tasks_executed`.
    pub average_execution_time: Duration,
    /// Highest number of busy workers observed at dispatch.
    pub peak_concurrency: usize,
    /// Tasks rejected by the pool without running.
    pub tasks_rejected: u64,
    /// Worker deaths.
    pub worker_faults: u64,
    /// Workers started to replace dead ones.
    pub respawns: u64,
}

impl PoolMetrics {
    fn record(&mut self, elapsed: Duration) {
        self.tasks_executed += 1;
        self.total_execution_time += elapsed;
        self.average_execution_time = self
            .total_execution_time
            .div_f64(self.tasks_executed as f64);
    }
}

/// Outcome of [`WorkerPool::terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    /// All submitted tasks settled before the workers were stopped.
    pub drained: bool,
    /// Tasks rejected with [`PoolError::Terminated`].
    pub rejected: usize,
}

/// A unit of work identified by a value rather than a closure.
///
/// Implementors are typically small enums of operation ids, so that what
/// travels to a worker is data naming a kernel plus its input.
pub trait Kernel: Send + 'static {
    /// Input the kernel consumes.
    type Input: Send + 'static;
    /// Value the kernel produces.
    type Output: Send + 'static;

    /// Run the kernel.
    fn call(self, input: Self::Input) -> Self::Output;
}

// ============================================================================
// Internal State
// ============================================================================

struct Job {
    id: TaskId,
    run: Box<dyn FnOnce() + Send>,
    reject: Arc<dyn Reject>,
}

enum Message {
    Run(Job),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotStatus {
    /// No thread has been started for this slot yet.
    Vacant,
    Idle,
    Busy,
    /// The slot's worker died and was not replaced.
    Retired,
    /// The pool was terminated.
    Stopped,
}

struct WorkerSlot {
    status: SlotStatus,
    tx: Option<Sender<Message>>,
    thread: Option<JoinHandle<()>>,
    current: Option<(TaskId, Arc<dyn Reject>)>,
}

impl WorkerSlot {
    fn vacant() -> Self {
        Self {
            status: SlotStatus::Vacant,
            tx: None,
            thread: None,
            current: None,
        }
    }

    fn is_live(&self) -> bool {
        matches!(self.status, SlotStatus::Idle | SlotStatus::Busy)
    }
}

struct State {
    slots: Vec<WorkerSlot>,
    idle: VecDeque<usize>,
    queue: VecDeque<Job>,
    busy: usize,
    terminated: bool,
    metrics: PoolMetrics,
}

struct Shared {
    config: PoolConfig,
    state: Mutex<State>,
    /// Signalled when the pool has no busy worker left.
    drained: Condvar,
}

impl Shared {
    fn spawn_thread(self: &Arc<Self>, id: usize) -> PoolResult<(Sender<Message>, JoinHandle<()>)> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::clone(self);

        let mut builder = thread::Builder::new().name(format!("ace-worker-{id}"));
        if let Some(size) = self.config.stack_size {
            builder = builder.stack_size(size);
        }
        let thread = builder
            .spawn(move || worker_loop(&shared, id, &rx))
            .map_err(|e| PoolError::Spawn(e.to_string()))?;
        Ok((tx, thread))
    }

    /// Start a thread for `id` and leave the slot idle but unlisted.
    fn start_slot(self: &Arc<Self>, state: &mut State, id: usize) -> PoolResult<()> {
        let (tx, thread) = self.spawn_thread(id)?;
        let slot = &mut state.slots[id];
        slot.status = SlotStatus::Idle;
        slot.tx = Some(tx);
        slot.thread = Some(thread);
        tracing::debug!(worker = id, "pool: worker started");
        Ok(())
    }

    fn claim_worker(self: &Arc<Self>, state: &mut State) -> PoolResult<Option<usize>> {
        if let Some(id) = state.idle.pop_front() {
            return Ok(Some(id));
        }
        let vacant = state
            .slots
            .iter()
            .position(|s| s.status == SlotStatus::Vacant);
        match vacant {
            Some(id) => {
                self.start_slot(state, id)?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    fn dispatch(&self, state: &mut State, id: usize, job: Job) {
        let slot = &mut state.slots[id];
        slot.status = SlotStatus::Busy;
        slot.current = Some((job.id, Arc::clone(&job.reject)));
        state.busy += 1;
        state.metrics.peak_concurrency = state.metrics.peak_concurrency.max(state.busy);

        tracing::trace!(worker = id, task = %job.id, "pool: dispatch");
        let undelivered = match &slot.tx {
            Some(tx) => match tx.send(Message::Run(job)) {
                Ok(()) => None,
                Err(SendError(Message::Run(job))) => Some(job),
                Err(SendError(Message::Stop)) => None,
            },
            None => Some(job),
        };
        if let Some(job) = undelivered {
            // The receiving thread is gone without reporting a fault.
            slot.status = SlotStatus::Retired;
            slot.current = None;
            slot.tx = None;
            state.busy -= 1;
            job.reject.reject(PoolError::WorkerFault {
                worker_id: id,
                message: "worker channel disconnected".to_string(),
            });
        }
    }

    fn submit(self: &Arc<Self>, job: Job) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.terminated {
            state.metrics.tasks_rejected += 1;
            drop(guard);
            job.reject.reject(PoolError::Terminated);
            return;
        }

        match self.claim_worker(state) {
            Ok(Some(id)) => self.dispatch(state, id, job),
            Ok(None) => {
                let err = if !state.slots.iter().any(WorkerSlot::is_live) {
                    Some(PoolError::Exhausted)
                } else {
                    match self.config.max_queue {
                        Some(capacity) if state.queue.len() >= capacity => {
                            Some(PoolError::QueueFull { capacity })
                        }
                        _ => None,
                    }
                };
                match err {
                    Some(err) => {
                        state.metrics.tasks_rejected += 1;
                        drop(guard);
                        job.reject.reject(err);
                    }
                    None => state.queue.push_back(job),
                }
            }
            Err(err) => {
                state.metrics.tasks_rejected += 1;
                drop(guard);
                tracing::warn!(error = %err, "pool: could not start worker");
                job.reject.reject(err);
            }
        }
    }

    /// Record a finished task and hand the worker its next job, if any.
    fn complete(&self, id: usize, elapsed: Duration) -> Option<Job> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.metrics.record(elapsed);

        let slot = &mut state.slots[id];
        if slot.status != SlotStatus::Busy {
            // Force-terminated while running; the handle is already settled.
            return None;
        }
        slot.current = None;

        if let Some(job) = state.queue.pop_front() {
            slot.current = Some((job.id, Arc::clone(&job.reject)));
            state.metrics.peak_concurrency = state.metrics.peak_concurrency.max(state.busy);
            tracing::trace!(worker = id, task = %job.id, "pool: dispatch from queue");
            return Some(job);
        }

        slot.status = SlotStatus::Idle;
        state.busy -= 1;
        state.idle.push_back(id);
        if state.busy == 0 {
            self.drained.notify_all();
        }
        None
    }

    /// The worker in slot `id` died; fail its task and replace or retire it.
    fn worker_fault(self: &Arc<Self>, id: usize, message: String) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.metrics.worker_faults += 1;

        let slot = &mut state.slots[id];
        let was_busy = slot.status == SlotStatus::Busy;
        let current = slot.current.take();
        slot.tx = None;
        // This is the faulting thread itself; let it detach.
        slot.thread = None;
        if slot.status == SlotStatus::Stopped {
            return;
        }
        slot.status = SlotStatus::Retired;
        if was_busy {
            state.busy -= 1;
        } else {
            state.idle.retain(|&w| w != id);
        }

        tracing::warn!(worker = id, %message, "pool: worker fault");
        if let Some((task, reject)) = current {
            tracing::debug!(worker = id, %task, "pool: rejecting task of faulted worker");
            reject.reject(PoolError::WorkerFault {
                worker_id: id,
                message,
            });
        }

        if self.config.respawn_on_fault && !state.terminated {
            match self.start_slot(state, id) {
                Ok(()) => {
                    state.metrics.respawns += 1;
                    tracing::info!(worker = id, "pool: worker respawned");
                    match state.queue.pop_front() {
                        Some(job) => self.dispatch(state, id, job),
                        None => state.idle.push_back(id),
                    }
                }
                Err(err) => tracing::warn!(worker = id, error = %err, "pool: respawn failed"),
            }
        }

        let usable = state
            .slots
            .iter()
            .any(|s| s.is_live() || s.status == SlotStatus::Vacant);
        if !usable {
            for job in state.queue.drain(..) {
                state.metrics.tasks_rejected += 1;
                job.reject.reject(PoolError::Exhausted);
            }
        }
        if state.busy == 0 {
            self.drained.notify_all();
        }
    }
}

// ============================================================================
// Worker Loop
// ============================================================================

/// Reports a worker that unwinds outside of task execution.
struct FaultGuard<'a> {
    shared: &'a Arc<Shared>,
    id: usize,
    armed: bool,
}

impl Drop for FaultGuard<'_> {
    fn drop(&mut self) {
        if self.armed && thread::panicking() {
            self.shared
                .worker_fault(self.id, "worker thread unwound".to_string());
        }
    }
}

fn worker_loop(shared: &Arc<Shared>, id: usize, rx: &Receiver<Message>) {
    let mut guard = FaultGuard {
        shared,
        id,
        armed: true,
    };

    while let Ok(Message::Run(job)) = rx.recv() {
        let mut next = Some(job);
        while let Some(Job { id: task, run, reject }) = next.take() {
            let start = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(run));
            let elapsed = start.elapsed();

            if let Err(payload) = outcome {
                let message = panic_message(payload.as_ref());
                if !shared.config.isolate_panics {
                    guard.armed = false;
                    shared.worker_fault(id, message);
                    return;
                }
                tracing::debug!(worker = id, %task, %message, "pool: task panicked");
                reject.reject(PoolError::TaskPanicked { message });
            }
            next = shared.complete(id, elapsed);
        }
    }

    guard.armed = false;
    tracing::debug!(worker = id, "pool: worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// Worker Pool
// ============================================================================

/// A fixed-capacity pool of worker threads.
pub struct WorkerPool {
    shared: Arc<Shared>,
    prewarmed: AtomicBool,
}

impl WorkerPool {
    /// Create a pool, starting `min_workers` threads (all of them if
    /// `prewarm` is set).
    pub fn new(config: PoolConfig) -> PoolResult<Self> {
        let mut config = config;
        config.max_workers = config.max_workers.max(1);
        config.min_workers = config.min_workers.min(config.max_workers);

        let slots = (0..config.max_workers).map(|_| WorkerSlot::vacant()).collect();
        let prewarm = config.prewarm;
        let min_workers = config.min_workers;
        let pool = Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State {
                    slots,
                    idle: VecDeque::new(),
                    queue: VecDeque::new(),
                    busy: 0,
                    terminated: false,
                    metrics: PoolMetrics::default(),
                }),
                drained: Condvar::new(),
            }),
            prewarmed: AtomicBool::new(false),
        };

        pool.start_workers(min_workers)?;
        if prewarm {
            pool.prewarm()?;
        }
        tracing::info!(
            max_workers = pool.shared.config.max_workers,
            started = pool.stats().total,
            "pool: created"
        );
        Ok(pool)
    }

    /// Create a pool with the default configuration.
    pub fn with_default_config() -> PoolResult<Self> {
        Self::new(PoolConfig::default())
    }

    /// The configuration the pool runs with.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Number of worker slots.
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.shared.config.max_workers
    }

    fn start_workers(&self, count: usize) -> PoolResult<usize> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if state.terminated {
            return Ok(0);
        }
        let mut started = 0;
        while state.slots.iter().filter(|s| s.is_live()).count() < count {
            let Some(id) = state
                .slots
                .iter()
                .position(|s| s.status == SlotStatus::Vacant)
            else {
                break;
            };
            self.shared.start_slot(state, id)?;
            state.idle.push_back(id);
            started += 1;
        }
        Ok(started)
    }

    /// Start every worker that has not been started yet.
    ///
    /// Returns the number of workers started. Only the first call does
    /// anything.
    pub fn prewarm(&self) -> PoolResult<usize> {
        if self.prewarmed.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        let started = self.start_workers(self.shared.config.max_workers)?;
        tracing::debug!(started, "pool: prewarmed");
        Ok(started)
    }

    /// Submit a closure. Never blocks.
    pub fn submit<F, T>(&self, f: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let handle = TaskHandle::new();
        let cell = handle.cell();
        let job = Job {
            id: handle.id(),
            run: Box::new(move || {
                cell.settle(Ok(f()));
            }),
            reject: handle.rejector(),
        };
        self.shared.submit(job);
        handle
    }

    /// Submit a kernel invocation.
    pub fn exec<K: Kernel>(&self, kernel: K, input: K::Input) -> TaskHandle<K::Output> {
        self.submit(move || kernel.call(input))
    }

    /// Point-in-time snapshot of worker and queue occupancy.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        let total = state.slots.iter().filter(|s| s.is_live()).count();
        PoolStats {
            total,
            busy: state.busy,
            idle: total - state.busy,
            queued: state.queue.len(),
            active: state.busy + state.queue.len(),
        }
    }

    /// Cumulative execution metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        self.shared.state.lock().metrics
    }

    /// Whether the pool has been terminated.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shared.state.lock().terminated
    }

    /// Shut the pool down.
    ///
    /// Without `force`, waits for queued and running tasks to drain, for at
    /// most `timeout` if one is given, and joins the workers. With `force`,
    /// or when the timeout expires, every task that has not settled is
    /// rejected with [`PoolError::Terminated`] and the workers are detached.
    /// New submissions are rejected as soon as this is called.
    pub fn terminate(&self, force: bool, timeout: Option<Duration>) -> Termination {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.shared.state.lock();
        guard.terminated = true;

        if !force {
            while guard.busy > 0 || !guard.queue.is_empty() {
                match deadline {
                    Some(deadline) => {
                        if self
                            .shared
                            .drained
                            .wait_until(&mut guard, deadline)
                            .timed_out()
                        {
                            break;
                        }
                    }
                    None => self.shared.drained.wait(&mut guard),
                }
            }
        }

        let state = &mut *guard;
        let drained = state.busy == 0 && state.queue.is_empty();
        let mut pending: Vec<Arc<dyn Reject>> =
            state.queue.drain(..).map(|job| job.reject).collect();
        let mut threads = Vec::new();
        for slot in &mut state.slots {
            if let Some((_, reject)) = slot.current.take() {
                pending.push(reject);
            }
            if let Some(tx) = slot.tx.take() {
                let _ = tx.send(Message::Stop);
            }
            if let Some(thread) = slot.thread.take() {
                threads.push(thread);
            }
            slot.status = SlotStatus::Stopped;
        }
        state.idle.clear();
        state.busy = 0;
        state.metrics.tasks_rejected += pending.len() as u64;
        drop(guard);

        let rejected = pending.len();
        for reject in pending {
            reject.reject(PoolError::Terminated);
        }

        if drained {
            for thread in threads {
                let _ = thread.join();
            }
        }
        tracing::info!(force, drained, rejected, "pool: terminated");
        Termination { drained, rejected }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Graceful and non-blocking: workers finish what is queued, then
        // read the stop message and exit on their own.
        let mut state = self.shared.state.lock();
        state.terminated = true;
        for slot in &mut state.slots {
            if let Some(tx) = slot.tx.take() {
                let _ = tx.send(Message::Stop);
            }
            slot.thread = None;
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_workers", &self.max_workers())
            .field("stats", &self.stats())
            .finish()
    }
}
