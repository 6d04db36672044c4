//! Task identity and settlement.
//!
//! Every submitted task gets a [`TaskHandle`]. The handle is settled exactly
//! once: by the worker that ran the task, or by the pool when it rejects the
//! task. Whichever settlement comes first wins; later ones are dropped, which
//! is what lets a forced termination reject a task that is still running.

use crate::{PoolError, PoolResult};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

// ============================================================================
// Settlement cell
// ============================================================================

struct Slot<T> {
    result: Option<PoolResult<T>>,
    settled: bool,
    waker: Option<Waker>,
}

pub(crate) struct TaskCell<T> {
    slot: Mutex<Slot<T>>,
    condvar: Condvar,
}

impl<T> TaskCell<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                result: None,
                settled: false,
                waker: None,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Store the outcome unless the task was already settled.
    pub(crate) fn settle(&self, outcome: PoolResult<T>) -> bool {
        let waker = {
            let mut slot = self.slot.lock();
            if slot.settled {
                return false;
            }
            slot.settled = true;
            slot.result = Some(outcome);
            slot.waker.take()
        };
        self.condvar.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }
}

/// Type-erased rejection of a pending task.
///
/// The pool keeps one of these per queued or running task so that it can
/// fail them without knowing their output type.
pub(crate) trait Reject: Send + Sync {
    fn reject(&self, err: PoolError);
}

impl<T: Send> Reject for TaskCell<T> {
    fn reject(&self, err: PoolError) {
        self.settle(Err(err));
    }
}

// ============================================================================
// Task handle
// ============================================================================

/// A handle to a submitted task.
///
/// The handle is a [`Future`] resolving to the task's outcome, and can also
/// be waited on from a synchronous thread. Dropping it does not cancel the
/// task.
pub struct TaskHandle<T> {
    id: TaskId,
    cell: Arc<TaskCell<T>>,
}

impl<T: Send + 'static> TaskHandle<T> {
    pub(crate) fn new() -> Self {
        Self {
            id: TaskId::next(),
            cell: Arc::new(TaskCell::new()),
        }
    }

    pub(crate) fn cell(&self) -> Arc<TaskCell<T>> {
        Arc::clone(&self.cell)
    }

    pub(crate) fn rejector(&self) -> Arc<dyn Reject> {
        self.cell()
    }
}

impl<T> TaskHandle<T> {
    /// The task's ID.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Whether the task has been settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.cell.slot.lock().settled
    }

    /// Block the current thread until the task settles.
    pub fn wait(self) -> PoolResult<T> {
        let mut slot = self.cell.slot.lock();
        loop {
            if let Some(result) = slot.result.take() {
                return result;
            }
            self.cell.condvar.wait(&mut slot);
        }
    }

    /// Block for at most `timeout`.
    ///
    /// Returns the handle back if the task has not settled in time.
    pub fn wait_timeout(self, timeout: Duration) -> Result<PoolResult<T>, Self> {
        let deadline = Instant::now() + timeout;
        {
            let mut slot = self.cell.slot.lock();
            loop {
                if let Some(result) = slot.result.take() {
                    return Ok(result);
                }
                if self.cell.condvar.wait_until(&mut slot, deadline).timed_out() {
                    if let Some(result) = slot.result.take() {
                        return Ok(result);
                    }
                    break;
                }
            }
        }
        Err(self)
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = PoolResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.cell.slot.lock();
        if let Some(result) = slot.result.take() {
            return Poll::Ready(result);
        }
        if slot.settled {
            return Poll::Ready(Err(PoolError::AlreadyTaken(self.id)));
        }
        match &slot.waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => slot.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("settled", &self.is_settled())
            .finish()
    }
}
