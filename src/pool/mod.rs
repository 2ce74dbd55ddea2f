//! The worker pool: public handle, builder and control core.

mod builder;
mod control;
mod registry;
mod worker;

#[cfg(test)]
mod tests;

pub use builder::Builder;
pub use worker::{TaskHandler, TaskScope};

use crate::error::PoolError;
use crate::task::{Task, TaskHandle, TaskId, completion};
use control::ControlEvent;
use crossbeam_channel::{Sender, bounded};
use std::fmt;
use worker::WorkerId;

/// Consistent snapshot of the pool's indices, taken at a quiescent point of
/// the control thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Live workers, whether idle, running or acquired.
    pub workers: usize,
    /// Workers parked in the idle list.
    pub idle_workers: usize,
    /// Tasks dispatched to a worker and not yet terminal.
    pub running_tasks: usize,
    /// Tasks waiting in the wait list.
    pub queued_tasks: usize,
    /// Whether the pool has been closed.
    pub closed: bool,
}

/// Handle to a pool of isolated worker threads.
///
/// All methods take `&self`, so the handle can be shared across threads
/// behind an `Arc`. Dropping the pool closes it.
///
/// ```no_run
/// use isopool::Pool;
///
/// let pool = Pool::<(u64, u64), u64>::builder()
///     .handler("add", |(a, b), _scope| Ok(a + b))
///     .pool_size(2)
///     .try_build()
///     .unwrap();
///
/// let handle = pool.run_task(isopool::Task::new("add", (2, 7)));
/// assert_eq!(handle.join().unwrap(), 9);
/// ```
pub struct Pool<D, R> {
    events: Sender<ControlEvent<D, R>>,
}

impl<D, R> Pool<D, R>
where
    D: Send + 'static,
    R: Send + 'static,
{
    /// Returns a builder for a customized pool.
    pub fn builder() -> Builder<D, R> {
        Builder::new()
    }

    pub(crate) fn new(events: Sender<ControlEvent<D, R>>) -> Self {
        Self { events }
    }

    /// Submits `task` and returns a claim on its eventual outcome.
    ///
    /// An idle worker picks the task up immediately; otherwise it joins the
    /// wait list, which may grow the pool. A closed pool or an
    /// already-aborted signal rejects the task without touching any worker.
    /// Each task resolves exactly once and runs on at most one worker.
    pub fn run_task(&self, task: Task<D>) -> TaskHandle<R> {
        self.submit(task, None)
    }

    /// Runs `task` on a worker previously reserved with
    /// [`acquire_worker`](Pool::acquire_worker), bypassing the wait list.
    ///
    /// At most one task may be outstanding per worker: pinning a task to a
    /// worker that is still running one fails it with
    /// [`PoolError::Dispatch`].
    pub fn run_task_on(&self, task: Task<D>, worker: &PooledWorker<D, R>) -> TaskHandle<R> {
        self.submit(task, Some(worker.id))
    }

    fn submit(&self, task: Task<D>, pinned: Option<WorkerId>) -> TaskHandle<R> {
        let id = TaskId::next();

        // Pre-aborted signals never reach the control thread.
        if let Some(signal) = &task.abort_signal {
            if signal.aborted() {
                return TaskHandle::ready(id, Err(PoolError::Aborted));
            }
        }

        let (tx, handle) = completion(id);
        let event = ControlEvent::Submit {
            id,
            task,
            completion: tx,
            pinned,
        };
        if self.events.send(event).is_err() {
            return TaskHandle::ready(id, Err(PoolError::Closed));
        }
        handle
    }

    /// Reserves a worker for exclusive use, suspending until one is
    /// granted.
    ///
    /// Reservations are served in FIFO order and beat queued tasks: the
    /// next worker to become available is handed over directly, bypassing
    /// both the wait list and the idle list.
    pub fn acquire_worker(&self) -> Result<PooledWorker<D, R>, PoolError> {
        let (tx, rx) = bounded(1);
        if self.events.send(ControlEvent::Acquire { reply: tx }).is_err() {
            return Err(PoolError::Closed);
        }

        let id = rx.recv().unwrap_or(Err(PoolError::Closed))?;
        Ok(PooledWorker {
            id,
            events: self.events.clone(),
        })
    }

    /// Returns an acquired worker to the pool.
    ///
    /// Equivalent to dropping the handle. Releasing a worker the pool does
    /// not consider acquired is ignored.
    pub fn release_worker(&self, worker: PooledWorker<D, R>) {
        drop(worker);
    }

    /// Suspends until at least one worker is idle and the wait list is
    /// empty, i.e. until the next [`run_task`](Pool::run_task) would
    /// dispatch immediately.
    ///
    /// Waiters resolve strictly in FIFO order, one per qualifying idle
    /// moment; resolving one waiter does not cascade into the next.
    pub fn wait_for_available_resource(&self) -> Result<(), PoolError> {
        let (tx, rx) = bounded(1);
        if self.events.send(ControlEvent::WaitIdle { reply: tx }).is_err() {
            return Err(PoolError::Closed);
        }
        rx.recv().unwrap_or(Err(PoolError::Closed))
    }

    /// Takes a consistent snapshot of the pool state.
    pub fn stats(&self) -> PoolStats {
        let (tx, rx) = bounded(1);
        if self.events.send(ControlEvent::Stats { reply: tx }).is_ok() {
            if let Ok(stats) = rx.recv() {
                return stats;
            }
        }

        // The control thread is gone, which only happens after close.
        PoolStats {
            workers: 0,
            idle_workers: 0,
            running_tasks: 0,
            queued_tasks: 0,
            closed: true,
        }
    }

    /// Closes the pool: rejects every registered task and every pending
    /// waiter with [`PoolError::Closed`], retires all workers and stops the
    /// shrink timer. Idempotent; returns once the teardown is done.
    pub fn close(&self) {
        let (tx, rx) = bounded(1);
        if self
            .events
            .send(ControlEvent::Close { done: Some(tx) })
            .is_ok()
        {
            let _ = rx.recv();
        }
    }
}

impl<D, R> Drop for Pool<D, R> {
    fn drop(&mut self) {
        let _ = self.events.send(ControlEvent::Close { done: None });
    }
}

impl<D, R> fmt::Debug for Pool<D, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").finish_non_exhaustive()
    }
}

/// A worker reserved for exclusive use.
///
/// While held, the worker never serves the wait list; run tasks on it with
/// [`Pool::run_task_on`]. Dropping the handle returns the worker to the
/// pool.
pub struct PooledWorker<D, R> {
    id: WorkerId,
    events: Sender<ControlEvent<D, R>>,
}

impl<D, R> Drop for PooledWorker<D, R> {
    fn drop(&mut self) {
        let _ = self.events.send(ControlEvent::Release { worker: self.id });
    }
}

impl<D, R> fmt::Debug for PooledWorker<D, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledWorker").field("id", &self.id).finish()
    }
}
