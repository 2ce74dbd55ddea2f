use crate::error::PoolError;
use crate::task::TaskId;
use crossbeam_channel::{Receiver, Sender, bounded};
use std::fmt;

/// Control-thread side of a completion. The registry takes it on the first
/// terminal transition, which is what makes resolution at-most-once.
pub(crate) type CompletionSender<R> = Sender<Result<R, PoolError>>;

/// Creates the two halves of a task completion.
pub(crate) fn completion<R>(id: TaskId) -> (CompletionSender<R>, TaskHandle<R>) {
    let (tx, rx) = bounded(1);
    (tx, TaskHandle { id, result: rx })
}

/// An owned claim on a task's eventual outcome.
///
/// Resolves exactly once: with the worker's result, or with the error that
/// put the task in a terminal state (aborted, pool closed, worker crash,
/// handler failure). Dropping the handle detaches it; the task keeps
/// running and its result is discarded.
pub struct TaskHandle<R> {
    id: TaskId,
    result: Receiver<Result<R, PoolError>>,
}

impl<R> TaskHandle<R> {
    /// A handle that resolved before dispatch (closed pool, pre-aborted
    /// signal).
    pub(crate) fn ready(id: TaskId, result: Result<R, PoolError>) -> Self {
        let (tx, handle) = completion(id);
        let _ = tx.send(result);
        handle
    }

    /// Suspends the caller until the task reaches a terminal state and
    /// returns its outcome.
    pub fn join(self) -> Result<R, PoolError> {
        self.result.recv().unwrap_or(Err(PoolError::Closed))
    }

    /// Whether the task has reached a terminal state.
    ///
    /// Advisory: right after an abort this can still return `false` for the
    /// short window while the rejection is in flight on the control thread.
    pub fn is_finished(&self) -> bool {
        !self.result.is_empty()
    }

    /// The id uniquely identifying this task.
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl<R> fmt::Debug for TaskHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}
