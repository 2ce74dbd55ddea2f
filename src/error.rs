/// A centralized error type for all pool and task operations.
///
/// Every failure a caller can observe funnels through this enum; the pool
/// never swallows a task outcome.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    /// The pool was closed before or while the operation ran.
    #[error("pool is closed")]
    Closed,

    /// The task was cancelled through its abort signal.
    #[error("task aborted")]
    Aborted,

    /// The worker executing the task died. The bound task fails with this
    /// and the pool spawns a replacement worker.
    #[error("worker crashed: {0}")]
    WorkerCrash(String),

    /// Posting the task message to a worker failed synchronously.
    #[error("failed to dispatch task: {0}")]
    Dispatch(String),

    /// A worker emitted a message that violates the pool protocol. The
    /// message channel is broken in a way the core cannot recover from.
    #[error("worker emitted a message that violates the pool protocol")]
    InvalidMessage,

    /// The worker has no handler registered for the task's routing tag.
    #[error("no handler registered for task type `{0}`")]
    UnknownTaskType(String),

    /// The task handler itself failed; the error is surfaced verbatim.
    #[error("task failed: {0}")]
    Task(#[from] anyhow::Error),
}

impl PoolError {
    pub fn is_closed(&self) -> bool {
        matches!(self, PoolError::Closed)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, PoolError::Aborted)
    }

    pub fn is_worker_crash(&self) -> bool {
        matches!(self, PoolError::WorkerCrash(_))
    }

    /// Maps a worker-reported handler failure back onto the pool taxonomy.
    ///
    /// Handlers report `anyhow::Error`; when the underlying error already is
    /// a `PoolError` (an `UnknownTaskType` raised while routing, or an
    /// `Aborted` propagated out of `throw_if_aborted`) it is kept as-is
    /// instead of being wrapped a second time.
    pub(crate) fn from_task_failure(err: anyhow::Error) -> PoolError {
        match err.downcast::<PoolError>() {
            Ok(pool_err) => pool_err,
            Err(err) => PoolError::Task(err),
        }
    }
}
