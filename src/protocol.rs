//! Message shapes crossing the control/worker boundary.
//!
//! The core posts exactly one `TaskMsg` per worker at a time; the worker
//! answers with any number of `Event` messages followed by exactly one
//! `Result`. Anything else is a protocol violation the core treats as
//! fatal.

use crate::abort::AbortFlag;

/// Dispatch message, core to worker.
pub(crate) struct TaskMsg<D> {
    pub(crate) task_type: String,
    pub(crate) data: D,
    /// The one-byte shared region the worker polls for cooperative abort.
    pub(crate) abort_flag: AbortFlag,
}

/// Reply messages, worker to core.
pub(crate) enum WorkerMsg<R> {
    /// Terminal outcome of the dispatched task.
    Result(anyhow::Result<R>),
    /// Non-terminal progress notification; never alters worker state.
    Event {
        name: String,
        payload: Option<String>,
    },
}
