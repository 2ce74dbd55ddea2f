//! Task descriptions, identities and completion handles.

mod handle;
mod id;

pub use handle::TaskHandle;
pub use id::TaskId;

pub(crate) use handle::{CompletionSender, completion};

use crate::abort::AbortSignal;
use std::fmt;

/// Callback invoked on the control thread for every event a task emits,
/// including the built-in dispatch notification. A panic inside it is
/// caught and logged so later callbacks keep working.
pub type EventCallback = Box<dyn FnMut(&str, Option<&str>) + Send + 'static>;

/// Name of the event fired right after a task message is handed to a
/// worker.
pub const SENT_TO_WORKER: &str = "sent-to-worker";

/// A unit of work to run on a pooled worker.
///
/// Immutable once submitted; the chainable setters configure the optional
/// pieces before submission:
///
/// ```no_run
/// use isopool::{AbortController, Task};
///
/// let controller = AbortController::new();
/// let task = Task::new("resize", vec![0u8; 1024])
///     .priority(-1)
///     .abort_signal(controller.signal());
/// ```
pub struct Task<D> {
    pub(crate) task_type: String,
    pub(crate) data: D,
    pub(crate) priority: i32,
    pub(crate) abort_signal: Option<AbortSignal>,
    pub(crate) on_event: Option<EventCallback>,
}

impl<D> Task<D> {
    /// Creates a task routed to the worker handler registered under
    /// `task_type`, carrying `data` as its payload.
    pub fn new(task_type: impl Into<String>, data: D) -> Self {
        Self {
            task_type: task_type.into(),
            data,
            priority: 0,
            abort_signal: None,
            on_event: None,
        }
    }

    /// Sets the scheduling priority; lower values dispatch first. Only
    /// pools built with a priority wait list honor it. Defaults to 0.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Attaches an external cancellation signal, observed from submission
    /// until the task reaches a terminal state.
    pub fn abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort_signal = Some(signal);
        self
    }

    /// Registers a callback for progress events emitted by the worker. It
    /// runs on the control thread.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&str, Option<&str>) + Send + 'static,
    {
        self.on_event = Some(Box::new(callback));
        self
    }
}

impl<D: fmt::Debug> fmt::Debug for Task<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("task_type", &self.task_type)
            .field("data", &self.data)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}
