//! Per-task state owned by the control core.

use crate::abort::{AbortFlag, AbortSignal, Subscription};
use crate::error::PoolError;
use crate::task::{CompletionSender, EventCallback, TaskId};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

/// Everything the core tracks for one registered task.
pub(crate) struct TaskState<D, R> {
    pub(crate) task_type: String,
    /// Payload; taken when the task is dispatched.
    pub(crate) data: Option<D>,
    pub(crate) priority: i32,
    /// Single-shot resolver; taken on the first terminal transition.
    completion: Option<CompletionSender<R>>,
    /// Monotonic, false to true, set right before the terminal rejection.
    pub(crate) aborted: bool,
    /// One-byte region shared with the worker running this task.
    pub(crate) abort_flag: AbortFlag,
    on_event: Option<EventCallback>,
    /// Detached when the task reaches a terminal state.
    subscription: Option<(AbortSignal, Subscription)>,
}

impl<D, R> TaskState<D, R> {
    pub(crate) fn new(
        task_type: String,
        data: D,
        priority: i32,
        completion: CompletionSender<R>,
        on_event: Option<EventCallback>,
    ) -> Self {
        Self {
            task_type,
            data: Some(data),
            priority,
            completion: Some(completion),
            aborted: false,
            abort_flag: AbortFlag::new(),
            on_event,
            subscription: None,
        }
    }

    pub(crate) fn attach_abort(&mut self, signal: AbortSignal, subscription: Subscription) {
        self.subscription = Some((signal, subscription));
    }

    /// Resolves the completion. A second terminal transition for the same
    /// task is a no-op by construction.
    pub(crate) fn resolve(&mut self, result: Result<R, PoolError>) {
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(result);
        }
    }

    /// Runs the task's event callback, shielding the control thread from
    /// panics inside user code.
    pub(crate) fn notify_event(&mut self, name: &str, payload: Option<&str>) {
        if let Some(callback) = self.on_event.as_mut() {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(name, payload))).is_err() {
                tracing::warn!(event = name, "task event callback panicked");
            }
        }
    }

    /// Detaches the abort subscription, if any. Idempotent.
    pub(crate) fn detach(&mut self) {
        if let Some((signal, subscription)) = self.subscription.take() {
            signal.unsubscribe(subscription);
        }
    }
}

/// The core's map from task identity to per-task state. Only the control
/// thread touches it, so plain owned storage suffices.
pub(crate) struct TaskRegistry<D, R> {
    tasks: HashMap<TaskId, TaskState<D, R>>,
}

impl<D, R> TaskRegistry<D, R> {
    pub(crate) fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, id: TaskId, state: TaskState<D, R>) {
        let prev = self.tasks.insert(id, state);
        debug_assert!(prev.is_none(), "task id registered twice");
    }

    pub(crate) fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub(crate) fn get_mut(&mut self, id: TaskId) -> Option<&mut TaskState<D, R>> {
        self.tasks.get_mut(&id)
    }

    /// Removes `id` and detaches its abort subscription. Idempotent; the
    /// whole teardown happens in this single control-thread step, so
    /// observers never see a half-removed task.
    pub(crate) fn deregister(&mut self, id: TaskId) -> Option<TaskState<D, R>> {
        self.tasks.remove(&id).map(|mut state| {
            state.detach();
            state
        })
    }

    /// Rejects and removes every registered task. Close path.
    pub(crate) fn reject_all(&mut self, error: impl Fn() -> PoolError) {
        for (_, mut state) in self.tasks.drain() {
            state.detach();
            state.resolve(Err(error()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }
}
