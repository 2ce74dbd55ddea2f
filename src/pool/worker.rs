//! Worker lifecycle and the worker-side task dispatcher.
//!
//! Each worker is a dedicated thread owning nothing but its task channel;
//! the only state it shares with the core is the per-task abort byte. A
//! handler panic is a worker-level fault: the thread reports it and dies,
//! and the core spawns a replacement.

use crate::abort::AbortFlag;
use crate::error::PoolError;
use crate::pool::builder::PoolConfig;
use crate::pool::control::ControlEvent;
use crate::protocol::{TaskMsg, WorkerMsg};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::num::NonZeroU64;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

/// Identity of a worker. Monotonic and never reused, so a late message from
/// a dead worker can never be attributed to its replacement.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub(crate) struct WorkerId(NonZeroU64);

impl WorkerId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique worker id: bitspace exhausted")
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Handler invoked on a worker thread for one routing tag.
pub type TaskHandler<D, R> = Arc<dyn Fn(D, &TaskScope) -> anyhow::Result<R> + Send + Sync>;

/// Routing table from task type to handler, shared by every worker.
pub(crate) struct Handlers<D, R> {
    map: HashMap<String, TaskHandler<D, R>>,
}

impl<D, R> Handlers<D, R> {
    pub(crate) fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, task_type: String, handler: TaskHandler<D, R>) {
        self.map.insert(task_type, handler);
    }

    fn get(&self, task_type: &str) -> Option<&TaskHandler<D, R>> {
        self.map.get(task_type)
    }
}

/// Worker-side view of the task being executed.
///
/// A handler gets exactly two capabilities: emitting progress events and
/// polling the cooperative abort flag.
pub struct TaskScope {
    abort_flag: AbortFlag,
    emitter: Box<dyn Fn(String, Option<String>) + Send + Sync>,
}

impl TaskScope {
    /// Sends a progress event to the task's `on_event` callback, which runs
    /// on the control thread.
    pub fn emit(&self, name: impl Into<String>, payload: Option<String>) {
        (self.emitter)(name.into(), payload);
    }

    /// Returns `Err(PoolError::Aborted)` once the core has signalled abort.
    ///
    /// Abort is cooperative and observed only here; call this at safe
    /// points inside long-running handler code.
    pub fn throw_if_aborted(&self) -> Result<(), PoolError> {
        if self.abort_flag.is_set() {
            Err(PoolError::Aborted)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for TaskScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScope")
            .field("aborted", &self.abort_flag.is_set())
            .finish()
    }
}

/// Control-thread handle to one live worker. Dropping it drops the task
/// channel, which retires the worker after its current handler returns.
pub(crate) struct WorkerHandle<D> {
    pub(crate) id: WorkerId,
    tasks: Sender<TaskMsg<D>>,
}

impl<D> WorkerHandle<D> {
    /// Posts the dispatch message. Fails synchronously when the worker is
    /// already gone.
    pub(crate) fn post(&self, msg: TaskMsg<D>) -> Result<(), PoolError> {
        self.tasks
            .send(msg)
            .map_err(|_| PoolError::Dispatch(format!("worker {} is gone", self.id)))
    }
}

/// Spawns one worker thread wired to the control core.
pub(crate) fn spawn<D, R>(
    cfg: &PoolConfig,
    control: Sender<ControlEvent<D, R>>,
    handlers: Arc<Handlers<D, R>>,
) -> io::Result<WorkerHandle<D>>
where
    D: Send + 'static,
    R: Send + 'static,
{
    let id = WorkerId::next();
    let (tasks_tx, tasks_rx) = unbounded();

    let mut builder = thread::Builder::new().name((cfg.thread_name.0)());
    if let Some(stack_size) = cfg.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    builder.spawn(move || worker_loop(id, tasks_rx, control, handlers))?;
    tracing::debug!(worker = %id, "worker spawned");

    Ok(WorkerHandle { id, tasks: tasks_tx })
}

// One task at a time: receive, route, answer. The loop ends when the core
// drops the task channel (worker retired or pool closed) or when a handler
// panics.
fn worker_loop<D, R>(
    id: WorkerId,
    tasks: Receiver<TaskMsg<D>>,
    control: Sender<ControlEvent<D, R>>,
    handlers: Arc<Handlers<D, R>>,
) where
    D: Send + 'static,
    R: Send + 'static,
{
    while let Ok(TaskMsg {
        task_type,
        data,
        abort_flag,
    }) = tasks.recv()
    {
        let outcome = match handlers.get(&task_type) {
            None => Err(PoolError::UnknownTaskType(task_type).into()),
            Some(handler) => {
                let scope = TaskScope {
                    abort_flag,
                    emitter: event_emitter(id, control.clone()),
                };
                match panic::catch_unwind(AssertUnwindSafe(|| handler(data, &scope))) {
                    Ok(outcome) => outcome,
                    Err(payload) => {
                        let error = panic_message(payload.as_ref());
                        let _ = control.send(ControlEvent::WorkerError { worker: id, error });
                        return;
                    }
                }
            }
        };

        let reply = ControlEvent::Worker {
            worker: id,
            msg: WorkerMsg::Result(outcome),
        };
        if control.send(reply).is_err() {
            // Control core gone; nothing left to report to.
            return;
        }
    }
}

fn event_emitter<D, R>(
    id: WorkerId,
    control: Sender<ControlEvent<D, R>>,
) -> Box<dyn Fn(String, Option<String>) + Send + Sync>
where
    D: Send + 'static,
    R: Send + 'static,
{
    Box::new(move |name, payload| {
        let msg = WorkerMsg::Event { name, payload };
        let _ = control.send(ControlEvent::Worker { worker: id, msg });
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}
