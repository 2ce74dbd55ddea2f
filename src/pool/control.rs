//! The pool control core.
//!
//! One dedicated thread consumes every event that can touch the pool's
//! indices: submissions, aborts, worker messages, worker faults, acquire and
//! release requests, availability waits, stats snapshots, close, and the
//! shrink tick. Handlers never suspend, so each event is applied atomically
//! and the indices stay consistent without any locking.

use crate::collections::{PriorityQueue, Queue, RingBuffer};
use crate::error::PoolError;
use crate::pool::PoolStats;
use crate::pool::builder::PoolConfig;
use crate::pool::registry::{TaskRegistry, TaskState};
use crate::pool::worker::{self, Handlers, WorkerHandle, WorkerId};
use crate::protocol::{TaskMsg, WorkerMsg};
use crate::task::{CompletionSender, SENT_TO_WORKER, Task, TaskId};
use anyhow::{Context as _, Result};
use crossbeam_channel::{Receiver, Sender, select, unbounded};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Everything the control thread reacts to.
pub(crate) enum ControlEvent<D, R> {
    /// A task submission, optionally pinned to an acquired worker.
    Submit {
        id: TaskId,
        task: Task<D>,
        completion: CompletionSender<R>,
        pinned: Option<WorkerId>,
    },
    /// The task's abort signal fired.
    Abort { task: TaskId },
    /// A protocol message from a worker.
    Worker { worker: WorkerId, msg: WorkerMsg<R> },
    /// A worker-level fault; the worker thread is gone.
    WorkerError { worker: WorkerId, error: String },
    /// Self-posted after a fault: spawn the replacement worker.
    Replace,
    Acquire {
        reply: Sender<Result<WorkerId, PoolError>>,
    },
    Release { worker: WorkerId },
    WaitIdle {
        reply: Sender<Result<(), PoolError>>,
    },
    Stats { reply: Sender<PoolStats> },
    Close { done: Option<Sender<()>> },
}

/// Wait-list entry for the priority flavor. Ordered by priority alone, so
/// equal priorities carry no ordering guarantee.
struct QueuedTask {
    priority: i32,
    id: TaskId,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority)
    }
}

/// FIFO-or-priority wait list holding task ids. Entries whose task has been
/// deregistered in the meantime are tombstones the drain loop skips.
enum WaitList {
    Fifo(Queue<TaskId>),
    Priority(PriorityQueue<QueuedTask>),
}

impl WaitList {
    fn new(priority: bool) -> Self {
        if priority {
            WaitList::Priority(PriorityQueue::new())
        } else {
            WaitList::Fifo(Queue::new())
        }
    }

    fn push(&mut self, id: TaskId, priority: i32) {
        match self {
            WaitList::Fifo(queue) => queue.push(id),
            WaitList::Priority(heap) => heap.push(QueuedTask { priority, id }),
        }
    }

    fn pop(&mut self) -> Option<TaskId> {
        match self {
            WaitList::Fifo(queue) => queue.pop(),
            WaitList::Priority(heap) => heap.pop().map(|entry| entry.id),
        }
    }

    fn clear(&mut self) {
        match self {
            WaitList::Fifo(queue) => queue.clear(),
            WaitList::Priority(heap) => heap.clear(),
        }
    }
}

pub(crate) struct Control<D, R> {
    cfg: PoolConfig,
    handlers: Arc<Handlers<D, R>>,
    /// The core's own clone of the event sender, for abort subscriptions,
    /// worker wiring and self-posted events. Dropped at close so the
    /// channel can disconnect once the public handles are gone too.
    events: Option<Sender<ControlEvent<D, R>>>,

    workers: HashMap<WorkerId, WorkerHandle<D>>,
    /// Idle workers; disjoint from `acquired` and from the running map.
    idle: RingBuffer<WorkerId>,
    acquired: HashSet<WorkerId>,
    running_by_worker: HashMap<WorkerId, TaskId>,
    running: HashSet<TaskId>,
    wait_list: WaitList,
    /// Wait-list entries that still resolve to a registered task; the list
    /// itself may additionally hold tombstones.
    queued: usize,
    registry: TaskRegistry<D, R>,
    acquire_waiters: Queue<Sender<Result<WorkerId, PoolError>>>,
    idle_waiters: Queue<Sender<Result<(), PoolError>>>,
    /// Crash replacements posted but not yet performed. Autoscaling skips
    /// its turn while this is non-zero so it cannot double-count a dying
    /// worker.
    replacing: usize,
    closed: bool,
}

impl<D, R> Control<D, R>
where
    D: Send + 'static,
    R: Send + 'static,
{
    /// Spawns the minimum worker set and the control thread; returns the
    /// event sender the public handle talks through.
    pub(crate) fn start(
        cfg: PoolConfig,
        handlers: Arc<Handlers<D, R>>,
    ) -> Result<Sender<ControlEvent<D, R>>> {
        let (events_tx, events_rx) = unbounded();
        let mut control = Control::new(cfg, handlers, events_tx.clone());

        for _ in 0..control.cfg.min_pool_size {
            let handle = control
                .spawn_worker()
                .context("failed to spawn initial worker")?;
            let id = handle.id;
            control.workers.insert(id, handle);
            let _ = control.idle.push(id);
        }

        let shrink_tick = crossbeam_channel::tick(control.cfg.shrink_interval);
        thread::Builder::new()
            .name("isopool-control".into())
            .spawn(move || control.run(events_rx, shrink_tick))
            .context("failed to spawn control thread")?;

        Ok(events_tx)
    }

    fn new(
        cfg: PoolConfig,
        handlers: Arc<Handlers<D, R>>,
        events: Sender<ControlEvent<D, R>>,
    ) -> Self {
        Self {
            idle: RingBuffer::with_capacity(cfg.max_pool_size),
            wait_list: WaitList::new(cfg.priority_queue),
            cfg,
            handlers,
            events: Some(events),
            workers: HashMap::new(),
            acquired: HashSet::new(),
            running_by_worker: HashMap::new(),
            running: HashSet::new(),
            queued: 0,
            registry: TaskRegistry::new(),
            acquire_waiters: Queue::new(),
            idle_waiters: Queue::new(),
            replacing: 0,
            closed: false,
        }
    }

    fn run(mut self, events: Receiver<ControlEvent<D, R>>, mut shrink_tick: Receiver<Instant>) {
        loop {
            select! {
                recv(events) -> event => match event {
                    Ok(event) => self.handle(event),
                    // Every sender is gone: the pool handle was dropped and
                    // no worker or abort subscription is left either.
                    Err(_) => {
                        self.close(None);
                        break;
                    }
                },
                recv(shrink_tick) -> _ => self.shrink_tick(),
            }

            if self.closed {
                // The autoshrink timer stops at close. The loop itself
                // keeps serving events (answering everything with
                // `Closed`) until the last sender disconnects.
                shrink_tick = crossbeam_channel::never();
            }
        }
    }

    fn handle(&mut self, event: ControlEvent<D, R>) {
        match event {
            ControlEvent::Submit {
                id,
                task,
                completion,
                pinned,
            } => self.submit(id, task, completion, pinned),
            ControlEvent::Abort { task } => self.abort(task),
            ControlEvent::Worker { worker, msg } => match msg {
                WorkerMsg::Result(outcome) => self.task_finished(worker, outcome),
                WorkerMsg::Event { name, payload } => self.task_event(worker, name, payload),
            },
            ControlEvent::WorkerError { worker, error } => self.worker_failed(worker, error),
            ControlEvent::Replace => self.replace_worker(),
            ControlEvent::Acquire { reply } => self.acquire(reply),
            ControlEvent::Release { worker } => self.release(worker),
            ControlEvent::WaitIdle { reply } => self.wait_idle(reply),
            ControlEvent::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            ControlEvent::Close { done } => self.close(done),
        }
    }

    // ===== submission & dispatch =====

    fn submit(
        &mut self,
        id: TaskId,
        task: Task<D>,
        completion: CompletionSender<R>,
        pinned: Option<WorkerId>,
    ) {
        if self.closed {
            let _ = completion.send(Err(PoolError::Closed));
            return;
        }

        let Task {
            task_type,
            data,
            priority,
            abort_signal,
            on_event,
        } = task;

        // A signal that fired before we got here never touches a worker.
        if let Some(signal) = &abort_signal {
            if signal.aborted() {
                let _ = completion.send(Err(PoolError::Aborted));
                return;
            }
        }

        let mut state = TaskState::new(task_type, data, priority, completion, on_event);
        if let Some(signal) = abort_signal {
            let events = self.event_sender().clone();
            let subscription = signal.subscribe(Box::new(move || {
                let _ = events.send(ControlEvent::Abort { task: id });
            }));
            state.attach_abort(signal, subscription);
        }
        self.registry.insert(id, state);
        tracing::trace!(task = %id, "task registered");

        match pinned {
            Some(worker) => self.dispatch_pinned(worker, id),
            None => match self.idle.pop() {
                Some(worker) => self.dispatch(worker, id),
                None => {
                    self.wait_list.push(id, priority);
                    self.queued += 1;
                    self.auto_grow();
                }
            },
        }
    }

    /// Pinned dispatch targets a worker the caller holds exclusively; the
    /// one-outstanding-task-per-worker guarantee still applies.
    fn dispatch_pinned(&mut self, worker: WorkerId, id: TaskId) {
        if !self.acquired.contains(&worker) {
            self.reject(id, PoolError::Dispatch(format!("worker {worker} is not acquired")));
        } else if self.running_by_worker.contains_key(&worker) {
            self.reject(
                id,
                PoolError::Dispatch(format!("worker {worker} is already running a task")),
            );
        } else {
            self.dispatch(worker, id);
        }
    }

    fn dispatch(&mut self, worker: WorkerId, id: TaskId) {
        let state = self.registry.get_mut(id).expect("dispatching unregistered task");
        let data = state.data.take().expect("task payload already taken");
        let msg = TaskMsg {
            task_type: state.task_type.clone(),
            data,
            abort_flag: state.abort_flag.clone(),
        };

        self.running.insert(id);
        self.running_by_worker.insert(worker, id);

        let posted = self
            .workers
            .get(&worker)
            .map(|handle| handle.post(msg))
            .unwrap_or_else(|| Err(PoolError::Dispatch(format!("worker {worker} is gone"))));

        match posted {
            Ok(()) => {
                tracing::debug!(task = %id, worker = %worker, "task dispatched");
                if let Some(state) = self.registry.get_mut(id) {
                    state.notify_event(SENT_TO_WORKER, None);
                }
            }
            Err(error) => {
                // Synchronous post failure: undo the dispatch marks, fail
                // the task, hand the worker back.
                self.running.remove(&id);
                self.running_by_worker.remove(&worker);
                self.reject(id, error);
                if !self.acquired.contains(&worker) {
                    let _ = self.idle.push(worker);
                }
            }
        }
    }

    /// Terminal rejection: resolve with `error` and tear the task down.
    fn reject(&mut self, id: TaskId, error: PoolError) {
        if let Some(mut state) = self.registry.deregister(id) {
            state.resolve(Err(error));
        }
    }

    // ===== worker availability =====

    /// Routes a worker that just became available: pending acquires first,
    /// then queued tasks, then at most one idle-available waiter. Dedicated
    /// use has been requested explicitly, so it outranks queued work.
    fn worker_became_idle(&mut self, worker: WorkerId) {
        if self.closed || !self.workers.contains_key(&worker) {
            return;
        }

        while let Some(reply) = self.acquire_waiters.pop() {
            if reply.send(Ok(worker)).is_ok() {
                self.acquired.insert(worker);
                return;
            }
            // That waiter is gone; try the next one.
        }

        if self.idle.push(worker).is_err() {
            debug_assert!(false, "idle list cannot overflow the worker set");
            return;
        }

        // Serve the wait list, skipping tombstones left behind by aborts.
        while let Some(id) = self.wait_list.pop() {
            if !self.registry.contains(id) {
                continue;
            }
            self.queued -= 1;
            let next = self.idle.pop().expect("idle worker pushed above");
            self.dispatch(next, id);
            return;
        }

        // Idle with an empty wait list: resolve exactly one availability
        // waiter. The next waiter waits for the next qualifying moment.
        if !self.idle.is_empty() {
            while let Some(reply) = self.idle_waiters.pop() {
                if reply.send(Ok(())).is_ok() {
                    break;
                }
            }
        }
    }

    // ===== worker messages =====

    fn task_finished(&mut self, worker: WorkerId, outcome: Result<R>) {
        if self.closed {
            // A worker finishing off its last task after close; its result
            // was already rejected.
            return;
        }

        let Some(id) = self.running_by_worker.remove(&worker) else {
            // The message channel is broken in a way the core cannot
            // recover from.
            tracing::error!(worker = %worker, "{}", PoolError::InvalidMessage);
            panic!("FATAL: result message from worker {worker} with no dispatched task");
        };
        self.running.remove(&id);

        if let Some(mut state) = self.registry.deregister(id) {
            if !state.aborted {
                state.resolve(outcome.map_err(PoolError::from_task_failure));
            }
            // Aborted: the completion was rejected when the abort landed;
            // the late result must not touch it.
        }

        if !self.acquired.contains(&worker) {
            self.worker_became_idle(worker);
        }
    }

    fn task_event(&mut self, worker: WorkerId, name: String, payload: Option<String>) {
        if self.closed {
            return;
        }

        let Some(&id) = self.running_by_worker.get(&worker) else {
            tracing::error!(worker = %worker, "{}", PoolError::InvalidMessage);
            panic!("FATAL: event message from worker {worker} with no dispatched task");
        };

        if let Some(state) = self.registry.get_mut(id) {
            if !state.aborted {
                state.notify_event(&name, payload.as_deref());
            }
        }
    }

    // ===== abort =====

    fn abort(&mut self, id: TaskId) {
        if self.running.contains(&id) {
            // In flight: reject immediately and signal the worker through
            // the shared byte. The entry stays registered, flagged aborted,
            // so the worker's late result is recognized and dropped.
            self.running.remove(&id);
            let Some(state) = self.registry.get_mut(id) else {
                return;
            };
            state.aborted = true;
            state.abort_flag.set();
            state.detach();
            state.resolve(Err(PoolError::Aborted));
            tracing::debug!(task = %id, "running task aborted");
        } else if let Some(state) = self.registry.get_mut(id) {
            if state.aborted {
                // Residue of an earlier abort still waiting for its worker
                // to notice.
                return;
            }
            // Still queued: its wait-list entry becomes a tombstone.
            state.aborted = true;
            self.queued -= 1;
            self.reject(id, PoolError::Aborted);
            tracing::debug!(task = %id, "queued task aborted");
        }
        // Otherwise the task already reached a terminal state; abort lost
        // the race and changes nothing.
    }

    // ===== worker faults =====

    fn worker_failed(&mut self, worker: WorkerId, error: String) {
        if self.closed {
            return;
        }

        tracing::warn!(worker = %worker, error = %error, "worker crashed");

        // Purge the dead worker from every index.
        self.workers.remove(&worker);
        self.acquired.remove(&worker);
        self.idle.retain(|id| *id != worker);

        // The bound task, if any, fails with the underlying error.
        if let Some(id) = self.running_by_worker.remove(&worker) {
            self.running.remove(&id);
            self.reject(id, PoolError::WorkerCrash(error));
        }

        // Replace asynchronously; autoscaling waits for the replacement.
        self.replacing += 1;
        let _ = self.event_sender().send(ControlEvent::Replace);
    }

    fn replace_worker(&mut self) {
        self.replacing -= 1;
        if self.closed || self.workers.len() >= self.cfg.max_pool_size {
            return;
        }

        match self.spawn_worker() {
            Ok(handle) => {
                let id = handle.id;
                self.workers.insert(id, handle);
                tracing::debug!(worker = %id, "crashed worker replaced");
                // A fresh worker goes straight to the idle path so it can
                // pick up queued work or a pending acquire.
                self.worker_became_idle(id);
            }
            Err(error) => {
                tracing::error!(error = %error, "failed to replace crashed worker");
            }
        }
    }

    // ===== acquire / release =====

    fn acquire(&mut self, reply: Sender<Result<WorkerId, PoolError>>) {
        if self.closed {
            let _ = reply.send(Err(PoolError::Closed));
            return;
        }

        match self.idle.pop() {
            Some(worker) => {
                self.acquired.insert(worker);
                if reply.send(Ok(worker)).is_err() {
                    // The caller vanished before the handover; undo it.
                    self.acquired.remove(&worker);
                    self.worker_became_idle(worker);
                }
            }
            None => {
                self.acquire_waiters.push(reply);
                self.auto_grow();
            }
        }
    }

    fn release(&mut self, worker: WorkerId) {
        if self.closed {
            // Workers were all torn down on close; nothing to return.
            return;
        }
        if !self.acquired.remove(&worker) {
            return;
        }
        if self.running_by_worker.contains_key(&worker) {
            // A pinned task is still in flight on this worker; it joins the
            // idle list when its result arrives.
            return;
        }
        self.worker_became_idle(worker);
    }

    // ===== availability waiters & stats =====

    fn wait_idle(&mut self, reply: Sender<Result<(), PoolError>>) {
        if self.closed {
            let _ = reply.send(Err(PoolError::Closed));
            return;
        }

        // Resolve immediately only at a qualifying moment with no earlier
        // waiter still pending, to keep strict FIFO resolution.
        if self.queued == 0 && !self.idle.is_empty() && self.idle_waiters.is_empty() {
            let _ = reply.send(Ok(()));
            return;
        }

        self.idle_waiters.push(reply);
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers.len(),
            idle_workers: self.idle.len(),
            running_tasks: self.running.len(),
            queued_tasks: self.queued,
            closed: self.closed,
        }
    }

    // ===== autoscaling =====

    /// Adds at most one worker, and only when there is demand, nothing is
    /// idle, the pool is below its ceiling and no crash replacement is in
    /// flight.
    fn auto_grow(&mut self) {
        if self.closed || self.replacing > 0 {
            return;
        }
        if self.queued == 0 && self.acquire_waiters.is_empty() {
            return;
        }
        if self.workers.len() >= self.cfg.max_pool_size || !self.idle.is_empty() {
            return;
        }

        match self.spawn_worker() {
            Ok(handle) => {
                let id = handle.id;
                self.workers.insert(id, handle);
                tracing::debug!(worker = %id, workers = self.workers.len(), "pool grown");
                self.worker_became_idle(id);
            }
            Err(error) => {
                tracing::error!(error = %error, "failed to grow pool");
            }
        }
    }

    /// Retires at most one idle worker per tick once the pool is quiet.
    fn shrink_tick(&mut self) {
        if self.closed || self.replacing > 0 {
            return;
        }
        if self.queued != 0
            || self.workers.len() <= self.cfg.min_pool_size
            || self.idle.len() <= 1
        {
            return;
        }

        if let Some(worker) = self.idle.pop() {
            self.workers.remove(&worker);
            tracing::debug!(worker = %worker, workers = self.workers.len(), "pool shrunk");
        }
    }

    // ===== close =====

    fn close(&mut self, done: Option<Sender<()>>) {
        if !self.closed {
            self.closed = true;
            tracing::debug!(tasks = self.registry.len(), "closing pool");

            self.registry.reject_all(|| PoolError::Closed);
            self.running.clear();
            self.running_by_worker.clear();
            self.wait_list.clear();
            self.queued = 0;

            // Dropping a worker's handle drops its task channel; the
            // worker thread exits once its current handler returns.
            self.workers.clear();
            self.idle.clear();
            self.acquired.clear();

            while let Some(reply) = self.acquire_waiters.pop() {
                let _ = reply.send(Err(PoolError::Closed));
            }
            while let Some(reply) = self.idle_waiters.pop() {
                let _ = reply.send(Err(PoolError::Closed));
            }

            // Give up our own sender so the event channel disconnects once
            // the public handles are gone.
            self.events = None;
        }

        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn event_sender(&self) -> &Sender<ControlEvent<D, R>> {
        self.events.as_ref().expect("event sender gone before close")
    }

    fn spawn_worker(&self) -> io::Result<WorkerHandle<D>> {
        worker::spawn(&self.cfg, self.event_sender().clone(), self.handlers.clone())
    }
}
