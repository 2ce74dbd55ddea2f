//! Cooperative cancellation plumbing.
//!
//! Cancellation crosses the worker isolation boundary, so it is split in
//! two: an [`AbortSignal`] observed by the control core on its own thread,
//! and a one-byte [`AbortFlag`] shared with the worker and polled from
//! inside the task handler.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

/// The one-byte region shared between the control core and a worker.
///
/// Written exactly once (0 to 1) by the core; the worker polls it through
/// `TaskScope::throw_if_aborted`. No synchronization beyond the plain atomic
/// byte is needed.
#[derive(Clone, Debug)]
pub(crate) struct AbortFlag(Arc<AtomicU8>);

impl AbortFlag {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(0)))
    }

    pub(crate) fn set(&self) {
        self.0.store(1, Ordering::Release);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire) == 1
    }
}

type AbortCallback = Box<dyn FnOnce() + Send>;

struct Shared {
    aborted: AtomicBool,
    next_subscription: AtomicU64,
    subscribers: Mutex<HashMap<u64, AbortCallback>>,
}

/// An owned permission to cancel tasks submitted with the matching
/// [`AbortSignal`].
///
/// Aborting is idempotent and purely cooperative: a dispatched task keeps
/// running until it next polls `TaskScope::throw_if_aborted`, but its
/// caller-visible completion is rejected immediately.
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal {
                shared: Arc::new(Shared {
                    aborted: AtomicBool::new(false),
                    next_subscription: AtomicU64::new(0),
                    subscribers: Mutex::new(HashMap::new()),
                }),
            },
        }
    }

    /// Returns the signal side, to attach to one or more tasks.
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Fires the signal. Subscribed callbacks run once, on the calling
    /// thread; later calls do nothing.
    pub fn abort(&self) {
        let shared = &self.signal.shared;
        if shared.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        let subscribers = std::mem::take(&mut *shared.subscribers.lock());
        for (_, callback) in subscribers {
            callback();
        }
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AbortController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortController")
            .field("aborted", &self.signal.aborted())
            .finish()
    }
}

/// Observer side of an [`AbortController`]. Cloning shares the underlying
/// signal.
#[derive(Clone)]
pub struct AbortSignal {
    shared: Arc<Shared>,
}

impl AbortSignal {
    /// Whether the controller has fired.
    pub fn aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::Acquire)
    }

    /// Registers `callback` to run when the signal fires. If the signal has
    /// already fired, the callback runs immediately on the calling thread.
    pub(crate) fn subscribe(&self, callback: AbortCallback) -> Subscription {
        if self.aborted() {
            callback();
            return Subscription(None);
        }

        let id = self.shared.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.shared.subscribers.lock().insert(id, callback);

        // An abort may have drained the map between the check and the
        // insert; reclaim our own entry so the callback still runs.
        if self.aborted() {
            if let Some(callback) = self.shared.subscribers.lock().remove(&id) {
                callback();
            }
            return Subscription(None);
        }

        Subscription(Some(id))
    }

    /// Detaches a subscription. The callback will no longer run.
    pub(crate) fn unsubscribe(&self, subscription: Subscription) {
        if let Some(id) = subscription.0 {
            self.shared.subscribers.lock().remove(&id);
        }
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.aborted())
            .finish()
    }
}

/// Token returned by [`AbortSignal::subscribe`]; `None` when the callback
/// already ran at subscription time.
pub(crate) struct Subscription(Option<u64>);
