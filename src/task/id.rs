use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque id that uniquely identifies a task relative to every other
/// task submitted over the lifetime of the process.
///
/// Ids are monotonic and never reused, so a late message from a worker can
/// never be attributed to a newer task.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct TaskId(NonZeroU64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // Even at a billion submissions per second this takes centuries to
        // wrap around.
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task id: bitspace exhausted")
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_new_task_ids_are_unique() {
        let n = 64;
        let mut all_ids = HashSet::with_capacity(n);

        for _ in 0..n {
            all_ids.insert(TaskId::next());
        }

        assert_eq!(all_ids.len(), n);
    }
}
