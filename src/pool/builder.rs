use crate::pool::control::Control;
use crate::pool::worker::{Handlers, TaskScope};
use crate::pool::Pool;
use anyhow::{Result, anyhow};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Default period of the idle-shrink timer.
const SHRINK_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let counter = Arc::new(AtomicUsize::new(0));
    ThreadNameFn(Arc::new(move || {
        let prev = counter.fetch_add(1, Ordering::Relaxed);
        format!("isopool-worker-{}", prev)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Worker-set sizing: fixed, or bounded with autoscaling.
#[derive(Debug, Clone, Copy)]
enum Sizing {
    /// One worker per CPU core, fixed.
    Default,
    Fixed(usize),
    Bounds { min: usize, max: usize },
}

/// Configures and starts a [`Pool`].
///
/// ```no_run
/// use isopool::Pool;
///
/// let pool = Pool::<u64, u64>::builder()
///     .handler("square", |n, _scope| Ok(n * n))
///     .pool_size_bounds(1, 4)
///     .try_build()
///     .unwrap();
/// ```
pub struct Builder<D, R> {
    handlers: Handlers<D, R>,
    sizing: Sizing,
    priority_queue: bool,
    shrink_interval: Duration,
    thread_name: ThreadNameFn,
    thread_stack_size: Option<usize>,
}

impl<D, R> Builder<D, R>
where
    D: Send + 'static,
    R: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            handlers: Handlers::new(),
            sizing: Sizing::Default,
            priority_queue: false,
            shrink_interval: SHRINK_INTERVAL,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
        }
    }

    /// Registers the handler workers run for tasks tagged `task_type`.
    ///
    /// Tasks whose tag has no handler fail with
    /// [`PoolError::UnknownTaskType`](crate::PoolError::UnknownTaskType).
    pub fn handler<F>(mut self, task_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(D, &TaskScope) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        self.handlers.insert(task_type.into(), Arc::new(handler));
        self
    }

    /// Fixes the worker count: the pool starts `size` workers and
    /// autoscaling has no effect. Mutually exclusive with
    /// [`pool_size_bounds`](Builder::pool_size_bounds); the last call wins.
    pub fn pool_size(mut self, size: usize) -> Self {
        assert!(size > 0, "pool size cannot be 0");
        self.sizing = Sizing::Fixed(size);
        self
    }

    /// Lets the pool grow from `min` workers up to `max` under load and
    /// shrink back while idle.
    pub fn pool_size_bounds(mut self, min: usize, max: usize) -> Self {
        assert!(min > 0, "minimum pool size cannot be 0");
        assert!(min <= max, "minimum pool size cannot exceed the maximum");
        self.sizing = Sizing::Bounds { min, max };
        self
    }

    /// Orders the wait list by task priority (lower first) instead of
    /// submission order.
    pub fn priority_queue(mut self) -> Self {
        self.priority_queue = true;
        self
    }

    /// Sets the period of the idle-shrink timer. Defaults to 5 minutes.
    pub fn shrink_interval(mut self, interval: Duration) -> Self {
        self.shrink_interval = interval;
        self
    }

    /// Sets the name of threads spawned by the pool.
    ///
    /// The default name is "isopool-worker-{N}".
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// pool.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies a minimal stack size.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Creates the configured [`Pool`], spawning the control thread and the
    /// minimum worker set.
    pub fn try_build(self) -> Result<Pool<D, R>> {
        let cfg = PoolConfig::try_from(&self)?;
        let events = Control::start(cfg, Arc::new(self.handlers))?;
        Ok(Pool::new(events))
    }
}

impl<D, R> Default for Builder<D, R>
where
    D: Send + 'static,
    R: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Validated pool configuration, consumed by the control core and worker
/// spawns.
#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub(crate) min_pool_size: usize,
    pub(crate) max_pool_size: usize,
    pub(crate) priority_queue: bool,
    pub(crate) shrink_interval: Duration,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
}

impl<D, R> TryFrom<&Builder<D, R>> for PoolConfig {
    type Error = anyhow::Error;

    fn try_from(builder: &Builder<D, R>) -> Result<Self, Self::Error> {
        let (min_pool_size, max_pool_size) = match builder.sizing {
            Sizing::Default => {
                let cores = thread::available_parallelism()?.get();
                (cores, cores)
            }
            Sizing::Fixed(size) => (size, size),
            Sizing::Bounds { min, max } => (min, max),
        };

        let cfg = PoolConfig {
            min_pool_size,
            max_pool_size,
            priority_queue: builder.priority_queue,
            shrink_interval: builder.shrink_interval,
            thread_name: builder.thread_name.clone(),
            thread_stack_size: builder.thread_stack_size,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<()> {
        if self.min_pool_size == 0 {
            return Err(anyhow!("minimum pool size must be greater than 0"));
        }

        if self.max_pool_size < self.min_pool_size {
            return Err(anyhow!(
                "maximum pool size must be at least the minimum pool size"
            ));
        }

        if self.shrink_interval.is_zero() {
            return Err(anyhow!("shrink interval must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    // The config is cloned into every worker spawn, so it must travel.
    assert_impl_all!(PoolConfig: Send, Sync, Clone);

    #[test]
    fn test_default_thread_names_are_numbered() {
        let name_fn = default_thread_name_fn();
        assert_eq!((name_fn.0)(), "isopool-worker-0");
        assert_eq!((name_fn.0)(), "isopool-worker-1");
    }

    #[test]
    fn test_zero_shrink_interval_is_rejected() {
        let result = Pool::<(), ()>::builder()
            .shrink_interval(Duration::from_secs(0))
            .try_build();
        assert!(result.is_err());
    }
}
