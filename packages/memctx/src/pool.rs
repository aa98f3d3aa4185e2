use std::any::{Any, type_name};
use std::fmt;
use std::mem;
use std::num::NonZero;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

use crate::ObjectType;

const DEFAULT_CAPACITY: NonZero<usize> = NonZero::new(64).unwrap();

/// Errors reported by an [`ObjectPool`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The pool configuration is not valid.
    #[error("invalid pool configuration: {problem}")]
    InvalidConfig {
        /// A human-readable description of the problem.
        problem: String,
    },

    /// The pool was configured with [`ClosePolicy::MustNotHaveOutstanding`] and objects acquired
    /// from it have not yet been released.
    #[error("pool of '{object_type}' still has {count} outstanding object(s)")]
    OutstandingObjects {
        /// The name of the pooled object type.
        object_type: &'static str,

        /// How many objects have been acquired but not released.
        count: usize,
    },
}

/// Determines how a pool treats objects that are still checked out when it is closed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ClosePolicy {
    /// The pool closes even if some objects are still checked out. Such objects are handed to
    /// the cleaner if they are released after the pool was closed. This is the default.
    #[default]
    MayAbandonOutstanding,

    /// Closing fails with [`PoolError::OutstandingObjects`] while any object is checked out.
    /// The pool stays open in that case, so the close can be retried after the objects are
    /// released.
    MustNotHaveOutstanding,
}

/// Configuration of an [`ObjectPool`].
///
/// # Example
///
/// ```rust
/// use std::num::NonZero;
///
/// use memctx::{ClosePolicy, PoolConfig};
///
/// let config = PoolConfig::new()
///     .capacity(NonZero::new(16).unwrap())
///     .prewarm(4)
///     .close_policy(ClosePolicy::MustNotHaveOutstanding);
///
/// assert_eq!(config.capacity_value().get(), 16);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[must_use]
pub struct PoolConfig {
    capacity: NonZero<usize>,
    prewarm: usize,
    close_policy: ClosePolicy,
}

impl PoolConfig {
    /// Creates a configuration with default values: capacity 64, no prewarming and
    /// [`ClosePolicy::MayAbandonOutstanding`].
    pub fn new() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            prewarm: 0,
            close_policy: ClosePolicy::default(),
        }
    }

    /// Sets the maximum number of idle objects the pool retains. Objects released while the
    /// pool is full are handed to the cleaner instead of being kept.
    pub fn capacity(mut self, capacity: NonZero<usize>) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets how many objects the pool allocates up front. Must not exceed the capacity.
    pub fn prewarm(mut self, count: usize) -> Self {
        self.prewarm = count;
        self
    }

    /// Sets the [close policy][ClosePolicy] of the pool.
    pub fn close_policy(mut self, policy: ClosePolicy) -> Self {
        self.close_policy = policy;
        self
    }

    /// The configured capacity.
    #[must_use]
    pub fn capacity_value(&self) -> NonZero<usize> {
        self.capacity
    }

    /// The configured number of objects to allocate up front.
    #[must_use]
    pub fn prewarm_value(&self) -> usize {
        self.prewarm
    }

    /// The configured close policy.
    #[must_use]
    pub fn close_policy_value(&self) -> ClosePolicy {
        self.close_policy
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

type Allocator<T> = Box<dyn Fn() -> T + Send + Sync>;
type Cleaner<T> = Box<dyn Fn(T) + Send + Sync>;

/// A bounded store of reusable objects of type `T`.
///
/// Objects are created by a user-supplied allocator when the pool has no idle object to hand
/// out, and torn down by a user-supplied cleaner when the pool is closed or has no room left
/// for a released object.
///
/// This type is a cloneable handle; all clones refer to the same pool.
///
/// # Example
///
/// ```rust
/// use memctx::{ObjectPool, PoolConfig};
///
/// let pool = ObjectPool::new(
///     PoolConfig::new(),
///     || Vec::<u8>::with_capacity(1024),
///     |_| {},
/// )
/// .unwrap();
///
/// let mut buffer = pool.acquire().unwrap();
/// buffer.extend_from_slice(b"hello");
/// buffer.clear();
/// pool.release(buffer);
///
/// assert_eq!(pool.idle_len(), 1);
/// pool.close().unwrap();
/// ```
pub struct ObjectPool<T> {
    inner: Arc<PoolInner<T>>,
}

struct PoolInner<T> {
    config: PoolConfig,
    allocator: Allocator<T>,
    cleaner: Cleaner<T>,
    state: Mutex<PoolState<T>>,
}

struct PoolState<T> {
    idle: Vec<T>,
    outstanding: usize,
    closed: bool,
}

impl<T> ObjectPool<T>
where
    T: Send + 'static,
{
    /// Creates a pool with the given configuration and callbacks.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] if the prewarm count exceeds the capacity.
    pub fn new<A, C>(config: PoolConfig, allocator: A, cleaner: C) -> Result<Self, PoolError>
    where
        A: Fn() -> T + Send + Sync + 'static,
        C: Fn(T) + Send + Sync + 'static,
    {
        if config.prewarm > config.capacity.get() {
            return Err(PoolError::InvalidConfig {
                problem: format!(
                    "prewarm count {} exceeds capacity {}",
                    config.prewarm, config.capacity
                ),
            });
        }

        let idle = (0..config.prewarm).map(|_| allocator()).collect();

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                allocator: Box::new(allocator),
                cleaner: Box::new(cleaner),
                state: Mutex::new(PoolState {
                    idle,
                    outstanding: 0,
                    closed: false,
                }),
            }),
        })
    }

    /// Takes an object out of the pool, allocating a new one if no idle object is available.
    ///
    /// Returns `None` if the pool is closed.
    #[must_use]
    pub fn acquire(&self) -> Option<T> {
        let reused = {
            let mut state = self.inner.state.lock();

            if state.closed {
                return None;
            }

            state.outstanding = state.outstanding.saturating_add(1);
            state.idle.pop()
        };

        trace!(
            object_type = type_name::<T>(),
            reused = reused.is_some(),
            "acquired pooled object"
        );

        // The allocator is user code, so it runs outside the pool lock.
        Some(reused.unwrap_or_else(|| (self.inner.allocator)()))
    }

    /// Returns an object to the pool.
    ///
    /// The object is handed to the cleaner instead if the pool is closed or already holds as
    /// many idle objects as its capacity allows.
    pub fn release(&self, item: T) {
        let rejected = {
            let mut state = self.inner.state.lock();
            state.outstanding = state.outstanding.saturating_sub(1);

            if state.closed || state.idle.len() >= self.inner.config.capacity.get() {
                Some(item)
            } else {
                state.idle.push(item);
                None
            }
        };

        if let Some(item) = rejected {
            trace!(object_type = type_name::<T>(), "released object discarded");
            (self.inner.cleaner)(item);
        }
    }

    /// Closes the pool, handing every idle object to the cleaner.
    ///
    /// Closing an already closed pool is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::OutstandingObjects`] if the pool uses
    /// [`ClosePolicy::MustNotHaveOutstanding`] and objects are still checked out. The pool
    /// remains open in that case.
    pub fn close(&self) -> Result<(), PoolError> {
        self.begin_close()?.run();
        Ok(())
    }

    /// Marks the pool closed and takes its idle objects out, leaving the cleaner calls to the
    /// caller. The returned cleanup must be run once the caller holds no locks.
    pub(crate) fn begin_close(&self) -> Result<PendingCleanup, PoolError> {
        let idle = {
            let mut state = self.inner.state.lock();

            if state.closed {
                return Ok(PendingCleanup::none());
            }

            if self.inner.config.close_policy == ClosePolicy::MustNotHaveOutstanding
                && state.outstanding > 0
            {
                return Err(PoolError::OutstandingObjects {
                    object_type: type_name::<T>(),
                    count: state.outstanding,
                });
            }

            state.closed = true;
            mem::take(&mut state.idle)
        };

        trace!(
            object_type = type_name::<T>(),
            idle = idle.len(),
            "closing pool"
        );

        let inner = Arc::clone(&self.inner);

        Ok(PendingCleanup::new(move || {
            for item in idle {
                (inner.cleaner)(item);
            }
        }))
    }
}

impl<T> ObjectPool<T> {
    /// The configuration the pool was created with.
    #[must_use]
    pub fn config(&self) -> PoolConfig {
        self.inner.config
    }

    /// The number of idle objects currently held by the pool.
    #[must_use]
    pub fn idle_len(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// The number of objects acquired from the pool and not yet released.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().outstanding
    }

    /// Whether [`close()`][Self::close] has completed successfully.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();

        f.debug_struct("ObjectPool")
            .field("object_type", &format_args!("{}", type_name::<T>()))
            .field("config", &self.inner.config)
            .field("idle", &state.idle.len())
            .field("outstanding", &state.outstanding)
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

impl<T> Drop for PoolInner<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();

        if state.closed {
            return;
        }

        for item in state.idle.drain(..) {
            (self.cleaner)(item);
        }
    }
}

/// Idle objects taken out of a closed pool that still have to be handed to its cleaner.
///
/// Cleaners are user code. Closing a context only collects these while its locks are held and
/// runs them afterwards, so a cleaner may freely call back into the context or the manager.
#[must_use]
pub(crate) struct PendingCleanup {
    run: Option<Box<dyn FnOnce() + Send>>,
}

impl PendingCleanup {
    fn new(run: impl FnOnce() + Send + 'static) -> Self {
        Self {
            run: Some(Box::new(run)),
        }
    }

    fn none() -> Self {
        Self { run: None }
    }

    pub(crate) fn run(self) {
        if let Some(run) = self.run {
            run();
        }
    }

    pub(crate) fn run_all(cleanups: impl IntoIterator<Item = Self>) {
        for cleanup in cleanups {
            cleanup.run();
        }
    }
}

impl fmt::Debug for PendingCleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("pending", &self.run.is_some())
            .finish()
    }
}

/// The capabilities a [`Context`][crate::Context] needs from a pool, independent of the type of
/// object stored in it.
pub(crate) trait ErasedPool: Send + Sync + fmt::Debug {
    fn object_type(&self) -> ObjectType;

    fn acquire_boxed(&self) -> Option<Box<dyn Any + Send>>;

    /// Hands the object back if it is not of the pool's object type.
    fn release_boxed(&self, item: Box<dyn Any + Send>) -> Result<(), Box<dyn Any + Send>>;

    fn begin_close(&self) -> Result<PendingCleanup, PoolError>;

    fn as_any(&self) -> &dyn Any;
}

impl<T> ErasedPool for ObjectPool<T>
where
    T: Send + 'static,
{
    fn object_type(&self) -> ObjectType {
        ObjectType::of::<T>()
    }

    fn acquire_boxed(&self) -> Option<Box<dyn Any + Send>> {
        self.acquire()
            .map(|item| Box::new(item) as Box<dyn Any + Send>)
    }

    fn release_boxed(&self, item: Box<dyn Any + Send>) -> Result<(), Box<dyn Any + Send>> {
        let item = item.downcast::<T>()?;
        self.release(*item);
        Ok(())
    }

    fn begin_close(&self) -> Result<PendingCleanup, PoolError> {
        Self::begin_close(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(ObjectPool<Vec<u8>>: Send, Sync, Clone);
    assert_impl_all!(PoolError: Send, Sync);

    fn counting_pool(
        config: PoolConfig,
    ) -> (ObjectPool<Vec<u8>>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let allocated = Arc::new(AtomicUsize::new(0));
        let cleaned = Arc::new(AtomicUsize::new(0));

        let pool = ObjectPool::new(
            config,
            {
                let allocated = Arc::clone(&allocated);
                move || {
                    allocated.fetch_add(1, Ordering::Relaxed);
                    Vec::with_capacity(16)
                }
            },
            {
                let cleaned = Arc::clone(&cleaned);
                move |_| {
                    cleaned.fetch_add(1, Ordering::Relaxed);
                }
            },
        )
        .unwrap();

        (pool, allocated, cleaned)
    }

    #[test]
    fn released_objects_are_reused() {
        let (pool, allocated, _) = counting_pool(PoolConfig::new());

        let first = pool.acquire().unwrap();
        pool.release(first);
        let _second = pool.acquire().unwrap();

        assert_eq!(allocated.load(Ordering::Relaxed), 1);
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn prewarm_allocates_up_front() {
        let (pool, allocated, _) = counting_pool(PoolConfig::new().prewarm(3));

        assert_eq!(allocated.load(Ordering::Relaxed), 3);
        assert_eq!(pool.idle_len(), 3);
    }

    #[test]
    fn prewarm_beyond_capacity_is_rejected() {
        let result = ObjectPool::new(
            PoolConfig::new().capacity(NonZero::new(2).unwrap()).prewarm(3),
            || 0_u32,
            |_| {},
        );

        assert!(matches!(result, Err(PoolError::InvalidConfig { .. })));
    }

    #[test]
    fn release_beyond_capacity_runs_cleaner() {
        let (pool, _, cleaned) =
            counting_pool(PoolConfig::new().capacity(NonZero::new(1).unwrap()));

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(a);
        pool.release(b);

        assert_eq!(pool.idle_len(), 1);
        assert_eq!(cleaned.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn close_cleans_idle_objects_and_is_idempotent() {
        let (pool, _, cleaned) = counting_pool(PoolConfig::new().prewarm(2));

        pool.close().unwrap();
        pool.close().unwrap();

        assert!(pool.is_closed());
        assert_eq!(pool.idle_len(), 0);
        assert_eq!(cleaned.load(Ordering::Relaxed), 2);
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn release_after_close_runs_cleaner() {
        let (pool, _, cleaned) = counting_pool(PoolConfig::new());

        let item = pool.acquire().unwrap();
        pool.close().unwrap();
        pool.release(item);

        assert_eq!(cleaned.load(Ordering::Relaxed), 1);
        assert_eq!(pool.idle_len(), 0);
    }

    #[test]
    fn strict_close_policy_refuses_outstanding_objects() {
        let (pool, _, _) = counting_pool(
            PoolConfig::new().close_policy(ClosePolicy::MustNotHaveOutstanding),
        );

        let item = pool.acquire().unwrap();

        assert!(matches!(
            pool.close(),
            Err(PoolError::OutstandingObjects { count: 1, .. })
        ));
        assert!(!pool.is_closed());

        pool.release(item);
        pool.close().unwrap();
        assert!(pool.is_closed());
    }

    #[test]
    fn dropping_unclosed_pool_cleans_idle_objects() {
        let (pool, _, cleaned) = counting_pool(PoolConfig::new().prewarm(2));

        drop(pool);

        assert_eq!(cleaned.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn erased_release_rejects_foreign_types() {
        let (pool, _, _) = counting_pool(PoolConfig::new());
        let erased: &dyn ErasedPool = &pool;

        let foreign: Box<dyn Any + Send> = Box::new("not a buffer".to_string());
        let rejected = erased.release_boxed(foreign).unwrap_err();
        assert!(rejected.is::<String>());

        let own = erased.acquire_boxed().unwrap();
        erased.release_boxed(own).unwrap();
        assert_eq!(pool.idle_len(), 1);
    }

    #[test]
    fn begin_close_defers_cleaner_until_run() {
        let (pool, _, cleaned) = counting_pool(PoolConfig::new().prewarm(3));

        let cleanup = pool.begin_close().unwrap();

        assert!(pool.is_closed());
        assert_eq!(pool.idle_len(), 0);
        assert_eq!(cleaned.load(Ordering::Relaxed), 0);

        cleanup.run();
        assert_eq!(cleaned.load(Ordering::Relaxed), 3);

        // Already closed, so there is nothing left to clean.
        pool.begin_close().unwrap().run();
        assert_eq!(cleaned.load(Ordering::Relaxed), 3);
    }
}
