use std::any::{Any, type_name};
use std::fmt;
use std::mem;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use foldhash::{HashMap, HashMapExt};
use parking_lot::{ReentrantMutex, RwLock};
use tracing::{debug, warn};

use crate::pool::{ErasedPool, PendingCleanup};
use crate::{ContextType, Error, ObjectPool, ObjectType, PoolConfig, Result};

/// A scope that owns typed object pools and child scopes.
///
/// A context is either a top-level context handed out by a
/// [`ContextManager`][crate::ContextManager], a child created through
/// [`create_child()`][Self::create_child], or a detached context created with
/// [`new()`][Self::new] and later attached to a parent via
/// [`register_child()`][Self::register_child].
///
/// This type is a cloneable handle. All clones refer to the same context, so closing the context
/// through one clone is observed through every other clone.
///
/// # Closing
///
/// [`close()`][Self::close] closes every pool, then every child (recursively), then marks the
/// context closed. After that, creating pools or children fails with
/// [`Error::ContextClosed`], acquiring returns nothing and releasing returns `false`.
///
/// # Example
///
/// ```rust
/// use memctx::{Context, ContextType, PoolConfig};
///
/// let context = Context::new(ContextType::new("batch-job").unwrap());
/// context
///     .create_pool(PoolConfig::new(), || String::with_capacity(64), |_| {})
///     .unwrap();
///
/// let mut text = context.acquire::<String>().unwrap();
/// text.push_str("row 1");
/// text.clear();
/// assert!(context.release(text));
///
/// context.close().unwrap();
/// assert!(context.acquire::<String>().is_none());
/// ```
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    context_type: ContextType,
    created_at: Instant,

    /// Set at most once, either at creation or when first attached to a parent.
    parent: OnceLock<Weak<ContextInner>>,

    /// Held for the whole of a close, so closes of one context never interleave.
    close_gate: ReentrantMutex<()>,

    state: RwLock<ContextState>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lifecycle {
    Open,

    /// A close is in progress. No new pools or children may be added. Goes back to `Open` if
    /// the close fails.
    Closing,

    Closed,
}

struct ContextState {
    lifecycle: Lifecycle,
    active: bool,
    reference_count: u32,
    last_used: Instant,
    children: Vec<Context>,
    pools: HashMap<ObjectType, Arc<dyn ErasedPool>>,
}

impl Context {
    /// Creates a detached context with no parent, no references and no pools.
    ///
    /// Detached contexts are not known to any manager. Attach one to a parent with
    /// [`register_child()`][Self::register_child] to have it closed together with the parent.
    #[must_use]
    pub fn new(context_type: ContextType) -> Self {
        Self::with_parent(context_type, None)
    }

    fn with_parent(context_type: ContextType, parent: Option<&Self>) -> Self {
        let now = Instant::now();

        let parent_slot = parent.map_or_else(OnceLock::new, |parent| {
            OnceLock::from(Arc::downgrade(&parent.inner))
        });

        Self {
            inner: Arc::new(ContextInner {
                context_type,
                created_at: now,
                parent: parent_slot,
                close_gate: ReentrantMutex::new(()),
                state: RwLock::new(ContextState {
                    lifecycle: Lifecycle::Open,
                    active: false,
                    reference_count: 0,
                    last_used: now,
                    children: Vec::new(),
                    pools: HashMap::new(),
                }),
            }),
        }
    }

    /// Creates a top-level context that starts out with one reference held by its creator.
    pub(crate) fn new_acquired(context_type: ContextType) -> Self {
        let context = Self::new(context_type);

        {
            let mut state = context.inner.state.write();
            state.reference_count = 1;
            state.active = true;
        }

        context
    }

    /// Creates a child context with the same context type and registers it as owned by this
    /// context.
    ///
    /// The child starts with no references and is inactive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContextClosed`] if this context is closed or being closed.
    pub fn create_child(&self) -> Result<Self> {
        let mut state = self.inner.state.write();

        if state.lifecycle != Lifecycle::Open {
            return Err(Error::ContextClosed);
        }

        let child = Self::with_parent(self.inner.context_type.clone(), Some(self));
        state.children.push(child.clone());

        debug!(
            context_type = %self.inner.context_type,
            children = state.children.len(),
            "created child context"
        );

        Ok(child)
    }

    /// Registers an already constructed context, possibly of a different context type, as a
    /// child owned by this context.
    ///
    /// If the child has no parent yet, this context becomes its parent.
    ///
    /// A closed context owns no children, so a child registered with a context that is closed
    /// or being closed is closed right away instead of being attached. Registering a context
    /// under itself or under one of its own descendants is ignored.
    pub fn register_child(&self, child: Self) {
        if self.is_self_or_descendant_of(&child) {
            warn!(
                context_type = %self.inner.context_type,
                child_type = %child.inner.context_type,
                "ignoring child registration that would create a cycle"
            );
            return;
        }

        {
            let mut state = self.inner.state.write();

            if state.lifecycle == Lifecycle::Open {
                // A child that already has a parent keeps it; the first owner wins.
                drop(child.inner.parent.set(Arc::downgrade(&self.inner)));
                state.children.push(child);
                return;
            }
        }

        warn!(
            context_type = %self.inner.context_type,
            child_type = %child.inner.context_type,
            "closing child registered with a closed context"
        );

        if let Err(error) = child.close() {
            warn!(
                child_type = %child.inner.context_type,
                %error,
                "failed to close child registered with a closed context"
            );
        }
    }

    fn is_self_or_descendant_of(&self, candidate: &Self) -> bool {
        let mut current = Some(Arc::clone(&self.inner));

        while let Some(node) = current {
            if Arc::ptr_eq(&node, &candidate.inner) {
                return true;
            }

            current = node.parent.get().and_then(Weak::upgrade);
        }

        false
    }

    /// Creates a pool for objects of type `T`, replacing (and closing) any pool this context
    /// already had for that type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContextClosed`] if this context is closed or being closed, and
    /// [`Error::PoolCreate`] if the pool rejects its configuration.
    pub fn create_pool<T, A, C>(&self, config: PoolConfig, allocator: A, cleaner: C) -> Result<()>
    where
        T: Send + 'static,
        A: Fn() -> T + Send + Sync + 'static,
        C: Fn(T) + Send + Sync + 'static,
    {
        // Prewarming runs the allocator, so the pool is built before taking the lock. If the
        // context turns out to be closed, the unused pool cleans up after itself when dropped.
        let pool = ObjectPool::new(config, allocator, cleaner)
            .map_err(|source| Error::PoolCreate { source })?;

        let replaced = {
            let mut state = self.inner.state.write();

            if state.lifecycle != Lifecycle::Open {
                drop(state);
                drop(pool);
                return Err(Error::ContextClosed);
            }

            state.pools.insert(ObjectType::of::<T>(), Arc::new(pool))
        };

        debug!(
            context_type = %self.inner.context_type,
            object_type = type_name::<T>(),
            replaced = replaced.is_some(),
            "created pool"
        );

        if let Some(replaced) = replaced {
            if let Err(error) = replaced.begin_close().map(PendingCleanup::run) {
                warn!(
                    context_type = %self.inner.context_type,
                    object_type = type_name::<T>(),
                    %error,
                    "failed to close replaced pool"
                );
            }
        }

        Ok(())
    }

    /// Takes an object of type `T` from this context's pool for that type.
    ///
    /// Returns `None` if the context is closed, has no pool for `T` or the pool is closed.
    ///
    /// This does not count as using the context for idle reclamation purposes. Only sharing
    /// and returning the context through the manager refreshes its last-used time.
    #[must_use]
    pub fn acquire<T>(&self) -> Option<T>
    where
        T: Send + 'static,
    {
        self.try_acquire().ok()
    }

    /// Takes an object of type `T` from this context's pool for that type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContextClosed`] if the context is closed, [`Error::PoolNotFound`] if
    /// it has no pool for `T` and [`Error::PoolClosed`] if that pool has been closed.
    pub fn try_acquire<T>(&self) -> Result<T>
    where
        T: Send + 'static,
    {
        let pool = {
            let state = self.inner.state.read();

            if state.lifecycle == Lifecycle::Closed {
                return Err(Error::ContextClosed);
            }

            typed_pool::<T>(&state)
                .cloned()
                .ok_or(Error::PoolNotFound {
                    object_type: type_name::<T>(),
                })?
        };

        // The allocator may run here, so the context lock is already released.
        pool.acquire().ok_or(Error::PoolClosed {
            object_type: type_name::<T>(),
        })
    }

    /// Returns an object to this context's pool for type `T`.
    ///
    /// Returns `false` (and drops the object) if the context is closed or has no pool for `T`.
    pub fn release<T>(&self, item: T) -> bool
    where
        T: Send + 'static,
    {
        let pool = {
            let state = self.inner.state.read();

            if state.lifecycle == Lifecycle::Closed {
                return false;
            }

            typed_pool::<T>(&state).cloned()
        };

        let Some(pool) = pool else {
            return false;
        };

        // May hand the object to the cleaner, so this happens without the context lock.
        pool.release(item);
        true
    }

    /// Takes an object from the pool registered for `object_type`, without static typing.
    ///
    /// Returns `None` under the same conditions as [`acquire()`][Self::acquire].
    #[must_use]
    pub fn acquire_erased(&self, object_type: ObjectType) -> Option<Box<dyn Any + Send>> {
        let pool = self.erased_pool(object_type)?;
        pool.acquire_boxed()
    }

    /// Returns a dynamically typed object to the pool registered for `object_type`.
    ///
    /// Returns `false` if the context is closed, if there is no pool for `object_type` or if
    /// the object is not actually of that type. A mismatched object is never placed into the
    /// pool.
    pub fn release_erased(&self, object_type: ObjectType, item: Box<dyn Any + Send>) -> bool {
        let Some(pool) = self.erased_pool(object_type) else {
            return false;
        };

        if !pool.object_type().matches(item.as_ref()) {
            debug!(
                context_type = %self.inner.context_type,
                object_type = %object_type,
                "refusing to release object of a different type"
            );
            return false;
        }

        pool.release_boxed(item).is_ok()
    }

    fn erased_pool(&self, object_type: ObjectType) -> Option<Arc<dyn ErasedPool>> {
        let state = self.inner.state.read();

        if state.lifecycle == Lifecycle::Closed {
            return None;
        }

        state.pools.get(&object_type).cloned()
    }

    /// Returns a handle to this context's pool for type `T`, if there is one.
    ///
    /// Unlike the other accessors, this takes the context lock exclusively: the returned handle
    /// lives outside of the context's own synchronization, so handing it out is serialized with
    /// every other state change of the context.
    ///
    /// Returns `None` once the context is closed.
    #[must_use]
    pub fn get_pool<T>(&self) -> Option<ObjectPool<T>>
    where
        T: Send + 'static,
    {
        let state = self.inner.state.write();
        typed_pool::<T>(&state).cloned()
    }

    /// Whether this context has a pool for objects of type `T`.
    #[must_use]
    pub fn has_pool<T>(&self) -> bool
    where
        T: Send + 'static,
    {
        self.inner
            .state
            .read()
            .pools
            .contains_key(&ObjectType::of::<T>())
    }

    /// Closes every pool and every child of this context, then marks it closed.
    ///
    /// Closing an already closed context is a no-op. If another thread is closing the context
    /// at the same time, this waits for that close to finish. If it failed, this attempts the
    /// close again and reports its own outcome, so `Ok` always means the context and all of its
    /// descendants are closed.
    ///
    /// Pool cleaners run after every lock of this context and its descendants is released, so
    /// they may call back into the context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolClose`] or [`Error::ChildClose`] for the first pool or child that
    /// fails to close. Closing stops at that point: pools and children visited earlier are
    /// released, later ones are untouched, and the context stays open. Retrying is safe because
    /// closing is idempotent at every level.
    pub fn close(&self) -> Result<()> {
        let mut cleanups = Vec::new();
        let result = self.close_deferring_cleanup(&mut cleanups);

        PendingCleanup::run_all(cleanups);

        result
    }

    /// Closes the context like [`close()`][Self::close] but appends the cleaner work of every
    /// closed pool to `cleanups` instead of running it. Callers that hold other locks (the
    /// manager registry) run the cleanups once those are released.
    pub(crate) fn close_deferring_cleanup(
        &self,
        cleanups: &mut Vec<PendingCleanup>,
    ) -> Result<()> {
        let _gate = self.inner.close_gate.lock();

        let children = {
            let mut guard = self.inner.state.write();
            let state = &mut *guard;

            match state.lifecycle {
                Lifecycle::Open => {}
                // Only the gate holder ever sees `Closing`, so this is a close of the same
                // context further up our own stack. That outer close finishes the job.
                Lifecycle::Closing | Lifecycle::Closed => return Ok(()),
            }

            state.lifecycle = Lifecycle::Closing;

            // Stops at the first pool that fails to close.
            for pool in state.pools.values() {
                match pool.begin_close() {
                    Ok(cleanup) => cleanups.push(cleanup),
                    Err(source) => {
                        state.lifecycle = Lifecycle::Open;
                        return Err(Error::PoolClose { source });
                    }
                }
            }

            state.children.clone()
        };

        // Each child takes its own gate and lock; ours is not held while the subtree closes.
        for child in &children {
            if let Err(error) = child.close_deferring_cleanup(cleanups) {
                self.inner.state.write().lifecycle = Lifecycle::Open;
                return Err(Error::ChildClose {
                    source: Box::new(error),
                });
            }
        }

        let mut state = self.inner.state.write();
        state.lifecycle = Lifecycle::Closed;
        state.active = false;
        state.reference_count = 0;
        let pools = mem::take(&mut state.pools);
        let children = mem::take(&mut state.children);
        drop(state);

        debug!(
            context_type = %self.inner.context_type,
            pools = pools.len(),
            children = children.len(),
            "closed context"
        );

        // These may be the last handles, so they go away without the lock held.
        drop(pools);
        drop(children);

        Ok(())
    }

    /// Adds one shared reference. Fails if the context is closed or `limit` references are
    /// already held (a limit of zero means unbounded).
    pub(crate) fn add_reference(&self, limit: u32) -> Result<u32> {
        let mut state = self.inner.state.write();

        if state.lifecycle == Lifecycle::Closed {
            return Err(Error::ContextClosed);
        }

        if limit > 0 && state.reference_count >= limit {
            return Err(Error::MaxReferencesReached {
                context_type: self.inner.context_type.clone(),
                max_references: limit,
            });
        }

        state.reference_count = state.reference_count.saturating_add(1);
        state.active = state.reference_count > 0;
        state.last_used = Instant::now();

        Ok(state.reference_count)
    }

    /// Drops one shared reference, never going below zero.
    pub(crate) fn remove_reference(&self) -> Result<u32> {
        let mut state = self.inner.state.write();

        if state.lifecycle == Lifecycle::Closed {
            return Err(Error::ContextClosed);
        }

        state.reference_count = state.reference_count.saturating_sub(1);
        state.active = state.reference_count > 0;
        state.last_used = Instant::now();

        Ok(state.reference_count)
    }

    pub(crate) fn is_open_and_active(&self) -> bool {
        let state = self.inner.state.read();

        state.lifecycle != Lifecycle::Closed && state.active
    }

    /// Whether the context is unreferenced and has not been used for longer than `max_idle`.
    pub(crate) fn is_idle_longer_than(&self, max_idle: Duration, now: Instant) -> bool {
        let state = self.inner.state.read();

        !state.active && now.saturating_duration_since(state.last_used) > max_idle
    }

    /// The context type this context was created with.
    #[must_use]
    pub fn context_type(&self) -> &ContextType {
        &self.inner.context_type
    }

    /// The number of shared references currently held.
    #[must_use]
    pub fn reference_count(&self) -> u32 {
        self.inner.state.read().reference_count
    }

    /// Whether at least one shared reference is currently held.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.state.read().active
    }

    /// Whether the context has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.read().lifecycle == Lifecycle::Closed
    }

    /// When the context was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    /// When the context was last shared or returned through the manager.
    #[must_use]
    pub fn last_used(&self) -> Instant {
        self.inner.state.read().last_used
    }

    /// How long ago the context was last shared or returned through the manager.
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.last_used().elapsed()
    }

    /// The parent of this context, if it has one and the parent still exists.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.inner
            .parent
            .get()
            .and_then(Weak::upgrade)
            .map(|inner| Self { inner })
    }

    /// Handles to the children currently owned by this context.
    #[must_use]
    pub fn children(&self) -> Vec<Self> {
        self.inner.state.read().children.clone()
    }

    /// The number of children currently owned by this context.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.inner.state.read().children.len()
    }

    /// The number of pools currently owned by this context.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.inner.state.read().pools.len()
    }

    /// Whether both handles refer to the same context.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn typed_pool<T>(state: &ContextState) -> Option<&ObjectPool<T>>
where
    T: Send + 'static,
{
    state
        .pools
        .get(&ObjectType::of::<T>())?
        .as_any()
        .downcast_ref::<ObjectPool<T>>()
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();

        f.debug_struct("Context")
            .field("context_type", &self.inner.context_type)
            .field("lifecycle", &state.lifecycle)
            .field("reference_count", &state.reference_count)
            .field("active", &state.active)
            .field("children", &state.children.len())
            .field("pools", &state.pools.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
