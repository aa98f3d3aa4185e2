use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use foldhash::{HashMap, HashMapExt};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::pool::PendingCleanup;
use crate::reaper::Reaper;
use crate::{
    Context, ContextLease, ContextManagerBuilder, ContextType, Error, ManagerConfig, Result,
};

pub(crate) struct ManagerInner {
    config: ManagerConfig,
    registry: RwLock<Registry>,
}

struct Registry {
    contexts: HashMap<ContextType, Context>,
    closed: bool,
}

impl ManagerInner {
    pub(crate) fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            registry: RwLock::new(Registry {
                contexts: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Closes and unregisters one top-level context. The caller already holds the registry
    /// lock, which is what lets the reaper and shutdown use this without re-locking.
    ///
    /// Pool cleaners are appended to `cleanups`; the caller runs them after releasing the
    /// registry lock.
    fn close_locked(
        &self,
        registry: &mut Registry,
        context_type: &ContextType,
        cleanups: &mut Vec<PendingCleanup>,
    ) -> Result<()> {
        let context = registry
            .contexts
            .get(context_type)
            .ok_or_else(|| Error::ContextNotFound {
                context_type: context_type.clone(),
            })?;

        // New references are only handed out under the registry lock we are holding,
        // so the count can only go down from here.
        let references = context.reference_count();
        if references > 0 {
            return Err(Error::ContextInUse {
                context_type: context_type.clone(),
                references,
            });
        }

        context
            .close_deferring_cleanup(cleanups)
            .map_err(|error| Error::CloseContext {
                context_type: context_type.clone(),
                source: Box::new(error),
            })?;

        registry.contexts.remove(context_type);

        debug!(%context_type, remaining = registry.contexts.len(), "closed top-level context");

        Ok(())
    }

    /// Closes every unreferenced top-level context that has been idle for longer than the
    /// configured threshold. Returns how many were closed.
    ///
    /// A context that fails to close is logged and skipped; it does not stop the scan.
    pub(crate) fn reap_idle(&self) -> Result<usize> {
        let mut cleanups = Vec::new();
        let mut reaped: usize = 0;

        {
            let mut registry = self.registry.write();

            if registry.closed {
                return Err(Error::ContextManagerClosed);
            }

            let now = Instant::now();
            let max_idle = self.config.max_idle_time();

            let idle: Vec<ContextType> = registry
                .contexts
                .iter()
                .filter(|(_, context)| context.is_idle_longer_than(max_idle, now))
                .map(|(context_type, _)| context_type.clone())
                .collect();

            for context_type in idle {
                match self.close_locked(&mut registry, &context_type, &mut cleanups) {
                    Ok(()) => {
                        debug!(%context_type, "reaped idle context");
                        reaped = reaped.saturating_add(1);
                    }
                    Err(error) => {
                        warn!(%context_type, %error, "failed to close idle context");
                    }
                }
            }
        }

        PendingCleanup::run_all(cleanups);

        Ok(reaped)
    }
}

impl fmt::Debug for ManagerInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.read();

        f.debug_struct(type_name::<Self>())
            .field("config", &self.config)
            .field("contexts", &registry.contexts.len())
            .field("closed", &registry.closed)
            .finish()
    }
}

/// Hands out shared, reference-counted [`Context`]s keyed by [`ContextType`].
///
/// There is at most one top-level context per context type. The first caller to ask for a
/// context type gets a fresh context with a reference count of one; later callers share the same
/// context and increment its reference count, up to the configured ceiling. Callers return their
/// reference when done, either explicitly via [`return_context()`][Self::return_context] or by
/// dropping the [`ContextLease`] obtained from [`acquire()`][Self::acquire].
///
/// An unreferenced context stays registered until it is closed explicitly via
/// [`close()`][Self::close] or closed by the background reaper once it has been idle for longer
/// than the configured threshold.
///
/// # Idle tracking
///
/// A context counts as used only when it is shared or returned through the manager. Acquiring
/// or releasing objects from its pools does not refresh its idle time, so a context whose only
/// remaining activity is object checkouts by callers that already returned the context may be
/// reaped.
///
/// # Shutdown
///
/// [`shutdown()`][Self::shutdown] stops the reaper and closes every registered context.
/// Dropping a manager without shutting it down stops the reaper but leaves the contexts to be
/// released when their last handle is dropped.
///
/// # Example
///
/// ```rust
/// use memctx::{ContextManager, PoolConfig};
///
/// let manager = ContextManager::new();
///
/// let (context, was_existing) = manager.get_or_create("http-request").unwrap();
/// assert!(!was_existing);
///
/// context
///     .create_pool(PoolConfig::new(), || Vec::<u8>::with_capacity(4096), |_| {})
///     .unwrap();
///
/// let buffer = context.acquire::<Vec<u8>>().unwrap();
/// context.release(buffer);
///
/// manager.return_context(&context).unwrap();
/// manager.close("http-request").unwrap();
/// manager.shutdown().unwrap();
/// ```
pub struct ContextManager {
    inner: Arc<ManagerInner>,
    reaper: Mutex<Option<Reaper>>,
}

impl ContextManager {
    /// Creates a manager with the default configuration.
    ///
    /// The background reaper starts immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    /// Creates a builder for configuring the manager.
    pub fn builder() -> ContextManagerBuilder {
        ContextManagerBuilder::new()
    }

    /// Creates a manager with the given configuration, starting the background reaper unless
    /// the cleanup interval is zero.
    #[must_use]
    pub fn with_config(config: ManagerConfig) -> Self {
        let inner = Arc::new(ManagerInner::new(config));

        let reaper = config
            .reaper_enabled()
            .then(|| Reaper::start(Arc::downgrade(&inner), config.cleanup_interval()));

        debug!(
            max_references = config.max_references(),
            max_idle_time = ?config.max_idle_time(),
            cleanup_interval = ?config.cleanup_interval(),
            "created context manager"
        );

        Self {
            inner,
            reaper: Mutex::new(reaper),
        }
    }

    /// The configuration of this manager.
    #[must_use]
    pub fn config(&self) -> ManagerConfig {
        self.inner.config
    }

    /// Returns the top-level context for `context_type`, creating it if necessary.
    ///
    /// The second element of the returned tuple is `false` if the context was just created
    /// (with a reference count of one) and `true` if an existing context was shared (and its
    /// reference count incremented). Either way the caller now holds one reference, which it
    /// must give back via [`return_context()`][Self::return_context].
    ///
    /// Concurrent callers asking for the same new context type never both create it: one
    /// creates, the others share.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidContextType`] if `context_type` is empty.
    /// * [`Error::ContextManagerClosed`] if the manager has been shut down.
    /// * [`Error::ContextClosed`] if the registered context has been closed.
    /// * [`Error::MaxReferencesReached`] if the context already has as many references as the
    ///   configured ceiling allows.
    pub fn get_or_create(&self, context_type: impl AsRef<str>) -> Result<(Context, bool)> {
        let context_type = ContextType::new(context_type)?;

        let mut registry = self.inner.registry.write();

        if registry.closed {
            return Err(Error::ContextManagerClosed);
        }

        if let Some(context) = registry.contexts.get(&context_type) {
            let references = context.add_reference(self.inner.config.max_references())?;

            debug!(%context_type, references, "shared existing context");

            return Ok((context.clone(), true));
        }

        let context = Context::new_acquired(context_type.clone());
        registry.contexts.insert(context_type.clone(), context.clone());

        debug!(%context_type, "created top-level context");

        Ok((context, false))
    }

    /// Like [`get_or_create()`][Self::get_or_create] but returns a guard that gives the
    /// reference back when dropped.
    ///
    /// # Errors
    ///
    /// Same as [`get_or_create()`][Self::get_or_create].
    ///
    /// # Example
    ///
    /// ```rust
    /// use memctx::ContextManager;
    ///
    /// let manager = ContextManager::new();
    ///
    /// {
    ///     let lease = manager.acquire("batch-job").unwrap();
    ///     assert_eq!(lease.reference_count(), 1);
    /// }
    ///
    /// // The lease returned its reference, so the context can be closed.
    /// manager.close("batch-job").unwrap();
    /// # manager.shutdown().unwrap();
    /// ```
    pub fn acquire(&self, context_type: impl AsRef<str>) -> Result<ContextLease> {
        let (context, was_existing) = self.get_or_create(context_type)?;
        Ok(ContextLease::new(context, was_existing))
    }

    /// Gives back one reference to a context obtained from
    /// [`get_or_create()`][Self::get_or_create].
    ///
    /// The reference count never drops below zero. A context whose count reaches zero becomes
    /// inactive but stays registered until it is closed explicitly or reaped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContextClosed`] if the context has already been closed.
    pub fn return_context(&self, context: &Context) -> Result<()> {
        let references = context.remove_reference()?;

        debug!(context_type = %context.context_type(), references, "returned context");

        Ok(())
    }

    /// Closes the top-level context registered for `context_type` and removes it from the
    /// manager. Its pools and all of its descendants are closed too.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidContextType`] if `context_type` is empty.
    /// * [`Error::ContextManagerClosed`] if the manager has been shut down.
    /// * [`Error::ContextNotFound`] if no context is registered for `context_type`.
    /// * [`Error::ContextInUse`] if references to the context are still held.
    /// * [`Error::CloseContext`] if one of its pools or descendants failed to close; the
    ///   context stays registered and may be partially released.
    pub fn close(&self, context_type: impl AsRef<str>) -> Result<()> {
        let context_type = ContextType::new(context_type)?;

        let mut cleanups = Vec::new();

        let result = {
            let mut registry = self.inner.registry.write();

            if registry.closed {
                return Err(Error::ContextManagerClosed);
            }

            self.inner.close_locked(&mut registry, &context_type, &mut cleanups)
        };

        PendingCleanup::run_all(cleanups);

        result
    }

    /// Whether the context is open and currently referenced.
    ///
    /// This does not count as using the context.
    #[must_use]
    pub fn validate(&self, context: &Context) -> bool {
        context.is_open_and_active()
    }

    /// Runs one idle scan immediately, closing every unreferenced context that has been idle
    /// for longer than the configured threshold. Returns how many contexts were closed.
    ///
    /// This is what the background reaper does on every tick; it is also useful when the reaper
    /// is disabled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContextManagerClosed`] if the manager has been shut down.
    pub fn reap_idle(&self) -> Result<usize> {
        self.inner.reap_idle()
    }

    /// Stops the reaper and closes every registered context.
    ///
    /// Contexts that cannot be closed (typically because references to them are still held)
    /// stay registered while the rest are closed. In that case the first error is returned and
    /// the manager remains usable, so shutdown can be retried once the references are returned.
    /// The reaper stays stopped either way.
    ///
    /// # Errors
    ///
    /// * [`Error::ContextManagerClosed`] if the manager has already been shut down.
    /// * [`Error::CloseContext`] if a registered context could not be closed.
    pub fn shutdown(&self) -> Result<()> {
        if self.inner.registry.read().closed {
            return Err(Error::ContextManagerClosed);
        }

        // The reaper must be gone before the registry is torn down. It takes the registry lock
        // on every tick, so we must not hold that lock while waiting for it.
        let reaper = self.reaper.lock().take();
        if let Some(reaper) = reaper {
            reaper.stop();
        }

        let mut registry = self.inner.registry.write();

        if registry.closed {
            return Err(Error::ContextManagerClosed);
        }

        let context_types: Vec<ContextType> = registry.contexts.keys().cloned().collect();
        let mut cleanups = Vec::new();
        let mut first_error = None;

        for context_type in context_types {
            if let Err(error) = self
                .inner
                .close_locked(&mut registry, &context_type, &mut cleanups)
            {
                warn!(%context_type, %error, "context survived manager shutdown");

                let error = match error {
                    error @ Error::CloseContext { .. } => error,
                    other => Error::CloseContext {
                        context_type,
                        source: Box::new(other),
                    },
                };

                first_error.get_or_insert(error);
            }
        }

        // Contexts that survived stay registered so that shutdown can be retried.
        let result = first_error.map_or_else(
            || {
                registry.closed = true;
                Ok(())
            },
            Err,
        );

        drop(registry);

        PendingCleanup::run_all(cleanups);

        if result.is_ok() {
            debug!("context manager shut down");
        }

        result
    }

    /// Whether [`shutdown()`][Self::shutdown] has completed successfully.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.registry.read().closed
    }

    /// The number of registered top-level contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.registry.read().contexts.len()
    }

    /// Whether no top-level context is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.registry.read().contexts.is_empty()
    }

    /// Whether a top-level context is registered for `context_type`.
    #[must_use]
    pub fn contains(&self, context_type: impl AsRef<str>) -> bool {
        self.inner
            .registry
            .read()
            .contexts
            .contains_key(context_type.as_ref())
    }

    /// Looks up the top-level context registered for `context_type` without taking a
    /// reference to it.
    #[must_use]
    pub fn get(&self, context_type: impl AsRef<str>) -> Option<Context> {
        self.inner
            .registry
            .read()
            .contexts
            .get(context_type.as_ref())
            .cloned()
    }

    /// The context types that currently have a registered top-level context, in no particular
    /// order.
    #[must_use]
    pub fn context_types(&self) -> Vec<ContextType> {
        self.inner.registry.read().contexts.keys().cloned().collect()
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("inner", &self.inner)
            .field("reaper_running", &self.reaper.lock().is_some())
            .finish()
    }
}
