use std::ops::Deref;

use tracing::debug;

use crate::{Context, Result};

/// One shared reference to a top-level [`Context`], returned to the manager when dropped.
///
/// Obtained from [`ContextManager::acquire()`][crate::ContextManager::acquire]. The lease
/// dereferences to the context, so pools and children can be used through it directly.
///
/// Dropping the lease returns the reference. Use [`release()`][Self::release] instead if you want
/// to observe a failure to return it (which only happens if the context was closed in the
/// meantime).
///
/// # Example
///
/// ```rust
/// use memctx::{ContextManager, PoolConfig};
///
/// let manager = ContextManager::new();
///
/// let lease = manager.acquire("http-request").unwrap();
/// assert!(!lease.was_existing());
///
/// lease
///     .create_pool(PoolConfig::new(), || String::new(), |_| {})
///     .unwrap();
///
/// let shared = manager.acquire("http-request").unwrap();
/// assert!(shared.was_existing());
/// assert_eq!(shared.reference_count(), 2);
///
/// drop(shared);
/// lease.release().unwrap();
///
/// manager.close("http-request").unwrap();
/// # manager.shutdown().unwrap();
/// ```
#[derive(Debug)]
#[must_use = "dropping the lease immediately returns the reference it holds"]
pub struct ContextLease {
    context: Context,
    was_existing: bool,
    returned: bool,
}

impl ContextLease {
    pub(crate) fn new(context: Context, was_existing: bool) -> Self {
        Self {
            context,
            was_existing,
            returned: false,
        }
    }

    /// Whether the context already existed (and was shared) when the lease was taken, as
    /// opposed to having been created for it.
    #[must_use]
    pub fn was_existing(&self) -> bool {
        self.was_existing
    }

    /// The leased context.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Returns the reference now, reporting any failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContextClosed`][crate::Error::ContextClosed] if the context was closed
    /// while the lease was held.
    pub fn release(mut self) -> Result<()> {
        self.returned = true;
        self.context.remove_reference()?;
        Ok(())
    }

    /// Stops tracking the reference, handing the responsibility of returning it to the caller.
    ///
    /// The reference must later be given back via
    /// [`ContextManager::return_context()`][crate::ContextManager::return_context].
    #[must_use]
    pub fn into_context(mut self) -> Context {
        self.returned = true;
        self.context.clone()
    }
}

impl Deref for ContextLease {
    type Target = Context;

    fn deref(&self) -> &Self::Target {
        &self.context
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        if self.returned {
            return;
        }

        if let Err(error) = self.context.remove_reference() {
            debug!(
                context_type = %self.context.context_type(),
                %error,
                "lease dropped after its context was closed"
            );
        }
    }
}
