use thiserror::Error;

use crate::{ContextType, PoolError};

/// Errors that can occur when working with memory contexts and their manager.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The caller supplied an empty context type key.
    #[error("invalid context type: the context type key must not be empty")]
    InvalidContextType,

    /// No top-level context is registered under the given key.
    #[error("context not found: no context is registered for type '{context_type}'")]
    ContextNotFound {
        /// The key that was looked up.
        context_type: ContextType,
    },

    /// The context cannot be closed because it still has outstanding references.
    #[error("context '{context_type}' is currently in use by {references} reference(s)")]
    ContextInUse {
        /// The key of the context that is still in use.
        context_type: ContextType,

        /// The reference count observed at the time of the close attempt.
        references: u32,
    },

    /// The operation was attempted on a context that has already been closed.
    #[error("context is closed")]
    ContextClosed,

    /// The operation was attempted on a context manager that has already been shut down.
    #[error("context manager is closed")]
    ContextManagerClosed,

    /// The context already has as many shared references as the manager allows.
    #[error("maximum references reached: context '{context_type}' already has {max_references} reference(s)")]
    MaxReferencesReached {
        /// The key of the context whose ceiling was reached.
        context_type: ContextType,

        /// The configured ceiling.
        max_references: u32,
    },

    /// A configuration value is outside of its allowed range.
    #[error("invalid configuration: {problem}")]
    InvalidConfig {
        /// A human-readable description of the problem.
        problem: String,
    },

    /// The context has no pool for the requested object type.
    #[error("no pool is registered for object type '{object_type}'")]
    PoolNotFound {
        /// The name of the requested object type.
        object_type: &'static str,
    },

    /// The pool for the requested object type has been closed.
    #[error("the pool for object type '{object_type}' is closed")]
    PoolClosed {
        /// The name of the requested object type.
        object_type: &'static str,
    },

    /// The object pool could not be constructed.
    #[error("failed to create pool")]
    PoolCreate {
        /// The error reported by the pool.
        #[source]
        source: PoolError,
    },

    /// One of the pools owned by a context failed to close.
    ///
    /// The context may be partially released: pools visited before the failing one are closed,
    /// the rest are untouched.
    #[error("failed to close pool")]
    PoolClose {
        /// The error reported by the pool.
        #[source]
        source: PoolError,
    },

    /// One of the children of a context failed to close.
    #[error("failed to close child context")]
    ChildClose {
        /// The error reported by the child.
        #[source]
        source: Box<Error>,
    },

    /// A top-level context registered with the manager failed to close.
    #[error("error closing context '{context_type}'")]
    CloseContext {
        /// The key of the context that failed to close.
        context_type: ContextType,

        /// The error reported by the context.
        #[source]
        source: Box<Error>,
    },
}

/// A specialized `Result` type for memory context operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
