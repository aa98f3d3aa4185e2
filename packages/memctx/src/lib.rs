#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Scoped, reference-counted memory contexts that own typed object pools.
//!
//! Long-running programs often create and discard the same kinds of short-lived objects over
//! and over: request buffers, scratch vectors, per-job structures. This package lets such
//! objects be reused through [`ObjectPool`]s grouped into [`Context`]s, where a context is a
//! scope (a request, a batch job) that can be shared between callers, nested and closed as a
//! unit.
//!
//! # Key types
//!
//! * [`ContextManager`] hands out shared top-level contexts keyed by [`ContextType`], counting
//!   references and enforcing a per-context ceiling. A background reaper closes contexts
//!   that nobody references and that have been idle for too long.
//! * [`Context`] owns at most one [`ObjectPool`] per object type and any number of child
//!   contexts. Closing a context closes its pools and, recursively, its children.
//! * [`ContextLease`] is a scoped reference to a top-level context that gives the reference
//!   back to the manager when dropped.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use memctx::{ContextManager, PoolConfig};
//!
//! let manager = ContextManager::builder()
//!     .max_references(8)
//!     .max_idle_time(Duration::from_secs(30))
//!     .build()
//!     .unwrap();
//!
//! {
//!     let request = manager.acquire("http-request").unwrap();
//!
//!     request
//!         .create_pool(PoolConfig::new(), || Vec::<u8>::with_capacity(4096), |_| {})
//!         .unwrap();
//!
//!     // Sub-allocations can be scoped to a child context.
//!     let decode = request.create_child().unwrap();
//!     decode
//!         .create_pool(PoolConfig::new(), || String::with_capacity(256), |_| {})
//!         .unwrap();
//!
//!     let buffer = request.acquire::<Vec<u8>>().unwrap();
//!     let text = decode.acquire::<String>().unwrap();
//!
//!     decode.release(text);
//!     request.context().release(buffer);
//! } // The lease returns its reference here.
//!
//! // Closing the context also closes the child and every pool.
//! manager.close("http-request").unwrap();
//! manager.shutdown().unwrap();
//! ```
//!
//! # Idle reclamation
//!
//! A top-level context whose reference count has dropped to zero stays registered so that it
//! (and the objects pooled in it) can be reused by the next caller. The reaper closes it once
//! it has been unused for longer than the configured idle time. Only sharing and returning the
//! context through the manager counts as use; object checkouts do not.
//!
//! # Logging
//!
//! Lifecycle events are reported through [`tracing`](https://docs.rs/tracing). Failures the
//! reaper cannot surface to a caller are logged at the `warn` level.

mod config;
mod context;
mod context_type;
mod error;
mod lease;
mod manager;
mod object_type;
mod pool;
mod reaper;

pub use config::*;
pub use context::*;
pub use context_type::*;
pub use error::*;
pub use lease::*;
pub use manager::*;
pub(crate) use manager::ManagerInner;
pub use object_type::*;
pub use pool::{ClosePolicy, ObjectPool, PoolConfig, PoolError};
