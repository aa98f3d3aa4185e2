use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use crate::{Error, Result};

/// Names a class of memory context, e.g. `"http-request"` or `"batch-job"`.
///
/// The [`ContextManager`][crate::ContextManager] keeps at most one top-level context per
/// context type. Children inherit the context type of their parent unless they were built
/// separately and attached via [`Context::register_child()`][crate::Context::register_child].
///
/// The key is never empty. Cloning is cheap (the string is shared).
///
/// # Example
///
/// ```rust
/// use memctx::ContextType;
///
/// let context_type = ContextType::new("http-request").unwrap();
/// assert_eq!(context_type.as_str(), "http-request");
///
/// assert!(ContextType::new("").is_err());
/// ```
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ContextType {
    name: Arc<str>,
}

impl ContextType {
    /// Creates a context type key from a name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidContextType`] if the name is empty.
    pub fn new(name: impl AsRef<str>) -> Result<Self> {
        let name = name.as_ref();

        if name.is_empty() {
            return Err(Error::InvalidContextType);
        }

        Ok(Self {
            name: Arc::from(name),
        })
    }

    /// The name of the context type.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContextType").field(&&*self.name).finish()
    }
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Borrow<str> for ContextType {
    fn borrow(&self) -> &str {
        &self.name
    }
}

impl AsRef<str> for ContextType {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl TryFrom<&str> for ContextType {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for ContextType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}
