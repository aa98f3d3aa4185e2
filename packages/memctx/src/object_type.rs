use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifies the type of object stored in an [`ObjectPool`][crate::ObjectPool].
///
/// A [`Context`][crate::Context] owns at most one pool per object type. Two `ObjectType`
/// values are equal if and only if they were created for the same Rust type.
///
/// # Example
///
/// ```rust
/// use memctx::ObjectType;
///
/// assert_eq!(ObjectType::of::<Vec<u8>>(), ObjectType::of::<Vec<u8>>());
/// assert_ne!(ObjectType::of::<Vec<u8>>(), ObjectType::of::<String>());
/// ```
#[derive(Clone, Copy)]
pub struct ObjectType {
    id: TypeId,
    name: &'static str,
}

impl ObjectType {
    /// The object type tag of `T`.
    #[must_use]
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// The Rust type name, for diagnostics only.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the dynamically typed value is an instance of this object type.
    #[must_use]
    pub fn matches(&self, value: &dyn Any) -> bool {
        value.type_id() == self.id
    }
}

impl PartialEq for ObjectType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ObjectType {}

impl Hash for ObjectType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectType").field(&self.name).finish()
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
