use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A runtime type identifier used to look up decoders, encoders and transformations.
///
/// Equality and hashing only consider the [`TypeId`]. The name is the fully qualified
/// Rust type name and is used for cache key material and diagnostics.
#[derive(Clone, Copy)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    pub fn of<T: Any + ?Sized>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is<T: Any + ?Sized>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeTag {}

impl Hash for TypeTag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
