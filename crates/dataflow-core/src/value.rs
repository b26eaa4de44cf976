use std::any::{Any, TypeId};
use std::fmt::Debug;

/// A type-erased value that flows across a port: a message payload, a `set_data`
/// write, or a retained default. Carries its [`TypeId`] so the engine can check it
/// against a port's declared value type without the collaborator's concrete type.
pub struct AnyValue {
    type_id: TypeId,
    type_name: &'static str,
    value: Box<dyn Any + Send + Sync>,
}

impl AnyValue {
    /// `Send + Sync` rather than just `Send`: a `set_data` value may end up
    /// installed directly into a render port cell, which kernels on other
    /// threads read through a shared `Arc<RwLock<..>>`.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            value: Box::new(value),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        if self.is::<T>() {
            Ok(*self.value.downcast::<T>().unwrap())
        } else {
            Err(self)
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Unwraps into the raw opaque box, for installing directly into a
    /// render port cell.
    pub fn into_box(self) -> Box<dyn Any + Send + Sync> {
        self.value
    }
}

impl Debug for AnyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AnyValue({})", self.type_name)
    }
}
