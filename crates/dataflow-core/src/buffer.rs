use std::any::Any;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Who currently owns a port's backing memory. Stored alongside the binding rather
/// than inferred, so cleanup can tell whether the slot must free memory itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwnership {
    /// Normal case: the memory belongs to the connected output port (or to this
    /// port's own default block if unconnected).
    OwnedByPort,
    /// Externally installed for this tick only by an [`crate::node::Kernel`]-external
    /// input batch; the port must not free it.
    OwnedByBatch,
    /// Unconnected, no default block allocated yet.
    None,
}

type AnyCell = Arc<RwLock<Box<dyn Any + Send + Sync>>>;

/// A patched port slot as seen from inside a kernel: either bound to a concrete
/// value cell, or unbound (no default registered; reads return `None`).
#[derive(Clone)]
pub struct PortBinding {
    cell: Option<AnyCell>,
    ownership: BufferOwnership,
}

impl PortBinding {
    pub fn unbound() -> Self {
        Self {
            cell: None,
            ownership: BufferOwnership::None,
        }
    }

    pub fn bound(value: Box<dyn Any + Send + Sync>, ownership: BufferOwnership) -> Self {
        Self {
            cell: Some(Arc::new(RwLock::new(value))),
            ownership,
        }
    }

    pub fn from_cell(cell: AnyCell, ownership: BufferOwnership) -> Self {
        Self {
            cell: Some(cell),
            ownership,
        }
    }

    pub fn cell(&self) -> Option<&AnyCell> {
        self.cell.as_ref()
    }

    pub fn ownership(&self) -> BufferOwnership {
        self.ownership
    }

    pub fn is_bound(&self) -> bool {
        self.cell.is_some()
    }

    /// Borrow the bound value as `T`. Returns `None` if unbound or the stored
    /// type does not match.
    pub fn read<T: Any>(&self) -> Option<PortRef<'_, T>> {
        let cell = self.cell.as_ref()?;
        let guard = cell.read().unwrap();
        if (**guard).is::<T>() {
            Some(PortRef {
                guard,
                _marker: PhantomData,
            })
        } else {
            None
        }
    }

    /// Mutably borrow the bound value as `T`. Intended for a port's own output
    /// cell only; the render scheduler never shares an output cell with a
    /// concurrently executing sibling.
    pub fn write<T: Any>(&self) -> Option<PortRefMut<'_, T>> {
        let cell = self.cell.as_ref()?;
        let guard = cell.write().unwrap();
        if (**guard).is::<T>() {
            Some(PortRefMut {
                guard,
                _marker: PhantomData,
            })
        } else {
            None
        }
    }
}

pub struct PortRef<'a, T> {
    guard: RwLockReadGuard<'a, Box<dyn Any + Send + Sync>>,
    _marker: PhantomData<T>,
}

impl<'a, T: Any> Deref for PortRef<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.downcast_ref::<T>().expect("type checked in PortBinding::read")
    }
}

pub struct PortRefMut<'a, T> {
    guard: RwLockWriteGuard<'a, Box<dyn Any + Send + Sync>>,
    _marker: PhantomData<T>,
}

impl<'a, T: Any> Deref for PortRefMut<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.downcast_ref::<T>().expect("type checked in PortBinding::write")
    }
}

impl<'a, T: Any> DerefMut for PortRefMut<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.downcast_mut::<T>().expect("type checked in PortBinding::write")
    }
}

/// The read-only/write-only view into a kernel's patched ports for one execution.
pub struct KernelContext<'a> {
    pub inputs: &'a [PortBinding],
    pub outputs: &'a [PortBinding],
}

impl<'a> KernelContext<'a> {
    pub fn input(&self, port_index: usize) -> Option<&PortBinding> {
        self.inputs.get(port_index)
    }

    pub fn output(&self, port_index: usize) -> Option<&PortBinding> {
        self.outputs.get(port_index)
    }
}
