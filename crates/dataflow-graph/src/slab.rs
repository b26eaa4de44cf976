use thunderdome::{Arena, Index};

use dataflow_core::Handle;

fn to_handle(idx: Index, container_id: u16) -> Handle {
    Handle {
        index: idx.slot(),
        version: idx.generation(),
        container_id,
    }
}

fn to_index(handle: Handle) -> Index {
    Index::from_parts(handle.index, handle.version)
}

/// A generational arena keyed by [`Handle`], stamped with a `container_id` so
/// that a handle minted by one slab can never validate against another, even
/// if their raw indices collide. Built atop `thunderdome::Arena`, the same
/// generational-index primitive the teacher's node/edge tables use.
pub struct VersionedSlab<T> {
    arena: Arena<T>,
    container_id: u16,
}

impl<T> VersionedSlab<T> {
    pub fn with_capacity(container_id: u16, capacity: usize) -> Self {
        Self {
            arena: Arena::with_capacity(capacity),
            container_id,
        }
    }

    pub fn container_id(&self) -> u16 {
        self.container_id
    }

    pub fn insert(&mut self, value: T) -> Handle {
        to_handle(self.arena.insert(value), self.container_id)
    }

    pub fn insert_at(&mut self, handle: Handle, value: T) -> Option<T> {
        if handle.container_id != self.container_id {
            return None;
        }
        self.arena.insert_at(to_index(handle), value)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        if handle.container_id != self.container_id {
            return None;
        }
        self.arena.get(to_index(handle))
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        if handle.container_id != self.container_id {
            return None;
        }
        self.arena.get_mut(to_index(handle))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        handle.container_id == self.container_id && self.arena.contains(to_index(handle))
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        if handle.container_id != self.container_id {
            return None;
        }
        self.arena.remove(to_index(handle))
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        let container_id = self.container_id;
        self.arena.iter().map(move |(idx, v)| (to_handle(idx, container_id), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> {
        let container_id = self.container_id;
        self.arena.iter_mut().map(move |(idx, v)| (to_handle(idx, container_id), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_fails_validation() {
        let mut slab: VersionedSlab<u32> = VersionedSlab::with_capacity(0, 4);
        let h = slab.insert(10);
        assert_eq!(slab.remove(h), Some(10));
        let h2 = slab.insert(20);
        assert_eq!(slab.get(h), None);
        assert_eq!(slab.get(h2), Some(&20));
    }

    #[test]
    fn cross_container_handle_is_rejected() {
        let mut a: VersionedSlab<u32> = VersionedSlab::with_capacity(0, 4);
        let b: VersionedSlab<u32> = VersionedSlab::with_capacity(1, 4);
        let h = a.insert(1);
        assert!(b.get(h).is_none());
    }
}
