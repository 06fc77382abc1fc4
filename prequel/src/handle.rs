//! Typed views over a pinned block.
//!
//! A [`BlockHandle`] only knows about raw bytes; [`Handle<T>`] pairs one
//! with a byte offset and lets callers get/set whole values or individual
//! members by offset, using the `offset_of_*` const fns that
//! `#[derive(Serializable)]` emits for each field.

use std::marker::PhantomData;

use crate::engine::BlockHandle;
use crate::error::Result;
use crate::serialize::Serializable;

/// A typed view of a `T` living at a fixed byte offset inside a pinned
/// block.
///
/// Cloning a `Handle` clones the underlying [`BlockHandle`], keeping the
/// block pinned for as long as any clone is alive.
#[derive(Clone)]
pub struct Handle<T> {
    block: BlockHandle,
    offset: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serializable> Handle<T> {
    /// Constructs a handle for a `T` at `offset` bytes into `block`.
    pub fn new(block: BlockHandle, offset: usize) -> Self {
        Handle {
            block,
            offset,
            _marker: PhantomData,
        }
    }

    /// The block this handle is backed by.
    pub fn block(&self) -> &BlockHandle {
        &self.block
    }

    /// The byte offset of this value within its block.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Reads the whole value.
    pub fn get(&self) -> Result<T> {
        let data = self.block.data();
        T::deserialize(&data[self.offset..self.offset + T::SERIALIZED_SIZE])
    }

    /// Overwrites the whole value and marks the block dirty.
    pub fn set(&self, value: &T) {
        let mut data = self.block.data_mut();
        value.serialize(&mut data[self.offset..self.offset + T::SERIALIZED_SIZE]);
    }

    /// A handle to a member of `T` at `member_offset` bytes past this
    /// value's own offset -- typically called with one of the
    /// `offset_of_<field>()` const fns the derive macro generates for `T`.
    pub fn member<M: Serializable>(&self, member_offset: usize) -> Handle<M> {
        Handle::new(self.block.clone(), self.offset + member_offset)
    }

    /// Reads a single member without materializing the whole value.
    pub fn get_member<M: Serializable>(&self, member_offset: usize) -> Result<M> {
        self.member::<M>(member_offset).get()
    }

    /// Writes a single member without rewriting the whole value.
    pub fn set_member<M: Serializable>(&self, member_offset: usize, value: &M) {
        self.member::<M>(member_offset).set(value)
    }
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("block", &self.block.index())
            .field("offset", &self.offset)
            .finish()
    }
}

/// A handle to a block's fixed-position anchor value, i.e. a `Handle<T>`
/// pinned at offset zero. Containers (B+-trees, hash tables, the
/// allocator) each keep one small anchor struct like this describing their
/// persistent root state.
pub type AnchorHandle<T> = Handle<T>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::BlockIndex;
    use crate::engine::Engine;
    use crate::vfs::MemoryBackend;
    use prequel_derive::Serializable;

    #[derive(Serializable, Debug, Clone, PartialEq)]
    struct Pair {
        a: u32,
        b: u16,
    }

    #[test]
    fn whole_value_round_trip() {
        let mut backend = MemoryBackend::new();
        backend.truncate(64).unwrap();
        let engine = Engine::new(Box::new(backend), 64, 4);
        let block = engine.pin(BlockIndex::new(0), true).unwrap();
        let handle: Handle<Pair> = Handle::new(block, 0);
        handle.set(&Pair { a: 7, b: 3 });
        assert_eq!(handle.get().unwrap(), Pair { a: 7, b: 3 });
    }

    #[test]
    fn member_access_matches_whole_value() {
        let mut backend = MemoryBackend::new();
        backend.truncate(64).unwrap();
        let engine = Engine::new(Box::new(backend), 64, 4);
        let block = engine.pin(BlockIndex::new(0), true).unwrap();
        let handle: Handle<Pair> = Handle::new(block, 0);
        handle.set(&Pair { a: 1, b: 2 });
        handle.set_member(Pair::offset_of_b(), &99u16);
        assert_eq!(handle.get().unwrap(), Pair { a: 1, b: 99 });
        assert_eq!(handle.get_member::<u16>(Pair::offset_of_b()).unwrap(), 99);
    }
}
