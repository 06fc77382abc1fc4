//! A block-granularity LIFO free list, intrusive in the freed blocks
//! themselves.
//!
//! Each free block's first eight bytes hold the index of the next free
//! block (or the invalid index for the list's tail). This is the structure
//! the default allocator uses to track its own metadata blocks -- the ones
//! that hold the allocator's two extent trees -- so that freeing metadata
//! never itself requires allocating metadata. See
//! [`crate::allocator::default::DefaultAllocator`] for how it resolves the
//! resulting bootstrap problem.

use std::rc::Rc;

use prequel_derive::Serializable;

use crate::address::BlockIndex;
use crate::engine::Engine;
use crate::error::Result;
use crate::handle::Handle;

/// The persistent state of a [`FreeList`]: the head of the chain and how
/// many blocks are linked into it.
#[derive(Serializable, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreeListAnchor {
    head: BlockIndex,
    size: u64,
}

impl FreeListAnchor {
    /// An anchor for an empty free list.
    pub fn empty() -> Self {
        FreeListAnchor {
            head: BlockIndex::INVALID,
            size: 0,
        }
    }
}

/// A handle to a free list anchored at a known location.
pub struct FreeList {
    engine: Rc<Engine>,
    anchor: Handle<FreeListAnchor>,
}

impl FreeList {
    /// Wraps the free list whose anchor is stored at `anchor`.
    pub fn new(engine: Rc<Engine>, anchor: Handle<FreeListAnchor>) -> Self {
        FreeList { engine, anchor }
    }

    /// The number of blocks currently linked into this list.
    pub fn len(&self) -> Result<u64> {
        Ok(self.anchor.get()?.size)
    }

    /// `true` if no blocks are linked into this list.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Links `block` onto the front of the list, overwriting its entire
    /// content with the link pointer.
    pub fn push(&self, block: BlockIndex) -> Result<()> {
        let mut anchor = self.anchor.get()?;
        let handle = self.engine.pin(block, true)?;
        let link: Handle<BlockIndex> = Handle::new(handle, 0);
        link.set(&anchor.head);
        anchor.head = block;
        anchor.size += 1;
        self.anchor.set(&anchor);
        Ok(())
    }

    /// Unlinks and returns the block at the front of the list, or `None`
    /// if the list is empty.
    pub fn pop(&self) -> Result<Option<BlockIndex>> {
        let mut anchor = self.anchor.get()?;
        if !anchor.head.is_valid() {
            return Ok(None);
        }
        let popped = anchor.head;
        let handle = self.engine.pin(popped, false)?;
        let link: Handle<BlockIndex> = Handle::new(handle, 0);
        let next = link.get()?;
        anchor.head = next;
        anchor.size -= 1;
        self.anchor.set(&anchor);
        Ok(Some(popped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemoryBackend;

    fn new_engine() -> Rc<Engine> {
        let mut backend = MemoryBackend::new();
        backend.truncate(64 * 8).unwrap();
        Engine::new(Box::new(backend), 64, 16)
    }

    #[test]
    fn push_pop_is_lifo() {
        let engine = new_engine();
        let anchor_block = engine.pin(BlockIndex::new(0), true).unwrap();
        let anchor: Handle<FreeListAnchor> = Handle::new(anchor_block, 0);
        anchor.set(&FreeListAnchor::empty());
        let list = FreeList::new(engine.clone(), anchor);

        assert!(list.is_empty().unwrap());
        list.push(BlockIndex::new(1)).unwrap();
        list.push(BlockIndex::new(2)).unwrap();
        list.push(BlockIndex::new(3)).unwrap();
        assert_eq!(list.len().unwrap(), 3);

        assert_eq!(list.pop().unwrap(), Some(BlockIndex::new(3)));
        assert_eq!(list.pop().unwrap(), Some(BlockIndex::new(2)));
        assert_eq!(list.pop().unwrap(), Some(BlockIndex::new(1)));
        assert_eq!(list.pop().unwrap(), None);
        assert!(list.is_empty().unwrap());
    }
}
