//! A flat, growable on-disk array backed by a contiguous, reallocatable
//! run of blocks.
//!
//! Elements never straddle a block boundary, so a block's tail bytes go
//! unused when `T`'s size doesn't evenly divide the block size -- the same
//! trade [`crate::hash_table::HashTable`] makes for its buckets. Growth
//! doubles the block run via [`crate::allocator::Allocator::reallocate`],
//! the same way `Vec` doubles its own backing allocation; like `Vec`,
//! shrinking the logical length does not give blocks back.

use std::rc::Rc;

use prequel_derive::Serializable;

use crate::address::BlockIndex;
use crate::allocator::Allocator;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::serialize::Serializable;

/// Persistent state of an [`Extent`]: where its block run starts, how many
/// blocks it spans, and how many elements are in use.
#[derive(Serializable, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtentAnchor {
    start: BlockIndex,
    capacity_blocks: u64,
    len: u64,
}

/// A growable array of `T`, stored as a packed run of blocks.
pub struct Extent<T: Serializable + Clone> {
    engine: Rc<Engine>,
    allocator: Rc<dyn Allocator>,
    anchor: Handle<ExtentAnchor>,
    items_per_block: u64,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Serializable + Clone> Extent<T> {
    /// Opens (or, if the anchor is empty, creates) an extent anchored at
    /// `anchor`.
    pub fn new(engine: Rc<Engine>, allocator: Rc<dyn Allocator>, anchor: Handle<ExtentAnchor>) -> Result<Self> {
        let items_per_block = (engine.block_size() / T::SERIALIZED_SIZE) as u64;
        if items_per_block == 0 {
            return Err(Error::bad_argument("T is larger than one block"));
        }
        let extent = Extent {
            engine,
            allocator,
            anchor,
            items_per_block,
            _marker: std::marker::PhantomData,
        };
        if extent.anchor.get()?.capacity_blocks == 0 {
            let start = extent.allocator.allocate(1)?;
            extent.anchor.set(&ExtentAnchor {
                start,
                capacity_blocks: 1,
                len: 0,
            });
        }
        Ok(extent)
    }

    /// The number of elements currently stored.
    pub fn len(&self) -> Result<u64> {
        Ok(self.anchor.get()?.len)
    }

    /// `true` if the extent holds no elements.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn location(&self, anchor: &ExtentAnchor, index: u64) -> (BlockIndex, usize) {
        let block = anchor.start.offset(index / self.items_per_block);
        let offset = (index % self.items_per_block) as usize * T::SERIALIZED_SIZE;
        (block, offset)
    }

    /// Reads the element at `index`.
    pub fn get(&self, index: u64) -> Result<T> {
        let anchor = self.anchor.get()?;
        if index >= anchor.len {
            return Err(Error::bad_argument(format!(
                "index {} out of bounds (len {})",
                index, anchor.len
            )));
        }
        let (block, offset) = self.location(&anchor, index);
        let handle: Handle<T> = Handle::new(self.engine.pin(block, false)?, offset);
        handle.get()
    }

    /// Overwrites the element at `index`.
    pub fn set(&self, index: u64, value: &T) -> Result<()> {
        let anchor = self.anchor.get()?;
        if index >= anchor.len {
            return Err(Error::bad_argument(format!(
                "index {} out of bounds (len {})",
                index, anchor.len
            )));
        }
        let (block, offset) = self.location(&anchor, index);
        let handle: Handle<T> = Handle::new(self.engine.pin(block, false)?, offset);
        handle.set(value);
        Ok(())
    }

    /// Appends `value`, growing the backing block run if it is full.
    pub fn push(&self, value: T) -> Result<u64> {
        let mut anchor = self.anchor.get()?;
        let capacity_items = anchor.capacity_blocks * self.items_per_block;
        if anchor.len == capacity_items {
            let new_capacity_blocks = anchor.capacity_blocks * 2;
            let new_start = self
                .allocator
                .reallocate(anchor.start, anchor.capacity_blocks, new_capacity_blocks)?;
            anchor.start = new_start;
            anchor.capacity_blocks = new_capacity_blocks;
        }
        let (block, offset) = self.location(&anchor, anchor.len);
        let index = anchor.len;
        anchor.len += 1;
        self.anchor.set(&anchor);

        let new_block = index % self.items_per_block == 0;
        let handle: Handle<T> = Handle::new(self.engine.pin(block, new_block)?, offset);
        handle.set(&value);
        Ok(index)
    }

    /// Shrinks the logical length to `new_len`, without releasing any
    /// blocks (matching `Vec::truncate`).
    pub fn truncate(&self, new_len: u64) -> Result<()> {
        let mut anchor = self.anchor.get()?;
        if new_len < anchor.len {
            anchor.len = new_len;
            self.anchor.set(&anchor);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::default::DefaultAllocator;
    use crate::vfs::MemoryBackend;

    fn new_extent() -> Extent<u32> {
        let mut backend = MemoryBackend::new();
        backend.truncate(64 * 32).unwrap();
        let engine = Engine::new(Box::new(backend), 64, 32);
        let allocator = DefaultAllocator::create(engine.clone(), BlockIndex::new(0)).unwrap();
        let allocator: Rc<dyn Allocator> = Rc::new(allocator);
        let anchor_block = engine.pin(allocator.allocate(1).unwrap(), true).unwrap();
        let anchor: Handle<ExtentAnchor> = Handle::new(anchor_block, 0);
        anchor.set(&ExtentAnchor::default());
        Extent::new(engine, allocator, anchor).unwrap()
    }

    #[test]
    fn push_get_across_growth() {
        let extent = new_extent();
        for i in 0..500u32 {
            let idx = extent.push(i * 7).unwrap();
            assert_eq!(idx, i as u64);
        }
        assert_eq!(extent.len().unwrap(), 500);
        for i in 0..500u32 {
            assert_eq!(extent.get(i as u64).unwrap(), i * 7);
        }
    }

    #[test]
    fn set_overwrites_in_place() {
        let extent = new_extent();
        extent.push(1).unwrap();
        extent.push(2).unwrap();
        extent.set(0, &42).unwrap();
        assert_eq!(extent.get(0).unwrap(), 42);
        assert_eq!(extent.get(1).unwrap(), 2);
    }

    #[test]
    fn out_of_bounds_get_errors() {
        let extent = new_extent();
        extent.push(1).unwrap();
        assert!(extent.get(5).is_err());
    }
}
