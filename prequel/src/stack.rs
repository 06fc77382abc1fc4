//! A block-backed LIFO stack of fixed-size values.
//!
//! Values are packed into singly-linked blocks (newest block holds the
//! top of the stack); each block packs as many `T`s as fit after its
//! twelve-byte header. Unlike [`crate::extent::Extent`], popping actually
//! frees emptied blocks back to the allocator rather than leaving a
//! high-water mark in place -- this is the right tool for scratch space
//! whose size swings widely, e.g. a traversal work list.

use std::marker::PhantomData;
use std::rc::Rc;

use prequel_derive::Serializable;

use crate::address::BlockIndex;
use crate::allocator::Allocator;
use crate::engine::Engine;
use crate::error::Result;
use crate::handle::Handle;
use crate::serialize::Serializable;

const NODE_HEADER: usize = 12;

#[derive(Serializable, Debug, Clone, Copy, PartialEq, Eq, Default)]
struct NodeHeader {
    prev: BlockIndex,
    count: u32,
}

/// The persistent state of a [`Stack`]: the number of elements and the
/// block holding the top of the stack.
#[derive(Serializable, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackAnchor {
    head: BlockIndex,
    size: u64,
}

impl StackAnchor {
    /// An anchor for an empty stack.
    pub fn empty() -> Self {
        StackAnchor {
            head: BlockIndex::INVALID,
            size: 0,
        }
    }
}

/// A LIFO stack of `T` values, backed by a chain of blocks allocated one
/// at a time as the stack grows and freed as it shrinks.
pub struct Stack<T: Serializable + Clone> {
    engine: Rc<Engine>,
    allocator: Rc<dyn Allocator>,
    anchor: Handle<StackAnchor>,
    node_capacity: usize,
    _marker: PhantomData<T>,
}

impl<T: Serializable + Clone> Stack<T> {
    /// Opens a stack anchored at `anchor`; a zeroed anchor is already a
    /// valid empty stack, so no separate initialization step exists.
    pub fn new(
        engine: Rc<Engine>,
        allocator: Rc<dyn Allocator>,
        anchor: Handle<StackAnchor>,
    ) -> Result<Self> {
        let block_size = engine.block_size();
        let node_capacity = (block_size - NODE_HEADER) / T::SERIALIZED_SIZE;
        assert!(node_capacity > 0, "block too small to hold a single value");
        Ok(Stack {
            engine,
            allocator,
            anchor,
            node_capacity,
            _marker: PhantomData,
        })
    }

    /// The number of values on the stack.
    pub fn len(&self) -> Result<u64> {
        Ok(self.anchor.get()?.size)
    }

    /// `true` if the stack holds no values.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn read_header(&self, block: BlockIndex) -> Result<(crate::engine::BlockHandle, NodeHeader)> {
        let handle = self.engine.pin(block, false)?;
        let header = NodeHeader::deserialize(&handle.data()[..NODE_HEADER])?;
        Ok((handle, header))
    }

    fn write_header(&self, handle: &crate::engine::BlockHandle, header: &NodeHeader) {
        header.serialize(&mut handle.data_mut()[..NODE_HEADER]);
    }

    fn slot_offset(&self, index: usize) -> usize {
        NODE_HEADER + index * T::SERIALIZED_SIZE
    }

    /// Pushes a value onto the top of the stack, allocating a new block
    /// if the current top block is full or the stack is empty.
    pub fn push(&self, value: &T) -> Result<()> {
        let mut anchor = self.anchor.get()?;
        let top_full = if anchor.head.is_valid() {
            let (_, header) = self.read_header(anchor.head)?;
            header.count as usize >= self.node_capacity
        } else {
            true
        };

        let (handle, mut header) = if top_full {
            let new_block = self.allocator.allocate(1)?;
            let new_handle = self.engine.pin(new_block, true)?;
            let new_header = NodeHeader {
                prev: anchor.head,
                count: 0,
            };
            anchor.head = new_block;
            (new_handle, new_header)
        } else {
            self.read_header(anchor.head)?
        };

        let offset = self.slot_offset(header.count as usize);
        let size = T::SERIALIZED_SIZE;
        value.serialize(&mut handle.data_mut()[offset..offset + size]);
        header.count += 1;
        self.write_header(&handle, &header);

        anchor.size += 1;
        self.anchor.set(&anchor);
        Ok(())
    }

    /// Returns the value on top of the stack without removing it.
    pub fn top(&self) -> Result<Option<T>> {
        let anchor = self.anchor.get()?;
        if !anchor.head.is_valid() {
            return Ok(None);
        }
        let (handle, header) = self.read_header(anchor.head)?;
        let offset = self.slot_offset(header.count as usize - 1);
        let size = T::SERIALIZED_SIZE;
        Ok(Some(T::deserialize(&handle.data()[offset..offset + size])?))
    }

    /// Removes and returns the value on top of the stack, or `None` if
    /// the stack is empty.
    pub fn pop(&self) -> Result<Option<T>> {
        let mut anchor = self.anchor.get()?;
        if !anchor.head.is_valid() {
            return Ok(None);
        }
        let (handle, mut header) = self.read_header(anchor.head)?;
        let offset = self.slot_offset(header.count as usize - 1);
        let size = T::SERIALIZED_SIZE;
        let value = T::deserialize(&handle.data()[offset..offset + size])?;

        header.count -= 1;
        if header.count == 0 {
            let emptied = anchor.head;
            anchor.head = header.prev;
            drop(handle);
            self.allocator.free(emptied, 1)?;
        } else {
            self.write_header(&handle, &header);
        }

        anchor.size -= 1;
        self.anchor.set(&anchor);
        Ok(Some(value))
    }

    /// Frees every block in the chain, leaving the stack empty.
    pub fn clear(&self) -> Result<()> {
        let mut anchor = self.anchor.get()?;
        let mut current = anchor.head;
        while current.is_valid() {
            let (handle, header) = self.read_header(current)?;
            let next = header.prev;
            drop(handle);
            self.allocator.free(current, 1)?;
            current = next;
        }
        anchor.head = BlockIndex::INVALID;
        anchor.size = 0;
        self.anchor.set(&anchor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::default::DefaultAllocator;
    use crate::vfs::MemoryBackend;

    fn new_stack() -> Stack<u64> {
        let mut backend = MemoryBackend::new();
        backend.truncate(256 * 4).unwrap();
        let engine = Engine::new(Box::new(backend), 256, 32);
        let allocator: Rc<dyn Allocator> = Rc::new(
            DefaultAllocator::create(engine.clone(), BlockIndex::new(0)).unwrap(),
        );
        let stack_block = allocator.allocate(1).unwrap();
        let stack_anchor = engine.pin(stack_block, true).unwrap();
        Stack::new(engine, allocator, Handle::new(stack_anchor, 0)).unwrap()
    }

    #[test]
    fn push_pop_is_lifo_across_many_blocks() {
        let stack = new_stack();
        for i in 0..500u64 {
            stack.push(&i).unwrap();
        }
        assert_eq!(stack.len().unwrap(), 500);
        for i in (0..500u64).rev() {
            assert_eq!(stack.pop().unwrap(), Some(i));
        }
        assert!(stack.is_empty().unwrap());
        assert_eq!(stack.pop().unwrap(), None);
    }

    #[test]
    fn top_does_not_remove() {
        let stack = new_stack();
        stack.push(&1).unwrap();
        stack.push(&2).unwrap();
        assert_eq!(stack.top().unwrap(), Some(2));
        assert_eq!(stack.len().unwrap(), 2);
    }

    #[test]
    fn clear_frees_every_block() {
        let stack = new_stack();
        for i in 0..300u64 {
            stack.push(&i).unwrap();
        }
        stack.clear().unwrap();
        assert!(stack.is_empty().unwrap());
        assert_eq!(stack.top().unwrap(), None);
    }
}
