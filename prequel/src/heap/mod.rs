//! A variable-size object store: small objects are packed into slotted
//! pages, large ones get a dedicated run of blocks.
//!
//! A [`HeapReference`] never points directly at a byte offset -- it names
//! a page and a slot id. Each page keeps its own slot directory mapping a
//! slot id to the payload's current offset and length, so when a page is
//! compacted to reclaim space left by deleted objects, only the slot
//! directory entries move; every [`HeapReference`] handed out earlier
//! keeps working. This crate does not keep a cross-page free-space index
//! (see `DESIGN.md`): once a page can no longer satisfy an insert even
//! after compaction, the heap simply moves on to a fresh page and leaves
//! the old one only reachable through references already handed out.

use std::rc::Rc;

use prequel_derive::Serializable;

use crate::address::BlockIndex;
use crate::allocator::Allocator;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::serialize::Serializable;

const PAGE_HEADER: usize = 4 + 4 + 4;
const SLOT_ENTRY_SIZE: usize = 4 + 4;
/// Slot id reserved to mark a [`HeapReference`] as pointing at a large
/// object (a dedicated block run) rather than a page slot.
const LARGE_OBJECT_SLOT: u32 = u32::MAX;

/// A stable reference to a heap object, valid across in-page compaction
/// and for the lifetime of the object.
#[derive(Serializable, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapReference {
    block: BlockIndex,
    slot: u32,
}

/// Persistent root state of a [`Heap`]: the one page currently being
/// appended to.
#[derive(Serializable, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapAnchor {
    current_page: BlockIndex,
}

/// A heap of variable-length byte objects.
pub struct Heap {
    engine: Rc<Engine>,
    allocator: Rc<dyn Allocator>,
    anchor: Handle<HeapAnchor>,
    small_object_threshold: usize,
}

impl Heap {
    /// Opens (or, if the anchor is empty, creates) a heap anchored at
    /// `anchor`. Objects no larger than a quarter of a block are packed
    /// into shared pages; anything bigger gets its own block run.
    pub fn new(engine: Rc<Engine>, allocator: Rc<dyn Allocator>, anchor: Handle<HeapAnchor>) -> Result<Self> {
        let small_object_threshold = engine.block_size() / 4;
        Ok(Heap {
            engine,
            allocator,
            anchor,
            small_object_threshold,
        })
    }

    /// Stores `bytes` and returns a stable reference to it.
    pub fn insert(&mut self, bytes: &[u8]) -> Result<HeapReference> {
        if bytes.len() >= self.small_object_threshold {
            self.insert_large(bytes)
        } else {
            self.insert_small(bytes)
        }
    }

    /// Reads back the object a reference points at.
    pub fn get(&self, reference: HeapReference) -> Result<Vec<u8>> {
        if reference.slot == LARGE_OBJECT_SLOT {
            self.get_large(reference.block)
        } else {
            self.get_small(reference)
        }
    }

    /// Releases the storage an object occupies. The reference must not be
    /// used again afterward.
    pub fn free(&mut self, reference: HeapReference) -> Result<()> {
        if reference.slot == LARGE_OBJECT_SLOT {
            self.free_large(reference.block)
        } else {
            self.free_small(reference)
        }
    }

    fn insert_large(&mut self, bytes: &[u8]) -> Result<HeapReference> {
        let total = 8 + bytes.len();
        let blocks = (total as u64).div_ceil(self.engine.block_size() as u64);
        let start = self.allocator.allocate(blocks)?;

        let mut remaining = bytes;
        let mut block = start;
        let mut first = true;
        while first || !remaining.is_empty() {
            let handle = self.engine.pin(block, true)?;
            let mut data = handle.data_mut();
            let mut cursor = 0usize;
            if first {
                data[0..8].copy_from_slice(&(bytes.len() as u64).to_be_bytes());
                cursor = 8;
                first = false;
            }
            let take = remaining.len().min(data.len() - cursor);
            data[cursor..cursor + take].copy_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            block = block.offset(1);
        }
        Ok(HeapReference {
            block: start,
            slot: LARGE_OBJECT_SLOT,
        })
    }

    fn get_large(&self, start: BlockIndex) -> Result<Vec<u8>> {
        let handle = self.engine.pin(start, false)?;
        let data = handle.data();
        let len = u64::from_be_bytes(data[0..8].try_into().unwrap()) as usize;
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&data[8..]);
        drop(data);
        let mut block = start.offset(1);
        while out.len() < len {
            let handle = self.engine.pin(block, false)?;
            out.extend_from_slice(&handle.data());
            block = block.offset(1);
        }
        out.truncate(len);
        Ok(out)
    }

    fn free_large(&mut self, start: BlockIndex) -> Result<()> {
        let handle = self.engine.pin(start, false)?;
        let len = u64::from_be_bytes(handle.data()[0..8].try_into().unwrap());
        let total = 8 + len;
        let blocks = total.div_ceil(self.engine.block_size() as u64);
        drop(handle);
        self.allocator.free(start, blocks)
    }

    fn current_page(&mut self) -> Result<BlockIndex> {
        let anchor = self.anchor.get()?;
        if anchor.current_page.is_valid() {
            return Ok(anchor.current_page);
        }
        let page = self.new_page()?;
        self.anchor.set(&HeapAnchor { current_page: page });
        Ok(page)
    }

    fn new_page(&mut self) -> Result<BlockIndex> {
        let page = self.allocator.allocate(1)?;
        let handle = self.engine.pin(page, true)?;
        let mut data = handle.data_mut();
        write_page_header(&mut data, 0, PAGE_HEADER as u32, 0);
        Ok(page)
    }

    fn insert_small(&mut self, bytes: &[u8]) -> Result<HeapReference> {
        let mut page = self.current_page()?;
        loop {
            if let Some(slot) = self.try_insert_into_page(page, bytes)? {
                return Ok(HeapReference { block: page, slot });
            }
            if self.compact(page)? {
                if let Some(slot) = self.try_insert_into_page(page, bytes)? {
                    return Ok(HeapReference { block: page, slot });
                }
            }
            page = self.new_page()?;
            self.anchor.set(&HeapAnchor { current_page: page });
        }
    }

    /// Tries to place `bytes` into `page` without compacting; returns the
    /// assigned slot id, or `None` if there isn't room.
    fn try_insert_into_page(&self, page: BlockIndex, bytes: &[u8]) -> Result<Option<u32>> {
        let handle = self.engine.pin(page, false)?;
        let mut data = handle.data_mut();
        let (slot_count, data_end, free_bytes) = read_page_header(&data);

        let reuse_slot = (0..slot_count).find(|&i| slot_entry(&data, i).1 == 0);
        let slot_id = reuse_slot.unwrap_or(slot_count);
        let needs_new_slot = reuse_slot.is_none();
        let directory_bytes = (slot_count + if needs_new_slot { 1 } else { 0 }) as usize * SLOT_ENTRY_SIZE;
        let directory_start = self.engine.block_size() - directory_bytes;

        if (data_end as usize) + bytes.len() > directory_start {
            return Ok(None);
        }

        data[data_end as usize..data_end as usize + bytes.len()].copy_from_slice(bytes);
        write_slot_entry(&mut data, slot_id, data_end, bytes.len() as u32);
        let new_count = if needs_new_slot { slot_count + 1 } else { slot_count };
        write_page_header(&mut data, new_count, data_end + bytes.len() as u32, free_bytes);
        Ok(Some(slot_id))
    }

    /// Rewrites every live object in `page` contiguously from the header
    /// on, reclaiming the bytes left behind by deleted objects. Slot ids
    /// and therefore every outstanding [`HeapReference`] stay valid --
    /// only the slot directory's offsets change.
    fn compact(&self, page: BlockIndex) -> Result<bool> {
        let handle = self.engine.pin(page, false)?;
        let mut data = handle.data_mut();
        let (slot_count, _, free_bytes) = read_page_header(&data);
        if free_bytes == 0 {
            return Ok(false);
        }

        let mut live: Vec<(u32, u32, u32)> = (0..slot_count)
            .filter_map(|i| {
                let (offset, length) = slot_entry(&data, i);
                (length > 0).then_some((i, offset, length))
            })
            .collect();
        live.sort_by_key(|&(_, offset, _)| offset);

        let mut cursor = PAGE_HEADER as u32;
        let mut moved = vec![0u8; 0];
        for &(slot_id, offset, length) in &live {
            moved.clear();
            moved.extend_from_slice(&data[offset as usize..(offset + length) as usize]);
            data[cursor as usize..(cursor + length) as usize].copy_from_slice(&moved);
            write_slot_entry(&mut data, slot_id, cursor, length);
            cursor += length;
        }
        write_page_header(&mut data, slot_count, cursor, 0);
        Ok(true)
    }

    fn get_small(&self, reference: HeapReference) -> Result<Vec<u8>> {
        let handle = self.engine.pin(reference.block, false)?;
        let data = handle.data();
        let (slot_count, _, _) = read_page_header(&data);
        if reference.slot >= slot_count {
            return Err(Error::bad_argument("heap reference slot out of range"));
        }
        let (offset, length) = slot_entry(&data, reference.slot);
        if length == 0 {
            return Err(Error::bad_argument("heap reference points at a freed object"));
        }
        Ok(data[offset as usize..(offset + length) as usize].to_vec())
    }

    fn free_small(&mut self, reference: HeapReference) -> Result<()> {
        let handle = self.engine.pin(reference.block, false)?;
        let mut data = handle.data_mut();
        let (slot_count, data_end, free_bytes) = read_page_header(&data);
        if reference.slot >= slot_count {
            return Err(Error::bad_argument("heap reference slot out of range"));
        }
        let (offset, length) = slot_entry(&data, reference.slot);
        if length == 0 {
            return Err(Error::bad_argument("double free of heap reference"));
        }
        write_slot_entry(&mut data, reference.slot, offset, 0);
        write_page_header(&mut data, slot_count, data_end, free_bytes + length);
        Ok(())
    }
}

fn read_page_header(data: &[u8]) -> (u32, u32, u32) {
    let slot_count = u32::from_be_bytes(data[0..4].try_into().unwrap());
    let data_end = u32::from_be_bytes(data[4..8].try_into().unwrap());
    let free_bytes = u32::from_be_bytes(data[8..12].try_into().unwrap());
    (slot_count, data_end, free_bytes)
}

fn write_page_header(data: &mut [u8], slot_count: u32, data_end: u32, free_bytes: u32) {
    data[0..4].copy_from_slice(&slot_count.to_be_bytes());
    data[4..8].copy_from_slice(&data_end.to_be_bytes());
    data[8..12].copy_from_slice(&free_bytes.to_be_bytes());
}

fn slot_offset(block_size: usize, slot: u32) -> usize {
    block_size - (slot as usize + 1) * SLOT_ENTRY_SIZE
}

fn slot_entry(data: &[u8], slot: u32) -> (u32, u32) {
    let at = slot_offset(data.len(), slot);
    let offset = u32::from_be_bytes(data[at..at + 4].try_into().unwrap());
    let length = u32::from_be_bytes(data[at + 4..at + 8].try_into().unwrap());
    (offset, length)
}

fn write_slot_entry(data: &mut [u8], slot: u32, offset: u32, length: u32) {
    let at = slot_offset(data.len(), slot);
    data[at..at + 4].copy_from_slice(&offset.to_be_bytes());
    data[at + 4..at + 8].copy_from_slice(&length.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::default::DefaultAllocator;
    use crate::vfs::MemoryBackend;

    fn new_heap() -> Heap {
        let mut backend = MemoryBackend::new();
        backend.truncate(256 * 32).unwrap();
        let engine = Engine::new(Box::new(backend), 256, 32);
        let allocator = DefaultAllocator::create(engine.clone(), BlockIndex::new(0)).unwrap();
        let allocator: Rc<dyn Allocator> = Rc::new(allocator);
        let anchor_block = engine.pin(allocator.allocate(1).unwrap(), true).unwrap();
        let anchor: Handle<HeapAnchor> = Handle::new(anchor_block, 0);
        anchor.set(&HeapAnchor::default());
        Heap::new(engine, allocator, anchor).unwrap()
    }

    #[test]
    fn small_object_round_trip() {
        let mut heap = new_heap();
        let r = heap.insert(b"hello heap").unwrap();
        assert_eq!(heap.get(r).unwrap(), b"hello heap");
    }

    #[test]
    fn large_object_round_trip() {
        let mut heap = new_heap();
        let payload = vec![0xABu8; 2000];
        let r = heap.insert(&payload).unwrap();
        assert_eq!(heap.get(r).unwrap(), payload);
    }

    #[test]
    fn reference_survives_compaction() {
        let mut heap = new_heap();
        let mut refs = Vec::new();
        for i in 0..20u8 {
            refs.push(heap.insert(&[i; 10]).unwrap());
        }
        // free every other object, forcing fragmentation, then insert
        // enough to trigger an in-page compaction.
        for (i, r) in refs.iter().enumerate() {
            if i % 2 == 0 {
                heap.free(*r).unwrap();
            }
        }
        for _ in 0..5 {
            heap.insert(&[9u8; 10]).unwrap();
        }
        for (i, r) in refs.iter().enumerate() {
            if i % 2 == 1 {
                assert_eq!(heap.get(*r).unwrap(), vec![i as u8; 10]);
            }
        }
    }

    #[test]
    fn double_free_errors() {
        let mut heap = new_heap();
        let r = heap.insert(b"x").unwrap();
        heap.free(r).unwrap();
        assert!(heap.free(r).is_err());
    }
}
