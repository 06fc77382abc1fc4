//! The paging engine: the single point where blocks are read from or
//! written to the backing file.
//!
//! Every other module in this crate addresses the file exclusively through
//! an [`Engine`] and the [`BlockHandle`]s it hands out. A handle keeps its
//! block pinned in memory (un-evictable) for as long as any clone of it is
//! alive, mirroring the reference-counted `block_handle` of the original
//! source library -- here realized directly as `Rc` clone/drop instead of a
//! hand-rolled virtual ref count.

use std::cell::{Cell, RefCell, RefMut};
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::rc::Rc;

use lru::LruCache;

use crate::address::{BlockIndex, RawAddress};
use crate::error::{Error, Result};
use crate::vfs::RawFile;

/// How many extra unpinned blocks the cache tolerates above its nominal
/// target before it starts evicting. Matches the headroom the engine keeps
/// so a short burst of pins doesn't thrash the LRU on every single pin.
const CACHE_HEADROOM: usize = 8;

struct BlockEntry {
    data: RefCell<Vec<u8>>,
    dirty: Cell<bool>,
    pins: Cell<u32>,
}

/// A pinned, reference-counted handle to one block's in-memory contents.
///
/// Cloning increments the pin count; dropping the last clone returns the
/// block to the engine's LRU pool, where it becomes eligible for eviction.
pub struct BlockHandle {
    engine: Rc<Engine>,
    index: BlockIndex,
    entry: Rc<BlockEntry>,
}

impl BlockHandle {
    /// The block index this handle refers to.
    pub fn index(&self) -> BlockIndex {
        self.index
    }

    /// Borrows the block's bytes for reading.
    pub fn data(&self) -> std::cell::Ref<'_, Vec<u8>> {
        self.entry.data.borrow()
    }

    /// Borrows the block's bytes for writing and marks the block dirty.
    ///
    /// The block is assumed modified as soon as the guard is taken, not
    /// only if the caller actually changes a byte -- the same convention
    /// the original source used for its mutable block views.
    pub fn data_mut(&self) -> RefMut<'_, Vec<u8>> {
        self.entry.dirty.set(true);
        self.engine.mark_dirty(self.index);
        self.entry.data.borrow_mut()
    }
}

impl Clone for BlockHandle {
    fn clone(&self) -> Self {
        self.entry.pins.set(self.entry.pins.get() + 1);
        BlockHandle {
            engine: self.engine.clone(),
            index: self.index,
            entry: self.entry.clone(),
        }
    }
}

impl Drop for BlockHandle {
    fn drop(&mut self) {
        let remaining = self.entry.pins.get().saturating_sub(1);
        self.entry.pins.set(remaining);
        if remaining == 0 {
            self.engine.unpin(self.index);
        }
    }
}

impl std::fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockHandle").field("index", &self.index).finish()
    }
}

struct EngineState {
    blocks: HashMap<BlockIndex, Rc<BlockEntry>>,
    lru: LruCache<BlockIndex, ()>,
    dirty: BTreeSet<BlockIndex>,
    stashed: HashMap<BlockIndex, String>,
}

/// The engine owns the backing file and every cached block.
///
/// Always accessed through `Rc<Engine>` so [`BlockHandle`] can hold a strong
/// reference back without lifetime parameters leaking into every container
/// built on top of it.
pub struct Engine {
    file: RefCell<Box<dyn RawFile>>,
    block_size: usize,
    cache_blocks: usize,
    state: RefCell<EngineState>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("block_size", &self.block_size)
            .field("cache_blocks", &self.cache_blocks)
            .finish()
    }
}

impl Engine {
    /// Wraps `file` as an engine with the given block size and nominal
    /// cache capacity (in blocks).
    pub fn new(file: Box<dyn RawFile>, block_size: usize, cache_blocks: usize) -> Rc<Engine> {
        assert!(block_size > 0, "block size must be non-zero");
        let capacity = NonZeroUsize::new(cache_blocks + CACHE_HEADROOM).unwrap();
        Rc::new(Engine {
            file: RefCell::new(file),
            block_size,
            cache_blocks,
            state: RefCell::new(EngineState {
                blocks: HashMap::new(),
                lru: LruCache::new(capacity),
                dirty: BTreeSet::new(),
                stashed: HashMap::new(),
            }),
        })
    }

    /// The fixed size, in bytes, of every block this engine manages.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The current size of the file, in blocks.
    pub fn block_count(&self) -> Result<u64> {
        let size = self.file.borrow_mut().size()?;
        Ok(size / self.block_size as u64)
    }

    /// Converts a block index plus in-block byte offset to a [`RawAddress`].
    pub fn address_of(&self, index: BlockIndex, offset_in_block: u32) -> RawAddress {
        assert!((offset_in_block as usize) < self.block_size);
        RawAddress::new(index.value() * self.block_size as u64 + offset_in_block as u64)
    }

    /// The block an address falls within.
    pub fn block_of(&self, addr: RawAddress) -> BlockIndex {
        BlockIndex::new(addr.value() / self.block_size as u64)
    }

    /// The byte offset of an address within its block.
    pub fn offset_of(&self, addr: RawAddress) -> u32 {
        (addr.value() % self.block_size as u64) as u32
    }

    /// Grows the file by `count` blocks and returns the index of the first
    /// new block. New blocks read as zero until written.
    pub fn grow(&self, count: u64) -> Result<BlockIndex> {
        if count == 0 {
            return Err(Error::bad_argument("grow(0) is not meaningful"));
        }
        let mut file = self.file.borrow_mut();
        let old_blocks = file.size()? / self.block_size as u64;
        let new_size = (old_blocks + count) * self.block_size as u64;
        file.truncate(new_size)?;
        log::debug!("grew file by {} blocks, starting at {}", count, old_blocks);
        Ok(BlockIndex::new(old_blocks))
    }

    /// Pins a block, loading it from the file if it is not already cached.
    ///
    /// If `initialize` is set, the block's content is assumed to be
    /// all-zero (as it is immediately after [`Engine::grow`]) and is not
    /// read from the file; the caller is expected to populate it.
    ///
    /// `index` is a physical block address, including `0`: `BlockIndex`'s
    /// "no block" sentinel is a convention of the link fields that store
    /// block indices (a leaf's `next`, a free-list head), not a restriction
    /// on which blocks this engine can pin. Block 0 is the conventional
    /// anchor block every container keeps its metadata in, and callers that
    /// treat a `BlockIndex` as an optional link already check
    /// [`BlockIndex::is_valid`] themselves before ever pinning it.
    pub fn pin(self: &Rc<Self>, index: BlockIndex, initialize: bool) -> Result<BlockHandle> {
        {
            let mut state = self.state.borrow_mut();
            if let Some(msg) = state.stashed.remove(&index) {
                return Err(Error::Io(format!(
                    "deferred write failure for block {}: {}",
                    index, msg
                )));
            }
            if let Some(entry) = state.blocks.get(&index).cloned() {
                entry.pins.set(entry.pins.get() + 1);
                state.lru.pop(&index);
                return Ok(BlockHandle {
                    engine: self.clone(),
                    index,
                    entry,
                });
            }
        }

        let data = if initialize {
            vec![0u8; self.block_size]
        } else {
            let mut buf = vec![0u8; self.block_size];
            let offset = index.value() * self.block_size as u64;
            self.file.borrow_mut().read_at(offset, &mut buf)?;
            buf
        };

        let entry = Rc::new(BlockEntry {
            data: RefCell::new(data),
            dirty: Cell::new(false),
            pins: Cell::new(1),
        });

        {
            let mut state = self.state.borrow_mut();
            state.blocks.insert(index, entry.clone());
        }
        self.trim_cache()?;

        Ok(BlockHandle {
            engine: self.clone(),
            index,
            entry,
        })
    }

    fn mark_dirty(&self, index: BlockIndex) {
        self.state.borrow_mut().dirty.insert(index);
    }

    fn unpin(&self, index: BlockIndex) {
        let mut state = self.state.borrow_mut();
        if state.blocks.contains_key(&index) {
            state.lru.put(index, ());
        }
        drop(state);
        let _ = self.trim_cache();
    }

    /// Evicts unpinned blocks down to the nominal cache size. A block whose
    /// write-back fails is kept resident and its error is stashed; it will
    /// be re-raised the next time that block is pinned or flushed.
    fn trim_cache(&self) -> Result<()> {
        loop {
            let over_budget = {
                let state = self.state.borrow();
                state.lru.len() > self.cache_blocks
            };
            if !over_budget {
                return Ok(());
            }
            let victim = {
                let mut state = self.state.borrow_mut();
                state.lru.pop_lru().map(|(index, _)| index)
            };
            let Some(index) = victim else { return Ok(()) };
            if let Err(e) = self.flush(index) {
                log::warn!("deferred write-back failure for block {}: {}", index, e);
                self.state.borrow_mut().stashed.insert(index, e.to_string());
                continue;
            }
            log::trace!("evicted block {} from cache", index);
            self.state.borrow_mut().blocks.remove(&index);
        }
    }

    /// Writes a single block back to the file if it is dirty.
    pub fn flush(&self, index: BlockIndex) -> Result<()> {
        let entry = {
            let state = self.state.borrow();
            state.blocks.get(&index).cloned()
        };
        let Some(entry) = entry else { return Ok(()) };
        if !entry.dirty.get() {
            return Ok(());
        }
        let offset = index.value() * self.block_size as u64;
        let data = entry.data.borrow();
        self.file.borrow_mut().write_at(offset, &data)?;
        drop(data);
        entry.dirty.set(false);
        self.state.borrow_mut().dirty.remove(&index);
        Ok(())
    }

    /// Writes every dirty block back to the file and syncs it.
    ///
    /// If previous evictions stashed write failures, every one of them is
    /// surfaced here (and cleared) before any further flushing happens --
    /// none is silently dropped, even if more than one block failed.
    pub fn flush_all(&self) -> Result<()> {
        let stashed: Vec<(BlockIndex, String)> = self.state.borrow_mut().stashed.drain().collect();
        if !stashed.is_empty() {
            let detail = stashed
                .iter()
                .map(|(index, msg)| format!("block {}: {}", index, msg))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::Io(format!("deferred write failure(s): {}", detail)));
        }
        let dirty: Vec<BlockIndex> = self.state.borrow().dirty.iter().copied().collect();
        for index in dirty {
            self.flush(index)?;
        }
        self.file.borrow_mut().sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemoryBackend;

    fn new_engine(block_size: usize, blocks: u64, cache_blocks: usize) -> Rc<Engine> {
        let mut backend = MemoryBackend::new();
        backend.truncate(block_size as u64 * blocks).unwrap();
        Engine::new(Box::new(backend), block_size, cache_blocks)
    }

    #[test]
    fn pin_write_flush_read_back() {
        let engine = new_engine(64, 4, 4);
        let handle = engine.pin(BlockIndex::new(1), false).unwrap();
        handle.data_mut()[0..4].copy_from_slice(&[1, 2, 3, 4]);
        drop(handle);
        engine.flush_all().unwrap();

        let handle = engine.pin(BlockIndex::new(1), false).unwrap();
        assert_eq!(&handle.data()[0..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn clone_keeps_block_pinned_across_eviction_pressure() {
        let engine = new_engine(16, 32, 2);
        let pinned = engine.pin(BlockIndex::new(1), false).unwrap();
        let _also_pinned = pinned.clone();
        for i in 2..30 {
            drop(engine.pin(BlockIndex::new(i), false).unwrap());
        }
        // still resolvable without re-reading from scratch: pin again and
        // confirm it's the same backing entry by writing through one handle
        // and reading through the other.
        pinned.data_mut()[0] = 9;
        assert_eq!(_also_pinned.data()[0], 9);
    }

    #[test]
    fn grow_extends_file_and_new_blocks_read_zero() {
        let engine = new_engine(16, 1, 4);
        let first_new = engine.grow(2).unwrap();
        assert_eq!(first_new, BlockIndex::new(1));
        let handle = engine.pin(BlockIndex::new(1), false).unwrap();
        assert_eq!(&handle.data()[..], &[0u8; 16]);
    }

    #[test]
    fn initialize_skips_read_and_starts_zeroed() {
        let engine = new_engine(16, 4, 4);
        let handle = engine.pin(BlockIndex::new(2), true).unwrap();
        assert_eq!(&handle.data()[..], &[0u8; 16]);
    }

    #[test]
    fn address_block_offset_round_trip() {
        let engine = new_engine(512, 4, 4);
        let addr = engine.address_of(BlockIndex::new(3), 17);
        assert_eq!(engine.block_of(addr), BlockIndex::new(3));
        assert_eq!(engine.offset_of(addr), 17);
    }
}
