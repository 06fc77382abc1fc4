//! A dynamically growing on-disk hash table using linear hashing.
//!
//! Primary buckets live in one contiguous, reallocatable run of blocks
//! (`bucket_start .. bucket_start + bucket_capacity`), addressed directly
//! by bucket index -- growing it is a single [`crate::allocator::Allocator::reallocate`]
//! call, since the allocator already preserves block content across a
//! grow-in-place or copy. A bucket that overflows its one block chains to
//! an extra block allocated on demand, linked through a header field,
//! mirroring the original source's primary/overflow bucket design.
//! Buckets only ever grow one at a time (the classic linear-hashing
//! "split pointer" scheme) so the table never needs to rehash everything
//! at once the way a doubling hash map does.

pub mod typed;

use std::rc::Rc;

use prequel_derive::Serializable;

use crate::address::BlockIndex;
use crate::allocator::Allocator;
use crate::engine::Engine;
use crate::error::Result;
use crate::handle::Handle;
use crate::serialize::Serializable;

const BUCKET_HEADER: usize = 4 + 8;
const INITIAL_BUCKETS: u64 = 4;

/// Persistent root state of a [`HashTable`].
#[derive(Serializable, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HashTableAnchor {
    bucket_start: BlockIndex,
    bucket_capacity: u64,
    bucket_count: u64,
    level: u32,
    split: u64,
    size: u64,
}

/// FNV-1a, the source library's default hash for raw byte keys.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// A growable on-disk hash table over values of type `V`, keyed by `key_of`.
pub struct HashTable<V, K, F>
where
    V: Serializable + Clone,
    K: Serializable + Clone + Eq,
    F: Fn(&V) -> K,
{
    engine: Rc<Engine>,
    allocator: Rc<dyn Allocator>,
    anchor: Handle<HashTableAnchor>,
    key_of: F,
    capacity_per_bucket: usize,
}

impl<V, K, F> HashTable<V, K, F>
where
    V: Serializable + Clone,
    K: Serializable + Clone + Eq,
    F: Fn(&V) -> K,
{
    /// Opens (or, if the anchor is empty, creates) a hash table anchored at
    /// `anchor`.
    pub fn new(
        engine: Rc<Engine>,
        allocator: Rc<dyn Allocator>,
        anchor: Handle<HashTableAnchor>,
        key_of: F,
    ) -> Result<Self> {
        let capacity_per_bucket = (engine.block_size() - BUCKET_HEADER) / V::SERIALIZED_SIZE;
        let table = HashTable {
            engine,
            allocator,
            anchor,
            key_of,
            capacity_per_bucket,
        };

        if table.anchor.get()?.bucket_capacity == 0 {
            let start = table.allocator.allocate(INITIAL_BUCKETS)?;
            for i in 0..INITIAL_BUCKETS {
                let handle = table.engine.pin(start.offset(i), true)?;
                let mut data = handle.data_mut();
                write_bucket_header(&mut data, 0, BlockIndex::INVALID);
            }
            table.anchor.set(&HashTableAnchor {
                bucket_start: start,
                bucket_capacity: INITIAL_BUCKETS,
                bucket_count: INITIAL_BUCKETS,
                level: 0,
                split: 0,
                size: 0,
            });
        }
        Ok(table)
    }

    /// Number of values currently stored.
    pub fn len(&self) -> Result<u64> {
        Ok(self.anchor.get()?.size)
    }

    /// `true` if the table holds no values.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn hash_of(&self, key: &K) -> u64 {
        let mut buf = vec![0u8; K::SERIALIZED_SIZE];
        key.serialize(&mut buf);
        fnv1a(&buf)
    }

    /// The logical bucket a key hashes to, per the standard linear-hashing
    /// rule: use the next power-of-two modulus unless the bucket that
    /// would fall into is one not yet split this round.
    fn bucket_for(&self, key: &K, level: u32, split: u64) -> Result<u64> {
        let h = self.hash_of(key);
        let modulus_now = INITIAL_BUCKETS << level;
        let mut idx = h % modulus_now;
        if idx < split {
            idx = h % (modulus_now << 1);
        }
        Ok(idx)
    }

    fn bucket_block(&self, anchor: &HashTableAnchor, idx: u64) -> BlockIndex {
        anchor.bucket_start.offset(idx)
    }

    /// Inserts `value`, replacing any existing value with the same key.
    pub fn insert(&mut self, value: V) -> Result<()> {
        let anchor = self.anchor.get()?;
        let key = (self.key_of)(&value);
        let idx = self.bucket_for(&key, anchor.level, anchor.split)?;
        let mut block = self.bucket_block(&anchor, idx);

        let mut inserted_new = false;
        loop {
            let handle = self.engine.pin(block, false)?;
            let mut data = handle.data_mut();
            let (count, overflow) = read_bucket_header(&data);
            for i in 0..count as usize {
                let existing = read_entry::<V>(&data, i);
                if (self.key_of)(&existing) == key {
                    write_entry(&mut data, i, &value);
                    drop(data);
                    return Ok(());
                }
            }
            if (count as usize) < self.capacity_per_bucket {
                write_entry(&mut data, count as usize, &value);
                write_bucket_header(&mut data, count + 1, overflow);
                inserted_new = true;
                break;
            }
            if overflow.is_valid() {
                block = overflow;
                continue;
            }
            drop(data);
            let new_overflow = self.allocator.allocate(1)?;
            {
                let overflow_handle = self.engine.pin(new_overflow, true)?;
                let mut overflow_data = overflow_handle.data_mut();
                write_bucket_header(&mut overflow_data, 0, BlockIndex::INVALID);
            }
            let handle = self.engine.pin(block, false)?;
            let mut data = handle.data_mut();
            let (count, _) = read_bucket_header(&data);
            write_bucket_header(&mut data, count, new_overflow);
            block = new_overflow;
        }

        if inserted_new {
            let mut anchor = self.anchor.get()?;
            anchor.size += 1;
            self.anchor.set(&anchor);
            self.maybe_split()?;
        }
        Ok(())
    }

    /// Looks up the value stored under `key`, if any.
    pub fn lookup(&self, key: &K) -> Result<Option<V>> {
        let anchor = self.anchor.get()?;
        let idx = self.bucket_for(key, anchor.level, anchor.split)?;
        let mut block = self.bucket_block(&anchor, idx);
        loop {
            let handle = self.engine.pin(block, false)?;
            let data = handle.data();
            let (count, overflow) = read_bucket_header(&data);
            for i in 0..count as usize {
                let value = read_entry::<V>(&data, i);
                if &(self.key_of)(&value) == key {
                    return Ok(Some(value));
                }
            }
            if !overflow.is_valid() {
                return Ok(None);
            }
            block = overflow;
        }
    }

    /// Removes the value stored under `key`; returns `true` if it existed.
    pub fn erase(&mut self, key: &K) -> Result<bool> {
        let anchor = self.anchor.get()?;
        let idx = self.bucket_for(key, anchor.level, anchor.split)?;
        let primary = self.bucket_block(&anchor, idx);
        let mut block = primary;
        let mut prev: Option<BlockIndex> = None;
        loop {
            let handle = self.engine.pin(block, false)?;
            let mut data = handle.data_mut();
            let (count, overflow) = read_bucket_header(&data);
            let mut found = None;
            for i in 0..count as usize {
                let value = read_entry::<V>(&data, i);
                if &(self.key_of)(&value) == key {
                    found = Some(i);
                    break;
                }
            }
            if let Some(i) = found {
                for j in i..count as usize - 1 {
                    let v = read_entry::<V>(&data, j + 1);
                    write_entry(&mut data, j, &v);
                }
                let new_count = count - 1;
                write_bucket_header(&mut data, new_count, overflow);
                let empty_overflow_block = new_count == 0 && block != primary;
                drop(data);
                if empty_overflow_block {
                    if let Some(p) = prev {
                        let prev_handle = self.engine.pin(p, false)?;
                        let mut prev_data = prev_handle.data_mut();
                        let (pc, _) = read_bucket_header(&prev_data);
                        write_bucket_header(&mut prev_data, pc, overflow);
                    }
                    self.allocator.free(block, 1)?;
                }
                let mut anchor = self.anchor.get()?;
                anchor.size -= 1;
                self.anchor.set(&anchor);
                return Ok(true);
            }
            if !overflow.is_valid() {
                return Ok(false);
            }
            prev = Some(block);
            block = overflow;
        }
    }

    /// Performs one linear-hashing split step if the average chain length
    /// has grown past one bucket's worth of entries.
    fn maybe_split(&mut self) -> Result<()> {
        let anchor = self.anchor.get()?;
        let capacity_now = anchor.bucket_count * self.capacity_per_bucket as u64;
        if anchor.size <= capacity_now {
            return Ok(());
        }

        let mut anchor = anchor;
        if anchor.bucket_count == anchor.bucket_capacity {
            let new_capacity = anchor.bucket_capacity * 2;
            let new_start = self
                .allocator
                .reallocate(anchor.bucket_start, anchor.bucket_capacity, new_capacity)?;
            anchor.bucket_start = new_start;
            anchor.bucket_capacity = new_capacity;
        }

        let old_idx = anchor.split;
        let new_idx = anchor.bucket_count;
        let old_block = anchor.bucket_start.offset(old_idx);
        let new_block = anchor.bucket_start.offset(new_idx);
        {
            let handle = self.engine.pin(new_block, true)?;
            let mut data = handle.data_mut();
            write_bucket_header(&mut data, 0, BlockIndex::INVALID);
        }

        // collect every entry currently chained under the old bucket, then
        // redistribute between the old and new bucket under the doubled
        // modulus.
        let mut entries = Vec::new();
        let mut chain_blocks = Vec::new();
        let mut block = old_block;
        loop {
            chain_blocks.push(block);
            let handle = self.engine.pin(block, false)?;
            let data = handle.data();
            let (count, overflow) = read_bucket_header(&data);
            for i in 0..count as usize {
                entries.push(read_entry::<V>(&data, i));
            }
            if !overflow.is_valid() {
                break;
            }
            block = overflow;
        }

        {
            let handle = self.engine.pin(old_block, false)?;
            let mut data = handle.data_mut();
            write_bucket_header(&mut data, 0, BlockIndex::INVALID);
        }
        for &overflow_block in &chain_blocks[1..] {
            self.allocator.free(overflow_block, 1)?;
        }

        let new_level = anchor.level;
        let new_modulus = INITIAL_BUCKETS << (new_level + 1);
        let mut old_bucket_entries = Vec::new();
        let mut new_bucket_entries = Vec::new();
        for entry in entries {
            let key = (self.key_of)(&entry);
            let h = self.hash_of(&key);
            if h % new_modulus == new_idx {
                new_bucket_entries.push(entry);
            } else {
                old_bucket_entries.push(entry);
            }
        }
        self.append_raw(old_block, &old_bucket_entries)?;
        self.append_raw(new_block, &new_bucket_entries)?;

        anchor.bucket_count += 1;
        anchor.split += 1;
        if anchor.split == INITIAL_BUCKETS << anchor.level {
            anchor.split = 0;
            anchor.level += 1;
        }
        self.anchor.set(&anchor);
        Ok(())
    }

    /// Writes `values` into the chain starting at `start`, allocating
    /// overflow blocks as needed. `start` must already have an empty
    /// header.
    fn append_raw(&self, start: BlockIndex, values: &[V]) -> Result<()> {
        let mut block = start;
        let mut i = 0usize;
        while i < values.len() {
            let take = (values.len() - i).min(self.capacity_per_bucket);
            let handle = self.engine.pin(block, false)?;
            let mut data = handle.data_mut();
            for (j, v) in values[i..i + take].iter().enumerate() {
                write_entry(&mut data, j, v);
            }
            i += take;
            if i < values.len() {
                let next = self.allocator.allocate(1)?;
                {
                    let next_handle = self.engine.pin(next, true)?;
                    let mut next_data = next_handle.data_mut();
                    write_bucket_header(&mut next_data, 0, BlockIndex::INVALID);
                }
                write_bucket_header(&mut data, take as u32, next);
                block = next;
            } else {
                write_bucket_header(&mut data, take as u32, BlockIndex::INVALID);
            }
        }
        Ok(())
    }
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes(buf.try_into().unwrap())
}

fn write_u32(buf: &mut [u8], value: u32) {
    buf.copy_from_slice(&value.to_be_bytes());
}

fn read_bucket_header(data: &[u8]) -> (u32, BlockIndex) {
    let count = read_u32(&data[0..4]);
    let overflow = BlockIndex::deserialize(&data[4..12]).unwrap();
    (count, overflow)
}

fn write_bucket_header(data: &mut [u8], count: u32, overflow: BlockIndex) {
    write_u32(&mut data[0..4], count);
    overflow.serialize(&mut data[4..12]);
}

fn read_entry<V: Serializable>(data: &[u8], i: usize) -> V {
    let size = V::SERIALIZED_SIZE;
    let start = BUCKET_HEADER + i * size;
    V::deserialize(&data[start..start + size]).unwrap()
}

fn write_entry<V: Serializable>(data: &mut [u8], i: usize, value: &V) {
    let size = V::SERIALIZED_SIZE;
    let start = BUCKET_HEADER + i * size;
    value.serialize(&mut data[start..start + size]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::default::DefaultAllocator;
    use crate::vfs::MemoryBackend;
    use prequel_derive::Serializable;

    #[derive(Serializable, Debug, Clone, Copy, PartialEq, Eq)]
    struct Entry {
        key: u32,
        payload: u32,
    }

    fn new_table() -> HashTable<Entry, u32, fn(&Entry) -> u32> {
        let mut backend = MemoryBackend::new();
        backend.truncate(128 * 64).unwrap();
        let engine = Engine::new(Box::new(backend), 128, 64);
        let allocator = DefaultAllocator::create(engine.clone(), BlockIndex::new(0)).unwrap();
        let allocator: Rc<dyn Allocator> = Rc::new(allocator);
        let anchor_block = engine.pin(allocator.allocate(1).unwrap(), true).unwrap();
        let anchor: Handle<HashTableAnchor> = Handle::new(anchor_block, 0);
        anchor.set(&HashTableAnchor::default());
        HashTable::new(engine, allocator, anchor, |e: &Entry| e.key).unwrap()
    }

    #[test]
    fn insert_lookup_many_triggers_splits() {
        let mut table = new_table();
        for i in 0..300u32 {
            table.insert(Entry { key: i, payload: i * 3 }).unwrap();
        }
        assert_eq!(table.len().unwrap(), 300);
        for i in 0..300u32 {
            assert_eq!(table.lookup(&i).unwrap(), Some(Entry { key: i, payload: i * 3 }));
        }
        assert_eq!(table.lookup(&99999).unwrap(), None);
    }

    #[test]
    fn overwrite_existing_key() {
        let mut table = new_table();
        table.insert(Entry { key: 1, payload: 10 }).unwrap();
        table.insert(Entry { key: 1, payload: 20 }).unwrap();
        assert_eq!(table.len().unwrap(), 1);
        assert_eq!(table.lookup(&1).unwrap(), Some(Entry { key: 1, payload: 20 }));
    }

    #[test]
    fn erase_removes_entry() {
        let mut table = new_table();
        for i in 0..50u32 {
            table.insert(Entry { key: i, payload: i }).unwrap();
        }
        for i in 0..20u32 {
            assert!(table.erase(&i).unwrap());
        }
        assert_eq!(table.len().unwrap(), 30);
        assert_eq!(table.lookup(&10).unwrap(), None);
        assert_eq!(table.lookup(&40).unwrap().map(|e| e.key), Some(40));
        assert!(!table.erase(&10).unwrap());
    }
}
