//! # Paged Storage Engine
//!
//! The engine views a file as an array of fixed-size blocks and maintains a
//! bounded pool of in-memory block buffers with write-back caching. All
//! container I/O goes through it.
//!
//! ## Pin/Unpin Protocol
//!
//! Blocks must be pinned before access:
//!
//! 1. [`Engine::pin`] returns a [`BlockGuard`] (pin count incremented; the
//!    block is read from the file on a cache miss).
//! 2. The caller reads via [`BlockGuard::data`] or writes via
//!    [`BlockGuard::data_mut`], which marks the slot dirty.
//! 3. Dropping the guard unpins the slot; zero-pin slots become eviction
//!    candidates.
//!
//! Pinned slots are never evicted. When every slot is pinned and another
//! pin is requested, the engine fails with
//! [`Error::CacheExhausted`](crate::error::Error::CacheExhausted) rather
//! than growing the pool.
//!
//! ## Eviction
//!
//! A clock hand with a second-chance `visited` bit scans the slot table:
//! recently touched slots get one revolution of grace, scan-once slots go
//! quickly. Dirty victims are written back before their slot is reused.
//! Slots are recycled **in place** — a guard's cookie (the slot table
//! index) stays valid for the guard's whole lifetime.
//!
//! ## Durability
//!
//! Writes through a guard land in the cache. [`Engine::flush`] writes every
//! dirty slot and syncs the file; it is the only durability barrier.
//! Dropping the engine does not flush.
//!
//! ## Thread Safety
//!
//! The pool sits behind a single `parking_lot::RwLock` so the whole API
//! works through `&Engine`, which is what lets several containers share one
//! engine. The library as a whole is single-threaded by contract; the lock
//! is an ownership mechanism, not a concurrency guarantee.

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::anchor::BlockIndex;
use crate::error::{Error, Result};
use crate::io::FileDriver;

/// Cumulative I/O and cache counters, readable via [`Engine::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Blocks read from the file driver.
    pub reads: u64,
    /// Blocks written to the file driver.
    pub writes: u64,
    /// Pins satisfied from the cache.
    pub cache_hits: u64,
    /// Pins that had to touch the file (or zero-fill).
    pub cache_misses: u64,
}

struct Slot {
    index: BlockIndex,
    pin_count: u32,
    dirty: bool,
    visited: bool,
    data: Box<[u8]>,
}

struct BlockPool {
    slots: Vec<Slot>,
    map: HashMap<BlockIndex, u32>,
    hand: usize,
    capacity: usize,
    blocks: u64,
    stats: EngineStats,
}

impl BlockPool {
    fn new(capacity: usize, blocks: u64) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            map: HashMap::with_capacity(capacity),
            hand: 0,
            capacity,
            blocks,
            stats: EngineStats::default(),
        }
    }

    /// Picks an unpinned slot for reuse, or `None` if every slot is pinned.
    fn evict(&mut self) -> Option<u32> {
        let len = self.slots.len();
        if len == 0 || self.slots.iter().all(|s| s.pin_count > 0) {
            return None;
        }

        loop {
            let i = self.hand;
            self.hand = (self.hand + 1) % len;

            let slot = &mut self.slots[i];
            if slot.pin_count > 0 {
                continue;
            }
            if slot.visited {
                slot.visited = false;
                continue;
            }
            return Some(i as u32);
        }
    }
}

/// Fixed-block-size file abstraction with a pinnable write-back block cache.
pub struct Engine {
    file: Box<dyn FileDriver>,
    block_size: u32,
    pool: RwLock<BlockPool>,
}

impl Engine {
    /// Creates an engine over `file` with the given block size and cache
    /// capacity (in blocks). The file's current size must be a multiple of
    /// `block_size`.
    pub fn new(file: Box<dyn FileDriver>, block_size: u32, cache_blocks: usize) -> Result<Engine> {
        if block_size == 0 {
            return Err(Error::bad_argument("block size must be positive"));
        }
        if cache_blocks == 0 {
            return Err(Error::bad_argument("cache must have at least one slot"));
        }
        let file_size = file.size()?;
        if file_size % block_size as u64 != 0 {
            return Err(Error::corruption(format!(
                "file size {} is not a multiple of block size {}",
                file_size, block_size
            )));
        }
        let blocks = file_size / block_size as u64;
        Ok(Engine {
            file,
            block_size,
            pool: RwLock::new(BlockPool::new(cache_blocks, blocks)),
        })
    }

    /// Block size in bytes, fixed for the engine's lifetime.
    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of blocks currently backing the file.
    pub fn size(&self) -> u64 {
        self.pool.read().blocks
    }

    /// Cache capacity in slots.
    pub fn cache_blocks(&self) -> usize {
        self.pool.read().capacity
    }

    /// Current I/O counters.
    pub fn stats(&self) -> EngineStats {
        self.pool.read().stats
    }

    /// Extends the file by `delta` blocks. New blocks read as zero.
    pub fn grow(&self, delta: u64) -> Result<()> {
        let mut pool = self.pool.write();
        let new_blocks = pool
            .blocks
            .checked_add(delta)
            .ok_or(Error::Overflow("engine grow"))?;
        let new_bytes = new_blocks
            .checked_mul(self.block_size as u64)
            .ok_or(Error::Overflow("engine grow"))?;
        self.file.truncate(new_bytes)?;
        pool.blocks = new_blocks;
        Ok(())
    }

    /// Pins `index` into the cache and returns an access guard.
    ///
    /// With `initialize = true` the block is treated as freshly allocated:
    /// no file read happens and the buffer is zero-filled. The caller is
    /// expected to overwrite (and thereby dirty) it.
    pub fn pin(&self, index: BlockIndex, initialize: bool) -> Result<BlockGuard<'_>> {
        if index.is_nil() {
            return Err(Error::bad_argument("pin of nil block index"));
        }
        let mut pool = self.pool.write();
        if index.raw() >= pool.blocks {
            return Err(Error::bad_argument(format!(
                "block {} out of bounds (file has {} blocks)",
                index, pool.blocks
            )));
        }

        if let Some(&slot) = pool.map.get(&index) {
            pool.stats.cache_hits += 1;
            let entry = &mut pool.slots[slot as usize];
            entry.pin_count += 1;
            entry.visited = true;
            let ptr = entry.data.as_mut_ptr();
            return Ok(self.guard(index, slot, ptr));
        }

        pool.stats.cache_misses += 1;
        let slot = if pool.slots.len() < pool.capacity {
            pool.slots.push(Slot {
                index: BlockIndex::NIL,
                pin_count: 0,
                dirty: false,
                visited: false,
                data: vec![0u8; self.block_size as usize].into_boxed_slice(),
            });
            (pool.slots.len() - 1) as u32
        } else {
            let Some(victim) = pool.evict() else {
                return Err(Error::CacheExhausted {
                    capacity: pool.capacity,
                });
            };
            let entry = &pool.slots[victim as usize];
            let (old_index, was_dirty) = (entry.index, entry.dirty);
            if was_dirty {
                self.file
                    .write(old_index.raw() * self.block_size as u64, &entry.data)?;
                pool.stats.writes += 1;
            }
            // Detach fully before reuse: a failed read below must leave the
            // slot claiming no block, or a later eviction of this slot
            // could drop another slot's map entry.
            let entry = &mut pool.slots[victim as usize];
            entry.dirty = false;
            entry.index = BlockIndex::NIL;
            pool.map.remove(&old_index);
            tracing::trace!(block = %old_index, was_dirty, "evicted block");
            victim
        };

        {
            let entry = &mut pool.slots[slot as usize];
            if initialize {
                entry.data.fill(0);
            } else {
                // Read before attaching the slot so a failed read leaves it
                // detached and reusable.
                self.file
                    .read(index.raw() * self.block_size as u64, &mut entry.data)?;
            }
            entry.index = index;
            entry.pin_count = 1;
            entry.visited = true;
        }
        if !initialize {
            pool.stats.reads += 1;
        }
        pool.map.insert(index, slot);
        let ptr = pool.slots[slot as usize].data.as_mut_ptr();
        Ok(self.guard(index, slot, ptr))
    }

    /// Writes every dirty slot to the file and syncs. The only durability
    /// barrier this library provides.
    pub fn flush(&self) -> Result<()> {
        let mut pool = self.pool.write();
        let mut flushed = 0u64;
        for slot in &mut pool.slots {
            if slot.dirty {
                self.file
                    .write(slot.index.raw() * self.block_size as u64, &slot.data)?;
                slot.dirty = false;
                flushed += 1;
            }
        }
        pool.stats.writes += flushed;
        self.file.sync()?;
        tracing::debug!(flushed, "flushed dirty blocks");
        Ok(())
    }

    fn guard(&self, index: BlockIndex, slot: u32, ptr: *mut u8) -> BlockGuard<'_> {
        BlockGuard {
            engine: self,
            index,
            slot,
            ptr,
            len: self.block_size as usize,
        }
    }

    fn unpin_slot(&self, slot: u32) {
        let mut pool = self.pool.write();
        let entry = &mut pool.slots[slot as usize];
        debug_assert!(entry.pin_count > 0, "unpin of unpinned slot");
        entry.pin_count -= 1;
    }

    fn mark_dirty_slot(&self, slot: u32) {
        let mut pool = self.pool.write();
        pool.slots[slot as usize].dirty = true;
    }

    fn flush_slot(&self, slot: u32) -> Result<()> {
        let mut pool = self.pool.write();
        let entry = &mut pool.slots[slot as usize];
        if entry.dirty {
            self.file
                .write(entry.index.raw() * self.block_size as u64, &entry.data)?;
            entry.dirty = false;
            pool.stats.writes += 1;
        }
        Ok(())
    }
}

/// RAII pin over one cached block.
///
/// The `slot` field is the engine's cookie for this pinning: follow-up
/// unpin/dirty/flush calls address the cache slot directly instead of
/// re-hashing the block index.
pub struct BlockGuard<'a> {
    engine: &'a Engine,
    index: BlockIndex,
    slot: u32,
    ptr: *mut u8,
    len: usize,
}

impl BlockGuard<'_> {
    /// Index of the pinned block.
    #[inline]
    pub fn index(&self) -> BlockIndex {
        self.index
    }

    /// Read-only view of the block's bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        // SAFETY: `ptr` points into the slot's boxed buffer, which is heap
        // allocated (stable across slot-table reallocation) and cannot be
        // recycled while this guard holds a pin. The returned lifetime is
        // tied to `&self`, which cannot outlive the guard.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Writable view of the block's bytes. Marks the slot dirty.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.engine.mark_dirty_slot(self.slot);
        // SAFETY: as in `data`, the buffer is stable while pinned. `&mut
        // self` makes this guard's access exclusive; callers must not hold
        // two guards over the same block while mutating (the containers in
        // this crate never do).
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Copies `out.len()` bytes starting at `offset`.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) {
        out.copy_from_slice(&self.data()[offset..offset + out.len()]);
    }

    /// Writes `src` at `offset`, marking the slot dirty.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) {
        self.data_mut()[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Marks the slot dirty without writing through this guard.
    pub fn mark_dirty(&self) {
        self.engine.mark_dirty_slot(self.slot);
    }

    /// Writes this block (if dirty) to the file driver. Does not sync.
    pub fn flush(&self) -> Result<()> {
        self.engine.flush_slot(self.slot)
    }
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        self.engine.unpin_slot(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryStorage;

    fn engine_with(cache_blocks: usize, blocks: u64) -> (MemoryStorage, Engine) {
        let storage = MemoryStorage::new();
        let engine = Engine::new(Box::new(storage.clone()), 64, cache_blocks).unwrap();
        engine.grow(blocks).unwrap();
        (storage, engine)
    }

    #[test]
    fn engine_rejects_zero_block_size() {
        let result = Engine::new(Box::new(MemoryStorage::new()), 0, 4);
        assert!(matches!(result, Err(Error::BadArgument(_))));
    }

    #[test]
    fn grow_extends_file_with_zero_blocks() {
        let (_storage, engine) = engine_with(4, 0);
        assert_eq!(engine.size(), 0);

        engine.grow(3).unwrap();
        assert_eq!(engine.size(), 3);

        let guard = engine.pin(BlockIndex::new(2), false).unwrap();
        assert!(guard.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn pin_out_of_bounds_fails() {
        let (_storage, engine) = engine_with(4, 2);
        let result = engine.pin(BlockIndex::new(2), false);
        assert!(matches!(result, Err(Error::BadArgument(_))));
    }

    #[test]
    fn write_is_visible_to_subsequent_reads() {
        let (_storage, engine) = engine_with(4, 1);

        {
            let mut guard = engine.pin(BlockIndex::new(0), false).unwrap();
            guard.data_mut()[0] = 42;
        }

        let guard = engine.pin(BlockIndex::new(0), false).unwrap();
        assert_eq!(guard.data()[0], 42);
    }

    #[test]
    fn flush_writes_dirty_blocks_to_file() {
        let (storage, engine) = engine_with(4, 1);

        {
            let mut guard = engine.pin(BlockIndex::new(0), false).unwrap();
            guard.data_mut()[7] = 9;
        }
        engine.flush().unwrap();

        let mut buf = [0u8; 64];
        use crate::io::FileDriver;
        storage.read(0, &mut buf).unwrap();
        assert_eq!(buf[7], 9);
    }

    #[test]
    fn unflushed_writes_stay_in_cache() {
        let (storage, engine) = engine_with(4, 1);

        {
            let mut guard = engine.pin(BlockIndex::new(0), false).unwrap();
            guard.data_mut()[0] = 1;
        }

        let mut buf = [0u8; 64];
        use crate::io::FileDriver;
        storage.read(0, &mut buf).unwrap();
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn cache_exhaustion_and_recovery() {
        let (_storage, engine) = engine_with(4, 5);

        let g0 = engine.pin(BlockIndex::new(0), false).unwrap();
        let g1 = engine.pin(BlockIndex::new(1), false).unwrap();
        let g2 = engine.pin(BlockIndex::new(2), false).unwrap();
        let g3 = engine.pin(BlockIndex::new(3), false).unwrap();

        let result = engine.pin(BlockIndex::new(4), false);
        assert!(matches!(result, Err(Error::CacheExhausted { capacity: 4 })));

        drop(g1);
        let g4 = engine.pin(BlockIndex::new(4), false).unwrap();
        assert_eq!(g4.index(), BlockIndex::new(4));

        drop(g0);
        drop(g2);
        drop(g3);
    }

    #[test]
    fn eviction_writes_back_dirty_victim() {
        let (_storage, engine) = engine_with(2, 4);

        {
            let mut guard = engine.pin(BlockIndex::new(0), false).unwrap();
            guard.data_mut().fill(0xAB);
        }

        // Touch enough other blocks to force block 0 out of the two-slot
        // cache.
        for b in 1..4 {
            drop(engine.pin(BlockIndex::new(b), false).unwrap());
        }

        let guard = engine.pin(BlockIndex::new(0), false).unwrap();
        assert!(guard.data().iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn initialize_skips_file_read() {
        let (storage, engine) = engine_with(4, 1);

        use crate::io::FileDriver;
        storage.write(0, &[0xEEu8; 64]).unwrap();

        let before = engine.stats();
        let guard = engine.pin(BlockIndex::new(0), true).unwrap();
        assert!(guard.data().iter().all(|&b| b == 0));
        assert_eq!(engine.stats().reads, before.reads);
    }

    #[test]
    fn repinning_same_block_hits_cache() {
        let (_storage, engine) = engine_with(4, 1);

        drop(engine.pin(BlockIndex::new(0), false).unwrap());
        let misses = engine.stats().cache_misses;

        drop(engine.pin(BlockIndex::new(0), false).unwrap());
        assert_eq!(engine.stats().cache_misses, misses);
        assert!(engine.stats().cache_hits >= 1);
    }

    #[test]
    fn single_block_flush_writes_only_that_block() {
        let (storage, engine) = engine_with(4, 2);

        let mut g0 = engine.pin(BlockIndex::new(0), false).unwrap();
        let mut g1 = engine.pin(BlockIndex::new(1), false).unwrap();
        g0.data_mut()[0] = 1;
        g1.data_mut()[0] = 2;

        g0.flush().unwrap();

        use crate::io::FileDriver;
        let mut buf = [0u8; 64];
        storage.read(0, &mut buf).unwrap();
        assert_eq!(buf[0], 1);
        storage.read(64, &mut buf).unwrap();
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn durability_across_engine_teardown() {
        let storage = MemoryStorage::new();
        {
            let engine = Engine::new(Box::new(storage.clone()), 64, 4).unwrap();
            engine.grow(2).unwrap();
            let mut guard = engine.pin(BlockIndex::new(1), false).unwrap();
            guard.data_mut()[10] = 0x5A;
            drop(guard);
            engine.flush().unwrap();
        }

        let engine = Engine::new(Box::new(storage), 64, 4).unwrap();
        assert_eq!(engine.size(), 2);
        let guard = engine.pin(BlockIndex::new(1), false).unwrap();
        assert_eq!(guard.data()[10], 0x5A);
    }
}
