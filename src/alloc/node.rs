//! Single-block allocator with a persistent free chain.
//!
//! Freed blocks are threaded into an intrusive list: each free block stores
//! the index of the next free block in its first 8 bytes (big-endian, NIL
//! terminated). Allocation pops the head; an empty list grows the file by a
//! fixed chunk and chains the surplus blocks.

use zerocopy::big_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::Allocator;
use crate::anchor::{AnchorHandle, BlockIndex};
use crate::engine::Engine;
use crate::error::{Error, Result};

/// Number of blocks the file grows by when the free chain is empty.
pub const DEFAULT_CHUNK_SIZE: u64 = 32;

/// Persistent state of a [`NodeAllocator`]. 16 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodeAllocatorAnchor {
    free_head: U64,
    free_count: U64,
}

impl NodeAllocatorAnchor {
    pub fn new() -> Self {
        Self {
            free_head: U64::new(BlockIndex::NIL.raw()),
            free_count: U64::new(0),
        }
    }

    be_accessors! {
        free_head: block_index,
        free_count: u64,
    }
}

impl Default for NodeAllocatorAnchor {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-block allocator. `allocate(n)` with `n != 1` is a
/// [`BadArgument`](Error::BadArgument) error.
pub struct NodeAllocator<'a> {
    engine: &'a Engine,
    anchor: AnchorHandle<NodeAllocatorAnchor>,
    chunk_size: u64,
}

impl<'a> NodeAllocator<'a> {
    pub fn new(anchor: AnchorHandle<NodeAllocatorAnchor>, engine: &'a Engine) -> Result<Self> {
        if (engine.block_size() as usize) < 8 {
            return Err(Error::bad_argument(
                "block size too small for a free-chain pointer",
            ));
        }
        Ok(Self {
            engine,
            anchor,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn set_chunk_size(&mut self, chunk_size: u64) -> Result<()> {
        if chunk_size < 1 {
            return Err(Error::bad_argument("chunk size must be at least 1"));
        }
        self.chunk_size = chunk_size;
        Ok(())
    }

    /// Number of blocks currently on the free chain.
    pub fn free_count(&self) -> Result<u64> {
        Ok(self.anchor.load(self.engine)?.free_count())
    }

    fn read_next(&self, block: BlockIndex) -> Result<BlockIndex> {
        let guard = self.engine.pin(block, false)?;
        let mut raw = [0u8; 8];
        guard.read_at(0, &mut raw);
        Ok(BlockIndex::new(u64::from_be_bytes(raw)))
    }

    fn write_next(&self, block: BlockIndex, next: BlockIndex) -> Result<()> {
        let mut guard = self.engine.pin(block, true)?;
        guard.write_at(0, &next.raw().to_be_bytes());
        Ok(())
    }
}

impl Allocator for NodeAllocator<'_> {
    fn engine(&self) -> &Engine {
        self.engine
    }

    fn allocate(&self, n: u64) -> Result<BlockIndex> {
        if n != 1 {
            return Err(Error::bad_argument(format!(
                "node allocator hands out single blocks, not runs of {}",
                n
            )));
        }

        let mut anchor = self.anchor.load(self.engine)?;
        let head = anchor.free_head();
        if !head.is_nil() {
            let next = self.read_next(head)?;
            anchor.set_free_head(next);
            anchor.set_free_count(anchor.free_count() - 1);
            self.anchor.store(self.engine, &anchor)?;
            return Ok(head);
        }

        let first = BlockIndex::new(self.engine.size());
        self.engine.grow(self.chunk_size)?;
        tracing::debug!(first = %first, chunk = self.chunk_size, "node allocator grew file");

        // Hand out the first new block, chain the rest.
        let mut chain = BlockIndex::NIL;
        for i in (1..self.chunk_size).rev() {
            let block = first.offset(i);
            self.write_next(block, chain)?;
            chain = block;
        }
        anchor.set_free_head(chain);
        anchor.set_free_count(anchor.free_count() + self.chunk_size - 1);
        self.anchor.store(self.engine, &anchor)?;
        Ok(first)
    }

    fn free(&self, first: BlockIndex, n: u64) -> Result<()> {
        if n != 1 {
            return Err(Error::bad_argument(format!(
                "node allocator frees single blocks, not runs of {}",
                n
            )));
        }
        if first.is_nil() {
            return Err(Error::bad_argument("free of nil block index"));
        }

        let mut anchor = self.anchor.load(self.engine)?;
        self.write_next(first, anchor.free_head())?;
        anchor.set_free_head(first);
        anchor.set_free_count(anchor.free_count() + 1);
        self.anchor.store(self.engine, &anchor)
    }
}
