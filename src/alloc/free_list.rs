//! General-purpose run allocator with a persistent free-run chain.
//!
//! Each free run stores a small header in its first block: the index of the
//! next free run and the run's length in blocks. Allocation walks the chain
//! first-fit, splitting a larger run and keeping the tail; a miss grows the
//! file at its end. Frees push onto the chain head. Adjacent free runs are
//! not coalesced.

use zerocopy::big_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::Allocator;
use crate::anchor::{AnchorHandle, BlockIndex};
use crate::engine::Engine;
use crate::error::{Error, Result};

/// Persistent state of a [`FreeListAllocator`]. 8 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FreeListAnchor {
    free_head: U64,
}

impl FreeListAnchor {
    pub fn new() -> Self {
        Self {
            free_head: U64::new(BlockIndex::NIL.raw()),
        }
    }

    be_accessors! {
        free_head: block_index,
    }
}

impl Default for FreeListAnchor {
    fn default() -> Self {
        Self::new()
    }
}

/// Header written into the first block of every free run.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct RunHeader {
    next: U64,
    length: U64,
}

impl RunHeader {
    be_accessors! {
        next: block_index,
        length: u64,
    }
}

const RUN_HEADER_SIZE: usize = std::mem::size_of::<RunHeader>();

/// First-fit run allocator backed by a persistent free-run chain.
pub struct FreeListAllocator<'a> {
    engine: &'a Engine,
    anchor: AnchorHandle<FreeListAnchor>,
}

impl<'a> FreeListAllocator<'a> {
    pub fn new(anchor: AnchorHandle<FreeListAnchor>, engine: &'a Engine) -> Result<Self> {
        if (engine.block_size() as usize) < RUN_HEADER_SIZE {
            return Err(Error::bad_argument(
                "block size too small for a free-run header",
            ));
        }
        Ok(Self { engine, anchor })
    }

    fn read_run(&self, block: BlockIndex) -> Result<(BlockIndex, u64)> {
        let guard = self.engine.pin(block, false)?;
        let header = RunHeader::read_from_bytes(&guard.data()[..RUN_HEADER_SIZE])
            .map_err(|_| Error::corruption("unreadable free-run header"))?;
        Ok((header.next(), header.length()))
    }

    fn write_run(&self, block: BlockIndex, next: BlockIndex, length: u64) -> Result<()> {
        let mut header = RunHeader {
            next: U64::new(0),
            length: U64::new(0),
        };
        header.set_next(next);
        header.set_length(length);
        // The block belongs to a free run; its content is dead, so skip the
        // file read.
        let mut guard = self.engine.pin(block, true)?;
        guard.write_at(0, header.as_bytes());
        Ok(())
    }
}

impl Allocator for FreeListAllocator<'_> {
    fn engine(&self) -> &Engine {
        self.engine
    }

    fn allocate(&self, n: u64) -> Result<BlockIndex> {
        if n == 0 {
            return Err(Error::bad_argument("allocation of zero blocks"));
        }

        let mut anchor = self.anchor.load(self.engine)?;

        // First fit over the free-run chain.
        let mut prev: Option<(BlockIndex, BlockIndex, u64)> = None; // (run, next, length)
        let mut cursor = anchor.free_head();
        while !cursor.is_nil() {
            let (next, length) = self.read_run(cursor)?;
            if length == 0 {
                return Err(Error::corruption(format!(
                    "zero-length free run at block {}",
                    cursor
                )));
            }
            if length >= n {
                let replacement = if length == n {
                    next
                } else {
                    let tail = cursor.offset(n);
                    self.write_run(tail, next, length - n)?;
                    tail
                };
                match prev {
                    None => {
                        anchor.set_free_head(replacement);
                        self.anchor.store(self.engine, &anchor)?;
                    }
                    Some((prev_run, _, prev_len)) => {
                        self.write_run(prev_run, replacement, prev_len)?;
                    }
                }
                tracing::trace!(first = %cursor, blocks = n, "allocated run from free list");
                return Ok(cursor);
            }
            prev = Some((cursor, next, length));
            cursor = next;
        }

        // No fit: grow the file at its tail.
        let first = BlockIndex::new(self.engine.size());
        self.engine.grow(n)?;
        tracing::debug!(first = %first, blocks = n, "free-list allocator grew file");
        Ok(first)
    }

    fn free(&self, first: BlockIndex, n: u64) -> Result<()> {
        if n == 0 {
            return Err(Error::bad_argument("free of zero blocks"));
        }
        if first.is_nil() {
            return Err(Error::bad_argument("free of nil block index"));
        }

        let mut anchor = self.anchor.load(self.engine)?;
        self.write_run(first, anchor.free_head(), n)?;
        anchor.set_free_head(first);
        self.anchor.store(self.engine, &anchor)
    }
}
