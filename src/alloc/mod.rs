//! # Block Allocators
//!
//! Containers never grow the file themselves; they ask an [`Allocator`] for
//! runs of blocks and give them back when done. The allocator also hands
//! containers their engine reference, so a container is constructed from
//! just an anchor handle and an allocator.
//!
//! Two implementations ship with the crate:
//!
//! - [`NodeAllocator`]: single-block allocation with a persistent free
//!   chain threaded through the free blocks themselves. The right choice
//!   for node-based containers (stack, B+-tree).
//! - [`FreeListAllocator`]: general-purpose run allocation, first-fit over
//!   a persistent chain of free runs with run splitting. The right choice
//!   for extent-backed containers (array).
//!
//! Both persist their state in an anchor, so a reopened file allocates
//! from where it left off. A file should be managed by exactly one
//! allocator; blocks the embedder reserves (e.g. a header block) must be
//! taken out of circulation before the allocator first grows the file.

mod free_list;
mod node;

pub use free_list::{FreeListAllocator, FreeListAnchor};
pub use node::{NodeAllocator, NodeAllocatorAnchor, DEFAULT_CHUNK_SIZE};

use crate::anchor::BlockIndex;
use crate::engine::Engine;
use crate::error::Result;

/// Hands out and reclaims runs of blocks.
pub trait Allocator {
    /// The engine whose file this allocator manages.
    fn engine(&self) -> &Engine;

    /// Block size of the managed file.
    fn block_size(&self) -> u32 {
        self.engine().block_size()
    }

    /// Allocates a contiguous run of `n` blocks and returns its first
    /// block index.
    fn allocate(&self, n: u64) -> Result<BlockIndex>;

    /// Returns the run `[first, first + n)` to the allocator.
    fn free(&self, first: BlockIndex, n: u64) -> Result<()>;
}
