//! # Extent
//!
//! A contiguous run of blocks identified by `(first, length)`, both kept in
//! a 16-byte anchor. Growing relocates: a fresh run is allocated, existing
//! blocks are copied over one at a time through the engine, and the old run
//! is freed — so an allocator failure leaves the extent untouched.
//! Shrinking frees the tail in place.

use zerocopy::big_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::alloc::Allocator;
use crate::anchor::{AnchorHandle, BlockIndex};
use crate::engine::{BlockGuard, Engine};
use crate::error::{Error, Result};

/// Persistent state of an [`Extent`]: `(first, length)`. 16 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ExtentAnchor {
    first: U64,
    length: U64,
}

impl ExtentAnchor {
    pub fn new() -> Self {
        Self {
            first: U64::new(BlockIndex::NIL.raw()),
            length: U64::new(0),
        }
    }

    be_accessors! {
        first: block_index,
        length: u64,
    }
}

impl Default for ExtentAnchor {
    fn default() -> Self {
        Self::new()
    }
}

/// A growable contiguous run of blocks owned through an anchor.
pub struct Extent<'a> {
    anchor: AnchorHandle<ExtentAnchor>,
    alloc: &'a dyn Allocator,
}

impl<'a> Extent<'a> {
    pub fn new(anchor: AnchorHandle<ExtentAnchor>, alloc: &'a dyn Allocator) -> Self {
        Self { anchor, alloc }
    }

    #[inline]
    pub fn engine(&self) -> &'a Engine {
        self.alloc.engine()
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        self.alloc.block_size()
    }

    /// Length of the extent in blocks.
    pub fn size(&self) -> Result<u64> {
        Ok(self.anchor.load(self.engine())?.length())
    }

    /// First block of the run, or NIL when the extent is empty.
    pub fn first(&self) -> Result<BlockIndex> {
        Ok(self.anchor.load(self.engine())?.first())
    }

    /// Total size of the run in bytes.
    pub fn byte_size(&self) -> Result<u64> {
        Ok(self.size()? * self.block_size() as u64)
    }

    /// Pins the `i`-th block of the run for reading and writing.
    pub fn read(&self, i: u64) -> Result<BlockGuard<'a>> {
        let anchor = self.anchor.load(self.engine())?;
        self.check_block(&anchor, i)?;
        self.engine().pin(anchor.first().offset(i), false)
    }

    /// Pins the `i`-th block zero-filled, skipping the file read. For
    /// callers about to overwrite the whole block anyway.
    pub fn overwrite_zero(&self, i: u64) -> Result<BlockGuard<'a>> {
        let anchor = self.anchor.load(self.engine())?;
        self.check_block(&anchor, i)?;
        let guard = self.engine().pin(anchor.first().offset(i), true)?;
        guard.mark_dirty();
        Ok(guard)
    }

    /// Grows or shrinks the run to `new_len` blocks.
    ///
    /// Growing allocates a new run, copies the existing blocks over and
    /// frees the old run; on allocator failure the extent is unchanged.
    /// Shrinking frees the tail; `new_len = 0` frees everything.
    pub fn resize(&self, new_len: u64) -> Result<()> {
        let mut anchor = self.anchor.load(self.engine())?;
        let (first, length) = (anchor.first(), anchor.length());

        if new_len == length {
            return Ok(());
        }

        if new_len == 0 {
            self.alloc.free(first, length)?;
            anchor.set_first(BlockIndex::NIL);
            anchor.set_length(0);
            return self.anchor.store(self.engine(), &anchor);
        }

        if new_len < length {
            self.alloc.free(first.offset(new_len), length - new_len)?;
            anchor.set_length(new_len);
            return self.anchor.store(self.engine(), &anchor);
        }

        let new_first = self.alloc.allocate(new_len)?;
        for i in 0..length {
            let src = self.engine().pin(first.offset(i), false)?;
            let mut dst = self.engine().pin(new_first.offset(i), true)?;
            dst.data_mut().copy_from_slice(src.data());
        }
        if length > 0 {
            self.alloc.free(first, length)?;
        }
        tracing::debug!(
            old_first = %first,
            new_first = %new_first,
            copied = length,
            new_len,
            "relocated extent"
        );
        anchor.set_first(new_first);
        anchor.set_length(new_len);
        self.anchor.store(self.engine(), &anchor)
    }

    /// Frees all storage. Equivalent to `resize(0)`.
    pub fn reset(&self) -> Result<()> {
        self.resize(0)
    }

    fn check_block(&self, anchor: &ExtentAnchor, i: u64) -> Result<()> {
        if i >= anchor.length() {
            return Err(Error::bad_argument(format!(
                "extent block {} out of bounds (length {})",
                i,
                anchor.length()
            )));
        }
        Ok(())
    }
}
