//! # Block Indices and Anchor Handles
//!
//! Every container in shelfdb roots its persistent state in an **anchor**: a
//! small fixed-layout record that lives wherever the embedder puts it — in
//! a file header block, inside another container's values, or (for
//! transient structures) in plain memory. The container itself owns nothing
//! durable except what the anchor describes.
//!
//! [`AnchorHandle`] is the typed accessor for one such record: "reach into
//! this block at this offset, read or write the anchor". Sub-records (an
//! array anchor embeds its extent's anchor) are reached through
//! [`AnchorHandle::member`], normally via the [`anchor_member!`] macro which
//! computes the field offset at compile time.
//!
//! Anchor records are `#[repr(C)]` structs built entirely from the unaligned
//! `zerocopy::big_endian` integer wrappers, so their in-memory layout *is*
//! the wire format and they parse at any byte offset.
//!
//! [`anchor_member!`]: crate::anchor_member

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::engine::Engine;
use crate::error::{Error, Result};

/// Index of a block inside an engine's file.
///
/// The all-ones value is the NIL sentinel ("no block"), used wherever a
/// persistent pointer can be absent.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIndex(u64);

impl BlockIndex {
    /// The null block reference.
    pub const NIL: BlockIndex = BlockIndex(u64::MAX);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        BlockIndex(raw)
    }

    /// The raw on-disk representation, including the NIL sentinel.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_nil(self) -> bool {
        self.0 == u64::MAX
    }

    /// The `i`-th block after this one.
    #[inline]
    pub fn offset(self, i: u64) -> BlockIndex {
        debug_assert!(!self.is_nil(), "offset from NIL block index");
        BlockIndex(self.0 + i)
    }
}

impl fmt::Debug for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "BlockIndex(nil)")
        } else {
            write!(f, "BlockIndex({})", self.0)
        }
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "nil")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Marker for types usable as anchor records.
///
/// Satisfied by any `#[repr(C)]` struct composed of zerocopy big-endian
/// fields (and explicit padding); the blanket impl covers them all.
pub trait AnchorRecord:
    FromBytes + IntoBytes + Immutable + KnownLayout + Unaligned + Copy
{
}

impl<T> AnchorRecord for T where
    T: FromBytes + IntoBytes + Immutable + KnownLayout + Unaligned + Copy
{
}

enum Backing {
    /// The record lives inside an engine block.
    Block { block: BlockIndex, offset: u32 },
    /// The record lives in a shared in-memory buffer (transient anchors;
    /// sub-handles of one buffer alias the same allocation).
    Memory {
        bytes: Rc<RefCell<Box<[u8]>>>,
        offset: u32,
    },
}

impl Clone for Backing {
    fn clone(&self) -> Self {
        match self {
            Backing::Block { block, offset } => Backing::Block {
                block: *block,
                offset: *offset,
            },
            Backing::Memory { bytes, offset } => Backing::Memory {
                bytes: Rc::clone(bytes),
                offset: *offset,
            },
        }
    }
}

/// Typed accessor for a persistent anchor record.
pub struct AnchorHandle<A: AnchorRecord> {
    backing: Backing,
    _marker: PhantomData<fn() -> A>,
}

impl<A: AnchorRecord> Clone for AnchorHandle<A> {
    fn clone(&self) -> Self {
        Self {
            backing: self.backing.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: AnchorRecord> AnchorHandle<A> {
    /// A handle to a record embedded in `block` at `offset`.
    pub fn in_block(block: BlockIndex, offset: u32) -> Self {
        Self {
            backing: Backing::Block { block, offset },
            _marker: PhantomData,
        }
    }

    /// A handle to a fresh in-memory record initialized to `record`.
    ///
    /// The record does not survive the handle (and its clones); use a
    /// block-embedded handle for durable anchors.
    pub fn in_memory(record: &A) -> Self {
        let bytes: Box<[u8]> = record.as_bytes().into();
        Self {
            backing: Backing::Memory {
                bytes: Rc::new(RefCell::new(bytes)),
                offset: 0,
            },
            _marker: PhantomData,
        }
    }

    /// Serialized size of the record in bytes.
    pub const fn record_size() -> usize {
        std::mem::size_of::<A>()
    }

    /// Reads the whole record.
    pub fn load(&self, engine: &Engine) -> Result<A> {
        let size = Self::record_size();
        match &self.backing {
            Backing::Block { block, offset } => {
                let start = *offset as usize;
                self.check_block_range(engine, start, size)?;
                let guard = engine.pin(*block, false)?;
                let record = A::read_from_bytes(&guard.data()[start..start + size])
                    .map_err(|_| Error::corruption("unreadable anchor record"))?;
                Ok(record)
            }
            Backing::Memory { bytes, offset } => {
                let bytes = bytes.borrow();
                let start = *offset as usize;
                A::read_from_bytes(&bytes[start..start + size])
                    .map_err(|_| Error::corruption("unreadable anchor record"))
            }
        }
    }

    /// Writes the whole record.
    pub fn store(&self, engine: &Engine, record: &A) -> Result<()> {
        let size = Self::record_size();
        match &self.backing {
            Backing::Block { block, offset } => {
                let start = *offset as usize;
                self.check_block_range(engine, start, size)?;
                let mut guard = engine.pin(*block, false)?;
                guard.data_mut()[start..start + size].copy_from_slice(record.as_bytes());
                Ok(())
            }
            Backing::Memory { bytes, offset } => {
                let mut bytes = bytes.borrow_mut();
                let start = *offset as usize;
                bytes[start..start + size].copy_from_slice(record.as_bytes());
                Ok(())
            }
        }
    }

    /// Derives a handle to a sub-record at `field_offset` bytes into this
    /// record. Use [`anchor_member!`](crate::anchor_member) so the offset is
    /// computed from the struct definition.
    pub fn member<B: AnchorRecord>(&self, field_offset: u32) -> AnchorHandle<B> {
        debug_assert!(
            field_offset as usize + std::mem::size_of::<B>() <= std::mem::size_of::<A>(),
            "sub-record exceeds parent record"
        );
        let backing = match &self.backing {
            Backing::Block { block, offset } => Backing::Block {
                block: *block,
                offset: offset + field_offset,
            },
            Backing::Memory { bytes, offset } => Backing::Memory {
                bytes: Rc::clone(bytes),
                offset: offset + field_offset,
            },
        };
        AnchorHandle {
            backing,
            _marker: PhantomData,
        }
    }

    fn check_block_range(&self, engine: &Engine, start: usize, size: usize) -> Result<()> {
        if start + size > engine.block_size() as usize {
            return Err(Error::bad_argument(format!(
                "anchor record at offset {} of {} bytes does not fit a {}-byte block",
                start,
                size,
                engine.block_size()
            )));
        }
        Ok(())
    }
}
