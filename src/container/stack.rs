//! # Stack
//!
//! A LIFO of fixed-size values stored as a singly linked chain of nodes.
//! Each node is one block: a `{count, next}` header followed by up to
//! `node_capacity` value slots. The anchor tracks `(size, nodes, top)`.
//! Nodes are allocated one at a time, so any single-block-capable
//! [`Allocator`] works; emptied nodes are freed immediately, which keeps
//! every live node's `count` at least 1.

use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::alloc::Allocator;
use crate::anchor::{AnchorHandle, BlockIndex};
use crate::engine::Engine;
use crate::error::{Error, Result};

/// Persistent state of a [`RawStack`]: `(size, nodes, top)`. 24 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct StackAnchor {
    size: U64,
    nodes: U64,
    top: U64,
}

impl StackAnchor {
    pub fn new() -> Self {
        Self {
            size: U64::new(0),
            nodes: U64::new(0),
            top: U64::new(BlockIndex::NIL.raw()),
        }
    }

    be_accessors! {
        size: u64,
        nodes: u64,
        top: block_index,
    }
}

impl Default for StackAnchor {
    fn default() -> Self {
        Self::new()
    }
}

/// Header at the start of every stack node block. 12 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct NodeHeader {
    count: U32,
    next: U64,
}

impl NodeHeader {
    be_accessors! {
        count: u32,
        next: block_index,
    }
}

const NODE_HEADER_SIZE: usize = std::mem::size_of::<NodeHeader>();

/// A LIFO of fixed-size byte values rooted at an anchor.
pub struct RawStack<'a> {
    anchor: AnchorHandle<StackAnchor>,
    alloc: &'a dyn Allocator,
    value_size: u32,
    node_capacity: u32,
}

impl<'a> RawStack<'a> {
    /// Binds a stack rooted at `anchor`. `value_size` and `alloc` must be
    /// equivalent every time the stack is loaded.
    pub fn new(
        anchor: AnchorHandle<StackAnchor>,
        value_size: u32,
        alloc: &'a dyn Allocator,
    ) -> Result<Self> {
        if value_size == 0 {
            return Err(Error::bad_argument("value size must be positive"));
        }
        let usable = alloc.block_size() as usize;
        if usable <= NODE_HEADER_SIZE {
            return Err(Error::bad_argument(
                "block size too small for a stack node header",
            ));
        }
        let node_capacity = ((usable - NODE_HEADER_SIZE) / value_size as usize) as u32;
        if node_capacity == 0 {
            return Err(Error::bad_argument(
                "block size too small to fit a single value",
            ));
        }
        Ok(Self {
            anchor,
            alloc,
            value_size,
            node_capacity,
        })
    }

    #[inline]
    pub fn engine(&self) -> &'a Engine {
        self.alloc.engine()
    }

    /// Size of a serialized value on disk.
    #[inline]
    pub fn value_size(&self) -> u32 {
        self.value_size
    }

    /// Number of values that fit into a single node.
    #[inline]
    pub fn node_capacity(&self) -> u32 {
        self.node_capacity
    }

    /// Number of values on the stack.
    pub fn size(&self) -> Result<u64> {
        Ok(self.anchor.load(self.engine())?.size())
    }

    /// Number of allocated nodes.
    pub fn nodes(&self) -> Result<u64> {
        Ok(self.anchor.load(self.engine())?.nodes())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    /// `size / (nodes × node_capacity)`, or 0 for an empty stack.
    pub fn fill_factor(&self) -> Result<f64> {
        let anchor = self.anchor.load(self.engine())?;
        if anchor.nodes() == 0 {
            Ok(0.0)
        } else {
            Ok(anchor.size() as f64 / (anchor.nodes() * self.node_capacity as u64) as f64)
        }
    }

    /// Total on-disk footprint in bytes.
    pub fn byte_size(&self) -> Result<u64> {
        Ok(self.nodes()? * self.alloc.block_size() as u64)
    }

    /// Allocated bytes divided by used bytes.
    pub fn overhead(&self) -> Result<f64> {
        let size = self.size()?;
        if size == 0 {
            Ok(1.0)
        } else {
            Ok(self.byte_size()? as f64 / (size * self.value_size as u64) as f64)
        }
    }

    /// Copies the top value into `out` (at least `value_size` bytes).
    pub fn top(&self, out: &mut [u8]) -> Result<()> {
        self.check_value_buffer(out.len())?;
        let anchor = self.anchor.load(self.engine())?;
        if anchor.size() == 0 {
            return Err(Error::bad_operation("top on empty stack"));
        }
        let guard = self.engine().pin(anchor.top(), false)?;
        let count = self.header(guard.data())?.count();
        let offset = self.value_offset(count - 1);
        out[..self.value_size as usize]
            .copy_from_slice(&guard.data()[offset..offset + self.value_size as usize]);
        Ok(())
    }

    /// Pushes `value` onto the stack, allocating a new top node when the
    /// current one is full.
    pub fn push(&mut self, value: &[u8]) -> Result<()> {
        self.check_value_buffer(value.len())?;
        let mut anchor = self.anchor.load(self.engine())?;

        let mut top = anchor.top();
        let mut count = if top.is_nil() {
            self.node_capacity // force a fresh node
        } else {
            let guard = self.engine().pin(top, false)?;
            self.header(guard.data())?.count()
        };

        if count == self.node_capacity {
            let node = self.alloc.allocate(1)?;
            let mut guard = self.engine().pin(node, true)?;
            let mut header = NodeHeader {
                count: U32::new(0),
                next: U64::new(0),
            };
            header.set_count(0);
            header.set_next(top);
            guard.write_at(0, header.as_bytes());
            drop(guard);

            anchor.set_top(node);
            anchor.set_nodes(anchor.nodes() + 1);
            top = node;
            count = 0;
        }

        let mut guard = self.engine().pin(top, false)?;
        let offset = self.value_offset(count);
        guard.write_at(offset, &value[..self.value_size as usize]);
        let mut header = *self.header(guard.data())?;
        header.set_count(count + 1);
        guard.write_at(0, header.as_bytes());
        drop(guard);

        anchor.set_size(anchor.size() + 1);
        self.anchor.store(self.engine(), &anchor)
    }

    /// Removes the top value, freeing the top node if it empties.
    pub fn pop(&mut self) -> Result<()> {
        let mut anchor = self.anchor.load(self.engine())?;
        if anchor.size() == 0 {
            return Err(Error::bad_operation("pop on empty stack"));
        }

        let top = anchor.top();
        let mut guard = self.engine().pin(top, false)?;
        let mut header = *self.header(guard.data())?;
        let count = header.count();
        if count == 0 {
            return Err(Error::corruption(format!(
                "stack node {} has zero values",
                top
            )));
        }

        if count == 1 {
            let next = header.next();
            drop(guard);
            self.alloc.free(top, 1)?;
            anchor.set_top(next);
            anchor.set_nodes(anchor.nodes() - 1);
        } else {
            header.set_count(count - 1);
            guard.write_at(0, header.as_bytes());
            drop(guard);
        }

        anchor.set_size(anchor.size() - 1);
        self.anchor.store(self.engine(), &anchor)
    }

    /// Removes all values, freeing every node.
    pub fn clear(&mut self) -> Result<()> {
        let mut anchor = self.anchor.load(self.engine())?;
        let mut node = anchor.top();
        while !node.is_nil() {
            let next = {
                let guard = self.engine().pin(node, false)?;
                self.header(guard.data())?.next()
            };
            self.alloc.free(node, 1)?;
            node = next;
        }
        anchor.set_size(0);
        anchor.set_nodes(0);
        anchor.set_top(BlockIndex::NIL);
        self.anchor.store(self.engine(), &anchor)
    }

    /// Resets the stack to its empty state. The stack holds no spare
    /// capacity, so this is the same as [`clear`](Self::clear).
    pub fn reset(&mut self) -> Result<()> {
        self.clear()
    }

    /// Walks the chain verifying the stack's invariants.
    pub fn validate(&self) -> Result<()> {
        let anchor = self.anchor.load(self.engine())?;
        let mut total = 0u64;
        let mut chain_nodes = 0u64;
        let mut node = anchor.top();
        while !node.is_nil() {
            let guard = self.engine().pin(node, false)?;
            let header = self.header(guard.data())?;
            let count = header.count();
            if count == 0 || count > self.node_capacity {
                return Err(Error::corruption(format!(
                    "stack node {} has invalid count {}",
                    node, count
                )));
            }
            total += count as u64;
            chain_nodes += 1;
            node = header.next();
        }
        if total != anchor.size() {
            return Err(Error::corruption(format!(
                "stack size {} does not match chain total {}",
                anchor.size(),
                total
            )));
        }
        if chain_nodes != anchor.nodes() {
            return Err(Error::corruption(format!(
                "stack node count {} does not match chain length {}",
                anchor.nodes(),
                chain_nodes
            )));
        }
        if (anchor.size() == 0) != anchor.top().is_nil() {
            return Err(Error::corruption("stack size/top disagree about emptiness"));
        }
        Ok(())
    }

    fn header<'d>(&self, data: &'d [u8]) -> Result<&'d NodeHeader> {
        NodeHeader::ref_from_bytes(&data[..NODE_HEADER_SIZE])
            .map_err(|_| Error::corruption("unreadable stack node header"))
    }

    #[inline]
    fn value_offset(&self, slot: u32) -> usize {
        NODE_HEADER_SIZE + slot as usize * self.value_size as usize
    }

    fn check_value_buffer(&self, len: usize) -> Result<()> {
        if len < self.value_size as usize {
            return Err(Error::bad_argument(format!(
                "value buffer of {} bytes is smaller than the value size {}",
                len, self.value_size
            )));
        }
        Ok(())
    }
}
