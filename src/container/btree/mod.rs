//! # B+-Tree
//!
//! A balanced ordered container of fixed-size values keyed by a derived
//! fixed-size key. All values live in leaf blocks; internal blocks hold
//! separator keys and child pointers. Split, merge and redistribute keep
//! every non-root node at least half full and all leaves at the same depth.
//!
//! ## Node Layout
//!
//! One node per block, no type tags (the tree's height determines what a
//! block is):
//!
//! ```text
//! Leaf:      size: u32 | value[0] | value[1] | ...
//! Internal:  size: u32 | key[0..C-1 slots] | child[0..C slots, 8 B each]
//! ```
//!
//! with `C_leaf = (block_size − 4) / value_size` and
//! `C_int = (block_size − 4) / (key_size + 8)`. The stored internal `size`
//! is the key count; a node with `size` keys has `size + 1` children.
//!
//! ## Keys
//!
//! The tree never interprets values; it derives a key from each value with
//! a user callback and orders keys with a user comparator. The separator
//! stored between two siblings is the maximum key of the left subtree, so
//! the subtree under child `i` holds exactly the keys in
//! `(key[i−1], key[i]]`.
//!
//! ## Cursors
//!
//! Every tree keeps a registry of its live [`Cursor`]s. Structural
//! mutations (split, merge, steal, root changes) patch the position of
//! every registered cursor so it keeps addressing the same logical value;
//! erasing a value marks cursors that pointed at it, and the mark clears on
//! their next successful move. See [`Cursor`] for the state machine.

mod cursor;
mod internal;
mod leaf;
mod loader;
mod tree;

pub use cursor::Cursor;
pub use loader::BulkLoader;
pub use tree::{RawBTree, TreeOptions};

use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::anchor::BlockIndex;

/// Persistent state of a [`RawBTree`]. 56 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BTreeAnchor {
    height: U32,
    _pad: [u8; 4],
    size: U64,
    root: U64,
    leftmost: U64,
    rightmost: U64,
    internal_nodes: U64,
    leaf_nodes: U64,
}

impl BTreeAnchor {
    pub fn new() -> Self {
        Self {
            height: U32::new(0),
            _pad: [0; 4],
            size: U64::new(0),
            root: U64::new(BlockIndex::NIL.raw()),
            leftmost: U64::new(BlockIndex::NIL.raw()),
            rightmost: U64::new(BlockIndex::NIL.raw()),
            internal_nodes: U64::new(0),
            leaf_nodes: U64::new(0),
        }
    }

    be_accessors! {
        height: u32,
        size: u64,
        root: block_index,
        leftmost: block_index,
        rightmost: block_index,
        internal_nodes: u64,
        leaf_nodes: u64,
    }
}

impl Default for BTreeAnchor {
    fn default() -> Self {
        Self::new()
    }
}
