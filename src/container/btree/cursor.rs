//! Cursors and the live-cursor registry.
//!
//! A cursor is a live position inside a tree: the path of internal nodes
//! from the root (each with the child index taken), the leaf, and the value
//! index inside the leaf. Positions are block indices, not pinned handles,
//! so an idle cursor occupies no cache slot; nodes are re-pinned per
//! operation.
//!
//! ## State machine
//!
//! - **Valid**: addresses a concrete value.
//! - **At end** (`INVALID` without `DELETED`): past the last element, or
//!   never positioned. `get`/`set` fail; `move_prev` re-enters the tree at
//!   its maximum.
//! - **Erased** (`DELETED`): the value under the cursor was erased; the
//!   position now addresses the erased value's successor slot. `get`/`set`
//!   fail until the next successful move clears the flag.
//! - **In progress** (`INPROGRESS`): set by the tree on the cursor driving
//!   a structural mutation, which excludes it from the registry sweep that
//!   patches everyone else.
//!
//! ## Registry
//!
//! The tree keeps weak references to every cursor's state. Structural
//! mutations sweep the registry and rewrite each live cursor's position so
//! it keeps addressing the same logical value; dead entries are pruned
//! during the sweep, so dropping a cursor needs no explicit unlink.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use smallvec::SmallVec;

use crate::anchor::BlockIndex;
use crate::error::Result;

use super::tree::RawBTree;

pub(super) const FLAG_INVALID: u8 = 1 << 0;
pub(super) const FLAG_DELETED: u8 = 1 << 1;
pub(super) const FLAG_INPROGRESS: u8 = 1 << 2;

/// One level of a cursor's descent: the internal node and the child index
/// taken in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct PathEntry {
    pub node: BlockIndex,
    pub child: u32,
}

#[derive(Debug, Clone)]
pub(super) struct CursorState {
    /// Internal nodes from the root down; `path[len-1].child` is the
    /// leaf's slot in its parent.
    pub path: SmallVec<[PathEntry; 8]>,
    pub leaf: BlockIndex,
    pub index: u32,
    pub flags: u8,
}

impl CursorState {
    pub fn invalid() -> Self {
        Self {
            path: SmallVec::new(),
            leaf: BlockIndex::NIL,
            index: 0,
            flags: FLAG_INVALID,
        }
    }

    /// Drops the position, keeping only the flags in `keep`.
    pub fn reset_to_invalid(&mut self, keep: u8) {
        let kept = self.flags & keep;
        self.path.clear();
        self.leaf = BlockIndex::NIL;
        self.index = 0;
        self.flags = kept | FLAG_INVALID;
    }

    #[inline]
    pub fn is_tracked(&self) -> bool {
        self.flags & (FLAG_INVALID | FLAG_INPROGRESS) == 0
    }
}

/// Weak list of every live cursor of one tree.
pub(super) struct CursorRegistry {
    cursors: RefCell<Vec<Weak<RefCell<CursorState>>>>,
}

impl CursorRegistry {
    pub fn new() -> Self {
        Self {
            cursors: RefCell::new(Vec::new()),
        }
    }

    pub fn register(&self, state: &Rc<RefCell<CursorState>>) {
        self.cursors.borrow_mut().push(Rc::downgrade(state));
    }

    /// Applies `f` to every live cursor state, pruning dropped cursors.
    ///
    /// Callers must not hold a borrow of any registered state across this
    /// call.
    pub fn for_each(&self, mut f: impl FnMut(&mut CursorState)) {
        self.cursors.borrow_mut().retain(|weak| {
            if let Some(state) = weak.upgrade() {
                f(&mut state.borrow_mut());
                true
            } else {
                false
            }
        });
    }

    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.cursors
            .borrow()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

/// A live position inside a [`RawBTree`], kept consistent across
/// structural mutations for as long as it exists.
pub struct Cursor<'t, 'a> {
    tree: &'t RawBTree<'a>,
    state: Rc<RefCell<CursorState>>,
}

impl<'t, 'a> Cursor<'t, 'a> {
    pub(super) fn new(tree: &'t RawBTree<'a>, state: Rc<RefCell<CursorState>>) -> Self {
        Self { tree, state }
    }

    /// True when the cursor is past the end (and not merely erased).
    pub fn at_end(&self) -> bool {
        let state = self.state.borrow();
        state.flags & FLAG_INVALID != 0 && state.flags & FLAG_DELETED == 0
    }

    /// True when the value under the cursor was erased and no move has
    /// happened since.
    pub fn erased(&self) -> bool {
        self.state.borrow().flags & FLAG_DELETED != 0
    }

    /// Positions at the smallest key. Returns false on an empty tree.
    pub fn move_min(&mut self) -> Result<bool> {
        self.tree.cursor_move_extreme(&self.state, false)
    }

    /// Positions at the largest key. Returns false on an empty tree.
    pub fn move_max(&mut self) -> Result<bool> {
        self.tree.cursor_move_extreme(&self.state, true)
    }

    /// Advances to the next value; at the last value the cursor becomes
    /// at-end and false is returned.
    pub fn move_next(&mut self) -> Result<bool> {
        self.tree.cursor_move_next(&self.state)
    }

    /// Retreats to the previous value; at the first value the cursor
    /// becomes at-end and false is returned. From at-end, retreats to the
    /// maximum.
    pub fn move_prev(&mut self) -> Result<bool> {
        self.tree.cursor_move_prev(&self.state)
    }

    /// Positions at the first value whose key is not less than `key`.
    pub fn lower_bound(&mut self, key: &[u8]) -> Result<bool> {
        self.tree.cursor_lower_bound(&self.state, key)
    }

    /// Positions at the first value whose key is greater than `key`.
    pub fn upper_bound(&mut self, key: &[u8]) -> Result<bool> {
        self.tree.cursor_upper_bound(&self.state, key)
    }

    /// Positions at the value with exactly `key`, or becomes at-end.
    pub fn find(&mut self, key: &[u8]) -> Result<bool> {
        self.tree.cursor_find(&self.state, key)
    }

    /// Inserts `value`, leaving the cursor on the value with that key.
    /// Returns false when the key already existed and `overwrite` was not
    /// set (the tree is unchanged).
    pub fn insert(&mut self, value: &[u8], overwrite: bool) -> Result<bool> {
        self.tree.cursor_insert(&self.state, value, overwrite)
    }

    /// Erases the value under the cursor. The cursor becomes erased,
    /// addressing the successor position.
    pub fn erase(&mut self) -> Result<()> {
        self.tree.cursor_erase(&self.state)
    }

    /// Copies the value under the cursor into `out`.
    pub fn get(&self, out: &mut [u8]) -> Result<()> {
        self.tree.cursor_get(&self.state, out)
    }

    /// Overwrites the value under the cursor. The new value must derive
    /// the same key.
    pub fn set(&mut self, value: &[u8]) -> Result<()> {
        self.tree.cursor_set(&self.state, value)
    }
}
