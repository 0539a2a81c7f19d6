//! Tree core: descent, insertion with recursive splits, deletion with
//! steal/merge rebalancing, and the registry sweeps that keep live cursors
//! addressing the same logical values across every structural move.

use std::cell::RefCell;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::alloc::Allocator;
use crate::anchor::{AnchorHandle, BlockIndex};
use crate::engine::Engine;
use crate::error::{Error, Result};

use super::cursor::{
    Cursor, CursorRegistry, CursorState, PathEntry, FLAG_DELETED, FLAG_INPROGRESS, FLAG_INVALID,
};
use super::internal::InternalNode;
use super::leaf::LeafNode;
use super::BTreeAnchor;

pub(super) type KeyBuf = SmallVec<[u8; 32]>;

/// Per-instance configuration of a [`RawBTree`]: fixed value and key sizes
/// plus the key-derivation and ordering callbacks.
pub struct TreeOptions {
    pub value_size: u32,
    pub key_size: u32,
    /// Writes the key of `value` into the output buffer (`key_size` bytes).
    pub derive_key: Box<dyn Fn(&[u8], &mut [u8])>,
    /// Strict ordering on keys. Equality is `!less(a, b) && !less(b, a)`.
    pub key_less: Box<dyn Fn(&[u8], &[u8]) -> bool>,
}

impl TreeOptions {
    pub fn new(
        value_size: u32,
        key_size: u32,
        derive_key: impl Fn(&[u8], &mut [u8]) + 'static,
        key_less: impl Fn(&[u8], &[u8]) -> bool + 'static,
    ) -> Self {
        Self {
            value_size,
            key_size,
            derive_key: Box::new(derive_key),
            key_less: Box::new(key_less),
        }
    }
}

/// How a split cascade rearranged one internal level, for cursor patching.
struct LevelPatch {
    path_idx: usize,
    node: BlockIndex,
    slot: u32,
    /// `(right node, m)`: children `0..=m` stayed, `m+1..` moved to the
    /// right node.
    split: Option<(BlockIndex, u32)>,
}

struct RootPatch {
    new_root: BlockIndex,
    right: BlockIndex,
}

/// Everything one insertion did to the tree's shape.
struct InsertPlan {
    leaf_old: BlockIndex,
    leaf_new: BlockIndex,
    pos: u32,
    mid: u32,
    levels: SmallVec<[LevelPatch; 4]>,
    root: Option<RootPatch>,
}

/// A B+-tree of fixed-size values ordered by a derived key, rooted at an
/// anchor.
///
/// All mutating operations go through `&self`: the persistent state lives
/// behind the engine, and the in-memory cursor registry uses interior
/// mutability so cursors (which borrow the tree) can drive mutations.
pub struct RawBTree<'a> {
    anchor: AnchorHandle<BTreeAnchor>,
    alloc: &'a dyn Allocator,
    opts: TreeOptions,
    leaf_capacity: u32,
    internal_max_children: u32,
    internal_min_children: u32,
    registry: CursorRegistry,
}

impl<'a> RawBTree<'a> {
    /// Binds a tree rooted at `anchor`. The options and allocator must be
    /// equivalent every time the tree is loaded.
    pub fn new(
        anchor: AnchorHandle<BTreeAnchor>,
        opts: TreeOptions,
        alloc: &'a dyn Allocator,
    ) -> Result<Self> {
        if opts.value_size == 0 || opts.key_size == 0 {
            return Err(Error::bad_argument("value and key sizes must be positive"));
        }
        let block_size = alloc.block_size();
        let leaf_capacity = LeafNode::capacity_for(block_size, opts.value_size);
        if leaf_capacity < 2 {
            return Err(Error::bad_argument(
                "block size too small for two values per leaf",
            ));
        }
        let internal_max_children = InternalNode::max_children_for(block_size, opts.key_size);
        if internal_max_children < 3 {
            return Err(Error::bad_argument(
                "block size too small for three children per internal node",
            ));
        }
        Ok(Self {
            anchor,
            alloc,
            opts,
            leaf_capacity,
            internal_max_children,
            internal_min_children: internal_max_children.div_ceil(2),
            registry: CursorRegistry::new(),
        })
    }

    #[inline]
    pub fn engine(&self) -> &'a Engine {
        self.alloc.engine()
    }

    #[inline]
    pub fn value_size(&self) -> u32 {
        self.opts.value_size
    }

    #[inline]
    pub fn key_size(&self) -> u32 {
        self.opts.key_size
    }

    /// Max values per leaf node.
    #[inline]
    pub fn leaf_capacity(&self) -> u32 {
        self.leaf_capacity
    }

    #[inline]
    pub fn internal_max_children(&self) -> u32 {
        self.internal_max_children
    }

    #[inline]
    pub fn internal_min_children(&self) -> u32 {
        self.internal_min_children
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.anchor.load(self.engine())?.size())
    }

    pub fn height(&self) -> Result<u32> {
        Ok(self.anchor.load(self.engine())?.height())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    pub fn leaf_nodes(&self) -> Result<u64> {
        Ok(self.anchor.load(self.engine())?.leaf_nodes())
    }

    pub fn internal_nodes(&self) -> Result<u64> {
        Ok(self.anchor.load(self.engine())?.internal_nodes())
    }

    /// Total on-disk footprint in bytes.
    pub fn byte_size(&self) -> Result<u64> {
        let anchor = self.anchor.load(self.engine())?;
        Ok((anchor.leaf_nodes() + anchor.internal_nodes()) * self.alloc.block_size() as u64)
    }

    /// Allocated bytes divided by used bytes.
    pub fn overhead(&self) -> Result<f64> {
        let size = self.size()?;
        if size == 0 {
            Ok(1.0)
        } else {
            Ok(self.byte_size()? as f64 / (size * self.opts.value_size as u64) as f64)
        }
    }

    /// Creates a new cursor, initially at-end, registered with this tree.
    pub fn create_cursor(&self) -> Cursor<'_, 'a> {
        let state = Rc::new(RefCell::new(CursorState::invalid()));
        self.registry.register(&state);
        Cursor::new(self, state)
    }

    /// Inserts `value` through a scratch cursor. See [`Cursor::insert`].
    pub fn insert(&self, value: &[u8], overwrite: bool) -> Result<bool> {
        let state = RefCell::new(CursorState::invalid());
        self.cursor_insert(&state, value, overwrite)
    }

    /// Erases the value with `key`. Returns false when it was not present.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        let state = RefCell::new(CursorState::invalid());
        if !self.cursor_find(&state, key)? {
            return Ok(false);
        }
        self.cursor_erase(&state)?;
        Ok(true)
    }

    /// Copies the value with `key` into `out`. Returns false when absent.
    pub fn get(&self, key: &[u8], out: &mut [u8]) -> Result<bool> {
        let state = RefCell::new(CursorState::invalid());
        if !self.cursor_find(&state, key)? {
            return Ok(false);
        }
        self.cursor_get(&state, out)?;
        Ok(true)
    }

    /// Removes every value and frees every node. All live cursors become
    /// at-end.
    pub fn clear(&self) -> Result<()> {
        let mut anchor = self.anchor.load(self.engine())?;
        if anchor.height() > 0 {
            self.clear_subtree(anchor.root(), anchor.height(), &mut anchor)?;
        }
        debug_assert!(anchor.leaf_nodes() == 0 && anchor.internal_nodes() == 0);
        anchor.set_size(0);
        anchor.set_height(0);
        anchor.set_root(BlockIndex::NIL);
        anchor.set_leftmost(BlockIndex::NIL);
        anchor.set_rightmost(BlockIndex::NIL);
        anchor.set_leaf_nodes(0);
        anchor.set_internal_nodes(0);
        self.anchor.store(self.engine(), &anchor)?;
        self.registry.for_each(|state| state.reset_to_invalid(0));
        Ok(())
    }

    fn clear_subtree(&self, node: BlockIndex, level: u32, anchor: &mut BTreeAnchor) -> Result<()> {
        if level == 1 {
            return self.free_leaf(node, anchor);
        }
        let internal = self.read_internal(node)?;
        let children: SmallVec<[BlockIndex; 16]> =
            (0..internal.child_count()).map(|i| internal.child(i)).collect();
        drop(internal);
        for child in children {
            self.clear_subtree(child, level - 1, anchor)?;
        }
        self.free_internal(node, anchor)
    }

    // ----- node plumbing -------------------------------------------------

    fn read_leaf(&self, index: BlockIndex) -> Result<LeafNode<'a>> {
        Ok(LeafNode::new(
            self.engine().pin(index, false)?,
            self.opts.value_size,
            self.leaf_capacity,
        ))
    }

    fn read_internal(&self, index: BlockIndex) -> Result<InternalNode<'a>> {
        Ok(InternalNode::new(
            self.engine().pin(index, false)?,
            self.opts.key_size,
            self.internal_max_children,
        ))
    }

    fn create_leaf(&self, anchor: &mut BTreeAnchor) -> Result<LeafNode<'a>> {
        let index = self.alloc.allocate(1)?;
        let guard = self.engine().pin(index, true)?;
        let mut leaf = LeafNode::new(guard, self.opts.value_size, self.leaf_capacity);
        leaf.init();
        anchor.set_leaf_nodes(anchor.leaf_nodes() + 1);
        Ok(leaf)
    }

    fn create_internal(&self, anchor: &mut BTreeAnchor) -> Result<InternalNode<'a>> {
        let index = self.alloc.allocate(1)?;
        let guard = self.engine().pin(index, true)?;
        let mut node = InternalNode::new(guard, self.opts.key_size, self.internal_max_children);
        node.init();
        anchor.set_internal_nodes(anchor.internal_nodes() + 1);
        Ok(node)
    }

    fn free_leaf(&self, index: BlockIndex, anchor: &mut BTreeAnchor) -> Result<()> {
        self.alloc.free(index, 1)?;
        anchor.set_leaf_nodes(anchor.leaf_nodes() - 1);
        Ok(())
    }

    fn free_internal(&self, index: BlockIndex, anchor: &mut BTreeAnchor) -> Result<()> {
        self.alloc.free(index, 1)?;
        anchor.set_internal_nodes(anchor.internal_nodes() - 1);
        Ok(())
    }

    pub(super) fn create_leaf_for_load(&self, anchor: &mut BTreeAnchor) -> Result<LeafNode<'a>> {
        self.create_leaf(anchor)
    }

    pub(super) fn create_internal_for_load(
        &self,
        anchor: &mut BTreeAnchor,
    ) -> Result<InternalNode<'a>> {
        self.create_internal(anchor)
    }

    pub(super) fn read_leaf_for_load(&self, index: BlockIndex) -> Result<LeafNode<'a>> {
        self.read_leaf(index)
    }

    pub(super) fn free_leaf_for_load(
        &self,
        index: BlockIndex,
        anchor: &mut BTreeAnchor,
    ) -> Result<()> {
        self.free_leaf(index, anchor)
    }

    pub(super) fn load_anchor(&self) -> Result<BTreeAnchor> {
        self.anchor.load(self.engine())
    }

    pub(super) fn store_anchor(&self, anchor: &BTreeAnchor) -> Result<()> {
        self.anchor.store(self.engine(), anchor)
    }

    // ----- keys ----------------------------------------------------------

    pub(super) fn new_key_buf(&self) -> KeyBuf {
        let mut buf = KeyBuf::new();
        buf.resize(self.opts.key_size as usize, 0);
        buf
    }

    pub(super) fn derive_key(&self, value: &[u8], out: &mut [u8]) {
        (self.opts.derive_key)(
            &value[..self.opts.value_size as usize],
            &mut out[..self.opts.key_size as usize],
        );
    }

    pub(super) fn key_of(&self, value: &[u8]) -> KeyBuf {
        let mut buf = self.new_key_buf();
        self.derive_key(value, &mut buf);
        buf
    }

    pub(super) fn key_less(&self, a: &[u8], b: &[u8]) -> bool {
        (self.opts.key_less)(a, b)
    }

    pub(super) fn key_equal(&self, a: &[u8], b: &[u8]) -> bool {
        !self.key_less(a, b) && !self.key_less(b, a)
    }

    #[inline]
    pub(super) fn leaf_min_size(&self) -> u32 {
        self.leaf_capacity / 2
    }

    fn check_value(&self, value: &[u8]) -> Result<()> {
        if value.len() < self.opts.value_size as usize {
            return Err(Error::bad_argument(format!(
                "value buffer of {} bytes is smaller than the value size {}",
                value.len(),
                self.opts.value_size
            )));
        }
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() < self.opts.key_size as usize {
            return Err(Error::bad_argument(format!(
                "key buffer of {} bytes is smaller than the key size {}",
                key.len(),
                self.opts.key_size
            )));
        }
        Ok(())
    }

    // ----- bounds --------------------------------------------------------

    /// First value index whose key is not less than `key`.
    fn leaf_lower_bound(&self, leaf: &LeafNode<'_>, key: &[u8]) -> u32 {
        let mut buf = self.new_key_buf();
        let (mut lo, mut hi) = (0u32, leaf.size());
        while lo < hi {
            let mid = (lo + hi) / 2;
            self.derive_key(leaf.value(mid), &mut buf);
            if self.key_less(&buf, key) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// First value index whose key is greater than `key`.
    fn leaf_upper_bound(&self, leaf: &LeafNode<'_>, key: &[u8]) -> u32 {
        let mut buf = self.new_key_buf();
        let (mut lo, mut hi) = (0u32, leaf.size());
        while lo < hi {
            let mid = (lo + hi) / 2;
            self.derive_key(leaf.value(mid), &mut buf);
            if self.key_less(key, &buf) {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo
    }

    /// Index of the least child whose separator is not less than `key`, or
    /// the last child.
    fn internal_lower_bound(&self, node: &InternalNode<'_>, key: &[u8]) -> u32 {
        let (mut lo, mut hi) = (0u32, node.key_count());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key_less(node.key(mid), key) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Index of the least child whose separator is greater than `key`, or
    /// the last child.
    fn internal_upper_bound(&self, node: &InternalNode<'_>, key: &[u8]) -> u32 {
        let (mut lo, mut hi) = (0u32, node.key_count());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key_less(key, node.key(mid)) {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo
    }

    // ----- navigation ----------------------------------------------------

    pub(super) fn cursor_move_extreme(
        &self,
        state: &RefCell<CursorState>,
        max: bool,
    ) -> Result<bool> {
        let mut st = state.borrow_mut();
        self.seek_extreme(&mut st, max)
    }

    fn seek_extreme(&self, st: &mut CursorState, max: bool) -> Result<bool> {
        let anchor = self.anchor.load(self.engine())?;
        if anchor.size() == 0 {
            st.reset_to_invalid(0);
            return Ok(false);
        }

        st.path.clear();
        let mut node = anchor.root();
        for _ in 0..anchor.height() - 1 {
            let internal = self.read_internal(node)?;
            let child = if max { internal.key_count() } else { 0 };
            st.path.push(PathEntry { node, child });
            node = internal.child(child);
        }
        let leaf = self.read_leaf(node)?;
        st.leaf = node;
        st.index = if max { leaf.size() - 1 } else { 0 };
        st.flags = 0;
        Ok(true)
    }

    pub(super) fn cursor_lower_bound(
        &self,
        state: &RefCell<CursorState>,
        key: &[u8],
    ) -> Result<bool> {
        self.check_key(key)?;
        let mut st = state.borrow_mut();
        self.seek_bound(&mut st, key, false)
    }

    pub(super) fn cursor_upper_bound(
        &self,
        state: &RefCell<CursorState>,
        key: &[u8],
    ) -> Result<bool> {
        self.check_key(key)?;
        let mut st = state.borrow_mut();
        self.seek_bound(&mut st, key, true)
    }

    pub(super) fn cursor_find(&self, state: &RefCell<CursorState>, key: &[u8]) -> Result<bool> {
        self.check_key(key)?;
        let mut st = state.borrow_mut();
        if !self.seek_bound(&mut st, key, false)? {
            return Ok(false);
        }
        let leaf = self.read_leaf(st.leaf)?;
        let mut buf = self.new_key_buf();
        self.derive_key(leaf.value(st.index), &mut buf);
        if self.key_equal(&buf, key) {
            Ok(true)
        } else {
            st.reset_to_invalid(0);
            Ok(false)
        }
    }

    /// Seeks to the lower (`upper = false`) or upper bound of `key`.
    fn seek_bound(&self, st: &mut CursorState, key: &[u8], upper: bool) -> Result<bool> {
        let anchor = self.anchor.load(self.engine())?;
        if anchor.size() == 0 {
            st.reset_to_invalid(0);
            return Ok(false);
        }

        st.path.clear();
        let mut node = anchor.root();
        for _ in 0..anchor.height() - 1 {
            let internal = self.read_internal(node)?;
            let child = if upper {
                self.internal_upper_bound(&internal, key)
            } else {
                self.internal_lower_bound(&internal, key)
            };
            st.path.push(PathEntry { node, child });
            node = internal.child(child);
        }
        let leaf = self.read_leaf(node)?;
        let index = if upper {
            self.leaf_upper_bound(&leaf, key)
        } else {
            self.leaf_lower_bound(&leaf, key)
        };
        let size = leaf.size();
        drop(leaf);
        st.leaf = node;
        st.flags = 0;
        if index == size {
            // Every value here sorts before the bound (stale separators can
            // route a seek into an exhausted subtree); the bound is the
            // next leaf's first value.
            return self.advance_to_next_leaf(st);
        }
        st.index = index;
        Ok(true)
    }

    pub(super) fn cursor_move_next(&self, state: &RefCell<CursorState>) -> Result<bool> {
        let mut st = state.borrow_mut();
        if st.flags & FLAG_INVALID != 0 {
            return Ok(false);
        }
        if st.flags & FLAG_DELETED != 0 {
            // The position already addresses the erased value's successor.
            st.flags &= !FLAG_DELETED;
            let leaf = self.read_leaf(st.leaf)?;
            if st.index < leaf.size() {
                return Ok(true);
            }
            drop(leaf);
            return self.advance_to_next_leaf(&mut st);
        }
        let leaf = self.read_leaf(st.leaf)?;
        if st.index + 1 < leaf.size() {
            st.index += 1;
            return Ok(true);
        }
        drop(leaf);
        self.advance_to_next_leaf(&mut st)
    }

    pub(super) fn cursor_move_prev(&self, state: &RefCell<CursorState>) -> Result<bool> {
        let mut st = state.borrow_mut();
        if st.flags & FLAG_INVALID != 0 {
            // Past the end: retreat to the maximum.
            return self.seek_extreme(&mut st, true);
        }
        if st.flags & FLAG_DELETED != 0 {
            st.flags &= !FLAG_DELETED;
            if st.index > 0 {
                st.index -= 1;
                return Ok(true);
            }
            return self.retreat_to_prev_leaf(&mut st);
        }
        if st.index > 0 {
            st.index -= 1;
            return Ok(true);
        }
        self.retreat_to_prev_leaf(&mut st)
    }

    /// Moves to the first value of the next leaf, or to at-end.
    fn advance_to_next_leaf(&self, st: &mut CursorState) -> Result<bool> {
        let depth = st.path.len();
        for level in (0..depth).rev() {
            let entry = st.path[level];
            let internal = self.read_internal(entry.node)?;
            if entry.child < internal.key_count() {
                let mut node = internal.child(entry.child + 1);
                drop(internal);
                st.path[level].child = entry.child + 1;
                for below in level + 1..depth {
                    let internal = self.read_internal(node)?;
                    st.path[below] = PathEntry { node, child: 0 };
                    node = internal.child(0);
                }
                st.leaf = node;
                st.index = 0;
                st.flags = 0;
                return Ok(true);
            }
        }
        st.reset_to_invalid(0);
        Ok(false)
    }

    /// Moves to the last value of the previous leaf, or to at-end.
    fn retreat_to_prev_leaf(&self, st: &mut CursorState) -> Result<bool> {
        let depth = st.path.len();
        for level in (0..depth).rev() {
            let entry = st.path[level];
            if entry.child > 0 {
                let internal = self.read_internal(entry.node)?;
                let mut node = internal.child(entry.child - 1);
                drop(internal);
                st.path[level].child = entry.child - 1;
                for below in level + 1..depth {
                    let internal = self.read_internal(node)?;
                    let child = internal.key_count();
                    st.path[below] = PathEntry { node, child };
                    node = internal.child(child);
                }
                let leaf = self.read_leaf(node)?;
                st.leaf = node;
                st.index = leaf.size() - 1;
                st.flags = 0;
                return Ok(true);
            }
        }
        st.reset_to_invalid(0);
        Ok(false)
    }

    pub(super) fn cursor_get(&self, state: &RefCell<CursorState>, out: &mut [u8]) -> Result<()> {
        self.check_value(out)?;
        let st = state.borrow();
        self.check_cursor_element(&st)?;
        let leaf = self.read_leaf(st.leaf)?;
        let vs = self.opts.value_size as usize;
        out[..vs].copy_from_slice(leaf.value(st.index));
        Ok(())
    }

    pub(super) fn cursor_set(&self, state: &RefCell<CursorState>, value: &[u8]) -> Result<()> {
        self.check_value(value)?;
        let st = state.borrow();
        self.check_cursor_element(&st)?;
        let mut leaf = self.read_leaf(st.leaf)?;
        let mut old_key = self.new_key_buf();
        self.derive_key(leaf.value(st.index), &mut old_key);
        let new_key = self.key_of(value);
        if !self.key_equal(&old_key, &new_key) {
            return Err(Error::bad_argument(
                "replacement value derives a different key",
            ));
        }
        leaf.set_value(st.index, value);
        Ok(())
    }

    fn check_cursor_element(&self, st: &CursorState) -> Result<()> {
        if st.flags & FLAG_DELETED != 0 {
            return Err(Error::BadCursor("the element was erased"));
        }
        if st.flags & FLAG_INVALID != 0 {
            return Err(Error::BadCursor("the cursor does not point at an element"));
        }
        Ok(())
    }

    // ----- insertion -----------------------------------------------------

    pub(super) fn cursor_insert(
        &self,
        state: &RefCell<CursorState>,
        value: &[u8],
        overwrite: bool,
    ) -> Result<bool> {
        self.check_value(value)?;
        state.borrow_mut().flags |= FLAG_INPROGRESS;
        let result = self.insert_impl(state, value, overwrite);
        let mut st = state.borrow_mut();
        if result.is_err() {
            st.reset_to_invalid(0);
        } else {
            st.flags &= !FLAG_INPROGRESS;
        }
        result
    }

    fn insert_impl(
        &self,
        state: &RefCell<CursorState>,
        value: &[u8],
        overwrite: bool,
    ) -> Result<bool> {
        let key = self.key_of(value);
        let mut anchor = self.anchor.load(self.engine())?;

        if anchor.size() == 0 {
            let mut leaf = self.create_leaf(&mut anchor)?;
            leaf.insert_nonfull(0, value);
            let index = leaf.index();
            drop(leaf);
            anchor.set_root(index);
            anchor.set_leftmost(index);
            anchor.set_rightmost(index);
            anchor.set_height(1);
            anchor.set_size(1);
            self.anchor.store(self.engine(), &anchor)?;

            let mut st = state.borrow_mut();
            st.path.clear();
            st.leaf = index;
            st.index = 0;
            st.flags = FLAG_INPROGRESS;
            return Ok(true);
        }

        // Descend to the target leaf, recording the path.
        let mut path: SmallVec<[PathEntry; 8]> = SmallVec::new();
        let mut node = anchor.root();
        for _ in 0..anchor.height() - 1 {
            let internal = self.read_internal(node)?;
            let child = self.internal_lower_bound(&internal, &key);
            path.push(PathEntry { node, child });
            node = internal.child(child);
        }
        let mut leaf = self.read_leaf(node)?;
        let pos = self.leaf_lower_bound(&leaf, &key);

        if pos < leaf.size() {
            let mut existing = self.new_key_buf();
            self.derive_key(leaf.value(pos), &mut existing);
            if self.key_equal(&existing, &key) {
                if overwrite {
                    leaf.set_value(pos, value);
                }
                drop(leaf);
                let mut st = state.borrow_mut();
                st.path = path;
                st.leaf = node;
                st.index = pos;
                st.flags = FLAG_INPROGRESS;
                return Ok(overwrite);
            }
        }

        if leaf.size() < self.leaf_capacity {
            leaf.insert_nonfull(pos, value);
            drop(leaf);
            anchor.set_size(anchor.size() + 1);
            self.anchor.store(self.engine(), &anchor)?;

            self.registry.for_each(|other| {
                if !other.is_tracked() {
                    return;
                }
                if other.leaf == node && other.index >= pos {
                    other.index += 1;
                }
            });
            let mut st = state.borrow_mut();
            st.path = path;
            st.leaf = node;
            st.index = pos;
            st.flags = FLAG_INPROGRESS;
            return Ok(true);
        }

        // Full leaf: split, then push the separator up the recorded path.
        let mid = self.leaf_capacity.div_ceil(2);
        let mut new_leaf = self.create_leaf(&mut anchor)?;
        leaf.insert_full(pos, value, mid, &mut new_leaf);

        let mut separator = self.new_key_buf();
        self.derive_key(leaf.value(mid - 1), &mut separator);

        let mut plan = InsertPlan {
            leaf_old: node,
            leaf_new: new_leaf.index(),
            pos,
            mid,
            levels: SmallVec::new(),
            root: None,
        };

        if anchor.rightmost() == node {
            anchor.set_rightmost(new_leaf.index());
        }
        anchor.set_size(anchor.size() + 1);

        let mut carry_right = new_leaf.index();
        drop(leaf);
        drop(new_leaf);

        let mut absorbed = false;
        for level in (0..path.len()).rev() {
            let entry = path[level];
            let mut parent = self.read_internal(entry.node)?;

            if parent.key_count() + 1 < self.internal_max_children {
                parent.insert_entry(entry.child, &separator, carry_right);
                plan.levels.push(LevelPatch {
                    path_idx: level,
                    node: entry.node,
                    slot: entry.child,
                    split: None,
                });
                absorbed = true;
                break;
            }

            // Split the full parent: gather its entries plus the carried
            // one, keep the low half, move the high half, promote the
            // middle key.
            let key_count = parent.key_count();
            let mut keys: Vec<KeyBuf> = (0..key_count)
                .map(|i| KeyBuf::from_slice(parent.key(i)))
                .collect();
            let mut children: Vec<BlockIndex> =
                (0..=key_count).map(|i| parent.child(i)).collect();
            keys.insert(entry.child as usize, separator.clone());
            children.insert(entry.child as usize + 1, carry_right);

            let promote = keys.len() / 2;
            let promoted = keys[promote].clone();

            for (i, key) in keys[..promote].iter().enumerate() {
                parent.set_key(i as u32, key);
            }
            for (i, child) in children[..=promote].iter().enumerate() {
                parent.set_child(i as u32, *child);
            }
            parent.set_key_count(promote as u32);

            let mut right = self.create_internal(&mut anchor)?;
            let right_keys = keys.len() - promote - 1;
            for i in 0..right_keys {
                right.set_key(i as u32, &keys[promote + 1 + i]);
            }
            for i in 0..=right_keys {
                right.set_child(i as u32, children[promote + 1 + i]);
            }
            right.set_key_count(right_keys as u32);

            plan.levels.push(LevelPatch {
                path_idx: level,
                node: entry.node,
                slot: entry.child,
                split: Some((right.index(), promote as u32)),
            });
            separator = promoted;
            carry_right = right.index();
            drop(parent);
            drop(right);
        }

        if !absorbed {
            let old_root = anchor.root();
            let mut root = self.create_internal(&mut anchor)?;
            root.set_child(0, old_root);
            root.set_child(1, carry_right);
            root.set_key(0, &separator);
            root.set_key_count(1);
            let root_index = root.index();
            drop(root);
            anchor.set_root(root_index);
            anchor.set_height(anchor.height() + 1);
            plan.root = Some(RootPatch {
                new_root: root_index,
                right: carry_right,
            });
        }

        self.anchor.store(self.engine(), &anchor)?;
        tracing::debug!(
            size = anchor.size(),
            height = anchor.height(),
            splits = plan.levels.iter().filter(|l| l.split.is_some()).count() + 1,
            "insert split cascade"
        );

        self.registry.for_each(|other| {
            if !other.is_tracked() {
                return;
            }
            Self::patch_for_insert(other, &plan, true);
        });
        let mut st = state.borrow_mut();
        st.path = path;
        st.leaf = node;
        st.index = pos;
        st.flags = FLAG_INPROGRESS;
        Self::patch_for_insert(&mut st, &plan, false);
        Ok(true)
    }

    /// Rewrites one cursor position after an insert split cascade.
    ///
    /// `shift` applies the value-insertion shift at the leaf level; the
    /// acting cursor is pre-positioned at the inserted value and skips it.
    fn patch_for_insert(st: &mut CursorState, plan: &InsertPlan, shift: bool) {
        let mut moved_right = false;
        if st.leaf == plan.leaf_old {
            let combined = if shift && st.index >= plan.pos {
                st.index + 1
            } else {
                st.index
            };
            if combined < plan.mid {
                st.index = combined;
            } else {
                st.leaf = plan.leaf_new;
                st.index = combined - plan.mid;
                moved_right = true;
            }
        }

        for level in &plan.levels {
            if level.path_idx >= st.path.len() {
                break;
            }
            let entry = &mut st.path[level.path_idx];
            if entry.node != level.node {
                moved_right = false;
                continue;
            }
            let mut child = entry.child;
            if moved_right {
                child = level.slot + 1;
            } else if child > level.slot {
                child += 1;
            }
            moved_right = false;
            match level.split {
                None => entry.child = child,
                Some((right, keep)) => {
                    if child <= keep {
                        entry.child = child;
                    } else {
                        entry.node = right;
                        entry.child = child - (keep + 1);
                        moved_right = true;
                    }
                }
            }
        }

        if let Some(root) = &plan.root {
            let went_right = if st.path.is_empty() {
                st.leaf == root.right
            } else {
                st.path[0].node == root.right
            };
            st.path.insert(
                0,
                PathEntry {
                    node: root.new_root,
                    child: went_right as u32,
                },
            );
        }
    }

    // ----- deletion ------------------------------------------------------

    pub(super) fn cursor_erase(&self, state: &RefCell<CursorState>) -> Result<()> {
        let (path, leaf_index, index) = {
            let st = state.borrow();
            self.check_cursor_element(&st)?;
            (st.path.clone(), st.leaf, st.index)
        };

        let mut anchor = self.anchor.load(self.engine())?;
        let mut leaf = self.read_leaf(leaf_index)?;
        if index >= leaf.size() {
            return Err(Error::corruption("cursor index out of node bounds"));
        }
        leaf.remove(index);
        anchor.set_size(anchor.size() - 1);

        // Positions within the erased-from leaf; cursors on the erased
        // value (the acting one included) become erased markers.
        self.registry.for_each(|other| {
            if !other.is_tracked() {
                return;
            }
            if other.leaf == leaf_index {
                if other.index == index {
                    other.flags |= FLAG_DELETED;
                } else if other.index > index {
                    other.index -= 1;
                }
            }
        });

        if anchor.size() == 0 {
            drop(leaf);
            self.free_leaf(leaf_index, &mut anchor)?;
            anchor.set_height(0);
            anchor.set_root(BlockIndex::NIL);
            anchor.set_leftmost(BlockIndex::NIL);
            anchor.set_rightmost(BlockIndex::NIL);
            self.anchor.store(self.engine(), &anchor)?;
            self.registry
                .for_each(|other| other.reset_to_invalid(FLAG_DELETED));
            return Ok(());
        }

        if path.is_empty() || leaf.size() >= self.leaf_min_size() {
            drop(leaf);
            return self.anchor.store(self.engine(), &anchor);
        }

        self.rebalance_leaf(&path, leaf, &mut anchor)?;
        self.anchor.store(self.engine(), &anchor)
    }

    /// Brings an underfull leaf back to min fill by stealing from or
    /// merging with a sibling, then rebalances the internal levels.
    fn rebalance_leaf(
        &self,
        path: &[PathEntry],
        mut leaf: LeafNode<'a>,
        anchor: &mut BTreeAnchor,
    ) -> Result<()> {
        let depth = path.len() - 1;
        let parent_index = path[depth].node;
        let slot = path[depth].child;
        let leaf_index = leaf.index();
        let mut parent = self.read_internal(parent_index)?;
        let parent_children = parent.child_count();

        if slot > 0 {
            let left_index = parent.child(slot - 1);
            let mut left = self.read_leaf(left_index)?;
            if left.size() > self.leaf_min_size() {
                leaf.prepend_from_left(&mut left, 1);
                let mut separator = self.new_key_buf();
                self.derive_key(left.value(left.size() - 1), &mut separator);
                parent.set_key(slot - 1, &separator);
                let donor_size = left.size();

                self.registry.for_each(|other| {
                    if !other.is_tracked() {
                        return;
                    }
                    if other.leaf == leaf_index {
                        other.index += 1;
                    } else if other.leaf == left_index && other.index == donor_size {
                        other.leaf = leaf_index;
                        other.index = 0;
                        other.path[depth].child = slot;
                    }
                });
                return Ok(());
            }
        }

        if slot + 1 < parent_children {
            let right_index = parent.child(slot + 1);
            let mut right = self.read_leaf(right_index)?;
            if right.size() > self.leaf_min_size() {
                leaf.append_from_right(&mut right, 1);
                let mut separator = self.new_key_buf();
                self.derive_key(leaf.value(leaf.size() - 1), &mut separator);
                parent.set_key(slot, &separator);
                let landed = leaf.size() - 1;

                self.registry.for_each(|other| {
                    if !other.is_tracked() {
                        return;
                    }
                    if other.leaf == right_index {
                        if other.index == 0 {
                            other.leaf = leaf_index;
                            other.index = landed;
                            other.path[depth].child = slot;
                        } else {
                            other.index -= 1;
                        }
                    }
                });
                return Ok(());
            }
        }

        // No donor: merge with a sibling and drop one child from the
        // parent.
        if slot > 0 {
            let left_index = parent.child(slot - 1);
            let mut left = self.read_leaf(left_index)?;
            let left_old_size = left.size();
            let leaf_size = leaf.size();
            left.append_from_right(&mut leaf, leaf_size);
            drop(left);
            drop(leaf);
            self.free_leaf(leaf_index, anchor)?;
            if anchor.rightmost() == leaf_index {
                anchor.set_rightmost(left_index);
            }
            parent.remove_entry(slot - 1);
            tracing::trace!(merged = %leaf_index, into = %left_index, "leaf merge");

            self.registry.for_each(|other| {
                if !other.is_tracked() {
                    return;
                }
                if other.leaf == leaf_index {
                    other.leaf = left_index;
                    other.index += left_old_size;
                    other.path[depth].child = slot - 1;
                } else if other.path.len() > depth
                    && other.path[depth].node == parent_index
                    && other.path[depth].child > slot
                {
                    other.path[depth].child -= 1;
                }
            });
        } else {
            let right_index = parent.child(1);
            let mut right = self.read_leaf(right_index)?;
            let leaf_old_size = leaf.size();
            let right_size = right.size();
            leaf.append_from_right(&mut right, right_size);
            drop(right);
            drop(leaf);
            self.free_leaf(right_index, anchor)?;
            if anchor.rightmost() == right_index {
                anchor.set_rightmost(leaf_index);
            }
            parent.remove_entry(0);
            tracing::trace!(merged = %right_index, into = %leaf_index, "leaf merge");

            self.registry.for_each(|other| {
                if !other.is_tracked() {
                    return;
                }
                if other.leaf == right_index {
                    other.leaf = leaf_index;
                    other.index += leaf_old_size;
                    other.path[depth].child = 0;
                } else if other.path.len() > depth
                    && other.path[depth].node == parent_index
                    && other.path[depth].child > 1
                {
                    other.path[depth].child -= 1;
                }
            });
        }
        drop(parent);

        self.rebalance_internal(path, depth, anchor)
    }

    /// Rebalances the internal node at `path[level]` after it lost a
    /// child, recursing upward as merges cascade.
    fn rebalance_internal(
        &self,
        path: &[PathEntry],
        level: usize,
        anchor: &mut BTreeAnchor,
    ) -> Result<()> {
        let node_index = path[level].node;
        let mut node = self.read_internal(node_index)?;

        if level == 0 {
            if node.child_count() == 1 {
                let only_child = node.child(0);
                drop(node);
                self.free_internal(node_index, anchor)?;
                anchor.set_root(only_child);
                anchor.set_height(anchor.height() - 1);
                tracing::debug!(height = anchor.height(), "root collapsed");

                self.registry.for_each(|other| {
                    if !other.is_tracked() {
                        return;
                    }
                    if !other.path.is_empty() {
                        other.path.remove(0);
                    }
                });
            }
            return Ok(());
        }

        if node.child_count() >= self.internal_min_children {
            return Ok(());
        }

        let above = level - 1;
        let parent_index = path[above].node;
        let slot = path[above].child;
        let mut parent = self.read_internal(parent_index)?;
        let parent_children = parent.child_count();

        if slot > 0 {
            let left_index = parent.child(slot - 1);
            let mut left = self.read_internal(left_index)?;
            if left.child_count() > self.internal_min_children {
                let moved = left.child(left.key_count());
                let rotated = KeyBuf::from_slice(parent.key(slot - 1));
                let new_separator = KeyBuf::from_slice(left.key(left.key_count() - 1));
                node.prepend_entry(&rotated, moved);
                left.pop_back_entry();
                parent.set_key(slot - 1, &new_separator);
                let donor_children = left.child_count();

                self.registry.for_each(|other| {
                    if !other.is_tracked() || other.path.len() <= level {
                        return;
                    }
                    if other.path[level].node == node_index {
                        other.path[level].child += 1;
                    } else if other.path[level].node == left_index
                        && other.path[level].child == donor_children
                    {
                        other.path[level] = PathEntry {
                            node: node_index,
                            child: 0,
                        };
                        other.path[above].child = slot;
                    }
                });
                return Ok(());
            }
        }

        if slot + 1 < parent_children {
            let right_index = parent.child(slot + 1);
            let mut right = self.read_internal(right_index)?;
            if right.child_count() > self.internal_min_children {
                let moved = right.child(0);
                let rotated = KeyBuf::from_slice(parent.key(slot));
                let new_separator = KeyBuf::from_slice(right.key(0));
                node.append_entry(&rotated, moved);
                right.remove_front();
                parent.set_key(slot, &new_separator);
                let landed = node.child_count() - 1;

                self.registry.for_each(|other| {
                    if !other.is_tracked() || other.path.len() <= level {
                        return;
                    }
                    if other.path[level].node == right_index {
                        if other.path[level].child == 0 {
                            other.path[level] = PathEntry {
                                node: node_index,
                                child: landed,
                            };
                            other.path[above].child = slot;
                        } else {
                            other.path[level].child -= 1;
                        }
                    }
                });
                return Ok(());
            }
        }

        if slot > 0 {
            let left_index = parent.child(slot - 1);
            let mut left = self.read_internal(left_index)?;
            let left_old_children = left.child_count();
            let separator = KeyBuf::from_slice(parent.key(slot - 1));
            left.merge_from_right(&separator, &node);
            drop(left);
            drop(node);
            self.free_internal(node_index, anchor)?;
            parent.remove_entry(slot - 1);
            tracing::trace!(merged = %node_index, into = %left_index, "internal merge");

            self.registry.for_each(|other| {
                if !other.is_tracked() || other.path.len() <= level {
                    return;
                }
                if other.path[level].node == node_index {
                    other.path[level].node = left_index;
                    other.path[level].child += left_old_children;
                    other.path[above].child = slot - 1;
                } else if other.path[above].node == parent_index && other.path[above].child > slot {
                    other.path[above].child -= 1;
                }
            });
        } else {
            let right_index = parent.child(1);
            let right = self.read_internal(right_index)?;
            let node_old_children = node.child_count();
            let separator = KeyBuf::from_slice(parent.key(0));
            node.merge_from_right(&separator, &right);
            drop(right);
            drop(node);
            self.free_internal(right_index, anchor)?;
            parent.remove_entry(0);
            tracing::trace!(merged = %right_index, into = %node_index, "internal merge");

            self.registry.for_each(|other| {
                if !other.is_tracked() || other.path.len() <= level {
                    return;
                }
                if other.path[level].node == right_index {
                    other.path[level].node = node_index;
                    other.path[level].child += node_old_children;
                    other.path[above].child = 0;
                } else if other.path[above].node == parent_index && other.path[above].child > 1 {
                    other.path[above].child -= 1;
                }
            });
        }
        drop(parent);

        self.rebalance_internal(path, above, anchor)
    }

    // ----- validation ----------------------------------------------------

    /// Walks the whole tree verifying its invariants: node fill bounds,
    /// in-node key order, separator ranges, uniform leaf depth, and the
    /// anchor's counters and edge pointers.
    pub fn validate(&self) -> Result<()> {
        let anchor = self.anchor.load(self.engine())?;
        if anchor.size() == 0 {
            if anchor.height() != 0
                || !anchor.root().is_nil()
                || !anchor.leftmost().is_nil()
                || !anchor.rightmost().is_nil()
                || anchor.leaf_nodes() != 0
                || anchor.internal_nodes() != 0
            {
                return Err(Error::corruption("empty tree anchor is not fully reset"));
            }
            return Ok(());
        }
        if anchor.height() == 0 || anchor.root().is_nil() {
            return Err(Error::corruption("non-empty tree without a root"));
        }

        let mut walk = WalkStats::default();
        self.validate_subtree(anchor.root(), anchor.height(), true, None, None, &mut walk)?;

        if walk.values != anchor.size() {
            return Err(Error::corruption(format!(
                "anchor size {} does not match stored values {}",
                anchor.size(),
                walk.values
            )));
        }
        if walk.leaves != anchor.leaf_nodes() || walk.internals != anchor.internal_nodes() {
            return Err(Error::corruption("anchor node counters are stale"));
        }
        if walk.first_leaf != Some(anchor.leftmost()) || walk.last_leaf != Some(anchor.rightmost())
        {
            return Err(Error::corruption("anchor edge-leaf pointers are stale"));
        }
        Ok(())
    }

    fn validate_subtree(
        &self,
        node: BlockIndex,
        level: u32,
        is_root: bool,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        walk: &mut WalkStats,
    ) -> Result<()> {
        if level == 1 {
            let leaf = self.read_leaf(node)?;
            let size = leaf.size();
            if size == 0 || size > self.leaf_capacity {
                return Err(Error::corruption(format!(
                    "leaf {} has invalid size {}",
                    node, size
                )));
            }
            if !is_root && size < self.leaf_min_size() {
                return Err(Error::corruption(format!(
                    "leaf {} below min fill: {} < {}",
                    node,
                    size,
                    self.leaf_min_size()
                )));
            }
            let mut prev = self.new_key_buf();
            let mut current = self.new_key_buf();
            for i in 0..size {
                self.derive_key(leaf.value(i), &mut current);
                if i > 0 && !self.key_less(&prev, &current) {
                    return Err(Error::corruption(format!(
                        "leaf {} keys not strictly increasing at {}",
                        node, i
                    )));
                }
                if let Some(lower) = lower {
                    if !self.key_less(lower, &current) {
                        return Err(Error::corruption(format!(
                            "leaf {} key at {} not above its lower bound",
                            node, i
                        )));
                    }
                }
                if let Some(upper) = upper {
                    if self.key_less(upper, &current) {
                        return Err(Error::corruption(format!(
                            "leaf {} key at {} above its separator",
                            node, i
                        )));
                    }
                }
                std::mem::swap(&mut prev, &mut current);
            }
            walk.values += size as u64;
            walk.leaves += 1;
            if walk.first_leaf.is_none() {
                walk.first_leaf = Some(node);
            }
            walk.last_leaf = Some(node);
            return Ok(());
        }

        let internal = self.read_internal(node)?;
        let children = internal.child_count();
        if children > self.internal_max_children {
            return Err(Error::corruption(format!(
                "internal {} has too many children",
                node
            )));
        }
        let minimum = if is_root { 2 } else { self.internal_min_children };
        if children < minimum {
            return Err(Error::corruption(format!(
                "internal {} below min children: {} < {}",
                node, children, minimum
            )));
        }
        let keys: Vec<KeyBuf> = (0..internal.key_count())
            .map(|i| KeyBuf::from_slice(internal.key(i)))
            .collect();
        let child_blocks: Vec<BlockIndex> = (0..children).map(|i| internal.child(i)).collect();
        drop(internal);

        for window in keys.windows(2) {
            if !self.key_less(&window[0], &window[1]) {
                return Err(Error::corruption(format!(
                    "internal {} separators not strictly increasing",
                    node
                )));
            }
        }
        for key in &keys {
            if let Some(lower) = lower {
                if !self.key_less(lower, key) {
                    return Err(Error::corruption(format!(
                        "internal {} separator not above its lower bound",
                        node
                    )));
                }
            }
            if let Some(upper) = upper {
                if self.key_less(upper, key) {
                    return Err(Error::corruption(format!(
                        "internal {} separator above its own bound",
                        node
                    )));
                }
            }
        }

        for (i, child) in child_blocks.iter().enumerate() {
            let child_lower = if i == 0 {
                lower
            } else {
                Some(keys[i - 1].as_slice())
            };
            let child_upper = if i == keys.len() {
                upper
            } else {
                Some(keys[i].as_slice())
            };
            self.validate_subtree(*child, level - 1, false, child_lower, child_upper, walk)?;
        }
        walk.internals += 1;
        Ok(())
    }

    #[cfg(test)]
    pub(super) fn registered_cursors(&self) -> usize {
        self.registry.live_count()
    }
}

#[derive(Default)]
struct WalkStats {
    values: u64,
    leaves: u64,
    internals: u64,
    first_leaf: Option<BlockIndex>,
    last_leaf: Option<BlockIndex>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{NodeAllocator, NodeAllocatorAnchor};
    use crate::io::MemoryStorage;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    // 8-byte values keyed by their first 4 bytes. With 64-byte blocks:
    // 7 values per leaf, 5 children per internal node.
    const VALUE_SIZE: u32 = 8;
    const KEY_SIZE: u32 = 4;

    // Block 0 holds the allocator anchor, block 1 the tree anchor.
    fn setup(block_size: u32) -> Engine {
        let engine = Engine::new(Box::new(MemoryStorage::new()), block_size, 32).unwrap();
        engine.grow(2).unwrap();
        engine
    }

    fn allocator(engine: &Engine) -> NodeAllocator<'_> {
        let handle = AnchorHandle::in_block(BlockIndex::new(0), 0);
        handle.store(engine, &NodeAllocatorAnchor::new()).unwrap();
        let mut alloc = NodeAllocator::new(handle, engine).unwrap();
        alloc.set_chunk_size(8).unwrap();
        alloc
    }

    fn options() -> TreeOptions {
        TreeOptions::new(
            VALUE_SIZE,
            KEY_SIZE,
            |value, key| key.copy_from_slice(&value[..4]),
            |a, b| a < b,
        )
    }

    fn tree<'a>(alloc: &'a NodeAllocator<'a>) -> RawBTree<'a> {
        let handle = AnchorHandle::in_block(BlockIndex::new(1), 0);
        handle.store(alloc.engine(), &BTreeAnchor::new()).unwrap();
        RawBTree::new(handle, options(), alloc).unwrap()
    }

    fn value(key: u32, payload: u32) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&key.to_be_bytes());
        buf[4..].copy_from_slice(&payload.to_be_bytes());
        buf
    }

    fn get_payload(tree: &RawBTree<'_>, key: u32) -> Option<u32> {
        let mut buf = [0u8; 8];
        if tree.get(&key.to_be_bytes(), &mut buf).unwrap() {
            Some(u32::from_be_bytes(buf[4..].try_into().unwrap()))
        } else {
            None
        }
    }

    fn shuffled(n: u32, seed: u64) -> Vec<u32> {
        let mut keys: Vec<u32> = (0..n).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        keys.shuffle(&mut rng);
        keys
    }

    #[test]
    fn rejects_block_too_small_for_two_values() {
        // A 16-byte block fits one 8-byte value per leaf; capacity checks
        // fire before the anchor is ever touched.
        let engine = setup(16);
        let alloc = allocator(&engine);
        let handle = AnchorHandle::in_block(BlockIndex::new(1), 0);

        let result = RawBTree::new(handle, options(), &alloc);
        assert!(matches!(result, Err(Error::BadArgument(_))));
    }

    #[test]
    fn derived_capacities() {
        let engine = setup(64);
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        assert_eq!(t.leaf_capacity(), 7);
        assert_eq!(t.internal_max_children(), 5);
        assert_eq!(t.internal_min_children(), 3);
    }

    #[test]
    fn empty_tree_state() {
        let engine = setup(64);
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        assert!(t.is_empty().unwrap());
        assert_eq!(t.size().unwrap(), 0);
        assert_eq!(t.height().unwrap(), 0);
        assert_eq!(get_payload(&t, 1), None);
        t.validate().unwrap();

        let mut cursor = t.create_cursor();
        assert!(!cursor.move_min().unwrap());
        assert!(cursor.at_end());
    }

    #[test]
    fn insert_and_find_single_value() {
        let engine = setup(64);
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        assert!(t.insert(&value(7, 700), false).unwrap());
        assert_eq!(t.size().unwrap(), 1);
        assert_eq!(t.height().unwrap(), 1);
        assert_eq!(get_payload(&t, 7), Some(700));
        assert_eq!(get_payload(&t, 8), None);
        t.validate().unwrap();
    }

    #[test]
    fn duplicate_insert_reports_conflict() {
        let engine = setup(64);
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        assert!(t.insert(&value(42, 1), false).unwrap());
        assert!(!t.insert(&value(42, 2), false).unwrap());
        assert_eq!(get_payload(&t, 42), Some(1));
        assert_eq!(t.size().unwrap(), 1);

        assert!(t.insert(&value(42, 2), true).unwrap());
        assert_eq!(get_payload(&t, 42), Some(2));
        assert_eq!(t.size().unwrap(), 1);
    }

    #[test]
    fn random_inserts_stay_sorted_and_balanced() {
        let engine = setup(64);
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        for &key in &shuffled(500, 7) {
            assert!(t.insert(&value(key, key * 10), false).unwrap());
        }
        assert_eq!(t.size().unwrap(), 500);
        assert!(t.height().unwrap() > 2);
        t.validate().unwrap();

        // In-order traversal yields strictly increasing keys.
        let mut cursor = t.create_cursor();
        let mut buf = [0u8; 8];
        let mut seen = 0u32;
        let mut more = cursor.move_min().unwrap();
        while more {
            cursor.get(&mut buf).unwrap();
            let key = u32::from_be_bytes(buf[..4].try_into().unwrap());
            assert_eq!(key, seen);
            assert_eq!(u32::from_be_bytes(buf[4..].try_into().unwrap()), key * 10);
            seen += 1;
            more = cursor.move_next().unwrap();
        }
        assert_eq!(seen, 500);
        assert!(cursor.at_end());
    }

    #[test]
    fn random_erases_rebalance_to_empty() {
        let engine = setup(64);
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        for &key in &shuffled(400, 11) {
            t.insert(&value(key, key), false).unwrap();
        }
        for (i, &key) in shuffled(400, 13).iter().enumerate() {
            assert!(t.remove(&key.to_be_bytes()).unwrap());
            if i % 50 == 0 {
                t.validate().unwrap();
            }
        }

        assert_eq!(t.size().unwrap(), 0);
        assert_eq!(t.height().unwrap(), 0);
        assert_eq!(t.leaf_nodes().unwrap(), 0);
        assert_eq!(t.internal_nodes().unwrap(), 0);
        t.validate().unwrap();
    }

    #[test]
    fn remove_missing_key_returns_false() {
        let engine = setup(64);
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        t.insert(&value(1, 1), false).unwrap();
        assert!(!t.remove(&2u32.to_be_bytes()).unwrap());
        assert_eq!(t.size().unwrap(), 1);
    }

    #[test]
    fn lower_and_upper_bound_positions() {
        let engine = setup(64);
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        for key in (0..100u32).map(|i| i * 2) {
            t.insert(&value(key, key), false).unwrap();
        }

        let mut cursor = t.create_cursor();
        let mut buf = [0u8; 8];

        // 50 is present: lower bound lands on it, upper bound after it.
        assert!(cursor.lower_bound(&50u32.to_be_bytes()).unwrap());
        cursor.get(&mut buf).unwrap();
        assert_eq!(u32::from_be_bytes(buf[..4].try_into().unwrap()), 50);

        assert!(cursor.upper_bound(&50u32.to_be_bytes()).unwrap());
        cursor.get(&mut buf).unwrap();
        assert_eq!(u32::from_be_bytes(buf[..4].try_into().unwrap()), 52);

        // 51 is absent: both bounds land on 52.
        assert!(cursor.lower_bound(&51u32.to_be_bytes()).unwrap());
        cursor.get(&mut buf).unwrap();
        assert_eq!(u32::from_be_bytes(buf[..4].try_into().unwrap()), 52);

        // Beyond the maximum: at end.
        assert!(!cursor.lower_bound(&1000u32.to_be_bytes()).unwrap());
        assert!(cursor.at_end());
    }

    #[test]
    fn find_positions_or_invalidates() {
        let engine = setup(64);
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        for key in 0..50u32 {
            t.insert(&value(key, key), false).unwrap();
        }

        let mut cursor = t.create_cursor();
        assert!(cursor.find(&30u32.to_be_bytes()).unwrap());
        assert!(!cursor.at_end());

        assert!(!cursor.find(&99u32.to_be_bytes()).unwrap());
        assert!(cursor.at_end());
    }

    #[test]
    fn navigation_round_trip() {
        let engine = setup(64);
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        for key in 0..60u32 {
            t.insert(&value(key, key), false).unwrap();
        }

        let mut cursor = t.create_cursor();
        let mut buf = [0u8; 8];

        assert!(cursor.move_max().unwrap());
        cursor.get(&mut buf).unwrap();
        assert_eq!(u32::from_be_bytes(buf[..4].try_into().unwrap()), 59);

        // Walk all the way back.
        let mut expected = 59u32;
        while cursor.move_prev().unwrap() {
            expected -= 1;
            cursor.get(&mut buf).unwrap();
            assert_eq!(u32::from_be_bytes(buf[..4].try_into().unwrap()), expected);
        }
        assert_eq!(expected, 0);
        assert!(cursor.at_end());

        // move_prev from at-end re-enters at the maximum.
        assert!(cursor.move_prev().unwrap());
        cursor.get(&mut buf).unwrap();
        assert_eq!(u32::from_be_bytes(buf[..4].try_into().unwrap()), 59);
    }

    #[test]
    fn cursor_survives_unrelated_inserts() {
        let engine = setup(64);
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        t.insert(&value(5000, 123), false).unwrap();
        let mut cursor = t.create_cursor();
        assert!(cursor.find(&5000u32.to_be_bytes()).unwrap());

        for &key in &shuffled(2000, 17) {
            if key != 5000 {
                t.insert(&value(key, key), false).unwrap();
            }
        }
        t.validate().unwrap();

        let mut buf = [0u8; 8];
        cursor.get(&mut buf).unwrap();
        assert_eq!(u32::from_be_bytes(buf[..4].try_into().unwrap()), 5000);
        assert_eq!(u32::from_be_bytes(buf[4..].try_into().unwrap()), 123);
    }

    #[test]
    fn cursor_survives_unrelated_erases() {
        let engine = setup(64);
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        for &key in &shuffled(600, 19) {
            t.insert(&value(key, key + 1), false).unwrap();
        }

        let mut cursor = t.create_cursor();
        assert!(cursor.find(&300u32.to_be_bytes()).unwrap());

        for &key in &shuffled(300, 23) {
            assert!(t.remove(&key.to_be_bytes()).unwrap());
        }
        t.validate().unwrap();

        let mut buf = [0u8; 8];
        cursor.get(&mut buf).unwrap();
        assert_eq!(u32::from_be_bytes(buf[..4].try_into().unwrap()), 300);
        assert_eq!(u32::from_be_bytes(buf[4..].try_into().unwrap()), 301);

        // Everything below 300 is gone: its predecessor no longer exists.
        assert!(!cursor.move_prev().unwrap());
        assert!(cursor.at_end());
    }

    #[test]
    fn erase_through_cursor_marks_it_erased() {
        let engine = setup(64);
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        for key in 0..20u32 {
            t.insert(&value(key, key), false).unwrap();
        }

        let mut cursor = t.create_cursor();
        assert!(cursor.find(&10u32.to_be_bytes()).unwrap());
        cursor.erase().unwrap();

        assert!(cursor.erased());
        let mut buf = [0u8; 8];
        assert!(matches!(cursor.get(&mut buf), Err(Error::BadCursor(_))));
        assert!(matches!(cursor.erase(), Err(Error::BadCursor(_))));

        // The next move clears the erased state and lands on the successor.
        assert!(cursor.move_next().unwrap());
        assert!(!cursor.erased());
        cursor.get(&mut buf).unwrap();
        assert_eq!(u32::from_be_bytes(buf[..4].try_into().unwrap()), 11);

        assert_eq!(t.size().unwrap(), 19);
        assert_eq!(get_payload(&t, 10), None);
    }

    #[test]
    fn erase_marks_other_cursors_on_same_value() {
        let engine = setup(64);
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        for key in 0..20u32 {
            t.insert(&value(key, key), false).unwrap();
        }

        let mut acting = t.create_cursor();
        let mut observer = t.create_cursor();
        assert!(acting.find(&7u32.to_be_bytes()).unwrap());
        assert!(observer.find(&7u32.to_be_bytes()).unwrap());

        acting.erase().unwrap();
        assert!(observer.erased());

        assert!(observer.move_prev().unwrap());
        let mut buf = [0u8; 8];
        observer.get(&mut buf).unwrap();
        assert_eq!(u32::from_be_bytes(buf[..4].try_into().unwrap()), 6);
    }

    #[test]
    fn erasing_last_value_empties_tree_and_cursors() {
        let engine = setup(64);
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        t.insert(&value(1, 1), false).unwrap();
        let mut cursor = t.create_cursor();
        assert!(cursor.move_min().unwrap());
        cursor.erase().unwrap();

        assert!(t.is_empty().unwrap());
        assert_eq!(t.height().unwrap(), 0);
        assert!(cursor.erased());
        assert!(!cursor.move_next().unwrap());
    }

    #[test]
    fn set_rewrites_value_in_place() {
        let engine = setup(64);
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        for key in 0..30u32 {
            t.insert(&value(key, 0), false).unwrap();
        }

        let mut cursor = t.create_cursor();
        assert!(cursor.find(&12u32.to_be_bytes()).unwrap());
        cursor.set(&value(12, 999)).unwrap();
        assert_eq!(get_payload(&t, 12), Some(999));

        // A replacement deriving a different key is rejected.
        assert!(matches!(
            cursor.set(&value(13, 0)),
            Err(Error::BadArgument(_))
        ));
    }

    #[test]
    fn clear_frees_everything_and_invalidates_cursors() {
        let engine = setup(64);
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        for &key in &shuffled(300, 29) {
            t.insert(&value(key, key), false).unwrap();
        }
        let mut cursor = t.create_cursor();
        assert!(cursor.move_min().unwrap());

        t.clear().unwrap();

        assert!(t.is_empty().unwrap());
        assert_eq!(t.leaf_nodes().unwrap(), 0);
        assert_eq!(t.internal_nodes().unwrap(), 0);
        assert!(cursor.at_end());
        t.validate().unwrap();

        // The tree is usable again afterwards.
        t.insert(&value(1, 1), false).unwrap();
        assert_eq!(get_payload(&t, 1), Some(1));
    }

    #[test]
    fn dropped_cursors_leave_the_registry() {
        let engine = setup(64);
        let alloc = allocator(&engine);
        let t = tree(&alloc);
        t.insert(&value(1, 1), false).unwrap();

        {
            let mut a = t.create_cursor();
            let mut b = t.create_cursor();
            a.move_min().unwrap();
            b.move_min().unwrap();
            assert_eq!(t.registered_cursors(), 2);
        }
        assert_eq!(t.registered_cursors(), 0);

        // A mutation prunes the dead entries.
        t.insert(&value(2, 2), false).unwrap();
    }

    #[test]
    fn rebinding_anchor_preserves_tree() {
        let engine = setup(64);
        let alloc = allocator(&engine);
        {
            let t = tree(&alloc);
            for &key in &shuffled(200, 31) {
                t.insert(&value(key, key * 3), false).unwrap();
            }
        }

        let handle = AnchorHandle::in_block(BlockIndex::new(1), 0);
        let t = RawBTree::new(handle, options(), &alloc).unwrap();
        assert_eq!(t.size().unwrap(), 200);
        for key in 0..200u32 {
            assert_eq!(get_payload(&t, key), Some(key * 3));
        }
        t.validate().unwrap();
    }

    #[test]
    fn bigger_blocks_hold_more_per_node() {
        let engine = setup(512);
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        assert_eq!(t.leaf_capacity(), 63);
        assert_eq!(t.internal_max_children(), 42);

        for &key in &shuffled(1000, 37) {
            t.insert(&value(key, key), false).unwrap();
        }
        assert_eq!(t.size().unwrap(), 1000);
        t.validate().unwrap();
    }
}
