//! Bulk loading.
//!
//! Builds a tree from strictly increasing input without going through
//! per-value insertion: values stream into leaves at a configurable fill,
//! then the internal levels are assembled bottom-up. The last node of each
//! level borrows from its left neighbor when it would otherwise land below
//! min fill, so the loaded tree satisfies the same invariants as one built
//! by insertion.

use crate::anchor::BlockIndex;
use crate::error::{Error, Result};

use super::tree::{KeyBuf, RawBTree};
use super::BTreeAnchor;

/// Streaming bulk loader for an empty [`RawBTree`].
///
/// Obtain with [`RawBTree::bulk_load`], feed values in strictly increasing
/// key order with [`push`](Self::push), then call
/// [`finish`](Self::finish). Dropping the loader without finishing leaks
/// the blocks written so far; call [`discard`](Self::discard) to release
/// them instead.
pub struct BulkLoader<'t, 'a> {
    tree: &'t RawBTree<'a>,
    anchor: BTreeAnchor,
    fill: u32,
    pending: Vec<u8>,
    pending_count: u32,
    last_key: Option<KeyBuf>,
    /// `(node, max key of its subtree)` per finished leaf, in order.
    leaves: Vec<(BlockIndex, KeyBuf)>,
    last_leaf_count: u32,
    total: u64,
}

impl<'a> RawBTree<'a> {
    /// Starts a bulk load. Fails with
    /// [`BadOperation`](Error::BadOperation) unless the tree is empty.
    pub fn bulk_load(&self) -> Result<BulkLoader<'_, 'a>> {
        let anchor = self.load_anchor()?;
        if anchor.size() != 0 {
            return Err(Error::bad_operation("bulk load requires an empty tree"));
        }
        Ok(BulkLoader {
            tree: self,
            anchor,
            fill: self.leaf_capacity(),
            pending: Vec::new(),
            pending_count: 0,
            last_key: None,
            leaves: Vec::new(),
            last_leaf_count: 0,
            total: 0,
        })
    }
}

impl BulkLoader<'_, '_> {
    /// Sets the number of values per leaf (default: full leaves). Must be
    /// called before the first [`push`](Self::push).
    pub fn set_leaf_fill(&mut self, fill: u32) -> Result<()> {
        if self.total != 0 {
            return Err(Error::bad_operation(
                "leaf fill must be chosen before loading starts",
            ));
        }
        let min = self.tree.leaf_min_size().max(1);
        if fill < min || fill > self.tree.leaf_capacity() {
            return Err(Error::bad_argument(format!(
                "leaf fill {} outside [{}, {}]",
                fill,
                min,
                self.tree.leaf_capacity()
            )));
        }
        self.fill = fill;
        Ok(())
    }

    /// Appends one value. Keys must be strictly increasing.
    pub fn push(&mut self, value: &[u8]) -> Result<()> {
        let vs = self.tree.value_size() as usize;
        if value.len() < vs {
            return Err(Error::bad_argument(format!(
                "value buffer of {} bytes is smaller than the value size {}",
                value.len(),
                vs
            )));
        }
        let key = self.tree.key_of(value);
        if let Some(last) = &self.last_key {
            if !self.tree.key_less(last, &key) {
                return Err(Error::bad_argument(
                    "bulk-load input keys must be strictly increasing",
                ));
            }
        }

        self.pending.extend_from_slice(&value[..vs]);
        self.pending_count += 1;
        self.total += 1;
        self.last_key = Some(key);

        if self.pending_count == self.fill {
            self.flush_leaf()?;
        }
        Ok(())
    }

    /// Writes the pending values, builds the internal levels and commits
    /// the anchor.
    pub fn finish(mut self) -> Result<()> {
        if self.pending_count > 0 {
            let min = self.tree.leaf_min_size();
            if self.pending_count < min && !self.leaves.is_empty() {
                self.flush_rebalanced_tail()?;
            } else {
                self.flush_leaf()?;
            }
        }

        if self.total == 0 {
            return Ok(());
        }

        let first_leaf = self.leaves.first().unwrap().0;
        let last_leaf = self.leaves.last().unwrap().0;

        let mut level = std::mem::take(&mut self.leaves);
        let mut height = 1u32;
        while level.len() > 1 {
            level = self.build_internal_level(&level)?;
            height += 1;
        }

        self.anchor.set_root(level[0].0);
        self.anchor.set_height(height);
        self.anchor.set_size(self.total);
        self.anchor.set_leftmost(first_leaf);
        self.anchor.set_rightmost(last_leaf);
        self.tree.store_anchor(&self.anchor)?;
        tracing::debug!(size = self.total, height, "bulk load finished");
        Ok(())
    }

    /// Frees every block written so far and abandons the load.
    pub fn discard(mut self) -> Result<()> {
        let leaves = std::mem::take(&mut self.leaves);
        for (leaf, _) in leaves {
            self.tree.free_leaf_for_load(leaf, &mut self.anchor)?;
        }
        Ok(())
    }

    fn flush_leaf(&mut self) -> Result<()> {
        let vs = self.tree.value_size() as usize;
        let count = self.pending_count;
        let mut leaf = self.tree.create_leaf_for_load(&mut self.anchor)?;
        for i in 0..count as usize {
            leaf.set_value(i as u32, &self.pending[i * vs..(i + 1) * vs]);
        }
        leaf.set_size(count);
        let index = leaf.index();
        drop(leaf);

        let max_key = self.last_key.clone().expect("flush of an empty leaf");
        self.leaves.push((index, max_key));
        self.last_leaf_count = count;
        self.pending.clear();
        self.pending_count = 0;
        Ok(())
    }

    /// Writes an undersized final tail by merging it into the previously
    /// written leaf when it fits, or by borrowing values from that leaf so
    /// both end up at least half full.
    fn flush_rebalanced_tail(&mut self) -> Result<()> {
        let vs = self.tree.value_size() as usize;
        let prev_count = self.last_leaf_count;
        let combined = prev_count + self.pending_count;

        let (prev_index, _) = *self.leaves.last().unwrap();
        let mut prev = self.tree.read_leaf_for_load(prev_index)?;

        if combined <= self.tree.leaf_capacity() {
            for i in 0..self.pending_count as usize {
                prev.set_value(prev_count + i as u32, &self.pending[i * vs..(i + 1) * vs]);
            }
            prev.set_size(combined);
            drop(prev);
            self.leaves.last_mut().unwrap().1 =
                self.last_key.clone().expect("flush of an empty tail");
            self.last_leaf_count = combined;
            self.pending.clear();
            self.pending_count = 0;
            return Ok(());
        }

        let left_count = combined.div_ceil(2);
        let right_count = combined - left_count;
        let borrow = prev_count - left_count;

        let mut leaf = self.tree.create_leaf_for_load(&mut self.anchor)?;

        for i in 0..borrow {
            leaf.set_value(i, prev.value(left_count + i));
        }
        for i in 0..self.pending_count as usize {
            leaf.set_value(borrow + i as u32, &self.pending[i * vs..(i + 1) * vs]);
        }
        leaf.set_size(right_count);
        prev.set_size(left_count);

        // The previous leaf's recorded max key moved into the new leaf.
        let prev_max = self.tree.key_of(prev.value(left_count - 1));
        self.leaves.last_mut().unwrap().1 = prev_max;

        let index = leaf.index();
        drop(prev);
        drop(leaf);

        let max_key = self.last_key.clone().expect("flush of an empty leaf");
        self.leaves.push((index, max_key));
        self.pending.clear();
        self.pending_count = 0;
        Ok(())
    }

    /// Groups one level of `(node, max key)` entries into parent nodes.
    fn build_internal_level(
        &mut self,
        children: &[(BlockIndex, KeyBuf)],
    ) -> Result<Vec<(BlockIndex, KeyBuf)>> {
        let max = self.tree.internal_max_children() as usize;
        let min = self.tree.internal_min_children() as usize;
        let mut parents = Vec::new();

        let mut at = 0;
        while at < children.len() {
            let remaining = children.len() - at;
            let take = if remaining > max {
                if remaining - max >= min {
                    max
                } else {
                    // Leave the last group at least min children.
                    remaining - min
                }
            } else {
                remaining
            };

            let group = &children[at..at + take];
            let mut node = self.tree.create_internal_for_load(&mut self.anchor)?;
            for (i, (child, _)) in group.iter().enumerate() {
                node.set_child(i as u32, *child);
            }
            for (i, (_, key)) in group[..take - 1].iter().enumerate() {
                node.set_key(i as u32, key);
            }
            node.set_key_count(take as u32 - 1);
            let index = node.index();
            drop(node);

            parents.push((index, group[take - 1].1.clone()));
            at += take;
        }
        Ok(parents)
    }
}

#[cfg(test)]
mod tests {
    use crate::alloc::{Allocator, NodeAllocator, NodeAllocatorAnchor};
    use crate::anchor::{AnchorHandle, BlockIndex};
    use crate::container::btree::{BTreeAnchor, RawBTree, TreeOptions};
    use crate::engine::Engine;
    use crate::error::Error;
    use crate::io::MemoryStorage;

    // Block 0 holds the allocator anchor, block 1 the tree anchor.
    fn setup() -> Engine {
        let engine = Engine::new(Box::new(MemoryStorage::new()), 64, 32).unwrap();
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

    fn tree<'a>(alloc: &'a NodeAllocator<'a>) -> RawBTree<'a> {
        let handle = AnchorHandle::in_block(BlockIndex::new(1), 0);
        handle.store(alloc.engine(), &BTreeAnchor::new()).unwrap();
        let opts = TreeOptions::new(
            8,
            4,
            |value, key| key.copy_from_slice(&value[..4]),
            |a, b| a < b,
        );
        RawBTree::new(handle, opts, alloc).unwrap()
    }

    fn value(key: u32) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&key.to_be_bytes());
        buf[4..].copy_from_slice(&(key * 7).to_be_bytes());
        buf
    }

    #[test]
    fn load_builds_a_valid_searchable_tree() {
        let engine = setup();
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        let mut loader = t.bulk_load().unwrap();
        for key in 0..1000u32 {
            loader.push(&value(key)).unwrap();
        }
        loader.finish().unwrap();

        assert_eq!(t.size().unwrap(), 1000);
        t.validate().unwrap();

        let mut buf = [0u8; 8];
        for key in (0..1000u32).step_by(97) {
            assert!(t.get(&key.to_be_bytes(), &mut buf).unwrap());
            assert_eq!(u32::from_be_bytes(buf[4..].try_into().unwrap()), key * 7);
        }
    }

    #[test]
    fn load_of_single_leaf_keeps_root_leaf() {
        let engine = setup();
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        let mut loader = t.bulk_load().unwrap();
        for key in 0..5u32 {
            loader.push(&value(key)).unwrap();
        }
        loader.finish().unwrap();

        assert_eq!(t.height().unwrap(), 1);
        assert_eq!(t.leaf_nodes().unwrap(), 1);
        assert_eq!(t.internal_nodes().unwrap(), 0);
        t.validate().unwrap();
    }

    #[test]
    fn load_of_nothing_leaves_tree_empty() {
        let engine = setup();
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        t.bulk_load().unwrap().finish().unwrap();
        assert!(t.is_empty().unwrap());
        t.validate().unwrap();
    }

    #[test]
    fn undersized_tail_is_rebalanced() {
        let engine = setup();
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        // Leaf capacity 7, min fill 3: 8 values make one full leaf plus a
        // lone straggler that must be rebalanced away.
        let mut loader = t.bulk_load().unwrap();
        for key in 0..8u32 {
            loader.push(&value(key)).unwrap();
        }
        loader.finish().unwrap();

        assert_eq!(t.size().unwrap(), 8);
        t.validate().unwrap();
    }

    #[test]
    fn long_tail_across_many_leaves_is_valid() {
        let engine = setup();
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        // One value past a multiple of the leaf capacity.
        let mut loader = t.bulk_load().unwrap();
        for key in 0..7 * 30 + 1 {
            loader.push(&value(key)).unwrap();
        }
        loader.finish().unwrap();

        assert_eq!(t.size().unwrap(), 211);
        t.validate().unwrap();
    }

    #[test]
    fn custom_fill_factor_spreads_values() {
        let engine = setup();
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        let mut loader = t.bulk_load().unwrap();
        loader.set_leaf_fill(4).unwrap();
        for key in 0..100u32 {
            loader.push(&value(key)).unwrap();
        }
        loader.finish().unwrap();

        assert_eq!(t.leaf_nodes().unwrap(), 25);
        t.validate().unwrap();
    }

    #[test]
    fn non_increasing_input_is_rejected() {
        let engine = setup();
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        let mut loader = t.bulk_load().unwrap();
        loader.push(&value(10)).unwrap();
        assert!(matches!(
            loader.push(&value(10)),
            Err(Error::BadArgument(_))
        ));
        assert!(matches!(loader.push(&value(5)), Err(Error::BadArgument(_))));
    }

    #[test]
    fn load_into_non_empty_tree_is_rejected() {
        let engine = setup();
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        t.insert(&value(1), false).unwrap();
        assert!(matches!(t.bulk_load(), Err(Error::BadOperation(_))));
    }

    #[test]
    fn loaded_tree_accepts_further_mutation() {
        let engine = setup();
        let alloc = allocator(&engine);
        let t = tree(&alloc);

        let mut loader = t.bulk_load().unwrap();
        for key in (0..200u32).map(|i| i * 2) {
            loader.push(&value(key)).unwrap();
        }
        loader.finish().unwrap();

        t.insert(&value(41), false).unwrap();
        assert!(t.remove(&100u32.to_be_bytes()).unwrap());
        assert_eq!(t.size().unwrap(), 200);
        t.validate().unwrap();
    }
}
