//! Leaf node algebra.
//!
//! A leaf is a pinned block holding a `size` header and a sorted array of
//! fixed-size values. All operations work in place on the pinned buffer;
//! cross-node operations (split, merge, steal) take both nodes so the byte
//! moves happen in one pass.

use crate::anchor::BlockIndex;
use crate::engine::BlockGuard;

pub(super) const LEAF_HEADER_SIZE: usize = 4;

/// A pinned leaf block.
pub(super) struct LeafNode<'a> {
    guard: BlockGuard<'a>,
    value_size: usize,
    capacity: u32,
}

impl<'a> LeafNode<'a> {
    pub fn new(guard: BlockGuard<'a>, value_size: u32, capacity: u32) -> Self {
        Self {
            guard,
            value_size: value_size as usize,
            capacity,
        }
    }

    /// Max values per leaf for the given geometry.
    pub fn capacity_for(block_size: u32, value_size: u32) -> u32 {
        (block_size.saturating_sub(LEAF_HEADER_SIZE as u32)) / value_size
    }

    #[inline]
    pub fn index(&self) -> BlockIndex {
        self.guard.index()
    }

    pub fn init(&mut self) {
        self.set_size(0);
    }

    pub fn size(&self) -> u32 {
        u32::from_be_bytes(self.guard.data()[..LEAF_HEADER_SIZE].try_into().unwrap())
    }

    pub fn set_size(&mut self, size: u32) {
        debug_assert!(size <= self.capacity, "leaf size exceeds capacity");
        self.guard.write_at(0, &size.to_be_bytes());
    }

    #[inline]
    fn offset(&self, index: u32) -> usize {
        LEAF_HEADER_SIZE + index as usize * self.value_size
    }

    pub fn value(&self, index: u32) -> &[u8] {
        debug_assert!(index < self.size(), "value index out of bounds");
        let at = self.offset(index);
        &self.guard.data()[at..at + self.value_size]
    }

    pub fn set_value(&mut self, index: u32, value: &[u8]) {
        debug_assert!(index < self.capacity, "value index out of bounds");
        let at = self.offset(index);
        self.guard.write_at(at, &value[..self.value_size]);
    }

    /// Inserts `value` at `index`, shifting the tail right.
    pub fn insert_nonfull(&mut self, index: u32, value: &[u8]) {
        let size = self.size();
        debug_assert!(index <= size && size < self.capacity);

        let vs = self.value_size;
        let from = self.offset(index);
        let to = self.offset(size);
        let dest = self.offset(index + 1);
        let data = self.guard.data_mut();
        data.copy_within(from..to, dest);
        data[from..from + vs].copy_from_slice(&value[..vs]);
        self.set_size(size + 1);
    }

    /// Splits a full leaf while inserting `value` at `index`. After the
    /// call this leaf holds the first `mid` values and `new_leaf` the rest;
    /// the inserted value ends up at `index` here if `index < mid`, else at
    /// `index - mid` in `new_leaf`.
    pub fn insert_full(&mut self, index: u32, value: &[u8], mid: u32, new_leaf: &mut LeafNode<'_>) {
        let count = self.size();
        debug_assert!(count == self.capacity, "split of a non-full leaf");
        debug_assert!(mid > 0 && mid <= count && index <= count);
        debug_assert!(new_leaf.size() == 0, "split target must be empty");

        let vs = self.value_size;
        let left = self.guard.data_mut();
        let right = new_leaf.guard.data_mut();
        let off = |i: u32| LEAF_HEADER_SIZE + i as usize * vs;

        if index < mid {
            // The new value lands in the left node: move [mid-1, count) over,
            // then shift [index, mid-1) right by one.
            right[off(0)..off(count - mid + 1)].copy_from_slice(&left[off(mid - 1)..off(count)]);
            left.copy_within(off(index)..off(mid - 1), off(index + 1));
            left[off(index)..off(index) + vs].copy_from_slice(&value[..vs]);
        } else {
            let split = index - mid;
            right[off(0)..off(split)].copy_from_slice(&left[off(mid)..off(mid + split)]);
            right[off(split)..off(split) + vs].copy_from_slice(&value[..vs]);
            right[off(split + 1)..off(count - mid + 1)]
                .copy_from_slice(&left[off(mid + split)..off(count)]);
        }

        self.set_size(mid);
        new_leaf.set_size(count + 1 - mid);
    }

    /// Removes the value at `index`, shifting the tail left.
    pub fn remove(&mut self, index: u32) {
        let size = self.size();
        debug_assert!(index < size);

        let from = self.offset(index + 1);
        let to = self.offset(size);
        let dest = self.offset(index);
        self.guard.data_mut().copy_within(from..to, dest);
        self.set_size(size - 1);
    }

    /// Moves the first `n` values of `right` onto the end of this leaf.
    pub fn append_from_right(&mut self, right: &mut LeafNode<'_>, n: u32) {
        let size = self.size();
        let right_size = right.size();
        debug_assert!(n <= right_size && size + n <= self.capacity);

        let vs = self.value_size;
        let off = |i: u32| LEAF_HEADER_SIZE + i as usize * vs;
        let data = self.guard.data_mut();
        let rdata = right.guard.data_mut();
        data[off(size)..off(size + n)].copy_from_slice(&rdata[off(0)..off(n)]);
        rdata.copy_within(off(n)..off(right_size), off(0));

        self.set_size(size + n);
        right.set_size(right_size - n);
    }

    /// Moves the last `n` values of `left` onto the front of this leaf.
    pub fn prepend_from_left(&mut self, left: &mut LeafNode<'_>, n: u32) {
        let size = self.size();
        let left_size = left.size();
        debug_assert!(n <= left_size && size + n <= self.capacity);

        let vs = self.value_size;
        let off = |i: u32| LEAF_HEADER_SIZE + i as usize * vs;
        let data = self.guard.data_mut();
        let ldata = left.guard.data_mut();
        data.copy_within(off(0)..off(size), off(n));
        data[off(0)..off(n)].copy_from_slice(&ldata[off(left_size - n)..off(left_size)]);

        self.set_size(size + n);
        left.set_size(left_size - n);
    }
}
