//! # Dynamic Array
//!
//! An index-addressable sequence of fixed-size values stored contiguously in
//! an [`Extent`]. The anchor is `(extent, size)`; capacity is derived
//! (`extent length × block capacity`). Storage grows according to a
//! runtime-selected [`GrowthStrategy`], which is held in memory, not
//! persisted — rebinding the anchor with a different strategy is legal and
//! only affects future growth.

use zerocopy::big_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::alloc::Allocator;
use crate::anchor::AnchorHandle;
use crate::container::extent::{Extent, ExtentAnchor};
use crate::engine::Engine;
use crate::error::{Error, Result};

/// How an array sizes its extent when it needs more capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthStrategy {
    /// Round the extent length up to a multiple of `chunk_size` blocks.
    Linear { chunk_size: u64 },
    /// Round the extent length up to the next power of two.
    Exponential,
}

impl GrowthStrategy {
    pub fn linear(chunk_size: u64) -> Self {
        GrowthStrategy::Linear { chunk_size }
    }

    /// Number of blocks to allocate for a required minimum.
    fn apply(&self, minimum: u64) -> Result<u64> {
        match *self {
            GrowthStrategy::Linear { chunk_size } => minimum
                .div_ceil(chunk_size)
                .checked_mul(chunk_size)
                .ok_or(Error::Overflow("linear growth")),
            GrowthStrategy::Exponential => {
                if minimum == 0 {
                    Ok(0)
                } else {
                    minimum
                        .checked_next_power_of_two()
                        .ok_or(Error::Overflow("exponential growth"))
                }
            }
        }
    }
}

impl Default for GrowthStrategy {
    fn default() -> Self {
        GrowthStrategy::Exponential
    }
}

/// Persistent state of a [`RawArray`]: `(extent, size)`. 24 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ArrayAnchor {
    storage: ExtentAnchor,
    size: U64,
}

impl ArrayAnchor {
    pub fn new() -> Self {
        Self {
            storage: ExtentAnchor::new(),
            size: U64::new(0),
        }
    }

    be_accessors! {
        size: u64,
    }
}

impl Default for ArrayAnchor {
    fn default() -> Self {
        Self::new()
    }
}

/// A dynamic array of fixed-size byte values rooted at an anchor.
///
/// The value size is chosen at runtime but must be the same every time the
/// array is bound to its anchor.
pub struct RawArray<'a> {
    anchor: AnchorHandle<ArrayAnchor>,
    extent: Extent<'a>,
    value_size: u32,
    block_capacity: u32,
    growth: GrowthStrategy,
}

impl<'a> RawArray<'a> {
    /// Binds an array rooted at `anchor`. `value_size` and `alloc` must be
    /// equivalent every time the array is loaded.
    pub fn new(
        anchor: AnchorHandle<ArrayAnchor>,
        value_size: u32,
        alloc: &'a dyn Allocator,
    ) -> Result<Self> {
        if value_size == 0 {
            return Err(Error::bad_argument("value size must be positive"));
        }
        let block_capacity = alloc.block_size() / value_size;
        if block_capacity == 0 {
            return Err(Error::bad_argument(
                "block size too small to fit a single value",
            ));
        }
        let extent = Extent::new(anchor_member!(anchor, ArrayAnchor, storage), alloc);
        Ok(Self {
            anchor,
            extent,
            value_size,
            block_capacity,
            growth: GrowthStrategy::default(),
        })
    }

    #[inline]
    pub fn engine(&self) -> &'a Engine {
        self.extent.engine()
    }

    /// Size of a serialized value on disk.
    #[inline]
    pub fn value_size(&self) -> u32 {
        self.value_size
    }

    /// Number of values that fit into a single block.
    #[inline]
    pub fn block_capacity(&self) -> u32 {
        self.block_capacity
    }

    pub fn growth(&self) -> GrowthStrategy {
        self.growth
    }

    /// Changes the growth strategy for future allocations.
    pub fn set_growth(&mut self, growth: GrowthStrategy) -> Result<()> {
        if let GrowthStrategy::Linear { chunk_size } = growth {
            if chunk_size < 1 {
                return Err(Error::bad_argument("growth chunk must be at least 1"));
            }
        }
        self.growth = growth;
        Ok(())
    }

    /// Number of values in the array.
    pub fn size(&self) -> Result<u64> {
        Ok(self.anchor.load(self.engine())?.size())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    /// Number of blocks currently allocated.
    pub fn blocks(&self) -> Result<u64> {
        self.extent.size()
    }

    /// Maximum number of values storable without reallocation.
    pub fn capacity(&self) -> Result<u64> {
        Ok(self.blocks()? * self.block_capacity as u64)
    }

    /// `size / capacity`, or 0 for an unallocated array.
    pub fn fill_factor(&self) -> Result<f64> {
        let capacity = self.capacity()?;
        if capacity == 0 {
            Ok(0.0)
        } else {
            Ok(self.size()? as f64 / capacity as f64)
        }
    }

    /// Total on-disk footprint in bytes.
    pub fn byte_size(&self) -> Result<u64> {
        self.extent.byte_size()
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

    /// Copies the value at `index` into `out` (at least `value_size` bytes).
    pub fn get(&self, index: u64, out: &mut [u8]) -> Result<()> {
        self.check_value_buffer(out.len())?;
        self.check_index(index)?;
        let guard = self.extent.read(index / self.block_capacity as u64)?;
        let offset = self.offset_in_block(index);
        out[..self.value_size as usize]
            .copy_from_slice(&guard.data()[offset..offset + self.value_size as usize]);
        Ok(())
    }

    /// Overwrites the value at `index` with `value`.
    pub fn set(&mut self, index: u64, value: &[u8]) -> Result<()> {
        self.check_value_buffer(value.len())?;
        self.check_index(index)?;
        let mut guard = self.extent.read(index / self.block_capacity as u64)?;
        let offset = self.offset_in_block(index);
        guard.write_at(offset, &value[..self.value_size as usize]);
        Ok(())
    }

    /// Appends `value`, growing the extent per the growth strategy if the
    /// array is at capacity.
    pub fn push_back(&mut self, value: &[u8]) -> Result<()> {
        self.check_value_buffer(value.len())?;
        let size = self.size()?;

        let block = size / self.block_capacity as u64;
        let offset = self.offset_in_block(size);
        if block == self.extent.size()? {
            self.resize_extent(block + 1, false)?;
        }

        let mut guard = if offset == 0 {
            self.extent.overwrite_zero(block)?
        } else {
            self.extent.read(block)?
        };
        guard.write_at(offset, &value[..self.value_size as usize]);
        drop(guard);

        self.set_size(size + 1)
    }

    /// Removes the last value. The freed cell is not zeroed.
    pub fn pop_back(&mut self) -> Result<()> {
        let size = self.size()?;
        if size == 0 {
            return Err(Error::bad_operation("pop_back on empty array"));
        }
        self.set_size(size - 1)
    }

    /// Sets the size to `n`. New cells are initialized with `fill` (or
    /// zeroed when `None`); shrinking just drops the tail without clearing
    /// it.
    pub fn resize(&mut self, n: u64, fill: Option<&[u8]>) -> Result<()> {
        if let Some(fill) = fill {
            self.check_value_buffer(fill.len())?;
        }
        let size = self.size()?;
        if n == size {
            return Ok(());
        }
        if n < size {
            return self.set_size(n);
        }

        self.reserve(n)?;

        let value_size = self.value_size as usize;
        let capacity = self.block_capacity;
        let mut remaining = n - size;
        let mut block = size / capacity as u64;
        let mut offset = (size % capacity as u64) as u32;
        while remaining > 0 {
            let mut guard = if offset == 0 {
                self.extent.overwrite_zero(block)?
            } else {
                self.extent.read(block)?
            };
            let writable = ((capacity - offset) as u64).min(remaining) as usize;
            let base = offset as usize * value_size;
            let data = guard.data_mut();
            match fill {
                Some(value) => {
                    for cell in 0..writable {
                        let at = base + cell * value_size;
                        data[at..at + value_size].copy_from_slice(&value[..value_size]);
                    }
                }
                None => data[base..base + writable * value_size].fill(0),
            }
            remaining -= writable as u64;
            block += 1;
            offset = 0;
        }

        self.set_size(n)
    }

    /// Ensures capacity for at least `n` values, growing per the strategy.
    pub fn reserve(&mut self, n: u64) -> Result<()> {
        let needed = n.div_ceil(self.block_capacity as u64);
        if needed > self.extent.size()? {
            self.resize_extent(needed, false)?;
        }
        Ok(())
    }

    /// Ensures capacity for `n` values beyond the current size.
    pub fn reserve_additional(&mut self, n: u64) -> Result<()> {
        let total = self
            .size()?
            .checked_add(n)
            .ok_or(Error::Overflow("reserve_additional"))?;
        self.reserve(total)
    }

    /// Releases unused capacity down to what the growth strategy considers
    /// necessary for the current size. Under exponential growth a
    /// power-of-two extent is already "necessary" and will not move.
    pub fn shrink(&mut self) -> Result<()> {
        let needed = self.size()?.div_ceil(self.block_capacity as u64);
        self.resize_extent(needed, false)
    }

    /// Releases all unused capacity, ignoring the growth strategy.
    pub fn shrink_to_fit(&mut self) -> Result<()> {
        let needed = self.size()?.div_ceil(self.block_capacity as u64);
        self.resize_extent(needed, true)
    }

    /// Removes all values but keeps the allocated storage.
    pub fn clear(&mut self) -> Result<()> {
        self.resize(0, None)
    }

    /// Removes all values and frees all storage.
    pub fn reset(&mut self) -> Result<()> {
        self.extent.reset()?;
        self.set_size(0)
    }

    /// Verifies the array's basic invariants.
    pub fn validate(&self) -> Result<()> {
        let anchor = self.anchor.load(self.engine())?;
        let length = self.extent.size()?;
        let first = self.extent.first()?;
        if first.is_nil() != (length == 0) {
            return Err(Error::corruption(
                "extent first/length disagree about emptiness",
            ));
        }
        let capacity = length * self.block_capacity as u64;
        if anchor.size() > capacity {
            return Err(Error::corruption(format!(
                "array size {} exceeds capacity {}",
                anchor.size(),
                capacity
            )));
        }
        Ok(())
    }

    /// Rewrites the size field through a fresh anchor load. The extent
    /// rewrites its own embedded sub-record, so a stale whole-record copy
    /// must never be stored back over it.
    fn set_size(&mut self, n: u64) -> Result<()> {
        let mut anchor = self.anchor.load(self.engine())?;
        anchor.set_size(n);
        self.anchor.store(self.engine(), &anchor)
    }

    fn resize_extent(&mut self, minimum: u64, exact: bool) -> Result<()> {
        let target = if exact {
            minimum
        } else {
            self.growth.apply(minimum)?
        };
        self.extent.resize(target)
    }

    #[inline]
    fn offset_in_block(&self, index: u64) -> usize {
        (index % self.block_capacity as u64) as usize * self.value_size as usize
    }

    fn check_index(&self, index: u64) -> Result<()> {
        let size = self.size()?;
        if index >= size {
            return Err(Error::bad_argument(format!(
                "array index {} out of bounds (size {})",
                index, size
            )));
        }
        Ok(())
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
