//! # Internal Macros
//!
//! Accessor generation for on-disk header structs. Every persistent integer
//! in shelfdb is big-endian on disk, represented in memory by the unaligned
//! `zerocopy::big_endian` wrapper types; `be_accessors!` generates the
//! getter/setter pairs so header impls stay free of `.get()`/`::new()`
//! boilerplate.
//!
//! ```ignore
//! use zerocopy::big_endian::{U32, U64};
//!
//! #[repr(C)]
//! struct NodeHeader {
//!     count: U32,
//!     next: U64,
//! }
//!
//! impl NodeHeader {
//!     be_accessors! {
//!         count: u32,
//!         next: block_index,
//!     }
//! }
//!
//! // Generates:
//! // pub fn count(&self) -> u32 { self.count.get() }
//! // pub fn set_count(&mut self, val: u32) { self.count = U32::new(val); }
//! // pub fn next(&self) -> BlockIndex { BlockIndex::new(self.next.get()) }
//! // pub fn set_next(&mut self, val: BlockIndex) { self.next = U64::new(val.raw()); }
//! ```
//!
//! The `block_index` form is for `u64` fields that carry the NIL sentinel.

/// Generates getter and setter methods for big-endian on-disk fields.
#[macro_export]
macro_rules! be_accessors {
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::big_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::big_endian::U64::new(val);
            }
        }
    };
    (@impl $field:ident, block_index) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> $crate::anchor::BlockIndex {
                $crate::anchor::BlockIndex::new(self.$field.get())
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: $crate::anchor::BlockIndex) {
                self.$field = ::zerocopy::big_endian::U64::new(val.raw());
            }
        }
    };
    ($($field:ident: $kind:tt),* $(,)?) => {
        $($crate::be_accessors!(@impl $field, $kind);)*
    };
}

/// Derives a typed sub-handle for a named field of an anchor record.
///
/// Expands to [`AnchorHandle::member`](crate::anchor::AnchorHandle::member)
/// with the field offset computed at compile time, so the offset can never
/// drift from the struct definition.
#[macro_export]
macro_rules! anchor_member {
    ($handle:expr, $parent:ty, $field:ident) => {
        $handle.member(::core::mem::offset_of!($parent, $field) as u32)
    };
}
