//! # shelfdb - Persistent Block-Oriented Containers
//!
//! shelfdb is an embedded library for building persistent data structures
//! on top of a paged file: a block-cache-backed storage engine plus a
//! family of on-disk containers (dynamic array, stack, B+-tree) whose
//! state survives process restarts.
//!
//! Every container is rooted at an **anchor** — a small serialized
//! descriptor stored wherever the embedder chooses, typically in a file
//! header block or inside another container. Rebinding a container over
//! the same anchor reproduces the same observable state.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │   Containers (array, stack, btree)   │
//! ├──────────────────────────────────────┤
//! │  Extents │ Anchors │ Block allocators│
//! ├──────────────────────────────────────┤
//! │   Engine (pinnable write-back cache) │
//! ├──────────────────────────────────────┤
//! │   File driver (positional block I/O) │
//! └──────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use shelfdb::alloc::{Allocator, FreeListAllocator, FreeListAnchor};
//! use shelfdb::anchor::{AnchorHandle, BlockIndex};
//! use shelfdb::container::array::{ArrayAnchor, RawArray};
//! use shelfdb::engine::Engine;
//! use shelfdb::io::FileStorage;
//!
//! let file = FileStorage::create("data.shelf")?;
//! let engine = Engine::new(Box::new(file), 4096, 64)?;
//! engine.grow(1)?; // block 0: our header
//!
//! let alloc_anchor = AnchorHandle::in_block(BlockIndex::new(0), 0);
//! alloc_anchor.store(&engine, &FreeListAnchor::new())?;
//! let alloc = FreeListAllocator::new(alloc_anchor, &engine)?;
//!
//! let array_anchor = AnchorHandle::in_block(BlockIndex::new(0), 8);
//! array_anchor.store(&engine, &ArrayAnchor::new())?;
//! let mut array = RawArray::new(array_anchor, 8, &alloc)?;
//!
//! array.push_back(&42u64.to_be_bytes())?;
//! engine.flush()?; // the only durability barrier
//! ```
//!
//! ## Concurrency Model
//!
//! Single-threaded. The engine's internal lock exists so several
//! containers can share one engine through `&Engine`, not to make
//! concurrent use safe; callers who want to share across threads must
//! serialize externally.
//!
//! ## Durability Model
//!
//! Writes land in the block cache and reach the file on eviction or
//! [`Engine::flush`](engine::Engine::flush). Nothing flushes implicitly —
//! not even drop. Crash consistency beyond an explicit flush is out of
//! scope.
//!
//! ## Module Overview
//!
//! - [`engine`]: paged file + pinnable write-back block cache
//! - [`io`]: file driver trait and backends
//! - [`anchor`]: block indices, anchor records, anchor handles
//! - [`alloc`]: block allocators (single-block and free-run)
//! - [`container`]: extent, array, stack, B+-tree with live cursors

#[macro_use]
mod macros;

pub mod alloc;
pub mod anchor;
pub mod container;
pub mod engine;
pub mod error;
pub mod io;

pub use anchor::{AnchorHandle, BlockIndex};
pub use engine::{BlockGuard, Engine, EngineStats};
pub use error::{Error, Result};
