//! Close/reopen durability: for any mutation sequence followed by a flush
//! and engine teardown, rebinding the containers from the same anchors
//! must reproduce the same observable state.

use shelfdb::alloc::{FreeListAllocator, FreeListAnchor, NodeAllocator, NodeAllocatorAnchor};
use shelfdb::anchor::{AnchorHandle, BlockIndex};
use shelfdb::container::array::{ArrayAnchor, GrowthStrategy, RawArray};
use shelfdb::container::btree::{BTreeAnchor, RawBTree, TreeOptions};
use shelfdb::container::stack::{RawStack, StackAnchor};
use shelfdb::engine::Engine;
use shelfdb::io::FileStorage;

use rand::seq::SliceRandom;
use rand::SeedableRng;

const HEADER_BLOCK: BlockIndex = BlockIndex::new(0);
const ALLOC_ANCHOR_OFFSET: u32 = 0;
const CONTAINER_ANCHOR_OFFSET: u32 = 64;

/// Opens an engine over `path`, creating the header block and anchors on
/// first use.
fn open_engine(path: &std::path::Path, block_size: u32) -> Engine {
    let create = !path.exists();
    let file = if create {
        FileStorage::create(path).unwrap()
    } else {
        FileStorage::open(path).unwrap()
    };
    let engine = Engine::new(Box::new(file), block_size, 32).unwrap();
    if create {
        engine.grow(1).unwrap();
    }
    engine
}

fn node_alloc_anchor(engine: &Engine, create: bool) -> AnchorHandle<NodeAllocatorAnchor> {
    let handle = AnchorHandle::in_block(HEADER_BLOCK, ALLOC_ANCHOR_OFFSET);
    if create {
        handle.store(engine, &NodeAllocatorAnchor::new()).unwrap();
    }
    handle
}

fn tree_options() -> TreeOptions {
    TreeOptions::new(
        8,
        4,
        |value, key| key.copy_from_slice(&value[..4]),
        |a, b| a < b,
    )
}

#[test]
fn array_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("array.shelf");

    {
        let engine = open_engine(&path, 512);
        let alloc_anchor = AnchorHandle::in_block(HEADER_BLOCK, ALLOC_ANCHOR_OFFSET);
        alloc_anchor.store(&engine, &FreeListAnchor::new()).unwrap();
        let alloc = FreeListAllocator::new(alloc_anchor, &engine).unwrap();

        let anchor = AnchorHandle::in_block(HEADER_BLOCK, CONTAINER_ANCHOR_OFFSET);
        anchor.store(&engine, &ArrayAnchor::new()).unwrap();
        let mut array = RawArray::new(anchor, 4, &alloc).unwrap();

        for i in 0..513u32 {
            array.push_back(&i.to_be_bytes()).unwrap();
        }
        assert_eq!(array.blocks().unwrap(), 8);
        assert_eq!(array.capacity().unwrap(), 1024);
        engine.flush().unwrap();
    }

    let engine = open_engine(&path, 512);
    let alloc_anchor = AnchorHandle::in_block(HEADER_BLOCK, ALLOC_ANCHOR_OFFSET);
    let alloc = FreeListAllocator::new(alloc_anchor, &engine).unwrap();
    let anchor = AnchorHandle::in_block(HEADER_BLOCK, CONTAINER_ANCHOR_OFFSET);
    let mut array = RawArray::new(anchor, 4, &alloc).unwrap();

    assert_eq!(array.size().unwrap(), 513);
    assert_eq!(array.capacity().unwrap(), 1024);
    let mut buf = [0u8; 4];
    for i in 0..513u32 {
        array.get(i as u64, &mut buf).unwrap();
        assert_eq!(u32::from_be_bytes(buf), i);
    }
    array.validate().unwrap();

    // The reopened handle keeps mutating the same storage.
    array.set_growth(GrowthStrategy::linear(5)).unwrap();
    array.resize(1, None).unwrap();
    array.shrink_to_fit().unwrap();
    assert_eq!(array.blocks().unwrap(), 1);
}

#[test]
fn stack_push_pop_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stack.shelf");

    // 256-byte blocks, i32 values: 61 values per node. Push 213, pop 35.
    let max = {
        let engine = open_engine(&path, 256);
        let alloc_anchor = node_alloc_anchor(&engine, true);
        let alloc = NodeAllocator::new(alloc_anchor, &engine).unwrap();

        let anchor = AnchorHandle::in_block(HEADER_BLOCK, CONTAINER_ANCHOR_OFFSET);
        anchor.store(&engine, &StackAnchor::new()).unwrap();
        let mut stack = RawStack::new(anchor, 4, &alloc).unwrap();
        assert_eq!(stack.node_capacity(), 61);

        let mut max = stack.node_capacity() as i32 * 7 / 2;
        for i in 0..max {
            stack.push(&i.to_be_bytes()).unwrap();
        }
        for _ in 0..35 {
            stack.pop().unwrap();
        }
        max -= 35;

        let mut buf = [0u8; 4];
        stack.top(&mut buf).unwrap();
        assert_eq!(i32::from_be_bytes(buf), max - 1);

        engine.flush().unwrap();
        max
    };
    assert_eq!(max, 178);

    let engine = open_engine(&path, 256);
    let alloc_anchor = node_alloc_anchor(&engine, false);
    let alloc = NodeAllocator::new(alloc_anchor, &engine).unwrap();
    let anchor = AnchorHandle::in_block(HEADER_BLOCK, CONTAINER_ANCHOR_OFFSET);
    let mut stack = RawStack::new(anchor, 4, &alloc).unwrap();

    assert_eq!(stack.size().unwrap(), max as u64);
    stack.validate().unwrap();

    let mut buf = [0u8; 4];
    for expected in (0..max).rev() {
        stack.top(&mut buf).unwrap();
        assert_eq!(i32::from_be_bytes(buf), expected);
        stack.pop().unwrap();
    }
    assert!(stack.is_empty().unwrap());
    assert_eq!(stack.nodes().unwrap(), 0);
}

#[test]
fn btree_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree.shelf");

    let mut keys: Vec<u32> = (0..2000).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(41);
    keys.shuffle(&mut rng);

    {
        let engine = open_engine(&path, 256);
        let alloc_anchor = node_alloc_anchor(&engine, true);
        let alloc = NodeAllocator::new(alloc_anchor, &engine).unwrap();

        let anchor = AnchorHandle::in_block(HEADER_BLOCK, CONTAINER_ANCHOR_OFFSET);
        anchor.store(&engine, &BTreeAnchor::new()).unwrap();
        let tree = RawBTree::new(anchor, tree_options(), &alloc).unwrap();

        for &key in &keys {
            let mut value = [0u8; 8];
            value[..4].copy_from_slice(&key.to_be_bytes());
            value[4..].copy_from_slice(&(key ^ 0xABCD).to_be_bytes());
            assert!(tree.insert(&value, false).unwrap());
        }
        tree.validate().unwrap();
        engine.flush().unwrap();
    }

    let engine = open_engine(&path, 256);
    let alloc_anchor = node_alloc_anchor(&engine, false);
    let alloc = NodeAllocator::new(alloc_anchor, &engine).unwrap();
    let anchor = AnchorHandle::in_block(HEADER_BLOCK, CONTAINER_ANCHOR_OFFSET);
    let tree = RawBTree::new(anchor, tree_options(), &alloc).unwrap();

    assert_eq!(tree.size().unwrap(), 2000);
    tree.validate().unwrap();

    let mut buf = [0u8; 8];
    for key in 0..2000u32 {
        assert!(tree.get(&key.to_be_bytes(), &mut buf).unwrap());
        assert_eq!(
            u32::from_be_bytes(buf[4..].try_into().unwrap()),
            key ^ 0xABCD
        );
    }

    // The reopened tree keeps rebalancing correctly.
    for key in 0..1000u32 {
        assert!(tree.remove(&key.to_be_bytes()).unwrap());
    }
    assert_eq!(tree.size().unwrap(), 1000);
    tree.validate().unwrap();
}

#[test]
fn btree_cursor_survives_mass_erase() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cursor.shelf");

    let engine = open_engine(&path, 256);
    let alloc_anchor = node_alloc_anchor(&engine, true);
    let alloc = NodeAllocator::new(alloc_anchor, &engine).unwrap();
    let anchor = AnchorHandle::in_block(HEADER_BLOCK, CONTAINER_ANCHOR_OFFSET);
    let tree = RawBTree::new(anchor, tree_options(), &alloc).unwrap();

    let mut rng = rand::rngs::StdRng::seed_from_u64(43);
    let mut keys: Vec<u32> = (0..10_000).collect();
    keys.shuffle(&mut rng);
    for &key in &keys {
        let mut value = [0u8; 8];
        value[..4].copy_from_slice(&key.to_be_bytes());
        value[4..].copy_from_slice(&key.wrapping_mul(31).to_be_bytes());
        tree.insert(&value, false).unwrap();
    }

    let mut cursor = tree.create_cursor();
    assert!(cursor.find(&5000u32.to_be_bytes()).unwrap());

    let mut below: Vec<u32> = (0..5000).collect();
    below.shuffle(&mut rng);
    for &key in &below {
        assert!(tree.remove(&key.to_be_bytes()).unwrap());
    }
    tree.validate().unwrap();

    // The cursor still addresses the value inserted for key 5000 and is
    // now the tree's minimum.
    let mut buf = [0u8; 8];
    cursor.get(&mut buf).unwrap();
    assert_eq!(u32::from_be_bytes(buf[..4].try_into().unwrap()), 5000);
    assert_eq!(
        u32::from_be_bytes(buf[4..].try_into().unwrap()),
        5000u32.wrapping_mul(31)
    );
    assert!(!cursor.move_prev().unwrap());
    assert!(cursor.at_end());
}
