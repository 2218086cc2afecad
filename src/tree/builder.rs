//! Placement of decoded blocks into the tree.
//!
//! Decoders discover regions in whatever order the format presents them.
//! Two strategies put them at the right depth:
//!
//! - [`insert_deep`] for regions discovered parents-first: descend into the
//!   child whose range contains the new block, otherwise insert it among the
//!   siblings in address order.
//! - [`Builder`] for streams where containment is not knowable yet (Mach-O
//!   load commands reference segments that may come later). Blocks are
//!   buffered per start address and placed by [`Builder::rebalance`] once the
//!   whole stream has been seen.
//!
//! [`hoist`] repairs nesting that only turns out wrong once every sibling of
//! a level is known.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::trace;

use super::Block;

// =============================================================================
// Deep Insert
// =============================================================================

/// Inserts `block` at the deepest position whose range contains it.
///
/// Unsized blocks are never descended into and unsized new blocks stay at
/// the level they are inserted at. Sized siblings that the new block fully
/// contains are moved under it. A block identical in name and range to an
/// existing one at the landing level is merged into it.
pub fn insert_deep(parent: &mut Block, block: Block) {
    let mut level = parent;
    loop {
        if block.is_container() {
            break;
        }
        let next = level.children.iter().position(|child| {
            child.contains(&block) && !(child.address == block.address && child.size == block.size && child.name == block.name)
        });
        match next {
            Some(index) => level = &mut level.children[index],
            None => break,
        }
    }
    insert_sibling(level, block);
}

/// Inserts `block` among `parent`'s direct children in address order.
fn insert_sibling(parent: &mut Block, mut block: Block) {
    if let Some(existing) = parent
        .children
        .iter_mut()
        .find(|c| c.address == block.address && c.size == block.size && c.name == block.name)
    {
        trace!(name = %block.name, address = block.address, "coalescing duplicate block");
        merge(existing, block);
        return;
    }

    if !block.is_container() {
        // Adopt sized siblings that now fall inside the new block.
        let mut index = 0;
        while index < parent.children.len() {
            let sibling = &parent.children[index];
            if !sibling.is_container() && block.contains(sibling) {
                let adopted = parent.children.remove(index);
                insert_deep(&mut block, adopted);
            } else {
                index += 1;
            }
        }
    }

    let position = parent
        .children
        .partition_point(|c| sibling_order(c, &block) != Ordering::Greater);
    block.offset = block.address.wrapping_sub(parent.address);
    block.fix_offsets();
    parent.children.insert(position, block);
}

/// Order of two blocks sharing a parent: by address, then enclosing first.
fn sibling_order(a: &Block, b: &Block) -> Ordering {
    a.address
        .cmp(&b.address)
        .then_with(|| b.is_container().cmp(&a.is_container()))
        .then_with(|| b.footprint().cmp(&a.footprint()))
}

fn merge(existing: &mut Block, other: Block) {
    if existing.values.is_empty() {
        existing.values = other.values;
    }
    for child in other.children {
        insert_deep(existing, child);
    }
}

// =============================================================================
// Flat Insert + Rebalance
// =============================================================================

/// Buffers blocks by start address until their containers are known.
#[derive(Debug, Default)]
pub struct Builder {
    pending: BTreeMap<u64, Vec<Block>>,
}

impl Builder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered blocks.
    pub fn len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Buffers a block under its start address.
    ///
    /// Within one address, container-like candidates sort first so they are
    /// placed before the leaves they may enclose.
    pub fn add(&mut self, block: Block) {
        let bucket = self.pending.entry(block.address).or_default();
        let position = bucket.partition_point(|b| bucket_order(b, &block) != Ordering::Greater);
        bucket.insert(position, block);
    }

    /// Places every buffered block into `root`, ascending by address, then
    /// hoists grandchildren that spill over their parent's next sibling.
    pub fn rebalance(self, root: &mut Block) {
        for (_, bucket) in self.pending {
            for block in bucket {
                insert_deep(root, block);
            }
        }
        hoist(root);
        root.fix_offsets();
    }
}

/// Tie-break for blocks sharing a start address: unsized before sized,
/// larger before smaller, more values before fewer, then by name.
fn bucket_order(a: &Block, b: &Block) -> Ordering {
    b.is_container()
        .cmp(&a.is_container())
        .then_with(|| b.footprint().cmp(&a.footprint()))
        .then_with(|| b.values.len().cmp(&a.values.len()))
        .then_with(|| a.name.cmp(&b.name))
}

// =============================================================================
// Hoisting
// =============================================================================

/// Moves grandchildren that extend past the next sibling's start up one level.
///
/// Applied recursively, top-down.
pub fn hoist(level: &mut Block) {
    let mut displaced = Vec::new();
    for index in 0..level.children.len() {
        let next_start = match level.children.get(index + 1) {
            Some(next) => next.address,
            None => break,
        };
        let child = &mut level.children[index];
        let mut kept = Vec::with_capacity(child.children.len());
        for grandchild in child.children.drain(..) {
            if !grandchild.is_container() && grandchild.end() > next_start {
                displaced.push(grandchild);
            } else {
                kept.push(grandchild);
            }
        }
        child.children = kept;
    }
    for block in displaced {
        trace!(name = %block.name, address = block.address, "hoisting block");
        insert_deep(level, block);
    }
    for child in &mut level.children {
        hoist(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{check, Value};

    fn names(block: &Block) -> Vec<&str> {
        block.children.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn test_insert_deep_descends_into_container() {
        let mut root = Block::container("root", 0);
        insert_deep(&mut root, Block::new("segment", 0x1000, 0x1000));
        insert_deep(&mut root, Block::new("section", 0x1100, 0x100));
        insert_deep(&mut root, Block::new("other", 0x3000, 0x10));

        assert_eq!(names(&root), vec!["segment", "other"]);
        assert_eq!(names(&root.children[0]), vec!["section"]);
        assert_eq!(root.children[0].children[0].offset, 0x100);
        check(&root).unwrap();
    }

    #[test]
    fn test_insert_deep_keeps_address_order() {
        let mut root = Block::container("root", 0);
        insert_deep(&mut root, Block::new("c", 0x300, 0x10));
        insert_deep(&mut root, Block::new("a", 0x100, 0x10));
        insert_deep(&mut root, Block::new("b", 0x200, 0x10));
        assert_eq!(names(&root), vec!["a", "b", "c"]);
        check(&root).unwrap();
    }

    #[test]
    fn test_insert_deep_adopts_contained_siblings() {
        let mut root = Block::container("root", 0);
        insert_deep(&mut root, Block::new("leaf", 0x1010, 0x10));
        insert_deep(&mut root, Block::new("outer", 0x1000, 0x100));
        assert_eq!(names(&root), vec!["outer"]);
        assert_eq!(names(&root.children[0]), vec!["leaf"]);
        assert_eq!(root.children[0].children[0].offset, 0x10);
        check(&root).unwrap();
    }

    #[test]
    fn test_insert_deep_skips_unsized_children() {
        let mut root = Block::container("root", 0);
        insert_deep(&mut root, Block::container("area", 0x1000));
        insert_deep(&mut root, Block::new("blob", 0x1000, 0x10));
        assert_eq!(names(&root), vec!["area", "blob"]);
        check(&root).unwrap();
    }

    #[test]
    fn test_duplicate_blocks_coalesce() {
        let mut root = Block::container("root", 0);
        insert_deep(&mut root, Block::new("String Table", 0x2000, 0x100));
        insert_deep(&mut root, Block::new("String Table", 0x2000, 0x100));
        assert_eq!(root.children.len(), 1);
    }

    #[test]
    fn test_bucket_prefers_containers() {
        let mut builder = Builder::new();
        let mut leaf = Block::new("leaf", 0x1000, 0x20);
        leaf.push_value(Value::new("magic", 0, 4, "0xfeedfacf"));
        builder.add(leaf);
        builder.add(Block::new("segment", 0x1000, 0x4000));
        builder.add(Block::container("image", 0x1000));

        let bucket = &builder.pending[&0x1000];
        let order: Vec<_> = bucket.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(order, vec!["image", "segment", "leaf"]);
    }

    #[test]
    fn test_bucket_tie_breaks_by_values_then_name() {
        let mut builder = Builder::new();
        builder.add(Block::new("b", 0x10, 0x8));
        let mut with_value = Block::new("z", 0x10, 0x8);
        with_value.push_value(Value::new("v", 0, 8, "0x0"));
        builder.add(with_value);
        builder.add(Block::new("a", 0x10, 0x8));

        let order: Vec<_> = builder.pending[&0x10].iter().map(|b| b.name.as_str()).collect();
        assert_eq!(order, vec!["z", "a", "b"]);
    }

    #[test]
    fn test_rebalance_out_of_order_stream() {
        let mut builder = Builder::new();
        builder.add(Block::new("Load Commands", 0x1020, 0x100));
        builder.add(Block::new("__text", 0x1200, 0x200));
        builder.add(Block::new("Mach-O Header", 0x1000, 0x20));
        builder.add(Block::new("__TEXT", 0x1000, 0x1000));
        builder.add(Block::new("__DATA", 0x2000, 0x1000));
        builder.add(Block::new("LC_SEGMENT_64", 0x1020, 0x48));
        assert_eq!(builder.len(), 6);

        let mut root = Block::container("root", 0);
        builder.rebalance(&mut root);

        assert_eq!(names(&root), vec!["__TEXT", "__DATA"]);
        let text = &root.children[0];
        assert_eq!(names(text), vec!["Mach-O Header", "Load Commands", "__text"]);
        assert_eq!(names(&text.children[1]), vec!["LC_SEGMENT_64"]);
        check(&root).unwrap();
    }

    #[test]
    fn test_hoist_moves_spilling_grandchild() {
        let mut root = Block::container("root", 0);
        let mut group = Block::container("group", 0x100);
        group.children.push(Block::new("inside", 0x100, 0x10));
        group.children.push(Block::new("spill", 0x200, 0x80));
        root.children.push(group);
        root.children.push(Block::new("big", 0x180, 0x100));
        root.children.push(Block::new("next", 0x280, 0x10));
        root.fix_offsets();

        hoist(&mut root);
        root.fix_offsets();

        assert_eq!(names(&root.children[0]), vec!["inside"]);
        let big = root.child("big").unwrap();
        assert!(big.child("spill").is_some());
        check(&root).unwrap();
    }
}
