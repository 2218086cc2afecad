//! The block tree: the product of a decode.
//!
//! A decoded cache is one tree of [`Block`]s. Each block covers an address
//! range and owns its children and its [`Value`]s; values carry outgoing
//! [`Link`]s, which are weak, address-only references resolved by lookup.
//!
//! # Unsized blocks
//!
//! A block with `size == 0` is a pure grouping node. It has no range of its
//! own, so it never becomes a parent through containment and it never
//! overlaps a sibling. When a size is needed (tie-breaking, hoisting) it is
//! recomputed as [`Block::footprint`].
//!
//! # Serialized form
//!
//! Blocks serialize to JSON structurally. [`from_json`] runs the checker so a
//! replayed tree is as trustworthy as a freshly decoded one.

mod builder;
mod check;

pub use builder::*;
pub use check::*;

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Link label for an offset or address field.
pub const POINTS_TO: &str = "points to";
/// Link label for a byte-size field.
pub const GIVES_SIZE: &str = "gives size";
/// Link label for an element-count field.
pub const GIVES_AMOUNT: &str = "gives amount";

// =============================================================================
// Link
// =============================================================================

/// A directed reference from a value to the block at `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Relationship, e.g. "points to" or "gives size"
    pub label: String,
    /// Address of the referenced block
    pub target: u64,
}

// =============================================================================
// Value
// =============================================================================

/// A named field inside a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    /// Field name
    pub name: String,
    /// Byte offset from the start of the owning block
    pub offset: u64,
    /// Width in bytes
    pub size: u64,
    /// Formatted field contents
    pub text: String,
    /// Outgoing links
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
}

impl Value {
    /// Creates a value without links.
    pub fn new(name: impl Into<String>, offset: u64, size: u64, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            offset,
            size,
            text: text.into(),
            links: Vec::new(),
        }
    }

    /// Adds a link to the block at `target`.
    pub fn add_link(&mut self, label: impl Into<String>, target: u64) {
        self.links.push(Link {
            label: label.into(),
            target,
        });
    }

    /// Offset one past the last byte of this value.
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

// =============================================================================
// Block
// =============================================================================

/// A named, address-ranged node of the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Display name
    pub name: String,
    /// Absolute address after sliding
    pub address: u64,
    /// Size in bytes, 0 for an unsized container
    pub size: u64,
    /// Offset from the parent's address
    pub offset: u64,
    /// Children, ascending by address
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Block>,
    /// Values, ascending by offset
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,
}

/// Counts of the entities in a tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Number of blocks, including the root
    pub blocks: usize,
    /// Number of values
    pub values: usize,
    /// Number of links
    pub links: usize,
    /// Deepest nesting level (root = 0)
    pub depth: usize,
}

impl Block {
    /// Creates a sized block.
    pub fn new(name: impl Into<String>, address: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            address,
            size,
            offset: 0,
            children: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Creates an unsized grouping block.
    pub fn container(name: impl Into<String>, address: u64) -> Self {
        Self::new(name, address, 0)
    }

    /// Returns true if this is an unsized grouping block.
    #[inline]
    pub fn is_container(&self) -> bool {
        self.size == 0
    }

    /// The number of bytes this block stands for.
    ///
    /// Sized blocks report their size; containers report the sum of their
    /// children's footprints.
    pub fn footprint(&self) -> u64 {
        if self.size != 0 {
            self.size
        } else {
            self.children.iter().map(Block::footprint).sum()
        }
    }

    /// Address one past the end of this block's footprint.
    #[inline]
    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.footprint())
    }

    /// Returns true if `other` lies entirely inside this block's range.
    ///
    /// Containers never contain anything by range.
    #[inline]
    pub fn contains(&self, other: &Block) -> bool {
        self.size != 0 && self.address <= other.address && other.end() <= self.end()
    }

    /// Returns true if `address` falls inside this block's range.
    #[inline]
    pub fn covers(&self, address: u64) -> bool {
        address >= self.address && address < self.end()
    }

    /// Appends a value. Values must be pushed in ascending offset order.
    pub fn push_value(&mut self, value: Value) {
        self.values.push(value);
    }

    /// Returns the value with the given name.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|v| v.name == name)
    }

    /// Returns a mutable reference to the value with the given name.
    pub fn value_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.values.iter_mut().find(|v| v.name == name)
    }

    /// Adds a link to the value named `field`.
    ///
    /// Returns false if there is no such value.
    pub fn link(&mut self, field: &str, label: &str, target: u64) -> bool {
        match self.value_mut(field) {
            Some(value) => {
                value.add_link(label, target);
                true
            }
            None => false,
        }
    }

    /// Returns the direct child with the given name.
    pub fn child(&self, name: &str) -> Option<&Block> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Finds the outermost block starting exactly at `address`.
    pub fn resolve(&self, address: u64) -> Option<&Block> {
        for child in &self.children {
            if child.address == address {
                return Some(child);
            }
            if child.is_container() || child.covers(address) {
                if let Some(found) = child.resolve(address) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Visits every block depth-first, parents before children.
    pub fn walk<'a, F>(&'a self, mut visit: F)
    where
        F: FnMut(&'a Block, usize),
    {
        let mut stack = vec![(self, 0usize)];
        while let Some((block, depth)) = stack.pop() {
            visit(block, depth);
            for child in block.children.iter().rev() {
                stack.push((child, depth + 1));
            }
        }
    }

    /// Counts blocks, values and links.
    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats::default();
        self.walk(|block, depth| {
            stats.blocks += 1;
            stats.values += block.values.len();
            stats.links += block.values.iter().map(|v| v.links.len()).sum::<usize>();
            stats.depth = stats.depth.max(depth);
        });
        stats
    }

    /// Recomputes every descendant's parent-relative offset.
    pub fn fix_offsets(&mut self) {
        let address = self.address;
        for child in &mut self.children {
            child.offset = child.address.wrapping_sub(address);
            child.fix_offsets();
        }
    }
}

// =============================================================================
// JSON
// =============================================================================

/// Serializes a tree to pretty-printed JSON.
pub fn to_json(root: &Block) -> Result<String> {
    Ok(serde_json::to_string_pretty(root)?)
}

/// Parses a tree from JSON and validates it.
pub fn from_json(json: &str) -> Result<Block> {
    let root: Block = serde_json::from_str(json)?;
    check(&root)?;
    Ok(root)
}

/// Writes a tree as JSON to `path`.
pub fn save<P: AsRef<Path>>(root: &Block, path: P) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| Error::FileOpen {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, root)?;
    writer.flush()?;
    Ok(())
}

/// Reads and validates a JSON tree from `path`.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Block> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| Error::FileOpen {
        path: path.to_path_buf(),
        source: e,
    })?;
    let root: Block = serde_json::from_reader(BufReader::new(file))?;
    check(&root)?;
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Block {
        let mut root = Block::container("root", 0);
        let mut header = Block::new("Header", 0x1000, 0x20);
        let mut magic = Value::new("magic", 0, 16, "dyld_v1   arm64e");
        magic.add_link(POINTS_TO, 0x1020);
        header.push_value(magic);
        header.push_value(Value::new("mapping_offset", 16, 4, "0x20"));
        let mut mappings = Block::new("Mappings", 0x1020, 0x40);
        mappings.children.push(Block::new("Mapping 0", 0x1020, 0x20));
        mappings.children.push(Block::new("Mapping 1", 0x1040, 0x20));
        root.children.push(header);
        root.children.push(mappings);
        root.fix_offsets();
        root
    }

    #[test]
    fn test_footprint_of_container_sums_children() {
        let root = sample();
        assert_eq!(root.footprint(), 0x60);
        assert!(root.is_container());
        assert_eq!(root.children[1].footprint(), 0x40);
    }

    #[test]
    fn test_contains() {
        let outer = Block::new("outer", 0x100, 0x100);
        assert!(outer.contains(&Block::new("a", 0x100, 0x100)));
        assert!(outer.contains(&Block::new("b", 0x180, 0x10)));
        assert!(!outer.contains(&Block::new("c", 0x1f0, 0x20)));
        assert!(!Block::container("c", 0x100).contains(&Block::new("d", 0x100, 1)));
    }

    #[test]
    fn test_resolve_returns_outermost_match() {
        let root = sample();
        assert_eq!(root.resolve(0x1020).map(|b| b.name.as_str()), Some("Mappings"));
        assert_eq!(root.resolve(0x1040).map(|b| b.name.as_str()), Some("Mapping 1"));
        assert!(root.resolve(0x1050).is_none());
    }

    #[test]
    fn test_stats() {
        let stats = sample().stats();
        assert_eq!(stats.blocks, 5);
        assert_eq!(stats.values, 2);
        assert_eq!(stats.links, 1);
        assert_eq!(stats.depth, 2);
    }

    #[test]
    fn test_json_round_trip() {
        let root = sample();
        let json = to_json(&root).unwrap();
        let back = from_json(&json).unwrap();
        assert_eq!(back, root);
    }

    #[test]
    fn test_from_json_rejects_invalid_tree() {
        let mut root = sample();
        root.children[1].children[1].address = 0x1030;
        let json = serde_json::to_string(&root).unwrap();
        assert!(matches!(from_json(&json), Err(Error::Invariant(_))));
    }
}
