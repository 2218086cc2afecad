//! Whole-tree invariant checker.
//!
//! Runs once over a finished tree and reports the first geometric or
//! ordering inconsistency it finds. A violation means the decoder (or
//! whoever assembled the tree) placed something wrong; it is never caused
//! by malformed input, which is rejected while decoding.

use std::fmt;

use super::Block;

/// Which invariant a [`Violation`] broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// A child extends outside its sized parent.
    Containment,
    /// Children are not ascending by address.
    ChildOrder,
    /// Two sized siblings overlap.
    Overlap,
    /// A child's stored offset disagrees with its address.
    ChildOffset,
    /// Values are not ascending by offset.
    ValueOrder,
    /// A value extends past the end of its block.
    ValueBounds,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Rule::Containment => "child outside parent",
            Rule::ChildOrder => "children out of address order",
            Rule::Overlap => "overlapping siblings",
            Rule::ChildOffset => "wrong parent-relative offset",
            Rule::ValueOrder => "values out of offset order",
            Rule::ValueBounds => "value outside block",
        };
        f.write_str(text)
    }
}

/// One side of a violation: a block or value and the range it claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    /// Block or value name
    pub name: String,
    /// First address covered
    pub start: u64,
    /// One past the last address covered
    pub end: u64,
}

impl Entity {
    fn block(block: &Block) -> Self {
        Self {
            name: block.name.clone(),
            start: block.address,
            end: block.end(),
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' [{:#x}, {:#x})", self.name, self.start, self.end)
    }
}

/// The first invariant violation found in a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// The rule that was broken
    pub rule: Rule,
    /// The enclosing or earlier entity
    pub first: Entity,
    /// The offending entity
    pub second: Entity,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} and {}", self.rule, self.first, self.second)
    }
}

impl std::error::Error for Violation {}

/// Validates every block of the tree rooted at `root`.
pub fn check(root: &Block) -> Result<(), Violation> {
    let mut stack = vec![root];
    while let Some(block) = stack.pop() {
        check_values(block)?;
        check_children(block)?;
        stack.extend(block.children.iter().rev());
    }
    Ok(())
}

fn check_children(parent: &Block) -> Result<(), Violation> {
    let violation = |rule, first: &Block, second: &Block| Violation {
        rule,
        first: Entity::block(first),
        second: Entity::block(second),
    };

    // Highest end among the sized siblings seen so far, and who owns it.
    let mut reach: Option<&Block> = None;
    let mut previous: Option<&Block> = None;

    for child in &parent.children {
        if !parent.is_container() {
            let inside = if child.is_container() {
                parent.covers(child.address)
            } else {
                parent.contains(child)
            };
            if !inside {
                return Err(violation(Rule::Containment, parent, child));
            }
        }

        match child.address.checked_sub(parent.address) {
            Some(offset) if offset == child.offset => {}
            _ => return Err(violation(Rule::ChildOffset, parent, child)),
        }

        if let Some(prev) = previous {
            if child.address < prev.address {
                return Err(violation(Rule::ChildOrder, prev, child));
            }
        }
        previous = Some(child);

        if child.is_container() {
            continue;
        }
        if let Some(widest) = reach {
            if widest.end() > child.address {
                return Err(violation(Rule::Overlap, widest, child));
            }
        }
        if reach.map_or(true, |widest| child.end() > widest.end()) {
            reach = Some(child);
        }
    }
    Ok(())
}

fn check_values(block: &Block) -> Result<(), Violation> {
    let mut previous_offset = 0u64;
    for value in &block.values {
        let entity = Entity {
            name: value.name.clone(),
            start: block.address.saturating_add(value.offset),
            end: block.address.saturating_add(value.end()),
        };
        if value.offset < previous_offset {
            return Err(Violation {
                rule: Rule::ValueOrder,
                first: Entity::block(block),
                second: entity,
            });
        }
        let fits = value
            .offset
            .checked_add(value.size)
            .is_some_and(|end| end <= block.size);
        if !fits {
            return Err(Violation {
                rule: Rule::ValueBounds,
                first: Entity::block(block),
                second: entity,
            });
        }
        previous_offset = value.offset;
    }
    Ok(())
}
