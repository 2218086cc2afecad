//! dscmap - maps the layout of dyld shared caches and Mach-O images.
//!
//! This library decodes a dyld shared cache (from disk, from a capture of a
//! shared region, or from the running process) into a tree of address-ranged
//! [`Block`]s. Every header, table and region the format defines becomes a
//! block at its slid address; every field becomes a named value; and every
//! field that locates or sizes another structure carries a link to it.
//!
//! # Features
//!
//! - Header layouts from the oldest accelerator-table caches to split caches
//! - Sub-caches and the `.symbols` companion file
//! - Slide info v1 to v5, patch tables (legacy, v2, v3)
//! - Mach-O layout of every cached image, or of a standalone file
//! - A checker validating the finished tree, and a JSON round trip
//!
//! # Example
//!
//! ```no_run
//! use dscmap::{decode_cache, DecodeOptions, FileSource};
//!
//! fn main() -> dscmap::Result<()> {
//!     let cache = FileSource::open("/System/Library/dyld/dyld_shared_cache_arm64e")?;
//!     let tree = decode_cache(&cache, &DecodeOptions::default())?;
//!
//!     let stats = tree.stats();
//!     println!("{} blocks, {} links", stats.blocks, stats.links);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod decode;
pub mod dyld;
pub mod error;
pub mod macho;
pub mod record;
pub mod source;
pub mod tree;
pub mod util;

// Re-export main types
pub use decode::{decode_cache, decode_macho, DecodeOptions};
pub use dyld::{FileSource, Finder, MemorySource, TargetOs};
pub use error::{Error, Result};
pub use macho::MachOFile;
pub use source::{Fetcher, Source};
pub use tree::{check, Block, Link, Value, Violation};
