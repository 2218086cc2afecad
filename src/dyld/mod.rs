//! Dyld shared cache handling.
//!
//! This module provides the cache's on-disk structures and the sources that
//! read a cache from a file, from memory, or from wherever the system
//! installed it.
//!
//! # Sub-caches
//!
//! Starting with iOS 15 / macOS 12, caches can be split into multiple files:
//! - Main cache: `dyld_shared_cache_arm64e`
//! - Sub-caches: `dyld_shared_cache_arm64e.1`, `.2`, etc.
//! - Symbols: `dyld_shared_cache_arm64e.symbols`

mod file;
mod finder;
mod memory;
mod structs;

pub use file::*;
pub use finder::*;
pub use memory::*;
pub use structs::*;
