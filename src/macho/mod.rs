//! Mach-O file format handling.
//!
//! This module provides the load-command catalogue used to lay out images
//! embedded in a shared cache, and a source for standalone Mach-O files.

mod constants;
mod file;
mod structs;

pub use constants::*;
pub use file::*;
pub use structs::*;
