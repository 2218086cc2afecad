//! Error types for cache and Mach-O layout decoding.
//!
//! Errors fall into three groups: source errors (opening and validating a
//! cache), decode errors (a structure the decoder cannot lay out), and
//! invariant violations reported by the tree checker.

use std::path::PathBuf;

use thiserror::Error;

use crate::tree::Violation;

/// The main error type for layout decoding.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("source has been closed")]
    SourceClosed,

    // ==================== Source Errors ====================
    #[error("invalid dyld cache magic: expected 'dyld_v1', got {0:?}")]
    InvalidMagic(String),

    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("unsupported operating system: {0}")]
    UnsupportedOs(String),

    #[error("no dyld shared cache found for architecture '{arch}' ({tried} candidates tried)")]
    NoCacheFound { arch: String, tried: usize },

    #[error("subcache file not found: {path}")]
    SubcacheNotFound { path: PathBuf },

    #[error("subcache UUID mismatch for '{path}': expected {expected}, got {actual}")]
    SubcacheUuidMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("shared region is not available in this process")]
    SharedRegionUnavailable,

    // ==================== Read Errors ====================
    #[error("address {addr:#x} not found in any cache mapping")]
    AddressNotFound { addr: u64 },

    #[error("file offset {offset:#x} out of bounds (size: {size:#x})")]
    OffsetOutOfBounds { offset: u64, size: u64 },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    // ==================== Decode Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("load command at offset {offset:#x} extends beyond the command area")]
    LoadCommandOverflow { offset: u64 },

    #[error("unknown required load command {cmd:#x} at offset {offset:#x}")]
    UnknownRequiredLoadCommand { cmd: u32, offset: u64 },

    #[error("unsupported slide info version {version} at {address:#x}")]
    UnsupportedSlideVersion { version: u32, address: u64 },

    #[error("unsupported patch table version {version} at {address:#x}")]
    UnsupportedPatchVersion { version: u32, address: u64 },

    #[error("mismatched table lengths: '{field}' is {actual}, expected {expected}")]
    MismatchedTables {
        field: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: u64, reason: String },

    // ==================== Tree Errors ====================
    #[error("tree invariant violated: {0}")]
    Invariant(#[from] Box<Violation>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized Result type for layout decoding.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: u64, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates an address not found error.
    #[inline]
    pub fn address_not_found(addr: u64) -> Self {
        Error::AddressNotFound { addr }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }
}

impl From<Violation> for Error {
    fn from(violation: Violation) -> Self {
        Error::Invariant(Box::new(violation))
    }
}
