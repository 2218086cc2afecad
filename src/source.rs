//! Byte sources the decoder reads from.
//!
//! A [`Source`] hands out [`Reader`]s either by file offset or by (slid)
//! absolute address. A [`Fetcher`] is a source that holds a whole cache:
//! it also knows the parsed header, the mappings and the sub-caches.
//!
//! Readers borrow from the source; nothing is copied until a record is
//! read out of them.

use zerocopy::FromBytes;

use crate::dyld::{CacheHeader, DyldCacheMappingInfo};
use crate::error::{Error, Result};
use crate::util::{memchr_null, read_u16_le, read_u32_le, read_u64_le};

/// Random access to the bytes of one image.
pub trait Source {
    /// Returns a reader positioned at `offset` in file coordinates.
    fn reader_at_file_offset(&self, offset: u64) -> Result<Reader<'_>>;

    /// Returns a reader positioned at the slid absolute `address`.
    fn reader_at_address(&self, address: u64) -> Result<Reader<'_>>;

    /// Releases the underlying data. Idempotent; later reads fail with
    /// [`Error::SourceClosed`].
    fn close(&mut self);
}

/// A source holding a complete cache image.
pub trait Fetcher: Source {
    /// The decoded cache header.
    fn header(&self) -> &CacheHeader;

    /// The cache's mappings, in header order.
    fn mappings(&self) -> &[DyldCacheMappingInfo];

    /// Sub-caches in header order, excluding the symbols file.
    fn sub_caches(&self) -> Vec<&dyn Fetcher>;

    /// The companion symbols file, if one was opened.
    fn symbols_cache(&self) -> Option<&dyn Fetcher> {
        None
    }

    /// Address the cache's first byte occupies in the inspected process.
    ///
    /// Files are not loaded anywhere, so file sources return 0.
    fn base_address(&self) -> u64;

    /// Difference between where the cache is and where it was built to be.
    ///
    /// Sources with no load address must override this to return 0.
    fn slide(&self) -> u64 {
        match self.mappings().first() {
            Some(first) => self.base_address().wrapping_sub(first.address),
            None => 0,
        }
    }

    /// Short display name, e.g. the file name.
    fn name(&self) -> &str;

    /// Returns true if `size` bytes at file `offset` can be read.
    fn resident(&self, offset: u64, size: u64) -> bool;

    /// The slid address that the byte at file `offset` occupies.
    ///
    /// Offsets inside a mapping follow that mapping. Trailing data past the
    /// last mapping (local symbols, code signature) continues linearly after
    /// it. Anything else counts from the slid first mapping.
    fn address_of_file_offset(&self, offset: u64) -> u64 {
        let slide = self.slide();
        let mappings = self.mappings();
        if let Some(m) = mappings.iter().find(|m| m.contains_file_offset(offset)) {
            return m.address.wrapping_add(offset - m.file_offset).wrapping_add(slide);
        }
        if let Some(last) = mappings.iter().max_by_key(|m| m.file_offset.saturating_add(m.size)) {
            if offset >= last.file_offset.saturating_add(last.size) {
                return last.address.wrapping_add(offset - last.file_offset).wrapping_add(slide);
            }
        }
        mappings
            .first()
            .map_or(self.base_address(), |m| m.address.wrapping_add(slide))
            .wrapping_add(offset)
    }
}

// =============================================================================
// Reader
// =============================================================================

/// A bounds-checked cursor over borrowed bytes.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    /// File offset or address of `data[0]`, for diagnostics
    origin: u64,
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader over `data`, whose first byte lives at `origin`.
    pub fn new(data: &'a [u8], origin: u64) -> Self {
        Self { data, origin, pos: 0 }
    }

    /// Location of the cursor in the source's coordinates.
    #[inline]
    pub fn position(&self) -> u64 {
        self.origin + self.pos as u64
    }

    /// Bytes left after the cursor.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Returns a new reader `offset` bytes past the cursor.
    pub fn at(&self, offset: u64) -> Result<Reader<'a>> {
        let start = (self.pos as u64)
            .checked_add(offset)
            .filter(|&s| s <= self.data.len() as u64)
            .ok_or(Error::OffsetOutOfBounds {
                offset: self.position().wrapping_add(offset),
                size: self.origin + self.data.len() as u64,
            })?;
        Ok(Reader::new(&self.data[start as usize..], self.origin + start))
    }

    /// Takes the next `count` bytes.
    pub fn bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        if count > self.remaining() {
            return Err(Error::buffer_too_small(count, self.remaining()));
        }
        let out = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(out)
    }

    /// Reads a fixed-layout record.
    pub fn read<T: FromBytes>(&mut self) -> Result<T> {
        let size = std::mem::size_of::<T>();
        let bytes = self.bytes(size)?;
        T::read_from_bytes(bytes).map_err(|_| Error::buffer_too_small(size, bytes.len()))
    }

    /// Reads a little-endian `u16`.
    pub fn u16(&mut self) -> Result<u16> {
        self.bytes(2).map(read_u16_le)
    }

    /// Reads a little-endian `u32`.
    pub fn u32(&mut self) -> Result<u32> {
        self.bytes(4).map(read_u32_le)
    }

    /// Reads a little-endian `u64`.
    pub fn u64(&mut self) -> Result<u64> {
        self.bytes(8).map(read_u64_le)
    }

    /// Reads a NUL-terminated string, consuming the terminator.
    pub fn cstr(&mut self) -> Result<String> {
        let rest = &self.data[self.pos..];
        let end = memchr_null(rest);
        self.pos += (end + 1).min(rest.len());
        Ok(String::from_utf8_lossy(&rest[..end]).into_owned())
    }
}
