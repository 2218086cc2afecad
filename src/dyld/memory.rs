//! Memory-backed cache source.
//!
//! Reads a cache laid out the way dyld maps it: by virtual address rather
//! than by file offset. The bytes are either a capture of a shared region
//! or, on macOS, the shared region of the running process.
//!
//! Sub-caches are views into the same [`Bytes`] starting at the sub-cache's
//! VM offset, so no data is copied.

use bytes::Bytes;
use tracing::{debug, info};

use super::file::parse_mappings;
use super::structs::*;
use crate::error::{Error, Result};
use crate::source::{Fetcher, Reader, Source};

/// A cache image held in memory.
#[derive(Debug)]
pub struct MemorySource {
    name: String,
    data: Option<Bytes>,
    /// Slid address of `data[0]`
    base_address: u64,
    header: CacheHeader,
    mappings: Vec<DyldCacheMappingInfo>,
    subcaches: Vec<MemorySource>,
}

impl MemorySource {
    /// Wraps a captured shared region whose first byte lived at
    /// `base_address`.
    pub fn from_bytes(data: Bytes, base_address: u64) -> Result<Self> {
        let mut source = Self::view("shared region", data, base_address)?;
        source.load_subcaches()?;
        info!(
            base = format_args!("{:#x}", base_address),
            slide = format_args!("{:#x}", source.slide()),
            subcaches = source.subcaches.len(),
            "opened in-memory cache"
        );
        Ok(source)
    }

    /// Wraps `len` bytes of live memory at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr..ptr + len` must be readable for the rest of the process's life,
    /// as the system shared region is.
    pub unsafe fn from_raw_parts(ptr: *const u8, len: usize) -> Result<Self> {
        // SAFETY: upheld by the caller.
        let slice: &'static [u8] = unsafe { std::slice::from_raw_parts(ptr, len) };
        Self::from_bytes(Bytes::from_static(slice), ptr as u64)
    }

    /// Opens the shared region of the current process.
    #[cfg(target_os = "macos")]
    pub fn current_process() -> Result<Self> {
        extern "C" {
            fn _dyld_get_shared_cache_range(length: *mut usize) -> *const std::ffi::c_void;
        }
        let mut len = 0usize;
        // SAFETY: dyld fills in `len` and returns the mapped range, or null.
        let ptr = unsafe { _dyld_get_shared_cache_range(&mut len) };
        if ptr.is_null() || len == 0 {
            return Err(Error::SharedRegionUnavailable);
        }
        // SAFETY: the shared region stays mapped for the life of the process.
        unsafe { Self::from_raw_parts(ptr.cast(), len) }
    }

    /// Opens the shared region of the current process.
    #[cfg(not(target_os = "macos"))]
    pub fn current_process() -> Result<Self> {
        Err(Error::UnsupportedOs(std::env::consts::OS.to_string()))
    }

    fn view(name: &str, data: Bytes, base_address: u64) -> Result<Self> {
        let header = CacheHeader::parse(&data)?;
        let mappings = parse_mappings(&data, &header)?;
        Ok(Self {
            name: name.to_string(),
            data: Some(data),
            base_address,
            header,
            mappings,
            subcaches: Vec::new(),
        })
    }

    fn bytes(&self) -> Result<&Bytes> {
        self.data.as_ref().ok_or(Error::SourceClosed)
    }

    /// Sub-caches are found at `base + cache_vm_offset` in the same region.
    fn load_subcaches(&mut self) -> Result<()> {
        if !self.header.has_subcaches() {
            return Ok(());
        }
        let with_suffix = self.header.subcache_entries_have_suffix();
        let mut reader = self.reader_at_file_offset(self.header.fields.sub_cache_array_offset as u64)?;
        let mut offsets = Vec::new();
        for _ in 0..self.header.fields.sub_cache_array_count {
            let vm_offset = if with_suffix {
                reader.read::<DyldSubcacheEntry2>()?.cache_vm_offset
            } else {
                reader.read::<DyldSubcacheEntry>()?.cache_vm_offset
            };
            offsets.push(vm_offset);
        }

        let data = self.bytes()?.clone();
        for (i, vm_offset) in offsets.into_iter().enumerate() {
            if vm_offset >= data.len() as u64 {
                return Err(Error::OffsetOutOfBounds {
                    offset: vm_offset,
                    size: data.len() as u64,
                });
            }
            let view = data.slice(vm_offset as usize..);
            let name = format!("shared region.{}", i + 1);
            let subcache = Self::view(&name, view, self.base_address.wrapping_add(vm_offset))?;
            debug!(name = %name, vm_offset = format_args!("{:#x}", vm_offset), "found sub-cache");
            self.subcaches.push(subcache);
        }
        Ok(())
    }

    /// Offset into `data` of a slid address, if it lies in this view.
    fn memory_offset(&self, address: u64) -> Option<u64> {
        let len = self.data.as_ref()?.len() as u64;
        address
            .checked_sub(self.base_address)
            .filter(|&offset| offset < len)
    }
}

impl Source for MemorySource {
    /// File offsets are translated through the mappings, since memory is
    /// laid out by address.
    fn reader_at_file_offset(&self, offset: u64) -> Result<Reader<'_>> {
        let data = self.bytes()?;
        let mapping = self
            .mappings
            .iter()
            .find(|m| m.contains_file_offset(offset))
            .ok_or(Error::OffsetOutOfBounds {
                offset,
                size: data.len() as u64,
            })?;
        // Mappings below the first one have no place in the region.
        let first = self.mappings.first().map_or(0, |m| m.address);
        let position = mapping
            .address
            .checked_sub(first)
            .and_then(|delta| delta.checked_add(offset - mapping.file_offset))
            .ok_or(Error::OffsetOutOfBounds {
                offset,
                size: data.len() as u64,
            })?;
        Reader::new(data, self.base_address).at(position)
    }

    fn reader_at_address(&self, address: u64) -> Result<Reader<'_>> {
        let offset = self
            .memory_offset(address)
            .ok_or(Error::address_not_found(address))?;
        Reader::new(self.bytes()?, self.base_address).at(offset)
    }

    fn close(&mut self) {
        self.data = None;
        for subcache in &mut self.subcaches {
            subcache.close();
        }
    }
}

impl Fetcher for MemorySource {
    fn header(&self) -> &CacheHeader {
        &self.header
    }

    fn mappings(&self) -> &[DyldCacheMappingInfo] {
        &self.mappings
    }

    fn sub_caches(&self) -> Vec<&dyn Fetcher> {
        self.subcaches.iter().map(|s| s as &dyn Fetcher).collect()
    }

    fn base_address(&self) -> u64 {
        self.base_address
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn resident(&self, offset: u64, size: u64) -> bool {
        self.data.is_some()
            && self
                .mappings
                .iter()
                .any(|m| m.contains_file_range(offset, size))
    }
}
