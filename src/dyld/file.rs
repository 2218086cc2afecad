//! File-backed cache source.
//!
//! Opens a cache file with `mmap`, validates the header and then opens every
//! sub-cache the header lists, plus the `.symbols` companion when the header
//! names one.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{debug, info};

use super::structs::*;
use crate::error::{Error, Result};
use crate::source::{Fetcher, Reader, Source};
use crate::util::uuid_to_string;

/// A dyld shared cache read from disk.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    name: String,
    mmap: Option<Mmap>,
    header: CacheHeader,
    mappings: Vec<DyldCacheMappingInfo>,
    subcaches: Vec<FileSource>,
    symbols: Option<Box<FileSource>>,
}

impl FileSource {
    /// Opens a cache file together with its sub-caches and symbols file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut source = Self::open_single(path)?;
        info!(
            path = %path.display(),
            arch = %source.header.architecture(),
            version = ?source.header.version,
            mappings = source.mappings.len(),
            "opened cache"
        );
        source.load_subcaches()?;
        source.load_symbols_file()?;
        Ok(source)
    }

    /// Maps one file and parses its header and mappings.
    fn open_single(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::FileOpen {
            path: path.to_path_buf(),
            source: e,
        })?;

        // SAFETY: the mapping is read-only; concurrent modification of the
        // file by another process is outside what we guard against.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.to_path_buf(),
            source: e,
        })?;

        let header = CacheHeader::parse(&mmap)?;
        let mappings = parse_mappings(&mmap, &header)?;

        Ok(Self {
            path: path.to_path_buf(),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            mmap: Some(mmap),
            header,
            mappings,
            subcaches: Vec::new(),
            symbols: None,
        })
    }

    /// Path this source was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn data(&self) -> Result<&[u8]> {
        self.mmap.as_deref().ok_or(Error::SourceClosed)
    }

    fn sibling_path(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Opens sub-cache files.
    ///
    /// Older entries imply the suffix `.N` from their position; newer ones
    /// spell it out.
    fn load_subcaches(&mut self) -> Result<()> {
        if !self.header.has_subcaches() {
            return Ok(());
        }

        let count = self.header.fields.sub_cache_array_count as usize;
        let with_suffix = self.header.subcache_entries_have_suffix();
        let mut reader = self.reader_at_file_offset(self.header.fields.sub_cache_array_offset as u64)?;

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let (uuid, suffix) = if with_suffix {
                let entry: DyldSubcacheEntry2 = reader.read()?;
                (entry.uuid, entry.suffix())
            } else {
                let entry: DyldSubcacheEntry = reader.read()?;
                (entry.uuid, format!(".{}", i + 1))
            };
            entries.push((uuid, suffix));
        }

        for (uuid, suffix) in entries {
            let path = self.sibling_path(&suffix);
            let subcache = Self::open_checked(&path, &uuid)?;
            debug!(path = %path.display(), "opened sub-cache");
            self.subcaches.push(subcache);
        }
        Ok(())
    }

    /// Opens the `.symbols` file when the header names one. A missing file
    /// is fine; a file with the wrong UUID is not.
    fn load_symbols_file(&mut self) -> Result<()> {
        if !self.header.has_symbol_file() {
            return Ok(());
        }
        let path = self.sibling_path(".symbols");
        if !path.exists() {
            debug!(path = %path.display(), "symbols file not present");
            return Ok(());
        }
        let symbols = Self::open_checked(&path, &self.header.fields.symbol_file_uuid)?;
        self.symbols = Some(Box::new(symbols));
        Ok(())
    }

    fn open_checked(path: &Path, expected: &[u8; 16]) -> Result<Self> {
        let source = Self::open_single(path).map_err(|e| match e {
            Error::FileOpen { .. } => Error::SubcacheNotFound {
                path: path.to_path_buf(),
            },
            other => other,
        })?;
        if &source.header.fields.uuid != expected {
            return Err(Error::SubcacheUuidMismatch {
                path: path.to_path_buf(),
                expected: uuid_to_string(expected),
                actual: uuid_to_string(&source.header.fields.uuid),
            });
        }
        Ok(source)
    }

    /// File offset of `address` if one of this file's own mappings holds it.
    fn locate(&self, address: u64) -> Option<u64> {
        let unslid = address.wrapping_sub(self.slide());
        self.mappings
            .iter()
            .find(|m| m.contains_address(unslid))
            .and_then(|m| m.file_offset.checked_add(unslid - m.address))
    }
}

/// Reads the plain mapping array that follows the header.
pub(crate) fn parse_mappings(data: &[u8], header: &CacheHeader) -> Result<Vec<DyldCacheMappingInfo>> {
    let mut reader = Reader::new(data, 0).at(header.fields.mapping_offset as u64)?;
    (0..header.fields.mapping_count)
        .map(|_| reader.read::<DyldCacheMappingInfo>())
        .collect()
}

impl Source for FileSource {
    fn reader_at_file_offset(&self, offset: u64) -> Result<Reader<'_>> {
        Reader::new(self.data()?, 0).at(offset)
    }

    fn reader_at_address(&self, address: u64) -> Result<Reader<'_>> {
        if let Some(offset) = self.locate(address) {
            return self.reader_at_file_offset(offset);
        }
        for subcache in &self.subcaches {
            if subcache.locate(address).is_some() {
                return subcache.reader_at_address(address);
            }
        }
        Err(Error::address_not_found(address))
    }

    fn close(&mut self) {
        if self.mmap.take().is_some() {
            debug!(path = %self.path.display(), "closed cache file");
        }
        for subcache in &mut self.subcaches {
            subcache.close();
        }
        if let Some(symbols) = &mut self.symbols {
            symbols.close();
        }
    }
}

impl Fetcher for FileSource {
    fn header(&self) -> &CacheHeader {
        &self.header
    }

    fn mappings(&self) -> &[DyldCacheMappingInfo] {
        &self.mappings
    }

    fn sub_caches(&self) -> Vec<&dyn Fetcher> {
        self.subcaches.iter().map(|s| s as &dyn Fetcher).collect()
    }

    fn symbols_cache(&self) -> Option<&dyn Fetcher> {
        self.symbols.as_deref().map(|s| s as &dyn Fetcher)
    }

    fn base_address(&self) -> u64 {
        0
    }

    fn slide(&self) -> u64 {
        0
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn resident(&self, offset: u64, size: u64) -> bool {
        match &self.mmap {
            Some(mmap) => offset.checked_add(size).is_some_and(|end| end <= mmap.len() as u64),
            None => false,
        }
    }
}
