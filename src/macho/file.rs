//! Standalone Mach-O files.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{debug, info};

use super::constants::*;
use super::structs::*;
use crate::error::{Error, Result};
use crate::source::{Reader, Source};

/// A segment's placement in memory and in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRange {
    /// Segment name, e.g. `__TEXT`
    pub name: String,
    /// Address in memory
    pub vmaddr: u64,
    /// Size in memory
    pub vmsize: u64,
    /// Offset in the file
    pub fileoff: u64,
    /// Size in the file
    pub filesize: u64,
}

impl SegmentRange {
    pub(crate) fn from_command(segment: &SegmentCommand64) -> Self {
        Self {
            name: segment.name(),
            vmaddr: segment.vmaddr,
            vmsize: segment.vmsize,
            fileoff: segment.fileoff,
            filesize: segment.filesize,
        }
    }

    /// Returns true if `offset` lies in the file bytes of this segment.
    pub fn contains_file_offset(&self, offset: u64) -> bool {
        offset >= self.fileoff && offset - self.fileoff < self.filesize
    }

    /// Returns true if the file-backed part of this segment holds `address`.
    pub fn contains_address(&self, address: u64) -> bool {
        address >= self.vmaddr && address - self.vmaddr < self.filesize.min(self.vmsize)
    }
}

/// A 64-bit Mach-O file on disk.
#[derive(Debug)]
pub struct MachOFile {
    path: PathBuf,
    mmap: Option<Mmap>,
    header: MachHeader64,
    segments: Vec<SegmentRange>,
}

impl MachOFile {
    /// Maps a Mach-O file and indexes its segments.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::FileOpen {
            path: path.to_path_buf(),
            source: e,
        })?;
        // SAFETY: read-only mapping of a file we do not modify.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.to_path_buf(),
            source: e,
        })?;

        let header: MachHeader64 = Reader::new(&mmap, 0).read()?;
        if !header.is_valid() {
            return Err(Error::InvalidMachoMagic(header.magic));
        }
        let segments = scan_segments(&mmap, &header)?;
        info!(
            path = %path.display(),
            arch = header.arch_name(),
            ncmds = header.ncmds,
            segments = segments.len(),
            "opened Mach-O file"
        );

        Ok(Self {
            path: path.to_path_buf(),
            mmap: Some(mmap),
            header,
            segments,
        })
    }

    /// Path this file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Display name: the file name.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// The Mach-O header.
    pub fn header(&self) -> &MachHeader64 {
        &self.header
    }

    /// Segments in load-command order.
    pub fn segments(&self) -> &[SegmentRange] {
        &self.segments
    }

    /// Length of the file in bytes, 0 once closed.
    pub fn len(&self) -> u64 {
        self.mmap.as_ref().map_or(0, |m| m.len() as u64)
    }

    /// Returns true once closed, or for an empty file.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn data(&self) -> Result<&[u8]> {
        self.mmap.as_deref().ok_or(Error::SourceClosed)
    }
}

/// Collects the 64-bit segments of a Mach-O image whose header is at the
/// start of `data`.
pub(crate) fn scan_segments(data: &[u8], header: &MachHeader64) -> Result<Vec<SegmentRange>> {
    let mut segments = Vec::new();
    let commands = Reader::new(data, 0).at(MachHeader64::SIZE as u64)?;
    let mut offset = 0u64;
    for _ in 0..header.ncmds {
        let mut reader = commands.at(offset)?;
        let command: LoadCommand = reader.clone().read()?;
        if (command.cmdsize as usize) < LoadCommand::SIZE {
            return Err(Error::LoadCommandOverflow {
                offset: MachHeader64::SIZE as u64 + offset,
            });
        }
        if command.cmd == LC_SEGMENT_64 {
            let segment: SegmentCommand64 = reader.read()?;
            debug!(segment = %segment.name(), vmaddr = format_args!("{:#x}", segment.vmaddr), "found segment");
            segments.push(SegmentRange::from_command(&segment));
        }
        offset += command.cmdsize as u64;
    }
    Ok(segments)
}

impl Source for MachOFile {
    fn reader_at_file_offset(&self, offset: u64) -> Result<Reader<'_>> {
        Reader::new(self.data()?, 0).at(offset)
    }

    fn reader_at_address(&self, address: u64) -> Result<Reader<'_>> {
        let segment = self
            .segments
            .iter()
            .find(|s| s.contains_address(address))
            .ok_or(Error::address_not_found(address))?;
        self.reader_at_file_offset(segment.fileoff + (address - segment.vmaddr))
    }

    fn close(&mut self) {
        if self.mmap.take().is_some() {
            debug!(path = %self.path.display(), "closed Mach-O file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_ranges() {
        let segment = SegmentRange {
            name: "__DATA".into(),
            vmaddr: 0x1_0000_4000,
            vmsize: 0x8000,
            fileoff: 0x4000,
            filesize: 0x4000,
        };
        assert!(segment.contains_file_offset(0x4000));
        assert!(!segment.contains_file_offset(0x8000));
        assert!(segment.contains_address(0x1_0000_7fff));
        // Zero-filled tail is not file-backed.
        assert!(!segment.contains_address(0x1_0000_8000));
    }
}
