//! Synthetic caches and Mach-O files, built byte by byte.

#![allow(dead_code)]

use std::fs;
use std::mem::offset_of;
use std::path::{Path, PathBuf};

use dscmap::dyld::DyldCacheHeader;
use dscmap::macho::*;

/// Unslid address of every fixture cache's first mapping.
pub const BASE: u64 = 0x1_8000_0000;

pub const MAGIC: &[u8; 16] = b"dyld_v1   arm64e";

pub fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

pub fn put(data: &mut [u8], offset: usize, bytes: &[u8]) {
    data[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// A cache image under construction.
pub struct Cache {
    pub data: Vec<u8>,
    mapping_offset: usize,
    mappings: usize,
}

impl Cache {
    /// A zeroed image of `size` bytes with the magic and mapping offset set.
    pub fn new(size: usize, mapping_offset: u32) -> Self {
        let mut data = vec![0u8; size];
        put(&mut data, 0, MAGIC);
        put_u32(&mut data, offset_of!(DyldCacheHeader, mapping_offset), mapping_offset);
        Self {
            data,
            mapping_offset: mapping_offset as usize,
            mappings: 0,
        }
    }

    /// Newest header layout with one mapping covering the whole image.
    pub fn v3(size: usize) -> Self {
        let mut cache = Self::new(size, 512);
        cache.mapping(BASE, size as u64, 0);
        cache
    }

    /// Appends an entry to the plain mapping array.
    pub fn mapping(&mut self, address: u64, size: u64, file_offset: u64) -> &mut Self {
        let at = self.mapping_offset + self.mappings * 32;
        put_u64(&mut self.data, at, address);
        put_u64(&mut self.data, at + 8, size);
        put_u64(&mut self.data, at + 16, file_offset);
        put_u32(&mut self.data, at + 24, 5);
        put_u32(&mut self.data, at + 28, 5);
        self.mappings += 1;
        let count = self.mappings as u32;
        self.u32(offset_of!(DyldCacheHeader, mapping_count), count)
    }

    pub fn u32(&mut self, offset: usize, value: u32) -> &mut Self {
        put_u32(&mut self.data, offset, value);
        self
    }

    pub fn u64(&mut self, offset: usize, value: u64) -> &mut Self {
        put_u64(&mut self.data, offset, value);
        self
    }

    pub fn bytes(&mut self, offset: usize, bytes: &[u8]) -> &mut Self {
        put(&mut self.data, offset, bytes);
        self
    }

    pub fn write(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, &self.data).unwrap();
        path
    }
}

/// The smallest cache the decoder accepts: a V3 header and one mapping.
pub fn minimal_cache() -> Cache {
    Cache::v3(0x1000)
}

/// A V3 cache listing one image, with per-mapping slide info and a
/// version 2 patch table whose image table has `patch_images` entries.
///
/// ```text
/// 0x0000 header, mappings @0x200, images @0x220, mappings with slide @0x240
/// 0x0600 image path
/// 0x1000 Mach-O image (__TEXT 0x1000..0x2000)
/// 0x2000 patch info, image table @0x2100, export names @0x2200
/// 0x3000 image link-edit data
/// 0x3800 slide info v2, page starts @0x3828
/// ```
pub fn image_cache(patch_images: u64) -> Cache {
    let mut cache = Cache::v3(0x4000);
    cache
        .u32(offset_of!(DyldCacheHeader, images_offset), 0x220)
        .u32(offset_of!(DyldCacheHeader, images_count), 1)
        .u64(0x220, BASE + 0x1000)
        .u32(0x220 + 24, 0x600)
        .bytes(0x600, b"/usr/lib/libdemo.dylib\0");

    // One mapping with slide info.
    cache
        .u32(offset_of!(DyldCacheHeader, mapping_with_slide_offset), 0x240)
        .u32(offset_of!(DyldCacheHeader, mapping_with_slide_count), 1)
        .u64(0x240, BASE)
        .u64(0x248, 0x4000)
        .u64(0x250, 0)
        .u64(0x258, 0x3800)
        .u64(0x260, 0x30);
    // version, page_size, starts offset, starts count, extras offset, extras count
    for (index, word) in [2u32, 0x4000, 40, 2, 0, 0].into_iter().enumerate() {
        cache.u32(0x3800 + index * 4, word);
    }
    cache.u64(0x3818, 0x00ff_ffff_0000_0000).u32(0x3828, 0x0001_0000);

    let image = MachO::new()
        .segment("__TEXT", BASE + 0x1000, 0x1000, 0x1000, 0x1000, &[("__text", BASE + 0x1800, 0x100, 0x1800)])
        .segment("__LINKEDIT", BASE + 0x3000, 0x1000, 0x3000, 0x1000, &[])
        .symtab(0x3000, 1, 0x3010, 0x10)
        .dylib_id("/usr/lib/libdemo.dylib")
        .build();
    cache.bytes(0x1000, &image);

    cache
        .u64(offset_of!(DyldCacheHeader, patch_info_addr), BASE + 0x2000)
        .u64(offset_of!(DyldCacheHeader, patch_info_size), 104)
        .u32(0x2000, 2)
        .u64(0x2008, BASE + 0x2100)
        .u64(0x2010, patch_images)
        .u64(0x2058, BASE + 0x2200)
        .u64(0x2060, 0x10);
    cache
}

/// A main cache with one sub-cache entry, and the sub-cache itself whose
/// UUID is `sub_uuid`. The entry expects `[0x11; 16]`.
pub fn split_cache(sub_uuid: [u8; 16]) -> (Cache, Cache) {
    let mut main = Cache::v3(0x1000);
    main.u32(offset_of!(DyldCacheHeader, sub_cache_array_offset), 0x220)
        .u32(offset_of!(DyldCacheHeader, sub_cache_array_count), 1)
        .bytes(offset_of!(DyldCacheHeader, uuid), &[0xaa; 16])
        .bytes(0x220, &[0x11; 16])
        .u64(0x230, 0x1000)
        .bytes(0x238, b".01\0");

    let mut sub = Cache::new(0x1000, 512);
    sub.mapping(BASE + 0x1000, 0x1000, 0)
        .bytes(offset_of!(DyldCacheHeader, uuid), &sub_uuid);
    (main, sub)
}

// =============================================================================
// Mach-O
// =============================================================================

/// A 64-bit Mach-O header and load commands under construction.
#[derive(Default)]
pub struct MachO {
    commands: Vec<Vec<u8>>,
}

fn command(cmd: u32, size: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; size];
    put_u32(&mut bytes, 0, cmd);
    put_u32(&mut bytes, 4, size as u32);
    bytes
}

fn name16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

impl MachO {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a segment; sections are `(name, addr, size, file offset)`.
    pub fn segment(
        mut self,
        name: &str,
        vmaddr: u64,
        vmsize: u64,
        fileoff: u64,
        filesize: u64,
        sections: &[(&str, u64, u64, u32)],
    ) -> Self {
        let mut bytes = command(LC_SEGMENT_64, 72 + 80 * sections.len());
        put(&mut bytes, 8, &name16(name));
        put_u64(&mut bytes, 24, vmaddr);
        put_u64(&mut bytes, 32, vmsize);
        put_u64(&mut bytes, 40, fileoff);
        put_u64(&mut bytes, 48, filesize);
        put_u32(&mut bytes, 64, sections.len() as u32);
        for (index, (sectname, addr, size, offset)) in sections.iter().enumerate() {
            let at = 72 + index * 80;
            put(&mut bytes, at, &name16(sectname));
            put(&mut bytes, at + 16, &name16(name));
            put_u64(&mut bytes, at + 32, *addr);
            put_u64(&mut bytes, at + 40, *size);
            put_u32(&mut bytes, at + 48, *offset);
        }
        self.commands.push(bytes);
        self
    }

    pub fn symtab(mut self, symoff: u32, nsyms: u32, stroff: u32, strsize: u32) -> Self {
        let mut bytes = command(LC_SYMTAB, 24);
        put_u32(&mut bytes, 8, symoff);
        put_u32(&mut bytes, 12, nsyms);
        put_u32(&mut bytes, 16, stroff);
        put_u32(&mut bytes, 20, strsize);
        self.commands.push(bytes);
        self
    }

    pub fn dylib_id(mut self, path: &str) -> Self {
        let size = (24 + path.len() + 1 + 7) & !7;
        let mut bytes = command(LC_ID_DYLIB, size);
        put_u32(&mut bytes, 8, 24);
        put(&mut bytes, 24, path.as_bytes());
        self.commands.push(bytes);
        self
    }

    pub fn linkedit_data(mut self, cmd: u32, dataoff: u32, datasize: u32) -> Self {
        let mut bytes = command(cmd, 16);
        put_u32(&mut bytes, 8, dataoff);
        put_u32(&mut bytes, 12, datasize);
        self.commands.push(bytes);
        self
    }

    /// A command with no fields beyond `cmd` and `cmdsize`.
    pub fn raw(mut self, cmd: u32, size: usize) -> Self {
        self.commands.push(command(cmd, size));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let sizeofcmds: usize = self.commands.iter().map(Vec::len).sum();
        let mut out = vec![0u8; 32];
        put_u32(&mut out, 0, MH_MAGIC_64);
        put_u32(&mut out, 4, CPU_TYPE_ARM64);
        put_u32(&mut out, 8, CPU_SUBTYPE_ARM64E);
        put_u32(&mut out, 12, 6);
        put_u32(&mut out, 16, self.commands.len() as u32);
        put_u32(&mut out, 20, sizeofcmds as u32);
        for command in &self.commands {
            out.extend_from_slice(command);
        }
        out
    }
}

/// A standalone dylib: `__TEXT` over the first 0x2000 bytes, link-edit data
/// at 0x2000 (symbols, strings, function starts).
pub fn standalone_dylib() -> Vec<u8> {
    let mut file = MachO::new()
        .segment("__TEXT", 0, 0x2000, 0, 0x2000, &[("__text", 0x1000, 0x100, 0x1000)])
        .segment("__LINKEDIT", 0x2000, 0x1000, 0x2000, 0x1000, &[])
        .symtab(0x2000, 2, 0x2020, 0x20)
        .dylib_id("/usr/lib/libdemo.dylib")
        .raw(LC_UUID, 24)
        .linkedit_data(LC_FUNCTION_STARTS, 0x2040, 0x10)
        .build();
    file.resize(0x3000, 0);
    file
}
