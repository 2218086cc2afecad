//! Whole-cache decoding.
//!
//! Each cache file (main, every sub-cache, the symbols file) is decoded on
//! its own into:
//!
//! - a header area: an unsized block at the cache's base holding the
//!   `Header` block and the arrays that follow it (mappings, images, ...),
//! - blobs: regions the header points at anywhere in the cache, each with
//!   the tables found inside it,
//! - the Mach-O layout of every image the cache lists.
//!
//! The main cache lands directly under the root; the others get an unsized
//! container at their base address.

use std::mem::offset_of;

use tracing::{debug, info, warn};

use super::accelerator::decode_accelerator;
use super::macho::{decode_image, Image};
use super::patch::decode_patch_info;
use super::slide::decode_slide_info;
use super::{within, DecodeOptions, Decoder, Table};
use crate::address::Address;
use crate::dyld::*;
use crate::error::Result;
use crate::macho::Nlist64;
use crate::record::emit_record;
use crate::source::Fetcher;
use crate::tree::{check, insert_deep, Block, Builder, POINTS_TO};
use crate::util::basename;

/// Decodes a cache, its sub-caches and (if enabled) its symbols file into a
/// checked tree.
pub fn decode_cache(fetcher: &dyn Fetcher, options: &DecodeOptions) -> Result<Block> {
    let header = fetcher.header();
    info!(
        cache = fetcher.name(),
        arch = %header.architecture(),
        version = ?header.version,
        base = format_args!("{:#x}", placement(fetcher)),
        slide = format_args!("{:#x}", fetcher.slide()),
        "decoding cache"
    );

    let mut root = Block::container(fetcher.name(), 0);
    CacheDecoder::new(fetcher, options, "Main").decode(&mut root)?;

    for (index, sub) in fetcher.sub_caches().into_iter().enumerate() {
        let label = format!("Sub Cache {}", index + 1);
        let mut container = Block::container(label.as_str(), placement(sub));
        CacheDecoder::new(sub, options, &label).decode(&mut container)?;
        insert_deep(&mut root, container);
    }

    if let Some(symbols) = fetcher.symbols_cache() {
        if options.include_symbols_file {
            let mut container = Block::container("Symbols Cache", placement(symbols));
            CacheDecoder::new(symbols, options, "Symbols Cache").decode(&mut container)?;
            insert_deep(&mut root, container);
        } else {
            debug!(cache = symbols.name(), "skipping symbols file");
        }
    }

    root.fix_offsets();
    check(&root)?;
    let stats = root.stats();
    info!(
        blocks = stats.blocks,
        values = stats.values,
        links = stats.links,
        depth = stats.depth,
        "decoded cache"
    );
    Ok(root)
}

/// Slid address of a cache's first byte.
///
/// Memory sources report this as their base. File sources are placed where
/// their first mapping was built to load.
fn placement(fetcher: &dyn Fetcher) -> u64 {
    match fetcher.mappings().first() {
        Some(first) => first.address.wrapping_add(fetcher.slide()),
        None => fetcher.base_address(),
    }
}

/// Decodes one cache file.
struct CacheDecoder<'a> {
    fetcher: &'a dyn Fetcher,
    header: &'a CacheHeader,
    decoder: Decoder<'a, dyn Fetcher + 'a>,
    /// Slid address of the header
    base: u64,
    /// Unslid address of the first mapping, which VM offsets count from
    vm_start: u64,
    label: &'a str,
}

impl<'a> CacheDecoder<'a> {
    fn new(fetcher: &'a dyn Fetcher, options: &'a DecodeOptions, label: &'a str) -> Self {
        Self {
            fetcher,
            header: fetcher.header(),
            decoder: Decoder::new(fetcher, fetcher.slide(), options),
            base: placement(fetcher),
            vm_start: fetcher.mappings().first().map_or(0, |m| m.address),
            label,
        }
    }

    fn decode(&self, container: &mut Block) -> Result<()> {
        let mut header = self.header_block()?;
        let mut area_blocks = Vec::new();
        let mut blobs = Vec::new();

        let images = self.header_arrays(&mut header, &mut area_blocks, &mut blobs)?;
        self.blobs(&mut header, &mut blobs)?;

        let mut area = Block::container(format!("{} Header Area", self.label), self.base);
        insert_deep(&mut area, header);
        for block in area_blocks {
            insert_deep(&mut area, block);
        }
        insert_deep(container, area);
        for blob in blobs {
            insert_deep(container, blob);
        }

        self.images(&images, container)?;
        container.fix_offsets();
        debug!(cache = self.fetcher.name(), "decoded cache file");
        Ok(())
    }

    /// The `Header` block, with values for every field below the mappings.
    fn header_block(&self) -> Result<Block> {
        let size = self.header.size();
        let bytes = self.fetcher.reader_at_file_offset(0)?.bytes(size as usize)?;
        let mut block = Block::new("Header", self.base, size);
        emit_record(&mut block, &self.header.layout(), bytes, size as usize);
        Ok(block)
    }

    /// Address of a header-relative table.
    fn in_header(&self, offset: u64) -> Address {
        Address::file64(offset).add_base(self.base)
    }

    /// Address of a region located by file offset. Zero is absent.
    fn at_file_offset(&self, offset: u64) -> Address {
        if offset == 0 {
            return Address::file64(0);
        }
        Address::Manual {
            address: self.fetcher.address_of_file_offset(offset),
            file_offset: offset,
        }
    }

    /// Address of a region located by offset from the first mapping.
    fn at_vm_offset(&self, offset: u64) -> Address {
        within(Address::UnslidAbsolute64(self.vm_start), offset)
    }

    /// Whether a file-offset region can be read from this source. Memory
    /// sources hold only what dyld mapped, so trailing data is missing.
    fn resident(&self, name: &str, offset: u64, size: u64) -> bool {
        if offset == 0 || size == 0 || self.fetcher.resident(offset, size) {
            return true;
        }
        debug!(
            cache = self.fetcher.name(),
            region = name,
            offset = format_args!("{:#x}", offset),
            size = format_args!("{:#x}", size),
            "region not resident, skipping"
        );
        false
    }

    /// Decodes the arrays following the header. Returns the image records,
    /// empty if the image list was not decoded element by element.
    fn header_arrays(
        &self,
        header: &mut Block,
        area: &mut Vec<Block>,
        blobs: &mut Vec<Block>,
    ) -> Result<Vec<DyldCacheImageInfo>> {
        let f = &self.header.fields;

        if let Some(mappings) = self.decoder.array::<DyldCacheMappingInfo>(
            header,
            Table::new("Mappings", "Mapping", self.in_header(f.mapping_offset as u64), f.mapping_count as u64)
                .linked("mapping_offset", "mapping_count"),
        )? {
            area.push(mappings.block);
        }

        if let Some(mut mappings) = self.decoder.array::<DyldCacheMappingAndSlideInfo>(
            header,
            Table::new(
                "Mappings With Slide",
                "Mapping With Slide",
                self.in_header(f.mapping_with_slide_offset as u64),
                f.mapping_with_slide_count as u64,
            )
            .linked("mapping_with_slide_offset", "mapping_with_slide_count"),
        )? {
            for (element, mapping) in mappings.block.children.iter_mut().zip(&mappings.records) {
                let flags = mapping.flags_label();
                if !flags.is_empty() {
                    element.name = format!("{} ({})", element.name, flags);
                }
                self.mapping_slide_info(element, mapping, blobs)?;
            }
            area.push(mappings.block);
        }

        let (offset_field, images_offset, count_field, images_count) = self.header.images();
        let images = self.decoder.array::<DyldCacheImageInfo>(
            header,
            Table::new("Images", "Image", self.in_header(images_offset), images_count).linked(offset_field, count_field),
        )?;

        if let Some(text) = self.decoder.array::<DyldCacheImageTextInfo>(
            header,
            Table::new("Images Text", "Image Text", self.in_header(f.images_text_offset), f.images_text_count)
                .linked("images_text_offset", "images_text_count"),
        )? {
            area.push(text.block);
        }

        if let Some(pools) = self.decoder.array::<DyldCacheBranchPool>(
            header,
            Table::new("Branch Pools", "Branch Pool", self.in_header(f.branch_pools_offset as u64), f.branch_pools_count as u64)
                .linked("branch_pools_offset", "branch_pools_count"),
        )? {
            area.push(pools.block);
        }

        if self.header.has(offset_of!(DyldCacheHeader, sub_cache_array_count), 4) {
            let table = Table::new(
                "Sub Cache Entries",
                "Sub Cache Entry",
                self.in_header(f.sub_cache_array_offset as u64),
                f.sub_cache_array_count as u64,
            )
            .linked("sub_cache_array_offset", "sub_cache_array_count");
            let entries = if self.header.subcache_entries_have_suffix() {
                self.decoder
                    .array::<DyldSubcacheEntry2>(header, table)?
                    .map(|a| self.link_sub_caches(a.block, a.records.iter().map(|e| e.cache_vm_offset)))
            } else {
                self.decoder
                    .array::<DyldSubcacheEntry>(header, table)?
                    .map(|a| self.link_sub_caches(a.block, a.records.iter().map(|e| e.cache_vm_offset)))
            };
            area.extend(entries);
        }

        Ok(match images {
            Some(images) => {
                area.push(images.block);
                images.records
            }
            None => Vec::new(),
        })
    }

    /// Links each sub-cache entry to where its cache starts.
    fn link_sub_caches(&self, mut block: Block, offsets: impl Iterator<Item = u64>) -> Block {
        for (element, vm_offset) in block.children.iter_mut().zip(offsets) {
            element.link("cache_vm_offset", POINTS_TO, self.base.wrapping_add(vm_offset));
        }
        block
    }

    /// The slide info one mapping-with-slide entry points at.
    fn mapping_slide_info(
        &self,
        element: &mut Block,
        mapping: &DyldCacheMappingAndSlideInfo,
        blobs: &mut Vec<Block>,
    ) -> Result<()> {
        let (offset, size) = (mapping.slide_info_file_offset, mapping.slide_info_file_size);
        if !self.resident("Slide Info", offset, size) {
            return Ok(());
        }
        let address = self.at_file_offset(offset);
        if let Some(mut blob) = self.decoder.blob(
            element,
            "Slide Info",
            address,
            size,
            ("slide_info_file_offset", "slide_info_file_size"),
        ) {
            let tables = decode_slide_info(&self.decoder, &mut blob, address)?;
            blobs.push(blob);
            blobs.extend(tables);
        }
        Ok(())
    }

    /// Decodes every region the header points at outside the header area.
    fn blobs(&self, header: &mut Block, out: &mut Vec<Block>) -> Result<()> {
        let f = &self.header.fields;

        self.local_symbols(header, out)?;

        if self.resident("Code Signature", f.code_signature_offset, f.code_signature_size) {
            out.extend(self.decoder.blob(
                header,
                "Code Signature",
                self.at_file_offset(f.code_signature_offset),
                f.code_signature_size,
                ("code_signature_offset", "code_signature_size"),
            ));
        }

        if self.resident("Slide Info", f.slide_info_offset_unused, f.slide_info_size_unused) {
            let address = self.at_file_offset(f.slide_info_offset_unused);
            if let Some(mut blob) = self.decoder.blob(
                header,
                "Slide Info",
                address,
                f.slide_info_size_unused,
                ("slide_info_offset_unused", "slide_info_size_unused"),
            ) {
                let tables = decode_slide_info(&self.decoder, &mut blob, address)?;
                out.push(blob);
                out.extend(tables);
            }
        }

        if let Some((addr, size)) = self.header.accelerate_info() {
            let address = Address::UnslidAbsolute64(addr);
            if let Some(mut blob) = self.decoder.blob(
                header,
                "Accelerator Info",
                address,
                size,
                ("accelerate_info_addr", "accelerate_info_size"),
            ) {
                let tables = decode_accelerator(&self.decoder, &mut blob, address)?;
                out.push(blob);
                out.extend(tables);
            }
        }

        let patch_address = Address::UnslidAbsolute64(f.patch_info_addr);
        if let Some(mut blob) = self.decoder.blob(
            header,
            "Patch Info",
            patch_address,
            f.patch_info_size,
            ("patch_info_addr", "patch_info_size"),
        ) {
            let tables = decode_patch_info(&self.decoder, &mut blob, patch_address, self.header.images_count())?;
            out.push(blob);
            out.extend(tables);
        }

        let unslid = [
            ("Program Closures", f.prog_closures_addr, f.prog_closures_size, ("prog_closures_addr", "prog_closures_size")),
            ("Program Closures Trie", f.prog_closures_trie_addr, f.prog_closures_trie_size, ("prog_closures_trie_addr", "prog_closures_trie_size")),
            ("Dylibs Image Array", f.dylibs_image_array_addr, f.dylibs_image_array_size, ("dylibs_image_array_addr", "dylibs_image_array_size")),
            ("Dylibs Trie", f.dylibs_trie_addr, f.dylibs_trie_size, ("dylibs_trie_addr", "dylibs_trie_size")),
            ("Other Image Array", f.other_image_array_addr, f.other_image_array_size, ("other_image_array_addr", "other_image_array_size")),
            ("Other Trie", f.other_trie_addr, f.other_trie_size, ("other_trie_addr", "other_trie_size")),
            ("Program Trie", f.program_trie_addr, f.program_trie_size as u64, ("program_trie_addr", "program_trie_size")),
            ("Programs PBL Set Pool", f.programs_pbl_set_pool_addr, f.programs_pbl_set_pool_size, ("programs_pbl_set_pool_addr", "programs_pbl_set_pool_size")),
            ("Rosetta Read-Only", f.rosetta_read_only_addr, f.rosetta_read_only_size, ("rosetta_read_only_addr", "rosetta_read_only_size")),
            ("Rosetta Read-Write", f.rosetta_read_write_addr, f.rosetta_read_write_size, ("rosetta_read_write_addr", "rosetta_read_write_size")),
        ];
        for (name, addr, size, fields) in unslid {
            out.extend(self.decoder.blob(header, name, Address::UnslidAbsolute64(addr), size, fields));
        }

        self.optimizations(header, out)?;

        out.extend(self.decoder.blob(
            header,
            "Cache Atlas",
            self.at_vm_offset(f.cache_atlas_offset),
            f.cache_atlas_size,
            ("cache_atlas_offset", "cache_atlas_size"),
        ));

        let dynamic_address = self.at_vm_offset(f.dynamic_data_offset);
        if let Some(mut blob) = self.decoder.blob(
            header,
            "Dynamic Data",
            dynamic_address,
            f.dynamic_data_max_size,
            ("dynamic_data_offset", "dynamic_data_max_size"),
        ) {
            if clamp_to_mapping(&mut blob, self.fetcher.mappings(), self.decoder.slide) {
                warn!(
                    cache = self.fetcher.name(),
                    size = format_args!("{:#x}", blob.size),
                    "dynamic data runs past its mapping, clamped"
                );
            }
            self.decoder.annotate::<DyldCacheDynamicDataHeader>(&mut blob, dynamic_address)?;
            out.push(blob);
        }
        Ok(())
    }

    /// Swift and ObjC optimisation headers.
    fn optimizations(&self, header: &mut Block, out: &mut Vec<Block>) -> Result<()> {
        let f = &self.header.fields;
        let swift_address = self.at_vm_offset(f.swift_opts_offset);
        let swift = self.decoder.blob(
            header,
            "Swift Optimizations",
            swift_address,
            f.swift_opts_size,
            ("swift_opts_offset", "swift_opts_size"),
        );
        let objc_address = self.at_vm_offset(f.objc_opts_offset);
        let objc = self.decoder.blob(
            header,
            "ObjC Optimizations",
            objc_address,
            f.objc_opts_size,
            ("objc_opts_offset", "objc_opts_size"),
        );

        if let Some(mut objc) = objc {
            if let Some(swift) = &swift {
                if clip_before(&mut objc, swift) {
                    warn!(
                        cache = self.fetcher.name(),
                        size = format_args!("{:#x}", objc.size),
                        "ObjC optimizations overlap Swift optimizations, clipped"
                    );
                }
            }
            self.decoder.annotate::<DyldCacheObjcOpts>(&mut objc, objc_address)?;
            out.push(objc);
        }
        if let Some(mut swift) = swift {
            self.decoder.annotate::<DyldCacheSwiftOpts>(&mut swift, swift_address)?;
            out.push(swift);
        }
        Ok(())
    }

    /// The unmapped local symbols: info header, nlist array, strings and
    /// per-dylib entries, all relative to the info.
    fn local_symbols(&self, header: &mut Block, out: &mut Vec<Block>) -> Result<()> {
        let f = &self.header.fields;
        if !self.resident("Local Symbols", f.local_symbols_offset, f.local_symbols_size) {
            return Ok(());
        }
        let address = self.at_file_offset(f.local_symbols_offset);
        let Some(mut blob) = self.decoder.blob(
            header,
            "Local Symbols",
            address,
            f.local_symbols_size,
            ("local_symbols_offset", "local_symbols_size"),
        ) else {
            return Ok(());
        };
        let info: DyldCacheLocalSymbolsInfo = self.decoder.annotate(&mut blob, address)?;

        let mut tables = Vec::new();
        tables.extend(
            self.decoder
                .array::<Nlist64>(
                    &mut blob,
                    Table::new("Symbol Table", "Symbol", within(address, info.nlist_offset as u64), info.nlist_count as u64)
                        .linked("nlist_offset", "nlist_count"),
                )?
                .map(|a| a.block),
        );
        tables.extend(self.decoder.blob(
            &mut blob,
            "String Pool",
            within(address, info.strings_offset as u64),
            info.strings_size as u64,
            ("strings_offset", "strings_size"),
        ));
        let entries = Table::new(
            "Entries",
            "Entry",
            within(address, info.entries_offset as u64),
            info.entries_count as u64,
        )
        .linked("entries_offset", "entries_count");
        let entries = if self.header.local_symbols_entries_are_64() {
            self.decoder.array::<DyldCacheLocalSymbolsEntry64>(&mut blob, entries)?.map(|a| a.block)
        } else {
            self.decoder.array::<DyldCacheLocalSymbolsEntry>(&mut blob, entries)?.map(|a| a.block)
        };
        tables.extend(entries);

        out.push(blob);
        out.extend(tables);
        Ok(())
    }

    /// Lays out the Mach-O image of every listed dylib.
    ///
    /// All images share one builder so that the rebalance runs once per
    /// cache rather than once per image.
    fn images(&self, images: &[DyldCacheImageInfo], container: &mut Block) -> Result<()> {
        if !self.decoder.options.decode_images || self.header.images_count() == 0 {
            return Ok(());
        }
        if images.is_empty() {
            debug!(
                cache = self.fetcher.name(),
                count = self.header.images_count(),
                "image list not decoded element-wise, skipping images"
            );
            return Ok(());
        }

        let mut builder = Builder::new();
        for record in images {
            let path = self.image_path(record.path_file_offset)?;
            let prefix = format!("{} ", basename(&path));
            let image = Image {
                header: Address::UnslidAbsolute64(record.address),
                prefix: &prefix,
                in_cache: true,
            };
            decode_image(&self.decoder, &image, &mut builder)?;
        }
        debug!(
            cache = self.fetcher.name(),
            images = images.len(),
            blocks = builder.len(),
            "placing image regions"
        );
        builder.rebalance(container);
        Ok(())
    }

    fn image_path(&self, offset: u32) -> Result<String> {
        if offset == 0 {
            return Ok(String::from("image"));
        }
        self.fetcher.reader_at_file_offset(offset as u64)?.cstr()
    }
}

/// Shrinks `block` so it ends where `next` starts, if `next` starts inside
/// it. Returns true if the block changed.
fn clip_before(block: &mut Block, next: &Block) -> bool {
    if next.address > block.address && next.address < block.end() {
        block.size = next.address - block.address;
        return true;
    }
    false
}

/// Shrinks `block` to the end of the mapping its start lies in. Returns
/// true if the block changed.
fn clamp_to_mapping(block: &mut Block, mappings: &[DyldCacheMappingInfo], slide: u64) -> bool {
    let unslid = block.address.wrapping_sub(slide);
    let Some(mapping) = mappings.iter().find(|m| m.contains_address(unslid)) else {
        return false;
    };
    let Some(limit) = unslid
        .checked_sub(mapping.address)
        .and_then(|delta| mapping.size.checked_sub(delta))
    else {
        return false;
    };
    if block.size > limit {
        block.size = limit;
        return true;
    }
    false
}
