//! Dyld shared cache binary structures.
//!
//! These structures match the on-disk format of Apple's dyld shared cache.
//! Each one is declared through [`record!`](crate::record!), so besides the
//! zero-copy struct it carries a field table the decoder walks to emit values.

use std::mem::{offset_of, size_of};

use bitflags::bitflags;
use zerocopy::FromBytes;

use crate::error::{Error, Result};
use crate::record;
use crate::util::trimmed_ascii;

/// The magic string prefix for all supported caches.
pub const DYLD_CACHE_MAGIC_PREFIX: &[u8; 7] = b"dyld_v1";

// =============================================================================
// Header Structures
// =============================================================================

record! {
    /// The main dyld shared cache header, newest layout.
    ///
    /// This is a variable-length structure: only the fields below
    /// `mapping_offset` exist in a given cache. Older caches are read into a
    /// zero-filled copy of this struct.
    pub struct DyldCacheHeader {
        magic: [u8; 16] => Ascii,
        mapping_offset: u32,
        mapping_count: u32,
        images_offset_old: u32,
        images_count_old: u32,
        dyld_base_address: u64,
        code_signature_offset: u64,
        code_signature_size: u64,
        slide_info_offset_unused: u64,
        slide_info_size_unused: u64,
        local_symbols_offset: u64,
        local_symbols_size: u64,
        uuid: [u8; 16] => Uuid,
        cache_type: u64,
        branch_pools_offset: u32,
        branch_pools_count: u32,
        dyld_in_cache_mh: u64,
        dyld_in_cache_entry: u64,
        images_text_offset: u64,
        images_text_count: u64,
        patch_info_addr: u64,
        patch_info_size: u64,
        other_image_group_addr_unused: u64,
        other_image_group_size_unused: u64,
        prog_closures_addr: u64,
        prog_closures_size: u64,
        prog_closures_trie_addr: u64,
        prog_closures_trie_size: u64,
        platform: u32,
        format_version_and_flags: u32,
        shared_region_start: u64,
        shared_region_size: u64,
        max_slide: u64,
        dylibs_image_array_addr: u64,
        dylibs_image_array_size: u64,
        dylibs_trie_addr: u64,
        dylibs_trie_size: u64,
        other_image_array_addr: u64,
        other_image_array_size: u64,
        other_trie_addr: u64,
        other_trie_size: u64,
        mapping_with_slide_offset: u32,
        mapping_with_slide_count: u32,
        dylibs_pbl_state_array_addr_unused: u64,
        dylibs_pbl_set_addr: u64,
        programs_pbl_set_pool_addr: u64,
        programs_pbl_set_pool_size: u64,
        program_trie_addr: u64,
        program_trie_size: u32,
        os_version: u32,
        alt_platform: u32,
        alt_os_version: u32,
        swift_opts_offset: u64,
        swift_opts_size: u64,
        sub_cache_array_offset: u32,
        sub_cache_array_count: u32,
        symbol_file_uuid: [u8; 16] => Uuid,
        rosetta_read_only_addr: u64,
        rosetta_read_only_size: u64,
        rosetta_read_write_addr: u64,
        rosetta_read_write_size: u64,
        images_offset: u32,
        images_count: u32,
        cache_sub_type: u32,
        padding: u32,
        objc_opts_offset: u64,
        objc_opts_size: u64,
        cache_atlas_offset: u64,
        cache_atlas_size: u64,
        dynamic_data_offset: u64,
        dynamic_data_max_size: u64,
    }

    /// The oldest supported header layout, which still carried the
    /// accelerator table where newer caches record dyld's own image.
    pub struct DyldCacheHeaderV1 {
        magic: [u8; 16] => Ascii,
        mapping_offset: u32,
        mapping_count: u32,
        images_offset_old: u32,
        images_count_old: u32,
        dyld_base_address: u64,
        code_signature_offset: u64,
        code_signature_size: u64,
        slide_info_offset_unused: u64,
        slide_info_size_unused: u64,
        local_symbols_offset: u64,
        local_symbols_size: u64,
        uuid: [u8; 16] => Uuid,
        cache_type: u64,
        branch_pools_offset: u32,
        branch_pools_count: u32,
        accelerate_info_addr: u64,
        accelerate_info_size: u64,
        images_text_offset: u64,
        images_text_count: u64,
        patch_info_addr: u64,
        patch_info_size: u64,
        other_image_group_addr_unused: u64,
        other_image_group_size_unused: u64,
        prog_closures_addr: u64,
        prog_closures_size: u64,
        prog_closures_trie_addr: u64,
        prog_closures_trie_size: u64,
        platform: u32,
        format_version_and_flags: u32,
        shared_region_start: u64,
        shared_region_size: u64,
        max_slide: u64,
        dylibs_image_array_addr: u64,
        dylibs_image_array_size: u64,
        dylibs_trie_addr: u64,
        dylibs_trie_size: u64,
        other_image_array_addr: u64,
        other_image_array_size: u64,
        other_trie_addr: u64,
        other_trie_size: u64,
    }
}

/// Header layout generation, chosen by where the mapping array starts.
///
/// Each generation appended fields to the header, and the mapping array
/// always follows the header directly. So a header whose mapping array
/// begins exactly where a newer field would live cannot have that field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HeaderVersion {
    /// Ends before `mapping_with_slide_offset`; may carry accelerator info.
    V1,
    /// Has per-mapping slide info but no sub-cache array.
    V2,
    /// Split caches with sub-cache entries.
    V3,
}

impl HeaderVersion {
    /// Selects the layout generation for a header whose mapping array
    /// starts at `mapping_offset`.
    pub fn detect(mapping_offset: u32) -> Self {
        let offset = mapping_offset as usize;
        if offset <= offset_of!(DyldCacheHeader, mapping_with_slide_offset) {
            HeaderVersion::V1
        } else if offset <= offset_of!(DyldCacheHeader, sub_cache_array_offset) {
            HeaderVersion::V2
        } else {
            HeaderVersion::V3
        }
    }
}

/// A parsed cache header together with its layout generation.
#[derive(Debug, Clone)]
pub struct CacheHeader {
    /// Layout generation, inferred from `mapping_offset`
    pub version: HeaderVersion,
    /// Header fields; everything at or beyond `mapping_offset` reads as zero
    pub fields: DyldCacheHeader,
}

impl CacheHeader {
    /// Parses and validates the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 0x20 {
            return Err(Error::buffer_too_small(0x20, data.len()));
        }
        if &data[..DYLD_CACHE_MAGIC_PREFIX.len()] != DYLD_CACHE_MAGIC_PREFIX {
            return Err(Error::InvalidMagic(trimmed_ascii(&data[..16])));
        }

        let mapping_offset = crate::util::read_u32_le(&data[16..20]) as usize;
        if mapping_offset < 0x20 {
            return Err(Error::parse(16, format!("mapping offset {:#x} overlaps the header", mapping_offset)));
        }
        let mut buf = [0u8; size_of::<DyldCacheHeader>()];
        let present = mapping_offset.min(buf.len()).min(data.len());
        buf[..present].copy_from_slice(&data[..present]);
        let fields = DyldCacheHeader::read_from_bytes(&buf)
            .map_err(|_| Error::buffer_too_small(buf.len(), present))?;

        Ok(Self {
            version: HeaderVersion::detect(fields.mapping_offset),
            fields,
        })
    }

    /// Returns true if the field at `offset` with `width` bytes is present.
    pub fn has(&self, offset: usize, width: usize) -> bool {
        offset + width <= self.fields.mapping_offset as usize
    }

    /// Size of the header region: up to the mapping array, capped at the
    /// largest known layout.
    pub fn size(&self) -> u64 {
        let layout = self.layout();
        (self.fields.mapping_offset as u64).min(layout.size as u64)
    }

    /// Field table matching this header's generation.
    pub fn layout(&self) -> crate::record::Layout {
        use crate::record::Record;
        match self.version {
            HeaderVersion::V1 => DyldCacheHeaderV1::FIELDS,
            HeaderVersion::V2 | HeaderVersion::V3 => DyldCacheHeader::FIELDS,
        }
    }

    /// Returns the architecture from the magic string.
    pub fn architecture(&self) -> String {
        trimmed_ascii(&self.fields.magic[DYLD_CACHE_MAGIC_PREFIX.len()..])
            .trim()
            .to_string()
    }

    /// Returns true if this cache lists sub-cache files.
    pub fn has_subcaches(&self) -> bool {
        self.has(offset_of!(DyldCacheHeader, sub_cache_array_count), 4)
            && self.fields.sub_cache_array_count > 0
    }

    /// Sub-cache entries carry an explicit file suffix once the header
    /// grew `cache_sub_type`.
    pub fn subcache_entries_have_suffix(&self) -> bool {
        self.has(offset_of!(DyldCacheHeader, cache_sub_type), 4)
    }

    /// Returns true if this cache has a separate symbols file.
    pub fn has_symbol_file(&self) -> bool {
        self.has(offset_of!(DyldCacheHeader, symbol_file_uuid), 16)
            && self.fields.symbol_file_uuid != [0u8; 16]
    }

    /// Local symbol entries widened to 64-bit dylib offsets together with
    /// the introduction of the symbols file.
    pub fn local_symbols_entries_are_64(&self) -> bool {
        self.has(offset_of!(DyldCacheHeader, symbol_file_uuid), 16)
    }

    /// Returns true if the image array sits at its newer location.
    pub fn uses_new_images_offset(&self) -> bool {
        self.has(offset_of!(DyldCacheHeader, images_offset), 4) && self.fields.images_offset != 0
    }

    /// The image array as `(offset field, offset, count field, count)`.
    pub fn images(&self) -> (&'static str, u64, &'static str, u64) {
        if self.uses_new_images_offset() {
            (
                "images_offset",
                self.fields.images_offset as u64,
                "images_count",
                self.fields.images_count as u64,
            )
        } else {
            (
                "images_offset_old",
                self.fields.images_offset_old as u64,
                "images_count_old",
                self.fields.images_count_old as u64,
            )
        }
    }

    /// Number of images this cache lists.
    pub fn images_count(&self) -> u64 {
        self.images().3
    }

    /// Accelerator table address and size; only V1 headers have one.
    pub fn accelerate_info(&self) -> Option<(u64, u64)> {
        match self.version {
            HeaderVersion::V1 => Some((self.fields.dyld_in_cache_mh, self.fields.dyld_in_cache_entry)),
            _ => None,
        }
    }
}

// =============================================================================
// Mapping Structures
// =============================================================================

record! {
    /// Basic mapping entry (older caches without slide info per-mapping).
    pub struct DyldCacheMappingInfo {
        address: u64,
        size: u64,
        file_offset: u64,
        max_prot: u32,
        init_prot: u32,
    }

    /// Extended mapping entry with per-mapping slide info.
    pub struct DyldCacheMappingAndSlideInfo {
        address: u64,
        size: u64,
        file_offset: u64,
        slide_info_file_offset: u64,
        slide_info_file_size: u64,
        flags: u64,
        max_prot: u32,
        init_prot: u32,
    }
}

impl DyldCacheMappingInfo {
    /// Returns true if `address` falls in this mapping.
    pub fn contains_address(&self, address: u64) -> bool {
        address.checked_sub(self.address).is_some_and(|delta| delta < self.size)
    }

    /// Returns true if `offset` falls in this mapping's file range.
    pub fn contains_file_offset(&self, offset: u64) -> bool {
        offset.checked_sub(self.file_offset).is_some_and(|delta| delta < self.size)
    }

    /// Returns true if `size` bytes at file `offset` all fall in this mapping.
    pub fn contains_file_range(&self, offset: u64, size: u64) -> bool {
        offset
            .checked_sub(self.file_offset)
            .and_then(|delta| delta.checked_add(size))
            .is_some_and(|end| end <= self.size)
    }
}

bitflags! {
    /// Flags for extended mapping entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MappingFlags: u64 {
        const AUTH_DATA = 1 << 0;
        const DIRTY_DATA = 1 << 1;
        const CONST_DATA = 1 << 2;
        const TEXT_STUBS = 1 << 3;
        const DYNAMIC_CONFIG_DATA = 1 << 4;
    }
}

impl DyldCacheMappingAndSlideInfo {
    /// Short human-readable tag for the mapping's flags, e.g. `"AUTH_DATA"`.
    pub fn flags_label(&self) -> String {
        let flags = MappingFlags::from_bits_truncate(self.flags);
        let names: Vec<_> = flags.iter_names().map(|(name, _)| name).collect();
        names.join("|")
    }
}

// =============================================================================
// Image Structures
// =============================================================================

record! {
    /// Information about a dylib in the cache.
    pub struct DyldCacheImageInfo {
        address: u64,
        mod_time: u64,
        inode: u64,
        path_file_offset: u32,
        padding: u32,
    }

    /// Text segment info for an image.
    pub struct DyldCacheImageTextInfo {
        uuid: [u8; 16] => Uuid,
        load_address: u64,
        text_segment_size: u32,
        path_offset: u32,
    }

    /// One branch-pool address.
    pub struct DyldCacheBranchPool {
        address: u64,
    }
}

// =============================================================================
// Subcache Structures
// =============================================================================

record! {
    /// Subcache entry (version 1, numeric file suffix implied by index).
    pub struct DyldSubcacheEntry {
        uuid: [u8; 16] => Uuid,
        cache_vm_offset: u64,
    }

    /// Subcache entry (version 2, explicit file suffix).
    pub struct DyldSubcacheEntry2 {
        uuid: [u8; 16] => Uuid,
        cache_vm_offset: u64,
        file_suffix: [u8; 32] => Ascii,
    }
}

impl DyldSubcacheEntry2 {
    /// Returns the file suffix as a string.
    pub fn suffix(&self) -> String {
        crate::util::c_string(&self.file_suffix)
    }
}

// =============================================================================
// Local Symbols
// =============================================================================

record! {
    /// Local symbols information header. Offsets are relative to it.
    pub struct DyldCacheLocalSymbolsInfo {
        nlist_offset: u32,
        nlist_count: u32,
        strings_offset: u32,
        strings_size: u32,
        entries_offset: u32,
        entries_count: u32,
    }

    /// Per-dylib local symbol entry (32-bit dylib offset).
    pub struct DyldCacheLocalSymbolsEntry {
        dylib_offset: u32,
        nlist_start_index: u32,
        nlist_count: u32,
    }

    /// Per-dylib local symbol entry (64-bit dylib offset, newer caches).
    pub struct DyldCacheLocalSymbolsEntry64 {
        dylib_offset: u64,
        nlist_start_index: u32,
        nlist_count: u32,
    }
}

// =============================================================================
// Slide Info Structures
// =============================================================================

record! {
    /// Slide info version 1: a table of contents into per-page bitmaps.
    pub struct DyldCacheSlideInfo1 {
        version: u32,
        toc_offset: u32,
        toc_count: u32,
        entries_offset: u32,
        entries_count: u32,
        entries_size: u32,
    }

    /// Slide info version 2 (standard arm64 and x86_64).
    pub struct DyldCacheSlideInfo2 {
        version: u32,
        page_size: u32,
        page_starts_offset: u32,
        page_starts_count: u32,
        page_extras_offset: u32,
        page_extras_count: u32,
        delta_mask: u64,
        value_add: u64,
    }

    /// Slide info version 3 (arm64e with PAC). Page starts follow it.
    pub struct DyldCacheSlideInfo3 {
        version: u32,
        page_size: u32,
        page_starts_count: u32,
        padding: u32,
        auth_value_add: u64,
    }

    /// Slide info version 4 (32-bit targets). Same shape as version 2.
    pub struct DyldCacheSlideInfo4 {
        version: u32,
        page_size: u32,
        page_starts_offset: u32,
        page_starts_count: u32,
        page_extras_offset: u32,
        page_extras_count: u32,
        delta_mask: u64,
        value_add: u64,
    }

    /// Slide info version 5 (arm64e, newer caches). Page starts follow it.
    pub struct DyldCacheSlideInfo5 {
        version: u32,
        page_size: u32,
        page_starts_count: u32,
        padding: u32,
        value_add: u64,
    }

    /// One 16-bit entry of a page-start, page-extra or index list.
    pub struct DyldCacheU16Entry {
        value: u16,
    }
}

// =============================================================================
// Patch Info Structures
// =============================================================================

record! {
    /// Patch info before the table was versioned.
    pub struct DyldCachePatchInfo {
        patch_table_array_addr: u64,
        patch_table_array_count: u64,
        patch_export_array_addr: u64,
        patch_export_array_count: u64,
        patch_location_array_addr: u64,
        patch_location_array_count: u64,
        patch_export_names_addr: u64,
        patch_export_names_size: u64,
    }

    /// Patch info version 2.
    pub struct DyldCachePatchInfoV2 {
        patch_table_version: u32,
        patch_location_version: u32,
        patch_table_array_addr: u64,
        patch_table_array_count: u64,
        patch_image_exports_array_addr: u64,
        patch_image_exports_array_count: u64,
        patch_clients_array_addr: u64,
        patch_clients_array_count: u64,
        patch_client_exports_array_addr: u64,
        patch_client_exports_array_count: u64,
        patch_location_array_addr: u64,
        patch_location_array_count: u64,
        patch_export_names_addr: u64,
        patch_export_names_size: u64,
    }

    /// Patch info version 3: version 2 plus GOT patching tables.
    pub struct DyldCachePatchInfoV3 {
        v2: DyldCachePatchInfoV2,
        got_clients_array_addr: u64,
        got_clients_array_count: u64,
        got_client_exports_array_addr: u64,
        got_client_exports_array_count: u64,
        got_location_array_addr: u64,
        got_location_array_count: u64,
    }

    pub struct DyldCacheImagePatches {
        patch_exports_start_index: u32,
        patch_exports_count: u32,
    }

    pub struct DyldCachePatchableExport {
        cache_offset_of_impl: u32,
        patch_locations_start_index: u32,
        patch_locations_count: u32,
        export_name_offset: u32,
    }

    pub struct DyldCachePatchableLocation {
        cache_offset: u32,
        padding: u32,
        bits: u64,
    }

    pub struct DyldCacheImagePatchesV2 {
        patch_clients_start_index: u32,
        patch_clients_count: u32,
        patch_exports_start_index: u32,
        patch_exports_count: u32,
    }

    pub struct DyldCacheImageExportV2 {
        dylib_offset_of_impl: u32,
        export_name_offset_and_kind: u32,
    }

    pub struct DyldCacheImageClientsV2 {
        client_dylib_index: u32,
        patch_exports_start_index: u32,
        patch_exports_count: u32,
    }

    pub struct DyldCachePatchableExportV2 {
        image_export_index: u32,
        patch_locations_start_index: u32,
        patch_locations_count: u32,
    }

    pub struct DyldCachePatchableLocationV2 {
        dylib_offset_of_use: u32,
        bits: u32,
    }

    pub struct DyldCacheImageGotClientsV3 {
        patch_exports_start_index: u32,
        patch_exports_count: u32,
    }

    pub struct DyldCachePatchableLocationV3 {
        cache_offset_of_use: u64,
        bits: u32,
        padding: u32,
    }
}

/// Patch table generation, read from the first word of the patch info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchVersion {
    /// Unversioned tables from before patch info carried a version word
    Legacy,
    /// Version 2 with per-image export and client tables
    V2,
    /// Version 3, adding GOT clients
    V3,
}

impl PatchVersion {
    /// Classifies the first 32-bit word of a patch info blob.
    ///
    /// Legacy patch info starts with an address, so any small word that is
    /// not a known version is a table version this decoder does not know.
    pub fn detect(first_word: u32) -> std::result::Result<Self, u32> {
        match first_word {
            2 => Ok(PatchVersion::V2),
            3 => Ok(PatchVersion::V3),
            4..=0xff => Err(first_word),
            _ => Ok(PatchVersion::Legacy),
        }
    }
}

// =============================================================================
// Accelerator Tables (V1 headers)
// =============================================================================

record! {
    /// Accelerator info header. Offsets are relative to it.
    pub struct DyldCacheAcceleratorInfo {
        version: u32,
        image_extras_count: u32,
        images_extras_offset: u32,
        bottom_up_list_offset: u32,
        dylib_trie_offset: u32,
        dylib_trie_size: u32,
        initializers_offset: u32,
        initializers_count: u32,
        dof_sections_offset: u32,
        dof_sections_count: u32,
        re_export_list_offset: u32,
        re_export_count: u32,
        dep_list_offset: u32,
        dep_list_count: u32,
        range_table_offset: u32,
        range_table_count: u32,
        dyld_section_addr: u64,
    }

    pub struct DyldCacheImageInfoExtra {
        exports_trie_addr: u64,
        weak_bindings_addr: u64,
        exports_trie_size: u32,
        weak_bindings_size: u32,
        dependents_start_array_index: u32,
        re_exports_start_array_index: u32,
    }

    pub struct DyldCacheAcceleratorInitializer {
        function_offset: u32,
        image_index: u32,
    }

    pub struct DyldCacheAcceleratorDof {
        section_address: u64,
        section_size: u32,
        image_index: u32,
    }

    pub struct DyldCacheRangeEntry {
        start_address: u64,
        size: u32,
        image_index: u32,
    }
}

// =============================================================================
// Optimisation Headers
// =============================================================================

record! {
    /// Objective-C optimisation header.
    pub struct DyldCacheObjcOpts {
        version: u32,
        flags: u32,
        header_info_ro_cache_offset: u64,
        header_info_rw_cache_offset: u64,
        selector_hash_table_cache_offset: u64,
        class_hash_table_cache_offset: u64,
        protocol_hash_table_cache_offset: u64,
        relative_method_selector_base_address_offset: u64,
    }

    /// Swift optimisation header.
    pub struct DyldCacheSwiftOpts {
        version: u32,
        padding: u32,
        type_conformance_hash_table_cache_offset: u64,
        metadata_conformance_hash_table_cache_offset: u64,
        foreign_type_conformance_hash_table_cache_offset: u64,
    }

    /// Header of the runtime-writable dynamic data region.
    pub struct DyldCacheDynamicDataHeader {
        magic: [u8; 16] => Ascii,
        fs_id: u64,
        fs_obj_id: u64,
    }
}
