//! Accelerator tables of the oldest header layout.
//!
//! Offsets inside the accelerator info are relative to the info itself.

use super::{within, Decoder, Table};
use crate::address::Address;
use crate::dyld::*;
use crate::error::Result;
use crate::record::Record;
use crate::source::Source;
use crate::tree::Block;

pub(super) fn decode_accelerator<S: Source + ?Sized>(
    decoder: &Decoder<'_, S>,
    blob: &mut Block,
    address: Address,
) -> Result<Vec<Block>> {
    let info: DyldCacheAcceleratorInfo = decoder.annotate(blob, address)?;
    let at = |offset: u32| within(address, offset as u64);
    let mut out = Vec::new();

    out.extend(array::<_, DyldCacheImageInfoExtra>(
        decoder,
        blob,
        Table::new("Image Extras", "Image Extra", at(info.images_extras_offset), info.image_extras_count as u64)
            .linked("images_extras_offset", "image_extras_count"),
    )?);
    // One entry per image, like the extras.
    out.extend(array::<_, DyldCacheU16Entry>(
        decoder,
        blob,
        Table::new("Bottom-Up List", "Bottom-Up Entry", at(info.bottom_up_list_offset), info.image_extras_count as u64)
            .linked("bottom_up_list_offset", "image_extras_count"),
    )?);
    out.extend(decoder.blob(
        blob,
        "Dylib Trie",
        at(info.dylib_trie_offset),
        info.dylib_trie_size as u64,
        ("dylib_trie_offset", "dylib_trie_size"),
    ));
    out.extend(array::<_, DyldCacheAcceleratorInitializer>(
        decoder,
        blob,
        Table::new("Initializers", "Initializer", at(info.initializers_offset), info.initializers_count as u64)
            .linked("initializers_offset", "initializers_count"),
    )?);
    out.extend(array::<_, DyldCacheAcceleratorDof>(
        decoder,
        blob,
        Table::new("DOF Sections", "DOF Section", at(info.dof_sections_offset), info.dof_sections_count as u64)
            .linked("dof_sections_offset", "dof_sections_count"),
    )?);
    out.extend(array::<_, DyldCacheU16Entry>(
        decoder,
        blob,
        Table::new("Re-export List", "Re-export", at(info.re_export_list_offset), info.re_export_count as u64)
            .linked("re_export_list_offset", "re_export_count"),
    )?);
    out.extend(array::<_, DyldCacheU16Entry>(
        decoder,
        blob,
        Table::new("Dependency List", "Dependency", at(info.dep_list_offset), info.dep_list_count as u64)
            .linked("dep_list_offset", "dep_list_count"),
    )?);
    out.extend(array::<_, DyldCacheRangeEntry>(
        decoder,
        blob,
        Table::new("Range Table", "Range", at(info.range_table_offset), info.range_table_count as u64)
            .linked("range_table_offset", "range_table_count"),
    )?);
    Ok(out)
}

fn array<S: Source + ?Sized, R: Record>(
    decoder: &Decoder<'_, S>,
    owner: &mut Block,
    table: Table<'_>,
) -> Result<Option<Block>> {
    Ok(decoder.array::<R>(owner, table)?.map(|array| array.block))
}
