//! Patch tables: where each exported symbol is used, so dyld can patch
//! the uses when a root overrides the export.
//!
//! The patch info header comes in three generations. Version 3 embeds the
//! version 2 header and appends the GOT tables, so the two share decoding.
//! Every table address is an unslid VM address.

use tracing::debug;

use super::{Decoder, Table};
use crate::address::Address;
use crate::dyld::*;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::source::Source;
use crate::tree::Block;

/// Decodes the patch info in `blob`, read from `address`.
///
/// `images_count` is the number of images the cache lists; the per-image
/// patch table must have exactly one entry per image.
pub(super) fn decode_patch_info<S: Source + ?Sized>(
    decoder: &Decoder<'_, S>,
    blob: &mut Block,
    address: Address,
    images_count: u64,
) -> Result<Vec<Block>> {
    let first = decoder.reader(address)?.u32()?;
    let version = PatchVersion::detect(first).map_err(|version| Error::UnsupportedPatchVersion {
        version,
        address: blob.address,
    })?;
    debug!(?version, address = format_args!("{:#x}", blob.address), "decoding patch info");

    let mut tables = Vec::new();
    match version {
        PatchVersion::Legacy => {
            let info: DyldCachePatchInfo = decoder.annotate(blob, address)?;
            check_image_count(info.patch_table_array_count, images_count)?;
            let mut t = Tables { decoder, owner: blob, out: &mut tables };
            t.push::<DyldCacheImagePatches>(
                Table::new("Patch Image Table", "Image Patches", unslid(info.patch_table_array_addr), info.patch_table_array_count)
                    .linked("patch_table_array_addr", "patch_table_array_count"),
            )?;
            t.push::<DyldCachePatchableExport>(
                Table::new("Patch Exports", "Export", unslid(info.patch_export_array_addr), info.patch_export_array_count)
                    .linked("patch_export_array_addr", "patch_export_array_count"),
            )?;
            t.push::<DyldCachePatchableLocation>(
                Table::new("Patch Locations", "Location", unslid(info.patch_location_array_addr), info.patch_location_array_count)
                    .linked("patch_location_array_addr", "patch_location_array_count"),
            )?;
            t.names(info.patch_export_names_addr, info.patch_export_names_size);
        }
        PatchVersion::V2 => {
            let info: DyldCachePatchInfoV2 = decoder.annotate(blob, address)?;
            let mut t = Tables { decoder, owner: blob, out: &mut tables };
            t.v2(&info, images_count)?;
        }
        PatchVersion::V3 => {
            let info: DyldCachePatchInfoV3 = decoder.annotate(blob, address)?;
            let mut t = Tables { decoder, owner: blob, out: &mut tables };
            t.v2(&info.v2, images_count)?;
            t.push::<DyldCacheImageGotClientsV3>(
                Table::new("GOT Clients", "GOT Client", unslid(info.got_clients_array_addr), info.got_clients_array_count)
                    .linked("got_clients_array_addr", "got_clients_array_count"),
            )?;
            t.push::<DyldCachePatchableExportV2>(
                Table::new("GOT Client Exports", "GOT Client Export", unslid(info.got_client_exports_array_addr), info.got_client_exports_array_count)
                    .linked("got_client_exports_array_addr", "got_client_exports_array_count"),
            )?;
            t.push::<DyldCachePatchableLocationV3>(
                Table::new("GOT Locations", "GOT Location", unslid(info.got_location_array_addr), info.got_location_array_count)
                    .linked("got_location_array_addr", "got_location_array_count"),
            )?;
        }
    }
    Ok(tables)
}

fn unslid(address: u64) -> Address {
    Address::UnslidAbsolute64(address)
}

/// The image table is parallel to the cache's image list.
fn check_image_count(count: u64, images_count: u64) -> Result<()> {
    if images_count != 0 && count != images_count {
        return Err(Error::MismatchedTables {
            field: "patch_table_array_count",
            expected: images_count,
            actual: count,
        });
    }
    Ok(())
}

/// Collects the tables referenced from one patch info header.
struct Tables<'d, 'a, S: ?Sized> {
    decoder: &'d Decoder<'a, S>,
    owner: &'d mut Block,
    out: &'d mut Vec<Block>,
}

impl<S: Source + ?Sized> Tables<'_, '_, S> {
    fn push<R: Record>(&mut self, table: Table<'_>) -> Result<()> {
        if let Some(array) = self.decoder.array::<R>(self.owner, table)? {
            self.out.push(array.block);
        }
        Ok(())
    }

    fn names(&mut self, address: u64, size: u64) {
        if let Some(names) = self.decoder.blob(
            self.owner,
            "Patch Export Names",
            unslid(address),
            size,
            ("patch_export_names_addr", "patch_export_names_size"),
        ) {
            self.out.push(names);
        }
    }

    fn v2(&mut self, info: &DyldCachePatchInfoV2, images_count: u64) -> Result<()> {
        check_image_count(info.patch_table_array_count, images_count)?;
        self.push::<DyldCacheImagePatchesV2>(
            Table::new("Patch Image Table", "Image Patches", unslid(info.patch_table_array_addr), info.patch_table_array_count)
                .linked("patch_table_array_addr", "patch_table_array_count"),
        )?;
        self.push::<DyldCacheImageExportV2>(
            Table::new("Patch Image Exports", "Image Export", unslid(info.patch_image_exports_array_addr), info.patch_image_exports_array_count)
                .linked("patch_image_exports_array_addr", "patch_image_exports_array_count"),
        )?;
        self.push::<DyldCacheImageClientsV2>(
            Table::new("Patch Clients", "Client", unslid(info.patch_clients_array_addr), info.patch_clients_array_count)
                .linked("patch_clients_array_addr", "patch_clients_array_count"),
        )?;
        self.push::<DyldCachePatchableExportV2>(
            Table::new("Patch Client Exports", "Client Export", unslid(info.patch_client_exports_array_addr), info.patch_client_exports_array_count)
                .linked("patch_client_exports_array_addr", "patch_client_exports_array_count"),
        )?;
        self.push::<DyldCachePatchableLocationV2>(
            Table::new("Patch Locations", "Location", unslid(info.patch_location_array_addr), info.patch_location_array_count)
                .linked("patch_location_array_addr", "patch_location_array_count"),
        )?;
        self.names(info.patch_export_names_addr, info.patch_export_names_size);
        Ok(())
    }
}
