//! Slide info: the tables dyld uses to rebase pointers in data mappings.
//!
//! All five versions start with a `version` word. Versions 1, 2 and 4 locate
//! their tables with offsets from the start of the slide info; versions 3
//! and 5 store the page starts directly after the fixed fields.

use tracing::debug;

use super::{within, Decoder, Table};
use crate::address::Address;
use crate::dyld::*;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::source::Source;
use crate::tree::Block;

/// Decodes the slide info in `blob`, read from `address`.
///
/// The fields go onto `blob`; the returned blocks are the tables they
/// reference.
pub(super) fn decode_slide_info<S: Source + ?Sized>(
    decoder: &Decoder<'_, S>,
    blob: &mut Block,
    address: Address,
) -> Result<Vec<Block>> {
    let version = decoder.reader(address)?.u32()?;
    debug!(version, address = format_args!("{:#x}", blob.address), "decoding slide info");

    let mut tables = Vec::new();
    match version {
        1 => {
            let info: DyldCacheSlideInfo1 = decoder.annotate(blob, address)?;
            let toc = Table::new("TOC", "TOC Entry", within(address, info.toc_offset as u64), info.toc_count as u64)
                .linked("toc_offset", "toc_count");
            push_table::<_, DyldCacheU16Entry>(decoder, blob, toc, &mut tables)?;
            let entries_size = (info.entries_count as u64).saturating_mul(info.entries_size as u64);
            if let Some(entries) = decoder.blob(
                blob,
                "Entries",
                within(address, info.entries_offset as u64),
                entries_size,
                ("entries_offset", "entries_size"),
            ) {
                tables.push(entries);
            }
        }
        2 | 4 => {
            let (starts_offset, starts_count, extras_offset, extras_count) = if version == 2 {
                let info: DyldCacheSlideInfo2 = decoder.annotate(blob, address)?;
                (info.page_starts_offset, info.page_starts_count, info.page_extras_offset, info.page_extras_count)
            } else {
                let info: DyldCacheSlideInfo4 = decoder.annotate(blob, address)?;
                (info.page_starts_offset, info.page_starts_count, info.page_extras_offset, info.page_extras_count)
            };
            let starts = Table::new("Page Starts", "Page Start", within(address, starts_offset as u64), starts_count as u64)
                .linked("page_starts_offset", "page_starts_count");
            push_table::<_, DyldCacheU16Entry>(decoder, blob, starts, &mut tables)?;
            let extras = Table::new("Page Extras", "Page Extra", within(address, extras_offset as u64), extras_count as u64)
                .linked("page_extras_offset", "page_extras_count");
            push_table::<_, DyldCacheU16Entry>(decoder, blob, extras, &mut tables)?;
        }
        3 | 5 => {
            let count = if version == 3 {
                decoder.annotate::<DyldCacheSlideInfo3>(blob, address)?.page_starts_count
            } else {
                decoder.annotate::<DyldCacheSlideInfo5>(blob, address)?.page_starts_count
            };
            // Same size for both versions.
            let inline = address.advance(DyldCacheSlideInfo3::FIELDS.size as u64);
            let starts = Table::new("Page Starts", "Page Start", inline, count as u64)
                .linked("", "page_starts_count");
            push_table::<_, DyldCacheU16Entry>(decoder, blob, starts, &mut tables)?;
        }
        _ => {
            return Err(Error::UnsupportedSlideVersion {
                version,
                address: blob.address,
            })
        }
    }
    Ok(tables)
}

fn push_table<S: Source + ?Sized, R: Record>(
    decoder: &Decoder<'_, S>,
    owner: &mut Block,
    table: Table<'_>,
    out: &mut Vec<Block>,
) -> Result<()> {
    if let Some(array) = decoder.array::<R>(owner, table)? {
        out.push(array.block);
    }
    Ok(())
}
