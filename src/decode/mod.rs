//! Structural decoding of caches and Mach-O images into a block tree.
//!
//! Every decoder in this module follows the same pattern: read a record,
//! emit its fields as values, then follow each `(offset, count)` or
//! `(offset, size)` pair it holds. A pair whose offset is the sentinel, or
//! whose count is zero, produces nothing at all. Otherwise it produces a
//! block sized to the whole table and a link from both fields to it.
//!
//! Entry points are [`decode_cache`] for a cache source and
//! [`decode_macho`] for a standalone Mach-O file. Both return a tree that
//! has already passed [`check`](crate::tree::check).

mod accelerator;
mod cache;
mod macho;
mod patch;
mod slide;

pub use cache::decode_cache;
pub use macho::decode_macho;

use tracing::{debug, trace};

use crate::address::Address;
use crate::error::{Error, Result};
use crate::record::{emit_record, record_block, Record};
use crate::source::{Reader, Source};
use crate::tree::{Block, GIVES_AMOUNT, GIVES_SIZE, POINTS_TO};

/// Tunables for a decode run.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Tables with more elements than this are sized but their elements
    /// are not decoded one by one.
    pub element_threshold: u64,
    /// Lay out the Mach-O image of every dylib in the cache.
    pub decode_images: bool,
    /// Decode the `.symbols` companion file when the source opened one.
    pub include_symbols_file: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            element_threshold: 4096,
            decode_images: true,
            include_symbols_file: true,
        }
    }
}

/// A table of fixed-size records and the fields that describe it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Table<'n> {
    /// Name of the block covering the whole table
    pub name: &'n str,
    /// Element name prefix, suffixed with the index
    pub element: &'n str,
    pub offset_field: &'n str,
    pub count_field: &'n str,
    /// Label of the link from the count field
    pub count_label: &'static str,
    pub address: Address,
    pub count: u64,
}

impl<'n> Table<'n> {
    pub fn new(name: &'n str, element: &'n str, address: Address, count: u64) -> Self {
        Self {
            name,
            element,
            offset_field: "",
            count_field: "",
            count_label: GIVES_AMOUNT,
            address,
            count,
        }
    }

    /// Names the owner's fields that locate and count this table.
    pub fn linked(mut self, offset_field: &'n str, count_field: &'n str) -> Self {
        self.offset_field = offset_field;
        self.count_field = count_field;
        self
    }

    /// The count field holds a byte size rather than an element count.
    pub fn counted_in_bytes(mut self) -> Self {
        self.count_label = GIVES_SIZE;
        self
    }
}

/// A decoded table: its block and, when elements were decoded, the records.
#[derive(Debug)]
pub(crate) struct Array<R> {
    pub block: Block,
    pub records: Vec<R>,
}

/// Location `offset` bytes into a structure at `base`, where an offset of
/// zero means the referenced table is absent.
pub(crate) fn within(base: Address, offset: u64) -> Address {
    if offset == 0 {
        Address::file64(0)
    } else {
        base.advance(offset)
    }
}

/// Reading context shared by the cache and Mach-O decoders.
pub(crate) struct Decoder<'a, S: ?Sized> {
    pub source: &'a S,
    pub slide: u64,
    pub options: &'a DecodeOptions,
}

impl<'a, S: Source + ?Sized> Decoder<'a, S> {
    pub fn new(source: &'a S, slide: u64, options: &'a DecodeOptions) -> Self {
        Self {
            source,
            slide,
            options,
        }
    }

    pub fn reader(&self, address: Address) -> Result<Reader<'a>> {
        address.reader(self.source, 0, self.slide)
    }

    /// Reads one `R` at `address`.
    pub fn read<R: Record>(&self, address: Address) -> Result<R> {
        self.reader(address)?.read()
    }

    /// Reads an `R` at `address` and emits its fields onto `block`, leaving
    /// out any field that does not fit in the block.
    pub fn annotate<R: Record>(&self, block: &mut Block, address: Address) -> Result<R> {
        let mut reader = self.reader(address)?;
        let bytes = reader.bytes(R::FIELDS.size)?;
        let record = R::read_from_bytes(bytes)
            .map_err(|_| Error::buffer_too_small(R::FIELDS.size, bytes.len()))?;
        let limit = (block.size as usize).min(R::FIELDS.size);
        emit_record(block, &R::FIELDS, bytes, limit);
        Ok(record)
    }

    /// Lays out a table of `R` described by `table`, linking the owner's
    /// fields to it.
    ///
    /// Returns `None` for an absent or empty table.
    pub fn array<R: Record>(&self, owner: &mut Block, table: Table<'_>) -> Result<Option<Array<R>>> {
        if table.address.is_invalid() || table.count == 0 {
            trace!(table = table.name, "table absent");
            return Ok(None);
        }
        let element_size = R::FIELDS.size as u64;
        let size = table.count.checked_mul(element_size).ok_or_else(|| {
            Error::parse(
                table.address.calculate(self.slide),
                format!("{} of {} elements overflows", table.name, table.count),
            )
        })?;
        let address = table.address.calculate(self.slide);
        if !table.offset_field.is_empty() {
            owner.link(table.offset_field, POINTS_TO, address);
        }
        if !table.count_field.is_empty() {
            owner.link(table.count_field, table.count_label, address);
        }

        let mut block = Block::new(table.name, address, size);
        if table.count > self.options.element_threshold {
            debug!(
                table = table.name,
                count = table.count,
                threshold = self.options.element_threshold,
                "table above element threshold, not decoding elements"
            );
            return Ok(Some(Array {
                block,
                records: Vec::new(),
            }));
        }

        let mut reader = self.reader(table.address)?;
        let mut records = Vec::with_capacity(table.count as usize);
        for index in 0..table.count {
            let bytes = reader.bytes(R::FIELDS.size)?;
            let record = R::read_from_bytes(bytes)
                .map_err(|_| Error::buffer_too_small(R::FIELDS.size, bytes.len()))?;
            block.children.push(record_block::<R>(
                format!("{} {}", table.element, index),
                address + index * element_size,
                bytes,
            ));
            records.push(record);
        }
        block.fix_offsets();
        Ok(Some(Array { block, records }))
    }

    /// Lays out an opaque region of `size` bytes, linking the owner's
    /// fields to it.
    ///
    /// Returns `None` for an absent or empty region.
    pub fn blob(
        &self,
        owner: &mut Block,
        name: &str,
        address: Address,
        size: u64,
        fields: (&str, &str),
    ) -> Option<Block> {
        if address.is_invalid() || size == 0 {
            trace!(blob = name, "region absent");
            return None;
        }
        let target = address.calculate(self.slide);
        owner.link(fields.0, POINTS_TO, target);
        owner.link(fields.1, GIVES_SIZE, target);
        Some(Block::new(name, target, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dyld::DyldCacheMappingInfo;
    use crate::tree::Value;

    struct Flat(Vec<u8>);

    impl Source for Flat {
        fn reader_at_file_offset(&self, offset: u64) -> Result<Reader<'_>> {
            Reader::new(&self.0, 0).at(offset)
        }

        fn reader_at_address(&self, address: u64) -> Result<Reader<'_>> {
            self.reader_at_file_offset(address)
        }

        fn close(&mut self) {}
    }

    fn owner() -> Block {
        let mut block = Block::new("Header", 0, 0x10);
        block.push_value(Value::new("table_offset", 0, 4, "0x10"));
        block.push_value(Value::new("table_count", 4, 4, "0x2"));
        block
    }

    fn mappings() -> Flat {
        let mut data = vec![0u8; 0x10];
        for address in [0x1000u64, 0x2000] {
            data.extend_from_slice(&address.to_le_bytes());
            data.extend_from_slice(&0x1000u64.to_le_bytes());
            data.extend_from_slice(&0u64.to_le_bytes());
            data.extend_from_slice(&[0u8; 8]);
        }
        Flat(data)
    }

    #[test]
    fn test_array_decodes_elements_and_links() {
        let source = mappings();
        let options = DecodeOptions::default();
        let decoder = Decoder::new(&source, 0, &options);
        let mut header = owner();
        let table = Table::new("Mappings", "Mapping", Address::file32(0x10), 2)
            .linked("table_offset", "table_count");
        let array = decoder
            .array::<DyldCacheMappingInfo>(&mut header, table)
            .unwrap()
            .unwrap();

        assert_eq!(array.block.size, 64);
        assert_eq!(array.records[1].address, 0x2000);
        assert_eq!(array.block.children[1].name, "Mapping 1");
        assert_eq!(array.block.children[1].offset, 32);
        assert_eq!(header.value("table_offset").unwrap().links[0].target, 0x10);
        assert_eq!(header.value("table_count").unwrap().links[0].label, GIVES_AMOUNT);
    }

    #[test]
    fn test_array_above_threshold_is_only_sized() {
        let source = mappings();
        let options = DecodeOptions {
            element_threshold: 1,
            ..DecodeOptions::default()
        };
        let decoder = Decoder::new(&source, 0, &options);
        let mut header = owner();
        let table = Table::new("Mappings", "Mapping", Address::file32(0x10), 2);
        let array = decoder
            .array::<DyldCacheMappingInfo>(&mut header, table)
            .unwrap()
            .unwrap();
        assert_eq!(array.block.size, 64);
        assert!(array.block.children.is_empty());
        assert!(array.records.is_empty());
    }

    #[test]
    fn test_sentinel_pairs_produce_nothing() {
        let source = mappings();
        let options = DecodeOptions::default();
        let decoder = Decoder::new(&source, 0, &options);
        let mut header = owner();

        let absent = Table::new("Mappings", "Mapping", Address::file32(0), 2)
            .linked("table_offset", "table_count");
        assert!(decoder.array::<DyldCacheMappingInfo>(&mut header, absent).unwrap().is_none());
        let empty = Table::new("Mappings", "Mapping", Address::file32(0x10), 0)
            .linked("table_offset", "table_count");
        assert!(decoder.array::<DyldCacheMappingInfo>(&mut header, empty).unwrap().is_none());
        assert!(decoder
            .blob(&mut header, "Blob", Address::file32(0), 8, ("table_offset", "table_count"))
            .is_none());
        assert_eq!(header.stats().links, 0);
    }

    #[test]
    fn test_within_keeps_zero_as_absent() {
        let base = Address::UnslidAbsolute64(0x4000);
        assert!(within(base, 0).is_invalid());
        assert_eq!(within(base, 0x10).calculate(0), 0x4010);
    }
}
