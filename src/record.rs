//! Fixed-layout records and their field tables.
//!
//! Every on-disk structure the decoder understands is declared with
//! [`record!`], which produces both the zero-copy struct and a static
//! [`Layout`] describing each field's name, offset, width and formatter.
//! Decoding a record into a block is then a table walk ([`emit_record`])
//! rather than hand-written code per structure.

use crate::tree::{Block, Value};
use crate::util::{read_uint_le, trimmed_ascii, uuid_to_string};

/// How a field's bytes are rendered into a value's text.
#[derive(Debug, Clone, Copy)]
pub enum Format {
    /// Unsigned little-endian integer printed as hex.
    Hex,
    /// Fixed-width character array, trailing NULs removed.
    Ascii,
    /// 16-byte UUID.
    Uuid,
    /// Anything else: a byte dump.
    Raw,
    /// An embedded record whose fields are inlined into the parent.
    Flatten(&'static [Field]),
}

/// One entry of a record's field table.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    /// Field name as declared
    pub name: &'static str,
    /// Byte offset within the record
    pub offset: usize,
    /// Width in bytes
    pub width: usize,
    /// How the bytes are rendered
    pub format: Format,
}

/// The field table of a record type.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    /// Type name, for diagnostics
    pub name: &'static str,
    /// Size of the record in bytes
    pub size: usize,
    /// Fields in declaration order
    pub fields: &'static [Field],
}

impl Layout {
    /// Returns the field with the given name.
    pub fn field(&self, name: &str) -> Option<&'static Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A fixed-layout on-disk structure with a known field table.
pub trait Record: zerocopy::FromBytes + zerocopy::KnownLayout + zerocopy::Immutable + Copy {
    /// The record's field table.
    const FIELDS: Layout;
}

/// Default formatter for a field type. Records implement it as `Flatten`.
pub trait FieldType {
    const FORMAT: Format;
}

macro_rules! hex_field {
    ($($ty:ty),*) => {
        $(impl FieldType for $ty {
            const FORMAT: Format = Format::Hex;
        })*
    };
}

hex_field!(u8, u16, u32, u64, i32, i64);

impl<const N: usize> FieldType for [u8; N] {
    const FORMAT: Format = Format::Raw;
}

impl<const N: usize> FieldType for [u32; N] {
    const FORMAT: Format = Format::Raw;
}

impl<const N: usize> FieldType for [u64; N] {
    const FORMAT: Format = Format::Raw;
}

/// Declares a `#[repr(C)]` zero-copy record together with its field table.
///
/// A field may override its type's default formatter with `=> Format`:
///
/// ```ignore
/// record! {
///     /// A cache mapping.
///     pub struct MappingInfo {
///         address: u64,
///         uuid: [u8; 16] => Uuid,
///     }
/// }
/// ```
#[macro_export]
macro_rules! record {
    ($(
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $(#[$fmeta:meta])* $field:ident : $ty:ty $(=> $fmt:ident)? ),* $(,)?
        }
    )*) => {$(
        $(#[$meta])*
        #[allow(missing_docs)] // Field names follow the on-disk structure
        #[derive(Debug, Clone, Copy, zerocopy::FromBytes, zerocopy::KnownLayout, zerocopy::Immutable)]
        #[repr(C)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $ty, )*
        }

        impl $crate::record::Record for $name {
            const FIELDS: $crate::record::Layout = $crate::record::Layout {
                name: stringify!($name),
                size: ::std::mem::size_of::<$name>(),
                fields: &[$(
                    $crate::record::Field {
                        name: stringify!($field),
                        offset: ::std::mem::offset_of!($name, $field),
                        width: ::std::mem::size_of::<$ty>(),
                        format: $crate::record!(@format $ty $(, $fmt)?),
                    },
                )*],
            };
        }

        impl $crate::record::FieldType for $name {
            const FORMAT: $crate::record::Format = $crate::record::Format::Flatten(
                <$name as $crate::record::Record>::FIELDS.fields,
            );
        }
    )*};
    (@format $ty:ty) => {
        <$ty as $crate::record::FieldType>::FORMAT
    };
    (@format $ty:ty, $fmt:ident) => {
        $crate::record::Format::$fmt
    };
}

// =============================================================================
// Emitting
// =============================================================================

/// Renders one field's bytes.
pub fn format_field(format: Format, bytes: &[u8]) -> String {
    match format {
        Format::Hex => match read_uint_le(bytes) {
            Some(v) => format!("{:#x}", v),
            None => format_raw(bytes),
        },
        Format::Ascii => trimmed_ascii(bytes),
        Format::Uuid => uuid_to_string(bytes),
        Format::Raw | Format::Flatten(_) => format_raw(bytes),
    }
}

fn format_raw(bytes: &[u8]) -> String {
    const SHOWN: usize = 32;
    let mut out = String::with_capacity(bytes.len().min(SHOWN) * 2 + 3);
    for byte in bytes.iter().take(SHOWN) {
        out.push_str(&format!("{:02x}", byte));
    }
    if bytes.len() > SHOWN {
        out.push_str("...");
    }
    out
}

/// Appends one value per field of `layout` to `block`.
///
/// `bytes` holds the record's raw contents. Fields that start at or beyond
/// `limit` are left out, which is how truncated versioned headers only
/// show the fields they actually have.
pub fn emit_record(block: &mut Block, layout: &Layout, bytes: &[u8], limit: usize) {
    emit_fields(block, layout.fields, 0, bytes, limit);
}

fn emit_fields(block: &mut Block, fields: &[Field], base: usize, bytes: &[u8], limit: usize) {
    for field in fields {
        let start = base + field.offset;
        let end = start + field.width;
        if end > limit || end > bytes.len() {
            continue;
        }
        match field.format {
            Format::Flatten(inner) => emit_fields(block, inner, start, bytes, limit),
            format => block.push_value(Value::new(
                field.name,
                start as u64,
                field.width as u64,
                format_field(format, &bytes[start..end]),
            )),
        }
    }
}

/// Builds a block named `name` at `address` holding the fields of an `R`
/// read from `bytes`.
///
/// The block is sized to the record, or to `bytes.len()` if that is smaller.
pub fn record_block<R: Record>(name: impl Into<String>, address: u64, bytes: &[u8]) -> Block {
    let size = R::FIELDS.size.min(bytes.len());
    let mut block = Block::new(name, address, size as u64);
    emit_record(&mut block, &R::FIELDS, bytes, size);
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::record! {
        /// Test-only record with an embedded sub-record.
        pub struct Inner {
            a: u32,
            b: u32,
        }

        pub struct Outer {
            name: [u8; 8] => Ascii,
            inner: Inner,
            id: [u8; 16] => Uuid,
            tail: u64,
        }
    }

    fn outer_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"__TEXT\0\0");
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(&0x40u32.to_le_bytes());
        bytes.extend((0u8..16).collect::<Vec<_>>());
        bytes.extend_from_slice(&0x1234u64.to_le_bytes());
        bytes
    }

    #[test]
    fn test_layout_table() {
        let layout = Outer::FIELDS;
        assert_eq!(layout.name, "Outer");
        assert_eq!(layout.size, 40);
        let inner = layout.field("inner").unwrap();
        assert_eq!(inner.offset, 8);
        assert_eq!(inner.width, 8);
        assert!(matches!(inner.format, Format::Flatten(f) if f.len() == 2));
        assert_eq!(layout.field("tail").unwrap().offset, 32);
    }

    /// Reads a record through the trait bound alone, as the decoders do.
    fn first_field<R: Record>(bytes: &[u8]) -> (usize, &'static str) {
        let Ok((record, _)) = R::read_from_prefix(bytes) else {
            panic!("short record");
        };
        assert_eq!(std::mem::size_of_val(&record), R::FIELDS.size);
        (R::FIELDS.size, R::FIELDS.fields[0].name)
    }

    #[test]
    fn test_field_table_through_generic_bound() {
        assert_eq!(first_field::<Outer>(&outer_bytes()), (40, "name"));
        assert_eq!(first_field::<Inner>(&outer_bytes()), (8, "a"));
    }

    #[test]
    fn test_emit_flattens_nested_records() {
        let block = record_block::<Outer>("Outer", 0x1000, &outer_bytes());
        let names: Vec<_> = block.values.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["name", "a", "b", "id", "tail"]);
        assert_eq!(block.size, 40);
        assert_eq!(block.value("name").unwrap().text, "__TEXT");
        assert_eq!(block.value("b").unwrap().offset, 12);
        assert_eq!(block.value("b").unwrap().text, "0x40");
        assert_eq!(
            block.value("id").unwrap().text,
            "00010203-0405-0607-0809-0A0B0C0D0E0F"
        );
        assert_eq!(block.value("tail").unwrap().text, "0x1234");
    }

    #[test]
    fn test_emit_respects_limit() {
        let bytes = outer_bytes();
        let block = record_block::<Outer>("Outer", 0, &bytes[..16]);
        assert_eq!(block.size, 16);
        let names: Vec<_> = block.values.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["name", "a", "b"]);
    }

    #[test]
    fn test_format_raw_truncates() {
        assert_eq!(format_field(Format::Raw, &[0xde, 0xad]), "dead");
        let long = [0u8; 40];
        assert!(format_field(Format::Raw, &long).ends_with("..."));
        assert_eq!(format_field(Format::Hex, &[1, 2, 3]), "010203");
    }
}
