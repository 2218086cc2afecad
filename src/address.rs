//! Where a referenced structure lives.
//!
//! Cache and Mach-O fields locate other structures in several coordinate
//! systems: offsets into the file (32 or 64 bits wide), unslid virtual
//! addresses as the cache was built, or addresses the decoder worked out
//! itself. [`Address`] records which one a field uses, so the same decoding
//! code runs against file-backed and memory-backed sources.

use crate::error::Result;
use crate::source::{Reader, Source};

/// A location in one of the coordinate systems fields refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    /// 32-bit offset from the start of a file or image.
    FileRelative32 { offset: u32, base: u64 },
    /// 64-bit offset from the start of a file or image.
    FileRelative64 { offset: u64, base: u64 },
    /// A slid address together with the file offset holding its bytes.
    Manual { address: u64, file_offset: u64 },
    /// 32-bit virtual address before sliding.
    UnslidAbsolute32(u32),
    /// 64-bit virtual address before sliding.
    UnslidAbsolute64(u64),
}

impl Address {
    /// Offset relative to the start of the file, resolved once `base` is known.
    pub fn file32(offset: u32) -> Self {
        Address::FileRelative32 { offset, base: 0 }
    }

    /// 64-bit variant of [`Address::file32`].
    pub fn file64(offset: u64) -> Self {
        Address::FileRelative64 { offset, base: 0 }
    }

    /// Sets the base of a file-relative address. Other variants are
    /// returned unchanged.
    pub fn add_base(self, base: u64) -> Self {
        match self {
            Address::FileRelative32 { offset, .. } => Address::FileRelative32 { offset, base },
            Address::FileRelative64 { offset, .. } => Address::FileRelative64 { offset, base },
            other => other,
        }
    }

    /// The address to give a block at this location.
    pub fn calculate(&self, slide: u64) -> u64 {
        match *self {
            Address::FileRelative32 { offset, base } => base.wrapping_add(offset as u64),
            Address::FileRelative64 { offset, base } => base.wrapping_add(offset),
            Address::Manual { address, .. } => address,
            Address::UnslidAbsolute32(address) => (address as u64).wrapping_add(slide),
            Address::UnslidAbsolute64(address) => address.wrapping_add(slide),
        }
    }

    /// Returns a reader `extra` bytes past this location.
    ///
    /// File-relative and manual addresses read in file coordinates; unslid
    /// addresses are slid and read through the source's address space.
    pub fn reader<'s, S>(&self, source: &'s S, extra: u64, slide: u64) -> Result<Reader<'s>>
    where
        S: Source + ?Sized,
    {
        match *self {
            Address::FileRelative32 { offset, .. } => {
                source.reader_at_file_offset(offset as u64 + extra)
            }
            Address::FileRelative64 { offset, .. } => source.reader_at_file_offset(offset + extra),
            Address::Manual { file_offset, .. } => source.reader_at_file_offset(file_offset + extra),
            Address::UnslidAbsolute32(_) | Address::UnslidAbsolute64(_) => {
                source.reader_at_address(self.calculate(slide).wrapping_add(extra))
            }
        }
    }

    /// The same coordinate system, `delta` bytes further on.
    pub fn advance(self, delta: u64) -> Self {
        match self {
            Address::FileRelative32 { offset, base } => Address::FileRelative64 {
                offset: offset as u64 + delta,
                base,
            },
            Address::FileRelative64 { offset, base } => Address::FileRelative64 {
                offset: offset + delta,
                base,
            },
            Address::Manual { address, file_offset } => Address::Manual {
                address: address.wrapping_add(delta),
                file_offset: file_offset + delta,
            },
            Address::UnslidAbsolute32(address) => Address::UnslidAbsolute64(address as u64 + delta),
            Address::UnslidAbsolute64(address) => Address::UnslidAbsolute64(address.wrapping_add(delta)),
        }
    }

    /// Returns true for the "absent" sentinel.
    pub fn is_invalid(&self) -> bool {
        match *self {
            Address::FileRelative32 { offset, .. } => offset == 0,
            Address::FileRelative64 { offset, .. } => offset == 0,
            Address::Manual { address, .. } => address == 0,
            Address::UnslidAbsolute32(address) => address == 0,
            Address::UnslidAbsolute64(address) => address == 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct Bytes {
        data: Vec<u8>,
        base: u64,
    }

    impl Source for Bytes {
        fn reader_at_file_offset(&self, offset: u64) -> Result<Reader<'_>> {
            Reader::new(&self.data, 0).at(offset)
        }

        fn reader_at_address(&self, address: u64) -> Result<Reader<'_>> {
            let offset = address
                .checked_sub(self.base)
                .ok_or(Error::address_not_found(address))?;
            Reader::new(&self.data, self.base).at(offset)
        }

        fn close(&mut self) {}
    }

    fn source() -> Bytes {
        Bytes {
            data: (0u8..64).collect(),
            base: 0x1_0000,
        }
    }

    #[test]
    fn test_calculate() {
        assert_eq!(Address::file32(0x20).add_base(0x1000).calculate(0x55), 0x1020);
        assert_eq!(Address::file64(0x20).add_base(0x1000).calculate(0x55), 0x1020);
        let manual = Address::Manual { address: 0x9000, file_offset: 4 };
        assert_eq!(manual.calculate(0x55), 0x9000);
        assert_eq!(Address::UnslidAbsolute32(0x1000).calculate(0x55), 0x1055);
        assert_eq!(Address::UnslidAbsolute64(0x1000).calculate(0x55), 0x1055);
    }

    #[test]
    fn test_negative_slide_wraps() {
        let slide = 0x1000u64.wrapping_sub(0x3000);
        assert_eq!(Address::UnslidAbsolute64(0x3000).calculate(slide), 0x1000);
    }

    #[test]
    fn test_add_base_only_touches_relative() {
        let unslid = Address::UnslidAbsolute64(0x42);
        assert_eq!(unslid.add_base(0x1000), unslid);
    }

    #[test]
    fn test_readers_pick_coordinate_system() {
        let src = source();
        let mut r = Address::file32(8).reader(&src, 2, 0).unwrap();
        assert_eq!(r.u16().unwrap(), u16::from_le_bytes([10, 11]));

        let mut r = Address::Manual { address: 0xdead, file_offset: 4 }.reader(&src, 0, 0).unwrap();
        assert_eq!(r.bytes(2).unwrap(), &[4, 5]);

        let slide = 0x10;
        let mut r = Address::UnslidAbsolute64(0x1_0000).reader(&src, 1, slide).unwrap();
        assert_eq!(r.bytes(1).unwrap(), &[0x11]);
    }

    #[test]
    fn test_advance_widens_and_keeps_system() {
        let advanced = Address::file32(0x10).add_base(0x1000).advance(8);
        assert_eq!(advanced, Address::FileRelative64 { offset: 0x18, base: 0x1000 });
        assert_eq!(advanced.calculate(0), 0x1018);

        let manual = Address::Manual { address: 0x9000, file_offset: 0x100 }.advance(0x20);
        assert_eq!(manual, Address::Manual { address: 0x9020, file_offset: 0x120 });
        assert_eq!(Address::UnslidAbsolute32(0x100).advance(4).calculate(0x10), 0x114);
    }

    #[test]
    fn test_sentinel() {
        assert!(Address::file32(0).is_invalid());
        assert!(Address::file64(0).add_base(0x1000).is_invalid());
        assert!(Address::UnslidAbsolute64(0).is_invalid());
        assert!(!Address::UnslidAbsolute32(4).is_invalid());
    }
}
