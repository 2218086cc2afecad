//! Mach-O binary structures.
//!
//! These structures match the on-disk format of Mach-O files. Every load
//! command layout is a [`record!`](crate::record!), and [`command_layout`]
//! maps a command tag to the layout that describes it.

use super::constants::*;
use crate::record;
use crate::record::{Layout, Record};
use crate::util::c_string;

// =============================================================================
// Header Structures
// =============================================================================

record! {
    /// 64-bit Mach-O header.
    pub struct MachHeader64 {
        magic: u32,
        cputype: u32,
        cpusubtype: u32,
        filetype: u32,
        ncmds: u32,
        sizeofcmds: u32,
        flags: u32,
        reserved: u32,
    }

    /// Generic load command header.
    pub struct LoadCommand {
        cmd: u32,
        cmdsize: u32,
    }
}

impl MachHeader64 {
    /// Size of the header in bytes.
    pub const SIZE: usize = 32;

    /// Returns true if this is a valid 64-bit Mach-O header.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == MH_MAGIC_64
    }

    /// Returns the architecture as a string.
    pub fn arch_name(&self) -> &'static str {
        match self.cputype {
            CPU_TYPE_ARM64 if self.cpusubtype & 0xFF == CPU_SUBTYPE_ARM64E => "arm64e",
            CPU_TYPE_ARM64 => "arm64",
            CPU_TYPE_ARM64_32 => "arm64_32",
            CPU_TYPE_X86_64 if self.cpusubtype & 0xFF == CPU_SUBTYPE_X86_64_H => "x86_64h",
            CPU_TYPE_X86_64 => "x86_64",
            _ => "unknown",
        }
    }
}

impl LoadCommand {
    /// Size of the load command header.
    pub const SIZE: usize = 8;
}

// =============================================================================
// Segments and Sections
// =============================================================================

record! {
    /// 32-bit segment command.
    pub struct SegmentCommand {
        cmd: u32,
        cmdsize: u32,
        segname: [u8; 16] => Ascii,
        vmaddr: u32,
        vmsize: u32,
        fileoff: u32,
        filesize: u32,
        maxprot: u32,
        initprot: u32,
        nsects: u32,
        flags: u32,
    }

    /// 32-bit section header.
    pub struct Section {
        sectname: [u8; 16] => Ascii,
        segname: [u8; 16] => Ascii,
        addr: u32,
        size: u32,
        offset: u32,
        align: u32,
        reloff: u32,
        nreloc: u32,
        flags: u32,
        reserved1: u32,
        reserved2: u32,
    }

    /// 64-bit segment command.
    pub struct SegmentCommand64 {
        cmd: u32,
        cmdsize: u32,
        segname: [u8; 16] => Ascii,
        vmaddr: u64,
        vmsize: u64,
        fileoff: u64,
        filesize: u64,
        maxprot: u32,
        initprot: u32,
        nsects: u32,
        flags: u32,
    }

    /// 64-bit section header.
    pub struct Section64 {
        sectname: [u8; 16] => Ascii,
        segname: [u8; 16] => Ascii,
        addr: u64,
        size: u64,
        offset: u32,
        align: u32,
        reloff: u32,
        nreloc: u32,
        flags: u32,
        reserved1: u32,
        reserved2: u32,
        reserved3: u32,
    }
}

impl SegmentCommand64 {
    /// Size of the segment command (without sections).
    pub const SIZE: usize = 72;

    /// Returns the segment name as a string.
    pub fn name(&self) -> String {
        c_string(&self.segname)
    }
}

impl Section64 {
    /// Returns the section name as a string.
    pub fn name(&self) -> String {
        c_string(&self.sectname)
    }

    /// Zero-fill sections occupy memory but no file bytes.
    pub fn is_zerofill(&self) -> bool {
        matches!(
            self.flags & SECTION_TYPE,
            S_ZEROFILL | S_GB_ZEROFILL | S_THREAD_LOCAL_ZEROFILL
        )
    }
}

// =============================================================================
// Load Commands
// =============================================================================

record! {
    pub struct SymtabCommand {
        cmd: u32,
        cmdsize: u32,
        symoff: u32,
        nsyms: u32,
        stroff: u32,
        strsize: u32,
    }

    pub struct SymsegCommand {
        cmd: u32,
        cmdsize: u32,
        offset: u32,
        size: u32,
    }

    /// Thread state commands; only the first flavor is laid out.
    pub struct ThreadCommand {
        cmd: u32,
        cmdsize: u32,
        flavor: u32,
        count: u32,
    }

    pub struct FvmlibCommand {
        cmd: u32,
        cmdsize: u32,
        name_offset: u32,
        minor_version: u32,
        header_addr: u32,
    }

    pub struct FvmfileCommand {
        cmd: u32,
        cmdsize: u32,
        name_offset: u32,
        header_addr: u32,
    }

    pub struct DysymtabCommand {
        cmd: u32,
        cmdsize: u32,
        ilocalsym: u32,
        nlocalsym: u32,
        iextdefsym: u32,
        nextdefsym: u32,
        iundefsym: u32,
        nundefsym: u32,
        tocoff: u32,
        ntoc: u32,
        modtaboff: u32,
        nmodtab: u32,
        extrefsymoff: u32,
        nextrefsyms: u32,
        indirectsymoff: u32,
        nindirectsyms: u32,
        extreloff: u32,
        nextrel: u32,
        locreloff: u32,
        nlocrel: u32,
    }

    pub struct DylibCommand {
        cmd: u32,
        cmdsize: u32,
        name_offset: u32,
        timestamp: u32,
        current_version: u32,
        compatibility_version: u32,
    }

    /// Dylinker, sub-framework, sub-umbrella, sub-client and sub-library
    /// commands: a single string.
    pub struct StringCommand {
        cmd: u32,
        cmdsize: u32,
        name_offset: u32,
    }

    pub struct PreboundDylibCommand {
        cmd: u32,
        cmdsize: u32,
        name_offset: u32,
        nmodules: u32,
        linked_modules_offset: u32,
    }

    pub struct RoutinesCommand {
        cmd: u32,
        cmdsize: u32,
        init_address: u32,
        init_module: u32,
        reserved1: u32,
        reserved2: u32,
        reserved3: u32,
        reserved4: u32,
        reserved5: u32,
        reserved6: u32,
    }

    pub struct RoutinesCommand64 {
        cmd: u32,
        cmdsize: u32,
        init_address: u64,
        init_module: u64,
        reserved1: u64,
        reserved2: u64,
        reserved3: u64,
        reserved4: u64,
        reserved5: u64,
        reserved6: u64,
    }

    pub struct TwolevelHintsCommand {
        cmd: u32,
        cmdsize: u32,
        offset: u32,
        nhints: u32,
    }

    pub struct PrebindCksumCommand {
        cmd: u32,
        cmdsize: u32,
        cksum: u32,
    }

    pub struct UuidCommand {
        cmd: u32,
        cmdsize: u32,
        uuid: [u8; 16] => Uuid,
    }

    pub struct RpathCommand {
        cmd: u32,
        cmdsize: u32,
        path_offset: u32,
    }

    /// Any command pointing at one blob in `__LINKEDIT`.
    pub struct LinkeditDataCommand {
        cmd: u32,
        cmdsize: u32,
        dataoff: u32,
        datasize: u32,
    }

    pub struct EncryptionInfoCommand {
        cmd: u32,
        cmdsize: u32,
        cryptoff: u32,
        cryptsize: u32,
        cryptid: u32,
    }

    pub struct EncryptionInfoCommand64 {
        cmd: u32,
        cmdsize: u32,
        cryptoff: u32,
        cryptsize: u32,
        cryptid: u32,
        pad: u32,
    }

    pub struct DyldInfoCommand {
        cmd: u32,
        cmdsize: u32,
        rebase_off: u32,
        rebase_size: u32,
        bind_off: u32,
        bind_size: u32,
        weak_bind_off: u32,
        weak_bind_size: u32,
        lazy_bind_off: u32,
        lazy_bind_size: u32,
        export_off: u32,
        export_size: u32,
    }

    pub struct VersionMinCommand {
        cmd: u32,
        cmdsize: u32,
        version: u32,
        sdk: u32,
    }

    pub struct EntryPointCommand {
        cmd: u32,
        cmdsize: u32,
        entryoff: u64,
        stacksize: u64,
    }

    pub struct SourceVersionCommand {
        cmd: u32,
        cmdsize: u32,
        version: u64,
    }

    pub struct LinkerOptionCommand {
        cmd: u32,
        cmdsize: u32,
        count: u32,
    }

    pub struct NoteCommand {
        cmd: u32,
        cmdsize: u32,
        data_owner: [u8; 16] => Ascii,
        offset: u64,
        size: u64,
    }

    pub struct BuildVersionCommand {
        cmd: u32,
        cmdsize: u32,
        platform: u32,
        minos: u32,
        sdk: u32,
        ntools: u32,
    }

    pub struct BuildToolVersion {
        tool: u32,
        version: u32,
    }

    pub struct FilesetEntryCommand {
        cmd: u32,
        cmdsize: u32,
        vmaddr: u64,
        fileoff: u64,
        entry_id_offset: u32,
        reserved: u32,
    }

    pub struct TargetTripleCommand {
        cmd: u32,
        cmdsize: u32,
        triple_offset: u32,
    }
}

// =============================================================================
// Link-edit Records
// =============================================================================

record! {
    /// 64-bit symbol table entry.
    pub struct Nlist64 {
        n_strx: u32,
        n_type: u8,
        n_sect: u8,
        n_desc: u16,
        n_value: u64,
    }

    pub struct RelocationInfo {
        r_address: u32,
        r_info: u32,
    }

    pub struct DylibModule64 {
        module_name: u32,
        iextdefsym: u32,
        nextdefsym: u32,
        irefsym: u32,
        nrefsym: u32,
        ilocalsym: u32,
        nlocalsym: u32,
        iextrel: u32,
        nextrel: u32,
        iinit_iterm: u32,
        ninit_nterm: u32,
        objc_module_info_size: u32,
        objc_module_info_addr: u64,
    }

    pub struct DylibTableOfContents {
        symbol_index: u32,
        module_index: u32,
    }

    /// Entry of the indirect symbol or external reference tables.
    pub struct SymbolIndex {
        index: u32,
    }

    pub struct DataInCodeEntry {
        offset: u32,
        length: u16,
        kind: u16,
    }

    pub struct TwolevelHint {
        bits: u32,
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// How to lay out one kind of load command.
#[derive(Debug, Clone, Copy)]
pub struct CommandLayout {
    /// Field table of the command record
    pub layout: Layout,
    /// Field holding the offset of an inline string, if the command has one
    pub string_field: Option<&'static str>,
}

impl CommandLayout {
    const fn plain(layout: Layout) -> Self {
        Self {
            layout,
            string_field: None,
        }
    }

    const fn with_string(layout: Layout, field: &'static str) -> Self {
        Self {
            layout,
            string_field: Some(field),
        }
    }
}

/// Returns the layout of the load command `cmd`, or `None` if the tag is
/// not known.
pub fn command_layout(cmd: u32) -> Option<CommandLayout> {
    let layout = match cmd {
        LC_SEGMENT => CommandLayout::plain(SegmentCommand::FIELDS),
        LC_SEGMENT_64 => CommandLayout::plain(SegmentCommand64::FIELDS),
        LC_SYMTAB => CommandLayout::plain(SymtabCommand::FIELDS),
        LC_SYMSEG => CommandLayout::plain(SymsegCommand::FIELDS),
        LC_THREAD | LC_UNIXTHREAD => CommandLayout::plain(ThreadCommand::FIELDS),
        LC_LOADFVMLIB | LC_IDFVMLIB => CommandLayout::with_string(FvmlibCommand::FIELDS, "name_offset"),
        LC_IDENT | LC_PREPAGE => CommandLayout::plain(LoadCommand::FIELDS),
        LC_FVMFILE => CommandLayout::with_string(FvmfileCommand::FIELDS, "name_offset"),
        LC_DYSYMTAB => CommandLayout::plain(DysymtabCommand::FIELDS),
        LC_LOAD_DYLIB | LC_ID_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LAZY_LOAD_DYLIB
        | LC_LOAD_UPWARD_DYLIB => CommandLayout::with_string(DylibCommand::FIELDS, "name_offset"),
        LC_LOAD_DYLINKER | LC_ID_DYLINKER | LC_DYLD_ENVIRONMENT | LC_SUB_FRAMEWORK
        | LC_SUB_UMBRELLA | LC_SUB_CLIENT | LC_SUB_LIBRARY => {
            CommandLayout::with_string(StringCommand::FIELDS, "name_offset")
        }
        LC_PREBOUND_DYLIB => CommandLayout::with_string(PreboundDylibCommand::FIELDS, "name_offset"),
        LC_ROUTINES => CommandLayout::plain(RoutinesCommand::FIELDS),
        LC_ROUTINES_64 => CommandLayout::plain(RoutinesCommand64::FIELDS),
        LC_TWOLEVEL_HINTS => CommandLayout::plain(TwolevelHintsCommand::FIELDS),
        LC_PREBIND_CKSUM => CommandLayout::plain(PrebindCksumCommand::FIELDS),
        LC_UUID => CommandLayout::plain(UuidCommand::FIELDS),
        LC_RPATH => CommandLayout::with_string(RpathCommand::FIELDS, "path_offset"),
        LC_CODE_SIGNATURE
        | LC_SEGMENT_SPLIT_INFO
        | LC_FUNCTION_STARTS
        | LC_DATA_IN_CODE
        | LC_DYLIB_CODE_SIGN_DRS
        | LC_LINKER_OPTIMIZATION_HINT
        | LC_DYLD_EXPORTS_TRIE
        | LC_DYLD_CHAINED_FIXUPS
        | LC_ATOM_INFO
        | LC_FUNCTION_VARIANTS
        | LC_FUNCTION_VARIANT_FIXUPS => CommandLayout::plain(LinkeditDataCommand::FIELDS),
        LC_ENCRYPTION_INFO => CommandLayout::plain(EncryptionInfoCommand::FIELDS),
        LC_ENCRYPTION_INFO_64 => CommandLayout::plain(EncryptionInfoCommand64::FIELDS),
        LC_DYLD_INFO | LC_DYLD_INFO_ONLY => CommandLayout::plain(DyldInfoCommand::FIELDS),
        LC_VERSION_MIN_MACOSX
        | LC_VERSION_MIN_IPHONEOS
        | LC_VERSION_MIN_TVOS
        | LC_VERSION_MIN_WATCHOS => CommandLayout::plain(VersionMinCommand::FIELDS),
        LC_MAIN => CommandLayout::plain(EntryPointCommand::FIELDS),
        LC_SOURCE_VERSION => CommandLayout::plain(SourceVersionCommand::FIELDS),
        LC_LINKER_OPTION => CommandLayout::plain(LinkerOptionCommand::FIELDS),
        LC_NOTE => CommandLayout::plain(NoteCommand::FIELDS),
        LC_BUILD_VERSION => CommandLayout::plain(BuildVersionCommand::FIELDS),
        LC_FILESET_ENTRY => CommandLayout::with_string(FilesetEntryCommand::FIELDS, "entry_id_offset"),
        LC_TARGET_TRIPLE => CommandLayout::with_string(TargetTripleCommand::FIELDS, "triple_offset"),
        _ => return None,
    };
    Some(layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(MachHeader64::FIELDS.size, MachHeader64::SIZE);
        assert_eq!(SegmentCommand::FIELDS.size, 56);
        assert_eq!(Section::FIELDS.size, 68);
        assert_eq!(SegmentCommand64::FIELDS.size, SegmentCommand64::SIZE);
        assert_eq!(Section64::FIELDS.size, 80);
        assert_eq!(SymtabCommand::FIELDS.size, 24);
        assert_eq!(DysymtabCommand::FIELDS.size, 80);
        assert_eq!(DylibCommand::FIELDS.size, 24);
        assert_eq!(RoutinesCommand::FIELDS.size, 40);
        assert_eq!(RoutinesCommand64::FIELDS.size, 72);
        assert_eq!(DyldInfoCommand::FIELDS.size, 48);
        assert_eq!(EntryPointCommand::FIELDS.size, 24);
        assert_eq!(NoteCommand::FIELDS.size, 40);
        assert_eq!(FilesetEntryCommand::FIELDS.size, 32);
        assert_eq!(Nlist64::FIELDS.size, 16);
        assert_eq!(DylibModule64::FIELDS.size, 56);
        assert_eq!(DataInCodeEntry::FIELDS.size, 8);
    }

    #[test]
    fn test_dispatch() {
        let dylib = command_layout(LC_LOAD_WEAK_DYLIB).unwrap();
        assert_eq!(dylib.layout.name, "DylibCommand");
        assert_eq!(dylib.string_field, Some("name_offset"));
        assert_eq!(command_layout(LC_FUNCTION_VARIANTS).unwrap().layout.size, 16);
        assert_eq!(command_layout(LC_TARGET_TRIPLE).unwrap().string_field, Some("triple_offset"));
        assert!(command_layout(0x7f).is_none());
    }

    #[test]
    fn test_zerofill_sections() {
        let mut bytes = [0u8; 80];
        bytes[..6].copy_from_slice(b"__bss\0");
        bytes[64..68].copy_from_slice(&S_ZEROFILL.to_le_bytes());
        let section: Section64 = zerocopy::FromBytes::read_from_bytes(&bytes[..]).unwrap();
        assert!(section.is_zerofill());
        assert_eq!(section.name(), "__bss");
    }
}
