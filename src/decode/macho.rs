//! Mach-O images: the header, the load commands and the regions they name.
//!
//! Commands are walked twice. The first pass only collects segments, so
//! that the second can turn the file offsets in any command (entry point,
//! link-edit data) into addresses no matter where the segment commands sit
//! in the stream.
//!
//! Images inside a cache live in address space: segments and sections are
//! placed at their slid VM address, and link-edit data (shared by every
//! image of the cache) is only linked to. A standalone file is laid out in
//! file space, so its link-edit tables become blocks too.

use tracing::{debug, info, trace};
use zerocopy::FromBytes;

use super::{DecodeOptions, Decoder, Table};
use crate::address::Address;
use crate::error::{Error, Result};
use crate::macho::*;
use crate::record::{emit_record, record_block, Record};
use crate::source::Source;
use crate::tree::{check, Block, Builder, Value, GIVES_AMOUNT, GIVES_SIZE, POINTS_TO};
use crate::util::{c_string, read_u32_le};

/// Where an image is and how to name its regions.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Image<'n> {
    /// Location of the Mach-O header
    pub header: Address,
    /// Prepended to region names, e.g. `"libobjc.A.dylib "`
    pub prefix: &'n str,
    /// The image is part of a shared cache
    pub in_cache: bool,
}

/// Decodes a standalone Mach-O file into a checked tree.
pub fn decode_macho(file: &MachOFile, options: &DecodeOptions) -> Result<Block> {
    let decoder = Decoder::new(file, 0, options);
    let image = Image {
        header: Address::file64(0),
        prefix: "",
        in_cache: false,
    };
    let mut builder = Builder::new();
    decode_image(&decoder, &image, &mut builder)?;

    let mut root = Block::container(file.name(), 0);
    builder.rebalance(&mut root);
    check(&root)?;
    let stats = root.stats();
    info!(blocks = stats.blocks, values = stats.values, links = stats.links, "decoded Mach-O file");
    Ok(root)
}

/// Decodes one image into `builder`.
pub(crate) fn decode_image<S: Source + ?Sized>(
    decoder: &Decoder<'_, S>,
    image: &Image<'_>,
    builder: &mut Builder,
) -> Result<()> {
    let mut reader = decoder.reader(image.header)?;
    let header_bytes = reader.bytes(MachHeader64::SIZE)?;
    let header = MachHeader64::read_from_bytes(header_bytes)
        .map_err(|_| Error::buffer_too_small(MachHeader64::SIZE, header_bytes.len()))?;
    if !header.is_valid() {
        return Err(Error::InvalidMachoMagic(header.magic));
    }
    let commands = reader.bytes(header.sizeofcmds as usize)?;
    let base = image.header.calculate(decoder.slide);

    let entries = split_commands(commands, header.ncmds)?;
    let segments = collect_segments(commands, &entries);
    let mut header_block = record_block::<MachHeader64>(format!("{}Mach-O Header", image.prefix), base, header_bytes);
    let commands_address = base + MachHeader64::SIZE as u64;

    let mut walker = CommandWalker {
        decoder,
        image,
        space: Space {
            slide: decoder.slide,
            in_cache: image.in_cache,
            segments,
        },
        builder,
    };
    if !commands.is_empty() {
        header_block.link("ncmds", GIVES_AMOUNT, commands_address);
        header_block.link("sizeofcmds", GIVES_SIZE, commands_address);
        let mut area = Block::new(
            format!("{}Load Commands", image.prefix),
            commands_address,
            commands.len() as u64,
        );
        for entry in &entries {
            let block = walker.command(entry, commands, commands_address)?;
            area.children.push(block);
        }
        walker.builder.add(area);
    }
    walker.builder.add(header_block);
    debug!(
        image = image.prefix.trim_end(),
        address = format_args!("{:#x}", base),
        arch = header.arch_name(),
        commands = entries.len(),
        "decoded image"
    );
    Ok(())
}

/// One load command's place in the command area.
#[derive(Debug, Clone, Copy)]
struct CommandEntry {
    offset: usize,
    cmd: u32,
    size: usize,
}

/// Splits the command area into commands, checking every size.
fn split_commands(area: &[u8], ncmds: u32) -> Result<Vec<CommandEntry>> {
    let mut entries = Vec::with_capacity(ncmds as usize);
    let mut offset = 0usize;
    for _ in 0..ncmds {
        let overflow = || Error::LoadCommandOverflow {
            offset: (MachHeader64::SIZE + offset) as u64,
        };
        if offset + LoadCommand::SIZE > area.len() {
            return Err(overflow());
        }
        let cmd = read_u32_le(&area[offset..]);
        let size = read_u32_le(&area[offset + 4..]) as usize;
        if size < LoadCommand::SIZE || size > area.len() - offset {
            return Err(overflow());
        }
        entries.push(CommandEntry { offset, cmd, size });
        offset += size;
    }
    Ok(entries)
}

fn collect_segments(area: &[u8], entries: &[CommandEntry]) -> Vec<SegmentRange> {
    let mut segments = Vec::new();
    for entry in entries {
        let bytes = &area[entry.offset..entry.offset + entry.size];
        match entry.cmd {
            LC_SEGMENT_64 => {
                if let Some(segment) = parse::<SegmentCommand64>(bytes) {
                    segments.push(SegmentRange::from_command(&segment));
                }
            }
            LC_SEGMENT => {
                if let Some(segment) = parse::<SegmentCommand>(bytes) {
                    segments.push(SegmentRange {
                        name: c_string(&segment.segname),
                        vmaddr: segment.vmaddr as u64,
                        vmsize: segment.vmsize as u64,
                        fileoff: segment.fileoff as u64,
                        filesize: segment.filesize as u64,
                    });
                }
            }
            _ => {}
        }
    }
    segments
}

fn parse<R: Record>(bytes: &[u8]) -> Option<R> {
    R::read_from_prefix(bytes).ok().map(|(record, _)| record)
}

/// The coordinate system an image is laid out in.
struct Space {
    slide: u64,
    in_cache: bool,
    segments: Vec<SegmentRange>,
}

impl Space {
    /// Range and locating fields of a segment's region.
    fn segment(&self, vmaddr: u64, vmsize: u64, fileoff: u64, filesize: u64) -> Option<(u64, u64, [&'static str; 2])> {
        if self.in_cache {
            (vmsize != 0).then(|| (vmaddr.wrapping_add(self.slide), vmsize, ["vmaddr", "vmsize"]))
        } else {
            (filesize != 0).then_some((fileoff, filesize, ["fileoff", "filesize"]))
        }
    }

    /// Range and locating field of a section's region. Zero-fill sections
    /// have no file bytes.
    fn section(&self, addr: u64, size: u64, offset: u32, zerofill: bool) -> Option<(u64, &'static str)> {
        if size == 0 {
            return None;
        }
        if self.in_cache {
            Some((addr.wrapping_add(self.slide), "addr"))
        } else if zerofill || offset == 0 {
            None
        } else {
            Some((offset as u64, "offset"))
        }
    }

    /// Address of the byte at file `offset`, resolved through the segments
    /// for cache images.
    fn file_offset(&self, offset: u64) -> Option<u64> {
        if !self.in_cache {
            return Some(offset);
        }
        self.segments
            .iter()
            .find(|s| s.contains_file_offset(offset))
            .map(|s| (s.vmaddr + (offset - s.fileoff)).wrapping_add(self.slide))
    }
}

struct CommandWalker<'w, 'a, S: ?Sized> {
    decoder: &'w Decoder<'a, S>,
    image: &'w Image<'w>,
    space: Space,
    builder: &'w mut Builder,
}

impl<S: Source + ?Sized> CommandWalker<'_, '_, S> {
    /// Lays out one command and queues the regions it describes.
    fn command(&mut self, entry: &CommandEntry, area: &[u8], area_address: u64) -> Result<Block> {
        let bytes = &area[entry.offset..entry.offset + entry.size];
        let address = area_address + entry.offset as u64;

        let Some(layout) = command_layout(entry.cmd) else {
            if entry.cmd & LC_REQ_DYLD != 0 {
                return Err(Error::UnknownRequiredLoadCommand {
                    cmd: entry.cmd,
                    offset: (MachHeader64::SIZE + entry.offset) as u64,
                });
            }
            debug!(cmd = format_args!("{:#x}", entry.cmd), "unknown load command");
            let mut block = Block::new(format!("LC_UNKNOWN ({:#x})", entry.cmd), address, entry.size as u64);
            emit_record(&mut block, &LoadCommand::FIELDS, bytes, entry.size);
            return Ok(block);
        };

        let name = load_command_name(entry.cmd).unwrap_or("LC_UNKNOWN");
        trace!(command = name, offset = entry.offset, "load command");
        let mut block = Block::new(name, address, entry.size as u64);
        emit_record(&mut block, &layout.layout, bytes, entry.size);
        if let Some(field) = layout.string_field {
            push_string(&mut block, &layout.layout, field, bytes);
        }

        match entry.cmd {
            LC_SEGMENT_64 => self.segment_64(&mut block, bytes)?,
            LC_SEGMENT => self.segment_32(&mut block, bytes)?,
            LC_SYMTAB => self.symtab(&mut block, bytes)?,
            LC_DYSYMTAB => self.dysymtab(&mut block, bytes)?,
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => self.dyld_info(&mut block, bytes),
            LC_TWOLEVEL_HINTS => {
                if let Some(hints) = parse::<TwolevelHintsCommand>(bytes) {
                    self.linkedit_array::<TwolevelHint>(
                        &mut block,
                        Table::new("Two-Level Hints", "Hint", Address::file32(hints.offset), hints.nhints as u64)
                            .linked("offset", "nhints"),
                    )?;
                }
            }
            LC_DATA_IN_CODE => {
                if let Some(data) = parse::<LinkeditDataCommand>(bytes) {
                    let count = data.datasize as u64 / DataInCodeEntry::FIELDS.size as u64;
                    self.linkedit_array::<DataInCodeEntry>(
                        &mut block,
                        Table::new("Data In Code", "Data In Code Entry", Address::file32(data.dataoff), count)
                            .linked("dataoff", "datasize")
                            .counted_in_bytes(),
                    )?;
                }
            }
            LC_MAIN => {
                if let Some(main) = parse::<EntryPointCommand>(bytes) {
                    if main.entryoff != 0 {
                        if let Some(target) = self.space.file_offset(main.entryoff) {
                            block.link("entryoff", POINTS_TO, target);
                        }
                    }
                }
            }
            LC_ENCRYPTION_INFO | LC_ENCRYPTION_INFO_64 => {
                if let Some(info) = parse::<EncryptionInfoCommand>(bytes) {
                    self.link_only(&mut block, ("cryptoff", "cryptsize"), GIVES_SIZE, info.cryptoff as u64, info.cryptsize as u64);
                }
            }
            LC_BUILD_VERSION => {
                if let Some(build) = parse::<BuildVersionCommand>(bytes) {
                    push_tools(&mut block, bytes, build.ntools);
                }
            }
            LC_NOTE => {
                if let Some(note) = parse::<NoteCommand>(bytes) {
                    self.linkedit_blob(&mut block, "Note", note.offset, note.size, ("offset", "size"));
                }
            }
            cmd => {
                if let Some(region) = linkedit_blob_name(cmd) {
                    if let Some(data) = parse::<LinkeditDataCommand>(bytes) {
                        self.linkedit_blob(&mut block, region, data.dataoff as u64, data.datasize as u64, ("dataoff", "datasize"));
                    }
                }
            }
        }
        Ok(block)
    }

    fn segment_64(&mut self, block: &mut Block, bytes: &[u8]) -> Result<()> {
        let Some(segment) = parse::<SegmentCommand64>(bytes) else {
            return Ok(());
        };
        let segname = segment.name();
        let section_size = Section64::FIELDS.size;
        for index in 0..segment.nsects as usize {
            let offset = SegmentCommand64::SIZE + index * section_size;
            let Some(raw) = bytes.get(offset..offset + section_size) else {
                break;
            };
            let Some(section) = parse::<Section64>(raw) else {
                break;
            };
            let mut child = record_block::<Section64>(section.name(), block.address + offset as u64, raw);
            let region = self.space.section(section.addr, section.size, section.offset, section.is_zerofill());
            self.section_region(&mut child, &segname, &section.name(), region, section.size);
            block.children.push(child);
        }
        self.segment_region(block, &segname, segment.vmaddr, segment.vmsize, segment.fileoff, segment.filesize);
        Ok(())
    }

    fn segment_32(&mut self, block: &mut Block, bytes: &[u8]) -> Result<()> {
        let Some(segment) = parse::<SegmentCommand>(bytes) else {
            return Ok(());
        };
        let segname = c_string(&segment.segname);
        let section_size = Section::FIELDS.size;
        for index in 0..segment.nsects as usize {
            let offset = SegmentCommand::FIELDS.size + index * section_size;
            let Some(raw) = bytes.get(offset..offset + section_size) else {
                break;
            };
            let Some(section) = parse::<Section>(raw) else {
                break;
            };
            let sectname = c_string(&section.sectname);
            let zerofill = matches!(
                section.flags & SECTION_TYPE,
                S_ZEROFILL | S_GB_ZEROFILL | S_THREAD_LOCAL_ZEROFILL
            );
            let mut child = record_block::<Section>(sectname.clone(), block.address + offset as u64, raw);
            let region = self.space.section(section.addr as u64, section.size as u64, section.offset, zerofill);
            self.section_region(&mut child, &segname, &sectname, region, section.size as u64);
            block.children.push(child);
        }
        self.segment_region(
            block,
            &segname,
            segment.vmaddr as u64,
            segment.vmsize as u64,
            segment.fileoff as u64,
            segment.filesize as u64,
        );
        Ok(())
    }

    fn segment_region(&mut self, block: &mut Block, segname: &str, vmaddr: u64, vmsize: u64, fileoff: u64, filesize: u64) {
        if self.image.in_cache && segname == "__LINKEDIT" {
            // One link-edit region serves every image of the cache.
            return;
        }
        if let Some((address, size, [offset_field, size_field])) = self.space.segment(vmaddr, vmsize, fileoff, filesize) {
            block.link(offset_field, POINTS_TO, address);
            block.link(size_field, GIVES_SIZE, address);
            self.builder
                .add(Block::new(format!("{}{}", self.image.prefix, segname), address, size));
        }
    }

    fn section_region(
        &mut self,
        child: &mut Block,
        segname: &str,
        sectname: &str,
        region: Option<(u64, &'static str)>,
        size: u64,
    ) {
        if let Some((address, field)) = region {
            child.link(field, POINTS_TO, address);
            child.link("size", GIVES_SIZE, address);
            self.builder.add(Block::new(
                format!("{}{},{}", self.image.prefix, segname, sectname),
                address,
                size,
            ));
        }
    }

    fn symtab(&mut self, block: &mut Block, bytes: &[u8]) -> Result<()> {
        let Some(symtab) = parse::<SymtabCommand>(bytes) else {
            return Ok(());
        };
        self.linkedit_array::<Nlist64>(
            block,
            Table::new("Symbol Table", "Symbol", Address::file32(symtab.symoff), symtab.nsyms as u64)
                .linked("symoff", "nsyms"),
        )?;
        self.linkedit_blob(block, "String Table", symtab.stroff as u64, symtab.strsize as u64, ("stroff", "strsize"));
        Ok(())
    }

    fn dysymtab(&mut self, block: &mut Block, bytes: &[u8]) -> Result<()> {
        let Some(d) = parse::<DysymtabCommand>(bytes) else {
            return Ok(());
        };
        self.linkedit_array::<DylibTableOfContents>(
            block,
            Table::new("Table of Contents", "TOC Entry", Address::file32(d.tocoff), d.ntoc as u64)
                .linked("tocoff", "ntoc"),
        )?;
        self.linkedit_array::<DylibModule64>(
            block,
            Table::new("Module Table", "Module", Address::file32(d.modtaboff), d.nmodtab as u64)
                .linked("modtaboff", "nmodtab"),
        )?;
        self.linkedit_array::<SymbolIndex>(
            block,
            Table::new("External References", "External Reference", Address::file32(d.extrefsymoff), d.nextrefsyms as u64)
                .linked("extrefsymoff", "nextrefsyms"),
        )?;
        self.linkedit_array::<SymbolIndex>(
            block,
            Table::new("Indirect Symbols", "Indirect Symbol", Address::file32(d.indirectsymoff), d.nindirectsyms as u64)
                .linked("indirectsymoff", "nindirectsyms"),
        )?;
        self.linkedit_array::<RelocationInfo>(
            block,
            Table::new("External Relocations", "External Relocation", Address::file32(d.extreloff), d.nextrel as u64)
                .linked("extreloff", "nextrel"),
        )?;
        self.linkedit_array::<RelocationInfo>(
            block,
            Table::new("Local Relocations", "Local Relocation", Address::file32(d.locreloff), d.nlocrel as u64)
                .linked("locreloff", "nlocrel"),
        )?;
        Ok(())
    }

    fn dyld_info(&mut self, block: &mut Block, bytes: &[u8]) {
        let Some(info) = parse::<DyldInfoCommand>(bytes) else {
            return;
        };
        let blobs = [
            ("Rebase Info", info.rebase_off, info.rebase_size, ("rebase_off", "rebase_size")),
            ("Bind Info", info.bind_off, info.bind_size, ("bind_off", "bind_size")),
            ("Weak Bind Info", info.weak_bind_off, info.weak_bind_size, ("weak_bind_off", "weak_bind_size")),
            ("Lazy Bind Info", info.lazy_bind_off, info.lazy_bind_size, ("lazy_bind_off", "lazy_bind_size")),
            ("Export Info", info.export_off, info.export_size, ("export_off", "export_size")),
        ];
        for (name, offset, size, fields) in blobs {
            self.linkedit_blob(block, name, offset as u64, size as u64, fields);
        }
    }

    /// A table in link-edit data: a block for standalone files, links only
    /// for cache images.
    ///
    /// Tables are built with base-less file addresses, so the address
    /// evaluates to the file offset.
    fn linkedit_array<R: Record>(&mut self, block: &mut Block, table: Table<'_>) -> Result<()> {
        if self.image.in_cache {
            let offset = table.address.calculate(0);
            self.link_only(block, (table.offset_field, table.count_field), table.count_label, offset, table.count);
            return Ok(());
        }
        if let Some(array) = self.decoder.array::<R>(block, table)? {
            self.builder.add(array.block);
        }
        Ok(())
    }

    fn linkedit_blob(&mut self, block: &mut Block, name: &str, offset: u64, size: u64, fields: (&str, &str)) {
        if self.image.in_cache {
            self.link_only(block, fields, GIVES_SIZE, offset, size);
            return;
        }
        if let Some(blob) = self.decoder.blob(block, name, Address::file64(offset), size, fields) {
            self.builder.add(blob);
        }
    }

    fn link_only(&self, block: &mut Block, fields: (&str, &str), count_label: &str, offset: u64, count: u64) {
        if offset == 0 || count == 0 {
            return;
        }
        if let Some(target) = self.space.file_offset(offset) {
            block.link(fields.0, POINTS_TO, target);
            block.link(fields.1, count_label, target);
        }
    }
}

/// Region name for commands that point at one link-edit blob.
fn linkedit_blob_name(cmd: u32) -> Option<&'static str> {
    let name = match cmd {
        LC_CODE_SIGNATURE => "Code Signature",
        LC_SEGMENT_SPLIT_INFO => "Split Info",
        LC_FUNCTION_STARTS => "Function Starts",
        LC_DYLIB_CODE_SIGN_DRS => "Code Signing DRs",
        LC_LINKER_OPTIMIZATION_HINT => "Linker Optimization Hints",
        LC_DYLD_EXPORTS_TRIE => "Exports Trie",
        LC_DYLD_CHAINED_FIXUPS => "Chained Fixups",
        LC_ATOM_INFO => "Atom Info",
        LC_FUNCTION_VARIANTS => "Function Variants",
        LC_FUNCTION_VARIANT_FIXUPS => "Function Variant Fixups",
        _ => return None,
    };
    Some(name)
}

/// Adds the inline string a command points at, e.g. a dylib's install name.
fn push_string(block: &mut Block, layout: &crate::record::Layout, field: &str, bytes: &[u8]) {
    let Some(descriptor) = layout.field(field) else {
        return;
    };
    let Some(raw) = bytes.get(descriptor.offset..descriptor.offset + 4) else {
        return;
    };
    let start = read_u32_le(raw) as usize;
    // Strings follow the fixed fields; anything else would break value order.
    if start < layout.size.min(bytes.len()) || start >= bytes.len() {
        return;
    }
    let name = field.trim_end_matches("_offset");
    block.push_value(Value::new(
        name,
        start as u64,
        (bytes.len() - start) as u64,
        c_string(&bytes[start..]),
    ));
}

/// Adds the build tool entries that follow a build version command.
fn push_tools(block: &mut Block, bytes: &[u8], ntools: u32) {
    let fixed = BuildVersionCommand::FIELDS.size;
    let size = BuildToolVersion::FIELDS.size;
    if ntools > 0 && fixed + size <= bytes.len() {
        block.link("ntools", GIVES_AMOUNT, block.address + fixed as u64);
    }
    for index in 0..ntools as usize {
        let offset = fixed + index * size;
        let Some(raw) = bytes.get(offset..offset + size) else {
            break;
        };
        let tool = record_block::<BuildToolVersion>(format!("Tool {}", index), block.address + offset as u64, raw);
        block.children.push(tool);
    }
}
