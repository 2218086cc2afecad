mod common;

use std::fs;

use common::*;
use dscmap::macho::{LC_REQ_DYLD, LC_UUID};
use dscmap::tree::{GIVES_AMOUNT, GIVES_SIZE, POINTS_TO};
use dscmap::{check, decode_macho, Block, DecodeOptions, Error, MachOFile, Source};
use tempfile::TempDir;

fn names(block: &Block) -> Vec<&str> {
    block.children.iter().map(|c| c.name.as_str()).collect()
}

fn open(bytes: &[u8]) -> (TempDir, dscmap::Result<MachOFile>) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("libdemo.dylib");
    fs::write(&path, bytes).unwrap();
    let file = MachOFile::open(&path);
    (dir, file)
}

#[test]
fn test_standalone_dylib_layout() {
    let (_dir, file) = open(&standalone_dylib());
    let file = file.unwrap();
    let root = decode_macho(&file, &DecodeOptions::default()).unwrap();

    assert_eq!(root.name, "libdemo.dylib");
    assert_eq!(names(&root), vec!["__TEXT", "__LINKEDIT"]);

    let text = root.child("__TEXT").unwrap();
    assert_eq!((text.address, text.size), (0, 0x2000));
    assert_eq!(names(text), vec!["Mach-O Header", "Load Commands", "__TEXT,__text"]);

    let linkedit = root.child("__LINKEDIT").unwrap();
    assert_eq!((linkedit.address, linkedit.size), (0x2000, 0x1000));
    assert_eq!(names(linkedit), vec!["Symbol Table", "String Table", "Function Starts"]);
    assert_eq!(names(linkedit.child("Symbol Table").unwrap()), vec!["Symbol 0", "Symbol 1"]);

    assert_eq!(check(&root), Ok(()));
}

#[test]
fn test_load_commands_and_links() {
    let (_dir, file) = open(&standalone_dylib());
    let root = decode_macho(&file.unwrap(), &DecodeOptions::default()).unwrap();
    let text = root.child("__TEXT").unwrap();

    let header = text.child("Mach-O Header").unwrap();
    assert_eq!(header.value("ncmds").unwrap().text, "0x6");
    assert_eq!(header.value("ncmds").unwrap().links[0].label, GIVES_AMOUNT);
    assert_eq!(header.value("sizeofcmds").unwrap().links[0].label, GIVES_SIZE);
    assert_eq!(header.value("sizeofcmds").unwrap().links[0].target, 32);

    let commands = text.child("Load Commands").unwrap();
    assert_eq!(commands.address, 32);
    assert_eq!(
        names(commands),
        vec![
            "LC_SEGMENT_64",
            "LC_SEGMENT_64",
            "LC_SYMTAB",
            "LC_ID_DYLIB",
            "LC_UUID",
            "LC_FUNCTION_STARTS",
        ]
    );

    let segment = &commands.children[0];
    assert_eq!(segment.value("segname").unwrap().text, "__TEXT");
    assert_eq!(names(segment), vec!["__text"]);
    let section = &segment.children[0];
    assert_eq!(section.value("offset").unwrap().links[0].target, 0x1000);

    let dylib = &commands.children[3];
    assert_eq!(dylib.value("name").unwrap().text, "/usr/lib/libdemo.dylib");

    let symtab = &commands.children[2];
    let symoff = symtab.value("symoff").unwrap();
    assert_eq!(symoff.links[0].label, POINTS_TO);
    // The symbol table starts the segment, so the segment is what resolves.
    assert_eq!(root.resolve(symoff.links[0].target).map(|b| b.name.as_str()), Some("__LINKEDIT"));
    assert_eq!(symoff.links[0].target, 0x2000);
    let stroff = symtab.value("stroff").unwrap();
    assert_eq!(root.resolve(stroff.links[0].target).map(|b| b.name.as_str()), Some("String Table"));

    let starts = &commands.children[5];
    assert_eq!(starts.value("dataoff").unwrap().links[0].target, 0x2040);
}

#[test]
fn test_unknown_optional_command_is_kept() {
    let mut bytes = MachO::new()
        .segment("__TEXT", 0, 0x1000, 0, 0x1000, &[])
        .raw(0x7f, 16)
        .build();
    bytes.resize(0x1000, 0);
    let (_dir, file) = open(&bytes);
    let root = decode_macho(&file.unwrap(), &DecodeOptions::default()).unwrap();
    let commands = root.child("__TEXT").unwrap().child("Load Commands").unwrap();
    assert_eq!(names(commands), vec!["LC_SEGMENT_64", "LC_UNKNOWN (0x7f)"]);
}

#[test]
fn test_unknown_required_command_is_fatal() {
    let mut bytes = MachO::new().raw(LC_UUID, 24).raw(LC_REQ_DYLD | 0xff, 16).build();
    bytes.resize(0x100, 0);
    let (_dir, file) = open(&bytes);
    let err = decode_macho(&file.unwrap(), &DecodeOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        Error::UnknownRequiredLoadCommand {
            cmd: 0x8000_00ff,
            offset: 56
        }
    ));
}

#[test]
fn test_bad_magic_is_rejected() {
    let mut bytes = standalone_dylib();
    bytes[..4].copy_from_slice(&0xcafebabeu32.to_le_bytes());
    let (_dir, file) = open(&bytes);
    assert!(matches!(file, Err(Error::InvalidMachoMagic(0xcafebabe))));
}

#[test]
fn test_closed_file_cannot_be_read() {
    let (_dir, file) = open(&standalone_dylib());
    let mut file = file.unwrap();
    file.close();
    file.close();
    assert!(file.is_empty());
    assert!(matches!(
        decode_macho(&file, &DecodeOptions::default()),
        Err(Error::SourceClosed)
    ));
}
