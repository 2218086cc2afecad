mod common;

use std::mem::offset_of;

use common::*;
use dscmap::dyld::DyldCacheHeader;
use dscmap::tree::{GIVES_AMOUNT, GIVES_SIZE, POINTS_TO};
use dscmap::{check, decode_cache, Block, DecodeOptions, Error, FileSource};
use tempfile::TempDir;

const CACHE: &str = "dyld_shared_cache_arm64e";

fn names(block: &Block) -> Vec<&str> {
    block.children.iter().map(|c| c.name.as_str()).collect()
}

fn decode(cache: &Cache, options: &DecodeOptions) -> dscmap::Result<Block> {
    let dir = TempDir::new().unwrap();
    let path = cache.write(dir.path(), CACHE);
    let source = FileSource::open(&path)?;
    decode_cache(&source, options)
}

fn header_area(root: &Block) -> &Block {
    root.child("Main Header Area").expect("main header area")
}

#[test]
fn test_minimal_cache() {
    let root = decode(&minimal_cache(), &DecodeOptions::default()).unwrap();

    assert_eq!(root.name, CACHE);
    assert!(root.is_container());
    assert_eq!(names(&root), vec!["Main Header Area"]);

    let area = header_area(&root);
    assert_eq!(area.address, BASE);
    assert_eq!(names(area), vec!["Header", "Mappings"]);

    let header = area.child("Header").unwrap();
    assert_eq!(header.address, BASE);
    assert_eq!(header.size, 512);
    assert_eq!(header.value("magic").unwrap().text, "dyld_v1   arm64e");
    assert_eq!(header.value("mapping_offset").unwrap().links[0].target, BASE + 0x200);
    assert_eq!(header.value("mapping_count").unwrap().links[0].label, GIVES_AMOUNT);

    let mappings = area.child("Mappings").unwrap();
    assert_eq!(mappings.address, BASE + 0x200);
    assert_eq!(mappings.size, 32);
    assert_eq!(names(mappings), vec!["Mapping 0"]);
    assert_eq!(mappings.children[0].value("size").unwrap().text, "0x1000");

    assert_eq!(check(&root), Ok(()));
}

#[test]
fn test_header_version_follows_mapping_offset() {
    for (mapping_offset, expected_size) in [(0x98u32, 0x98u64), (0x140, 0x140), (0x200, 0x200)] {
        let mut cache = Cache::new(0x1000, mapping_offset);
        cache.mapping(BASE, 0x1000, 0);
        let root = decode(&cache, &DecodeOptions::default()).unwrap();

        let area = header_area(&root);
        let header = area.child("Header").unwrap();
        assert_eq!(header.size, expected_size, "mapping offset {:#x}", mapping_offset);
        assert!(header.values.iter().all(|v| v.end() <= expected_size));
        assert_eq!(
            area.child("Mappings").unwrap().address,
            BASE + mapping_offset as u64
        );
    }
}

#[test]
fn test_oldest_header_has_accelerator_fields() {
    let mut cache = Cache::new(0x1000, 0x98);
    cache.mapping(BASE, 0x1000, 0);
    let root = decode(&cache, &DecodeOptions::default()).unwrap();
    let header = header_area(&root).child("Header").unwrap();
    assert!(header.value("accelerate_info_addr").is_some());
    assert!(header.value("dyld_in_cache_mh").is_none());
    assert!(header.value("mapping_with_slide_offset").is_none());
}

#[test]
fn test_absent_table_produces_nothing() {
    let mut cache = minimal_cache();
    cache.u32(offset_of!(DyldCacheHeader, images_count_old), 3);
    let root = decode(&cache, &DecodeOptions::default()).unwrap();

    let area = header_area(&root);
    assert!(area.child("Images").is_none());
    let header = area.child("Header").unwrap();
    assert!(header.value("images_offset_old").unwrap().links.is_empty());
    assert!(header.value("images_count_old").unwrap().links.is_empty());
}

#[test]
fn test_threshold_sizes_table_without_elements() {
    let mut cache = minimal_cache();
    cache
        .u32(offset_of!(DyldCacheHeader, images_offset_old), 0x220)
        .u32(offset_of!(DyldCacheHeader, images_count_old), 3);
    let options = DecodeOptions {
        element_threshold: 2,
        ..DecodeOptions::default()
    };
    let root = decode(&cache, &options).unwrap();

    let images = header_area(&root).child("Images").unwrap();
    assert_eq!(images.address, BASE + 0x220);
    assert_eq!(images.size, 96);
    assert!(images.children.is_empty());

    let header = header_area(&root).child("Header").unwrap();
    let count = header.value("images_count_old").unwrap();
    assert_eq!(count.links[0].label, GIVES_AMOUNT);
    assert_eq!(count.links[0].target, BASE + 0x220);
}

#[test]
fn test_local_symbols_past_last_mapping() {
    let mut cache = Cache::new(0x4100, 512);
    cache
        .mapping(BASE, 0x4000, 0)
        .u64(offset_of!(DyldCacheHeader, local_symbols_offset), 0x4000)
        .u64(offset_of!(DyldCacheHeader, local_symbols_size), 0x100)
        // nlist at +0x20 (one entry), strings at +0x30
        .u32(0x4000, 0x20)
        .u32(0x4004, 1)
        .u32(0x4008, 0x30)
        .u32(0x400c, 0x10);
    let root = decode(&cache, &DecodeOptions::default()).unwrap();

    let symbols = root.child("Local Symbols").unwrap();
    assert_eq!(symbols.address, BASE + 0x4000);
    assert_eq!(symbols.size, 0x100);
    assert_eq!(names(symbols), vec!["Symbol Table", "String Pool"]);
    assert_eq!(symbols.child("Symbol Table").unwrap().address, BASE + 0x4020);
    assert_eq!(symbols.value("nlist_offset").unwrap().links[0].target, BASE + 0x4020);
    assert!(symbols.value("entries_offset").unwrap().links.is_empty());

    let header = header_area(&root).child("Header").unwrap();
    let offset = header.value("local_symbols_offset").unwrap();
    assert_eq!(offset.links[0].label, POINTS_TO);
    assert_eq!(offset.links[0].target, BASE + 0x4000);
}

#[test]
fn test_images_slide_info_and_patch_table() {
    let root = decode(&image_cache(1), &DecodeOptions::default()).unwrap();

    assert_eq!(
        names(&root),
        vec![
            "Main Header Area",
            "libdemo.dylib __TEXT",
            "Patch Info",
            "Patch Image Table",
            "Patch Export Names",
            "Slide Info",
        ]
    );

    let area = header_area(&root);
    assert_eq!(names(area), vec!["Header", "Mappings", "Images", "Mappings With Slide"]);
    let mapping = &area.child("Mappings With Slide").unwrap().children[0];
    assert_eq!(mapping.name, "Mapping With Slide 0");
    assert_eq!(mapping.value("slide_info_file_offset").unwrap().links[0].target, BASE + 0x3800);

    let slide = root.child("Slide Info").unwrap();
    assert_eq!(slide.value("version").unwrap().text, "0x2");
    let starts = slide.child("Page Starts").unwrap();
    assert_eq!(starts.address, BASE + 0x3828);
    assert_eq!(starts.size, 4);
    assert_eq!(starts.children.len(), 2);

    let text = root.child("libdemo.dylib __TEXT").unwrap();
    assert_eq!(text.address, BASE + 0x1000);
    assert_eq!(text.size, 0x1000);
    assert_eq!(
        names(text),
        vec![
            "libdemo.dylib Mach-O Header",
            "libdemo.dylib Load Commands",
            "libdemo.dylib __TEXT,__text",
        ]
    );
    let commands = text.child("libdemo.dylib Load Commands").unwrap();
    assert_eq!(
        names(commands),
        vec!["LC_SEGMENT_64", "LC_SEGMENT_64", "LC_SYMTAB", "LC_ID_DYLIB"]
    );

    // Shared link-edit data is linked to, never laid out per image.
    assert!(root.resolve(BASE + 0x3000).is_none());
    let symtab = &commands.children[2];
    assert_eq!(symtab.value("symoff").unwrap().links[0].target, BASE + 0x3000);
    assert_eq!(symtab.value("strsize").unwrap().links[0].label, GIVES_SIZE);

    let patches = root.child("Patch Image Table").unwrap();
    assert_eq!(patches.address, BASE + 0x2100);
    assert_eq!(patches.children.len(), 1);
    assert_eq!(root.resolve(BASE + 0x1800).map(|b| b.name.as_str()), Some("libdemo.dylib __TEXT,__text"));

    assert_eq!(check(&root), Ok(()));
}

#[test]
fn test_images_can_be_skipped() {
    let options = DecodeOptions {
        decode_images: false,
        ..DecodeOptions::default()
    };
    let root = decode(&image_cache(1), &options).unwrap();
    assert!(root.child("libdemo.dylib __TEXT").is_none());
    assert!(header_area(&root).child("Images").is_some());
}

#[test]
fn test_patch_table_must_match_image_count() {
    let err = decode(&image_cache(2), &DecodeOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        Error::MismatchedTables {
            field: "patch_table_array_count",
            expected: 1,
            actual: 2
        }
    ));
}

#[test]
fn test_unknown_slide_version_is_fatal() {
    let mut cache = image_cache(1);
    cache.u32(0x3800, 9);
    let err = decode(&cache, &DecodeOptions::default()).unwrap_err();
    assert!(matches!(err, Error::UnsupportedSlideVersion { version: 9, .. }));
}

#[test]
fn test_sub_cache_container() {
    let dir = TempDir::new().unwrap();
    let (main, sub) = split_cache([0x11; 16]);
    let path = main.write(dir.path(), CACHE);
    sub.write(dir.path(), &format!("{CACHE}.01"));

    let source = FileSource::open(&path).unwrap();
    let root = decode_cache(&source, &DecodeOptions::default()).unwrap();

    assert_eq!(names(&root), vec!["Main Header Area", "Sub Cache 1"]);
    let entries = header_area(&root).child("Sub Cache Entries").unwrap();
    assert_eq!(entries.size, 56);
    let entry = &entries.children[0];
    assert_eq!(entry.value("file_suffix").unwrap().text, ".01");
    assert_eq!(entry.value("cache_vm_offset").unwrap().links[0].target, BASE + 0x1000);

    let sub = root.child("Sub Cache 1").unwrap();
    assert!(sub.is_container());
    assert_eq!(sub.address, BASE + 0x1000);
    let sub_area = sub.child("Sub Cache 1 Header Area").unwrap();
    assert_eq!(names(sub_area), vec!["Header", "Mappings"]);
    assert_eq!(sub_area.child("Mappings").unwrap().address, BASE + 0x1200);
    assert_eq!(root.resolve(BASE + 0x1200).map(|b| b.name.as_str()), Some("Mappings"));
}
