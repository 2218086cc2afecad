mod common;

use common::*;
use dscmap::tree::{from_json, load, save, to_json, Builder, Rule};
use dscmap::{check, decode_cache, Block, DecodeOptions, Error, FileSource};
use tempfile::TempDir;

fn decoded() -> Block {
    let dir = TempDir::new().unwrap();
    let path = image_cache(1).write(dir.path(), "dyld_shared_cache_arm64e");
    let source = FileSource::open(&path).unwrap();
    decode_cache(&source, &DecodeOptions::default()).unwrap()
}

#[test]
fn test_json_round_trip_of_decoded_cache() {
    let root = decoded();
    let json = to_json(&root).unwrap();
    let back = from_json(&json).unwrap();
    assert_eq!(back, root);
    assert_eq!(back.stats(), root.stats());
}

#[test]
fn test_save_and_load() {
    let root = decoded();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tree.json");
    save(&root, &path).unwrap();
    assert_eq!(load(&path).unwrap(), root);

    assert!(matches!(
        load(dir.path().join("missing.json")),
        Err(Error::FileOpen { .. })
    ));
}

#[test]
fn test_corrupted_tree_is_rejected() {
    let mut root = decoded();
    let area = root
        .children
        .iter_mut()
        .find(|c| c.name == "Main Header Area")
        .unwrap();
    // Grow the header over the mapping array.
    area.children[0].size += 8;
    let violation = check(&root).unwrap_err();
    assert_eq!(violation.rule, Rule::Overlap);
    assert_eq!(violation.first.name, "Header");
    assert_eq!(violation.second.name, "Mappings");

    let json = to_json(&root).unwrap();
    assert!(matches!(from_json(&json), Err(Error::Invariant(_))));
}

#[test]
fn test_malformed_json_is_an_error() {
    assert!(matches!(from_json("{\"name\": 1}"), Err(Error::Json(_))));
}

#[test]
fn test_builder_places_regions_in_any_order() {
    let mut builder = Builder::new();
    builder.add(Block::new("Symbol Table", 0x2000, 0x20));
    builder.add(Block::new("__TEXT,__text", 0x1000, 0x100));
    builder.add(Block::new("__LINKEDIT", 0x2000, 0x1000));
    builder.add(Block::new("__TEXT", 0x0, 0x2000));
    assert_eq!(builder.len(), 4);

    let mut root = Block::container("image", 0);
    builder.rebalance(&mut root);

    let top: Vec<_> = root.children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(top, vec!["__TEXT", "__LINKEDIT"]);
    assert_eq!(root.children[0].children[0].name, "__TEXT,__text");
    assert_eq!(root.children[0].children[0].offset, 0x1000);
    assert_eq!(root.children[1].children[0].name, "Symbol Table");
    assert_eq!(check(&root), Ok(()));
}
