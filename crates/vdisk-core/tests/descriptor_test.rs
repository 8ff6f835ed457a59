//! Integration tests for VMDK descriptor parsing.

use vdisk_core::vmdk::{DiskDescriptor, ExtentKind};

const MONOLITHIC_FLAT_DESCRIPTOR: &str = r#"
# Disk DescriptorFile
version=1
CID=fffffffe
parentCID=ffffffff
createType="monolithicFlat"

# Extent description
RW 838860800 FLAT "TestVM-flat.vmdk" 0

# The Disk Data Base
ddb.virtualHWVersion = "21"
ddb.geometry.cylinders = "52216"
ddb.geometry.heads = "16"
ddb.geometry.sectors = "63"
ddb.adapterType = "lsilogic"
"#;

#[test]
fn test_parse_create_type() {
    let descriptor =
        DiskDescriptor::parse(MONOLITHIC_FLAT_DESCRIPTOR).expect("Failed to parse descriptor");
    assert_eq!(descriptor.create_type(), Some("monolithicFlat"));
}

#[test]
fn test_parse_extent() {
    let descriptor =
        DiskDescriptor::parse(MONOLITHIC_FLAT_DESCRIPTOR).expect("Failed to parse descriptor");

    assert_eq!(descriptor.extents.len(), 1);

    let extent = &descriptor.extents[0];
    assert_eq!(extent.access, "RW");
    assert_eq!(extent.size_sectors, 838860800);
    assert_eq!(extent.kind, ExtentKind::Flat);
    assert_eq!(extent.filename, "TestVM-flat.vmdk");
    assert_eq!(extent.start_sector, 0);
}

#[test]
fn test_parse_ddb_map() {
    let descriptor =
        DiskDescriptor::parse(MONOLITHIC_FLAT_DESCRIPTOR).expect("Failed to parse descriptor");

    assert_eq!(
        descriptor.ddb.get("ddb.geometry.cylinders").map(String::as_str),
        Some("52216")
    );
    assert_eq!(
        descriptor.ddb.get("ddb.geometry.heads").map(String::as_str),
        Some("16")
    );
    assert_eq!(
        descriptor.ddb.get("ddb.geometry.sectors").map(String::as_str),
        Some("63")
    );
    assert_eq!(
        descriptor.ddb.get("ddb.adapterType").map(String::as_str),
        Some("lsilogic")
    );
}

#[test]
fn test_total_sectors() {
    let descriptor =
        DiskDescriptor::parse(MONOLITHIC_FLAT_DESCRIPTOR).expect("Failed to parse descriptor");

    assert_eq!(descriptor.total_sectors, 838860800);
}

#[test]
fn test_parse_version_and_cid() {
    let descriptor =
        DiskDescriptor::parse(MONOLITHIC_FLAT_DESCRIPTOR).expect("Failed to parse descriptor");
    assert_eq!(descriptor.attributes.get("version").map(String::as_str), Some("1"));
    assert_eq!(
        descriptor.attributes.get("CID").map(String::as_str),
        Some("fffffffe")
    );
}

#[test]
fn test_no_parent_for_ffffffff() {
    let descriptor =
        DiskDescriptor::parse(MONOLITHIC_FLAT_DESCRIPTOR).expect("Failed to parse descriptor");
    assert!(descriptor.parent_hint().is_none());
}

#[test]
fn test_comments_and_blank_lines_ignored() {
    let descriptor = DiskDescriptor::parse("# just a comment\n\n   \n").unwrap();
    assert!(descriptor.extents.is_empty());
    assert!(descriptor.attributes.is_empty());
}
