//! VHDX metadata region decoding.
//!
//! The metadata region holds a table of GUID-keyed items. A reader needs file
//! parameters, virtual disk size, the sector sizes, the virtual disk ID and,
//! for differencing disks, the parent locator with its UTF-16LE key/value
//! entries.

use std::collections::HashMap;

use uuid::{uuid, Uuid};

use crate::codec::{u16_le, u32_le, u64_le};
use crate::error::{Error, Result};
use crate::source::{read_vec_at, ByteSource};

const FILE_PARAMETERS_GUID: Uuid = uuid!("CAA16737-FA36-4D43-B3B6-33F0AA44E76B");
const VIRTUAL_DISK_SIZE_GUID: Uuid = uuid!("2FA54224-CD1B-4876-B211-5DBED83BF4B8");
const LOGICAL_SECTOR_SIZE_GUID: Uuid = uuid!("8141BF1D-A96F-4709-BA47-F233A8FAAB5F");
const PHYSICAL_SECTOR_SIZE_GUID: Uuid = uuid!("CDA348C7-445D-4471-9CC9-E9885251C556");
const VIRTUAL_DISK_ID_GUID: Uuid = uuid!("BECA12AB-B2E6-4523-93EF-C309E000C746");
const PARENT_LOCATOR_GUID: Uuid = uuid!("A8D35F2D-B30B-454D-ABF7-D3D84834AB0C");

/// The only parent locator type defined by the format.
pub(crate) const VHDX_PARENT_LOCATOR_TYPE: Uuid = uuid!("B04AEFB7-D19E-4A81-B789-25B8E9445913");

const METADATA_TABLE_MAGIC: &[u8; 8] = b"metadata";

/// The decoded metadata items a reader cares about.
#[derive(Debug)]
pub(crate) struct Metadata {
    pub block_size: u32,
    pub has_parent: bool,
    pub virtual_disk_size: u64,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
    pub virtual_disk_id: Uuid,
    pub parent_locator: Option<ParentLocator>,
}

/// Parent locator: a type GUID plus string key/value entries.
#[derive(Debug)]
pub(crate) struct ParentLocator {
    pub locator_type: Uuid,
    pub entries: HashMap<String, String>,
}

impl Metadata {
    pub(crate) fn read(source: &mut dyn ByteSource, offset: u64, length: u32) -> Result<Self> {
        let header = read_vec_at(source, offset, 32)?;
        if &header[..8] != METADATA_TABLE_MAGIC {
            return Err(Error::corrupt("bad metadata table signature"));
        }
        let entry_count = u16_le(&header, 10);
        if 32 + entry_count as u32 * 32 > length {
            return Err(Error::corrupt(format!(
                "metadata table declares {} entries in a {} byte region",
                entry_count, length
            )));
        }

        let raw = read_vec_at(source, offset + 32, entry_count as usize * 32)?;

        let mut block_size = None;
        let mut has_parent = false;
        let mut virtual_disk_size = None;
        let mut logical_sector_size = None;
        let mut physical_sector_size = None;
        let mut virtual_disk_id = None;
        let mut parent_locator = None;

        for chunk in raw.chunks_exact(32) {
            let item_id = Uuid::from_bytes_le(crate::codec::guid(chunk, 0));
            let item_offset = offset + u32_le(chunk, 16) as u64;
            let item_length = u32_le(chunk, 20) as usize;

            match item_id {
                id if id == FILE_PARAMETERS_GUID => {
                    let item = read_vec_at(source, item_offset, 8)?;
                    block_size = Some(u32_le(&item, 0));
                    let flags = u32_le(&item, 4);
                    has_parent = flags >> 1 & 1 != 0;
                }
                id if id == VIRTUAL_DISK_SIZE_GUID => {
                    let item = read_vec_at(source, item_offset, 8)?;
                    virtual_disk_size = Some(u64_le(&item, 0));
                }
                id if id == LOGICAL_SECTOR_SIZE_GUID => {
                    let item = read_vec_at(source, item_offset, 4)?;
                    logical_sector_size = Some(u32_le(&item, 0));
                }
                id if id == PHYSICAL_SECTOR_SIZE_GUID => {
                    let item = read_vec_at(source, item_offset, 4)?;
                    physical_sector_size = Some(u32_le(&item, 0));
                }
                id if id == VIRTUAL_DISK_ID_GUID => {
                    let item = read_vec_at(source, item_offset, 16)?;
                    virtual_disk_id = Some(Uuid::from_bytes_le(crate::codec::guid(&item, 0)));
                }
                id if id == PARENT_LOCATOR_GUID => {
                    parent_locator = Some(read_parent_locator(source, item_offset, item_length)?);
                }
                _ => continue,
            }
        }

        Ok(Self {
            block_size: block_size
                .ok_or_else(|| Error::corrupt("metadata is missing file parameters"))?,
            has_parent,
            virtual_disk_size: virtual_disk_size
                .ok_or_else(|| Error::corrupt("metadata is missing virtual disk size"))?,
            logical_sector_size: logical_sector_size
                .ok_or_else(|| Error::corrupt("metadata is missing logical sector size"))?,
            physical_sector_size: physical_sector_size.unwrap_or(4096),
            virtual_disk_id: virtual_disk_id
                .ok_or_else(|| Error::corrupt("metadata is missing virtual disk ID"))?,
            parent_locator,
        })
    }
}

/// Decodes a parent locator item at `offset`.
fn read_parent_locator(
    source: &mut dyn ByteSource,
    offset: u64,
    length: usize,
) -> Result<ParentLocator> {
    let raw = read_vec_at(source, offset, length.max(20))?;
    let locator_type = Uuid::from_bytes_le(crate::codec::guid(&raw, 0));
    let key_value_count = u16_le(&raw, 18);

    let mut entries = HashMap::with_capacity(key_value_count as usize);
    for i in 0..key_value_count as usize {
        let at = 20 + i * 12;
        if at + 12 > raw.len() {
            return Err(Error::corrupt("parent locator entry past item end"));
        }
        let key_offset = u32_le(&raw, at) as usize;
        let value_offset = u32_le(&raw, at + 4) as usize;
        let key_length = u16_le(&raw, at + 8) as usize;
        let value_length = u16_le(&raw, at + 10) as usize;

        if key_offset + key_length > raw.len() || value_offset + value_length > raw.len() {
            return Err(Error::corrupt("parent locator string past item end"));
        }
        let key = decode_utf16_le(&raw[key_offset..key_offset + key_length])?;
        let value = decode_utf16_le(&raw[value_offset..value_offset + value_length])?;
        entries.insert(key, value);
    }

    Ok(ParentLocator {
        locator_type,
        entries,
    })
}

/// Decodes little-endian UTF-16 without assuming alignment.
fn decode_utf16_le(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(Error::corrupt("odd-length UTF-16 string"));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| Error::corrupt("invalid UTF-16 string"))
}
