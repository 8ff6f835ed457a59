//! VHDX region table decoding.
//!
//! Two region table copies live at 192 KiB and 256 KiB; each maps a region
//! GUID to a file offset and length. The BAT and the metadata region are the
//! two regions a reader needs.

use std::collections::HashMap;

use uuid::{uuid, Uuid};

use crate::codec::{u32_le, u64_le};
use crate::error::{Error, Result};
use crate::source::{read_vec_at, ByteSource};

pub(crate) const BAT_REGION_GUID: Uuid = uuid!("2DC27766-F623-4200-9D64-115E9BFD4A08");
pub(crate) const METADATA_REGION_GUID: Uuid = uuid!("8B7CA206-4790-4B9A-B8FE-575F050F886E");

const REGION_TABLE_MAGIC: &[u8; 4] = b"regi";

/// A region table is one 64 KiB block: 16-byte header plus 32-byte entries.
const MAX_ENTRIES: u32 = (64 * 1024 - 16) / 32;

#[derive(Debug, Clone, Copy)]
pub(crate) struct RegionEntry {
    pub file_offset: u64,
    pub length: u32,
}

#[derive(Debug)]
pub(crate) struct RegionTable {
    entries: HashMap<Uuid, RegionEntry>,
}

impl RegionTable {
    pub(crate) fn read(source: &mut dyn ByteSource, offset: u64) -> Result<Self> {
        let header = read_vec_at(source, offset, 16)?;
        if &header[..4] != REGION_TABLE_MAGIC {
            return Err(Error::corrupt("bad region table signature"));
        }
        let entry_count = u32_le(&header, 8);
        if entry_count > MAX_ENTRIES {
            return Err(Error::corrupt(format!(
                "region table declares {} entries",
                entry_count
            )));
        }

        let raw = read_vec_at(source, offset + 16, entry_count as usize * 32)?;
        let mut entries = HashMap::with_capacity(entry_count as usize);
        for chunk in raw.chunks_exact(32) {
            let guid = Uuid::from_bytes_le(crate::codec::guid(chunk, 0));
            entries.insert(
                guid,
                RegionEntry {
                    file_offset: u64_le(chunk, 16),
                    length: u32_le(chunk, 24),
                },
            );
        }
        Ok(Self { entries })
    }

    /// Looks up a region, failing with *missing-region* when absent.
    pub(crate) fn require(&self, guid: Uuid, name: &'static str) -> Result<RegionEntry> {
        self.entries
            .get(&guid)
            .copied()
            .ok_or(Error::MissingRegion { name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn table_bytes(entries: &[(Uuid, u64, u32)]) -> Vec<u8> {
        let mut data = vec![0u8; 16 + entries.len() * 32];
        data[..4].copy_from_slice(REGION_TABLE_MAGIC);
        data[8..12].copy_from_slice(&(entries.len() as u32).to_le_bytes());
        for (i, (guid, file_offset, length)) in entries.iter().enumerate() {
            let at = 16 + i * 32;
            data[at..at + 16].copy_from_slice(&guid.to_bytes_le());
            data[at + 16..at + 24].copy_from_slice(&file_offset.to_le_bytes());
            data[at + 24..at + 28].copy_from_slice(&length.to_le_bytes());
        }
        data
    }

    #[test]
    fn test_read_and_lookup() {
        let data = table_bytes(&[
            (BAT_REGION_GUID, 3 * 1024 * 1024, 1024 * 1024),
            (METADATA_REGION_GUID, 2 * 1024 * 1024, 1024 * 1024),
        ]);
        let table = RegionTable::read(&mut Cursor::new(data), 0).unwrap();

        let bat = table.require(BAT_REGION_GUID, "BAT").unwrap();
        assert_eq!(bat.file_offset, 3 * 1024 * 1024);
        assert_eq!(bat.length, 1024 * 1024);
    }

    #[test]
    fn test_missing_region() {
        let data = table_bytes(&[(BAT_REGION_GUID, 0, 0)]);
        let table = RegionTable::read(&mut Cursor::new(data), 0).unwrap();
        let err = table.require(METADATA_REGION_GUID, "metadata").unwrap_err();
        assert!(matches!(err, Error::MissingRegion { name: "metadata" }));
    }

    #[test]
    fn test_bad_signature() {
        let mut data = table_bytes(&[]);
        data[..4].copy_from_slice(b"nope");
        assert!(matches!(
            RegionTable::read(&mut Cursor::new(data), 0).unwrap_err(),
            Error::CorruptMetadata { .. }
        ));
    }
}
