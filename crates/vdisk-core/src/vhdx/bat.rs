//! VHDX block allocation table.
//!
//! BAT entries are 64-bit little-endian: the low 3 bits hold the block state,
//! bits 20..64 the file offset in MiB. Payload-block entries are interleaved
//! with one sector-bitmap entry per chunk of `chunk_ratio` blocks.

use crate::codec::u64_le;
use crate::error::{Error, Result};
use crate::source::{read_vec_at, ByteSource};

use super::region::RegionEntry;

pub(crate) const PAYLOAD_BLOCK_NOT_PRESENT: u8 = 0;
pub(crate) const PAYLOAD_BLOCK_UNDEFINED: u8 = 1;
pub(crate) const PAYLOAD_BLOCK_ZERO: u8 = 2;
pub(crate) const PAYLOAD_BLOCK_UNMAPPED: u8 = 3;
pub(crate) const PAYLOAD_BLOCK_FULLY_PRESENT: u8 = 6;
pub(crate) const PAYLOAD_BLOCK_PARTIALLY_PRESENT: u8 = 7;

#[derive(Debug, Clone, Copy)]
pub(crate) struct BatEntry {
    pub state: u8,
    pub file_offset_mb: u64,
}

impl BatEntry {
    fn from_raw(raw: u64) -> Self {
        Self {
            state: (raw & 0x7) as u8,
            file_offset_mb: raw >> 20,
        }
    }
}

pub(crate) struct BlockAllocationTable {
    entries: Vec<u64>,
    chunk_ratio: u64,
    payload_block_count: u64,
}

impl BlockAllocationTable {
    /// Loads the whole BAT region. The lookup bound is the region length
    /// declared by the file, which is sized for the interleaved layout.
    pub(crate) fn load(
        source: &mut dyn ByteSource,
        region: RegionEntry,
        chunk_ratio: u64,
        payload_block_count: u64,
    ) -> Result<Self> {
        let entry_count = region.length as usize / 8;
        let raw = read_vec_at(source, region.file_offset, entry_count * 8)?;
        let entries = (0..entry_count).map(|i| u64_le(&raw, i * 8)).collect();
        Ok(Self {
            entries,
            chunk_ratio,
            payload_block_count,
        })
    }

    fn get(&self, index: u64) -> Result<BatEntry> {
        let raw = *self.entries.get(index as usize).ok_or_else(|| {
            Error::out_of_bounds(format!(
                "BAT entry {} (table has {} entries)",
                index,
                self.entries.len()
            ))
        })?;
        Ok(BatEntry::from_raw(raw))
    }

    /// The payload entry for `block`, accounting for interleaved
    /// sector-bitmap entries.
    pub(crate) fn payload_entry(&self, block: u64) -> Result<BatEntry> {
        if block >= self.payload_block_count {
            return Err(Error::out_of_bounds(format!(
                "block {} of {}",
                block, self.payload_block_count
            )));
        }
        self.get(block + block / self.chunk_ratio)
    }

    /// The sector-bitmap entry governing `block`.
    pub(crate) fn bitmap_entry(&self, block: u64) -> Result<BatEntry> {
        let chunk = block / self.chunk_ratio;
        self.get((chunk + 1) * self.chunk_ratio + chunk)
    }
}
