//! VHD block allocation table.

use crate::codec::u32_be;
use crate::error::{Error, Result};
use crate::source::{read_vec_at, ByteSource};

/// Sentinel for a block with no backing storage.
const UNALLOCATED: u32 = 0xFFFF_FFFF;

/// The BAT: one 32-bit big-endian sector offset per block, loaded once at
/// construction.
pub(crate) struct BlockAllocationTable {
    entries: Vec<u32>,
}

impl BlockAllocationTable {
    pub(crate) fn load(
        source: &mut dyn ByteSource,
        offset: u64,
        max_entries: u32,
    ) -> Result<Self> {
        let raw = read_vec_at(source, offset, max_entries as usize * 4)?;
        let entries = (0..max_entries as usize)
            .map(|i| u32_be(&raw, i * 4))
            .collect();
        Ok(Self { entries })
    }

    /// Returns the first payload sector of `block`, or `None` when the block
    /// is unallocated and reads as zeros.
    pub(crate) fn get(&self, block: u64) -> Result<Option<u32>> {
        let entry = *self
            .entries
            .get(block as usize)
            .ok_or_else(|| {
                Error::out_of_bounds(format!(
                    "VHD block {} (table has {} entries)",
                    block,
                    self.entries.len()
                ))
            })?;
        Ok((entry != UNALLOCATED).then_some(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_load_and_get() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&10u32.to_be_bytes());
        raw.extend_from_slice(&UNALLOCATED.to_be_bytes());
        raw.extend_from_slice(&99u32.to_be_bytes());

        let bat = BlockAllocationTable::load(&mut Cursor::new(raw), 0, 3).unwrap();
        assert_eq!(bat.get(0).unwrap(), Some(10));
        assert_eq!(bat.get(1).unwrap(), None);
        assert_eq!(bat.get(2).unwrap(), Some(99));
    }

    #[test]
    fn test_out_of_bounds_block() {
        let raw = 10u32.to_be_bytes().to_vec();
        let bat = BlockAllocationTable::load(&mut Cursor::new(raw), 0, 1).unwrap();
        assert!(matches!(
            bat.get(1).unwrap_err(),
            Error::OutOfBounds { .. }
        ));
    }
}
