//! Flat VMDK extents: raw sectors with an explicit size.

use crate::error::Result;
use crate::source::{read_vec_at, ByteSource};

use super::SECTOR_SIZE;

/// A flat (or raw fallback) extent; sector N is at byte `N * 512`.
pub(crate) struct FlatExtent {
    source: Box<dyn ByteSource>,
    size: u64,
}

impl FlatExtent {
    pub(crate) fn new(source: Box<dyn ByteSource>, size: u64) -> Self {
        Self { source, size }
    }

    pub(crate) fn sector_count(&self) -> u64 {
        self.size / SECTOR_SIZE
    }

    /// Reads `count` sectors at extent-relative `sector`.
    pub(crate) fn read_sectors(&mut self, sector: u64, count: u64) -> Result<Vec<u8>> {
        read_vec_at(
            &mut *self.source,
            sector * SECTOR_SIZE,
            (count * SECTOR_SIZE) as usize,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_sectors() {
        let data: Vec<u8> = (0..4 * SECTOR_SIZE).map(|i| (i / 512) as u8).collect();
        let mut extent = FlatExtent::new(Box::new(Cursor::new(data)), 4 * SECTOR_SIZE);
        assert_eq!(extent.sector_count(), 4);

        let sectors = extent.read_sectors(1, 2).unwrap();
        assert_eq!(sectors.len(), 2 * SECTOR_SIZE as usize);
        assert!(sectors[..512].iter().all(|&b| b == 1));
        assert!(sectors[512..].iter().all(|&b| b == 2));
    }
}
