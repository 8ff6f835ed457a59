//! VHD (Virtual PC / Hyper-V first generation) images.
//!
//! A VHD is identified by the `conectix` footer at the end of the file. Fixed
//! disks are a raw sector dump; dynamic disks index 2 MiB blocks through a
//! block allocation table, each allocated block preceded by a sector bitmap
//! that a read-only accessor can skip over.

mod bat;
mod footer;

pub use footer::{Footer, SECTOR_SIZE};

use crate::error::Result;
use crate::image::read_at_sectors;
use crate::source::{read_vec_at, ByteSource};

use bat::BlockAllocationTable;
use footer::{read_dynamic_header, read_footer};

/// A read-only VHD image.
pub struct VhdImage {
    disk: VhdDisk,
    footer: Footer,
    size: u64,
}

enum VhdDisk {
    Fixed(FixedDisk),
    Dynamic(DynamicDisk),
}

impl VhdImage {
    /// Opens a VHD from its backing source.
    ///
    /// Fixed-disk detection runs before any dynamic header read: the
    /// all-ones `data_offset` is the sentinel.
    pub fn open(mut source: Box<dyn ByteSource>) -> Result<Self> {
        let footer = read_footer(&mut *source)?;
        let size = footer.current_size;

        let disk = if footer.is_fixed() {
            log::debug!("VHD fixed disk, {} bytes", size);
            VhdDisk::Fixed(FixedDisk { source })
        } else {
            let header = read_dynamic_header(&mut *source, footer.data_offset)?;
            log::debug!(
                "VHD dynamic disk, {} bytes, {} byte blocks",
                size,
                header.block_size
            );
            let sectors_per_block = header.block_size as u64 / SECTOR_SIZE;
            // One presence bit per sector, rounded up to whole sectors.
            let bitmap_sectors = (sectors_per_block / 8).div_ceil(SECTOR_SIZE);
            let bat = BlockAllocationTable::load(
                &mut *source,
                header.table_offset,
                header.max_table_entries,
            )?;
            VhdDisk::Dynamic(DynamicDisk {
                source,
                bat,
                sectors_per_block,
                bitmap_sectors,
            })
        };

        Ok(Self { disk, footer, size })
    }

    /// Logical size of the disk in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The decoded footer.
    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    /// Whether the image is a fixed (non-sparse) disk.
    pub fn is_fixed(&self) -> bool {
        matches!(self.disk, VhdDisk::Fixed(_))
    }

    /// Fills `buf` with the disk contents starting at `offset`. Reads
    /// touching the end of the disk return the bytes actually available.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let size = self.size;
        let disk = &mut self.disk;
        read_at_sectors(size, SECTOR_SIZE, buf, offset, |sector, count| {
            disk.read_sectors(sector, count)
        })
    }
}

impl VhdDisk {
    fn read_sectors(&mut self, sector: u64, count: u64) -> Result<Vec<u8>> {
        match self {
            VhdDisk::Fixed(disk) => disk.read_sectors(sector, count),
            VhdDisk::Dynamic(disk) => disk.read_sectors(sector, count),
        }
    }
}

struct FixedDisk {
    source: Box<dyn ByteSource>,
}

impl FixedDisk {
    fn read_sectors(&mut self, sector: u64, count: u64) -> Result<Vec<u8>> {
        read_vec_at(
            &mut *self.source,
            sector * SECTOR_SIZE,
            (count * SECTOR_SIZE) as usize,
        )
    }
}

struct DynamicDisk {
    source: Box<dyn ByteSource>,
    bat: BlockAllocationTable,
    sectors_per_block: u64,
    bitmap_sectors: u64,
}

impl DynamicDisk {
    fn read_sectors(&mut self, mut sector: u64, mut count: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity((count * SECTOR_SIZE) as usize);

        while count > 0 {
            let block = sector / self.sectors_per_block;
            let sector_in_block = sector % self.sectors_per_block;
            // Never cross the block boundary in one backing-file access.
            let read_count = count.min(self.sectors_per_block - sector_in_block);

            match self.bat.get(block)? {
                Some(block_sector) => {
                    let first = block_sector as u64 + self.bitmap_sectors + sector_in_block;
                    let data = read_vec_at(
                        &mut *self.source,
                        first * SECTOR_SIZE,
                        (read_count * SECTOR_SIZE) as usize,
                    )?;
                    out.extend_from_slice(&data);
                }
                None => out.resize(out.len() + (read_count * SECTOR_SIZE) as usize, 0),
            }

            sector += read_count;
            count -= read_count;
        }

        Ok(out)
    }
}
