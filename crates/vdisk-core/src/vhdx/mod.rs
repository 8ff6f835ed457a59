//! VHDX (Hyper-V second generation) images.
//!
//! VHDX is little-endian throughout, with 64 KiB-aligned structures: file
//! identifier, two headers, two region tables, then GUID-keyed regions. The
//! BAT region indexes payload blocks whose state decides whether a read hits
//! this file, synthesizes zeros, or recurses into the copy-on-write parent.

mod bat;
mod header;
mod metadata;
mod region;
mod run;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::image::read_at_sectors;
use crate::resolver::FileResolver;
use crate::source::{read_vec_at, ByteSource};

use bat::{
    BlockAllocationTable, PAYLOAD_BLOCK_FULLY_PRESENT, PAYLOAD_BLOCK_NOT_PRESENT,
    PAYLOAD_BLOCK_PARTIALLY_PRESENT, PAYLOAD_BLOCK_UNDEFINED, PAYLOAD_BLOCK_UNMAPPED,
    PAYLOAD_BLOCK_ZERO,
};
use header::{read_current_header, read_file_identifier, ALIGNMENT};
use metadata::{Metadata, VHDX_PARENT_LOCATOR_TYPE};
use region::{RegionTable, BAT_REGION_GUID, METADATA_REGION_GUID};
use run::PartialRunIter;

const MB: u64 = 1024 * 1024;

impl std::fmt::Debug for VhdxImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VhdxImage")
            .field("size", &self.size)
            .field("block_size", &self.block_size)
            .field("logical_sector_size", &self.logical_sector_size)
            .field("physical_sector_size", &self.physical_sector_size)
            .field("virtual_disk_id", &self.virtual_disk_id)
            .field("sectors_per_block", &self.sectors_per_block)
            .field("chunk_ratio", &self.chunk_ratio)
            .finish()
    }
}

/// A read-only VHDX image, possibly the child of a differencing chain.
pub struct VhdxImage {
    source: Box<dyn ByteSource>,
    size: u64,
    block_size: u32,
    logical_sector_size: u32,
    physical_sector_size: u32,
    virtual_disk_id: Uuid,
    parent: Option<Box<VhdxImage>>,
    bat: BlockAllocationTable,
    sectors_per_block: u64,
    chunk_ratio: u64,
}

impl VhdxImage {
    /// Opens a VHDX from its backing source, resolving parents through
    /// `resolver`.
    pub fn open(mut source: Box<dyn ByteSource>, resolver: &dyn FileResolver) -> Result<Self> {
        read_file_identifier(&mut *source)?;
        read_current_header(&mut *source)?;

        // Both region table copies are decoded; the first is authoritative.
        let regions = RegionTable::read(&mut *source, 3 * ALIGNMENT)?;
        RegionTable::read(&mut *source, 4 * ALIGNMENT)?;

        let metadata_region = regions.require(METADATA_REGION_GUID, "metadata")?;
        let metadata = Metadata::read(
            &mut *source,
            metadata_region.file_offset,
            metadata_region.length,
        )?;

        let sector_size = metadata.logical_sector_size as u64;
        let block_size = metadata.block_size as u64;
        if sector_size == 0 || block_size == 0 || block_size % sector_size != 0 {
            return Err(Error::corrupt(format!(
                "invalid VHDX geometry: {} byte blocks, {} byte sectors",
                block_size, sector_size
            )));
        }
        let sectors_per_block = block_size / sector_size;
        let chunk_ratio = (1u64 << 23) * sector_size / block_size;

        let parent = if metadata.has_parent {
            let locator = metadata.parent_locator.as_ref().ok_or_else(|| {
                Error::corrupt("file parameters declare a parent but no locator item exists")
            })?;
            if locator.locator_type != VHDX_PARENT_LOCATOR_TYPE {
                return Err(Error::UnknownParentLocator {
                    guid: locator.locator_type.to_string(),
                });
            }
            Some(Box::new(open_parent(&locator.entries, resolver)?))
        } else {
            None
        };

        let bat_region = regions.require(BAT_REGION_GUID, "BAT")?;
        let payload_block_count = metadata.virtual_disk_size.div_ceil(block_size);
        let bat = BlockAllocationTable::load(
            &mut *source,
            bat_region,
            chunk_ratio,
            payload_block_count,
        )?;

        log::debug!(
            "VHDX {} bytes, {} byte blocks, parent: {}",
            metadata.virtual_disk_size,
            block_size,
            parent.is_some()
        );

        Ok(Self {
            source,
            size: metadata.virtual_disk_size,
            block_size: metadata.block_size,
            logical_sector_size: metadata.logical_sector_size,
            physical_sector_size: metadata.physical_sector_size,
            virtual_disk_id: metadata.virtual_disk_id,
            parent,
            bat,
            sectors_per_block,
            chunk_ratio,
        })
    }

    /// Logical size of the disk in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Logical sector size declared by the metadata.
    pub fn logical_sector_size(&self) -> u32 {
        self.logical_sector_size
    }

    /// Physical sector size declared by the metadata.
    pub fn physical_sector_size(&self) -> u32 {
        self.physical_sector_size
    }

    /// Block size declared by the metadata.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// The virtual disk identity GUID.
    pub fn virtual_disk_id(&self) -> Uuid {
        self.virtual_disk_id
    }

    /// Whether this image sits on top of a parent.
    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    /// Fills `buf` with the disk contents starting at `offset`. Reads
    /// touching the end of the disk return the bytes actually available.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let size = self.size;
        let sector_size = self.logical_sector_size as u64;
        read_at_sectors(size, sector_size, buf, offset, |sector, count| {
            self.read_sectors(sector, count)
        })
    }

    fn read_sectors(&mut self, mut sector: u64, mut count: u64) -> Result<Vec<u8>> {
        let sector_size = self.logical_sector_size as u64;
        let mut out = Vec::with_capacity((count * sector_size) as usize);

        while count > 0 {
            let block = sector / self.sectors_per_block;
            let sector_in_block = sector % self.sectors_per_block;
            // One block per iteration, never crossing the block edge.
            let read_count = count.min(self.sectors_per_block - sector_in_block);
            let read_size = (read_count * sector_size) as usize;

            let entry = self.bat.payload_entry(block)?;
            match entry.state {
                PAYLOAD_BLOCK_NOT_PRESENT => match self.parent.as_deref_mut() {
                    Some(parent) => {
                        let data = parent.read_sectors(sector, read_count)?;
                        out.extend_from_slice(&data);
                    }
                    None => out.resize(out.len() + read_size, 0),
                },
                PAYLOAD_BLOCK_UNDEFINED | PAYLOAD_BLOCK_ZERO | PAYLOAD_BLOCK_UNMAPPED => {
                    out.resize(out.len() + read_size, 0);
                }
                PAYLOAD_BLOCK_FULLY_PRESENT => {
                    let offset = entry.file_offset_mb * MB + sector_in_block * sector_size;
                    let data = read_vec_at(&mut *self.source, offset, read_size)?;
                    out.extend_from_slice(&data);
                }
                PAYLOAD_BLOCK_PARTIALLY_PRESENT => {
                    self.read_partial_block(entry, block, sector, sector_in_block, read_count, &mut out)?;
                }
                state => {
                    return Err(Error::corrupt(format!(
                        "unknown BAT state {} for block {}",
                        state, block
                    )));
                }
            }

            sector += read_count;
            count -= read_count;
        }

        Ok(out)
    }

    /// Reads from a partially-present block: the sector bitmap decides, per
    /// run of equal bits, whether bytes come from this file or the parent.
    fn read_partial_block(
        &mut self,
        entry: bat::BatEntry,
        block: u64,
        sector: u64,
        sector_in_block: u64,
        read_count: u64,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let sector_size = self.logical_sector_size as u64;
        let bitmap_entry = self.bat.bitmap_entry(block)?;

        // The bitmap covers a whole chunk; locate this block's first
        // requested sector within it.
        let block_in_chunk = block % self.chunk_ratio;
        let sector_in_chunk = block_in_chunk * self.sectors_per_block + sector_in_block;
        let byte_index = sector_in_chunk / 8;
        let bit_index = sector_in_chunk % 8;

        let bitmap_len = (read_count + bit_index).div_ceil(8) as usize;
        let bitmap = read_vec_at(
            &mut *self.source,
            bitmap_entry.file_offset_mb * MB + byte_index,
            bitmap_len,
        )?;

        let mut relative = 0u64;
        for run in PartialRunIter::new(&bitmap, bit_index, read_count) {
            let run_size = (run.count * sector_size) as usize;
            if run.bit == 0 {
                match self.parent.as_deref_mut() {
                    Some(parent) => {
                        let data = parent.read_sectors(sector + relative, run.count)?;
                        out.extend_from_slice(&data);
                    }
                    None => out.resize(out.len() + run_size, 0),
                }
            } else {
                let offset = entry.file_offset_mb * MB
                    + (sector_in_block + relative) * sector_size;
                let data = read_vec_at(&mut *self.source, offset, run_size)?;
                out.extend_from_slice(&data);
            }
            relative += run.count;
        }

        Ok(())
    }
}

/// Opens the parent named by the locator entries: `relative_path` first,
/// then `absolute_win32_path`, both with `\` normalized to `/`.
fn open_parent(
    entries: &std::collections::HashMap<String, String>,
    resolver: &dyn FileResolver,
) -> Result<VhdxImage> {
    let candidates = ["relative_path", "absolute_win32_path"];
    let mut last_error = None;

    for key in candidates {
        let Some(raw) = entries.get(key) else {
            continue;
        };
        let path = raw.replace('\\', "/");
        match resolver.resolve(&path) {
            Ok(source) => {
                log::debug!("opened VHDX parent via {}: {}", key, path);
                return VhdxImage::open(source, resolver);
            }
            Err(err) => last_error = Some((path, err)),
        }
    }

    Err(match last_error {
        Some((path, err)) => Error::missing_parent(format!("cannot open '{}': {}", path, err)),
        None => Error::missing_parent("parent locator has no usable path entry"),
    })
}
