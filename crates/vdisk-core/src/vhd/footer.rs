//! VHD footer and dynamic header decoding.
//!
//! All VHD structures are big-endian. The 512-byte footer sits at the end of
//! the file; images written by the original Virtual PC carry a legacy 511-byte
//! footer instead, detected by the reserved feature bit being clear.

use crate::codec::{u32_be, u64_be};
use crate::error::{Error, Result};
use crate::source::{read_exact_at, source_len, ByteSource};

/// VHD sectors are always 512 bytes.
pub const SECTOR_SIZE: u64 = 512;

pub(crate) const VHD_MAGIC: &[u8; 8] = b"conectix";
pub(crate) const DYNAMIC_HEADER_MAGIC: &[u8; 8] = b"cxsparse";

/// `data_offset` value marking a fixed disk.
pub(crate) const FIXED_DISK_SENTINEL: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Feature bit that is always set in footers written by modern tools; its
/// absence marks the legacy 511-byte footer.
const FEATURE_RESERVED: u32 = 0x0000_0002;

/// The hard disk footer: last 512 bytes of every VHD.
#[derive(Debug, Clone)]
pub struct Footer {
    pub features: u32,
    pub version: u32,
    pub data_offset: u64,
    pub timestamp: u32,
    pub original_size: u64,
    pub current_size: u64,
    pub disk_type: u32,
    pub checksum: u32,
    pub unique_id: [u8; 16],
}

impl Footer {
    fn parse(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            features: u32_be(buf, 8),
            version: u32_be(buf, 12),
            data_offset: u64_be(buf, 16),
            timestamp: u32_be(buf, 24),
            original_size: u64_be(buf, 40),
            current_size: u64_be(buf, 48),
            disk_type: u32_be(buf, 60),
            checksum: u32_be(buf, 64),
            unique_id: crate::codec::guid(buf, 68),
        })
    }

    pub fn is_fixed(&self) -> bool {
        self.data_offset == FIXED_DISK_SENTINEL
    }
}

/// Reads the footer, falling back to the legacy 511-byte position when the
/// reserved feature bit of the first read is clear.
pub(crate) fn read_footer(source: &mut dyn ByteSource) -> Result<Footer> {
    let file_len = source_len(source)?;
    if file_len < SECTOR_SIZE {
        return Err(Error::corrupt("file too short for a VHD footer"));
    }

    let mut buf = [0u8; SECTOR_SIZE as usize];
    read_exact_at(source, file_len - SECTOR_SIZE, &mut buf)?;

    if u32_be(&buf, 8) & FEATURE_RESERVED == 0 {
        buf = [0u8; SECTOR_SIZE as usize];
        read_exact_at(source, file_len - (SECTOR_SIZE - 1), &mut buf[..511])?;
    }

    if &buf[..8] != VHD_MAGIC {
        return Err(Error::corrupt("bad VHD footer cookie"));
    }

    Footer::parse(&buf)
}

/// The 1024-byte dynamic disk header, pointed to by the footer's
/// `data_offset` on dynamic disks.
#[derive(Debug, Clone)]
pub struct DynamicHeader {
    pub table_offset: u64,
    pub header_version: u32,
    pub max_table_entries: u32,
    pub block_size: u32,
}

pub(crate) fn read_dynamic_header(
    source: &mut dyn ByteSource,
    offset: u64,
) -> Result<DynamicHeader> {
    let mut buf = [0u8; 1024];
    read_exact_at(source, offset, &mut buf)?;

    if &buf[..8] != DYNAMIC_HEADER_MAGIC {
        return Err(Error::corrupt("bad VHD dynamic header cookie"));
    }

    let header = DynamicHeader {
        table_offset: u64_be(&buf, 16),
        header_version: u32_be(&buf, 24),
        max_table_entries: u32_be(&buf, 28),
        block_size: u32_be(&buf, 32),
    };
    if header.block_size == 0 || header.block_size % SECTOR_SIZE as u32 != 0 {
        return Err(Error::corrupt(format!(
            "invalid VHD block size: {}",
            header.block_size
        )));
    }
    Ok(header)
}
