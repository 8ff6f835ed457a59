//! VMDK sparse extent headers.
//!
//! Three on-disk layouts share one role: the hosted sparse header (`KDMV`),
//! the legacy COW header (`COWD`), and the ESX snapshot header (`SEVM`). All
//! are little-endian and sized to one sector (SESPARSE uses 64-bit fields
//! throughout).

use crate::codec::{u16_le, u32_le, u64_le};
use crate::error::{Error, Result};
use crate::source::{read_exact_at, ByteSource};

pub(crate) const SPARSE_MAGIC: &[u8; 4] = b"KDMV";
pub(crate) const COWD_MAGIC: &[u8; 4] = b"COWD";
pub(crate) const SESPARSE_MAGIC: &[u8; 4] = b"SEVM";
pub(crate) const DESCRIPTOR_MAGIC: &[u8; 4] = b"# Di";

const FLAG_COMPRESSED: u64 = 1 << 16;
const FLAG_EMBEDDED_LBA: u64 = 1 << 17;

/// `gd_offset` value meaning the authoritative header lives in the footer,
/// 1024 bytes before the end of the file.
pub(crate) const GD_AT_END: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Hosted sparse header (monolithicSparse, twoGbMaxExtentSparse,
/// streamOptimized).
#[derive(Debug, Clone)]
pub(crate) struct HostedSparseHeader {
    pub version: u32,
    pub flags: u32,
    /// Capacity in sectors.
    pub capacity: u64,
    /// Grain size in sectors.
    pub grain_size: u64,
    pub descriptor_offset: u64,
    pub descriptor_size: u64,
    pub num_gtes_per_gt: u32,
    pub gd_offset: u64,
    pub compress_algorithm: u16,
}

/// Legacy ESX COW header. All size fields are 32-bit.
#[derive(Debug, Clone)]
pub(crate) struct CowdHeader {
    pub flags: u32,
    pub capacity: u32,
    pub grain_size: u32,
    pub gd_offset: u32,
    pub num_gd_entries: u32,
}

/// ESX snapshot (SESPARSE) constant header.
#[derive(Debug, Clone)]
pub(crate) struct SeSparseHeader {
    pub capacity: u64,
    pub grain_size: u64,
    /// Grain table size in sectors.
    pub grain_table_size: u64,
    pub flags: u64,
    pub gd_offset: u64,
    pub gd_size: u64,
    pub grain_tables_offset: u64,
    pub grains_offset: u64,
}

/// The header of a sparse extent, whatever its dialect.
#[derive(Debug, Clone)]
pub(crate) enum SparseHeader {
    Hosted(HostedSparseHeader),
    Cowd(CowdHeader),
    SeSparse(SeSparseHeader),
}

impl SparseHeader {
    /// Reads and dispatches on the 4-byte magic at `offset`.
    pub(crate) fn read(source: &mut dyn ByteSource, offset: u64) -> Result<Self> {
        let mut buf = [0u8; 512];
        read_exact_at(source, offset, &mut buf)?;

        match &buf[..4] {
            magic if magic == SPARSE_MAGIC => {
                let header = HostedSparseHeader {
                    version: u32_le(&buf, 4),
                    flags: u32_le(&buf, 8),
                    capacity: u64_le(&buf, 12),
                    grain_size: u64_le(&buf, 20),
                    descriptor_offset: u64_le(&buf, 28),
                    descriptor_size: u64_le(&buf, 36),
                    num_gtes_per_gt: u32_le(&buf, 44),
                    gd_offset: u64_le(&buf, 56),
                    compress_algorithm: u16_le(&buf, 77),
                };
                if header.version > 3 {
                    return Err(Error::unsupported(format!(
                        "sparse VMDK version {}",
                        header.version
                    )));
                }
                Ok(Self::Hosted(header))
            }
            magic if magic == COWD_MAGIC => Ok(Self::Cowd(CowdHeader {
                flags: u32_le(&buf, 8),
                capacity: u32_le(&buf, 12),
                grain_size: u32_le(&buf, 16),
                gd_offset: u32_le(&buf, 20),
                num_gd_entries: u32_le(&buf, 24),
            })),
            magic if magic == SESPARSE_MAGIC => Ok(Self::SeSparse(SeSparseHeader {
                capacity: u64_le(&buf, 16),
                grain_size: u64_le(&buf, 24),
                grain_table_size: u64_le(&buf, 32),
                flags: u64_le(&buf, 40),
                gd_offset: u64_le(&buf, 128),
                gd_size: u64_le(&buf, 136),
                grain_tables_offset: u64_le(&buf, 144),
                grains_offset: u64_le(&buf, 192),
            })),
            magic => Err(Error::unsupported(format!(
                "sparse extent magic {:02x?}",
                magic
            ))),
        }
    }

    /// Capacity of the extent in sectors.
    pub(crate) fn capacity_sectors(&self) -> u64 {
        match self {
            Self::Hosted(h) => h.capacity,
            Self::Cowd(h) => h.capacity as u64,
            Self::SeSparse(h) => h.capacity,
        }
    }

    /// Grain size in sectors.
    pub(crate) fn grain_size(&self) -> u64 {
        match self {
            Self::Hosted(h) => h.grain_size,
            Self::Cowd(h) => h.grain_size as u64,
            Self::SeSparse(h) => h.grain_size,
        }
    }

    /// Grain directory offset in sectors.
    pub(crate) fn gd_offset(&self) -> u64 {
        match self {
            Self::Hosted(h) => h.gd_offset,
            Self::Cowd(h) => h.gd_offset as u64,
            Self::SeSparse(h) => h.gd_offset,
        }
    }

    pub(crate) fn is_compressed(&self) -> bool {
        self.flags() & FLAG_COMPRESSED != 0
    }

    pub(crate) fn has_embedded_lba(&self) -> bool {
        self.flags() & FLAG_EMBEDDED_LBA != 0
    }

    fn flags(&self) -> u64 {
        match self {
            Self::Hosted(h) => h.flags as u64,
            Self::Cowd(h) => h.flags as u64,
            Self::SeSparse(h) => h.flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    pub(crate) fn hosted_header_bytes(
        capacity: u64,
        grain_size: u64,
        gtes_per_gt: u32,
        gd_offset: u64,
        flags: u32,
    ) -> [u8; 512] {
        let mut buf = [0u8; 512];
        buf[..4].copy_from_slice(SPARSE_MAGIC);
        buf[4..8].copy_from_slice(&1u32.to_le_bytes());
        buf[8..12].copy_from_slice(&flags.to_le_bytes());
        buf[12..20].copy_from_slice(&capacity.to_le_bytes());
        buf[20..28].copy_from_slice(&grain_size.to_le_bytes());
        buf[44..48].copy_from_slice(&gtes_per_gt.to_le_bytes());
        buf[56..64].copy_from_slice(&gd_offset.to_le_bytes());
        buf[77..79].copy_from_slice(&1u16.to_le_bytes());
        buf
    }

    #[test]
    fn test_parse_hosted() {
        let buf = hosted_header_bytes(2048, 128, 512, 100, 1 | 1 << 16);
        let header = SparseHeader::read(&mut Cursor::new(buf.to_vec()), 0).unwrap();
        assert_eq!(header.capacity_sectors(), 2048);
        assert_eq!(header.grain_size(), 128);
        assert_eq!(header.gd_offset(), 100);
        assert!(header.is_compressed());
        assert!(!header.has_embedded_lba());
    }

    #[test]
    fn test_parse_cowd() {
        let mut buf = vec![0u8; 512];
        buf[..4].copy_from_slice(COWD_MAGIC);
        buf[4..8].copy_from_slice(&1u32.to_le_bytes());
        buf[12..16].copy_from_slice(&8192u32.to_le_bytes());
        buf[16..20].copy_from_slice(&512u32.to_le_bytes());
        buf[20..24].copy_from_slice(&4u32.to_le_bytes());
        buf[24..28].copy_from_slice(&1u32.to_le_bytes());

        let header = SparseHeader::read(&mut Cursor::new(buf), 0).unwrap();
        assert_eq!(header.capacity_sectors(), 8192);
        assert_eq!(header.grain_size(), 512);
        assert_eq!(header.gd_offset(), 4);
        assert!(!header.is_compressed());
    }

    #[test]
    fn test_parse_sesparse() {
        let mut buf = vec![0u8; 512];
        buf[..4].copy_from_slice(SESPARSE_MAGIC);
        buf[8..16].copy_from_slice(&2u64.to_le_bytes());
        buf[16..24].copy_from_slice(&16384u64.to_le_bytes());
        buf[24..32].copy_from_slice(&8u64.to_le_bytes());
        buf[32..40].copy_from_slice(&8u64.to_le_bytes());
        buf[128..136].copy_from_slice(&10u64.to_le_bytes());
        buf[144..152].copy_from_slice(&20u64.to_le_bytes());
        buf[192..200].copy_from_slice(&1000u64.to_le_bytes());

        let header = SparseHeader::read(&mut Cursor::new(buf), 0).unwrap();
        let SparseHeader::SeSparse(se) = &header else {
            panic!("expected SESPARSE header");
        };
        assert_eq!(se.capacity, 16384);
        assert_eq!(se.grain_table_size, 8);
        assert_eq!(se.grain_tables_offset, 20);
        assert_eq!(se.grains_offset, 1000);
    }

    #[test]
    fn test_unknown_magic() {
        let buf = vec![0u8; 512];
        assert!(matches!(
            SparseHeader::read(&mut Cursor::new(buf), 0).unwrap_err(),
            Error::UnsupportedFormat { .. }
        ));
    }
}
