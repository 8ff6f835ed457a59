//! Sparse VMDK extents: hosted (`KDMV`), legacy COW (`COWD`) and ESX
//! snapshot (`SEVM`) dialects.
//!
//! Reads are planned as runs before any I/O: consecutive sectors resolving to
//! the same fate (parent, zeros, or contiguous payload) collapse into a
//! single dispatch. Grain tables are fetched per lookup; only the grain
//! directory is held in memory.

use std::io::Read;

use flate2::read::ZlibDecoder;

use crate::codec::{u32_le, u64_le};
use crate::error::{Error, Result};
use crate::source::{read_vec_at, source_len, ByteSource};

use super::descriptor::DiskDescriptor;
use super::header::{SparseHeader, GD_AT_END};
use super::SECTOR_SIZE;

/// SESPARSE grain-directory entries are valid only with this tag in the
/// high 32 bits.
const SESPARSE_GD_VALID: u64 = 0x1000_0000_0000_0000;
const SESPARSE_GD_TAG_MASK: u64 = 0xFFFF_FFFF_0000_0000;
const SESPARSE_GD_INDEX_MASK: u64 = 0x0000_0000_FFFF_FFFF;

/// SESPARSE grain-table entry types, tagged in the high 4 bits.
const SESPARSE_GRAIN_TYPE_MASK: u64 = 0xF000_0000_0000_0000;
const SESPARSE_GRAIN_UNALLOCATED: u64 = 0x0000_0000_0000_0000;
const SESPARSE_GRAIN_FALLTHROUGH: u64 = 0x1000_0000_0000_0000;
const SESPARSE_GRAIN_ZERO: u64 = 0x2000_0000_0000_0000;
const SESPARSE_GRAIN_ALLOCATED: u64 = 0x3000_0000_0000_0000;

/// Where one grain's data comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrainLocation {
    /// Not in this extent; the parent (or zeros) supplies the bytes.
    Absent,
    /// Explicitly zero.
    Zero,
    /// Payload starts at this sector of the backing file.
    Data(u64),
}

/// How a planned run is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunKind {
    /// Recurse into the parent image at the run's logical position.
    Parent,
    /// Synthesize zeros.
    Zero,
    /// Read from this extent's backing file.
    Data {
        /// First payload sector of the run's first grain.
        payload: u64,
        /// Sector offset into that first grain.
        grain_offset: u64,
    },
}

/// A planned group of contiguous sectors with one fate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GrainRun {
    pub kind: RunKind,
    /// Extent-relative start sector.
    pub start: u64,
    pub count: u64,
}

/// A sparse extent with its grain directory resident.
pub(crate) struct SparseExtent {
    source: Box<dyn ByteSource>,
    header: SparseHeader,
    grain_directory: Vec<u64>,
    /// Entries per grain table.
    grain_table_len: u64,
    descriptor: Option<DiskDescriptor>,
}

impl SparseExtent {
    pub(crate) fn open(mut source: Box<dyn ByteSource>) -> Result<Self> {
        let file_len = source_len(&mut *source)?;
        let mut header = SparseHeader::read(&mut *source, 0)?;

        // A hosted sparse written as a stream stores the authoritative
        // header copy in the footer, 1024 bytes before the end.
        if matches!(header, SparseHeader::Hosted(_) | SparseHeader::Cowd(_))
            && header.gd_offset() == GD_AT_END
        {
            if file_len < 1024 {
                return Err(Error::corrupt("sparse extent too short for a footer"));
            }
            header = SparseHeader::read(&mut *source, file_len - 1024)?;
        }

        let (gd_len, grain_table_len, descriptor) = match &header {
            SparseHeader::Hosted(h) => {
                if h.grain_size == 0 || h.num_gtes_per_gt == 0 {
                    return Err(Error::corrupt("hosted sparse header with zero geometry"));
                }
                if header.is_compressed() && h.compress_algorithm != 1 {
                    return Err(Error::unsupported(format!(
                        "compression algorithm {}",
                        h.compress_algorithm
                    )));
                }
                let coverage = h.num_gtes_per_gt as u64 * h.grain_size;
                let gd_len = h.capacity.div_ceil(coverage);

                let descriptor = if h.descriptor_size > 0 {
                    let raw = read_vec_at(
                        &mut *source,
                        h.descriptor_offset * SECTOR_SIZE,
                        (h.descriptor_size * SECTOR_SIZE) as usize,
                    )?;
                    let text = String::from_utf8_lossy(&raw);
                    Some(DiskDescriptor::parse(text.trim_end_matches('\0'))?)
                } else {
                    None
                };
                (gd_len, h.num_gtes_per_gt as u64, descriptor)
            }
            SparseHeader::Cowd(h) => {
                if h.grain_size == 0 {
                    return Err(Error::corrupt("COWD header with zero grain size"));
                }
                (h.num_gd_entries as u64, 4096, None)
            }
            SparseHeader::SeSparse(h) => {
                if h.grain_size == 0 || h.grain_table_size == 0 {
                    return Err(Error::corrupt("SESPARSE header with zero geometry"));
                }
                (
                    h.gd_size * SECTOR_SIZE / 8,
                    h.grain_table_size * SECTOR_SIZE / 8,
                    None,
                )
            }
        };

        let grain_directory =
            read_grain_directory(&mut *source, &header, header.gd_offset(), gd_len)?;

        Ok(Self {
            source,
            header,
            grain_directory,
            grain_table_len,
            descriptor,
        })
    }

    /// Capacity of this extent in sectors.
    pub(crate) fn sector_count(&self) -> u64 {
        self.header.capacity_sectors()
    }

    /// The descriptor embedded in a hosted sparse extent, if any.
    pub(crate) fn descriptor(&self) -> Option<&DiskDescriptor> {
        self.descriptor.as_ref()
    }

    /// Plans `count` sectors starting at extent-relative `start` into runs,
    /// before any payload I/O happens.
    pub(crate) fn plan_runs(&mut self, start: u64, count: u64) -> Result<Vec<GrainRun>> {
        let grain_size = self.header.grain_size();
        let mut runs: Vec<GrainRun> = Vec::new();
        // Payload sector that would continue the current data run.
        let mut expected_next = 0u64;

        let mut sector = start;
        let mut remaining = count;
        while remaining > 0 {
            let grain = sector / grain_size;
            let offset_in_grain = sector % grain_size;
            let piece = remaining.min(grain_size - offset_in_grain);
            let location = self.lookup_grain(grain)?;

            let extended = match runs.last_mut() {
                Some(run) => match (run.kind, location) {
                    (RunKind::Parent, GrainLocation::Absent)
                    | (RunKind::Zero, GrainLocation::Zero) => {
                        run.count += piece;
                        true
                    }
                    (RunKind::Data { .. }, GrainLocation::Data(payload))
                        if payload == expected_next =>
                    {
                        run.count += piece;
                        expected_next += grain_size;
                        true
                    }
                    _ => false,
                },
                None => false,
            };

            if !extended {
                let kind = match location {
                    GrainLocation::Absent => RunKind::Parent,
                    GrainLocation::Zero => RunKind::Zero,
                    GrainLocation::Data(payload) => {
                        expected_next = payload + grain_size;
                        RunKind::Data {
                            payload,
                            grain_offset: offset_in_grain,
                        }
                    }
                };
                runs.push(GrainRun {
                    kind,
                    start: sector,
                    count: piece,
                });
            }

            sector += piece;
            remaining -= piece;
        }

        Ok(runs)
    }

    /// Executes a `Data` run against the backing file.
    pub(crate) fn read_run(&mut self, run: &GrainRun) -> Result<Vec<u8>> {
        let RunKind::Data {
            payload,
            grain_offset,
        } = run.kind
        else {
            return Err(Error::corrupt("data run expected"));
        };

        if !self.header.is_compressed() {
            return read_vec_at(
                &mut *self.source,
                (payload + grain_offset) * SECTOR_SIZE,
                (run.count * SECTOR_SIZE) as usize,
            );
        }

        // Compressed grains decompress whole; splice out the requested
        // sub-range grain by grain.
        let grain_size = self.header.grain_size();
        let mut out = Vec::with_capacity((run.count * SECTOR_SIZE) as usize);
        let mut grain_start = payload;
        let mut offset_in_grain = grain_offset;
        let mut remaining = run.count;
        while remaining > 0 {
            let take = remaining.min(grain_size - offset_in_grain);
            let grain = self.read_compressed_grain(grain_start)?;
            let from = (offset_in_grain * SECTOR_SIZE) as usize;
            let to = ((offset_in_grain + take) * SECTOR_SIZE) as usize;
            out.extend_from_slice(&grain[from..to]);

            offset_in_grain = 0;
            grain_start += grain_size;
            remaining -= take;
        }
        Ok(out)
    }

    /// Reads and inflates one compressed grain starting at `sector`.
    ///
    /// The first sector holds the compressed length (after the 8-byte LBA
    /// when the embedded-LBA flag is set) and the first payload bytes; longer
    /// payloads spill into following sectors.
    fn read_compressed_grain(&mut self, sector: u64) -> Result<Vec<u8>> {
        let mut buf = read_vec_at(&mut *self.source, sector * SECTOR_SIZE, SECTOR_SIZE as usize)?;

        let compressed_len = if self.header.has_embedded_lba() {
            u32_le(&buf, 8) as usize
        } else {
            u32_le(&buf, 0) as usize
        };

        if compressed_len + 12 > SECTOR_SIZE as usize {
            let spill = compressed_len + 12 - SECTOR_SIZE as usize;
            let rest = read_vec_at(&mut *self.source, (sector + 1) * SECTOR_SIZE, spill)?;
            buf.extend_from_slice(&rest);
        }

        let mut decoder = ZlibDecoder::new(&buf[12..12 + compressed_len]);
        let mut grain = Vec::new();
        decoder
            .read_to_end(&mut grain)
            .map_err(|e| Error::corrupt(format!("grain inflate failed: {}", e)))?;

        let expected = (self.header.grain_size() * SECTOR_SIZE) as usize;
        if grain.len() != expected {
            return Err(Error::corrupt(format!(
                "compressed grain inflated to {} bytes, expected {}",
                grain.len(),
                expected
            )));
        }
        Ok(grain)
    }

    /// Resolves one grain number through the directory and its table.
    fn lookup_grain(&mut self, grain: u64) -> Result<GrainLocation> {
        let table = grain / self.grain_table_len;
        let index = grain % self.grain_table_len;

        let dir_entry = *self.grain_directory.get(table as usize).ok_or_else(|| {
            Error::out_of_bounds(format!(
                "grain table {} (directory has {} entries)",
                table,
                self.grain_directory.len()
            ))
        })?;

        match &self.header {
            SparseHeader::SeSparse(h) => {
                if dir_entry & SESPARSE_GD_TAG_MASK != SESPARSE_GD_VALID {
                    return Ok(GrainLocation::Absent);
                }
                let table_index = dir_entry & SESPARSE_GD_INDEX_MASK;
                let table_sector = h.grain_tables_offset
                    + table_index * (self.grain_table_len * 8) / SECTOR_SIZE;
                let raw = read_vec_at(
                    &mut *self.source,
                    table_sector * SECTOR_SIZE + index * 8,
                    8,
                )?;
                let entry = u64_le(&raw, 0);

                match entry & SESPARSE_GRAIN_TYPE_MASK {
                    SESPARSE_GRAIN_UNALLOCATED | SESPARSE_GRAIN_FALLTHROUGH => {
                        Ok(GrainLocation::Absent)
                    }
                    SESPARSE_GRAIN_ZERO => Ok(GrainLocation::Zero),
                    SESPARSE_GRAIN_ALLOCATED => {
                        let cluster = (entry & 0x0FFF_0000_0000_0000) >> 48
                            | (entry & 0x0000_FFFF_FFFF_FFFF) << 12;
                        Ok(GrainLocation::Data(
                            h.grains_offset + cluster * h.grain_size,
                        ))
                    }
                    tag => Err(Error::corrupt(format!(
                        "SESPARSE grain type {:#x}",
                        tag >> 60
                    ))),
                }
            }
            _ => {
                if dir_entry == 0 {
                    return Ok(GrainLocation::Absent);
                }
                let raw = read_vec_at(
                    &mut *self.source,
                    dir_entry * SECTOR_SIZE + index * 4,
                    4,
                )?;
                match u32_le(&raw, 0) as u64 {
                    0 => Ok(GrainLocation::Absent),
                    1 => Ok(GrainLocation::Zero),
                    payload => Ok(GrainLocation::Data(payload)),
                }
            }
        }
    }
}

/// Loads the grain directory: 32-bit entries for VMDK/COWD, 64-bit for
/// SESPARSE.
fn read_grain_directory(
    source: &mut dyn ByteSource,
    header: &SparseHeader,
    gd_offset: u64,
    gd_len: u64,
) -> Result<Vec<u64>> {
    match header {
        SparseHeader::SeSparse(_) => {
            let raw = read_vec_at(source, gd_offset * SECTOR_SIZE, gd_len as usize * 8)?;
            Ok((0..gd_len as usize).map(|i| u64_le(&raw, i * 8)).collect())
        }
        _ => {
            let raw = read_vec_at(source, gd_offset * SECTOR_SIZE, gd_len as usize * 4)?;
            Ok((0..gd_len as usize)
                .map(|i| u32_le(&raw, i * 4) as u64)
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    use super::super::header::SPARSE_MAGIC;

    const GRAIN: u64 = 4;
    const GTES: u32 = 8;

    /// A tiny hosted sparse extent: capacity 64 sectors, grain size 4, one
    /// grain table at sector 2, grains laid out from sector 10.
    fn hosted_fixture(entries: &[u32]) -> Vec<u8> {
        let mut data = vec![0u8; 64 * SECTOR_SIZE as usize];
        data[..4].copy_from_slice(SPARSE_MAGIC);
        data[4..8].copy_from_slice(&1u32.to_le_bytes());
        data[12..20].copy_from_slice(&64u64.to_le_bytes());
        data[20..28].copy_from_slice(&GRAIN.to_le_bytes());
        data[44..48].copy_from_slice(&GTES.to_le_bytes());
        data[56..64].copy_from_slice(&1u64.to_le_bytes()); // GD at sector 1

        // Grain directory: two entries, both pointing at the table in
        // sector 2.
        let gd_at = SECTOR_SIZE as usize;
        data[gd_at..gd_at + 4].copy_from_slice(&2u32.to_le_bytes());
        data[gd_at + 4..gd_at + 8].copy_from_slice(&2u32.to_le_bytes());

        let gt_at = 2 * SECTOR_SIZE as usize;
        for (i, entry) in entries.iter().enumerate() {
            data[gt_at + i * 4..gt_at + i * 4 + 4].copy_from_slice(&entry.to_le_bytes());
        }

        // Distinct payload per grain so splices are checkable.
        for grain in 0..8u8 {
            let at = (10 + grain as usize * GRAIN as usize) * SECTOR_SIZE as usize;
            for (j, byte) in data[at..at + (GRAIN * SECTOR_SIZE) as usize]
                .iter_mut()
                .enumerate()
            {
                *byte = grain.wrapping_mul(31).wrapping_add((j / 512) as u8);
            }
        }
        data
    }

    fn open_fixture(entries: &[u32]) -> SparseExtent {
        SparseExtent::open(Box::new(Cursor::new(hosted_fixture(entries)))).unwrap()
    }

    #[test]
    fn test_plan_coalesces_contiguous_payload() {
        // Grains 0 and 1 are physically adjacent (sectors 10 and 14); grain 2
        // is absent; grain 3 is zero-flagged.
        let mut extent = open_fixture(&[10, 14, 0, 1]);
        let runs = extent.plan_runs(0, 16).unwrap();
        assert_eq!(
            runs,
            vec![
                GrainRun {
                    kind: RunKind::Data {
                        payload: 10,
                        grain_offset: 0
                    },
                    start: 0,
                    count: 8
                },
                GrainRun {
                    kind: RunKind::Parent,
                    start: 8,
                    count: 4
                },
                GrainRun {
                    kind: RunKind::Zero,
                    start: 12,
                    count: 4
                },
            ]
        );
    }

    #[test]
    fn test_plan_splits_discontiguous_payload() {
        // Grain 1 lives *before* grain 0 in the file, so no coalescing.
        let mut extent = open_fixture(&[14, 10]);
        let runs = extent.plan_runs(0, 8).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(
            runs[0].kind,
            RunKind::Data {
                payload: 14,
                grain_offset: 0
            }
        );
        assert_eq!(
            runs[1].kind,
            RunKind::Data {
                payload: 10,
                grain_offset: 0
            }
        );
    }

    #[test]
    fn test_plan_mid_grain_start() {
        let mut extent = open_fixture(&[10]);
        let runs = extent.plan_runs(1, 2).unwrap();
        assert_eq!(
            runs,
            vec![GrainRun {
                kind: RunKind::Data {
                    payload: 10,
                    grain_offset: 1
                },
                start: 1,
                count: 2
            }]
        );
    }

    #[test]
    fn test_read_run_uncompressed() {
        let mut extent = open_fixture(&[10]);
        let runs = extent.plan_runs(1, 2).unwrap();
        let data = extent.read_run(&runs[0]).unwrap();
        assert_eq!(data.len(), 2 * SECTOR_SIZE as usize);
        // Sector 1 of grain 0: filler pattern 0*31 + 1.
        assert_eq!(data[0], 1);
        assert_eq!(data[SECTOR_SIZE as usize], 2);
    }

    #[test]
    fn test_compressed_grain_roundtrip_splice() {
        // One compressed grain at sector 3, embedded-LBA layout.
        let grain_bytes: Vec<u8> = (0..GRAIN * SECTOR_SIZE).map(|i| (i / 512) as u8).collect();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&grain_bytes).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut data = vec![0u8; 16 * SECTOR_SIZE as usize];
        data[..4].copy_from_slice(SPARSE_MAGIC);
        data[4..8].copy_from_slice(&3u32.to_le_bytes());
        let flags: u32 = 1 << 16 | 1 << 17;
        data[8..12].copy_from_slice(&flags.to_le_bytes());
        data[12..20].copy_from_slice(&(GRAIN * 2).to_le_bytes());
        data[20..28].copy_from_slice(&GRAIN.to_le_bytes());
        data[44..48].copy_from_slice(&GTES.to_le_bytes());
        data[56..64].copy_from_slice(&1u64.to_le_bytes());
        data[77..79].copy_from_slice(&1u16.to_le_bytes()); // deflate

        let gd_at = SECTOR_SIZE as usize;
        data[gd_at..gd_at + 4].copy_from_slice(&2u32.to_le_bytes());
        let gt_at = 2 * SECTOR_SIZE as usize;
        data[gt_at..gt_at + 4].copy_from_slice(&3u32.to_le_bytes());

        // Grain marker: LBA 0, then the compressed length, then the stream.
        let marker_at = 3 * SECTOR_SIZE as usize;
        data[marker_at + 8..marker_at + 12]
            .copy_from_slice(&(compressed.len() as u32).to_le_bytes());
        data[marker_at + 12..marker_at + 12 + compressed.len()].copy_from_slice(&compressed);

        let mut extent = SparseExtent::open(Box::new(Cursor::new(data))).unwrap();
        let runs = extent.plan_runs(1, 2).unwrap();
        assert_eq!(runs.len(), 1);
        let spliced = extent.read_run(&runs[0]).unwrap();
        assert_eq!(spliced.len(), 2 * SECTOR_SIZE as usize);
        assert!(spliced[..SECTOR_SIZE as usize].iter().all(|&b| b == 1));
        assert!(spliced[SECTOR_SIZE as usize..].iter().all(|&b| b == 2));
    }

    #[test]
    fn test_grain_lookup_past_directory() {
        let mut extent = open_fixture(&[10]);
        // Capacity 64 sectors / (8 GTEs * 4 sectors) = 2 directory entries.
        assert!(extent.plan_runs(0, 64).is_ok());
        assert!(matches!(
            extent.plan_runs(64, 4).unwrap_err(),
            Error::OutOfBounds { .. }
        ));
    }
}
