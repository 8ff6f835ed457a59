//! The top-level image factory and byte-addressed reads.
//!
//! [`VirtualDisk`] sniffs the container magic of the primary byte source and
//! dispatches to the matching decoder. Whatever the family, the result is a
//! flat byte-addressable image: `size()` plus `read_at()`.

use std::path::Path;

use crate::error::{Error, Result};
use crate::resolver::{DirResolver, FileResolver};
use crate::source::{open_mmap, read_exact_at, source_len, ByteSource};
use crate::vhd::VhdImage;
use crate::vhdx::VhdxImage;
use crate::vmdk::VmdkImage;

/// The container family of an opened image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    Vhd,
    Vhdx,
    Vmdk,
}

impl std::fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskFormat::Vhd => f.write_str("VHD"),
            DiskFormat::Vhdx => f.write_str("VHDX"),
            DiskFormat::Vmdk => f.write_str("VMDK"),
        }
    }
}

/// A read-only virtual disk of any supported family.
pub enum VirtualDisk {
    Vhd(VhdImage),
    Vhdx(VhdxImage),
    Vmdk(VmdkImage),
}

impl VirtualDisk {
    /// Opens an image, sniffing the container family from the primary
    /// source.
    ///
    /// `sources` must hold at least the primary backing file; additional
    /// sources are only meaningful for VMDK, where a descriptor's extents
    /// may be handed over up front instead of going through the resolver.
    /// Parents and extents referenced by name are opened via `resolver`.
    pub fn open(
        mut sources: Vec<Box<dyn ByteSource>>,
        resolver: &dyn FileResolver,
    ) -> Result<Self> {
        let primary = sources
            .first_mut()
            .ok_or_else(|| Error::unsupported("no byte source supplied"))?;

        match sniff_format(primary.as_mut())? {
            DiskFormat::Vhdx => {
                let source = sources.remove(0);
                Ok(Self::Vhdx(VhdxImage::open(source, resolver)?))
            }
            DiskFormat::Vhd => {
                let source = sources.remove(0);
                Ok(Self::Vhd(VhdImage::open(source)?))
            }
            DiskFormat::Vmdk => Ok(Self::Vmdk(VmdkImage::open(sources, resolver)?)),
        }
    }

    /// Opens the image at `path`, resolving siblings (parents, extents) in
    /// the same directory.
    pub fn open_path(path: &Path) -> Result<Self> {
        let resolver = DirResolver::for_image(path);
        Self::open(vec![open_mmap(path)?], &resolver)
    }

    /// The container family this image was decoded as.
    pub fn format(&self) -> DiskFormat {
        match self {
            Self::Vhd(_) => DiskFormat::Vhd,
            Self::Vhdx(_) => DiskFormat::Vhdx,
            Self::Vmdk(_) => DiskFormat::Vmdk,
        }
    }

    /// Logical size of the disk in bytes.
    pub fn size(&self) -> u64 {
        match self {
            Self::Vhd(image) => image.size(),
            Self::Vhdx(image) => image.size(),
            Self::Vmdk(image) => image.size(),
        }
    }

    /// Fills `buf` with the guest-visible bytes starting at `offset`,
    /// returning how many were read. Reads touching the end of the disk
    /// return the bytes actually available.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match self {
            Self::Vhd(image) => image.read_at(buf, offset),
            Self::Vhdx(image) => image.read_at(buf, offset),
            Self::Vmdk(image) => image.read_at(buf, offset),
        }
    }
}

/// Identifies the container family from its magic bytes.
///
/// VHDX and the VMDK family sign the start of the file; VHD signs the
/// footer, so the fallback probes the last sector (and the legacy 511-byte
/// position) for `conectix`.
fn sniff_format(source: &mut dyn ByteSource) -> Result<DiskFormat> {
    let len = source_len(source)?;

    let mut head = [0u8; 8];
    if len >= 8 {
        read_exact_at(source, 0, &mut head)?;
    }

    if &head == b"vhdxfile" {
        return Ok(DiskFormat::Vhdx);
    }
    if matches!(&head[..4], b"KDMV" | b"COWD" | b"SEVM" | b"# Di") {
        return Ok(DiskFormat::Vmdk);
    }

    if len >= 512 {
        let mut tail = [0u8; 8];
        read_exact_at(source, len - 512, &mut tail)?;
        if &tail == b"conectix" {
            return Ok(DiskFormat::Vhd);
        }
        read_exact_at(source, len - 511, &mut tail)?;
        if &tail == b"conectix" {
            return Ok(DiskFormat::Vhd);
        }
    }

    Err(Error::unsupported(format!(
        "unrecognized container magic {:02x?}",
        &head[..4.min(len as usize)]
    )))
}

/// Shared byte-range read on top of a sector interface.
///
/// Translates `offset` into `(sector, offset_in_sector)`, reads enough
/// sectors to cover the request, and slices. The read is clamped to the
/// declared image size, so reads past the end return short counts instead
/// of errors.
pub(crate) fn read_at_sectors<F>(
    size: u64,
    sector_size: u64,
    buf: &mut [u8],
    offset: u64,
    mut read_sectors: F,
) -> Result<usize>
where
    F: FnMut(u64, u64) -> Result<Vec<u8>>,
{
    if buf.is_empty() || offset >= size {
        return Ok(0);
    }

    let want = (buf.len() as u64).min(size - offset) as usize;
    let sector = offset / sector_size;
    let offset_in_sector = (offset % sector_size) as usize;
    let count = (want as u64 + offset_in_sector as u64).div_ceil(sector_size);

    let data = read_sectors(sector, count)?;
    buf[..want].copy_from_slice(&data[offset_in_sector..offset_in_sector + want]);
    Ok(want)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_sniff_vhdx() {
        let mut data = vec![0u8; 1024];
        data[..8].copy_from_slice(b"vhdxfile");
        assert_eq!(
            sniff_format(&mut Cursor::new(data)).unwrap(),
            DiskFormat::Vhdx
        );
    }

    #[test]
    fn test_sniff_vmdk_family() {
        for magic in [b"KDMV", b"COWD", b"SEVM", b"# Di"] {
            let mut data = vec![0u8; 512];
            data[..4].copy_from_slice(magic);
            assert_eq!(
                sniff_format(&mut Cursor::new(data)).unwrap(),
                DiskFormat::Vmdk
            );
        }
    }

    #[test]
    fn test_sniff_vhd_footer() {
        let mut data = vec![0u8; 4096];
        let footer_at = data.len() - 512;
        data[footer_at..footer_at + 8].copy_from_slice(b"conectix");
        assert_eq!(
            sniff_format(&mut Cursor::new(data)).unwrap(),
            DiskFormat::Vhd
        );
    }

    #[test]
    fn test_sniff_unknown() {
        let data = vec![0xAAu8; 4096];
        assert!(matches!(
            sniff_format(&mut Cursor::new(data)).unwrap_err(),
            Error::UnsupportedFormat { .. }
        ));
    }

    #[test]
    fn test_read_at_sectors_clamps_at_end() {
        let mut buf = [0u8; 100];
        let n = read_at_sectors(64, 16, &mut buf, 32, |sector, count| {
            assert_eq!(sector, 2);
            assert_eq!(count, 2);
            Ok(vec![0xCC; (count * 16) as usize])
        })
        .unwrap();
        assert_eq!(n, 32);
        assert!(buf[..32].iter().all(|&b| b == 0xCC));
    }

    #[test]
    fn test_read_at_sectors_offset_in_sector() {
        let mut buf = [0u8; 4];
        let n = read_at_sectors(64, 16, &mut buf, 30, |sector, count| {
            assert_eq!(sector, 1);
            assert_eq!(count, 2);
            Ok((0u8..32).collect())
        })
        .unwrap();
        assert_eq!(n, 4);
        // Offset 30 is 14 bytes into sector 1.
        assert_eq!(buf, [14, 15, 16, 17]);
    }

    #[test]
    fn test_read_at_sectors_past_end() {
        let n = read_at_sectors(64, 16, &mut [0u8; 8], 64, |_, _| unreachable!()).unwrap();
        assert_eq!(n, 0);
    }
}
