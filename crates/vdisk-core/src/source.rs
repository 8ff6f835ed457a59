//! Seekable byte sources backing an image.
//!
//! Every backing file of an image (primary, extents, parents) is accessed
//! through a [`ByteSource`]: a blocking, seekable reader. `std::fs::File`
//! qualifies directly; [`open_mmap`] serves a memory-mapped file through a
//! `Cursor` so the operating system manages caching and paging.

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use memmap2::Mmap;

use crate::error::{Error, Result};

/// A random-access source of bytes: absolute seek plus blocking read.
///
/// Each source is exclusively owned by one image. Reads interleave seek+read
/// pairs on the shared cursor, so an image is single-threaded by construction.
pub trait ByteSource: Read + Seek {}

impl<T: Read + Seek> ByteSource for T {}

/// Opens `path` and serves its contents memory-mapped.
///
/// # Safety
///
/// The map is created from a file we just opened read-only; truncating the
/// file while the image is open is undefined behavior, the usual mmap caveat.
pub fn open_mmap(path: &Path) -> Result<Box<dyn ByteSource>> {
    let file = File::open(path).map_err(|e| Error::io(e, path))?;
    let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? };
    Ok(Box::new(Cursor::new(mmap)))
}

/// Returns the total length of a source, leaving the cursor at the start.
pub(crate) fn source_len(source: &mut dyn ByteSource) -> Result<u64> {
    let len = source.seek(SeekFrom::End(0))?;
    source.seek(SeekFrom::Start(0))?;
    Ok(len)
}

/// Seeks to `offset` and fills `buf` completely.
pub(crate) fn read_exact_at(
    source: &mut dyn ByteSource,
    offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    source.seek(SeekFrom::Start(offset))?;
    source.read_exact(buf)?;
    Ok(())
}

/// Seeks to `offset` and reads `len` bytes into a fresh buffer.
pub(crate) fn read_vec_at(source: &mut dyn ByteSource, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    read_exact_at(source, offset, &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_len_restores_cursor() {
        let mut source = Cursor::new(vec![0u8; 1234]);
        source.seek(SeekFrom::Start(100)).unwrap();
        assert_eq!(source_len(&mut source).unwrap(), 1234);
        assert_eq!(source.position(), 0);
    }

    #[test]
    fn test_read_exact_at() {
        let data: Vec<u8> = (0u8..=255).collect();
        let mut source = Cursor::new(data);
        let mut buf = [0u8; 4];
        read_exact_at(&mut source, 16, &mut buf).unwrap();
        assert_eq!(buf, [16, 17, 18, 19]);
    }

    #[test]
    fn test_read_past_end_is_io_error() {
        let mut source = Cursor::new(vec![0u8; 8]);
        let mut buf = [0u8; 16];
        let err = read_exact_at(&mut source, 0, &mut buf).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_open_mmap() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"virtual disk bytes").unwrap();
        file.flush().unwrap();

        let mut source = open_mmap(file.path()).unwrap();
        assert_eq!(source_len(&mut *source).unwrap(), 18);
        let mut buf = [0u8; 7];
        read_exact_at(&mut *source, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"virtual");
    }
}
