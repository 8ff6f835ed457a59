//! VHDX file identifier and header decoding.
//!
//! The file opens with the `vhdxfile` identifier, followed by two header
//! copies at 64 KiB and 128 KiB. Writers alternate between the copies, so the
//! one with the higher sequence number is current; on a tie the second copy
//! wins.

use uuid::Uuid;

use crate::codec::{u16_le, u32_le, u64_le};
use crate::error::{Error, Result};
use crate::source::{read_exact_at, ByteSource};

/// VHDX structures are aligned to 64 KiB.
pub(crate) const ALIGNMENT: u64 = 64 * 1024;

const FILE_IDENTIFIER_MAGIC: &[u8; 8] = b"vhdxfile";
const HEADER_MAGIC: &[u8; 4] = b"head";

/// One of the two header copies.
#[derive(Debug, Clone)]
pub(crate) struct Header {
    signature: [u8; 4],
    pub sequence_number: u64,
    pub log_guid: Uuid,
    pub version: u16,
    pub log_length: u32,
}

impl Header {
    fn read(source: &mut dyn ByteSource, offset: u64) -> Result<Self> {
        let mut buf = [0u8; 80];
        read_exact_at(source, offset, &mut buf)?;
        Ok(Self {
            signature: [buf[0], buf[1], buf[2], buf[3]],
            sequence_number: u64_le(&buf, 8),
            log_guid: Uuid::from_bytes_le(crate::codec::guid(&buf, 48)),
            version: u16_le(&buf, 66),
            log_length: u32_le(&buf, 68),
        })
    }
}

/// Checks the `vhdxfile` identifier at offset 0.
pub(crate) fn read_file_identifier(source: &mut dyn ByteSource) -> Result<()> {
    let mut buf = [0u8; 8];
    read_exact_at(source, 0, &mut buf)?;
    if &buf != FILE_IDENTIFIER_MAGIC {
        return Err(Error::unsupported("bad VHDX file identifier"));
    }
    Ok(())
}

/// Reads both header copies and returns the current one.
pub(crate) fn read_current_header(source: &mut dyn ByteSource) -> Result<Header> {
    let header1 = Header::read(source, ALIGNMENT)?;
    let header2 = Header::read(source, 2 * ALIGNMENT)?;

    // Ties go to the second copy, the one at the larger file offset.
    let current = if header1.sequence_number > header2.sequence_number {
        header1
    } else {
        header2
    };

    if &current.signature != HEADER_MAGIC {
        return Err(Error::corrupt("bad VHDX header signature"));
    }
    if current.version != 1 {
        return Err(Error::corrupt(format!(
            "unknown VHDX header version {}",
            current.version
        )));
    }
    if current.log_guid != Uuid::nil() {
        // Log replay is out of scope; an unflushed log means stale reads.
        log::warn!(
            "VHDX has a pending log ({} bytes), which is not replayed",
            current.log_length
        );
    }
    log::debug!("VHDX header sequence {} selected", current.sequence_number);
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header_bytes(sequence: u64) -> [u8; 80] {
        let mut buf = [0u8; 80];
        buf[..4].copy_from_slice(HEADER_MAGIC);
        buf[8..16].copy_from_slice(&sequence.to_le_bytes());
        buf[66..68].copy_from_slice(&1u16.to_le_bytes());
        buf
    }

    fn image_with_headers(seq1: u64, seq2: u64) -> Vec<u8> {
        let mut data = vec![0u8; 3 * ALIGNMENT as usize];
        data[..8].copy_from_slice(FILE_IDENTIFIER_MAGIC);
        data[ALIGNMENT as usize..ALIGNMENT as usize + 80].copy_from_slice(&header_bytes(seq1));
        data[2 * ALIGNMENT as usize..2 * ALIGNMENT as usize + 80]
            .copy_from_slice(&header_bytes(seq2));
        data
    }

    #[test]
    fn test_higher_sequence_wins() {
        let mut source = Cursor::new(image_with_headers(5, 3));
        let header = read_current_header(&mut source).unwrap();
        assert_eq!(header.sequence_number, 5);
    }

    #[test]
    fn test_tie_goes_to_second() {
        let mut source = Cursor::new(image_with_headers(7, 7));
        let header = read_current_header(&mut source).unwrap();
        assert_eq!(header.sequence_number, 7);
        assert_eq!(header.version, 1);
    }

    #[test]
    fn test_bad_identifier() {
        let data = vec![0u8; 1024];
        assert!(matches!(
            read_file_identifier(&mut Cursor::new(data)).unwrap_err(),
            Error::UnsupportedFormat { .. }
        ));
    }

    #[test]
    fn test_bad_header_signature() {
        let mut data = image_with_headers(1, 2);
        data[2 * ALIGNMENT as usize..2 * ALIGNMENT as usize + 4].copy_from_slice(b"xxxx");
        assert!(matches!(
            read_current_header(&mut Cursor::new(data)).unwrap_err(),
            Error::CorruptMetadata { .. }
        ));
    }
}
