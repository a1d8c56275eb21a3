//! Log segment file format.
//!
//! A segment holds consecutive log records starting at the index encoded in
//! its file name. Each record is framed as:
//!
//! ```text
//! [payload_len: u32 LE][crc32(payload): u32 LE][payload]
//! ```
//!
//! Recovery scans records in order and stops at the first frame that is
//! short or fails its checksum; everything from that point on is a torn
//! tail from an interrupted append and is truncated.

use std::fs;
use std::io;
use std::path::Path;

/// Bytes of framing before each payload
pub(crate) const RECORD_HEADER: u64 = 8;

/// Location of one record's payload within its segment file
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordLocation {
    /// Offset of the frame header from the start of the file
    pub offset: u64,
    /// Payload length
    pub len: u32,
}

/// Result of scanning a segment during recovery
#[derive(Debug)]
pub(crate) struct ScannedSegment {
    /// Valid records, in index order
    pub records: Vec<RecordLocation>,
    /// Length of the valid prefix of the file
    pub valid_len: u64,
    /// Whether a torn or corrupt tail was found (and must be truncated)
    pub torn: bool,
}

/// Append one framed record to the buffer
pub(crate) fn encode_record(buf: &mut Vec<u8>, payload: &[u8]) {
    let crc = crc32fast::hash(payload);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(payload);
}

/// Scan a segment file, validating every record's checksum
pub(crate) fn scan_segment(path: &Path) -> io::Result<ScannedSegment> {
    let data = fs::read(path)?;
    let mut records = Vec::new();
    let mut offset = 0u64;

    loop {
        let start = offset as usize;
        if start == data.len() {
            return Ok(ScannedSegment {
                records,
                valid_len: offset,
                torn: false,
            });
        }
        if data.len() - start < RECORD_HEADER as usize {
            break;
        }

        let len = u32::from_le_bytes(data[start..start + 4].try_into().unwrap());
        let crc = u32::from_le_bytes(data[start + 4..start + 8].try_into().unwrap());
        let payload_start = start + RECORD_HEADER as usize;
        let payload_end = payload_start + len as usize;
        if payload_end > data.len() {
            break;
        }
        if crc32fast::hash(&data[payload_start..payload_end]) != crc {
            break;
        }

        records.push(RecordLocation { offset, len });
        offset = payload_end as u64;
    }

    Ok(ScannedSegment {
        records,
        valid_len: offset,
        torn: true,
    })
}

/// Read one record's payload at a known location, re-verifying its checksum
pub(crate) fn read_record(path: &Path, location: RecordLocation) -> io::Result<Option<Vec<u8>>> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::Start(location.offset))?;

    let mut header = [0u8; 8];
    file.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let crc = u32::from_le_bytes(header[4..8].try_into().unwrap());
    if len != location.len {
        return Ok(None);
    }

    let mut payload = vec![0u8; len as usize];
    file.read_exact(&mut payload)?;
    if crc32fast::hash(&payload) != crc {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Segment file name for a starting index
pub(crate) fn segment_file_name(start: u64) -> String {
    format!("{start:020}.log")
}

/// Parse a segment file name back to its starting index
pub(crate) fn parse_segment_file_name(name: &str) -> Option<u64> {
    name.strip_suffix(".log")?.parse().ok()
}
