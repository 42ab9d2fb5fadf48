//! On-disk record framing for queue segments.
//!
//! A segment file is a run of back-to-back records:
//!
//! ```text
//! len: u32 | seq: u64 | crc32(payload): u32 | payload
//! ```
//!
//! all little-endian. Recovery scans a segment front to back and stops at
//! the first record that is truncated or fails its checksum; everything
//! after that point is an interrupted write and gets truncated away.

/// Bytes of framing ahead of each payload.
pub const RECORD_HEADER_LEN: usize = 16;

pub fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Appends one framed record to `buf`.
pub fn encode_record(buf: &mut Vec<u8>, seq: u64, payload: &[u8]) {
    buf.reserve(RECORD_HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(&checksum(payload).to_le_bytes());
    buf.extend_from_slice(payload);
}

/// One record located during a segment scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScannedRecord {
    pub seq: u64,
    /// Byte offset of the record header within the segment.
    pub offset: u64,
    /// Payload length.
    pub len: u32,
}

/// Result of scanning a segment.
#[derive(Clone, Debug, Default)]
pub struct SegmentScan {
    pub records: Vec<ScannedRecord>,
    /// The number of leading bytes holding valid records; anything past
    /// this is a torn write.
    pub valid_len: u64,
}

/// Scans segment bytes, collecting valid records until the data ends or
/// turns invalid.
pub fn scan_segment(data: &[u8]) -> SegmentScan {
    let mut scan = SegmentScan::default();
    let mut offset = 0usize;

    while offset + RECORD_HEADER_LEN <= data.len() {
        let len = u32::from_le_bytes(data[offset..offset + 4].try_into().expect("header"))
            as usize;
        let seq =
            u64::from_le_bytes(data[offset + 4..offset + 12].try_into().expect("header"));
        let crc = u32::from_le_bytes(data[offset + 12..offset + 16].try_into().expect("header"));

        let payload_start = offset + RECORD_HEADER_LEN;
        let Some(payload) = data.get(payload_start..payload_start + len) else {
            break;
        };
        if checksum(payload) != crc {
            break;
        }

        scan.records.push(ScannedRecord { seq, offset: offset as u64, len: len as u32 });
        offset = payload_start + len;
        scan.valid_len = offset as u64;
    }

    scan
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_scan_round_trip() {
        let mut buf = Vec::new();
        encode_record(&mut buf, 1, b"first");
        encode_record(&mut buf, 2, b"second record");
        encode_record(&mut buf, 3, b"");

        let scan = scan_segment(&buf);
        assert_eq!(scan.valid_len, buf.len() as u64);
        assert_eq!(
            scan.records,
            vec![
                ScannedRecord { seq: 1, offset: 0, len: 5 },
                ScannedRecord { seq: 2, offset: 21, len: 13 },
                ScannedRecord { seq: 3, offset: 50, len: 0 },
            ]
        );
    }

    #[test]
    fn scan_stops_at_torn_tail() {
        let mut buf = Vec::new();
        encode_record(&mut buf, 1, b"whole");
        let valid = buf.len();
        encode_record(&mut buf, 2, b"interrupted");
        buf.truncate(buf.len() - 3);

        let scan = scan_segment(&buf);
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.valid_len, valid as u64);
    }

    #[test]
    fn scan_stops_at_corrupt_payload() {
        let mut buf = Vec::new();
        encode_record(&mut buf, 1, b"good");
        let valid = buf.len();
        encode_record(&mut buf, 2, b"flipped");
        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        let scan = scan_segment(&buf);
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.valid_len, valid as u64);
    }

    #[test]
    fn scan_empty() {
        let scan = scan_segment(&[]);
        assert!(scan.records.is_empty());
        assert_eq!(scan.valid_len, 0);
    }
}
