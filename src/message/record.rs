// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! On-disk record frame.
//!
//! Every logical offset of a partition is one frame in a segment data file:
//!
//! ```text
//! size: u32 | crc: u32 | timestamp: i64 | payload: [u8; size]
//! ```
//!
//! All integers are big endian. `crc` is CRC32C over the timestamp bytes
//! followed by the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

pub const RECORD_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub size: u32,
    pub crc: u32,
    pub timestamp: i64,
}

impl RecordHeader {
    pub fn parse(buf: &[u8]) -> AppResult<Self> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(AppError::CorruptRecord(format!(
                "record header needs {} bytes, got {}",
                RECORD_HEADER_SIZE,
                buf.len()
            )));
        }
        let mut cursor = &buf[..RECORD_HEADER_SIZE];
        Ok(Self {
            size: cursor.get_u32(),
            crc: cursor.get_u32(),
            timestamp: cursor.get_i64(),
        })
    }

    /// Length of the whole frame this header starts.
    pub fn frame_size(&self) -> u64 {
        RECORD_HEADER_SIZE as u64 + self.size as u64
    }

    pub fn verify(&self, payload: &[u8]) -> bool {
        record_crc(self.timestamp, payload) == self.crc
    }
}

/// A record read back from a segment together with its logical offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub offset: i64,
    pub timestamp: i64,
    pub payload: Bytes,
}

pub fn record_crc(timestamp: i64, payload: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&timestamp.to_be_bytes());
    crc32c::crc32c_append(crc, payload)
}

pub fn encoded_size(payload: &[u8]) -> usize {
    RECORD_HEADER_SIZE + payload.len()
}

pub fn encode_record(buf: &mut BytesMut, timestamp: i64, payload: &[u8]) {
    buf.reserve(encoded_size(payload));
    buf.put_u32(payload.len() as u32);
    buf.put_u32(record_crc(timestamp, payload));
    buf.put_i64(timestamp);
    buf.put_slice(payload);
}

/// Decodes consecutive frames, numbering them from `first_offset`. The
/// buffer must hold whole frames only.
pub fn decode_records(mut buf: Bytes, first_offset: i64) -> AppResult<Vec<StoredRecord>> {
    let mut records = Vec::new();
    let mut offset = first_offset;
    while buf.has_remaining() {
        let header = RecordHeader::parse(&buf)?;
        if (buf.remaining() as u64) < header.frame_size() {
            return Err(AppError::CorruptRecord(format!(
                "truncated record at offset {}: need {} bytes, {} left",
                offset,
                header.frame_size(),
                buf.remaining()
            )));
        }
        buf.advance(RECORD_HEADER_SIZE);
        let payload = buf.split_to(header.size as usize);
        if !header.verify(&payload) {
            return Err(AppError::CorruptRecord(format!(
                "crc mismatch at offset {}",
                offset
            )));
        }
        records.push(StoredRecord {
            offset,
            timestamp: header.timestamp,
            payload,
        });
        offset += 1;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_decode_in_order() -> AppResult<()> {
        let mut buf = BytesMut::new();
        encode_record(&mut buf, 1_000, b"first");
        encode_record(&mut buf, 1_001, b"");
        encode_record(&mut buf, 1_002, b"third");
        assert_eq!(buf.len(), 3 * RECORD_HEADER_SIZE + 10);

        let records = decode_records(buf.freeze(), 40)?;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].offset, 40);
        assert_eq!(records[0].payload, Bytes::from_static(b"first"));
        assert_eq!(records[1].payload.len(), 0);
        assert_eq!(records[2].offset, 42);
        assert_eq!(records[2].timestamp, 1_002);
        Ok(())
    }

    #[test]
    fn flipped_payload_bit_fails_crc() {
        let mut buf = BytesMut::new();
        encode_record(&mut buf, 7, b"payload");
        let last = buf.len() - 1;
        buf[last] ^= 0x01;

        let result = decode_records(buf.freeze(), 0);
        assert!(matches!(result, Err(AppError::CorruptRecord(_))));
    }

    #[test]
    fn partial_frame_is_reported() {
        let mut buf = BytesMut::new();
        encode_record(&mut buf, 7, b"payload");
        buf.truncate(buf.len() - 2);

        let result = decode_records(buf.freeze(), 0);
        assert!(matches!(result, Err(AppError::CorruptRecord(_))));
    }
}
