//! Binary snapshot format for lock holder maps.
//!
//! Used to hand lock state to a new partition owner and to restore it after
//! a restart.
//!
//! # Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │ MAGIC: [u8; 4] = "LKSN" (LocK SNapshot)         │
//! ├─────────────────────────────────────────────────┤
//! │ VERSION: u32 = 1                                │
//! ├─────────────────────────────────────────────────┤
//! │ SECTION_COUNT: u32                              │
//! ├─────────────────────────────────────────────────┤
//! │ SECTIONS                                        │
//! │   ENTRY_COUNT: u64                              │
//! │   Entry: key_len(4) + key + val_len(4) + value  │
//! │   (value is the bincode encoding of a holder)   │
//! ├─────────────────────────────────────────────────┤
//! │ CRC32: u32                                      │
//! └─────────────────────────────────────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISCSI};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// CRC-32 calculator (iSCSI polynomial)
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Magic number: "LKSN" (LocK SNapshot)
const MAGIC: [u8; 4] = [b'L', b'K', b'S', b'N'];

/// Format version
const VERSION: u32 = 1;

/// Header size: magic(4) + version(4) + section_count(4)
const HEADER_SIZE: usize = 12;

/// Errors during snapshot encoding/decoding
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("invalid magic number")]
    InvalidMagic,

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),

    #[error("truncated data: expected at least {expected} bytes, got {actual}")]
    TruncatedData { expected: usize, actual: usize },

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("value encoding failed: {0}")]
    Encode(String),

    #[error("value decoding failed: {0}")]
    Decode(String),

    #[error("unexpected section count: expected {expected}, got {actual}")]
    SectionCount { expected: u32, actual: u32 },
}

/// Builds a snapshot out of one or more sections.
pub struct SnapshotWriter {
    buf: BytesMut,
    sections: u32,
}

impl SnapshotWriter {
    /// Start a new snapshot.
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(&MAGIC);
        buf.put_u32_le(VERSION);
        buf.put_u32_le(0);
        Self { buf, sections: 0 }
    }

    /// Append a section of `(key, value)` entries.
    pub fn write_section<V: Serialize>(&mut self, entries: &[(String, V)]) -> Result<(), SnapshotError> {
        self.buf.put_u64_le(entries.len() as u64);
        for (key, value) in entries {
            let encoded =
                bincode::serialize(value).map_err(|e| SnapshotError::Encode(e.to_string()))?;
            self.buf.put_u32_le(key.len() as u32);
            self.buf.put_slice(key.as_bytes());
            self.buf.put_u32_le(encoded.len() as u32);
            self.buf.put_slice(&encoded);
        }
        self.sections += 1;
        Ok(())
    }

    /// Seal the snapshot with its section count and checksum.
    pub fn finish(mut self) -> Bytes {
        self.buf[8..12].copy_from_slice(&self.sections.to_le_bytes());
        let crc = CRC32.checksum(&self.buf);
        self.buf.put_u32_le(crc);
        self.buf.freeze()
    }
}

impl Default for SnapshotWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads sections back out of a verified snapshot.
pub struct SnapshotReader<'a> {
    body: &'a [u8],
    sections: u32,
    read: u32,
}

impl<'a> SnapshotReader<'a> {
    /// Verify the header and checksum of `data`.
    pub fn new(data: &'a [u8]) -> Result<Self, SnapshotError> {
        if data.len() < HEADER_SIZE + 4 {
            return Err(SnapshotError::TruncatedData {
                expected: HEADER_SIZE + 4,
                actual: data.len(),
            });
        }

        // Check magic first (before CRC) for clearer error messages
        if data[0..4] != MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }

        let crc_offset = data.len() - 4;
        let mut stored = &data[crc_offset..];
        let stored_crc = stored.get_u32_le();
        let computed_crc = CRC32.checksum(&data[..crc_offset]);
        if stored_crc != computed_crc {
            return Err(SnapshotError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let mut header = &data[4..HEADER_SIZE];
        let version = header.get_u32_le();
        if version != VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }
        let sections = header.get_u32_le();

        Ok(Self {
            body: &data[HEADER_SIZE..crc_offset],
            sections,
            read: 0,
        })
    }

    /// Number of sections in the snapshot.
    pub fn section_count(&self) -> u32 {
        self.sections
    }

    /// Decode the next section.
    pub fn read_section<V: DeserializeOwned>(&mut self) -> Result<Vec<(String, V)>, SnapshotError> {
        if self.read >= self.sections {
            return Err(SnapshotError::SectionCount {
                expected: self.read + 1,
                actual: self.sections,
            });
        }

        let count = self.take_u64()?;
        let mut entries = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let key_len = self.take_u32()? as usize;
            let key = self.take(key_len)?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| SnapshotError::InvalidKey(e.to_string()))?;

            let value_len = self.take_u32()? as usize;
            let value = self.take(value_len)?;
            let value =
                bincode::deserialize(value).map_err(|e| SnapshotError::Decode(e.to_string()))?;

            entries.push((key, value));
        }
        self.read += 1;
        Ok(entries)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SnapshotError> {
        if self.body.len() < len {
            return Err(SnapshotError::TruncatedData {
                expected: len,
                actual: self.body.len(),
            });
        }
        let (head, rest) = self.body.split_at(len);
        self.body = rest;
        Ok(head)
    }

    fn take_u32(&mut self) -> Result<u32, SnapshotError> {
        let mut raw = self.take(4)?;
        Ok(raw.get_u32_le())
    }

    fn take_u64(&mut self) -> Result<u64, SnapshotError> {
        let mut raw = self.take(8)?;
        Ok(raw.get_u64_le())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::{ExclusiveLockHolder, LockOwner, ReadWriteLockHolder};

    fn sample() -> (Vec<(String, ExclusiveLockHolder)>, Vec<(String, ReadWriteLockHolder)>) {
        let mut exclusive = ExclusiveLockHolder::new();
        exclusive.lock(LockOwner::new(1, 1, false));
        exclusive.lock(LockOwner::new(2, 1, true));

        let mut read_write = ReadWriteLockHolder::new();
        read_write.lock_read(LockOwner::new(3, 4, false));

        (
            vec![("orders".to_string(), exclusive)],
            vec![("catalog".to_string(), read_write)],
        )
    }

    fn encode() -> Bytes {
        let (exclusive, read_write) = sample();
        let mut writer = SnapshotWriter::new();
        writer.write_section(&exclusive).unwrap();
        writer.write_section(&read_write).unwrap();
        writer.finish()
    }

    #[test]
    fn test_sections_survive_encoding() {
        let (exclusive, read_write) = sample();
        let data = encode();

        let mut reader = SnapshotReader::new(&data).unwrap();
        assert_eq!(reader.section_count(), 2);
        assert_eq!(reader.read_section::<ExclusiveLockHolder>().unwrap(), exclusive);
        assert_eq!(reader.read_section::<ReadWriteLockHolder>().unwrap(), read_write);
        assert!(matches!(
            reader.read_section::<ExclusiveLockHolder>(),
            Err(SnapshotError::SectionCount { .. })
        ));
    }

    #[test]
    fn test_corruption_is_detected() {
        let mut data = encode().to_vec();
        let middle = data.len() / 2;
        data[middle] ^= 0xff;

        assert!(matches!(
            SnapshotReader::new(&data),
            Err(SnapshotError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_bad_header_is_rejected() {
        assert!(matches!(
            SnapshotReader::new(b"short"),
            Err(SnapshotError::TruncatedData { .. })
        ));

        let mut data = encode().to_vec();
        data[0] = b'X';
        assert!(matches!(
            SnapshotReader::new(&data),
            Err(SnapshotError::InvalidMagic)
        ));
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut data = encode().to_vec();
        data[4..8].copy_from_slice(&9u32.to_le_bytes());
        let crc_offset = data.len() - 4;
        let crc = CRC32.checksum(&data[..crc_offset]);
        data[crc_offset..].copy_from_slice(&crc.to_le_bytes());

        assert!(matches!(
            SnapshotReader::new(&data),
            Err(SnapshotError::UnsupportedVersion(9))
        ));
    }
}
