//! Binary layout shared by the builder and the reader.
//!
//! ```text
//! [0 .. 2048)   header: 256 x (position: u32, slot_count: u32)
//! [2048 .. D)   data region: (key_len: u32, value_len: u32, key, value) per record
//! [D .. end)    table region: per-bucket slot arrays of (hash: u32, record_position: u32)
//! ```
//!
//! All integers are little-endian. Positions are absolute file offsets, which
//! bounds a file to 4 GiB.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::{ConstMapError, Result};

/// Number of buckets in the header.
pub const BUCKET_COUNT: usize = 256;
/// Width of one `(position, slot_count)` header entry.
pub const BUCKET_WIDTH: usize = 8;
/// Size of the fixed header at the start of every file.
pub const HEADER_SIZE: usize = BUCKET_COUNT * BUCKET_WIDTH;
/// Width of one `(hash, record_position)` slot.
pub const SLOT_WIDTH: usize = 8;
/// Width of the `(key_len, value_len)` prefix of a record.
pub const RECORD_HEADER_SIZE: usize = 8;
/// Largest file the 32-bit position fields can address.
pub const MAX_FILE_SIZE: u64 = u32::MAX as u64;

/// Header entry describing one bucket's slot array.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConstMapBucket {
    /// Absolute offset of the slot array, 0 when the bucket is empty.
    pub position: u32,
    /// Number of slots, twice the number of records in the bucket.
    pub slot_count: u32,
}

impl ConstMapBucket {
    pub fn is_empty(&self) -> bool {
        self.slot_count == 0
    }

    /// Length in bytes of the slot array.
    pub fn table_length(&self) -> u64 {
        self.slot_count as u64 * SLOT_WIDTH as u64
    }

    /// Offset one past the end of the slot array.
    pub fn end(&self) -> u64 {
        self.position as u64 + self.table_length()
    }
}

/// The 256-entry header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstMapHeader {
    pub buckets: [ConstMapBucket; BUCKET_COUNT],
}

impl Default for ConstMapHeader {
    fn default() -> Self {
        Self {
            buckets: [ConstMapBucket::default(); BUCKET_COUNT],
        }
    }
}

impl ConstMapHeader {
    pub const SIZE: usize = HEADER_SIZE;

    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut data = [0u8; HEADER_SIZE];
        for (bucket, chunk) in self.buckets.iter().zip(data.chunks_exact_mut(BUCKET_WIDTH)) {
            LittleEndian::write_u32(&mut chunk[..4], bucket.position);
            LittleEndian::write_u32(&mut chunk[4..], bucket.slot_count);
        }
        data
    }

    /// Decodes a header from at least [`HEADER_SIZE`] bytes.
    ///
    /// Only the encoding is checked here; bounds against the file length are
    /// validated by [`ConstMap::open`](crate::ConstMap::open).
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ConstMapError::corrupt(format!(
                "header needs {} bytes, got {}",
                HEADER_SIZE,
                data.len()
            )));
        }
        let mut header = Self::default();
        for (bucket, chunk) in header
            .buckets
            .iter_mut()
            .zip(data[..HEADER_SIZE].chunks_exact(BUCKET_WIDTH))
        {
            bucket.position = LittleEndian::read_u32(&chunk[..4]);
            bucket.slot_count = LittleEndian::read_u32(&chunk[4..]);
        }
        Ok(header)
    }

    /// Offset of the first slot array, i.e. the end of the data region.
    ///
    /// Returns `None` when every bucket is empty.
    pub fn table_start(&self) -> Option<u64> {
        self.buckets
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| b.position as u64)
            .min()
    }

    pub fn occupied_buckets(&self) -> usize {
        self.buckets.iter().filter(|b| !b.is_empty()).count()
    }

    /// Total number of slots, which is twice the record count.
    pub fn slot_total(&self) -> u64 {
        self.buckets.iter().map(|b| b.slot_count as u64).sum()
    }
}

/// Summary of a constmap file, returned by the builder and by
/// [`ConstMap::info`](crate::ConstMap::info).
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct ConstMapInfo {
    /// Total size of the file in bytes.
    pub file_length: u64,
    /// Number of records stored, duplicates included.
    pub record_count: u64,
    /// Number of buckets holding at least one record.
    pub occupied_buckets: usize,
    /// Offset one past the last record, where the table region begins.
    pub data_end: u64,
    /// Length in bytes of the table region.
    pub table_length: u64,
}

impl ConstMapInfo {
    pub(crate) fn from_header(header: &ConstMapHeader, file_length: u64, data_end: u64) -> Self {
        Self {
            file_length,
            record_count: header.slot_total() / 2,
            occupied_buckets: header.occupied_buckets(),
            data_end,
            table_length: file_length - data_end,
        }
    }
}

/// One entry in a bucket's slot array.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConstMapSlot {
    pub hash: u32,
    pub position: u32,
}

impl ConstMapSlot {
    /// Empty slots are all-zero; no record lives at offset 0.
    pub fn is_empty(&self) -> bool {
        self.position == 0
    }

    pub fn encode_into(&self, out: &mut [u8]) {
        LittleEndian::write_u32(&mut out[..4], self.hash);
        LittleEndian::write_u32(&mut out[4..SLOT_WIDTH], self.position);
    }

    pub fn decode(data: &[u8]) -> Self {
        Self {
            hash: LittleEndian::read_u32(&data[..4]),
            position: LittleEndian::read_u32(&data[4..SLOT_WIDTH]),
        }
    }
}

/// Length prefix of a record in the data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub key_length: u32,
    pub value_length: u32,
}

impl RecordHeader {
    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut data = [0u8; RECORD_HEADER_SIZE];
        LittleEndian::write_u32(&mut data[..4], self.key_length);
        LittleEndian::write_u32(&mut data[4..], self.value_length);
        data
    }

    pub fn decode(data: &[u8]) -> Self {
        Self {
            key_length: LittleEndian::read_u32(&data[..4]),
            value_length: LittleEndian::read_u32(&data[4..RECORD_HEADER_SIZE]),
        }
    }

    /// Length of the key and value bytes following the prefix.
    pub fn body_length(&self) -> u64 {
        self.key_length as u64 + self.value_length as u64
    }

    /// Full on-disk length of the record including the prefix.
    pub fn record_length(&self) -> u64 {
        RECORD_HEADER_SIZE as u64 + self.body_length()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut header = ConstMapHeader::default();
        header.buckets[0] = ConstMapBucket {
            position: 0x0102_0304,
            slot_count: 2,
        };
        header.buckets[255] = ConstMapBucket {
            position: 4096,
            slot_count: 6,
        };

        let data = header.serialize();
        assert_eq!(data.len(), 2048);
        assert_eq!(&data[..8], &[4, 3, 2, 1, 2, 0, 0, 0]);
        assert_eq!(&data[2040..], &[0, 16, 0, 0, 6, 0, 0, 0]);
        assert_eq!(ConstMapHeader::parse(&data).unwrap(), header);

        assert_eq!(header.table_start(), Some(4096));
        assert_eq!(header.occupied_buckets(), 2);
        assert_eq!(header.slot_total(), 8);
        assert_eq!(header.buckets[255].end(), 4096 + 48);
    }

    #[test]
    fn test_empty_header() {
        let header = ConstMapHeader::default();
        assert!(header.serialize().iter().all(|&b| b == 0));
        assert_eq!(header.table_start(), None);
        assert_eq!(header.occupied_buckets(), 0);

        let err = ConstMapHeader::parse(&[0u8; 100]).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_slot_and_record() {
        let slot = ConstMapSlot {
            hash: 177604,
            position: 2048,
        };
        let mut data = [0u8; SLOT_WIDTH];
        slot.encode_into(&mut data);
        assert_eq!(ConstMapSlot::decode(&data), slot);
        assert!(!slot.is_empty());
        assert!(ConstMapSlot::default().is_empty());

        let record = RecordHeader {
            key_length: 3,
            value_length: 5,
        };
        assert_eq!(record.encode(), [3, 0, 0, 0, 5, 0, 0, 0]);
        assert_eq!(RecordHeader::decode(&record.encode()), record);
        assert_eq!(record.record_length(), 16);
    }
}
