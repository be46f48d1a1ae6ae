use std::fs::File;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};
use tracing::{debug, trace, warn};

use crate::hasher::{bucket_index, hash, slot_index};
use crate::layout::{
    ConstMapHeader, ConstMapInfo, ConstMapSlot, HEADER_SIZE, RECORD_HEADER_SIZE, RecordHeader,
    SLOT_WIDTH,
};
use crate::{ConstMapError, ConstMapReader, Result};

/// Immutable multi-value hash map backed by a constmap file.
///
/// A `ConstMap` is created from a [`ConstMapReader`] (a file, a byte buffer
/// or a memory map) and answers lookups with positioned reads, without
/// loading the dataset into memory. Only the 2 KiB header is kept resident.
///
/// All query methods take `&self` and keep no state between calls, so a map
/// can be shared across threads whenever its reader can.
#[derive(Debug)]
pub struct ConstMap<R: ConstMapReader> {
    header: ConstMapHeader,
    file_length: u64,
    data_end: u64,
    reader: R,
}

impl<R: ConstMapReader> ConstMap<R> {
    /// Opens a constmap from a [`ConstMapReader`] implementation.
    ///
    /// The header is read and every bucket is checked against the source
    /// length captured here; later reads never go past it.
    ///
    /// # Errors
    ///
    /// Returns [`ConstMapError::Corrupt`] when the source is shorter than the
    /// header or a bucket describes a slot array outside the table region.
    pub fn open(reader: R) -> Result<Self> {
        let file_length = reader.size()?;
        if file_length < HEADER_SIZE as u64 {
            warn!(file_length, "constmap source shorter than header");
            return Err(ConstMapError::corrupt(format!(
                "file of {} bytes is shorter than the {} byte header",
                file_length, HEADER_SIZE
            )));
        }

        let header = reader.read_exact_at(0, HEADER_SIZE as u64, ConstMapHeader::parse)?;
        if let Err(e) = validate_header(&header, file_length) {
            warn!(file_length, error = %e, "rejecting constmap header");
            return Err(e);
        }
        let data_end = header.table_start().unwrap_or(file_length);

        debug!(
            file_length,
            data_end,
            occupied_buckets = header.occupied_buckets(),
            "constmap opened"
        );
        Ok(ConstMap {
            header,
            file_length,
            data_end,
            reader,
        })
    }

    pub fn header(&self) -> &ConstMapHeader {
        &self.header
    }

    /// Length of the source captured at open time.
    pub fn file_length(&self) -> u64 {
        self.file_length
    }

    /// Offset one past the last record.
    pub fn data_end(&self) -> u64 {
        self.data_end
    }

    /// Number of records in the map, duplicates included.
    pub fn len(&self) -> u64 {
        self.header.slot_total() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn info(&self) -> ConstMapInfo {
        ConstMapInfo::from_header(&self.header, self.file_length, self.data_end)
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Returns every value stored under `key`, in insertion order.
    ///
    /// Only the key's bucket is read. An empty vector means the key is
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns [`ConstMapError::Corrupt`] if a slot points outside the data
    /// region or a record runs past it, and propagates IO failures.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Vec<Vec<u8>>> {
        self.lookup(key.as_ref(), false)
    }

    /// Returns the first value stored under `key`.
    pub fn get_first(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        Ok(self.lookup(key.as_ref(), true)?.into_iter().next())
    }

    pub fn contains_key(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        Ok(self.get_first(key)?.is_some())
    }

    /// Performs multiple lookups in a single pass.
    ///
    /// Slot arrays are fetched through [`ConstMapReader::batch_read_at`], so
    /// readers that override it can issue scatter/gather reads. Results
    /// preserve the order of `keys`.
    ///
    /// # Errors
    ///
    /// Returns an error under the same conditions as [`get`](Self::get).
    pub fn batch_get<K: AsRef<[u8]>>(
        &self,
        keys: impl IntoIterator<Item = K>,
    ) -> Result<Vec<Vec<Vec<u8>>>> {
        let keys: Vec<K> = keys.into_iter().collect();
        let hashes: Vec<u32> = keys.iter().map(|k| hash(k.as_ref())).collect();
        let iov: Vec<(u64, u64)> = hashes
            .iter()
            .map(|&h| {
                let bucket = &self.header.buckets[bucket_index(h)];
                (bucket.position as u64, bucket.table_length())
            })
            .collect();

        self.reader.batch_read_at(&iov, |index, table| {
            self.probe(keys[index].as_ref(), hashes[index], table, false)
        })
    }

    /// Creates an iterator over all records in insertion order.
    ///
    /// The data region is scanned sequentially; the slot tables are not
    /// consulted. Every call starts a fresh scan from the first record.
    ///
    /// ```
    /// use constmap::{ConstMap, ConstMapBuilder};
    ///
    /// # fn main() -> constmap::Result<()> {
    /// let mut builder = ConstMapBuilder::new();
    /// builder.put("x", "10")?;
    /// builder.put("y", "20")?;
    /// let map = ConstMap::open(builder.finalize()?)?;
    ///
    /// let all = map.iter().collect::<constmap::Result<Vec<_>>>()?;
    /// assert_eq!(all[1], (b"y".to_vec(), b"20".to_vec()));
    /// # Ok(())
    /// # }
    /// ```
    pub fn iter(&self) -> ConstMapIter<'_, R> {
        ConstMapIter {
            map: self,
            offset: HEADER_SIZE as u64,
        }
    }

    fn lookup(&self, key: &[u8], first_only: bool) -> Result<Vec<Vec<u8>>> {
        let h = hash(key);
        let bucket = self.header.buckets[bucket_index(h)];
        if bucket.is_empty() {
            return Ok(Vec::new());
        }
        self.reader
            .read_exact_at(bucket.position as u64, bucket.table_length(), |table| {
                self.probe(key, h, table, first_only)
            })
    }

    /// Linear probing over one bucket's slot array.
    ///
    /// Probing stops at the first empty slot: insertion always fills the
    /// first free slot, so no record of this bucket lies beyond a gap.
    fn probe(&self, key: &[u8], h: u32, table: &[u8], first_only: bool) -> Result<Vec<Vec<u8>>> {
        let slot_count = (table.len() / SLOT_WIDTH) as u32;
        let mut values = Vec::new();
        let mut probes = 0;
        for probe in 0..slot_count {
            probes += 1;
            let index = slot_index(h, slot_count, probe) as usize * SLOT_WIDTH;
            let slot = ConstMapSlot::decode(&table[index..index + SLOT_WIDTH]);
            if slot.is_empty() {
                break;
            }
            if slot.hash != h {
                continue;
            }
            if let Some(value) = self.read_value_if_key(slot.position as u64, key)? {
                values.push(value);
                if first_only {
                    break;
                }
            }
        }
        trace!(hash = h, probes, matches = values.len(), "constmap probe");
        Ok(values)
    }

    /// Loads the record at `position` and returns its value if the stored
    /// key equals `key` byte for byte.
    fn read_value_if_key(&self, position: u64, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let record = self.read_record_header(position)?;
        if record.key_length as usize != key.len() {
            return Ok(None);
        }
        let body = position + RECORD_HEADER_SIZE as u64;
        self.reader
            .read_exact_at(body, record.body_length(), |data| {
                let (stored_key, value) = data.split_at(key.len());
                Ok((stored_key == key).then(|| value.to_vec()))
            })
    }

    /// Reads and bounds-checks the length prefix of the record at `position`.
    fn read_record_header(&self, position: u64) -> Result<RecordHeader> {
        let header_end = position + RECORD_HEADER_SIZE as u64;
        if position < HEADER_SIZE as u64 || header_end > self.data_end {
            return Err(ConstMapError::corrupt(format!(
                "record at {} lies outside the data region [{}, {})",
                position, HEADER_SIZE, self.data_end
            )));
        }
        let record = self.reader.read_exact_at(
            position,
            RECORD_HEADER_SIZE as u64,
            |data| Ok(RecordHeader::decode(data)),
        )?;
        if position + record.record_length() > self.data_end {
            return Err(ConstMapError::corrupt(format!(
                "record at {} with {} key and {} value bytes runs past the data region end {}",
                position, record.key_length, record.value_length, self.data_end
            )));
        }
        Ok(record)
    }
}

impl ConstMap<File> {
    /// Opens the constmap file at `path` for positioned reads.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(File::open(path)?)
    }
}

impl ConstMap<Mmap> {
    /// Memory-maps the constmap file at `path`.
    ///
    /// The file must not be modified or truncated while the map is alive.
    pub fn open_mmap(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: finalized constmap files are immutable; callers must not
        // rewrite the file while it is mapped.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Self::open(mmap)
    }
}

fn validate_header(header: &ConstMapHeader, file_length: u64) -> Result<()> {
    // Slot arrays are laid end to end in bucket order and fill the file.
    let mut table_end: Option<u64> = None;
    for (index, bucket) in header.buckets.iter().enumerate() {
        if bucket.is_empty() {
            if bucket.position != 0 {
                return Err(ConstMapError::corrupt(format!(
                    "empty bucket {} has position {}",
                    index, bucket.position
                )));
            }
            continue;
        }
        if bucket.slot_count % 2 != 0 {
            return Err(ConstMapError::corrupt(format!(
                "bucket {} has odd slot count {}",
                index, bucket.slot_count
            )));
        }
        if (bucket.position as u64) < HEADER_SIZE as u64 || bucket.end() > file_length {
            return Err(ConstMapError::corrupt(format!(
                "bucket {} slot array [{}, {}) is outside the {} byte file",
                index,
                bucket.position,
                bucket.end(),
                file_length
            )));
        }
        match table_end {
            Some(expected) if bucket.position as u64 != expected => {
                return Err(ConstMapError::corrupt(format!(
                    "bucket {} slot array starts at {}, expected {}",
                    index, bucket.position, expected
                )));
            }
            _ => {}
        }
        table_end = Some(bucket.end());
    }

    let table_end = table_end.unwrap_or(HEADER_SIZE as u64);
    if table_end != file_length {
        return Err(ConstMapError::corrupt(format!(
            "slot tables end at {} but the file is {} bytes",
            table_end, file_length
        )));
    }
    Ok(())
}

/// Iterator over all records of a [`ConstMap`] in insertion order.
///
/// Yields `(key, value)` pairs read straight from the data region. After the
/// first error the iterator is exhausted.
pub struct ConstMapIter<'a, R: ConstMapReader> {
    map: &'a ConstMap<R>,
    offset: u64,
}

impl<R: ConstMapReader> ConstMapIter<'_, R> {
    fn read_next(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let record = self.map.read_record_header(self.offset)?;
        let body = self.offset + RECORD_HEADER_SIZE as u64;
        let entry = self
            .map
            .reader
            .read_exact_at(body, record.body_length(), |data| {
                let (key, value) = data.split_at(record.key_length as usize);
                Ok((key.to_vec(), value.to_vec()))
            })?;
        self.offset += record.record_length();
        Ok(entry)
    }
}

impl<R: ConstMapReader> Iterator for ConstMapIter<'_, R> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.map.data_end {
            return None;
        }
        match self.read_next() {
            Ok(entry) => Some(Ok(entry)),
            Err(e) => {
                self.offset = self.map.data_end;
                Some(Err(e))
            }
        }
    }
}

impl<'a, R: ConstMapReader> IntoIterator for &'a ConstMap<R> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;
    type IntoIter = ConstMapIter<'a, R>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
