use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use tracing::{debug, trace};

use crate::hasher::{bucket_index, hash, slot_index};
use crate::layout::{
    BUCKET_COUNT, ConstMapBucket, ConstMapHeader, ConstMapInfo, ConstMapSlot, HEADER_SIZE,
    MAX_FILE_SIZE, RECORD_HEADER_SIZE, RecordHeader, SLOT_WIDTH,
};
use crate::{ConstMapError, ConstMapWriter, Result};

/// Two-phase builder for constmap files.
///
/// Records are buffered in insertion order by [`put`](Self::put). A single
/// call to one of the `finalize*` methods then writes the header, the data
/// region and the per-bucket slot tables. Once a finalize has been attempted
/// the builder rejects every further call with [`ConstMapError::Finalized`].
///
/// Duplicate keys are kept: every value put under a key is returned by
/// [`ConstMap::get`](crate::ConstMap::get), in insertion order.
///
/// ```
/// use constmap::{ConstMap, ConstMapBuilder};
///
/// # fn main() -> constmap::Result<()> {
/// let mut builder = ConstMapBuilder::new();
/// builder.put(b"a", b"1")?;
/// builder.put(b"b", b"2")?;
/// builder.put(b"a", b"3")?;
/// let bytes = builder.finalize()?;
///
/// let map = ConstMap::open(bytes)?;
/// assert_eq!(map.get(b"a")?, vec![b"1".to_vec(), b"3".to_vec()]);
/// assert!(map.get(b"c")?.is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConstMapBuilder {
    records: Vec<PendingRecord>,
    bucket_sizes: [u32; BUCKET_COUNT],
    data_end: u64,
    writer_buffer_size: usize,
    finalized: bool,
}

#[derive(Debug)]
struct PendingRecord {
    hash: u32,
    position: u32,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl PendingRecord {
    fn header(&self) -> RecordHeader {
        RecordHeader {
            key_length: self.key.len() as u32,
            value_length: self.value.len() as u32,
        }
    }

    fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&self.header().encode())?;
        out.write_all(&self.key)?;
        out.write_all(&self.value)
    }
}

impl Default for ConstMapBuilder {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            bucket_sizes: [0; BUCKET_COUNT],
            data_end: HEADER_SIZE as u64,
            writer_buffer_size: 16 << 20, // 16 MiB
            finalized: false,
        }
    }
}

impl ConstMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves room for `records` entries in the record buffer.
    pub fn with_capacity(mut self, records: usize) -> Self {
        self.records.reserve(records);
        self
    }

    /// Adjusts the capacity of the buffered writer used while streaming data.
    pub fn with_writer_buffer_size(mut self, size: usize) -> Self {
        self.writer_buffer_size = size;
        self
    }

    /// Number of records buffered so far.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Buffers a record.
    ///
    /// # Errors
    ///
    /// Fails with [`ConstMapError::Finalized`] after a finalize,
    /// [`ConstMapError::KeyTooLong`] / [`ConstMapError::ValueTooLong`] when a
    /// length does not fit the 32-bit field, and
    /// [`ConstMapError::DatabaseFull`] when the data region would no longer be
    /// addressable.
    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        if self.finalized {
            return Err(ConstMapError::Finalized);
        }
        let (key, value) = (key.as_ref(), value.as_ref());
        if key.len() > u32::MAX as usize {
            return Err(ConstMapError::KeyTooLong { length: key.len() });
        }
        if value.len() > u32::MAX as usize {
            return Err(ConstMapError::ValueTooLong {
                length: value.len(),
            });
        }

        let record_length = (RECORD_HEADER_SIZE + key.len() + value.len()) as u64;
        let end = self.data_end + record_length;
        if end > MAX_FILE_SIZE {
            return Err(ConstMapError::DatabaseFull { size: end });
        }

        let hash = hash(key);
        self.records.push(PendingRecord {
            hash,
            position: self.data_end as u32,
            key: key.to_vec(),
            value: value.to_vec(),
        });
        self.bucket_sizes[bucket_index(hash)] += 1;
        self.data_end = end;
        Ok(())
    }

    /// Writes the file through a positional writer, backpatching the header.
    ///
    /// A zeroed header is written first, followed by every record in
    /// insertion order and then the slot tables. The real header is written
    /// at offset 0 last.
    ///
    /// # Errors
    ///
    /// Returns [`ConstMapError::Finalized`] on a second call and
    /// [`ConstMapError::DatabaseFull`] when the table region would push the
    /// file past 4 GiB. IO failures are propagated; the partially written
    /// file must then be discarded.
    pub fn finalize_to<W: ConstMapWriter>(&mut self, writer: &W) -> Result<ConstMapInfo> {
        self.begin_finalize()?;

        let mut buf_writer = BufWriter::with_capacity(
            self.writer_buffer_size,
            ConstMapWriterWrapper {
                inner: writer,
                offset: 0,
            },
        );

        // data pass
        buf_writer.write_all(&[0u8; HEADER_SIZE])?;
        for record in &self.records {
            record.write_to(&mut buf_writer)?;
        }

        // table pass
        let (header, table) = self.layout_table()?;
        buf_writer.write_all(&table)?;
        buf_writer.flush()?;
        let file_length = buf_writer.get_ref().offset;
        drop(buf_writer);

        writer.write_all_at(&header.serialize(), 0)?;
        Ok(self.finish(&header, file_length))
    }

    /// Writes the file to a sequential, non-seekable sink.
    ///
    /// The slot tables are laid out in memory up front so the header can be
    /// emitted first; header, records and tables then go out as one stream.
    pub fn finalize_to_stream<W: Write>(&mut self, writer: W) -> Result<ConstMapInfo> {
        self.begin_finalize()?;
        let mut buf_writer = BufWriter::with_capacity(self.writer_buffer_size, writer);
        let (header, file_length) = self.emit(&mut buf_writer)?;
        buf_writer.flush()?;
        Ok(self.finish(&header, file_length))
    }

    /// Returns the complete file as bytes.
    pub fn finalize(&mut self) -> Result<Vec<u8>> {
        self.begin_finalize()?;
        let mut out = Vec::new();
        let (header, file_length) = self.emit(&mut out)?;
        self.finish(&header, file_length);
        Ok(out)
    }

    /// Builds the file at `path` without ever exposing a partial file there.
    ///
    /// The file is written to `path` with a `.tmp` suffix appended, synced,
    /// and renamed over `path`. On failure the temporary file is removed.
    pub fn finalize_to_path(&mut self, path: impl AsRef<Path>) -> Result<ConstMapInfo> {
        if self.finalized {
            return Err(ConstMapError::Finalized);
        }
        let path = path.as_ref();
        let mut tmp_path = path.as_os_str().to_owned();
        tmp_path.push(".tmp");

        let result = (|| -> Result<ConstMapInfo> {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let info = self.finalize_to(&file)?;
            file.sync_all()?;
            fs::rename(&tmp_path, path)?;
            sync_parent(path)?;
            Ok(info)
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    fn begin_finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Err(ConstMapError::Finalized);
        }
        self.finalized = true;
        Ok(())
    }

    fn finish(&mut self, header: &ConstMapHeader, file_length: u64) -> ConstMapInfo {
        let info = ConstMapInfo::from_header(header, file_length, self.data_end);
        debug!(
            records = info.record_count,
            occupied_buckets = info.occupied_buckets,
            file_length,
            "constmap finalized"
        );
        self.records = Vec::new();
        info
    }

    /// Writes header, data region and table region sequentially.
    fn emit<W: Write>(&self, out: &mut W) -> Result<(ConstMapHeader, u64)> {
        let (header, table) = self.layout_table()?;
        out.write_all(&header.serialize())?;
        for record in &self.records {
            record.write_to(out)?;
        }
        out.write_all(&table)?;
        Ok((header, self.data_end + table.len() as u64))
    }

    /// Lays out every bucket's slot array after the data region.
    ///
    /// Buckets are placed in ascending order, each with twice as many slots
    /// as records. Records are inserted in insertion order, each into the
    /// first empty slot found by linear probing.
    fn layout_table(&self) -> Result<(ConstMapHeader, Vec<u8>)> {
        let slot_total: u64 = self.bucket_sizes.iter().map(|&n| 2 * n as u64).sum();
        let file_length = self.data_end + slot_total * SLOT_WIDTH as u64;
        if file_length > MAX_FILE_SIZE {
            return Err(ConstMapError::DatabaseFull { size: file_length });
        }

        let mut header = ConstMapHeader::default();
        let mut starts = [0usize; BUCKET_COUNT];
        let mut position = self.data_end;
        let mut start = 0;
        for (index, &count) in self.bucket_sizes.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let bucket = ConstMapBucket {
                position: position as u32,
                slot_count: 2 * count,
            };
            trace!(index, position, slot_count = bucket.slot_count, "bucket layout");
            header.buckets[index] = bucket;
            starts[index] = start;
            start += bucket.slot_count as usize;
            position += bucket.table_length();
        }

        let mut slots = vec![ConstMapSlot::default(); slot_total as usize];
        for record in &self.records {
            let index = bucket_index(record.hash);
            let slot_count = header.buckets[index].slot_count;
            let bucket = &mut slots[starts[index]..starts[index] + slot_count as usize];
            let slot = (0..slot_count)
                .map(|probe| slot_index(record.hash, slot_count, probe) as usize)
                .find(|&i| bucket[i].is_empty())
                .ok_or_else(|| ConstMapError::corrupt(format!("bucket {} overflowed", index)))?;
            bucket[slot] = ConstMapSlot {
                hash: record.hash,
                position: record.position,
            };
        }

        let mut table = vec![0u8; slots.len() * SLOT_WIDTH];
        for (slot, chunk) in slots.iter().zip(table.chunks_exact_mut(SLOT_WIDTH)) {
            slot.encode_into(chunk);
        }
        Ok((header, table))
    }
}

/// Thin wrapper implementing [`std::io::Write`] in terms of [`ConstMapWriter`].
///
/// Each write lands at the next consecutive offset.
struct ConstMapWriterWrapper<'a, W: ConstMapWriter> {
    inner: &'a W,
    offset: u64,
}

impl<W: ConstMapWriter> Write for ConstMapWriterWrapper<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write_all_at(buf, self.offset)?;
        self.offset += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::File::open(parent)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crate::layout::{BUCKET_WIDTH, MAX_FILE_SIZE};
    use crate::*;

    #[derive(Debug)]
    struct MemoryWriter {
        data: Mutex<Vec<u8>>,
        limit: u64,
    }

    impl MemoryWriter {
        fn new(limit: u64) -> Self {
            Self {
                data: Mutex::new(Vec::new()),
                limit,
            }
        }

        fn into_inner(self) -> Vec<u8> {
            self.data.into_inner().unwrap()
        }
    }

    impl ConstMapWriter for MemoryWriter {
        fn write_all_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
            if offset + buf.len() as u64 > self.limit {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "Write exceeds limit",
                ));
            }
            let mut data = self.data.lock().unwrap();
            let end = offset as usize + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[offset as usize..end].copy_from_slice(buf);
            Ok(())
        }
    }

    fn bucket(data: &[u8], index: usize) -> (u32, u32) {
        let entry = &data[index * BUCKET_WIDTH..(index + 1) * BUCKET_WIDTH];
        (
            u32::from_le_bytes(entry[..4].try_into().unwrap()),
            u32::from_le_bytes(entry[4..].try_into().unwrap()),
        )
    }

    #[test]
    fn test_empty_build() {
        let mut builder = ConstMapBuilder::new();
        assert!(builder.is_empty());
        let bytes = builder.finalize().unwrap();
        assert_eq!(bytes.len(), 2048);
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_layout_bytes() {
        let mut builder = ConstMapBuilder::new();
        builder.put(b"a", b"1").unwrap();
        builder.put(b"b", b"2").unwrap();
        builder.put(b"a", b"3").unwrap();
        assert_eq!(builder.len(), 3);
        let bytes = builder.finalize().unwrap();

        // three 10-byte records, then two buckets of 4 and 2 slots
        assert_eq!(bytes.len(), 2048 + 30 + 6 * 8);
        assert_eq!(&bytes[2048..2058], b"\x01\0\0\0\x01\0\0\0a1");
        assert_eq!(&bytes[2058..2068], b"\x01\0\0\0\x01\0\0\0b2");

        let (ha, hb) = (hash(b"a"), hash(b"b"));
        let (a_position, a_slots) = bucket(&bytes, bucket_index(ha));
        let (b_position, b_slots) = bucket(&bytes, bucket_index(hb));
        assert_eq!(a_slots, 4);
        assert_eq!(b_slots, 2);
        // bucket order is ascending: 'a' hashes to a lower bucket than 'b'
        assert!(bucket_index(ha) < bucket_index(hb));
        assert_eq!(a_position, 2078);
        assert_eq!(b_position, 2078 + 32);

        let slot_at = |position: u32, i: u32| {
            let offset = (position + i * 8) as usize;
            (
                u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()),
                u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().unwrap()),
            )
        };
        let first = slot_index(ha, 4, 0);
        assert_eq!(slot_at(a_position, first), (ha, 2048));
        assert_eq!(slot_at(a_position, (first + 1) % 4), (ha, 2068));
        assert_eq!(slot_at(a_position, (first + 2) % 4), (0, 0));

        for index in 0..256 {
            if index != bucket_index(ha) && index != bucket_index(hb) {
                assert_eq!(bucket(&bytes, index), (0, 0));
            }
        }
    }

    #[test]
    fn test_seekable_matches_stream() {
        let entries: Vec<(String, String)> = (0..2000)
            .map(|i| (format!("key-{}", i % 700), format!("value-{}", i)))
            .collect();

        let mut builder = ConstMapBuilder::new().with_capacity(entries.len());
        for (k, v) in &entries {
            builder.put(k, v).unwrap();
        }
        let bytes = builder.finalize().unwrap();

        let mut builder = ConstMapBuilder::new().with_writer_buffer_size(1024);
        for (k, v) in &entries {
            builder.put(k, v).unwrap();
        }
        let writer = MemoryWriter::new(10 << 20);
        let seek_info = builder.finalize_to(&writer).unwrap();

        let mut builder = ConstMapBuilder::new();
        for (k, v) in &entries {
            builder.put(k, v).unwrap();
        }
        let mut streamed = Vec::new();
        let stream_info = builder.finalize_to_stream(&mut streamed).unwrap();

        assert_eq!(seek_info, stream_info);
        assert_eq!(seek_info.record_count, 2000);
        assert_eq!(seek_info.file_length, bytes.len() as u64);
        assert_eq!(writer.into_inner(), bytes);
        assert_eq!(streamed, bytes);
    }

    #[test]
    fn test_finalize_once() {
        let mut builder = ConstMapBuilder::new();
        builder.put("k", "v").unwrap();
        builder.finalize().unwrap();

        assert!(matches!(builder.finalize(), Err(ConstMapError::Finalized)));
        assert!(matches!(
            builder.finalize_to_stream(Vec::new()),
            Err(ConstMapError::Finalized)
        ));
        let err = builder.put("k2", "v2").unwrap_err();
        assert!(err.is_misuse());
        assert!(matches!(err, ConstMapError::Finalized));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("twice.cmap");
        assert!(matches!(
            builder.finalize_to_path(&path),
            Err(ConstMapError::Finalized)
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_failed_finalize_is_final() {
        let mut builder = ConstMapBuilder::new();
        for i in 0..1000u32 {
            builder.put(i.to_le_bytes(), i.to_be_bytes()).unwrap();
        }
        let writer = MemoryWriter::new(4096);
        let err = builder.finalize_to(&writer).unwrap_err();
        assert!(matches!(err, ConstMapError::Io(_)));
        assert!(matches!(builder.finalize(), Err(ConstMapError::Finalized)));
    }

    #[test]
    fn test_finalize_to_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aliases.cmap");

        let mut builder = ConstMapBuilder::new();
        builder.put("root", "admin").unwrap();
        builder.put("root", "postmaster").unwrap();
        let info = builder.finalize_to_path(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(info.file_length, bytes.len() as u64);
        assert_eq!(info.record_count, 2);
        assert_eq!(info.occupied_buckets, 1);
        assert!(!dir.path().join("aliases.cmap.tmp").exists());

        let map = ConstMap::open_path(&path).unwrap();
        assert_eq!(
            map.get("root").unwrap(),
            vec![b"admin".to_vec(), b"postmaster".to_vec()]
        );
    }

    #[test]
    fn test_finalize_to_path_failure_removes_tmp() {
        let dir = tempfile::tempdir().unwrap();
        // a directory at the target makes the final rename fail
        let path = dir.path().join("aliases.cmap");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"x").unwrap();

        let mut builder = ConstMapBuilder::new();
        builder.put("root", "admin").unwrap();
        let err = builder.finalize_to_path(&path).unwrap_err();
        assert!(matches!(err, ConstMapError::Io(_)));
        assert!(!dir.path().join("aliases.cmap.tmp").exists());
        assert!(path.is_dir());
        assert!(matches!(
            builder.finalize_to_path(dir.path().join("other.cmap")),
            Err(ConstMapError::Finalized)
        ));
        assert!(!dir.path().join("other.cmap.tmp").exists());
    }

    #[test]
    fn test_file_sink() {
        let file = tempfile::tempfile().unwrap();
        let mut builder = ConstMapBuilder::new();
        builder.put("x", "1").unwrap();
        let info = builder.finalize_to(&file).unwrap();
        assert_eq!(file.metadata().unwrap().len(), info.file_length);

        let map = ConstMap::open(file).unwrap();
        assert_eq!(map.info(), info);
        assert_eq!(map.get("x").unwrap(), vec![b"1".to_vec()]);
    }

    #[test]
    fn test_database_full() {
        let mut builder = ConstMapBuilder::new();
        builder.data_end = MAX_FILE_SIZE - 20;
        let err = builder.put(b"key", vec![0u8; 32]).unwrap_err();
        assert!(matches!(err, ConstMapError::DatabaseFull { .. }));
        assert!(err.is_misuse());
        assert!(builder.is_empty());

        // the record fits but its slots do not
        builder.put(b"k", b"v").unwrap();
        builder.data_end = MAX_FILE_SIZE - 4;
        assert!(matches!(
            builder.finalize(),
            Err(ConstMapError::DatabaseFull { .. })
        ));
    }
}
