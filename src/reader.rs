use std::fs::File;
use std::io::{Error, ErrorKind};
use std::sync::Arc;

use crate::Result;

/// Trait abstracting read access to constmap files.
///
/// Implementations must support positional reads without mutating shared
/// state, so a single source can serve concurrent lookups. Implemented for
/// files, byte buffers and memory maps.
pub trait ConstMapReader {
    /// Total length of the source in bytes.
    fn size(&self) -> Result<u64>;

    /// Reads `length` bytes starting at `offset` and forwards them to `f`.
    ///
    /// Implementations should return an error whenever the requested range
    /// cannot be satisfied in full.
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>;

    /// Reads multiple ranges in sequence, delegating to [`read_exact_at`](Self::read_exact_at).
    ///
    /// Override this method to take advantage of vectored IO when available.
    fn batch_read_at<F, R>(&self, iov: &[(u64, u64)], f: F) -> Result<Vec<R>>
    where
        F: Fn(usize, &[u8]) -> Result<R>,
    {
        let mut results = Vec::with_capacity(iov.len());
        for (index, &(offset, length)) in iov.iter().enumerate() {
            if length == 0 {
                results.push(f(index, &[])?);
            } else {
                let result = self.read_exact_at(offset, length, |data| f(index, data))?;
                results.push(result);
            }
        }
        Ok(results)
    }
}

impl ConstMapReader for File {
    fn size(&self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }

    #[cfg(unix)]
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        use std::os::unix::fs::FileExt;

        let mut buffer = vec![0u8; length as usize];
        FileExt::read_exact_at(self, &mut buffer, offset)?;
        f(&buffer)
    }

    #[cfg(windows)]
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        use std::os::windows::fs::FileExt;

        let mut buffer = vec![0u8; length as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            let bytes = self.seek_read(&mut buffer[filled..], offset + filled as u64)?;
            if bytes == 0 {
                return Err(
                    Error::new(ErrorKind::UnexpectedEof, "Failed to read enough bytes").into(),
                );
            }
            filled += bytes;
        }
        f(&buffer)
    }
}

impl ConstMapReader for [u8] {
    fn size(&self) -> Result<u64> {
        Ok(self.len() as u64)
    }

    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        let end = offset.checked_add(length);
        match end {
            Some(end) if end <= self.len() as u64 => f(&self[offset as usize..end as usize]),
            _ => Err(Error::new(
                ErrorKind::UnexpectedEof,
                format!(
                    "range {}+{} is beyond the {} byte buffer",
                    offset,
                    length,
                    self.len()
                ),
            )
            .into()),
        }
    }
}

impl ConstMapReader for Vec<u8> {
    fn size(&self) -> Result<u64> {
        self.as_slice().size()
    }

    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        self.as_slice().read_exact_at(offset, length, f)
    }
}

impl ConstMapReader for memmap2::Mmap {
    fn size(&self) -> Result<u64> {
        Ok(self.len() as u64)
    }

    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        self[..].read_exact_at(offset, length, f)
    }
}

impl<T: ConstMapReader + ?Sized> ConstMapReader for &T {
    fn size(&self) -> Result<u64> {
        (**self).size()
    }

    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        (**self).read_exact_at(offset, length, f)
    }

    fn batch_read_at<F, R>(&self, iov: &[(u64, u64)], f: F) -> Result<Vec<R>>
    where
        F: Fn(usize, &[u8]) -> Result<R>,
    {
        (**self).batch_read_at(iov, f)
    }
}

impl<T: ConstMapReader + ?Sized> ConstMapReader for Arc<T> {
    fn size(&self) -> Result<u64> {
        (**self).size()
    }

    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        (**self).read_exact_at(offset, length, f)
    }

    fn batch_read_at<F, R>(&self, iov: &[(u64, u64)], f: F) -> Result<Vec<R>>
    where
        F: Fn(usize, &[u8]) -> Result<R>,
    {
        (**self).batch_read_at(iov, f)
    }
}
