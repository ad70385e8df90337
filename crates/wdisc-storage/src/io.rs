//! Positioned file access.
//!
//! The engines never seek or stream; every access names an absolute offset.
//! [`DiskFile`] is that contract. It is implemented for [`std::fs::File`]
//! and for the in-memory [`MemoryFile`], which additionally counts physical
//! writes so callers can tell whether a sparse write touched the medium.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Size of the shared zero buffer.
pub const ZERO_CHUNK_SIZE: usize = 64 * 1024;

/// Reusable all-zero buffer for zero-fill writes.
pub static ZERO_CHUNK: [u8; ZERO_CHUNK_SIZE] = [0; ZERO_CHUNK_SIZE];

/// Absolute-offset byte access to an underlying file.
///
/// Short reads and short writes are errors, never partial successes.
pub trait DiskFile {
    /// Fill `buf` from `offset`. Fails with `UnexpectedEof` past the end.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write all of `data` at `offset`, growing the file if needed.
    fn write_all_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Truncate or extend (with zeros) to exactly `len` bytes.
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Current length in bytes.
    fn file_len(&mut self) -> io::Result<u64>;

    /// Flush buffered data to the medium.
    fn sync(&mut self) -> io::Result<()>;
}

impl DiskFile for File {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }

    fn write_all_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(data)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn file_len(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_data()
    }
}

impl<T: DiskFile + ?Sized> DiskFile for &mut T {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        (**self).write_all_at(offset, data)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        (**self).set_len(len)
    }

    fn file_len(&mut self) -> io::Result<u64> {
        (**self).file_len()
    }

    fn sync(&mut self) -> io::Result<()> {
        (**self).sync()
    }
}

/// Write `len` zero bytes at `offset` from the shared zero buffer.
pub fn write_zeros_at<F: DiskFile + ?Sized>(file: &mut F, offset: u64, len: u64) -> io::Result<()> {
    let mut pos = offset;
    let end = offset + len;
    while pos < end {
        let chunk = (end - pos).min(ZERO_CHUNK_SIZE as u64) as usize;
        file.write_all_at(pos, &ZERO_CHUNK[..chunk])?;
        pos += chunk as u64;
    }
    Ok(())
}

/// Physical write counters of a [`MemoryFile`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Number of write calls
    pub calls: u64,
    /// Total bytes written
    pub bytes: u64,
}

/// In-memory [`DiskFile`].
#[derive(Debug, Clone, Default)]
pub struct MemoryFile {
    data: Vec<u8>,
    stats: WriteStats,
}

impl MemoryFile {
    /// Empty file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero-filled file of `len` bytes.
    pub fn with_len(len: usize) -> Self {
        Self {
            data: vec![0; len],
            stats: WriteStats::default(),
        }
    }

    /// Wrap existing bytes.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data,
            stats: WriteStats::default(),
        }
    }

    /// File contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consume into the contents.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    /// Write counters since creation or the last reset.
    pub const fn stats(&self) -> WriteStats {
        self.stats
    }

    /// Reset the write counters.
    pub fn reset_stats(&mut self) {
        self.stats = WriteStats::default();
    }
}

fn to_index(offset: u64) -> io::Result<usize> {
    usize::try_from(offset)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset exceeds address space"))
}

impl DiskFile for MemoryFile {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = to_index(offset)?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "short read: {} bytes at {offset:#x}, file is {:#x} bytes",
                        buf.len(),
                        self.data.len()
                    ),
                )
            })?;
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_all_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let start = to_index(offset)?;
        let end = start + data.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        self.stats.calls += 1;
        self.stats.bytes += data.len() as u64;
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.data.resize(to_index(len)?, 0);
        Ok(())
    }

    fn file_len(&mut self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}
