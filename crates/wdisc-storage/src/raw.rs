//! Plain file passthrough.
//!
//! Image offset equals file offset. The file may be shorter than the image:
//! bytes past its end read as zeros, and zeroing past its end only grows the
//! file.

use crate::image::ImageIo;
use crate::io::{DiskFile, write_zeros_at};
use crate::{ImageError, Result};
use tracing::debug;
use wdisc_formats::WII_SECTOR_SIZE;

/// A raw image file.
#[derive(Debug)]
pub struct RawImage<F> {
    file: F,
    /// Physical file length
    file_len: u64,
    /// Logical image size
    size: u64,
}

impl<F: DiskFile> RawImage<F> {
    /// Open an existing file; its length is the image size.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the length cannot be queried.
    pub fn open(mut file: F) -> Result<Self> {
        let file_len = file.file_len()?;
        debug!("Opened raw image: {:#x} bytes", file_len);
        Ok(Self {
            file,
            file_len,
            size: file_len,
        })
    }

    /// Start an empty image of logical `size` bytes, truncating the file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be truncated.
    pub fn create(mut file: F, size: u64) -> Result<Self> {
        file.set_len(0)?;
        debug!("Created raw image: {:#x} bytes", size);
        Ok(Self {
            file,
            file_len: 0,
            size,
        })
    }

    /// Logical image size.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Grow or shrink the logical size applied on close.
    pub const fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    /// Physical file length.
    pub const fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Read at `offset`; bytes past the end of the file are zero.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the file.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let avail = self.file_len.saturating_sub(offset).min(buf.len() as u64) as usize;
        let (present, beyond) = buf.split_at_mut(avail);
        if !present.is_empty() {
            self.file.read_exact_at(offset, present)?;
        }
        beyond.fill(0);
        Ok(())
    }

    /// Write `data` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::OutOfRange`] if the range overflows, or an I/O
    /// error.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = end_of(offset, data.len() as u64)?;
        self.file.write_all_at(offset, data)?;
        self.file_len = self.file_len.max(end);
        self.size = self.size.max(end);
        Ok(())
    }

    /// Zero `len` bytes at `offset`. The part past the end of the file is
    /// covered by growing the file.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::OutOfRange`] if the range overflows, or an I/O
    /// error.
    pub fn write_zero_at(&mut self, offset: u64, len: u64) -> Result<()> {
        let end = end_of(offset, len)?;
        if offset < self.file_len {
            write_zeros_at(&mut self.file, offset, end.min(self.file_len) - offset)?;
        }
        if end > self.file_len {
            self.file.set_len(end)?;
            self.file_len = end;
        }
        self.size = self.size.max(end);
        Ok(())
    }

    /// Sync the file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the file.
    pub fn flush(&mut self) -> Result<()> {
        self.file.sync()?;
        Ok(())
    }

    /// Set the file length to the logical size, sync, and return the file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the file.
    pub fn close(mut self) -> Result<F> {
        if self.file_len != self.size {
            self.file.set_len(self.size)?;
        }
        self.file.sync()?;
        debug!("Closed raw image: {:#x} bytes", self.size);
        Ok(self.file)
    }
}

fn end_of(offset: u64, len: u64) -> Result<u64> {
    offset.checked_add(len).ok_or(ImageError::OutOfRange {
        offset,
        len,
        limit: u64::MAX,
    })
}

impl<F: DiskFile> ImageIo for RawImage<F> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        Self::read_at(self, offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        Self::write_at(self, offset, data)
    }

    fn write_zero_at(&mut self, offset: u64, len: u64) -> Result<()> {
        Self::write_zero_at(self, offset, len)
    }

    fn flush(&mut self) -> Result<()> {
        Self::flush(self)
    }

    fn capacity(&self) -> u64 {
        u64::MAX
    }

    fn unit_size(&self) -> u64 {
        u64::from(WII_SECTOR_SIZE)
    }

    fn used_units(&self) -> u64 {
        self.file_len.div_ceil(u64::from(WII_SECTOR_SIZE))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::io::MemoryFile;

    #[test]
    fn test_read_past_end_is_zero() {
        let mut image = RawImage::open(MemoryFile::from_vec(b"abcd".to_vec())).expect("open");
        let mut buf = [0xFFu8; 8];
        image.read_at(2, &mut buf).expect("read");
        assert_eq!(&buf, b"cd\0\0\0\0\0\0");
        image.read_at(100, &mut buf).expect("read beyond");
        assert_eq!(buf, [0; 8]);
    }

    #[test]
    fn test_write_zero_extends_without_writing() {
        let mut image = RawImage::create(MemoryFile::new(), 0).expect("create");
        image.write_at(0, &[7u8; 16]).expect("write");
        image.write_zero_at(8, 1000).expect("zero");
        assert_eq!(image.file_len(), 1008);

        let file = image.close().expect("close");
        // one data write plus one zero write for the in-file part
        assert_eq!(file.stats().calls, 2);
        assert_eq!(file.as_slice().len(), 1008);
        assert_eq!(&file.as_slice()[..8], &[7u8; 8]);
        assert!(file.as_slice()[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_close_sets_logical_size() {
        let mut image = RawImage::create(MemoryFile::new(), 4096).expect("create");
        image.write_at(10, b"x").expect("write");
        let file = image.close().expect("close");
        assert_eq!(file.as_slice().len(), 4096);
        assert_eq!(file.as_slice()[10], b'x');
    }
}
