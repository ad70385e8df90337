//! CISO sparse container engine.
//!
//! One image per file. The image is cut into fixed-size units; a unit is
//! either present (stored after the 0x8000-byte header, packed in map order)
//! or absent (reads as zeros). Units are appended in the order they are first
//! written, which with the high-water rule below is also ascending unit
//! order, so the packed position of a unit is its rank among present units.
//!
//! The high-water mark ("needed blocks") is one past the highest unit ever
//! allocated. An absent unit below it was skipped for good: writing data
//! into it fails with [`ImageError::HoleWrite`].

use crate::image::ImageIo;
use crate::io::{DiskFile, write_zeros_at};
use crate::units::UnitSpans;
use crate::{ImageConfig, ImageError, Result, sparse};
use tracing::{debug, trace, warn};
use wdisc_formats::ciso::{CISO_HEAD_SIZE, CISO_MAP_SIZE, CisoHeader, calc_block_size};

/// An open CISO container.
#[derive(Debug)]
pub struct CisoImage<F> {
    file: F,
    header: CisoHeader,
    /// Packed slot of each present unit
    slots: Vec<Option<u32>>,
    used_blocks: u32,
    needed_blocks: u64,
    dirty: bool,
}

impl<F: DiskFile> CisoImage<F> {
    /// Create an empty container sized for an image of `image_size` bytes.
    ///
    /// The unit size comes from `config.ciso_block_size` if set, otherwise
    /// from [`calc_block_size`]. The header is written immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Config`] if a forced unit size cannot cover
    /// `image_size`, or an I/O error from writing the header.
    pub fn create(mut file: F, image_size: u64, config: &ImageConfig) -> Result<Self> {
        config.validate()?;
        let block_size = config
            .ciso_block_size
            .unwrap_or_else(|| calc_block_size(image_size));
        let capacity = u64::from(block_size) * CISO_MAP_SIZE as u64;
        if image_size > capacity {
            return Err(ImageError::Config(format!(
                "CISO unit size {block_size:#x} covers {capacity:#x} bytes, image needs {image_size:#x}"
            )));
        }

        let header = CisoHeader::new(block_size)?;
        file.write_all_at(0, &header.encode()?)?;
        file.set_len(CISO_HEAD_SIZE as u64)?;
        debug!(
            "Created CISO container: unit size {:#x}, image size {:#x}",
            block_size, image_size
        );

        Ok(Self {
            file,
            header,
            slots: vec![None; CISO_MAP_SIZE],
            used_blocks: 0,
            needed_blocks: 0,
            dirty: false,
        })
    }

    /// Open an existing container.
    ///
    /// # Errors
    ///
    /// Returns a [`FormatError`](wdisc_formats::FormatError) if the header is
    /// not CISO or is invalid, or an I/O error.
    pub fn open(mut file: F) -> Result<Self> {
        let file_len = file.file_len()?;
        let head_len = file_len.min(CISO_HEAD_SIZE as u64) as usize;
        let mut head = vec![0u8; head_len];
        file.read_exact_at(0, &mut head)?;
        let header = CisoHeader::decode(&head)?;

        let mut slots = vec![None; CISO_MAP_SIZE];
        let mut used_blocks = 0u32;
        for (slot, &present) in slots.iter_mut().zip(&header.map) {
            if present {
                *slot = Some(used_blocks);
                used_blocks += 1;
            }
        }
        let needed_blocks = header.high_water() as u64;

        let data_end = CISO_HEAD_SIZE as u64 + u64::from(used_blocks) * u64::from(header.block_size);
        if file_len < data_end {
            warn!(
                "CISO file is {:#x} bytes but the map needs {:#x}; file is truncated",
                file_len, data_end
            );
        }
        debug!(
            "Opened CISO container: unit size {:#x}, {} units used, {} needed",
            header.block_size, used_blocks, needed_blocks
        );

        Ok(Self {
            file,
            header,
            slots,
            used_blocks,
            needed_blocks,
            dirty: false,
        })
    }

    /// Unit size in bytes.
    pub const fn block_size(&self) -> u32 {
        self.header.block_size
    }

    /// Number of present units.
    pub const fn used_blocks(&self) -> u32 {
        self.used_blocks
    }

    /// High-water mark: one past the highest unit ever allocated.
    pub const fn needed_blocks(&self) -> u64 {
        self.needed_blocks
    }

    /// Whether `unit` is stored.
    pub fn is_present(&self, unit: u64) -> bool {
        usize::try_from(unit)
            .ok()
            .and_then(|u| self.header.map.get(u))
            .copied()
            .unwrap_or(false)
    }

    /// Bytes addressable through the presence map.
    pub fn capacity(&self) -> u64 {
        u64::from(self.header.block_size) * CISO_MAP_SIZE as u64
    }

    /// Current header state.
    pub const fn header(&self) -> &CisoHeader {
        &self.header
    }

    /// File offset of the packed slot `slot`.
    fn slot_offset(&self, slot: u32) -> u64 {
        CISO_HEAD_SIZE as u64 + u64::from(slot) * u64::from(self.header.block_size)
    }

    fn slot_of(&self, unit: u64) -> Option<u32> {
        usize::try_from(unit)
            .ok()
            .and_then(|u| self.slots.get(u))
            .copied()
            .flatten()
    }

    /// Claim the next packed slot for `unit`.
    fn allocate(&mut self, unit: u64) -> Result<u32> {
        let index = usize::try_from(unit)
            .ok()
            .filter(|&u| u < CISO_MAP_SIZE)
            .ok_or(ImageError::CisoMapFull {
                unit,
                capacity: CISO_MAP_SIZE,
            })?;

        let slot = self.used_blocks;
        self.header.map[index] = true;
        self.slots[index] = Some(slot);
        self.used_blocks += 1;
        self.needed_blocks = unit + 1;
        self.dirty = true;
        trace!("CISO unit {} -> slot {}", unit, slot);
        Ok(slot)
    }

    /// Read `buf.len()` bytes of the image at `offset`. Absent units and
    /// units beyond the map read as zeros.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a present unit cannot be read.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let block_size = u64::from(self.header.block_size);
        for span in UnitSpans::new(offset, buf.len() as u64, block_size) {
            let out = &mut buf[span.buf_range()];
            match self.slot_of(span.unit) {
                Some(slot) => {
                    let pos = self.slot_offset(slot) + span.offset;
                    self.file.read_exact_at(pos, out)?;
                }
                None => out.fill(0),
            }
        }
        Ok(())
    }

    /// Write `data` at image `offset`, allocating units as needed.
    ///
    /// A unit skipped below the high-water mark is a permanent hole. Zero
    /// data aimed at it is a no-op, as the hole already reads as zeros;
    /// anything else is rejected.
    ///
    /// Units already written before a failing unit stay written.
    ///
    /// # Errors
    ///
    /// - [`ImageError::HoleWrite`] for non-zero data aimed at a skipped unit
    /// - [`ImageError::CisoMapFull`] for a unit beyond the presence map
    /// - I/O errors from the file
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let block_size = u64::from(self.header.block_size);
        for span in UnitSpans::new(offset, data.len() as u64, block_size) {
            let chunk = &data[span.buf_range()];

            if let Some(slot) = self.slot_of(span.unit) {
                let pos = self.slot_offset(slot) + span.offset;
                self.file.write_all_at(pos, chunk)?;
                continue;
            }

            if span.unit < self.needed_blocks {
                if sparse::is_zero(chunk) {
                    continue;
                }
                return Err(ImageError::HoleWrite {
                    unit: span.unit,
                    high_water: self.needed_blocks,
                });
            }

            let slot = self.allocate(span.unit)?;
            let start = self.slot_offset(slot);
            let end = start + block_size;
            let file_len = self.file.file_len()?;
            if file_len > start {
                write_zeros_at(&mut self.file, start, span.offset)?;
                let tail = span.offset + span.len as u64;
                write_zeros_at(&mut self.file, start + tail, block_size - tail)?;
            }
            self.file.write_all_at(start + span.offset, chunk)?;
            if self.file.file_len()? < end {
                self.file.set_len(end)?;
            }
        }
        Ok(())
    }

    /// Zero `len` bytes at `offset`. Absent units already read as zeros and
    /// are skipped; nothing is allocated.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the file.
    pub fn write_zero_at(&mut self, offset: u64, len: u64) -> Result<()> {
        let block_size = u64::from(self.header.block_size);
        for span in UnitSpans::new(offset, len, block_size) {
            if let Some(slot) = self.slot_of(span.unit) {
                let pos = self.slot_offset(slot) + span.offset;
                write_zeros_at(&mut self.file, pos, span.len as u64)?;
            }
        }
        Ok(())
    }

    /// Write the header and sync, without truncating the file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the file.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.file.write_all_at(0, &self.header.encode()?)?;
            self.dirty = false;
        }
        self.file.sync()?;
        Ok(())
    }

    /// Write the header, cut the file to exactly the used units, sync, and
    /// return the file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the file.
    pub fn close(mut self) -> Result<F> {
        self.file.write_all_at(0, &self.header.encode()?)?;
        let len = self.slot_offset(self.used_blocks);
        self.file.set_len(len)?;
        self.file.sync()?;
        debug!(
            "Closed CISO container: {} units used, file size {:#x}",
            self.used_blocks, len
        );
        Ok(self.file)
    }
}

impl<F: DiskFile> ImageIo for CisoImage<F> {
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
        Self::capacity(self)
    }

    fn unit_size(&self) -> u64 {
        u64::from(self.header.block_size)
    }

    fn used_units(&self) -> u64 {
        u64::from(self.used_blocks)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::io::MemoryFile;
    use pretty_assertions::assert_eq;
    use wdisc_formats::ciso::CISO_MIN_BLOCK_SIZE;

    const BS: u64 = CISO_MIN_BLOCK_SIZE as u64;

    fn new_image() -> CisoImage<MemoryFile> {
        CisoImage::create(MemoryFile::new(), 64 * BS, &ImageConfig::default()).expect("create")
    }

    #[test]
    fn test_create_writes_header() {
        let image = new_image();
        assert_eq!(image.block_size(), CISO_MIN_BLOCK_SIZE);
        let file = image.close().expect("close");
        assert_eq!(file.as_slice().len(), CISO_HEAD_SIZE);
        assert_eq!(&file.as_slice()[..4], b"CISO");
    }

    #[test]
    fn test_units_packed_in_touch_order() {
        let mut image = new_image();
        image.write_at(2 * BS + 5, b"two").expect("write 2");
        image.write_at(7 * BS, b"seven").expect("write 7");
        assert_eq!(image.used_blocks(), 2);
        assert_eq!(image.needed_blocks(), 8);

        let file = image.close().expect("close");
        let bytes = file.as_slice();
        assert_eq!(bytes.len() as u64, CISO_HEAD_SIZE as u64 + 2 * BS);
        let slot0 = CISO_HEAD_SIZE + 5;
        assert_eq!(&bytes[slot0..slot0 + 3], b"two");
        let slot1 = CISO_HEAD_SIZE + BS as usize;
        assert_eq!(&bytes[slot1..slot1 + 5], b"seven");
    }

    #[test]
    fn test_reopen_rebuilds_slots() {
        let mut image = new_image();
        image.write_at(BS - 2, b"span").expect("write");
        let file = image.close().expect("close");

        let mut image = CisoImage::open(file).expect("open");
        assert_eq!(image.used_blocks(), 2);
        assert_eq!(image.needed_blocks(), 2);
        assert!(!image.is_present(2));

        let mut buf = [0u8; 8];
        image.read_at(BS - 4, &mut buf).expect("read");
        assert_eq!(&buf, b"\0\0span\0\0");
    }

    #[test]
    fn test_overwrite_present_unit() {
        let mut image = new_image();
        image.write_at(0, &[1u8; 16]).expect("first");
        image.write_at(8, &[2u8; 4]).expect("overwrite");
        assert_eq!(image.used_blocks(), 1);

        let mut buf = [0u8; 16];
        image.read_at(0, &mut buf).expect("read");
        assert_eq!(buf, [1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 1, 1, 1, 1]);
    }

    #[test]
    fn test_zero_write_into_skipped_unit_is_noop() {
        let mut image = new_image();
        image.write_at(4 * BS, b"x").expect("write 4");
        image.write_at(BS, &[0u8; 32]).expect("zeros into hole");
        assert!(!image.is_present(1));
        assert!(matches!(
            image.write_at(BS, b"data"),
            Err(ImageError::HoleWrite { unit: 1, high_water: 5 })
        ));
    }

    #[test]
    fn test_write_zero_skips_absent() {
        let mut image = new_image();
        image.write_at(0, &[0xAB; 64]).expect("write");
        image.write_zero_at(16, 2 * BS).expect("zero");
        assert_eq!(image.used_blocks(), 1);
        assert!(!image.is_present(1));

        let mut buf = [0u8; 32];
        image.read_at(0, &mut buf).expect("read");
        assert_eq!(&buf[..16], &[0xAB; 16]);
        assert_eq!(&buf[16..], &[0; 16]);
    }

    #[test]
    fn test_map_full() {
        let mut image = new_image();
        let last = (CISO_MAP_SIZE as u64 - 1) * BS;
        image.write_at(last, b"end").expect("last unit");
        let err = image.write_at(last + BS, b"past").unwrap_err();
        assert!(matches!(err, ImageError::CisoMapFull { .. }));
    }

    #[test]
    fn test_reused_tail_is_zeroed() {
        // stale bytes past the recorded units must not leak into new units
        let mut file = CisoImage::create(MemoryFile::new(), 8 * BS, &ImageConfig::default())
            .expect("create")
            .close()
            .expect("close");
        file.write_all_at(CISO_HEAD_SIZE as u64, &vec![0xEE; BS as usize])
            .expect("garbage");

        let mut image = CisoImage::open(file).expect("open");
        image.write_at(100, b"new").expect("write");
        let mut buf = vec![0u8; BS as usize];
        image.read_at(0, &mut buf).expect("read");
        assert!(buf[..100].iter().all(|&b| b == 0));
        assert_eq!(&buf[100..103], b"new");
        assert!(buf[103..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_forced_block_size_too_small() {
        let config = ImageConfig::default().with_ciso_block_size(CISO_MIN_BLOCK_SIZE);
        let err = CisoImage::create(MemoryFile::new(), 2 * (1 << 30), &config).unwrap_err();
        assert!(matches!(err, ImageError::Config(_)));
    }

    #[test]
    fn test_open_rejects_other_formats() {
        let err = CisoImage::open(MemoryFile::from_vec(b"WBFS....".to_vec())).unwrap_err();
        assert!(err.is_format_mismatch());
    }
}
