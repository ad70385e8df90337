//! Virtual image dispatcher.
//!
//! [`VirtualImage`] is the one type the rest of an application sees. The
//! backing format is resolved once, when the image is opened or created,
//! into a [`Backend`]; every later call goes through that backend's
//! [`ImageIo`] implementation.
//!
//! The dispatcher owns the logical size and the byte high-water mark. Sparse
//! writes consult the high-water mark to decide which zero runs may be
//! skipped: bytes below it may already hold data and are always written.

use crate::ciso::CisoImage;
use crate::io::DiskFile;
use crate::raw::RawImage;
use crate::sparse::{SpanKind, SparseSplitter};
use crate::wbfs::{WbfsDisc, WbfsPartition};
use crate::{ImageConfig, ImageError, Result};
use serde::Serialize;
use tracing::{debug, info};
use wdisc_formats::{DiscHeader, ImageFormat, Probe};

/// Positioned I/O contract shared by every backend.
pub trait ImageIo {
    /// Fill `buf` from image `offset`. Unstored ranges read as zeros.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Store `data` at image `offset`, allocating as needed.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Zero `len` bytes at `offset` without allocating.
    fn write_zero_at(&mut self, offset: u64, len: u64) -> Result<()>;

    /// Persist metadata and sync the file.
    fn flush(&mut self) -> Result<()>;

    /// Largest addressable image size.
    fn capacity(&self) -> u64;

    /// Allocation granularity in bytes.
    fn unit_size(&self) -> u64;

    /// Units physically stored.
    fn used_units(&self) -> u64;
}

/// A WBFS partition bound to one of its discs.
#[derive(Debug)]
pub struct WbfsImage<F> {
    partition: WbfsPartition<F>,
    disc: WbfsDisc,
}

impl<F: DiskFile> WbfsImage<F> {
    /// Bind `disc`, opened from `partition`.
    pub const fn new(partition: WbfsPartition<F>, disc: WbfsDisc) -> Self {
        Self { partition, disc }
    }

    /// The partition.
    pub const fn partition(&self) -> &WbfsPartition<F> {
        &self.partition
    }

    /// The bound disc.
    pub const fn disc(&self) -> &WbfsDisc {
        &self.disc
    }

    /// Close the disc and the partition, returning the file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the final metadata writes.
    pub fn close(self) -> Result<F> {
        let Self {
            mut partition,
            disc,
        } = self;
        partition.close_disc(disc)?;
        partition.close()
    }
}

impl<F: DiskFile> ImageIo for WbfsImage<F> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.partition.read_disc(&self.disc, offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.partition.write_disc(&mut self.disc, offset, data)
    }

    fn write_zero_at(&mut self, offset: u64, len: u64) -> Result<()> {
        self.partition.write_zero_disc(&mut self.disc, offset, len)
    }

    fn flush(&mut self) -> Result<()> {
        self.partition.flush_disc(&mut self.disc)
    }

    fn capacity(&self) -> u64 {
        self.partition.geometry().disc_capacity()
    }

    fn unit_size(&self) -> u64 {
        self.disc.unit_size()
    }

    fn used_units(&self) -> u64 {
        self.disc.used_units() as u64
    }
}

/// The concrete engine behind a [`VirtualImage`].
#[derive(Debug)]
pub enum Backend<F> {
    /// Plain file
    Raw(RawImage<F>),
    /// CISO container
    Ciso(CisoImage<F>),
    /// One disc of a WBFS partition
    Wbfs(WbfsImage<F>),
}

impl<F: DiskFile> Backend<F> {
    /// Format tag.
    pub const fn format(&self) -> ImageFormat {
        match self {
            Self::Raw(_) => ImageFormat::Raw,
            Self::Ciso(_) => ImageFormat::Ciso,
            Self::Wbfs(_) => ImageFormat::Wbfs,
        }
    }

    fn io(&mut self) -> &mut dyn ImageIo {
        match self {
            Self::Raw(image) => image,
            Self::Ciso(image) => image,
            Self::Wbfs(image) => image,
        }
    }

    fn io_ref(&self) -> &dyn ImageIo {
        match self {
            Self::Raw(image) => image,
            Self::Ciso(image) => image,
            Self::Wbfs(image) => image,
        }
    }
}

/// Logical size and byte high-water mark of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct WriteState {
    /// Logical image size
    pub size: u64,
    /// One past the highest byte ever addressed
    pub high_water: u64,
}

impl WriteState {
    /// Mark bytes up to `end` as addressed. Done before the backend runs,
    /// since a failing write may still have committed a prefix.
    fn address(&mut self, end: u64) {
        self.high_water = self.high_water.max(end);
    }

    fn extend(&mut self, end: u64) {
        self.size = self.size.max(end);
    }
}

/// Summary of an open image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    /// Backing format
    pub format: ImageFormat,
    /// Logical image size
    pub size: u64,
    /// One past the highest byte ever addressed
    pub high_water: u64,
    /// Largest addressable image size
    pub capacity: u64,
    /// Allocation unit size
    pub unit_size: u64,
    /// Units physically stored
    pub used_units: u64,
}

/// One open disc image with a format-independent read/write contract.
#[derive(Debug)]
pub struct VirtualImage<F> {
    backend: Backend<F>,
    state: WriteState,
    splitter: SparseSplitter,
}

impl<F: DiskFile> VirtualImage<F> {
    /// Open `file`, detecting its format from the leading bytes.
    ///
    /// # Errors
    ///
    /// As [`open_as`](Self::open_as).
    pub fn open(mut file: F, config: &ImageConfig) -> Result<Self> {
        let mut detected = probe(&mut file, 0)?;
        if detected.format == ImageFormat::Raw && config.partition_offset > 0 {
            let inner = probe(&mut file, config.partition_offset)?;
            if inner.format == ImageFormat::Wbfs {
                detected = inner;
            }
        }
        if detected.disc_magic {
            debug!("Detected raw image with a disc header");
        } else {
            debug!("Detected {} image", detected.format);
        }
        Self::open_as(file, detected.format, config)
    }

    /// Open `file` as `format`.
    ///
    /// A WBFS partition binds the disc named by `config.wbfs_disc`, or the
    /// first stored disc.
    ///
    /// # Errors
    ///
    /// Returns a detection error if the file is not `format`, a format error
    /// for a broken header, [`ImageError::DiscNotFound`] for a WBFS
    /// partition without the requested disc, or an I/O error.
    pub fn open_as(file: F, format: ImageFormat, config: &ImageConfig) -> Result<Self> {
        config.validate()?;
        let (backend, state) = match format {
            ImageFormat::Raw => {
                let image = RawImage::open(file)?;
                let size = image.size();
                (Backend::Raw(image), WriteState { size, high_water: size })
            }
            ImageFormat::Ciso => {
                let image = CisoImage::open(file)?;
                let size = image.needed_blocks() * u64::from(image.block_size());
                (Backend::Ciso(image), WriteState { size, high_water: size })
            }
            ImageFormat::Wbfs => {
                let mut partition = WbfsPartition::open(file, config)?;
                let disc = match &config.wbfs_disc {
                    Some(selector) => partition.open_disc_by(selector)?,
                    None => {
                        let slot = partition.first_used_slot().ok_or_else(|| {
                            ImageError::DiscNotFound("partition holds no disc".to_string())
                        })?;
                        partition.open_disc(slot)?
                    }
                };
                let state = WriteState {
                    size: disc.size(),
                    high_water: disc.needed_units() * disc.unit_size(),
                };
                (Backend::Wbfs(WbfsImage::new(partition, disc)), state)
            }
        };

        info!(
            "Opened {} image: size {:#x}, high-water {:#x}",
            format, state.size, state.high_water
        );
        Ok(Self {
            backend,
            state,
            splitter: SparseSplitter::new(config.min_hole_size),
        })
    }

    /// Create a new image of logical `size` bytes in `file`.
    ///
    /// For WBFS a single-disc partition just large enough for `size` is
    /// formatted and `header` names the disc. A given `header` is also
    /// written as the image's first 256 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::OutOfRange`] if `size` exceeds what the format
    /// can address, a configuration error, or an I/O error.
    pub fn create(
        file: F,
        format: ImageFormat,
        size: u64,
        header: Option<DiscHeader>,
        config: &ImageConfig,
    ) -> Result<Self> {
        config.validate()?;
        let backend = match format {
            ImageFormat::Raw => Backend::Raw(RawImage::create(file, size)?),
            ImageFormat::Ciso => Backend::Ciso(CisoImage::create(file, size, config)?),
            ImageFormat::Wbfs => {
                let partition_size = WbfsPartition::<F>::size_for_disc(size, config.hd_sector_size)?;
                let mut partition = WbfsPartition::format(file, partition_size, config)?;
                let limit = partition.geometry().disc_capacity();
                if size > limit {
                    return Err(ImageError::OutOfRange {
                        offset: 0,
                        len: size,
                        limit,
                    });
                }
                let disc_header = header.clone().unwrap_or_default();
                let disc = partition.create_disc(&disc_header)?;
                Backend::Wbfs(WbfsImage::new(partition, disc))
            }
        };

        let mut image = Self {
            backend,
            state: WriteState { size, high_water: 0 },
            splitter: SparseSplitter::new(config.min_hole_size),
        };
        if let Some(header) = header {
            image.write(0, header.as_bytes())?;
        }
        info!("Created {} image of {:#x} bytes", format, size);
        Ok(image)
    }

    /// Backing format.
    pub const fn format(&self) -> ImageFormat {
        self.backend.format()
    }

    /// The bound backend.
    pub const fn backend(&self) -> &Backend<F> {
        &self.backend
    }

    /// Logical size and high-water mark.
    pub const fn state(&self) -> WriteState {
        self.state
    }

    /// Logical image size.
    pub const fn size(&self) -> u64 {
        self.state.size
    }

    /// One past the highest byte ever addressed.
    pub const fn high_water(&self) -> u64 {
        self.state.high_water
    }

    /// Summary of the image.
    pub fn info(&self) -> ImageInfo {
        let io = self.backend.io_ref();
        ImageInfo {
            format: self.format(),
            size: self.state.size,
            high_water: self.state.high_water,
            capacity: io.capacity(),
            unit_size: io.unit_size(),
            used_units: io.used_units(),
        }
    }

    fn end_of(offset: u64, len: u64) -> Result<u64> {
        offset.checked_add(len).ok_or(ImageError::OutOfRange {
            offset,
            len,
            limit: u64::MAX,
        })
    }

    /// Read `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    /// Fill `buf` from `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::OutOfRange`] past the backend's capacity, or
    /// propagates backend errors.
    pub fn read_into(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len() as u64;
        let end = Self::end_of(offset, len)?;
        let io = self.backend.io();
        let limit = io.capacity();
        if end > limit {
            return Err(ImageError::OutOfRange { offset, len, limit });
        }
        io.read_at(offset, buf)
    }

    /// Write `data` verbatim at `offset`.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = Self::end_of(offset, data.len() as u64)?;
        self.state.address(end);
        self.backend.io().write_at(offset, data)?;
        self.state.extend(end);
        Ok(())
    }

    /// Write `data` at `offset`, skipping zero runs that lie beyond the
    /// high-water mark and are at least the configured hole size.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn write_sparse(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = Self::end_of(offset, data.len() as u64)?;
        let spans = self.splitter.split(offset, data, self.state.high_water);
        self.state.address(end);
        let io = self.backend.io();
        for span in spans.iter().filter(|s| s.kind == SpanKind::Data) {
            io.write_at(span.offset, &data[span.buf_range()])?;
        }
        self.state.extend(end);
        Ok(())
    }

    /// Zero `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn write_zero(&mut self, offset: u64, len: u64) -> Result<()> {
        let end = Self::end_of(offset, len)?;
        self.state.address(end);
        self.backend.io().write_zero_at(offset, len)?;
        self.state.extend(end);
        Ok(())
    }

    /// Persist metadata and sync.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn flush(&mut self) -> Result<()> {
        self.backend.io().flush()
    }

    /// Finalize the backend and return the file.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn close(self) -> Result<F> {
        debug!(
            "Closing {} image: size {:#x}",
            self.backend.format(),
            self.state.size
        );
        match self.backend {
            Backend::Raw(mut image) => {
                image.set_size(self.state.size);
                image.close()
            }
            Backend::Ciso(image) => image.close(),
            Backend::Wbfs(image) => image.close(),
        }
    }
}

/// Detect the format of the bytes at `offset`.
fn probe<F: DiskFile>(file: &mut F, offset: u64) -> Result<Probe> {
    let len = file.file_len()?;
    let head_len = len.saturating_sub(offset).min(ImageFormat::PROBE_SIZE as u64) as usize;
    let mut head = vec![0u8; head_len];
    file.read_exact_at(offset, &mut head)?;
    Ok(ImageFormat::detect(&head))
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::io::MemoryFile;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use wdisc_formats::WII_SINGLE_LAYER_SIZE;

    const SIZE: u64 = 8 * 1024 * 1024;

    fn create(format: ImageFormat) -> VirtualImage<MemoryFile> {
        let config = ImageConfig::default();
        VirtualImage::create(MemoryFile::new(), format, SIZE, None, &config).expect("create")
    }

    #[test]
    fn test_create_and_detect_each_format() {
        for format in [ImageFormat::Raw, ImageFormat::Ciso, ImageFormat::Wbfs] {
            let mut image = create(format);
            image.write(0x1234, b"payload").expect("write");
            let file = image.close().expect("close");

            let mut image = VirtualImage::open(file, &ImageConfig::default()).expect("open");
            assert_eq!(image.format(), format);
            assert_eq!(image.read(0x1234, 7).expect("read"), b"payload");
            image.close().expect("close");
        }
    }

    #[test]
    fn test_header_written_on_create() {
        let header = DiscHeader::new("RHDR01", "Header Test").expect("header");
        let config = ImageConfig::default();
        let mut image = VirtualImage::create(
            MemoryFile::new(),
            ImageFormat::Wbfs,
            SIZE,
            Some(header.clone()),
            &config,
        )
        .expect("create");
        assert_eq!(image.high_water(), 0x100);
        assert_eq!(image.read(0, 0x100).expect("read"), header.as_bytes());

        let Backend::Wbfs(wbfs) = image.backend() else {
            panic!("expected WBFS backend");
        };
        assert_eq!(wbfs.disc().id(), "RHDR01");
        image.close().expect("close");
    }

    #[test]
    fn test_sparse_write_below_mark_is_verbatim() {
        let mut image = create(ImageFormat::Raw);
        image.write(0, &[0xAA; 8192]).expect("data");
        image.write_sparse(0, &[0u8; 8192]).expect("zeros over data");
        assert_eq!(image.read(0, 8192).expect("read"), vec![0u8; 8192]);
    }

    #[test]
    fn test_sparse_holes_advance_high_water() {
        let mut image = create(ImageFormat::Ciso);
        image.write_sparse(0, &[0u8; 0x10000]).expect("sparse");
        assert_eq!(image.high_water(), 0x10000);
        assert_eq!(image.info().used_units, 0);
        // below the mark the zeros go through and commit both units
        image.write_sparse(0, &[0u8; 0x10000]).expect("again");
        assert_eq!(image.info().used_units, 2);
    }

    #[test]
    fn test_wbfs_disc_selection() {
        let config = ImageConfig::default();
        let mut partition =
            WbfsPartition::format(MemoryFile::new(), 64 * 1024 * 1024, &config).expect("format");
        for id in ["RAAA01", "RBBB01"] {
            let header = DiscHeader::new(id, id).expect("header");
            let mut disc = partition.create_disc(&header).expect("create");
            partition
                .write_disc(&mut disc, 0, header.as_bytes())
                .expect("write");
            partition.close_disc(disc).expect("close disc");
        }
        let file = partition.close().expect("close");

        let by_id = config
            .clone()
            .with_wbfs_disc(wdisc_formats::DiscSelector::Id("RBBB01".into()));
        let mut image = VirtualImage::open(file, &by_id).expect("open");
        assert_eq!(&image.read(0, 6).expect("read")[..], b"RBBB01");
        assert_eq!(image.size(), WII_SINGLE_LAYER_SIZE);
        let file = image.close().expect("close");

        let mut image = VirtualImage::open(file, &config).expect("open first");
        assert_eq!(&image.read(0, 6).expect("read")[..], b"RAAA01");
        image.close().expect("close");
    }

    #[test]
    fn test_info() {
        let mut image = create(ImageFormat::Ciso);
        image.write(0x8000 * 3, &[1]).expect("write");
        let info = image.info();
        assert_eq!(
            info,
            ImageInfo {
                format: ImageFormat::Ciso,
                size: SIZE,
                high_water: 0x8000 * 3 + 1,
                capacity: 0x8000 * 0x7FF8,
                unit_size: 0x8000,
                used_units: 1,
            }
        );
        let json = serde_json::to_value(info).expect("json");
        assert_eq!(json["format"], "ciso");
    }

    #[test]
    fn test_read_past_capacity() {
        let mut image = create(ImageFormat::Ciso);
        let capacity = image.info().capacity;
        assert_eq!(image.read(capacity - 4, 4).expect("read"), vec![0u8; 4]);
        let err = image.read(capacity - 4, 8).expect_err("past capacity");
        assert!(matches!(err, ImageError::OutOfRange { limit, .. } if limit == capacity));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_round_trip_every_format(
            format in prop_oneof![
                Just(ImageFormat::Raw),
                Just(ImageFormat::Ciso),
                Just(ImageFormat::Wbfs),
            ],
            offset in 0u64..(SIZE - 0x20000),
            data in proptest::collection::vec(any::<u8>(), 1..0x20000),
            sparse in any::<bool>(),
        ) {
            let mut image = create(format);
            if sparse {
                image.write_sparse(offset, &data).expect("write");
            } else {
                image.write(offset, &data).expect("write");
            }
            prop_assert_eq!(image.read(offset, data.len()).expect("read"), data.clone());

            let file = image.close().expect("close");
            let mut image = VirtualImage::open_as(file, format, &ImageConfig::default())
                .expect("reopen");
            prop_assert_eq!(image.read(offset, data.len()).expect("read"), data);
        }
    }
}
