//! WBFS partition engine.

use super::disc::{DiscSummary, WbfsDisc, logical_size};
use super::free_map::FreeBlockMap;
use crate::io::{DiskFile, ZERO_CHUNK, write_zeros_at};
use crate::units::UnitSpans;
use crate::{ImageConfig, ImageError, Result, sparse};
use std::num::NonZeroU16;
use tracing::{debug, info, trace, warn};
use wdisc_formats::disc_header::{DISC_HEADER_SIZE, DISC_ID_LEN, DiscId, parse_disc_id};
use wdisc_formats::wbfs::{
    DiscInfo, MAX_HD_SECTOR_SHIFT, MIN_UNIT_SECTOR_SHIFT, SlotState, WbfsGeometry, WbfsHead,
};
use wdisc_formats::{DiscHeader, DiscSelector, FormatError, WII_SECTOR_SHIFT};

/// Title field of the disc header, rewritten by [`WbfsPartition::rename_disc`].
const TITLE_RANGE: std::ops::Range<usize> = 0x20..0x60;

/// Unit usage summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionStats {
    /// Allocation unit size in bytes
    pub unit_size: u64,
    /// Data units (the metadata unit excluded)
    pub total_units: u32,
    /// Units marked free
    pub free_units: u32,
    /// Units marked used
    pub used_units: u32,
    /// Occupied disc slots
    pub used_slots: usize,
    /// Free disc slots
    pub free_slots: usize,
}

/// Indirection entry pointing outside the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadEntry {
    /// Disc slot
    pub slot: usize,
    /// Virtual unit of the disc
    pub virtual_unit: usize,
    /// Stored physical unit number
    pub value: u16,
}

/// Result of [`WbfsPartition::check`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Units referenced by more than one disc
    pub shared: Vec<u16>,
    /// Units referenced by a disc but marked free
    pub referenced_free: Vec<u16>,
    /// Units marked used that no disc references
    pub leaked: Vec<u16>,
    /// Entries beyond the last unit
    pub out_of_range: Vec<BadEntry>,
}

impl CheckReport {
    /// Whether no problem was found.
    pub fn is_clean(&self) -> bool {
        self.shared.is_empty()
            && self.referenced_free.is_empty()
            && self.leaked.is_empty()
            && self.out_of_range.is_empty()
    }
}

/// An open WBFS partition.
///
/// Metadata changes (slot table, free-block bitmap) are kept in memory and
/// written by [`sync`](Self::sync) or [`close`](Self::close). Skipping the
/// sync loses allocation metadata, never payload bytes already written.
/// Disc-info blocks are written when a disc is created, flushed or closed.
#[derive(Debug)]
pub struct WbfsPartition<F> {
    file: F,
    base: u64,
    geometry: WbfsGeometry,
    head: WbfsHead,
    max_discs: usize,
    /// Loaded on first use
    free_map: Option<FreeBlockMap>,
    /// Disc id per slot, loaded on first use
    ids: Option<Vec<Option<DiscId>>>,
    open: Vec<bool>,
    dirty: bool,
}

impl<F: DiskFile> WbfsPartition<F> {
    /// Format `size` bytes of `file`, starting at `config.partition_offset`.
    ///
    /// The geometry is derived from the size and `config.hd_sector_size`;
    /// `config.max_discs` caps the slot table. Every slot starts free and
    /// every data unit starts free.
    ///
    /// # Errors
    ///
    /// Returns a geometry error if no legal layout fits `size`, or an I/O
    /// error.
    pub fn format(file: F, size: u64, config: &ImageConfig) -> Result<Self> {
        config.validate()?;
        let hd_sec_sz = config.hd_sector_size;
        let n_hd_sec = u32::try_from(size / u64::from(hd_sec_sz)).map_err(|_| {
            FormatError::Geometry(format!("{size:#x} bytes exceed the 32-bit sector count"))
        })?;
        let geometry = WbfsGeometry::derive(n_hd_sec, hd_sec_sz)?;
        let max_discs = slot_limit(&geometry, config.max_discs);

        let mut partition = Self {
            file,
            base: config.partition_offset,
            geometry,
            head: WbfsHead::new(geometry.header()),
            max_discs,
            free_map: Some(FreeBlockMap::all_free(geometry.n_wbfs_sec - 1)),
            ids: Some(vec![None; max_discs]),
            open: vec![false; max_discs],
            dirty: true,
        };

        if config.clear_disc_infos {
            let start = partition.disc_info_pos(0);
            let len = u64::from(geometry.max_discs) * u64::from(geometry.disc_info_sz);
            write_zeros_at(&mut partition.file, start, len)?;
        }
        let end = partition.base + geometry.partition_size();
        if partition.file.file_len()? < end {
            partition.file.set_len(end)?;
        }
        partition.sync()?;

        info!(
            "Formatted WBFS partition: {} units of {:#x} bytes, {} disc slots",
            geometry.n_wbfs_sec,
            geometry.unit_size(),
            max_discs
        );
        Ok(partition)
    }

    /// Open an existing partition at `config.partition_offset`.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::BadMagic`] if the file is not WBFS, another
    /// format error if the header is invalid (or, with
    /// `config.verify_geometry`, if the unit size is not the derived one),
    /// or an I/O error.
    pub fn open(mut file: F, config: &ImageConfig) -> Result<Self> {
        config.validate()?;
        let base = config.partition_offset;
        let file_len = file.file_len()?;
        let head_len = file_len
            .saturating_sub(base)
            .min(1 << MAX_HD_SECTOR_SHIFT) as usize;
        let mut sector = vec![0u8; head_len];
        file.read_exact_at(base, &mut sector)?;

        let head = WbfsHead::decode(&sector)?;
        let geometry = WbfsGeometry::from_header(&head.header)?;

        if config.verify_geometry {
            let derived = WbfsGeometry::derive(geometry.n_hd_sec, geometry.hd_sec_sz())?;
            if derived.wbfs_sec_sz_s != geometry.wbfs_sec_sz_s {
                warn!(
                    "WBFS unit shift {} differs from derived shift {}",
                    geometry.wbfs_sec_sz_s, derived.wbfs_sec_sz_s
                );
                return Err(FormatError::Geometry(format!(
                    "unit shift {} is not the derived shift {}",
                    geometry.wbfs_sec_sz_s, derived.wbfs_sec_sz_s
                ))
                .into());
            }
        }

        let end = base + geometry.partition_size();
        if file_len < end {
            warn!(
                "WBFS partition ends at {:#x} but the file is only {:#x} bytes",
                end, file_len
            );
        }

        let max_discs = slot_limit(&geometry, config.max_discs);
        let hidden = head.slots[max_discs..geometry.max_discs as usize]
            .iter()
            .filter(|s| s.is_used())
            .count();
        if hidden > 0 {
            warn!(
                "{} occupied slot(s) beyond the configured limit of {} are not accessible",
                hidden, max_discs
            );
        }

        debug!(
            "Opened WBFS partition: {} units of {:#x} bytes, {} slots",
            geometry.n_wbfs_sec,
            geometry.unit_size(),
            max_discs
        );
        Ok(Self {
            file,
            base,
            geometry,
            head,
            max_discs,
            free_map: None,
            ids: None,
            open: vec![false; max_discs],
            dirty: false,
        })
    }

    /// Partition size needed to hold one disc of `disc_size` bytes plus the
    /// metadata unit, using the smallest allocation unit.
    ///
    /// # Errors
    ///
    /// Returns a geometry error if the disc needs more units than a
    /// partition can address.
    pub fn size_for_disc(disc_size: u64, hd_sec_sz: u32) -> Result<u64> {
        let hd_sec_sz_s = hd_sec_sz.trailing_zeros() as u8;
        let unit_shift = MIN_UNIT_SECTOR_SHIFT + WII_SECTOR_SHIFT;
        let data_units = u32::try_from(disc_size.div_ceil(1 << unit_shift).max(1))
            .map_err(|_| FormatError::Geometry(format!("disc size {disc_size:#x} too large")))?;
        let sectors = WbfsGeometry::sectors_for_units(data_units, unit_shift, hd_sec_sz_s);
        Ok(sectors << hd_sec_sz_s)
    }

    /// Partition layout.
    pub const fn geometry(&self) -> &WbfsGeometry {
        &self.geometry
    }

    /// Usable disc slots.
    pub const fn max_discs(&self) -> usize {
        self.max_discs
    }

    /// Byte offset of the partition inside the file.
    pub const fn partition_offset(&self) -> u64 {
        self.base
    }

    /// Whether metadata changes are waiting for [`sync`](Self::sync).
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Number of open discs.
    pub fn open_count(&self) -> usize {
        self.open.iter().filter(|&&o| o).count()
    }

    /// Slot table state of `slot`.
    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.head.slots[..self.max_discs].get(slot).copied()
    }

    /// First occupied slot.
    pub fn first_used_slot(&self) -> Option<usize> {
        self.head.slots[..self.max_discs]
            .iter()
            .position(|s| s.is_used())
    }

    fn disc_info_pos(&self, slot: usize) -> u64 {
        self.base + self.geometry.disc_info_offset(slot as u32)
    }

    fn unit_pos(&self, unit: NonZeroU16) -> u64 {
        self.base + self.geometry.unit_offset(unit.get())
    }

    fn data_units(&self) -> u32 {
        self.geometry.n_wbfs_sec - 1
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.max_discs {
            return Err(ImageError::InvalidSlot {
                slot,
                max: self.max_discs,
            });
        }
        if !self.head.slots[slot].is_used() {
            return Err(ImageError::DiscNotFound(format!("slot {slot}")));
        }
        Ok(())
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        let limit = self.geometry.disc_capacity();
        match offset.checked_add(len) {
            Some(end) if end <= limit => Ok(()),
            _ => Err(ImageError::OutOfRange { offset, len, limit }),
        }
    }

    /// Read a disc-info block as stored, without range checks on entries.
    fn read_disc_info(&mut self, slot: usize) -> Result<DiscInfo> {
        let mut buf = vec![0u8; self.geometry.disc_info_sz as usize];
        self.file.read_exact_at(self.disc_info_pos(slot), &mut buf)?;
        Ok(DiscInfo::decode(&buf, self.geometry.n_wbfs_sec_per_disc)?)
    }

    fn write_disc_info(&mut self, slot: usize, info: &DiscInfo) -> Result<()> {
        let block = info.encode(self.geometry.disc_info_sz as usize);
        self.file.write_all_at(self.disc_info_pos(slot), &block)?;
        trace!("Wrote disc info of slot {}", slot);
        Ok(())
    }

    fn read_free_map(&mut self) -> Result<FreeBlockMap> {
        let mut buf = vec![0u8; self.geometry.free_map_sz as usize];
        let pos = self.base + self.geometry.free_map_offset();
        self.file.read_exact_at(pos, &mut buf)?;
        let map = FreeBlockMap::from_bytes(&buf, self.data_units());
        debug!(
            "Loaded free map: {} of {} units free",
            map.count_free(),
            map.n_units()
        );
        Ok(map)
    }

    fn free_map(&mut self) -> Result<&mut FreeBlockMap> {
        let map = match self.free_map.take() {
            Some(map) => map,
            None => self.read_free_map()?,
        };
        Ok(self.free_map.insert(map))
    }

    fn read_ids(&mut self) -> Result<Vec<Option<DiscId>>> {
        let mut ids = vec![None; self.max_discs];
        for (slot, id) in ids.iter_mut().enumerate() {
            if self.head.slots[slot].is_used() {
                let mut buf = [0u8; DISC_HEADER_SIZE];
                self.file.read_exact_at(self.disc_info_pos(slot), &mut buf)?;
                *id = Some(DiscHeader::from_bytes(&buf)?.id());
            }
        }
        debug!(
            "Loaded id cache: {} discs",
            ids.iter().filter(|id| id.is_some()).count()
        );
        Ok(ids)
    }

    fn ids(&mut self) -> Result<&mut Vec<Option<DiscId>>> {
        let ids = match self.ids.take() {
            Some(ids) => ids,
            None => self.read_ids()?,
        };
        Ok(self.ids.insert(ids))
    }

    /// Slot holding the disc with identifier `id`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the id cache has to be loaded and cannot be.
    pub fn find_disc(&mut self, id: &str) -> Result<Option<usize>> {
        Ok(self
            .ids()?
            .iter()
            .position(|entry| entry.as_ref().is_some_and(|d| d[..] == *id.as_bytes())))
    }

    fn allocate(&mut self) -> Result<NonZeroU16> {
        if let Some(unit) = self.free_map()?.alloc() {
            self.dirty = true;
            trace!("Allocated unit {}", unit);
            Ok(unit)
        } else {
            warn!("WBFS partition has no free unit left");
            Err(ImageError::NoFreeBlocks)
        }
    }

    /// Write the header, slot table and (if loaded) the free map, then sync.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the file.
    pub fn sync(&mut self) -> Result<()> {
        if self.dirty {
            let head = self.head.encode()?;
            self.file.write_all_at(self.base, &head)?;
            if let Some(map) = &self.free_map {
                let bytes = map.to_bytes(self.geometry.free_map_sz as usize);
                let pos = self.base + self.geometry.free_map_offset();
                self.file.write_all_at(pos, &bytes)?;
            }
            self.dirty = false;
            debug!("Synced WBFS partition metadata");
        }
        self.file.sync()?;
        Ok(())
    }

    /// Sync and return the file.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::DiscsStillOpen`] if any disc has not been
    /// closed, or an I/O error.
    pub fn close(mut self) -> Result<F> {
        let open = self.open_count();
        if open > 0 {
            return Err(ImageError::DiscsStillOpen(open));
        }
        self.sync()?;
        debug!("Closed WBFS partition");
        Ok(self.file)
    }

    /// Create an empty disc described by `header` in the first free slot.
    ///
    /// Nothing is written to the disc's data; `header` is only the stored
    /// header copy.
    ///
    /// # Errors
    ///
    /// - [`ImageError::DiscExists`] if a disc with the same id is stored
    /// - [`ImageError::SlotTableFull`] if no slot is free
    pub fn create_disc(&mut self, header: &DiscHeader) -> Result<WbfsDisc> {
        let id = header.id();
        if self.ids()?.contains(&Some(id)) {
            return Err(ImageError::DiscExists(header.id_str()));
        }
        let slot = self.head.slots[..self.max_discs]
            .iter()
            .position(|s| !s.is_used())
            .ok_or(ImageError::SlotTableFull {
                slots: self.max_discs,
            })?;

        let info = DiscInfo::new(header.clone(), self.geometry.n_wbfs_sec_per_disc);
        self.write_disc_info(slot, &info)?;
        self.head.slots[slot] = SlotState::Valid;
        self.ids()?[slot] = Some(id);
        self.open[slot] = true;
        self.dirty = true;

        info!("Created disc {} in slot {}", header.id_str(), slot);
        Ok(WbfsDisc::new(slot, info, self.geometry.unit_size()))
    }

    /// Open the disc in `slot`.
    ///
    /// # Errors
    ///
    /// - [`ImageError::InvalidSlot`] / [`ImageError::DiscNotFound`] for a
    ///   bad or empty slot
    /// - [`ImageError::DiscInUse`] if the disc is already open
    /// - a format error if the indirection table points outside the partition
    pub fn open_disc(&mut self, slot: usize) -> Result<WbfsDisc> {
        self.check_slot(slot)?;
        if self.open[slot] {
            return Err(ImageError::DiscInUse(slot));
        }
        if let SlotState::Invalid(value) = self.head.slots[slot] {
            warn!("Slot {} is flagged invalid ({:#04x})", slot, value);
        }

        let info = self.read_disc_info(slot)?;
        let limit = self.data_units();
        if let Some(bad) = info
            .table
            .iter()
            .flatten()
            .find(|unit| u32::from(unit.get()) > limit)
        {
            return Err(FormatError::invalid(
                "WBFS disc info",
                "table",
                format!("slot {slot} references unit {bad}, partition has {limit}"),
            )
            .into());
        }

        self.open[slot] = true;
        let disc = WbfsDisc::new(slot, info, self.geometry.unit_size());
        debug!(
            "Opened disc {} in slot {}: {} units used",
            disc.id(),
            slot,
            disc.used_units()
        );
        Ok(disc)
    }

    /// Open the disc with identifier `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::DiscNotFound`] if no stored disc has this id,
    /// otherwise as [`open_disc`](Self::open_disc).
    pub fn open_disc_by_id(&mut self, id: &str) -> Result<WbfsDisc> {
        let slot = self
            .find_disc(id)?
            .ok_or_else(|| ImageError::DiscNotFound(id.to_string()))?;
        self.open_disc(slot)
    }

    /// Open the disc named by `selector`.
    ///
    /// # Errors
    ///
    /// As [`open_disc`](Self::open_disc) and
    /// [`open_disc_by_id`](Self::open_disc_by_id).
    pub fn open_disc_by(&mut self, selector: &DiscSelector) -> Result<WbfsDisc> {
        match selector {
            DiscSelector::Slot(slot) => self.open_disc(*slot),
            DiscSelector::Id(id) => self.open_disc_by_id(id),
        }
    }

    /// Write the disc's info block if it changed and sync the partition.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the file.
    pub fn flush_disc(&mut self, disc: &mut WbfsDisc) -> Result<()> {
        if disc.dirty {
            self.write_disc_info(disc.slot, &disc.info)?;
            disc.dirty = false;
        }
        self.sync()
    }

    /// Close a disc, writing its info block if it changed.
    ///
    /// The slot is released even if the write fails.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the file.
    pub fn close_disc(&mut self, disc: WbfsDisc) -> Result<()> {
        if let Some(open) = self.open.get_mut(disc.slot) {
            *open = false;
        }
        if disc.dirty {
            self.write_disc_info(disc.slot, &disc.info)?;
        }
        debug!("Closed disc in slot {}", disc.slot);
        Ok(())
    }

    /// Remove the disc in `slot`, returning its units to the free map.
    /// Returns the number of units freed.
    ///
    /// # Errors
    ///
    /// - [`ImageError::InvalidSlot`] / [`ImageError::DiscNotFound`] for a
    ///   bad or empty slot
    /// - [`ImageError::DiscInUse`] if the disc is open
    pub fn remove_disc(&mut self, slot: usize) -> Result<u32> {
        self.check_slot(slot)?;
        if self.open[slot] {
            return Err(ImageError::DiscInUse(slot));
        }

        let info = self.read_disc_info(slot)?;
        let map = self.free_map()?;
        let mut freed = 0;
        for &unit in info.table.iter().flatten() {
            if map.free(unit) {
                freed += 1;
            } else {
                warn!("Unit {} of slot {} was already free", unit, slot);
            }
        }

        self.head.slots[slot] = SlotState::Free;
        if let Some(ids) = &mut self.ids {
            ids[slot] = None;
        }
        self.dirty = true;

        info!(
            "Removed disc {} from slot {}: {} units freed",
            info.header.id_str(),
            slot,
            freed
        );
        Ok(freed)
    }

    /// Remove the disc with identifier `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::DiscNotFound`] if no stored disc has this id,
    /// otherwise as [`remove_disc`](Self::remove_disc).
    pub fn remove_disc_by_id(&mut self, id: &str) -> Result<u32> {
        let slot = self
            .find_disc(id)?
            .ok_or_else(|| ImageError::DiscNotFound(id.to_string()))?;
        self.remove_disc(slot)
    }

    /// Change the identifier and title of a stored disc, in the header copy
    /// and, if present, in the disc's own first unit.
    ///
    /// # Errors
    ///
    /// - [`ImageError::DiscInUse`] if the disc is open
    /// - [`ImageError::DiscExists`] if another disc has the new id
    /// - a format error for a malformed id
    pub fn rename_disc(&mut self, slot: usize, id: &str, title: &str) -> Result<()> {
        self.check_slot(slot)?;
        if self.open[slot] {
            return Err(ImageError::DiscInUse(slot));
        }
        let new_id = parse_disc_id(id)?;
        if self.find_disc(id)?.is_some_and(|other| other != slot) {
            return Err(ImageError::DiscExists(id.to_string()));
        }

        let mut info = self.read_disc_info(slot)?;
        let old_id = info.header.id_str();
        info.header.set_id(id)?;
        info.header.set_title(title);
        self.write_disc_info(slot, &info)?;

        if let Some(unit) = info.table.first().copied().flatten() {
            let pos = self.unit_pos(unit);
            let bytes = info.header.as_bytes();
            self.file.write_all_at(pos, &bytes[..DISC_ID_LEN])?;
            self.file
                .write_all_at(pos + TITLE_RANGE.start as u64, &bytes[TITLE_RANGE])?;
        }
        self.ids()?[slot] = Some(new_id);

        info!("Renamed disc in slot {}: {} -> {}", slot, old_id, id);
        Ok(())
    }

    /// Describe every stored disc, as recorded on disk.
    ///
    /// # Errors
    ///
    /// Returns an I/O or format error for an unreadable disc-info block.
    pub fn list_discs(&mut self) -> Result<Vec<DiscSummary>> {
        let unit_size = self.geometry.unit_size();
        let mut discs = Vec::new();
        for slot in 0..self.max_discs {
            let state = self.head.slots[slot];
            if !state.is_used() {
                continue;
            }
            let info = self.read_disc_info(slot)?;
            discs.push(DiscSummary {
                slot,
                id: info.header.id_str(),
                title: info.header.title(),
                state,
                used_units: info.used_units(),
                size: logical_size(info.high_water() as u64, unit_size),
            });
        }
        Ok(discs)
    }

    /// Unit and slot usage.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the free map has to be loaded and cannot be.
    pub fn stats(&mut self) -> Result<PartitionStats> {
        let total_units = self.data_units();
        let free_units = self.free_map()?.count_free();
        let used_slots = self.head.slots[..self.max_discs]
            .iter()
            .filter(|s| s.is_used())
            .count();
        Ok(PartitionStats {
            unit_size: self.geometry.unit_size(),
            total_units,
            free_units,
            used_units: total_units - free_units,
            used_slots,
            free_slots: self.max_discs - used_slots,
        })
    }

    /// Indirection tables of every stored disc, as recorded on disk.
    fn stored_tables(&mut self) -> Result<Vec<(usize, DiscInfo)>> {
        let mut tables = Vec::new();
        for slot in 0..self.max_discs {
            if self.head.slots[slot].is_used() {
                tables.push((slot, self.read_disc_info(slot)?));
            }
        }
        Ok(tables)
    }

    /// Cross-check the free map against every stored indirection table.
    ///
    /// Open discs are checked as last written to disk.
    ///
    /// # Errors
    ///
    /// Returns an I/O or format error for unreadable metadata.
    pub fn check(&mut self) -> Result<CheckReport> {
        let limit = self.data_units();
        let mut refs = vec![0u32; limit as usize + 1];
        let mut report = CheckReport::default();

        for (slot, info) in self.stored_tables()? {
            for (virtual_unit, unit) in info.table.iter().enumerate() {
                let Some(unit) = unit else { continue };
                if u32::from(unit.get()) > limit {
                    report.out_of_range.push(BadEntry {
                        slot,
                        virtual_unit,
                        value: unit.get(),
                    });
                } else {
                    refs[usize::from(unit.get())] += 1;
                }
            }
        }

        let map = self.free_map()?;
        for unit in 1..=limit {
            let count = refs[unit as usize];
            let free = map.is_free(unit);
            let unit = unit as u16;
            if count > 1 {
                report.shared.push(unit);
            }
            if count > 0 && free {
                report.referenced_free.push(unit);
            }
            if count == 0 && !free {
                report.leaked.push(unit);
            }
        }

        if report.is_clean() {
            debug!("WBFS partition check passed");
        } else {
            warn!(
                "WBFS partition check: {} shared, {} referenced but free, {} leaked, {} out of range",
                report.shared.len(),
                report.referenced_free.len(),
                report.leaked.len(),
                report.out_of_range.len()
            );
        }
        Ok(report)
    }

    /// Recompute the free map from the stored indirection tables.
    /// Returns the number of free units.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::DiscsStillOpen`] while discs are open, since
    /// their unsaved allocations would be lost.
    pub fn rebuild_free_map(&mut self) -> Result<u32> {
        let open = self.open_count();
        if open > 0 {
            return Err(ImageError::DiscsStillOpen(open));
        }

        let mut map = FreeBlockMap::all_free(self.data_units());
        for (slot, info) in self.stored_tables()? {
            for unit in info.table.iter().flatten() {
                if !map.claim(u32::from(unit.get())) {
                    warn!("Slot {} references unit {} again or out of range", slot, unit);
                }
            }
        }

        let free = map.count_free();
        self.free_map = Some(map);
        self.dirty = true;
        info!("Rebuilt free map: {} units free", free);
        Ok(free)
    }

    /// Drop the cached free map and id list; both reload on next use.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Config`] if metadata changes are not synced.
    pub fn invalidate_caches(&mut self) -> Result<()> {
        if self.dirty {
            return Err(ImageError::Config(
                "partition has unsynced metadata, sync before invalidating caches".to_string(),
            ));
        }
        self.free_map = None;
        self.ids = None;
        debug!("Invalidated WBFS caches");
        Ok(())
    }

    /// Re-read the slot table, free map and id list from disk.
    ///
    /// # Errors
    ///
    /// As [`invalidate_caches`](Self::invalidate_caches); a geometry error if
    /// the header on disk no longer matches.
    pub fn reload(&mut self) -> Result<()> {
        self.invalidate_caches()?;
        let mut sector = vec![0u8; self.geometry.hd_sec_sz() as usize];
        self.file.read_exact_at(self.base, &mut sector)?;
        let head = WbfsHead::decode(&sector)?;
        if head.header != self.head.header {
            return Err(FormatError::Geometry("partition header changed on disk".to_string()).into());
        }
        self.head = head;
        self.free_map()?;
        self.ids()?;
        Ok(())
    }

    /// Read from `disc` at virtual `offset`. Holes read as zeros.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::OutOfRange`] past the indirection table, or an
    /// I/O error.
    pub fn read_disc(&mut self, disc: &WbfsDisc, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len() as u64)?;
        let unit_size = self.geometry.unit_size();
        for span in UnitSpans::new(offset, buf.len() as u64, unit_size) {
            let out = &mut buf[span.buf_range()];
            match disc.unit(span.unit) {
                Some(unit) => {
                    let pos = self.unit_pos(unit) + span.offset;
                    self.file.read_exact_at(pos, out)?;
                }
                None => out.fill(0),
            }
        }
        Ok(())
    }

    /// Write `data` to `disc` at virtual `offset`, allocating units as
    /// needed. Fresh units are zeroed outside the written range.
    ///
    /// A skipped unit below the disc's high-water mark stays a hole forever.
    /// An all-zero chunk aimed at such a hole is a no-op, since the hole
    /// already reads as zeros; any other data is rejected.
    ///
    /// Units claimed before a failing unit stay claimed.
    ///
    /// # Errors
    ///
    /// - [`ImageError::OutOfRange`] past the indirection table
    /// - [`ImageError::DiscExists`] if the write would give the disc the id
    ///   of another stored disc
    /// - [`ImageError::HoleWrite`] for non-zero data aimed at a skipped unit
    /// - [`ImageError::NoFreeBlocks`] when the partition is full
    pub fn write_disc(&mut self, disc: &mut WbfsDisc, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len() as u64)?;
        self.check_id_change(disc, offset, data)?;
        let unit_size = self.geometry.unit_size();
        for span in UnitSpans::new(offset, data.len() as u64, unit_size) {
            let chunk = &data[span.buf_range()];
            let unit = match disc.unit(span.unit) {
                Some(unit) => unit,
                None if span.unit < disc.needed => {
                    if sparse::is_zero(chunk) {
                        continue;
                    }
                    return Err(ImageError::HoleWrite {
                        unit: span.unit,
                        high_water: disc.needed,
                    });
                }
                None => {
                    let unit = self.allocate()?;
                    disc.info.table[span.unit as usize] = Some(unit);
                    disc.needed = span.unit + 1;
                    disc.dirty = true;
                    if !span.is_full(unit_size) {
                        let start = self.unit_pos(unit);
                        let tail = span.offset + span.len as u64;
                        write_zeros_at(&mut self.file, start, span.offset)?;
                        write_zeros_at(&mut self.file, start + tail, unit_size - tail)?;
                    }
                    unit
                }
            };
            let pos = self.unit_pos(unit) + span.offset;
            self.file.write_all_at(pos, chunk)?;
        }
        self.refresh_header(disc, offset, data);
        Ok(())
    }

    /// Zero `len` bytes of `disc` at `offset`. Holes are skipped and nothing
    /// is allocated.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::OutOfRange`] past the indirection table,
    /// [`ImageError::DiscExists`] if zeroing the id would collide with
    /// another disc, or an I/O error.
    pub fn write_zero_disc(&mut self, disc: &mut WbfsDisc, offset: u64, len: u64) -> Result<()> {
        self.check_range(offset, len)?;
        if offset < DISC_HEADER_SIZE as u64 {
            let n = len.min(DISC_HEADER_SIZE as u64 - offset) as usize;
            self.check_id_change(disc, offset, &ZERO_CHUNK[..n])?;
        }
        for span in UnitSpans::new(offset, len, self.geometry.unit_size()) {
            if let Some(unit) = disc.unit(span.unit) {
                let pos = self.unit_pos(unit) + span.offset;
                write_zeros_at(&mut self.file, pos, span.len as u64)?;
            }
        }
        if offset < DISC_HEADER_SIZE as u64 {
            let n = len.min(DISC_HEADER_SIZE as u64 - offset) as usize;
            self.refresh_header(disc, offset, &ZERO_CHUNK[..n]);
        }
        Ok(())
    }

    /// Reject a write that would give `disc` the id of another stored disc.
    fn check_id_change(&mut self, disc: &WbfsDisc, offset: u64, data: &[u8]) -> Result<()> {
        if offset >= DISC_ID_LEN as u64 {
            return Ok(());
        }
        let mut header = disc.info.header.clone();
        if !header.patch(offset as usize, data) {
            return Ok(());
        }
        let id = header.id();
        if id == disc.info.header.id() {
            return Ok(());
        }
        let taken = self
            .ids()?
            .iter()
            .enumerate()
            .any(|(slot, entry)| slot != disc.slot && entry.as_ref() == Some(&id));
        if taken {
            warn!(
                "Write to slot {} would duplicate disc id {}",
                disc.slot,
                header.id_str()
            );
            return Err(ImageError::DiscExists(header.id_str()));
        }
        Ok(())
    }

    /// Mirror writes to the first 256 virtual bytes into the header copy.
    fn refresh_header(&mut self, disc: &mut WbfsDisc, offset: u64, data: &[u8]) {
        if offset >= DISC_HEADER_SIZE as u64 {
            return;
        }
        if disc.info.header.patch(offset as usize, data) {
            disc.dirty = true;
            if let Some(entry) = self.ids.as_mut().and_then(|ids| ids.get_mut(disc.slot)) {
                *entry = Some(disc.info.header.id());
            }
            trace!("Refreshed header copy of slot {}", disc.slot);
        }
    }
}

fn slot_limit(geometry: &WbfsGeometry, cap: Option<usize>) -> usize {
    let max = geometry.max_discs as usize;
    cap.map_or(max, |cap| cap.min(max))
}
