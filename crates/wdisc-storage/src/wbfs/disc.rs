//! Handle of one disc stored in a WBFS partition.

use std::num::NonZeroU16;
use wdisc_formats::wbfs::{DiscInfo, SlotState};
use wdisc_formats::{DiscHeader, WII_MAX_DISC_SIZE, WII_SINGLE_LAYER_SIZE, align_up};

/// An open disc.
///
/// The handle owns the disc's in-memory indirection table; all I/O goes
/// through the [`WbfsPartition`](super::WbfsPartition) that opened it, and
/// the handle must be returned to it with
/// [`close_disc`](super::WbfsPartition::close_disc).
#[derive(Debug)]
pub struct WbfsDisc {
    pub(super) slot: usize,
    pub(super) info: DiscInfo,
    /// One past the highest virtual unit ever allocated
    pub(super) needed: u64,
    pub(super) unit_size: u64,
    pub(super) dirty: bool,
}

impl WbfsDisc {
    pub(super) fn new(slot: usize, info: DiscInfo, unit_size: u64) -> Self {
        let needed = info.high_water() as u64;
        Self {
            slot,
            info,
            needed,
            unit_size,
            dirty: false,
        }
    }

    /// Disc-slot index.
    pub const fn slot(&self) -> usize {
        self.slot
    }

    /// Copy of the disc's leading 256 bytes.
    pub const fn header(&self) -> &DiscHeader {
        &self.info.header
    }

    /// Disc identifier.
    pub fn id(&self) -> String {
        self.info.header.id_str()
    }

    /// Physical unit backing virtual unit `unit`, `None` for a hole.
    pub fn unit(&self, unit: u64) -> Option<NonZeroU16> {
        usize::try_from(unit)
            .ok()
            .and_then(|u| self.info.table.get(u))
            .copied()
            .flatten()
    }

    /// Indirection table.
    pub fn table(&self) -> &[Option<NonZeroU16>] {
        &self.info.table
    }

    /// Number of allocated units.
    pub fn used_units(&self) -> usize {
        self.info.used_units()
    }

    /// High-water mark in units.
    pub const fn needed_units(&self) -> u64 {
        self.needed
    }

    /// Allocation unit size in bytes.
    pub const fn unit_size(&self) -> u64 {
        self.unit_size
    }

    /// Logical disc size: a single-layer disc if every allocated unit fits
    /// one, the dual-layer size otherwise.
    pub const fn size(&self) -> u64 {
        logical_size(self.needed, self.unit_size)
    }

    /// Whether the disc-info block has unsaved changes.
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Logical size of a disc with `needed` units of `unit_size` bytes. The last
/// unit of a single-layer disc may run past the layer end.
pub(super) const fn logical_size(needed: u64, unit_size: u64) -> u64 {
    if needed * unit_size <= align_up(WII_SINGLE_LAYER_SIZE, unit_size) {
        WII_SINGLE_LAYER_SIZE
    } else {
        WII_MAX_DISC_SIZE
    }
}

/// One entry of [`WbfsPartition::list_discs`](super::WbfsPartition::list_discs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscSummary {
    /// Disc-slot index
    pub slot: usize,
    /// Disc identifier
    pub id: String,
    /// Disc title
    pub title: String,
    /// Slot table state
    pub state: SlotState,
    /// Allocated units
    pub used_units: usize,
    /// Logical disc size in bytes
    pub size: u64,
}
