//! WBFS partition engine
//!
//! A partition stores many discs in fixed-size allocation units. Each disc
//! has an indirection table mapping its virtual units to physical ones; a
//! free-block bitmap tracks which physical units are taken. Unit 0 holds
//! all metadata and doubles as the on-disk hole marker.
//!
//! The bitmap and the per-slot id list are loaded lazily and live on the
//! [`WbfsPartition`] handle; [`WbfsPartition::invalidate_caches`] and
//! [`WbfsPartition::reload`] drop or refresh them.

mod disc;
mod free_map;
mod partition;

pub use disc::{DiscSummary, WbfsDisc};
pub use free_map::FreeBlockMap;
pub use partition::{BadEntry, CheckReport, PartitionStats, WbfsPartition};
