#![allow(clippy::expect_used, clippy::panic)]

//! Dump the disc table and allocation state of a WBFS partition.
//!
//! Usage:
//!   cargo run --example dump_wbfs -p wdisc-storage -- /path/to/partition.wbfs [offset]
//!
//! Set `RUST_LOG=wdisc_storage=debug` for engine logging.

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use wdisc_formats::wbfs::SlotState;
use wdisc_storage::{ImageConfig, VirtualImage, WbfsPartition};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let path = args.next().context("usage: dump_wbfs <file> [partition offset]")?;
    let offset = args
        .next()
        .map(|s| s.parse::<u64>())
        .transpose()
        .context("partition offset must be a byte count")?
        .unwrap_or(0);
    let config = ImageConfig::default().with_partition_offset(offset);

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("failed to open {path}"))?;
    let mut partition = WbfsPartition::open(file, &config)?;

    let geometry = *partition.geometry();
    println!("Partition: {path} at offset {offset:#x}");
    println!(
        "  host sector {} bytes, unit {:#x} bytes, {} disc slots",
        geometry.hd_sec_sz(),
        geometry.unit_size(),
        partition.max_discs()
    );

    let stats = partition.stats()?;
    println!(
        "  units: {} total, {} used, {} free",
        stats.total_units, stats.used_units, stats.free_units
    );
    println!(
        "  slots: {} used, {} free\n",
        stats.used_slots, stats.free_slots
    );

    for disc in partition.list_discs()? {
        println!(
            "[{:>3}] {:<6} {:>5} units {:>11} bytes  {}{}",
            disc.slot,
            disc.id,
            disc.used_units,
            disc.size,
            disc.title,
            if matches!(disc.state, SlotState::Invalid(_)) {
                "  (flagged invalid)"
            } else {
                ""
            }
        );
    }

    println!("\n=== Consistency ===");
    let report = partition.check()?;
    if report.is_clean() {
        println!("clean");
    } else {
        println!("shared units:     {:?}", report.shared);
        println!("referenced free:  {:?}", report.referenced_free);
        println!("leaked units:     {:?}", report.leaked);
        println!("out-of-range:     {}", report.out_of_range.len());
    }

    let file = partition.close()?;
    if stats.used_slots > 0 {
        let image = VirtualImage::open(file, &config)?;
        println!("\n=== First disc ===");
        println!("{}", serde_json::to_string_pretty(&image.info())?);
        image.close()?;
    }
    Ok(())
}
