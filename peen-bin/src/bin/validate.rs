//! Re-hammers previously found candidates: reads an addresses file, looks
//! the pages up in a fresh inventory and runs the hammering primitive on
//! each candidate.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use peen_core::flipper::BitFlipper;
use peen_core::persist::NullSink;

/// Validate candidate bit flips from an addresses file.
///
/// Each line holds one candidate: the first field is ignored, the interior
/// fields are aggressor physical addresses in hex and the last field is a
/// victim byte address in hex.
#[derive(Debug, Parser)]
#[clap(name = "peen-validate", version)]
struct CliArgs {
    /// Addresses file with one candidate per line
    addresses: PathBuf,
    /// Configuration file
    #[clap(default_value = "config.toml")]
    config: PathBuf,
    /// Dump the page-allocation bitmap to this file
    page_allocation_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = CliArgs::parse();
    peen::configure()?;

    let content = fs::read_to_string(&args.addresses)
        .with_context(|| format!("reading '{}'", args.addresses.display()))?;
    let candidates = peen::read_addrfile(&content)?;
    info!(
        "Read {} candidates from '{}'",
        candidates.len(),
        args.addresses.display()
    );

    let mut config = peen::load_config(&[&args.config])?;
    let system = peen::SystemMemory::read()?;
    peen::resolve_memory_size(&mut config.memory, &system);
    config.validate()?;

    let inventory = peen::build_inventory(&config.memory)?;
    peen::log_page_info(&inventory, &system);
    if let Some(file) = &args.page_allocation_file {
        peen::maybe_dump_allocation(&inventory, &file.to_string_lossy())?;
    }

    let mut sink = NullSink;
    for addrs in &candidates {
        let mut flipper = BitFlipper::new(&config, addrs);
        if flipper.find_pages(&inventory) {
            info!("Hammer {} aggressors...", addrs.aggs.len());
            flipper.hammer(&mut sink, None)?;
        } else {
            info!("Could not find physical pages");
        }
    }

    Ok(())
}
