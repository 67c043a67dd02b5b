//! The tester: reserves memory, builds the page inventory and runs the
//! configured flip-finding experiment for each given configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use indicatif::MultiProgress;
use log::{info, warn};
use peen::record::JsonlSink;
use peen_core::memory::PhysPageInventory;
use peen_core::persist::ExperimentSink;
use peen_core::{Config, Experiment};

/// Rowhammer bit-flip discovery tool.
///
/// Must be executed as root. With several configuration files the
/// alphabetically first one given is the base configuration; only the base
/// configuration is considered for memory allocation, later files override
/// individual options per experiment.
#[derive(Debug, Parser)]
#[clap(name = "peen", version)]
struct CliArgs {
    /// Configuration files; the first is the base configuration
    #[clap(default_value = "config.toml")]
    configs: Vec<PathBuf>,
    /// Experiment record file (default: data/<hostname>.jsonl)
    #[clap(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = CliArgs::parse();
    let progress = peen::configure()?;

    info!("Kernel version: {}", peen::kernel_version());
    info!("OS release: {}", peen::read_os_release());
    let hostname = peen::get_hostname();
    info!("Hostname: {}", hostname);

    let system = peen::SystemMemory::read()?;

    let base_path = &args.configs[0];
    let mut base = peen::load_config(&[base_path])?;
    peen::resolve_memory_size(&mut base.memory, &system);

    // the inventory is built once, from the base configuration
    let inventory = peen::build_inventory(&base.memory)?;
    peen::log_page_info(&inventory, &system);
    peen::maybe_dump_allocation(&inventory, &base.memory.page_allocation_file)?;

    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(format!("data/{}.jsonl", hostname)));
    let mut sink = JsonlSink::create(output)?;

    if args.configs.len() == 1 {
        run_experiment(base, &inventory, &mut sink, &progress, &hostname)?;
    } else {
        info!("Using '{}' as base configuration", base_path.display());
        warn!("Only the base configuration is considered for memory allocation");

        for variant in &args.configs[1..] {
            let config = peen::load_config(&[base_path, variant])?;
            run_experiment(config, &inventory, &mut sink, &progress, &hostname)?;
        }
    }

    Ok(())
}

fn run_experiment(
    mut config: Config,
    inventory: &PhysPageInventory,
    sink: &mut JsonlSink,
    progress: &MultiProgress,
    hostname: &str,
) -> Result<()> {
    let pattern = config.validate()?;
    info!(
        "Hammer pattern '{}' compiled to {} aggressors over {} rows",
        pattern.description(),
        pattern.aggressors(),
        pattern.row_span()
    );

    sink.load_or_insert_config(hostname, &[], &BTreeMap::new(), &config.dram_layout);

    Experiment::new(&config, &pattern, inventory, sink)
        .progress(progress.clone())
        .run()?;
    Ok(())
}
