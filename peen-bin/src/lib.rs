//! Shared plumbing of the `peen` and `peen-validate` binaries: process
//! setup, system information, configuration loading, the JSONL experiment
//! sink and the addresses-file reader.

pub mod record;

use std::ffi::CStr;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;
use log::{info, warn};
use nix::sys::mman::{MlockAllFlags, mlockall};
use nix::unistd::getuid;
use peen_core::config::{Config, MemoryConfig};
use peen_core::flipper::HammerAddrs;
use peen_core::memory::{AllocPageSize, PhysPageInventory, free_hugepages};
use peen_core::util::ROW_SIZE;

/// Basic checks and process setup every tool performs.
///
/// Asserts root privileges (the pagemap reports no PFNs otherwise), locks
/// all pages of the process into RAM so the reservation cannot be swapped
/// out under the hammer, and wires the logger through the progress
/// display.
pub fn configure() -> Result<MultiProgress> {
    assert!(
        getuid().is_root(),
        "must run as root to read physical frame numbers"
    );

    mlockall(MlockAllFlags::all()).context("mlockall failed")?;

    // keep the hammer loop on one core; migrations perturb its timing
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(0, &mut set);
        if libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set) != 0 {
            warn!("Could not pin the process to CPU 0");
        }
    }

    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}

/// Returns the machine's hostname.
pub fn get_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Returns kernel name, release and machine via uname(2).
pub fn kernel_version() -> String {
    let mut name: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut name) } != 0 {
        return String::new();
    }
    let field = |arr: &[libc::c_char]| {
        unsafe { CStr::from_ptr(arr.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    };
    format!(
        "{} {} {}",
        field(&name.sysname),
        field(&name.release),
        field(&name.machine)
    )
}

/// Returns the OS release from `/etc/os-release`.
pub fn read_os_release() -> String {
    let Ok(content) = fs::read_to_string("/etc/os-release") else {
        return String::new();
    };
    content
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|value| value.replace('"', ""))
        .unwrap_or_default()
}

/// Memory statistics of the machine at start-up.
#[derive(Debug, Clone, Copy)]
pub struct SystemMemory {
    /// Total RAM in bytes
    pub total_bytes: u64,
    /// Free RAM in bytes
    pub free_bytes: u64,
    /// Total physical pages
    pub phys_pages: u64,
    /// Available physical pages
    pub available_phys_pages: u64,
}

impl SystemMemory {
    /// Reads and logs the current memory statistics.
    pub fn read() -> Result<Self> {
        let mut si: libc::sysinfo = unsafe { std::mem::zeroed() };
        if unsafe { libc::sysinfo(&mut si) } != 0 {
            bail!("could not retrieve sysinfo");
        }
        let unit = si.mem_unit.max(1) as u64;
        let system = SystemMemory {
            total_bytes: si.totalram * unit,
            free_bytes: si.freeram * unit,
            phys_pages: unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) } as u64,
            available_phys_pages: unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) } as u64,
        };

        info!("Memory usage:");
        info!(
            "  total {:13} bytes ({:2} GiB) {:9} pages",
            system.total_bytes,
            system.total_bytes >> 30,
            system.phys_pages
        );
        info!(
            "  free  {:13} bytes ({:2} GiB) {:9} pages ({:.2} % of total)",
            system.free_bytes,
            system.free_bytes >> 30,
            system.available_phys_pages,
            system.available_phys_pages as f64 * 100.0 / system.phys_pages as f64
        );

        Ok(system)
    }
}

/// Applies the free-memory sizing rule: with 4 KiB pages and
/// `use_free_memory`, the reservation covers a percentage of free RAM.
pub fn resolve_memory_size(memory: &mut MemoryConfig, system: &SystemMemory) {
    if memory.use_free_memory && memory.alloc_page_size == AllocPageSize::FourKb {
        memory.memory_size = (system.free_bytes as f64 * memory.allocate_percentage) as u64;
    }
}

/// Builds the page inventory according to the `[memory]` section.
///
/// For huge pages the free-page count from `/proc/meminfo` overrides or
/// bounds the configured count.
pub fn build_inventory(memory: &MemoryConfig) -> Result<PhysPageInventory> {
    let inventory = match memory.alloc_page_size {
        AllocPageSize::FourKb => {
            info!("Using default allocation...");
            PhysPageInventory::allocate_default(memory.memory_size as usize)?
        }
        page_size => {
            let mut count = memory.hugepage_count as u64;
            match free_hugepages() {
                Some(free) if free != 0 => {
                    if memory.use_free_memory {
                        info!("Found {} free hugepages", free);
                        count = free;
                    } else if count > free {
                        bail!(
                            "found {} free hugepages, configuration requested {}",
                            free,
                            count
                        );
                    }
                }
                _ => warn!("Could not retrieve number of free hugepages"),
            }
            PhysPageInventory::allocate_hugepages(page_size, count as usize)?
        }
    };
    Ok(inventory)
}

/// Logs how much of the machine the inventory covers.
pub fn log_page_info(inventory: &PhysPageInventory, system: &SystemMemory) {
    let alloc_pages = inventory.page_count() as u64;
    let missing_pages = system.phys_pages.saturating_sub(alloc_pages);
    info!(
        "Pages allocated: {:9} ({:.2} % of free pages)",
        alloc_pages,
        alloc_pages as f64 * 100.0 / system.available_phys_pages as f64
    );
    info!(
        "Pages missing: {:11} ({:.2} % of total pages)",
        missing_pages,
        missing_pages as f64 * 100.0 / system.phys_pages as f64
    );
}

/// Loads a configuration by merging the given TOML files in order.
///
/// A missing first (base) file only warns and leaves the defaults, a
/// missing overlay file is an error.
pub fn load_config(paths: &[impl AsRef<Path>]) -> Result<Config> {
    let mut merged = toml::Table::new();

    for (idx, path) in paths.iter().enumerate() {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if idx == 0 => {
                warn!(
                    "Could not read configuration file '{}' ({}), proceeding with default configuration",
                    path.display(),
                    e
                );
                continue;
            }
            Err(e) => {
                bail!("could not read configuration file '{}': {}", path.display(), e);
            }
        };
        info!("Parsing configuration file '{}'", path.display());
        let table: toml::Table = content
            .parse()
            .with_context(|| format!("parsing '{}'", path.display()))?;
        merge_tables(&mut merged, table);
    }

    let config = toml::Value::Table(merged)
        .try_into()
        .context("deserializing configuration")?;
    Ok(config)
}

fn merge_tables(dst: &mut toml::Table, src: toml::Table) {
    for (key, value) in src {
        match (dst.get_mut(&key), value) {
            (Some(toml::Value::Table(dst_sub)), toml::Value::Table(src_sub)) => {
                merge_tables(dst_sub, src_sub);
            }
            (_, value) => {
                dst.insert(key, value);
            }
        }
    }
}

/// Reads an addresses file into hammer descriptors.
///
/// One candidate per line, comma-separated: the first field is ignored,
/// the interior fields are aggressor physical addresses in hex, the last
/// field is a victim byte address in hex, truncated down to the start of
/// its row.
pub fn read_addrfile(content: &str) -> Result<Vec<HammerAddrs>> {
    let mut out = vec![];

    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 3 {
            bail!(
                "line {}: expected at least an aggressor and a victim field",
                lineno + 1
            );
        }

        let parse = |s: &str| {
            u64::from_str_radix(s.trim_start_matches("0x"), 16)
                .with_context(|| format!("line {}: bad address '{}'", lineno + 1, s))
        };

        let victim = parse(fields[fields.len() - 1])?;
        let mut addrs = HammerAddrs {
            victims: vec![victim / ROW_SIZE as u64 * ROW_SIZE as u64],
            aggs: Vec::with_capacity(fields.len() - 2),
        };
        for field in &fields[1..fields.len() - 1] {
            addrs.aggs.push(parse(field)?);
        }
        out.push(addrs);
    }

    Ok(out)
}

/// Dumps the page-allocation bitmap when the config asks for one.
pub fn maybe_dump_allocation(inventory: &PhysPageInventory, file: &str) -> Result<()> {
    if !file.is_empty() {
        inventory
            .dump_allocation(file)
            .with_context(|| format!("writing page allocation data to '{}'", file))?;
    }
    Ok(())
}
