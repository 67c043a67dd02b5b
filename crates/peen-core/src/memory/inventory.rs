use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};

use lazy_static::lazy_static;
use log::{info, warn};
use pagemap2::{PageMap, VirtualMemoryArea};
use serde::Deserialize;

use crate::error::Error;
use crate::util::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, PAGEMAP_CHUNK, mmap_anonymous};

use super::layout::{PhysAddr, VirtAddr};

/// Physical frame number as stored in the inventory.
///
/// 32 bits cover 16 TiB of physical memory; enable the `wide-frames`
/// feature on machines beyond that.
#[cfg(not(feature = "wide-frames"))]
pub type FrameNo = u32;
/// Physical frame number as stored in the inventory.
#[cfg(feature = "wide-frames")]
pub type FrameNo = u64;

const MEMINFO_PATH: &str = "/proc/meminfo";

lazy_static! {
    static ref HUGEPAGE_SIZE: isize = {
        let buf = File::open(MEMINFO_PATH).map_or("".to_owned(), |mut f| {
            let mut s = String::new();
            let _ = f.read_to_string(&mut s);
            s
        });
        parse_hugepage_size(&buf)
    };
}

fn parse_hugepage_size(s: &str) -> isize {
    const TOKEN: &str = "Hugepagesize:";
    for line in s.lines() {
        if let Some(rest) = line.strip_prefix(TOKEN) {
            let mut parts = rest.split_whitespace();
            let p = parts.next().unwrap_or("0");
            let mut hugepage_size = p.parse::<isize>().unwrap_or(-1);

            hugepage_size *= parts.next().map_or(1, |x| match x {
                "kB" => 1024,
                _ => 1,
            });

            return hugepage_size;
        }
    }

    -1
}

fn parse_free_hugepages(s: &str) -> Option<u64> {
    const TOKEN: &str = "HugePages_Free:";
    for line in s.lines() {
        if let Some(rest) = line.strip_prefix(TOKEN) {
            return rest.split_whitespace().next()?.parse().ok();
        }
    }
    None
}

/// Returns the number of free huge pages from `/proc/meminfo`.
pub fn free_hugepages() -> Option<u64> {
    let mut s = String::new();
    File::open(MEMINFO_PATH).ok()?.read_to_string(&mut s).ok()?;
    parse_free_hugepages(&s)
}

/// Page size class used to back the memory reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AllocPageSize {
    /// Regular 4 KiB pages
    #[serde(rename = "4kb")]
    FourKb,
    /// 2 MiB huge pages
    #[serde(rename = "2mb")]
    TwoMb,
    /// 1 GiB huge pages
    #[serde(rename = "1gb")]
    OneGb,
}

impl AllocPageSize {
    /// Returns the page size in bytes, `None` for the default size.
    pub fn hugepage_bytes(&self) -> Option<usize> {
        match self {
            AllocPageSize::FourKb => None,
            AllocPageSize::TwoMb => Some(2 << 20),
            AllocPageSize::OneGb => Some(1 << 30),
        }
    }
}

/// Inventory of the physical pages owned by the process.
///
/// Built once at start-up: a large anonymous region is mapped and populated,
/// then the kernel pagemap of that region is walked to learn which physical
/// frame backs each virtual page. The result is an ordered map from frame
/// number to page offset within the reservation, read-only for the rest of
/// the process lifetime.
pub struct PhysPageInventory {
    base: VirtAddr,
    len: usize,
    pages: BTreeMap<FrameNo, FrameNo>,
}

impl PhysPageInventory {
    /// Maps `memory_size` bytes of 4 KiB pages and scans their pagemap.
    ///
    /// The mapping is populated and `MAP_NORESERVE` so the reservation may
    /// exceed available swap.
    ///
    /// # Errors
    ///
    /// [`Error::AllocationFailed`] when the mapping fails,
    /// [`Error::PagemapUnreadable`] when the pagemap scan fails.
    pub fn allocate_default(memory_size: usize) -> Result<Self, Error> {
        info!(
            "Allocate {} bytes ({} GiB)...",
            memory_size,
            memory_size >> 30
        );
        let base = mmap_anonymous(memory_size, libc::MAP_POPULATE | libc::MAP_NORESERVE)
            .map_err(|e| Error::AllocationFailed(e.to_string()))?;
        Self::scan(base as VirtAddr, memory_size)
    }

    /// Maps `count` huge pages of the given class and scans their pagemap.
    ///
    /// The configured class must match the system's `Hugepagesize`; a
    /// mismatch is fatal because the kernel would silently hand out pages
    /// of the wrong size.
    ///
    /// # Errors
    ///
    /// [`Error::AllocationFailed`] on size mismatch or mapping failure.
    pub fn allocate_hugepages(page_size: AllocPageSize, count: usize) -> Result<Self, Error> {
        let bytes = page_size
            .hugepage_bytes()
            .expect("hugepage allocation requested with 4kb page size");
        if *HUGEPAGE_SIZE != bytes as isize {
            return Err(Error::AllocationFailed(format!(
                "Hugepagesize of system ({} B) and configuration ({} B) do not match",
                *HUGEPAGE_SIZE, bytes
            )));
        }

        let len = bytes * count;
        info!(
            "Using {} {} hugepages for allocation...",
            count,
            if bytes == 1 << 30 { "1GB" } else { "2MB" }
        );
        let huge_flag = match page_size {
            AllocPageSize::TwoMb => libc::MAP_HUGE_2MB,
            AllocPageSize::OneGb => libc::MAP_HUGE_1GB,
            AllocPageSize::FourKb => unreachable!(),
        };
        let base = mmap_anonymous(len, libc::MAP_POPULATE | libc::MAP_HUGETLB | huge_flag)
            .map_err(|e| Error::AllocationFailed(e.to_string()))?;
        Self::scan(base as VirtAddr, len)
    }

    /// Walks the kernel pagemap of `[base, base + len)` and records every
    /// present page. Swapped-out or unmapped entries are skipped silently;
    /// they later show up as holes to the finders.
    fn scan(base: VirtAddr, len: usize) -> Result<Self, Error> {
        info!("Building page map...");
        let mut pagemap = PageMap::new(std::process::id() as u64)?;

        let mut pages = BTreeMap::new();
        let total_pages = len / PAGE_SIZE;
        let mut zero_pfns = 0usize;

        for chunk in (0..total_pages).step_by(PAGEMAP_CHUNK) {
            let chunk_pages = PAGEMAP_CHUNK.min(total_pages - chunk);
            let vma = VirtualMemoryArea::from((
                (base + chunk * PAGE_SIZE) as u64,
                (base + (chunk + chunk_pages) * PAGE_SIZE) as u64,
            ));
            let entries = pagemap.pagemap_vma(&vma)?;
            for (idx, entry) in entries.iter().enumerate() {
                if !entry.present() {
                    continue;
                }
                let frame = match entry.pfn() {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };
                if frame == 0 {
                    zero_pfns += 1;
                    continue;
                }
                let page_offset = (chunk + idx) as u64;
                // u32 keying covers 16 TiB of physical memory; build with
                // the wide-frames feature beyond that
                assert!(
                    frame <= FrameNo::MAX as u64 && page_offset <= FrameNo::MAX as u64,
                    "frame number {:#x} exceeds the inventory key space",
                    frame
                );
                pages.insert(frame as FrameNo, page_offset as FrameNo);
            }
        }

        if zero_pfns > 0 {
            warn!(
                "{} pagemap entries reported PFN 0. Are we running as root?",
                zero_pfns
            );
        }

        Ok(PhysPageInventory { base, len, pages })
    }

    /// Builds an inventory from precomputed parts.
    #[cfg(test)]
    pub(crate) fn from_parts(
        base: VirtAddr,
        len: usize,
        pages: impl IntoIterator<Item = (u64, u64)>,
    ) -> Self {
        PhysPageInventory {
            base,
            len,
            pages: pages
                .into_iter()
                .map(|(f, o)| (f as FrameNo, o as FrameNo))
                .collect(),
        }
    }

    /// Returns whether the process owns the page with the given frame number.
    pub fn contains(&self, frame: u64) -> bool {
        FrameNo::try_from(frame)
            .map(|f| self.pages.contains_key(&f))
            .unwrap_or(false)
    }

    /// Translates a physical byte address to its virtual counterpart.
    ///
    /// Returns `None` for addresses in pages the process does not own.
    pub fn find(&self, phys: PhysAddr) -> Option<VirtAddr> {
        let frame = FrameNo::try_from(phys >> PAGE_SHIFT).ok()?;
        let offset = *self.pages.get(&frame)?;
        Some(self.base + offset as usize * PAGE_SIZE + (phys as usize & PAGE_MASK))
    }

    /// Iterates the owned frame numbers in ascending order.
    pub fn frames(&self) -> impl Iterator<Item = u64> + '_ {
        self.pages.keys().map(|&f| f as u64)
    }

    /// Lowest owned frame number.
    pub fn first_frame(&self) -> Option<u64> {
        self.pages.first_key_value().map(|(&f, _)| f as u64)
    }

    /// Highest owned frame number.
    pub fn last_frame(&self) -> Option<u64> {
        self.pages.last_key_value().map(|(&f, _)| f as u64)
    }

    /// Number of owned pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Virtual base address of the reservation.
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// Size of the reservation in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether the inventory holds no pages.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Dumps the ownership bitmap to `path`, one character per frame from
    /// frame 0 up to the highest owned frame.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be written.
    pub fn dump_allocation(&self, path: &str) -> std::io::Result<()> {
        info!("Save page allocation data to '{}'...", path);
        let mut writer = BufWriter::new(File::create(path)?);
        let last = self.last_frame().unwrap_or(0);
        for frame in 0..=last {
            writer.write_all(if self.contains(frame) { b"1" } else { b"0" })?;
        }
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hugepage_size() {
        // correct.
        assert_eq!(parse_hugepage_size("Hugepagesize:1024"), 1024);
        assert_eq!(parse_hugepage_size("Hugepagesize: 2 kB"), 2048);

        // wrong.
        assert_eq!(parse_hugepage_size("Hugepagesize:1kB"), -1);
        assert_eq!(parse_hugepage_size("Hugepagesize: 2kB"), -1);
    }

    #[test]
    fn test_parse_free_hugepages() {
        assert_eq!(
            parse_free_hugepages("HugePages_Total: 6\nHugePages_Free: 4\n"),
            Some(4)
        );
        assert_eq!(parse_free_hugepages("HugePages_Total: 6\n"), None);
    }

    #[test]
    fn test_find_arithmetic() {
        // frames 0x100..0x104 map to page offsets 0..4, with a hole at 0x102
        let inv = PhysPageInventory::from_parts(
            0x7000_0000,
            4 * PAGE_SIZE,
            [(0x100, 0), (0x101, 1), (0x103, 3)],
        );
        assert!(inv.contains(0x101));
        assert!(!inv.contains(0x102));
        assert_eq!(inv.find(0x101 << 12), Some(0x7000_0000 + PAGE_SIZE));
        assert_eq!(inv.find((0x103 << 12) | 0x123), Some(0x7000_0000 + 3 * PAGE_SIZE + 0x123));
        assert_eq!(inv.find(0x102 << 12), None);
        assert_eq!(inv.first_frame(), Some(0x100));
        assert_eq!(inv.last_frame(), Some(0x103));
        assert_eq!(inv.page_count(), 3);
        let frames: Vec<u64> = inv.frames().collect();
        assert_eq!(frames, vec![0x100, 0x101, 0x103]);
    }

    // Requires root for the pagemap PFNs; run with
    // `sudo -E cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn test_scan_small_allocation() {
        let inv = PhysPageInventory::allocate_default(64 * PAGE_SIZE).unwrap();
        assert!(inv.page_count() > 0);
        for frame in inv.frames() {
            let virt = inv.find(frame << PAGE_SHIFT).unwrap();
            assert!(virt >= inv.base() && virt < inv.base() + inv.len());
        }
    }
}
