//! The hammering primitive.
//!
//! [`BitFlipper`] takes one [`HammerAddrs`] descriptor produced by a flip
//! finder, resolves its physical addresses against the page inventory,
//! initialises the victim and aggressor rows, runs one of the hammer loop
//! implementations and diffs the victim rows against their initialisation
//! pattern.

pub mod jit;

use std::arch::asm;
use std::arch::x86_64::{__rdtscp, _mm_clflush, _mm_mfence};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::config::{Config, HammerAlgorithm};
use crate::error::Error;
use crate::memory::{DRAMAddr, PhysAddr, PhysPageInventory, VirtAddr};
use crate::persist::ExperimentSink;
use crate::temperature::TemperatureController;
use crate::util::{PAGE_SIZE, PAGES_PER_ROW};

use self::jit::HammerProgram;

/// Aggressor and victim rows of one hammer attempt, as physical addresses
/// of the first byte of each row.
///
/// Within one descriptor all rows belong to the same bank and follow the
/// compiled pattern's slot order.
#[derive(Debug, Clone, Default)]
pub struct HammerAddrs {
    /// Victim row start addresses
    pub victims: Vec<PhysAddr>,
    /// Aggressor row start addresses
    pub aggs: Vec<PhysAddr>,
}

/// One observed bit flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitFlip {
    /// Physical address of the byte holding the flipped bit
    pub victim_addr: PhysAddr,
    /// Bit position within that byte, 0 = least significant
    pub bit_in_byte: u8,
    /// Value the bit flipped to
    pub flipped_to: u8,
}

/// Virtual page addresses backing one DRAM row.
type RowPages = [VirtAddr; PAGES_PER_ROW];

#[inline(always)]
unsafe fn clflush(addr: VirtAddr) {
    #[cfg(target_feature = "clflushopt")]
    unsafe {
        std::arch::x86_64::_mm_clflushopt(addr as *const u8)
    };
    #[cfg(not(target_feature = "clflushopt"))]
    unsafe {
        _mm_clflush(addr as *const u8)
    };
}

#[inline(always)]
fn rdtscp() -> u64 {
    let mut aux = 0;
    unsafe { __rdtscp(&mut aux) }
}

/// Reborrows an optional temperature controller reference for a shorter
/// lifetime than the one it was originally captured with.
fn reborrow_temperature<'s>(
    temperature: &'s mut Option<&mut dyn TemperatureController>,
) -> Option<&'s mut dyn TemperatureController> {
    match temperature {
        Some(t) => Some(&mut **t),
        None => None,
    }
}

/// Executes one hammer attempt and reports the flips it caused.
pub struct BitFlipper<'a> {
    config: &'a Config,
    phys: &'a HammerAddrs,
    virt_victims: Vec<RowPages>,
    virt_aggs: Vec<RowPages>,
}

impl<'a> BitFlipper<'a> {
    /// Creates a flipper for the given rows. Call
    /// [`find_pages`](BitFlipper::find_pages) before hammering.
    pub fn new(config: &'a Config, phys: &'a HammerAddrs) -> Self {
        BitFlipper {
            config,
            phys,
            virt_victims: vec![],
            virt_aggs: vec![],
        }
    }

    /// Resolves every page of every victim and aggressor row to its
    /// virtual address.
    ///
    /// Returns `false` when any page is absent from the inventory; the
    /// caller skips the window in that case.
    pub fn find_pages(&mut self, finder: &PhysPageInventory) -> bool {
        fn resolve(finder: &PhysPageInventory, rows: &[PhysAddr], out: &mut Vec<RowPages>) -> bool {
            let mut found = true;
            for &row in rows {
                let mut pages = [0; PAGES_PER_ROW];
                for (i, page) in pages.iter_mut().enumerate() {
                    match finder.find(row + (i * PAGE_SIZE) as PhysAddr) {
                        Some(virt) => *page = virt,
                        None => found = false,
                    }
                }
                out.push(pages);
            }
            found
        }

        self.virt_victims.clear();
        self.virt_aggs.clear();
        let mut found = resolve(finder, &self.phys.aggs, &mut self.virt_aggs);
        found &= resolve(finder, &self.phys.victims, &mut self.virt_victims);
        found
    }

    /// Hammers once per configured initialisation pair and reports whether
    /// any pair produced a bit flip.
    ///
    /// All flips of this call are delivered to `sink` inside a single
    /// transaction.
    ///
    /// # Errors
    ///
    /// [`Error::TemperatureOutOfRange`] when the measured temperature left
    /// the configured interval, [`Error::AllocationFailed`] when emitted
    /// hammer code could not be mapped.
    pub fn hammer(
        &mut self,
        sink: &mut dyn ExperimentSink,
        mut temperature: Option<&mut dyn TemperatureController>,
    ) -> Result<bool, Error> {
        sink.begin_transaction();

        // test every configured pair, e.g. both 0->1 and 1->0 flips
        let mut seen_flip = false;
        for i in 0..self.config.hammer.victim_init.len() {
            let victim_init = self.config.hammer.victim_init[i];
            let aggressor_init = self.config.hammer.aggressor_init[i];
            let temp = reborrow_temperature(&mut temperature);
            seen_flip |= self.hammer_and_check(victim_init, aggressor_init, sink, temp)?;
        }

        sink.commit();
        Ok(seen_flip)
    }

    fn hammer_and_check(
        &mut self,
        victim_init: u64,
        aggressor_init: u64,
        sink: &mut dyn ExperimentSink,
        temperature: Option<&mut dyn TemperatureController>,
    ) -> Result<bool, Error> {
        self.initialize(victim_init, aggressor_init);

        let hammer_time = self.hammer_aggs()?;

        let mut actual_temp = 0;
        if let Some(controller) = temperature {
            let target = controller.get_target_temperature();
            actual_temp = controller.get_actual_temperature();
            let interval = self.config.temperature.interval;
            if actual_temp <= target - interval || actual_temp >= target + interval {
                return Err(Error::TemperatureOutOfRange {
                    target,
                    actual: actual_temp,
                    interval,
                });
            }
            info!("Current temperature: {} °C", actual_temp);
        }

        let test_id = sink.insert_test(
            &self.phys.aggs,
            hammer_time,
            victim_init,
            aggressor_init,
            actual_temp,
        );
        trace!("Inserted test with ID {}", test_id);

        let flips = self.scan_flips(victim_init);
        for flip in &flips {
            info!(
                "Flip at 0x{:x} {}: bit {} flipped to {}",
                flip.victim_addr,
                DRAMAddr::decode(flip.victim_addr, &self.config.dram_layout),
                flip.bit_in_byte,
                flip.flipped_to,
            );
            sink.insert_bitflip(flip.victim_addr, flip.bit_in_byte, flip.flipped_to);
        }
        info!("Found {} bit flip(s)", flips.len());

        if flips.len() >= PAGE_SIZE * 8 {
            warn!("Very high number of bit flips detected");
            debug!(
                "victim_init: {:#x}, aggressor_init: {:#x}",
                victim_init, aggressor_init
            );
            debug!("victims: {:x?}", self.virt_victims);
            debug!("aggressors: {:x?}", self.virt_aggs);
        }

        Ok(!flips.is_empty())
    }

    /// Writes the given 64-bit patterns into every word of every victim and
    /// aggressor row, flushing each word's cache line so later reads hit
    /// DRAM.
    pub(crate) fn initialize(&self, victim_init: u64, aggressor_init: u64) {
        for (rows, init) in [
            (&self.virt_victims, victim_init),
            (&self.virt_aggs, aggressor_init),
        ] {
            for pages in rows.iter() {
                for &page in pages {
                    for addr in (page..page + PAGE_SIZE).step_by(size_of::<u64>()) {
                        unsafe {
                            std::ptr::write_volatile(addr as *mut u64, init);
                            clflush(addr);
                        }
                    }
                }
            }
        }
    }

    /// Reads every word of every victim row back and collects the bits
    /// that differ from `victim_init`.
    pub(crate) fn scan_flips(&self, victim_init: u64) -> Vec<BitFlip> {
        let mut flips = vec![];

        for (v, pages) in self.virt_victims.iter().enumerate() {
            for (p, &page) in pages.iter().enumerate() {
                for word in 0..PAGE_SIZE / size_of::<u64>() {
                    let addr = page + word * size_of::<u64>();
                    let val = unsafe { std::ptr::read_volatile(addr as *const u64) };
                    if val == victim_init {
                        continue;
                    }

                    let flip_offset = (p * PAGE_SIZE + word * size_of::<u64>()) as PhysAddr;
                    for bit in 0..u64::BITS as u8 {
                        let flipped_to = ((val >> bit) & 1) as u8;
                        if ((victim_init >> bit) & 1) as u8 == flipped_to {
                            continue;
                        }
                        flips.push(BitFlip {
                            victim_addr: self.phys.victims[v] + flip_offset + (bit / 8) as PhysAddr,
                            bit_in_byte: bit % 8,
                            flipped_to,
                        });
                    }
                }
            }
        }

        flips
    }

    /// Runs the configured hammer loop over the aggressor rows and returns
    /// the elapsed wall time.
    fn hammer_aggs(&self) -> Result<Duration, Error> {
        let aggs: Vec<VirtAddr> = self.virt_aggs.iter().map(|pages| pages[0]).collect();
        let begin = Instant::now();
        match self.config.hammer.hammer_algorithm {
            HammerAlgorithm::Default => self.hammer_default(&aggs),
            HammerAlgorithm::Trrespass => self.hammer_trrespass(&aggs),
            HammerAlgorithm::Assembly => self.hammer_assembly(&aggs),
            HammerAlgorithm::Machinecode => self.hammer_machinecode(&aggs)?,
            #[cfg(feature = "dynasm")]
            HammerAlgorithm::Blacksmith => self.hammer_blacksmith(&aggs)?,
            #[cfg(not(feature = "dynasm"))]
            HammerAlgorithm::Blacksmith => {
                unreachable!("blacksmith selection is rejected at config validation")
            }
        }
        let duration = begin.elapsed();
        debug!("Hammered for {} ms", duration.as_millis());
        Ok(duration)
    }

    fn hammer_default(&self, aggs: &[VirtAddr]) {
        for _ in 0..self.config.hammer.hammer_count {
            for &agg in aggs {
                unsafe { std::ptr::read_volatile(agg as *const u32) };
            }
            for &agg in aggs {
                unsafe { clflush(agg) };
            }
        }
    }

    /// TRRespass's hammer loop, after its fuzzer implementation.
    fn hammer_trrespass(&self, aggs: &[VirtAddr]) {
        unsafe { libc::sched_yield() };

        let threshold = self.config.hammer.threshold as i64;
        if threshold > 0 {
            // spin on the first aggressor until a latency spike marks the
            // refresh, so hammering starts aligned to it
            let (mut t0, mut t1) = (0u64, 0u64);
            while (t1 as i64 - t0 as i64).abs() < threshold {
                t0 = rdtscp();
                unsafe {
                    std::ptr::read_volatile(aggs[0] as *const u8);
                    clflush(aggs[0]);
                }
                t1 = rdtscp();
            }
        }

        for _ in 0..self.config.hammer.hammer_count {
            unsafe { _mm_mfence() };
            for &agg in aggs {
                unsafe { std::ptr::read_volatile(agg as *const u8) };
            }
            for &agg in aggs {
                unsafe { clflush(agg) };
            }
        }
    }

    fn hammer_assembly(&self, aggs: &[VirtAddr]) {
        for _ in 0..self.config.hammer.hammer_count {
            // with clflush, flushing directly after the access flips best;
            // with clflushopt, flushing after all accesses does
            #[cfg(not(target_feature = "clflushopt"))]
            for &agg in aggs {
                unsafe {
                    asm!(
                        "mov rax, [{agg}]",
                        "clflush [{agg}]",
                        agg = in(reg) agg,
                        out("rax") _,
                        options(nostack),
                    );
                }
            }
            #[cfg(target_feature = "clflushopt")]
            {
                for &agg in aggs {
                    unsafe {
                        asm!(
                            "mov rax, [{agg}]",
                            agg = in(reg) agg,
                            out("rax") _,
                            options(nostack),
                        );
                    }
                }
                for &agg in aggs {
                    unsafe {
                        asm!(
                            "clflushopt [{agg}]",
                            agg = in(reg) agg,
                            options(nostack),
                        );
                    }
                }
            }
        }
    }

    fn hammer_machinecode(&self, aggs: &[VirtAddr]) -> Result<(), Error> {
        let code = jit::emit_hammer_loop(
            aggs,
            self.config.hammer.hammer_count as u32,
            self.config.hammer.nop_count,
        );
        let program = HammerProgram::from_bytes(&code)
            .map_err(|e| Error::AllocationFailed(format!("failed to map the function: {}", e)))?;
        program.run();
        Ok(())
    }

    #[cfg(feature = "dynasm")]
    fn hammer_blacksmith(&self, aggs: &[VirtAddr]) -> Result<(), Error> {
        // bring the aggressors into hammering order; indices are 1-based
        let ordered: Vec<VirtAddr> = self
            .config
            .blacksmith
            .hammer_order
            .iter()
            .map(|&i| aggs[i as usize - 1])
            .collect();

        let program = jit::assemble_blacksmith(&ordered, &self.config.blacksmith)
            .map_err(|e| Error::AllocationFailed(format!("failed to assemble: {}", e)))?;
        let sync_activations = program.run();
        debug!("blacksmith tail sync performed {} activations", sync_activations);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::NullSink;
    use crate::util::mmap_anonymous;

    // synthetic inventory over a real buffer: frames FRAME_BASE+i map to
    // page offsets i
    const FRAME_BASE: u64 = 0x4000;

    fn test_inventory(pages: usize) -> PhysPageInventory {
        let base = mmap_anonymous(pages * PAGE_SIZE, 0).unwrap() as VirtAddr;
        PhysPageInventory::from_parts(
            base,
            pages * PAGE_SIZE,
            (0..pages as u64).map(|i| (FRAME_BASE + i, i)),
        )
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.hammer.hammer_count = 512;
        config.validate().unwrap();
        config
    }

    fn row_addr(row: usize) -> PhysAddr {
        (FRAME_BASE + (row * PAGES_PER_ROW) as u64) << 12
    }

    #[test]
    fn test_clean_rows_report_no_flips() {
        let inv = test_inventory(6);
        let config = test_config();
        let addrs = HammerAddrs {
            victims: vec![row_addr(0), row_addr(2)],
            aggs: vec![row_addr(1)],
        };
        let mut flipper = BitFlipper::new(&config, &addrs);
        assert!(flipper.find_pages(&inv));
        flipper.initialize(0, !0u64);
        assert!(flipper.scan_flips(0).is_empty());
    }

    #[test]
    fn test_injected_flip_is_located() {
        let inv = test_inventory(6);
        let config = test_config();
        let addrs = HammerAddrs {
            victims: vec![row_addr(0)],
            aggs: vec![row_addr(1)],
        };
        let mut flipper = BitFlipper::new(&config, &addrs);
        assert!(flipper.find_pages(&inv));
        flipper.initialize(0, !0u64);

        // flip bit 3 of the byte at row offset PAGE_SIZE + 13, i.e. in the
        // second page of the row
        let victim_virt = inv.find(row_addr(0) + PAGE_SIZE as u64 + 13).unwrap();
        unsafe { std::ptr::write_volatile(victim_virt as *mut u8, 1 << 3) };

        let flips = flipper.scan_flips(0);
        assert_eq!(
            flips,
            vec![BitFlip {
                victim_addr: row_addr(0) + PAGE_SIZE as u64 + 13,
                bit_in_byte: 3,
                flipped_to: 1,
            }]
        );
    }

    #[test]
    fn test_missing_page_fails_resolution() {
        let inv = test_inventory(2);
        let config = test_config();
        let addrs = HammerAddrs {
            victims: vec![row_addr(0)],
            // row 4 is outside the inventory
            aggs: vec![row_addr(4)],
        };
        let mut flipper = BitFlipper::new(&config, &addrs);
        assert!(!flipper.find_pages(&inv));
    }

    #[test]
    fn test_hammer_clean_memory_finds_nothing() {
        let inv = test_inventory(6);
        let config = test_config();
        let addrs = HammerAddrs {
            victims: vec![row_addr(0), row_addr(2)],
            aggs: vec![row_addr(1)],
        };
        let mut flipper = BitFlipper::new(&config, &addrs);
        assert!(flipper.find_pages(&inv));
        let mut sink = NullSink;
        // ordinary DRAM under a few hundred activations must not flip
        assert_eq!(flipper.hammer(&mut sink, None).unwrap(), false);
    }
}
