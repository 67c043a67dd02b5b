use std::collections::BTreeMap;

use log::{error, info, trace};

use crate::config::{Config, IterAlgorithm};
use crate::error::Error;
use crate::flipper::HammerAddrs;
use crate::memory::{DRAMAddr, PhysAddr, PhysPageInventory};
use crate::pattern::{HammerPattern, SlotKind};
use crate::util::{PAGE_SHIFT, PAGE_SIZE, PAGES_PER_ROW};

use super::{HammerRun, exit_requested};

/// Flip finder over a physically contiguous run of owned pages.
///
/// A run of at least `banks_cnt * test_min_rows` rows is located in the
/// inventory, partitioned into per-bank page lists, and a window of the
/// compiled pattern slides over every bank's list.
pub struct ContiguousFinder {
    banks: BTreeMap<u64, Vec<PhysAddr>>,
    pages_per_bank: usize,
    hammer_pages: usize,
}

/// Finds the first run of consecutively owned pages of more than
/// `min_length` pages.
fn find_run(inventory: &PhysPageInventory, min_length: u64) -> Option<(u64, u64)> {
    let mut first_page = 0;
    let mut prev_page = u64::MAX; // u64::MAX + 1 == 0

    for page in inventory.frames() {
        if page != prev_page.wrapping_add(1) {
            first_page = page;
        } else if page > first_page && page - first_page > min_length {
            return Some((first_page, page));
        }
        prev_page = page;
    }

    None
}

/// Extends a run starting at `first_page` as far as the ownership reaches
/// and checks it spans more than `min_length` pages.
fn find_run_fixed(
    inventory: &PhysPageInventory,
    first_page: u64,
    min_length: u64,
) -> Option<(u64, u64)> {
    let mut last_page = first_page;

    for page in first_page..=inventory.last_frame()? {
        if inventory.contains(page) {
            last_page = page;
        } else {
            break;
        }
    }

    (last_page - first_page > min_length).then_some((first_page, last_page))
}

/// Lowest physical address of any page in the given row, over all banks.
fn find_first_page_in_row(config: &Config, row: u64) -> PhysAddr {
    (0..config.dram_layout.banks_cnt())
        .map(|bank| DRAMAddr::new(bank, row, 0).encode(&config.dram_layout))
        .min()
        .expect("layout without banks")
}

impl ContiguousFinder {
    /// Locates the hammering run and partitions it by bank.
    ///
    /// Returns `None` (with the reason logged) when the inventory holds no
    /// run long enough, an insufficient-ownership condition the driver
    /// answers by skipping the experiment.
    pub fn prepare(
        config: &Config,
        pattern: &HammerPattern,
        inventory: &PhysPageInventory,
    ) -> Option<Self> {
        let banks_cnt = config.dram_layout.banks_cnt();
        let test_min_rows = config.hammer.test_min_rows.unwrap_or(0);
        let min_length = banks_cnt * test_min_rows * PAGES_PER_ROW as u64;
        let mut first_row = config.hammer.test_first_row;

        if first_row == 0 {
            info!("Determine contiguous pages...");
            let Some((first_page, _)) = find_run(inventory, min_length) else {
                error!("Could not find run of minimum length");
                return None;
            };

            // skip a row so all pages of the first tested row are surely
            // owned; this also lowers the chance of flipping memory that
            // belongs to another process
            first_row = DRAMAddr::decode(first_page << PAGE_SHIFT, &config.dram_layout).row + 1;
        }

        info!("Determine contiguous pages starting at row {}...", first_row);

        let first_page_phys = find_first_page_in_row(config, first_row);
        let first_page = first_page_phys >> PAGE_SHIFT;

        if inventory.find(first_page_phys).is_none() {
            error!("Could not find first row {}", first_row);
            return None;
        }

        let Some((first_page, mut last_page)) = find_run_fixed(inventory, first_page, min_length)
        else {
            error!(
                "Could not find {} rows starting at row {}",
                test_min_rows, first_row
            );
            return None;
        };

        if config.hammer.test_last_row > 0 {
            let last_page_phys =
                find_first_page_in_row(config, config.hammer.test_last_row + 1) - 1;
            last_page = last_page.min(last_page_phys >> PAGE_SHIFT);
        }

        if config.hammer.test_max_rows > 0 {
            let first_tested_row =
                DRAMAddr::decode(first_page << PAGE_SHIFT, &config.dram_layout).row;
            let last_page_phys =
                find_first_page_in_row(config, first_tested_row + config.hammer.test_max_rows) - 1;
            last_page = last_page.min(last_page_phys >> PAGE_SHIFT);
        }

        let pages_cnt = (last_page - first_page + 1) as usize;
        let rows_cnt = pages_cnt / (PAGES_PER_ROW * banks_cnt as usize);
        info!("Found {} contiguous pages", pages_cnt);
        info!("Test {} rows/bank...", rows_cnt);

        let pages_per_bank = pages_cnt / banks_cnt as usize;
        let hammer_pages = pattern.row_span() as usize * PAGES_PER_ROW;

        if pages_per_bank < hammer_pages {
            error!(
                "Expected at least {} pages per bank, got {} pages per bank",
                hammer_pages, pages_per_bank
            );
            return None;
        }

        let mut banks: BTreeMap<u64, Vec<PhysAddr>> = BTreeMap::new();
        for page in first_page..=last_page {
            let phys = page << PAGE_SHIFT;
            let dram = DRAMAddr::decode(phys, &config.dram_layout);
            if config.hammer.banks.contains(&dram.bank) {
                banks.entry(dram.bank).or_default().push(phys);
            }
        }

        Some(ContiguousFinder {
            banks,
            pages_per_bank,
            hammer_pages,
        })
    }

    /// Runs one pass of the configured iteration strategy over all banks.
    pub fn find_flips(&self, run: &mut HammerRun) -> Result<(), Error> {
        match run.config.hammer.iter_algorithm {
            IterAlgorithm::Default => self.default_test(run),
            IterAlgorithm::Fast => self.fast_test(run),
            IterAlgorithm::Debug => self.debug_test(run),
        }
    }

    /// Advances one row per window so every row is hammered multiple times.
    fn default_test(&self, run: &mut HammerRun) -> Result<(), Error> {
        for offset in (0..=self.pages_per_bank - self.hammer_pages).step_by(PAGES_PER_ROW) {
            for (&bank, pages) in &self.banks {
                let Some(window) = pages.get(offset..offset + self.hammer_pages) else {
                    error!(
                        "window end ({}) exceeds the page list of bank {} ({})",
                        offset + self.hammer_pages,
                        bank,
                        pages.len()
                    );
                    return Ok(());
                };
                if !self.hammer(run, bank, window)? {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Steps a whole window minus one row so every row is hammered once,
    /// with a second overlapping attempt per step.
    fn fast_test(&self, run: &mut HammerRun) -> Result<(), Error> {
        for offset in
            (0..=self.pages_per_bank - self.hammer_pages).step_by(self.hammer_pages - PAGES_PER_ROW)
        {
            for (&bank, pages) in &self.banks {
                let window = &pages[offset..offset + self.hammer_pages];
                if !self.hammer(run, bank, window)? {
                    return Ok(());
                }

                let shifted = offset + PAGES_PER_ROW;
                if shifted + self.hammer_pages <= pages.len()
                    && !self.hammer(run, bank, &pages[shifted..shifted + self.hammer_pages])?
                {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Fast stepping over the first configured bank only.
    fn debug_test(&self, run: &mut HammerRun) -> Result<(), Error> {
        let Some((&bank, pages)) = self.banks.first_key_value() else {
            return Ok(());
        };
        for offset in
            (0..=self.pages_per_bank - self.hammer_pages).step_by(self.hammer_pages - PAGES_PER_ROW)
        {
            let window = &pages[offset..offset + self.hammer_pages];
            if !self.hammer(run, bank, window)? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Builds the window's [`HammerAddrs`] along the compiled pattern and
    /// hands it to the flipper. Returns `false` to stop the iteration.
    fn hammer(&self, run: &mut HammerRun, bank: u64, window: &[PhysAddr]) -> Result<bool, Error> {
        if exit_requested() {
            trace!("cancellation flag is set");
            return Ok(false);
        }

        let mut addrs = HammerAddrs {
            victims: Vec::with_capacity(run.pattern.victims()),
            aggs: Vec::with_capacity(run.pattern.aggressors()),
        };

        for slot in run.pattern.slots() {
            if slot.kind == SlotKind::Gap {
                continue;
            }
            let idx = slot.row as usize * PAGES_PER_ROW;

            // both physical pages of the row must be owned and contiguous
            let p0 = window[idx];
            let p1 = window[idx + 1];
            assert_eq!(p1 - p0, PAGE_SIZE as u64);

            // the virtual pages must also sit in the same row
            let v0 = run.inventory.find(p0);
            let v1 = run.inventory.find(p1);
            assert!(
                v0.zip(v1).is_some_and(|(v0, v1)| v1.checked_sub(v0) == Some(PAGE_SIZE)),
                "virtual pages of row at {:#x} are not adjacent",
                p0
            );

            match slot.kind {
                SlotKind::Aggressor => addrs.aggs.push(p0),
                SlotKind::Victim => addrs.victims.push(p0),
                SlotKind::Gap => unreachable!(),
            }
        }

        run.hammer(bank, &addrs)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{CountingSink, test_config, test_inventory};
    use super::*;

    #[test]
    fn test_find_run_picks_first_long_run() {
        // frames 10..=19 (10 pages) and 30..=49 (20 pages)
        let inv = test_inventory((10..20).chain(30..50));
        // the walk stops as soon as the run exceeds the minimum length
        assert_eq!(find_run(&inv, 15), Some((30, 46)));
        assert_eq!(find_run(&inv, 5), Some((10, 16)));
        assert_eq!(find_run(&inv, 25), None);
    }

    #[test]
    fn test_find_run_fixed_extends_to_hole() {
        let inv = test_inventory((0..8).chain(9..32));
        assert_eq!(find_run_fixed(&inv, 9, 4), Some((9, 31)));
        assert_eq!(find_run_fixed(&inv, 0, 4), Some((0, 7)));
        assert_eq!(find_run_fixed(&inv, 0, 10), None);
    }

    #[test]
    fn test_window_sweep_covers_all_banks() {
        // 0x40 owned frames behind a real buffer; bank = phys bit 13
        let inv = test_inventory(0..0x40);
        let mut config = test_config();
        config.hammer.test_min_rows = Some(4);
        let pattern = config.validate().unwrap();
        assert_eq!(pattern.row_span(), 5);

        let finder = ContiguousFinder::prepare(&config, &pattern, &inv).unwrap();
        assert_eq!(finder.banks.len(), 2);
        assert_eq!(finder.hammer_pages, 10);

        let mut sink = CountingSink::default();
        let mut run = HammerRun {
            config: &config,
            pattern: &pattern,
            inventory: &inv,
            sink: &mut sink,
            temperature: None,
        };
        finder.find_flips(&mut run).unwrap();

        // run starts at row 1 (page 4): 60 pages, 30 per bank, windows at
        // offsets 0, 2, .., 20 for each of the two banks
        assert_eq!(finder.pages_per_bank, 30);
        let windows = 11 * 2;
        assert_eq!(sink.tests, windows * config.hammer.victim_init.len());
        assert_eq!(sink.commits, windows);
    }
}
