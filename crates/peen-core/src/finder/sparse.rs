use std::collections::{BTreeMap, BTreeSet};

use log::{error, info, trace};

use crate::config::IterAlgorithm;
use crate::error::Error;
use crate::flipper::HammerAddrs;
use crate::memory::{DRAMAddr, DRAMLayout, PhysPageInventory};
use crate::pattern::SlotKind;
use crate::util::PAGE_SHIFT;

use super::{HammerRun, exit_requested};

/// Flip finder over an arbitrary owned page set.
///
/// No contiguity is required: windows are enumerated in row space per bank
/// and a window is only hammered when every row in its padded neighbourhood
/// is fully owned, so no foreign memory can be corrupted.
pub struct SparseFinder {
    first_page: u64,
    last_page: u64,
    /// Rows with at least one missing page, per bank
    missing_rows: BTreeMap<u64, BTreeSet<u64>>,
}

impl SparseFinder {
    /// Computes the inventory bounds and the per-bank missing-row sets.
    ///
    /// Returns `None` when the inventory is empty.
    pub fn prepare(layout: &DRAMLayout, inventory: &PhysPageInventory) -> Option<Self> {
        let first_page = inventory.first_frame()?;
        let last_page = inventory.last_frame()?;
        assert!(last_page >= first_page);

        // a row is missing as soon as one of its pages is
        let mut missing_rows: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();
        for page in first_page..=last_page {
            if !inventory.contains(page) {
                let dram = DRAMAddr::decode(page << PAGE_SHIFT, layout);
                missing_rows.entry(dram.bank).or_default().insert(dram.row);
            }
        }

        Some(SparseFinder {
            first_page,
            last_page,
            missing_rows,
        })
    }

    /// Lowest and highest owned row of a bank, clipped by the configured
    /// row limits.
    fn row_bounds(&self, run: &HammerRun, bank: u64) -> Option<(u64, u64)> {
        let layout = &run.config.dram_layout;

        // a higher row cannot have a lower physical address
        let mut first_row = None;
        for page in self.first_page..=self.last_page {
            if run.inventory.contains(page) {
                let dram = DRAMAddr::decode(page << PAGE_SHIFT, layout);
                if dram.bank == bank {
                    first_row = Some(dram.row);
                    break;
                }
            }
        }

        let mut last_row = None;
        for page in (self.first_page..=self.last_page).rev() {
            if run.inventory.contains(page) {
                let dram = DRAMAddr::decode(page << PAGE_SHIFT, layout);
                if dram.bank == bank {
                    last_row = Some(dram.row);
                    break;
                }
            }
        }

        let mut first_row = first_row?;
        let mut last_row = last_row?;

        if run.config.hammer.test_first_row != 0 {
            first_row = first_row.max(run.config.hammer.test_first_row);
        }
        if run.config.hammer.test_last_row != 0 {
            last_row = last_row.min(run.config.hammer.test_last_row);
        }

        (last_row >= first_row).then_some((first_row, last_row))
    }

    /// Whether `[first_row - padding, last_row + padding]` touches a
    /// missing row of the bank.
    fn is_any_row_missing(&self, bank: u64, first_row: u64, last_row: u64, padding: u64) -> bool {
        let Some(missing) = self.missing_rows.get(&bank) else {
            return false;
        };
        missing
            .range(first_row.saturating_sub(padding)..=last_row + padding)
            .next()
            .is_some()
    }

    /// Runs one pass of the configured iteration strategy over all banks.
    pub fn find_flips(&self, run: &mut HammerRun) -> Result<(), Error> {
        let banks = run.config.hammer.banks.clone();
        for bank in banks {
            let Some((first_row, last_row)) = self.row_bounds(run, bank) else {
                error!("Bank {} has no testable rows", bank);
                continue;
            };

            info!(
                "Testing bank {}: rows [{}, {}], missing rows: {}",
                bank,
                first_row,
                last_row,
                self.missing_rows.get(&bank).map_or(0, |s| s.len())
            );

            let span = run.pattern.row_span();
            if last_row - first_row + 1 < span {
                error!(
                    "Bank {} holds {} rows, the pattern needs {}",
                    bank,
                    last_row - first_row + 1,
                    span
                );
                continue;
            }

            let keep_going = match run.config.hammer.iter_algorithm {
                IterAlgorithm::Default => self.default_test(run, bank, first_row, last_row)?,
                IterAlgorithm::Fast => self.fast_test(run, bank, first_row, last_row)?,
                IterAlgorithm::Debug => {
                    self.debug_test(run, bank, first_row, last_row)?;
                    // debug covers only the first bank
                    false
                }
            };
            if !keep_going {
                break;
            }
        }
        Ok(())
    }

    /// Advances one row per window so every row is hammered multiple times.
    fn default_test(
        &self,
        run: &mut HammerRun,
        bank: u64,
        first_row: u64,
        last_row: u64,
    ) -> Result<bool, Error> {
        let span = run.pattern.row_span();
        for row in first_row..=last_row - span + 1 {
            if !self.hammer(run, bank, row)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Steps a whole window minus one row, with a second shifted attempt,
    /// so every row is covered once.
    ///
    /// The last rows of a bank stay untested when fewer than a window
    /// remains.
    fn fast_test(
        &self,
        run: &mut HammerRun,
        bank: u64,
        first_row: u64,
        last_row: u64,
    ) -> Result<bool, Error> {
        let span = run.pattern.row_span();
        for row in (first_row..=last_row - span + 1).step_by(span as usize - 1) {
            if !self.hammer(run, bank, row)? || !self.hammer(run, bank, row + 1)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Fast stepping with a single attempt per window.
    fn debug_test(
        &self,
        run: &mut HammerRun,
        bank: u64,
        first_row: u64,
        last_row: u64,
    ) -> Result<bool, Error> {
        let span = run.pattern.row_span();
        for row in (first_row..=last_row - span + 1).step_by(span as usize - 1) {
            if !self.hammer(run, bank, row)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Hammers the window whose first victim row is `first_victim`, unless
    /// its padded neighbourhood touches a missing row. Returns `false` to
    /// stop the iteration.
    fn hammer(&self, run: &mut HammerRun, bank: u64, first_victim: u64) -> Result<bool, Error> {
        if exit_requested() {
            trace!("cancellation flag is set");
            return Ok(false);
        }

        let last_victim = first_victim + run.pattern.row_span() - 1;
        if self.is_any_row_missing(
            bank,
            first_victim,
            last_victim,
            run.config.hammer.row_padding,
        ) {
            return Ok(true);
        }

        let mut addrs = HammerAddrs {
            victims: Vec::with_capacity(run.pattern.victims()),
            aggs: Vec::with_capacity(run.pattern.aggressors()),
        };

        for slot in run.pattern.slots() {
            if slot.kind == SlotKind::Gap {
                continue;
            }
            let dram = DRAMAddr::new(bank, first_victim + slot.row, 0);
            let phys = dram.encode(&run.config.dram_layout);
            match slot.kind {
                SlotKind::Aggressor => addrs.aggs.push(phys),
                SlotKind::Victim => addrs.victims.push(phys),
                SlotKind::Gap => unreachable!(),
            }
        }

        run.hammer(bank, &addrs)?;
        Ok(!exit_requested())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{CountingSink, test_config, test_inventory};
    use super::*;

    // test layout: bank = phys bit 13, row = phys >> 14; frame f belongs to
    // bank (f >> 1) & 1, row f >> 2

    #[test]
    fn test_missing_row_sets() {
        let mut config = test_config();
        config.validate().unwrap();
        // frames 0x10, 0x11 form bank 0, row 4
        let inv = test_inventory((0..0x10).chain(0x12..0x20));
        let finder = SparseFinder::prepare(&config.dram_layout, &inv).unwrap();

        assert_eq!(
            finder.missing_rows.get(&0),
            Some(&BTreeSet::from([4]))
        );
        assert_eq!(finder.missing_rows.get(&1), None);
    }

    #[test]
    fn test_window_on_missing_row_is_skipped() {
        let mut config = test_config();
        config.hammer.row_padding = 0;
        config.validate().unwrap();
        let inv = test_inventory((0..0x10).chain(0x12..0x20));
        let finder = SparseFinder::prepare(&config.dram_layout, &inv).unwrap();

        // window of rows [3, 6] touches missing row 4
        assert!(finder.is_any_row_missing(0, 3, 6, 0));
        // rows [0, 3] are fully owned
        assert!(!finder.is_any_row_missing(0, 0, 3, 0));
        // row padding extends the guarded neighbourhood
        assert!(finder.is_any_row_missing(0, 0, 3, 1));
        // bank 1 has no missing rows at all
        assert!(!finder.is_any_row_missing(1, 0, 7, 10));
    }

    #[test]
    fn test_only_clear_windows_are_hammered() {
        let mut config = test_config();
        config.hammer.banks = vec![0];
        config.hammer.row_padding = 0;
        let pattern = config.validate().unwrap();
        assert_eq!(pattern.row_span(), 5);

        // bank 0 rows 0..=7, row 4 missing: only the window at rows 0..=4
        // would fit, and it touches row 4
        let inv = test_inventory((0..0x10).chain(0x12..0x20));
        let finder = SparseFinder::prepare(&config.dram_layout, &inv).unwrap();

        let mut sink = CountingSink::default();
        let mut run = HammerRun {
            config: &config,
            pattern: &pattern,
            inventory: &inv,
            sink: &mut sink,
            temperature: None,
        };
        finder.find_flips(&mut run).unwrap();
        assert_eq!(sink.tests, 0);

        // with all pages owned every window hammers
        let inv = test_inventory(0..0x20);
        let finder = SparseFinder::prepare(&config.dram_layout, &inv).unwrap();
        let mut sink = CountingSink::default();
        let mut run = HammerRun {
            config: &config,
            pattern: &pattern,
            inventory: &inv,
            sink: &mut sink,
            temperature: None,
        };
        finder.find_flips(&mut run).unwrap();
        // rows 0..=7, span 5: windows at rows 0..=3
        assert_eq!(sink.tests, 4 * config.hammer.victim_init.len());
    }
}
