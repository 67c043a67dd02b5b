//! Flip-finding strategies and the experiment driver.
//!
//! [`ContiguousFinder`] and [`SparseFinder`] enumerate candidate windows
//! and drive the hammering primitive; [`Experiment`] wraps a finder in the
//! configured repetitions, temperatures and timeouts and owns the
//! cooperative cancellation flag.

mod contiguous;
mod sparse;

pub use self::contiguous::ContiguousFinder;
pub use self::sparse::SparseFinder;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar};
use log::{error, info, trace};
use nix::sys::signal::{SigHandler, Signal, signal};

use crate::config::{Config, MemoryAllocator};
use crate::error::Error;
use crate::flipper::{BitFlipper, HammerAddrs};
use crate::memory::{DRAMAddr, PhysPageInventory};
use crate::pattern::HammerPattern;
use crate::persist::ExperimentSink;
use crate::temperature::TemperatureController;

/// Cooperative cancellation flag, set by SIGINT and by the per-repetition
/// timeout. Checked at window boundaries, never inside the hammer loop.
static DO_EXIT: AtomicBool = AtomicBool::new(false);
/// Invalidates timeout sleepers of earlier repetitions.
static TIMEOUT_GEN: AtomicU64 = AtomicU64::new(0);

/// Returns whether cancellation was requested.
pub fn exit_requested() -> bool {
    DO_EXIT.load(Ordering::Relaxed)
}

fn reset_exit() {
    TIMEOUT_GEN.fetch_add(1, Ordering::Relaxed);
    DO_EXIT.store(false, Ordering::Relaxed);
}

/// Arms a one-shot background sleeper that requests cancellation after
/// `duration`, unless a newer repetition superseded it.
fn arm_timeout(duration: Duration) {
    let generation = TIMEOUT_GEN.load(Ordering::Relaxed);
    thread::spawn(move || {
        thread::sleep(duration);
        if TIMEOUT_GEN.load(Ordering::Relaxed) == generation {
            DO_EXIT.store(true, Ordering::Relaxed);
        }
    });
}

extern "C" fn handle_sigint(_: libc::c_int) {
    DO_EXIT.store(true, Ordering::Relaxed);
}

/// Shared context of one finder pass.
pub struct HammerRun<'a, 'b> {
    /// Validated configuration
    pub config: &'a Config,
    /// Compiled hammer pattern
    pub pattern: &'a HammerPattern,
    /// Page inventory of the reservation
    pub inventory: &'a PhysPageInventory,
    /// Result sink
    pub sink: &'b mut dyn ExperimentSink,
    /// Optional temperature chamber
    pub temperature: Option<&'b mut dyn TemperatureController>,
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

impl HammerRun<'_, '_> {
    /// Resolves and hammers one window. A window whose pages went missing
    /// from the inventory is logged and skipped.
    fn hammer(&mut self, bank: u64, addrs: &HammerAddrs) -> Result<(), Error> {
        let mut flipper = BitFlipper::new(self.config, addrs);
        if !flipper.find_pages(self.inventory) {
            error!("Could not find physical pages");
            return Ok(());
        }

        let layout = &self.config.dram_layout;
        info!(
            "Hammer {} aggressors (bank: {}, rows: [{}, {}])...",
            addrs.aggs.len(),
            bank,
            DRAMAddr::decode(addrs.aggs[0], layout).row,
            DRAMAddr::decode(*addrs.aggs.last().unwrap(), layout).row,
        );

        let temperature = reborrow_temperature(&mut self.temperature);
        flipper.hammer(self.sink, temperature)?;
        Ok(())
    }
}

/// Either flip-finding strategy, selected by the `memory_allocator`
/// option.
pub enum Finder {
    /// Slide over a physically contiguous run
    Contiguous(ContiguousFinder),
    /// Walk the sparse owned set per bank
    Sparse(SparseFinder),
}

impl Finder {
    fn find_flips(&self, run: &mut HammerRun) -> Result<(), Error> {
        match self {
            Finder::Contiguous(finder) => finder.find_flips(run),
            Finder::Sparse(finder) => finder.find_flips(run),
        }
    }
}

/// Experiment driver: prepares the configured finder and repeats it across
/// repetitions, temperatures and timeouts.
pub struct Experiment<'a> {
    config: &'a Config,
    pattern: &'a HammerPattern,
    inventory: &'a PhysPageInventory,
    sink: &'a mut dyn ExperimentSink,
    temperature: Option<&'a mut dyn TemperatureController>,
    progress: Option<MultiProgress>,
}

impl<'a> Experiment<'a> {
    /// Creates a driver over the given validated configuration.
    pub fn new(
        config: &'a Config,
        pattern: &'a HammerPattern,
        inventory: &'a PhysPageInventory,
        sink: &'a mut dyn ExperimentSink,
    ) -> Self {
        Experiment {
            config,
            pattern,
            inventory,
            sink,
            temperature: None,
            progress: None,
        }
    }

    /// Attaches a temperature controller; targets come from the
    /// `[temperature]` configuration section.
    pub fn temperature(mut self, controller: &'a mut dyn TemperatureController) -> Self {
        self.temperature = Some(controller);
        self
    }

    /// Attaches a progress display for the repetition loop.
    pub fn progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Runs the experiment to completion.
    ///
    /// Insufficient page ownership is not an error: the condition is
    /// logged and the driver returns. Cooperative cancellation (SIGINT or
    /// repetition timeout) also returns `Ok`.
    ///
    /// # Errors
    ///
    /// Temperature errors and hammer-code mapping failures are fatal and
    /// propagate.
    pub fn run(&mut self) -> Result<(), Error> {
        let finder = match self.config.hammer.memory_allocator {
            MemoryAllocator::Contiguous => {
                match ContiguousFinder::prepare(self.config, self.pattern, self.inventory) {
                    Some(finder) => Finder::Contiguous(finder),
                    None => return Ok(()),
                }
            }
            MemoryAllocator::Noncontiguous => {
                match SparseFinder::prepare(&self.config.dram_layout, self.inventory) {
                    Some(finder) => Finder::Sparse(finder),
                    None => return Ok(()),
                }
            }
        };

        let previous = unsafe { signal(Signal::SIGINT, SigHandler::Handler(handle_sigint)) }
            .expect("installing the SIGINT handler");

        let result = self.run_loops(&finder);

        unsafe { signal(Signal::SIGINT, previous) }.expect("restoring the SIGINT handler");
        result
    }

    fn run_loops(&mut self, finder: &Finder) -> Result<(), Error> {
        let temps = self.config.temperature.target_temps.clone();
        if self.temperature.is_some() && !temps.is_empty() {
            info!("Using Temperature Controller...");

            if !self.temperature.as_mut().unwrap().connect() {
                return Err(Error::ConfigInvalid(format!(
                    "could not open device '{}'",
                    self.config.temperature.device
                )));
            }

            for target in temps {
                match self.reach_temperature(target) {
                    TemperatureOutcome::Reached => {}
                    TemperatureOutcome::Cancelled => {
                        trace!("cancellation flag is set");
                        self.set_safe_temperature();
                        return Ok(());
                    }
                    TemperatureOutcome::TimedOut => {
                        self.set_safe_temperature();
                        return Err(Error::TemperatureTimeout {
                            target,
                            timeout: Duration::from_secs(self.config.temperature.timeout),
                        });
                    }
                }

                if !self.repetition_loop(finder, target)? {
                    break;
                }
            }

            self.set_safe_temperature();
            Ok(())
        } else {
            self.repetition_loop(finder, 0).map(|_| ())
        }
    }

    /// Commands the target and polls at 1 Hz until the chamber reaches it.
    fn reach_temperature(&mut self, target: i64) -> TemperatureOutcome {
        let controller = self.temperature.as_mut().unwrap();
        controller.set_target_temperature(target);

        let timeout = Duration::from_secs(self.config.temperature.timeout);
        let start = Instant::now();
        reset_exit();

        let mut actual = controller.get_actual_temperature();
        while actual != target && start.elapsed() < timeout && !exit_requested() {
            thread::sleep(Duration::from_secs(1));
            actual = controller.get_actual_temperature();
        }

        if exit_requested() {
            TemperatureOutcome::Cancelled
        } else if actual != target {
            TemperatureOutcome::TimedOut
        } else {
            TemperatureOutcome::Reached
        }
    }

    /// Commands a safe setpoint so the heat pads stop heating once runs
    /// are cancelled, aborted or finished.
    fn set_safe_temperature(&mut self) {
        if let Some(controller) = self.temperature.as_mut() {
            controller.set_target_temperature(20);
        }
    }

    /// Runs the finder `experiment_repetitions` times. Returns `false`
    /// when cancellation was requested between repetitions.
    fn repetition_loop(&mut self, finder: &Finder, target_temp: i64) -> Result<bool, Error> {
        let repetitions = self.config.hammer.experiment_repetitions;
        let bar = self
            .progress
            .as_ref()
            .map(|p| p.add(ProgressBar::new(repetitions as u64)));

        for rep in 0..repetitions {
            if rep > 0 && exit_requested() {
                info!("Cancellation requested, stopping");
                return Ok(false);
            }
            if let Some(bar) = &bar {
                bar.set_position(rep as u64 + 1);
            }

            let experiment_id = self.sink.start_experiment(
                self.config.hammer.aggressor_rows,
                self.config.hammer.hammer_count,
                target_temp,
                &self.config.hammer.experiment_comment,
            );
            info!("Experiment ID: {}", experiment_id);

            reset_exit();
            if self.config.hammer.test_max_time > 0 {
                arm_timeout(Duration::from_secs(self.config.hammer.test_max_time));
            }

            {
                let temperature = reborrow_temperature(&mut self.temperature);
                let mut run = HammerRun {
                    config: self.config,
                    pattern: self.pattern,
                    inventory: self.inventory,
                    sink: &mut *self.sink,
                    temperature,
                };
                finder.find_flips(&mut run)?;
            }

            self.sink.end_experiment();
        }

        Ok(true)
    }
}

enum TemperatureOutcome {
    Reached,
    Cancelled,
    TimedOut,
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use crate::config::Config;
    use crate::memory::{DRAMLayout, PhysAddr, PhysPageInventory, VirtAddr};
    use crate::persist::ExperimentSink;
    use crate::util::{PAGE_SIZE, mmap_anonymous};

    /// Inventory over a real buffer whose page offsets enumerate the given
    /// frames; with frames `0..n` virtual adjacency mirrors physical
    /// adjacency.
    pub fn test_inventory(frames: impl IntoIterator<Item = u64>) -> PhysPageInventory {
        let frames: Vec<u64> = frames.into_iter().collect();
        let base = mmap_anonymous(frames.len() * PAGE_SIZE, 0).unwrap() as VirtAddr;
        PhysPageInventory::from_parts(
            base,
            frames.len() * PAGE_SIZE,
            frames.iter().enumerate().map(|(i, &f)| (f, i as u64)),
        )
    }

    /// Two-bank layout with page-granular rows: bank = phys bit 13,
    /// row = phys >> 14.
    pub fn test_config() -> Config {
        let mut config = Config::default();
        config.dram_layout = DRAMLayout::new(vec![0x2000], vec![!0u64 << 14], vec![(1 << 13) - 1]);
        config.hammer.aggressor_rows = 2;
        config.hammer.hammer_count = 64;
        config
    }

    /// Sink counting the records it receives.
    #[derive(Debug, Default)]
    pub struct CountingSink {
        pub experiments: usize,
        pub tests: usize,
        pub bitflips: usize,
        pub commits: usize,
    }

    impl ExperimentSink for CountingSink {
        fn load_or_insert_config(
            &mut self,
            _hostname: &str,
            _dimms: &[String],
            _bios_settings: &BTreeMap<String, String>,
            _dram_layout: &DRAMLayout,
        ) -> i64 {
            0
        }

        fn start_experiment(
            &mut self,
            _aggressor_rows: u32,
            _hammer_count: u64,
            _target_temp: i64,
            _comment: &str,
        ) -> i64 {
            self.experiments += 1;
            self.experiments as i64
        }

        fn end_experiment(&mut self) {}

        fn insert_test(
            &mut self,
            _aggressors: &[PhysAddr],
            _hammer_time: Duration,
            _victim_init: u64,
            _aggressor_init: u64,
            _actual_temp: i64,
        ) -> i64 {
            self.tests += 1;
            self.tests as i64
        }

        fn insert_bitflip(&mut self, _victim_addr: PhysAddr, _bit_in_byte: u8, _flipped_to: u8) {
            self.bitflips += 1;
        }

        fn begin_transaction(&mut self) {}

        fn commit(&mut self) {
            self.commits += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{CountingSink, test_config, test_inventory};
    use super::*;

    #[test]
    fn test_experiment_repeats_the_finder() {
        let mut config = test_config();
        config.hammer.banks = vec![0];
        config.hammer.row_padding = 0;
        config.hammer.experiment_repetitions = 2;
        let pattern = config.validate().unwrap();

        let inv = test_inventory(0..0x20);
        let mut sink = CountingSink::default();
        Experiment::new(&config, &pattern, &inv, &mut sink)
            .run()
            .unwrap();

        assert_eq!(sink.experiments, 2);
        // 4 windows per repetition, two init pairs each
        assert_eq!(sink.tests, 2 * 4 * config.hammer.victim_init.len());
    }
}
