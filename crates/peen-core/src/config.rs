//! Typed run configuration.
//!
//! The binaries deserialize these structures from TOML; the core only
//! ever sees the typed form. [`Config::validate`] establishes the
//! cross-field invariants every other component relies on.

use log::warn;
use serde::{Deserialize, Deserializer};

use crate::error::Error;
use crate::memory::{AllocPageSize, DRAMLayout};
use crate::pattern::HammerPattern;

/// Flip-finder selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryAllocator {
    /// Hammer over a physically contiguous run of owned pages
    Contiguous,
    /// Hammer over the sparse set of owned pages
    Noncontiguous,
}

/// Window iteration strategy of the flip finders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterAlgorithm {
    /// Advance one row per window, hammering rows multiple times
    Default,
    /// Advance a whole window per step so every row is covered once
    Fast,
    /// Fast stepping restricted to the first bank
    Debug,
}

/// Hammer loop implementation, resolved from the configuration string once
/// at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HammerAlgorithm {
    /// Volatile loads followed by flushes, plain Rust
    Default,
    /// TRRespass's loop with optional refresh alignment
    Trrespass,
    /// Inline-assembly variant of the default loop
    Assembly,
    /// Runtime-emitted unrolled loop with configurable nop padding
    Machinecode,
    /// Blacksmith's refresh-synchronised jitted pattern (needs the
    /// `dynasm` feature)
    Blacksmith,
}

/// When an aggressor's cache line is flushed relative to its access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flushing {
    /// Directly after the access
    EarliestPossible,
    /// Right before the next access of the same line
    LatestPossible,
}

/// When an `mfence` orders a re-accessed aggressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fencing {
    /// Fence immediately before re-accessing a line
    LatestPossible,
}

/// Fence placement around the timestamp reads of the refresh
/// synchronisation loops.
///
/// The upstream Blacksmith source carries both placements, one of them
/// commented out, so the choice is left to the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncFencing {
    /// `mfence; lfence` before `rdtscp`
    BeforeRdtscp,
    /// `lfence` after `rdtscp`
    AfterRdtscp,
}

/// `[memory]` section: how the page reservation is allocated.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Backing page size of the reservation
    pub alloc_page_size: AllocPageSize,
    /// Dump the page ownership bitmap to this file (empty = disabled)
    pub page_allocation_file: String,
    /// Derive `memory_size` (4 KiB) or `hugepage_count` (huge pages) from
    /// the system's free memory
    pub use_free_memory: bool,
    /// Fraction of free memory to reserve with 4 KiB pages
    pub allocate_percentage: f64,
    /// Reservation size in bytes with 4 KiB pages and `use_free_memory`
    /// off
    pub memory_size: u64,
    /// Number of huge pages to reserve with `use_free_memory` off
    pub hugepage_count: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            alloc_page_size: AllocPageSize::FourKb,
            page_allocation_file: String::new(),
            use_free_memory: true,
            allocate_percentage: 0.99,
            memory_size: 16 << 30,
            hugepage_count: 1,
        }
    }
}

/// `[hammer]` section: what and how to hammer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HammerConfig {
    /// Times the whole experiment is repeated
    pub experiment_repetitions: u32,
    /// Refresh-alignment latency threshold in cycles (trrespass only,
    /// 0 = disabled)
    pub threshold: u32,
    /// Iterations of the hammer loop per test
    pub hammer_count: u64,
    /// Number of aggressor rows per window; rounded up to a multiple of
    /// the aggressors per pattern repetition
    pub aggressor_rows: u32,
    /// Which flip finder to run
    pub memory_allocator: MemoryAllocator,
    /// Window stepping strategy
    pub iter_algorithm: IterAlgorithm,
    /// Banks to hammer (empty = all banks)
    pub banks: Vec<u64>,
    /// Extra rows around a window that must be owned before hammering
    pub row_padding: u64,
    /// Textual aggressor/victim template, see [`HammerPattern`]
    pub hammer_pattern: String,
    /// Row area over which `x` template slots are spread
    pub random_pattern_area: u64,
    /// Hammer loop implementation
    pub hammer_algorithm: HammerAlgorithm,
    /// Nops between access and flush of an aggressor (machinecode only)
    pub nop_count: usize,
    /// Initial victim row values, text forms tiled to 64 bit
    #[serde(deserialize_with = "init_patterns")]
    pub victim_init: Vec<u64>,
    /// Initial aggressor row values (empty = complement of `victim_init`)
    #[serde(deserialize_with = "init_patterns")]
    pub aggressor_init: Vec<u64>,
    /// Minimum rows to test per bank (contiguous finder)
    pub test_min_rows: Option<u64>,
    /// Maximum rows to test per bank (contiguous finder, 0 = unlimited)
    pub test_max_rows: u64,
    /// First row to test (0 = determine automatically)
    pub test_first_row: u64,
    /// Last row to test (0 = determine automatically)
    pub test_last_row: u64,
    /// Per-repetition timeout in seconds (0 = unlimited)
    pub test_max_time: u64,
    /// Free-form comment stored with each experiment record
    pub experiment_comment: String,
}

impl Default for HammerConfig {
    fn default() -> Self {
        HammerConfig {
            experiment_repetitions: 1,
            threshold: 0,
            hammer_count: 1_000_000,
            aggressor_rows: 24,
            memory_allocator: MemoryAllocator::Noncontiguous,
            iter_algorithm: IterAlgorithm::Default,
            banks: vec![],
            row_padding: 10,
            hammer_pattern: "va".into(),
            random_pattern_area: 0,
            hammer_algorithm: HammerAlgorithm::Default,
            nop_count: 80,
            victim_init: vec![0, !0u64],
            aggressor_init: vec![],
            test_min_rows: None,
            test_max_rows: 0,
            test_first_row: 0,
            test_last_row: 0,
            test_max_time: 0,
            experiment_comment: String::new(),
        }
    }
}

/// `[blacksmith]` section: parameters of the blacksmith hammer loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlacksmithConfig {
    /// Access order as 1-based aggressor indices
    pub hammer_order: Vec<u64>,
    /// Aggressors used to synchronise on the refresh at loop head and tail
    pub num_aggs_for_sync: usize,
    /// Total number of row activations to perform
    pub total_num_activations: u64,
    /// Cache-flush placement
    pub flushing: Flushing,
    /// Fence placement for re-accessed aggressors
    pub fencing: Fencing,
    /// Fence placement around the sync timestamp reads
    pub sync_fencing: SyncFencing,
}

impl Default for BlacksmithConfig {
    fn default() -> Self {
        BlacksmithConfig {
            hammer_order: vec![],
            num_aggs_for_sync: 2,
            total_num_activations: 5_000_000,
            flushing: Flushing::EarliestPossible,
            fencing: Fencing::LatestPossible,
            sync_fencing: SyncFencing::BeforeRdtscp,
        }
    }
}

/// `[temperature]` section: optional temperature chamber control.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TemperatureConfig {
    /// Serial device of the controller (empty = feature disabled)
    pub device: String,
    /// Target temperatures to test, in °C
    pub target_temps: Vec<i64>,
    /// Allowed deviation around the target, in °C
    pub interval: i64,
    /// Seconds to wait for the chamber to reach a target
    pub timeout: u64,
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        TemperatureConfig {
            device: String::new(),
            target_temps: vec![],
            interval: 3,
            timeout: 0,
        }
    }
}

/// Complete, typed configuration of one experiment run.
///
/// The core consumes this structure; reading it from disk is the binaries'
/// concern. [`Config::validate`] checks the §cross-field invariants,
/// resolves derived defaults and compiles the hammer pattern.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// DRAM addressing model
    pub dram_layout: DRAMLayout,
    /// Memory reservation options
    pub memory: MemoryConfig,
    /// Hammering options
    pub hammer: HammerConfig,
    /// Blacksmith options
    pub blacksmith: BlacksmithConfig,
    /// Temperature chamber options
    pub temperature: TemperatureConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dram_layout: DRAMLayout::new(
                vec![0x2040, 0x44000, 0x88000, 0x110000, 0x220000],
                vec![0xffffc0000],
                vec![(1 << 13) - 1],
            ),
            memory: MemoryConfig::default(),
            hammer: HammerConfig::default(),
            blacksmith: BlacksmithConfig::default(),
            temperature: TemperatureConfig::default(),
        }
    }
}

impl Config {
    /// Validates the configuration, fills derived defaults and compiles the
    /// hammer pattern.
    ///
    /// Mutates `self`: the bank list is expanded, `aggressor_rows` may be
    /// rounded up, `aggressor_init` is completed and the row limits are
    /// resolved. Must run once before any component consumes the config.
    ///
    /// # Errors
    ///
    /// [`Error::ConfigInvalid`] for every condition that would make the run
    /// meaningless: bad masks, out-of-range banks, mismatched init lists, a
    /// window stepping that cannot advance, or a `blacksmith` selection
    /// without the `dynasm` feature.
    pub fn validate(&mut self) -> Result<HammerPattern, Error> {
        self.dram_layout.validate()?;

        let banks_cnt = self.dram_layout.banks_cnt();
        if self.hammer.banks.is_empty() {
            self.hammer.banks = (0..banks_cnt).collect();
        } else if let Some(bank) = self.hammer.banks.iter().find(|&&b| b >= banks_cnt) {
            return Err(Error::ConfigInvalid(format!(
                "bank {} is out of range [0, {}]",
                bank,
                banks_cnt - 1
            )));
        }

        if self.hammer.hammer_algorithm == HammerAlgorithm::Blacksmith {
            #[cfg(not(feature = "dynasm"))]
            return Err(Error::ConfigInvalid(
                "hammer_algorithm 'blacksmith' requires the 'dynasm' feature".into(),
            ));
            #[cfg(feature = "dynasm")]
            {
                // the access order determines how many aggressors the
                // pattern must provide
                if !self.blacksmith.hammer_order.is_empty() {
                    self.hammer.aggressor_rows = self.blacksmith.hammer_order.len() as u32;
                }
                if self.blacksmith.hammer_order.len() < 2 * self.blacksmith.num_aggs_for_sync {
                    return Err(Error::ConfigInvalid(format!(
                        "hammer_order holds {} aggressors but head and tail sync need {}",
                        self.blacksmith.hammer_order.len(),
                        2 * self.blacksmith.num_aggs_for_sync
                    )));
                }
            }
        }

        let pattern = HammerPattern::compile(
            &self.hammer.hammer_pattern,
            &mut self.hammer.aggressor_rows,
            self.hammer.random_pattern_area,
            &mut rand::rng(),
        )?;

        #[cfg(feature = "dynasm")]
        if let Some(idx) = self
            .blacksmith
            .hammer_order
            .iter()
            .find(|&&i| i == 0 || i > pattern.aggressors() as u64)
        {
            return Err(Error::ConfigInvalid(format!(
                "hammer_order index {} is outside [1, {}]",
                idx,
                pattern.aggressors()
            )));
        }

        if self.hammer.victim_init.is_empty() {
            return Err(Error::ConfigInvalid("victim_init must not be empty".into()));
        }
        if self.hammer.aggressor_init.is_empty() {
            self.hammer.aggressor_init = self.hammer.victim_init.iter().map(|v| !v).collect();
        }
        if self.hammer.victim_init.len() != self.hammer.aggressor_init.len() {
            return Err(Error::ConfigInvalid(
                "victim_init and aggressor_init must have the same number of items".into(),
            ));
        }

        let min_rows = self
            .hammer
            .test_min_rows
            .unwrap_or(2 * self.hammer.aggressor_rows as u64 + 1);
        self.hammer.test_min_rows = Some(min_rows);

        let max_rows_lb = min_rows + 2 * self.hammer.row_padding;
        if self.hammer.test_max_rows > 0 && self.hammer.test_max_rows < max_rows_lb {
            self.hammer.test_max_rows = max_rows_lb;
            warn!(
                "Changed value of test_max_rows to minimum allowed value {} (test_min_rows + 2 * row_padding)",
                max_rows_lb
            );
        }

        // the fast step advances by one window minus one row and stalls on
        // single-row windows
        if self.hammer.iter_algorithm != IterAlgorithm::Default && pattern.row_span() < 2 {
            return Err(Error::ConfigInvalid(
                "iter_algorithm 'fast'/'debug' needs a hammer pattern spanning at least two rows"
                    .into(),
            ));
        }

        Ok(pattern)
    }
}

/// Converts an initialisation pattern from its `0x`/`0b` text form into a
/// 64-bit value, tiling short patterns.
pub fn parse_init_pattern(s: &str) -> Result<u64, Error> {
    let (digits, radix, target_len) = match s.get(0..2) {
        Some("0x") => (&s[2..], 16, 16),
        Some("0b") => (&s[2..], 2, 64),
        _ => {
            return Err(Error::ConfigInvalid(format!(
                "initialization pattern '{}' must be binary (0b) or hexadecimal (0x)",
                s
            )));
        }
    };

    let orig_len = digits.len();
    if orig_len == 0 {
        return Err(Error::ConfigInvalid(format!(
            "initialization pattern '{}' holds no digits",
            s
        )));
    }
    if !orig_len.is_power_of_two() {
        warn!("Length of initialization pattern is not a power of two");
    }
    if orig_len > target_len {
        warn!(
            "Maximum length of initialization pattern is {}, truncating pattern",
            target_len
        );
    }

    let tiled: String = digits
        .chars()
        .cycle()
        .take(target_len)
        .collect();
    u64::from_str_radix(&tiled, radix).map_err(|e| {
        Error::ConfigInvalid(format!("initialization pattern '{}' is not a number: {}", s, e))
    })
}

fn init_patterns<'de, D>(deserializer: D) -> Result<Vec<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let texts: Vec<String> = Vec::deserialize(deserializer)?;
    texts
        .iter()
        .map(|s| parse_init_pattern(s).map_err(serde::de::Error::custom))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_init_pattern_tiles() {
        assert_eq!(parse_init_pattern("0x00").unwrap(), 0);
        assert_eq!(parse_init_pattern("0xff").unwrap(), u64::MAX);
        assert_eq!(parse_init_pattern("0x0f").unwrap(), 0x0f0f_0f0f_0f0f_0f0f);
        assert_eq!(
            parse_init_pattern("0b01").unwrap(),
            0x5555_5555_5555_5555
        );
        assert_eq!(parse_init_pattern("0b1").unwrap(), u64::MAX);
        // 16 hex digits pass through untiled
        assert_eq!(
            parse_init_pattern("0xdeadbeefdeadbeef").unwrap(),
            0xdead_beef_dead_beef
        );
    }

    #[test]
    fn test_parse_init_pattern_rejects_bare_numbers() {
        assert!(parse_init_pattern("1234").is_err());
        assert!(parse_init_pattern("0x").is_err());
        assert!(parse_init_pattern("").is_err());
    }

    #[test]
    fn test_validate_expands_banks() {
        let mut config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.hammer.banks.len(), 32);
        assert_eq!(config.hammer.banks[0], 0);
    }

    #[test]
    fn test_validate_rejects_out_of_range_bank() {
        let mut config = Config::default();
        config.hammer.banks = vec![0, 32];
        assert!(matches!(
            config.validate(),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_validate_completes_aggressor_init() {
        let mut config = Config::default();
        config.hammer.victim_init = vec![0, u64::MAX];
        config.hammer.aggressor_init = vec![];
        config.validate().unwrap();
        assert_eq!(config.hammer.aggressor_init, vec![u64::MAX, 0]);
    }

    #[test]
    fn test_validate_rejects_mismatched_init_lists() {
        let mut config = Config::default();
        config.hammer.victim_init = vec![0, u64::MAX];
        config.hammer.aggressor_init = vec![0];
        assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_validate_resolves_row_limits() {
        let mut config = Config::default();
        config.hammer.aggressor_rows = 4;
        config.hammer.test_max_rows = 1;
        config.validate().unwrap();
        assert_eq!(config.hammer.test_min_rows, Some(9));
        // raised to min_rows + 2 * row_padding
        assert_eq!(config.hammer.test_max_rows, 29);
    }

    #[test]
    fn test_validate_rejects_stalling_fast_step() {
        let mut config = Config::default();
        config.hammer.hammer_pattern = "a".into();
        config.hammer.aggressor_rows = 1;
        config.hammer.iter_algorithm = IterAlgorithm::Fast;
        // "a" compiles to "av", span 2: fine
        assert!(config.validate().is_ok());
    }
}
