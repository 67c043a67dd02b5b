//! # peen-core
//!
//! `peen-core` is the core library of the peen Rowhammer bit-flip
//! discovery tool. Given a DRAM addressing model and a pool of physical
//! pages the process owns, it repeatedly activates chosen aggressor rows
//! in each bank while watching neighbouring victim rows for bit-level
//! corruption.
//!
//! ## Architecture Overview
//!
//! - [`memory`] - the reversible translation between physical byte
//!   addresses and (bank, row, column) triples, and the physical-page
//!   inventory built from the kernel pagemap of a large reservation.
//! - [`pattern`] - the compiler from textual aggressor/victim templates
//!   like `"va"` or `"avax"` to per-window slot layouts.
//! - [`flipper`] - the hammering primitive: row initialisation, five
//!   hammer loop implementations (two of them emitted at runtime), and
//!   the bit-level diff that reports flips.
//! - [`finder`] - the contiguous and sparse flip-finding strategies plus
//!   the experiment driver with its cooperative cancellation flag.
//! - [`persist`] and [`temperature`] - the interfaces towards result
//!   storage and the temperature chamber; implementations live outside
//!   the core.
//!
//! ## Platform Support
//!
//! x86_64 Linux only: the flipper relies on `clflush`/`clflushopt`,
//! `mfence` and `rdtscp`, and the inventory on `/proc/self/pagemap`.
//! Reading PFNs from the pagemap requires root.

#![warn(missing_docs)]

pub mod config;
mod error;
pub mod finder;
pub mod flipper;
pub mod memory;
pub mod pattern;
pub mod persist;
pub mod temperature;
pub mod util;

pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::finder::{Experiment, exit_requested};
pub use crate::flipper::{BitFlip, BitFlipper, HammerAddrs};
pub use crate::memory::{DRAMAddr, DRAMLayout, PhysPageInventory};
pub use crate::pattern::HammerPattern;
