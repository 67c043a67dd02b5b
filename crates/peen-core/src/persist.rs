//! Result persistence interface.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::memory::{DRAMLayout, PhysAddr};

/// Persistence interface the core reports results through.
///
/// The core calls these hooks; an external collaborator decides where the
/// records end up (a database, a JSON log, nowhere). All bit flips of one
/// hammer call are delivered between [`begin_transaction`] and [`commit`],
/// and at most one experiment and one test record are outstanding at any
/// time.
///
/// [`begin_transaction`]: ExperimentSink::begin_transaction
/// [`commit`]: ExperimentSink::commit
pub trait ExperimentSink {
    /// Registers the machine configuration this run executes under and
    /// returns its identifier.
    fn load_or_insert_config(
        &mut self,
        hostname: &str,
        dimms: &[String],
        bios_settings: &BTreeMap<String, String>,
        dram_layout: &DRAMLayout,
    ) -> i64;

    /// Opens an experiment record and returns its identifier.
    fn start_experiment(
        &mut self,
        aggressor_rows: u32,
        hammer_count: u64,
        target_temp: i64,
        comment: &str,
    ) -> i64;

    /// Closes the current experiment record.
    fn end_experiment(&mut self);

    /// Records one hammer attempt and returns its identifier. Subsequent
    /// [`insert_bitflip`](ExperimentSink::insert_bitflip) calls belong to
    /// this attempt.
    fn insert_test(
        &mut self,
        aggressors: &[PhysAddr],
        hammer_time: Duration,
        victim_init: u64,
        aggressor_init: u64,
        actual_temp: i64,
    ) -> i64;

    /// Records one observed bit flip of the current attempt.
    fn insert_bitflip(&mut self, victim_addr: PhysAddr, bit_in_byte: u8, flipped_to: u8);

    /// Starts buffering records until [`commit`](ExperimentSink::commit).
    fn begin_transaction(&mut self);

    /// Flushes the records buffered since
    /// [`begin_transaction`](ExperimentSink::begin_transaction).
    fn commit(&mut self);
}

/// Sink that drops every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ExperimentSink for NullSink {
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
        0
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
        0
    }

    fn insert_bitflip(&mut self, _victim_addr: PhysAddr, _bit_in_byte: u8, _flipped_to: u8) {}

    fn begin_transaction(&mut self) {}

    fn commit(&mut self) {}
}
