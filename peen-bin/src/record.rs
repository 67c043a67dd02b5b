//! File-backed implementation of the core's persistence interface.
//!
//! Every record becomes one JSON object on its own line, timestamped with
//! the local time. Bit flips and their test record are buffered between
//! `begin_transaction` and `commit` so one hammer call lands in the file
//! as a unit.

use std::collections::BTreeMap;
use std::fs::{File, create_dir_all};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use log::warn;
use peen_core::memory::{DRAMLayout, PhysAddr};
use peen_core::persist::ExperimentSink;
use serde::Serialize;

#[derive(Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum Record {
    Config {
        id: i64,
        time: String,
        hostname: String,
        dimms: Vec<String>,
        bios_settings: BTreeMap<String, String>,
        dram_layout: DRAMLayout,
    },
    StartExperiment {
        id: i64,
        time: String,
        config_id: i64,
        aggressor_rows: u32,
        hammer_count: u64,
        target_temp: i64,
        comment: String,
    },
    EndExperiment {
        id: i64,
        time: String,
    },
    Test {
        id: i64,
        time: String,
        experiment_id: i64,
        aggressors: Vec<String>,
        hammer_time_ms: u64,
        victim_init: String,
        aggressor_init: String,
        actual_temp: i64,
    },
    Bitflip {
        time: String,
        test_id: i64,
        victim_addr: String,
        bit_in_byte: u8,
        flipped_to: u8,
    },
}

/// Experiment sink writing JSON lines.
pub struct JsonlSink {
    writer: BufWriter<File>,
    buffered: Option<Vec<Record>>,
    config_id: i64,
    experiment_id: i64,
    test_id: i64,
}

impl JsonlSink {
    /// Creates (or truncates) the record file, creating parent
    /// directories as needed.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let file =
            File::create(path).with_context(|| format!("creating '{}'", path.display()))?;
        Ok(JsonlSink {
            writer: BufWriter::new(file),
            buffered: None,
            config_id: 0,
            experiment_id: 0,
            test_id: 0,
        })
    }

    fn emit(&mut self, record: Record) {
        match &mut self.buffered {
            Some(buffer) => buffer.push(record),
            None => {
                if let Err(e) = write_record(&mut self.writer, &record) {
                    warn!("Failed to write experiment record: {}", e);
                }
            }
        }
    }
}

fn write_record(writer: &mut BufWriter<File>, record: &Record) -> Result<()> {
    serde_json::to_writer(&mut *writer, record)?;
    writer.write_all(b"\n")?;
    Ok(())
}

fn now() -> String {
    chrono::Local::now().to_rfc3339()
}

impl ExperimentSink for JsonlSink {
    fn load_or_insert_config(
        &mut self,
        hostname: &str,
        dimms: &[String],
        bios_settings: &BTreeMap<String, String>,
        dram_layout: &DRAMLayout,
    ) -> i64 {
        self.config_id += 1;
        self.emit(Record::Config {
            id: self.config_id,
            time: now(),
            hostname: hostname.into(),
            dimms: dimms.to_vec(),
            bios_settings: bios_settings.clone(),
            dram_layout: dram_layout.clone(),
        });
        self.config_id
    }

    fn start_experiment(
        &mut self,
        aggressor_rows: u32,
        hammer_count: u64,
        target_temp: i64,
        comment: &str,
    ) -> i64 {
        self.experiment_id += 1;
        self.emit(Record::StartExperiment {
            id: self.experiment_id,
            time: now(),
            config_id: self.config_id,
            aggressor_rows,
            hammer_count,
            target_temp,
            comment: comment.into(),
        });
        self.experiment_id
    }

    fn end_experiment(&mut self) {
        let id = self.experiment_id;
        self.emit(Record::EndExperiment { id, time: now() });
        let _ = self.writer.flush();
    }

    fn insert_test(
        &mut self,
        aggressors: &[PhysAddr],
        hammer_time: Duration,
        victim_init: u64,
        aggressor_init: u64,
        actual_temp: i64,
    ) -> i64 {
        self.test_id += 1;
        self.emit(Record::Test {
            id: self.test_id,
            time: now(),
            experiment_id: self.experiment_id,
            aggressors: aggressors.iter().map(|a| format!("{:#x}", a)).collect(),
            hammer_time_ms: hammer_time.as_millis() as u64,
            victim_init: format!("{:#x}", victim_init),
            aggressor_init: format!("{:#x}", aggressor_init),
            actual_temp,
        });
        self.test_id
    }

    fn insert_bitflip(&mut self, victim_addr: PhysAddr, bit_in_byte: u8, flipped_to: u8) {
        let test_id = self.test_id;
        self.emit(Record::Bitflip {
            time: now(),
            test_id,
            victim_addr: format!("{:#x}", victim_addr),
            bit_in_byte,
            flipped_to,
        });
    }

    fn begin_transaction(&mut self) {
        if self.buffered.is_some() {
            warn!("Nested transaction, committing the previous one");
            self.commit();
        }
        self.buffered = Some(vec![]);
    }

    fn commit(&mut self) {
        let Some(buffer) = self.buffered.take() else {
            return;
        };
        for record in &buffer {
            if let Err(e) = write_record(&mut self.writer, record) {
                warn!("Failed to write experiment record: {}", e);
            }
        }
        let _ = self.writer.flush();
    }
}
