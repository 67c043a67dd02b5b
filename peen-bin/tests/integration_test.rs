use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use peen::read_addrfile;
use peen::record::JsonlSink;
use peen_core::memory::{AllocPageSize, DRAMLayout};
use peen_core::persist::ExperimentSink;
use peen_core::util::ROW_SIZE;

fn temp_path(name: &str) -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("peen-test-{}-{}", std::process::id(), name));
    path
}

#[test]
fn test_read_addrfile() {
    let content = "\
1,0x3fe20000,0x3fe24000,0x3fe22123
2,7f000000,7f004000,7f008000,7f002040
";
    let addrs = read_addrfile(content).unwrap();
    assert_eq!(addrs.len(), 2);

    // first field ignored, interior fields are the aggressors
    assert_eq!(addrs[0].aggs, vec![0x3fe20000, 0x3fe24000]);
    // victim truncated down to its row start
    assert_eq!(addrs[0].victims, vec![0x3fe22000]);

    assert_eq!(addrs[1].aggs, vec![0x7f000000, 0x7f004000, 0x7f008000]);
    assert_eq!(addrs[1].victims, vec![0x7f002040 / ROW_SIZE as u64 * ROW_SIZE as u64]);
}

#[test]
fn test_read_addrfile_rejects_short_lines() {
    assert!(read_addrfile("1,0x1000\n").is_err());
    assert!(read_addrfile("").unwrap().is_empty());
}

#[test]
fn test_config_overlay_merges_sections() {
    let base = temp_path("base.toml");
    let overlay = temp_path("overlay.toml");
    fs::write(
        &base,
        r#"
[dram_layout]
functions = [0x2040, 0x44000]
row_masks = [0xffffc0000]
col_masks = [0x1fff]

[memory]
alloc_page_size = "2mb"
hugepage_count = 4

[hammer]
hammer_count = 5000
aggressor_rows = 6
"#,
    )
    .unwrap();
    fs::write(
        &overlay,
        r#"
[hammer]
hammer_count = 7000
"#,
    )
    .unwrap();

    let config = peen::load_config(&[&base, &overlay]).unwrap();
    fs::remove_file(&base).unwrap();
    fs::remove_file(&overlay).unwrap();

    // overlay wins for the options it names
    assert_eq!(config.hammer.hammer_count, 7000);
    // untouched options come from the base
    assert_eq!(config.hammer.aggressor_rows, 6);
    assert_eq!(config.memory.alloc_page_size, AllocPageSize::TwoMb);
    assert_eq!(config.memory.hugepage_count, 4);
    assert_eq!(config.dram_layout.h_fns, vec![0x2040, 0x44000]);
    // unnamed sections keep their defaults
    assert_eq!(config.hammer.row_padding, 10);
}

#[test]
fn test_jsonl_sink_buffers_transactions() {
    let path = temp_path("records.jsonl");
    let mut sink = JsonlSink::create(&path).unwrap();

    let layout = DRAMLayout::new(vec![0x8], vec![0xf0], vec![0x7]);
    sink.load_or_insert_config("testhost", &[], &BTreeMap::new(), &layout);
    let exp = sink.start_experiment(4, 1000, 0, "unit test");
    assert_eq!(exp, 1);

    sink.begin_transaction();
    let test = sink.insert_test(&[0x1000, 0x3000], Duration::from_millis(12), 0, !0u64, 0);
    sink.insert_bitflip(0x2004, 3, 1);
    sink.commit();
    assert_eq!(test, 1);

    sink.end_experiment();
    drop(sink);

    let content = fs::read_to_string(&path).unwrap();
    fs::remove_file(&path).unwrap();

    let lines: Vec<serde_json::Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[0]["record"], "config");
    assert_eq!(lines[1]["record"], "start_experiment");
    assert_eq!(lines[2]["record"], "test");
    assert_eq!(lines[2]["aggressors"][1], "0x3000");
    assert_eq!(lines[3]["record"], "bitflip");
    assert_eq!(lines[3]["bit_in_byte"], 3);
    assert_eq!(lines[3]["flipped_to"], 1);
    assert_eq!(lines[4]["record"], "end_experiment");
}
