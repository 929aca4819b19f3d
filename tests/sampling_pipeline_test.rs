//! End-to-end tests of the sampling pipeline against a temp database

use chrono::{NaiveDate, NaiveDateTime};
use emu_usage::config::{Config, HardwareConfig};
use emu_usage::models::HardwareKind;
use emu_usage::sampler::Sampler;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

/// Palladium status dump: four domains, three busy, only alice's record
/// carries a usable execute host (bob and carol report the `--` sentinel).
const STATUS_DUMP: &str = "\
Emulator: EMU01  Hardware: Z1  Configmgr: 21.03  Status: In service
Rack 1 has 1 clusters
Cluster 1 has 1 logic drawers  CCD: enabled
 Logic drawer 1 has 4 domains  Logic drawer: online
  1.1   alice   h1:4242   tpod a   designA   01:02:03   key1
  1.2   bob     --:0      tpod b   designB   00:10:00   key2
  2.1   carol   --:0      tpod c   designC   00:20:00   key3
  2.2   NONE    0         tpod d   none      00:00:00   none
";

fn write_fixture(dir: &Path) -> Config {
    let status_file = dir.join("status.txt");
    fs::write(&status_file, STATUS_DUMP).unwrap();

    let host_file = dir.join("project_execute_host");
    let mut file = fs::File::create(&host_file).unwrap();
    writeln!(file, "h1 : proj1").unwrap();

    let list_file = dir.join("project_list");
    fs::write(&list_file, "proj1 1.0\n").unwrap();

    let mut config = Config::default();
    config.paths.db_path = dir.join("db");
    config.paths.log_directory = dir.join("logs");
    config.hardware.insert(
        "EMU01".to_string(),
        HardwareConfig {
            kind: HardwareKind::Palladium,
            emulator: "EMU01".to_string(),
            status_command: format!("cat {}", status_file.display()),
            ssh_host: None,
            project_list_file: Some(list_file),
            project_user_file: None,
            project_execute_host_file: Some(host_file),
            project_submit_host_file: None,
            project_primary_factors: "execute_host user".to_string(),
        },
    );

    config
}

fn at(stamp: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S").unwrap()
}

fn day(date: &str) -> NaiveDate {
    NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap()
}

#[test]
fn test_full_cycle_writes_all_artifacts() {
    let dir = TempDir::new().unwrap();
    let config = write_fixture(dir.path());
    let sampler = Sampler::new(&config, "EMU01").unwrap();

    sampler.run(at("2024-01-05 08:00:00")).unwrap();

    let base = dir.path().join("db/palladium/EMU01");

    assert!(base.join("2024/01/05/080000").exists());
    assert!(base.join("levels.yaml").exists());
    assert!(base.join("detail/2024.01.utilization").exists());
    assert!(base.join("detail/2024.01.cost").exists());

    let coarse = fs::read_to_string(base.join("utilization")).unwrap();
    assert_eq!(coarse, "20240105 080000 : 0.75\n");

    let cost = fs::read_to_string(base.join("cost")).unwrap();
    assert!(cost.starts_with("2024-01-05"));
    assert!(cost.contains("proj1:1"));
    assert!(cost.contains("others:0"));
}

#[test]
fn test_repeated_cycles_accumulate_in_ledger() {
    let dir = TempDir::new().unwrap();
    let config = write_fixture(dir.path());
    let sampler = Sampler::new(&config, "EMU01").unwrap();

    sampler.run(at("2024-01-05 08:00:00")).unwrap();
    sampler.run(at("2024-01-05 12:00:00")).unwrap();

    let cost = fs::read_to_string(dir.path().join("db/palladium/EMU01/cost")).unwrap();
    assert!(cost.contains("proj1:2"));

    let totals = sampler
        .ledger()
        .query(day("2024-01-05"), day("2024-01-05"))
        .unwrap();
    assert_eq!(totals["proj1"], 2.0);
}

#[test]
fn test_utilization_queries_after_sampling() {
    let dir = TempDir::new().unwrap();
    let config = write_fixture(dir.path());
    let sampler = Sampler::new(&config, "EMU01").unwrap();

    sampler.run(at("2024-01-05 08:00:00")).unwrap();
    sampler.run(at("2024-01-05 12:00:00")).unwrap();

    let daily = sampler
        .store()
        .query_coarse(day("2024-01-04"), day("2024-01-05"), false)
        .unwrap();
    assert_eq!(daily["20240104"], 0.0);
    assert_eq!(daily["20240105"], 75.0);

    let per_sample = sampler
        .store()
        .query_coarse(day("2024-01-05"), day("2024-01-05"), true)
        .unwrap();
    assert_eq!(per_sample["20240105-080000"], 75.0);
    assert_eq!(per_sample["20240105-120000"], 75.0);

    // Detail rollups agree with the coarse series for an unfiltered query.
    let detail = sampler
        .store()
        .query_detail(day("2024-01-05"), day("2024-01-05"), |_| true)
        .unwrap();
    assert_eq!(detail["20240105"], 75.0);

    // Restricting to the idle domain yields 0, not an error.
    let idle_only = sampler
        .store()
        .query_detail(day("2024-01-05"), day("2024-01-05"), |path| {
            path == "1.1.1.2.2"
        })
        .unwrap();
    assert_eq!(idle_only["20240105"], 0.0);
}

#[test]
fn test_reconfig_replays_archive_into_fresh_ledger() {
    let dir = TempDir::new().unwrap();
    let config = write_fixture(dir.path());
    let sampler = Sampler::new(&config, "EMU01").unwrap();

    sampler.run(at("2024-01-05 08:00:00")).unwrap();
    sampler.run(at("2024-01-06 08:00:00")).unwrap();

    sampler.reconfig().unwrap();

    let base = dir.path().join("db/palladium/EMU01");
    let backups: Vec<_> = fs::read_dir(&base)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("cost.bak."))
        .collect();
    assert_eq!(backups.len(), 1);

    let cost = fs::read_to_string(base.join("cost")).unwrap();
    assert_eq!(cost.lines().count(), 2);

    let totals = sampler
        .ledger()
        .query(day("2024-01-01"), day("2024-01-31"))
        .unwrap();
    assert_eq!(totals["proj1"], 2.0);
}

#[test]
fn test_detail_rebuild_retires_old_rollups() {
    let dir = TempDir::new().unwrap();
    let config = write_fixture(dir.path());
    let sampler = Sampler::new(&config, "EMU01").unwrap();

    sampler.run(at("2024-01-05 08:00:00")).unwrap();
    sampler.rebuild_detail().unwrap();

    let base = dir.path().join("db/palladium/EMU01");
    let backups: Vec<_> = fs::read_dir(&base)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("detail.bak."))
        .collect();
    assert_eq!(backups.len(), 1);

    // The rebuilt rollup holds exactly the replayed cycle, not doubled
    // counters from the live one.
    let detail = sampler
        .store()
        .query_detail(day("2024-01-05"), day("2024-01-05"), |_| true)
        .unwrap();
    assert_eq!(detail["20240105"], 75.0);

    let costs = sampler
        .store()
        .query_cost_detail(day("2024-01-05"), day("2024-01-05"), |_| true)
        .unwrap();
    assert_eq!(costs["proj1"], 1.0);
}

#[test]
fn test_empty_status_output_skips_cycle() {
    let dir = TempDir::new().unwrap();
    let mut config = write_fixture(dir.path());
    config
        .hardware
        .get_mut("EMU01")
        .unwrap()
        .status_command = "true".to_string();

    let sampler = Sampler::new(&config, "EMU01").unwrap();
    sampler.run(at("2024-01-05 08:00:00")).unwrap();

    // Nothing parsed means nothing persisted, and no error either.
    assert!(!dir.path().join("db/palladium/EMU01/utilization").exists());
    assert!(!dir.path().join("db/palladium/EMU01/cost").exists());
}
