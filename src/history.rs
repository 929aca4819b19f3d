//! Snapshot archive index
//!
//! The archive layout is plain directories:
//! `<db>/<hardware>/<emulator>/<year>/<month>/<day>/<time>` with one
//! YAML-serialized tree per sampling event. The index is a nested map over
//! that layout, rebuilt by a full walk whenever it is needed. It only
//! serves interactive lookup and ledger rebuilds, so a fresh walk beats
//! incremental bookkeeping.
//!
//! Anything that does not fit the layout (the `detail/` directory, the
//! `utilization`/`cost`/`levels.yaml` files living next to the year
//! directories, stray files) is skipped, never an error.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// `time -> snapshot path` for one day.
pub type DaySnapshots = BTreeMap<String, PathBuf>;
/// `day -> ...` within one month.
pub type MonthSnapshots = BTreeMap<String, DaySnapshots>;
/// `month -> ...` within one year.
pub type YearSnapshots = BTreeMap<String, MonthSnapshots>;
/// `year -> ...` for one emulator.
pub type EmulatorSnapshots = BTreeMap<String, YearSnapshots>;

#[derive(Debug, Default)]
pub struct HistoryIndex {
    /// `hardware -> emulator -> year -> month -> day -> time -> path`.
    pub entries: BTreeMap<String, BTreeMap<String, EmulatorSnapshots>>,
}

impl HistoryIndex {
    /// Walk the archive root and build the full index.
    pub fn build(root: &Path) -> Result<Self> {
        let mut index = HistoryIndex::default();

        if !root.exists() {
            return Ok(index);
        }

        for hardware_dir in subdirectories(root)? {
            let hardware = name_of(&hardware_dir);

            for emulator_dir in subdirectories(&hardware_dir)? {
                let emulator = name_of(&emulator_dir);
                let snapshots = walk_emulator(&emulator_dir)?;

                if snapshots.is_empty() {
                    continue;
                }

                index
                    .entries
                    .entry(hardware.clone())
                    .or_default()
                    .insert(emulator, snapshots);
            }
        }

        Ok(index)
    }

    pub fn hardware_names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn emulators_of(&self, hardware: &str) -> Vec<&str> {
        self.entries
            .get(hardware)
            .map(|emulators| emulators.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// All archived snapshots of one (hardware, emulator) pair, flattened
    /// into `(date, time, path)` triples in chronological order. This is
    /// the replay input for ledger and rollup rebuilds.
    pub fn snapshots_for(&self, hardware: &str, emulator: &str) -> Vec<(String, String, &Path)> {
        let mut flat = Vec::new();

        let Some(years) = self
            .entries
            .get(hardware)
            .and_then(|emulators| emulators.get(emulator))
        else {
            return flat;
        };

        for (year, months) in years {
            for (month, days) in months {
                for (day, times) in days {
                    for (time, path) in times {
                        let date = format!("{}-{}-{}", year, month, day);
                        flat.push((date, time.clone(), path.as_path()));
                    }
                }
            }
        }

        flat
    }
}

fn walk_emulator(emulator_dir: &Path) -> Result<EmulatorSnapshots> {
    let mut years = EmulatorSnapshots::new();

    for year_dir in numeric_subdirectories(emulator_dir)? {
        let mut months = YearSnapshots::new();

        for month_dir in numeric_subdirectories(&year_dir)? {
            let mut days = MonthSnapshots::new();

            for day_dir in numeric_subdirectories(&month_dir)? {
                let mut times = DaySnapshots::new();

                for entry in fs::read_dir(&day_dir)
                    .with_context(|| format!("failed to read: {}", day_dir.display()))?
                {
                    let path = entry?.path();

                    if path.is_file() {
                        times.insert(name_of(&path), path);
                    } else {
                        debug!(path = %path.display(), "skipping unexpected archive entry");
                    }
                }

                if !times.is_empty() {
                    days.insert(name_of(&day_dir), times);
                }
            }

            if !days.is_empty() {
                months.insert(name_of(&month_dir), days);
            }
        }

        if !months.is_empty() {
            years.insert(name_of(&year_dir), months);
        }
    }

    Ok(years)
}

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();

    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to read: {}", dir.display()))?
    {
        let path = entry?.path();

        if path.is_dir() {
            dirs.push(path);
        }
    }

    dirs.sort();
    Ok(dirs)
}

/// Subdirectories whose names are all digits. Filters out `detail/` and any
/// other sibling that is not part of the date hierarchy.
fn numeric_subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = subdirectories(dir)?;
    dirs.retain(|path| {
        let name = name_of(path);
        !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit())
    });
    Ok(dirs)
}

fn name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
