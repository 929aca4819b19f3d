//! Cost ledger
//!
//! One text ledger per (hardware, emulator), one line per calendar day:
//!
//! ```text
//! 2024-01-01 projA:12         projB:3          others:0
//! ```
//!
//! The project column set is not fixed. When a merge introduces a project
//! the ledger has never seen, every historical day gains a `proj:0` column
//! so consumers always read a rectangular table. That forces the
//! read-whole/rewrite-whole design: `merge` loads the full file, backfills
//! the project union, adds the day's deltas, and rewrites every line in the
//! original day order. The rewrite goes through a temp file and rename so a
//! crash cannot leave a truncated ledger behind.
//!
//! Counts accumulate: merging the same day twice adds, it does not replace.
//! Re-running a sampler for a day is therefore additive by contract.
//! Values are kept as floats so fractional shares (a 0.3 credit from a
//! split attribution) survive; whole numbers are written without a decimal
//! point, which keeps plain sampling-count ledgers integer-valued on disk.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One day's per-project counts, in file order.
type DayEntry = (String, BTreeMap<String, f64>);

pub struct CostLedger {
    path: PathBuf,
}

impl CostLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the ledger into day order. A missing file is an empty ledger;
    /// malformed lines are logged and skipped.
    fn load(&self) -> Result<Vec<DayEntry>> {
        let mut days: Vec<DayEntry> = Vec::new();

        if !self.path.exists() {
            return Ok(days);
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read cost file: {}", self.path.display()))?;

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }

            match parse_ledger_line(line) {
                Some((date, counts)) => {
                    if let Some(existing) = days.iter_mut().find(|(d, _)| *d == date) {
                        // Duplicate day lines should not happen; fold them
                        // together rather than dropping data.
                        for (project, count) in counts {
                            *existing.1.entry(project).or_insert(0.0) += count;
                        }
                    } else {
                        days.push((date, counts));
                    }
                }
                None => {
                    warn!(line, "could not find valid information in cost file line");
                }
            }
        }

        Ok(days)
    }

    /// Add `deltas` onto `date`'s counts and rewrite the ledger with the
    /// project columns unioned across all days.
    pub fn merge(&self, date: &str, deltas: &BTreeMap<String, f64>) -> Result<()> {
        let mut days = self.load()?;

        let mut projects: BTreeSet<String> = deltas.keys().cloned().collect();
        for (_, counts) in &days {
            projects.extend(counts.keys().cloned());
        }

        match days.iter_mut().find(|(d, _)| d == date) {
            Some((_, counts)) => {
                for (project, delta) in deltas {
                    *counts.entry(project.clone()).or_insert(0.0) += delta;
                }
            }
            None => {
                days.push((date.to_string(), deltas.clone()));
            }
        }

        // Backfill the union so every day shows every project.
        for (_, counts) in &mut days {
            for project in &projects {
                counts.entry(project.clone()).or_insert(0.0);
            }
        }

        self.rewrite(&days)
    }

    /// Sum per-project counts across the inclusive date range.
    pub fn query(&self, since: NaiveDate, until: NaiveDate) -> Result<BTreeMap<String, f64>> {
        let mut totals: BTreeMap<String, f64> = BTreeMap::new();

        for (date, counts) in self.load()? {
            let Ok(day) = NaiveDate::parse_from_str(&date, "%Y-%m-%d") else {
                warn!(%date, "unparseable date in cost file, skipping line");
                continue;
            };

            if day < since || day > until {
                continue;
            }

            for (project, count) in counts {
                *totals.entry(project).or_insert(0.0) += count;
            }
        }

        Ok(totals)
    }

    /// Move the live ledger aside under a timestamped name, returning the
    /// backup path. Used by the reconfig path before replaying history so
    /// the previous ledger is preserved rather than deleted.
    pub fn retire(&self) -> Result<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let backup = self.path.with_extension(format!("bak.{}", stamp));

        fs::rename(&self.path, &backup).with_context(|| {
            format!(
                "failed to move cost file aside: {} -> {}",
                self.path.display(),
                backup.display()
            )
        })?;

        info!(backup = %backup.display(), "retired existing cost file before rebuild");
        Ok(Some(backup))
    }

    fn rewrite(&self, days: &[DayEntry]) -> Result<()> {
        let mut output = String::new();

        for (date, counts) in days {
            output.push_str(date);
            output.push(' ');

            for (project, count) in counts {
                let column = format!("{}:{}", project, format_count(*count));
                output.push_str(&format!("{:<15}", column));
            }

            output.push('\n');
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create ledger directory: {}", parent.display()))?;
        }

        // Temp-and-rename keeps readers away from a half-written file.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, output)
            .with_context(|| format!("failed to write cost file: {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace cost file: {}", self.path.display()))?;

        Ok(())
    }
}

fn format_count(count: f64) -> String {
    if count.fract().abs() < 1e-9 {
        format!("{}", count as i64)
    } else {
        format!("{}", crate::models::round2(count))
    }
}

fn parse_ledger_line(line: &str) -> Option<(String, BTreeMap<String, f64>)> {
    let mut fields = line.split_whitespace();
    let date = fields.next()?;
    let mut counts = BTreeMap::new();

    let mut saw_column = false;

    for field in fields {
        let (project, count_text) = field.split_once(':')?;
        let count: f64 = count_text.parse().ok()?;
        counts.insert(project.to_string(), count);
        saw_column = true;
    }

    if !saw_column {
        return None;
    }

    Some((date.to_string(), counts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn deltas(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs
            .iter()
            .map(|(project, count)| (project.to_string(), *count))
            .collect()
    }

    #[test]
    fn test_merge_is_additive_not_idempotent() {
        let dir = tempdir().unwrap();
        let ledger = CostLedger::new(dir.path().join("cost"));

        ledger.merge("2024-01-01", &deltas(&[("proj1", 1.0)])).unwrap();
        ledger.merge("2024-01-01", &deltas(&[("proj1", 1.0)])).unwrap();

        let content = fs::read_to_string(ledger.path()).unwrap();
        assert!(content.contains("proj1:2"));

        let totals = ledger
            .query(
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            )
            .unwrap();
        assert_eq!(totals["proj1"], 2.0);
    }

    #[test]
    fn test_new_project_backfills_history() {
        let dir = tempdir().unwrap();
        let ledger = CostLedger::new(dir.path().join("cost"));

        ledger
            .merge("2024-01-01", &deltas(&[("projA", 2.0), ("projB", 1.0)]))
            .unwrap();
        ledger.merge("2024-01-02", &deltas(&[("projC", 5.0)])).unwrap();

        let content = fs::read_to_string(ledger.path()).unwrap();
        let first_day = content.lines().next().unwrap();
        assert!(first_day.starts_with("2024-01-01"));
        assert!(first_day.contains("projC:0"));

        let second_day = content.lines().nth(1).unwrap();
        assert!(second_day.contains("projA:0"));
        assert!(second_day.contains("projB:0"));
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cost");
        fs::write(
            &path,
            "2024-01-01 projA:1\ngarbage line without columns\n2024-01-02 projA:2\n",
        )
        .unwrap();

        let ledger = CostLedger::new(&path);
        let totals = ledger
            .query(
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            )
            .unwrap();

        assert_eq!(totals["projA"], 3.0);
    }

    #[test]
    fn test_query_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let ledger = CostLedger::new(dir.path().join("cost"));
        let totals = ledger
            .query(
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            )
            .unwrap();
        assert!(totals.is_empty());
    }

    #[test]
    fn test_query_respects_date_range() {
        let dir = tempdir().unwrap();
        let ledger = CostLedger::new(dir.path().join("cost"));

        ledger.merge("2024-01-01", &deltas(&[("projA", 1.0)])).unwrap();
        ledger.merge("2024-02-01", &deltas(&[("projA", 10.0)])).unwrap();

        let totals = ledger
            .query(
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            )
            .unwrap();
        assert_eq!(totals["projA"], 1.0);
    }

    #[test]
    fn test_fractional_credits_survive_rewrite() {
        let dir = tempdir().unwrap();
        let ledger = CostLedger::new(dir.path().join("cost"));

        ledger.merge("2024-01-01", &deltas(&[("projA", 0.3)])).unwrap();
        ledger.merge("2024-01-01", &deltas(&[("projA", 0.3)])).unwrap();

        let totals = ledger
            .query(
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            )
            .unwrap();
        assert!((totals["projA"] - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_retire_moves_file_aside() {
        let dir = tempdir().unwrap();
        let ledger = CostLedger::new(dir.path().join("cost"));
        ledger.merge("2024-01-01", &deltas(&[("projA", 1.0)])).unwrap();

        let backup = ledger.retire().unwrap().unwrap();
        assert!(backup.exists());
        assert!(!ledger.path().exists());

        assert!(ledger.retire().unwrap().is_none());
    }
}
