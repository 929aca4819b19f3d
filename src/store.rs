//! Utilization store
//!
//! Two persistence layers per (hardware, emulator) pair:
//!
//! * a coarse series file `utilization`, append-only text, one line per
//!   sampling cycle: `YYYYMMDD HHMMSS : <0..1>`;
//! * monthly detail rollups under `detail/`, YAML files named
//!   `<year>.<month>.utilization` and `<year>.<month>.cost`, keyed
//!   `date -> leaf path -> {sampling, used}` (or `-> {project: credit}`).
//!
//! The detail rollups are read-merge-write and guarded by a sibling `.lock`
//! marker. A writer that finds the lock present skips the whole cycle
//! instead of blocking; losing one rollup cycle is harmless because the
//! counters are cumulative, while a blocked writer could stack up stale
//! sampler processes. Readers additionally probe the file's mtime twice a
//! beat apart and only trust content once it stops changing, which covers a
//! writer that crashed mid-write without ever placing its lock. The probe
//! loop is bounded; exhausting it is an error, not a hang.
//!
//! Queries answer from whichever layer fits: the coarse series for
//! unfiltered daily (or per-sample) curves, the monthly detail files when a
//! hierarchy filter is in play. Every day in the requested range gets a
//! bucket, zero-filled when nothing was sampled.

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Cumulative per-leaf counters inside a monthly utilization rollup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTally {
    pub sampling: u64,
    pub used: u64,
}

/// `date -> leaf path -> tally`, exactly the on-disk YAML shape.
type UtilizationDetail = BTreeMap<String, BTreeMap<String, UsageTally>>;

/// `date -> leaf path -> project -> credit`.
type CostDetail = BTreeMap<String, BTreeMap<String, BTreeMap<String, f64>>>;

/// One leaf's contribution to a detail-rollup cycle.
#[derive(Debug, Clone)]
pub struct DetailEntry {
    /// Dotted hierarchy path, e.g. `1.2.1.3.1`.
    pub path: String,
    pub used: bool,
    /// Project credits for this cycle; empty for idle leaves.
    pub shares: BTreeMap<String, f64>,
}

pub struct UtilizationStore {
    base: PathBuf,
    probe_interval: Duration,
    max_probes: u32,
}

fn coarse_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(\d{8})\s+(\d{6})\s*:\s*([\d.]+)\s*$").expect("hardcoded pattern")
    })
}

impl UtilizationStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            probe_interval: Duration::from_secs(1),
            max_probes: 5,
        }
    }

    /// Override the mtime-probe cadence. Tests use millisecond probes.
    pub fn with_poll(mut self, interval: Duration, max_probes: u32) -> Self {
        self.probe_interval = interval;
        self.max_probes = max_probes;
        self
    }

    pub fn coarse_path(&self) -> PathBuf {
        self.base.join("utilization")
    }

    pub fn detail_dir(&self) -> PathBuf {
        self.base.join("detail")
    }

    /// Append one sample to the coarse series. Pure append, never rewrites.
    pub fn record_sample(&self, at: NaiveDateTime, fraction: f64) -> Result<()> {
        fs::create_dir_all(&self.base)
            .with_context(|| format!("failed to create db directory: {}", self.base.display()))?;

        let path = self.coarse_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open utilization file: {}", path.display()))?;

        writeln!(
            file,
            "{} {} : {}",
            at.format("%Y%m%d"),
            at.format("%H%M%S"),
            fraction
        )
        .with_context(|| format!("failed to append to utilization file: {}", path.display()))?;

        Ok(())
    }

    /// Fold one cycle's per-leaf contributions into the current monthly
    /// rollup pair. Returns `false` when another writer holds the lock and
    /// the cycle was skipped.
    pub fn record_detail(&self, at: NaiveDateTime, entries: &[DetailEntry]) -> Result<bool> {
        let detail_dir = self.detail_dir();
        fs::create_dir_all(&detail_dir).with_context(|| {
            format!("failed to create detail directory: {}", detail_dir.display())
        })?;

        let stem = format!("{}.{:02}", at.year(), at.month());
        let lock_path = detail_dir.join(format!("{}.lock", stem));

        let Some(_guard) = LockGuard::acquire(&lock_path)? else {
            info!(
                lock = %lock_path.display(),
                "detail rollup lock held by another writer, skipping this cycle"
            );
            return Ok(false);
        };

        let utilization_path = detail_dir.join(format!("{}.utilization", stem));
        let cost_path = detail_dir.join(format!("{}.cost", stem));

        let mut utilization: UtilizationDetail = load_yaml_or_default(&utilization_path);
        let mut cost: CostDetail = load_yaml_or_default(&cost_path);

        let date = at.format("%Y-%m-%d").to_string();
        let day_tallies = utilization.entry(date.clone()).or_default();
        let day_credits = cost.entry(date).or_default();

        for entry in entries {
            let tally = day_tallies.entry(entry.path.clone()).or_default();
            tally.sampling += 1;

            if entry.used {
                tally.used += 1;
            }

            let credits = day_credits.entry(entry.path.clone()).or_default();
            for (project, share) in &entry.shares {
                *credits.entry(project.clone()).or_insert(0.0) += share;
            }
        }

        write_yaml(&utilization_path, &utilization)?;
        write_yaml(&cost_path, &cost)?;

        Ok(true)
    }

    /// Daily utilization percentages from the coarse series. Same-day
    /// samples average into one bucket per day; with `per_sample` each raw
    /// sample keeps its own `YYYYMMDD-HHMMSS` bucket instead.
    pub fn query_coarse(
        &self,
        since: NaiveDate,
        until: NaiveDate,
        per_sample: bool,
    ) -> Result<BTreeMap<String, f64>> {
        let mut samples: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let path = self.coarse_path();

        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read utilization file: {}", path.display()))?;

            for line in content.lines() {
                let Some(caps) = coarse_line_pattern().captures(line) else {
                    if !line.trim().is_empty() {
                        warn!(line, "unrecognized line in utilization file, skipping");
                    }
                    continue;
                };

                let Ok(day) = NaiveDate::parse_from_str(&caps[1], "%Y%m%d") else {
                    continue;
                };

                if day < since || day > until {
                    continue;
                }

                let Ok(fraction) = caps[3].parse::<f64>() else {
                    continue;
                };

                let key = if per_sample {
                    format!("{}-{}", &caps[1], &caps[2])
                } else {
                    caps[1].to_string()
                };

                samples.entry(key).or_default().push(fraction * 100.0);
            }
        }

        if per_sample {
            return Ok(samples
                .into_iter()
                .map(|(key, values)| (key, crate::models::round2(values[0])))
                .collect());
        }

        let mut buckets = zero_filled_days(since, until);

        for (key, values) in samples {
            let average = values.iter().sum::<f64>() / values.len() as f64;
            buckets.insert(key, crate::models::round2(average));
        }

        Ok(buckets)
    }

    /// Daily utilization percentages from the monthly detail rollups,
    /// restricted to leaves whose dotted path satisfies `path_matches`.
    pub fn query_detail(
        &self,
        since: NaiveDate,
        until: NaiveDate,
        path_matches: impl Fn(&str) -> bool,
    ) -> Result<BTreeMap<String, f64>> {
        let mut buckets = zero_filled_days(since, until);

        for (year, month) in month_span(since, until) {
            let path = self
                .detail_dir()
                .join(format!("{}.{:02}.utilization", year, month));

            if !path.exists() {
                continue;
            }

            self.wait_until_stable(&path)?;

            let detail: UtilizationDetail = load_yaml_or_default(&path);

            for (date, tallies) in detail {
                let Ok(day) = NaiveDate::parse_from_str(&date, "%Y-%m-%d") else {
                    continue;
                };

                if day < since || day > until {
                    continue;
                }

                let mut sampling = 0u64;
                let mut used = 0u64;

                for (leaf_path, tally) in tallies {
                    if !path_matches(&leaf_path) {
                        continue;
                    }

                    sampling += tally.sampling;
                    used += tally.used;
                }

                let percent = if sampling == 0 {
                    0.0
                } else {
                    crate::models::round2(used as f64 / sampling as f64 * 100.0)
                };

                buckets.insert(day.format("%Y%m%d").to_string(), percent);
            }
        }

        Ok(buckets)
    }

    /// Per-project credit totals from the monthly cost rollups, restricted
    /// to leaves whose dotted path satisfies `path_matches`.
    pub fn query_cost_detail(
        &self,
        since: NaiveDate,
        until: NaiveDate,
        path_matches: impl Fn(&str) -> bool,
    ) -> Result<BTreeMap<String, f64>> {
        let mut totals: BTreeMap<String, f64> = BTreeMap::new();

        for (year, month) in month_span(since, until) {
            let path = self.detail_dir().join(format!("{}.{:02}.cost", year, month));

            if !path.exists() {
                continue;
            }

            self.wait_until_stable(&path)?;

            let detail: CostDetail = load_yaml_or_default(&path);

            for (date, leaves) in detail {
                let Ok(day) = NaiveDate::parse_from_str(&date, "%Y-%m-%d") else {
                    continue;
                };

                if day < since || day > until {
                    continue;
                }

                for (leaf_path, credits) in leaves {
                    if !path_matches(&leaf_path) {
                        continue;
                    }

                    for (project, credit) in credits {
                        *totals.entry(project).or_insert(0.0) += credit;
                    }
                }
            }
        }

        Ok(totals)
    }

    /// Probe the file's mtime until two consecutive reads agree, meaning no
    /// writer is mid-rewrite. Bounded; exhausting the probes is an error.
    fn wait_until_stable(&self, path: &Path) -> Result<()> {
        for _ in 0..self.max_probes {
            let before = fs::metadata(path)
                .and_then(|meta| meta.modified())
                .with_context(|| format!("failed to stat detail file: {}", path.display()))?;

            thread::sleep(self.probe_interval);

            let after = fs::metadata(path)
                .and_then(|meta| meta.modified())
                .with_context(|| format!("failed to stat detail file: {}", path.display()))?;

            if before == after {
                return Ok(());
            }
        }

        anyhow::bail!(
            "detail file kept changing for {} probes: {}",
            self.max_probes,
            path.display()
        )
    }
}

/// Marker-file lock with removal on drop. `acquire` returns `None` when the
/// marker already exists, which callers treat as "skip this cycle".
struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    fn acquire(path: &Path) -> Result<Option<Self>> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Some(Self {
                    path: path.to_path_buf(),
                }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err).with_context(|| {
                format!("failed to create detail lock file: {}", path.display())
            }),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(
                lock = %self.path.display(),
                error = %err,
                "failed to remove detail lock file"
            );
        }
    }
}

/// Deserialize a YAML rollup, treating a missing or unreadable file as an
/// empty one so a corrupt month never stops the pipeline.
fn load_yaml_or_default<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }

    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read detail file, treating as empty");
            return T::default();
        }
    };

    match serde_yaml::from_str(&content) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to parse detail file, treating as empty");
            T::default()
        }
    }
}

fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let yaml = serde_yaml::to_string(value)
        .with_context(|| format!("failed to serialize detail file: {}", path.display()))?;
    fs::write(path, yaml)
        .with_context(|| format!("failed to write detail file: {}", path.display()))?;
    Ok(())
}

/// `(year, month)` pairs covering the inclusive range, in order.
fn month_span(since: NaiveDate, until: NaiveDate) -> Vec<(i32, u32)> {
    let mut months = Vec::new();

    if until < since {
        return months;
    }

    let count = (until.year() - since.year()) * 12 + until.month() as i32 - since.month() as i32;

    for step in 0..=count {
        let index = since.month() as i32 - 1 + step;
        let year = since.year() + index.div_euclid(12);
        let month = index.rem_euclid(12) as u32 + 1;
        months.push((year, month));
    }

    months
}

/// One `YYYYMMDD -> 0.0` bucket per day in the inclusive range, so query
/// results always cover the whole range even when nothing was sampled.
fn zero_filled_days(since: NaiveDate, until: NaiveDate) -> BTreeMap<String, f64> {
    since
        .iter_days()
        .take_while(|day| *day <= until)
        .map(|day| (day.format("%Y%m%d").to_string(), 0.0))
        .collect()
}
