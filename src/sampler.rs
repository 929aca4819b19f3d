//! Sampling orchestration
//!
//! One `Sampler` per (hardware, emulator) pair drives a complete cycle:
//! run the status command, parse the text into an occupancy tree, archive
//! the tree as a YAML snapshot, append the coarse utilization sample,
//! attribute busy leaves to projects, fold the day's deltas into the cost
//! ledger, and update the monthly detail rollups.
//!
//! The same machinery backs the two rebuild paths: `reconfig` replays every
//! archived snapshot through attribution and the ledger after moving the
//! live ledger aside, and `rebuild_detail` does the same for the monthly
//! rollups. Rebuilds exist so that editing the project configuration can be
//! applied retroactively without re-sampling anything.

use crate::config::{Config, HardwareConfig};
use crate::history::HistoryIndex;
use crate::ledger::CostLedger;
use crate::models::{Leaf, OccupancyTree};
use crate::parser::OccupancyParser;
use crate::projects::{
    self, Factor, FactorValues, ProjectResolver, ProportionTable, OTHERS,
};
use crate::store::{DetailEntry, UtilizationStore};
use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{error, info, warn};

pub struct Sampler {
    hardware_name: String,
    hardware: HardwareConfig,
    base: PathBuf,
    db_root: PathBuf,
    parser: OccupancyParser,
    resolver: ProjectResolver,
    /// All configured projects plus `others`, in list-file order.
    projects: Vec<String>,
    /// Normalized default cost rates (percent, summing to 100).
    default_rates: BTreeMap<String, f64>,
    ledger: CostLedger,
    store: UtilizationStore,
}

impl Sampler {
    pub fn new(config: &Config, hardware_name: &str) -> Result<Self> {
        let hardware = config.hardware(hardware_name)?.clone();

        let base = config
            .paths
            .db_path
            .join(hardware.kind.to_string())
            .join(&hardware.emulator);

        let (projects, default_rates, resolver) = load_project_config(&hardware)?;

        let ledger = CostLedger::new(base.join("cost"));
        let store = UtilizationStore::new(&base).with_poll(
            std::time::Duration::from_secs(config.sampling.probe_interval_secs),
            config.sampling.max_probes,
        );

        Ok(Self {
            hardware_name: hardware_name.to_string(),
            parser: OccupancyParser::new(hardware.kind),
            hardware,
            base,
            db_root: config.paths.db_path.clone(),
            resolver,
            projects,
            default_rates,
            ledger,
            store,
        })
    }

    /// Run the status command and capture its stdout as lines. With an
    /// `ssh_host` configured the command runs remotely; either way the text
    /// is opaque until the parser sees it.
    fn collect_status(&self) -> Result<Vec<String>> {
        let mut command = match &self.hardware.ssh_host {
            Some(host) => {
                let mut ssh = Command::new("ssh");
                ssh.arg(host).arg(&self.hardware.status_command);
                ssh
            }
            None => {
                let mut sh = Command::new("sh");
                sh.arg("-c").arg(&self.hardware.status_command);
                sh
            }
        };

        info!(
            hardware = %self.hardware_name,
            command = %self.hardware.status_command,
            "collecting status"
        );

        let output = command.output().with_context(|| {
            format!(
                "failed to run status command for hardware '{}'",
                self.hardware_name
            )
        })?;

        if !output.status.success() {
            warn!(
                hardware = %self.hardware_name,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "status command exited non-zero, parsing whatever stdout it produced"
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    /// One full sampling cycle at the given timestamp.
    pub fn run(&self, at: NaiveDateTime) -> Result<()> {
        let lines = self.collect_status()?;
        let mut tree = self.parser.parse(&lines);

        // Grammars without an identity header fall back to the config.
        if tree.hardware.is_empty() {
            tree.hardware = self.hardware_name.clone();
        }
        if tree.emulator.is_empty() {
            tree.emulator = self.hardware.emulator.clone();
        }

        if tree.is_empty() {
            warn!(
                hardware = %self.hardware_name,
                "no occupancy information in status output, skipping this cycle"
            );
            return Ok(());
        }

        self.persist_snapshot(&tree, at)?;
        self.write_levels_sidecar(&tree)?;

        self.store.record_sample(at, tree.utilization)?;

        let date = at.format("%Y-%m-%d").to_string();
        self.ledger.merge(&date, &self.cost_deltas(&tree))?;

        self.store.record_detail(at, &self.detail_entries(&tree))?;

        info!(
            hardware = %self.hardware_name,
            utilization = tree.utilization,
            leaves = tree.leaf_count,
            "sampling cycle complete"
        );

        Ok(())
    }

    /// Rebuild the cost ledger from the snapshot archive. The live ledger
    /// is moved aside first, so a bad rebuild never destroys history.
    pub fn reconfig(&self) -> Result<()> {
        let snapshots = self.archived_snapshots()?;

        if snapshots.is_empty() {
            warn!(hardware = %self.hardware_name, "no archived snapshots to replay");
            return Ok(());
        }

        self.ledger.retire()?;

        let mut replayed = 0usize;

        for (date, _, path) in &snapshots {
            let Some(tree) = self.load_snapshot(path) else {
                continue;
            };

            self.ledger.merge(date, &self.cost_deltas(&tree))?;
            replayed += 1;
        }

        info!(
            hardware = %self.hardware_name,
            snapshots = replayed,
            "cost ledger rebuilt from archive"
        );

        Ok(())
    }

    /// Rebuild the monthly detail rollups from the snapshot archive.
    pub fn rebuild_detail(&self) -> Result<()> {
        let snapshots = self.archived_snapshots()?;

        if snapshots.is_empty() {
            warn!(hardware = %self.hardware_name, "no archived snapshots to replay");
            return Ok(());
        }

        self.retire_detail_dir()?;

        let mut replayed = 0usize;

        for (date, time, path) in &snapshots {
            let Some(tree) = self.load_snapshot(path) else {
                continue;
            };

            let stamp = format!("{} {}", date, time);
            let Ok(at) = NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H%M%S") else {
                warn!(%stamp, "unparseable snapshot timestamp, skipping");
                continue;
            };

            if !self.store.record_detail(at, &self.detail_entries(&tree))? {
                warn!(%stamp, "detail rollup locked during rebuild, entry lost");
            }

            replayed += 1;
        }

        info!(
            hardware = %self.hardware_name,
            snapshots = replayed,
            "detail rollups rebuilt from archive"
        );

        Ok(())
    }

    pub fn ledger(&self) -> &CostLedger {
        &self.ledger
    }

    pub fn store(&self) -> &UtilizationStore {
        &self.store
    }

    /// Normalized default cost rates for reporting, percent per project.
    pub fn default_rates(&self) -> &BTreeMap<String, f64> {
        &self.default_rates
    }

    /// Per-project deltas for one snapshot. Every configured project gets a
    /// zero entry so ledger columns stay stable; busy records then add
    /// their resolved shares, and attributable-but-unmatched records fall
    /// into `others`.
    fn cost_deltas(&self, tree: &OccupancyTree) -> BTreeMap<String, f64> {
        let mut deltas: BTreeMap<String, f64> = self
            .projects
            .iter()
            .map(|project| (project.clone(), 0.0))
            .collect();
        deltas.entry(OTHERS.to_string()).or_insert(0.0);

        for leaf in &tree.leaves {
            for (project, share) in self.leaf_shares(leaf) {
                *deltas.entry(project).or_insert(0.0) += share;
            }
        }

        deltas
    }

    /// Resolved project credits for one leaf's records. Records with a
    /// sentinel occupant or host carry no attribution information and are
    /// skipped outright; records the resolver cannot match credit `others`.
    fn leaf_shares(&self, leaf: &Leaf) -> BTreeMap<String, f64> {
        let mut shares: BTreeMap<String, f64> = BTreeMap::new();

        for record in &leaf.records {
            if !record.is_attributable() {
                continue;
            }

            let values = FactorValues {
                user: record.occupant.clone(),
                execute_host: record.execute_host.clone(),
                submit_host: record
                    .field("submit_host")
                    .unwrap_or_default()
                    .to_string(),
            };

            let resolved = self.resolver.resolve(&values);

            if resolved.is_empty() {
                *shares.entry(OTHERS.to_string()).or_insert(0.0) += 1.0;
            } else {
                for (project, weight) in resolved {
                    *shares.entry(project).or_insert(0.0) += weight;
                }
            }
        }

        shares
    }

    fn detail_entries(&self, tree: &OccupancyTree) -> Vec<DetailEntry> {
        tree.leaves
            .iter()
            .map(|leaf| DetailEntry {
                path: leaf.path_key(),
                used: leaf.is_busy(),
                shares: self.leaf_shares(leaf),
            })
            .collect()
    }

    fn persist_snapshot(&self, tree: &OccupancyTree, at: NaiveDateTime) -> Result<()> {
        let day_dir = self
            .base
            .join(at.format("%Y").to_string())
            .join(at.format("%m").to_string())
            .join(at.format("%d").to_string());

        fs::create_dir_all(&day_dir)
            .with_context(|| format!("failed to create db directory: {}", day_dir.display()))?;

        let path = day_dir.join(at.format("%H%M%S").to_string());
        let yaml = serde_yaml::to_string(tree).context("failed to serialize snapshot")?;
        fs::write(&path, yaml)
            .with_context(|| format!("failed to write snapshot: {}", path.display()))?;

        Ok(())
    }

    /// Sidecar listing the hierarchy values seen this cycle, so consumers
    /// can populate level selectors without loading snapshots.
    fn write_levels_sidecar(&self, tree: &OccupancyTree) -> Result<()> {
        let mut levels: BTreeMap<&str, &Vec<String>> = BTreeMap::new();

        for (name, values) in tree.levels().iter().zip(tree.level_values.iter()) {
            levels.insert(name, values);
        }

        let path = self.base.join("levels.yaml");
        let yaml = serde_yaml::to_string(&levels).context("failed to serialize levels sidecar")?;
        fs::write(&path, yaml)
            .with_context(|| format!("failed to write levels sidecar: {}", path.display()))?;

        Ok(())
    }

    fn archived_snapshots(&self) -> Result<Vec<(String, String, PathBuf)>> {
        let index = HistoryIndex::build(&self.db_root)?;

        Ok(index
            .snapshots_for(&self.hardware.kind.to_string(), &self.hardware.emulator)
            .into_iter()
            .map(|(date, time, path)| (date, time, path.to_path_buf()))
            .collect())
    }

    fn load_snapshot(&self, path: &Path) -> Option<OccupancyTree> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                error!(path = %path.display(), error = %err, "failed to read snapshot, skipping");
                return None;
            }
        };

        match serde_yaml::from_str(&content) {
            Ok(tree) => Some(tree),
            Err(err) => {
                error!(path = %path.display(), error = %err, "failed to parse snapshot, skipping");
                None
            }
        }
    }

    fn retire_detail_dir(&self) -> Result<()> {
        let detail_dir = self.store.detail_dir();

        if !detail_dir.exists() {
            return Ok(());
        }

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let backup = detail_dir.with_file_name(format!("detail.bak.{}", stamp));

        fs::rename(&detail_dir, &backup).with_context(|| {
            format!(
                "failed to move detail directory aside: {} -> {}",
                detail_dir.display(),
                backup.display()
            )
        })?;

        info!(backup = %backup.display(), "retired existing detail rollups before rebuild");
        Ok(())
    }
}

/// Load the project list and proportion tables for one hardware entry and
/// build its resolver. Missing files mean "no attribution that way".
fn load_project_config(
    hardware: &HardwareConfig,
) -> Result<(Vec<String>, BTreeMap<String, f64>, ProjectResolver)> {
    let (mut project_list, raw_rates) = match &hardware.project_list_file {
        Some(path) => projects::parse_project_list_file(path)?,
        None => (Vec::new(), BTreeMap::new()),
    };

    let mut default_rates = projects::normalize_default_rates(&project_list, raw_rates);

    project_list.push(OTHERS.to_string());
    default_rates.insert(OTHERS.to_string(), 0.0);

    let mut tables: BTreeMap<Factor, ProportionTable> = BTreeMap::new();

    for (factor, path) in [
        (Factor::User, &hardware.project_user_file),
        (Factor::ExecuteHost, &hardware.project_execute_host_file),
        (Factor::SubmitHost, &hardware.project_submit_host_file),
    ] {
        if let Some(path) = path {
            tables.insert(factor, projects::parse_project_proportion_file(path)?);
        }
    }

    let resolver = ProjectResolver::from_config(&hardware.project_primary_factors, tables)?;

    Ok((project_list, default_rates, resolver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HardwareKind, UsageRecord};
    use std::io::Write as _;
    use tempfile::tempdir;

    fn hardware_config(dir: &std::path::Path) -> HardwareConfig {
        let host_file = dir.join("project_execute_host");
        let mut file = fs::File::create(&host_file).unwrap();
        writeln!(file, "h1 : proj1").unwrap();
        writeln!(file, "h2 : projA(0.3) projB(0.7)").unwrap();

        HardwareConfig {
            kind: HardwareKind::Palladium,
            emulator: "EMU01".to_string(),
            status_command: "true".to_string(),
            ssh_host: None,
            project_list_file: None,
            project_user_file: None,
            project_execute_host_file: Some(host_file),
            project_submit_host_file: None,
            project_primary_factors: "execute_host user".to_string(),
        }
    }

    fn sampler(dir: &std::path::Path) -> Sampler {
        let mut config = Config::default();
        config.paths.db_path = dir.join("db");
        config
            .hardware
            .insert("EMU01".to_string(), hardware_config(dir));

        Sampler::new(&config, "EMU01").unwrap()
    }

    fn busy_leaf(path: &[&str], occupant: &str, host: &str) -> Leaf {
        let mut leaf = Leaf::new(path.iter().map(|s| s.to_string()).collect());
        leaf.records.push(UsageRecord {
            occupant: occupant.to_string(),
            execute_host: host.to_string(),
            pid: "99".to_string(),
            attributes: BTreeMap::new(),
        });
        leaf
    }

    #[test]
    fn test_cost_deltas_resolve_and_fall_back() {
        let dir = tempdir().unwrap();
        let sampler = sampler(dir.path());

        let mut tree = OccupancyTree::new(HardwareKind::Palladium);
        tree.push_leaf(busy_leaf(&["0", "0", "0", "1.1"], "alice", "h1"));
        tree.push_leaf(busy_leaf(&["0", "0", "0", "1.2"], "bob", "unknown-host"));
        tree.push_leaf(Leaf::new(vec![
            "0".to_string(),
            "0".to_string(),
            "0".to_string(),
            "1.3".to_string(),
        ]));
        tree.recompute();

        let deltas = sampler.cost_deltas(&tree);

        assert_eq!(deltas["proj1"], 1.0);
        assert_eq!(deltas[OTHERS], 1.0);
    }

    #[test]
    fn test_weighted_shares_split_across_projects() {
        let dir = tempdir().unwrap();
        let sampler = sampler(dir.path());

        let leaf = busy_leaf(&["0", "0", "0", "1.1"], "carol", "h2");
        let shares = sampler.leaf_shares(&leaf);

        assert!((shares["projA"] - 0.3).abs() < 1e-9);
        assert!((shares["projB"] - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_sentinel_records_credit_nothing() {
        let dir = tempdir().unwrap();
        let sampler = sampler(dir.path());

        let leaf = busy_leaf(&["0", "0", "0", "1.1"], "dave", "--");
        assert!(sampler.leaf_shares(&leaf).is_empty());
    }

    #[test]
    fn test_detail_entries_cover_every_leaf() {
        let dir = tempdir().unwrap();
        let sampler = sampler(dir.path());

        let mut tree = OccupancyTree::new(HardwareKind::Palladium);
        tree.push_leaf(busy_leaf(&["0", "1", "0", "1.1"], "alice", "h1"));
        tree.push_leaf(Leaf::new(vec![
            "0".to_string(),
            "1".to_string(),
            "0".to_string(),
            "1.2".to_string(),
        ]));
        tree.recompute();

        let entries = sampler.detail_entries(&tree);

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "0.1.0.1.1");
        assert!(entries[0].used);
        assert_eq!(entries[0].shares["proj1"], 1.0);
        assert!(!entries[1].used);
        assert!(entries[1].shares.is_empty());
    }

    #[test]
    fn test_snapshot_persist_and_reload() {
        let dir = tempdir().unwrap();
        let sampler = sampler(dir.path());

        let mut tree = OccupancyTree::new(HardwareKind::Palladium);
        tree.emulator = "EMU01".to_string();
        tree.push_leaf(busy_leaf(&["0", "0", "0", "1.1"], "alice", "h1"));
        tree.recompute();

        let at = NaiveDateTime::parse_from_str("2024-01-05 08:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        sampler.persist_snapshot(&tree, at).unwrap();

        let path = dir
            .path()
            .join("db/palladium/EMU01/2024/01/05/080000");
        assert!(path.exists());

        let back = sampler.load_snapshot(&path).unwrap();
        assert_eq!(back.leaf_count, 1);
        assert_eq!(back.leaves[0].records[0].occupant, "alice");
    }
}
