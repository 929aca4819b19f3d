//! Core Data Models
//!
//! This module defines the occupancy model shared by every hardware kind.
//! A sampling run parses raw status text into one [`OccupancyTree`]; all
//! downstream accounting (cost ledger, utilization rollups, filtering for
//! presentation) consumes that tree as plain data.
//!
//! ## Data Flow
//!
//! 1. **Raw Data**: status-command text, one line per record
//! 2. **Tree**: [`OccupancyTree`] - hierarchy of level keys down to leaves
//! 3. **Leaves**: [`Leaf`] - one slot per smallest addressable resource unit,
//!    holding zero or more [`UsageRecord`]s (empty list means idle)
//!
//! Derived fields (`leaf_count`, per-level value lists, `utilization`) are
//! always recomputed from the leaves via [`OccupancyTree::recompute`]; they
//! are never maintained by hand, so they cannot drift from the structure.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Occupant values that mean "nobody is using this unit".
pub const IDLE_SENTINELS: &[&str] = &["NONE", "None", "--", ""];

/// The supported emulation hardware families. Each family fixes the ordered
/// list of hierarchy level names its status output describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareKind {
    Palladium,
    Protium,
    Zebu,
}

impl HardwareKind {
    /// Ordered hierarchy level names, shallowest first.
    pub fn levels(&self) -> &'static [&'static str] {
        match self {
            HardwareKind::Palladium => &["rack", "cluster", "logic_drawer", "domain"],
            HardwareKind::Protium => &["board"],
            HardwareKind::Zebu => &["unit", "module", "sub_module"],
        }
    }
}

impl fmt::Display for HardwareKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HardwareKind::Palladium => "palladium",
            HardwareKind::Protium => "protium",
            HardwareKind::Zebu => "zebu",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for HardwareKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "palladium" => Ok(HardwareKind::Palladium),
            "protium" => Ok(HardwareKind::Protium),
            "zebu" => Ok(HardwareKind::Zebu),
            other => anyhow::bail!("unknown hardware kind: {}", other),
        }
    }
}

/// One usage record on a leaf. Busy leaves carry one or more of these;
/// protium boards can carry several (one per FPGA user).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub occupant: String,
    #[serde(rename = "executeHost")]
    pub execute_host: String,
    pub pid: String,
    /// Opaque descriptive fields (design/tpod/FPGA/elapsed time and the
    /// like), passed through to presentation untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl UsageRecord {
    /// Look up a named field, covering both the fixed columns and the
    /// passthrough attributes. Used by attribute-level filtering.
    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "occupant" | "owner" | "user" => Some(&self.occupant),
            "execute_host" | "host" => Some(&self.execute_host),
            "pid" => Some(&self.pid),
            other => self.attributes.get(other).map(String::as_str),
        }
    }

    /// A record is attributable only when both occupant and execute host
    /// carry real values rather than idle sentinels.
    pub fn is_attributable(&self) -> bool {
        !IDLE_SENTINELS.contains(&self.occupant.as_str())
            && !IDLE_SENTINELS.contains(&self.execute_host.as_str())
    }
}

/// One leaf slot at the deepest hierarchy level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leaf {
    /// Level keys from the shallowest level down, one entry per level name.
    pub path: Vec<String>,
    /// Usage records on this unit; empty means idle.
    #[serde(default)]
    pub records: Vec<UsageRecord>,
    /// Opaque descriptive fields of the unit itself (protium board uuid and
    /// ip, for instance), passed through to snapshots untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl Leaf {
    pub fn new(path: Vec<String>) -> Self {
        Self {
            path,
            records: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn is_busy(&self) -> bool {
        !self.records.is_empty()
    }

    /// Hierarchy path in the dotted on-disk form (`rack.cluster.board.domain`).
    pub fn path_key(&self) -> String {
        self.path.join(".")
    }
}

/// Point-in-time occupancy snapshot of one emulator.
///
/// Immutable after construction except through
/// [`filter`](crate::filter::filter), which builds a new pruned tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccupancyTree {
    pub kind: HardwareKind,
    /// Emulator identity from the status header, empty when the hardware
    /// kind reports none.
    #[serde(default)]
    pub emulator: String,
    /// Hardware identity from the status header (e.g. `Z1`).
    #[serde(default)]
    pub hardware: String,
    /// Overall emulator status string, passed through.
    #[serde(default)]
    pub status: String,
    /// `1 - idle/total`, rounded to 2 decimals; 0 for an empty tree.
    pub utilization: f64,
    /// Number of leaf slots. Always derived, see [`Self::recompute`].
    pub leaf_count: usize,
    /// Distinct keys seen per level, in first-seen order, parallel to
    /// [`HardwareKind::levels`]. Always derived.
    pub level_values: Vec<Vec<String>>,
    pub leaves: Vec<Leaf>,
}

impl OccupancyTree {
    pub fn new(kind: HardwareKind) -> Self {
        let depth = kind.levels().len();
        Self {
            kind,
            emulator: String::new(),
            hardware: String::new(),
            status: String::new(),
            utilization: 0.0,
            leaf_count: 0,
            level_values: vec![Vec::new(); depth],
            leaves: Vec::new(),
        }
    }

    /// Ordered hierarchy level names for this tree.
    pub fn levels(&self) -> &'static [&'static str] {
        self.kind.levels()
    }

    /// A tree with no leaves means "no data for this cycle", not an error.
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn busy_leaf_count(&self) -> usize {
        self.leaves.iter().filter(|leaf| leaf.is_busy()).count()
    }

    /// Append a leaf without recomputing; callers finish with
    /// [`Self::recompute`] once construction is done.
    pub fn push_leaf(&mut self, leaf: Leaf) {
        self.leaves.push(leaf);
    }

    /// Rebuild every derived field from the current leaves: leaf count,
    /// per-level distinct value lists, and utilization. Stale derived
    /// state is a correctness bug, so any mutation of the leaves must be
    /// followed by this call.
    pub fn recompute(&mut self) {
        self.leaf_count = self.leaves.len();

        let depth = self.kind.levels().len();
        let mut values: Vec<Vec<String>> = vec![Vec::new(); depth];

        for leaf in &self.leaves {
            for (level, key) in leaf.path.iter().enumerate().take(depth) {
                if !values[level].contains(key) {
                    values[level].push(key.clone());
                }
            }
        }

        self.level_values = values;

        self.utilization = if self.leaves.is_empty() {
            0.0
        } else {
            let idle = self.leaves.iter().filter(|leaf| !leaf.is_busy()).count();
            round2(1.0 - idle as f64 / self.leaves.len() as f64)
        };
    }
}

/// Round to 2 decimal places, the precision every on-disk utilization value
/// uses.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
