//! Occupancy tree filtering
//!
//! Pruning algebra used by both the accounting queries and the presentation
//! layer. Hierarchy-level predicates drop whole subtrees; attribute
//! predicates (occupant/host/pid/passthrough fields) drop individual usage
//! records while keeping the leaf slot in place, so row counts stay correct
//! for presentation.
//!
//! The one invariant: every derived field of the returned tree (leaf count,
//! per-level value lists, utilization) is recomputed from the surviving
//! structure. The source tree is never mutated.

use crate::models::{HardwareKind, OccupancyTree};
use std::collections::BTreeMap;

/// Accepted-value set for the sentinel-aware predicates. `ALL` anywhere in
/// the set means "no restriction".
pub const ALL: &str = "ALL";

/// Per-level accepted values, keyed by level name (`rack`, `cluster`, ...).
/// Missing levels are unrestricted.
pub type LevelPredicates = BTreeMap<String, Vec<String>>;

/// Per-attribute accepted values, keyed by record field name (`occupant`,
/// `execute_host`, `pid`, or any passthrough attribute).
pub type AttributePredicates = BTreeMap<String, Vec<String>>;

fn accepts(predicate: Option<&Vec<String>>, value: &str) -> bool {
    match predicate {
        None => true,
        Some(accepted) => {
            accepted.is_empty()
                || accepted.iter().any(|entry| entry == ALL)
                || accepted.iter().any(|entry| entry == value)
        }
    }
}

/// Build a pruned copy of `tree`.
///
/// Hierarchy pruning is depth-first: a leaf survives only if every one of
/// its path keys is accepted at its level, so rejecting a shallow key
/// transitively removes all descendants. Attribute predicates then thin the
/// usage records of the surviving leaves; a leaf whose record list empties
/// out becomes idle but keeps its slot.
pub fn filter(
    tree: &OccupancyTree,
    levels: &LevelPredicates,
    attributes: &AttributePredicates,
) -> OccupancyTree {
    let mut filtered = OccupancyTree::new(tree.kind);
    filtered.emulator = tree.emulator.clone();
    filtered.hardware = tree.hardware.clone();
    filtered.status = tree.status.clone();

    let level_names = tree.levels();

    for leaf in &tree.leaves {
        let survives = leaf
            .path
            .iter()
            .zip(level_names.iter())
            .all(|(key, level)| accepts(levels.get(*level), key));

        if !survives {
            continue;
        }

        let mut kept = leaf.clone();

        if !attributes.is_empty() {
            kept.records.retain(|record| {
                attributes.iter().all(|(name, accepted)| {
                    let value = record.field(name).unwrap_or("");
                    accepts(Some(accepted), value)
                })
            });
        }

        filtered.push_leaf(kept);
    }

    filtered.recompute();
    filtered
}

/// Apply level predicates to a dotted on-disk path key (the form the detail
/// rollups use). Only the deepest level may itself contain dots, so the key
/// splits into one segment per shallow level plus a remainder.
pub fn path_matches(kind: HardwareKind, levels: &LevelPredicates, path_key: &str) -> bool {
    let level_names = kind.levels();
    let segments: Vec<&str> = path_key.splitn(level_names.len(), '.').collect();

    segments
        .iter()
        .zip(level_names.iter())
        .all(|(segment, level)| accepts(levels.get(*level), segment))
}
