//! Status-text parsing
//!
//! Each hardware family's status command produces free-form line-oriented
//! text with its own small grammar: a header line establishing the emulator
//! identity, "level open" lines announcing children, and leaf rows carrying
//! occupant/pid/host columns. [`OccupancyParser::parse`] turns such text into
//! an [`OccupancyTree`].
//!
//! Status dumps are known to contain decorative and blank lines, so any line
//! that matches no grammar is skipped silently. A palladium dump whose header
//! never appears yields an empty tree; callers treat empty as "no data",
//! never as an error to propagate.

use crate::models::{HardwareKind, Leaf, OccupancyTree, UsageRecord, IDLE_SENTINELS};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

struct PalladiumPatterns {
    header: Regex,
    rack: Regex,
    cluster: Regex,
    drawer: Regex,
    domain: Regex,
}

fn palladium_patterns() -> &'static PalladiumPatterns {
    static PATTERNS: OnceLock<PalladiumPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| PalladiumPatterns {
        header: Regex::new(
            r"^\s*Emulator:\s*(.+?)\s+Hardware:\s*(.+?)\s+Configmgr:\s*(.+?)\s+Status:\s*(.+?)\s*$",
        )
        .expect("hardcoded pattern"),
        rack: Regex::new(r"^\s*Rack\s*(\d+)\s*has\s*(\d+)\s*clusters\s*$").expect("hardcoded pattern"),
        cluster: Regex::new(r"^Cluster\s*(\d+)\s*has\s*(\d+)\s*logic drawers\s+CCD:\s*(.+?)\s*$")
            .expect("hardcoded pattern"),
        drawer: Regex::new(
            r"^\s*Logic drawer\s*(\d+)\s*has\s*(\d+)\s*domains\s+Logic drawer:\s*(.+?)\s*$",
        )
        .expect("hardcoded pattern"),
        domain: Regex::new(
            r"^\s*(\d+\.\d+)\s+(\S+)\s+(\S+)\s+(\S+\s+\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s*$",
        )
        .expect("hardcoded pattern"),
    })
}

struct ProtiumPatterns {
    board: Regex,
    fpga_idle: Regex,
    fpga_used: Regex,
}

fn protium_patterns() -> &'static ProtiumPatterns {
    static PATTERNS: OnceLock<ProtiumPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ProtiumPatterns {
        board: Regex::new(r"^\S+\s+\S+\s+(\d+)\s+([\d.]+)\s+\(\S+\)\s+\((\d+)\).*$")
            .expect("hardcoded pattern"),
        fpga_idle: Regex::new(r"^\s*FPGA\s+(\S+)\s+\|\s*$").expect("hardcoded pattern"),
        fpga_used: Regex::new(r"^\s*FPGA\s+(\S+)\s+\|\s+(\S+):(\S+):(\S+)\s+@\s+(\S+)\s*$")
            .expect("hardcoded pattern"),
    })
}

fn zebu_row_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(\S+\.\S+\.\S+)\s+(\S+)(?:\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)(?:\s+(\S+))?)?\s*$")
            .expect("hardcoded pattern")
    })
}

/// Turns one status dump into an [`OccupancyTree`]. Pure over its input;
/// all persistence happens in the sampler.
pub struct OccupancyParser {
    kind: HardwareKind,
}

impl OccupancyParser {
    pub fn new(kind: HardwareKind) -> Self {
        Self { kind }
    }

    pub fn parse(&self, lines: &[String]) -> OccupancyTree {
        let mut tree = match self.kind {
            HardwareKind::Palladium => parse_palladium(lines),
            HardwareKind::Protium => parse_protium(lines),
            HardwareKind::Zebu => parse_zebu(lines),
        };
        tree.recompute();
        tree
    }
}

/// Palladium `test_server` output: one header, then nested
/// rack/cluster/logic-drawer announcements with indented domain rows.
/// Domain rows before the first announcements attach to key `0` at the
/// missing levels, matching the counters the text itself starts from.
fn parse_palladium(lines: &[String]) -> OccupancyTree {
    let patterns = palladium_patterns();
    let mut tree = OccupancyTree::new(HardwareKind::Palladium);
    let mut seen_header = false;

    let mut current_rack = "0".to_string();
    let mut current_cluster = "0".to_string();
    let mut current_drawer = "0".to_string();

    for line in lines {
        if let Some(caps) = patterns.header.captures(line) {
            tree.emulator = caps[1].to_string();
            tree.hardware = caps[2].to_string();
            tree.status = caps[4].to_string();
            seen_header = true;
        } else if !seen_header {
            // Everything before the header is preamble noise.
            continue;
        } else if let Some(caps) = patterns.rack.captures(line) {
            current_rack = caps[1].to_string();
        } else if let Some(caps) = patterns.cluster.captures(line) {
            current_cluster = caps[1].to_string();
        } else if let Some(caps) = patterns.drawer.captures(line) {
            current_drawer = caps[1].to_string();
        } else if let Some(caps) = patterns.domain.captures(line) {
            let domain = caps[1].to_string();
            let owner = caps[2].to_string();
            let pid = caps[3].to_string();

            let mut leaf = Leaf::new(vec![
                current_rack.clone(),
                current_cluster.clone(),
                current_drawer.clone(),
                domain,
            ]);

            if !IDLE_SENTINELS.contains(&owner.as_str()) {
                let execute_host = pid.split(':').next().unwrap_or("").to_string();
                let mut attributes = BTreeMap::new();
                attributes.insert("tpod".to_string(), caps[4].to_string());
                attributes.insert("design".to_string(), caps[5].to_string());
                attributes.insert("elaptime".to_string(), caps[6].to_string());
                attributes.insert("reservedkey".to_string(), caps[7].to_string());

                leaf.records.push(UsageRecord {
                    occupant: owner,
                    execute_host,
                    pid,
                    attributes,
                });
            }

            tree.push_leaf(leaf);
        }
    }

    tree
}

/// Protium `ptmRun -init` output: board lines followed by one `FPGA .. |`
/// row per FPGA, populated rows shaped `user:host:pid @ started_time`.
/// A board is one leaf; each populated FPGA row is one usage record.
fn parse_protium(lines: &[String]) -> OccupancyTree {
    let patterns = protium_patterns();
    let mut tree = OccupancyTree::new(HardwareKind::Protium);
    let mut current: Option<Leaf> = None;

    for line in lines {
        if let Some(caps) = patterns.board.captures(line) {
            if let Some(leaf) = current.take() {
                tree.push_leaf(leaf);
            }

            let mut leaf = Leaf::new(vec![caps[3].to_string()]);
            leaf.attributes
                .insert("board_uuid".to_string(), caps[1].to_string());
            leaf.attributes
                .insert("board_ip".to_string(), caps[2].to_string());
            current = Some(leaf);
        } else if let Some(caps) = patterns.fpga_used.captures(line) {
            let Some(leaf) = current.as_mut() else {
                // FPGA row with no preceding board line; skip it.
                continue;
            };
            let mut attributes = BTreeMap::new();
            attributes.insert("fpga".to_string(), caps[1].to_string());
            attributes.insert("started_time".to_string(), caps[5].to_string());

            let record = UsageRecord {
                occupant: caps[2].to_string(),
                execute_host: caps[3].to_string(),
                pid: caps[4].to_string(),
                attributes,
            };

            // `--` placeholder rows describe an unused FPGA slot.
            if !IDLE_SENTINELS.contains(&record.occupant.as_str()) {
                leaf.records.push(record);
            }
        } else if patterns.fpga_idle.captures(line).is_some() {
            // Empty FPGA slot; the leaf already exists, nothing to record.
            continue;
        }
    }

    if let Some(leaf) = current.take() {
        tree.push_leaf(leaf);
    }

    tree
}

/// Zebu `zRscManager` report: one row per sub-module, either
/// `unit.module.sub status`, or the same with user/host/pid (and an
/// optional suspend column) appended.
fn parse_zebu(lines: &[String]) -> OccupancyTree {
    let pattern = zebu_row_pattern();
    let mut tree = OccupancyTree::new(HardwareKind::Zebu);

    for line in lines {
        let Some(caps) = pattern.captures(line) else {
            continue;
        };

        let path: Vec<String> = caps[1].split('.').map(|part| part.to_string()).collect();
        if path.len() != 3 {
            continue;
        }

        let status = caps[2].to_string();
        let mut leaf = Leaf::new(path);

        // The three-field grouping in the row regex is `<skip> user host pid`;
        // two-column rows leave it empty and the sub-module idle.
        if let (Some(user), Some(host), Some(pid)) = (caps.get(4), caps.get(5), caps.get(6)) {
            let occupant = user.as_str().to_string();

            if !IDLE_SENTINELS.contains(&occupant.as_str()) {
                let mut attributes = BTreeMap::new();
                attributes.insert("status".to_string(), status);
                attributes.insert(
                    "suspend".to_string(),
                    caps.get(7).map_or("None", |m| m.as_str()).to_string(),
                );

                leaf.records.push(UsageRecord {
                    occupant,
                    execute_host: host.as_str().to_string(),
                    pid: pid.as_str().to_string(),
                    attributes,
                });
            }
        }

        tree.push_leaf(leaf);
    }

    tree
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_lines(text: &str) -> Vec<String> {
        text.lines().map(|line| line.to_string()).collect()
    }

    const PALLADIUM_DUMP: &str = "\
Emulator: EMU01  Hardware: Z1  Configmgr: 21.03  Status: In service

Rack 1 has 2 clusters
Cluster 1 has 1 logic drawers  CCD: enabled
 Logic drawer 1 has 2 domains  Logic drawer: online
  1.1   alice    h1:4242   tpod a   designA  01:02:03  key1
  1.2   NONE     0         tpod b   none     00:00:00  none
Cluster 2 has 1 logic drawers  CCD: enabled
 Logic drawer 1 has 2 domains  Logic drawer: online
  1.1   NONE     0         tpod c   none     00:00:00  none
  1.2   NONE     0         tpod d   none     00:00:00  none
";

    #[test]
    fn test_palladium_parse() {
        let parser = OccupancyParser::new(HardwareKind::Palladium);
        let tree = parser.parse(&to_lines(PALLADIUM_DUMP));

        assert_eq!(tree.emulator, "EMU01");
        assert_eq!(tree.hardware, "Z1");
        assert_eq!(tree.status, "In service");
        assert_eq!(tree.leaf_count, 4);
        assert_eq!(tree.busy_leaf_count(), 1);
        assert_eq!(tree.utilization, 0.25);

        let busy = tree.leaves.iter().find(|leaf| leaf.is_busy()).unwrap();
        assert_eq!(busy.path, vec!["1", "1", "1", "1.1"]);
        assert_eq!(busy.records[0].occupant, "alice");
        assert_eq!(busy.records[0].execute_host, "h1");
        assert_eq!(busy.records[0].attributes["design"], "designA");
    }

    #[test]
    fn test_palladium_missing_header_yields_empty_tree() {
        let parser = OccupancyParser::new(HardwareKind::Palladium);
        let tree = parser.parse(&to_lines("Rack 1 has 2 clusters\n  1.1 alice h1:1 t p d e k\n"));
        assert!(tree.is_empty());
        assert_eq!(tree.utilization, 0.0);
    }

    #[test]
    fn test_palladium_skips_decorative_lines() {
        let dump = format!("*** banner ***\n{}\n=== footer ===\n", PALLADIUM_DUMP);
        let parser = OccupancyParser::new(HardwareKind::Palladium);
        let tree = parser.parse(&to_lines(&dump));
        assert_eq!(tree.leaf_count, 4);
    }

    const PROTIUM_DUMP: &str = "\
host1 up 10001 192.168.1.5 (ok) (11) extra
  FPGA A1 | bob:h2:777 @ 2024-02-21
  FPGA A2 |
host2 up 10002 192.168.1.6 (ok) (12) extra
  FPGA B1 |
";

    #[test]
    fn test_protium_parse_multi_user_boards() {
        let parser = OccupancyParser::new(HardwareKind::Protium);
        let tree = parser.parse(&to_lines(PROTIUM_DUMP));

        assert_eq!(tree.leaf_count, 2);
        assert_eq!(tree.busy_leaf_count(), 1);
        assert_eq!(tree.utilization, 0.5);

        let board11 = tree.leaves.iter().find(|leaf| leaf.path == ["11"]).unwrap();
        assert_eq!(board11.records.len(), 1);
        assert_eq!(board11.records[0].occupant, "bob");
        assert_eq!(board11.records[0].execute_host, "h2");
        assert_eq!(board11.records[0].attributes["fpga"], "A1");
    }

    #[test]
    fn test_protium_boards_keep_identity_fields() {
        let parser = OccupancyParser::new(HardwareKind::Protium);
        let tree = parser.parse(&to_lines(PROTIUM_DUMP));

        let board11 = tree.leaves.iter().find(|leaf| leaf.path == ["11"]).unwrap();
        assert_eq!(board11.attributes["board_uuid"], "10001");
        assert_eq!(board11.attributes["board_ip"], "192.168.1.5");

        let board12 = tree.leaves.iter().find(|leaf| leaf.path == ["12"]).unwrap();
        assert_eq!(board12.attributes["board_ip"], "192.168.1.6");
    }

    const ZEBU_DUMP: &str = "\
U0.M0.S0  online  job1  carol  h3  999  no
U0.M0.S1  free
U0.M1.S0  online  job2  dave   h4  888
";

    #[test]
    fn test_zebu_parse_row_variants() {
        let parser = OccupancyParser::new(HardwareKind::Zebu);
        let tree = parser.parse(&to_lines(ZEBU_DUMP));

        assert_eq!(tree.leaf_count, 3);
        assert_eq!(tree.busy_leaf_count(), 2);
        assert_eq!(tree.utilization, 0.67);
        assert_eq!(tree.level_values[0], vec!["U0"]);
        assert_eq!(tree.level_values[1], vec!["M0", "M1"]);

        let seven = &tree.leaves[0];
        assert_eq!(seven.records[0].occupant, "carol");
        assert_eq!(seven.records[0].attributes["suspend"], "no");

        let six = &tree.leaves[2];
        assert_eq!(six.records[0].occupant, "dave");
        assert_eq!(six.records[0].attributes["suspend"], "None");
    }
}
