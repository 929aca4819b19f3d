//! Project attribution
//!
//! Loads the project list, default cost rates, and the per-factor proportion
//! tables, and resolves a busy usage record to weighted project shares.
//!
//! ## Configuration files
//!
//! - project list: one `name [default_rate]` per line, `#` comments and
//!   blank lines ignored. Rates are fractions (`0.6` means 60%).
//! - proportion files (one per factor): `value : project` for a full
//!   attribution, or `value : proj1(0.3) proj2(0.7)` for a split. Weights
//!   for one value must sum to exactly 1.0 or the entry is dropped with a
//!   warning; nothing is silently renormalized.
//!
//! ## Resolution
//!
//! Factors form a priority list, not a blend: the first factor whose value
//! has a non-empty table entry wins outright. When no factor matches the
//! resolver returns an empty map and the caller credits the `others` bucket.

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::warn;

/// Catch-all project credited with unattributable busy units.
pub const OTHERS: &str = "others";

/// Attribution factors, in the order the config may prioritize them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Factor {
    User,
    ExecuteHost,
    SubmitHost,
}

impl fmt::Display for Factor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Factor::User => "user",
            Factor::ExecuteHost => "execute_host",
            Factor::SubmitHost => "submit_host",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Factor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Factor::User),
            "execute_host" => Ok(Factor::ExecuteHost),
            "submit_host" => Ok(Factor::SubmitHost),
            other => anyhow::bail!(
                "\"{}\": invalid project_primary_factors setting on config file",
                other
            ),
        }
    }
}

/// Factor values extracted from one usage record.
#[derive(Debug, Clone, Default)]
pub struct FactorValues {
    pub user: String,
    pub execute_host: String,
    pub submit_host: String,
}

impl FactorValues {
    fn get(&self, factor: Factor) -> &str {
        match factor {
            Factor::User => &self.user,
            Factor::ExecuteHost => &self.execute_host,
            Factor::SubmitHost => &self.submit_host,
        }
    }
}

/// `factor value -> project -> weight`, weights summing to 1.0 per value.
pub type ProportionTable = BTreeMap<String, BTreeMap<String, f64>>;

fn comment_or_blank(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

/// Parse the project list file into the ordered project list plus the raw
/// default rates (as percent) found alongside the names.
pub fn parse_project_list_file(path: &Path) -> Result<(Vec<String>, BTreeMap<String, f64>)> {
    let mut projects = Vec::new();
    let mut default_rates = BTreeMap::new();

    if !path.exists() {
        return Ok((projects, default_rates));
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read project list file: {}", path.display()))?;

    for line in content.lines() {
        if comment_or_blank(line) {
            continue;
        }

        let mut fields = line.split_whitespace();
        let Some(project) = fields.next() else {
            continue;
        };

        if !projects.iter().any(|existing| existing == project) {
            projects.push(project.to_string());
        }

        if let Some(rate_text) = fields.next() {
            match rate_text.parse::<f64>() {
                Ok(rate) => {
                    let percent = crate::models::round2(rate * 100.0);

                    if let Some(existing) = default_rates.get(project) {
                        if (existing - percent).abs() > f64::EPSILON {
                            warn!(
                                project,
                                "project cost rate defined repeatedly with different values, \
                                 keeping the first definition"
                            );
                        }
                    } else {
                        default_rates.insert(project.to_string(), percent);
                    }
                }
                Err(_) => {
                    warn!(line, "could not recognize project default cost rate, using 0");
                    default_rates.entry(project.to_string()).or_insert(0.0);
                }
            }
        }
    }

    if projects.is_empty() {
        warn!(path = %path.display(), "could not find any valid project information");
    }

    Ok((projects, default_rates))
}

/// Validate and if necessary replace the default rates so they cover every
/// project and sum to exactly 100.
///
/// Defaults that do not sum to 100 (or do not cover all projects when some
/// were given) are replaced wholesale with an equal split, the rounding
/// remainder pushed onto the last project so the total stays exact. The
/// correction is logged, never silent.
pub fn normalize_default_rates(
    projects: &[String],
    raw: BTreeMap<String, f64>,
) -> BTreeMap<String, f64> {
    if projects.is_empty() {
        return BTreeMap::new();
    }

    let total: f64 = raw.values().sum();
    let covers_all = projects.iter().all(|project| raw.contains_key(project));

    if (total - 100.0).abs() < 1e-9 {
        if covers_all {
            return raw;
        }

        // Sum is fine, coverage is not: uncovered projects default to 0.
        warn!("not every project has a default cost rate, uncovered projects get 0");
        let mut rates = raw;

        for project in projects {
            rates.entry(project.clone()).or_insert(0.0);
        }

        return rates;
    }

    if raw.is_empty() {
        warn!("no project default cost rates set, expenses will be amortized equally");
    } else {
        warn!(total, "total default project rate is not 100, replacing with an equal split");
    }

    let share = crate::models::round2(100.0 / projects.len() as f64);
    let mut rates: BTreeMap<String, f64> = projects
        .iter()
        .map(|project| (project.clone(), share))
        .collect();

    let assigned: f64 = share * (projects.len() as f64 - 1.0);
    let last = projects
        .last()
        .expect("projects is non-empty")
        .clone();
    rates.insert(last, crate::models::round2(100.0 - assigned));

    rates
}

fn split_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\S+)\((0\.\d+)\)$").expect("hardcoded pattern"))
}

/// Parse one proportion file (`value : project(weight) ...` lines).
///
/// Per-value weights must sum to exactly 1.0; invalid lines and repeated
/// values are dropped with a warning.
pub fn parse_project_proportion_file(path: &Path) -> Result<ProportionTable> {
    let mut table = ProportionTable::new();

    if !path.exists() {
        return Ok(table);
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read proportion file: {}", path.display()))?;

    for line in content.lines() {
        if comment_or_blank(line) {
            continue;
        }

        let Some((value, projects_text)) = line.split_once(':') else {
            warn!(file = %path.display(), line, "invalid line on proportion file, ignore");
            continue;
        };

        let value = value.trim();
        let projects_text = projects_text.trim();

        if value.is_empty() || value.contains(char::is_whitespace) || projects_text.is_empty() {
            warn!(file = %path.display(), line, "invalid line on proportion file, ignore");
            continue;
        }

        if table.contains_key(value) {
            warn!(file = %path.display(), value, "repeated item on proportion file, ignore");
            continue;
        }

        let fields: Vec<&str> = projects_text.split_whitespace().collect();

        // Bare `value : project` means the whole unit goes to one project.
        if fields.len() == 1 && !fields[0].contains('(') {
            let mut weights = BTreeMap::new();
            weights.insert(fields[0].to_string(), 1.0);
            table.insert(value.to_string(), weights);
            continue;
        }

        let mut weights = BTreeMap::new();
        let mut valid = true;

        for field in &fields {
            match split_pattern().captures(field) {
                Some(caps) => {
                    let project = caps[1].to_string();
                    let weight: f64 = caps[2].parse().unwrap_or(0.0);

                    if weights.insert(project, weight).is_some() {
                        valid = false;
                        break;
                    }
                }
                None => {
                    valid = false;
                    break;
                }
            }
        }

        if !valid {
            warn!(file = %path.display(), line, "invalid line on proportion file, ignore");
            continue;
        }

        let sum: f64 = weights.values().sum();

        if (sum - 1.0).abs() < 1e-9 {
            table.insert(value.to_string(), weights);
        } else {
            warn!(
                file = %path.display(),
                line,
                sum,
                "proportions do not sum to 1.0, ignore"
            );
        }
    }

    Ok(table)
}

/// Resolves `(user, execute_host, submit_host)` to weighted project shares
/// through the configured priority list of factors.
#[derive(Debug, Clone, Default)]
pub struct ProjectResolver {
    factors: Vec<Factor>,
    tables: BTreeMap<Factor, ProportionTable>,
}

impl ProjectResolver {
    pub fn new(factors: Vec<Factor>, tables: BTreeMap<Factor, ProportionTable>) -> Self {
        Self { factors, tables }
    }

    /// Parse a `project_primary_factors` string (`"user execute_host"`) and
    /// pair it with the loaded tables.
    pub fn from_config(
        primary_factors: &str,
        tables: BTreeMap<Factor, ProportionTable>,
    ) -> Result<Self> {
        let factors = primary_factors
            .split_whitespace()
            .map(Factor::from_str)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(factors, tables))
    }

    /// First factor whose value has a non-empty table entry wins; its share
    /// map is returned as-is. An empty map means "unattributed" and the
    /// caller decides what bucket that lands in.
    pub fn resolve(&self, values: &FactorValues) -> BTreeMap<String, f64> {
        for factor in &self.factors {
            let value = values.get(*factor);

            if let Some(table) = self.tables.get(factor) {
                if let Some(shares) = table.get(value) {
                    if !shares.is_empty() {
                        return shares.clone();
                    }
                }
            }
        }

        BTreeMap::new()
    }
}
