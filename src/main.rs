use anyhow::Result;
use chrono::{Duration, Local, NaiveDate};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::collections::BTreeMap;
use std::process;
use tracing::error;

use emu_usage::config::Config;
use emu_usage::filter::{self, LevelPredicates};
use emu_usage::logging::init_logging;
use emu_usage::sampler::Sampler;

#[derive(Parser)]
#[command(name = "emu-usage")]
#[command(about = "Occupancy sampling and cost accounting for emulator farms")]
#[command(version = "0.3.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sampling cycle (or rebuild from the snapshot archive)
    Sample {
        /// Hardware name from the configuration
        #[arg(short = 'H', long)]
        hardware: String,
        /// Rebuild the cost ledger by replaying all archived snapshots
        #[arg(long)]
        reconfig: bool,
        /// Rebuild the monthly detail rollups from the archive
        #[arg(long)]
        detail_reconfig: bool,
    },
    /// Show daily utilization percentages over a date range
    Utilization {
        /// Hardware name from the configuration
        #[arg(short = 'H', long)]
        hardware: String,
        /// Start date (YYYY-MM-DD), default 30 days ago
        #[arg(long)]
        since: Option<String>,
        /// End date (YYYY-MM-DD), default today
        #[arg(long)]
        until: Option<String>,
        /// One bucket per raw sample instead of per day
        #[arg(long)]
        detail: bool,
        /// Restrict to hierarchy values, e.g. --level cluster=1,2 (repeatable)
        #[arg(long = "level", value_name = "NAME=V1,V2")]
        levels: Vec<String>,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Show per-project cost totals over a date range
    Cost {
        /// Hardware name from the configuration, or ALL to sum every entry
        #[arg(short = 'H', long)]
        hardware: String,
        /// Start date (YYYY-MM-DD), default 30 days ago
        #[arg(long)]
        since: Option<String>,
        /// End date (YYYY-MM-DD), default today
        #[arg(long)]
        until: Option<String>,
        /// Restrict to hierarchy values, e.g. --level cluster=1,2 (repeatable)
        #[arg(long = "level", value_name = "NAME=V1,V2")]
        levels: Vec<String>,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    let _log_guard = init_logging(&config.logging, &config.paths.log_directory);

    // An unusable configuration is the one fatal, non-zero-exit case.
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    match cli.command {
        Commands::Sample {
            hardware,
            reconfig,
            detail_reconfig,
        } => {
            if let Err(e) = run_sample(&config, &hardware, reconfig, detail_reconfig) {
                handle_error(e, false);
            }
        }
        Commands::Utilization {
            hardware,
            since,
            until,
            detail,
            levels,
            json,
        } => {
            if detail && !levels.is_empty() {
                eprintln!("Error: --detail and --level are mutually exclusive");
                process::exit(1);
            }

            let (since, until) = parse_date_range(since, until, json);
            let levels = parse_level_args(&levels, json);

            if let Err(e) = run_utilization(&config, &hardware, since, until, detail, &levels, json)
            {
                handle_error(e, json);
            }
        }
        Commands::Cost {
            hardware,
            since,
            until,
            levels,
            json,
        } => {
            let (since, until) = parse_date_range(since, until, json);
            let levels = parse_level_args(&levels, json);

            if let Err(e) = run_cost(&config, &hardware, since, until, &levels, json) {
                handle_error(e, json);
            }
        }
    }

    Ok(())
}

fn run_sample(config: &Config, hardware: &str, reconfig: bool, detail_reconfig: bool) -> Result<()> {
    let sampler = Sampler::new(config, hardware)?;

    if reconfig {
        sampler.reconfig()?;
    }

    if detail_reconfig {
        sampler.rebuild_detail()?;
    }

    if !reconfig && !detail_reconfig {
        sampler.run(Local::now().naive_local())?;
    }

    Ok(())
}

fn run_utilization(
    config: &Config,
    hardware: &str,
    since: NaiveDate,
    until: NaiveDate,
    detail: bool,
    levels: &LevelPredicates,
    json: bool,
) -> Result<()> {
    let sampler = Sampler::new(config, hardware)?;
    let kind = config.hardware(hardware)?.kind;

    let buckets = if levels.is_empty() {
        // Unfiltered queries answer from the coarse series; --detail keeps
        // one bucket per raw sample.
        sampler.store().query_coarse(since, until, detail)?
    } else {
        sampler
            .store()
            .query_detail(since, until, |path| filter::path_matches(kind, levels, path))?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&buckets)?);
        return Ok(());
    }

    println!("{:<17} {:>8}", "DATE".bold(), "UTIL(%)".bold());

    for (key, percent) in &buckets {
        println!("{:<17} {:>8.2}", key, percent);
    }

    Ok(())
}

fn run_cost(
    config: &Config,
    hardware: &str,
    since: NaiveDate,
    until: NaiveDate,
    levels: &LevelPredicates,
    json: bool,
) -> Result<()> {
    // ALL sums the ledgers of every configured entry; hierarchy filters
    // cannot span hardware kinds with different level names.
    if hardware == filter::ALL {
        if !levels.is_empty() {
            eprintln!("Error: --level cannot be combined with -H ALL");
            process::exit(1);
        }

        let mut totals: BTreeMap<String, f64> = BTreeMap::new();

        for name in config.hardware.keys() {
            let sampler = Sampler::new(config, name)?;

            for (project, count) in sampler.ledger().query(since, until)? {
                *totals.entry(project).or_insert(0.0) += count;
            }
        }

        return print_cost(&totals, &BTreeMap::new(), json);
    }

    let sampler = Sampler::new(config, hardware)?;
    let kind = config.hardware(hardware)?.kind;

    let totals = if levels.is_empty() {
        sampler.ledger().query(since, until)?
    } else {
        sampler
            .store()
            .query_cost_detail(since, until, |path| filter::path_matches(kind, levels, path))?
    };

    print_cost(&totals, sampler.default_rates(), json)
}

fn print_cost(
    totals: &BTreeMap<String, f64>,
    rates: &BTreeMap<String, f64>,
    json: bool,
) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(totals)?);
        return Ok(());
    }

    println!(
        "{:<20} {:>12} {:>10}",
        "PROJECT".bold(),
        "USAGE".bold(),
        "RATE(%)".bold()
    );

    for (project, count) in totals {
        match rates.get(project) {
            Some(rate) => println!("{:<20} {:>12.2} {:>10.2}", project, count, rate),
            None => println!("{:<20} {:>12.2} {:>10}", project, count, "-"),
        }
    }

    Ok(())
}

fn parse_date_range(
    since: Option<String>,
    until: Option<String>,
    json: bool,
) -> (NaiveDate, NaiveDate) {
    let today = Local::now().date_naive();

    let until = match until {
        Some(text) => match NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
            Ok(date) => date,
            Err(_) => {
                if !json {
                    eprintln!("Invalid until date format: {}. Use YYYY-MM-DD", text);
                }
                process::exit(1);
            }
        },
        None => today,
    };

    let since = match since {
        Some(text) => match NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
            Ok(date) => date,
            Err(_) => {
                if !json {
                    eprintln!("Invalid since date format: {}. Use YYYY-MM-DD", text);
                }
                process::exit(1);
            }
        },
        None => until - Duration::days(30),
    };

    if since > until {
        eprintln!("Invalid date range: {} is after {}", since, until);
        process::exit(1);
    }

    (since, until)
}

/// Parse repeatable `--level name=v1,v2` arguments into level predicates.
fn parse_level_args(args: &[String], json: bool) -> LevelPredicates {
    let mut levels = LevelPredicates::new();

    for arg in args {
        let Some((name, values)) = arg.split_once('=') else {
            if !json {
                eprintln!("Invalid --level argument: {}. Use name=v1,v2", arg);
            }
            process::exit(1);
        };

        let values: Vec<String> = values
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect();

        levels.insert(name.trim().to_string(), values);
    }

    levels
}

/// Runtime failures degrade gracefully: report, but exit zero so one bad
/// cycle never breaks a cron schedule. Only an unusable configuration (no
/// hardware at all) exits non-zero, handled in `main`.
fn handle_error(e: anyhow::Error, json: bool) {
    error!(error = %e, "command failed");

    if json {
        println!("{}", error_json(&e));
    } else {
        eprintln!("Error: {}", e);
    }
}

fn error_json(e: &anyhow::Error) -> String {
    serde_json::json!({ "error": e.to_string() }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_args() {
        let levels = parse_level_args(
            &["cluster=1,2".to_string(), "domain=1.1".to_string()],
            false,
        );

        assert_eq!(levels["cluster"], vec!["1", "2"]);
        assert_eq!(levels["domain"], vec!["1.1"]);
    }

    #[test]
    fn test_error_json_escapes_quotes() {
        let e = anyhow::anyhow!("unknown hardware \"EMU99\"");
        let rendered = error_json(&e);

        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["error"], "unknown hardware \"EMU99\"");
    }

    #[test]
    fn test_parse_date_range_defaults() {
        let (since, until) = parse_date_range(None, Some("2024-03-15".to_string()), false);
        assert_eq!(until, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
        assert_eq!(since, until - Duration::days(30));
    }
}
