//! Emulator Usage Library
//!
//! Occupancy accounting for emulator farms (Palladium, Protium and ZeBu
//! hardware). A scheduled sampling run captures each machine's status
//! output, parses it into an occupancy tree, archives the tree, and folds
//! the result into per-day cost ledgers and monthly utilization rollups.
//! Query commands then answer utilization and cost questions over date
//! ranges, optionally restricted to parts of the hardware hierarchy.
//!
//! ## Architecture Overview
//!
//! - [`models`] - The occupancy tree shared by every hardware kind
//! - [`parser`] - Hardware-specific status-text grammars
//! - [`filter`] - Hierarchy and attribute pruning of occupancy trees
//! - [`projects`] - Project attribution configuration and resolution
//! - [`ledger`] - The per-day, per-project cost ledger file
//! - [`store`] - Coarse utilization series and monthly detail rollups
//! - [`history`] - Index over the snapshot archive
//! - [`sampler`] - Orchestration of sampling cycles and rebuilds
//! - [`config`] - Configuration management with environment overrides
//! - [`logging`] - Structured logging setup
//!
//! ## Data Flow
//!
//! Sampling: status command → [`parser::OccupancyParser`] →
//! [`models::OccupancyTree`] → snapshot archive + [`ledger::CostLedger`] +
//! [`store::UtilizationStore`], all driven by [`sampler::Sampler`].
//!
//! Queries: [`history::HistoryIndex`] or the rollup files →
//! [`filter`] → presentation.

pub mod config;
pub mod filter;
pub mod history;
pub mod ledger;
pub mod logging;
pub mod models;
pub mod parser;
pub mod projects;
pub mod sampler;
pub mod store;

pub use models::{HardwareKind, Leaf, OccupancyTree, UsageRecord};
pub use sampler::Sampler;
