//! Configuration system
//!
//! Provides centralized configuration management with:
//! - Config file loading (TOML, optional)
//! - Environment variable overrides
//! - Runtime defaults
//! - Validation
//!
//! There is deliberately no global instance: the struct is built once in
//! `main` and passed by reference into every component, so nothing reads
//! ambient state.

use crate::models::HardwareKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Paths configuration
    pub paths: PathsConfig,

    /// Sampling/reader tuning
    pub sampling: SamplingConfig,

    /// Monitored hardware, keyed by hardware name (e.g. `Z1`)
    pub hardware: BTreeMap<String, HardwareConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the sampling database (snapshots, ledgers, rollups).
    pub db_path: PathBuf,
    pub log_directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Seconds between mtime probes when a reader suspects a mid-write file.
    pub probe_interval_secs: u64,
    /// Probe pairs attempted before the reader gives up with an error.
    pub max_probes: u32,
}

/// One monitored emulator and how to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    pub kind: HardwareKind,

    /// Emulator identity used in db paths; defaults to the hardware name.
    #[serde(default)]
    pub emulator: String,

    /// Command whose stdout is the raw status text.
    pub status_command: String,

    /// Run `status_command` through `ssh <host>` when set.
    #[serde(default)]
    pub ssh_host: Option<String>,

    /// Project attribution files; missing files mean "no attribution".
    #[serde(default)]
    pub project_list_file: Option<PathBuf>,
    #[serde(default)]
    pub project_user_file: Option<PathBuf>,
    #[serde(default)]
    pub project_execute_host_file: Option<PathBuf>,
    #[serde(default)]
    pub project_submit_host_file: Option<PathBuf>,

    /// Space-separated attribution priority list, first match wins.
    #[serde(default = "default_primary_factors")]
    pub project_primary_factors: String,
}

fn default_primary_factors() -> String {
    "execute_host user".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            paths: PathsConfig::default(),
            sampling: SamplingConfig::default(),
            hardware: BTreeMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "WARN".to_string(),
            format: "pretty".to_string(),
            output: "console".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            db_path: home.join(".emu-usage").join("db"),
            log_directory: home.join(".emu-usage").join("logs"),
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 1,
            max_probes: 5,
        }
    }
}

impl Config {
    /// Load configuration from file, environment, and defaults
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        let mut config_paths = vec![
            PathBuf::from("emu-usage.toml"),
            PathBuf::from(".emu-usage.toml"),
            dirs::config_dir()
                .map(|d| d.join("emu-usage").join("config.toml"))
                .unwrap_or_default(),
        ];

        if let Ok(val) = env::var("EMU_USAGE_CONFIG") {
            config_paths.insert(0, PathBuf::from(val));
        }

        for path in &config_paths {
            if path.exists() {
                info!(config_file = %path.display(), "Loading configuration from file");
                config = Self::load_from_file(path)?;
                break;
            }
        }

        config.apply_env_overrides();
        config.normalize();

        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.normalize();
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = env::var("LOG_FORMAT") {
            self.logging.format = val;
        }
        if let Ok(val) = env::var("LOG_OUTPUT") {
            self.logging.output = val;
        }

        if let Ok(val) = env::var("EMU_USAGE_DB_PATH") {
            self.paths.db_path = PathBuf::from(val);
        }
        if let Ok(val) = env::var("EMU_USAGE_LOG_DIR") {
            self.paths.log_directory = PathBuf::from(val);
        }
    }

    /// Validate configuration values. An empty hardware table is the one
    /// fatal error: there is nothing the process could do.
    pub fn validate(&self) -> Result<()> {
        if self.hardware.is_empty() {
            return Err(anyhow::anyhow!(
                "No hardware defined in configuration; add a [hardware.<name>] section"
            ));
        }

        for (name, hardware) in &self.hardware {
            if hardware.status_command.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "Hardware '{}' has an empty status_command",
                    name
                ));
            }
        }

        if self.sampling.max_probes == 0 {
            return Err(anyhow::anyhow!("sampling.max_probes must be greater than 0"));
        }

        if !self.paths.log_directory.exists() {
            fs::create_dir_all(&self.paths.log_directory)
                .context("Failed to create log directory")?;
        }

        Ok(())
    }

    /// Look up one hardware entry by name.
    pub fn hardware(&self, name: &str) -> Result<&HardwareConfig> {
        self.hardware.get(name).ok_or_else(|| {
            anyhow::anyhow!(
                "Unknown hardware '{}'; configured: {}",
                name,
                self.hardware.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })
    }

    fn normalize(&mut self) {
        for (name, hardware) in &mut self.hardware {
            if hardware.emulator.is_empty() {
                hardware.emulator = name.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hardware() -> HardwareConfig {
        HardwareConfig {
            kind: HardwareKind::Zebu,
            emulator: "Z1".to_string(),
            status_command: "zrscd_check".to_string(),
            ssh_host: None,
            project_list_file: None,
            project_user_file: None,
            project_execute_host_file: None,
            project_submit_host_file: None,
            project_primary_factors: default_primary_factors(),
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "WARN");
        assert_eq!(config.sampling.probe_interval_secs, 1);
        assert!(config.hardware.is_empty());
    }

    #[test]
    fn test_env_override() {
        env::set_var("EMU_USAGE_DB_PATH", "/tmp/emu-db");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.paths.db_path, PathBuf::from("/tmp/emu-db"));
        env::remove_var("EMU_USAGE_DB_PATH");
    }

    #[test]
    fn test_empty_hardware_is_fatal() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_hardware_section() {
        let toml = r#"
            [hardware.Z1]
            kind = "zebu"
            status_command = "zrscd_check -sysstat"
            ssh_host = "zebu-ctl"

            [hardware.EMU01]
            kind = "palladium"
            status_command = "test_server -status"
        "#;

        let mut config: Config = toml::from_str(toml).unwrap();
        config.normalize();

        assert_eq!(config.hardware["Z1"].kind, HardwareKind::Zebu);
        assert_eq!(config.hardware["Z1"].ssh_host.as_deref(), Some("zebu-ctl"));
        // Emulator name falls back to the hardware name.
        assert_eq!(config.hardware["EMU01"].emulator, "EMU01");
        assert_eq!(
            config.hardware["EMU01"].project_primary_factors,
            "execute_host user"
        );
    }

    #[test]
    fn test_validation_accepts_populated_config() {
        let mut config = Config::default();
        config.paths.log_directory = std::env::temp_dir();
        config.hardware.insert("Z1".to_string(), sample_hardware());
        assert!(config.validate().is_ok());

        config.hardware.get_mut("Z1").unwrap().status_command = " ".to_string();
        assert!(config.validate().is_err());
    }
}
