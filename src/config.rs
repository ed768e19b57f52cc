//! Engine configuration
//!
//! Stage defaults live in per-stage structs; `EngineConfig` groups them and
//! loads from JSON. Missing fields keep their defaults, so a file only lists
//! what it changes:
//!
//! ```json
//! { "scheduler": { "threads": 4 }, "timing": { "cadence": "dv" } }
//! ```
//!
//! The file is found through [`PathConfig`]: `--config` first, then the
//! `FRAMEFORK_CONFIG` environment variable, otherwise built-in defaults.
//! Runtime changes go through `Source::set_option`.

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::audio::Cadence;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "FRAMEFORK_CONFIG";

/// Where the configuration file comes from
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    pub config_file: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI argument → FRAMEFORK_CONFIG → none (defaults)
    pub fn from_env_and_cli(cli_file: Option<PathBuf>) -> Self {
        let config_file = cli_file.or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from));
        Self { config_file }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub queue_size: usize,
    pub image: bool,
    pub sync_propagate: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            queue_size: 50,
            image: false,
            sync_propagate: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NudgerConfig {
    pub queue_size: usize,
    pub timeout_ms: u64,
    /// Reported frame count
    pub length: i32,
}

impl Default for NudgerConfig {
    fn default() -> Self {
        Self {
            queue_size: 50,
            timeout_ms: 5000,
            length: i32::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkConfig {
    /// Number of branches
    pub slots: usize,
    pub queue_size: usize,
    pub image: bool,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            slots: 2,
            queue_size: 50,
            image: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoodooConfig {
    pub queue_size: usize,
}

impl Default for VoodooConfig {
    fn default() -> Self {
        Self { queue_size: 50 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// -1 = three quarters of the cores, 0 = pass-through
    pub threads: i64,
    /// Pass-through cache capacity
    pub queue_size: usize,
    pub timeout_ms: u64,
    /// Payloads realised by workers (1 image, 2 stream, 4 audio)
    pub trigger: i64,
    pub audio_direction: bool,
    pub active: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            threads: -1,
            queue_size: 25,
            timeout_ms: 5000,
            trigger: 3,
            audio_direction: true,
            active: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub cadence: Cadence,
    pub frequency: i32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            cadence: Cadence::default(),
            frequency: 48000,
        }
    }
}

/// Defaults for every stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub lock: LockConfig,
    pub nudger: NudgerConfig,
    pub fork: ForkConfig,
    pub voodoo: VoodooConfig,
    pub scheduler: SchedulerConfig,
    pub timing: TimingConfig,
}

impl EngineConfig {
    /// Parse a JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Configuration named by `paths`, or the defaults
    pub fn resolve(paths: &PathConfig) -> Result<Self> {
        match &paths.config_file {
            Some(path) => Self::load(path),
            None => {
                debug!("No configuration file, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "scheduler": {{ "threads": 4 }}, "timing": {{ "cadence": "dv" }} }}"#).unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.scheduler.threads, 4);
        assert_eq!(config.scheduler.queue_size, 25);
        assert_eq!(config.timing.cadence, Cadence::Dv);
        assert_eq!(config.lock, LockConfig::default());
        assert_eq!(config.nudger.length, i32::MAX);
    }

    #[test]
    fn test_bad_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = EngineConfig::load(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains(&file.path().display().to_string()));

        let missing = file.path().with_extension("missing");
        assert!(EngineConfig::load(&missing).is_err());
    }

    #[test]
    fn test_cli_path_wins_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("framefork.json");
        let mut config = EngineConfig::default();
        config.fork.slots = 3;
        std::fs::write(&path, config.to_json().unwrap()).unwrap();

        let paths = PathConfig::from_env_and_cli(Some(path.clone()));
        assert_eq!(paths.config_file.as_deref(), Some(path.as_path()));
        assert_eq!(EngineConfig::resolve(&paths).unwrap(), config);
        assert_eq!(EngineConfig::resolve(&PathConfig::default()).unwrap(), EngineConfig::default());
    }
}
