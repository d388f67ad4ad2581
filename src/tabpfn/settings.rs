//! Settings module for run-wide configuration that does not belong to a
//! single training config: filesystem locations, the distributed topology
//! and test toggles.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// Root directory that holds dataset bundles.
    pub data_path: PathBuf,

    /// Directory receiving epoch logs, prefixes, checkpoints and summaries.
    pub save_path: PathBuf,

}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data"),
            save_path: PathBuf::from("runs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedSettings {
    /// Rank of this process. Rank 0 logs and returns results.
    pub rank: usize,

    /// Number of participating processes.
    pub world_size: usize,
}

impl Default for DistributedSettings {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TestingSettings {
    /// Running in continuous integration: training runs are shrunk to a
    /// smoke test.
    pub ci: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub paths: PathSettings,

    pub distributed: DistributedSettings,

    /// Testing/Development settings
    pub testing: TestingSettings,
}

impl Settings {
    /// Create a new Settings instance from environment variables and config files.
    /// Environment variables are prefixed with "TABPFN" and nested with "__",
    /// e.g. `TABPFN__PATHS__SAVE_PATH`.
    pub fn new() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .set_default("paths.data_path", "data")?
            .set_default("paths.save_path", "runs")?
            .set_default("distributed.rank", 0)?
            .set_default("distributed.world_size", 1)?
            .set_default("testing.ci", false)?
            // Add configuration from .env file if it exists
            .add_source(File::with_name(".env").required(false))
            .add_source(Environment::with_prefix("TABPFN").separator("__"))
            .build()?;

        settings.try_deserialize()
    }
}

/// Global settings instance
static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Get the global settings instance, initializing it if necessary.
pub fn settings() -> &'static Settings {
    SETTINGS.get_or_init(|| {
        Settings::new().unwrap_or_else(|err| {
            log::warn!("falling back to default settings: {}", err);
            Settings::default()
        })
    })
}
