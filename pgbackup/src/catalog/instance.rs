//! Per-instance settings stored as `instance.toml`.

use crate::config::{CompressAlg, Config};
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const INSTANCE_CONFIG_FILE: &str = "instance.toml";

/// TOML integers are signed 64-bit; system identifiers use the full u64
/// range.
mod as_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstanceConfig {
    #[serde(with = "as_string")]
    pub system_identifier: u64,
    pub pgdata: PathBuf,
    pub wal_segment_size: u32,
    pub block_size: u32,
    #[serde(default)]
    pub compress_alg: Option<CompressAlg>,
    #[serde(default)]
    pub compress_level: Option<i32>,
    #[serde(default)]
    pub retention_redundancy: Option<u32>,
    #[serde(default)]
    pub retention_window: Option<u32>,
}

impl InstanceConfig {
    pub fn load(instance_dir: &Path) -> Result<Self> {
        let path = instance_dir.join(INSTANCE_CONFIG_FILE);
        let content =
            std::fs::read_to_string(&path).map_err(|e| EngineError::file("read", &path, e))?;
        toml::from_str(&content).map_err(|e| {
            EngineError::Config(format!("Invalid instance config \"{}\": {}", path.display(), e))
        })
    }

    pub fn save(&self, instance_dir: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("Cannot serialize instance config: {}", e)))?;
        crate::fs::write_atomic(&instance_dir.join(INSTANCE_CONFIG_FILE), content.as_bytes())
    }

    /// Compression for new backups: instance override, then global config.
    pub fn compression(&self, config: &Config) -> (CompressAlg, i32) {
        (
            self.compress_alg.unwrap_or(config.compression.algorithm),
            self.compress_level.unwrap_or(config.compression.level),
        )
    }

    pub fn redundancy(&self, config: &Config) -> Option<u32> {
        self.retention_redundancy.or(config.retention.redundancy)
    }

    pub fn window_days(&self, config: &Config) -> Option<u32> {
        self.retention_window.or(config.retention.window_days)
    }
}
