//! Configuration management for the backup engine.
//!
//! Loads configuration from an optional TOML file with environment variable
//! overrides (`PGBACKUP__<SECTION>__<KEY>`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub backup: BackupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Number of file copy / validation workers
    #[serde(default = "default_threads")]
    pub threads: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressAlg {
    None,
    Zstd,
}

impl CompressAlg {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressAlg::None => "none",
            CompressAlg::Zstd => "zstd",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "none" => Some(CompressAlg::None),
            "zstd" => Some(CompressAlg::Zstd),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Compression algorithm for backup files (none, zstd)
    #[serde(default = "default_compress_alg")]
    pub algorithm: CompressAlg,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compress_level")]
    pub level: i32,

    /// Compress segments pushed into the WAL archive
    #[serde(default)]
    pub archive_wal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// How long to wait for a WAL segment to reach the archive
    #[serde(default = "default_archive_timeout")]
    pub archive_timeout_secs: u64,

    /// How long to wait for WAL to show up in the source pg_wal
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Number of FULL chains to keep
    #[serde(default)]
    pub redundancy: Option<u32>,

    /// Keep backups needed to recover to any point in the last N days
    #[serde(default)]
    pub window_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Validate a backup right after it finishes
    #[serde(default = "default_validate_after_backup")]
    pub validate_after_backup: bool,
}

// Default values
fn default_log_level() -> String {
    "info".to_string()
}

fn default_threads() -> usize {
    4
}

fn default_compress_alg() -> CompressAlg {
    CompressAlg::None
}

fn default_compress_level() -> i32 {
    3
}

fn default_archive_timeout() -> u64 {
    300
}

fn default_stream_timeout() -> u64 {
    60
}

fn default_validate_after_backup() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: default_compress_alg(),
            level: default_compress_level(),
            archive_wal: false,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            archive_timeout_secs: default_archive_timeout(),
            stream_timeout_secs: default_stream_timeout(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            validate_after_backup: default_validate_after_backup(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log: LogConfig::default(),
            performance: PerformanceConfig::default(),
            compression: CompressionConfig::default(),
            timeouts: TimeoutConfig::default(),
            retention: RetentionConfig::default(),
            backup: BackupConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("PGBACKUP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        let config: Config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn archive_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.archive_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.stream_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.performance.threads, 4);
        assert_eq!(config.compression.algorithm, CompressAlg::None);
        assert!(config.backup.validate_after_backup);
        assert_eq!(config.archive_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml(
            r#"
            [compression]
            algorithm = "zstd"

            [retention]
            redundancy = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.compression.algorithm, CompressAlg::Zstd);
        assert_eq!(config.compression.level, 3);
        assert_eq!(config.retention.redundancy, Some(2));
        assert_eq!(config.retention.window_days, None);
        assert_eq!(config.log.level, "info");
    }
}
