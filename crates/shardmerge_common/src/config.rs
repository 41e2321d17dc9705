use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Maximum decimal scale a Datum::Decimal can represent meaningfully.
const MAX_DECIMAL_SCALE: u8 = 38;

/// Merge engine configuration (the `[merge]` table of shardmerge.toml, or a
/// standalone file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Worker threads for the memory strategy's map phase.
    /// 0 = available parallelism. Always capped at the shard count.
    pub map_workers: usize,
    /// Where NULL sorts relative to non-null values in ORDER BY.
    pub null_ordering: NullOrdering,
    /// Maximum group states / rows the memory strategy may buffer.
    /// Exceeding this fails the merge with a transient error. 0 = unlimited.
    pub max_rows_buffered: usize,
    /// Scale of AVG results over DECIMAL sums.
    pub avg_decimal_scale: u8,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            map_workers: 0,
            null_ordering: NullOrdering::Low,
            max_rows_buffered: 1_000_000,
            avg_decimal_scale: 4,
        }
    }
}

/// NULL placement policy for ORDER BY comparisons.
///
/// The policy is stated for ascending order; a descending item reverses it,
/// so under `Low` nulls come first for ASC and last for DESC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NullOrdering {
    /// NULL is the lowest value.
    #[default]
    Low,
    /// NULL is the highest value.
    High,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    merge: Option<MergeConfig>,
}

impl MergeConfig {
    /// Validate value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.avg_decimal_scale > MAX_DECIMAL_SCALE {
            return Err(ConfigError::InvalidConfig(format!(
                "avg_decimal_scale must be <= {}, got {}",
                MAX_DECIMAL_SCALE, self.avg_decimal_scale
            )));
        }
        Ok(())
    }

    /// Effective map-phase pool size for `shard_count` cursors.
    pub fn effective_map_workers(&self, shard_count: usize) -> usize {
        let configured = if self.map_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.map_workers
        };
        configured.min(shard_count).max(1)
    }

    /// Parse a TOML document. Accepts either a bare table of merge keys or a
    /// document with a `[merge]` section.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        let config = match file.merge {
            Some(section) => section,
            None => toml::from_str::<MergeConfig>(content)
                .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, falling back to defaults when the file is missing or
    /// unparsable.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => match Self::from_toml_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded merge config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse merge config {}: {}, using defaults",
                        path.display(),
                        e
                    );
                    MergeConfig::default()
                }
            },
            Err(_) => {
                tracing::info!("Merge config {} not found, using defaults", path.display());
                MergeConfig::default()
            }
        }
    }
}
