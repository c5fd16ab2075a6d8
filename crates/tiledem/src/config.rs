//! YAML configuration.
//!
//! Every field has a default, so an empty document is a valid configuration:
//!
//! ```yaml
//! fetch:
//!   timeout_secs: 12
//!   min_valid_fraction: 0.001
//! scheduler:
//!   max_workers: 8
//! tile_side: 256
//! nodata: -9999.0
//! ```
//!
//! A `catalog:` section replaces the built-in source catalog entirely.

use crate::fetch::FetchPolicy;
use crate::heights::DEFAULT_TILE_SIDE;
use crate::scheduler::SchedulerConfig;
use crate::source::SourceCatalog;
use crate::{DemError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default NODATA value written to output rasters.
pub const DEFAULT_OUTPUT_NODATA: f32 = -9999.0;

/// Pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Provider request and acceptance settings.
    pub fetch: FetchPolicy,
    /// Worker pool settings.
    pub scheduler: SchedulerConfig,
    /// Output tile side length in pixels.
    pub tile_side: usize,
    /// NODATA value for output rasters.
    pub nodata: f32,
    /// Source catalog replacing the built-in one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<SourceCatalog>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fetch: FetchPolicy::default(),
            scheduler: SchedulerConfig::default(),
            tile_side: DEFAULT_TILE_SIDE,
            nodata: DEFAULT_OUTPUT_NODATA,
            catalog: None,
        }
    }
}

impl Config {
    /// Parse and validate a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        // An empty document deserializes to unit, not to an empty map.
        let config: Config = if text.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Load from `path` if given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Check ranges and the catalog.
    pub fn validate(&self) -> Result<()> {
        if self.tile_side == 0 {
            return Err(DemError::InvalidSetting("tile_side must be positive".to_string()));
        }
        if self.scheduler.max_workers == 0 {
            return Err(DemError::InvalidSetting("scheduler.max_workers must be positive".to_string()));
        }
        if self.fetch.timeout_secs == 0 {
            return Err(DemError::InvalidSetting("fetch.timeout_secs must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.fetch.min_valid_fraction) || !(0.0..=1.0).contains(&self.fetch.max_sentinel_ratio) {
            return Err(DemError::InvalidSetting(
                "fetch thresholds must lie in [0, 1]".to_string(),
            ));
        }
        if let Some(catalog) = &self.catalog {
            catalog.validate()?;
        }
        Ok(())
    }

    /// The configured catalog, or the built-in one.
    pub fn catalog(&self) -> SourceCatalog {
        self.catalog.clone().unwrap_or_default()
    }
}
