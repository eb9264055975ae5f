//! Scheduler configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::util::{Error, Result};

/// Adaptive sampling settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveSamplingConfig {
    pub enabled: bool,
    /// Samples a pixel takes before it may converge.
    pub min_samples: u32,
    /// Relative error below which a pixel counts as converged.
    pub threshold: f32,
}

impl Default for AdaptiveSamplingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_samples: 16,
            threshold: 0.01,
        }
    }
}

/// Tunables of the path tracing scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathTraceConfig {
    /// Capacity of the path state pool.
    pub max_num_paths: usize,
    /// Fraction of capacity below which new work tiles are generated.
    pub regenerate_threshold: f32,
    /// Fraction of capacity below which remaining paths run in the megakernel.
    pub megakernel_threshold: f32,
    /// Allow switching to the megakernel at all.
    pub use_megakernel: bool,
    /// Edge of square work tiles in pixels.
    pub tile_size: usize,
    /// Read back slot phases after every batch and compare with the counters.
    pub check_invariants: bool,
    pub adaptive: AdaptiveSamplingConfig,
}

impl Default for PathTraceConfig {
    fn default() -> Self {
        Self {
            max_num_paths: 1 << 20,
            regenerate_threshold: 0.5,
            megakernel_threshold: 0.1,
            use_megakernel: true,
            tile_size: 64,
            check_invariants: cfg!(debug_assertions),
            adaptive: AdaptiveSamplingConfig::default(),
        }
    }
}

impl PathTraceConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json(&json)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Write as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_num_paths == 0 {
            return Err(Error::config("max_num_paths must be non-zero"));
        }
        if u32::try_from(self.max_num_paths).is_err() {
            return Err(Error::config("max_num_paths must fit 32-bit path indices"));
        }
        if !(0.0..=1.0).contains(&self.regenerate_threshold) {
            return Err(Error::config(format!(
                "regenerate_threshold {} is outside [0, 1]",
                self.regenerate_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.megakernel_threshold) {
            return Err(Error::config(format!(
                "megakernel_threshold {} is outside [0, 1]",
                self.megakernel_threshold
            )));
        }
        if self.tile_size == 0 {
            return Err(Error::config("tile_size must be non-zero"));
        }
        if self.adaptive.enabled && (self.adaptive.threshold.is_nan() || self.adaptive.threshold <= 0.0) {
            return Err(Error::config("adaptive threshold must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PathTraceConfig::default();
        assert_eq!(config.max_num_paths, 1048576);
        assert_eq!(config.regenerate_threshold, 0.5);
        assert_eq!(config.megakernel_threshold, 0.1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = PathTraceConfig::from_json(r#"{ "max_num_paths": 1000, "adaptive": { "enabled": true } }"#).unwrap();
        assert_eq!(config.max_num_paths, 1000);
        assert!(config.adaptive.enabled);
        assert_eq!(config.adaptive.min_samples, 16);
        assert_eq!(config.tile_size, 64);
    }

    #[test]
    fn test_validate_rejects() {
        assert!(PathTraceConfig::from_json(r#"{ "max_num_paths": 0 }"#).is_err());
        assert!(PathTraceConfig::from_json(r#"{ "megakernel_threshold": 1.5 }"#).is_err());
        assert!(matches!(
            PathTraceConfig::from_json("{ not json"),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = PathTraceConfig { max_num_paths: 4096, ..Default::default() };
        config.save(&path).unwrap();
        assert_eq!(PathTraceConfig::load(&path).unwrap(), config);
    }
}
