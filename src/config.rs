//! Diagnosis policy: imbalance thresholds, masking behavior and the detector
//! id filter applied to topology exports.
//!
//! Stored as TOML on disk; every field is optional:
//! ```toml
//! masked_detectors = "propagate"
//!
//! [thresholds]
//! candidate_err = 0.025
//! gross_err = 0.05
//! neighbor_min_err = 0.01
//! collapse_ratio = 0.15
//! min_observed_pct = 50.0
//!
//! [detectors]
//! required_prefix = "7"
//! excluded_prefixes = ["7131"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::error::{BalanceError, Result};
use crate::topology::DetectorId;

/// Environment variable naming the config file when no path is passed explicitly.
pub const CONFIG_ENV: &str = "FLOW_BALANCE_CONFIG";

/// How detectors masked for low observation take part in side totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskedDetectors {
    /// Masked detectors stay in the sum, so their side becomes NaN.
    #[default]
    Propagate,
    /// Masked detectors are dropped from their side before summing.
    Exclude,
}

/// Tunable policy constants of the imbalance heuristic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// FATVs above this ERR are candidates for blame propagation.
    pub candidate_err: f64,
    /// FATVs above this ERR are reported as grossly imbalanced.
    pub gross_err: f64,
    /// Neighbors below this ERR are too clean to share the fault.
    pub neighbor_min_err: f64,
    /// A pairing implicates the shared detector when the combined ERR drops
    /// below this fraction of the candidate's ERR.
    pub collapse_ratio: f64,
    /// Day-mean observed percentage a detector must exceed to be trusted.
    pub min_observed_pct: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            candidate_err: 0.025,
            gross_err: 0.05,
            neighbor_min_err: 0.01,
            collapse_ratio: 0.15,
            min_observed_pct: 50.0,
        }
    }
}

/// Selects the detectors of a topology export that report on the public feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorFilter {
    pub required_prefix: String,
    pub excluded_prefixes: Vec<String>,
}

impl Default for DetectorFilter {
    fn default() -> Self {
        Self {
            required_prefix: "7".to_string(),
            excluded_prefixes: vec!["7131".to_string()],
        }
    }
}

impl DetectorFilter {
    /// Returns the canonical integer id of `external_id`, or `None` when the
    /// detector is not part of the public feed.
    pub fn accept(&self, external_id: &str) -> Option<DetectorId> {
        let id = external_id.trim();
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if !id.starts_with(&self.required_prefix) {
            return None;
        }
        if self.excluded_prefixes.iter().any(|p| id.starts_with(p.as_str())) {
            return None;
        }
        id.parse().ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    pub thresholds: Thresholds,
    pub masked_detectors: MaskedDetectors,
    pub detectors: DetectorFilter,
}

impl BalanceConfig {
    /// Loads the config from a TOML file at `path`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|source| BalanceError::Io {
            path: display.clone(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| BalanceError::Config {
            path: display,
            source,
        })
    }

    /// Loads from an explicit path, then [`CONFIG_ENV`], falling back to defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = path
            .map(str::to_string)
            .or_else(|| std::env::var(CONFIG_ENV).ok());

        match path {
            Some(path) => {
                let config = Self::from_file(&path)?;
                info!(path = %path, masked = ?config.masked_detectors, "Loaded balance config");
                Ok(config)
            }
            None => {
                debug!("No balance config given, using defaults");
                Ok(Self::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_public_feed_ids() {
        let filter = DetectorFilter::default();
        assert_eq!(filter.accept("716943"), Some(716943));
        assert_eq!(filter.accept(" 717001 "), Some(717001));
    }

    #[test]
    fn test_filter_rejects_foreign_ids() {
        let filter = DetectorFilter::default();
        assert_eq!(filter.accept("713100"), None);
        assert_eq!(filter.accept("616943"), None);
        assert_eq!(filter.accept("7A1"), None);
        assert_eq!(filter.accept(""), None);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: BalanceConfig = toml::from_str(
            r#"
            masked_detectors = "exclude"

            [thresholds]
            candidate_err = 0.03
            "#,
        )
        .unwrap();

        assert_eq!(config.masked_detectors, MaskedDetectors::Exclude);
        assert_eq!(config.thresholds.candidate_err, 0.03);
        assert_eq!(config.thresholds.gross_err, 0.05);
        assert_eq!(config.thresholds.collapse_ratio, 0.15);
        assert_eq!(config.detectors, DetectorFilter::default());
    }

    #[test]
    fn test_from_file_missing_is_error() {
        let result = BalanceConfig::from_file("/nonexistent/flow_balance.toml");
        assert!(matches!(result, Err(BalanceError::Io { .. })));
    }

    #[test]
    fn test_load_explicit_path() {
        let path = std::env::temp_dir().join("flow_balance_test_config.toml");
        std::fs::write(&path, "[thresholds]\ngross_err = 0.08\n").unwrap();

        let config = BalanceConfig::load(path.to_str()).unwrap();
        assert_eq!(config.thresholds.gross_err, 0.08);

        std::fs::remove_file(&path).unwrap();
    }
}
