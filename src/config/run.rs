//! Per-run configuration
//!
//! A single value built once per run (from defaults, a JSON file or CLI
//! flags) and handed to the loader, pipeline, generators and trainer.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::DEFAULT_FEATURE_CHANNELS;
use crate::utils::error::{ConfigError, Result};

/// Run-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Maximum number of training epochs
    pub epochs: usize,
    pub batch_size: usize,
    /// Square input resolution; replaced by the loaded data's width
    pub image_size: usize,
    /// UNet encoder widths, shallowest first
    pub feature_channels: Vec<usize>,
    /// Directory holding the `.npy` splits
    pub data_dir: PathBuf,
    /// File-name prefix of the split arrays
    pub data_prefix: String,
    /// Training curves are written to a timestamped subdirectory
    pub log_dir: PathBuf,
    pub model_dir: PathBuf,
    /// File tracker root; tracking is disabled when unset
    pub tracking_dir: Option<PathBuf>,
    pub shuffle: bool,
    pub seed: u64,
    pub early_stopping_patience: usize,
    /// Training images used to fit ZCA whitening
    pub zca_fit_samples: usize,
    /// Largest components kept as extra channels
    pub connected_components_take: usize,
    pub learning_rate: f64,
    /// Truncate every split to `debug_samples` for quick runs
    pub debug_mode: bool,
    pub debug_samples: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            epochs: 140,
            batch_size: 8,
            image_size: 256,
            feature_channels: DEFAULT_FEATURE_CHANNELS.to_vec(),
            data_dir: PathBuf::from("npy_datasets/cv_data"),
            data_prefix: "cv_".to_string(),
            log_dir: PathBuf::from("logs/fit"),
            model_dir: PathBuf::from("models"),
            tracking_dir: None,
            shuffle: true,
            seed: 1,
            early_stopping_patience: 20,
            zca_fit_samples: 250,
            connected_components_take: 5,
            learning_rate: 1e-3,
            debug_mode: false,
            debug_samples: 16,
        }
    }
}

impl RunConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.epochs == 0 {
            return Err(ConfigError::InvalidRun("epochs must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidRun("batch_size must be at least 1".into()));
        }
        if self.feature_channels.is_empty() || self.feature_channels.contains(&0) {
            return Err(ConfigError::InvalidRun(
                "feature_channels must be a non-empty list of positive widths".into(),
            ));
        }
        if self.early_stopping_patience == 0 {
            return Err(ConfigError::InvalidRun(
                "early_stopping_patience must be at least 1".into(),
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::InvalidRun(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.debug_mode && self.debug_samples == 0 {
            return Err(ConfigError::InvalidRun("debug_samples must be at least 1".into()));
        }
        Ok(())
    }

    /// Run parameters reported to the tracker
    pub fn run_params(&self) -> Vec<(&'static str, serde_json::Value)> {
        vec![
            ("shuffle", serde_json::json!(self.shuffle)),
            ("seed", serde_json::json!(self.seed)),
            ("epochs", serde_json::json!(self.epochs)),
            ("batch_size", serde_json::json!(self.batch_size)),
            ("learning_rate", serde_json::json!(self.learning_rate)),
        ]
    }
}
