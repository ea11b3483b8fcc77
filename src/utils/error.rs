//! Error types
//!
//! `SegError` is what library operations return; config and dataset
//! problems keep their own enums so callers can match on them.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for segmentation training and evaluation
#[derive(Error, Debug)]
pub enum SegError {
    /// Parameter resolution or run configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Dataset loading or validation error
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    /// Bad architecture or unreadable/unwritable weights
    #[error("UNet model: {0}")]
    Model(String),

    /// Fit loop problems such as zero steps or an exhausted generator
    #[error("Training failed: {0}")]
    Training(String),

    /// Error while computing evaluation metrics
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// Experiment tracking error
    #[error("Tracking error: {0}")]
    Tracking(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Arrays that a transform cannot handle
    #[error("Invalid array input: {0}")]
    InvalidInput(String),
}

/// Errors raised while resolving preprocessing and augmentation parameters
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Key is not a recognised option (strict mode only)
    #[error("Unknown {section} option '{key}'")]
    UnknownOption { section: &'static str, key: String },

    /// Known key with a value of the wrong type or out of range
    #[error("Invalid value for {section} option '{key}': {reason}")]
    InvalidValue {
        section: &'static str,
        key: String,
        reason: String,
    },

    /// Run configuration that cannot be used
    #[error("Invalid run configuration: {0}")]
    InvalidRun(String),
}

/// Errors raised while reading or validating the persisted dataset
#[derive(Error, Debug)]
pub enum DatasetError {
    /// A split array file is missing
    #[error("Dataset file not found: {0}")]
    MissingFile(PathBuf),

    /// The array file could not be decoded
    #[error("Failed to read array '{path}': {reason}")]
    Read { path: PathBuf, reason: String },

    /// Array has an unexpected number of dimensions
    #[error("Array '{name}' must be 4-D (batch, height, width, channels), got shape {shape:?}")]
    Rank { name: String, shape: Vec<usize> },

    /// Two arrays disagree on one dimension
    #[error("Shape mismatch in {split} split ({dimension}): expected {expected}, found {found}")]
    ShapeMismatch {
        split: String,
        dimension: &'static str,
        expected: usize,
        found: usize,
    },

    /// Images must be square for the UNet input size
    #[error("Images in the {split} split must be square, got {height}x{width}")]
    NotSquare {
        split: String,
        height: usize,
        width: usize,
    },

    /// A split contains no samples
    #[error("The {0} split is empty")]
    EmptySplit(String),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, SegError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_names_split_and_dimension() {
        let err = DatasetError::ShapeMismatch {
            split: "val".to_string(),
            dimension: "height",
            expected: 256,
            found: 128,
        };
        let msg = err.to_string();
        assert!(msg.contains("val"));
        assert!(msg.contains("height"));
        assert!(msg.contains("256"));
    }

    #[test]
    fn test_config_error_wraps_transparently() {
        let err: SegError = ConfigError::UnknownOption {
            section: "preprocessing",
            key: "foo".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "Unknown preprocessing option 'foo'");
    }
}
