//! Shared support code: tracing setup and progress, threshold metrics
//! (Otsu binarization, Jaccard, Dice, ISIC score), error types, SVG
//! training curves and the save-with-retry helper.

pub mod charts;
pub mod error;
pub mod logging;
pub mod metrics;

use std::path::Path;

use tracing::info;

pub use error::{ConfigError, DatasetError, Result, SegError};
pub use logging::{init_logging, LogConfig};
pub use metrics::{BinaryConfusion, MetricAccumulator, RocHistogram, SegmentationReport};

/// Run a save operation, creating the parent directory and retrying once
/// when the first attempt failed because that directory was missing.
///
/// Any other failure, or a failure of the retry, is returned unchanged.
pub fn save_with_retry<F>(path: &Path, mut save: F) -> Result<()>
where
    F: FnMut(&Path) -> Result<()>,
{
    match save(path) {
        Ok(()) => Ok(()),
        Err(err) => {
            let parent = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() && !p.exists() => p,
                _ => return Err(err),
            };
            std::fs::create_dir_all(parent)?;
            info!("Created missing directory {:?}, retrying save", parent);
            save(path)
        }
    }
}

/// Format an array shape as `(a, b, c, d)`
pub fn format_shape(shape: &[usize]) -> String {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    format!("({})", dims.join(", "))
}
