//! # dermaseg
//!
//! UNet lesion segmentation for dermoscopic images, trained with the Burn
//! framework on pre-split `.npy` image/mask arrays.
//!
//! ## Modules
//!
//! - `config`: run configuration and the preprocessing/augmentation parameter resolver
//! - `dataset`: split loading, the preprocessing pipeline, augmentation and batch generators
//! - `model`: the UNet architecture
//! - `training`: the model wrapper (fit, evaluate, predict, save) and the end-to-end session
//! - `tracking`: experiment tracking adapters
//! - `utils`: logging, threshold metrics, charts and error types
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dermaseg::backend::{default_device, TrainingBackend};
//! use dermaseg::config::{ParamOverrides, ParamResolver, RunConfig};
//! use dermaseg::tracking::NoopTracker;
//! use dermaseg::training::TrainingSession;
//!
//! let params = ParamResolver::new().resolve(&ParamOverrides::new(), &ParamOverrides::new())?;
//! let mut tracker = NoopTracker;
//! let mut session = TrainingSession::new(RunConfig::default(), params, &mut tracker);
//! let report = session.execute::<TrainingBackend>("unet", &default_device())?;
//! println!("{:?}", report.test_metrics);
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod model;
pub mod tracking;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use config::{ParamResolver, ResolvedParams, RunConfig};
pub use dataset::{DatasetSplits, GeneratorPair, PreprocessingPipeline, SplitData};
pub use model::{UNet, UNetConfig};
pub use tracking::{ExperimentTracker, FileTracker, NoopTracker};
pub use training::{History, Trainer, TrainingSession};
pub use utils::error::{Result, SegError};
pub use utils::metrics::{evaluate_predictions, MetricAccumulator, SegmentationReport};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
