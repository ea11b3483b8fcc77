//! Dataset module for dermoscopic lesion segmentation data
//!
//! This module provides functionality for:
//! - Loading the pre-split `.npy` image and mask arrays
//! - The ordered preprocessing pipeline (blur, histogram equalization,
//!   component channels, normalization, ZCA whitening)
//! - Random affine augmentation shared between images and masks
//! - Unbounded batch generators and the Burn batcher

pub mod augmentation;
pub mod batcher;
pub mod components;
pub mod generator;
pub mod loader;
pub mod preprocess;
pub mod whitening;

// Re-export main types for convenience
pub use augmentation::{AffineTransform, Augmenter};
pub use batcher::{SegmentationBatch, SegmentationBatcher, SegmentationItem};
pub use generator::{ArrayFlow, GeneratorPair, PairedFlow};
pub use loader::{DatasetSplits, DatasetStats, Split, SplitData};
pub use preprocess::{PreprocessOutcome, PreprocessingPipeline};
pub use whitening::ZcaWhitening;
