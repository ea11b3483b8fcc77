//! Training module for UNet segmentation
//!
//! This module provides:
//! - The model wrapper: fit with early stopping, evaluate, predict, save/load
//! - The end-to-end session that wires data, preprocessing, generators,
//!   model and tracking together

pub mod session;
pub mod trainer;

// Re-export main types for convenience
pub use session::{SessionReport, TrainingSession};
pub use trainer::{
    binary_cross_entropy_with_logits, EarlyStopping, EpochRecord, History, PixelStats, StopDecision,
    Trainer,
};
