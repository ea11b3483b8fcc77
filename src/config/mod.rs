//! Configuration Module
//!
//! Strongly typed preprocessing and augmentation options with their
//! defaults, the override resolver, and the per-run configuration value
//! that every component receives at construction.

pub mod params;
pub mod run;

pub use params::{
    AugmentationParams, FillMode, NormalizationMode, ParamOverrides, ParamResolver, ParamValue,
    PreprocessingParams, ResolvedParams,
};
pub use run::RunConfig;
