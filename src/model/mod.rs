//! Model module for segmentation architectures using the Burn framework
//!
//! The network is a UNet: its depth follows the configured feature channel
//! list and its input width follows the preprocessing outcome (extra
//! connected-component channels widen the first convolution).

pub mod unet;

// Re-export main types for convenience
pub use unet::{DoubleConv, UNet, UNetConfig, UpBlock};

/// Default encoder widths, shallowest first
pub const DEFAULT_FEATURE_CHANNELS: [usize; 5] = [32, 64, 128, 256, 512];
