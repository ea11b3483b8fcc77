//! UNet Architecture for Lesion Segmentation
//!
//! Encoder of double conv blocks separated by 2x2 max-pooling, a decoder of
//! transposed-conv up-sampling with skip concatenation, and a 1x1 head that
//! emits one logit per pixel.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{activation::sigmoid, backend::Backend, Tensor},
};

use crate::utils::error::{Result as SegResult, SegError};

/// Configuration for the UNet model
#[derive(Config, Debug)]
pub struct UNetConfig {
    /// Encoder widths, shallowest first; the last entry is the bottleneck
    pub feature_channels: Vec<usize>,
    /// Square input resolution
    pub image_size: usize,
    /// Image channels after preprocessing
    #[config(default = "3")]
    pub input_channels: usize,
}

impl UNetConfig {
    /// Number of resolution levels, bottleneck included
    pub fn levels(&self) -> usize {
        self.feature_channels.len()
    }

    pub fn validate(&self) -> SegResult<()> {
        if self.feature_channels.is_empty() {
            return Err(SegError::Model("feature_channels must not be empty".into()));
        }
        if let Some(pos) = self.feature_channels.iter().position(|&c| c == 0) {
            return Err(SegError::Model(format!("feature_channels[{}] is zero", pos)));
        }
        if self.input_channels == 0 {
            return Err(SegError::Model("input_channels must be at least 1".into()));
        }
        let factor = 1usize << (self.levels() - 1);
        if self.image_size == 0 || self.image_size % factor != 0 {
            return Err(SegError::Model(format!(
                "image_size {} is not divisible by {} ({} pooling steps)",
                self.image_size,
                factor,
                self.levels() - 1
            )));
        }
        Ok(())
    }

    /// Validate and build the network
    pub fn init<B: Backend>(&self, device: &B::Device) -> SegResult<UNet<B>> {
        self.validate()?;
        Ok(UNet::new(self, device))
    }
}

/// Conv3x3, BatchNorm, ReLU, twice
#[derive(Module, Debug)]
pub struct DoubleConv<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B>,
    pub relu: Relu,
}

impl<B: Backend> DoubleConv<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = |cin: usize| {
            Conv2dConfig::new([cin, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device)
        };

        Self {
            conv1: conv(in_channels),
            bn1: BatchNormConfig::new(out_channels).init(device),
            conv2: conv(out_channels),
            bn2: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.relu.forward(self.bn1.forward(self.conv1.forward(x)));
        self.relu.forward(self.bn2.forward(self.conv2.forward(x)))
    }
}

/// Transposed-conv up-sampling, skip concatenation, double conv
#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    pub up: ConvTranspose2d<B>,
    pub conv: DoubleConv<B>,
}

impl<B: Backend> UpBlock<B> {
    /// `in_channels` from below, `out_channels` at this level (the skip width)
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let up = ConvTranspose2dConfig::new([in_channels, out_channels], [2, 2])
            .with_stride([2, 2])
            .init(device);

        Self {
            up,
            conv: DoubleConv::new(out_channels * 2, out_channels, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.up.forward(x);
        self.conv.forward(Tensor::cat(vec![skip, x], 1))
    }
}

/// UNet producing one logit channel
#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    pub encoder: Vec<DoubleConv<B>>,
    pub pool: MaxPool2d,
    /// Deepest level first
    pub decoder: Vec<UpBlock<B>>,
    pub head: Conv2d<B>,
}

impl<B: Backend> UNet<B> {
    /// Build from an already validated configuration
    pub fn new(config: &UNetConfig, device: &B::Device) -> Self {
        let widths = &config.feature_channels;

        let mut encoder = Vec::with_capacity(widths.len());
        let mut in_channels = config.input_channels;
        for &width in widths {
            encoder.push(DoubleConv::new(in_channels, width, device));
            in_channels = width;
        }

        // 512 -> 256, 256 -> 128, ...
        let decoder = widths
            .windows(2)
            .rev()
            .map(|pair| UpBlock::new(pair[1], pair[0], device))
            .collect();

        let head = Conv2dConfig::new([widths[0], 1], [1, 1]).init(device);

        Self {
            encoder,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            decoder,
            head,
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape [batch_size, channels, height, width]
    ///
    /// # Returns
    /// * Logits of shape [batch_size, 1, height, width]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let last = self.encoder.len() - 1;
        let mut skips = Vec::with_capacity(last);
        let mut x = x;

        for (level, block) in self.encoder.iter().enumerate() {
            x = block.forward(x);
            if level < last {
                skips.push(x.clone());
                x = self.pool.forward(x);
            }
        }

        for up in &self.decoder {
            // one skip per decoder block
            if let Some(skip) = skips.pop() {
                x = up.forward(x, skip);
            }
        }

        self.head.forward(x)
    }

    /// Per-pixel foreground probabilities
    pub fn forward_probabilities(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        sigmoid(self.forward(x))
    }

    pub fn levels(&self) -> usize {
        self.encoder.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_output_shape_matches_input_resolution() {
        let device = Default::default();
        let config = UNetConfig::new(vec![4, 8, 16], 16).with_input_channels(3);
        let model: UNet<TestBackend> = config.init(&device).unwrap();
        assert_eq!(model.levels(), 3);

        let input = Tensor::<TestBackend, 4>::zeros([2, 3, 16, 16], &device);
        let output = model.forward(input);
        assert_eq!(output.dims(), [2, 1, 16, 16]);
    }

    #[test]
    fn test_single_level_network() {
        let device = Default::default();
        let model: UNet<TestBackend> = UNetConfig::new(vec![4], 5)
            .with_input_channels(8)
            .init(&device)
            .unwrap();
        let output = model.forward(Tensor::zeros([1, 8, 5, 5], &device));
        assert_eq!(output.dims(), [1, 1, 5, 5]);
    }

    #[test]
    fn test_probabilities_are_in_unit_interval() {
        let device = Default::default();
        let model: UNet<TestBackend> = UNetConfig::new(vec![2, 4], 8).init(&device).unwrap();
        let input = Tensor::<TestBackend, 4>::ones([1, 3, 8, 8], &device);
        let probs: Vec<f32> = model.forward_probabilities(input).into_data().iter::<f32>().collect();

        assert_eq!(probs.len(), 64);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        assert!(UNetConfig::new(vec![], 256).validate().is_err());
        assert!(UNetConfig::new(vec![8, 0], 256).validate().is_err());
        // four pooling steps need a multiple of 16
        assert!(UNetConfig::new(vec![8, 16, 32, 64, 128], 200).validate().is_err());
        assert!(UNetConfig::new(vec![8, 16, 32, 64, 128], 192).validate().is_ok());
        assert!(UNetConfig::new(vec![8], 256).with_input_channels(0).validate().is_err());
    }
}
