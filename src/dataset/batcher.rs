//! Burn Batch Integration
//!
//! Converts NHWC `ndarray` batches into NCHW `burn` tensors, and implements
//! Burn's `Batcher` for per-sample items used when walking a held-out split.

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use ndarray::{s, Array3, Array4, Axis};

use crate::dataset::loader::SplitData;

/// One image with its mask, both HWC
#[derive(Clone, Debug)]
pub struct SegmentationItem {
    pub image: Array3<f32>,
    pub mask: Array3<f32>,
}

impl SegmentationItem {
    /// Items `start..end` of a split
    pub fn range(split: &SplitData, start: usize, end: usize) -> Vec<Self> {
        let end = end.min(split.len());
        (start..end)
            .map(|i| Self {
                image: split.images.index_axis(Axis(0), i).to_owned(),
                mask: split.masks.index_axis(Axis(0), i).to_owned(),
            })
            .collect()
    }
}

/// A batch of images and masks for training
#[derive(Clone, Debug)]
pub struct SegmentationBatch<B: Backend> {
    /// Images with shape [batch_size, channels, height, width]
    pub images: Tensor<B, 4>,
    /// Masks with shape [batch_size, 1, height, width]
    pub masks: Tensor<B, 4>,
}

/// Batcher for segmentation batches
#[derive(Clone, Debug, Default)]
pub struct SegmentationBatcher;

impl SegmentationBatcher {
    pub fn new() -> Self {
        Self
    }

    /// NHWC array to NCHW tensor
    pub fn to_tensor<B: Backend>(&self, array: &Array4<f32>, device: &B::Device) -> Tensor<B, 4> {
        let (n, h, w, c) = array.dim();
        let data: Vec<f32> = array.view().permuted_axes([0, 3, 1, 2]).iter().copied().collect();
        Tensor::<B, 4>::from_floats(TensorData::new(data, [n, c, h, w]), device)
    }

    /// Batch an `(images, masks)` pair from a generator
    pub fn batch_arrays<B: Backend>(
        &self,
        images: &Array4<f32>,
        masks: &Array4<f32>,
        device: &B::Device,
    ) -> SegmentationBatch<B> {
        SegmentationBatch {
            images: self.to_tensor(images, device),
            masks: self.to_tensor(masks, device),
        }
    }
}

/// NCHW tensor back to an NHWC array
pub fn tensor_to_nhwc<B: Backend>(tensor: Tensor<B, 4>) -> Array4<f32> {
    let [n, c, h, w] = tensor.dims();
    let values: Vec<f32> = tensor.into_data().iter::<f32>().collect();
    let mut out = Array4::<f32>::zeros((n, h, w, c));
    for (i, v) in values.into_iter().enumerate() {
        let (b, rest) = (i / (c * h * w), i % (c * h * w));
        let (ch, rest) = (rest / (h * w), rest % (h * w));
        let (y, x) = (rest / w, rest % w);
        out[[b, y, x, ch]] = v;
    }
    out
}

impl<B: Backend> Batcher<B, SegmentationItem, SegmentationBatch<B>> for SegmentationBatcher {
    fn batch(&self, items: Vec<SegmentationItem>, device: &B::Device) -> SegmentationBatch<B> {
        let Some(first) = items.first() else {
            return SegmentationBatch {
                images: Tensor::zeros([0, 1, 1, 1], device),
                masks: Tensor::zeros([0, 1, 1, 1], device),
            };
        };
        let (h, w, c) = first.image.dim();
        let mask_channels = first.mask.dim().2;

        let mut images = Array4::<f32>::zeros((items.len(), h, w, c));
        let mut masks = Array4::<f32>::zeros((items.len(), h, w, mask_channels));
        for (i, item) in items.iter().enumerate() {
            images.slice_mut(s![i, .., .., ..]).assign(&item.image);
            masks.slice_mut(s![i, .., .., ..]).assign(&item.mask);
        }

        self.batch_arrays(&images, &masks, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_nhwc_to_nchw_layout() {
        let device = Default::default();
        let array = Array4::from_shape_fn((2, 3, 4, 2), |(n, y, x, c)| (n * 1000 + c * 100 + y * 10 + x) as f32);
        let tensor: Tensor<TestBackend, 4> = SegmentationBatcher::new().to_tensor(&array, &device);

        assert_eq!(tensor.dims(), [2, 2, 3, 4]);
        let values: Vec<f32> = tensor.clone().into_data().iter::<f32>().collect();
        // [1, 1, 2, 3] in NCHW
        assert_eq!(values[24 + 12 + 2 * 4 + 3], 1123.0);

        let back = tensor_to_nhwc(tensor);
        assert_eq!(back, array);
    }

    #[test]
    fn test_batcher_stacks_items() {
        let device = Default::default();
        let split = SplitData::new(Array4::ones((5, 4, 4, 3)), Array4::zeros((5, 4, 4, 1)));
        let items = SegmentationItem::range(&split, 3, 10);
        assert_eq!(items.len(), 2);

        let batch = Batcher::<TestBackend, _, _>::batch(&SegmentationBatcher::new(), items, &device);
        assert_eq!(batch.images.dims(), [2, 3, 4, 4]);
        assert_eq!(batch.masks.dims(), [2, 1, 4, 4]);
    }
}
