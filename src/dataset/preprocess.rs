//! Preprocessing Pipeline
//!
//! Applies the enabled steps to all splits in a fixed order:
//!
//! 1. Gaussian blur (images)
//! 2. Histogram equalization (images)
//! 3. Connected-component channels (images, adds channels)
//! 4. Per-channel mean subtraction (training mean, all splits)
//! 5. Global normalization (images and masks)
//! 6. ZCA whitening (fitted on the first training images)
//!
//! Component channels change the channel count, so the pipeline returns the
//! resulting channel count alongside the data.

use image::{ImageBuffer, Luma};
use imageproc::filter::gaussian_blur_f32;
use ndarray::parallel::prelude::*;
use ndarray::{s, Array4, ArrayViewMut2, Axis};
use tracing::info;

use crate::config::{NormalizationMode, PreprocessingParams, RunConfig};
use crate::dataset::components::add_component_channels;
use crate::dataset::loader::{DatasetSplits, Split};
use crate::dataset::whitening::ZcaWhitening;
use crate::utils::error::Result;

/// Bins used by histogram equalization
const HISTOGRAM_BINS: usize = 256;

/// Data after preprocessing plus what the model builder needs from it
#[derive(Debug, Clone)]
pub struct PreprocessOutcome {
    pub splits: DatasetSplits,
    /// Image channels after all steps
    pub input_channels: usize,
    /// Training-split channel mean, when per-channel normalization ran
    pub channel_mean: Option<Vec<f32>>,
    /// Names of the steps that ran, in order
    pub applied: Vec<&'static str>,
}

/// Ordered, flag-gated preprocessing steps
#[derive(Debug, Clone)]
pub struct PreprocessingPipeline {
    params: PreprocessingParams,
    zca_fit_samples: usize,
    components_take: usize,
}

impl PreprocessingPipeline {
    pub fn new(params: &PreprocessingParams, run: &RunConfig) -> Self {
        Self {
            params: params.clone(),
            zca_fit_samples: run.zca_fit_samples,
            components_take: run.connected_components_take,
        }
    }

    pub fn apply(&self, mut splits: DatasetSplits) -> Result<PreprocessOutcome> {
        let p = &self.params;
        let mut applied = Vec::new();
        let mut channel_mean = None;

        if p.gaussian_blur {
            for split in Split::ALL {
                gaussian_blur(&mut splits.split_mut(split).images, p.gaussian_blur_radius);
            }
            info!("Applied gaussian blur on all input images");
            applied.push("gaussian_blur");
        }

        if p.histogram_equalization {
            for split in Split::ALL {
                histogram_equalization(
                    &mut splits.split_mut(split).images,
                    p.histogram_cutoff_percentage,
                );
            }
            info!("Applied histogram equalization on all input images");
            applied.push("histogram_equalization");
        }

        if p.connected_components {
            for split in Split::ALL {
                let data = splits.split_mut(split);
                data.images = add_component_channels(&data.images, self.components_take);
            }
            info!(
                "Added {} connected component channels ({} channels total)",
                self.components_take,
                splits.input_channels()
            );
            applied.push("connected_components");
        }

        if p.per_channel_normalization {
            let mean = channel_mean_of(&splits.train.images);
            for split in Split::ALL {
                subtract_channel_mean(&mut splits.split_mut(split).images, &mean);
            }
            info!("Normalized per channel, mean {:?}", mean);
            channel_mean = Some(mean);
            applied.push("per_channel_normalization");
        }

        if p.normalization {
            for split in Split::ALL {
                let data = splits.split_mut(split);
                normalize_images(&mut data.images, p.normalization_mode);
                scale_masks(&mut data.masks);
            }
            info!("Applied {:?} normalization", p.normalization_mode);
            applied.push("normalization");
        }

        if p.zca_whitening {
            let fit_samples = self.zca_fit_samples.min(splits.train.len()).max(1);
            info!("ZCA fit on {} samples, this may take some time", fit_samples);
            let zca = ZcaWhitening::fit(splits.train.images.slice(s![..fit_samples, .., .., ..]))?;
            info!("ZCA fit done");
            for split in Split::ALL {
                zca.transform(&mut splits.split_mut(split).images, split.name())?;
            }
            info!("Applied ZCA whitening");
            applied.push("zca_whitening");
        }

        let input_channels = splits.input_channels();
        Ok(PreprocessOutcome {
            splits,
            input_channels,
            channel_mean,
            applied,
        })
    }
}

/// Sigma of a `2r+1` kernel, as OpenCV derives it from the kernel size
pub fn blur_sigma(radius: usize) -> f32 {
    let k = (2 * radius + 1) as f32;
    0.3 * ((k - 1.0) / 2.0 - 1.0) + 0.8
}

/// Blur every channel of every image
pub fn gaussian_blur(images: &mut Array4<f32>, radius: usize) {
    if radius == 0 {
        return;
    }
    let sigma = blur_sigma(radius);

    images.axis_iter_mut(Axis(0)).into_par_iter().for_each(|mut sample| {
        for channel in sample.axis_iter_mut(Axis(2)) {
            blur_plane(channel, sigma);
        }
    });
}

fn blur_plane(mut plane: ArrayViewMut2<f32>, sigma: f32) {
    let (h, w) = plane.dim();
    let raw: Vec<f32> = plane.iter().copied().collect();
    let Some(buffer) = ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(w as u32, h as u32, raw) else {
        return;
    };
    let blurred = gaussian_blur_f32(&buffer, sigma);
    for ((y, x), v) in plane.indexed_iter_mut() {
        *v = blurred.get_pixel(x as u32, y as u32)[0];
    }
}

/// Clip each channel of each image to its `[p, 1-p]` percentiles and
/// equalize the clipped range through its cumulative histogram
pub fn histogram_equalization(images: &mut Array4<f32>, cutoff: f64) {
    images.axis_iter_mut(Axis(0)).into_par_iter().for_each(|mut sample| {
        for channel in sample.axis_iter_mut(Axis(2)) {
            equalize_plane(channel, cutoff);
        }
    });
}

fn percentile(sorted: &[f32], q: f64) -> f32 {
    let idx = (q * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn equalize_plane(mut plane: ArrayViewMut2<f32>, cutoff: f64) {
    if plane.is_empty() {
        return;
    }
    let mut sorted: Vec<f32> = plane.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let lo = percentile(&sorted, cutoff);
    let hi = percentile(&sorted, 1.0 - cutoff);
    if hi <= lo {
        plane.fill(lo);
        return;
    }

    let span = hi - lo;
    let bin_of = |v: f32| (((v - lo) / span) * (HISTOGRAM_BINS - 1) as f32).round() as usize;

    plane.mapv_inplace(|v| v.clamp(lo, hi));
    let mut histogram = [0usize; HISTOGRAM_BINS];
    for &v in plane.iter() {
        histogram[bin_of(v).min(HISTOGRAM_BINS - 1)] += 1;
    }

    let mut cdf = [0usize; HISTOGRAM_BINS];
    let mut running = 0;
    for (bin, &count) in histogram.iter().enumerate() {
        running += count;
        cdf[bin] = running;
    }
    let total = running;
    let cdf_min = cdf.iter().copied().find(|&c| c > 0).unwrap_or(0);
    if total == cdf_min {
        return;
    }

    plane.mapv_inplace(|v| {
        let c = cdf[bin_of(v).min(HISTOGRAM_BINS - 1)];
        lo + span * (c - cdf_min) as f32 / (total - cdf_min) as f32
    });
}

/// Per-channel mean over all samples and pixels
pub fn channel_mean_of(images: &Array4<f32>) -> Vec<f32> {
    images
        .axis_iter(Axis(3))
        .map(|channel| channel.mean().unwrap_or(0.0))
        .collect()
}

pub fn subtract_channel_mean(images: &mut Array4<f32>, mean: &[f32]) {
    for (mut channel, &m) in images.axis_iter_mut(Axis(3)).zip(mean.iter()) {
        channel -= m;
    }
}

/// Global normalization of one image array
pub fn normalize_images(images: &mut Array4<f32>, mode: NormalizationMode) {
    if images.is_empty() {
        return;
    }
    match mode {
        NormalizationMode::MinMax => {
            let (lo, hi) = images
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            if hi > lo {
                images.mapv_inplace(|v| (v - lo) / (hi - lo));
            } else {
                images.fill(0.0);
            }
        }
        NormalizationMode::MeanStd => {
            let n = images.len() as f64;
            let mean = images.iter().map(|&v| v as f64).sum::<f64>() / n;
            let var = images.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
            let std = var.sqrt();
            let (mean, std) = (mean as f32, std as f32);
            if std > 0.0 {
                images.mapv_inplace(|v| (v - mean) / std);
            } else {
                images.mapv_inplace(|v| v - mean);
            }
        }
    }
}

/// Bring masks into `[0, 1]` (e.g. 0/255 masks become 0/1)
pub fn scale_masks(masks: &mut Array4<f32>) {
    let max = masks.iter().copied().fold(0.0f32, f32::max);
    if max > 1.0 {
        masks.mapv_inplace(|v| (v / max).max(0.0));
    }
}
