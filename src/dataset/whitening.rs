//! ZCA whitening
//!
//! Feature-wise centering (per-channel mean) followed by ZCA whitening with
//! `epsilon = 1e-6`, fitted on a subset of the training images.
//!
//! A full `d x d` covariance is out of reach for image-sized features, so
//! the fit works on the `n x n` Gram matrix of the centered samples: its
//! eigenvectors `v` with eigenvalues `s` give the covariance eigenvectors
//! `u = X^T v / sqrt(n s)`. Directions outside their span have eigenvalue 0
//! and are scaled by `1 / sqrt(epsilon)`.

use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, Array4, ArrayView4, ArrayViewMut3, Axis};
use tracing::info;

use crate::utils::error::{Result, SegError};
use crate::utils::logging::SampleProgress;

/// Regulariser added to every eigenvalue
pub const ZCA_EPSILON: f64 = 1e-6;

/// Samples between progress log lines
const LOG_EVERY: usize = 50;

/// A fitted ZCA transform for one sample shape
#[derive(Debug, Clone)]
pub struct ZcaWhitening {
    channel_mean: Vec<f32>,
    /// `k x d` unit eigenvectors of the covariance, one per row
    components: Array2<f32>,
    /// `1/sqrt(s + eps) - 1/sqrt(eps)` per component
    coefficients: Array1<f32>,
    null_scale: f32,
    sample_shape: (usize, usize, usize),
}

impl ZcaWhitening {
    /// Fit on NHWC images
    pub fn fit(images: ArrayView4<f32>) -> Result<Self> {
        let (n, h, w, c) = images.dim();
        if n == 0 {
            return Err(SegError::InvalidInput(
                "ZCA whitening needs at least one training sample".to_string(),
            ));
        }
        let d = h * w * c;

        let channel_mean: Vec<f32> = (0..c)
            .map(|ch| images.index_axis(Axis(3), ch).mean().unwrap_or(0.0))
            .collect();

        let centered: Vec<f32> = images
            .indexed_iter()
            .map(|((_, _, _, ch), &v)| v - channel_mean[ch])
            .collect();
        let x = Array2::from_shape_vec((n, d), centered)
            .map_err(|e| SegError::InvalidInput(format!("ZCA reshape failed: {}", e)))?;

        let gram = x.dot(&x.t());
        let gram = DMatrix::<f64>::from_fn(n, n, |i, j| gram[[i, j]] as f64 / n as f64);
        let eigen = SymmetricEigen::new(gram);

        let max_eigenvalue = eigen.eigenvalues.iter().cloned().fold(0.0f64, f64::max);
        let cutoff = max_eigenvalue * 1e-10;
        let kept: Vec<usize> = (0..n)
            .filter(|&i| eigen.eigenvalues[i] > cutoff && eigen.eigenvalues[i] > 0.0)
            .collect();

        let k = kept.len();
        let mut projection = Array2::<f32>::zeros((k, n));
        let mut coefficients = Array1::<f32>::zeros(k);
        let null_scale = 1.0 / ZCA_EPSILON.sqrt();
        for (row, &i) in kept.iter().enumerate() {
            let s = eigen.eigenvalues[i];
            let norm = (n as f64 * s).sqrt();
            for j in 0..n {
                projection[[row, j]] = (eigen.eigenvectors[(j, i)] / norm) as f32;
            }
            coefficients[row] = (1.0 / (s + ZCA_EPSILON).sqrt() - null_scale) as f32;
        }
        let components = projection.dot(&x);

        info!("ZCA fit on {} samples: {} non-null components", n, k);

        Ok(Self {
            channel_mean,
            components,
            coefficients,
            null_scale: null_scale as f32,
            sample_shape: (h, w, c),
        })
    }

    pub fn channel_mean(&self) -> &[f32] {
        &self.channel_mean
    }

    /// Center and whiten one HWC sample in place
    pub fn transform_sample(&self, mut sample: ArrayViewMut3<f32>) -> Result<()> {
        if sample.dim() != self.sample_shape {
            return Err(SegError::InvalidInput(format!(
                "ZCA fitted for sample shape {:?}, got {:?}",
                self.sample_shape,
                sample.dim()
            )));
        }

        let x: Array1<f32> = sample
            .indexed_iter()
            .map(|((_, _, ch), &v)| v - self.channel_mean[ch])
            .collect();
        let projected = self.components.dot(&x) * &self.coefficients;
        let whitened = &x * self.null_scale + &self.components.t().dot(&projected);

        for (dst, &src) in sample.iter_mut().zip(whitened.iter()) {
            *dst = src;
        }
        Ok(())
    }

    /// Whiten every sample of an NHWC array, logging progress
    pub fn transform(&self, images: &mut Array4<f32>, split: &str) -> Result<()> {
        let total = images.len_of(Axis(0));
        let mut progress = SampleProgress::new(&format!("ZCA {}", split), total, LOG_EVERY);

        for sample in images.axis_iter_mut(Axis(0)) {
            self.transform_sample(sample)?;
            progress.tick();
        }

        progress.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    /// Two strongly correlated features (a 1x2 single-channel image)
    fn correlated(n: usize) -> Array4<f32> {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut images = Array4::<f32>::zeros((n, 1, 2, 1));
        for i in 0..n {
            let a: f32 = rng.gen_range(-1.0..1.0);
            let noise: f32 = rng.gen_range(-0.3..0.3);
            images[[i, 0, 0, 0]] = a;
            images[[i, 0, 1, 0]] = 0.8 * a + noise;
        }
        images
    }

    #[test]
    fn test_whitened_covariance_is_identity() {
        let mut images = correlated(200);
        let zca = ZcaWhitening::fit(images.view()).unwrap();
        zca.transform(&mut images, "train").unwrap();

        let n = images.len_of(Axis(0)) as f32;
        let flat = images.into_shape_with_order((200, 2)).unwrap();
        let cov = flat.t().dot(&flat) / n;

        assert!((cov[[0, 0]] - 1.0).abs() < 1e-2);
        assert!((cov[[1, 1]] - 1.0).abs() < 1e-2);
        assert!(cov[[0, 1]].abs() < 1e-2);
    }

    #[test]
    fn test_channel_mean_is_feature_wise() {
        let images = Array4::<f32>::from_shape_fn((4, 2, 2, 2), |(_, _, _, c)| c as f32 + 1.0);
        let zca = ZcaWhitening::fit(images.view()).unwrap();
        assert_eq!(zca.channel_mean(), &[1.0, 2.0]);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let images = correlated(10);
        let zca = ZcaWhitening::fit(images.view()).unwrap();
        let mut other = Array4::<f32>::zeros((1, 2, 2, 1));
        assert!(zca.transform(&mut other, "val").is_err());
    }

    #[test]
    fn test_empty_fit_errors() {
        let images = Array4::<f32>::zeros((0, 2, 2, 1));
        assert!(ZcaWhitening::fit(images.view()).is_err());
    }
}
