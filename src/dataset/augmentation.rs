//! Data Augmentation Module for Lesion Segmentation
//!
//! Random affine transforms (rotation, shift, shear, zoom, flips) applied to
//! NHWC float arrays with bilinear resampling.
//!
//! # Augmentation Strategy
//!
//! - **Training**: images and masks are augmented by two independent flows
//!   that draw identical transforms from identically seeded RNGs, so every
//!   mask keeps its spatial correspondence with its image
//! - **Validation/Test**: no augmentation

use ndarray::{Array3, ArrayView3};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::config::{AugmentationParams, FillMode};

/// One sampled geometric transform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    /// Degrees
    pub rotation: f64,
    /// Row shift in pixels
    pub shift_rows: f64,
    /// Column shift in pixels
    pub shift_cols: f64,
    /// Degrees
    pub shear: f64,
    pub zoom_rows: f64,
    pub zoom_cols: f64,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
}

impl AffineTransform {
    pub fn identity() -> Self {
        Self {
            rotation: 0.0,
            shift_rows: 0.0,
            shift_cols: 0.0,
            shear: 0.0,
            zoom_rows: 1.0,
            zoom_cols: 1.0,
            flip_horizontal: false,
            flip_vertical: false,
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    /// Map an output pixel `(row, col)` to the input coordinate it samples
    ///
    /// The output is centered, zoomed, sheared, shifted and rotated, then
    /// moved back; flips act on the output grid.
    fn source(&self, row: usize, col: usize, height: usize, width: usize) -> (f64, f64) {
        let row = if self.flip_vertical { height - 1 - row } else { row };
        let col = if self.flip_horizontal { width - 1 - col } else { col };

        let center_r = (height as f64 - 1.0) / 2.0;
        let center_c = (width as f64 - 1.0) / 2.0;
        let mut r = row as f64 - center_r;
        let mut c = col as f64 - center_c;

        r *= self.zoom_rows;
        c *= self.zoom_cols;

        let shear = self.shear.to_radians();
        let (r_sheared, c_sheared) = (r - shear.sin() * c, shear.cos() * c);
        r = r_sheared + self.shift_rows;
        c = c_sheared + self.shift_cols;

        let theta = self.rotation.to_radians();
        let (sin, cos) = theta.sin_cos();
        let (r_rot, c_rot) = (cos * r - sin * c, sin * r + cos * c);

        (r_rot + center_r, c_rot + center_c)
    }
}

/// Samples and applies random affine transforms
#[derive(Debug, Clone)]
pub struct Augmenter {
    params: AugmentationParams,
}

impl Augmenter {
    pub fn new(params: AugmentationParams) -> Self {
        Self { params }
    }

    /// Augmenter that leaves samples unchanged
    pub fn no_augmentation() -> Self {
        Self::new(AugmentationParams::disabled())
    }

    pub fn params(&self) -> &AugmentationParams {
        &self.params
    }

    /// Draw a transform for a `height x width` sample
    ///
    /// The number of draws depends only on the parameters, so two augmenters
    /// with equal parameters and equally seeded RNGs draw equal transforms.
    pub fn random_transform(&self, rng: &mut ChaCha8Rng, height: usize, width: usize) -> AffineTransform {
        let p = &self.params;
        let symmetric = |rng: &mut ChaCha8Rng, range: f64| {
            if range > 0.0 {
                rng.gen_range(-range..=range)
            } else {
                0.0
            }
        };

        let rotation = symmetric(rng, p.rotation_range);

        let mut shift_rows = symmetric(rng, p.height_shift_range);
        if p.height_shift_range < 1.0 {
            shift_rows *= height as f64;
        }
        let mut shift_cols = symmetric(rng, p.width_shift_range);
        if p.width_shift_range < 1.0 {
            shift_cols *= width as f64;
        }

        let shear = symmetric(rng, p.shear_range);

        let (zoom_rows, zoom_cols) = if p.zoom_range > 0.0 {
            let lo = (1.0 - p.zoom_range).max(f64::EPSILON);
            let hi = 1.0 + p.zoom_range;
            (rng.gen_range(lo..=hi), rng.gen_range(lo..=hi))
        } else {
            (1.0, 1.0)
        };

        let flip_horizontal = p.horizontal_flip && rng.gen::<f64>() < 0.5;
        let flip_vertical = p.vertical_flip && rng.gen::<f64>() < 0.5;

        AffineTransform {
            rotation,
            shift_rows,
            shift_cols,
            shear,
            zoom_rows,
            zoom_cols,
            flip_horizontal,
            flip_vertical,
        }
    }

    /// Apply a transform to one HWC sample
    pub fn apply(&self, sample: ArrayView3<f32>, transform: &AffineTransform) -> Array3<f32> {
        if transform.is_identity() {
            return sample.to_owned();
        }

        let (height, width, channels) = sample.dim();
        let mut output = Array3::<f32>::zeros((height, width, channels));

        for row in 0..height {
            for col in 0..width {
                let (src_r, src_c) = transform.source(row, col, height, width);
                for ch in 0..channels {
                    output[[row, col, ch]] = self.bilinear_sample(&sample, src_r, src_c, ch);
                }
            }
        }

        output
    }

    /// Draw a transform and apply it
    pub fn augment(&self, sample: ArrayView3<f32>, rng: &mut ChaCha8Rng) -> Array3<f32> {
        let (height, width, _) = sample.dim();
        let transform = self.random_transform(rng, height, width);
        self.apply(sample, &transform)
    }

    /// Sample a channel at a fractional position using bilinear interpolation
    fn bilinear_sample(&self, img: &ArrayView3<f32>, r: f64, c: f64, ch: usize) -> f32 {
        let r0 = r.floor();
        let c0 = c.floor();
        let fr = (r - r0) as f32;
        let fc = (c - c0) as f32;
        let (r0, c0) = (r0 as isize, c0 as isize);

        let v00 = self.fetch(img, r0, c0, ch);
        let v01 = self.fetch(img, r0, c0 + 1, ch);
        let v10 = self.fetch(img, r0 + 1, c0, ch);
        let v11 = self.fetch(img, r0 + 1, c0 + 1, ch);

        v00 * (1.0 - fr) * (1.0 - fc) + v01 * (1.0 - fr) * fc + v10 * fr * (1.0 - fc) + v11 * fr * fc
    }

    /// Read a pixel, resolving out-of-range positions with the fill mode
    fn fetch(&self, img: &ArrayView3<f32>, r: isize, c: isize, ch: usize) -> f32 {
        let (height, width, _) = img.dim();
        let mode = self.params.fill_mode;
        match (resolve_index(r, height, mode), resolve_index(c, width, mode)) {
            (Some(r), Some(c)) => img[[r, c, ch]],
            _ => self.params.cval as f32,
        }
    }
}

/// Map a possibly out-of-range index into `0..len`; `None` means "use cval"
fn resolve_index(i: isize, len: usize, mode: FillMode) -> Option<usize> {
    let n = len as isize;
    if n == 0 {
        return None;
    }
    if (0..n).contains(&i) {
        return Some(i as usize);
    }
    match mode {
        FillMode::Constant => None,
        FillMode::Nearest => Some(i.clamp(0, n - 1) as usize),
        FillMode::Reflect => {
            // abcd -> dcba|abcd|dcba
            let period = 2 * n;
            let m = i.rem_euclid(period);
            let reflected = if m < n { m } else { period - 1 - m };
            Some(reflected as usize)
        }
        FillMode::Wrap => Some(i.rem_euclid(n) as usize),
    }
}
