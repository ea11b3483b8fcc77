//! Connected-component channels
//!
//! Each image is reduced to grayscale, split with Otsu's threshold and
//! labelled with 8-connectivity. The largest dark components (lesion
//! candidates) are appended to the image as binary channels.

use std::collections::HashMap;

use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::parallel::prelude::*;
use ndarray::{s, Array3, Array4, ArrayView3, Axis};
use tracing::debug;

use crate::utils::metrics::otsu_threshold;

/// Luminance weights for RGB input
const LUMA_WEIGHTS: [f32; 3] = [0.299, 0.587, 0.114];

/// Return `images` with `take` extra binary channels, one per component,
/// largest first. Missing components leave their channel empty.
pub fn add_component_channels(images: &Array4<f32>, take: usize) -> Array4<f32> {
    let (n, h, w, c) = images.dim();

    let component_maps: Vec<Array3<f32>> = images
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|sample| component_channels(sample, take))
        .collect();

    let mut output = Array4::<f32>::zeros((n, h, w, c + take));
    output.slice_mut(s![.., .., .., ..c]).assign(images);
    for (i, maps) in component_maps.iter().enumerate() {
        output.slice_mut(s![i, .., .., c..]).assign(maps);
    }

    debug!("Added {} component channels to {} images", take, n);
    output
}

/// `(h, w, take)` binary maps of the largest dark components of one image
pub fn component_channels(sample: ArrayView3<f32>, take: usize) -> Array3<f32> {
    let (h, w, _) = sample.dim();
    let gray = to_gray(sample);

    let threshold = otsu_threshold(gray.as_raw());
    let mut foreground = GrayImage::new(w as u32, h as u32);
    for (x, y, pixel) in gray.enumerate_pixels() {
        if pixel[0] <= threshold {
            foreground.put_pixel(x, y, Luma([255]));
        }
    }

    let labels = connected_components(&foreground, Connectivity::Eight, Luma([0u8]));

    let mut sizes: HashMap<u32, usize> = HashMap::new();
    for pixel in labels.pixels() {
        if pixel[0] != 0 {
            *sizes.entry(pixel[0]).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(u32, usize)> = sizes.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut maps = Array3::<f32>::zeros((h, w, take));
    for (channel, &(label, _)) in ranked.iter().take(take).enumerate() {
        for (x, y, pixel) in labels.enumerate_pixels() {
            if pixel[0] == label {
                maps[[y as usize, x as usize, channel]] = 1.0;
            }
        }
    }
    maps
}

/// Grayscale 8-bit rendering of one HWC sample, stretched to 0..255
fn to_gray(sample: ArrayView3<f32>) -> GrayImage {
    let (h, w, c) = sample.dim();

    let mut values = Vec::with_capacity(h * w);
    for y in 0..h {
        for x in 0..w {
            let v = if c == 3 {
                (0..3).map(|ch| sample[[y, x, ch]] * LUMA_WEIGHTS[ch]).sum::<f32>()
            } else {
                (0..c).map(|ch| sample[[y, x, ch]]).sum::<f32>() / c.max(1) as f32
            };
            values.push(v);
        }
    }

    let (lo, hi) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let span = hi - lo;

    let pixels: Vec<u8> = values
        .iter()
        .map(|&v| {
            if span > 0.0 {
                ((v - lo) / span * 255.0).round() as u8
            } else {
                0
            }
        })
        .collect();

    GrayImage::from_fn(w as u32, h as u32, |x, y| Luma([pixels[y as usize * w + x as usize]]))
}
