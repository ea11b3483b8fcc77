//! Segmentation Metrics
//!
//! Overlap metrics for binary lesion masks:
//! - Otsu binarization of predicted probability maps
//! - Pixel confusion counts (tn, fp, fn, tp)
//! - Jaccard index (manual and library style), Dice, sensitivity,
//!   specificity, accuracy, precision
//! - ISIC threshold score
//!
//! Ratios whose denominator is zero are reported as `f64::NAN` rather than
//! panicking or silently becoming zero.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, SegError};

/// Per-sample Jaccard bar for the ISIC score
pub const ISIC_JACCARD_THRESHOLD: f64 = 0.65;

/// Ground-truth masks are binarized at this level
pub const MASK_THRESHOLD: f32 = 0.5;

/// Compute Otsu's threshold over an 8-bit image
///
/// Pixels `<= t` form the background class. Ties keep the lowest threshold,
/// so an image that is already binary (0/255) thresholds at 0 and binarizes
/// back to itself.
pub fn otsu_threshold(pixels: &[u8]) -> u8 {
    let mut histogram = [0u64; 256];
    for &p in pixels {
        histogram[p as usize] += 1;
    }

    let total = pixels.len() as f64;
    let weighted_total: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &count)| i as f64 * count as f64)
        .sum();

    let mut threshold = 0u8;
    let mut best_variance = -1.0f64;
    let mut weight_bg = 0.0f64;
    let mut sum_bg = 0.0f64;

    for (t, &count) in histogram.iter().enumerate() {
        weight_bg += count as f64;
        if weight_bg == 0.0 {
            continue;
        }
        let weight_fg = total - weight_bg;
        if weight_fg == 0.0 {
            break;
        }

        sum_bg += t as f64 * count as f64;
        let mean_bg = sum_bg / weight_bg;
        let mean_fg = (weighted_total - sum_bg) / weight_fg;

        // between-class variance
        let variance = weight_bg * weight_fg * (mean_bg - mean_fg).powi(2);
        if variance > best_variance {
            best_variance = variance;
            threshold = t as u8;
        }
    }

    threshold
}

/// Binarize a probability map: scale to 8 bits, then split at Otsu's threshold
pub fn binarize_prediction(probabilities: &[f32]) -> Vec<bool> {
    let pixels: Vec<u8> = probabilities
        .iter()
        .map(|&p| (p.clamp(0.0, 1.0) * 255.0) as u8)
        .collect();
    let t = otsu_threshold(&pixels);
    pixels.iter().map(|&p| p > t).collect()
}

/// Binarize a ground-truth mask at 0.5
pub fn binarize_mask(mask: &[f32]) -> Vec<bool> {
    mask.iter().map(|&m| m > MASK_THRESHOLD).collect()
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        f64::NAN
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Pixel confusion counts for a binary segmentation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryConfusion {
    pub tn: u64,
    pub fp: u64,
    pub fn_: u64,
    pub tp: u64,
}

impl BinaryConfusion {
    /// Count agreement between a ground-truth and a predicted mask
    pub fn from_masks(truth: &[bool], predicted: &[bool]) -> Self {
        let mut counts = Self::default();
        for (&t, &p) in truth.iter().zip(predicted.iter()) {
            match (t, p) {
                (false, false) => counts.tn += 1,
                (false, true) => counts.fp += 1,
                (true, false) => counts.fn_ += 1,
                (true, true) => counts.tp += 1,
            }
        }
        counts
    }

    pub fn add(&mut self, other: &BinaryConfusion) {
        self.tn += other.tn;
        self.fp += other.fp;
        self.fn_ += other.fn_;
        self.tp += other.tp;
    }

    pub fn total(&self) -> u64 {
        self.tn + self.fp + self.fn_ + self.tp
    }

    /// tp / (tp + fn)
    pub fn sensitivity(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    /// tn / (tn + fp)
    pub fn specificity(&self) -> f64 {
        ratio(self.tn, self.tn + self.fp)
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.tp + self.tn, self.total())
    }

    /// tp / (tp + fp)
    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    /// 2tp / (2tp + fp + fn)
    pub fn dice(&self) -> f64 {
        ratio(2 * self.tp, 2 * self.tp + self.fp + self.fn_)
    }

    /// Library-style Jaccard: tp / (tp + fp + fn), 0.0 when nothing is positive
    pub fn jaccard_score(&self) -> f64 {
        let denominator = self.tp + self.fp + self.fn_;
        if denominator == 0 {
            0.0
        } else {
            self.tp as f64 / denominator as f64
        }
    }
}

/// Threshold count of the pixel ROC curve
pub const AUC_THRESHOLDS: usize = 200;

/// Pixel ROC-AUC from a binned histogram of predicted probabilities
///
/// Each bin is one threshold step; the curve is integrated with the
/// trapezoid rule from the highest threshold down. 0.0 while either class
/// is absent.
#[derive(Debug, Clone, PartialEq)]
pub struct RocHistogram {
    positive: Vec<u64>,
    negative: Vec<u64>,
}

impl Default for RocHistogram {
    fn default() -> Self {
        Self::new(AUC_THRESHOLDS)
    }
}

impl RocHistogram {
    pub fn new(bins: usize) -> Self {
        let bins = bins.max(1);
        Self {
            positive: vec![0; bins],
            negative: vec![0; bins],
        }
    }

    fn bin(&self, probability: f32) -> usize {
        let bins = self.positive.len();
        ((probability.clamp(0.0, 1.0) * bins as f32) as usize).min(bins - 1)
    }

    pub fn add(&mut self, probability: f32, positive: bool) {
        let bin = self.bin(probability);
        if positive {
            self.positive[bin] += 1;
        } else {
            self.negative[bin] += 1;
        }
    }

    /// Add pixels whose target is foreground when above [`MASK_THRESHOLD`]
    pub fn add_all(&mut self, probabilities: &[f32], targets: &[f32]) {
        for (&p, &t) in probabilities.iter().zip(targets) {
            self.add(p, t > MASK_THRESHOLD);
        }
    }

    pub fn auc(&self) -> f64 {
        let positives: u64 = self.positive.iter().sum();
        let negatives: u64 = self.negative.iter().sum();
        if positives == 0 || negatives == 0 {
            return 0.0;
        }

        let (mut tp, mut fp) = (0u64, 0u64);
        let mut area = 0.0;
        for (&pos, &neg) in self.positive.iter().zip(&self.negative).rev() {
            let (tpr_before, fpr_before) = (tp as f64 / positives as f64, fp as f64 / negatives as f64);
            tp += pos;
            fp += neg;
            let (tpr, fpr) = (tp as f64 / positives as f64, fp as f64 / negatives as f64);
            area += (fpr - fpr_before) * (tpr + tpr_before) / 2.0;
        }
        area
    }
}

/// Intersection over union of two masks, 1.0 when both are empty
pub fn jaccard_index(truth: &[bool], predicted: &[bool]) -> f64 {
    let (intersection, union) = truth
        .iter()
        .zip(predicted.iter())
        .fold((0u64, 0u64), |(i, u), (&t, &p)| {
            (i + (t && p) as u64, u + (t || p) as u64)
        });

    if union == 0 {
        1.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Running state of one evaluation pass over a held-out set
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    confusion: BinaryConfusion,
    jaccard_sum: f64,
    library_jaccard_sum: f64,
    above_threshold: usize,
    samples: usize,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one sample: a predicted probability map and its ground-truth mask
    pub fn add_sample(&mut self, prediction: &[f32], mask: &[f32]) -> Result<()> {
        let (truth, predicted) = binarize_pair(prediction, mask)?;
        self.add_binary(&truth, &predicted);
        Ok(())
    }

    /// Add one already-binarized sample
    pub fn add_binary(&mut self, truth: &[bool], predicted: &[bool]) {
        let confusion = BinaryConfusion::from_masks(truth, predicted);
        let library_jaccard = confusion.jaccard_score();

        self.confusion.add(&confusion);
        self.jaccard_sum += jaccard_index(truth, predicted);
        self.library_jaccard_sum += library_jaccard;
        if library_jaccard >= ISIC_JACCARD_THRESHOLD {
            self.above_threshold += 1;
        }
        self.samples += 1;
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn confusion(&self) -> BinaryConfusion {
        self.confusion
    }

    /// Compute the final ratios
    pub fn finish(&self) -> SegmentationReport {
        let n = self.samples as f64;
        let per_sample = |sum: f64| if self.samples == 0 { f64::NAN } else { sum / n };

        SegmentationReport {
            samples: self.samples,
            confusion: self.confusion,
            sensitivity: self.confusion.sensitivity(),
            specificity: self.confusion.specificity(),
            accuracy: self.confusion.accuracy(),
            dice: self.confusion.dice(),
            precision: self.confusion.precision(),
            jaccard_index: per_sample(self.jaccard_sum),
            jaccard_score: per_sample(self.library_jaccard_sum),
            isic_score: per_sample(self.above_threshold as f64),
        }
    }
}

/// Final metrics of an evaluation pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationReport {
    pub samples: usize,
    pub confusion: BinaryConfusion,
    pub sensitivity: f64,
    pub specificity: f64,
    pub accuracy: f64,
    pub dice: f64,
    pub precision: f64,
    /// Mean of per-sample intersection / union
    pub jaccard_index: f64,
    /// Mean of per-sample tp / (tp + fp + fn)
    pub jaccard_score: f64,
    /// Fraction of samples whose Jaccard score reaches 0.65
    pub isic_score: f64,
}

impl SegmentationReport {
    /// `[accuracy, jaccard_score, precision, sensitivity, specificity]`
    pub fn as_vector(&self) -> [f64; 5] {
        [
            self.accuracy,
            self.jaccard_score,
            self.precision,
            self.sensitivity,
            self.specificity,
        ]
    }

    /// Named metrics in the order they are reported to the tracker
    pub fn named(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("jaccard_index", self.jaccard_index),
            ("test_sensitivity", self.sensitivity),
            ("test_specificity", self.specificity),
            ("test_accuracy", self.accuracy),
            ("test_jaccard_score", self.jaccard_score),
            ("test_precision", self.precision),
            ("test_dicecoef", self.dice),
            ("isic_eval_score", self.isic_score),
        ]
    }
}

impl std::fmt::Display for SegmentationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Test metrics over {} samples", self.samples)?;
        for (name, value) in self.named() {
            writeln!(f, "  {:<20} {:>8.4}", name, value)?;
        }
        Ok(())
    }
}

/// `(truth, predicted)` binary masks of one sample
fn binarize_pair(prediction: &[f32], mask: &[f32]) -> Result<(Vec<bool>, Vec<bool>)> {
    if prediction.len() != mask.len() {
        return Err(SegError::Evaluation(format!(
            "prediction has {} pixels but mask has {}",
            prediction.len(),
            mask.len()
        )));
    }
    Ok((binarize_mask(mask), binarize_prediction(prediction)))
}

/// Evaluate a set of predictions against their masks
///
/// Both slices hold one flattened map per sample. Samples are binarized in
/// parallel and accumulated in order.
pub fn evaluate_predictions<P, M>(predictions: &[P], masks: &[M]) -> Result<SegmentationReport>
where
    P: AsRef<[f32]> + Sync,
    M: AsRef<[f32]> + Sync,
{
    if predictions.len() != masks.len() {
        return Err(SegError::Evaluation(format!(
            "{} predictions for {} masks",
            predictions.len(),
            masks.len()
        )));
    }

    let binarized: Vec<(Vec<bool>, Vec<bool>)> = predictions
        .par_iter()
        .zip(masks.par_iter())
        .map(|(prediction, mask)| binarize_pair(prediction.as_ref(), mask.as_ref()))
        .collect::<Result<_>>()?;

    let mut accumulator = MetricAccumulator::new();
    for (truth, predicted) in &binarized {
        accumulator.add_binary(truth, predicted);
    }
    Ok(accumulator.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn half_mask(len: usize) -> Vec<f32> {
        (0..len).map(|i| if i < len / 2 { 1.0 } else { 0.0 }).collect()
    }

    #[test]
    fn test_roc_auc_separable_and_inverted() {
        let targets = [1.0, 1.0, 0.0, 0.0];

        let mut separable = RocHistogram::default();
        separable.add_all(&[0.9, 0.8, 0.2, 0.1], &targets);
        assert!((separable.auc() - 1.0).abs() < 1e-12);

        let mut inverted = RocHistogram::default();
        inverted.add_all(&[0.1, 0.2, 0.8, 0.9], &targets);
        assert!(inverted.auc().abs() < 1e-12);
    }

    #[test]
    fn test_roc_auc_constant_prediction_is_chance() {
        let mut roc = RocHistogram::default();
        roc.add_all(&[0.5; 4], &[1.0, 0.0, 1.0, 0.0]);
        assert!((roc.auc() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_roc_auc_partial_overlap() {
        // one of four positive/negative pairs is ordered wrongly
        let mut roc = RocHistogram::default();
        roc.add_all(&[0.9, 0.3, 0.6, 0.1], &[1.0, 1.0, 0.0, 0.0]);
        assert!((roc.auc() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_roc_auc_single_class_is_zero() {
        let mut roc = RocHistogram::default();
        roc.add_all(&[0.2, 0.7], &[1.0, 1.0]);
        assert_eq!(roc.auc(), 0.0);
        assert_eq!(RocHistogram::new(0).auc(), 0.0);
    }

    #[test]
    fn test_identical_masks_are_perfect() {
        let mask = half_mask(64);
        let report = evaluate_predictions(&[mask.clone()], &[mask]).unwrap();

        assert_eq!(report.jaccard_index, 1.0);
        assert_eq!(report.jaccard_score, 1.0);
        assert_eq!(report.dice, 1.0);
        assert_eq!(report.accuracy, 1.0);
        assert_eq!(report.sensitivity, 1.0);
        assert_eq!(report.specificity, 1.0);
        assert_eq!(report.precision, 1.0);
        assert_eq!(report.isic_score, 1.0);
    }

    #[test]
    fn test_disjoint_masks_have_no_overlap() {
        let mask = half_mask(64);
        let inverted: Vec<f32> = mask.iter().map(|m| 1.0 - m).collect();
        let report = evaluate_predictions(&[inverted], &[mask]).unwrap();

        assert_eq!(report.jaccard_index, 0.0);
        assert_eq!(report.jaccard_score, 0.0);
        assert_eq!(report.dice, 0.0);
        assert_eq!(report.isic_score, 0.0);
    }

    #[test]
    fn test_otsu_is_idempotent_on_binary_images() {
        let pixels: Vec<u8> = (0..100).map(|i| if i % 3 == 0 { 255 } else { 0 }).collect();
        let t = otsu_threshold(&pixels);
        let binary: Vec<u8> = pixels.iter().map(|&p| if p > t { 255 } else { 0 }).collect();
        assert_eq!(binary, pixels);
        assert_eq!(otsu_threshold(&binary), t);
    }

    #[test]
    fn test_otsu_separates_two_modes() {
        let mut pixels = vec![40u8; 50];
        pixels.extend(vec![200u8; 50]);
        let t = otsu_threshold(&pixels);
        assert!((40..200).contains(&t));
    }

    #[test]
    fn test_binarize_prediction_adapts_threshold() {
        // All probabilities below 0.5, but two clear modes
        let probs: Vec<f32> = (0..20).map(|i| if i < 10 { 0.1 } else { 0.4 }).collect();
        let binary = binarize_prediction(&probs);
        assert_eq!(binary.iter().filter(|&&b| b).count(), 10);
        assert!(binary[10..].iter().all(|&b| b));
    }

    #[test]
    fn test_confusion_totals_cover_all_pixels() {
        let pixels = 36;
        let samples: Vec<Vec<f32>> = (0..5)
            .map(|s| (0..pixels).map(|i| ((i + s) % 4 == 0) as u8 as f32).collect())
            .collect();
        let predictions: Vec<Vec<f32>> = (0..5)
            .map(|s| (0..pixels).map(|i| ((i + s) % 3 == 0) as u8 as f32).collect())
            .collect();

        let report = evaluate_predictions(&predictions, &samples).unwrap();
        assert_eq!(report.confusion.total(), (pixels * 5) as u64);
        assert_eq!(report.samples, 5);
    }

    #[test]
    fn test_zero_denominators_are_nan() {
        let confusion = BinaryConfusion {
            tn: 10,
            ..Default::default()
        };
        assert!(confusion.sensitivity().is_nan());
        assert!(confusion.precision().is_nan());
        assert!(confusion.dice().is_nan());
        assert_eq!(confusion.specificity(), 1.0);
        assert_eq!(confusion.jaccard_score(), 0.0);
    }

    #[test]
    fn test_empty_union_is_a_perfect_manual_match() {
        let empty = vec![false; 16];
        assert_eq!(jaccard_index(&empty, &empty), 1.0);

        let mut acc = MetricAccumulator::new();
        acc.add_binary(&empty, &empty);
        let report = acc.finish();
        assert_eq!(report.jaccard_index, 1.0);
        assert_eq!(report.jaccard_score, 0.0);
    }

    #[test]
    fn test_isic_score_is_per_sample() {
        let truth = vec![true, true, true, true, false, false, false, false];
        let mut acc = MetricAccumulator::new();
        // Jaccard 0.75
        acc.add_binary(&truth, &[true, true, true, false, false, false, false, false]);
        // Jaccard 0.25
        acc.add_binary(&truth, &[true, false, false, false, false, false, false, false]);
        let report = acc.finish();
        assert!((report.isic_score - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_mismatched_lengths_error() {
        let mut acc = MetricAccumulator::new();
        assert!(acc.add_sample(&[0.1, 0.9], &[1.0]).is_err());
        assert!(evaluate_predictions(&[vec![0.0f32]], &Vec::<Vec<f32>>::new()).is_err());
    }

    #[test]
    fn test_empty_pass_is_nan() {
        let report = MetricAccumulator::new().finish();
        assert!(report.accuracy.is_nan());
        assert!(report.jaccard_index.is_nan());
        assert_eq!(report.as_vector().len(), 5);
    }
}
