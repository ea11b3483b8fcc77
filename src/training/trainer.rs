//! UNet Training Loop
//!
//! This module wraps the UNet with everything needed to fit and use it:
//! - Adam optimization of binary cross-entropy on logits
//! - Pixel accuracy, precision and ROC-AUC tracked per epoch
//! - Early stopping on validation loss with best-weight restore
//! - Per-epoch history files and an SVG loss curve
//! - Evaluation, prediction, and checkpoint saving/loading

use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::CompactRecorder,
    tensor::{
        activation::sigmoid,
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use chrono::Local;
use ndarray::{s, Array4, Axis};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::config::RunConfig;
use crate::dataset::batcher::{tensor_to_nhwc, SegmentationBatcher};
use crate::dataset::loader::SplitData;
use crate::model::{UNet, UNetConfig};
use crate::tracking::ExperimentTracker;
use crate::utils::charts::{write_line_chart, DataSeries, TRAIN_STROKE, VALID_STROKE};
use crate::utils::error::{Result, SegError};
use crate::utils::logging::EpochLogger;
use crate::utils::metrics::{evaluate_predictions, RocHistogram, SegmentationReport};
use crate::utils::save_with_retry;

/// Mean binary cross-entropy computed from logits
///
/// Uses `max(x, 0) - x * y + ln(1 + e^-|x|)`, which stays finite for large
/// logits of either sign.
pub fn binary_cross_entropy_with_logits<B: Backend>(
    logits: Tensor<B, 4>,
    targets: Tensor<B, 4>,
) -> Tensor<B, 1> {
    let positive = logits.clone().clamp_min(0.0);
    let softplus = logits.clone().abs().neg().exp().log1p();
    (positive - logits * targets + softplus).mean()
}

/// Running loss and pixel counts over a number of batches
#[derive(Debug, Clone, Default)]
pub struct PixelStats {
    loss_sum: f64,
    samples: usize,
    correct: u64,
    pixels: u64,
    true_positive: u64,
    predicted_positive: u64,
    roc: RocHistogram,
}

impl PixelStats {
    /// Add one batch; a pixel is predicted foreground when its logit is positive
    pub fn update<B: Backend>(&mut self, logits: Tensor<B, 4>, targets: Tensor<B, 4>, loss: f64) {
        let [n, _, _, _] = logits.dims();
        let pixels: usize = logits.dims().iter().product();

        let probabilities: Vec<f32> = sigmoid(logits.clone()).into_data().iter::<f32>().collect();
        let labels: Vec<f32> = targets.clone().into_data().iter::<f32>().collect();
        self.roc.add_all(&probabilities, &labels);

        let predicted = logits.greater_elem(0.0).int();
        let truth = targets.greater_elem(0.5).int();

        let correct: i64 = predicted
            .clone()
            .equal(truth.clone())
            .int()
            .sum()
            .into_scalar()
            .elem();
        let true_positive: i64 = (predicted.clone() * truth).sum().into_scalar().elem();
        let predicted_positive: i64 = predicted.sum().into_scalar().elem();

        self.loss_sum += loss * n as f64;
        self.samples += n;
        self.correct += correct as u64;
        self.pixels += pixels as u64;
        self.true_positive += true_positive as u64;
        self.predicted_positive += predicted_positive as u64;
    }

    /// Sample-weighted mean loss
    pub fn loss(&self) -> f64 {
        if self.samples == 0 {
            return f64::NAN;
        }
        self.loss_sum / self.samples as f64
    }

    pub fn accuracy(&self) -> f64 {
        if self.pixels == 0 {
            return f64::NAN;
        }
        self.correct as f64 / self.pixels as f64
    }

    /// 0.0 until something is predicted as foreground
    pub fn precision(&self) -> f64 {
        if self.predicted_positive == 0 {
            return 0.0;
        }
        self.true_positive as f64 / self.predicted_positive as f64
    }

    /// Pixel ROC-AUC over 200 probability thresholds
    pub fn auc(&self) -> f64 {
        self.roc.auc()
    }
}

/// Metrics of one epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 0-indexed
    pub epoch: usize,
    pub loss: f64,
    pub acc: f64,
    pub precision: f64,
    pub auc: f64,
    pub val_loss: f64,
    pub val_acc: f64,
    pub val_precision: f64,
    pub val_auc: f64,
}

impl EpochRecord {
    fn named(&self) -> [(&'static str, f64); 8] {
        [
            ("loss", self.loss),
            ("acc", self.acc),
            ("precision", self.precision),
            ("auc", self.auc),
            ("val_loss", self.val_loss),
            ("val_acc", self.val_acc),
            ("val_precision", self.val_precision),
            ("val_auc", self.val_auc),
        ]
    }
}

/// Per-epoch history of a `fit` call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    pub epochs: Vec<EpochRecord>,
    /// Epoch whose weights the model holds after training
    pub best_epoch: Option<usize>,
    pub best_val_loss: f64,
    pub stopped_early: bool,
    /// Directory the curves were written to
    pub log_dir: Option<PathBuf>,
}

impl History {
    pub fn losses(&self) -> Vec<f64> {
        self.epochs.iter().map(|e| e.loss).collect()
    }

    pub fn val_losses(&self) -> Vec<f64> {
        self.epochs.iter().map(|e| e.val_loss).collect()
    }

    pub fn to_csv(&self) -> String {
        let mut csv = String::from("epoch,loss,acc,precision,auc,val_loss,val_acc,val_precision,val_auc\n");
        for e in &self.epochs {
            csv.push_str(&format!(
                "{},{},{},{},{},{},{},{},{}\n",
                e.epoch + 1,
                e.loss,
                e.acc,
                e.precision,
                e.auc,
                e.val_loss,
                e.val_acc,
                e.val_precision,
                e.val_auc
            ));
        }
        csv
    }

    /// Write `history.json`, `history.csv`, `loss_curve.svg` and
    /// `accuracy_curve.svg` into `dir`
    pub fn write(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join("history.json"), serde_json::to_string_pretty(self)?)?;
        fs::write(dir.join("history.csv"), self.to_csv())?;

        write_line_chart(
            "Binary cross-entropy",
            "Epoch",
            "Loss",
            &[
                DataSeries::per_epoch("train", &self.losses(), TRAIN_STROKE),
                DataSeries::per_epoch("validation", &self.val_losses(), VALID_STROKE),
            ],
            &dir.join("loss_curve.svg"),
        )?;

        let acc: Vec<f64> = self.epochs.iter().map(|e| e.acc).collect();
        let val_acc: Vec<f64> = self.epochs.iter().map(|e| e.val_acc).collect();
        write_line_chart(
            "Pixel accuracy",
            "Epoch",
            "Accuracy",
            &[
                DataSeries::per_epoch("train", &acc, TRAIN_STROKE),
                DataSeries::per_epoch("validation", &val_acc, VALID_STROKE),
            ],
            &dir.join("accuracy_curve.svg"),
        )?;
        Ok(())
    }
}

/// Outcome of one early-stopping check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    Improved,
    Waiting,
    Stop,
}

/// Early stopping on a minimized metric
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: f64,
    best_epoch: Option<usize>,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f64::INFINITY,
            best_epoch: None,
            wait: 0,
        }
    }

    /// Record the value of `epoch`; a NaN never counts as an improvement
    pub fn update(&mut self, epoch: usize, value: f64) -> StopDecision {
        if value < self.best {
            self.best = value;
            self.best_epoch = Some(epoch);
            self.wait = 0;
            return StopDecision::Improved;
        }
        self.wait += 1;
        if self.wait >= self.patience {
            StopDecision::Stop
        } else {
            StopDecision::Waiting
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

/// UNet together with its run settings and device
pub struct Trainer<B: AutodiffBackend> {
    /// Model being trained
    pub model: UNet<B>,
    pub config: UNetConfig,
    run: RunConfig,
    device: B::Device,
    batcher: SegmentationBatcher,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Build the network for `input_channels` channels at `image_size` pixels
    pub fn build(
        run: &RunConfig,
        input_channels: usize,
        image_size: usize,
        device: &B::Device,
    ) -> Result<Self> {
        let config = UNetConfig::new(run.feature_channels.clone(), image_size)
            .with_input_channels(input_channels);
        let model = config.init::<B>(device)?;

        info!(
            "Model built: UNet {:?}, {}x{}x{} input, {} parameters",
            config.feature_channels,
            image_size,
            image_size,
            input_channels,
            model.num_params()
        );

        Ok(Self {
            model,
            config,
            run: run.clone(),
            device: device.clone(),
            batcher: SegmentationBatcher::new(),
        })
    }

    /// Build and restore weights saved by [`Trainer::save`]
    pub fn from_saved(
        run: &RunConfig,
        input_channels: usize,
        image_size: usize,
        path: &Path,
        device: &B::Device,
    ) -> Result<Self> {
        let mut trainer = Self::build(run, input_channels, image_size, device)?;
        trainer.load(path)?;
        Ok(trainer)
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Train on `train_steps` batches per epoch and validate on
    /// `valid_steps` batches, for at most `epochs` epochs
    ///
    /// When training ends, early or not, the model holds the weights of the
    /// epoch with the lowest validation loss.
    pub fn fit<T, V>(
        &mut self,
        train: &mut T,
        train_steps: usize,
        valid: &mut V,
        valid_steps: usize,
        tracker: &mut dyn ExperimentTracker,
    ) -> Result<History>
    where
        T: Iterator<Item = (Array4<f32>, Array4<f32>)>,
        V: Iterator<Item = (Array4<f32>, Array4<f32>)>,
    {
        if train_steps == 0 || valid_steps == 0 {
            return Err(SegError::Training(format!(
                "need at least one step per epoch (train {}, valid {})",
                train_steps, valid_steps
            )));
        }

        let epochs = self.run.epochs;
        let learning_rate = self.run.learning_rate;
        let log_dir = self
            .run
            .log_dir
            .join(Local::now().format("%Y%m%d-%H%M%S").to_string());
        info!("Training curves will be written to {:?}", log_dir);

        let mut optimizer = AdamConfig::new().init();
        let mut logger = EpochLogger::new(epochs);
        let mut stopping = EarlyStopping::new(self.run.early_stopping_patience);
        // a record, not a clone: batch-norm running state is shared between clones
        let mut best_record: Option<<UNet<B> as Module<B>>::Record> = None;
        let mut history = History {
            log_dir: Some(log_dir.clone()),
            ..Default::default()
        };

        for epoch in 0..epochs {
            logger.begin(epoch);

            let mut train_stats = PixelStats::default();
            for step in 0..train_steps {
                let (images, masks) = train
                    .next()
                    .ok_or_else(|| SegError::Training("training generator exhausted".into()))?;
                let batch = self.batcher.batch_arrays::<B>(&images, &masks, &self.device);

                let logits = self.model.forward(batch.images);
                let loss = binary_cross_entropy_with_logits(logits.clone(), batch.masks.clone());
                let loss_value: f64 = loss.clone().into_scalar().elem();
                train_stats.update(logits.detach(), batch.masks, loss_value);

                let grads = GradientsParams::from_grads(loss.backward(), &self.model);
                self.model = optimizer.step(learning_rate, self.model.clone(), grads);

                if (step + 1) % 10 == 0 || step + 1 == train_steps {
                    debug!(
                        "step {}/{} loss {:.4} acc {:.4}",
                        step + 1,
                        train_steps,
                        loss_value,
                        train_stats.accuracy()
                    );
                }
            }

            let valid_model = self.model.valid();
            let mut valid_stats = PixelStats::default();
            for _ in 0..valid_steps {
                let (images, masks) = valid
                    .next()
                    .ok_or_else(|| SegError::Training("validation generator exhausted".into()))?;
                let batch = self
                    .batcher
                    .batch_arrays::<B::InnerBackend>(&images, &masks, &self.device);
                let logits = valid_model.forward(batch.images);
                let loss = binary_cross_entropy_with_logits(logits.clone(), batch.masks.clone());
                let loss_value: f64 = loss.into_scalar().elem();
                valid_stats.update(logits, batch.masks, loss_value);
            }

            let record = EpochRecord {
                epoch,
                loss: train_stats.loss(),
                acc: train_stats.accuracy(),
                precision: train_stats.precision(),
                auc: train_stats.auc(),
                val_loss: valid_stats.loss(),
                val_acc: valid_stats.accuracy(),
                val_precision: valid_stats.precision(),
                val_auc: valid_stats.auc(),
            };
            logger.end(record.loss, record.acc, record.val_loss, record.val_acc);
            for (name, value) in record.named() {
                tracker.log_metric_at(name, value, epoch)?;
            }
            let val_loss = record.val_loss;
            history.epochs.push(record);

            match stopping.update(epoch, val_loss) {
                StopDecision::Improved => best_record = Some(self.model.clone().into_record()),
                StopDecision::Waiting => {}
                StopDecision::Stop => {
                    logger.early_stop(self.run.early_stopping_patience, stopping.best_epoch());
                    history.stopped_early = true;
                    break;
                }
            }
        }

        if let Some(best) = best_record {
            self.model = self.model.clone().load_record(best);
        }
        history.best_epoch = stopping.best_epoch();
        history.best_val_loss = stopping.best();
        history.write(&log_dir)?;
        logger.complete(history.epochs.len(), history.best_val_loss);

        Ok(history)
    }

    /// Loss, pixel accuracy, precision and ROC-AUC over a held-out split
    pub fn evaluate(&self, split: &SplitData, batch_size: usize) -> Result<Vec<(String, f64)>> {
        if split.is_empty() {
            return Err(SegError::Evaluation("cannot evaluate an empty split".into()));
        }

        let model = self.model.valid();
        let mut stats = PixelStats::default();
        let batch_size = batch_size.max(1);
        for start in (0..split.len()).step_by(batch_size) {
            let end = (start + batch_size).min(split.len());
            let images = split.images.slice(s![start..end, .., .., ..]).to_owned();
            let masks = split.masks.slice(s![start..end, .., .., ..]).to_owned();
            let batch = self
                .batcher
                .batch_arrays::<B::InnerBackend>(&images, &masks, &self.device);
            let logits = model.forward(batch.images);
            let loss: f64 = binary_cross_entropy_with_logits(logits.clone(), batch.masks.clone())
                .into_scalar()
                .elem();
            stats.update(logits, batch.masks, loss);
        }

        Ok(vec![
            ("loss".to_string(), stats.loss()),
            ("acc".to_string(), stats.accuracy()),
            ("precision".to_string(), stats.precision()),
            ("auc".to_string(), stats.auc()),
        ])
    }

    /// Foreground probabilities, NHWC with one channel
    pub fn predict(&self, images: &Array4<f32>, batch_size: usize) -> Array4<f32> {
        let (n, h, w, _) = images.dim();
        let model = self.model.valid();
        let mut output = Array4::<f32>::zeros((n, h, w, 1));

        let mut start = 0;
        for chunk in images.axis_chunks_iter(Axis(0), batch_size.max(1)) {
            let len = chunk.len_of(Axis(0));
            let tensor = self
                .batcher
                .to_tensor::<B::InnerBackend>(&chunk.to_owned(), &self.device);
            let probabilities = tensor_to_nhwc(model.forward_probabilities(tensor));
            output
                .slice_mut(s![start..start + len, .., .., ..])
                .assign(&probabilities);
            start += len;
        }

        output
    }

    /// Threshold metrics of the model's predictions on a split
    pub fn segmentation_report(&self, split: &SplitData, batch_size: usize) -> Result<SegmentationReport> {
        let predictions = self.predict(&split.images, batch_size);
        let flatten = |a: &Array4<f32>| -> Vec<Vec<f32>> {
            a.outer_iter().map(|s| s.iter().copied().collect()).collect()
        };
        evaluate_predictions(&flatten(&predictions), &flatten(&split.masks))
    }

    /// Predict the test split, log every threshold metric and return
    /// `[accuracy, jaccard_score, precision, sensitivity, specificity]`
    pub fn test_additional_metrics(
        &self,
        test: &SplitData,
        tracker: &mut dyn ExperimentTracker,
    ) -> Result<[f64; 5]> {
        let report = self.segmentation_report(test, self.run.batch_size)?;

        info!("Test metrics over {} samples", report.samples);
        for (name, value) in report.named() {
            info!("  {}: {:.4}", name, value);
            tracker.log_metric(name, value)?;
        }

        Ok(report.as_vector())
    }

    /// Checkpoint path for the current resolution and time
    pub fn checkpoint_path(&self) -> PathBuf {
        let size = self.config.image_size;
        let timestamp = Local::now().format("%d%m%Y-%H%M%S");
        self.run
            .model_dir
            .join(format!("UNet_model_{}x{}_{}", size, size, timestamp))
    }

    /// Save the weights, creating the model directory if it is missing
    ///
    /// Returns the checkpoint path without the recorder's file extension.
    pub fn save(&self, tracker: &mut dyn ExperimentTracker) -> Result<PathBuf> {
        let path = self.checkpoint_path();
        self.save_to(&path)?;
        tracker.log_param("Saved Model Name", json!(path.display().to_string()))?;
        info!("Model weights saved: {}", path.display());
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        save_with_retry(path, |p| {
            self.model
                .clone()
                .save_file(p, &CompactRecorder::new())
                .map_err(|e| SegError::Model(format!("Failed to save model: {:?}", e)))
        })
    }

    /// Restore weights from a checkpoint
    pub fn load(&mut self, path: &Path) -> Result<()> {
        info!("Loading weights from {:?}", path);
        self.model = self
            .model
            .clone()
            .load_file(path, &CompactRecorder::new(), &self.device)
            .map_err(|e| SegError::Model(format!("Failed to load model: {:?}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::{FileTracker, NoopTracker};
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use tempfile::tempdir;

    type TestBackend = Autodiff<NdArray>;

    fn tiny_run(root: &Path) -> RunConfig {
        RunConfig {
            epochs: 2,
            batch_size: 2,
            feature_channels: vec![2, 4],
            log_dir: root.join("logs"),
            model_dir: root.join("models").join("nested"),
            early_stopping_patience: 5,
            ..Default::default()
        }
    }

    fn tiny_split(n: usize) -> SplitData {
        let images = Array4::from_shape_fn((n, 8, 8, 3), |(i, r, c, ch)| {
            ((i + r * 3 + c + ch) % 5) as f32 / 5.0
        });
        let masks = Array4::from_shape_fn((n, 8, 8, 1), |(_, r, c, _)| {
            if r < 4 && c < 4 { 1.0 } else { 0.0 }
        });
        SplitData::new(images, masks)
    }

    fn batches(split: &SplitData) -> impl Iterator<Item = (Array4<f32>, Array4<f32>)> + '_ {
        (0..).map(move |i| {
            let start = (i * 2) % split.len();
            (
                split.images.slice(s![start..start + 2, .., .., ..]).to_owned(),
                split.masks.slice(s![start..start + 2, .., .., ..]).to_owned(),
            )
        })
    }

    #[test]
    fn test_bce_with_logits_values() {
        let device = Default::default();
        let zeros = Tensor::<NdArray, 4>::zeros([1, 1, 2, 2], &device);
        let ones = Tensor::<NdArray, 4>::ones([1, 1, 2, 2], &device);

        let at_zero: f32 = binary_cross_entropy_with_logits(zeros, ones.clone()).into_scalar();
        assert!((at_zero - std::f32::consts::LN_2).abs() < 1e-5);

        let confident = ones.clone().mul_scalar(50.0);
        let small: f32 = binary_cross_entropy_with_logits(confident.clone(), ones).into_scalar();
        assert!(small < 1e-6);

        let wrong: f32 =
            binary_cross_entropy_with_logits(confident, Tensor::zeros([1, 1, 2, 2], &device)).into_scalar();
        assert!((wrong - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_pixel_stats() {
        let device = Default::default();
        let logits = Tensor::<NdArray, 4>::from_floats([[[[1.0, 1.0], [-1.0, -1.0]]]], &device);
        let targets = Tensor::<NdArray, 4>::from_floats([[[[1.0, 0.0], [0.0, 1.0]]]], &device);

        let mut stats = PixelStats::default();
        stats.update(logits, targets, 0.3);
        assert_eq!(stats.accuracy(), 0.5);
        assert_eq!(stats.precision(), 0.5);
        // one positive above one negative, the other pair inverted
        assert!((stats.auc() - 0.5).abs() < 1e-12);
        assert!((stats.loss() - 0.3).abs() < 1e-12);
        assert_eq!(PixelStats::default().precision(), 0.0);
    }

    #[test]
    fn test_early_stopping_patience() {
        let mut stopping = EarlyStopping::new(2);
        assert_eq!(stopping.update(0, 1.0), StopDecision::Improved);
        assert_eq!(stopping.update(1, 0.5), StopDecision::Improved);
        assert_eq!(stopping.update(2, 0.7), StopDecision::Waiting);
        assert_eq!(stopping.update(3, 0.5), StopDecision::Stop);
        assert_eq!(stopping.best_epoch(), Some(1));
        assert_eq!(stopping.best(), 0.5);
    }

    #[test]
    fn test_early_stopping_ignores_nan() {
        let mut stopping = EarlyStopping::new(3);
        assert_eq!(stopping.update(0, f64::NAN), StopDecision::Waiting);
        assert_eq!(stopping.best_epoch(), None);
    }

    #[test]
    fn test_history_csv() {
        let history = History {
            epochs: vec![EpochRecord {
                epoch: 0,
                loss: 0.5,
                acc: 0.75,
                precision: 0.25,
                auc: 0.8,
                val_loss: 0.6,
                val_acc: 0.7,
                val_precision: 0.2,
                val_auc: 0.65,
            }],
            ..Default::default()
        };
        let csv = history.to_csv();
        assert!(csv.starts_with("epoch,loss"));
        assert!(csv.contains("1,0.5,0.75,0.25,0.8,0.6,0.7,0.2,0.65"));
    }

    #[test]
    fn test_fit_writes_history_and_forwards_metrics() {
        let dir = tempdir().unwrap();
        let run = tiny_run(dir.path());
        let device = Default::default();
        let split = tiny_split(4);

        let mut trainer = Trainer::<TestBackend>::build(&run, 3, 8, &device).unwrap();
        let mut tracker = FileTracker::new(dir.path().join("tracking"));
        tracker.start_run("fit").unwrap();

        let history = trainer
            .fit(&mut batches(&split), 2, &mut batches(&split), 1, &mut tracker)
            .unwrap();

        assert_eq!(history.epochs.len(), 2);
        assert!(history.best_epoch.is_some());
        assert!(history.epochs.iter().all(|e| e.loss.is_finite()));
        assert!(history.epochs.iter().all(|e| (0.0..=1.0).contains(&e.acc)));

        let log_dir = history.log_dir.clone().unwrap();
        assert!(log_dir.starts_with(&run.log_dir));
        for file in ["history.json", "history.csv", "loss_curve.svg", "accuracy_curve.svg"] {
            assert!(log_dir.join(file).exists(), "{} missing", file);
        }

        let metrics = FileTracker::read_metrics(tracker.run_dir().unwrap()).unwrap();
        assert_eq!(metrics.len(), 16);
        assert_eq!(metrics[8].name, "loss");
        assert_eq!(metrics[8].step, Some(1));
        assert_eq!(metrics[3].name, "auc");
        assert!(history.epochs.iter().all(|e| (0.0..=1.0).contains(&e.val_auc)));
    }

    #[test]
    fn test_fit_stops_early_and_restores_best_weights() {
        let dir = tempdir().unwrap();
        let run = RunConfig {
            epochs: 4,
            early_stopping_patience: 1,
            ..tiny_run(dir.path())
        };
        let device = Default::default();
        let split = tiny_split(2);
        let first_valid = (split.images.clone(), split.masks.clone());

        // epoch 0 validates on the real masks, every later pass diverges
        let mut valid = (0..).map(|epoch| {
            let masks = if epoch == 0 {
                split.masks.clone()
            } else {
                split.masks.mapv(|_| f32::NAN)
            };
            (split.images.clone(), masks)
        });

        let mut trainer = Trainer::<TestBackend>::build(&run, 3, 8, &device).unwrap();
        let history = trainer
            .fit(&mut batches(&split), 2, &mut valid, 1, &mut NoopTracker)
            .unwrap();

        assert!(history.stopped_early);
        assert_eq!(history.epochs.len(), 2);
        assert!(history.epochs.len() < run.epochs);
        assert!(history.epochs[1].val_loss.is_nan());
        assert_eq!(history.best_epoch, Some(0));
        assert_eq!(history.best_val_loss, history.epochs[0].val_loss);

        // the model is back at the epoch 0 weights, not the epoch 1 ones
        let restored = trainer
            .evaluate(&SplitData::new(first_valid.0, first_valid.1), 2)
            .unwrap();
        let (name, loss) = &restored[0];
        assert_eq!(name, "loss");
        assert!((loss - history.epochs[0].val_loss).abs() < 1e-6);
    }

    #[test]
    fn test_fit_rejects_zero_steps() {
        let dir = tempdir().unwrap();
        let device = Default::default();
        let split = tiny_split(2);
        let mut trainer = Trainer::<TestBackend>::build(&tiny_run(dir.path()), 3, 8, &device).unwrap();

        let result = trainer.fit(&mut batches(&split), 0, &mut batches(&split), 1, &mut NoopTracker);
        assert!(matches!(result, Err(SegError::Training(_))));
    }

    #[test]
    fn test_evaluate_and_predict_shapes() {
        let dir = tempdir().unwrap();
        let device = Default::default();
        let split = tiny_split(3);
        let trainer = Trainer::<TestBackend>::build(&tiny_run(dir.path()), 3, 8, &device).unwrap();

        let results = trainer.evaluate(&split, 2).unwrap();
        let names: Vec<&str> = results.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["loss", "acc", "precision", "auc"]);

        let predictions = trainer.predict(&split.images, 2);
        assert_eq!(predictions.dim(), (3, 8, 8, 1));
        assert!(predictions.iter().all(|p| (0.0..=1.0).contains(p)));

        let vector = trainer.test_additional_metrics(&split, &mut NoopTracker).unwrap();
        assert_eq!(vector.len(), 5);
    }

    #[test]
    fn test_save_creates_directory_and_load_restores() {
        let dir = tempdir().unwrap();
        let run = tiny_run(dir.path());
        let device = Default::default();
        let split = tiny_split(2);

        let trainer = Trainer::<TestBackend>::build(&run, 3, 8, &device).unwrap();
        let mut tracker = FileTracker::new(dir.path().join("tracking"));
        tracker.start_run("save").unwrap();

        let path = trainer.save(&mut tracker).unwrap();
        assert!(path.starts_with(&run.model_dir));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("UNet_model_8x8_"));
        assert!(path.with_extension("mpk").exists());
        assert!(tracker.params().contains_key("Saved Model Name"));

        let restored = Trainer::<TestBackend>::from_saved(&run, 3, 8, &path, &device).unwrap();
        let a = trainer.predict(&split.images, 2);
        let b = restored.predict(&split.images, 2);
        for (x, y) in a.iter().zip(b.iter()) {
            // half-precision record
            assert!((x - y).abs() < 1e-2);
        }
    }
}
