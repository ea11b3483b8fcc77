//! End-to-end training run
//!
//! [`TrainingSession`] drives one run in order: load the splits, preprocess,
//! build the generators and the network, fit, save, evaluate on the test
//! split and report the threshold metrics. Every stage reports to the
//! experiment tracker.

use std::collections::BTreeMap;
use std::path::PathBuf;

use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::config::{ResolvedParams, RunConfig};
use crate::dataset::{DatasetSplits, GeneratorPair, PreprocessOutcome, PreprocessingPipeline};
use crate::tracking::ExperimentTracker;
use crate::training::trainer::{History, Trainer};
use crate::utils::error::Result;

/// What a finished run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub history: History,
    /// Checkpoint path without the recorder extension
    pub model_path: PathBuf,
    /// `loss`, `acc`, `precision` on the test split
    pub test_performance: Vec<(String, f64)>,
    /// `[accuracy, jaccard_score, precision, sensitivity, specificity]`
    pub test_metrics: [f64; 5],
    pub input_channels: usize,
    pub image_size: usize,
}

/// One training run over the persisted splits
pub struct TrainingSession<'a> {
    run: RunConfig,
    params: ResolvedParams,
    tracker: &'a mut dyn ExperimentTracker,
}

impl<'a> TrainingSession<'a> {
    pub fn new(run: RunConfig, params: ResolvedParams, tracker: &'a mut dyn ExperimentTracker) -> Self {
        Self { run, params, tracker }
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run
    }

    /// Open the tracking run and record the run-level parameters
    pub fn start(&mut self, run_name: &str) -> Result<()> {
        self.tracker.start_run(run_name)?;
        self.tracker
            .log_param("Feature channels", json!(self.run.feature_channels))?;

        let run_params: BTreeMap<String, Value> = self
            .run
            .run_params()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        self.tracker.log_params(&run_params)?;
        self.tracker.log_params(&self.params.augmentation_map())?;
        self.tracker.log_params(&self.params.preprocessing_map())?;
        Ok(())
    }

    /// Load the splits, truncating them in debug mode
    pub fn load_data(&mut self) -> Result<DatasetSplits> {
        let mut splits = DatasetSplits::load(&self.run.data_dir, &self.run.data_prefix)?;
        if self.run.debug_mode {
            splits.truncate(self.run.debug_samples);
        }

        let stats = splits.stats();
        stats.log();
        for (name, shape) in stats.entries() {
            self.tracker.log_param(name, json!(shape))?;
        }

        self.run.image_size = splits.image_size();
        info!("Image size: {}", self.run.image_size);
        Ok(splits)
    }

    /// Run the preprocessing pipeline and log the resulting statistics
    pub fn preprocess(&mut self, splits: DatasetSplits) -> Result<PreprocessOutcome> {
        let outcome = PreprocessingPipeline::new(&self.params.preprocessing, &self.run).apply(splits)?;

        if let Some(mean) = &outcome.channel_mean {
            self.tracker.log_param("mean_per_channel", json!(mean))?;
        }

        let splits = &outcome.splits;
        info!(
            "Prep done. Training samples: {}, channel mean: {:.4}, validation samples: {}, channel mean: {:.4}",
            splits.train.len(),
            splits.train.image_mean(),
            splits.val.len(),
            splits.val.image_mean()
        );
        Ok(outcome)
    }

    /// Augmented training and plain validation generators
    pub fn generators(&self, splits: &DatasetSplits) -> GeneratorPair {
        GeneratorPair::new(splits, &self.params.effective_augmentation(), &self.run)
    }

    /// Execute every stage and close the tracking run
    pub fn execute<B: AutodiffBackend>(&mut self, run_name: &str, device: &B::Device) -> Result<SessionReport> {
        self.start(run_name)?;

        let splits = self.load_data()?;
        let outcome = self.preprocess(splits)?;
        let mut generators = self.generators(&outcome.splits);

        let mut trainer = Trainer::<B>::build(
            &self.run,
            outcome.input_channels,
            self.run.image_size,
            device,
        )?;

        let history = trainer.fit(
            &mut generators.train,
            generators.train_steps,
            &mut generators.valid,
            generators.valid_steps,
            &mut *self.tracker,
        )?;

        let model_path = trainer.save(&mut *self.tracker)?;

        let test_performance = trainer.evaluate(&outcome.splits.test, self.run.batch_size)?;
        info!("Test performance: {:?}", test_performance);
        self.tracker
            .log_param("Test performance", json!(test_performance))?;

        let test_metrics = trainer.test_additional_metrics(&outcome.splits.test, &mut *self.tracker)?;
        self.tracker.end_run()?;

        Ok(SessionReport {
            history,
            model_path,
            test_performance,
            test_metrics,
            input_channels: outcome.input_channels,
            image_size: self.run.image_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ParamOverrides, ParamResolver, ParamValue};
    use crate::dataset::Split;
    use crate::tracking::FileTracker;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use ndarray::Array4;
    use ndarray_npy::write_npy;
    use std::path::Path;
    use tempfile::tempdir;

    fn write_dataset(dir: &Path, n: usize) {
        for split in Split::ALL {
            let images = Array4::from_shape_fn((n, 8, 8, 3), |(i, r, c, ch)| {
                ((i * 7 + r * 3 + c + ch) % 11) as f32 * 20.0
            });
            let masks = Array4::from_shape_fn((n, 8, 8, 1), |(_, r, c, _)| {
                if (2..6).contains(&r) && (2..6).contains(&c) { 255.0f32 } else { 0.0 }
            });
            write_npy(dir.join(split.file_name("cv_", "images")), &images).unwrap();
            write_npy(dir.join(split.file_name("cv_", "masks")), &masks).unwrap();
        }
    }

    #[test]
    fn test_full_session_with_file_tracker() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        write_dataset(&data_dir, 6);

        let run = RunConfig {
            epochs: 1,
            batch_size: 4,
            feature_channels: vec![2, 4],
            data_dir,
            log_dir: dir.path().join("logs"),
            model_dir: dir.path().join("models"),
            debug_mode: true,
            debug_samples: 4,
            ..Default::default()
        };
        let mut prep = ParamOverrides::new();
        prep.insert("per_channel_normalization".into(), ParamValue::Bool(true));
        prep.insert("augmentation".into(), ParamValue::Bool(true));
        let params = ParamResolver::new().resolve(&prep, &ParamOverrides::new()).unwrap();

        let mut tracker = FileTracker::new(dir.path().join("tracking"));
        let report = {
            let mut session = TrainingSession::new(run, params, &mut tracker);
            session
                .execute::<Autodiff<NdArray>>("unet", &Default::default())
                .unwrap()
        };

        assert_eq!(report.image_size, 8);
        assert_eq!(report.input_channels, 3);
        assert_eq!(report.history.epochs.len(), 1);
        assert!(report.model_path.with_extension("mpk").exists());
        assert_eq!(report.test_performance.len(), 4);
        assert_eq!(report.test_performance[3].0, "auc");

        let run_dir = std::fs::read_dir(dir.path().join("tracking"))
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let params: BTreeMap<String, Value> =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join("params.json")).unwrap()).unwrap();
        for key in [
            "Feature channels",
            "seed",
            "rotation_range",
            "per_channel_normalization",
            "Training set shape",
            "mean_per_channel",
            "Saved Model Name",
            "Test performance",
        ] {
            assert!(params.contains_key(key), "missing param {}", key);
        }
        assert_eq!(params["Training set shape"], json!("(4, 8, 8, 3)"));

        let metrics = FileTracker::read_metrics(&run_dir).unwrap();
        assert!(metrics.iter().any(|m| m.name == "isic_eval_score"));
        assert!(metrics.iter().any(|m| m.name == "val_loss" && m.step == Some(0)));
    }
}
