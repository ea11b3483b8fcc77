//! Experiment tracking
//!
//! Training reports parameters and metrics through [`ExperimentTracker`] so
//! the pipeline runs the same with or without a tracking backend.
//! [`FileTracker`] keeps everything on disk as JSON:
//!
//! ```text
//! tracking_dir/<run_name>-<YYYYmmdd-HHMMSS>/
//!     params.json     all parameters, rewritten on every change
//!     metrics.jsonl   one {"name", "value", "step", "timestamp"} object per line
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::utils::error::{Result, SegError};

/// Sink for run parameters and metrics
pub trait ExperimentTracker {
    fn start_run(&mut self, run_name: &str) -> Result<()>;

    fn log_param(&mut self, name: &str, value: Value) -> Result<()>;

    fn log_params(&mut self, params: &BTreeMap<String, Value>) -> Result<()> {
        for (name, value) in params {
            self.log_param(name, value.clone())?;
        }
        Ok(())
    }

    fn log_metric(&mut self, name: &str, value: f64) -> Result<()>;

    /// Metric tied to a step, e.g. an epoch
    fn log_metric_at(&mut self, name: &str, value: f64, step: usize) -> Result<()>;

    fn end_run(&mut self) -> Result<()>;
}

/// Tracker that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracker;

impl ExperimentTracker for NoopTracker {
    fn start_run(&mut self, _run_name: &str) -> Result<()> {
        Ok(())
    }

    fn log_param(&mut self, _name: &str, _value: Value) -> Result<()> {
        Ok(())
    }

    fn log_metric(&mut self, _name: &str, _value: f64) -> Result<()> {
        Ok(())
    }

    fn log_metric_at(&mut self, _name: &str, _value: f64, _step: usize) -> Result<()> {
        Ok(())
    }

    fn end_run(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One line of `metrics.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    /// `null` in the file when the value is not finite
    pub value: Option<f64>,
    pub step: Option<usize>,
    pub timestamp: String,
}

/// Tracker writing one directory per run
#[derive(Debug)]
pub struct FileTracker {
    root: PathBuf,
    run_dir: Option<PathBuf>,
    params: BTreeMap<String, Value>,
    metrics: Option<File>,
}

impl FileTracker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            run_dir: None,
            params: BTreeMap::new(),
            metrics: None,
        }
    }

    /// Directory of the active run
    pub fn run_dir(&self) -> Option<&Path> {
        self.run_dir.as_deref()
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    fn active_dir(&self) -> Result<&Path> {
        self.run_dir
            .as_deref()
            .ok_or_else(|| SegError::Tracking("no active run, call start_run first".into()))
    }

    fn write_params(&self) -> Result<()> {
        let path = self.active_dir()?.join("params.json");
        fs::write(path, serde_json::to_string_pretty(&self.params)?)?;
        Ok(())
    }

    fn append_metric(&mut self, name: &str, value: f64, step: Option<usize>) -> Result<()> {
        let record = MetricRecord {
            name: name.to_string(),
            value: value.is_finite().then_some(value),
            step,
            timestamp: Local::now().to_rfc3339(),
        };
        let line = serde_json::to_string(&record)?;

        let file = self
            .metrics
            .as_mut()
            .ok_or_else(|| SegError::Tracking("no active run, call start_run first".into()))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Read back the metric lines of a run directory
    pub fn read_metrics(run_dir: &Path) -> Result<Vec<MetricRecord>> {
        let contents = fs::read_to_string(run_dir.join("metrics.jsonl"))?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(SegError::from))
            .collect()
    }
}

impl ExperimentTracker for FileTracker {
    fn start_run(&mut self, run_name: &str) -> Result<()> {
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let mut dir = self.root.join(format!("{}-{}", run_name, stamp));
        // two runs started within the same second
        let mut suffix = 1;
        while dir.exists() {
            dir = self.root.join(format!("{}-{}-{}", run_name, stamp, suffix));
            suffix += 1;
        }
        fs::create_dir_all(&dir)?;

        let metrics = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("metrics.jsonl"))?;

        info!("Tracking run {:?}", dir);
        self.params.clear();
        self.metrics = Some(metrics);
        self.run_dir = Some(dir);
        self.write_params()
    }

    fn log_param(&mut self, name: &str, value: Value) -> Result<()> {
        debug!("param {} = {}", name, value);
        self.params.insert(name.to_string(), value);
        self.write_params()
    }

    fn log_params(&mut self, params: &BTreeMap<String, Value>) -> Result<()> {
        self.active_dir()?;
        self.params
            .extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.write_params()
    }

    fn log_metric(&mut self, name: &str, value: f64) -> Result<()> {
        self.append_metric(name, value, None)
    }

    fn log_metric_at(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        self.append_metric(name, value, Some(step))
    }

    fn end_run(&mut self) -> Result<()> {
        if let Some(mut file) = self.metrics.take() {
            file.flush()?;
        }
        if let Some(dir) = self.run_dir.take() {
            info!("Tracking run {:?} finished", dir);
        }
        Ok(())
    }
}

/// Tracker selected by the run configuration
pub fn tracker_for(tracking_dir: Option<&Path>) -> Box<dyn ExperimentTracker> {
    match tracking_dir {
        Some(dir) => Box::new(FileTracker::new(dir)),
        None => Box::new(NoopTracker),
    }
}
