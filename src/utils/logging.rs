//! Logging Module
//!
//! `tracing` output for the library and CLI, a progress helper for the long
//! per-sample preprocessing passes, and the per-epoch training log.

use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Dependencies that are chatty at `info`
const QUIET_TARGETS: [&str; 2] = ["burn_train", "cubecl"];

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum level for this crate; `RUST_LOG` overrides it when set
    pub level: Level,
    /// Show module paths
    pub include_target: bool,
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            include_target: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// Debug output with module paths
    pub fn verbose() -> Self {
        Self {
            level: Level::DEBUG,
            include_target: true,
            ..Self::default()
        }
    }

    /// Errors only
    pub fn quiet() -> Self {
        Self {
            level: Level::ERROR,
            ..Self::default()
        }
    }

    /// Filter directives for this configuration
    pub fn directives(&self) -> String {
        let mut directives = vec![self.level.to_string().to_lowercase()];
        if self.level < Level::DEBUG {
            // noisy dependencies never log above warn unless we are debugging
            let cap = self.level.min(Level::WARN).to_string().to_lowercase();
            directives.extend(QUIET_TARGETS.iter().map(|t| format!("{}={}", t, cap)));
        }
        directives.join(",")
    }
}

/// Install the global subscriber
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directives()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to initialize logging: {}", e))
}

/// Progress over the samples of one split: a terminal bar plus a log line
/// every `log_every` samples
pub struct SampleProgress {
    label: String,
    total: usize,
    done: usize,
    log_every: usize,
    started: Instant,
    bar: ProgressBar,
}

impl SampleProgress {
    pub fn new(label: &str, total: usize, log_every: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        let template = format!("  {{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {}", label);
        if let Ok(style) = ProgressStyle::default_bar().template(&template) {
            bar.set_style(style.progress_chars("#>-"));
        }

        Self {
            label: label.to_string(),
            total,
            done: 0,
            log_every: log_every.max(1),
            started: Instant::now(),
            bar,
        }
    }

    /// One more sample done
    pub fn tick(&mut self) {
        self.done += 1;
        self.bar.inc(1);
        if self.done % self.log_every == 0 && self.done < self.total {
            tracing::debug!("{}: {}/{} samples", self.label, self.done, self.total);
        }
    }

    pub fn done(&self) -> usize {
        self.done
    }

    pub fn finish(self) {
        self.bar.finish_and_clear();
        tracing::info!(
            "{}: {} samples in {:.2}s",
            self.label,
            self.done,
            self.started.elapsed().as_secs_f64()
        );
    }
}

/// Per-epoch training log
pub struct EpochLogger {
    epoch: usize,
    total_epochs: usize,
    epoch_start: Instant,
    training_start: Instant,
}

impl EpochLogger {
    pub fn new(total_epochs: usize) -> Self {
        Self {
            epoch: 0,
            total_epochs,
            epoch_start: Instant::now(),
            training_start: Instant::now(),
        }
    }

    pub fn begin(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.epoch_start = Instant::now();
        tracing::debug!("Epoch {}/{}", epoch + 1, self.total_epochs);
    }

    /// Seconds left at the mean epoch duration so far
    fn eta_secs(&self) -> f64 {
        let per_epoch = self.training_start.elapsed().as_secs_f64() / (self.epoch + 1) as f64;
        self.total_epochs.saturating_sub(self.epoch + 1) as f64 * per_epoch
    }

    pub fn end(&self, loss: f64, acc: f64, val_loss: f64, val_acc: f64) {
        tracing::info!(
            "Epoch {}/{} ({:.1}s) loss {:.4} acc {:.4} | val_loss {:.4} val_acc {:.4} | ETA {:.0}s",
            self.epoch + 1,
            self.total_epochs,
            self.epoch_start.elapsed().as_secs_f64(),
            loss,
            acc,
            val_loss,
            val_acc,
            self.eta_secs()
        );
    }

    pub fn early_stop(&self, patience: usize, best_epoch: Option<usize>) {
        match best_epoch {
            Some(best) => tracing::warn!(
                "Early stopping: val_loss flat for {} epochs, restoring epoch {}",
                patience,
                best + 1
            ),
            None => tracing::warn!("Early stopping: val_loss never became finite"),
        }
    }

    pub fn complete(&self, epochs_run: usize, best_val_loss: f64) {
        tracing::info!(
            "Training finished after {} epochs in {:.1}s, best val_loss {:.4}",
            epochs_run,
            self.training_start.elapsed().as_secs_f64(),
            best_val_loss
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_silence_dependencies() {
        let directives = LogConfig::default().directives();
        assert!(directives.starts_with("info"));
        assert!(directives.contains("cubecl=warn"));
    }

    #[test]
    fn test_verbose_keeps_dependency_output() {
        assert_eq!(LogConfig::verbose().directives(), "debug");
    }

    #[test]
    fn test_quiet_silences_dependency_warnings() {
        assert_eq!(
            LogConfig::quiet().directives(),
            "error,burn_train=error,cubecl=error"
        );
        assert_eq!(
            LogConfig::default().directives(),
            "info,burn_train=warn,cubecl=warn"
        );
    }

    #[test]
    fn test_sample_progress_counts() {
        let mut progress = SampleProgress::new("ZCA train", 3, 2);
        progress.tick();
        progress.tick();
        assert_eq!(progress.done(), 2);
        progress.finish();
    }
}
