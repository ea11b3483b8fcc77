//! Batch generators
//!
//! [`ArrayFlow`] streams augmented mini-batches from one NHWC array without
//! end. Training pairs an image flow with a mask flow built from the same
//! parameters and seed: both shuffle identically and draw identical
//! transforms, so each mask stays aligned with its image.

use std::sync::Arc;

use ndarray::{Array4, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::config::{AugmentationParams, RunConfig};
use crate::dataset::augmentation::Augmenter;
use crate::dataset::loader::DatasetSplits;

/// Unbounded, restartable batch iterator over one array
#[derive(Debug, Clone)]
pub struct ArrayFlow {
    data: Arc<Array4<f32>>,
    augmenter: Augmenter,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    epoch: u64,
    position: usize,
    batches_seen: u64,
    order: Vec<usize>,
}

impl ArrayFlow {
    pub fn new(
        data: Arc<Array4<f32>>,
        augmenter: Augmenter,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> Self {
        let mut flow = Self {
            data,
            augmenter,
            batch_size: batch_size.max(1),
            shuffle,
            seed,
            epoch: 0,
            position: 0,
            batches_seen: 0,
            order: Vec::new(),
        };
        flow.start_epoch();
        flow
    }

    /// Number of samples
    pub fn samples(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    /// Steps per epoch: `ceil(samples / batch_size)`
    pub fn len(&self) -> usize {
        self.samples().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.samples() == 0
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Restart from the first epoch
    pub fn reset(&mut self) {
        self.epoch = 0;
        self.batches_seen = 0;
        self.start_epoch();
    }

    fn start_epoch(&mut self) {
        self.position = 0;
        self.order = (0..self.samples()).collect();
        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            self.order.shuffle(&mut rng);
        }
    }
}

impl Iterator for ArrayFlow {
    type Item = Array4<f32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_empty() {
            return None;
        }
        if self.position >= self.order.len() {
            self.epoch += 1;
            self.start_epoch();
        }

        let end = (self.position + self.batch_size).min(self.order.len());
        let indices = &self.order[self.position..end];
        let (_, h, w, c) = self.data.dim();

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(self.batches_seen));
        let mut batch = Array4::<f32>::zeros((indices.len(), h, w, c));
        for (slot, &index) in indices.iter().enumerate() {
            let sample = self.augmenter.augment(self.data.index_axis(Axis(0), index), &mut rng);
            batch.index_axis_mut(Axis(0), slot).assign(&sample);
        }

        self.position = end;
        self.batches_seen += 1;
        Some(batch)
    }
}

/// Image flow zipped with its mask flow
#[derive(Debug, Clone)]
pub struct PairedFlow {
    images: ArrayFlow,
    masks: ArrayFlow,
}

impl PairedFlow {
    /// Build both flows from the same augmentation parameters and seed
    pub fn new(
        images: Arc<Array4<f32>>,
        masks: Arc<Array4<f32>>,
        augmentation: &AugmentationParams,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> Self {
        Self {
            images: ArrayFlow::new(images, Augmenter::new(augmentation.clone()), batch_size, shuffle, seed),
            masks: ArrayFlow::new(masks, Augmenter::new(augmentation.clone()), batch_size, shuffle, seed),
        }
    }

    /// Steps per epoch
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn reset(&mut self) {
        self.images.reset();
        self.masks.reset();
    }
}

impl Iterator for PairedFlow {
    type Item = (Array4<f32>, Array4<f32>);

    fn next(&mut self) -> Option<Self::Item> {
        Some((self.images.next()?, self.masks.next()?))
    }
}

/// Training (augmented) and validation (plain) flows for one run
#[derive(Debug, Clone)]
pub struct GeneratorPair {
    pub train: PairedFlow,
    pub valid: PairedFlow,
    pub train_steps: usize,
    pub valid_steps: usize,
}

impl GeneratorPair {
    pub fn new(splits: &DatasetSplits, augmentation: &AugmentationParams, run: &RunConfig) -> Self {
        let train = PairedFlow::new(
            Arc::new(splits.train.images.clone()),
            Arc::new(splits.train.masks.clone()),
            augmentation,
            run.batch_size,
            run.shuffle,
            run.seed,
        );
        let valid = PairedFlow::new(
            Arc::new(splits.val.images.clone()),
            Arc::new(splits.val.masks.clone()),
            &AugmentationParams::disabled(),
            run.batch_size,
            run.shuffle,
            run.seed,
        );

        let train_steps = train.len();
        let valid_steps = valid.len();
        debug!("Generators ready: {} train steps, {} valid steps", train_steps, valid_steps);

        Self {
            train,
            valid,
            train_steps,
            valid_steps,
        }
    }
}
