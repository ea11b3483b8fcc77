//! Split Array Loader
//!
//! Reads the six pre-split `.npy` arrays (train/val/test images and masks)
//! and validates that their shapes agree before anything else touches them.

use std::path::{Path, PathBuf};

use ndarray::{s, Array4, ArrayD, Axis, Ix4};
use ndarray_npy::read_npy;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::utils::error::DatasetError;
use crate::utils::format_shape;

/// Dataset split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    pub fn name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }

    /// Array file name for this split, e.g. `cv_train_images.npy`
    pub fn file_name(&self, prefix: &str, kind: &str) -> String {
        format!("{}{}_{}.npy", prefix, self.name(), kind)
    }
}

/// Images and masks of one split, both NHWC
#[derive(Debug, Clone)]
pub struct SplitData {
    pub images: Array4<f32>,
    pub masks: Array4<f32>,
}

impl SplitData {
    pub fn new(images: Array4<f32>, masks: Array4<f32>) -> Self {
        Self { images, masks }
    }

    pub fn len(&self) -> usize {
        self.images.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channels(&self) -> usize {
        self.images.len_of(Axis(3))
    }

    /// Mean intensity over every image pixel
    pub fn image_mean(&self) -> f64 {
        self.images.iter().map(|&v| v as f64).sum::<f64>() / self.images.len().max(1) as f64
    }

    /// Keep only the first `n` samples
    pub fn truncate(&mut self, n: usize) {
        let n = n.min(self.len());
        self.images = self.images.slice(s![..n, .., .., ..]).to_owned();
        self.masks = self.masks.slice(s![..n, .., .., ..]).to_owned();
    }

    fn validate(&self, split: Split) -> Result<(), DatasetError> {
        if self.is_empty() {
            return Err(DatasetError::EmptySplit(split.name().to_string()));
        }
        let image_shape = self.images.shape();
        let mask_shape = self.masks.shape();
        if image_shape[1] != image_shape[2] {
            return Err(DatasetError::NotSquare {
                split: split.name().to_string(),
                height: image_shape[1],
                width: image_shape[2],
            });
        }
        for (axis, dimension) in [(0, "samples"), (1, "height"), (2, "width")] {
            if image_shape[axis] != mask_shape[axis] {
                return Err(DatasetError::ShapeMismatch {
                    split: split.name().to_string(),
                    dimension,
                    expected: image_shape[axis],
                    found: mask_shape[axis],
                });
            }
        }
        if mask_shape[3] != 1 {
            return Err(DatasetError::ShapeMismatch {
                split: split.name().to_string(),
                dimension: "mask channels",
                expected: 1,
                found: mask_shape[3],
            });
        }
        Ok(())
    }
}

/// Shapes of the three splits, reported after loading
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetStats {
    pub train_shape: Vec<usize>,
    pub val_shape: Vec<usize>,
    pub test_shape: Vec<usize>,
}

impl DatasetStats {
    /// Named shape entries as logged to the tracker
    pub fn entries(&self) -> [(&'static str, String); 3] {
        [
            ("Training set shape", format_shape(&self.train_shape)),
            ("Validation set shape", format_shape(&self.val_shape)),
            ("Test set shape", format_shape(&self.test_shape)),
        ]
    }

    pub fn log(&self) {
        for (name, shape) in self.entries() {
            info!("{}: {}", name, shape);
        }
    }
}

/// Train, validation and test splits
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: SplitData,
    pub val: SplitData,
    pub test: SplitData,
}

impl DatasetSplits {
    /// Build from in-memory arrays, validating shapes
    pub fn new(train: SplitData, val: SplitData, test: SplitData) -> Result<Self, DatasetError> {
        let splits = Self { train, val, test };
        splits.validate()?;
        Ok(splits)
    }

    /// Load `{prefix}{split}_{images|masks}.npy` from `dir`
    pub fn load(dir: &Path, prefix: &str) -> Result<Self, DatasetError> {
        info!("Loading dataset from {:?}", dir);

        let read_split = |split: Split| -> Result<SplitData, DatasetError> {
            let images = read_array(&dir.join(split.file_name(prefix, "images")))?;
            let masks = read_array(&dir.join(split.file_name(prefix, "masks")))?;
            debug!(
                "{}: images {:?}, masks {:?}",
                split.name(),
                images.shape(),
                masks.shape()
            );
            Ok(SplitData::new(images, masks))
        };

        Self::new(
            read_split(Split::Train)?,
            read_split(Split::Val)?,
            read_split(Split::Test)?,
        )
    }

    pub fn split(&self, split: Split) -> &SplitData {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
            Split::Test => &self.test,
        }
    }

    pub fn split_mut(&mut self, split: Split) -> &mut SplitData {
        match split {
            Split::Train => &mut self.train,
            Split::Val => &mut self.val,
            Split::Test => &mut self.test,
        }
    }

    /// Check per-split image/mask agreement and cross-split spatial and
    /// channel agreement
    pub fn validate(&self) -> Result<(), DatasetError> {
        for split in Split::ALL {
            self.split(split).validate(split)?;
        }

        let reference = self.train.images.shape();
        for split in [Split::Val, Split::Test] {
            let shape = self.split(split).images.shape();
            for (axis, dimension) in [(1, "height"), (2, "width"), (3, "channels")] {
                if shape[axis] != reference[axis] {
                    return Err(DatasetError::ShapeMismatch {
                        split: split.name().to_string(),
                        dimension,
                        expected: reference[axis],
                        found: shape[axis],
                    });
                }
            }
        }
        Ok(())
    }

    /// Square input resolution, taken from the test images' width
    pub fn image_size(&self) -> usize {
        self.test.images.len_of(Axis(2))
    }

    pub fn input_channels(&self) -> usize {
        self.train.channels()
    }

    /// Keep only the first `n` samples of every split
    pub fn truncate(&mut self, n: usize) {
        for split in Split::ALL {
            self.split_mut(split).truncate(n);
        }
        info!("Debug mode: splits truncated to {} samples", n);
    }

    pub fn stats(&self) -> DatasetStats {
        DatasetStats {
            train_shape: self.train.images.shape().to_vec(),
            val_shape: self.val.images.shape().to_vec(),
            test_shape: self.test.images.shape().to_vec(),
        }
    }
}

/// Read one `.npy` array as `f32` NHWC
///
/// `f32`, `f64` and `u8` element types are accepted. A 3-D array is treated
/// as single-channel and gains a trailing channel axis.
pub fn read_array(path: &Path) -> Result<Array4<f32>, DatasetError> {
    if !path.exists() {
        return Err(DatasetError::MissingFile(path.to_path_buf()));
    }

    let array = read_any_dtype(path)?;
    let array = match array.ndim() {
        4 => array,
        3 => array.insert_axis(Axis(3)),
        _ => {
            return Err(DatasetError::Rank {
                name: display_name(path),
                shape: array.shape().to_vec(),
            })
        }
    };

    array
        .into_dimensionality::<Ix4>()
        .map_err(|e| DatasetError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn read_any_dtype(path: &Path) -> Result<ArrayD<f32>, DatasetError> {
    let first_error = match read_npy::<_, ArrayD<f32>>(path) {
        Ok(array) => return Ok(array),
        Err(e) => e,
    };
    if let Ok(array) = read_npy::<_, ArrayD<f64>>(path) {
        return Ok(array.mapv(|v| v as f32));
    }
    if let Ok(array) = read_npy::<_, ArrayD<u8>>(path) {
        return Ok(array.mapv(f32::from));
    }
    Err(DatasetError::Read {
        path: path.to_path_buf(),
        reason: first_error.to_string(),
    })
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| PathBuf::from(path).display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use ndarray_npy::write_npy;

    fn split(n: usize, size: usize, channels: usize) -> SplitData {
        SplitData::new(
            Array4::zeros((n, size, size, channels)),
            Array4::zeros((n, size, size, 1)),
        )
    }

    #[test]
    fn test_file_names() {
        assert_eq!(Split::Train.file_name("cv_", "images"), "cv_train_images.npy");
        assert_eq!(Split::Test.file_name("", "masks"), "test_masks.npy");
    }

    #[test]
    fn test_valid_splits() {
        let splits = DatasetSplits::new(split(4, 8, 3), split(2, 8, 3), split(2, 8, 3)).unwrap();
        assert_eq!(splits.image_size(), 8);
        assert_eq!(splits.input_channels(), 3);
        assert_eq!(splits.stats().train_shape, vec![4, 8, 8, 3]);
    }

    #[test]
    fn test_count_mismatch_names_split() {
        let mut val = split(2, 8, 3);
        val.masks = Array4::zeros((3, 8, 8, 1));
        let err = DatasetSplits::new(split(4, 8, 3), val, split(2, 8, 3)).unwrap_err();
        match err {
            DatasetError::ShapeMismatch { split, dimension, .. } => {
                assert_eq!(split, "val");
                assert_eq!(dimension, "samples");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_spatial_mismatch_across_splits() {
        let err = DatasetSplits::new(split(4, 8, 3), split(2, 8, 3), split(2, 16, 3)).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::ShapeMismatch { dimension: "height", expected: 8, found: 16, .. }
        ));
    }

    #[test]
    fn test_non_square_images_rejected() {
        let wide = SplitData::new(Array4::zeros((2, 8, 16, 3)), Array4::zeros((2, 8, 16, 1)));
        let err = DatasetSplits::new(split(4, 8, 3), split(2, 8, 3), wide).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::NotSquare { ref split, height: 8, width: 16 } if split == "test"
        ));
    }

    #[test]
    fn test_empty_split_rejected() {
        let err = DatasetSplits::new(split(4, 8, 3), split(0, 8, 3), split(2, 8, 3)).unwrap_err();
        assert!(matches!(err, DatasetError::EmptySplit(s) if s == "val"));
    }

    #[test]
    fn test_truncate() {
        let mut splits = DatasetSplits::new(split(4, 8, 3), split(3, 8, 3), split(2, 8, 3)).unwrap();
        splits.truncate(2);
        assert_eq!(splits.train.len(), 2);
        assert_eq!(splits.val.len(), 2);
        assert_eq!(splits.test.len(), 2);
    }

    #[test]
    fn test_read_array_promotes_3d_u8_masks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.npy");
        let mask: Array3<u8> = Array3::from_elem((2, 4, 4), 255);
        write_npy(&path, &mask).unwrap();

        let array = read_array(&path).unwrap();
        assert_eq!(array.shape(), &[2, 4, 4, 1]);
        assert_eq!(array[[1, 3, 3, 0]], 255.0);
    }

    #[test]
    fn test_read_array_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_array(&dir.path().join("nope.npy")).unwrap_err();
        assert!(matches!(err, DatasetError::MissingFile(_)));
    }

    #[test]
    fn test_read_array_rejects_2d() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.npy");
        write_npy(&path, &ndarray::Array2::<f32>::zeros((3, 3))).unwrap();
        assert!(matches!(read_array(&path), Err(DatasetError::Rank { .. })));
    }
}
