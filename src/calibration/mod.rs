// src/calibration/mod.rs
//! Calibration: feed representative batches through the float model and turn
//! the observed activations into per-tensor ranges.

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use crate::errors::{QuantizeError, Result};

pub mod calibrator;
pub mod inference;
pub mod methods;
pub mod stats;

pub use calibrator::{CalibrationOptions, Calibrator};
pub use inference::{InferenceSession, TractSession};
pub use methods::CalibrationMethod;

/// One calibration step: model input name → float tensor.
pub type CalibrationBatch = HashMap<String, ArrayD<f32>>;

/// Finite, lazy source of calibration batches. Consumed once, never rewound.
pub trait CalibrationDataReader {
    fn next_batch(&mut self) -> Option<CalibrationBatch>;
}

impl<I> CalibrationDataReader for I
where
    I: Iterator<Item = CalibrationBatch>,
{
    fn next_batch(&mut self) -> Option<CalibrationBatch> {
        self.next()
    }
}

// ===========================================================================
// Dataset
// ===========================================================================

#[derive(Debug, Clone)]
pub struct CalibrationDataset {
    pub samples: Vec<Vec<f32>>,

    /// Shape of one sample, without the batch dimension.
    pub shape: Vec<usize>,

    pub num_samples: usize,
}

impl CalibrationDataset {
    /// Load an `.npy` file whose first axis indexes samples.
    pub fn from_numpy(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(QuantizeError::CalibrationData {
                reason: format!("File not found: {}", path.display()),
            });
        }
        if path.extension().and_then(|s| s.to_str()) != Some("npy") {
            return Err(QuantizeError::CalibrationData {
                reason: format!("Only .npy files supported: {}", path.display()),
            });
        }

        let array: ArrayD<f32> = ndarray_npy::read_npy(path).map_err(|e| QuantizeError::CalibrationData {
            reason: format!("Failed to read NPY file {}: {}", path.display(), e),
        })?;

        let shape = array.shape().to_vec();
        if shape.is_empty() {
            return Err(QuantizeError::CalibrationData {
                reason: "NPY array must have a leading sample axis".to_string(),
            });
        }

        let num_samples = shape[0];
        let sample_size: usize = shape[1..].iter().product();
        let data: Vec<f32> = array.iter().copied().collect();
        let samples = (0..num_samples)
            .map(|i| data[i * sample_size..(i + 1) * sample_size].to_vec())
            .collect();

        Self::from_samples(samples, shape[1..].to_vec())
    }

    pub fn random(shape: Vec<usize>, num_samples: usize, range: (f32, f32)) -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        let sample_size: usize = shape.iter().product();
        let samples = (0..num_samples)
            .map(|_| (0..sample_size).map(|_| rng.gen_range(range.0..range.1)).collect())
            .collect();

        Self {
            samples,
            shape,
            num_samples,
        }
    }

    pub fn from_samples(samples: Vec<Vec<f32>>, shape: Vec<usize>) -> Result<Self> {
        let num_samples = samples.len();

        if num_samples == 0 {
            return Err(QuantizeError::CalibrationData {
                reason: "No samples provided".to_string(),
            });
        }

        let expected_size: usize = shape.iter().product();
        for (i, sample) in samples.iter().enumerate() {
            if sample.len() != expected_size {
                return Err(QuantizeError::CalibrationData {
                    reason: format!(
                        "Sample {} has size {} but expected {} (shape: {:?})",
                        i,
                        sample.len(),
                        expected_size,
                        shape
                    ),
                });
            }
        }

        Ok(Self {
            samples,
            shape,
            num_samples,
        })
    }

    pub fn sample_shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.num_samples
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }

    /// Reader yielding `[batch_size, ..shape]` tensors bound to `input_name`.
    /// The last batch may be smaller.
    pub fn into_reader(self, input_name: impl Into<String>, batch_size: usize) -> DatasetReader {
        DatasetReader {
            dataset: self,
            input_name: input_name.into(),
            batch_size: batch_size.max(1),
            cursor: 0,
        }
    }
}

/// Iterator over a [`CalibrationDataset`]; a [`CalibrationDataReader`] through
/// the blanket impl.
#[derive(Debug)]
pub struct DatasetReader {
    dataset: CalibrationDataset,
    input_name: String,
    batch_size: usize,
    cursor: usize,
}

impl Iterator for DatasetReader {
    type Item = CalibrationBatch;

    fn next(&mut self) -> Option<CalibrationBatch> {
        if self.cursor >= self.dataset.num_samples {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.dataset.num_samples);
        let rows = &self.dataset.samples[self.cursor..end];
        self.cursor = end;

        let mut shape = vec![rows.len()];
        shape.extend_from_slice(&self.dataset.shape);
        let data: Vec<f32> = rows.iter().flatten().copied().collect();
        // Sample sizes are checked on construction, so the shape always fits.
        let array = ArrayD::from_shape_vec(IxDyn(&shape), data).ok()?;

        Some(HashMap::from([(self.input_name.clone(), array)]))
    }
}

// ===========================================================================
// Ranges
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TensorRange {
    pub min: f32,
    pub max: f32,
}

impl TensorRange {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// Range of `values`, ignoring NaN and ±inf. `None` when nothing finite
    /// is left.
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a f32>) -> Option<Self> {
        let mut range: Option<Self> = None;
        for &v in values {
            if !v.is_finite() {
                continue;
            }
            range = Some(match range {
                None => Self::new(v, v),
                Some(r) => Self::new(r.min.min(v), r.max.max(v)),
            });
        }
        range
    }

    pub fn union(self, other: Self) -> Self {
        Self::new(self.min.min(other.min), self.max.max(other.max))
    }

    /// `alpha · self + (1 − alpha) · batch`, componentwise.
    pub fn moving_average(self, batch: Self, alpha: f32) -> Self {
        Self::new(
            alpha * self.min + (1.0 - alpha) * batch.min,
            alpha * self.max + (1.0 - alpha) * batch.max,
        )
    }

    /// `[-m, m]` with `m = max(|min|, |max|)`.
    pub fn symmetric(self) -> Self {
        let m = self.min.abs().max(self.max.abs());
        Self::new(-m, m)
    }
}

/// Calibration result: tensor name → range. Immutable once handed to the
/// quantizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TensorRangeTable {
    ranges: BTreeMap<String, TensorRange>,
}

impl TensorRangeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, range: TensorRange) {
        self.ranges.insert(name.into(), range);
    }

    pub fn get(&self, name: &str) -> Option<TensorRange> {
        self.ranges.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ranges.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, TensorRange)> {
        self.ranges.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| QuantizeError::Other(format!("failed to serialize ranges: {e}")))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| QuantizeError::CalibrationData {
            reason: format!("Invalid range table: {e}"),
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_yaml()?)
            .map_err(|e| QuantizeError::Other(format!("failed to write {}: {e}", path.display())))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| QuantizeError::CalibrationData {
            reason: format!("Failed to read {}: {e}", path.display()),
        })?;
        Self::from_yaml(&content)
    }
}

impl FromIterator<(String, TensorRange)> for TensorRangeTable {
    fn from_iter<T: IntoIterator<Item = (String, TensorRange)>>(iter: T) -> Self {
        Self {
            ranges: iter.into_iter().collect(),
        }
    }
}
