// src/calibration/calibrator.rs
//! Range collection over calibration batches.
//!
//! Usage:
//! ```ignore
//! let mut calibrator = Calibrator::new(&model, &op_types, CalibrationOptions::default());
//! let augmented = calibrator.augment_model(&model);
//! let mut session = TractSession::new(&augmented)?;
//! calibrator.collect_data(&mut session, &mut reader)?;
//! let ranges = calibrator.compute_range()?;
//! ```

use ndarray::ArrayD;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::calibration::stats::Histogram;
use crate::calibration::{CalibrationDataReader, CalibrationMethod, InferenceSession, TensorRange, TensorRangeTable};
use crate::config::QuantizationConfig;
use crate::errors::{QuantizeError, Result};
use crate::graph::{GraphIndex, GraphModel, ValueInfo, ValueType};

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationOptions {
    pub method: CalibrationMethod,
    /// Force `[-m, m]` ranges (MinMax, Percentile).
    pub symmetric: bool,
    pub moving_average: bool,
    /// Weight of the previous range in the moving average.
    pub averaging_constant: f32,
    pub percentile: f32,
    /// Histogram bins; the method's default when unset.
    pub num_bins: Option<usize>,
    pub num_quantized_bins: usize,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            method: CalibrationMethod::MinMax,
            symmetric: false,
            moving_average: false,
            averaging_constant: 0.01,
            percentile: 99.999,
            num_bins: None,
            num_quantized_bins: 128,
        }
    }
}

impl CalibrationOptions {
    pub fn from_config(config: &QuantizationConfig) -> Self {
        let extra = &config.extra_options;
        Self {
            method: config.calibrate_method,
            symmetric: extra.calib_tensor_range_symmetric,
            moving_average: extra.calib_moving_average,
            averaging_constant: extra.calib_moving_average_constant,
            percentile: extra.calib_percentile,
            num_bins: extra.calib_num_bins,
            num_quantized_bins: extra.calib_num_quantized_bins,
        }
    }

    fn bins(&self) -> usize {
        self.num_bins.unwrap_or_else(|| self.method.default_num_bins())
    }
}

pub struct Calibrator {
    options: CalibrationOptions,
    /// Tensors to observe, in graph order.
    tensors: Vec<String>,
    /// Subset of `tensors` annotated as float.
    known_float: HashSet<String>,
    ranges: HashMap<String, TensorRange>,
    histograms: HashMap<String, Histogram>,
    batches: usize,
}

impl std::fmt::Debug for Calibrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Calibrator")
            .field("method", &self.options.method)
            .field("tensors_count", &self.tensors.len())
            .field("batches", &self.batches)
            .finish()
    }
}

impl Calibrator {
    /// Select the inputs and outputs of every node whose op type is in
    /// `op_types` (all nodes when empty). Initializers and tensors annotated
    /// with a non-float type are skipped; unannotated tensors are kept and
    /// observed if the backend returns them as float.
    pub fn new(model: &GraphModel, op_types: &[String], options: CalibrationOptions) -> Self {
        let graph = &model.graph;
        let index = GraphIndex::new(graph);

        let mut seen = HashSet::new();
        let mut tensors = Vec::new();
        let mut known_float = HashSet::new();

        for node in &graph.nodes {
            if !op_types.is_empty() && !op_types.iter().any(|t| *t == node.op_type) {
                continue;
            }
            for name in node.inputs.iter().chain(node.outputs.iter()) {
                if name.is_empty() || index.is_initializer(name) || !seen.insert(name.as_str()) {
                    continue;
                }
                match index.elem_type(name) {
                    Some(t) if t.is_float() => {
                        known_float.insert(name.clone());
                        tensors.push(name.clone());
                    }
                    Some(_) => {}
                    None => tensors.push(name.clone()),
                }
            }
        }

        debug!(count = tensors.len(), "tensors selected for calibration");

        Self {
            options,
            tensors,
            known_float,
            ranges: HashMap::new(),
            histograms: HashMap::new(),
            batches: 0,
        }
    }

    pub fn tensors_to_calibrate(&self) -> &[String] {
        &self.tensors
    }

    pub fn options(&self) -> &CalibrationOptions {
        &self.options
    }

    /// Copy of `model` with every selected tensor exposed as a graph output.
    pub fn augment_model(&self, model: &GraphModel) -> GraphModel {
        let mut augmented = model.clone();
        let graph = &model.graph;
        let existing: HashSet<&str> = graph.outputs.iter().map(|o| o.name.as_str()).collect();

        for name in self.tensors.iter().filter(|n| !existing.contains(n.as_str())) {
            let info = graph
                .value_info
                .iter()
                .chain(graph.inputs.iter())
                .find(|v| v.name == *name)
                .cloned()
                .unwrap_or_else(|| ValueInfo {
                    name: name.clone(),
                    ty: ValueType::Unknown,
                    doc_string: String::new(),
                });
            augmented.graph.outputs.push(info);
        }
        augmented
    }

    /// Run every batch the reader yields through `session`. The reader is
    /// drained; returns the number of batches consumed.
    pub fn collect_data<S, R>(&mut self, session: &mut S, reader: &mut R) -> Result<usize>
    where
        S: InferenceSession + ?Sized,
        R: CalibrationDataReader + ?Sized,
    {
        let start = self.batches;
        while let Some(batch) = reader.next_batch() {
            let outputs = session.run(&batch)?;
            self.observe(&outputs);
            debug!(batch = self.batches, observed = outputs.len(), "calibration batch");
        }

        if self.batches == 0 {
            return Err(QuantizeError::CalibrationData {
                reason: "calibration reader yielded no batches".to_string(),
            });
        }

        let collected = self.batches - start;
        info!(batches = collected, tensors = self.tensors.len(), method = %self.options.method, "calibration data collected");
        Ok(collected)
    }

    /// Fold one batch of observations into the per-tensor accumulators.
    pub fn observe(&mut self, outputs: &HashMap<String, ArrayD<f32>>) {
        self.batches += 1;
        let bins = self.options.bins();

        for name in &self.tensors {
            let Some(array) = outputs.get(name) else {
                continue;
            };

            if self.options.method.uses_histogram() {
                let values: Vec<f32> = array.iter().copied().filter(|v| v.is_finite()).collect();
                if values.is_empty() {
                    continue;
                }
                match self.histograms.get_mut(name) {
                    Some(hist) => hist.collect(&values),
                    None => {
                        self.histograms.insert(name.clone(), Histogram::from_values(&values, bins));
                    }
                }
                continue;
            }

            let Some(batch_range) = TensorRange::from_values(array.iter()) else {
                continue;
            };
            let updated = match self.ranges.get(name) {
                None => batch_range,
                Some(prev) if self.options.moving_average => {
                    prev.moving_average(batch_range, self.options.averaging_constant)
                }
                Some(prev) => prev.union(batch_range),
            };
            self.ranges.insert(name.clone(), updated);
        }
    }

    pub fn compute_range(&self) -> Result<TensorRangeTable> {
        if self.batches == 0 {
            return Err(QuantizeError::CalibrationData {
                reason: "no calibration batches were collected".to_string(),
            });
        }

        let opts = &self.options;
        let mut table = TensorRangeTable::new();

        for name in &self.tensors {
            let range = match opts.method {
                CalibrationMethod::MinMax => self
                    .ranges
                    .get(name)
                    .map(|r| if opts.symmetric { r.symmetric() } else { *r }),
                CalibrationMethod::Entropy => self.histograms.get(name).map(|h| {
                    let (lo, hi) = h.entropy_threshold(opts.num_quantized_bins);
                    TensorRange::new(lo, hi)
                }),
                CalibrationMethod::Percentile => self.histograms.get(name).map(|h| {
                    let (lo, hi) = h.percentile_range(opts.percentile, opts.symmetric);
                    TensorRange::new(lo, hi)
                }),
            };

            match range {
                Some(r) => table.insert(name.clone(), r),
                None if self.known_float.contains(name) => {
                    return Err(QuantizeError::CalibrationData {
                        reason: format!("tensor '{name}' was selected for calibration but never observed"),
                    });
                }
                None => debug!(tensor = %name, "no float observations for unannotated tensor, skipped"),
            }
        }

        info!(tensors = table.len(), "ranges computed");
        Ok(table)
    }
}
