// src/calibration/inference.rs
//! Execution backends used while calibrating.
//!
//! The calibrator never talks to tract directly: it drives an
//! [`InferenceSession`], which runs one batch through the augmented float model
//! and returns every float graph output by name. [`TractSession`] is the real
//! backend; tests script their own.

use ndarray::ArrayD;
use std::collections::HashMap;
use std::path::PathBuf;
use tempfile::TempDir;
use tracing::debug;
use tract_onnx::prelude::*;

use crate::calibration::CalibrationBatch;
use crate::errors::{QuantizeError, Result};
use crate::graph::GraphModel;
use crate::onnx_utils::save_model;

// ===========================================================================
// Public API
// ===========================================================================

pub trait InferenceSession {
    /// Run one batch; returns float outputs keyed by tensor name. Non-float
    /// outputs are left out.
    fn run(&mut self, batch: &CalibrationBatch) -> Result<HashMap<String, ArrayD<f32>>>;
}

#[allow(clippy::type_complexity)]
type TractPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// tract-backed session over a model written to a private temporary directory.
///
/// tract needs concrete input shapes, so a runnable plan is built lazily for
/// each distinct set of batch input shapes and cached. A short last batch gets
/// its own plan. The directory is removed when the session is dropped.
pub struct TractSession {
    workdir: TempDir,
    model_path: PathBuf,
    input_names: Vec<String>,
    output_names: Vec<String>,
    plans: HashMap<ShapeKey, TractPlan>,
}

/// Input shapes of one batch, in model input order.
type ShapeKey = Vec<Vec<usize>>;

impl std::fmt::Debug for TractSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TractSession")
            .field("workdir", &self.workdir.path())
            .field("inputs", &self.input_names)
            .field("outputs_count", &self.output_names.len())
            .field("plans", &self.plans.len())
            .finish()
    }
}

fn tract_err(context: &'static str) -> impl Fn(TractError) -> QuantizeError {
    move |e| QuantizeError::Inference {
        reason: format!("{context}: {e:#}"),
    }
}

impl TractSession {
    pub fn new(model: &GraphModel) -> Result<Self> {
        let workdir = tempfile::tempdir().map_err(|e| QuantizeError::Inference {
            reason: format!("failed to create working directory: {e}"),
        })?;
        let model_path = workdir.path().join("augmented.onnx");
        save_model(model, &model_path, false)?;

        Ok(Self {
            workdir,
            model_path,
            input_names: model.graph.runtime_inputs().map(|i| i.name.clone()).collect(),
            output_names: model.graph.outputs.iter().map(|o| o.name.clone()).collect(),
            plans: HashMap::new(),
        })
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    fn input<'b>(&self, batch: &'b CalibrationBatch, name: &str) -> Result<&'b ArrayD<f32>> {
        batch.get(name).ok_or_else(|| QuantizeError::CalibrationData {
            reason: format!("batch has no tensor for model input '{name}'"),
        })
    }

    fn shape_key(&self, batch: &CalibrationBatch) -> Result<ShapeKey> {
        self.input_names
            .iter()
            .map(|name| Ok(self.input(batch, name)?.shape().to_vec()))
            .collect()
    }

    fn build_plan(&self, shapes: &ShapeKey) -> Result<TractPlan> {
        let mut model = tract_onnx::onnx()
            .model_for_path(&self.model_path)
            .map_err(tract_err("tract failed to load model"))?;

        for (i, shape) in shapes.iter().enumerate() {
            model
                .set_input_fact(i, f32::fact(shape.clone()).into())
                .map_err(tract_err("invalid input shape"))?;
        }

        model
            .into_optimized()
            .map_err(tract_err("tract optimization failed"))?
            .into_runnable()
            .map_err(tract_err("tract failed to create runnable plan"))
    }

    fn execute(&self, plan: &TractPlan, batch: &CalibrationBatch) -> Result<HashMap<String, ArrayD<f32>>> {
        let inputs = self
            .input_names
            .iter()
            .map(|name| Ok(Tensor::from(self.input(batch, name)?.clone()).into()))
            .collect::<Result<TVec<TValue>>>()?;

        let outputs = plan.run(inputs).map_err(tract_err("inference failed"))?;

        let mut observed = HashMap::with_capacity(outputs.len());
        for (name, value) in self.output_names.iter().zip(outputs.iter()) {
            if !value.datum_type().is_float() {
                continue;
            }
            let as_f32 = value.cast_to::<f32>().map_err(tract_err("cast to f32 failed"))?;
            let view = as_f32
                .to_array_view::<f32>()
                .map_err(tract_err("output is not an f32 array"))?;
            observed.insert(name.clone(), view.to_owned());
        }
        Ok(observed)
    }
}

impl InferenceSession for TractSession {
    fn run(&mut self, batch: &CalibrationBatch) -> Result<HashMap<String, ArrayD<f32>>> {
        let key = self.shape_key(batch)?;
        if !self.plans.contains_key(&key) {
            let plan = self.build_plan(&key)?;
            debug!(shapes = ?key, "tract plan built");
            self.plans.insert(key.clone(), plan);
        }
        match self.plans.get(&key) {
            Some(plan) => self.execute(plan, batch),
            None => Err(QuantizeError::Inference {
                reason: format!("no plan for input shapes {key:?}"),
            }),
        }
    }
}
