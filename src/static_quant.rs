// src/static_quant.rs
//! End-to-end static quantization: calibrate, then rewrite.
//!
//! ```no_run
//! use ptq_rs::{quantize_static_file, CalibrationDataset, QuantizationConfig};
//!
//! let dataset = CalibrationDataset::from_numpy("calib.npy")?;
//! let mut reader = dataset.into_reader("input", 8);
//! quantize_static_file("model.onnx", "model.quant.onnx", &mut reader, &QuantizationConfig::default())?;
//! # Ok::<(), ptq_rs::QuantizeError>(())
//! ```

use std::path::Path;

use tracing::info;

use crate::calibration::{
    CalibrationDataReader, CalibrationOptions, Calibrator, InferenceSession, TensorRangeTable, TractSession,
};
use crate::config::QuantizationConfig;
use crate::errors::Result;
use crate::graph::GraphModel;
use crate::onnx_utils::{load_model, save_model};
use crate::quantizer::Quantizer;

/// Run calibration over `reader` with a caller-supplied backend. `session`
/// must execute the model returned by [`Calibrator::augment_model`].
pub fn calibrate_with_session<S, R>(
    model: &GraphModel,
    session: &mut S,
    reader: &mut R,
    config: &QuantizationConfig,
) -> Result<TensorRangeTable>
where
    S: InferenceSession + ?Sized,
    R: CalibrationDataReader + ?Sized,
{
    let mut calibrator = Calibrator::new(
        model,
        &config.resolved_op_types(),
        CalibrationOptions::from_config(config),
    );
    calibrator.collect_data(session, reader)?;
    calibrator.compute_range()
}

/// Calibrate with tract. The augmented model lives in a temporary directory
/// that is gone when this returns.
pub fn calibrate<R>(model: &GraphModel, reader: &mut R, config: &QuantizationConfig) -> Result<TensorRangeTable>
where
    R: CalibrationDataReader + ?Sized,
{
    config.validate()?;
    let mut calibrator = Calibrator::new(
        model,
        &config.resolved_op_types(),
        CalibrationOptions::from_config(config),
    );
    let augmented = calibrator.augment_model(model);
    let mut session = TractSession::new(&augmented)?;
    calibrator.collect_data(&mut session, reader)?;
    calibrator.compute_range()
}

/// Calibrate `model` over `reader` and return the quantized model.
pub fn quantize_static<R>(model: &GraphModel, reader: &mut R, config: &QuantizationConfig) -> Result<GraphModel>
where
    R: CalibrationDataReader + ?Sized,
{
    let ranges = calibrate(model, reader, config)?;
    Quantizer::new(config.clone(), ranges).quantize_model(model)
}

/// [`quantize_static`] with a caller-supplied inference backend.
pub fn quantize_static_with_session<S, R>(
    model: &GraphModel,
    session: &mut S,
    reader: &mut R,
    config: &QuantizationConfig,
) -> Result<GraphModel>
where
    S: InferenceSession + ?Sized,
    R: CalibrationDataReader + ?Sized,
{
    config.validate()?;
    let ranges = calibrate_with_session(model, session, reader, config)?;
    Quantizer::new(config.clone(), ranges).quantize_model(model)
}

/// Load, quantize and save. Nothing is written unless the rewrite succeeds.
pub fn quantize_static_file<R>(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    reader: &mut R,
    config: &QuantizationConfig,
) -> Result<GraphModel>
where
    R: CalibrationDataReader + ?Sized,
{
    let model = load_model(input.as_ref())?;
    let quantized = quantize_static(&model, reader, config)?;
    save_model(&quantized, output.as_ref(), config.use_external_data_format)?;
    info!(path = %output.as_ref().display(), "quantized model written");
    Ok(quantized)
}
