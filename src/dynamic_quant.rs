//! Dynamic quantization: weights are quantized ahead of time, activations at
//! run time. No calibration data is needed.
//!
//! ```no_run
//! use ptq_rs::{quantize_dynamic_file, QuantizationConfig};
//!
//! quantize_dynamic_file("model.onnx", "model.dyn.onnx", &QuantizationConfig::default())?;
//! # Ok::<(), ptq_rs::QuantizeError>(())
//! ```

use std::path::Path;

use tracing::{info, warn};

use crate::config::{QuantFormat, QuantizationConfig};
use crate::errors::Result;
use crate::graph::GraphModel;
use crate::onnx_utils::{load_model, save_model};
use crate::quantization::QuantType;
use crate::quantizer::Quantizer;

/// `config` adjusted for dynamic quantization: integer operators, QUInt8
/// activations (the only type `DynamicQuantizeLinear` produces) and
/// `MatMulConstBOnly` on unless set explicitly.
pub fn dynamic_config(config: &QuantizationConfig) -> QuantizationConfig {
    let mut config = config.clone();
    if config.activation_type != QuantType::QUInt8 {
        warn!(
            requested = %config.activation_type,
            "dynamic quantization always uses QUInt8 activations"
        );
        config.activation_type = QuantType::QUInt8;
    }
    config.quant_format = QuantFormat::QOperator;
    if config.extra_options.matmul_const_b_only.is_none() {
        config.extra_options.matmul_const_b_only = Some(true);
    }
    config
}

/// Quantize the weights of `model` and insert run-time activation
/// quantization in front of every rewritten Conv and MatMul.
pub fn quantize_dynamic(model: &GraphModel, config: &QuantizationConfig) -> Result<GraphModel> {
    Quantizer::dynamic(dynamic_config(config)).quantize_model(model)
}

/// Load, quantize dynamically and save. Nothing is written unless the
/// rewrite succeeds.
pub fn quantize_dynamic_file(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    config: &QuantizationConfig,
) -> Result<GraphModel> {
    let model = load_model(input.as_ref())?;
    let quantized = quantize_dynamic(&model, config)?;
    save_model(&quantized, output.as_ref(), config.use_external_data_format)?;
    info!(path = %output.as_ref().display(), "dynamically quantized model written");
    Ok(quantized)
}
