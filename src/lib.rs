//! Post-training static quantization of ONNX models.
//!
//! A float model is run over calibration batches to record per-tensor ranges
//! ([`calibration`]), then rewritten ([`quantizer`]) into either
//! - **QOperator** form: fused integer kernels (`QLinearConv`,
//!   `com.microsoft.QLinearConcat`, ...), or
//! - **QDQ** form: the original nodes wrapped in QuantizeLinear /
//!   DequantizeLinear pairs.
//!
//! [`quantize_static`] runs both steps; [`Quantizer`] rewrites a model from an
//! existing [`TensorRangeTable`]. [`quantize_dynamic`] needs no calibration:
//! activations are quantized at run time in front of integer kernels.

pub mod calibration;
pub mod config;
pub mod dynamic_quant;
pub mod errors;
pub mod graph;
pub mod onnx_proto;
pub mod onnx_utils;
pub mod quantization;
pub mod quantizer;
pub mod static_quant;

pub use calibration::{
    CalibrationBatch, CalibrationDataReader, CalibrationDataset, CalibrationMethod, Calibrator, InferenceSession,
    TensorRange, TensorRangeTable, TractSession,
};
pub use config::{ExtraOptions, QuantFormat, QuantizationConfig};
pub use dynamic_quant::{quantize_dynamic, quantize_dynamic_file};
pub use errors::{QuantizeError, Result};
pub use graph::{Graph, GraphModel, Initializer, Node};
pub use onnx_utils::{load_model, save_model, ModelInfo};
pub use quantization::{QuantParams, QuantType};
pub use quantizer::{QuantizationReport, Quantizer, RewriteMode, StrategyOutcome};
pub use static_quant::{
    calibrate, calibrate_with_session, quantize_static, quantize_static_file, quantize_static_with_session,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
