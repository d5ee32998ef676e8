//! Typed error handling for the ptq-rs library.
//!
//! Every public API returns [`Result<T>`](type@Result), which uses
//! [`QuantizeError`] as the error type. The `ptq` binary lifts these into
//! `anyhow::Error` through the blanket `From<E: std::error::Error>` impl.
//!
//! Only [`QuantizeError::Configuration`] and [`QuantizeError::CalibrationData`]
//! abort a quantization run. [`QuantizeError::UnresolvedParams`] and
//! [`QuantizeError::UnsupportedOperator`] are recoverable: the quantizer turns
//! them into a float fallback for the affected node and keeps going.

use std::fmt;
use std::path::PathBuf;

/// Result type alias used throughout the ptq-rs public API.
pub type Result<T> = std::result::Result<T, QuantizeError>;

/// Errors produced by the ptq-rs library.
#[derive(Debug)]
pub enum QuantizeError {
    /// Invalid configuration, rejected before the graph is touched
    /// (e.g. QInt8 activations paired with QUInt8 weights).
    Configuration {
        /// What went wrong.
        reason: String,
    },

    /// The calibration reader produced no batches, or a float tensor selected
    /// for calibration was never observed.
    CalibrationData {
        /// What went wrong.
        reason: String,
    },

    /// A tensor has no derivable quantization parameters.
    UnresolvedParams {
        /// Original tensor name.
        tensor: String,
    },

    /// An op type was requested for quantization but has no strategy.
    UnsupportedOperator {
        /// The op type.
        op_type: String,
    },

    /// Empty tensor, payload/dims mismatch, per-channel axis out of bounds, etc.
    InvalidTensor {
        /// What went wrong.
        reason: String,
    },

    /// Failed to load an ONNX model.
    ModelLoad {
        /// Path that was being loaded.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Failed to save an ONNX model.
    ModelSave {
        /// Path that was being written.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Error while rewriting the graph.
    GraphTransform {
        /// What went wrong.
        reason: String,
    },

    /// The calibration backend failed to build or run the augmented model.
    Inference {
        /// What went wrong.
        reason: String,
    },

    /// Catch-all for rare edge cases that don't fit other variants.
    Other(String),
}

impl QuantizeError {
    /// `true` for the categories that must abort a quantization run.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            QuantizeError::UnresolvedParams { .. } | QuantizeError::UnsupportedOperator { .. }
        )
    }
}

impl fmt::Display for QuantizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantizeError::Configuration { reason } => {
                write!(f, "configuration error: {reason}")
            }
            QuantizeError::CalibrationData { reason } => {
                write!(f, "calibration data error: {reason}")
            }
            QuantizeError::UnresolvedParams { tensor } => {
                write!(f, "no quantization parameters for tensor '{tensor}'")
            }
            QuantizeError::UnsupportedOperator { op_type } => {
                write!(f, "no quantization strategy for op type '{op_type}'")
            }
            QuantizeError::InvalidTensor { reason } => {
                write!(f, "invalid tensor: {reason}")
            }
            QuantizeError::ModelLoad { path, reason } => {
                write!(f, "failed to load model '{}': {reason}", path.display())
            }
            QuantizeError::ModelSave { path, reason } => {
                write!(f, "failed to save model '{}': {reason}", path.display())
            }
            QuantizeError::GraphTransform { reason } => {
                write!(f, "graph transform error: {reason}")
            }
            QuantizeError::Inference { reason } => {
                write!(f, "inference error: {reason}")
            }
            QuantizeError::Other(msg) => {
                write!(f, "{msg}")
            }
        }
    }
}

impl std::error::Error for QuantizeError {}
