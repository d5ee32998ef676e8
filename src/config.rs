//! Quantization settings, loadable from YAML or TOML.
//!
//! Field names follow the usual post-training quantization vocabulary;
//! `extra_options` keys are spelled in PascalCase:
//!
//! ```yaml
//! quant_format: QOperator
//! per_channel: true
//! activation_type: QUInt8
//! weight_type: QInt8
//! calibrate_method: Percentile
//! nodes_to_exclude: [head/conv]
//! extra_options:
//!   ActivationSymmetric: false
//!   CalibPercentile: 99.99
//!   QDQOpTypePerChannelSupportToAxis: { MatMul: 1 }
//! ```

use crate::calibration::CalibrationMethod;
use crate::errors::{QuantizeError, Result};
use crate::quantization::QuantType;
use crate::quantizer::registry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// Output representation of the rewritten graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QuantFormat {
    /// Fused integer operators (`QLinearConv`, `QLinearMatMul`, ...).
    QOperator,
    /// Float operators wrapped in QuantizeLinear/DequantizeLinear pairs.
    #[default]
    QDQ,
}

impl fmt::Display for QuantFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantFormat::QOperator => write!(f, "QOperator"),
            QuantFormat::QDQ => write!(f, "QDQ"),
        }
    }
}

impl FromStr for QuantFormat {
    type Err = QuantizeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "qoperator" | "operator" => Ok(QuantFormat::QOperator),
            "qdq" => Ok(QuantFormat::QDQ),
            _ => Err(QuantizeError::Configuration {
                reason: format!("Unknown quantization format: '{s}'. Valid formats: QOperator, QDQ"),
            }),
        }
    }
}

/// Fine-grained switches, keyed the same way as the common `extra_options`
/// dictionary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtraOptions {
    #[serde(rename = "ActivationSymmetric")]
    pub activation_symmetric: bool,

    #[serde(rename = "WeightSymmetric")]
    pub weight_symmetric: bool,

    /// Quantize pass-through ops even when their input is not quantized.
    #[serde(rename = "ForceQuantizeNoInputCheck")]
    pub force_quantize_no_input_check: bool,

    /// Only quantize MatMul whose B input is a constant initializer. Unset
    /// means off for static and on for dynamic quantization.
    #[serde(rename = "MatMulConstBOnly", skip_serializing_if = "Option::is_none")]
    pub matmul_const_b_only: Option<bool>,

    /// Keep float weights and insert a Q/DQ pair instead of folding them.
    #[serde(rename = "AddQDQPairToWeight")]
    pub add_qdq_pair_to_weight: bool,

    /// One Q/DQ pair per consumer instead of one shared pair.
    #[serde(rename = "DedicatedQDQPair")]
    pub dedicated_qdq_pair: bool,

    /// Per-channel axis override by op type.
    #[serde(rename = "QDQOpTypePerChannelSupportToAxis")]
    pub qdq_op_type_per_channel_support_to_axis: BTreeMap<String, i64>,

    #[serde(rename = "CalibTensorRangeSymmetric")]
    pub calib_tensor_range_symmetric: bool,

    #[serde(rename = "CalibMovingAverage")]
    pub calib_moving_average: bool,

    #[serde(rename = "CalibMovingAverageConstant")]
    pub calib_moving_average_constant: f32,

    #[serde(rename = "CalibPercentile")]
    pub calib_percentile: f32,

    #[serde(rename = "CalibNumBins")]
    pub calib_num_bins: Option<usize>,

    #[serde(rename = "CalibNumQuantizedBins")]
    pub calib_num_quantized_bins: usize,
}

impl ExtraOptions {
    pub fn matmul_const_b_only(&self) -> bool {
        self.matmul_const_b_only.unwrap_or(false)
    }
}

impl Default for ExtraOptions {
    fn default() -> Self {
        Self {
            activation_symmetric: false,
            weight_symmetric: true,
            force_quantize_no_input_check: false,
            matmul_const_b_only: None,
            add_qdq_pair_to_weight: false,
            dedicated_qdq_pair: false,
            qdq_op_type_per_channel_support_to_axis: BTreeMap::new(),
            calib_tensor_range_symmetric: false,
            calib_moving_average: false,
            calib_moving_average_constant: 0.01,
            calib_percentile: 99.999,
            calib_num_bins: None,
            calib_num_quantized_bins: 128,
        }
    }
}

/// Top-level quantization configuration.
///
/// Can be loaded from a YAML or TOML file with [`QuantizationConfig::from_file`].
/// Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationConfig {
    pub quant_format: QuantFormat,

    /// Op types to rewrite. Empty means every op type with a strategy for
    /// the chosen format.
    pub op_types_to_quantize: Vec<String>,

    pub per_channel: bool,

    /// Drop one bit of the weight range (for kernels prone to overflow).
    pub reduce_range: bool,

    pub activation_type: QuantType,

    pub weight_type: QuantType,

    /// When non-empty, only nodes with these names are quantized.
    pub nodes_to_quantize: Vec<String>,

    pub nodes_to_exclude: Vec<String>,

    pub calibrate_method: CalibrationMethod,

    /// Store large initializers in a `<model>.data` side file.
    pub use_external_data_format: bool,

    pub extra_options: ExtraOptions,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            quant_format: QuantFormat::QDQ,
            op_types_to_quantize: Vec::new(),
            per_channel: false,
            reduce_range: false,
            activation_type: QuantType::QInt8,
            weight_type: QuantType::QInt8,
            nodes_to_quantize: Vec::new(),
            nodes_to_exclude: Vec::new(),
            calibrate_method: CalibrationMethod::MinMax,
            use_external_data_format: false,
            extra_options: ExtraOptions::default(),
        }
    }
}

impl QuantizationConfig {
    /// Load a config from a YAML or TOML file (auto-detected by extension).
    ///
    /// # Errors
    ///
    /// Returns [`QuantizeError::Configuration`] on I/O, parse, or unsupported format errors.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| QuantizeError::Configuration {
                reason: "Config file has no extension".into(),
            })?;

        let content = std::fs::read_to_string(path).map_err(|e| QuantizeError::Configuration {
            reason: format!("Failed to read config file '{}': {e}", path.display()),
        })?;

        match extension {
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            _ => Err(QuantizeError::Configuration {
                reason: format!("Unsupported config format: {}", extension),
            }),
        }
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| QuantizeError::Configuration {
            reason: format!("Failed to parse YAML config: {e}"),
        })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| QuantizeError::Configuration {
            reason: format!("Failed to parse TOML config: {e}"),
        })
    }

    /// Check the configuration before any graph is touched.
    ///
    /// # Errors
    ///
    /// Returns [`QuantizeError::Configuration`] for combinations no kernel
    /// supports or out-of-range calibration settings.
    pub fn validate(&self) -> Result<()> {
        let err = |reason: String| Err(QuantizeError::Configuration { reason });

        if self.activation_type == QuantType::QInt8 && self.weight_type == QuantType::QUInt8 {
            return err(
                "QInt8 activations with QUInt8 weights is not supported. Use QUInt8/QInt8 or QInt8/QInt8".into(),
            );
        }

        let sixteen_bit = self.activation_type.is_16bit() || self.weight_type.is_16bit();
        if sixteen_bit && self.quant_format == QuantFormat::QOperator {
            return err("16-bit quantization types are only supported with the QDQ format".into());
        }

        let extra = &self.extra_options;
        if !(0.0..=1.0).contains(&extra.calib_moving_average_constant) {
            return err(format!(
                "CalibMovingAverageConstant must be in [0, 1], got {}",
                extra.calib_moving_average_constant
            ));
        }
        if !(extra.calib_percentile > 0.0 && extra.calib_percentile <= 100.0) {
            return err(format!("CalibPercentile must be in (0, 100], got {}", extra.calib_percentile));
        }
        if extra.calib_num_quantized_bins == 0 {
            return err("CalibNumQuantizedBins must be positive".into());
        }
        if extra.calib_num_bins == Some(0) {
            return err("CalibNumBins must be positive".into());
        }

        if self.quant_format == QuantFormat::QOperator
            && self.activation_type == QuantType::QInt8
            && self.weight_type == QuantType::QInt8
        {
            warn!(
                "QOperator with QInt8 activations and weights may run slowly on x86-64; \
                 QUInt8 activations or the QDQ format are usually faster"
            );
        }

        Ok(())
    }

    /// Op types the quantizer will dispatch: the configured list, or every
    /// op type registered for the format when the list is empty.
    pub fn resolved_op_types(&self) -> Vec<String> {
        if self.op_types_to_quantize.is_empty() {
            registry::registered_op_types(self.quant_format)
        } else {
            self.op_types_to_quantize.clone()
        }
    }

    /// Per-channel axis for `op_type`, honoring the configured override.
    pub fn per_channel_axis(&self, op_type: &str, default_axis: i64) -> i64 {
        self.extra_options
            .qdq_op_type_per_channel_support_to_axis
            .get(op_type)
            .copied()
            .unwrap_or(default_axis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QuantizationConfig::default();
        assert_eq!(config.quant_format, QuantFormat::QDQ);
        assert_eq!(config.activation_type, QuantType::QInt8);
        assert_eq!(config.weight_type, QuantType::QInt8);
        assert!(config.extra_options.weight_symmetric);
        assert!(!config.extra_options.activation_symmetric);
        assert_eq!(config.extra_options.calib_moving_average_constant, 0.01);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
quant_format: QOperator
per_channel: true
activation_type: QUInt8
weight_type: QInt8
calibrate_method: Percentile
nodes_to_exclude:
  - head/conv
extra_options:
  ActivationSymmetric: true
  DedicatedQDQPair: true
  CalibPercentile: 99.9
  QDQOpTypePerChannelSupportToAxis:
    MatMul: 0
"#;

        let config = QuantizationConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.quant_format, QuantFormat::QOperator);
        assert!(config.per_channel);
        assert_eq!(config.activation_type, QuantType::QUInt8);
        assert_eq!(config.calibrate_method, CalibrationMethod::Percentile);
        assert_eq!(config.nodes_to_exclude, vec!["head/conv".to_string()]);
        assert!(config.extra_options.activation_symmetric);
        assert!(config.extra_options.dedicated_qdq_pair);
        // unspecified keys keep their defaults
        assert!(config.extra_options.weight_symmetric);
        assert_eq!(config.per_channel_axis("MatMul", 1), 0);
        assert_eq!(config.per_channel_axis("Conv", 0), 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_config() {
        let toml = r#"
quant_format = "QDQ"
op_types_to_quantize = ["Conv", "MatMul"]
reduce_range = true

[extra_options]
MatMulConstBOnly = true
CalibMovingAverage = true
CalibMovingAverageConstant = 0.5
"#;

        let config = QuantizationConfig::from_toml(toml).unwrap();
        assert_eq!(config.quant_format, QuantFormat::QDQ);
        assert_eq!(config.resolved_op_types(), vec!["Conv", "MatMul"]);
        assert!(config.reduce_range);
        assert_eq!(config.extra_options.matmul_const_b_only, Some(true));
        assert!(config.extra_options.matmul_const_b_only());
        assert_eq!(config.extra_options.calib_moving_average_constant, 0.5);
    }

    #[test]
    fn test_from_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ptq.yml");
        std::fs::write(&path, "per_channel: true\n").unwrap();
        assert!(QuantizationConfig::from_file(&path).unwrap().per_channel);

        let bad = dir.path().join("ptq.json");
        std::fs::write(&bad, "{}").unwrap();
        assert!(matches!(
            QuantizationConfig::from_file(&bad),
            Err(QuantizeError::Configuration { .. })
        ));
    }

    #[test]
    fn test_rejects_int8_activation_with_uint8_weight() {
        let config = QuantizationConfig {
            activation_type: QuantType::QInt8,
            weight_type: QuantType::QUInt8,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(QuantizeError::Configuration { .. })));
    }

    #[test]
    fn test_rejects_16bit_qoperator() {
        let config = QuantizationConfig {
            quant_format: QuantFormat::QOperator,
            activation_type: QuantType::QUInt16,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let qdq = QuantizationConfig {
            activation_type: QuantType::QUInt16,
            weight_type: QuantType::QInt16,
            ..Default::default()
        };
        assert!(qdq.validate().is_ok());
    }

    #[test]
    fn test_qoperator_int8_int8_is_accepted() {
        let config = QuantizationConfig {
            quant_format: QuantFormat::QOperator,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_calibration_settings() {
        let mut config = QuantizationConfig::default();
        config.extra_options.calib_percentile = 0.0;
        assert!(config.validate().is_err());

        let mut config = QuantizationConfig::default();
        config.extra_options.calib_moving_average_constant = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("qdq".parse::<QuantFormat>().unwrap(), QuantFormat::QDQ);
        assert_eq!("QOperator".parse::<QuantFormat>().unwrap(), QuantFormat::QOperator);
        assert!("onnx".parse::<QuantFormat>().is_err());
    }
}
