//! Builders for the QuantizeLinear / DequantizeLinear primitives and the
//! naming scheme every rewritten tensor follows.
//!
//! ```text
//! Initializers (per quantized tensor "t"):
//!   "t_quantized"   quantized constant (weights only)
//!   "t_scale"       FP32 scale, rank 0 or [channels]
//!   "t_zero_point"  zero point in the quantized type, same shape as scale
//!
//! QOperator activation:
//!   QuantizeLinear "t_QuantizeLinear" : [t, t_scale, t_zero_point] -> "t_quantized"
//!
//! QDQ activation:
//!   QuantizeLinear   "t_QuantizeLinear"   -> "t_QuantizeLinear_Output"
//!   DequantizeLinear "t_DequantizeLinear" -> "t_DequantizeLinear_Output"
//! ```
//!
//! DequantizeLinear computes `y = (x - x_zero_point) × x_scale`; QuantizeLinear
//! its saturating inverse.

use crate::graph::{AttributeValue, Initializer, Node, TensorData};
use crate::quantization::{ChannelParams, QuantParams, QuantType};

// ---------------------------------------------------------------------------
// Name generation
// ---------------------------------------------------------------------------

pub fn quantized_name(tensor: &str) -> String {
    format!("{tensor}_quantized")
}

pub fn scale_name(tensor: &str) -> String {
    format!("{tensor}_scale")
}

pub fn zero_point_name(tensor: &str) -> String {
    format!("{tensor}_zero_point")
}

/// Name of a fused replacement node; unnamed nodes stay unnamed.
pub fn fused_node_name(node_name: &str) -> String {
    if node_name.is_empty() {
        String::new()
    } else {
        format!("{node_name}_quant")
    }
}

/// Node and tensor names of one Q/DQ pair around `tensor`.
///
/// `pair` is `None` for the shared pair and `Some(k)` for the k-th dedicated
/// pair, which appends `_k` to every name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QdqNames {
    pub quantize_node: String,
    pub quantize_output: String,
    pub dequantize_node: String,
    pub dequantize_output: String,
}

impl QdqNames {
    pub fn new(tensor: &str, pair: Option<usize>) -> Self {
        let suffix = pair.map(|k| format!("_{k}")).unwrap_or_default();
        Self {
            quantize_node: format!("{tensor}_QuantizeLinear{suffix}"),
            quantize_output: format!("{tensor}_QuantizeLinear_Output{suffix}"),
            dequantize_node: format!("{tensor}_DequantizeLinear{suffix}"),
            dequantize_output: format!("{tensor}_DequantizeLinear_Output{suffix}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Node builders
// ---------------------------------------------------------------------------

fn with_axis(node: Node, axis: Option<i64>) -> Node {
    match axis {
        Some(a) => node.with_attribute("axis", AttributeValue::Int(a)),
        None => node,
    }
}

/// `QuantizeLinear(input, scale, zero_point) -> output`, with the per-channel
/// `axis` attribute when given (opset ≥ 13).
pub fn build_quantize_linear_node(
    name: &str,
    input: &str,
    scale: &str,
    zero_point: &str,
    output: &str,
    axis: Option<i64>,
) -> Node {
    with_axis(
        Node::new(
            "QuantizeLinear",
            name,
            vec![input.to_string(), scale.to_string(), zero_point.to_string()],
            vec![output.to_string()],
        ),
        axis,
    )
}

/// `DequantizeLinear(input, scale, zero_point) -> output`.
pub fn build_dequantize_linear_node(
    name: &str,
    input: &str,
    scale: &str,
    zero_point: &str,
    output: &str,
    axis: Option<i64>,
) -> Node {
    with_axis(
        Node::new(
            "DequantizeLinear",
            name,
            vec![input.to_string(), scale.to_string(), zero_point.to_string()],
            vec![output.to_string()],
        ),
        axis,
    )
}

// ---------------------------------------------------------------------------
// Initializer builders
// ---------------------------------------------------------------------------

fn channel_dims(per_channel: bool, len: usize) -> Vec<i64> {
    if per_channel {
        vec![len as i64]
    } else {
        Vec::new()
    }
}

/// FP32 scale tensor: rank-0 for per-tensor, `[channels]` for per-channel.
pub fn build_scale_tensor(name: &str, scales: &[f32], per_channel: bool) -> Initializer {
    Initializer::new(
        name,
        channel_dims(per_channel, scales.len()),
        TensorData::Float(scales.to_vec()),
    )
}

/// Zero-point tensor in the element type of `qtype`.
pub fn build_zero_point_tensor(
    name: &str,
    zero_points: &[i32],
    qtype: QuantType,
    per_channel: bool,
) -> Initializer {
    Initializer::new(
        name,
        channel_dims(per_channel, zero_points.len()),
        qtype.to_tensor_data(zero_points),
    )
}

/// Scale and zero-point initializers for per-tensor parameters.
pub fn build_param_tensors(scale: &str, zero_point: &str, params: &QuantParams) -> [Initializer; 2] {
    [
        build_scale_tensor(scale, &[params.scale], false),
        build_zero_point_tensor(zero_point, &[params.zero_point], params.qtype, false),
    ]
}

/// Scale and zero-point initializers for per-channel parameters.
pub fn build_channel_param_tensors(
    scale: &str,
    zero_point: &str,
    params: &ChannelParams,
) -> [Initializer; 2] {
    [
        build_scale_tensor(scale, &params.scales, true),
        build_zero_point_tensor(zero_point, &params.zero_points, params.qtype, true),
    ]
}

/// Quantized constant with the original dims.
pub fn build_quantized_tensor(name: &str, codes: &[i32], dims: &[i64], qtype: QuantType) -> Initializer {
    Initializer::new(name, dims.to_vec(), qtype.to_tensor_data(codes))
}

/// Int32 bias constant.
pub fn build_bias_tensor(name: &str, codes: Vec<i32>, dims: &[i64]) -> Initializer {
    Initializer::new(name, dims.to_vec(), TensorData::Int32(codes))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
