// src/quantization/mod.rs
//! Quantization parameter math.
//!
//! Maps a float range to `(scale, zero_point)` for a target integer type and
//! applies the affine mapping `real = (code - zero_point) * scale`.

use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};

use crate::errors::{QuantizeError, Result};
use crate::graph::{DataType, TensorData};

/// Target integer type of a quantized tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantType {
    QInt8,
    QUInt8,
    QInt16,
    QUInt16,
}

impl QuantType {
    pub fn data_type(self) -> DataType {
        match self {
            QuantType::QInt8 => DataType::Int8,
            QuantType::QUInt8 => DataType::UInt8,
            QuantType::QInt16 => DataType::Int16,
            QuantType::QUInt16 => DataType::UInt16,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, QuantType::QInt8 | QuantType::QInt16)
    }

    pub fn is_16bit(self) -> bool {
        matches!(self, QuantType::QInt16 | QuantType::QUInt16)
    }

    pub fn byte_width(self) -> usize {
        if self.is_16bit() {
            2
        } else {
            1
        }
    }

    /// Usable code range `(qmin, qmax)`.
    ///
    /// Signed symmetric ranges drop the most negative code so the range is
    /// balanced around 0. `reduce_range` drops one bit of the span.
    pub fn qrange(self, reduce_range: bool, symmetric: bool) -> (i32, i32) {
        match (self, reduce_range, symmetric) {
            (QuantType::QInt8, true, _) => (-64, 64),
            (QuantType::QInt8, false, true) => (-127, 127),
            (QuantType::QInt8, false, false) => (-128, 127),
            (QuantType::QUInt8, true, _) => (0, 127),
            (QuantType::QUInt8, false, _) => (0, 255),
            (QuantType::QInt16, true, _) => (-16384, 16384),
            (QuantType::QInt16, false, true) => (-32767, 32767),
            (QuantType::QInt16, false, false) => (-32768, 32767),
            (QuantType::QUInt16, true, _) => (0, 32767),
            (QuantType::QUInt16, false, _) => (0, 65535),
        }
    }

    /// Zero point that represents real 0 when the range collapses.
    fn natural_zero(self, qmin: i32, qmax: i32, symmetric: bool) -> i32 {
        if self.is_signed() {
            0
        } else if symmetric {
            (qmin + qmax + 1) / 2
        } else {
            qmin
        }
    }

    /// Pack codes into the payload type of this quantized type. Codes must
    /// already lie inside the type's range.
    pub fn to_tensor_data(self, codes: &[i32]) -> TensorData {
        match self {
            QuantType::QInt8 => TensorData::Int8(codes.iter().map(|&c| c as i8).collect()),
            QuantType::QUInt8 => TensorData::UInt8(codes.iter().map(|&c| c as u8).collect()),
            QuantType::QInt16 => TensorData::Int16(codes.iter().map(|&c| c as i16).collect()),
            QuantType::QUInt16 => TensorData::UInt16(codes.iter().map(|&c| c as u16).collect()),
        }
    }
}

impl fmt::Display for QuantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantType::QInt8 => write!(f, "QInt8"),
            QuantType::QUInt8 => write!(f, "QUInt8"),
            QuantType::QInt16 => write!(f, "QInt16"),
            QuantType::QUInt16 => write!(f, "QUInt16"),
        }
    }
}

impl FromStr for QuantType {
    type Err = QuantizeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "qint8" | "int8" => Ok(QuantType::QInt8),
            "quint8" | "uint8" => Ok(QuantType::QUInt8),
            "qint16" | "int16" => Ok(QuantType::QInt16),
            "quint16" | "uint16" => Ok(QuantType::QUInt16),
            _ => Err(QuantizeError::Configuration {
                reason: format!(
                    "unknown quantization type '{s}'. Valid types: QInt8, QUInt8, QInt16, QUInt16"
                ),
            }),
        }
    }
}

/// Derive `(scale, zero_point)` for `[rmin, rmax]` mapped onto `[qmin, qmax]`.
///
/// The range is widened to contain 0 so real zero is exactly representable.
/// Symmetric ranges pin the zero point to the natural zero code (0 signed,
/// mid-range unsigned). A scale below `f32::MIN_POSITIVE` collapses to
/// scale 1 with the natural zero code.
pub fn compute_scale_zero_point(
    rmin: f32,
    rmax: f32,
    qmin: i32,
    qmax: i32,
    symmetric: bool,
    qtype: QuantType,
) -> (f32, i32) {
    let mut rmin = rmin.min(0.0);
    let mut rmax = rmax.max(0.0);
    if symmetric {
        let absmax = rmin.abs().max(rmax.abs());
        rmin = -absmax;
        rmax = absmax;
    }

    let scale = (rmax - rmin) / (qmax - qmin) as f32;
    if !scale.is_finite() || scale < f32::MIN_POSITIVE {
        return (1.0, qtype.natural_zero(qmin, qmax, symmetric));
    }

    if symmetric {
        return (scale, qtype.natural_zero(qmin, qmax, true));
    }

    let zero_point = (qmin as f32 - rmin / scale).round() as i32;
    (scale, zero_point.clamp(qmin, qmax))
}

/// Per-tensor quantization parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
    pub qtype: QuantType,
    pub qmin: i32,
    pub qmax: i32,
}

impl QuantParams {
    /// Parameters for an observed `[min, max]` range.
    pub fn from_range(min: f32, max: f32, qtype: QuantType, symmetric: bool, reduce_range: bool) -> Self {
        let (qmin, qmax) = qtype.qrange(reduce_range, symmetric);
        let (scale, zero_point) = compute_scale_zero_point(min, max, qmin, qmax, symmetric, qtype);
        Self {
            scale,
            zero_point,
            qtype,
            qmin,
            qmax,
        }
    }

    /// Parameters fitted to the values themselves.
    pub fn from_data(data: &[f32], qtype: QuantType, symmetric: bool, reduce_range: bool) -> Self {
        let (min, max) = min_max(data);
        Self::from_range(min, max, qtype, symmetric, reduce_range)
    }

    /// Quantize a float value to its integer code.
    pub fn quantize(&self, value: f32) -> i32 {
        let q = (value / self.scale).round() + self.zero_point as f32;
        if q.is_nan() {
            return self.zero_point;
        }
        (q.clamp(self.qmin as f32, self.qmax as f32)) as i32
    }

    /// Dequantize an integer code back to float32.
    pub fn dequantize(&self, code: i32) -> f32 {
        (code - self.zero_point) as f32 * self.scale
    }

    /// Width of the usable code span.
    pub fn span(&self) -> i32 {
        self.qmax - self.qmin
    }
}

/// Per-channel parameters: one scale / zero point per slice along `axis`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelParams {
    pub axis: usize,
    pub scales: Vec<f32>,
    pub zero_points: Vec<i32>,
    pub qtype: QuantType,
}

fn min_max(data: &[f32]) -> (f32, f32) {
    if data.is_empty() {
        return (0.0, 0.0);
    }
    let min = data.iter().copied().fold(f32::INFINITY, f32::min);
    let max = data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    (min, max)
}

/// Quantized tensor
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    pub codes: Vec<i32>,
    pub shape: Vec<usize>,
    pub params: QuantParams,
}

impl QuantizedTensor {
    /// Quantize a float32 tensor per-tensor.
    pub fn from_f32(
        data: &[f32],
        shape: Vec<usize>,
        qtype: QuantType,
        symmetric: bool,
        reduce_range: bool,
    ) -> Result<Self> {
        if data.is_empty() {
            return Err(QuantizeError::InvalidTensor {
                reason: "cannot quantize empty tensor".into(),
            });
        }

        let params = QuantParams::from_data(data, qtype, symmetric, reduce_range);
        let codes = data.iter().map(|&v| params.quantize(v)).collect();

        Ok(QuantizedTensor {
            codes,
            shape,
            params,
        })
    }

    /// Dequantize back to float32
    pub fn to_f32(&self) -> Vec<f32> {
        self.codes.iter().map(|&c| self.params.dequantize(c)).collect()
    }

    /// Get size in bytes
    pub fn size_bytes(&self) -> usize {
        self.codes.len() * self.params.qtype.byte_width()
    }

    /// Calculate quantization error (MSE)
    pub fn quantization_error(&self, original: &[f32]) -> f32 {
        if original.is_empty() {
            return 0.0;
        }

        let sum: f32 = original
            .iter()
            .zip(self.to_f32())
            .map(|(a, b)| (a - b).powi(2))
            .sum();

        sum / original.len() as f32
    }
}

/// Quantize `array` independently along `axis`.
///
/// Returns the per-slice parameters and the codes in the original layout.
pub fn quantize_per_channel(
    array: &ArrayD<f32>,
    axis: usize,
    qtype: QuantType,
    symmetric: bool,
    reduce_range: bool,
) -> Result<(ChannelParams, Vec<i32>)> {
    if axis >= array.ndim() {
        return Err(QuantizeError::InvalidTensor {
            reason: format!(
                "per-channel axis {axis} out of bounds for rank {} tensor",
                array.ndim()
            ),
        });
    }
    if array.is_empty() {
        return Err(QuantizeError::InvalidTensor {
            reason: "cannot quantize empty tensor".into(),
        });
    }

    let channels = array.len_of(Axis(axis));
    let mut scales = Vec::with_capacity(channels);
    let mut zero_points = Vec::with_capacity(channels);
    let mut codes = ArrayD::<i32>::zeros(array.raw_dim());

    for c in 0..channels {
        let slice = array.index_axis(Axis(axis), c);
        let values: Vec<f32> = slice.iter().copied().collect();
        let params = QuantParams::from_data(&values, qtype, symmetric, reduce_range);

        codes
            .index_axis_mut(Axis(axis), c)
            .zip_mut_with(&slice, |q, &v| *q = params.quantize(v));

        scales.push(params.scale);
        zero_points.push(params.zero_point);
    }

    let params = ChannelParams {
        axis,
        scales,
        zero_points,
        qtype,
    };
    Ok((params, codes.iter().copied().collect()))
}

/// Quantize a bias vector to int32 with `scale = input_scale * weight_scale`.
///
/// `weight_scales` holds one entry (per-tensor) or one per output channel.
/// Channels are assumed to run along the bias vector.
pub fn quantize_bias(bias: &[f32], input_scale: f32, weight_scales: &[f32]) -> Result<(Vec<f32>, Vec<i32>)> {
    if weight_scales.is_empty() || (weight_scales.len() != 1 && weight_scales.len() != bias.len()) {
        return Err(QuantizeError::InvalidTensor {
            reason: format!(
                "bias of length {} cannot take {} weight scales",
                bias.len(),
                weight_scales.len()
            ),
        });
    }

    let scales: Vec<f32> = weight_scales.iter().map(|&w| {
        let s = input_scale * w;
        if s > 0.0 && s.is_finite() {
            s
        } else {
            1.0
        }
    }).collect();

    let codes = bias
        .iter()
        .enumerate()
        .map(|(i, &b)| {
            let s = if scales.len() == 1 { scales[0] } else { scales[i] };
            (b / s).round().clamp(i32::MIN as f32, i32::MAX as f32) as i32
        })
        .collect();

    Ok((scales, codes))
}
