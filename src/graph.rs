//! Typed in-memory graph IR.
//!
//! [`GraphModel`] mirrors the parts of an ONNX `ModelProto` the quantizer
//! reads or rewrites. Anything it does not model (sequence/map value types,
//! sparse attributes, model-local functions) is carried as the raw prost
//! message so a load/save round trip is lossless for the rewritten parts and
//! verbatim for the rest.
//!
//! Conversion from and to the protobuf lives in [`crate::onnx_utils::convert`].

use std::collections::{HashMap, HashSet};

use ndarray::{ArrayD, IxDyn};

use crate::errors::{QuantizeError, Result};
use crate::onnx_proto;

/// The default ONNX operator domain. `"ai.onnx"` is treated as an alias.
pub const DEFAULT_DOMAIN: &str = "";
/// Domain of the contrib fused kernels (`QLinearConcat`, `QLinearAdd`, ...).
pub const MS_DOMAIN: &str = "com.microsoft";

/// Element type of a tensor, keyed by the ONNX `TensorProto.DataType` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Undefined,
    Float,
    UInt8,
    Int8,
    UInt16,
    Int16,
    Int32,
    Int64,
    String,
    Bool,
    Float16,
    Double,
    UInt32,
    UInt64,
    BFloat16,
    Other(i32),
}

impl DataType {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => DataType::Undefined,
            1 => DataType::Float,
            2 => DataType::UInt8,
            3 => DataType::Int8,
            4 => DataType::UInt16,
            5 => DataType::Int16,
            6 => DataType::Int32,
            7 => DataType::Int64,
            8 => DataType::String,
            9 => DataType::Bool,
            10 => DataType::Float16,
            11 => DataType::Double,
            12 => DataType::UInt32,
            13 => DataType::UInt64,
            16 => DataType::BFloat16,
            other => DataType::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            DataType::Undefined => 0,
            DataType::Float => 1,
            DataType::UInt8 => 2,
            DataType::Int8 => 3,
            DataType::UInt16 => 4,
            DataType::Int16 => 5,
            DataType::Int32 => 6,
            DataType::Int64 => 7,
            DataType::String => 8,
            DataType::Bool => 9,
            DataType::Float16 => 10,
            DataType::Double => 11,
            DataType::UInt32 => 12,
            DataType::UInt64 => 13,
            DataType::BFloat16 => 16,
            DataType::Other(code) => code,
        }
    }

    /// Floating-point element types, the only ones calibration observes.
    pub fn is_float(self) -> bool {
        matches!(
            self,
            DataType::Float | DataType::Float16 | DataType::Double | DataType::BFloat16
        )
    }

    /// Size of one element in bytes, `None` for strings and unknown codes.
    pub fn byte_width(self) -> Option<usize> {
        match self {
            DataType::UInt8 | DataType::Int8 | DataType::Bool => Some(1),
            DataType::UInt16 | DataType::Int16 | DataType::Float16 | DataType::BFloat16 => Some(2),
            DataType::Float | DataType::Int32 | DataType::UInt32 => Some(4),
            DataType::Int64 | DataType::Double | DataType::UInt64 => Some(8),
            DataType::Undefined | DataType::String | DataType::Other(_) => None,
        }
    }
}

/// Initializer payload. Types the quantizer reads or writes are decoded into
/// typed vectors; everything else keeps its little-endian bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Float(Vec<f32>),
    UInt8(Vec<u8>),
    Int8(Vec<i8>),
    UInt16(Vec<u16>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Strings(Vec<Vec<u8>>),
    Raw { data_type: DataType, bytes: Vec<u8> },
}

impl TensorData {
    pub fn data_type(&self) -> DataType {
        match self {
            TensorData::Float(_) => DataType::Float,
            TensorData::UInt8(_) => DataType::UInt8,
            TensorData::Int8(_) => DataType::Int8,
            TensorData::UInt16(_) => DataType::UInt16,
            TensorData::Int16(_) => DataType::Int16,
            TensorData::Int32(_) => DataType::Int32,
            TensorData::Int64(_) => DataType::Int64,
            TensorData::Strings(_) => DataType::String,
            TensorData::Raw { data_type, .. } => *data_type,
        }
    }

    /// Number of elements, when it can be known without the dims.
    pub fn len(&self) -> Option<usize> {
        match self {
            TensorData::Float(v) => Some(v.len()),
            TensorData::UInt8(v) => Some(v.len()),
            TensorData::Int8(v) => Some(v.len()),
            TensorData::UInt16(v) => Some(v.len()),
            TensorData::Int16(v) => Some(v.len()),
            TensorData::Int32(v) => Some(v.len()),
            TensorData::Int64(v) => Some(v.len()),
            TensorData::Strings(v) => Some(v.len()),
            TensorData::Raw { data_type, bytes } => data_type.byte_width().map(|w| bytes.len() / w),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Payload size in bytes as it would be serialized.
    pub fn byte_len(&self) -> usize {
        match self {
            TensorData::Strings(v) => v.iter().map(Vec::len).sum(),
            TensorData::Raw { bytes, .. } => bytes.len(),
            other => {
                let width = other.data_type().byte_width().unwrap_or(0);
                other.len().unwrap_or(0) * width
            }
        }
    }
}

/// A constant tensor stored in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Initializer {
    pub name: String,
    pub dims: Vec<i64>,
    pub data: TensorData,
}

impl Initializer {
    pub fn new(name: impl Into<String>, dims: Vec<i64>, data: TensorData) -> Self {
        Self {
            name: name.into(),
            dims,
            data,
        }
    }

    /// 0-d tensor holding one value.
    pub fn scalar(name: impl Into<String>, data: TensorData) -> Self {
        Self::new(name, Vec::new(), data)
    }

    pub fn data_type(&self) -> DataType {
        self.data.data_type()
    }

    /// Element count implied by the dims.
    pub fn element_count(&self) -> usize {
        self.dims.iter().map(|&d| d.max(0) as usize).product()
    }

    /// Checks that the payload holds exactly as many elements as the dims say.
    pub fn validate(&self) -> Result<()> {
        if let Some(len) = self.data.len() {
            if len != self.element_count() {
                return Err(QuantizeError::InvalidTensor {
                    reason: format!(
                        "initializer '{}' has {} elements but dims {:?} imply {}",
                        self.name,
                        len,
                        self.dims,
                        self.element_count()
                    ),
                });
            }
        }
        Ok(())
    }

    /// Float payload viewed as an n-d array.
    pub fn to_f32_array(&self) -> Result<ArrayD<f32>> {
        self.validate()?;
        let values = match &self.data {
            TensorData::Float(v) => v.clone(),
            TensorData::Raw {
                data_type: DataType::Double,
                bytes,
            } => bytes
                .chunks_exact(8)
                .map(|c| {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(c);
                    f64::from_le_bytes(b) as f32
                })
                .collect(),
            other => {
                return Err(QuantizeError::InvalidTensor {
                    reason: format!(
                        "initializer '{}' is {:?}, expected a float tensor",
                        self.name,
                        other.data_type()
                    ),
                })
            }
        };
        let shape: Vec<usize> = self.dims.iter().map(|&d| d.max(0) as usize).collect();
        ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|e| QuantizeError::InvalidTensor {
            reason: format!("initializer '{}': {e}", self.name),
        })
    }
}

/// A single dimension of a value's static shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dim {
    Value(i64),
    Param(String),
    Unknown,
}

/// Type annotation of a graph input, output or intermediate value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueType {
    Tensor {
        elem_type: DataType,
        shape: Option<Vec<Dim>>,
    },
    /// Non-tensor types (sequence, map, optional, sparse), kept verbatim.
    Opaque(onnx_proto::TypeProto),
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueInfo {
    pub name: String,
    pub ty: ValueType,
    pub doc_string: String,
}

impl ValueInfo {
    pub fn tensor(name: impl Into<String>, elem_type: DataType, shape: Option<Vec<Dim>>) -> Self {
        Self {
            name: name.into(),
            ty: ValueType::Tensor { elem_type, shape },
            doc_string: String::new(),
        }
    }

    pub fn elem_type(&self) -> Option<DataType> {
        match &self.ty {
            ValueType::Tensor { elem_type, .. } if *elem_type != DataType::Undefined => {
                Some(*elem_type)
            }
            _ => None,
        }
    }
}

/// Attribute payload. Kinds the IR does not model are kept as the raw proto.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Int(i64),
    Float(f32),
    String(Vec<u8>),
    Tensor(Box<Initializer>),
    Graph(Box<Graph>),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Strings(Vec<Vec<u8>>),
    Tensors(Vec<Initializer>),
    Graphs(Vec<Graph>),
    Opaque(onnx_proto::AttributeProto),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
}

/// A graph node. Empty input names mark omitted optional inputs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Node {
    pub name: String,
    pub op_type: String,
    pub domain: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: Vec<Attribute>,
    pub doc_string: String,
}

impl Node {
    pub fn new(
        op_type: impl Into<String>,
        name: impl Into<String>,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            inputs,
            outputs,
            ..Default::default()
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.push(Attribute {
            name: name.into(),
            value,
        });
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.iter().find(|a| a.name == name).map(|a| &a.value)
    }

    /// Input name at `index`, `None` when absent or omitted.
    pub fn input(&self, index: usize) -> Option<&str> {
        self.inputs
            .get(index)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Graph {
    pub name: String,
    pub nodes: Vec<Node>,
    pub initializers: Vec<Initializer>,
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<ValueInfo>,
    pub value_info: Vec<ValueInfo>,
    pub doc_string: String,
}

impl Graph {
    pub fn initializer(&self, name: &str) -> Option<&Initializer> {
        self.initializers.iter().find(|i| i.name == name)
    }

    pub fn is_graph_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o.name == name)
    }

    /// Graph inputs that are not backed by an initializer.
    pub fn runtime_inputs(&self) -> impl Iterator<Item = &ValueInfo> {
        let init: HashSet<&str> = self.initializers.iter().map(|i| i.name.as_str()).collect();
        self.inputs.iter().filter(move |i| !init.contains(i.name.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpsetImport {
    pub domain: String,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GraphModel {
    pub ir_version: i64,
    pub producer_name: String,
    pub producer_version: String,
    pub domain: String,
    pub model_version: i64,
    pub doc_string: String,
    pub opset_imports: Vec<OpsetImport>,
    pub metadata_props: Vec<(String, String)>,
    pub graph: Graph,
    pub functions: Vec<onnx_proto::FunctionProto>,
}

fn is_default_domain(domain: &str) -> bool {
    domain.is_empty() || domain == "ai.onnx"
}

impl GraphModel {
    pub fn opset_version(&self, domain: &str) -> Option<i64> {
        let want_default = is_default_domain(domain);
        self.opset_imports
            .iter()
            .find(|o| {
                if want_default {
                    is_default_domain(&o.domain)
                } else {
                    o.domain == domain
                }
            })
            .map(|o| o.version)
    }
}

/// Producer/consumer/type lookup over a graph, built once per run.
#[derive(Debug)]
pub struct GraphIndex<'a> {
    graph: &'a Graph,
    producers: HashMap<&'a str, usize>,
    consumers: HashMap<&'a str, Vec<usize>>,
    initializers: HashMap<&'a str, &'a Initializer>,
    elem_types: HashMap<&'a str, DataType>,
    graph_inputs: HashSet<&'a str>,
    graph_outputs: HashSet<&'a str>,
}

impl<'a> GraphIndex<'a> {
    pub fn new(graph: &'a Graph) -> Self {
        let mut producers = HashMap::new();
        let mut consumers: HashMap<&str, Vec<usize>> = HashMap::new();
        for (idx, node) in graph.nodes.iter().enumerate() {
            for out in node.outputs.iter().filter(|o| !o.is_empty()) {
                producers.entry(out.as_str()).or_insert(idx);
            }
            for input in node.inputs.iter().filter(|i| !i.is_empty()) {
                let entry = consumers.entry(input.as_str()).or_default();
                if entry.last() != Some(&idx) {
                    entry.push(idx);
                }
            }
        }

        let initializers = graph
            .initializers
            .iter()
            .map(|i| (i.name.as_str(), i))
            .collect::<HashMap<_, _>>();

        let mut elem_types = HashMap::new();
        for info in graph
            .inputs
            .iter()
            .chain(graph.outputs.iter())
            .chain(graph.value_info.iter())
        {
            if let Some(t) = info.elem_type() {
                elem_types.insert(info.name.as_str(), t);
            }
        }
        for init in &graph.initializers {
            elem_types.insert(init.name.as_str(), init.data_type());
        }

        Self {
            graph,
            producers,
            consumers,
            initializers,
            elem_types,
            graph_inputs: graph.inputs.iter().map(|i| i.name.as_str()).collect(),
            graph_outputs: graph.outputs.iter().map(|o| o.name.as_str()).collect(),
        }
    }

    pub fn graph(&self) -> &'a Graph {
        self.graph
    }

    /// Index of the node producing `name`, if any.
    pub fn producer(&self, name: &str) -> Option<usize> {
        self.producers.get(name).copied()
    }

    /// Indices of the distinct nodes consuming `name`, in graph order.
    pub fn consumers(&self, name: &str) -> &[usize] {
        self.consumers.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn initializer(&self, name: &str) -> Option<&'a Initializer> {
        self.initializers.get(name).copied()
    }

    pub fn is_initializer(&self, name: &str) -> bool {
        self.initializers.contains_key(name)
    }

    /// Float initializer usable as a quantized constant.
    pub fn float_initializer(&self, name: &str) -> Option<&'a Initializer> {
        self.initializer(name).filter(|i| i.data_type() == DataType::Float)
    }

    /// Declared element type, `None` when the graph carries no annotation.
    pub fn elem_type(&self, name: &str) -> Option<DataType> {
        self.elem_types.get(name).copied()
    }

    pub fn is_graph_input(&self, name: &str) -> bool {
        self.graph_inputs.contains(name)
    }

    pub fn is_graph_output(&self, name: &str) -> bool {
        self.graph_outputs.contains(name)
    }
}
