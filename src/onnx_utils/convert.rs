//! Conversion between the prost-generated ONNX messages and the graph IR.
//!
//! Decoding normalizes every initializer payload: `raw_data` and the typed
//! repeated fields both land in [`TensorData`]. Encoding always writes
//! `raw_data` (little-endian) except for string tensors.

use crate::errors::{QuantizeError, Result};
use crate::graph::{
    Attribute, AttributeValue, DataType, Dim, Graph, GraphModel, Initializer, Node, OpsetImport,
    TensorData, ValueInfo, ValueType,
};
use crate::onnx_proto::{
    attribute_proto::AttributeType, tensor_shape_proto, type_proto, AttributeProto, GraphProto,
    ModelProto, NodeProto, OperatorSetIdProto, StringStringEntryProto, TensorProto,
    TensorShapeProto, TypeProto, ValueInfoProto,
};

// ===========================================================================
// Proto → IR
// ===========================================================================

pub fn model_from_proto(proto: ModelProto) -> Result<GraphModel> {
    let graph = proto
        .graph
        .as_ref()
        .ok_or_else(|| QuantizeError::Other("model has no graph".into()))?;

    Ok(GraphModel {
        ir_version: proto.ir_version,
        producer_name: proto.producer_name,
        producer_version: proto.producer_version,
        domain: proto.domain,
        model_version: proto.model_version,
        doc_string: proto.doc_string,
        opset_imports: proto
            .opset_import
            .into_iter()
            .map(|o| OpsetImport {
                domain: o.domain,
                version: o.version,
            })
            .collect(),
        metadata_props: proto
            .metadata_props
            .into_iter()
            .map(|p| (p.key, p.value))
            .collect(),
        graph: graph_from_proto(graph)?,
        functions: proto.functions,
    })
}

pub fn graph_from_proto(graph: &GraphProto) -> Result<Graph> {
    Ok(Graph {
        name: graph.name.clone(),
        nodes: graph
            .node
            .iter()
            .map(node_from_proto)
            .collect::<Result<Vec<_>>>()?,
        initializers: graph
            .initializer
            .iter()
            .map(tensor_from_proto)
            .collect::<Result<Vec<_>>>()?,
        inputs: graph.input.iter().map(value_info_from_proto).collect(),
        outputs: graph.output.iter().map(value_info_from_proto).collect(),
        value_info: graph.value_info.iter().map(value_info_from_proto).collect(),
        doc_string: graph.doc_string.clone(),
    })
}

fn node_from_proto(node: &NodeProto) -> Result<Node> {
    Ok(Node {
        name: node.name.clone(),
        op_type: node.op_type.clone(),
        domain: node.domain.clone(),
        inputs: node.input.clone(),
        outputs: node.output.clone(),
        attributes: node
            .attribute
            .iter()
            .map(attribute_from_proto)
            .collect::<Result<Vec<_>>>()?,
        doc_string: node.doc_string.clone(),
    })
}

const MODELED_KINDS: [AttributeType; 10] = [
    AttributeType::Float,
    AttributeType::Int,
    AttributeType::String,
    AttributeType::Tensor,
    AttributeType::Graph,
    AttributeType::Floats,
    AttributeType::Ints,
    AttributeType::Strings,
    AttributeType::Tensors,
    AttributeType::Graphs,
];

fn attribute_kind(code: i32) -> Option<AttributeType> {
    MODELED_KINDS.into_iter().find(|k| *k as i32 == code)
}

fn attribute_from_proto(attr: &AttributeProto) -> Result<Attribute> {
    let kind = if attr.ref_attr_name.is_empty() && attr.doc_string.is_empty() {
        attribute_kind(attr.r#type)
    } else {
        None
    };

    let value = match kind {
        Some(AttributeType::Float) => AttributeValue::Float(attr.f),
        Some(AttributeType::Int) => AttributeValue::Int(attr.i),
        Some(AttributeType::String) => AttributeValue::String(attr.s.clone()),
        Some(AttributeType::Tensor) => match &attr.t {
            Some(t) => AttributeValue::Tensor(Box::new(tensor_from_proto(t)?)),
            None => AttributeValue::Opaque(attr.clone()),
        },
        Some(AttributeType::Graph) => match &attr.g {
            Some(g) => AttributeValue::Graph(Box::new(graph_from_proto(g)?)),
            None => AttributeValue::Opaque(attr.clone()),
        },
        Some(AttributeType::Floats) => AttributeValue::Floats(attr.floats.clone()),
        Some(AttributeType::Ints) => AttributeValue::Ints(attr.ints.clone()),
        Some(AttributeType::Strings) => AttributeValue::Strings(attr.strings.clone()),
        Some(AttributeType::Tensors) => AttributeValue::Tensors(
            attr.tensors
                .iter()
                .map(tensor_from_proto)
                .collect::<Result<Vec<_>>>()?,
        ),
        Some(AttributeType::Graphs) => AttributeValue::Graphs(
            attr.graphs
                .iter()
                .map(graph_from_proto)
                .collect::<Result<Vec<_>>>()?,
        ),
        _ => AttributeValue::Opaque(attr.clone()),
    };

    Ok(Attribute {
        name: attr.name.clone(),
        value,
    })
}

fn value_info_from_proto(info: &ValueInfoProto) -> ValueInfo {
    let ty = match &info.r#type {
        Some(TypeProto {
            value: Some(type_proto::Value::TensorType(t)),
            denotation,
        }) if denotation.is_empty() => ValueType::Tensor {
            elem_type: DataType::from_code(t.elem_type),
            shape: t
                .shape
                .as_ref()
                .map(|s| s.dim.iter().map(dim_from_proto).collect()),
        },
        Some(other) => ValueType::Opaque(other.clone()),
        None => ValueType::Unknown,
    };

    ValueInfo {
        name: info.name.clone(),
        ty,
        doc_string: info.doc_string.clone(),
    }
}

fn dim_from_proto(dim: &tensor_shape_proto::Dimension) -> Dim {
    match &dim.value {
        Some(tensor_shape_proto::dimension::Value::DimValue(v)) => Dim::Value(*v),
        Some(tensor_shape_proto::dimension::Value::DimParam(p)) => Dim::Param(p.clone()),
        None => Dim::Unknown,
    }
}

/// Decode a tensor whose payload is already in memory.
///
/// External-data tensors must be resolved before calling this (see
/// [`super::load_model`]).
pub fn tensor_from_proto(t: &TensorProto) -> Result<Initializer> {
    let data_type = DataType::from_code(t.data_type);
    let data = if !t.raw_data.is_empty() {
        decode_raw(&t.name, data_type, &t.raw_data)?
    } else {
        decode_typed_fields(t, data_type)
    };

    Ok(Initializer {
        name: t.name.clone(),
        dims: t.dims.clone(),
        data,
    })
}

fn decode_raw(name: &str, data_type: DataType, raw: &[u8]) -> Result<TensorData> {
    if let Some(width) = data_type.byte_width() {
        if raw.len() % width != 0 {
            return Err(QuantizeError::InvalidTensor {
                reason: format!(
                    "tensor '{name}': raw_data length {} is not a multiple of {width}",
                    raw.len()
                ),
            });
        }
    }

    let data = match data_type {
        DataType::Float => TensorData::Float(
            raw.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        DataType::UInt8 => TensorData::UInt8(raw.to_vec()),
        DataType::Int8 => TensorData::Int8(raw.iter().map(|&b| b as i8).collect()),
        DataType::UInt16 => TensorData::UInt16(
            raw.chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
        ),
        DataType::Int16 => TensorData::Int16(
            raw.chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect(),
        ),
        DataType::Int32 => TensorData::Int32(
            raw.chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        DataType::Int64 => TensorData::Int64(
            raw.chunks_exact(8)
                .map(|c| {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(c);
                    i64::from_le_bytes(b)
                })
                .collect(),
        ),
        other => TensorData::Raw {
            data_type: other,
            bytes: raw.to_vec(),
        },
    };
    Ok(data)
}

fn decode_typed_fields(t: &TensorProto, data_type: DataType) -> TensorData {
    match data_type {
        DataType::Float => TensorData::Float(t.float_data.clone()),
        DataType::UInt8 => TensorData::UInt8(t.int32_data.iter().map(|&v| v as u8).collect()),
        DataType::Int8 => TensorData::Int8(t.int32_data.iter().map(|&v| v as i8).collect()),
        DataType::UInt16 => TensorData::UInt16(t.int32_data.iter().map(|&v| v as u16).collect()),
        DataType::Int16 => TensorData::Int16(t.int32_data.iter().map(|&v| v as i16).collect()),
        DataType::Int32 => TensorData::Int32(t.int32_data.clone()),
        DataType::Int64 => TensorData::Int64(t.int64_data.clone()),
        DataType::String => TensorData::Strings(t.string_data.clone()),
        DataType::Double => TensorData::Raw {
            data_type,
            bytes: t.double_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        },
        DataType::UInt32 => TensorData::Raw {
            data_type,
            bytes: t
                .uint64_data
                .iter()
                .flat_map(|&v| (v as u32).to_le_bytes())
                .collect(),
        },
        DataType::UInt64 => TensorData::Raw {
            data_type,
            bytes: t.uint64_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        },
        DataType::Bool => TensorData::Raw {
            data_type,
            bytes: t.int32_data.iter().map(|&v| v as u8).collect(),
        },
        // float16 / bfloat16 bit patterns live in the low half of int32_data.
        DataType::Float16 | DataType::BFloat16 => TensorData::Raw {
            data_type,
            bytes: t
                .int32_data
                .iter()
                .flat_map(|&v| (v as u16).to_le_bytes())
                .collect(),
        },
        other => TensorData::Raw {
            data_type: other,
            bytes: Vec::new(),
        },
    }
}

// ===========================================================================
// IR → Proto
// ===========================================================================

pub fn model_to_proto(model: &GraphModel) -> ModelProto {
    ModelProto {
        ir_version: model.ir_version,
        opset_import: model
            .opset_imports
            .iter()
            .map(|o| OperatorSetIdProto {
                domain: o.domain.clone(),
                version: o.version,
            })
            .collect(),
        producer_name: model.producer_name.clone(),
        producer_version: model.producer_version.clone(),
        domain: model.domain.clone(),
        model_version: model.model_version,
        doc_string: model.doc_string.clone(),
        graph: Some(graph_to_proto(&model.graph)),
        metadata_props: model
            .metadata_props
            .iter()
            .map(|(key, value)| StringStringEntryProto {
                key: key.clone(),
                value: value.clone(),
            })
            .collect(),
        training_info: Vec::new(),
        functions: model.functions.clone(),
    }
}

pub fn graph_to_proto(graph: &Graph) -> GraphProto {
    GraphProto {
        node: graph.nodes.iter().map(node_to_proto).collect(),
        name: graph.name.clone(),
        initializer: graph.initializers.iter().map(tensor_to_proto).collect(),
        doc_string: graph.doc_string.clone(),
        input: graph.inputs.iter().map(value_info_to_proto).collect(),
        output: graph.outputs.iter().map(value_info_to_proto).collect(),
        value_info: graph.value_info.iter().map(value_info_to_proto).collect(),
        ..Default::default()
    }
}

fn node_to_proto(node: &Node) -> NodeProto {
    NodeProto {
        input: node.inputs.clone(),
        output: node.outputs.clone(),
        name: node.name.clone(),
        op_type: node.op_type.clone(),
        domain: node.domain.clone(),
        attribute: node.attributes.iter().map(attribute_to_proto).collect(),
        doc_string: node.doc_string.clone(),
    }
}

fn attribute_to_proto(attr: &Attribute) -> AttributeProto {
    let mut proto = AttributeProto {
        name: attr.name.clone(),
        ..Default::default()
    };
    match &attr.value {
        AttributeValue::Float(f) => {
            proto.r#type = AttributeType::Float as i32;
            proto.f = *f;
        }
        AttributeValue::Int(i) => {
            proto.r#type = AttributeType::Int as i32;
            proto.i = *i;
        }
        AttributeValue::String(s) => {
            proto.r#type = AttributeType::String as i32;
            proto.s = s.clone();
        }
        AttributeValue::Tensor(t) => {
            proto.r#type = AttributeType::Tensor as i32;
            proto.t = Some(tensor_to_proto(t));
        }
        AttributeValue::Graph(g) => {
            proto.r#type = AttributeType::Graph as i32;
            proto.g = Some(graph_to_proto(g));
        }
        AttributeValue::Floats(v) => {
            proto.r#type = AttributeType::Floats as i32;
            proto.floats = v.clone();
        }
        AttributeValue::Ints(v) => {
            proto.r#type = AttributeType::Ints as i32;
            proto.ints = v.clone();
        }
        AttributeValue::Strings(v) => {
            proto.r#type = AttributeType::Strings as i32;
            proto.strings = v.clone();
        }
        AttributeValue::Tensors(v) => {
            proto.r#type = AttributeType::Tensors as i32;
            proto.tensors = v.iter().map(tensor_to_proto).collect();
        }
        AttributeValue::Graphs(v) => {
            proto.r#type = AttributeType::Graphs as i32;
            proto.graphs = v.iter().map(graph_to_proto).collect();
        }
        AttributeValue::Opaque(raw) => {
            proto = raw.clone();
            proto.name = attr.name.clone();
        }
    }
    proto
}

fn value_info_to_proto(info: &ValueInfo) -> ValueInfoProto {
    let r#type = match &info.ty {
        ValueType::Tensor { elem_type, shape } => Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: elem_type.code(),
                shape: shape.as_ref().map(|dims| TensorShapeProto {
                    dim: dims.iter().map(dim_to_proto).collect(),
                }),
            })),
            denotation: String::new(),
        }),
        ValueType::Opaque(t) => Some(t.clone()),
        ValueType::Unknown => None,
    };

    ValueInfoProto {
        name: info.name.clone(),
        r#type,
        doc_string: info.doc_string.clone(),
    }
}

fn dim_to_proto(dim: &Dim) -> tensor_shape_proto::Dimension {
    let value = match dim {
        Dim::Value(v) => Some(tensor_shape_proto::dimension::Value::DimValue(*v)),
        Dim::Param(p) => Some(tensor_shape_proto::dimension::Value::DimParam(p.clone())),
        Dim::Unknown => None,
    };
    tensor_shape_proto::Dimension {
        value,
        denotation: String::new(),
    }
}

pub fn tensor_to_proto(init: &Initializer) -> TensorProto {
    let mut proto = TensorProto {
        name: init.name.clone(),
        dims: init.dims.clone(),
        data_type: init.data_type().code(),
        ..Default::default()
    };
    match &init.data {
        TensorData::Strings(s) => proto.string_data = s.clone(),
        other => proto.raw_data = raw_bytes(other),
    }
    proto
}

/// Little-endian byte image of a non-string payload.
pub fn raw_bytes(data: &TensorData) -> Vec<u8> {
    match data {
        TensorData::Float(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        TensorData::UInt8(v) => v.clone(),
        TensorData::Int8(v) => v.iter().map(|&x| x as u8).collect(),
        TensorData::UInt16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        TensorData::Int16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        TensorData::Int32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        TensorData::Int64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        TensorData::Strings(_) => Vec::new(),
        TensorData::Raw { bytes, .. } => bytes.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx_proto::tensor_proto;

    #[test]
    fn test_float_data_and_raw_data_decode_alike() {
        let typed = TensorProto {
            name: "w".into(),
            dims: vec![2],
            data_type: tensor_proto::DataType::Float as i32,
            float_data: vec![1.5, -2.0],
            ..Default::default()
        };
        let raw = TensorProto {
            raw_data: [1.5f32, -2.0].iter().flat_map(|v| v.to_le_bytes()).collect(),
            float_data: Vec::new(),
            ..typed.clone()
        };
        assert_eq!(tensor_from_proto(&typed).unwrap(), tensor_from_proto(&raw).unwrap());
    }

    #[test]
    fn test_int8_from_int32_data() {
        let t = TensorProto {
            name: "q".into(),
            dims: vec![3],
            data_type: tensor_proto::DataType::Int8 as i32,
            int32_data: vec![-128, 0, 127],
            ..Default::default()
        };
        let init = tensor_from_proto(&t).unwrap();
        assert_eq!(init.data, TensorData::Int8(vec![-128, 0, 127]));
    }

    #[test]
    fn test_truncated_raw_data_is_rejected() {
        let t = TensorProto {
            name: "bad".into(),
            dims: vec![1],
            data_type: tensor_proto::DataType::Float as i32,
            raw_data: vec![0, 0, 0],
            ..Default::default()
        };
        assert!(matches!(
            tensor_from_proto(&t),
            Err(QuantizeError::InvalidTensor { .. })
        ));
    }

    #[test]
    fn test_unmodeled_attribute_is_carried_verbatim() {
        let attr = AttributeProto {
            name: "tp".into(),
            r#type: AttributeType::TypeProto as i32,
            tp: Some(TypeProto::default()),
            ..Default::default()
        };
        let ir = attribute_from_proto(&attr).unwrap();
        assert!(matches!(ir.value, AttributeValue::Opaque(_)));
        assert_eq!(attribute_to_proto(&ir), attr);
    }

    #[test]
    fn test_int_attribute_round_trip() {
        let attr = Attribute {
            name: "axis".into(),
            value: AttributeValue::Int(1),
        };
        let proto = attribute_to_proto(&attr);
        assert_eq!(proto.r#type, AttributeType::Int as i32);
        assert_eq!(attribute_from_proto(&proto).unwrap(), attr);
    }
}
