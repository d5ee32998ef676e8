// src/onnx_utils/mod.rs
//! ONNX model utilities: loading (with external data), saving (optionally
//! externalizing large initializers), model summaries, and the graph-level
//! helpers the quantizer uses to finish a rewritten graph.

pub mod convert;
pub mod graph_builder;
pub mod quantization_nodes;

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use prost::Message;

use crate::errors::{QuantizeError, Result};
use crate::graph::GraphModel;
use crate::onnx_proto::{tensor_proto, ModelProto, StringStringEntryProto, TensorProto};

// Re-export so callers don't have to reach into submodules
pub use graph_builder::ConnectivityReport;

/// Refuse to read model files above this size.
pub const MAX_MODEL_SIZE: u64 = 10 * 1024 * 1024 * 1024; // 10 GB

/// Initializers whose payload is at least this many bytes go to the side file
/// when external data is requested.
pub const EXTERNAL_DATA_THRESHOLD: usize = 1024;

// ===========================================================================
// Load
// ===========================================================================

/// Load an ONNX model file, resolving external-data initializers relative to
/// the model's directory.
pub fn load_model(path: impl AsRef<Path>) -> Result<GraphModel> {
    let path = path.as_ref();
    let load_err = |reason: String| QuantizeError::ModelLoad {
        path: path.to_path_buf(),
        reason,
    };

    let mut file = fs::File::open(path).map_err(|e| load_err(format!("failed to open: {e}")))?;
    let file_size = file
        .metadata()
        .map_err(|e| load_err(format!("failed to read metadata: {e}")))?
        .len();
    if file_size > MAX_MODEL_SIZE {
        return Err(load_err(format!(
            "model file too large: {:.2} GB (max: 10 GB)",
            file_size as f64 / (1024.0 * 1024.0 * 1024.0)
        )));
    }

    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)
        .map_err(|e| load_err(format!("failed to read: {e}")))?;

    let mut proto =
        ModelProto::decode(buffer.as_slice()).map_err(|e| load_err(format!("invalid protobuf: {e}")))?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    if let Some(graph) = proto.graph.as_mut() {
        for tensor in graph.initializer.iter_mut() {
            resolve_external_data(tensor, base_dir).map_err(|e| load_err(e.to_string()))?;
        }
    }

    convert::model_from_proto(proto).map_err(|e| load_err(e.to_string()))
}

/// Decode a model from in-memory protobuf bytes. External data is not resolved.
pub fn decode_model(bytes: &[u8]) -> Result<GraphModel> {
    let proto = ModelProto::decode(bytes).map_err(|e| QuantizeError::ModelLoad {
        path: PathBuf::from("<memory>"),
        reason: format!("invalid protobuf: {e}"),
    })?;
    convert::model_from_proto(proto)
}

fn external_entry<'a>(tensor: &'a TensorProto, key: &str) -> Option<&'a str> {
    tensor
        .external_data
        .iter()
        .find(|e| e.key == key)
        .map(|e| e.value.as_str())
}

fn resolve_external_data(tensor: &mut TensorProto, base_dir: &Path) -> Result<()> {
    if tensor.data_location != tensor_proto::DataLocation::External as i32 {
        return Ok(());
    }

    let location = external_entry(tensor, "location").ok_or_else(|| QuantizeError::InvalidTensor {
        reason: format!("tensor '{}' is external but has no location", tensor.name),
    })?;
    let parse = |key: &str| -> Result<Option<u64>> {
        external_entry(tensor, key)
            .map(|v| {
                v.parse::<u64>().map_err(|e| QuantizeError::InvalidTensor {
                    reason: format!("tensor '{}': bad external {key} '{v}': {e}", tensor.name),
                })
            })
            .transpose()
    };
    let offset = parse("offset")?.unwrap_or(0);
    let length = parse("length")?;

    let data_path = base_dir.join(location);
    let mut file = fs::File::open(&data_path).map_err(|e| QuantizeError::InvalidTensor {
        reason: format!(
            "tensor '{}': cannot open external data '{}': {e}",
            tensor.name,
            data_path.display()
        ),
    })?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| QuantizeError::Other(format!("seek failed: {e}")))?;

    let mut bytes = Vec::new();
    match length {
        Some(len) => {
            bytes.resize(len as usize, 0);
            file.read_exact(&mut bytes)
        }
        None => file.read_to_end(&mut bytes).map(|_| ()),
    }
    .map_err(|e| QuantizeError::InvalidTensor {
        reason: format!("tensor '{}': short external data read: {e}", tensor.name),
    })?;

    tensor.raw_data = bytes;
    tensor.external_data.clear();
    tensor.data_location = tensor_proto::DataLocation::Default as i32;
    Ok(())
}

// ===========================================================================
// Save
// ===========================================================================

/// Serialize a model to protobuf bytes with every payload inline.
pub fn encode_model(model: &GraphModel) -> Vec<u8> {
    convert::model_to_proto(model).encode_to_vec()
}

/// Write a model to `path`.
///
/// With `use_external_data`, initializers of at least
/// [`EXTERNAL_DATA_THRESHOLD`] bytes are appended to `<file name>.data` next
/// to the model and referenced by location/offset/length. Both files are
/// written to temporaries first and only moved into place once complete.
pub fn save_model(model: &GraphModel, path: impl AsRef<Path>, use_external_data: bool) -> Result<()> {
    let path = path.as_ref();
    let save_err = |reason: String| QuantizeError::ModelSave {
        path: path.to_path_buf(),
        reason,
    };

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| save_err("output path has no file name".into()))?;

    let mut proto = convert::model_to_proto(model);

    let mut side_file = None;
    if use_external_data {
        let data_name = format!("{file_name}.data");
        let mut data = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| save_err(format!("failed to create data file: {e}")))?;
        let mut offset = 0u64;

        if let Some(graph) = proto.graph.as_mut() {
            for tensor in graph.initializer.iter_mut() {
                if tensor.raw_data.len() < EXTERNAL_DATA_THRESHOLD {
                    continue;
                }
                let length = tensor.raw_data.len() as u64;
                data.write_all(&tensor.raw_data)
                    .map_err(|e| save_err(format!("failed to write external data: {e}")))?;
                tensor.external_data = vec![
                    StringStringEntryProto {
                        key: "location".into(),
                        value: data_name.clone(),
                    },
                    StringStringEntryProto {
                        key: "offset".into(),
                        value: offset.to_string(),
                    },
                    StringStringEntryProto {
                        key: "length".into(),
                        value: length.to_string(),
                    },
                ];
                tensor.data_location = tensor_proto::DataLocation::External as i32;
                tensor.raw_data.clear();
                offset += length;
            }
        }
        side_file = Some((data, dir.join(data_name)));
    }

    let mut out = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|e| save_err(format!("failed to create output file: {e}")))?;
    out.write_all(&proto.encode_to_vec())
        .map_err(|e| save_err(format!("failed to write model: {e}")))?;

    if let Some((data, data_path)) = side_file {
        data.persist(&data_path)
            .map_err(|e| save_err(format!("failed to persist '{}': {e}", data_path.display())))?;
    }
    out.persist(path)
        .map_err(|e| save_err(format!("failed to persist model: {e}")))?;

    Ok(())
}

// ===========================================================================
// Introspection
// ===========================================================================

#[derive(Debug)]
pub struct ModelInfo {
    pub name: String,
    pub ir_version: i64,
    pub producer: String,
    pub opsets: Vec<(String, i64)>,
    pub num_nodes: usize,
    pub num_initializers: usize,
    pub initializer_bytes: usize,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// Node count per op type.
    pub op_counts: BTreeMap<String, usize>,
}

impl ModelInfo {
    pub fn from_model(model: &GraphModel) -> Self {
        let graph = &model.graph;
        let mut op_counts = BTreeMap::new();
        for node in &graph.nodes {
            *op_counts.entry(node.op_type.clone()).or_insert(0) += 1;
        }

        Self {
            name: graph.name.clone(),
            ir_version: model.ir_version,
            producer: format!("{} {}", model.producer_name, model.producer_version)
                .trim()
                .to_string(),
            opsets: model
                .opset_imports
                .iter()
                .map(|o| (o.domain.clone(), o.version))
                .collect(),
            num_nodes: graph.nodes.len(),
            num_initializers: graph.initializers.len(),
            initializer_bytes: graph.initializers.iter().map(|i| i.data.byte_len()).sum(),
            inputs: graph.runtime_inputs().map(|i| i.name.clone()).collect(),
            outputs: graph.outputs.iter().map(|o| o.name.clone()).collect(),
            op_counts,
        }
    }
}
