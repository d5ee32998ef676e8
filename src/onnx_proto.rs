//! ONNX protobuf messages, generated by `build.rs` from `proto/onnx.proto3`
//! (prost-build on a protox-compiled descriptor set, no `protoc` required).
//!
//! Library code works on the [`GraphModel`](crate::graph::GraphModel) IR;
//! these types only appear at the load/save boundary in
//! [`onnx_utils::convert`](crate::onnx_utils::convert).
//!
//! ```rust,ignore
//! use prost::Message;
//! use ptq_rs::onnx_proto::ModelProto;
//!
//! let proto = ModelProto::decode(bytes.as_slice())?;
//! let model = ptq_rs::onnx_utils::decode_model(&bytes)?;
//! ```

include!(concat!(env!("OUT_DIR"), "/onnx.rs"));
