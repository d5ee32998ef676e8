//! End-to-end integration tests for ptq-rs.
//!
//! Models are built in memory (no model files checked into the repo) and run
//! through calibration, the rewrite, and an encode/decode round trip.

use std::collections::HashMap;

use ndarray::{ArrayD, IxDyn};
use ptq_rs::calibration::{CalibrationBatch, InferenceSession};
use ptq_rs::graph::{AttributeValue, DataType, Dim, OpsetImport, TensorData, ValueInfo, MS_DOMAIN};
use ptq_rs::onnx_utils::graph_builder::validate_graph_connectivity;
use ptq_rs::onnx_utils::{decode_model, encode_model};
use ptq_rs::*;

// ===========================================================================
// Helpers
// ===========================================================================

fn float(name: &str) -> ValueInfo {
    ValueInfo::tensor(name, DataType::Float, None)
}

fn model(nodes: Vec<Node>, initializers: Vec<Initializer>, inputs: &[&str], outputs: &[&str]) -> GraphModel {
    GraphModel {
        ir_version: 8,
        producer_name: "tests".into(),
        opset_imports: vec![OpsetImport {
            domain: String::new(),
            version: 13,
        }],
        graph: Graph {
            name: "test_graph".into(),
            nodes,
            initializers,
            inputs: inputs.iter().map(|n| float(n)).collect(),
            outputs: outputs.iter().map(|n| float(n)).collect(),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// a, b -> Concat(axis=1) -> y
fn concat_model() -> GraphModel {
    model(
        vec![Node::new("Concat", "concat0", vec!["a".into(), "b".into()], vec!["y".into()])
            .with_attribute("axis", AttributeValue::Int(1))],
        vec![],
        &["a", "b"],
        &["y"],
    )
}

fn table(entries: &[(&str, f32, f32)]) -> TensorRangeTable {
    let mut table = TensorRangeTable::new();
    for &(name, lo, hi) in entries {
        table.insert(name, TensorRange::new(lo, hi));
    }
    table
}

fn config(format: QuantFormat) -> QuantizationConfig {
    QuantizationConfig {
        quant_format: format,
        activation_type: QuantType::QUInt8,
        weight_type: QuantType::QInt8,
        ..Default::default()
    }
}

fn ops(model: &GraphModel) -> Vec<&str> {
    model.graph.nodes.iter().map(|n| n.op_type.as_str()).collect()
}

fn node<'a>(model: &'a GraphModel, name: &str) -> &'a Node {
    model
        .graph
        .nodes
        .iter()
        .find(|n| n.name == name)
        .unwrap_or_else(|| panic!("no node named {name}"))
}

/// Canned outputs: every requested tensor gets a constant filled array.
struct ScriptedSession {
    outputs: Vec<HashMap<String, ArrayD<f32>>>,
    calls: usize,
}

impl ScriptedSession {
    fn new(batches: &[&[(&str, f32)]]) -> Self {
        let outputs = batches
            .iter()
            .map(|batch| {
                batch
                    .iter()
                    .map(|&(name, v)| (name.to_string(), ArrayD::from_elem(IxDyn(&[1, 2]), v)))
                    .collect()
            })
            .collect();
        Self { outputs, calls: 0 }
    }
}

impl InferenceSession for ScriptedSession {
    fn run(&mut self, _batch: &CalibrationBatch) -> ptq_rs::Result<HashMap<String, ArrayD<f32>>> {
        let out = self.outputs[self.calls].clone();
        self.calls += 1;
        Ok(out)
    }
}

fn dummy_batches(n: usize) -> impl Iterator<Item = CalibrationBatch> {
    (0..n).map(|_| CalibrationBatch::new())
}

// ===========================================================================
// Concat end to end
// ===========================================================================

#[test]
fn test_concat_qoperator() {
    let ranges = table(&[("a", 0.0, 1.0), ("b", 0.0, 2.0), ("y", 0.0, 2.0)]);
    let out = Quantizer::new(config(QuantFormat::QOperator), ranges)
        .quantize_model(&concat_model())
        .unwrap();

    assert_eq!(
        ops(&out),
        vec!["QuantizeLinear", "QuantizeLinear", "QLinearConcat", "DequantizeLinear"]
    );

    let fused = node(&out, "concat0_quant");
    assert_eq!(fused.domain, MS_DOMAIN);
    assert_eq!(
        fused.inputs,
        vec![
            "y_scale",
            "y_zero_point",
            "a_quantized",
            "a_scale",
            "a_zero_point",
            "b_quantized",
            "b_scale",
            "b_zero_point"
        ]
    );
    assert_eq!(fused.outputs, vec!["y_quantized"]);
    assert_eq!(fused.attribute("axis"), Some(&AttributeValue::Int(1)));

    let a_q = node(&out, "a_QuantizeLinear");
    assert_eq!(a_q.inputs, vec!["a", "a_scale", "a_zero_point"]);
    assert_eq!(a_q.outputs, vec!["a_quantized"]);

    // graph output restored under its original name
    let restore = node(&out, "y_DequantizeLinear");
    assert_eq!(restore.inputs, vec!["y_quantized", "y_scale", "y_zero_point"]);
    assert_eq!(restore.outputs, vec!["y"]);

    assert_eq!(out.opset_version(MS_DOMAIN), Some(1));
    assert!(validate_graph_connectivity(&out.graph).valid);

    let b_scale = out.graph.initializer("b_scale").unwrap();
    assert!(b_scale.dims.is_empty());
    match &b_scale.data {
        TensorData::Float(v) => assert!((v[0] - 2.0 / 255.0).abs() < 1e-7),
        other => panic!("unexpected scale payload {other:?}"),
    }
    assert_eq!(
        out.graph.initializer("b_zero_point").unwrap().data,
        TensorData::UInt8(vec![0])
    );
}

#[test]
fn test_concat_qdq() {
    let ranges = table(&[("a", 0.0, 1.0), ("b", 0.0, 2.0), ("y", 0.0, 2.0)]);
    let out = Quantizer::new(config(QuantFormat::QDQ), ranges)
        .quantize_model(&concat_model())
        .unwrap();

    let concat = node(&out, "concat0");
    assert_eq!(concat.op_type, "Concat");
    assert_eq!(
        concat.inputs,
        vec!["a_DequantizeLinear_Output", "b_DequantizeLinear_Output"]
    );

    let a_q = node(&out, "a_QuantizeLinear");
    assert_eq!(a_q.outputs, vec!["a_QuantizeLinear_Output"]);
    let a_dq = node(&out, "a_DequantizeLinear");
    assert_eq!(a_dq.inputs[0], "a_QuantizeLinear_Output");

    let y_dq = node(&out, "y_DequantizeLinear");
    assert_eq!(y_dq.outputs, vec!["y"]);
    assert_eq!(ops(&out).iter().filter(|o| **o == "QuantizeLinear").count(), 3);
    assert_eq!(ops(&out).iter().filter(|o| **o == "DequantizeLinear").count(), 3);

    assert!(out.opset_version(MS_DOMAIN).is_none());
    assert!(validate_graph_connectivity(&out.graph).valid);
}

/// a, b, c -> Concat(axis=1) -> y
fn concat3_model() -> GraphModel {
    model(
        vec![
            Node::new("Concat", "concat0", vec!["a".into(), "b".into(), "c".into()], vec!["y".into()])
                .with_attribute("axis", AttributeValue::Int(1)),
        ],
        vec![],
        &["a", "b", "c"],
        &["y"],
    )
}

fn concat3_ranges() -> TensorRangeTable {
    table(&[("a", 0.0, 1.0), ("b", 0.0, 2.0), ("c", -1.0, 1.0), ("y", -1.0, 2.0)])
}

#[test]
fn test_concat_three_inputs_qoperator() {
    let out = Quantizer::new(config(QuantFormat::QOperator), concat3_ranges())
        .quantize_model(&concat3_model())
        .unwrap();

    assert_eq!(
        ops(&out),
        vec![
            "QuantizeLinear",
            "QuantizeLinear",
            "QuantizeLinear",
            "QLinearConcat",
            "DequantizeLinear"
        ]
    );
    let fused = node(&out, "concat0_quant");
    assert_eq!(
        fused.inputs,
        vec![
            "y_scale",
            "y_zero_point",
            "a_quantized",
            "a_scale",
            "a_zero_point",
            "b_quantized",
            "b_scale",
            "b_zero_point",
            "c_quantized",
            "c_scale",
            "c_zero_point"
        ]
    );
    assert_eq!(fused.outputs, vec!["y_quantized"]);
    assert_eq!(node(&out, "c_QuantizeLinear").outputs, vec!["c_quantized"]);
    assert_eq!(node(&out, "y_DequantizeLinear").outputs, vec!["y"]);
    assert!(validate_graph_connectivity(&out.graph).valid);
}

#[test]
fn test_concat_three_inputs_qdq() {
    let out = Quantizer::new(config(QuantFormat::QDQ), concat3_ranges())
        .quantize_model(&concat3_model())
        .unwrap();

    assert_eq!(
        node(&out, "concat0").inputs,
        vec![
            "a_DequantizeLinear_Output",
            "b_DequantizeLinear_Output",
            "c_DequantizeLinear_Output"
        ]
    );
    for t in ["a", "b", "c"] {
        let q = node(&out, &format!("{t}_QuantizeLinear"));
        assert_eq!(q.inputs[0], t);
        assert_eq!(q.outputs, vec![format!("{t}_QuantizeLinear_Output")]);
        let dq = node(&out, &format!("{t}_DequantizeLinear"));
        assert_eq!(dq.inputs[0], format!("{t}_QuantizeLinear_Output"));
    }
    assert_eq!(node(&out, "y_DequantizeLinear").outputs, vec!["y"]);
    assert_eq!(ops(&out).iter().filter(|o| **o == "QuantizeLinear").count(), 4);
    assert!(validate_graph_connectivity(&out.graph).valid);
}

#[test]
fn test_missing_ranges_leave_graph_float() {
    let ranges = table(&[("a", 0.0, 1.0)]);
    let original = concat_model();
    for format in [QuantFormat::QOperator, QuantFormat::QDQ] {
        let out = Quantizer::new(config(format), ranges.clone())
            .quantize_model(&original)
            .unwrap();
        assert_eq!(out.graph.nodes, original.graph.nodes);
        assert!(out.graph.initializers.is_empty());
    }
}

// ===========================================================================
// Shared tensors
// ===========================================================================

/// x feeds two Concats.
fn fan_out_model() -> GraphModel {
    model(
        vec![
            Node::new("Concat", "c1", vec!["x".into(), "a".into()], vec!["y1".into()]),
            Node::new("Concat", "c2", vec!["x".into(), "b".into()], vec!["y2".into()]),
        ],
        vec![],
        &["x", "a", "b"],
        &["y1", "y2"],
    )
}

fn fan_out_ranges() -> TensorRangeTable {
    table(&[
        ("x", -1.0, 1.0),
        ("a", 0.0, 1.0),
        ("b", 0.0, 1.0),
        ("y1", -1.0, 1.0),
        ("y2", -1.0, 1.0),
    ])
}

#[test]
fn test_shared_tensor_quantized_once() {
    let out = Quantizer::new(config(QuantFormat::QDQ), fan_out_ranges())
        .quantize_model(&fan_out_model())
        .unwrap();

    let x_pairs = out
        .graph
        .nodes
        .iter()
        .filter(|n| n.op_type == "QuantizeLinear" && n.inputs[0] == "x")
        .count();
    assert_eq!(x_pairs, 1);
    assert_eq!(node(&out, "c1").inputs[0], "x_DequantizeLinear_Output");
    assert_eq!(node(&out, "c2").inputs[0], "x_DequantizeLinear_Output");
}

#[test]
fn test_dedicated_pairs_one_per_consumer() {
    let mut cfg = config(QuantFormat::QDQ);
    cfg.extra_options.dedicated_qdq_pair = true;
    let out = Quantizer::new(cfg, fan_out_ranges())
        .quantize_model(&fan_out_model())
        .unwrap();

    let x_pairs: Vec<&Node> = out
        .graph
        .nodes
        .iter()
        .filter(|n| n.op_type == "QuantizeLinear" && n.inputs[0] == "x")
        .collect();
    assert_eq!(x_pairs.len(), 2);
    assert_eq!(x_pairs[0].name, "x_QuantizeLinear_1");
    assert_eq!(x_pairs[1].name, "x_QuantizeLinear_2");
    assert_eq!(node(&out, "c1").inputs[0], "x_DequantizeLinear_Output_1");
    assert_eq!(node(&out, "c2").inputs[0], "x_DequantizeLinear_Output_2");

    // single-consumer tensors keep the shared naming
    assert_eq!(node(&out, "c1").inputs[1], "a_DequantizeLinear_Output");
    assert!(validate_graph_connectivity(&out.graph).valid);
}

#[test]
fn test_dedicated_pair_reused_by_repeated_input() {
    // Concat(x, x) plus a second consumer of x
    let m = model(
        vec![
            Node::new("Concat", "dup", vec!["x".into(), "x".into()], vec!["y1".into()]),
            Node::new("Concat", "c2", vec!["x".into(), "b".into()], vec!["y2".into()]),
        ],
        vec![],
        &["x", "b"],
        &["y1", "y2"],
    );
    let mut cfg = config(QuantFormat::QDQ);
    cfg.extra_options.dedicated_qdq_pair = true;
    let out = Quantizer::new(cfg, fan_out_ranges()).quantize_model(&m).unwrap();

    assert_eq!(
        node(&out, "dup").inputs,
        vec!["x_DequantizeLinear_Output_1", "x_DequantizeLinear_Output_1"]
    );
    assert_eq!(node(&out, "c2").inputs[0], "x_DequantizeLinear_Output_2");
    let x_pairs = out
        .graph
        .nodes
        .iter()
        .filter(|n| n.op_type == "QuantizeLinear" && n.inputs[0] == "x")
        .count();
    assert_eq!(x_pairs, 2);
    assert!(validate_graph_connectivity(&out.graph).valid);
}

#[test]
fn test_excluded_node_unchanged() {
    let mut cfg = config(QuantFormat::QOperator);
    cfg.nodes_to_exclude = vec!["c2".into()];
    let original = fan_out_model();
    let out = Quantizer::new(cfg, fan_out_ranges()).quantize_model(&original).unwrap();

    assert_eq!(node(&out, "c2"), &original.graph.nodes[1]);
    assert_eq!(node(&out, "c1_quant").op_type, "QLinearConcat");
    // x is still read as float by the excluded node
    assert!(validate_graph_connectivity(&out.graph).valid);
}

#[test]
fn test_nodes_to_quantize_filter() {
    let mut cfg = config(QuantFormat::QDQ);
    cfg.nodes_to_quantize = vec!["c2".into()];
    let original = fan_out_model();
    let out = Quantizer::new(cfg, fan_out_ranges()).quantize_model(&original).unwrap();
    assert_eq!(node(&out, "c1"), &original.graph.nodes[0]);
    assert_ne!(node(&out, "c2"), &original.graph.nodes[1]);
}

// ===========================================================================
// Conv / MatMul chains
// ===========================================================================

/// x -> Conv(w, b) -> c -> Relu -> r -> MatMul(m) -> y
fn conv_chain() -> GraphModel {
    let w = Initializer::new(
        "w",
        vec![2, 1, 1, 1],
        TensorData::Float(vec![0.5, -0.25]),
    );
    let b = Initializer::new("b", vec![2], TensorData::Float(vec![0.1, -0.1]));
    let m = Initializer::new("m", vec![3, 2], TensorData::Float(vec![1.0, 0.0, 0.5, -0.5, 0.0, 1.0]));
    model(
        vec![
            Node::new("Conv", "conv", vec!["x".into(), "w".into(), "b".into()], vec!["c".into()]),
            Node::new("Relu", "relu", vec!["c".into()], vec!["r".into()]),
            Node::new("MatMul", "mm", vec!["r".into(), "m".into()], vec!["y".into()]),
        ],
        vec![w, b, m],
        &["x"],
        &["y"],
    )
}

fn conv_chain_ranges() -> TensorRangeTable {
    table(&[
        ("x", -1.0, 1.0),
        ("c", -0.6, 0.6),
        ("r", 0.0, 0.6),
        ("y", -0.6, 0.6),
    ])
}

#[test]
fn test_conv_chain_qoperator() {
    let out = Quantizer::new(config(QuantFormat::QOperator), conv_chain_ranges())
        .quantize_model(&conv_chain())
        .unwrap();

    assert_eq!(
        ops(&out),
        vec!["QuantizeLinear", "QLinearConv", "QLinearMatMul", "DequantizeLinear"]
    );
    // Relu folded: MatMul reads the conv output directly
    assert_eq!(node(&out, "mm_quant").inputs[0], "c_quantized");
    assert_eq!(node(&out, "conv_quant").inputs[8], "b_quantized");

    let names: Vec<&str> = out.graph.initializers.iter().map(|i| i.name.as_str()).collect();
    for gone in ["w", "b", "m"] {
        assert!(!names.contains(&gone), "{gone} should have been removed");
    }
    assert_eq!(out.graph.initializer("b_quantized").unwrap().data.data_type(), DataType::Int32);
    assert!(validate_graph_connectivity(&out.graph).valid);
}

#[test]
fn test_conv_chain_qdq_per_channel() {
    let mut cfg = config(QuantFormat::QDQ);
    cfg.per_channel = true;
    let out = Quantizer::new(cfg, conv_chain_ranges())
        .quantize_model(&conv_chain())
        .unwrap();

    assert_eq!(
        node(&out, "conv").inputs,
        vec![
            "x_DequantizeLinear_Output",
            "w_DequantizeLinear_Output",
            "b_DequantizeLinear_Output"
        ]
    );
    assert_eq!(node(&out, "relu").inputs, vec!["c_DequantizeLinear_Output"]);
    assert_eq!(node(&out, "w_DequantizeLinear").attribute("axis"), Some(&AttributeValue::Int(0)));
    assert_eq!(node(&out, "m_DequantizeLinear").attribute("axis"), Some(&AttributeValue::Int(1)));
    assert_eq!(out.graph.initializer("m_scale").unwrap().dims, vec![2]);
    assert_eq!(out.opset_version(""), Some(13));
    assert!(validate_graph_connectivity(&out.graph).valid);
}

#[test]
fn test_add_qdq_pair_to_weight_keeps_float_weights() {
    let mut cfg = config(QuantFormat::QDQ);
    cfg.extra_options.add_qdq_pair_to_weight = true;
    let out = Quantizer::new(cfg, conv_chain_ranges())
        .quantize_model(&conv_chain())
        .unwrap();

    assert!(out.graph.initializer("w").is_some());
    assert!(out.graph.initializer("w_quantized").is_none());
    assert_eq!(node(&out, "w_QuantizeLinear").inputs[0], "w");
    assert!(validate_graph_connectivity(&out.graph).valid);
}

#[test]
fn test_conv_chain_dynamic() {
    let out = quantize_dynamic(&conv_chain(), &QuantizationConfig::default()).unwrap();

    assert_eq!(
        ops(&out),
        vec![
            "DynamicQuantizeLinear",
            "ConvInteger",
            "Cast",
            "Mul",
            "Mul",
            "Add",
            "Relu",
            "DynamicQuantizeLinear",
            "MatMulInteger",
            "Cast",
            "Mul",
            "Mul"
        ]
    );
    assert_eq!(
        node(&out, "mm_quant").inputs,
        vec!["r_quantized", "m_quantized", "r_zero_point", "m_zero_point"]
    );
    assert_eq!(node(&out, "conv_bias_add").outputs, vec!["c"]);
    assert_eq!(node(&out, "mm_output_scale_mul").outputs, vec!["y"]);

    let names: Vec<&str> = out.graph.initializers.iter().map(|i| i.name.as_str()).collect();
    for kept in ["w_quantized", "w_scale", "w_zero_point", "b_reshaped", "m_quantized"] {
        assert!(names.contains(&kept), "{kept} missing");
    }
    for gone in ["w", "b", "m", "x_scale"] {
        assert!(!names.contains(&gone), "{gone} still present");
    }
    assert!(out.opset_version(MS_DOMAIN).is_none());
    assert!(validate_graph_connectivity(&out.graph).valid);

    let decoded = decode_model(&encode_model(&out)).unwrap();
    assert_eq!(decoded.graph.nodes, out.graph.nodes);
}

// ===========================================================================
// Calibration pipeline
// ===========================================================================

#[test]
fn test_static_quantization_with_scripted_session() {
    let mut session = ScriptedSession::new(&[
        &[("a", 0.5), ("b", 1.0), ("y", 1.0)],
        &[("a", -1.0), ("b", 2.0), ("y", 2.0)],
    ]);
    let mut reader = dummy_batches(2);
    let out = quantize_static_with_session(
        &concat_model(),
        &mut session,
        &mut reader,
        &config(QuantFormat::QOperator),
    )
    .unwrap();

    assert_eq!(session.calls, 2);
    let a_scale = out.graph.initializer("a_scale").unwrap();
    match &a_scale.data {
        // [-1, 0.5] over 255 steps
        TensorData::Float(v) => assert!((v[0] - 1.5 / 255.0).abs() < 1e-7),
        other => panic!("unexpected scale payload {other:?}"),
    }
}

#[test]
fn test_calibration_moving_average() {
    let mut cfg = config(QuantFormat::QDQ);
    cfg.extra_options.calib_moving_average = true;
    cfg.extra_options.calib_moving_average_constant = 0.5;
    let mut session = ScriptedSession::new(&[&[("a", 0.0), ("b", 0.0), ("y", 0.0)], &[("a", 10.0), ("b", 0.0), ("y", 0.0)]]);

    // batch ranges for a: (0, 0) then (10, 10)
    let ranges = calibrate_with_session(&concat_model(), &mut session, &mut dummy_batches(2), &cfg).unwrap();
    let a = ranges.get("a").unwrap();
    assert_eq!((a.min, a.max), (5.0, 5.0));
}

#[test]
fn test_unobserved_float_tensor_fails() {
    let mut m = concat_model();
    m.graph.value_info.push(float("y"));
    let mut session = ScriptedSession::new(&[&[("a", 0.0), ("b", 1.0)]]);
    let err = calibrate_with_session(&m, &mut session, &mut dummy_batches(1), &config(QuantFormat::QDQ)).unwrap_err();
    assert!(matches!(err, QuantizeError::CalibrationData { .. }));
}

#[test]
fn test_invalid_config_fails_before_calibration() {
    let mut cfg = config(QuantFormat::QDQ);
    cfg.activation_type = QuantType::QInt8;
    cfg.weight_type = QuantType::QUInt8;
    let mut session = ScriptedSession::new(&[]);
    let err = quantize_static_with_session(&concat_model(), &mut session, &mut dummy_batches(1), &cfg).unwrap_err();
    assert!(matches!(err, QuantizeError::Configuration { .. }));
    assert_eq!(session.calls, 0);
}

/// Calibrates through tract on a real model file and .npy dataset.
#[test]
fn test_quantize_static_file_with_tract() {
    let dir = tempfile::tempdir().unwrap();
    let model_path = dir.path().join("model.onnx");
    let data_path = dir.path().join("calib.npy");
    let out_path = dir.path().join("model.quant.onnx");

    let shape = Some(vec![Dim::Value(1), Dim::Value(3)]);
    let mut m = model(
        vec![
            Node::new("Relu", "relu", vec!["x".into()], vec!["r".into()]),
            Node::new("MatMul", "mm", vec!["r".into(), "m".into()], vec!["y".into()]),
        ],
        vec![Initializer::new(
            "m",
            vec![3, 2],
            TensorData::Float(vec![1.0, 0.0, 0.5, -0.5, 0.0, 1.0]),
        )],
        &["x"],
        &["y"],
    );
    m.graph.inputs = vec![ValueInfo::tensor("x", DataType::Float, shape)];
    m.graph.outputs = vec![ValueInfo::tensor(
        "y",
        DataType::Float,
        Some(vec![Dim::Value(1), Dim::Value(2)]),
    )];
    save_model(&m, &model_path, false).unwrap();

    let samples = ndarray::Array2::from_shape_vec((4, 3), (0..12).map(|i| i as f32 / 6.0 - 1.0).collect()).unwrap();
    ndarray_npy::write_npy(&data_path, &samples).unwrap();

    let dataset = CalibrationDataset::from_numpy(&data_path).unwrap();
    let mut reader = dataset.into_reader("x", 1);
    let cfg = QuantizationConfig {
        op_types_to_quantize: vec!["MatMul".into()],
        ..config(QuantFormat::QDQ)
    };
    let out = quantize_static_file(&model_path, &out_path, &mut reader, &cfg).unwrap();

    assert_eq!(node(&out, "mm").inputs[0], "r_DequantizeLinear_Output");
    let reloaded = load_model(&out_path).unwrap();
    assert_eq!(reloaded.graph.nodes, out.graph.nodes);
    assert!(validate_graph_connectivity(&reloaded.graph).valid);
}

// ===========================================================================
// Serialization
// ===========================================================================

#[test]
fn test_quantized_model_survives_encode_decode() {
    let out = Quantizer::new(config(QuantFormat::QOperator), conv_chain_ranges())
        .quantize_model(&conv_chain())
        .unwrap();
    let decoded = decode_model(&encode_model(&out)).unwrap();
    assert_eq!(decoded.graph.nodes, out.graph.nodes);
    assert_eq!(decoded.graph.initializers, out.graph.initializers);
    assert_eq!(decoded.opset_imports, out.opset_imports);
    assert_eq!(decoded.producer_name, "ptq-rs");
}

#[test]
fn test_config_file_drives_quantization() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quant.yaml");
    std::fs::write(
        &path,
        "quant_format: QOperator\nactivation_type: QUInt8\nnodes_to_exclude: [c2]\nextra_options:\n  DedicatedQDQPair: false\n",
    )
    .unwrap();

    let cfg = QuantizationConfig::from_file(&path).unwrap();
    assert_eq!(cfg.quant_format, QuantFormat::QOperator);
    let out = Quantizer::new(cfg, fan_out_ranges()).quantize_model(&fan_out_model()).unwrap();
    assert_eq!(node(&out, "c1_quant").op_type, "QLinearConcat");
    assert_eq!(node(&out, "c2").op_type, "Concat");
}

#[test]
fn test_range_table_round_trip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ranges.yaml");
    let ranges = fan_out_ranges();
    ranges.save(&path).unwrap();
    let loaded = TensorRangeTable::load(&path).unwrap();
    assert_eq!(loaded, ranges);
}
