// src/quantizer/mod.rs
//! Graph rewrite: turns a float model plus calibrated ranges into a QOperator
//! or QDQ quantized model. In dynamic mode no ranges are needed; activations
//! are quantized at run time in front of integer kernels.
//!
//! Nodes are visited once, in their original (topological) order. Each node is
//! either handed to the strategy registered for its op type or copied. The
//! input model is never modified; a new [`GraphModel`] is returned.

pub mod context;
pub mod operators;
pub mod registry;

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::calibration::TensorRangeTable;
use crate::config::{QuantFormat, QuantizationConfig};
use crate::errors::{QuantizeError, Result};
use crate::graph::{Graph, GraphIndex, GraphModel, Node, DEFAULT_DOMAIN, MS_DOMAIN};
use crate::onnx_utils::graph_builder::{ensure_opset_version, prune_value_info, remove_unused_initializers};

pub use context::{QuantizationContext, QuantizedValue, ValueKind};
pub use registry::{
    registered_integer_op_types, registered_op_types, OperatorRegistry, OperatorStrategy, StrategyOutcome,
};

/// Lowest default-domain opset with QuantizeLinear / DequantizeLinear.
const MIN_OPSET: i64 = 10;
/// First opset with per-axis QuantizeLinear / DequantizeLinear.
const PER_CHANNEL_OPSET: i64 = 13;
/// First opset with 16-bit QuantizeLinear / DequantizeLinear.
const SIXTEEN_BIT_OPSET: i64 = 21;
/// First opset with DynamicQuantizeLinear.
const DYNAMIC_OPSET: i64 = 11;

/// Metadata key set by the model pre-processing step (shape inference and
/// graph optimization).
pub const PRE_PROCESS_METADATA_KEY: &str = "onnx.quant.pre_process";

const PRODUCER_NAME: &str = "ptq-rs";

/// Counts reported after a rewrite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuantizationReport {
    pub nodes_visited: usize,
    pub nodes_rewritten: usize,
    pub nodes_unchanged: usize,
    pub tensors_quantized: usize,
    pub initializers_removed: usize,
}

/// Where activation parameters come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RewriteMode {
    /// Calibrated ranges, fixed in the graph.
    #[default]
    Static,
    /// Computed at run time by `DynamicQuantizeLinear`.
    Dynamic,
}

#[derive(Debug, Clone)]
pub struct Quantizer {
    config: QuantizationConfig,
    ranges: TensorRangeTable,
    mode: RewriteMode,
}

impl Quantizer {
    pub fn new(config: QuantizationConfig, ranges: TensorRangeTable) -> Self {
        Self {
            config,
            ranges,
            mode: RewriteMode::Static,
        }
    }

    /// A quantizer for dynamic mode. `config` is used as given; see
    /// [`crate::quantize_dynamic`] for the settings it implies.
    pub fn dynamic(config: QuantizationConfig) -> Self {
        Self {
            config,
            ranges: TensorRangeTable::new(),
            mode: RewriteMode::Dynamic,
        }
    }

    pub fn mode(&self) -> RewriteMode {
        self.mode
    }

    pub fn config(&self) -> &QuantizationConfig {
        &self.config
    }

    pub fn ranges(&self) -> &TensorRangeTable {
        &self.ranges
    }

    /// Rewrite `model`. Configuration errors are reported before anything is
    /// built.
    pub fn quantize_model(&self, model: &GraphModel) -> Result<GraphModel> {
        self.quantize_model_with_report(model).map(|(m, _)| m)
    }

    pub fn quantize_model_with_report(&self, model: &GraphModel) -> Result<(GraphModel, QuantizationReport)> {
        self.config.validate()?;
        if !is_pre_processed(model) {
            warn!(
                "model has not been pre-processed; consider running shape inference and graph \
                 optimization before quantization"
            );
        }

        let registry = match self.mode {
            RewriteMode::Static => OperatorRegistry::for_format(self.config.quant_format),
            RewriteMode::Dynamic => OperatorRegistry::integer_ops(),
        };
        let op_types: HashSet<String> = if self.config.op_types_to_quantize.is_empty() {
            registry.op_types().into_iter().collect()
        } else {
            self.config.op_types_to_quantize.iter().cloned().collect()
        };
        for op in op_types.iter().filter(|op| !registry.contains(op)) {
            let err = QuantizeError::UnsupportedOperator { op_type: op.clone() };
            warn!(format = %self.config.quant_format, mode = ?self.mode, "{err}, nodes left in float");
        }

        let graph = &model.graph;
        let ranges = self.adjusted_ranges(graph, &op_types);
        let mut ctx = QuantizationContext::new(&self.config, graph, &ranges);
        let mut report = QuantizationReport {
            nodes_visited: graph.nodes.len(),
            ..Default::default()
        };

        for node in &graph.nodes {
            let strategy = if self.should_quantize(node, &op_types) {
                registry.get(&node.op_type)
            } else {
                None
            };

            let outcome = match strategy.map(|s| s.quantize(node, &mut ctx)) {
                Some(Ok(outcome)) => outcome,
                Some(Err(err)) if !err.is_fatal() => {
                    debug!(node = %node.name, "{err}");
                    StrategyOutcome::Unchanged
                }
                Some(Err(err)) => return Err(err),
                None => StrategyOutcome::Unchanged,
            };
            match outcome {
                StrategyOutcome::Rewritten => report.nodes_rewritten += 1,
                StrategyOutcome::Unchanged => {
                    if strategy.is_some() {
                        debug!(node = %node.name, op_type = %node.op_type, "left in float");
                    }
                    report.nodes_unchanged += 1;
                    registry.fallback().quantize(node, &mut ctx)?;
                }
            }
            ctx.flush_pending_outputs();
        }

        if self.config.quant_format == QuantFormat::QOperator {
            ctx.restore_graph_outputs();
        }
        let summary = ctx.finish();
        report.tensors_quantized = summary.quantized_values;

        let mut output = GraphModel {
            graph: Graph {
                nodes: summary.nodes,
                ..graph.clone()
            },
            ..model.clone()
        };
        output.graph.initializers.extend(summary.initializers);

        if summary.custom_domain_used {
            ensure_opset_version(&mut output, MS_DOMAIN, 1);
        }
        if self.config.quant_format == QuantFormat::QDQ && summary.per_channel_emitted {
            ensure_opset_version(&mut output, DEFAULT_DOMAIN, PER_CHANNEL_OPSET);
        }
        if self.config.activation_type.is_16bit() || self.config.weight_type.is_16bit() {
            ensure_opset_version(&mut output, DEFAULT_DOMAIN, SIXTEEN_BIT_OPSET);
        }
        if self.mode == RewriteMode::Dynamic {
            ensure_opset_version(&mut output, DEFAULT_DOMAIN, DYNAMIC_OPSET);
        }
        ensure_opset_version(&mut output, DEFAULT_DOMAIN, MIN_OPSET);

        if !self.config.extra_options.add_qdq_pair_to_weight {
            report.initializers_removed = remove_unused_initializers(&mut output.graph);
        }
        prune_value_info(&mut output.graph);

        output.producer_name = PRODUCER_NAME.to_string();
        output.producer_version = crate::VERSION.to_string();

        info!(
            format = %self.config.quant_format,
            mode = ?self.mode,
            rewritten = report.nodes_rewritten,
            unchanged = report.nodes_unchanged,
            tensors = report.tensors_quantized,
            "graph quantized"
        );
        Ok((output, report))
    }

    fn should_quantize(&self, node: &Node, op_types: &HashSet<String>) -> bool {
        let cfg = &self.config;
        (cfg.nodes_to_quantize.is_empty() || cfg.nodes_to_quantize.contains(&node.name))
            && op_types.contains(&node.op_type)
            && !cfg.nodes_to_exclude.contains(&node.name)
    }

    /// With asymmetric activations a Relu/Clip fed by a single-consumer tensor
    /// takes that tensor's parameters over: the input range becomes the
    /// output range, so the clamp folds into the producer.
    fn adjusted_ranges(&self, graph: &Graph, op_types: &HashSet<String>) -> TensorRangeTable {
        let mut ranges = self.ranges.clone();
        if self.config.extra_options.activation_symmetric {
            return ranges;
        }

        let index = GraphIndex::new(graph);
        for node in &graph.nodes {
            if !matches!(node.op_type.as_str(), "Relu" | "Clip") || !self.should_quantize(node, op_types) {
                continue;
            }
            let (Some(input), Some(output)) = (node.input(0), node.outputs.first()) else {
                continue;
            };
            if index.consumers(input).len() != 1 || index.is_graph_output(input) {
                continue;
            }
            if let (true, Some(range)) = (self.ranges.contains(input), self.ranges.get(output)) {
                debug!(input, output = %output, "using activation output range for its input");
                ranges.insert(input, range);
            }
        }
        ranges
    }
}

/// Whether the model carries the marker left by the pre-processing step.
pub fn is_pre_processed(model: &GraphModel) -> bool {
    model.metadata_props.iter().any(|(key, _)| key == PRE_PROCESS_METADATA_KEY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::TensorRange;
    use crate::graph::{DataType, Initializer, OpsetImport, TensorData, ValueInfo};
    use crate::quantization::QuantType;

    fn model(nodes: Vec<Node>, initializers: Vec<Initializer>, inputs: &[&str], outputs: &[&str]) -> GraphModel {
        GraphModel {
            ir_version: 8,
            opset_imports: vec![OpsetImport {
                domain: String::new(),
                version: 9,
            }],
            graph: Graph {
                name: "g".into(),
                nodes,
                initializers,
                inputs: inputs.iter().map(|n| ValueInfo::tensor(*n, DataType::Float, None)).collect(),
                outputs: outputs.iter().map(|n| ValueInfo::tensor(*n, DataType::Float, None)).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn ranges(entries: &[(&str, f32, f32)]) -> TensorRangeTable {
        entries
            .iter()
            .map(|(n, lo, hi)| (n.to_string(), TensorRange::new(*lo, *hi)))
            .collect()
    }

    fn config(format: QuantFormat) -> QuantizationConfig {
        QuantizationConfig {
            quant_format: format,
            activation_type: QuantType::QUInt8,
            ..Default::default()
        }
    }

    fn conv_relu() -> GraphModel {
        model(
            vec![
                Node::new("Conv", "conv", vec!["x".into(), "w".into()], vec!["c".into()]),
                Node::new("Relu", "relu", vec!["c".into()], vec!["y".into()]),
            ],
            vec![Initializer::new("w", vec![1, 1, 1, 1], TensorData::Float(vec![0.5]))],
            &["x"],
            &["y"],
        )
    }

    #[test]
    fn test_invalid_config_rejected_before_rewrite() {
        let mut cfg = config(QuantFormat::QDQ);
        cfg.activation_type = QuantType::QInt8;
        cfg.weight_type = QuantType::QUInt8;
        let err = Quantizer::new(cfg, TensorRangeTable::new())
            .quantize_model(&conv_relu())
            .unwrap_err();
        assert!(matches!(err, crate::errors::QuantizeError::Configuration { .. }));
    }

    #[test]
    fn test_qoperator_conv_relu() {
        let r = ranges(&[("x", 0.0, 1.0), ("c", -2.0, 2.0), ("y", 0.0, 2.0)]);
        let (out, report) = Quantizer::new(config(QuantFormat::QOperator), r)
            .quantize_model_with_report(&conv_relu())
            .unwrap();

        let ops: Vec<&str> = out.graph.nodes.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(ops, vec!["QuantizeLinear", "QLinearConv", "DequantizeLinear"]);
        assert_eq!(report.nodes_rewritten, 2);

        // the Relu's output range was folded into the conv output
        let c_zp = out.graph.initializer("c_zero_point").unwrap();
        assert_eq!(c_zp.data, TensorData::UInt8(vec![0]));
        assert_eq!(out.opset_version(DEFAULT_DOMAIN), Some(10));
        assert!(out.graph.initializer("w").is_none());
        assert_eq!(out.producer_name, "ptq-rs");
        assert!(out.opset_version(MS_DOMAIN).is_none());
    }

    #[test]
    fn test_excluded_node_copied() {
        let r = ranges(&[("x", 0.0, 1.0), ("c", -2.0, 2.0), ("y", 0.0, 2.0)]);
        let mut cfg = config(QuantFormat::QDQ);
        cfg.nodes_to_exclude = vec!["conv".into()];
        let original = conv_relu();
        let out = Quantizer::new(cfg, r).quantize_model(&original).unwrap();
        let conv = out.graph.nodes.iter().find(|n| n.name == "conv").unwrap();
        assert_eq!(conv, &original.graph.nodes[0]);
        assert!(out.graph.initializer("w").is_some());
    }

    #[test]
    fn test_op_type_filter() {
        let r = ranges(&[("x", 0.0, 1.0), ("c", -2.0, 2.0), ("y", 0.0, 2.0)]);
        let mut cfg = config(QuantFormat::QOperator);
        cfg.op_types_to_quantize = vec!["Relu".into(), "LSTM".into()];
        let original = conv_relu();
        let out = Quantizer::new(cfg, r).quantize_model(&original).unwrap();
        // Relu alone has no quantized producer to fold into
        assert_eq!(out.graph.nodes, original.graph.nodes);
    }

    #[test]
    fn test_qdq_per_channel_bumps_opset() {
        let r = ranges(&[("x", 0.0, 1.0), ("c", -2.0, 2.0), ("y", 0.0, 2.0)]);
        let mut cfg = config(QuantFormat::QDQ);
        cfg.per_channel = true;
        let out = Quantizer::new(cfg, r).quantize_model(&conv_relu()).unwrap();
        assert_eq!(out.opset_version(DEFAULT_DOMAIN), Some(13));
    }

    #[test]
    fn test_custom_domain_import_added() {
        let m = model(
            vec![Node::new("Add", "add", vec!["a".into(), "b".into()], vec!["y".into()])],
            vec![],
            &["a", "b"],
            &["y"],
        );
        let r = ranges(&[("a", 0.0, 1.0), ("b", 0.0, 1.0), ("y", 0.0, 2.0)]);
        let out = Quantizer::new(config(QuantFormat::QOperator), r).quantize_model(&m).unwrap();
        assert_eq!(out.opset_version(MS_DOMAIN), Some(1));
    }

    #[test]
    fn test_pre_process_marker() {
        let mut m = conv_relu();
        assert!(!is_pre_processed(&m));
        m.metadata_props.push(("author".into(), "tests".into()));
        assert!(!is_pre_processed(&m));
        m.metadata_props
            .push((PRE_PROCESS_METADATA_KEY.into(), "onnxruntime.quant".into()));
        assert!(is_pre_processed(&m));

        // the marker is carried into the quantized model
        let r = ranges(&[("x", 0.0, 1.0), ("c", -2.0, 2.0), ("y", 0.0, 2.0)]);
        let out = Quantizer::new(config(QuantFormat::QDQ), r).quantize_model(&m).unwrap();
        assert!(is_pre_processed(&out));
    }

    #[test]
    fn test_dynamic_conv_relu() {
        let mut cfg = config(QuantFormat::QOperator);
        cfg.weight_type = QuantType::QUInt8;
        let (out, report) = Quantizer::dynamic(cfg).quantize_model_with_report(&conv_relu()).unwrap();

        let ops: Vec<&str> = out.graph.nodes.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(
            ops,
            vec!["DynamicQuantizeLinear", "ConvInteger", "Cast", "Mul", "Mul", "Relu"]
        );
        assert_eq!(report.nodes_rewritten, 1);
        assert_eq!(report.nodes_unchanged, 1);
        assert_eq!(out.opset_version(DEFAULT_DOMAIN), Some(11));
        assert!(out.graph.initializer("w").is_none());
        assert!(out.graph.initializer("w_quantized").is_some());
        assert!(out.graph.initializer("x_scale").is_none());
    }

    #[test]
    fn test_input_model_untouched() {
        let original = conv_relu();
        let copy = original.clone();
        let r = ranges(&[("x", 0.0, 1.0), ("c", -2.0, 2.0), ("y", 0.0, 2.0)]);
        Quantizer::new(config(QuantFormat::QDQ), r).quantize_model(&original).unwrap();
        assert_eq!(original, copy);
    }
}
