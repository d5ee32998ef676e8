//! Per-operator quantization strategies.
//!
//! Each strategy plans first (`plan_*` on the context, no side effects) and
//! only commits once every parameter it needs is known.

pub mod activation;
pub mod binary;
pub mod concat;
pub mod conv;
pub mod direct;
pub mod fallback;
pub mod integer;
pub mod matmul;

use crate::errors::Result;
use crate::graph::Node;
use crate::onnx_utils::quantization_nodes::fused_node_name;
use crate::quantizer::context::{InputPlan, OutputPlan, QuantizationContext, QuantizedInput};

/// Input `index` already has a quantized identity, or the config says to
/// quantize regardless.
pub(crate) fn input_ready(ctx: &QuantizationContext<'_>, node: &Node, index: usize) -> bool {
    if ctx.config().extra_options.force_quantize_no_input_check {
        return true;
    }
    node.input(index).is_some_and(|name| ctx.is_quantized(name))
}

/// QDQ rewrite: keep `node`, point the planned inputs at their dequantized
/// tensors and queue the planned outputs for a Q/DQ pair.
pub(crate) fn rewire_qdq(
    ctx: &mut QuantizationContext<'_>,
    node: &Node,
    inputs: Vec<(usize, InputPlan)>,
    outputs: Vec<OutputPlan>,
) -> Result<()> {
    let mut rewritten = node.clone();
    for (index, plan) in inputs {
        let quantized = ctx.commit_input(plan)?;
        rewritten.inputs[index] = quantized.name;
    }
    ctx.push_node(rewritten);
    for plan in outputs {
        ctx.enqueue_output(plan);
    }
    Ok(())
}

/// `[name, scale, zero_point]` for each input, flattened in order.
pub(crate) fn qlinear_triples(inputs: &[QuantizedInput]) -> Vec<String> {
    inputs
        .iter()
        .flat_map(|q| [q.name.clone(), q.scale_name.clone(), q.zero_point_name.clone()])
        .collect()
}

/// The fused QOperator replacement of `node`; attributes are carried over.
pub(crate) fn fused_node(node: &Node, op_type: &str, domain: &str, inputs: Vec<String>, output: String) -> Node {
    Node {
        attributes: node.attributes.clone(),
        doc_string: node.doc_string.clone(),
        ..Node::new(op_type, fused_node_name(&node.name), inputs, vec![output]).with_domain(domain)
    }
}
