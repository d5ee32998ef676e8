//! Integer kernels for dynamic quantization.
//!
//! Activations are quantized at run time by `DynamicQuantizeLinear`, weights
//! ahead of time. The int32 result is brought back to float:
//!
//! ```text
//! y = Cast<float>(XInteger(x_q, w_q, x_zp, w_zp)) * (x_scale * w_scale) [+ bias]
//! ```

use tracing::debug;

use crate::errors::Result;
use crate::graph::{Attribute, AttributeValue, DataType, Initializer, Node};
use crate::onnx_utils::quantization_nodes::fused_node_name;
use crate::quantizer::context::{InputPlan, InputRole, QuantizationContext};
use crate::quantizer::operators::matmul::MatMulStrategy;
use crate::quantizer::registry::{OperatorStrategy, StrategyOutcome};

/// Emit the integer node and its rescale chain. The last node writes
/// `output`.
fn emit_integer(
    ctx: &mut QuantizationContext<'_>,
    node: &Node,
    op_type: &str,
    plans: Vec<InputPlan>,
    bias: Option<String>,
    attributes: Vec<Attribute>,
) -> Result<()> {
    let Some(output) = node.outputs.first().cloned() else {
        return Ok(());
    };
    let inputs = ctx.commit_inputs(plans)?;
    let [x, w] = inputs.as_slice() else {
        return Ok(());
    };

    let base = if node.name.is_empty() { output.clone() } else { node.name.clone() };
    let integer_output = format!("{output}_output_quantized");
    let cast_output = format!("{output}_cast_output");
    let scales_output = format!("{base}_scales_mul_output");
    let scaled_output = if bias.is_some() {
        format!("{output}_scaled")
    } else {
        output.clone()
    };

    let integer = Node {
        attributes,
        ..Node::new(
            op_type,
            fused_node_name(&base),
            vec![x.name.clone(), w.name.clone(), x.zero_point_name.clone(), w.zero_point_name.clone()],
            vec![integer_output.clone()],
        )
    };
    ctx.push_node(integer);
    ctx.push_node(
        Node::new("Cast", format!("{base}_cast"), vec![integer_output], vec![cast_output.clone()])
            .with_attribute("to", AttributeValue::Int(DataType::Float.code() as i64)),
    );
    ctx.push_node(Node::new(
        "Mul",
        format!("{base}_scales_mul"),
        vec![x.scale_name.clone(), w.scale_name.clone()],
        vec![scales_output.clone()],
    ));
    ctx.push_node(Node::new(
        "Mul",
        format!("{base}_output_scale_mul"),
        vec![cast_output, scales_output],
        vec![scaled_output.clone()],
    ));
    if let Some(bias) = bias {
        ctx.push_node(Node::new(
            "Add",
            format!("{base}_bias_add"),
            vec![scaled_output, bias],
            vec![output],
        ));
    }
    Ok(())
}

/// `MatMul` → `MatMulInteger`. B is quantized ahead of time when constant;
/// otherwise it is quantized at run time, unless `MatMulConstBOnly`.
pub struct IntegerMatMulStrategy;

impl OperatorStrategy for IntegerMatMulStrategy {
    fn op_types(&self) -> &'static [&'static str] {
        &["MatMul"]
    }

    fn quantize(&self, node: &Node, ctx: &mut QuantizationContext<'_>) -> Result<StrategyOutcome> {
        let const_b = node.input(1).is_some_and(|b| ctx.index().is_initializer(b));
        if !const_b && ctx.config().extra_options.matmul_const_b_only() {
            return Ok(StrategyOutcome::Unchanged);
        }

        let Some(a) = ctx.plan_dynamic_input(node, 0) else {
            return Ok(StrategyOutcome::Unchanged);
        };
        let b = if const_b {
            let role = MatMulStrategy::weight_role(node, ctx);
            ctx.plan_input(node, 1, role)?
        } else {
            ctx.plan_dynamic_input(node, 1)
        };
        let Some(b) = b else {
            return Ok(StrategyOutcome::Unchanged);
        };

        emit_integer(ctx, node, "MatMulInteger", vec![a, b], None, Vec::new())?;
        Ok(StrategyOutcome::Rewritten)
    }
}

/// `Conv` → `ConvInteger` with a per-tensor weight. A bias must be a float
/// initializer; it is reshaped to broadcast over the output channels and
/// added in float.
pub struct IntegerConvStrategy;

impl IntegerConvStrategy {
    /// `[1, M, 1, ...]` copy of a `[M]` bias for an output of rank `rank`.
    fn broadcast_bias(ctx: &QuantizationContext<'_>, node: &Node, rank: usize) -> Option<Initializer> {
        let bias = ctx.index().float_initializer(node.input(2)?)?;
        let [channels] = bias.dims.as_slice() else {
            debug!(node = %node.name, dims = ?bias.dims, "Conv bias is not 1-D");
            return None;
        };
        let mut dims = vec![1_i64; rank.max(2)];
        dims[1] = *channels;
        Some(Initializer::new(format!("{}_reshaped", bias.name), dims, bias.data.clone()))
    }
}

impl OperatorStrategy for IntegerConvStrategy {
    fn op_types(&self) -> &'static [&'static str] {
        &["Conv"]
    }

    fn quantize(&self, node: &Node, ctx: &mut QuantizationContext<'_>) -> Result<StrategyOutcome> {
        let Some(rank) = node
            .input(1)
            .and_then(|w| ctx.index().float_initializer(w))
            .map(|w| w.dims.len())
        else {
            return Ok(StrategyOutcome::Unchanged);
        };
        let Some(x) = ctx.plan_dynamic_input(node, 0) else {
            return Ok(StrategyOutcome::Unchanged);
        };
        let Some(w) = ctx.plan_input(node, 1, InputRole::Weight { axis: None })? else {
            return Ok(StrategyOutcome::Unchanged);
        };
        let bias = match node.input(2) {
            Some(_) => match Self::broadcast_bias(ctx, node, rank) {
                Some(bias) => Some(bias),
                None => return Ok(StrategyOutcome::Unchanged),
            },
            None => None,
        };

        let bias_name = bias.as_ref().map(|b| b.name.clone());
        if let Some(bias) = bias {
            ctx.add_initializer(bias);
        }
        emit_integer(ctx, node, "ConvInteger", vec![x, w], bias_name, node.attributes.clone())?;
        Ok(StrategyOutcome::Rewritten)
    }
}
