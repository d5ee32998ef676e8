use tracing::debug;

use crate::config::QuantFormat;
use crate::errors::Result;
use crate::graph::{Node, DEFAULT_DOMAIN};
use crate::quantizer::context::{InputRole, OutputSource, QuantizationContext};
use crate::quantizer::operators::{fused_node, qlinear_triples, rewire_qdq};
use crate::quantizer::registry::{OperatorStrategy, StrategyOutcome};

/// `MatMul` → `QLinearMatMul`, or Q/DQ around the original.
///
/// A constant B is quantized with the weight type. Per-channel parameters are
/// only used along B's last axis, one scale per output column.
pub struct MatMulStrategy;

impl MatMulStrategy {
    pub(crate) fn weight_role(node: &Node, ctx: &QuantizationContext<'_>) -> InputRole {
        let config = ctx.config();
        let Some(b) = node.input(1).and_then(|b| ctx.index().float_initializer(b)) else {
            return InputRole::Activation;
        };
        if !config.per_channel {
            return InputRole::Weight { axis: None };
        }

        let rank = b.dims.len() as i64;
        let axis = config.per_channel_axis(&node.op_type, 1);
        let normalized = if axis < 0 { axis + rank } else { axis };
        if normalized == rank - 1 {
            InputRole::Weight { axis: Some(normalized) }
        } else {
            debug!(node = %node.name, axis, rank, "MatMul per-channel axis is not the last axis of B, using per-tensor");
            InputRole::Weight { axis: None }
        }
    }
}

impl OperatorStrategy for MatMulStrategy {
    fn op_types(&self) -> &'static [&'static str] {
        &["MatMul"]
    }

    fn quantize(&self, node: &Node, ctx: &mut QuantizationContext<'_>) -> Result<StrategyOutcome> {
        if ctx.config().extra_options.matmul_const_b_only()
            && !node.input(1).is_some_and(|b| ctx.index().is_initializer(b))
        {
            return Ok(StrategyOutcome::Unchanged);
        }

        let weight_role = Self::weight_role(node, ctx);
        let Some(plans) = ctx.plan_inputs(node, &[(0, InputRole::Activation), (1, weight_role)])? else {
            return Ok(StrategyOutcome::Unchanged);
        };
        let Some(output) = ctx.plan_output(node, 0, OutputSource::Own) else {
            return Ok(StrategyOutcome::Unchanged);
        };

        match ctx.format() {
            QuantFormat::QOperator => {
                let inputs = ctx.commit_inputs(plans)?;
                let output = ctx.register_output(output);
                let mut fused_inputs = qlinear_triples(&inputs);
                fused_inputs.push(output.scale_name);
                fused_inputs.push(output.zero_point_name);
                ctx.push_node(fused_node(node, "QLinearMatMul", DEFAULT_DOMAIN, fused_inputs, output.name));
            }
            QuantFormat::QDQ => {
                let inputs = plans.into_iter().enumerate().collect();
                rewire_qdq(ctx, node, inputs, vec![output])?;
            }
        }
        Ok(StrategyOutcome::Rewritten)
    }
}
