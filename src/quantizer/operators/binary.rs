use crate::config::QuantFormat;
use crate::errors::Result;
use crate::graph::{Node, MS_DOMAIN};
use crate::quantizer::context::{InputRole, OutputSource, QuantizationContext};
use crate::quantizer::operators::{fused_node, qlinear_triples, rewire_qdq};
use crate::quantizer::registry::{OperatorStrategy, StrategyOutcome};

/// Elementwise `Add` / `Mul` → `com.microsoft.QLinearAdd` / `QLinearMul`.
/// Both operands use activation parameters.
pub struct BinaryStrategy;

impl OperatorStrategy for BinaryStrategy {
    fn op_types(&self) -> &'static [&'static str] {
        &["Add", "Mul"]
    }

    fn quantize(&self, node: &Node, ctx: &mut QuantizationContext<'_>) -> Result<StrategyOutcome> {
        let roles = [(0, InputRole::Activation), (1, InputRole::Activation)];
        let Some(plans) = ctx.plan_inputs(node, &roles)? else {
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
                let op_type = format!("QLinear{}", node.op_type);
                ctx.push_node(fused_node(node, &op_type, MS_DOMAIN, fused_inputs, output.name));
            }
            QuantFormat::QDQ => {
                let inputs = plans.into_iter().enumerate().collect();
                rewire_qdq(ctx, node, inputs, vec![output])?;
            }
        }
        Ok(StrategyOutcome::Rewritten)
    }
}
