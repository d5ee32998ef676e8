use crate::config::QuantFormat;
use crate::errors::Result;
use crate::graph::{Node, MS_DOMAIN};
use crate::quantizer::context::{InputRole, OutputSource, QuantizationContext};
use crate::quantizer::operators::{fused_node, qlinear_triples, rewire_qdq};
use crate::quantizer::registry::{OperatorStrategy, StrategyOutcome};

/// `Concat` → `com.microsoft.QLinearConcat`, inputs
/// `[y_scale, y_zero_point, (x_i, x_i_scale, x_i_zero_point)...]`.
pub struct ConcatStrategy;

impl OperatorStrategy for ConcatStrategy {
    fn op_types(&self) -> &'static [&'static str] {
        &["Concat"]
    }

    fn quantize(&self, node: &Node, ctx: &mut QuantizationContext<'_>) -> Result<StrategyOutcome> {
        let roles: Vec<(usize, InputRole)> = (0..node.inputs.len()).map(|i| (i, InputRole::Activation)).collect();
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
                let mut fused_inputs = vec![output.scale_name, output.zero_point_name];
                fused_inputs.extend(qlinear_triples(&inputs));
                ctx.push_node(fused_node(node, "QLinearConcat", MS_DOMAIN, fused_inputs, output.name));
            }
            QuantFormat::QDQ => {
                let inputs = plans.into_iter().enumerate().collect();
                rewire_qdq(ctx, node, inputs, vec![output])?;
            }
        }
        Ok(StrategyOutcome::Rewritten)
    }
}
