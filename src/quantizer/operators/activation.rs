use crate::config::QuantFormat;
use crate::errors::Result;
use crate::graph::Node;
use crate::quantizer::context::{InputRole, OutputSource, QuantizationContext};
use crate::quantizer::operators::rewire_qdq;
use crate::quantizer::registry::{OperatorStrategy, StrategyOutcome};

/// `Relu` / `Clip` after a quantized producer.
///
/// With asymmetric activations the clamp is already encoded in the producer's
/// output parameters (the orchestrator narrows them beforehand), so QOperator
/// drops the node and lets its output alias the input. QDQ keeps the node
/// between two Q/DQ pairs.
pub struct ActivationStrategy;

impl ActivationStrategy {
    /// The node can disappear without changing what downstream reads.
    fn removable(node: &Node, ctx: &QuantizationContext<'_>) -> bool {
        let Some(input) = node.input(0) else {
            return false;
        };
        ctx.is_quantized(input)
            && !ctx.activation_symmetric()
            && ctx.index().consumers(input).len() == 1
            && !ctx.index().is_graph_output(input)
            && node.outputs.len() == 1
            && !ctx.is_quantized(&node.outputs[0])
    }
}

impl OperatorStrategy for ActivationStrategy {
    fn op_types(&self) -> &'static [&'static str] {
        &["Relu", "Clip"]
    }

    fn quantize(&self, node: &Node, ctx: &mut QuantizationContext<'_>) -> Result<StrategyOutcome> {
        match ctx.format() {
            QuantFormat::QOperator => {
                if !Self::removable(node, ctx) {
                    return Ok(StrategyOutcome::Unchanged);
                }
                let Some(input) = node.input(0) else {
                    return Ok(StrategyOutcome::Unchanged);
                };
                if ctx.alias_output(&node.outputs[0], input) {
                    Ok(StrategyOutcome::Rewritten)
                } else {
                    Ok(StrategyOutcome::Unchanged)
                }
            }
            QuantFormat::QDQ => {
                if !node.input(0).is_some_and(|i| ctx.is_quantized(i)) {
                    return Ok(StrategyOutcome::Unchanged);
                }
                let Some(input) = ctx.plan_input(node, 0, InputRole::Activation)? else {
                    return Ok(StrategyOutcome::Unchanged);
                };
                let Some(output) = ctx.plan_output(node, 0, OutputSource::Own) else {
                    return Ok(StrategyOutcome::Unchanged);
                };
                rewire_qdq(ctx, node, vec![(0, input)], vec![output])?;
                Ok(StrategyOutcome::Rewritten)
            }
        }
    }
}
