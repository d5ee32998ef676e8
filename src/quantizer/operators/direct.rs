//! Data-movement ops that run directly on quantized values.
//!
//! The output is a re-arrangement of input 0, so it reuses input 0's scale and
//! zero point. QOperator keeps the node itself and feeds it the quantized
//! tensor.

use crate::config::QuantFormat;
use crate::errors::Result;
use crate::graph::Node;
use crate::quantizer::context::{InputRole, OutputSource, QuantizationContext};
use crate::quantizer::operators::{input_ready, rewire_qdq};
use crate::quantizer::registry::{OperatorStrategy, StrategyOutcome};

/// Quantize input 0 and the first output with shared parameters. Per-channel
/// inputs have no single pair to share and are left alone.
fn pass_through(node: &Node, ctx: &mut QuantizationContext<'_>) -> Result<StrategyOutcome> {
    let Some(input) = ctx.plan_input(node, 0, InputRole::Activation)? else {
        return Ok(StrategyOutcome::Unchanged);
    };
    let Some(output) = ctx.plan_output(node, 0, OutputSource::SharedWith(&input)) else {
        return Ok(StrategyOutcome::Unchanged);
    };

    match ctx.format() {
        QuantFormat::QOperator => {
            let quantized = ctx.commit_input(input)?;
            let output = ctx.register_output(output);
            let mut rewritten = node.clone();
            rewritten.inputs[0] = quantized.name;
            rewritten.outputs[0] = output.name;
            ctx.push_node(rewritten);
        }
        QuantFormat::QDQ => rewire_qdq(ctx, node, vec![(0, input)], vec![output])?,
    }
    Ok(StrategyOutcome::Rewritten)
}

/// `MaxPool`, `Transpose`, `Reshape`, `Squeeze`, `Unsqueeze`: only when input 0
/// is already quantized, unless `ForceQuantizeNoInputCheck` is set.
pub struct DirectStrategy;

impl OperatorStrategy for DirectStrategy {
    fn op_types(&self) -> &'static [&'static str] {
        &["MaxPool", "Transpose", "Reshape", "Squeeze", "Unsqueeze"]
    }

    fn quantize(&self, node: &Node, ctx: &mut QuantizationContext<'_>) -> Result<StrategyOutcome> {
        // MaxPool's optional Indices output has no quantized form
        if node.op_type == "MaxPool" && node.outputs.iter().filter(|o| !o.is_empty()).count() != 1 {
            return Ok(StrategyOutcome::Unchanged);
        }
        if !input_ready(ctx, node, 0) {
            return Ok(StrategyOutcome::Unchanged);
        }
        pass_through(node, ctx)
    }
}

/// `Gather` over a constant table (input 0), indices left as they are.
pub struct GatherStrategy;

impl OperatorStrategy for GatherStrategy {
    fn op_types(&self) -> &'static [&'static str] {
        &["Gather"]
    }

    fn quantize(&self, node: &Node, ctx: &mut QuantizationContext<'_>) -> Result<StrategyOutcome> {
        let table_is_constant = node
            .input(0)
            .is_some_and(|data| ctx.index().float_initializer(data).is_some());
        if !table_is_constant && !ctx.config().extra_options.force_quantize_no_input_check {
            return Ok(StrategyOutcome::Unchanged);
        }
        pass_through(node, ctx)
    }
}
