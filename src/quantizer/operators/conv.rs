use crate::config::QuantFormat;
use crate::errors::Result;
use crate::graph::{Node, DEFAULT_DOMAIN};
use crate::quantizer::context::{InputRole, OutputSource, QuantizationContext};
use crate::quantizer::operators::{fused_node, qlinear_triples, rewire_qdq};
use crate::quantizer::registry::{OperatorStrategy, StrategyOutcome};

/// `Conv` → `QLinearConv` with an int32 bias, or Q/DQ around the original.
///
/// The weight is quantized with the weight type, per output channel when
/// `per_channel` is set. A bias must be a float initializer; its scale is
/// `x_scale × w_scale`.
pub struct ConvStrategy;

impl OperatorStrategy for ConvStrategy {
    fn op_types(&self) -> &'static [&'static str] {
        &["Conv"]
    }

    fn quantize(&self, node: &Node, ctx: &mut QuantizationContext<'_>) -> Result<StrategyOutcome> {
        let config = ctx.config();
        let weight_role = match node.input(1) {
            Some(w) if ctx.index().float_initializer(w).is_some() => InputRole::Weight {
                axis: config.per_channel.then(|| config.per_channel_axis(&node.op_type, 0)),
            },
            _ => InputRole::Activation,
        };

        let Some(mut plans) = ctx.plan_inputs(node, &[(0, InputRole::Activation), (1, weight_role)])? else {
            return Ok(StrategyOutcome::Unchanged);
        };
        let bias = match node.input(2) {
            Some(_) => match ctx.plan_bias(node, 2, &plans[0], &plans[1])? {
                Some(bias) => Some(bias),
                None => return Ok(StrategyOutcome::Unchanged),
            },
            None => None,
        };
        let Some(output) = ctx.plan_output(node, 0, OutputSource::Own) else {
            return Ok(StrategyOutcome::Unchanged);
        };

        match ctx.format() {
            QuantFormat::QOperator => {
                let inputs = ctx.commit_inputs(plans)?;
                let bias = bias.map(|b| ctx.commit_bias(b)).transpose()?;
                let output = ctx.register_output(output);

                let mut fused_inputs = qlinear_triples(&inputs);
                fused_inputs.push(output.scale_name);
                fused_inputs.push(output.zero_point_name);
                if let Some(bias) = bias {
                    fused_inputs.push(bias.name);
                }
                ctx.push_node(fused_node(node, "QLinearConv", DEFAULT_DOMAIN, fused_inputs, output.name));
            }
            QuantFormat::QDQ => {
                let weight = plans.pop();
                let input = plans.pop();
                let mut inputs: Vec<_> = input.into_iter().map(|p| (0, p)).collect();
                inputs.extend(weight.map(|p| (1, p)));
                if let Some(bias) = bias {
                    let bias = ctx.commit_bias(bias)?;
                    let mut rewired = node.clone();
                    rewired.inputs[2] = bias.name;
                    rewire_qdq(ctx, &rewired, inputs, vec![output])?;
                } else {
                    rewire_qdq(ctx, node, inputs, vec![output])?;
                }
            }
        }
        Ok(StrategyOutcome::Rewritten)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AttributeValue, DataType, Initializer, TensorData};
    use crate::quantizer::operators::test_support::{config, find, graph, ranges, run};

    fn conv_graph(with_bias: bool) -> crate::graph::Graph {
        let mut inputs = vec!["x".to_string(), "w".to_string()];
        let mut inits = vec![Initializer::new(
            "w",
            vec![2, 1, 1, 1],
            TensorData::Float(vec![0.5, -2.0]),
        )];
        if with_bias {
            inputs.push("b".into());
            inits.push(Initializer::new("b", vec![2], TensorData::Float(vec![0.25, -0.5])));
        }
        let node = Node::new("Conv", "conv", inputs, vec!["y".into()])
            .with_attribute("kernel_shape", AttributeValue::Ints(vec![1, 1]));
        graph(vec![node], inits, &["x"], &["y"])
    }

    #[test]
    fn test_qoperator_conv_with_bias() {
        let g = conv_graph(true);
        let (outcomes, summary) = run(&ConvStrategy, &g, &ranges(&["x", "y"]), &config(QuantFormat::QOperator));
        assert_eq!(outcomes, vec![StrategyOutcome::Rewritten]);

        let conv = find(&summary, "QLinearConv")[0];
        assert_eq!(conv.name, "conv_quant");
        assert_eq!(conv.domain, DEFAULT_DOMAIN);
        assert_eq!(
            conv.inputs,
            vec![
                "x_quantized",
                "x_scale",
                "x_zero_point",
                "w_quantized",
                "w_scale",
                "w_zero_point",
                "y_scale",
                "y_zero_point",
                "b_quantized"
            ]
        );
        let w = summary.initializers.iter().find(|i| i.name == "w_quantized").unwrap();
        assert_eq!(w.data_type(), DataType::Int8);
        let b = summary.initializers.iter().find(|i| i.name == "b_quantized").unwrap();
        assert_eq!(b.data_type(), DataType::Int32);
    }

    #[test]
    fn test_qdq_conv_per_channel() {
        let g = conv_graph(true);
        let mut cfg = config(QuantFormat::QDQ);
        cfg.per_channel = true;
        let (_, summary) = run(&ConvStrategy, &g, &ranges(&["x", "y"]), &cfg);

        let conv = find(&summary, "Conv")[0];
        assert_eq!(
            conv.inputs,
            vec![
                "x_DequantizeLinear_Output",
                "w_DequantizeLinear_Output",
                "b_DequantizeLinear_Output"
            ]
        );
        assert!(summary.per_channel_emitted);
        let w_dq = summary
            .nodes
            .iter()
            .find(|n| n.name == "w_DequantizeLinear")
            .unwrap();
        assert_eq!(w_dq.attribute("axis"), Some(&AttributeValue::Int(0)));
        let scale = summary.initializers.iter().find(|i| i.name == "w_scale").unwrap();
        assert_eq!(scale.dims, vec![2]);
    }

    #[test]
    fn test_non_constant_bias_is_unchanged() {
        let node = Node::new("Conv", "conv", vec!["x".into(), "w".into(), "b".into()], vec!["y".into()]);
        let w = Initializer::new("w", vec![1, 1, 1, 1], TensorData::Float(vec![1.0]));
        let g = graph(vec![node], vec![w], &["x", "b"], &["y"]);
        let (outcomes, summary) = run(&ConvStrategy, &g, &ranges(&["x", "b", "y"]), &config(QuantFormat::QOperator));
        assert_eq!(outcomes, vec![StrategyOutcome::Unchanged]);
        assert_eq!(summary.nodes, g.nodes);
    }

    #[test]
    fn test_axis_override() {
        let g = conv_graph(false);
        let mut cfg = config(QuantFormat::QDQ);
        cfg.per_channel = true;
        cfg.extra_options
            .qdq_op_type_per_channel_support_to_axis
            .insert("Conv".into(), 1);
        let (_, summary) = run(&ConvStrategy, &g, &ranges(&["x", "y"]), &cfg);
        let scale = summary.initializers.iter().find(|i| i.name == "w_scale").unwrap();
        // axis 1 has a single channel
        assert_eq!(scale.dims, vec![1]);
    }
}
