use crate::errors::Result;
use crate::graph::Node;
use crate::quantizer::context::QuantizationContext;
use crate::quantizer::registry::{OperatorStrategy, StrategyOutcome};

/// Copies a node as-is. QOperator inputs whose float producer was fused away
/// are dequantized back under their original name first.
pub struct CopyNode;

impl OperatorStrategy for CopyNode {
    fn op_types(&self) -> &'static [&'static str] {
        &[]
    }

    fn applicable(&self, _op_type: &str) -> bool {
        true
    }

    fn quantize(&self, node: &Node, ctx: &mut QuantizationContext<'_>) -> Result<StrategyOutcome> {
        ctx.emit_unchanged(node);
        Ok(StrategyOutcome::Rewritten)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuantFormat;
    use crate::quantizer::operators::test_support::{config, graph, ranges, run};

    #[test]
    fn test_copy_is_verbatim() {
        let node = Node::new("Softmax", "sm", vec!["x".into()], vec!["y".into()]);
        let g = graph(vec![node.clone()], vec![], &["x"], &["y"]);
        let (_, summary) = run(&CopyNode, &g, &ranges(&["x", "y"]), &config(QuantFormat::QOperator));
        assert_eq!(summary.nodes, vec![node]);
        assert!(summary.initializers.is_empty());
    }
}
