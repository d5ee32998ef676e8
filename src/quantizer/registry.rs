//! Op type → strategy lookup, one immutable table per output format plus one
//! for dynamic (integer-op) quantization.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::config::QuantFormat;
use crate::errors::Result;
use crate::graph::Node;
use crate::quantizer::context::QuantizationContext;
use crate::quantizer::operators::{
    activation::ActivationStrategy, binary::BinaryStrategy, concat::ConcatStrategy, conv::ConvStrategy,
    direct::DirectStrategy, direct::GatherStrategy, fallback::CopyNode, integer::IntegerConvStrategy,
    integer::IntegerMatMulStrategy, matmul::MatMulStrategy,
};

/// What a strategy did with a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyOutcome {
    /// The strategy emitted the node's replacement.
    Rewritten,
    /// Nothing was emitted; the caller copies the node.
    Unchanged,
}

/// Rewrites one family of operators.
///
/// `quantize` must either emit a complete replacement or leave the context
/// untouched and return [`StrategyOutcome::Unchanged`]. An `Err` aborts the
/// run.
pub trait OperatorStrategy: Send + Sync {
    fn op_types(&self) -> &'static [&'static str];

    fn applicable(&self, op_type: &str) -> bool {
        self.op_types().contains(&op_type)
    }

    fn quantize(&self, node: &Node, ctx: &mut QuantizationContext<'_>) -> Result<StrategyOutcome>;
}

pub struct OperatorRegistry {
    strategies: HashMap<&'static str, &'static dyn OperatorStrategy>,
    fallback: &'static dyn OperatorStrategy,
}

static CONCAT: ConcatStrategy = ConcatStrategy;
static CONV: ConvStrategy = ConvStrategy;
static MATMUL: MatMulStrategy = MatMulStrategy;
static BINARY: BinaryStrategy = BinaryStrategy;
static ACTIVATION: ActivationStrategy = ActivationStrategy;
static DIRECT: DirectStrategy = DirectStrategy;
static GATHER: GatherStrategy = GatherStrategy;
static COPY: CopyNode = CopyNode;
static INTEGER_CONV: IntegerConvStrategy = IntegerConvStrategy;
static INTEGER_MATMUL: IntegerMatMulStrategy = IntegerMatMulStrategy;

static QOPERATOR: OnceLock<OperatorRegistry> = OnceLock::new();
static QDQ: OnceLock<OperatorRegistry> = OnceLock::new();
static INTEGER_OPS: OnceLock<OperatorRegistry> = OnceLock::new();

impl OperatorRegistry {
    fn build(strategies: &[&'static dyn OperatorStrategy]) -> Self {
        let mut table = HashMap::new();
        for &strategy in strategies {
            for &op in strategy.op_types() {
                table.insert(op, strategy);
            }
        }
        Self {
            strategies: table,
            fallback: &COPY,
        }
    }

    pub fn for_format(format: QuantFormat) -> &'static OperatorRegistry {
        let all: [&'static dyn OperatorStrategy; 7] =
            [&CONCAT, &CONV, &MATMUL, &BINARY, &ACTIVATION, &DIRECT, &GATHER];
        match format {
            QuantFormat::QOperator => QOPERATOR.get_or_init(|| Self::build(&all)),
            QuantFormat::QDQ => QDQ.get_or_init(|| Self::build(&all)),
        }
    }

    /// Strategies for dynamic quantization: integer kernels for Conv and
    /// MatMul, plus the ops that carry a quantized tensor through unchanged.
    pub fn integer_ops() -> &'static OperatorRegistry {
        INTEGER_OPS.get_or_init(|| Self::build(&[&INTEGER_CONV, &INTEGER_MATMUL, &GATHER, &DIRECT]))
    }

    pub fn get(&self, op_type: &str) -> Option<&'static dyn OperatorStrategy> {
        self.strategies
            .get(op_type)
            .copied()
            .filter(|s| s.applicable(op_type))
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.get(op_type).is_some()
    }

    pub fn fallback(&self) -> &'static dyn OperatorStrategy {
        self.fallback
    }

    pub fn op_types(&self) -> Vec<String> {
        let mut ops: Vec<String> = self.strategies.keys().map(|s| s.to_string()).collect();
        ops.sort();
        ops
    }
}

/// Every op type with a strategy for `format`, sorted.
pub fn registered_op_types(format: QuantFormat) -> Vec<String> {
    OperatorRegistry::for_format(format).op_types()
}

/// Every op type dynamic quantization rewrites, sorted.
pub fn registered_integer_op_types() -> Vec<String> {
    OperatorRegistry::integer_ops().op_types()
}
