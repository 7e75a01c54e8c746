//! Whole-graph analysis passes writing the attributes the rewrite rules read.
//!
//! The passes run in a fixed order, each one over the whole graph. Every pass first drops the
//! attributes it owns, so running it again on an unchanged graph gives the same attribute state.

mod avg_pool;
mod intervals;
mod parameters;
mod precisions;
mod propagate;

pub use avg_pool::MarkupAvgPoolPrecisionPreserved;
pub use intervals::AlignQuantizationIntervals;
pub use parameters::AlignQuantizationParameters;
pub use precisions::MarkupPrecisions;
pub use propagate::PropagatePrecisions;

use crate::{
    LptError,
    config::OperationPrecisionRestriction,
    graph::{Graph, InterpolateMode, NodeId, Op},
};

pub trait MarkupPass {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut Graph) -> Result<(), LptError>;
}

/// The markup passes in the order they must run.
pub fn default_markup(restrictions: Vec<OperationPrecisionRestriction>) -> Vec<Box<dyn MarkupPass>> {
    vec![
        Box::new(MarkupPrecisions::new(restrictions)),
        Box::new(MarkupAvgPoolPrecisionPreserved),
        Box::new(PropagatePrecisions),
        Box::new(AlignQuantizationIntervals),
        Box::new(AlignQuantizationParameters),
    ]
}

/// Operations whose output keeps the quantization parameters of their input.
pub fn static_precision_preserved(op: &Op) -> bool {
    match op {
        Op::Concat { .. }
        | Op::MaxPool
        | Op::Reshape
        | Op::Transpose
        | Op::Squeeze
        | Op::Unsqueeze
        | Op::Split { .. }
        | Op::VariadicSplit { .. }
        | Op::StridedSlice
        | Op::DepthToSpace { .. }
        | Op::Relu => true,
        Op::Interpolate { mode } => *mode == InterpolateMode::Nearest,
        _ => false,
    }
}

/// The `PrecisionPreserved` attribute when the markup set one, the static table otherwise.
pub fn is_precision_preserved(graph: &Graph, node: NodeId) -> bool {
    if let Some(flag) = graph.attributes().precision_preserved(node) {
        return flag;
    }
    graph
        .node(node)
        .map(|n| static_precision_preserved(n.op()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::default_restrictions, graph::OpKind, testing::*};

    /// Two branches quantized differently, joined by a concat followed by an average pooling
    /// and a convolution.
    fn concat_graph() -> Graph {
        let mut graph = Graph::new();
        let a = parameter(&mut graph, "a", vec![1, 3, 4, 4]);
        let b = parameter(&mut graph, "b", vec![1, 3, 4, 4]);
        let fq_a = fake_quantize(&mut graph, "fq_a", a, 256, (0.0, 2.55), (0.0, 2.55));
        let fq_b = fake_quantize(&mut graph, "fq_b", b, 256, (-1.28, 1.27), (-1.28, 1.27));
        let concat = concat(&mut graph, "concat", &[fq_a, fq_b], 1);
        let pool = unary(&mut graph, "pool", Op::AvgPool, concat);
        let weights = constant(&mut graph, "weights", vec![6, 6, 1, 1], vec![0.5; 36]);
        let fq_w = fake_quantize(&mut graph, "fq_w", weights, 256, (-1.28, 1.27), (-1.28, 1.27));
        let conv = binary(&mut graph, "conv", Op::Convolution, pool, fq_w);
        result(&mut graph, "out", conv);
        graph
    }

    #[test]
    fn test_markup_passes_are_idempotent() {
        init_logging();
        let mut graph = concat_graph();
        for pass in default_markup(default_restrictions()) {
            pass.run(&mut graph).unwrap();
            let first = graph.attributes().snapshot();
            let conflicts = graph.attributes().conflicts().to_vec();
            pass.run(&mut graph).unwrap();
            assert_eq!(graph.attributes().snapshot(), first, "pass {}", pass.name());
            assert_eq!(graph.attributes().conflicts(), conflicts.as_slice());
        }
    }

    #[test]
    fn test_static_table_and_attribute_override() {
        let mut graph = concat_graph();
        let pool = graph.node_by_name("pool").unwrap();
        let concat = graph.node_by_name("concat").unwrap();
        assert!(is_precision_preserved(&graph, concat));
        assert!(!is_precision_preserved(&graph, pool));
        assert!(static_precision_preserved(&Op::Interpolate {
            mode: InterpolateMode::Nearest
        }));
        assert!(!static_precision_preserved(&Op::Interpolate {
            mode: InterpolateMode::Linear
        }));

        MarkupAvgPoolPrecisionPreserved.run(&mut graph).unwrap();
        assert!(is_precision_preserved(&graph, pool));
        assert_eq!(graph.kind(pool), Some(OpKind::AvgPool));
    }
}
