use tracing::trace;

use crate::{
    LptError,
    graph::{Graph, Op, OpKind},
    pattern::{Match, Pattern},
    quantization::FakeQuantizeDequantization,
};

use super::{Transformation, TransformationContext, move_dequantization_after};

/// Moves the dequantization after a DepthToSpace. Channels are reshuffled into space, so a per
/// channel scale or zero point only survives when the block size leaves the channels alone.
#[derive(Debug, Clone, Default)]
pub struct DepthToSpaceRule;

fn dequantization(graph: &Graph, m: &Match) -> Option<FakeQuantizeDequantization> {
    let Op::DepthToSpace { block_size } = graph.node(m.node)?.op() else {
        return None;
    };
    let deq = FakeQuantizeDequantization::from_input(graph, m.node, 0)?;
    if graph.consumers(deq.output()).len() != 1 {
        trace!("depth to space {}: dequantization is shared", m.node);
        return None;
    }
    if graph.port(deq.data).ok()?.rank()? < 3 {
        return None;
    }
    if *block_size > 1 && !deq.params().is_uniform() {
        trace!("depth to space {}: per channel dequantization", m.node);
        return None;
    }
    Some(deq)
}

impl Transformation for DepthToSpaceRule {
    fn name(&self) -> &'static str {
        "DepthToSpace"
    }

    fn pattern(&self) -> Pattern {
        Pattern::any_of(&[OpKind::DepthToSpace])
    }

    fn can_apply(&self, _ctx: &TransformationContext, graph: &Graph, m: &Match) -> bool {
        dequantization(graph, m).is_some()
    }

    fn apply(
        &self,
        ctx: &mut TransformationContext,
        graph: &mut Graph,
        m: &Match,
    ) -> Result<bool, LptError> {
        let Some(deq) = dequantization(graph, m) else {
            return Ok(false);
        };
        let params = match graph.node(m.node).map(|n| n.op()) {
            Some(Op::DepthToSpace { block_size }) if *block_size > 1 => deq.params().to_scalar(),
            _ => deq.params(),
        };
        move_dequantization_after(graph, m.node, &deq, &params, ctx.params.update_precisions)?;
        Ok(true)
    }
}
