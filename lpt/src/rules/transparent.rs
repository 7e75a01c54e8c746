use tracing::trace;

use crate::{
    LptError,
    graph::{Graph, InterpolateMode, Op, OpKind},
    pattern::{Match, Pattern},
    quantization::{DequantizationParams, FakeQuantizeDequantization},
};

use super::{Transformation, TransformationContext, move_dequantization_after};

/// Moves the dequantization after an operation that does not change the values it reads, only
/// their layout or selection.
#[derive(Debug, Clone, Default)]
pub struct TransparentRule;

/// Operations that keep the channel axis in place and may carry a per channel dequantization.
fn keeps_channels(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::MaxPool | OpKind::AvgPool | OpKind::Relu | OpKind::Interpolate
    )
}

fn plan(graph: &Graph, m: &Match) -> Option<(FakeQuantizeDequantization, DequantizationParams)> {
    let node = graph.node(m.node)?;
    if let Op::Interpolate { mode } = node.op() {
        if *mode != InterpolateMode::Nearest {
            trace!("interpolate {}: only nearest keeps the grid", m.node);
            return None;
        }
    }
    let deq = FakeQuantizeDequantization::from_input(graph, m.node, 0)?;
    let params = deq.params();
    if m.kind == OpKind::Relu {
        let positive = params.scale.get_data().iter().all(|s| *s > 0.0);
        if !positive || deq.has_zero_point() {
            trace!("relu {}: needs positive scales and no zero point", m.node);
            return None;
        }
    }
    if keeps_channels(m.kind) {
        return Some((deq, params));
    }
    if !params.is_uniform() {
        trace!("{} {}: per channel dequantization", m.kind, m.node);
        return None;
    }
    let params = params.to_scalar();
    Some((deq, params))
}

impl Transformation for TransparentRule {
    fn name(&self) -> &'static str {
        "Transparent"
    }

    fn pattern(&self) -> Pattern {
        Pattern::any_of(&[
            OpKind::MaxPool,
            OpKind::AvgPool,
            OpKind::Reshape,
            OpKind::Transpose,
            OpKind::Squeeze,
            OpKind::Unsqueeze,
            OpKind::StridedSlice,
            OpKind::Split,
            OpKind::VariadicSplit,
            OpKind::Interpolate,
            OpKind::Relu,
        ])
    }

    fn can_apply(&self, _ctx: &TransformationContext, graph: &Graph, m: &Match) -> bool {
        plan(graph, m).is_some()
    }

    fn apply(
        &self,
        ctx: &mut TransformationContext,
        graph: &mut Graph,
        m: &Match,
    ) -> Result<bool, LptError> {
        let Some((deq, params)) = plan(graph, m) else {
            return Ok(false);
        };
        let update_precision = match m.kind {
            // averaging leaves the integer grid unless the pool was marked preserving
            OpKind::AvgPool => {
                ctx.params.update_precisions
                    && graph.attributes().precision_preserved(m.node) == Some(true)
            }
            _ => ctx.params.update_precisions,
        };
        move_dequantization_after(graph, m.node, &deq, &params, update_precision)?;
        Ok(true)
    }
}
