//! Simplifications run once after the main rules. Each one only removes nodes, so none of them can
//! enable a main rule again.

use tracing::{debug, trace};

use crate::{
    LptError,
    graph::{Edge, Graph, NodeId, Op, OpKind},
    pattern::{Constraint, Match, Pattern},
    quantization::constant_value,
    tensor::Tensor,
};

use super::{Transformation, TransformationContext, fake_quantize::add_low_precision_fake_quantize};

/// Folds a `Convert` of a constant zero point into a constant of the destination type.
#[derive(Debug, Clone, Default)]
pub struct FoldConvert;

impl Transformation for FoldConvert {
    fn name(&self) -> &'static str {
        "FoldConvert"
    }

    fn pattern(&self) -> Pattern {
        Pattern::any_of(&[OpKind::Convert]).with(Constraint::ConstantInput(0))
    }

    fn can_apply(&self, _ctx: &TransformationContext, graph: &Graph, m: &Match) -> bool {
        let output = Edge::new(m.node, 0);
        let consumers = graph.consumers(output);
        !consumers.is_empty()
            && consumers
                .iter()
                .all(|e| e.index() == 1 && graph.kind(e.node()) == Some(OpKind::Subtract))
    }

    fn apply(
        &self,
        _ctx: &mut TransformationContext,
        graph: &mut Graph,
        m: &Match,
    ) -> Result<bool, LptError> {
        let node = graph.try_node(m.node)?;
        let Op::Convert { destination } = node.op() else {
            return Ok(false);
        };
        let destination = *destination;
        let name = node.name().to_string();
        let Some(value) = graph.input(m.node, 0).and_then(|e| graph.constant(e)).cloned() else {
            return Ok(false);
        };
        let folded = graph.add_constant(&format!("{}/Folded", name), value, destination)?;
        graph.replace_node(m.node, folded)?;
        debug!("convert {} folded", name);
        Ok(true)
    }
}

/// The fake-quantize whose output `node` reads on input 0, directly or through a single use
/// `Convert`, with the constant `node` applies on input 1.
fn fusable_fake_quantize(graph: &Graph, node: NodeId) -> Option<(NodeId, Tensor)> {
    let value = graph
        .input(node, 1)
        .and_then(|e| constant_value(graph, e))?;
    let blocked = graph.consumer_nodes(node).iter().any(|c| {
        matches!(
            graph.kind(*c),
            Some(OpKind::Convolution | OpKind::GroupConvolution)
        )
    });
    if blocked {
        trace!("node {} feeds a convolution, not fused", node);
        return None;
    }
    let mut parent = graph.producer(node, 0)?;
    if graph.kind(parent) == Some(OpKind::Convert) {
        if graph.node(parent)?.consumer_count() != 1 {
            return None;
        }
        parent = graph.producer(parent, 0)?;
    }
    let fq = graph.node(parent)?;
    if fq.kind() != OpKind::FakeQuantize || fq.consumer_count() != 1 {
        return None;
    }
    let bounds_are_constant = (3..5).all(|i| fq.input(i).and_then(|e| graph.constant(e)).is_some());
    bounds_are_constant.then_some((parent, value))
}

/// Replaces the `fake-quantize (-> convert) -> node` chain by one fake-quantize whose output
/// bounds went through `f`.
fn fuse_into_fake_quantize(
    graph: &mut Graph,
    node: NodeId,
    f: impl Fn(f32, f32) -> f32 + Copy,
) -> Result<bool, LptError> {
    let Some((fq, value)) = fusable_fake_quantize(graph, node) else {
        return Ok(false);
    };
    let bound = |index: usize| {
        graph
            .input(fq, index)
            .and_then(|e| graph.constant(e))
            .cloned()
            .ok_or(LptError::NotQuantizable(fq))
    };
    let low = bound(3)?.broadcast_zip(&value, f)?;
    let high = bound(4)?.broadcast_zip(&value, f)?;
    let element_type = graph.port(Edge::new(node, 0))?.element_type;
    let name = graph.try_node(fq)?.name().to_string();

    let fused = add_low_precision_fake_quantize(graph, fq, low, high, element_type)?;
    graph.replace_node(node, fused)?;
    graph.rename(fused, &name)?;
    debug!("{} fused into fake quantize {}", graph.try_node(fused)?.op().describe(), name);
    Ok(true)
}

/// Folds `FakeQuantize -> Subtract(v)` into the fake-quantize output bounds.
#[derive(Debug, Clone, Default)]
pub struct FuseSubtractToFakeQuantize;

impl Transformation for FuseSubtractToFakeQuantize {
    fn name(&self) -> &'static str {
        "FuseSubtractToFakeQuantize"
    }

    fn pattern(&self) -> Pattern {
        Pattern::any_of(&[OpKind::Subtract]).with(Constraint::InputCount(2))
    }

    fn can_apply(&self, _ctx: &TransformationContext, graph: &Graph, m: &Match) -> bool {
        fusable_fake_quantize(graph, m.node).is_some()
    }

    fn apply(
        &self,
        _ctx: &mut TransformationContext,
        graph: &mut Graph,
        m: &Match,
    ) -> Result<bool, LptError> {
        fuse_into_fake_quantize(graph, m.node, |bound, value| bound - value)
    }
}

/// Folds `FakeQuantize -> Multiply(v)` into the fake-quantize output bounds.
#[derive(Debug, Clone, Default)]
pub struct FuseMultiplyToFakeQuantize;

impl Transformation for FuseMultiplyToFakeQuantize {
    fn name(&self) -> &'static str {
        "FuseMultiplyToFakeQuantize"
    }

    fn pattern(&self) -> Pattern {
        Pattern::any_of(&[OpKind::Multiply]).with(Constraint::InputCount(2))
    }

    fn can_apply(&self, _ctx: &TransformationContext, graph: &Graph, m: &Match) -> bool {
        fusable_fake_quantize(graph, m.node).is_some()
    }

    fn apply(
        &self,
        _ctx: &mut TransformationContext,
        graph: &mut Graph,
        m: &Match,
    ) -> Result<bool, LptError> {
        fuse_into_fake_quantize(graph, m.node, |bound, value| bound * value)
    }
}
