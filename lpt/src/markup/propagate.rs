use tracing::{debug, trace};

use crate::{
    LptError,
    attributes::{Attribute, AttributeKind, AttributeTarget, PrecisionSet},
    graph::{Edge, ElementType, Graph, OpKind},
};

use super::{MarkupPass, is_precision_preserved};

/// Gives every fake-quantize output a set of candidate precisions, shares that set along the
/// precision preserved operations downstream, and narrows it with the restriction of the
/// operations that consume it.
pub struct PropagatePrecisions;

impl MarkupPass for PropagatePrecisions {
    fn name(&self) -> &'static str {
        "PropagatePrecisions"
    }

    fn run(&self, graph: &mut Graph) -> Result<(), LptError> {
        graph.attributes_mut().clear(AttributeKind::Precisions);
        let order = graph.topological_order()?;
        for id in order {
            let Some(node) = graph.node(id) else { continue };
            let kind = node.kind();
            let inputs = node.inputs().to_vec();
            let outputs = node.num_outputs();

            if kind == OpKind::FakeQuantize {
                for index in 0..outputs {
                    let store = graph.attributes_mut();
                    let group = store.new_precisions(PrecisionSet::from([ElementType::U8, ElementType::I8]));
                    store.set(AttributeTarget::Port(Edge::new(id, index)), Attribute::Precisions(group));
                }
                continue;
            }

            if is_precision_preserved(graph, id) {
                let store = graph.attributes_mut();
                let groups = inputs
                    .iter()
                    .filter_map(|input| store.precisions_group(*input))
                    .collect::<Vec<_>>();
                let Some((first, rest)) = groups.split_first() else { continue };
                let merged = rest
                    .iter()
                    .fold(*first, |acc, group| store.merge_precisions(acc, *group));
                for index in 0..outputs {
                    store.set(AttributeTarget::Port(Edge::new(id, index)), Attribute::Precisions(merged));
                }
                trace!("node {} shares precisions {:?}", id, store.precisions(Edge::new(id, 0)));
                continue;
            }

            let Some(restriction) = graph.attributes().restriction(id).map(|r| r.to_vec()) else {
                continue;
            };
            let store = graph.attributes_mut();
            for port in restriction {
                let Some(source) = inputs.get(port.index) else { continue };
                if let Some(group) = store.precisions_group(*source) {
                    store.restrict_precisions(group, &port.precisions);
                    debug!(
                        "input {} of node {} restricted to {:?}",
                        port.index, id, port.precisions
                    );
                }
            }
        }
        Ok(())
    }
}
