use tracing::{debug, trace};

use crate::{
    LptError,
    attributes::{Attribute, AttributeKind, AttributeTarget, IntervalsAlignment},
    graph::{Graph, OpKind},
    quantization::QuantizationDetails,
    subgraph::collect_backward,
};

use super::MarkupPass;

/// Groups the fake-quantize nodes feeding the same concatenation and attaches to all of them,
/// and to the concatenation, one shared interval covering every member.
pub struct AlignQuantizationIntervals;

impl MarkupPass for AlignQuantizationIntervals {
    fn name(&self) -> &'static str {
        "AlignQuantizationIntervals"
    }

    fn run(&self, graph: &mut Graph) -> Result<(), LptError> {
        graph.attributes_mut().clear(AttributeKind::IntervalsAlignment);
        let concats = graph
            .nodes()
            .filter(|(_, n)| n.kind() == OpKind::Concat)
            .map(|(id, _)| id)
            .collect::<Vec<_>>();

        for concat in concats {
            let subgraph = match collect_backward(graph, concat) {
                Ok(subgraph) if !subgraph.is_empty() => subgraph,
                Ok(_) => continue,
                Err(err) => {
                    trace!("no interval alignment for concat {}: {}", concat, err);
                    continue;
                }
            };
            let details = subgraph
                .quantization_layers
                .iter()
                .map(|fq| QuantizationDetails::from_fake_quantize(graph, *fq))
                .collect::<Result<Vec<_>, _>>();
            let Ok(details) = details else {
                trace!("no interval alignment for concat {}: invalid fake-quantize", concat);
                continue;
            };
            let Some(interval) = details
                .iter()
                .map(|d| {
                    let (min, max) = d.output_interval();
                    IntervalsAlignment {
                        min,
                        max,
                        levels: d.levels,
                    }
                })
                .reduce(IntervalsAlignment::widen)
            else {
                continue;
            };

            let store = graph.attributes_mut();
            let mut group = store.new_intervals(interval);
            let members = subgraph
                .quantization_layers
                .iter()
                .chain(subgraph.layers.iter())
                .copied()
                .collect::<Vec<_>>();
            for member in &members {
                if let Some(existing) = store.intervals_group(*member) {
                    group = store.merge_intervals(existing, group);
                }
            }
            for member in members {
                if !store.has(AttributeTarget::Node(member), AttributeKind::IntervalsAlignment) {
                    store.set(AttributeTarget::Node(member), Attribute::IntervalsAlignment(group));
                }
            }
            debug!(
                "concat {} aligns {} fake-quantize nodes on {:?}",
                concat,
                subgraph.quantization_layers.len(),
                store.intervals(concat)
            );
        }
        Ok(())
    }
}
