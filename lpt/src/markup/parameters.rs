use std::collections::BTreeMap;

use itertools::Itertools;
use tracing::{debug, warn};

use crate::{
    LptError,
    attributes::{AlignmentConflict, Attribute, AttributeKind, AttributeTarget, GroupId, PrecisionSet},
    graph::{Edge, ElementType, Graph, NodeId, OpKind},
    quantization::{DataPrecision, QuantizationDetails, ScaleZeroPoint},
};

use super::MarkupPass;

/// Checks that the members of each interval group really decompose with the same scale and zero
/// point once the shared interval is applied. Mismatches are recorded as conflicts and the
/// group alignment flag is cleared; nothing is rewritten.
pub struct AlignQuantizationParameters;

#[derive(Debug, Default)]
struct Group {
    fake_quantizes: Vec<NodeId>,
    others: Vec<NodeId>,
}

fn member_names(graph: &Graph, members: &[NodeId]) -> Vec<String> {
    members
        .iter()
        .filter_map(|id| graph.node(*id))
        .map(|n| n.name().to_string())
        .collect()
}

/// Reason the members of `group` disagree, if they do.
fn check_group(graph: &Graph, group: &Group) -> Option<String> {
    let store = graph.attributes();
    let interval = store.intervals(*group.fake_quantizes.first()?)?.clone();

    let levels = group
        .fake_quantizes
        .iter()
        .filter_map(|fq| QuantizationDetails::from_fake_quantize(graph, *fq).ok())
        .map(|d| d.levels)
        .unique()
        .collect::<Vec<_>>();
    if levels.len() > 1 {
        return Some(format!("members use different level counts {:?}", levels));
    }

    let mut params = vec![];
    for fq in &group.fake_quantizes {
        let allowed = store
            .precisions(Edge::new(*fq, 0))
            .cloned()
            .unwrap_or_else(|| PrecisionSet::from([ElementType::U8, ElementType::I8]));
        match DataPrecision::select(&[interval.min], &[interval.max], interval.levels, &allowed) {
            Ok(Some(dp)) => {
                let sz = ScaleZeroPoint::from_interval(interval.min, interval.max, dp.min, dp.max);
                params.push((dp.precision, sz.scale, sz.zero_point));
            }
            Ok(None) => return Some(format!("no precision left for node {}", fq)),
            Err(err) => return Some(err.to_string()),
        }
    }
    let distinct = params
        .iter()
        .map(|(precision, scale, zero_point)| (*precision, scale.to_bits(), zero_point.to_bits()))
        .unique()
        .count();
    (distinct > 1).then(|| format!("decomposition parameters differ: {:?}", params))
}

impl MarkupPass for AlignQuantizationParameters {
    fn name(&self) -> &'static str {
        "AlignQuantizationParameters"
    }

    fn run(&self, graph: &mut Graph) -> Result<(), LptError> {
        graph.attributes_mut().clear(AttributeKind::QuantizationAlignment);

        let mut groups: BTreeMap<GroupId, Group> = BTreeMap::new();
        for (id, node) in graph.nodes() {
            let store = graph.attributes();
            let Some(group) = store.intervals_group(id) else { continue };
            let entry = groups.entry(store.intervals_root(group)).or_default();
            if node.kind() == OpKind::FakeQuantize {
                entry.fake_quantizes.push(id);
            } else {
                entry.others.push(id);
            }
        }

        for group in groups.values() {
            let conflict = check_group(graph, group);
            let store = graph.attributes_mut();
            let cell = store.new_alignment(conflict.is_none());
            for member in group.fake_quantizes.iter().chain(group.others.iter()) {
                store.set(AttributeTarget::Node(*member), Attribute::QuantizationAlignment(cell));
            }
            match conflict {
                Some(reason) => {
                    let members = member_names(graph, &group.fake_quantizes);
                    warn!("alignment conflict between {:?}: {}", members, reason);
                    graph
                        .attributes_mut()
                        .push_conflict(AlignmentConflict { members, reason });
                }
                None => debug!("{} fake-quantize nodes aligned", group.fake_quantizes.len()),
            }
        }
        Ok(())
    }
}
