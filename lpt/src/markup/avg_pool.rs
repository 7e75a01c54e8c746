use std::collections::{BTreeSet, VecDeque};

use tracing::debug;

use crate::{
    LptError,
    attributes::{Attribute, AttributeTarget},
    graph::{Graph, NodeId, OpKind},
};

use super::{MarkupPass, is_precision_preserved};

/// Average pooling averages quantized values, so it is only treated as precision preserved when
/// every value it reads comes from a fake-quantize through pass-through operations and its result
/// reaches an operation that actually consumes the low precision tensor.
pub struct MarkupAvgPoolPrecisionPreserved;

/// Pass-through for the walks below, independent of the flag this pass writes.
fn transparent(graph: &Graph, node: NodeId) -> bool {
    graph.kind(node) == Some(OpKind::AvgPool) || is_precision_preserved(graph, node)
}

fn quantized_upstream(graph: &Graph, pool: NodeId) -> bool {
    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::from(
        graph
            .node(pool)
            .map(|n| n.inputs().iter().map(|e| e.node()).collect::<Vec<_>>())
            .unwrap_or_default(),
    );
    if queue.is_empty() {
        return false;
    }
    while let Some(node) = queue.pop_front() {
        if !visited.insert(node) {
            continue;
        }
        match graph.node(node) {
            Some(n) if n.kind() == OpKind::FakeQuantize => {}
            Some(n) if transparent(graph, node) => {
                queue.extend(n.inputs().iter().map(|e| e.node()));
            }
            _ => return false,
        }
    }
    true
}

fn low_precision_consumer_downstream(graph: &Graph, pool: NodeId) -> bool {
    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::from(graph.consumer_nodes(pool));
    while let Some(node) = queue.pop_front() {
        if !visited.insert(node) {
            continue;
        }
        match graph.kind(node) {
            Some(OpKind::FakeQuantize | OpKind::Result) | None => {}
            Some(_) if transparent(graph, node) => queue.extend(graph.consumer_nodes(node)),
            Some(_) => return true,
        }
    }
    false
}

impl MarkupPass for MarkupAvgPoolPrecisionPreserved {
    fn name(&self) -> &'static str {
        "MarkupAvgPoolPrecisionPreserved"
    }

    fn run(&self, graph: &mut Graph) -> Result<(), LptError> {
        let pools = graph
            .nodes()
            .filter(|(_, n)| n.kind() == OpKind::AvgPool)
            .map(|(id, _)| id)
            .collect::<Vec<_>>();
        let flags = pools
            .iter()
            .map(|pool| {
                let preserved = quantized_upstream(graph, *pool)
                    && low_precision_consumer_downstream(graph, *pool);
                (*pool, preserved)
            })
            .collect::<Vec<_>>();
        for (pool, preserved) in flags {
            debug!("AvgPool node {} precision preserved: {}", pool, preserved);
            graph
                .attributes_mut()
                .set(AttributeTarget::Node(pool), Attribute::PrecisionPreserved(preserved));
        }
        Ok(())
    }
}
