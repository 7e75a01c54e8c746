//! Collection of the fake-quantize nodes feeding a concatenation through precision preserving
//! operations.

use std::collections::{BTreeSet, VecDeque};

use tracing::trace;

use crate::{
    graph::{Edge, Graph, NodeId, OpKind},
    markup::is_precision_preserved,
};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum SubgraphError {
    #[error("node {name} of kind {kind} bounds the subgraph but is not a FakeQuantize")]
    NonQuantizedBoundary { name: String, kind: OpKind },
    #[error("node {0} is not a concatenation")]
    NotConcat(NodeId),
}

/// Nodes taking part in one concat rewrite.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Subgraph {
    /// Concatenations, in discovery order.
    pub concats: Vec<NodeId>,
    /// Precision preserving nodes between the fake-quantize boundary and the concatenations,
    /// concatenations included.
    pub layers: BTreeSet<NodeId>,
    /// Fake-quantize nodes bounding the subgraph, in discovery order.
    pub quantization_layers: Vec<NodeId>,
}

impl Subgraph {
    pub fn is_empty(&self) -> bool {
        self.quantization_layers.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.layers.contains(&node) || self.quantization_layers.contains(&node)
    }
}

/// Walks backward from `concat` through precision preserving nodes down to the fake-quantize
/// boundary. Concatenations sharing one of the boundary fake-quantize nodes (through precision
/// preserving nodes) are pulled into the same subgraph.
pub fn collect_for_concat(graph: &Graph, concat: NodeId) -> Result<Subgraph, SubgraphError> {
    collect(graph, concat, true)
}

/// Same as [`collect_for_concat`] without following the fake-quantize fan-out.
pub fn collect_backward(graph: &Graph, concat: NodeId) -> Result<Subgraph, SubgraphError> {
    collect(graph, concat, false)
}

fn collect(graph: &Graph, concat: NodeId, follow_fan_out: bool) -> Result<Subgraph, SubgraphError> {
    if graph.kind(concat) != Some(OpKind::Concat) {
        return Err(SubgraphError::NotConcat(concat));
    }
    let mut subgraph = Subgraph::default();
    let mut pending_concats = VecDeque::from([concat]);
    while let Some(current) = pending_concats.pop_front() {
        if subgraph.concats.contains(&current) {
            continue;
        }
        subgraph.concats.push(current);
        subgraph.layers.insert(current);

        let mut queue = graph
            .node(current)
            .map(|n| n.inputs().iter().map(|e| e.node()).collect::<VecDeque<_>>())
            .unwrap_or_default();
        while let Some(node) = queue.pop_front() {
            if subgraph.contains(node) {
                continue;
            }
            let Some(n) = graph.node(node) else { continue };
            match n.kind() {
                OpKind::FakeQuantize => {
                    subgraph.quantization_layers.push(node);
                    if follow_fan_out {
                        for neighbour in concats_reachable_from(graph, node) {
                            pending_concats.push_back(neighbour);
                        }
                    }
                }
                kind if is_precision_preserved(graph, node) => {
                    if kind == OpKind::Concat {
                        subgraph.concats.push(node);
                    }
                    subgraph.layers.insert(node);
                    queue.extend(n.inputs().iter().map(|e| e.node()));
                }
                kind => {
                    trace!("subgraph of concat {} stops at {} ({})", concat, n.name(), kind);
                    return Err(SubgraphError::NonQuantizedBoundary {
                        name: n.name().to_string(),
                        kind,
                    });
                }
            }
        }
    }
    Ok(subgraph)
}

/// Concatenations reached from `node` through precision preserving consumers only.
fn concats_reachable_from(graph: &Graph, node: NodeId) -> Vec<NodeId> {
    let mut found = vec![];
    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::from(graph.consumer_nodes(node));
    while let Some(consumer) = queue.pop_front() {
        if !visited.insert(consumer) {
            continue;
        }
        if graph.kind(consumer) == Some(OpKind::Concat) {
            found.push(consumer);
        } else if is_precision_preserved(graph, consumer) {
            queue.extend(graph.consumer_nodes(consumer));
        }
    }
    found
}

/// First non precision preserving nodes downstream of `node`.
pub fn children_except_precision_preserved(graph: &Graph, node: NodeId) -> Vec<NodeId> {
    let mut children = vec![];
    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::from(graph.consumer_nodes(node));
    while let Some(consumer) = queue.pop_front() {
        if !visited.insert(consumer) {
            continue;
        }
        if is_precision_preserved(graph, consumer) {
            queue.extend(graph.consumer_nodes(consumer));
        } else {
            children.push(consumer);
        }
    }
    children
}

/// Whether the concatenations of `subgraph` may keep a distinct scale per branch. Convolution
/// kernels need a single per-tensor scale on their input, so a Convolution downstream forbids it.
pub fn is_multi_channel(graph: &Graph, subgraph: &Subgraph) -> bool {
    subgraph.concats.iter().all(|concat| {
        children_except_precision_preserved(graph, *concat)
            .iter()
            .all(|child| graph.kind(*child) != Some(OpKind::Convolution))
    })
}

/// Consumers of `output` that are outside of `subgraph`.
pub fn external_consumers(graph: &Graph, subgraph: &Subgraph, output: Edge) -> Vec<Edge> {
    graph
        .consumers(output)
        .iter()
        .filter(|e| !subgraph.contains(e.node()))
        .copied()
        .collect()
}
