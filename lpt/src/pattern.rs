//! Local structural matching of a node against an operation kind set and a list of constraints.
//!
//! A match only ever looks at the node itself, its direct producers and its direct consumers.

use crate::graph::{Graph, NodeId, OpKind};

#[derive(Clone, Debug, PartialEq)]
pub enum Constraint {
    /// Every input and output port has a static shape.
    StaticShape,
    /// The node output is read by exactly one consumer.
    SingleConsumer,
    /// Input `index` is produced by a Constant.
    ConstantInput(usize),
    /// Input `index` is produced by one of `kinds`.
    InputKind { index: usize, kinds: Vec<OpKind> },
    /// The node has exactly this many inputs.
    InputCount(usize),
}

impl Constraint {
    pub fn holds(&self, graph: &Graph, node: NodeId) -> bool {
        let Some(n) = graph.node(node) else {
            return false;
        };
        match self {
            Constraint::StaticShape => {
                n.inputs().iter().all(|input| {
                    graph
                        .port(*input)
                        .map(|p| p.static_shape().is_some())
                        .unwrap_or(false)
                }) && (0..n.num_outputs())
                    .all(|i| n.output(i).and_then(|p| p.static_shape()).is_some())
            }
            Constraint::SingleConsumer => n.consumer_count() == 1,
            Constraint::ConstantInput(index) => {
                graph.kind_of_input(node, *index) == Some(OpKind::Constant)
            }
            Constraint::InputKind { index, kinds } => graph
                .kind_of_input(node, *index)
                .map(|kind| kinds.contains(&kind))
                .unwrap_or(false),
            Constraint::InputCount(count) => n.inputs().len() == *count,
        }
    }
}

/// The matched node with its direct neighbourhood.
#[derive(Clone, Debug, PartialEq)]
pub struct Match {
    pub node: NodeId,
    pub kind: OpKind,
    /// Producer node of each input slot.
    pub producers: Vec<NodeId>,
    /// Distinct consumer nodes.
    pub consumers: Vec<NodeId>,
}

impl Match {
    pub fn producer(&self, index: usize) -> Option<NodeId> {
        self.producers.get(index).copied()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Pattern {
    kinds: Vec<OpKind>,
    constraints: Vec<Constraint>,
}

impl Pattern {
    pub fn any_of(kinds: &[OpKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            constraints: vec![],
        }
    }

    pub fn with(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn kinds(&self) -> &[OpKind] {
        &self.kinds
    }

    pub fn matches(&self, graph: &Graph, node: NodeId) -> Option<Match> {
        let n = graph.node(node)?;
        let kind = n.kind();
        if !self.kinds.contains(&kind) {
            return None;
        }
        if !self.constraints.iter().all(|c| c.holds(graph, node)) {
            return None;
        }
        Some(Match {
            node,
            kind,
            producers: n.inputs().iter().map(|e| e.node()).collect(),
            consumers: graph.consumer_nodes(node),
        })
    }
}

impl Graph {
    /// Kind of the node feeding input `index` of `node`.
    pub fn kind_of_input(&self, node: NodeId, index: usize) -> Option<OpKind> {
        self.producer(node, index).and_then(|p| self.kind(p))
    }
}
