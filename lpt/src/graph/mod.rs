//! Arena based dataflow graph the transformations operate on.
//!
//! Nodes are addressed by [`NodeId`] and never move: removing a node leaves a tombstone so ids
//! held by an in-flight sweep stay meaningful. Every input edge is mirrored in the producer's
//! [`OutputWire`], which makes "who else reads this output" a direct lookup.

mod error;
mod node;
mod op;

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
};

use tracing::trace;

pub use error::GraphError;
pub use node::{Edge, Node, OutputWire, Port, TypeRelaxed};
pub use op::{ElementType, InterpolateMode, Op, OpKind};

use crate::{attributes::AttributeStore, tensor::Tensor};

pub type NodeId = usize;

#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Option<Node>>,
    names: HashMap<String, NodeId>,
    attributes: AttributeStore,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node consuming `inputs` and exposing one output port per entry of `outputs`.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op: Op,
        inputs: Vec<Edge>,
        outputs: Vec<Port>,
    ) -> Result<NodeId, GraphError> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(GraphError::DuplicateName(name));
        }
        for input in &inputs {
            self.port(*input)?;
        }
        let id = self.nodes.len();
        for (slot, input) in inputs.iter().enumerate() {
            self.wire_mut(*input)?.edges.push(Edge::new(id, slot));
        }
        self.names.insert(name.clone(), id);
        self.nodes.push(Some(Node {
            name,
            op,
            inputs,
            outputs: outputs
                .into_iter()
                .map(|port| OutputWire {
                    port,
                    edges: vec![],
                })
                .collect(),
            relaxed: None,
        }));
        Ok(id)
    }

    /// Same as [`Graph::add_node`] but derives a free display name from `base`.
    pub fn add_unique_node(
        &mut self,
        base: &str,
        op: Op,
        inputs: Vec<Edge>,
        outputs: Vec<Port>,
    ) -> Result<NodeId, GraphError> {
        let name = self.unique_name(base);
        self.add_node(name, op, inputs, outputs)
    }

    /// Adds a constant node with a single output typed `element_type`.
    pub fn add_constant(
        &mut self,
        base: &str,
        value: Tensor,
        element_type: ElementType,
    ) -> Result<NodeId, GraphError> {
        let port = Port::new(element_type, value.get_shape().to_vec());
        self.add_unique_node(base, Op::Constant(value), vec![], vec![port])
    }

    pub fn unique_name(&self, base: &str) -> String {
        if !self.names.contains_key(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{}_{}", base, i))
            .find(|candidate| !self.names.contains_key(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id).and_then(|n| n.as_ref())
    }

    pub fn try_node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.node(id).ok_or(GraphError::UnknownNode(id))
    }

    fn try_node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.nodes
            .get_mut(id)
            .and_then(|n| n.as_mut())
            .ok_or(GraphError::UnknownNode(id))
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    pub fn kind(&self, id: NodeId) -> Option<OpKind> {
        self.node(id).map(|n| n.kind())
    }

    /// Live nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(id, n)| n.as_ref().map(|n| (id, n)))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Description of the output port referenced by `output`.
    pub fn port(&self, output: Edge) -> Result<&Port, GraphError> {
        self.try_node(output.node)?
            .output(output.index)
            .ok_or(GraphError::InvalidPort {
                node: output.node,
                index: output.index,
            })
    }

    fn wire_mut(&mut self, output: Edge) -> Result<&mut OutputWire, GraphError> {
        self.try_node_mut(output.node)?
            .outputs
            .get_mut(output.index)
            .ok_or(GraphError::InvalidPort {
                node: output.node,
                index: output.index,
            })
    }

    /// Producer output feeding input slot `index` of `node`.
    pub fn input(&self, node: NodeId, index: usize) -> Option<Edge> {
        self.node(node).and_then(|n| n.input(index))
    }

    /// Node producing input slot `index` of `node`.
    pub fn producer(&self, node: NodeId, index: usize) -> Option<NodeId> {
        self.input(node, index).map(|e| e.node)
    }

    /// Consumer slots reading `output`.
    pub fn consumers(&self, output: Edge) -> &[Edge] {
        self.node(output.node)
            .map(|n| n.consumers(output.index))
            .unwrap_or_default()
    }

    /// Distinct consumer nodes over every output of `node`.
    pub fn consumer_nodes(&self, node: NodeId) -> Vec<NodeId> {
        let mut consumers = self
            .node(node)
            .map(|n| {
                n.outputs
                    .iter()
                    .flat_map(|w| w.edges.iter().map(|e| e.node))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        consumers.sort_unstable();
        consumers.dedup();
        consumers
    }

    /// Constant payload of the node producing `output`, if it is a constant.
    pub fn constant(&self, output: Edge) -> Option<&Tensor> {
        match self.node(output.node)?.op() {
            Op::Constant(value) => Some(value),
            _ => None,
        }
    }

    pub fn set_output_type(
        &mut self,
        output: Edge,
        element_type: ElementType,
    ) -> Result<(), GraphError> {
        self.wire_mut(output)?.port.element_type = element_type;
        Ok(())
    }

    pub fn set_relaxed(&mut self, node: NodeId, relaxed: TypeRelaxed) -> Result<(), GraphError> {
        self.try_node_mut(node)?.relaxed = Some(relaxed);
        Ok(())
    }

    /// Reconnects input slot `index` of `node` to `source`.
    pub fn set_input(&mut self, node: NodeId, index: usize, source: Edge) -> Result<(), GraphError> {
        self.port(source)?;
        let old = self
            .try_node(node)?
            .input(index)
            .ok_or(GraphError::InvalidPort { node, index })?;
        let slot = Edge::new(node, index);
        self.wire_mut(old)?.edges.retain(|e| *e != slot);
        self.wire_mut(source)?.edges.push(slot);
        self.try_node_mut(node)?.inputs[index] = source;
        Ok(())
    }

    /// Moves the given consumer slots onto `source`.
    pub fn rewire(&mut self, consumers: &[Edge], source: Edge) -> Result<(), GraphError> {
        for consumer in consumers {
            self.set_input(consumer.node, consumer.index, source)?;
        }
        Ok(())
    }

    /// Moves every consumer of `old` onto `new`, except the node owning `new`.
    pub fn replace_output(&mut self, old: Edge, new: Edge) -> Result<(), GraphError> {
        let consumers = self
            .consumers(old)
            .iter()
            .filter(|e| e.node != new.node)
            .copied()
            .collect::<Vec<_>>();
        self.rewire(&consumers, new)
    }

    /// Substitutes `new` for `old`: consumers move to the same output index of `new`, `new`
    /// inherits the attributes and the display name of `old`, and `old` is removed together with
    /// any producer left without consumers.
    pub fn replace_node(&mut self, old: NodeId, new: NodeId) -> Result<(), GraphError> {
        let old_outputs = self.try_node(old)?.num_outputs();
        let new_outputs = self.try_node(new)?.num_outputs();
        if old_outputs != new_outputs {
            return Err(GraphError::PortCountMismatch {
                old: old_outputs,
                new: new_outputs,
            });
        }
        for index in 0..old_outputs {
            self.replace_output(Edge::new(old, index), Edge::new(new, index))?;
        }
        self.attributes.copy_node(old, new);
        let name = self.try_node(old)?.name.clone();
        self.remove_dead_from(old)?;
        if self.node(old).is_none() {
            self.rename(new, &name)?;
        }
        trace!("replaced {} by node {}", name, new);
        Ok(())
    }

    pub fn rename(&mut self, node: NodeId, name: &str) -> Result<(), GraphError> {
        match self.names.get(name) {
            Some(owner) if *owner == node => return Ok(()),
            Some(_) => return Err(GraphError::DuplicateName(name.to_string())),
            None => {}
        }
        let old = std::mem::replace(&mut self.try_node_mut(node)?.name, name.to_string());
        self.names.remove(&old);
        self.names.insert(name.to_string(), node);
        Ok(())
    }

    /// Removes a node without consumers, detaching it from its producers.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), GraphError> {
        let node = self.try_node(id)?;
        if node.consumer_count() > 0 {
            return Err(GraphError::NodeInUse(id));
        }
        let inputs = node.inputs.clone();
        let name = node.name.clone();
        for (slot, input) in inputs.iter().enumerate() {
            let edge = Edge::new(id, slot);
            self.wire_mut(*input)?.edges.retain(|e| *e != edge);
        }
        self.names.remove(&name);
        self.attributes.forget_node(id);
        self.nodes[id] = None;
        Ok(())
    }

    /// Removes `id` if nothing consumes it anymore, then walks up to its producers doing the same.
    /// Parameters and results are never removed.
    pub fn remove_dead_from(&mut self, id: NodeId) -> Result<(), GraphError> {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let Some(node) = self.node(id) else { continue };
            if matches!(node.kind(), OpKind::Parameter | OpKind::Result) || node.consumer_count() > 0
            {
                continue;
            }
            let producers = node.inputs.iter().map(|e| e.node).collect::<Vec<_>>();
            self.remove_node(id)?;
            stack.extend(producers);
        }
        Ok(())
    }

    /// Live nodes in topological order. Among ready nodes the smallest id goes first, so the
    /// order is deterministic for a given graph.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut pending = vec![0usize; self.nodes.len()];
        let mut ready = BinaryHeap::new();
        for (id, node) in self.nodes() {
            pending[id] = node.inputs.len();
            if node.inputs.is_empty() {
                ready.push(Reverse(id));
            }
        }
        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for wire in &self.try_node(id)?.outputs {
                for consumer in &wire.edges {
                    pending[consumer.node] -= 1;
                    if pending[consumer.node] == 0 {
                        ready.push(Reverse(consumer.node));
                    }
                }
            }
        }
        if order.len() != self.len() {
            return Err(GraphError::Cycle);
        }
        Ok(order)
    }

    /// Terminal result nodes.
    pub fn results(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, n)| n.kind() == OpKind::Result)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut AttributeStore {
        &mut self.attributes
    }
}
