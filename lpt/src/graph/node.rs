use serde::{Deserialize, Serialize};

use super::{ElementType, NodeId, Op, OpKind};

/// Represents a link between an output port of a node and an input slot of another node.
///
/// In a node's input list the edge names the producing node and its output port; in an
/// [`OutputWire`] it names a consumer node and the input slot fed by the wire.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub(crate) node: NodeId,
    pub(crate) index: usize,
}

impl Edge {
    pub fn new(node: NodeId, index: usize) -> Self {
        Self { node, index }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// Element type and shape of an output port. A `None` shape is dynamic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub element_type: ElementType,
    pub shape: Option<Vec<usize>>,
}

impl Port {
    pub fn new(element_type: ElementType, shape: Vec<usize>) -> Self {
        Self {
            element_type,
            shape: Some(shape),
        }
    }

    pub fn dynamic(element_type: ElementType) -> Self {
        Self {
            element_type,
            shape: None,
        }
    }

    pub fn static_shape(&self) -> Option<&[usize]> {
        self.shape.as_deref()
    }

    pub fn rank(&self) -> Option<usize> {
        self.shape.as_ref().map(|s| s.len())
    }

    pub fn with_type(&self, element_type: ElementType) -> Self {
        Self {
            element_type,
            shape: self.shape.clone(),
        }
    }
}

/// All the consumers of a node's output port, together with the port description.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OutputWire {
    pub(crate) port: Port,
    // one output can feed any number of inputs
    pub(crate) edges: Vec<Edge>,
}

/// Explicit-precision adapter: the element types the wrapped kernel computes with, independent of
/// the element types of the ports it is connected to.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TypeRelaxed {
    pub input_types: Vec<ElementType>,
    pub output_types: Vec<ElementType>,
}

impl TypeRelaxed {
    /// Adapter computing in `f32` whatever the connected types are.
    pub fn float(inputs: usize, outputs: usize) -> Self {
        Self {
            input_types: vec![ElementType::F32; inputs],
            output_types: vec![ElementType::F32; outputs],
        }
    }
}

/// Represents a node in a graph
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) op: Op,
    pub(crate) inputs: Vec<Edge>,
    pub(crate) outputs: Vec<OutputWire>,
    pub(crate) relaxed: Option<TypeRelaxed>,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }

    pub fn inputs(&self) -> &[Edge] {
        &self.inputs
    }

    pub fn input(&self, index: usize) -> Option<Edge> {
        self.inputs.get(index).copied()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn output(&self, index: usize) -> Option<&Port> {
        self.outputs.get(index).map(|w| &w.port)
    }

    pub fn consumers(&self, index: usize) -> &[Edge] {
        self.outputs
            .get(index)
            .map(|w| w.edges.as_slice())
            .unwrap_or_default()
    }

    /// Number of consumer edges over all the outputs.
    pub fn consumer_count(&self) -> usize {
        self.outputs.iter().map(|w| w.edges.len()).sum()
    }

    pub fn relaxed(&self) -> Option<&TypeRelaxed> {
        self.relaxed.as_ref()
    }
}
