//! Module containing code defining [`GraphError`] type.

use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

use super::NodeId;

#[derive(Debug, Clone, PartialEq)]
/// Errors relating to [`super::Graph`] mutations.
pub enum GraphError {
    /// A display name is already used by another node.
    DuplicateName(String),
    /// The node id does not refer to a live node.
    UnknownNode(NodeId),
    /// The port index is out of range for the node.
    InvalidPort { node: NodeId, index: usize },
    /// The node still has consumers and cannot be removed.
    NodeInUse(NodeId),
    /// A node cannot replace another one with a different number of outputs.
    PortCountMismatch { old: usize, new: usize },
    /// The graph contains a cycle.
    Cycle,
}

impl Display for GraphError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            GraphError::DuplicateName(name) => write!(f, "node name {} is already used", name),
            GraphError::UnknownNode(id) => write!(f, "node {} does not exist", id),
            GraphError::InvalidPort { node, index } => {
                write!(f, "node {} has no port {}", node, index)
            }
            GraphError::NodeInUse(id) => write!(f, "node {} still has consumers", id),
            GraphError::PortCountMismatch { old, new } => write!(
                f,
                "cannot replace a node with {} outputs by a node with {} outputs",
                old, new
            ),
            GraphError::Cycle => write!(f, "graph is not acyclic"),
        }
    }
}

impl Error for GraphError {}
