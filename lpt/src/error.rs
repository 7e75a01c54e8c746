//! Module containing the [`LptError`] type returned by decomposition routines and rewrite rules.

use crate::{
    graph::{ElementType, GraphError, NodeId},
    tensor::TensorError,
};

/// Errors surfaced by the transformation pipeline.
///
/// Guard failures are not errors: a rule whose precondition does not hold simply reports that it
/// did not rewrite anything. Only conditions a rule cannot recover from end up here.
#[derive(thiserror::Error, Debug)]
pub enum LptError {
    #[error("unsupported configuration at node {node}: {reason}")]
    UnsupportedConfiguration { node: String, reason: String },
    #[error("unsupported element type {0:?} for low precision decomposition")]
    UnsupportedPrecision(ElementType),
    #[error("unsupported number of quantization levels: {0}")]
    UnsupportedLevels(usize),
    #[error("invalid quantization details: {0}")]
    InvalidDetails(String),
    #[error("node {0} is not a quantizable fake-quantize")]
    NotQuantizable(NodeId),
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),
}

impl LptError {
    /// Whether this error must abort the whole pipeline run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LptError::NotQuantizable(_) | LptError::UnsupportedLevels(_))
    }
}
