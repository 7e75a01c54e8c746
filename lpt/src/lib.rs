//! Low-precision transformations: rewrites a floating point dataflow graph annotated with
//! fake-quantize nodes so that eligible subgraphs run on 8-bit integer kernels followed by a
//! small floating point dequantization.
//!
//! The entry point is [`LowPrecisionTransformer`], which runs the markup passes, the main rule
//! set until a fixed point, and the cleanup rules over a [`Graph`].

pub mod attributes;
pub mod config;
pub mod error;
pub mod graph;
pub mod markup;
pub mod pattern;
pub mod pipeline;
pub mod quantization;
pub mod rules;
pub mod subgraph;
pub mod tensor;

#[cfg(test)]
pub(crate) mod testing;

pub use attributes::AttributeStore;
pub use config::{LowPrecisionConfig, LptParams, OperationPrecisionRestriction, PortRestriction};
pub use error::LptError;
pub use graph::{Edge, ElementType, Graph, Node, NodeId, Op, OpKind, Port};
pub use pipeline::{LowPrecisionTransformer, PipelineReport, PipelineState, is_graph_quantized};
pub use tensor::Tensor;
