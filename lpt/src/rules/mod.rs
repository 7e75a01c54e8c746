//! Local rewrite rules.
//!
//! Each rule matches one node through a [`Pattern`], checks its preconditions without touching the
//! graph in [`Transformation::can_apply`], and only then rewrites in [`Transformation::apply`].
//! The registry is keyed by [`OpKind`] so that adding an operation kind forces a decision about
//! the rules it takes part in.

mod cleanup;
mod concat;
mod constant;
mod convolution;
mod depth_to_space;
mod eltwise;
mod fake_quantize;
mod mat_mul;
mod transparent;

use std::collections::HashSet;

use derive_more::From;
use tracing::debug;

pub use cleanup::{FoldConvert, FuseMultiplyToFakeQuantize, FuseSubtractToFakeQuantize};
pub use concat::ConcatRule;
pub use constant::ConstantSanitization;
pub use convolution::ConvolutionRule;
pub use depth_to_space::DepthToSpaceRule;
pub use eltwise::ConvertFusion;
pub use fake_quantize::{FakeQuantizeDecomposition, decompose_fake_quantize};
pub use mat_mul::MatMulRule;
pub use transparent::TransparentRule;

use crate::{
    LptError, LptParams,
    graph::{Edge, ElementType, Graph, NodeId, OpKind, TypeRelaxed},
    pattern::{Match, Pattern},
    quantization::{DequantizationParams, FakeQuantizeDequantization},
};

/// State shared by the rules during one pipeline run.
#[derive(Debug, Clone)]
pub struct TransformationContext {
    pub params: LptParams,
    /// Fake-quantize nodes already decomposed, by display name.
    handled: HashSet<String>,
    pub degenerate_intervals: usize,
}

impl TransformationContext {
    pub fn new(params: LptParams) -> Self {
        Self {
            params,
            handled: HashSet::new(),
            degenerate_intervals: 0,
        }
    }

    pub fn mark_handled(&mut self, name: &str) {
        self.handled.insert(name.to_string());
    }

    pub fn is_handled(&self, name: &str) -> bool {
        self.handled.contains(name)
    }
}

pub trait Transformation {
    fn name(&self) -> &'static str;

    fn pattern(&self) -> Pattern;

    /// Read-only precondition check.
    fn can_apply(&self, ctx: &TransformationContext, graph: &Graph, m: &Match) -> bool;

    /// Rewrites the graph. Returns `false`, with the graph untouched, when nothing was done.
    fn apply(
        &self,
        ctx: &mut TransformationContext,
        graph: &mut Graph,
        m: &Match,
    ) -> Result<bool, LptError>;
}

#[derive(Debug, Clone, From)]
pub enum Rule {
    FakeQuantizeDecomposition(FakeQuantizeDecomposition),
    ConvertFusion(ConvertFusion),
    MatMul(MatMulRule),
    Convolution(ConvolutionRule),
    Concat(ConcatRule),
    Constant(ConstantSanitization),
    DepthToSpace(DepthToSpaceRule),
    Transparent(TransparentRule),
    FoldConvert(FoldConvert),
    FuseSubtractToFakeQuantize(FuseSubtractToFakeQuantize),
    FuseMultiplyToFakeQuantize(FuseMultiplyToFakeQuantize),
}

impl Rule {
    fn inner(&self) -> &dyn Transformation {
        match self {
            Rule::FakeQuantizeDecomposition(r) => r,
            Rule::ConvertFusion(r) => r,
            Rule::MatMul(r) => r,
            Rule::Convolution(r) => r,
            Rule::Concat(r) => r,
            Rule::Constant(r) => r,
            Rule::DepthToSpace(r) => r,
            Rule::Transparent(r) => r,
            Rule::FoldConvert(r) => r,
            Rule::FuseSubtractToFakeQuantize(r) => r,
            Rule::FuseMultiplyToFakeQuantize(r) => r,
        }
    }
}

impl Transformation for Rule {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn pattern(&self) -> Pattern {
        self.inner().pattern()
    }

    fn can_apply(&self, ctx: &TransformationContext, graph: &Graph, m: &Match) -> bool {
        self.inner().can_apply(ctx, graph, m)
    }

    fn apply(
        &self,
        ctx: &mut TransformationContext,
        graph: &mut Graph,
        m: &Match,
    ) -> Result<bool, LptError> {
        self.inner().apply(ctx, graph, m)
    }
}

/// Main rules tried on a node of `kind`, in order.
pub fn rules_for(kind: OpKind) -> Vec<Rule> {
    match kind {
        OpKind::FakeQuantize => vec![FakeQuantizeDecomposition.into()],
        OpKind::Add | OpKind::Multiply | OpKind::Subtract => vec![ConvertFusion.into()],
        OpKind::MatMul => vec![MatMulRule.into()],
        OpKind::Convolution | OpKind::GroupConvolution => vec![ConvolutionRule.into()],
        OpKind::Concat => vec![ConcatRule.into()],
        OpKind::Constant => vec![ConstantSanitization.into()],
        OpKind::DepthToSpace => vec![DepthToSpaceRule.into()],
        OpKind::MaxPool
        | OpKind::AvgPool
        | OpKind::Reshape
        | OpKind::Transpose
        | OpKind::Squeeze
        | OpKind::Unsqueeze
        | OpKind::StridedSlice
        | OpKind::Split
        | OpKind::VariadicSplit
        | OpKind::Interpolate
        | OpKind::Relu => vec![TransparentRule.into()],
        OpKind::Parameter
        | OpKind::Result
        | OpKind::Convert
        | OpKind::PRelu
        | OpKind::Mvn
        | OpKind::NormalizeL2
        | OpKind::Clamp => vec![],
    }
}

/// Cleanup stages, each run as a single sweep in this order.
pub fn cleanup_stages() -> Vec<Rule> {
    vec![
        FoldConvert.into(),
        FuseSubtractToFakeQuantize.into(),
        FuseMultiplyToFakeQuantize.into(),
    ]
}

/// Element type `node` outputs once it reads `data` directly.
fn output_type(data_type: ElementType, update_precision: bool) -> ElementType {
    if update_precision {
        data_type
    } else {
        ElementType::F32
    }
}

/// Rewires input 0 of `node` onto the quantized data of `deq`, so `node` works on the low
/// precision tensor, and rebuilds the dequantization after each of its outputs.
pub(crate) fn move_dequantization_after(
    graph: &mut Graph,
    node: NodeId,
    deq: &FakeQuantizeDequantization,
    params: &DequantizationParams,
    update_precision: bool,
) -> Result<(), LptError> {
    let data_type = graph.port(deq.data)?.element_type;
    let out_type = output_type(data_type, update_precision);
    let name = graph.try_node(node)?.name().to_string();
    let outputs = graph.try_node(node)?.num_outputs();
    let inputs = graph.try_node(node)?.inputs().len();

    graph.set_input(node, 0, deq.data)?;
    if out_type != data_type {
        graph.set_relaxed(node, TypeRelaxed::float(inputs, outputs))?;
    }
    for index in 0..outputs {
        let output = Edge::new(node, index);
        let consumers = graph.consumers(output).to_vec();
        graph.set_output_type(output, out_type)?;
        if consumers.is_empty() {
            continue;
        }
        FakeQuantizeDequantization::insert(graph, output, &consumers, params, &name)?;
    }
    graph.remove_dead_from(deq.output().node())?;
    debug!("dequantization moved after {}", name);
    Ok(())
}
