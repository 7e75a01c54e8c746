use tracing::{debug, trace};

use crate::{
    LptError,
    graph::{Edge, ElementType, Graph, Op, OpKind, TypeRelaxed},
    pattern::{Match, Pattern},
    quantization::{DequantizationParams, FakeQuantizeDequantization},
    tensor::Tensor,
};

use super::{Transformation, TransformationContext};

/// Multiplies the quantized operands and applies the product of both scales afterwards.
#[derive(Debug, Clone, Default)]
pub struct MatMulRule;

struct Operands {
    a: FakeQuantizeDequantization,
    b: FakeQuantizeDequantization,
    scale: Tensor,
}

/// Scale of operand `a` laid out as the rows of the product: a scalar, or one value per row.
fn row_scale(scale: &Tensor, transpose: bool) -> Option<Tensor> {
    let scale = if transpose {
        scale.transpose_last_two()
    } else {
        scale.clone()
    };
    (scale.len() == 1 || scale.get_shape().last() == Some(&1)).then_some(scale)
}

/// Scale of operand `b` laid out as the columns of the product: a scalar, or one value per
/// column.
fn column_scale(scale: &Tensor, transpose: bool) -> Option<Tensor> {
    let scale = if transpose {
        scale.transpose_last_two()
    } else {
        scale.clone()
    };
    let rank = scale.rank();
    (scale.len() == 1 || rank <= 1 || scale.get_shape()[rank - 2] == 1).then_some(scale)
}

fn operands(graph: &Graph, m: &Match) -> Option<Operands> {
    let Op::MatMul {
        transpose_a,
        transpose_b,
    } = graph.node(m.node)?.op()
    else {
        return None;
    };
    let a = FakeQuantizeDequantization::from_input(graph, m.node, 0)?;
    let b = FakeQuantizeDequantization::from_input(graph, m.node, 1)?;
    if a.has_zero_point() || b.has_zero_point() {
        trace!("matmul {}: zero point on an operand", m.node);
        return None;
    }
    let scale_a = row_scale(a.multiply_constant.as_ref()?, *transpose_a)?;
    let scale_b = column_scale(b.multiply_constant.as_ref()?, *transpose_b)?;
    let scale = scale_a.broadcast_zip(&scale_b, |x, y| x * y).ok()?;
    Some(Operands {
        a,
        b,
        scale: scale.to_scalar_if_possible(),
    })
}

impl Transformation for MatMulRule {
    fn name(&self) -> &'static str {
        "MatMul"
    }

    fn pattern(&self) -> Pattern {
        Pattern::any_of(&[OpKind::MatMul])
    }

    fn can_apply(&self, _ctx: &TransformationContext, graph: &Graph, m: &Match) -> bool {
        operands(graph, m).is_some()
    }

    fn apply(
        &self,
        _ctx: &mut TransformationContext,
        graph: &mut Graph,
        m: &Match,
    ) -> Result<bool, LptError> {
        let Some(Operands { a, b, scale }) = operands(graph, m) else {
            return Ok(false);
        };
        let node = graph.try_node(m.node)?;
        let name = node.name().to_string();
        let op = node.op().clone();
        let port = graph.port(Edge::new(m.node, 0))?.with_type(ElementType::F32);
        let consumers = graph.consumers(Edge::new(m.node, 0)).to_vec();

        let product = graph.add_unique_node(
            &format!("{}/LowPrecision", name),
            op,
            vec![a.data, b.data],
            vec![port],
        )?;
        graph.set_relaxed(product, TypeRelaxed::float(2, 1))?;
        let params = DequantizationParams {
            scale,
            zero_point: None,
        };
        FakeQuantizeDequantization::insert(graph, Edge::new(product, 0), &consumers, &params, &name)?;
        graph.replace_node(m.node, product)?;
        debug!("matmul {} runs on low precision operands", name);
        Ok(true)
    }
}
