use tracing::debug;

use crate::{
    LptError,
    graph::{Edge, Graph, OpKind},
    pattern::{Match, Pattern},
    quantization::sanitize,
    tensor::Tensor,
};

use super::{Transformation, TransformationContext};

/// Replaces denormal and overflowing values of a constant that is about to be folded into a
/// quantization boundary.
#[derive(Debug, Clone, Default)]
pub struct ConstantSanitization;

fn sanitized(graph: &Graph, m: &Match) -> Option<Tensor> {
    let feeds_boundary = m.consumers.iter().any(|c| {
        matches!(
            graph.kind(*c),
            Some(OpKind::FakeQuantize | OpKind::Subtract | OpKind::Multiply)
        )
    });
    if !feeds_boundary {
        return None;
    }
    let value = graph.constant(Edge::new(m.node, 0))?;
    let data = sanitize(value.get_data())?;
    Tensor::new(value.get_shape().to_vec(), data).ok()
}

impl Transformation for ConstantSanitization {
    fn name(&self) -> &'static str {
        "ConstantSanitization"
    }

    fn pattern(&self) -> Pattern {
        Pattern::any_of(&[OpKind::Constant])
    }

    fn can_apply(&self, _ctx: &TransformationContext, graph: &Graph, m: &Match) -> bool {
        sanitized(graph, m).is_some()
    }

    fn apply(
        &self,
        _ctx: &mut TransformationContext,
        graph: &mut Graph,
        m: &Match,
    ) -> Result<bool, LptError> {
        let Some(value) = sanitized(graph, m) else {
            return Ok(false);
        };
        let name = graph.try_node(m.node)?.name().to_string();
        let element_type = graph.port(Edge::new(m.node, 0))?.element_type;
        let constant = graph.add_constant(&format!("{}/Sanitized", name), value, element_type)?;
        graph.replace_node(m.node, constant)?;
        debug!("constant {} sanitized", name);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LptParams, graph::Op, testing::*};

    #[test]
    fn test_scale_constant_is_sanitized_once() {
        let mut graph = Graph::new();
        let input = parameter(&mut graph, "input", vec![1, 4]);
        let overflow = 1e40_f64 as f32;
        let scale = constant(&mut graph, "scale", vec![1, 4], vec![0.0, 1e-40, overflow, 5.0]);
        let mul = binary(&mut graph, "mul", Op::Multiply, input, scale);
        result(&mut graph, "out", mul);

        let mut ctx = TransformationContext::new(LptParams::default());
        let m = ConstantSanitization.pattern().matches(&graph, scale.node).unwrap();
        assert!(ConstantSanitization.can_apply(&ctx, &graph, &m));
        assert!(ConstantSanitization.apply(&mut ctx, &mut graph, &m).unwrap());

        let replaced = graph.node_by_name("scale").unwrap();
        assert_eq!(
            graph.constant(Edge::new(replaced, 0)).unwrap().get_data(),
            &[0.0, 0.0, 999.0, 5.0]
        );
        let m = ConstantSanitization.pattern().matches(&graph, replaced).unwrap();
        assert!(!ConstantSanitization.can_apply(&ctx, &graph, &m));
    }

    #[test]
    fn test_constant_outside_quantization_is_left_alone() {
        let mut graph = Graph::new();
        let input = parameter(&mut graph, "input", vec![1, 2]);
        let bias = constant(&mut graph, "bias", vec![1, 2], vec![1e-40, 1.0]);
        let add = binary(&mut graph, "add", Op::Add, input, bias);
        result(&mut graph, "out", add);

        let ctx = TransformationContext::new(LptParams::default());
        let m = ConstantSanitization.pattern().matches(&graph, bias.node).unwrap();
        assert!(!ConstantSanitization.can_apply(&ctx, &graph, &m));
    }
}
