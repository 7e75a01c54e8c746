use tracing::{debug, trace};

use crate::{
    LptError,
    graph::{Edge, Graph, NodeId, Op, OpKind, TypeRelaxed},
    pattern::{Constraint, Match, Pattern},
    quantization::constant_value,
};

use super::{Transformation, TransformationContext};

/// Lets an element-wise arithmetic operation read a low precision tensor directly instead of
/// going through a `Convert` to `f32`.
#[derive(Debug, Clone, Default)]
pub struct ConvertFusion;

/// Input slot of `node` fed by a `Convert` to float of a non constant low precision value, with
/// the low precision value, when exactly one slot is.
fn fusable_convert(graph: &Graph, node: NodeId) -> Option<(usize, Edge)> {
    let inputs = graph.node(node)?.inputs().to_vec();
    let mut candidates = inputs.iter().enumerate().filter_map(|(slot, input)| {
        let producer = graph.node(input.node())?;
        let Op::Convert { destination } = producer.op() else {
            return None;
        };
        let source = producer.input(0)?;
        let low_precision = graph.port(source).ok()?.element_type.is_low_precision();
        let constant = graph.kind(source.node()) == Some(OpKind::Constant);
        (destination.is_float() && low_precision && !constant).then_some((slot, source))
    });
    let first = candidates.next()?;
    candidates.next().is_none().then_some(first)
}

impl Transformation for ConvertFusion {
    fn name(&self) -> &'static str {
        "ConvertFusion"
    }

    fn pattern(&self) -> Pattern {
        Pattern::any_of(&[OpKind::Add, OpKind::Multiply, OpKind::Subtract])
            .with(Constraint::InputCount(2))
    }

    fn can_apply(&self, _ctx: &TransformationContext, graph: &Graph, m: &Match) -> bool {
        let Some((slot, source)) = fusable_convert(graph, m.node) else {
            return false;
        };
        if m.kind != OpKind::Subtract {
            return true;
        }
        // the subtracted constant has to survive in the integer domain
        let Ok(low_type) = graph.port(source).map(|p| p.element_type) else {
            return false;
        };
        let other = 1 - slot;
        let representable = graph
            .input(m.node, other)
            .and_then(|e| constant_value(graph, e))
            .is_some_and(|c| c.get_data().iter().all(|v| low_type.represents(*v)));
        if !representable {
            trace!("subtract {} keeps its convert: constant not exact", m.node);
        }
        representable
    }

    fn apply(
        &self,
        _ctx: &mut TransformationContext,
        graph: &mut Graph,
        m: &Match,
    ) -> Result<bool, LptError> {
        let Some((slot, source)) = fusable_convert(graph, m.node) else {
            return Ok(false);
        };
        let node = graph.try_node(m.node)?;
        let name = node.name().to_string();
        let op = node.op().clone();
        let mut inputs = node.inputs().to_vec();
        let outputs = (0..node.num_outputs())
            .filter_map(|i| node.output(i).cloned())
            .collect::<Vec<_>>();
        inputs[slot] = source;
        let fused = graph.add_unique_node(&format!("{}/Fused", name), op, inputs, outputs)?;
        graph.set_relaxed(fused, TypeRelaxed::float(2, 1))?;
        graph.replace_node(m.node, fused)?;
        debug!("convert fused into {}", name);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ElementType, LptParams, quantization::FakeQuantizeDequantization, testing::*};

    fn run(graph: &mut Graph, node: NodeId) -> bool {
        let mut ctx = TransformationContext::new(LptParams::default());
        let Some(m) = ConvertFusion.pattern().matches(graph, node) else {
            return false;
        };
        ConvertFusion.can_apply(&ctx, graph, &m) && ConvertFusion.apply(&mut ctx, graph, &m).unwrap()
    }

    #[test]
    fn test_convert_fused_into_multiply() {
        let mut graph = Graph::new();
        let input = typed_parameter(&mut graph, "input", ElementType::U8, vec![1, 3]);
        let converted = convert(&mut graph, "convert", input, ElementType::F32);
        let scale = constant(&mut graph, "scale", vec![], vec![0.1]);
        let mul = binary(&mut graph, "mul", Op::Multiply, converted, scale);
        let out = result(&mut graph, "out", mul);

        assert!(run(&mut graph, mul.node));
        let fused = graph.producer(out, 0).unwrap();
        assert_eq!(graph.try_node(fused).unwrap().name(), "mul");
        assert!(graph.try_node(fused).unwrap().relaxed().is_some());
        assert_eq!(graph.input(fused, 0), Some(input));
        assert!(graph.node(converted.node).is_none());

        let chain = FakeQuantizeDequantization::from_input(&graph, out, 0).unwrap();
        assert_eq!(chain.data, input);
    }

    #[test]
    fn test_subtract_needs_an_exact_constant() {
        let mut graph = Graph::new();
        let input = typed_parameter(&mut graph, "input", ElementType::U8, vec![1, 3]);
        let converted = convert(&mut graph, "convert", input, ElementType::F32);
        let shift = constant(&mut graph, "shift", vec![], vec![127.5]);
        let sub = binary(&mut graph, "sub", Op::Subtract, converted, shift);
        result(&mut graph, "out", sub);
        assert!(!run(&mut graph, sub.node));

        let exact = constant(&mut graph, "exact", vec![], vec![128.0]);
        graph.set_input(sub.node, 1, exact).unwrap();
        assert!(run(&mut graph, sub.node));
    }

    #[test]
    fn test_two_converted_operands_are_left_alone() {
        let mut graph = Graph::new();
        let a = typed_parameter(&mut graph, "a", ElementType::U8, vec![1, 3]);
        let b = typed_parameter(&mut graph, "b", ElementType::I8, vec![1, 3]);
        let ca = convert(&mut graph, "ca", a, ElementType::F32);
        let cb = convert(&mut graph, "cb", b, ElementType::F32);
        let add = binary(&mut graph, "add", Op::Add, ca, cb);
        result(&mut graph, "out", add);
        assert!(!run(&mut graph, add.node));
    }
}
