use tracing::{debug, trace};

use crate::{
    LptError,
    graph::{Edge, ElementType, Graph, OpKind, TypeRelaxed},
    pattern::{Match, Pattern},
    quantization::{DequantizationParams, FakeQuantizeDequantization},
    tensor::Tensor,
};

use super::{Transformation, TransformationContext};

/// Runs a (group) convolution on quantized activations and weights. The activation scale must be
/// per-tensor, the weight scale per output channel at most, and neither side may carry a zero
/// point.
#[derive(Debug, Clone, Default)]
pub struct ConvolutionRule;

struct Plan {
    activations: FakeQuantizeDequantization,
    weights: FakeQuantizeDequantization,
    scale: Tensor,
}

fn plan(graph: &Graph, m: &Match) -> Option<Plan> {
    let output = graph.port(Edge::new(m.node, 0)).ok()?;
    let rank = output.rank()?;
    let channels = *output.static_shape()?.get(1)?;

    let activations = FakeQuantizeDequantization::from_input(graph, m.node, 0)?;
    let activation_scale = activations.multiply_constant.as_ref()?;
    if activations.has_zero_point() || !activation_scale.is_uniform() {
        trace!("convolution {}: activations need a per-tensor scale", m.node);
        return None;
    }

    let weights = FakeQuantizeDequantization::from_input(graph, m.node, 1)?;
    if graph.kind(weights.data.node()) != Some(OpKind::Constant) || weights.has_zero_point() {
        trace!("convolution {}: weights are not folded constants", m.node);
        return None;
    }
    let weight_scale = weights.multiply_constant.as_ref()?.channel_values(channels)?;
    let factor = activation_scale.get_data()[0];
    let scale = Tensor::per_channel(weight_scale.iter().map(|w| w * factor).collect(), rank)
        .to_scalar_if_possible();
    Some(Plan {
        activations,
        weights,
        scale,
    })
}

impl Transformation for ConvolutionRule {
    fn name(&self) -> &'static str {
        "Convolution"
    }

    fn pattern(&self) -> Pattern {
        Pattern::any_of(&[OpKind::Convolution, OpKind::GroupConvolution])
    }

    fn can_apply(&self, _ctx: &TransformationContext, graph: &Graph, m: &Match) -> bool {
        plan(graph, m).is_some()
    }

    fn apply(
        &self,
        _ctx: &mut TransformationContext,
        graph: &mut Graph,
        m: &Match,
    ) -> Result<bool, LptError> {
        let Some(plan) = plan(graph, m) else {
            return Ok(false);
        };
        let node = graph.try_node(m.node)?;
        let name = node.name().to_string();
        let op = node.op().clone();
        let port = graph.port(Edge::new(m.node, 0))?.with_type(ElementType::F32);
        let consumers = graph.consumers(Edge::new(m.node, 0)).to_vec();

        let conv = graph.add_unique_node(
            &format!("{}/LowPrecision", name),
            op,
            vec![plan.activations.data, plan.weights.data],
            vec![port],
        )?;
        graph.set_relaxed(conv, TypeRelaxed::float(2, 1))?;
        let params = DequantizationParams {
            scale: plan.scale,
            zero_point: None,
        };
        FakeQuantizeDequantization::insert(graph, Edge::new(conv, 0), &consumers, &params, &name)?;
        graph.replace_node(m.node, conv)?;
        debug!("{} {} runs on low precision operands", m.kind, name);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LptParams, NodeId, graph::Op, testing::*};

    /// u8 activations with scale `activation_scale` and zero point `zero_point`, i8 weights with
    /// a per output channel scale.
    fn conv_graph(activation_scale: Vec<f32>, zero_point: Option<f32>) -> (Graph, NodeId) {
        let mut graph = Graph::new();
        let input = typed_parameter(&mut graph, "input", ElementType::U8, vec![1, 2, 4, 4]);
        let mut data = convert(&mut graph, "convert", input, ElementType::F32);
        if let Some(zero_point) = zero_point {
            let zp = constant(&mut graph, "zp", vec![], vec![zero_point]);
            data = binary(&mut graph, "sub", Op::Subtract, data, zp);
        }
        let len = activation_scale.len();
        let shape = if len == 1 { vec![] } else { vec![1, len, 1, 1] };
        let scale = constant(&mut graph, "scale", shape, activation_scale);
        let activations = binary(&mut graph, "mul", Op::Multiply, data, scale);

        let weights = graph
            .add_constant(
                "weights",
                Tensor::new(vec![3, 2, 1, 1], vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0]).unwrap(),
                ElementType::I8,
            )
            .unwrap();
        let weights = convert(&mut graph, "w_convert", Edge::new(weights, 0), ElementType::F32);
        let w_scale = constant(&mut graph, "w_scale", vec![3, 1, 1, 1], vec![0.1, 0.2, 0.4]);
        let weights = binary(&mut graph, "w_mul", Op::Multiply, weights, w_scale);

        let conv = graph
            .add_node(
                "conv",
                Op::Convolution,
                vec![activations, weights],
                vec![crate::Port::new(ElementType::F32, vec![1, 3, 4, 4])],
            )
            .unwrap();
        let out = result(&mut graph, "out", Edge::new(conv, 0));
        (graph, out)
    }

    fn try_apply(graph: &mut Graph, out: NodeId) -> bool {
        let mut ctx = TransformationContext::new(LptParams::default());
        let conv = graph.producer(out, 0).unwrap();
        let m = ConvolutionRule.pattern().matches(graph, conv).unwrap();
        ConvolutionRule.can_apply(&ctx, graph, &m)
            && ConvolutionRule.apply(&mut ctx, graph, &m).unwrap()
    }

    #[test]
    fn test_scales_are_combined_per_output_channel() {
        let (mut graph, out) = conv_graph(vec![0.5], None);
        assert!(try_apply(&mut graph, out));

        let chain = FakeQuantizeDequantization::from_input(&graph, out, 0).unwrap();
        let conv = graph.try_node(chain.data.node()).unwrap();
        assert_eq!(conv.name(), "conv");
        assert_eq!(
            graph.port(conv.input(0).unwrap()).unwrap().element_type,
            ElementType::U8
        );
        assert_eq!(
            chain.multiply_constant.unwrap(),
            Tensor::new(vec![1, 3, 1, 1], vec![0.05, 0.1, 0.2]).unwrap()
        );
        assert!(graph.node_by_name("w_mul").is_none());
    }

    #[test]
    fn test_per_channel_activation_scale_is_rejected() {
        let (mut graph, out) = conv_graph(vec![0.5, 0.25], None);
        assert!(!try_apply(&mut graph, out));
    }

    #[test]
    fn test_activation_zero_point_is_rejected() {
        let (mut graph, out) = conv_graph(vec![0.5], Some(128.0));
        assert!(!try_apply(&mut graph, out));
    }
}
