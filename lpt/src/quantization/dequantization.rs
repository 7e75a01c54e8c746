use itertools::Itertools;

use crate::{
    LptError,
    graph::{Edge, ElementType, Graph, NodeId, Op, OpKind, Port},
    tensor::Tensor,
};

/// Constant payload behind `output`, looking through a `Convert` of a constant.
pub fn constant_value(graph: &Graph, output: Edge) -> Option<Tensor> {
    if let Some(value) = graph.constant(output) {
        return Some(value.clone());
    }
    let node = graph.node(output.node())?;
    match node.op() {
        Op::Convert { .. } => node.input(0).and_then(|e| graph.constant(e)).cloned(),
        _ => None,
    }
}

/// Scale and zero point of a dequantization, as constants.
#[derive(Debug, Clone, PartialEq)]
pub struct DequantizationParams {
    pub scale: Tensor,
    pub zero_point: Option<Tensor>,
}

impl DequantizationParams {
    /// Builds per-channel params laid out for data of `rank` dimensions; the zero point is dropped
    /// when every channel has a zero point of 0.
    pub fn from_channels(scales: Vec<f32>, zero_points: Vec<f32>, rank: usize) -> Self {
        let zero_point = zero_points
            .iter()
            .any(|zp| *zp != 0.0)
            .then(|| Tensor::per_channel(zero_points, rank).to_scalar_if_possible());
        Self {
            scale: Tensor::per_channel(scales, rank).to_scalar_if_possible(),
            zero_point,
        }
    }

    pub fn is_uniform(&self) -> bool {
        self.scale.is_uniform() && self.zero_point.as_ref().map_or(true, |zp| zp.is_uniform())
    }

    pub fn to_scalar(&self) -> Self {
        Self {
            scale: self.scale.to_scalar_if_possible(),
            zero_point: self.zero_point.as_ref().map(|zp| zp.to_scalar_if_possible()),
        }
    }

    /// Scale and zero point values over `channels` entries.
    pub fn channel_values(&self, channels: usize) -> Option<(Vec<f32>, Vec<f32>)> {
        let scales = self.scale.channel_values(channels)?;
        let zero_points = match &self.zero_point {
            Some(zp) => zp.channel_values(channels)?,
            None => vec![0.0; channels],
        };
        Some((scales, zero_points))
    }
}

/// The `Convert -> Subtract -> Multiply` chain reconstructing real values from quantized ones.
/// Each step is optional.
#[derive(Debug, Clone, PartialEq)]
pub struct FakeQuantizeDequantization {
    /// The quantized value entering the chain.
    pub data: Edge,
    pub convert: Option<NodeId>,
    pub subtract: Option<NodeId>,
    pub subtract_constant: Option<Tensor>,
    pub multiply: Option<NodeId>,
    pub multiply_constant: Option<Tensor>,
}

impl FakeQuantizeDequantization {
    /// Dequantization feeding input `index` of `node`.
    pub fn from_input(graph: &Graph, node: NodeId, index: usize) -> Option<Self> {
        graph
            .input(node, index)
            .and_then(|edge| Self::from_output(graph, edge))
    }

    /// Dequantization ending at `output`. A chain whose `Convert` was fused into the arithmetic
    /// (the arithmetic reads the integer tensor directly) is recognised as well.
    pub fn from_output(graph: &Graph, output: Edge) -> Option<Self> {
        let mut current = output;
        let mut multiply = None;
        let mut multiply_constant = None;
        let mut subtract = None;
        let mut subtract_constant = None;
        let mut convert = None;

        if graph.kind(current.node()) == Some(OpKind::Multiply) {
            let node = graph.node(current.node())?;
            let (a, b) = (node.input(0)?, node.input(1)?);
            // scales are plain constants, the data side may be a converted constant (weights)
            let found = match (graph.constant(b), graph.constant(a)) {
                (Some(scale), _) => Some((scale.clone(), a)),
                (None, Some(scale)) => Some((scale.clone(), b)),
                (None, None) => None,
            };
            if let Some((scale, data)) = found {
                multiply = Some(current.node());
                multiply_constant = Some(scale);
                current = data;
            }
        }
        if graph.kind(current.node()) == Some(OpKind::Subtract) {
            let node = graph.node(current.node())?;
            let (a, b) = (node.input(0)?, node.input(1)?);
            if let Some(zero_point) = constant_value(graph, b) {
                subtract = Some(current.node());
                subtract_constant = Some(zero_point);
                current = a;
            }
        }
        if let Some(Op::Convert { destination }) = graph.node(current.node()).map(|n| n.op()) {
            if destination.is_float() {
                convert = Some(current.node());
                current = graph.input(current.node(), 0)?;
            }
        }

        let data_type = graph.port(current).ok()?.element_type;
        let valid = match (convert, multiply.or(subtract)) {
            (None, None) => false,
            (Some(_), _) => data_type.is_low_precision(),
            (None, Some(_)) => data_type.is_low_precision() || is_quantized_domain(graph, current.node()),
        };
        valid.then_some(Self {
            data: current,
            convert,
            subtract,
            subtract_constant,
            multiply,
            multiply_constant,
        })
    }

    /// Output of the last operation of the chain.
    pub fn output(&self) -> Edge {
        self.multiply
            .or(self.subtract)
            .or(self.convert)
            .map(|node| Edge::new(node, 0))
            .unwrap_or(self.data)
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        [self.convert, self.subtract, self.multiply]
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn has_zero_point(&self) -> bool {
        self.subtract_constant
            .as_ref()
            .is_some_and(|zp| zp.get_data().iter().any(|v| *v != 0.0))
    }

    pub fn params(&self) -> DequantizationParams {
        DequantizationParams {
            scale: self
                .multiply_constant
                .clone()
                .unwrap_or_else(|| Tensor::scalar(1.0)),
            zero_point: self.subtract_constant.clone(),
        }
    }

    /// Emits a dequantization of `source` after it and returns the chain. Consumers are not
    /// rewired. The zero point is stored in the source precision behind a `Convert` when its
    /// values are exact in that precision.
    pub fn build(
        graph: &mut Graph,
        source: Edge,
        params: &DequantizationParams,
        base: &str,
    ) -> Result<Self, LptError> {
        let source_port = graph.port(source)?.clone();
        let float_port = source_port.with_type(ElementType::F32);
        let mut current = source;
        let mut chain = Self {
            data: source,
            convert: None,
            subtract: None,
            subtract_constant: None,
            multiply: None,
            multiply_constant: None,
        };

        if source_port.element_type != ElementType::F32 {
            let convert = graph.add_unique_node(
                &format!("{}/DequantizationConvert", base),
                Op::Convert {
                    destination: ElementType::F32,
                },
                vec![current],
                vec![float_port.clone()],
            )?;
            chain.convert = Some(convert);
            current = Edge::new(convert, 0);
        }

        if let Some(zero_point) = &params.zero_point {
            let zero_point_output = add_zero_point(graph, zero_point, source_port.element_type, base)?;
            let subtract = graph.add_unique_node(
                &format!("{}/DequantizationSubtract", base),
                Op::Subtract,
                vec![current, zero_point_output],
                vec![float_port.clone()],
            )?;
            chain.subtract = Some(subtract);
            chain.subtract_constant = Some(zero_point.clone());
            current = Edge::new(subtract, 0);
        }

        let scale = graph.add_constant(
            &format!("{}/DequantizationScale", base),
            params.scale.clone(),
            ElementType::F32,
        )?;
        let multiply = graph.add_unique_node(
            &format!("{}/DequantizationMultiply", base),
            Op::Multiply,
            vec![current, Edge::new(scale, 0)],
            vec![float_port],
        )?;
        chain.multiply = Some(multiply);
        chain.multiply_constant = Some(params.scale.clone());
        Ok(chain)
    }

    /// Builds the dequantization of `source` and moves the given consumers onto it.
    pub fn insert(
        graph: &mut Graph,
        source: Edge,
        consumers: &[Edge],
        params: &DequantizationParams,
        base: &str,
    ) -> Result<Self, LptError> {
        let chain = Self::build(graph, source, params, base)?;
        graph.rewire(consumers, chain.output())?;
        Ok(chain)
    }
}

fn add_zero_point(
    graph: &mut Graph,
    zero_point: &Tensor,
    precision: ElementType,
    base: &str,
) -> Result<Edge, LptError> {
    let exact = precision.is_low_precision()
        && zero_point.get_data().iter().all(|v| precision.represents(*v));
    if !exact {
        let constant = graph.add_constant(
            &format!("{}/DequantizationZeroPoint", base),
            zero_point.clone(),
            ElementType::F32,
        )?;
        return Ok(Edge::new(constant, 0));
    }
    let constant = graph.add_constant(
        &format!("{}/DequantizationZeroPoint", base),
        zero_point.clone(),
        precision,
    )?;
    let convert = graph.add_unique_node(
        &format!("{}/DequantizationZeroPointConvert", base),
        Op::Convert {
            destination: ElementType::F32,
        },
        vec![Edge::new(constant, 0)],
        vec![Port::new(ElementType::F32, zero_point.get_shape().to_vec())],
    )?;
    Ok(Edge::new(convert, 0))
}

/// Float outputs still holding values of the quantized grid: an `f32` fake-quantize, or a
/// relaxed kernel that ran on low precision operands.
fn is_quantized_domain(graph: &Graph, node: NodeId) -> bool {
    match graph.node(node) {
        Some(n) => match n.kind() {
            OpKind::FakeQuantize => true,
            OpKind::MatMul | OpKind::Convolution | OpKind::GroupConvolution => n.relaxed().is_some(),
            _ => false,
        },
        None => false,
    }
}

/// Human readable form of a chain, used in debug logs.
pub(crate) fn describe(graph: &Graph, chain: &FakeQuantizeDequantization) -> String {
    chain
        .nodes()
        .iter()
        .filter_map(|id| graph.node(*id))
        .map(|n| n.name())
        .join(" -> ")
}
