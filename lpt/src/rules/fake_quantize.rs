use tracing::{debug, trace};

use crate::{
    LptError,
    attributes::PrecisionSet,
    graph::{Edge, ElementType, Graph, NodeId, Op, OpKind},
    pattern::{Constraint, Match, Pattern},
    quantization::{
        DataPrecision, DequantizationParams, FakeQuantizeDequantization, QuantizationDetails,
        ScaleZeroPoint, fake_quantize, is_supported_levels,
    },
    tensor::Tensor,
};

use super::{ConcatRule, Transformation, TransformationContext};

/// Splits an `f32` fake-quantize into a low precision fake-quantize followed by its
/// dequantization. A fake-quantize on constant weights is folded into a low precision constant.
#[derive(Debug, Clone, Default)]
pub struct FakeQuantizeDecomposition;

/// Precisions allowed at the output of `fq`, every 8-bit type when the markup set nothing.
pub(crate) fn allowed_precisions(graph: &Graph, fq: NodeId) -> PrecisionSet {
    graph
        .attributes()
        .precisions(Edge::new(fq, 0))
        .cloned()
        .unwrap_or_else(|| PrecisionSet::from([ElementType::U8, ElementType::I8]))
}

/// Concatenations sharing the interval group of `fq`.
fn aligned_concats(graph: &Graph, fq: NodeId) -> Vec<NodeId> {
    let store = graph.attributes();
    let Some(group) = store.intervals_group(fq) else {
        return vec![];
    };
    let root = store.intervals_root(group);
    graph
        .nodes()
        .filter(|(id, n)| {
            n.kind() == OpKind::Concat
                && store
                    .intervals_group(*id)
                    .is_some_and(|g| store.intervals_root(g) == root)
        })
        .map(|(id, _)| id)
        .collect()
}

/// Scale and zero point of each `[low[i], high[i]]` channel mapped onto `precision`.
pub(crate) fn channel_params(
    ctx: &mut TransformationContext,
    low: &[f32],
    high: &[f32],
    precision: &DataPrecision,
) -> Vec<ScaleZeroPoint> {
    low.iter()
        .zip(high.iter())
        .map(|(l, h)| {
            let params = ScaleZeroPoint::from_interval(*l, *h, precision.min, precision.max);
            if params.degenerate {
                ctx.degenerate_intervals += 1;
            }
            params
        })
        .collect()
}

/// `value` on the quantized grid of `params`, clamped to the range of `precision`.
pub(crate) fn quantize_bound(value: f32, params: &ScaleZeroPoint, precision: &DataPrecision) -> f32 {
    ((value as f64 / params.scale as f64 + params.zero_point as f64).round() as f32)
        .clamp(precision.min, precision.max)
}

/// Lays `values` out like the range constants of the fake-quantize, the layout the
/// dequantization constants share.
pub(crate) fn in_bounds_shape(shape: &[usize], values: Vec<f32>) -> Result<Tensor, LptError> {
    if values.len() == 1 {
        return Ok(Tensor::scalar(values[0]));
    }
    Ok(Tensor::new(shape.to_vec(), values)?)
}

fn dequantization_params(
    shape: &[usize],
    params: &[ScaleZeroPoint],
) -> Result<DequantizationParams, LptError> {
    let scale = in_bounds_shape(shape, params.iter().map(|p| p.scale).collect())?;
    let zero_point = if params.iter().any(|p| p.zero_point != 0.0) {
        let zero_point = params.iter().map(|p| p.zero_point).collect();
        Some(in_bounds_shape(shape, zero_point)?.to_scalar_if_possible())
    } else {
        None
    };
    Ok(DequantizationParams {
        scale: scale.to_scalar_if_possible(),
        zero_point,
    })
}

/// Adds a fake-quantize reading the data and input range of `fq` with output bounds `low` and
/// `high`.
pub(crate) fn add_low_precision_fake_quantize(
    graph: &mut Graph,
    fq: NodeId,
    low: Tensor,
    high: Tensor,
    element_type: ElementType,
) -> Result<NodeId, LptError> {
    let node = graph.try_node(fq)?;
    let name = node.name().to_string();
    let Op::FakeQuantize { levels } = node.op() else {
        return Err(LptError::NotQuantizable(fq));
    };
    let levels = *levels;
    let mut inputs = node.inputs()[..3].to_vec();
    let port = graph.port(Edge::new(fq, 0))?.with_type(element_type);
    let low = graph.add_constant(&format!("{}/OutputLow", name), low, ElementType::F32)?;
    let high = graph.add_constant(&format!("{}/OutputHigh", name), high, ElementType::F32)?;
    inputs.extend([Edge::new(low, 0), Edge::new(high, 0)]);
    Ok(graph.add_unique_node(
        &format!("{}/LowPrecision", name),
        Op::FakeQuantize { levels },
        inputs,
        vec![port],
    )?)
}

/// Decomposes `fq` and returns the dequantization now standing where its output was.
pub fn decompose_fake_quantize(
    ctx: &mut TransformationContext,
    graph: &mut Graph,
    fq: NodeId,
) -> Result<FakeQuantizeDequantization, LptError> {
    let details = QuantizationDetails::from_fake_quantize(graph, fq)?;
    let (low, high) = details.output_bounds();
    let allowed = allowed_precisions(graph, fq);
    let precision = DataPrecision::select(&low, &high, details.levels, &allowed)?
        .ok_or(LptError::NotQuantizable(fq))?;
    let params = channel_params(ctx, &low, &high, &precision);
    let shape = details.bounds_shape().to_vec();
    let deq_params = dequantization_params(&shape, &params)?;
    let element_type = if ctx.params.update_precisions {
        precision.precision
    } else {
        ElementType::F32
    };
    let name = graph.try_node(fq)?.name().to_string();
    let consumers = graph.consumers(Edge::new(fq, 0)).to_vec();
    let data = graph.input(fq, 0).ok_or(LptError::NotQuantizable(fq))?;

    let source = match graph.constant(data).cloned() {
        Some(weights) => {
            let (input_low, input_high) = (
                details.input_low.channel_values(params.len()),
                details.input_high.channel_values(params.len()),
            );
            let (Some(input_low), Some(input_high)) = (input_low, input_high) else {
                return Err(LptError::InvalidDetails(format!(
                    "input range of {} does not match its {} channels",
                    name,
                    params.len()
                )));
            };
            let per_channel = weights.len() / params.len().max(1);
            let folded = weights
                .get_data()
                .iter()
                .enumerate()
                .map(|(i, w)| {
                    let c = if params.len() == 1 { 0 } else { i / per_channel.max(1) };
                    let (Some(l), Some(h), Some(p), Some(in_low), Some(in_high)) = (
                        low.get(c),
                        high.get(c),
                        params.get(c),
                        input_low.get(c),
                        input_high.get(c),
                    ) else {
                        return Err(LptError::InvalidDetails(format!(
                            "{} has no range for channel {} of its weights",
                            name, c
                        )));
                    };
                    let out_low = quantize_bound(*l, p, &precision);
                    let out_high = quantize_bound(*h, p, &precision);
                    Ok(fake_quantize(*w, *in_low, *in_high, out_low, out_high, details.levels)
                        .round())
                })
                .collect::<Result<Vec<_>, LptError>>()?;
            let folded = Tensor::new(weights.get_shape().to_vec(), folded)?;
            let constant = graph.add_constant(&format!("{}/Folded", name), folded, element_type)?;
            debug!("weights of {} folded to {:?}", name, precision.precision);
            Edge::new(constant, 0)
        }
        None => {
            let quantized = |bounds: &[f32]| -> Vec<f32> {
                bounds
                    .iter()
                    .zip(params.iter())
                    .map(|(v, p)| quantize_bound(*v, p, &precision))
                    .collect()
            };
            let new_low = in_bounds_shape(&shape, quantized(&low))?;
            let new_high = in_bounds_shape(&shape, quantized(&high))?;
            let new = add_low_precision_fake_quantize(graph, fq, new_low, new_high, element_type)?;
            Edge::new(new, 0)
        }
    };

    let chain = FakeQuantizeDequantization::insert(graph, source, &consumers, &deq_params, &name)?;
    // the name stays on the node now producing the real values of the activation or weights
    let replacement = match (graph.kind(source.node()), chain.multiply) {
        (Some(OpKind::Constant), Some(multiply)) => multiply,
        _ => source.node(),
    };
    graph.replace_node(fq, replacement)?;
    ctx.mark_handled(&name);
    debug!(
        "{} decomposed to {:?}, scale {:?}, zero point {:?}",
        name,
        precision.precision,
        deq_params.scale.get_data(),
        deq_params.zero_point.as_ref().map(|zp| zp.get_data().to_vec())
    );
    Ok(chain)
}

impl Transformation for FakeQuantizeDecomposition {
    fn name(&self) -> &'static str {
        "FakeQuantizeDecomposition"
    }

    fn pattern(&self) -> Pattern {
        (1..5).fold(Pattern::any_of(&[OpKind::FakeQuantize]), |p, i| {
            p.with(Constraint::ConstantInput(i))
        })
    }

    fn can_apply(&self, ctx: &TransformationContext, graph: &Graph, m: &Match) -> bool {
        let Some(node) = graph.node(m.node) else {
            return false;
        };
        if ctx.is_handled(node.name()) {
            return false;
        }
        if !node.output(0).is_some_and(|p| p.element_type.is_float()) {
            return false;
        }
        let Ok(details) = QuantizationDetails::from_fake_quantize(graph, m.node) else {
            trace!("{}: unreadable quantization details", node.name());
            return false;
        };
        if !is_supported_levels(details.levels) || !details.has_supported_layout(graph, m.node) {
            return false;
        }
        let (low, high) = details.output_bounds();
        match DataPrecision::select(&low, &high, details.levels, &allowed_precisions(graph, m.node)) {
            Ok(None) => {
                trace!("{}: no precision allowed", node.name());
                return false;
            }
            Ok(Some(precision)) => {
                if precision.has_zero_point && !ctx.params.support_asymmetric_quantization {
                    trace!("{}: asymmetric quantization disabled", node.name());
                    return false;
                }
            }
            // surfaced by apply
            Err(_) => return true,
        }
        let deferred = aligned_concats(graph, m.node)
            .into_iter()
            .any(|concat| ConcatRule::accepts(ctx, graph, concat).is_some());
        if deferred {
            trace!("{}: left to its concatenation", node.name());
        }
        !deferred
    }

    fn apply(
        &self,
        ctx: &mut TransformationContext,
        graph: &mut Graph,
        m: &Match,
    ) -> Result<bool, LptError> {
        decompose_fake_quantize(ctx, graph, m.node)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        LptParams,
        attributes::{Attribute, AttributeTarget},
        quantization::fake_quantize as reference_fake_quantize,
        testing::{fake_quantize, *},
    };

    fn matched(graph: &Graph, node: NodeId) -> Match {
        FakeQuantizeDecomposition.pattern().matches(graph, node).unwrap()
    }

    #[test]
    fn test_activation_decomposition() {
        init_logging();
        let mut graph = Graph::new();
        let input = parameter(&mut graph, "input", vec![1, 3, 4, 4]);
        let fq = fake_quantize(&mut graph, "fq", input, 256, (-1.28, 1.27), (-1.28, 1.27));
        let out = result(&mut graph, "out", fq);

        let mut ctx = TransformationContext::new(LptParams::default());
        let m = matched(&graph, fq.node);
        assert!(FakeQuantizeDecomposition.can_apply(&ctx, &graph, &m));
        assert!(FakeQuantizeDecomposition.apply(&mut ctx, &mut graph, &m).unwrap());

        let low_precision = graph.node_by_name("fq").unwrap();
        assert_eq!(
            graph.port(Edge::new(low_precision, 0)).unwrap().element_type,
            ElementType::I8
        );
        let details = QuantizationDetails::from_fake_quantize(&graph, low_precision).unwrap();
        assert_eq!(details.output_low, Tensor::scalar(-128.0));
        assert_eq!(details.output_high, Tensor::scalar(127.0));

        let chain = FakeQuantizeDequantization::from_input(&graph, out, 0).unwrap();
        assert_eq!(chain.data, Edge::new(low_precision, 0));
        assert!(chain.convert.is_some());
        assert!(!chain.has_zero_point());
        let scale = chain.multiply_constant.unwrap().get_data()[0];
        assert!((scale - 0.01).abs() < 1e-6);

        // a decomposed fake-quantize is not decomposed again
        let m = matched(&graph, low_precision);
        assert!(!FakeQuantizeDecomposition.can_apply(&ctx, &graph, &m));
    }

    #[test]
    fn test_weights_are_folded() {
        let mut graph = Graph::new();
        let weights = constant(&mut graph, "weights", vec![2, 1, 1, 1], vec![0.5, -1.0]);
        let fq = fake_quantize(&mut graph, "fq_w", weights, 256, (-1.28, 1.27), (-1.28, 1.27));
        let out = result(&mut graph, "out", fq);

        let mut ctx = TransformationContext::new(LptParams::default());
        let m = matched(&graph, fq.node);
        assert!(FakeQuantizeDecomposition.can_apply(&ctx, &graph, &m));
        decompose_fake_quantize(&mut ctx, &mut graph, fq.node).unwrap();

        let chain = FakeQuantizeDequantization::from_input(&graph, out, 0).unwrap();
        let folded = graph.constant(chain.data).unwrap();
        assert_eq!(folded.get_data(), &[50.0, -100.0]);
        assert_eq!(graph.port(chain.data).unwrap().element_type, ElementType::I8);
        assert!(graph.node(weights.node).is_none());
        assert_eq!(graph.node(chain.multiply.unwrap()).unwrap().name(), "fq_w");
    }

    #[test]
    fn test_asymmetric_and_precision_guards() {
        let mut graph = Graph::new();
        let input = parameter(&mut graph, "input", vec![1, 3, 4, 4]);
        let fq = fake_quantize(&mut graph, "fq", input, 256, (-1.0, 1.55), (-1.0, 1.55));
        result(&mut graph, "out", fq);
        let m = matched(&graph, fq.node);

        let symmetric_only = TransformationContext::new(LptParams {
            support_asymmetric_quantization: false,
            ..LptParams::default()
        });
        let store = graph.attributes_mut();
        let u8_only = store.new_precisions(PrecisionSet::from([ElementType::U8]));
        store.set(
            crate::attributes::AttributeTarget::Port(fq),
            crate::attributes::Attribute::Precisions(u8_only),
        );
        // u8 for a negative interval needs a zero point
        assert!(!FakeQuantizeDecomposition.can_apply(&symmetric_only, &graph, &m));
        assert!(FakeQuantizeDecomposition.can_apply(
            &TransformationContext::new(LptParams::default()),
            &graph,
            &m
        ));

        graph.attributes_mut().restrict_precisions(u8_only, &[]);
        assert!(!FakeQuantizeDecomposition.can_apply(
            &TransformationContext::new(LptParams::default()),
            &graph,
            &m
        ));
    }

    #[test]
    fn test_float_output_kept_without_precision_update() {
        let mut graph = Graph::new();
        let input = parameter(&mut graph, "input", vec![1, 3, 4, 4]);
        let fq = fake_quantize(&mut graph, "fq", input, 256, (0.0, 2.55), (0.0, 2.55));
        let out = result(&mut graph, "out", fq);

        let mut ctx = TransformationContext::new(LptParams {
            update_precisions: false,
            ..LptParams::default()
        });
        decompose_fake_quantize(&mut ctx, &mut graph, fq.node).unwrap();
        let chain = FakeQuantizeDequantization::from_input(&graph, out, 0).unwrap();
        assert_eq!(chain.convert, None);
        assert_eq!(graph.port(chain.data).unwrap().element_type, ElementType::F32);

        let m = matched(&graph, chain.data.node());
        assert!(!FakeQuantizeDecomposition.can_apply(&ctx, &graph, &m));
    }

    /// Fake-quantize with identical input and output ranges laid out as `bounds_shape`.
    fn ranged_fake_quantize(
        graph: &mut Graph,
        name: &str,
        input: Edge,
        bounds_shape: Vec<usize>,
        lows: Vec<f32>,
        highs: Vec<f32>,
    ) -> Edge {
        let mut inputs = vec![input];
        for (suffix, values) in [
            ("input_low", &lows),
            ("input_high", &highs),
            ("output_low", &lows),
            ("output_high", &highs),
        ] {
            let bound = constant(
                graph,
                &format!("{}/{}", name, suffix),
                bounds_shape.clone(),
                values.clone(),
            );
            inputs.push(bound);
        }
        let port = graph.port(input).unwrap().with_type(ElementType::F32);
        let id = graph
            .add_node(name, Op::FakeQuantize { levels: 256 }, inputs, vec![port])
            .unwrap();
        Edge::new(id, 0)
    }

    /// Runs `values` of every channel through the original fake-quantize ranges and through the
    /// decomposed graph feeding `out`, and checks both agree within one quantization step.
    fn assert_round_trip(
        graph: &Graph,
        out: NodeId,
        lows: &[f32],
        highs: &[f32],
        values: &[f32],
    ) {
        let channels = lows.len();
        let chain = FakeQuantizeDequantization::from_input(graph, out, 0).unwrap();
        let decomposed = QuantizationDetails::from_fake_quantize(graph, chain.data.node()).unwrap();
        let per_channel = |t: &Tensor| t.channel_values(channels).unwrap();
        let (q_low, q_high) = (
            per_channel(&decomposed.output_low),
            per_channel(&decomposed.output_high),
        );
        let scales = per_channel(chain.multiply_constant.as_ref().unwrap());
        let zero_points = chain
            .subtract_constant
            .as_ref()
            .map(per_channel)
            .unwrap_or_else(|| vec![0.0; channels]);

        for c in 0..channels {
            for value in values {
                let expected = reference_fake_quantize(*value, lows[c], highs[c], lows[c], highs[c], 256);
                let q = reference_fake_quantize(*value, lows[c], highs[c], q_low[c], q_high[c], 256);
                assert!((q - q.round()).abs() < 1e-3, "{} is not on the integer grid", q);
                let got = (q - zero_points[c]) * scales[c];
                assert!(
                    (got - expected).abs() <= scales[c],
                    "channel {} value {}: {} vs {}",
                    c,
                    value,
                    got,
                    expected
                );
            }
        }
    }

    const VALUES: [f32; 8] = [-0.3, 0.0, 0.004, 0.5, 1.0, 1.234, 2.55, 3.0];

    #[test]
    fn test_decomposed_graph_reproduces_the_fake_quantize_with_a_zero_point() {
        init_logging();
        let mut graph = Graph::new();
        let input = parameter(&mut graph, "input", vec![1, 3, 4, 4]);
        let fq = fake_quantize(&mut graph, "fq", input, 256, (0.0, 2.55), (0.0, 2.55));
        let out = result(&mut graph, "out", fq);
        // unsigned is preferred for this interval, only signed is allowed
        let store = graph.attributes_mut();
        let i8_only = store.new_precisions(PrecisionSet::from([ElementType::I8]));
        store.set(AttributeTarget::Port(fq), Attribute::Precisions(i8_only));

        let mut ctx = TransformationContext::new(LptParams::default());
        let chain = decompose_fake_quantize(&mut ctx, &mut graph, fq.node).unwrap();
        assert_eq!(graph.port(chain.data).unwrap().element_type, ElementType::I8);
        assert_eq!(chain.subtract_constant, Some(Tensor::scalar(-128.0)));
        assert_round_trip(&graph, out, &[0.0], &[2.55], &VALUES);
    }

    #[test]
    fn test_decomposed_graph_reproduces_a_per_channel_fake_quantize() {
        let mut graph = Graph::new();
        let input = parameter(&mut graph, "input", vec![1, 2, 4, 4]);
        let (lows, highs) = (vec![0.0, 0.0], vec![2.55, 1.275]);
        let fq = ranged_fake_quantize(&mut graph, "fq", input, vec![1, 2, 1, 1], lows.clone(), highs.clone());
        let out = result(&mut graph, "out", fq);

        let mut ctx = TransformationContext::new(LptParams::default());
        let chain = decompose_fake_quantize(&mut ctx, &mut graph, fq.node).unwrap();
        assert_eq!(graph.port(chain.data).unwrap().element_type, ElementType::U8);
        assert!(!chain.has_zero_point());
        assert_eq!(chain.multiply_constant.as_ref().unwrap().get_shape(), &[1, 2, 1, 1]);
        assert_round_trip(&graph, out, &lows, &highs, &VALUES);
    }

    #[test]
    fn test_weight_channels_without_a_range_are_rejected() {
        let mut graph = Graph::new();
        let weights = constant(&mut graph, "weights", vec![3, 1, 1, 1], vec![0.5, -1.0, 0.25]);
        let fq = ranged_fake_quantize(
            &mut graph,
            "fq_w",
            weights,
            vec![2, 1, 1, 1],
            vec![-1.28, -0.64],
            vec![1.27, 0.635],
        );
        result(&mut graph, "out", fq);
        let nodes = graph.len();

        let mut ctx = TransformationContext::new(LptParams::default());
        let err = decompose_fake_quantize(&mut ctx, &mut graph, fq.node).unwrap_err();
        assert!(matches!(err, LptError::InvalidDetails(_)), "{}", err);
        assert_eq!(graph.len(), nodes);
    }
}
