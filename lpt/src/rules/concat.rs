//! Concatenation of quantized branches.
//!
//! Every fake-quantize bounding the concatenation subgraph is replaced by a low precision one and
//! the dequantization is rebuilt after the subgraph, for each consumer outside of it. When the
//! branches may keep their own scale (multi-channel) the dequantization constant after the
//! concatenation holds one value per channel; otherwise every branch is mapped onto the shared
//! interval and a single scale is used.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, trace};

use crate::{
    LptError,
    attributes::PrecisionSet,
    graph::{Edge, ElementType, Graph, NodeId, Op, OpKind},
    pattern::{Match, Pattern},
    quantization::{
        DataPrecision, DequantizationParams, FakeQuantizeDequantization, QuantizationDetails,
        ScaleZeroPoint,
    },
    subgraph::{Subgraph, collect_for_concat, external_consumers, is_multi_channel},
    tensor::Tensor,
};

use super::{
    Transformation, TransformationContext,
    fake_quantize::{
        add_low_precision_fake_quantize, allowed_precisions, in_bounds_shape, quantize_bound,
    },
};

#[derive(Debug, Clone, Default)]
pub struct ConcatRule;

/// What the rule found acceptable about a concatenation subgraph, with every value the rewrite
/// needs computed up front.
#[derive(Debug, Clone)]
pub struct ConcatPlan {
    pub subgraph: Subgraph,
    pub details: Vec<QuantizationDetails>,
    pub precision: DataPrecision,
    /// Smallest output low and largest output high over the branches.
    pub interval: (f32, f32),
    /// Each branch keeps its own scale.
    pub multi_channel: bool,
    branches: Vec<Branch>,
    /// Dequantization parameters of the precision preserved layers, concatenations included.
    layers: HashMap<NodeId, ChannelParams>,
}

/// Low precision bounds of one boundary fake-quantize.
#[derive(Debug, Clone)]
struct Branch {
    low: Tensor,
    high: Tensor,
    params: ChannelParams,
    degenerate: usize,
}

/// Per-channel scale and zero point of a node output.
#[derive(Debug, Clone, PartialEq)]
struct ChannelParams {
    scales: Vec<f32>,
    zero_points: Vec<f32>,
}

impl ChannelParams {
    fn new(params: &[ScaleZeroPoint]) -> Option<Self> {
        let first = params.first()?;
        if params.iter().all(|p| p == first) {
            return Some(Self {
                scales: vec![first.scale],
                zero_points: vec![first.zero_point],
            });
        }
        Some(Self {
            scales: params.iter().map(|p| p.scale).collect(),
            zero_points: params.iter().map(|p| p.zero_point).collect(),
        })
    }

    fn is_single(&self) -> bool {
        self.scales.len() == 1
    }

    /// Values repeated over `channels` entries.
    fn expand(&self, channels: usize) -> Option<Self> {
        match self.scales.len() {
            1 => Some(Self {
                scales: vec![self.scales[0]; channels],
                zero_points: vec![self.zero_points[0]; channels],
            }),
            n if n == channels => Some(self.clone()),
            _ => None,
        }
    }
}

impl ConcatRule {
    /// Read-only check of the subgraph around `concat`.
    pub fn accepts(ctx: &TransformationContext, graph: &Graph, concat: NodeId) -> Option<ConcatPlan> {
        let subgraph = collect_for_concat(graph, concat).ok()?;
        if subgraph.is_empty() {
            return None;
        }
        let mut details = vec![];
        let mut allowed: Option<PrecisionSet> = None;
        for fq in &subgraph.quantization_layers {
            let node = graph.node(*fq)?;
            if ctx.is_handled(node.name()) || !node.output(0)?.element_type.is_float() {
                trace!("concat {}: {} is already decomposed", concat, node.name());
                return None;
            }
            let d = QuantizationDetails::from_fake_quantize(graph, *fq).ok()?;
            if !d.has_supported_layout(graph, *fq) {
                return None;
            }
            let here = allowed_precisions(graph, *fq);
            allowed = Some(match allowed {
                Some(a) => a.intersection(&here).copied().collect(),
                None => here,
            });
            details.push(d);
        }
        let levels = details.first()?.levels;
        if details.iter().any(|d| d.levels != levels) {
            trace!("concat {}: branches use different level counts", concat);
            return None;
        }
        let interval = details.iter().map(|d| d.output_interval()).fold(
            (f32::INFINITY, f32::NEG_INFINITY),
            |(low, high), (l, h)| (low.min(l), high.max(h)),
        );
        let precision =
            DataPrecision::select(&[interval.0], &[interval.1], levels, &allowed?).ok()??;
        if precision.has_zero_point && !ctx.params.support_asymmetric_quantization {
            return None;
        }

        let multi_channel = multi_channel(graph, &subgraph);
        let mut known = HashMap::new();
        let mut branches = vec![];
        for (fq, d) in subgraph.quantization_layers.iter().zip(details.iter()) {
            let shared = (!multi_channel).then(|| {
                graph
                    .attributes()
                    .intervals(*fq)
                    .map(|i| (i.min, i.max))
                    .unwrap_or(interval)
            });
            let branch = plan_branch(d, shared, &precision)?;
            known.insert(*fq, branch.params.clone());
            branches.push(branch);
        }
        let mut layers = HashMap::new();
        for layer in &subgraph.layers {
            let Some(params) = params_of(graph, *layer, &known) else {
                trace!("concat {}: no dequantization parameters through {}", concat, layer);
                return None;
            };
            layers.insert(*layer, params);
        }
        Some(ConcatPlan {
            subgraph,
            details,
            precision,
            interval,
            multi_channel,
            branches,
            layers,
        })
    }
}

fn multi_channel(graph: &Graph, subgraph: &Subgraph) -> bool {
    is_multi_channel(graph, subgraph)
        && subgraph.concats.iter().all(|concat| {
            let axis_one = matches!(graph.node(*concat).map(|n| n.op()), Some(Op::Concat { axis: 1 }));
            let rank = graph
                .port(Edge::new(*concat, 0))
                .ok()
                .and_then(|p| p.rank())
                .unwrap_or(0);
            axis_one && rank >= 4
        })
}

/// Maps the output bounds of a branch on its own per-channel grid, or on the `shared` interval.
fn plan_branch(
    details: &QuantizationDetails,
    shared: Option<(f32, f32)>,
    precision: &DataPrecision,
) -> Option<Branch> {
    let (low, high) = details.output_bounds();
    let params = match shared {
        Some((min, max)) => vec![
            ScaleZeroPoint::from_interval(min, max, precision.min, precision.max);
            low.len()
        ],
        None => low
            .iter()
            .zip(high.iter())
            .map(|(l, h)| ScaleZeroPoint::from_interval(*l, *h, precision.min, precision.max))
            .collect(),
    };
    let degenerate = match shared {
        Some(_) => usize::from(params.first()?.degenerate),
        None => params.iter().filter(|p| p.degenerate).count(),
    };
    let quantized = |bounds: &[f32]| -> Vec<f32> {
        bounds
            .iter()
            .zip(params.iter())
            .map(|(v, p)| quantize_bound(*v, p, precision))
            .collect()
    };
    let shape = details.bounds_shape().to_vec();
    Some(Branch {
        low: in_bounds_shape(&shape, quantized(&low)).ok()?,
        high: in_bounds_shape(&shape, quantized(&high)).ok()?,
        params: ChannelParams::new(&params)?,
        degenerate,
    })
}

/// Dequantization parameters of `node`, derived from the boundary fake-quantize nodes through
/// the precision preserved layers.
fn params_of(
    graph: &Graph,
    node: NodeId,
    known: &HashMap<NodeId, ChannelParams>,
) -> Option<ChannelParams> {
    if let Some(params) = known.get(&node) {
        return Some(params.clone());
    }
    let n = graph.node(node)?;
    match n.op() {
        Op::Concat { axis } => {
            let inputs = n
                .inputs()
                .iter()
                .map(|e| params_of(graph, e.node(), known).map(|p| (*e, p)))
                .collect::<Option<Vec<_>>>()?;
            let first = &inputs.first()?.1;
            if inputs.iter().all(|(_, p)| p.is_single() && p == first) {
                return Some(first.clone());
            }
            // distinct branches only concatenate along the channel axis
            if *axis != 1 {
                return None;
            }
            let mut scales = vec![];
            let mut zero_points = vec![];
            for (edge, params) in inputs {
                let channels = *graph.port(edge).ok()?.static_shape()?.get(1)?;
                let expanded = params.expand(channels)?;
                scales.extend(expanded.scales);
                zero_points.extend(expanded.zero_points);
            }
            Some(ChannelParams {
                scales,
                zero_points,
            })
        }
        _ => params_of(graph, n.input(0)?.node(), known),
    }
}

impl Transformation for ConcatRule {
    fn name(&self) -> &'static str {
        "Concat"
    }

    fn pattern(&self) -> Pattern {
        Pattern::any_of(&[OpKind::Concat])
    }

    fn can_apply(&self, ctx: &TransformationContext, graph: &Graph, m: &Match) -> bool {
        Self::accepts(ctx, graph, m.node).is_some()
    }

    fn apply(
        &self,
        ctx: &mut TransformationContext,
        graph: &mut Graph,
        m: &Match,
    ) -> Result<bool, LptError> {
        let Some(plan) = Self::accepts(ctx, graph, m.node) else {
            return Ok(false);
        };
        let element_type = if ctx.params.update_precisions {
            plan.precision.precision
        } else {
            ElementType::F32
        };

        let mut known = plan.layers;
        let mut names = vec![];
        for (fq, branch) in plan.subgraph.quantization_layers.iter().zip(plan.branches) {
            let name = graph.try_node(*fq)?.name().to_string();
            let new = add_low_precision_fake_quantize(graph, *fq, branch.low, branch.high, element_type)?;
            graph.replace_node(*fq, new)?;
            ctx.degenerate_intervals += branch.degenerate;
            known.insert(new, branch.params);
            names.push(name);
        }

        let order = graph
            .topological_order()?
            .into_iter()
            .filter(|id| known.contains_key(id))
            .collect::<Vec<_>>();
        for layer in &order {
            if plan.subgraph.layers.contains(layer) {
                for index in 0..graph.try_node(*layer)?.num_outputs() {
                    graph.set_output_type(Edge::new(*layer, index), element_type)?;
                }
            }
        }

        let inside = Subgraph {
            concats: plan.subgraph.concats.clone(),
            layers: known.keys().copied().collect::<BTreeSet<_>>(),
            quantization_layers: vec![],
        };
        for layer in order {
            let params = &known[&layer];
            for index in 0..graph.try_node(layer)?.num_outputs() {
                let output = Edge::new(layer, index);
                let consumers = external_consumers(graph, &inside, output);
                if consumers.is_empty() {
                    continue;
                }
                let rank = graph.port(output)?.rank().unwrap_or(0);
                let deq = DequantizationParams::from_channels(
                    params.scales.clone(),
                    params.zero_points.clone(),
                    rank,
                );
                let name = graph.try_node(layer)?.name().to_string();
                FakeQuantizeDequantization::insert(graph, output, &consumers, &deq, &name)?;
            }
        }

        for name in &names {
            ctx.mark_handled(name);
        }
        debug!(
            "concat {} rewritten over {} fake-quantize nodes ({})",
            m.node,
            names.len(),
            if plan.multi_channel { "multi-channel" } else { "single interval" }
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        LowPrecisionConfig, LowPrecisionTransformer, LptParams, Port,
        markup::{AlignQuantizationIntervals, MarkupPass},
        testing::*,
    };

    fn run(ctx: &mut TransformationContext, graph: &mut Graph, concat: NodeId) -> bool {
        let m = ConcatRule.pattern().matches(graph, concat).unwrap();
        ConcatRule.can_apply(ctx, graph, &m) && ConcatRule.apply(ctx, graph, &m).unwrap()
    }

    fn output_bounds(graph: &Graph, name: &str) -> (f32, f32) {
        let fq = graph.node_by_name(name).unwrap();
        let details = QuantizationDetails::from_fake_quantize(graph, fq).unwrap();
        (details.output_low.get_data()[0], details.output_high.get_data()[0])
    }

    #[test]
    fn test_single_interval_maps_every_branch_on_one_scale() {
        init_logging();
        let mut graph = Graph::new();
        let bounds = [(-1.28, 1.27), (-0.64, 0.64), (-0.43, 0.42)];
        let branches = bounds
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let input = parameter(&mut graph, &format!("in{}", i), vec![1, 3, 4, 4]);
                fake_quantize(&mut graph, &format!("fq{}", i), input, 256, *b, *b)
            })
            .collect::<Vec<_>>();
        let concat = concat(&mut graph, "concat", &branches, 2);
        let out = result(&mut graph, "out", concat);
        AlignQuantizationIntervals.run(&mut graph).unwrap();

        let mut ctx = TransformationContext::new(LptParams::default());
        assert!(run(&mut ctx, &mut graph, concat.node));

        assert_eq!(output_bounds(&graph, "fq0"), (-128.0, 127.0));
        assert_eq!(output_bounds(&graph, "fq1"), (-64.0, 64.0));
        assert_eq!(output_bounds(&graph, "fq2"), (-43.0, 42.0));
        assert_eq!(graph.port(concat).unwrap().element_type, ElementType::I8);
        let chain = FakeQuantizeDequantization::from_input(&graph, out, 0).unwrap();
        assert_eq!(chain.data, concat);
        let scale = chain.multiply_constant.unwrap();
        assert_eq!(scale.rank(), 0);
        assert!((scale.get_data()[0] - 0.01).abs() < 1e-6);
        assert!(ctx.is_handled("fq1"));
        // nothing left to do
        assert!(!run(&mut ctx, &mut graph, concat.node));
    }

    #[test]
    fn test_multi_channel_keeps_a_scale_per_branch() {
        let mut graph = Graph::new();
        let a = parameter(&mut graph, "a", vec![1, 2, 4, 4]);
        let b = parameter(&mut graph, "b", vec![1, 1, 4, 4]);
        let fq_a = fake_quantize(&mut graph, "fq_a", a, 256, (0.0, 2.55), (0.0, 2.55));
        let fq_b = fake_quantize(&mut graph, "fq_b", b, 256, (0.0, 1.275), (0.0, 1.275));
        let concat = concat(&mut graph, "concat", &[fq_a, fq_b], 1);
        let out = result(&mut graph, "out", concat);

        let mut ctx = TransformationContext::new(LptParams::default());
        assert!(run(&mut ctx, &mut graph, concat.node));

        assert_eq!(output_bounds(&graph, "fq_a"), (0.0, 255.0));
        assert_eq!(output_bounds(&graph, "fq_b"), (0.0, 255.0));
        let chain = FakeQuantizeDequantization::from_input(&graph, out, 0).unwrap();
        assert!(!chain.has_zero_point());
        let scale = chain.multiply_constant.unwrap();
        assert_eq!(scale.get_shape(), &[1, 3, 1, 1]);
        let expected = [0.01, 0.01, 0.005];
        for (got, want) in scale.get_data().iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{} vs {}", got, want);
        }
    }

    #[test]
    fn test_external_consumer_of_a_branch_gets_its_own_dequantization() {
        let mut graph = Graph::new();
        let a = parameter(&mut graph, "a", vec![1, 2, 4, 4]);
        let b = parameter(&mut graph, "b", vec![1, 2, 4, 4]);
        let fq_a = fake_quantize(&mut graph, "fq_a", a, 256, (0.0, 2.55), (0.0, 2.55));
        let fq_b = fake_quantize(&mut graph, "fq_b", b, 256, (0.0, 1.275), (0.0, 1.275));
        let concat = concat(&mut graph, "concat", &[fq_a, fq_b], 1);
        result(&mut graph, "out", concat);
        let side = result(&mut graph, "side", fq_b);

        let mut ctx = TransformationContext::new(LptParams::default());
        assert!(run(&mut ctx, &mut graph, concat.node));
        let chain = FakeQuantizeDequantization::from_input(&graph, side, 0).unwrap();
        assert_eq!(graph.try_node(chain.data.node()).unwrap().name(), "fq_b");
        let scale = chain.multiply_constant.unwrap();
        assert_eq!(scale.rank(), 0);
        assert!((scale.get_data()[0] - 0.005).abs() < 1e-7);
    }

    #[test]
    fn test_branch_levels_must_match() {
        let mut graph = Graph::new();
        let a = parameter(&mut graph, "a", vec![1, 2, 4, 4]);
        let b = parameter(&mut graph, "b", vec![1, 2, 4, 4]);
        let fq_a = fake_quantize(&mut graph, "fq_a", a, 256, (0.0, 2.55), (0.0, 2.55));
        let fq_b = fake_quantize(&mut graph, "fq_b", b, 255, (0.0, 2.54), (0.0, 2.54));
        let concat = concat(&mut graph, "concat", &[fq_a, fq_b], 1);
        result(&mut graph, "out", concat);

        let ctx = TransformationContext::new(LptParams::default());
        assert!(ConcatRule::accepts(&ctx, &graph, concat.node).is_none());
    }

    /// Multi-channel branches whose channel count is unknown cannot be laid out after the
    /// concatenation.
    fn dynamic_branch_concat() -> (Graph, NodeId, Edge) {
        let mut graph = Graph::new();
        let a = parameter(&mut graph, "a", vec![1, 3, 4, 4]);
        let b = dynamic_parameter(&mut graph, "b");
        let fq_a = fake_quantize(&mut graph, "fq_a", a, 256, (0.0, 2.55), (0.0, 2.55));
        let fq_b = fake_quantize(&mut graph, "fq_b", b, 256, (0.0, 1.0), (0.0, 1.0));
        let concat = graph
            .add_node(
                "concat",
                Op::Concat { axis: 1 },
                vec![fq_a, fq_b],
                vec![Port::new(ElementType::F32, vec![1, 4, 4, 4])],
            )
            .unwrap();
        result(&mut graph, "out", Edge::new(concat, 0));
        (graph, concat, fq_a)
    }

    #[test]
    fn test_unknown_branch_channels_leave_the_graph_untouched() {
        init_logging();
        let (mut graph, concat, fq_a) = dynamic_branch_concat();
        let nodes = graph.len();

        let mut ctx = TransformationContext::new(LptParams::default());
        assert!(ConcatRule::accepts(&ctx, &graph, concat).is_none());
        assert!(!run(&mut ctx, &mut graph, concat));
        assert_eq!(graph.len(), nodes);
        assert_eq!(graph.port(fq_a).unwrap().element_type, ElementType::F32);
        assert_eq!(ctx.degenerate_intervals, 0);
    }

    #[test]
    fn test_unknown_branch_channels_fall_back_to_per_branch_decomposition() {
        init_logging();
        let (mut graph, concat, _) = dynamic_branch_concat();
        let report = LowPrecisionTransformer::new(LowPrecisionConfig::default())
            .run(&mut graph)
            .unwrap();
        assert!(report.converged);
        for input in graph.try_node(concat).unwrap().inputs() {
            assert_eq!(graph.port(*input).unwrap().element_type, ElementType::F32);
        }
    }
}
