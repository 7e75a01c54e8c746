//! The pass manager: markup, main rules until a fixed point, then cleanup.

use std::collections::{HashSet, VecDeque};

use anyhow::{Context as _, Result};
use itertools::Itertools;
use tracing::{debug, info, trace, warn};

use crate::{
    LowPrecisionConfig, LptError,
    attributes::AlignmentConflict,
    graph::{Graph, NodeId, OpKind},
    markup::default_markup,
    quantization::QuantizationDetails,
    rules::{Rule, Transformation, TransformationContext, cleanup_stages, rules_for},
};

#[derive(derive_more::Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    MarkupRunning,
    RuleMatching,
    CleanupRunning,
    Done,
}

/// What a run did to the graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    /// Rule sweeps performed, including the final one without rewrites.
    pub sweeps: usize,
    pub rewrites: usize,
    /// False when the sweep bound stopped the rule matching.
    pub converged: bool,
    pub cleanup_rewrites: usize,
    pub alignment_conflicts: Vec<AlignmentConflict>,
    /// Quantization channels whose interval was empty.
    pub degenerate_intervals: usize,
}

pub struct LowPrecisionTransformer {
    config: LowPrecisionConfig,
    state: PipelineState,
}

impl LowPrecisionTransformer {
    pub fn new(config: LowPrecisionConfig) -> Self {
        Self {
            config,
            state: PipelineState::Idle,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn enter(&mut self, state: PipelineState) {
        debug!("pipeline {} -> {}", self.state, state);
        self.state = state;
    }

    /// Transforms `graph` in place.
    pub fn run(&mut self, graph: &mut Graph) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();

        self.enter(PipelineState::MarkupRunning);
        let passes = default_markup(self.config.restrictions.clone());
        info!(
            "markup: {}",
            passes.iter().map(|pass| pass.name()).join(", ")
        );
        for pass in &passes {
            pass.run(graph)
                .with_context(|| format!("markup pass {} failed", pass.name()))?;
        }
        report.alignment_conflicts = graph.attributes().conflicts().to_vec();

        self.enter(PipelineState::RuleMatching);
        let mut ctx = TransformationContext::new(self.config.params.clone());
        let max_sweeps = self.config.params.max_sweeps;
        loop {
            report.sweeps += 1;
            let rewrites = sweep(&mut ctx, graph, rules_for)
                .with_context(|| format!("rule sweep {} failed", report.sweeps))?;
            debug!("sweep {}: {} rewrites", report.sweeps, rewrites);
            report.rewrites += rewrites;
            if rewrites == 0 {
                report.converged = true;
                break;
            }
            if report.sweeps >= max_sweeps {
                warn!(
                    "rule matching stopped after {} sweeps without reaching a fixed point",
                    max_sweeps
                );
                break;
            }
        }
        info!(
            "rule matching: {} rewrites in {} sweeps",
            report.rewrites, report.sweeps
        );

        self.enter(PipelineState::CleanupRunning);
        for stage in cleanup_stages() {
            let kinds = stage.pattern().kinds().to_vec();
            let rewrites = sweep(&mut ctx, graph, |kind| {
                if kinds.contains(&kind) {
                    vec![stage.clone()]
                } else {
                    vec![]
                }
            })
            .with_context(|| format!("cleanup {} failed", stage.name()))?;
            trace!("cleanup {}: {} rewrites", stage.name(), rewrites);
            report.cleanup_rewrites += rewrites;
        }

        report.degenerate_intervals = ctx.degenerate_intervals;
        self.enter(PipelineState::Done);
        info!(
            "low precision pipeline done: {} rewrites, {} cleanup rewrites, {} conflicts",
            report.rewrites,
            report.cleanup_rewrites,
            report.alignment_conflicts.len()
        );
        Ok(report)
    }
}

/// One pass over the nodes in topological order. Nodes added during the sweep wait for the next
/// one, removed nodes are skipped. Returns the number of rewrites.
fn sweep(
    ctx: &mut TransformationContext,
    graph: &mut Graph,
    rules: impl Fn(OpKind) -> Vec<Rule>,
) -> Result<usize, LptError> {
    let mut rewrites = 0;
    for node in graph.topological_order()? {
        let Some(kind) = graph.kind(node) else {
            continue;
        };
        for rule in rules(kind) {
            if apply_rule(&rule, ctx, graph, node)? {
                rewrites += 1;
                break;
            }
        }
    }
    Ok(rewrites)
}

fn apply_rule(
    rule: &Rule,
    ctx: &mut TransformationContext,
    graph: &mut Graph,
    node: NodeId,
) -> Result<bool, LptError> {
    let Some(m) = rule.pattern().matches(graph, node) else {
        return Ok(false);
    };
    if !rule.can_apply(ctx, graph, &m) {
        return Ok(false);
    }
    match rule.apply(ctx, graph, &m) {
        Ok(applied) => Ok(applied),
        Err(err) if !err.is_fatal() => {
            trace!("{} skipped node {}: {}", rule.name(), node, err);
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// Whether any fake-quantize the pipeline could decompose feeds a result.
pub fn is_graph_quantized(graph: &Graph) -> bool {
    let mut queue = graph.results().into_iter().collect::<VecDeque<_>>();
    let mut seen = queue.iter().copied().collect::<HashSet<_>>();
    while let Some(node) = queue.pop_front() {
        let Some(n) = graph.node(node) else {
            continue;
        };
        if n.kind() == OpKind::FakeQuantize {
            let supported = QuantizationDetails::from_fake_quantize(graph, node)
                .is_ok_and(|details| details.has_supported_layout(graph, node));
            if supported {
                return true;
            }
        }
        for input in n.inputs() {
            if seen.insert(input.node()) {
                queue.push_back(input.node());
            }
        }
    }
    false
}
