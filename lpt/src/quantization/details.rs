use crate::{
    LptError,
    attributes::PrecisionSet,
    graph::{Edge, ElementType, Graph, NodeId, Op},
    tensor::Tensor,
};

use super::{ScaleZeroPoint, is_supported_levels};

/// Levels and ranges of a fake-quantize node, read from its constant inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationDetails {
    pub levels: usize,
    pub input_low: Tensor,
    pub input_high: Tensor,
    pub output_low: Tensor,
    pub output_high: Tensor,
}

impl QuantizationDetails {
    pub fn new(
        levels: usize,
        input_low: Tensor,
        input_high: Tensor,
        output_low: Tensor,
        output_high: Tensor,
    ) -> Result<Self, LptError> {
        if input_low.len() != input_high.len() || output_low.len() != output_high.len() {
            return Err(LptError::InvalidDetails(format!(
                "input bounds have {} and {} values, output bounds {} and {}",
                input_low.len(),
                input_high.len(),
                output_low.len(),
                output_high.len()
            )));
        }
        if !is_supported_levels(levels) {
            return Err(LptError::UnsupportedLevels(levels));
        }
        Ok(Self {
            levels,
            input_low,
            input_high,
            output_low,
            output_high,
        })
    }

    pub fn from_fake_quantize(graph: &Graph, node: NodeId) -> Result<Self, LptError> {
        let n = graph.try_node(node)?;
        let Op::FakeQuantize { levels } = n.op() else {
            return Err(LptError::NotQuantizable(node));
        };
        let range = |index: usize| -> Result<Tensor, LptError> {
            n.input(index)
                .and_then(|edge| graph.constant(edge))
                .cloned()
                .ok_or(LptError::NotQuantizable(node))
        };
        Self::new(*levels, range(1)?, range(2)?, range(3)?, range(4)?)
    }

    /// Number of channels the output bounds describe.
    pub fn channels(&self) -> usize {
        self.output_low.len().max(self.output_high.len())
    }

    /// Output bounds per channel, scalars broadcast to `channels()` entries.
    pub fn output_bounds(&self) -> (Vec<f32>, Vec<f32>) {
        let channels = self.channels();
        (
            self.output_low
                .channel_values(channels)
                .unwrap_or_else(|| self.output_low.get_data().to_vec()),
            self.output_high
                .channel_values(channels)
                .unwrap_or_else(|| self.output_high.get_data().to_vec()),
        )
    }

    /// Smallest output low and largest output high over the channels.
    pub fn output_interval(&self) -> (f32, f32) {
        let low = self.output_low.min_max().map(|(min, _)| min).unwrap_or(0.0);
        let high = self.output_high.min_max().map(|(_, max)| max).unwrap_or(0.0);
        (low, high)
    }

    /// Shape the output bound constants have, reused for the dequantization constants.
    pub fn bounds_shape(&self) -> &[usize] {
        if self.output_low.len() >= self.output_high.len() {
            self.output_low.get_shape()
        } else {
            self.output_high.get_shape()
        }
    }

    /// Range constants are scalars or hold one value per channel of the data output (axis 1 for
    /// activations, axis 0 for constant weights).
    pub fn has_supported_layout(&self, graph: &Graph, node: NodeId) -> bool {
        let Ok(port) = graph.port(Edge::new(node, 0)) else {
            return false;
        };
        let Some(shape) = port.static_shape() else {
            return [&self.input_low, &self.input_high, &self.output_low, &self.output_high]
                .iter()
                .all(|t| t.len() == 1);
        };
        let weights = graph.kind_of_input(node, 0) == Some(crate::OpKind::Constant);
        let axis = if weights { 0 } else { 1 };
        let channels = shape.get(axis).copied().unwrap_or(1);
        [&self.input_low, &self.input_high, &self.output_low, &self.output_high]
            .iter()
            .all(|t| t.len() == 1 || t.len() == channels)
    }
}

/// Integer type a fake-quantize output is stored in and its representable range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPrecision {
    pub precision: ElementType,
    pub min: f32,
    pub max: f32,
    pub has_zero_point: bool,
}

impl DataPrecision {
    /// Quantized range of `precision` for a level count: 256 levels use the full type, 255 levels
    /// drop the lowest value.
    pub fn range(precision: ElementType, levels: usize) -> Result<(f32, f32), LptError> {
        match (precision, levels) {
            (ElementType::U8, 256) => Ok((0.0, 255.0)),
            (ElementType::U8, 255) => Ok((0.0, 254.0)),
            (ElementType::I8, 256) => Ok((-128.0, 127.0)),
            (ElementType::I8, 255) => Ok((-127.0, 127.0)),
            (ElementType::U8 | ElementType::I8, levels) => Err(LptError::UnsupportedLevels(levels)),
            (precision, _) => Err(LptError::UnsupportedPrecision(precision)),
        }
    }

    /// Picks the precision for per-channel bounds `low`/`high` among `allowed`: unsigned when no
    /// bound is negative, signed otherwise, falling back to the other one with a zero point when
    /// the preferred type is not allowed. `None` when nothing is allowed.
    pub fn select(
        low: &[f32],
        high: &[f32],
        levels: usize,
        allowed: &PrecisionSet,
    ) -> Result<Option<Self>, LptError> {
        if allowed.is_empty() {
            return Ok(None);
        }
        let preferred = if low.iter().all(|v| *v >= 0.0) {
            ElementType::U8
        } else {
            ElementType::I8
        };
        let precision = if allowed.contains(&preferred) {
            preferred
        } else {
            // non empty checked above
            *allowed.iter().next().unwrap_or(&preferred)
        };
        let (min, max) = Self::range(precision, levels)?;
        let has_zero_point = low.iter().zip(high.iter()).any(|(l, h)| {
            ScaleZeroPoint::from_interval(*l, *h, min, max).zero_point != 0.0
        });
        Ok(Some(Self {
            precision,
            min,
            max,
            has_zero_point,
        }))
    }
}
