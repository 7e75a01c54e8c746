//! Module that takes care of the quantization arithmetic: interval to scale / zero point,
//! fake-quantize evaluation and constant sanitization.
mod dequantization;
mod details;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub use dequantization::{DequantizationParams, FakeQuantizeDequantization, constant_value};
pub use details::{DataPrecision, QuantizationDetails};

/// Level counts a fake-quantize may use to be decomposed.
pub const SUPPORTED_LEVELS: [usize; 2] = [255, 256];
/// Magnitudes below this are denormal noise.
pub const DENORMAL_THRESHOLD: f64 = 1e-32;
/// Magnitudes above this are replaced by [`OVERFLOW_SENTINEL`].
pub const OVERFLOW_THRESHOLD: f64 = 1e32;
pub const OVERFLOW_SENTINEL: f32 = 999.0;

pub fn is_supported_levels(levels: usize) -> bool {
    SUPPORTED_LEVELS.contains(&levels)
}

/// Affine mapping between a real interval and a quantized one.
///
/// real = (q - zero_point) * scale
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleZeroPoint {
    pub scale: f32,
    pub zero_point: f32,
    /// The real interval was empty and `scale` was forced to 1.
    pub degenerate: bool,
}

impl ScaleZeroPoint {
    /// Derives the scale and zero point mapping `[min, max]` onto `[q_min, q_max]`.
    ///
    /// scale = (max - min) / (q_max - q_min)
    /// zero_point = clamp(round(q_min - min / scale), q_min, q_max)
    ///
    /// Rounding is half away from zero. An empty interval (`max == min`) has no meaningful scale:
    /// it is mapped with a scale of 1 and flagged `degenerate` instead of dividing by zero.
    pub fn from_interval(min: f32, max: f32, q_min: f32, q_max: f32) -> Self {
        let (min, max, q_min, q_max) = (min as f64, max as f64, q_min as f64, q_max as f64);
        let mut scale = (max - min) / (q_max - q_min);
        let degenerate = scale == 0.0 || !scale.is_finite();
        if degenerate {
            warn!(
                "degenerate quantization interval [{}, {}], falling back to unit scale",
                min, max
            );
            scale = 1.0;
        }
        let zero_point_real = q_min - min / scale;
        let zero_point = zero_point_real.round().clamp(q_min, q_max);
        Self {
            scale: scale as f32,
            zero_point: zero_point as f32,
            degenerate,
        }
    }

    pub fn quantize(&self, value: f32) -> f32 {
        (value / self.scale + self.zero_point).round()
    }

    pub fn dequantize(&self, quantized: f32) -> f32 {
        (quantized - self.zero_point) * self.scale
    }
}

/// Reference semantics of a fake-quantize node on one value.
pub fn fake_quantize(
    value: f32,
    input_low: f32,
    input_high: f32,
    output_low: f32,
    output_high: f32,
    levels: usize,
) -> f32 {
    let steps = (levels - 1) as f32;
    if value <= input_low.min(input_high) {
        return output_low;
    }
    if value > input_high.max(input_low) {
        return output_high;
    }
    let q = ((value - input_low) / (input_high - input_low) * steps).round();
    q / steps * (output_high - output_low) + output_low
}

/// Snaps denormals to zero and replaces overflowing magnitudes by the sentinel.
///
/// Returns `None` when no value needed sanitizing, so callers can skip the rewrite.
pub fn sanitize(values: &[f32]) -> Option<Vec<f32>> {
    let mut changed = false;
    let sanitized = values
        .iter()
        .map(|value| {
            let magnitude = (*value as f64).abs();
            if magnitude > 0.0 && magnitude < DENORMAL_THRESHOLD {
                changed = true;
                0.0
            } else if magnitude > OVERFLOW_THRESHOLD {
                changed = true;
                OVERFLOW_SENTINEL
            } else {
                *value
            }
        })
        .collect();
    changed.then_some(sanitized)
}
