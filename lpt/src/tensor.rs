//! Dense `f32` tensor used for constant payloads (quantization ranges, scales, zero points,
//! folded weights).

use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub enum TensorError {
    ParameterError(String),
    BroadcastError(String),
}

impl Display for TensorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TensorError::ParameterError(s) => {
                write!(f, "Parameters to Tensor method were incorrect: {}", s)
            }
            TensorError::BroadcastError(s) => write!(f, "Shapes cannot be broadcast: {}", s),
        }
    }
}

impl Error for TensorError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TensorParts")]
pub struct Tensor {
    /// The dimensions of the tensor, empty for a true scalar
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// Deserialized form of a [`Tensor`], checked by [`Tensor::new`].
#[derive(Deserialize)]
struct TensorParts {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl TryFrom<TensorParts> for Tensor {
    type Error = TensorError;

    fn try_from(parts: TensorParts) -> Result<Self, Self::Error> {
        Tensor::new(parts.shape, parts.data)
    }
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, TensorError> {
        let total_size = shape.iter().product::<usize>();
        if data.len() != total_size {
            return Err(TensorError::ParameterError(format!(
                "expected data length to be {}, supplied data had length: {}",
                total_size,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            shape: vec![],
            data: vec![value],
        }
    }

    /// A per-channel constant of `rank` dimensions with `values` laid along axis 1, the layout
    /// used for activation dequantization constants (`[1, C, 1, 1]` for 4D data).
    pub fn per_channel(values: Vec<f32>, rank: usize) -> Self {
        if values.len() == 1 {
            return Self::scalar(values[0]);
        }
        let mut shape = vec![1; rank.max(1)];
        let axis = if rank >= 2 { 1 } else { 0 };
        shape[axis] = values.len();
        Self {
            shape,
            data: values,
        }
    }

    pub fn get_shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn get_data(&self) -> &[f32] {
        &self.data
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when every element is bitwise-equal in value to the first one. Exact comparison,
    /// no epsilon.
    pub fn is_uniform(&self) -> bool {
        self.data.iter().all_equal()
    }

    /// Collapses a constant whose elements are all equal into a rank 0 tensor.
    pub fn to_scalar_if_possible(&self) -> Self {
        if self.rank() > 0 && !self.data.is_empty() && self.is_uniform() {
            Self::scalar(self.data[0])
        } else {
            self.clone()
        }
    }

    /// Minimum and maximum over all the elements.
    pub fn min_max(&self) -> Option<(f32, f32)> {
        self.data
            .iter()
            .copied()
            .minmax_by(|a, b| a.total_cmp(b))
            .into_option()
    }

    /// Swaps the two innermost dimensions. Tensors of rank < 2 are returned unchanged.
    pub fn transpose_last_two(&self) -> Self {
        let rank = self.rank();
        if rank < 2 {
            return self.clone();
        }
        let rows = self.shape[rank - 2];
        let cols = self.shape[rank - 1];
        let batch = self.data.len() / (rows * cols).max(1);
        let mut data = Vec::with_capacity(self.data.len());
        for b in 0..batch {
            let offset = b * rows * cols;
            for c in 0..cols {
                for r in 0..rows {
                    data.push(self.data[offset + r * cols + c]);
                }
            }
        }
        let mut shape = self.shape.clone();
        shape.swap(rank - 2, rank - 1);
        Self { shape, data }
    }

    /// Numpy style broadcasting of `self` and `other` combined element-wise with `f`.
    pub fn broadcast_zip(
        &self,
        other: &Tensor,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<Self, TensorError> {
        let shape = broadcast_shape(&self.shape, &other.shape)?;
        let lhs = self.broadcast_to(&shape)?;
        let rhs = other.broadcast_to(&shape)?;
        let data = lhs
            .data
            .iter()
            .zip(rhs.data.iter())
            .map(|(a, b)| f(*a, *b))
            .collect();
        Ok(Self { shape, data })
    }

    /// Expands `self` to `shape`, following the broadcasting rules.
    pub fn broadcast_to(&self, shape: &[usize]) -> Result<Self, TensorError> {
        if self.shape == shape {
            return Ok(self.clone());
        }
        let target = broadcast_shape(&self.shape, shape)?;
        if target != shape {
            return Err(TensorError::BroadcastError(format!(
                "{:?} does not broadcast to {:?}",
                self.shape, shape
            )));
        }
        let offset = shape.len() - self.shape.len();
        let source_strides = strides(&self.shape);
        let total = shape.iter().product::<usize>();
        let mut data = Vec::with_capacity(total);
        let mut coords = vec![0usize; shape.len()];
        for _ in 0..total {
            let index = self
                .shape
                .iter()
                .enumerate()
                .map(|(axis, dim)| {
                    let coord = if *dim == 1 { 0 } else { coords[axis + offset] };
                    coord * source_strides[axis]
                })
                .sum::<usize>();
            data.push(self.data[index]);
            for axis in (0..shape.len()).rev() {
                coords[axis] += 1;
                if coords[axis] < shape[axis] {
                    break;
                }
                coords[axis] = 0;
            }
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// Values along `channels` entries: a single value is repeated, a per-channel tensor is
    /// returned as is.
    pub fn channel_values(&self, channels: usize) -> Option<Vec<f32>> {
        match self.data.len() {
            1 => Some(vec![self.data[0]; channels]),
            n if n == channels => Some(self.data.clone()),
            _ => None,
        }
    }
}

fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

pub fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>, TensorError> {
    let rank = lhs.len().max(rhs.len());
    let dim = |shape: &[usize], axis: usize| -> usize {
        let offset = rank - shape.len();
        if axis < offset { 1 } else { shape[axis - offset] }
    };
    (0..rank)
        .map(|axis| match (dim(lhs, axis), dim(rhs, axis)) {
            (a, b) if a == b => Ok(a),
            (1, b) => Ok(b),
            (a, 1) => Ok(a),
            (a, b) => Err(TensorError::BroadcastError(format!(
                "{:?} vs {:?}: axis {} has {} and {}",
                lhs, rhs, axis, a, b
            ))),
        })
        .collect()
}
