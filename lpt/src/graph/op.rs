use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

/// Element type of an output port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F32,
    F16,
    I32,
    I8,
    U8,
}

impl ElementType {
    /// The 8-bit integer types the transformations target.
    pub fn is_low_precision(&self) -> bool {
        matches!(self, ElementType::I8 | ElementType::U8)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F16)
    }

    /// Representable range of an integer type.
    pub fn integer_range(&self) -> Option<(f32, f32)> {
        match self {
            ElementType::I8 => Some((i8::MIN as f32, i8::MAX as f32)),
            ElementType::U8 => Some((u8::MIN as f32, u8::MAX as f32)),
            ElementType::I32 => Some((i32::MIN as f32, i32::MAX as f32)),
            ElementType::F32 | ElementType::F16 => None,
        }
    }

    /// Whether `value` is stored exactly by this type.
    pub fn represents(&self, value: f32) -> bool {
        match self.integer_range() {
            Some((min, max)) => value.fract() == 0.0 && value >= min && value <= max,
            None => value.is_finite(),
        }
    }
}

/// Tag of an [`Op`], used to key the rule registry and the precision restrictions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpKind {
    Parameter,
    Result,
    Constant,
    FakeQuantize,
    Convert,
    Add,
    Multiply,
    Subtract,
    Convolution,
    GroupConvolution,
    MatMul,
    Concat,
    Reshape,
    Transpose,
    Split,
    VariadicSplit,
    StridedSlice,
    Squeeze,
    Unsqueeze,
    AvgPool,
    MaxPool,
    Interpolate,
    PRelu,
    Relu,
    Mvn,
    NormalizeL2,
    Clamp,
    DepthToSpace,
}

impl Display for OpKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{:?}", self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterpolateMode {
    Nearest,
    Linear,
}

/// Operation performed by a node, with the attributes the transformations care about.
///
/// Shape-only attributes (reshape targets, slice bounds, pooling windows) are not modelled: the
/// output port shapes carry that information.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Parameter,
    Result,
    Constant(Tensor),
    /// Inputs: data, input low, input high, output low, output high.
    FakeQuantize {
        levels: usize,
    },
    Convert {
        destination: ElementType,
    },
    Add,
    Multiply,
    Subtract,
    /// Inputs: data, weights (`[C_out, C_in, ...]`).
    Convolution,
    /// Inputs: data, weights (`[G, C_out / G, C_in / G, ...]`).
    GroupConvolution,
    MatMul {
        transpose_a: bool,
        transpose_b: bool,
    },
    Concat {
        axis: usize,
    },
    Reshape,
    Transpose,
    Split {
        axis: usize,
    },
    VariadicSplit {
        axis: usize,
    },
    StridedSlice,
    Squeeze,
    Unsqueeze,
    AvgPool,
    MaxPool,
    Interpolate {
        mode: InterpolateMode,
    },
    PRelu,
    Relu,
    Mvn,
    NormalizeL2,
    Clamp {
        min: f32,
        max: f32,
    },
    DepthToSpace {
        block_size: usize,
    },
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Parameter => OpKind::Parameter,
            Op::Result => OpKind::Result,
            Op::Constant(_) => OpKind::Constant,
            Op::FakeQuantize { .. } => OpKind::FakeQuantize,
            Op::Convert { .. } => OpKind::Convert,
            Op::Add => OpKind::Add,
            Op::Multiply => OpKind::Multiply,
            Op::Subtract => OpKind::Subtract,
            Op::Convolution => OpKind::Convolution,
            Op::GroupConvolution => OpKind::GroupConvolution,
            Op::MatMul { .. } => OpKind::MatMul,
            Op::Concat { .. } => OpKind::Concat,
            Op::Reshape => OpKind::Reshape,
            Op::Transpose => OpKind::Transpose,
            Op::Split { .. } => OpKind::Split,
            Op::VariadicSplit { .. } => OpKind::VariadicSplit,
            Op::StridedSlice => OpKind::StridedSlice,
            Op::Squeeze => OpKind::Squeeze,
            Op::Unsqueeze => OpKind::Unsqueeze,
            Op::AvgPool => OpKind::AvgPool,
            Op::MaxPool => OpKind::MaxPool,
            Op::Interpolate { .. } => OpKind::Interpolate,
            Op::PRelu => OpKind::PRelu,
            Op::Relu => OpKind::Relu,
            Op::Mvn => OpKind::Mvn,
            Op::NormalizeL2 => OpKind::NormalizeL2,
            Op::Clamp { .. } => OpKind::Clamp,
            Op::DepthToSpace { .. } => OpKind::DepthToSpace,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Op::Constant(t) => format!("Constant{:?}", t.get_shape()),
            Op::FakeQuantize { levels } => format!("FakeQuantize(levels={})", levels),
            Op::Convert { destination } => format!("Convert(to {:?})", destination),
            Op::MatMul {
                transpose_a,
                transpose_b,
            } => format!("MatMul(ta={}, tb={})", transpose_a, transpose_b),
            Op::Concat { axis } => format!("Concat(axis={})", axis),
            op => op.kind().to_string(),
        }
    }
}
