//! Operator vocabulary: kinds, parameters, and shape inference.
use std::fmt;

use kestrel_data::prelude::*;

pub mod geometry;
pub mod infer;
pub mod padding;
pub mod samples;

pub use geometry::ConvGeometry;
pub use padding::{ComputedPaddedDim, PaddingMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Conv2D,
    DepthwiseConv2D,
    Pooling,
    Eltwise,
    AddN,
    Activation,
    BiasAdd,
    FoldedBatchNorm,
    MatMul,
    Softmax,
    Reshape,
    Identity,
    Concat,
    Pad,
    ResizeBilinear,
    SpaceToDepth,
    DepthToSpace,
}

impl OpKind {
    pub const ALL: [OpKind; 17] = [
        OpKind::Conv2D,
        OpKind::DepthwiseConv2D,
        OpKind::Pooling,
        OpKind::Eltwise,
        OpKind::AddN,
        OpKind::Activation,
        OpKind::BiasAdd,
        OpKind::FoldedBatchNorm,
        OpKind::MatMul,
        OpKind::Softmax,
        OpKind::Reshape,
        OpKind::Identity,
        OpKind::Concat,
        OpKind::Pad,
        OpKind::ResizeBilinear,
        OpKind::SpaceToDepth,
        OpKind::DepthToSpace,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EltwiseType {
    Sum,
    Sub,
    Prod,
    Div,
    Min,
    Max,
    Neg,
    Abs,
    SqrDiff,
    Pow,
}

impl EltwiseType {
    pub fn is_unary(&self) -> bool {
        matches!(self, EltwiseType::Neg | EltwiseType::Abs)
    }

    pub fn arity(&self) -> usize {
        if self.is_unary() { 1 } else { 2 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActivationType {
    Relu,
    /// Relu clamped to `[0, limit]`.
    ReluX(f32),
    Tanh,
    Sigmoid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolingType {
    Max,
    Avg,
}

/// Convolution parameters, shared by plain and depthwise convolutions.
///
/// Input is NHWC. Filters are HWIO for plain convolution, HWCM (M being
/// the channel multiplier) for depthwise ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, new)]
pub struct ConvParams {
    pub strides: [usize; 2],
    pub dilations: [usize; 2],
    pub padding: PaddingMode,
}

impl Default for ConvParams {
    fn default() -> ConvParams {
        ConvParams { strides: [1, 1], dilations: [1, 1], padding: PaddingMode::Valid }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, new)]
pub struct PoolParams {
    pub pooling: PoolingType,
    pub kernel: [usize; 2],
    pub strides: [usize; 2],
    pub padding: PaddingMode,
}

impl PoolParams {
    pub fn as_conv(&self) -> ConvParams {
        ConvParams { strides: self.strides, dilations: [1, 1], padding: self.padding }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, new)]
pub struct MatMulParams {
    pub transpose_a: bool,
    pub transpose_b: bool,
}

/// Target shape. At most one `-1` stands for "whatever is left".
#[derive(Debug, Clone, PartialEq, Eq, Hash, new)]
pub struct ReshapeParams {
    pub shape: TVec<isize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, new)]
pub struct ConcatParams {
    /// Negative axes count from the end.
    pub axis: isize,
}

#[derive(Debug, Clone, PartialEq, new)]
pub struct PadParams {
    /// `(before, after)` for each axis.
    pub pads: TVec<(usize, usize)>,
    pub value: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, new)]
pub struct ResizeParams {
    pub size: [usize; 2],
    pub align_corners: bool,
}

/// Operator parameters, one shape per operator kind.
#[derive(Debug, Clone, PartialEq)]
pub enum OpParams {
    Conv2D(ConvParams),
    DepthwiseConv2D(ConvParams),
    Pooling(PoolParams),
    Eltwise(EltwiseType),
    AddN,
    Activation(ActivationType),
    /// Bias `[C]` added along the last axis.
    BiasAdd,
    /// `x * scale[c] + offset[c]` along the last axis.
    FoldedBatchNorm,
    MatMul(MatMulParams),
    /// Along the last axis.
    Softmax,
    Reshape(ReshapeParams),
    Identity,
    Concat(ConcatParams),
    Pad(PadParams),
    ResizeBilinear(ResizeParams),
    SpaceToDepth(usize),
    DepthToSpace(usize),
}

impl OpParams {
    pub fn kind(&self) -> OpKind {
        match self {
            OpParams::Conv2D(_) => OpKind::Conv2D,
            OpParams::DepthwiseConv2D(_) => OpKind::DepthwiseConv2D,
            OpParams::Pooling(_) => OpKind::Pooling,
            OpParams::Eltwise(_) => OpKind::Eltwise,
            OpParams::AddN => OpKind::AddN,
            OpParams::Activation(_) => OpKind::Activation,
            OpParams::BiasAdd => OpKind::BiasAdd,
            OpParams::FoldedBatchNorm => OpKind::FoldedBatchNorm,
            OpParams::MatMul(_) => OpKind::MatMul,
            OpParams::Softmax => OpKind::Softmax,
            OpParams::Reshape(_) => OpKind::Reshape,
            OpParams::Identity => OpKind::Identity,
            OpParams::Concat(_) => OpKind::Concat,
            OpParams::Pad(_) => OpKind::Pad,
            OpParams::ResizeBilinear(_) => OpKind::ResizeBilinear,
            OpParams::SpaceToDepth(_) => OpKind::SpaceToDepth,
            OpParams::DepthToSpace(_) => OpKind::DepthToSpace,
        }
    }
}

/// What a graph node asks a kernel factory for: parameters, plus the
/// quantization of the output when it is quantized.
///
/// Without explicit output parameters, quantized kernels keep the
/// parameters of their first input.
#[derive(Debug, Clone, PartialEq)]
pub struct OpDef {
    pub params: OpParams,
    pub output_qparams: Option<QParams>,
}

impl OpDef {
    pub fn new(params: impl Into<OpParams>) -> OpDef {
        OpDef { params: params.into(), output_qparams: None }
    }

    pub fn quantized(params: impl Into<OpParams>, output_qparams: QParams) -> OpDef {
        OpDef { params: params.into(), output_qparams: Some(output_qparams) }
    }

    pub fn kind(&self) -> OpKind {
        self.params.kind()
    }
}

impl fmt::Display for OpDef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.params)?;
        if let Some(qp) = self.output_qparams {
            write!(f, " -> ({qp})")?;
        }
        Ok(())
    }
}

impl From<OpParams> for OpDef {
    fn from(params: OpParams) -> OpDef {
        OpDef::new(params)
    }
}

macro_rules! params_into_def {
    ($($t:ty => $v:ident),*) => {
        $(
            impl From<$t> for OpParams {
                fn from(p: $t) -> OpParams {
                    OpParams::$v(p)
                }
            }

            impl From<$t> for OpDef {
                fn from(p: $t) -> OpDef {
                    OpDef::new(OpParams::$v(p))
                }
            }
        )*
    };
}

params_into_def!(
    PoolParams => Pooling,
    EltwiseType => Eltwise,
    ActivationType => Activation,
    MatMulParams => MatMul,
    ReshapeParams => Reshape,
    ConcatParams => Concat,
    PadParams => Pad,
    ResizeParams => ResizeBilinear
);
