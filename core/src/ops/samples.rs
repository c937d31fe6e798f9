//! Small deterministic operator instances, one per kind and type, to
//! exercise kernel sets uniformly.
use kestrel_data::prelude::*;

use crate::errors::KestrelResult;
use crate::model::TypedFact;
use crate::ops::*;

#[derive(Debug, Clone)]
pub struct Sample {
    pub def: OpDef,
    pub inputs: TVec<Tensor>,
}

impl Sample {
    pub fn facts(&self) -> TVec<TypedFact> {
        self.inputs.iter().map(TypedFact::from).collect()
    }
}

/// Quantization parameters used for sample inputs.
pub fn sample_qparams(datum: DatumKind) -> Option<QParams> {
    match datum {
        DatumKind::QU8 => Some(QParams::new(128, 1.0 / 16.0)),
        DatumKind::QI8 => Some(QParams::new(0, 1.0 / 16.0)),
        _ => None,
    }
}

pub fn sample_datum_type(datum: DatumKind) -> Option<DatumType> {
    match datum {
        DatumKind::F32 => Some(DatumType::F32),
        DatumKind::I32 => Some(DatumType::I32),
        DatumKind::QU8 => sample_qparams(datum).map(DatumType::QU8),
        DatumKind::QI8 => sample_qparams(datum).map(DatumType::QI8),
        _ => None,
    }
}

/// Deterministic tensor with values spread over [-0.75, 0.75] (or
/// [-6, 6] for integers).
pub fn sample_tensor(dt: DatumType, shape: &[usize], seed: usize) -> KestrelResult<Tensor> {
    let len: usize = shape.iter().product();
    if dt == DatumType::I32 {
        let data: Vec<i32> = (0..len).map(|i| ((i * 7 + seed) % 13) as i32 - 6).collect();
        return Tensor::from_shape(shape, &data);
    }
    let data: Vec<f32> = (0..len).map(|i| ((i * 7 + seed) % 13) as f32 / 8.0 - 0.75).collect();
    Ok(Tensor::from_shape(shape, &data)?.cast_to_dt(dt)?.into_owned())
}

/// A sample operator of `kind` over `datum` inputs, None for types no
/// kernel set handles.
pub fn sample(kind: OpKind, datum: DatumKind) -> KestrelResult<Option<Sample>> {
    let Some(dt) = sample_datum_type(datum) else { return Ok(None) };
    let quantized = dt.is_quantized();
    let t = |shape: &[usize], seed: usize| sample_tensor(dt, shape, seed);
    let bias = |len: usize| {
        if quantized {
            Ok(tensor1(&(0..len as i32).map(|i| i * 3 - 4).collect::<Vec<_>>()))
        } else {
            sample_tensor(dt, &[len], 5)
        }
    };
    let make_def = |params: OpParams, output_scale: Option<f32>| match (dt.qparams(), output_scale) {
        (Some(qp), Some(scale)) => OpDef::quantized(params, QParams::new(qp.zero_point, scale)),
        _ => OpDef::new(params),
    };
    let (def, inputs) = match kind {
        OpKind::Conv2D => (
            make_def(OpParams::Conv2D(ConvParams::default()), Some(0.25)),
            tvec!(t(&[1, 5, 5, 3], 0)?, t(&[3, 3, 3, 4], 1)?, bias(4)?),
        ),
        OpKind::DepthwiseConv2D => (
            make_def(
                OpParams::DepthwiseConv2D(ConvParams::new([1, 1], [1, 1], PaddingMode::Same)),
                Some(0.125),
            ),
            tvec!(t(&[1, 5, 5, 3], 0)?, t(&[3, 3, 3, 2], 2)?, bias(6)?),
        ),
        OpKind::Pooling => (
            make_def(
                OpParams::Pooling(PoolParams::new(PoolingType::Avg, [3, 3], [2, 2], PaddingMode::Same)),
                None,
            ),
            tvec!(t(&[1, 5, 5, 3], 3)?),
        ),
        OpKind::Eltwise => (
            make_def(OpParams::Eltwise(EltwiseType::Sum), Some(0.125)),
            tvec!(t(&[2, 3], 0)?, t(&[3], 4)?),
        ),
        OpKind::AddN => (
            make_def(OpParams::AddN, None),
            tvec!(t(&[2, 3], 0)?, t(&[2, 3], 1)?, t(&[2, 3], 2)?),
        ),
        OpKind::Activation => {
            (make_def(OpParams::Activation(ActivationType::Relu), None), tvec!(t(&[2, 3], 0)?))
        }
        OpKind::BiasAdd => (make_def(OpParams::BiasAdd, None), tvec!(t(&[2, 3], 0)?, t(&[3], 1)?)),
        OpKind::FoldedBatchNorm => (
            make_def(OpParams::FoldedBatchNorm, None),
            tvec!(t(&[1, 2, 2, 3], 0)?, t(&[3], 1)?, t(&[3], 2)?),
        ),
        OpKind::MatMul => (
            make_def(OpParams::MatMul(MatMulParams::default()), Some(0.125)),
            tvec!(t(&[2, 3], 0)?, t(&[3, 4], 1)?),
        ),
        OpKind::Softmax => (make_def(OpParams::Softmax, None), tvec!(t(&[2, 5], 0)?)),
        OpKind::Reshape => (
            make_def(OpParams::Reshape(ReshapeParams::new(tvec!(-1, 4))), None),
            tvec!(t(&[2, 3, 4], 0)?),
        ),
        OpKind::Identity => (make_def(OpParams::Identity, None), tvec!(t(&[2, 3], 0)?)),
        OpKind::Concat => (
            make_def(OpParams::Concat(ConcatParams::new(-1)), None),
            tvec!(t(&[2, 3], 0)?, t(&[2, 2], 1)?),
        ),
        OpKind::Pad => (
            make_def(OpParams::Pad(PadParams::new(tvec!((1, 0), (0, 2)), 0.0)), None),
            tvec!(t(&[2, 3], 0)?),
        ),
        OpKind::ResizeBilinear => (
            make_def(OpParams::ResizeBilinear(ResizeParams::new([4, 5], false)), None),
            tvec!(t(&[1, 2, 3, 2], 0)?),
        ),
        OpKind::SpaceToDepth => {
            (make_def(OpParams::SpaceToDepth(2), None), tvec!(t(&[1, 4, 4, 2], 0)?))
        }
        OpKind::DepthToSpace => {
            (make_def(OpParams::DepthToSpace(2), None), tvec!(t(&[1, 2, 2, 8], 0)?))
        }
    };
    Ok(Some(Sample { def, inputs }))
}
