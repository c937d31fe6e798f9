//! Output facts of every operator kind, shared by all kernel sets.
//!
//! Activations are NHWC, convolution filters HWIO and depthwise filters
//! HWIM (M being the channel multiplier).
use kestrel_data::prelude::*;

use crate::broadcast::multi_broadcast;
use crate::errors::KestrelResult;
use crate::model::TypedFact;
use crate::ops::{ConvGeometry, ConvParams, MatMulParams, OpDef, OpParams};

/// Check arity and type consistency, then infer the single output fact of
/// `def` applied to `inputs`.
pub fn output_facts(def: &OpDef, inputs: &[&TypedFact]) -> KestrelResult<TVec<TypedFact>> {
    ensure_shape!(!inputs.is_empty(), "{} needs at least one input", def);
    let x = inputs[0];
    let shape: TVec<usize> = match &def.params {
        OpParams::Conv2D(conv) => {
            arity(def, inputs, 2..=3)?;
            check_bias(def, inputs)?;
            conv_shape(inputs, conv, false)?
        }
        OpParams::DepthwiseConv2D(conv) => {
            arity(def, inputs, 2..=3)?;
            check_bias(def, inputs)?;
            conv_shape(inputs, conv, true)?
        }
        OpParams::Pooling(pool) => {
            arity(def, inputs, 1..=1)?;
            let geo = ConvGeometry::new(&x.shape, pool.kernel, &pool.as_conv())?;
            tvec!(geo.batch, geo.output_h, geo.output_w, geo.channels)
        }
        OpParams::Eltwise(e) => {
            arity(def, inputs, e.arity()..=e.arity())?;
            same_kind(def, inputs)?;
            multi_broadcast(&inputs.iter().map(|f| &*f.shape).collect::<TVec<_>>())?
        }
        OpParams::AddN => {
            same_kind(def, inputs)?;
            for i in inputs {
                ensure_shape!(i.shape == x.shape, "{} inputs differ: {:?}", def, inputs);
            }
            x.shape.clone()
        }
        OpParams::Activation(_) | OpParams::Softmax | OpParams::Identity => {
            arity(def, inputs, 1..=1)?;
            if matches!(def.params, OpParams::Softmax) {
                ensure_shape!(x.rank() >= 1, "{} on a scalar", def);
            }
            x.shape.clone()
        }
        OpParams::BiasAdd => {
            arity(def, inputs, 2..=2)?;
            same_kind(def, inputs)?;
            ensure_shape!(
                x.rank() >= 1 && inputs[1].shape[..] == x.shape[x.rank() - 1..],
                "{}: bias {:?} for input {:?}",
                def,
                inputs[1],
                x
            );
            x.shape.clone()
        }
        OpParams::FoldedBatchNorm => {
            arity(def, inputs, 3..=3)?;
            same_kind(def, inputs)?;
            ensure_shape!(x.rank() >= 1, "{} on a scalar", def);
            let channels = &x.shape[x.rank() - 1..];
            ensure_shape!(
                inputs[1].shape[..] == *channels && inputs[2].shape[..] == *channels,
                "{}: scale {:?} and offset {:?} for input {:?}",
                def,
                inputs[1],
                inputs[2],
                x
            );
            x.shape.clone()
        }
        OpParams::MatMul(mm) => {
            arity(def, inputs, 2..=2)?;
            same_kind(def, inputs)?;
            matmul(x, inputs[1], mm)?
        }
        OpParams::Reshape(reshape) => {
            arity(def, inputs, 1..=1)?;
            resolve_shape(&x.shape, &reshape.shape)?
        }
        OpParams::Concat(concat) => {
            same_kind(def, inputs)?;
            let axis = normalize_axis(concat.axis, x.rank())?;
            let mut shape = x.shape.clone();
            shape[axis] = 0;
            for i in inputs {
                ensure_shape!(
                    i.rank() == x.rank()
                        && i.shape.iter().zip(x.shape.iter()).enumerate().all(|(ix, (a, b))| ix
                            == axis
                            || a == b),
                    "{}: can not concatenate {:?}",
                    def,
                    inputs
                );
                shape[axis] += i.shape[axis];
            }
            shape
        }
        OpParams::Pad(pad) => {
            arity(def, inputs, 1..=1)?;
            ensure_shape!(
                pad.pads.len() == x.rank(),
                "{} pads {} axes of {:?}",
                def,
                pad.pads.len(),
                x
            );
            x.shape.iter().zip(pad.pads.iter()).map(|(d, (b, a))| d + b + a).collect()
        }
        OpParams::ResizeBilinear(resize) => {
            arity(def, inputs, 1..=1)?;
            nhwc(x)?;
            ensure_shape!(resize.size.iter().all(|&d| d > 0), "{}: empty output", def);
            tvec!(x.shape[0], resize.size[0], resize.size[1], x.shape[3])
        }
        OpParams::SpaceToDepth(block) => {
            arity(def, inputs, 1..=1)?;
            nhwc(x)?;
            let b = *block;
            ensure_shape!(
                b > 0 && x.shape[1] % b == 0 && x.shape[2] % b == 0,
                "{}: {:?} is not divisible in blocks of {}",
                def,
                x,
                b
            );
            tvec!(x.shape[0], x.shape[1] / b, x.shape[2] / b, x.shape[3] * b * b)
        }
        OpParams::DepthToSpace(block) => {
            arity(def, inputs, 1..=1)?;
            nhwc(x)?;
            let b = *block;
            ensure_shape!(
                b > 0 && x.shape[3] % (b * b) == 0,
                "{}: {} channels can not be spread in blocks of {}",
                def,
                x.shape[3],
                b
            );
            tvec!(x.shape[0], x.shape[1] * b, x.shape[2] * b, x.shape[3] / (b * b))
        }
    };
    Ok(tvec!(TypedFact::new(output_datum_type(def, x.datum_type)?, shape)))
}

/// Output type: the first input type, quantized operators switching to
/// the output quantization parameters when given.
pub fn output_datum_type(def: &OpDef, input: DatumType) -> KestrelResult<DatumType> {
    match def.output_qparams {
        Some(qp) if input.is_quantized() => input.quantize(qp),
        _ => Ok(input),
    }
}

fn arity(
    def: &OpDef,
    inputs: &[&TypedFact],
    range: std::ops::RangeInclusive<usize>,
) -> KestrelResult<()> {
    ensure_shape!(
        range.contains(&inputs.len()),
        "{} expects {:?} inputs, got {}",
        def,
        range,
        inputs.len()
    );
    Ok(())
}

fn same_kind(def: &OpDef, inputs: &[&TypedFact]) -> KestrelResult<()> {
    let kind = inputs[0].datum_type.kind();
    ensure_type!(
        inputs.iter().all(|i| i.datum_type.kind() == kind),
        "{} inputs must share their type: {:?}",
        def,
        inputs
    );
    Ok(())
}

/// Filters share the input type, biases are I32 for quantized inputs.
fn check_bias(def: &OpDef, inputs: &[&TypedFact]) -> KestrelResult<()> {
    let x = inputs[0].datum_type;
    ensure_type!(
        inputs[1].datum_type.kind() == x.kind(),
        "{}: filter {:?} for input {:?}",
        def,
        inputs[1],
        inputs[0]
    );
    if let Some(bias) = inputs.get(2) {
        let expected = if x.is_quantized() { DatumType::I32 } else { x };
        ensure_type!(
            bias.datum_type.kind() == expected.kind(),
            "{}: bias should be {:?}, got {:?}",
            def,
            expected,
            bias
        );
        ensure_shape!(bias.rank() == 1, "{}: bias should be a vector, got {:?}", def, bias);
    }
    Ok(())
}

fn nhwc(x: &TypedFact) -> KestrelResult<()> {
    ensure_shape!(x.rank() == 4, "expected a NHWC input, got {:?}", x);
    Ok(())
}

fn conv_shape(
    inputs: &[&TypedFact],
    params: &ConvParams,
    depthwise: bool,
) -> KestrelResult<TVec<usize>> {
    let (x, filter) = (inputs[0], inputs[1]);
    nhwc(x)?;
    ensure_shape!(filter.rank() == 4, "expected a 4D filter, got {:?}", filter);
    ensure_shape!(
        filter.shape[2] == x.shape[3],
        "filter {:?} does not match {} input channels",
        filter,
        x.shape[3]
    );
    ensure_shape!(
        params.strides.iter().chain(params.dilations.iter()).all(|&s| s > 0),
        "strides and dilations must be positive: {:?}",
        params
    );
    let geo = ConvGeometry::new(&x.shape, [filter.shape[0], filter.shape[1]], params)?;
    let channels = if depthwise { filter.shape[2] * filter.shape[3] } else { filter.shape[3] };
    if let Some(bias) = inputs.get(2) {
        ensure_shape!(
            bias.shape[..] == [channels],
            "bias {:?} for {} output channels",
            bias,
            channels
        );
    }
    Ok(tvec!(geo.batch, geo.output_h, geo.output_w, channels))
}

fn matmul(a: &TypedFact, b: &TypedFact, params: &MatMulParams) -> KestrelResult<TVec<usize>> {
    ensure_shape!(
        a.rank() >= 2 && a.rank() == b.rank() && a.shape[..a.rank() - 2] == b.shape[..b.rank() - 2],
        "MatMul of {:?} by {:?}",
        a,
        b
    );
    let (m, ka) = mk(&a.shape, params.transpose_a);
    let (kb, n) = mk(&b.shape, params.transpose_b);
    ensure_shape!(ka == kb, "MatMul of {:?} by {:?}: {} vs {} columns", a, b, ka, kb);
    let mut shape: TVec<usize> = a.shape[..a.rank() - 2].into();
    shape.push(m);
    shape.push(n);
    Ok(shape)
}

/// Rows and columns of the trailing matrix of `shape`, after an optional
/// transposition.
pub fn mk(shape: &[usize], transpose: bool) -> (usize, usize) {
    let (r, c) = (shape[shape.len() - 2], shape[shape.len() - 1]);
    if transpose { (c, r) } else { (r, c) }
}

pub fn normalize_axis(axis: isize, rank: usize) -> KestrelResult<usize> {
    let resolved = if axis < 0 { axis + rank as isize } else { axis };
    ensure_shape!(
        resolved >= 0 && (resolved as usize) < rank,
        "axis {} out of range for rank {}",
        axis,
        rank
    );
    Ok(resolved as usize)
}

/// Target shape of a reshape, `-1` standing for the remaining volume.
pub fn resolve_shape(input: &[usize], target: &[isize]) -> KestrelResult<TVec<usize>> {
    let volume: usize = input.iter().product();
    ensure_shape!(
        target.iter().all(|&d| d >= -1) && target.iter().filter(|&&d| d == -1).count() <= 1,
        "invalid reshape target {:?}",
        target
    );
    let known: usize = target.iter().filter(|&&d| d >= 0).map(|&d| d as usize).product();
    let shape: TVec<usize> = target
        .iter()
        .map(|&d| {
            if d >= 0 {
                Ok(d as usize)
            } else if known > 0 && volume % known == 0 {
                Ok(volume / known)
            } else {
                bail_shape!("can not reshape {:?} to {:?}", input, target)
            }
        })
        .collect::<KestrelResult<_>>()?;
    ensure_shape!(
        shape.iter().product::<usize>() == volume,
        "can not reshape {:?} to {:?}",
        input,
        target
    );
    Ok(shape)
}
