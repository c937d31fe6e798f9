use kestrel_data::internal::*;
use ndarray::{Axis, LinalgScalar, Zip};

use crate::errors::KestrelResult;
use crate::ops::infer::mk;
use crate::ops::{ActivationType, EltwiseType, MatMulParams};

fn unary_t<T: Datum>(x: &Tensor, output: &mut Tensor, f: impl Fn(T) -> T) -> KestrelResult<()> {
    let mut y = output.to_array_view_mut::<T>()?;
    Zip::from(&mut y).and(&x.to_array_view::<T>()?).for_each(|y, x| *y = f(*x));
    Ok(())
}

/// `output = f(a, b)`, both operands broadcast to the output shape.
pub(crate) fn binary_t<T: Datum>(
    a: &Tensor,
    b: &Tensor,
    output: &mut Tensor,
    f: impl Fn(T, T) -> T,
) -> KestrelResult<()> {
    let mut y = output.to_array_view_mut::<T>()?;
    let shape = y.shape().to_vec();
    let a = a.to_array_view::<T>()?;
    let b = b.to_array_view::<T>()?;
    let (Some(a), Some(b)) = (a.broadcast(&*shape), b.broadcast(&*shape)) else {
        bail_shape!("can not broadcast {:?} and {:?} to {:?}", a.shape(), b.shape(), shape)
    };
    Zip::from(&mut y).and(&a).and(&b).for_each(|y, a, b| *y = f(*a, *b));
    Ok(())
}

pub fn eltwise(e: EltwiseType, inputs: &[&Tensor], output: &mut Tensor) -> KestrelResult<()> {
    use EltwiseType::*;
    match output.datum_type() {
        DatumType::F32 => match e {
            Neg => unary_t(inputs[0], output, |x: f32| -x),
            Abs => unary_t(inputs[0], output, |x: f32| x.abs()),
            Sum => binary_t(inputs[0], inputs[1], output, |a: f32, b| a + b),
            Sub => binary_t(inputs[0], inputs[1], output, |a: f32, b| a - b),
            Prod => binary_t(inputs[0], inputs[1], output, |a: f32, b| a * b),
            Div => binary_t(inputs[0], inputs[1], output, |a: f32, b| a / b),
            Min => binary_t(inputs[0], inputs[1], output, |a: f32, b| a.min(b)),
            Max => binary_t(inputs[0], inputs[1], output, |a: f32, b| a.max(b)),
            SqrDiff => binary_t(inputs[0], inputs[1], output, |a: f32, b| (a - b) * (a - b)),
            Pow => binary_t(inputs[0], inputs[1], output, |a: f32, b| a.powf(b)),
        },
        DatumType::I32 => match e {
            Neg => unary_t(inputs[0], output, |x: i32| x.wrapping_neg()),
            Abs => unary_t(inputs[0], output, |x: i32| x.wrapping_abs()),
            Sum => binary_t(inputs[0], inputs[1], output, |a: i32, b| a.wrapping_add(b)),
            Sub => binary_t(inputs[0], inputs[1], output, |a: i32, b| a.wrapping_sub(b)),
            Prod => binary_t(inputs[0], inputs[1], output, |a: i32, b| a.wrapping_mul(b)),
            Min => binary_t(inputs[0], inputs[1], output, |a: i32, b| a.min(b)),
            Max => binary_t(inputs[0], inputs[1], output, |a: i32, b| a.max(b)),
            SqrDiff => binary_t(inputs[0], inputs[1], output, |a: i32, b| {
                let d = a.wrapping_sub(b);
                d.wrapping_mul(d)
            }),
            Div | Pow => bail_type!("{:?} is not defined on integers", e),
        },
        dt => bail_type!("{:?} on {:?}", e, dt),
    }
}

fn add_n_t<T: Datum>(
    inputs: &[&Tensor],
    output: &mut Tensor,
    add: impl Fn(T, T) -> T,
) -> KestrelResult<()> {
    let y = output.as_slice_mut::<T>()?;
    y.fill(T::default());
    for input in inputs {
        for (y, x) in y.iter_mut().zip(input.as_slice::<T>()?) {
            *y = add(*y, *x);
        }
    }
    Ok(())
}

pub fn add_n(inputs: &[&Tensor], output: &mut Tensor) -> KestrelResult<()> {
    match output.datum_type() {
        DatumType::F32 => add_n_t(inputs, output, |a: f32, b| a + b),
        DatumType::I32 => add_n_t(inputs, output, |a: i32, b| a.wrapping_add(b)),
        dt => bail_type!("AddN on {:?}", dt),
    }
}

pub fn activation(a: ActivationType, x: &Tensor, output: &mut Tensor) -> KestrelResult<()> {
    match a {
        ActivationType::Relu => unary_t(x, output, |x: f32| x.max(0.0)),
        ActivationType::ReluX(limit) => unary_t(x, output, |x: f32| x.max(0.0).min(limit)),
        ActivationType::Tanh => unary_t(x, output, |x: f32| x.tanh()),
        ActivationType::Sigmoid => unary_t(x, output, |x: f32| 1.0 / (1.0 + (-x).exp())),
    }
}

/// Bias along the last axis.
pub fn bias_add(x: &Tensor, bias: &Tensor, output: &mut Tensor) -> KestrelResult<()> {
    match output.datum_type() {
        DatumType::F32 => binary_t(x, bias, output, |a: f32, b| a + b),
        DatumType::I32 => binary_t(x, bias, output, |a: i32, b| a.wrapping_add(b)),
        dt => bail_type!("BiasAdd on {:?}", dt),
    }
}

/// `x * scale[c] + offset[c]`, c being the last axis.
pub fn batch_norm(
    x: &Tensor,
    scale: &Tensor,
    offset: &Tensor,
    output: &mut Tensor,
) -> KestrelResult<()> {
    let mut y = output.to_array_view_mut::<f32>()?;
    let shape = y.shape().to_vec();
    let x = x.to_array_view::<f32>()?;
    let scale = scale.to_array_view::<f32>()?;
    let offset = offset.to_array_view::<f32>()?;
    let (Some(scale), Some(offset)) = (scale.broadcast(&*shape), offset.broadcast(&*shape)) else {
        bail_shape!("can not broadcast batch norm parameters to {:?}", shape)
    };
    Zip::from(&mut y)
        .and(&x)
        .and(&scale)
        .and(&offset)
        .for_each(|y, x, s, o| *y = x * s + o);
    Ok(())
}

fn matmul_t<T: Datum + LinalgScalar>(
    a: &Tensor,
    b: &Tensor,
    params: &MatMulParams,
    output: &mut Tensor,
) -> KestrelResult<()> {
    let batch: usize = a.shape()[..a.rank() - 2].iter().product();
    let as_3d = |t: &Tensor| [batch, t.shape()[t.rank() - 2], t.shape()[t.rank() - 1]];
    let a3 = a.to_array_view::<T>()?.into_shape_with_order(as_3d(a))?;
    let b3 = b.to_array_view::<T>()?.into_shape_with_order(as_3d(b))?;
    let (m, _) = mk(a.shape(), params.transpose_a);
    let (_, n) = mk(b.shape(), params.transpose_b);
    let mut c3 = output.to_array_view_mut::<T>()?.into_shape_with_order((batch, m, n))?;
    for i in 0..batch {
        let mut a = a3.index_axis(Axis(0), i);
        let mut b = b3.index_axis(Axis(0), i);
        if params.transpose_a {
            a = a.reversed_axes();
        }
        if params.transpose_b {
            b = b.reversed_axes();
        }
        c3.index_axis_mut(Axis(0), i).assign(&a.dot(&b));
    }
    Ok(())
}

pub fn matmul(a: &Tensor, b: &Tensor, params: &MatMulParams, output: &mut Tensor) -> KestrelResult<()> {
    match output.datum_type() {
        DatumType::F32 => matmul_t::<f32>(a, b, params, output),
        DatumType::I32 => matmul_t::<i32>(a, b, params, output),
        dt => bail_type!("MatMul on {:?}", dt),
    }
}

/// Softmax along the last axis, shifted by the lane max.
pub fn softmax(x: &Tensor, output: &mut Tensor) -> KestrelResult<()> {
    let mut y = output.to_array_view_mut::<f32>()?;
    y.assign(&x.to_array_view::<f32>()?);
    let axis = Axis(y.ndim() - 1);
    for mut lane in y.lanes_mut(axis) {
        let max = lane.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    Ok(())
}
