use kestrel_data::internal::*;
use kestrel_linalg::Scaler;

use super::{centered, lift, qparams, scaler, settle, store};
use crate::backend::Backend;
use crate::errors::KestrelResult;
use crate::kernels::reference::binary_t;
use crate::ops::{ActivationType, ConvGeometry, EltwiseType, OpKind, PoolParams, PoolingType};

/// Apply a real function through a table indexed by the input storage value.
fn lut<T: QuantizedDatum>(
    x: &Tensor,
    output: &mut Tensor,
    f: impl Fn(f32) -> f32,
) -> KestrelResult<()> {
    let (xq, yq) = (qparams(x.datum_type())?, qparams(output.datum_type())?);
    let table: Vec<T> =
        (T::QMIN..=T::QMAX).map(|q| yq.quantize::<T>(f(xq.dequantize(q)))).collect();
    let y = output.as_slice_mut::<T>()?;
    for (y, &x) in y.iter_mut().zip(x.as_slice::<T>()?) {
        *y = table[(x.into() - T::QMIN) as usize];
    }
    Ok(())
}

pub fn activation<T: QuantizedDatum>(
    a: ActivationType,
    x: &Tensor,
    output: &mut Tensor,
) -> KestrelResult<()> {
    match a {
        ActivationType::Relu => lut::<T>(x, output, |v| v.max(0.0)),
        ActivationType::ReluX(limit) => lut::<T>(x, output, |v| v.max(0.0).min(limit)),
        ActivationType::Tanh => lut::<T>(x, output, f32::tanh),
        ActivationType::Sigmoid => lut::<T>(x, output, |v| 1.0 / (1.0 + (-v).exp())),
    }
}

/// Both operands brought to the output scale, combined, then stored.
fn rescaled<T: QuantizedDatum>(
    inputs: &[&Tensor],
    output: &mut Tensor,
    combine: impl Fn(i32, i32) -> i32,
) -> KestrelResult<()> {
    let (a, b) = (inputs[0], inputs[1]);
    let (aq, bq, yq) =
        (qparams(a.datum_type())?, qparams(b.datum_type())?, qparams(output.datum_type())?);
    let (sa, sb) = (scaler(aq.scale / yq.scale), scaler(bq.scale / yq.scale));
    binary_t::<T>(a, b, output, |x, y| {
        let x = lift(centered(x, aq.zero_point), sa);
        let y = lift(centered(y, bq.zero_point), sb);
        settle(combine(x, y), yq.zero_point)
    })
}

pub fn eltwise<T: QuantizedDatum>(
    e: EltwiseType,
    inputs: &[&Tensor],
    output: &mut Tensor,
) -> KestrelResult<()> {
    use EltwiseType::*;
    match e {
        Neg => lut::<T>(inputs[0], output, |v| -v),
        Abs => lut::<T>(inputs[0], output, f32::abs),
        Sum => rescaled::<T>(inputs, output, i32::saturating_add),
        Sub => rescaled::<T>(inputs, output, i32::saturating_sub),
        Min => rescaled::<T>(inputs, output, i32::min),
        Max => rescaled::<T>(inputs, output, i32::max),
        Prod => {
            let (a, b) = (inputs[0], inputs[1]);
            let (aq, bq, yq) =
                (qparams(a.datum_type())?, qparams(b.datum_type())?, qparams(output.datum_type())?);
            let s = scaler(aq.scale * bq.scale / yq.scale);
            binary_t::<T>(a, b, output, |x, y| {
                store(centered(x, aq.zero_point) * centered(y, bq.zero_point), s, yq.zero_point)
            })
        }
        Div | SqrDiff | Pow => {
            unsupported_combination!(OpKind::Eltwise, Backend::CpuQuantized, output.datum_type().kind())
        }
    }
}

pub fn add_n<T: QuantizedDatum>(inputs: &[&Tensor], output: &mut Tensor) -> KestrelResult<()> {
    let yq = qparams(output.datum_type())?;
    let terms = inputs
        .iter()
        .map(|t| -> KestrelResult<(&[T], i32, Scaler)> {
            let qp = qparams(t.datum_type())?;
            Ok((t.as_slice::<T>()?, qp.zero_point, scaler(qp.scale / yq.scale)))
        })
        .collect::<KestrelResult<TVec<_>>>()?;
    let y = output.as_slice_mut::<T>()?;
    for (ix, y) in y.iter_mut().enumerate() {
        let acc = terms.iter().fold(0i32, |acc, (data, zp, s)| {
            acc.saturating_add(lift(centered(data[ix], *zp), *s))
        });
        *y = settle(acc, yq.zero_point);
    }
    Ok(())
}

/// Max pooling keeps the largest storage value, average pooling divides
/// the sum of the in-bounds taps as part of the output rescale.
pub fn pool<T: QuantizedDatum>(
    x: &Tensor,
    params: &PoolParams,
    output: &mut Tensor,
) -> KestrelResult<()> {
    let geo = ConvGeometry::new(x.shape(), params.kernel, &params.as_conv())?;
    let (xq, yq) = (qparams(x.datum_type())?, qparams(output.datum_type())?);
    let max_scaler = scaler(xq.scale / yq.scale);
    let xs = x.as_slice::<T>()?;
    let c = geo.channels;
    let y = output.as_slice_mut::<T>()?;
    let mut out = y.iter_mut();
    for n in 0..geo.batch {
        let image = &xs[n * geo.input_h * geo.input_w * c..];
        for oy in 0..geo.output_h {
            for ox in 0..geo.output_w {
                for ci in 0..c {
                    let taps = (0..geo.kernel_h)
                        .filter_map(|ky| geo.input_y(oy, ky))
                        .flat_map(|iy| {
                            (0..geo.kernel_w)
                                .filter_map(move |kx| geo.input_x(ox, kx))
                                .map(move |ix| (iy * geo.input_w + ix) * c + ci)
                        })
                        .map(|offset| centered(image[offset], xq.zero_point));
                    let value = match params.pooling {
                        PoolingType::Max => {
                            store(taps.max().unwrap_or(0), max_scaler, yq.zero_point)
                        }
                        PoolingType::Avg => {
                            let (sum, count) =
                                taps.fold((0i32, 0usize), |(s, n), v| (s + v, n + 1));
                            if count == 0 {
                                T::saturate(yq.zero_point)
                            } else {
                                let s = scaler(xq.scale / (yq.scale * count as f32));
                                store(sum, s, yq.zero_point)
                            }
                        }
                    };
                    if let Some(y) = out.next() {
                        *y = value;
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::tests::*;
    use crate::backend::Backend;
    use crate::ops::*;
    use kestrel_data::internal::*;

    fn dequantized(t: &Tensor) -> Vec<f32> {
        t.cast_to::<f32>().unwrap().as_slice::<f32>().unwrap().to_vec()
    }

    #[test]
    fn add_within_one_step_of_float() {
        let (qa, qb, qy) = (QParams::new(128, 0.05), QParams::new(100, 0.1), QParams::new(128, 0.08));
        let a_real: Vec<f32> = (0..40).map(|i| (i as f32 * 0.37).sin() * 5.0).collect();
        let b_real: Vec<f32> = (0..40).map(|i| (i as f32 * 0.21).cos() * 4.0).collect();
        let a = qu8(&a_real, &[40], qa);
        let b = qu8(&b_real, &[40], qb);
        let def = OpDef::quantized(EltwiseType::Sum, qy);
        let y = eval(&registry(), Backend::CpuQuantized, &def, &[a.clone(), b.clone()]).unwrap();
        let expected: Vec<f32> = dequantized(&a).iter().zip(dequantized(&b)).map(|(a, b)| a + b).collect();
        for (found, expected) in dequantized(&y).iter().zip(expected) {
            assert!((found - expected).abs() <= qy.scale, "{found} vs {expected}");
        }
    }

    #[test]
    fn broadcast_prod() {
        let qp = QParams::new(128, 0.25);
        let a = qu8(&[1., 2., -3., 4.], &[2, 2], qp);
        let b = qu8(&[0.5, -1.], &[2], qp);
        let def = OpDef::quantized(EltwiseType::Prod, QParams::new(128, 0.125));
        let y = eval(&registry(), Backend::CpuQuantized, &def, &[a, b]).unwrap();
        assert_eq!(dequantized(&y), &[0.5, -2., -1.5, -4.]);
    }

    #[test]
    fn relu6_lut_saturates() {
        let qp = QParams::new(0, 0.1);
        let x = Tensor::from_shape(&[4], &[-50f32, 1., 5.5, 12.])
            .unwrap()
            .cast_to_dt(DatumType::QI8(qp))
            .unwrap()
            .into_owned();
        let y = eval(&registry(), Backend::CpuQuantized, &ActivationType::ReluX(6.0).into(), &[x])
            .unwrap();
        assert_eq!(y.as_slice::<i8>().unwrap(), &[0, 10, 55, 60]);
    }

    #[test]
    fn pools_exactly() {
        let qp = QParams::new(10, 0.5);
        let x = qu8(&[1., 7., 3., 4.], &[1, 2, 2, 1], qp);
        let max = PoolParams::new(PoolingType::Max, [2, 2], [2, 2], PaddingMode::Valid);
        let y = eval(&registry(), Backend::CpuQuantized, &max.into(), &[x.clone()]).unwrap();
        assert_eq!(dequantized(&y), &[7.]);
        let avg = PoolParams::new(PoolingType::Avg, [2, 2], [1, 1], PaddingMode::Same);
        let y = eval(&registry(), Backend::CpuQuantized, &avg.into(), &[x]).unwrap();
        // 3.75 rounds away from zero
        assert_eq!(dequantized(&y), &[4., 5.5, 3.5, 4.]);
    }

    #[test]
    fn add_n_mixed_scales() {
        let a = qu8(&[1., 2.], &[2], QParams::new(0, 0.5));
        let b = qu8(&[0.25, -0.25], &[2], QParams::new(100, 0.25));
        let c = qu8(&[3., 3.], &[2], QParams::new(0, 1.0));
        let def = OpDef::quantized(OpParams::AddN, QParams::new(50, 0.25));
        let y = eval(&registry(), Backend::CpuQuantized, &def, &[a, b, c]).unwrap();
        assert_eq!(dequantized(&y), &[4.25, 4.75]);
    }
}
