use kestrel_data::internal::*;

use super::{centered, qparams, scaler, store};
use crate::errors::KestrelResult;
use crate::ops::infer::mk;
use crate::ops::{ConvGeometry, ConvParams, MatMulParams};

fn centered_data<T: QuantizedDatum>(t: &Tensor) -> KestrelResult<Vec<i32>> {
    let zp = qparams(t.datum_type())?.zero_point;
    Ok(t.as_slice::<T>()?.iter().map(|&q| centered(q, zp)).collect())
}

fn bias<'a>(inputs: &[&'a Tensor]) -> KestrelResult<Option<&'a [i32]>> {
    inputs.get(2).map(|b| b.as_slice::<i32>()).transpose()
}

/// im2col over the centered input, then an i32 product against the
/// centered HWIO filter.
pub fn conv2d<T: QuantizedDatum>(
    inputs: &[&Tensor],
    params: &ConvParams,
    output: &mut Tensor,
) -> KestrelResult<()> {
    let (x, w) = (inputs[0], inputs[1]);
    let geo = ConvGeometry::new(x.shape(), [w.shape()[0], w.shape()[1]], params)?;
    let cout = w.shape()[3];
    let (xq, wq, yq) =
        (qparams(x.datum_type())?, qparams(w.datum_type())?, qparams(output.datum_type())?);
    let mut acc = vec![0i32; geo.output_pixels() * cout];
    if acc.is_empty() {
        return Ok(());
    }
    let patches = geo.im2col(&centered_data::<T>(x)?, 0i32);
    (kestrel_linalg::ops().mmm_i32)().run(
        geo.output_pixels(),
        geo.patch_len(),
        cout,
        &patches,
        &centered_data::<T>(w)?,
        &mut acc,
    )?;
    let bias = bias(inputs)?;
    let s = scaler(xq.scale * wq.scale / yq.scale);
    let y = output.as_slice_mut::<T>()?;
    for (y, acc) in y.chunks_mut(cout).zip(acc.chunks(cout)) {
        for (co, (y, &a)) in y.iter_mut().zip(acc).enumerate() {
            *y = store(a.wrapping_add(bias.map(|b| b[co]).unwrap_or(0)), s, yq.zero_point);
        }
    }
    Ok(())
}

pub fn depthwise_conv2d<T: QuantizedDatum>(
    inputs: &[&Tensor],
    params: &ConvParams,
    output: &mut Tensor,
) -> KestrelResult<()> {
    let (x, w) = (inputs[0], inputs[1]);
    let geo = ConvGeometry::new(x.shape(), [w.shape()[0], w.shape()[1]], params)?;
    let multiplier = w.shape()[3];
    let (xq, wq, yq) =
        (qparams(x.datum_type())?, qparams(w.datum_type())?, qparams(output.datum_type())?);
    let s = scaler(xq.scale * wq.scale / yq.scale);
    let bias = bias(inputs)?;
    let xs = centered_data::<T>(x)?;
    let ws = centered_data::<T>(w)?;
    let c = geo.channels;
    let y = output.as_slice_mut::<T>()?;
    let mut out = y.iter_mut();
    for n in 0..geo.batch {
        let image = &xs[n * geo.input_h * geo.input_w * c..];
        for oy in 0..geo.output_h {
            for ox in 0..geo.output_w {
                for ci in 0..c {
                    for m in 0..multiplier {
                        let co = ci * multiplier + m;
                        let mut acc = bias.map(|b| b[co]).unwrap_or(0);
                        for ky in 0..geo.kernel_h {
                            let Some(iy) = geo.input_y(oy, ky) else { continue };
                            for kx in 0..geo.kernel_w {
                                let Some(ix) = geo.input_x(ox, kx) else { continue };
                                let xv = image[(iy * geo.input_w + ix) * c + ci];
                                let wv = ws[((ky * geo.kernel_w + kx) * c + ci) * multiplier + m];
                                acc = acc.wrapping_add(xv * wv);
                            }
                        }
                        if let Some(y) = out.next() {
                            *y = store(acc, s, yq.zero_point);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Centered trailing matrices of `t`, row-major, transposed if asked.
fn centered_matrices<T: QuantizedDatum>(t: &Tensor, transpose: bool) -> KestrelResult<Vec<i32>> {
    let data = centered_data::<T>(t)?;
    if !transpose {
        return Ok(data);
    }
    let (r, c) = mk(t.shape(), false);
    let batch: usize = t.shape()[..t.rank() - 2].iter().product();
    let mut out = Vec::with_capacity(data.len());
    for m in (0..batch).map(|i| &data[i * r * c..][..r * c]) {
        for j in 0..c {
            out.extend((0..r).map(|i| m[i * c + j]));
        }
    }
    Ok(out)
}

pub fn matmul<T: QuantizedDatum>(
    a: &Tensor,
    b: &Tensor,
    params: &MatMulParams,
    output: &mut Tensor,
) -> KestrelResult<()> {
    let (m, k) = mk(a.shape(), params.transpose_a);
    let (_, n) = mk(b.shape(), params.transpose_b);
    let (aq, bq, yq) =
        (qparams(a.datum_type())?, qparams(b.datum_type())?, qparams(output.datum_type())?);
    if m * n == 0 {
        return Ok(());
    }
    let s = scaler(aq.scale * bq.scale / yq.scale);
    let y = output.as_slice_mut::<T>()?;
    if k == 0 {
        y.fill(store(0, s, yq.zero_point));
        return Ok(());
    }
    let a = centered_matrices::<T>(a, params.transpose_a)?;
    let b = centered_matrices::<T>(b, params.transpose_b)?;
    let mmm = (kestrel_linalg::ops().mmm_i32)();
    let mut acc = vec![0i32; m * n];
    for i in 0..y.len() / (m * n) {
        mmm.run(m, k, n, &a[i * m * k..][..m * k], &b[i * k * n..][..k * n], &mut acc)?;
        for (y, &acc) in y[i * m * n..][..m * n].iter_mut().zip(&acc) {
            *y = store(acc, s, yq.zero_point);
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

    #[test]
    fn conv_with_bias_and_padding() {
        let qp = QParams::new(128, 0.5);
        let x = qu8(&[1., 2., 3., 4.], &[1, 2, 2, 1], qp);
        let w = qu8(&[1., 0., 0., 1.], &[2, 2, 1, 1], qp);
        // bias 3 in the 0.25 scale of input * filter
        let b = tensor1(&[3i32]);
        let def = OpDef::quantized(
            OpParams::Conv2D(ConvParams::new([1, 1], [1, 1], PaddingMode::Same)),
            QParams::new(0, 0.25),
        );
        let y = eval(&registry(), Backend::CpuQuantized, &def, &[x, w, b]).unwrap();
        // 1 + 4, 2, 3, 4 plus 0.75
        assert_eq!(y.as_slice::<u8>().unwrap(), &[23, 11, 15, 19]);
    }

    #[test]
    fn depthwise_matches_float() {
        let qp = QParams::new(100, 0.125);
        let x = qu8(&[1., -1., 0.5, 2.], &[1, 2, 1, 2], qp);
        let w = qu8(&[1., 2., -0.5, 0.25], &[2, 1, 2, 1], qp);
        let def = OpDef::quantized(OpParams::DepthwiseConv2D(ConvParams::default()), qp);
        let registry = registry();
        let y = eval(&registry, Backend::CpuQuantized, &def, &[x.clone(), w.clone()]).unwrap();
        let float = float_eval(&registry, &def, &[x, w]);
        assert_eq!(y.cast_to::<f32>().unwrap().as_slice::<f32>().unwrap(), &[0.75, -1.5]);
        assert_eq!(float.as_slice::<f32>().unwrap(), &[0.75, -1.5]);
    }

    #[test]
    fn matmul_transposed_i8() {
        let qp = QParams::new(0, 1.0 / 16.0);
        let to_qi8 = |data: &[f32], shape: &[usize]| {
            Tensor::from_shape(shape, data)
                .unwrap()
                .cast_to_dt(DatumType::QI8(qp))
                .unwrap()
                .into_owned()
        };
        let a = to_qi8(&[1., 0.5, -1., 2.], &[2, 2]);
        let b = to_qi8(&[0.25, 1., 0.5, -0.5], &[2, 2]);
        let def = OpDef::quantized(MatMulParams::new(true, false), QParams::new(0, 0.125));
        let y = eval(&registry(), Backend::CpuQuantized, &def, &[a, b]).unwrap();
        // a^T = [[1, -1], [0.5, 2]]
        let expected = [0.25 - 0.5, 1. + 0.5, 0.125 + 1., 0.5 - 1.];
        assert_eq!(y.cast_to::<f32>().unwrap().as_slice::<f32>().unwrap(), &expected);
    }
}
