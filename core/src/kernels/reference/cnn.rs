use kestrel_data::internal::*;
use ndarray::Ix4;

use crate::errors::KestrelResult;
use crate::ops::{ConvGeometry, ConvParams, PoolParams, PoolingType, ResizeParams};

fn geometry(x: &Tensor, filter: &Tensor, params: &ConvParams) -> KestrelResult<ConvGeometry> {
    ConvGeometry::new(x.shape(), [filter.shape()[0], filter.shape()[1]], params)
}

/// NHWC input, HWIO filter, optional bias.
pub fn conv2d(inputs: &[&Tensor], params: &ConvParams, output: &mut Tensor) -> KestrelResult<()> {
    let geo = geometry(inputs[0], inputs[1], params)?;
    let x = inputs[0].to_array_view::<f32>()?.into_dimensionality::<Ix4>()?;
    let w = inputs[1].to_array_view::<f32>()?.into_dimensionality::<Ix4>()?;
    let bias = inputs.get(2).map(|b| b.as_slice::<f32>()).transpose()?;
    let mut y = output.to_array_view_mut::<f32>()?.into_dimensionality::<Ix4>()?;
    let (cin, cout) = (w.shape()[2], w.shape()[3]);
    for n in 0..geo.batch {
        for oy in 0..geo.output_h {
            for ox in 0..geo.output_w {
                for co in 0..cout {
                    let mut sum = bias.map(|b| b[co]).unwrap_or(0.0);
                    for ky in 0..geo.kernel_h {
                        let Some(iy) = geo.input_y(oy, ky) else { continue };
                        for kx in 0..geo.kernel_w {
                            let Some(ix) = geo.input_x(ox, kx) else { continue };
                            for ci in 0..cin {
                                sum += x[(n, iy, ix, ci)] * w[(ky, kx, ci, co)];
                            }
                        }
                    }
                    y[(n, oy, ox, co)] = sum;
                }
            }
        }
    }
    Ok(())
}

/// NHWC input, HWIM filter: output channel `c * M + m` only reads input
/// channel `c`.
pub fn depthwise_conv2d(
    inputs: &[&Tensor],
    params: &ConvParams,
    output: &mut Tensor,
) -> KestrelResult<()> {
    let geo = geometry(inputs[0], inputs[1], params)?;
    let x = inputs[0].to_array_view::<f32>()?.into_dimensionality::<Ix4>()?;
    let w = inputs[1].to_array_view::<f32>()?.into_dimensionality::<Ix4>()?;
    let bias = inputs.get(2).map(|b| b.as_slice::<f32>()).transpose()?;
    let mut y = output.to_array_view_mut::<f32>()?.into_dimensionality::<Ix4>()?;
    let multiplier = w.shape()[3];
    for n in 0..geo.batch {
        for oy in 0..geo.output_h {
            for ox in 0..geo.output_w {
                for c in 0..geo.channels {
                    for m in 0..multiplier {
                        let co = c * multiplier + m;
                        let mut sum = bias.map(|b| b[co]).unwrap_or(0.0);
                        for ky in 0..geo.kernel_h {
                            let Some(iy) = geo.input_y(oy, ky) else { continue };
                            for kx in 0..geo.kernel_w {
                                let Some(ix) = geo.input_x(ox, kx) else { continue };
                                sum += x[(n, iy, ix, c)] * w[(ky, kx, c, m)];
                            }
                        }
                        y[(n, oy, ox, co)] = sum;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Max or average over the in-bounds taps of each window.
pub fn pool(x: &Tensor, params: &PoolParams, output: &mut Tensor) -> KestrelResult<()> {
    let geo = ConvGeometry::new(x.shape(), params.kernel, &params.as_conv())?;
    let x = x.to_array_view::<f32>()?.into_dimensionality::<Ix4>()?;
    let mut y = output.to_array_view_mut::<f32>()?.into_dimensionality::<Ix4>()?;
    for n in 0..geo.batch {
        for oy in 0..geo.output_h {
            for ox in 0..geo.output_w {
                for c in 0..geo.channels {
                    let mut acc = match params.pooling {
                        PoolingType::Max => f32::NEG_INFINITY,
                        PoolingType::Avg => 0.0,
                    };
                    let mut count = 0usize;
                    for ky in 0..geo.kernel_h {
                        let Some(iy) = geo.input_y(oy, ky) else { continue };
                        for kx in 0..geo.kernel_w {
                            let Some(ix) = geo.input_x(ox, kx) else { continue };
                            let v = x[(n, iy, ix, c)];
                            acc = match params.pooling {
                                PoolingType::Max => acc.max(v),
                                PoolingType::Avg => acc + v,
                            };
                            count += 1;
                        }
                    }
                    y[(n, oy, ox, c)] = match params.pooling {
                        PoolingType::Avg if count > 0 => acc / count as f32,
                        _ if count == 0 => 0.0,
                        _ => acc,
                    };
                }
            }
        }
    }
    Ok(())
}

/// Source coordinate scale of one resized axis.
pub(crate) fn resize_scale(input: usize, output: usize, align_corners: bool) -> f32 {
    if align_corners && output > 1 {
        (input - 1) as f32 / (output - 1) as f32
    } else {
        input as f32 / output as f32
    }
}

/// Low and high source indices of a destination index, and the weight of
/// the high one.
#[inline]
pub(crate) fn resize_taps(dst: usize, scale: f32, input: usize) -> (usize, usize, f32) {
    let src = dst as f32 * scale;
    let low = (src.floor() as usize).min(input - 1);
    let high = (low + 1).min(input - 1);
    (low, high, src - low as f32)
}

pub fn resize_bilinear(x: &Tensor, params: &ResizeParams, output: &mut Tensor) -> KestrelResult<()> {
    let &[batch, in_h, in_w, channels] = x.shape() else {
        bail_shape!("expected NHWC, got {:?}", x)
    };
    let [out_h, out_w] = params.size;
    let (sy, sx) = (
        resize_scale(in_h, out_h, params.align_corners),
        resize_scale(in_w, out_w, params.align_corners),
    );
    let x = x.to_array_view::<f32>()?.into_dimensionality::<Ix4>()?;
    let mut y = output.to_array_view_mut::<f32>()?.into_dimensionality::<Ix4>()?;
    for n in 0..batch {
        for oy in 0..out_h {
            let (y0, y1, dy) = resize_taps(oy, sy, in_h);
            for ox in 0..out_w {
                let (x0, x1, dx) = resize_taps(ox, sx, in_w);
                for c in 0..channels {
                    let top = x[(n, y0, x0, c)] * (1.0 - dx) + x[(n, y0, x1, c)] * dx;
                    let bottom = x[(n, y1, x0, c)] * (1.0 - dx) + x[(n, y1, x1, c)] * dx;
                    y[(n, oy, ox, c)] = top * (1.0 - dy) + bottom * dy;
                }
            }
        }
    }
    Ok(())
}
