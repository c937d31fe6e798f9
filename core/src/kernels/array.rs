//! Layout operators, generic over the storage type. Shared by every host
//! kernel set: they move values without interpreting them.
use kestrel_data::internal::*;
use ndarray::{Axis, Slice};

use crate::errors::KestrelResult;

fn copy_t<T: Datum>(input: &Tensor, output: &mut Tensor) -> KestrelResult<()> {
    output.as_slice_mut::<T>()?.copy_from_slice(input.as_slice::<T>()?);
    Ok(())
}

/// Same values, output shape already set (reshape, identity).
pub fn copy(input: &Tensor, output: &mut Tensor) -> KestrelResult<()> {
    dispatch_copy!(copy_t(input.datum_type())(input, output))
}

fn concat_t<T: Datum>(inputs: &[&Tensor], axis: usize, output: &mut Tensor) -> KestrelResult<()> {
    let mut view = output.to_array_view_mut::<T>()?;
    let mut offset = 0;
    for input in inputs {
        let len = input.shape()[axis];
        view.slice_axis_mut(Axis(axis), Slice::from(offset..offset + len))
            .assign(&input.to_array_view::<T>()?);
        offset += len;
    }
    Ok(())
}

pub fn concat(inputs: &[&Tensor], axis: usize, output: &mut Tensor) -> KestrelResult<()> {
    dispatch_copy!(concat_t(output.datum_type())(inputs, axis, output))
}

fn pad_t<T: Datum>(
    input: &Tensor,
    pads: &[(usize, usize)],
    value: &Tensor,
    output: &mut Tensor,
) -> KestrelResult<()> {
    let value = *value.to_scalar::<T>()?;
    let mut view = output.to_array_view_mut::<T>()?;
    view.fill(value);
    let mut inner = view.view_mut();
    for (axis, (before, _)) in pads.iter().enumerate() {
        let len = input.shape()[axis];
        inner.slice_axis_inplace(Axis(axis), Slice::from(*before..*before + len));
    }
    inner.assign(&input.to_array_view::<T>()?);
    Ok(())
}

/// Constant padding. `value` is a scalar of the output type.
pub fn pad(
    input: &Tensor,
    pads: &[(usize, usize)],
    value: &Tensor,
    output: &mut Tensor,
) -> KestrelResult<()> {
    dispatch_copy!(pad_t(input.datum_type())(input, pads, value, output))
}

/// Pad value in the tensor type: quantized types quantize it.
pub fn pad_value(value: f32, dt: DatumType) -> KestrelResult<Tensor> {
    Ok(tensor0(value).cast_to_dt(dt)?.into_owned())
}

fn space_to_depth_t<T: Datum>(input: &Tensor, block: usize, output: &mut Tensor) -> KestrelResult<()> {
    let &[n, h, w, c] = input.shape() else { bail_shape!("expected NHWC, got {:?}", input) };
    let blocks = input
        .to_array_view::<T>()?
        .into_shape_with_order(vec![n, h / block, block, w / block, block, c])?
        .permuted_axes(vec![0, 1, 3, 2, 4, 5]);
    output
        .to_array_view_mut::<T>()?
        .into_shape_with_order(vec![n, h / block, w / block, block, block, c])?
        .assign(&blocks);
    Ok(())
}

pub fn space_to_depth(input: &Tensor, block: usize, output: &mut Tensor) -> KestrelResult<()> {
    dispatch_copy!(space_to_depth_t(input.datum_type())(input, block, output))
}

fn depth_to_space_t<T: Datum>(input: &Tensor, block: usize, output: &mut Tensor) -> KestrelResult<()> {
    let &[n, h, w, c] = input.shape() else { bail_shape!("expected NHWC, got {:?}", input) };
    let spread = input
        .to_array_view::<T>()?
        .into_shape_with_order(vec![n, h, w, block, block, c / (block * block)])?
        .permuted_axes(vec![0, 1, 3, 2, 4, 5]);
    output
        .to_array_view_mut::<T>()?
        .into_shape_with_order(vec![n, h, block, w, block, c / (block * block)])?
        .assign(&spread);
    Ok(())
}

pub fn depth_to_space(input: &Tensor, block: usize, output: &mut Tensor) -> KestrelResult<()> {
    dispatch_copy!(depth_to_space_t(input.datum_type())(input, block, output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_last_axis() {
        let mut out = Tensor::zero::<i32>(&[2, 3]);
        concat(&[&tensor2(&[[1i32], [4]]), &tensor2(&[[2i32, 3], [5, 6]])], 1, &mut out).unwrap();
        assert_eq!(out, tensor2(&[[1i32, 2, 3], [4, 5, 6]]));
    }

    #[test]
    fn pad_quantized() {
        let dt = DatumType::QU8(QParams::new(10, 0.5));
        let input = tensor1(&[1u8, 2]).into_quantized(QParams::new(10, 0.5)).unwrap();
        let mut out = Tensor::zero_dt(dt, &[4]);
        pad(&input, &[(1, 1)], &pad_value(1.0, dt).unwrap(), &mut out).unwrap();
        assert_eq!(out.as_slice::<u8>().unwrap(), &[12, 1, 2, 12]);
    }

    #[test]
    fn space_depth_round_trip() {
        let input = Tensor::from_shape(&[1, 2, 2, 1], &[1f32, 2., 3., 4.]).unwrap();
        let mut s2d = Tensor::zero::<f32>(&[1, 1, 1, 4]);
        space_to_depth(&input, 2, &mut s2d).unwrap();
        assert_eq!(s2d.as_slice::<f32>().unwrap(), &[1., 2., 3., 4.]);
        let mut back = Tensor::zero::<f32>(&[1, 2, 2, 1]);
        depth_to_space(&s2d, 2, &mut back).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn space_to_depth_channels() {
        let input = Tensor::from_shape(&[1, 2, 2, 2], &[1i32, 10, 2, 20, 3, 30, 4, 40]).unwrap();
        let mut out = Tensor::zero::<i32>(&[1, 1, 1, 8]);
        space_to_depth(&input, 2, &mut out).unwrap();
        assert_eq!(out.as_slice::<i32>().unwrap(), &[1, 10, 2, 20, 3, 30, 4, 40]);
    }
}
