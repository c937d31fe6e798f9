//! `Tensor`, kestrel main data object of interest.
use crate::datum::{Datum, DatumType, QParams};
use crate::TVec;
use itertools::Itertools;
use ndarray::prelude::*;
use num_traits::{AsPrimitive, One, Zero};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

mod buffer;
pub mod litteral;
pub mod view;

pub use buffer::{Buffer, BUFFER_ALIGNMENT};

/// Tolerance levels for `Tensor::close_enough`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Approximation {
    Exact,
    Close,
    Approximate,
}

impl Approximation {
    /// (absolute, relative) tolerance for float comparisons.
    pub fn atol_and_rtol(&self) -> (f32, f32) {
        match self {
            Approximation::Exact => (0.0, 0.0),
            Approximation::Close => (1e-5, 1e-4),
            Approximation::Approximate => (5e-4, 1e-3),
        }
    }
}

impl From<bool> for Approximation {
    fn from(approx: bool) -> Approximation {
        if approx { Approximation::Approximate } else { Approximation::Exact }
    }
}

/// Tensor is a concrete, host-resident tensor in kestrel.
///
/// Data is stored contiguously in row-major order, in a 16-byte aligned
/// buffer. Byte size is always `len() * datum_type().size_of()`.
pub struct Tensor {
    dt: DatumType,
    shape: TVec<usize>,
    strides: TVec<isize>,
    len: usize,
    buffer: Buffer,
}

impl Clone for Tensor {
    fn clone(&self) -> Tensor {
        self.deep_clone()
    }
}

impl Default for Tensor {
    fn default() -> Tensor {
        litteral::tensor0(0f32)
    }
}

impl Tensor {
    /// Create an uninitialized tensor (dt as type paramater).
    ///
    /// # Safety
    ///
    /// Content must be written before being read.
    pub unsafe fn uninitialized<T: Datum>(shape: &[usize]) -> Tensor {
        unsafe { Self::uninitialized_dt(T::datum_type(), shape) }
    }

    /// Create an uninitialized tensor.
    ///
    /// # Safety
    ///
    /// Content must be written before being read.
    pub unsafe fn uninitialized_dt(dt: DatumType, shape: &[usize]) -> Tensor {
        let len = shape.iter().product::<usize>();
        let buffer = unsafe { Buffer::uninitialized(len * dt.size_of()) };
        Self::wrap(dt, shape, buffer)
    }

    fn wrap(dt: DatumType, shape: &[usize], buffer: Buffer) -> Tensor {
        let mut t = Tensor { dt, shape: shape.into(), strides: tvec!(), len: 0, buffer };
        t.update_strides_and_len();
        t
    }

    /// Create a tensor with all bytes set to zero.
    ///
    /// For quantized types, this is the quantized value 0, not the real 0.0.
    pub fn zero_dt(dt: DatumType, shape: &[usize]) -> Tensor {
        let len = shape.iter().product::<usize>();
        Self::wrap(dt, shape, Buffer::zeroed(len * dt.size_of()))
    }

    pub fn zero<T: Datum>(shape: &[usize]) -> Tensor {
        Self::zero_dt(T::datum_type(), shape)
    }

    pub fn zero_scalar<T: Datum>() -> Tensor {
        Self::zero::<T>(&[])
    }

    /// Create a tensor from a shape and row-major data.
    pub fn from_shape<T: Datum>(shape: &[usize], data: &[T]) -> anyhow::Result<Tensor> {
        let len = shape.iter().product::<usize>();
        anyhow::ensure!(
            len == data.len(),
            "Shape {:?} is incompatible with data length {}",
            shape,
            data.len()
        );
        unsafe {
            let mut t = Tensor::uninitialized::<T>(shape);
            t.as_slice_mut_unchecked::<T>().copy_from_slice(data);
            Ok(t)
        }
    }

    /// Build a tensor over an existing buffer. The buffer byte size must be
    /// exactly the shape volume times the datum size.
    pub fn from_buffer(dt: DatumType, shape: &[usize], buffer: Buffer) -> anyhow::Result<Tensor> {
        let bytes = shape.iter().product::<usize>() * dt.size_of();
        anyhow::ensure!(
            bytes == buffer.len(),
            "Buffer of {} bytes can not hold a {:?} tensor of shape {:?} ({} bytes)",
            buffer.len(),
            dt,
            shape,
            bytes
        );
        Ok(Self::wrap(dt, shape, buffer))
    }

    /// Detach the storage from the tensor.
    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }

    /// Get the number of dimensions (or axes) of the tensor.
    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Get the shape of the tensor.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the number of values in the tensor.
    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Size of the tensor storage, in bytes.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.buffer.len()
    }

    /// Get the shape of the tensor.
    #[inline]
    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    fn update_strides_and_len(&mut self) {
        self.strides.clear();
        compute_natural_stride_to(&mut self.strides, &self.shape);
        self.len = if self.rank() == 0 {
            1
        } else {
            self.strides[0] as usize * self.shape[0]
        }
    }

    /// Reshape the tensor to `shape`.
    pub fn set_shape(&mut self, shape: &[usize]) -> anyhow::Result<()> {
        if self.len() != shape.iter().product::<usize>() {
            anyhow::bail!("Invalid reshape {:?} to {:?}", self.shape, shape);
        }
        self.shape = shape.into();
        self.update_strides_and_len();
        Ok(())
    }

    /// Reshape the tensor to `shape`.
    pub fn into_shape(mut self, shape: &[usize]) -> anyhow::Result<Tensor> {
        self.set_shape(shape)?;
        Ok(self)
    }

    /// Get the datum type of the tensor.
    #[inline]
    pub fn datum_type(&self) -> DatumType {
        self.dt
    }

    /// Set the datum type of the tensor.
    ///
    /// # Safety
    ///
    /// The new type must have the same storage size, and the content must
    /// be valid for it.
    #[inline]
    pub unsafe fn set_datum_type(&mut self, dt: DatumType) {
        self.dt = dt
    }

    /// Tag an 8-bit tensor with quantization parameters, without touching
    /// its content.
    pub fn into_quantized(mut self, qp: QParams) -> anyhow::Result<Tensor> {
        self.dt = self.dt.quantize(qp)?;
        Ok(self)
    }

    /// Dump the tensor in a human readable form.
    ///
    /// `force_full` will force the tensor to be dump in full even if it is big.
    pub fn dump(&self, force_full: bool) -> anyhow::Result<String> {
        unsafe fn dump_t<D: Datum>(tensor: &Tensor, n: usize) -> String {
            unsafe { tensor.as_slice_unchecked::<D>()[0..n].iter().join(", ") }
        }
        unsafe {
            let trunc = self.len() > 12 && !force_full;
            let data = dispatch_copy!(dump_t(self.datum_type())(
                self,
                if trunc { 12 } else { self.len() }
            ));
            Ok(format!(
                "{},{:?} {}{}",
                self.shape.iter().join(","),
                self.dt,
                data,
                if trunc { "..." } else { "" }
            ))
        }
    }

    /// Compare two tensors, allowing for rounding errors.
    ///
    /// Quantized tensors are compared on their real values; in non exact
    /// modes, they are allowed to differ by one quantization step.
    pub fn close_enough(
        &self,
        other: &Self,
        approx: impl Into<Approximation>,
    ) -> anyhow::Result<()> {
        let approx = approx.into();
        if self.shape() != other.shape() {
            anyhow::bail!("Shape mismatch {:?} != {:?}", self.shape(), other.shape())
        }
        if approx == Approximation::Exact {
            if self.eq(other) {
                return Ok(());
            } else {
                anyhow::bail!("Mismatch {:?} != {:?}", self, other)
            }
        }
        let (mut atol, rtol) = approx.atol_and_rtol();
        for qp in [self.dt.qparams(), other.dt.qparams()].into_iter().flatten() {
            atol = atol.max(qp.scale * 1.001);
        }
        let ma = self.cast_to::<f32>()?;
        let ma = ma.to_array_view::<f32>()?;
        let mb = other.cast_to::<f32>()?;
        let mb = mb.to_array_view::<f32>()?;
        ndarray::indices_of(&ma).into_iter().try_for_each(|indices| {
            let a = ma[&indices];
            let b = mb[&indices];
            if !((a.is_nan() && b.is_nan())
                || (a.is_infinite() && b.is_infinite() && a.signum() == b.signum())
                || (a - b).abs() <= atol + rtol * b.abs())
            {
                anyhow::bail!("Mismatch at {:?} {} != {}", indices.slice(), a, b)
            }
            Ok(())
        })
    }

    /// Transform the tensor into a `ndarray::Array`.
    pub fn into_array<D: Datum>(self) -> anyhow::Result<ArrayD<D>> {
        Ok(self.to_array_view::<D>()?.to_owned())
    }

    pub(crate) fn check_for_access<D: Datum>(&self) -> anyhow::Result<()> {
        if self.datum_type().unquantized() != D::datum_type() {
            anyhow::bail!(
                "Tensor datum type error: tensor is {:?}, accessed as {:?}",
                self.datum_type(),
                D::datum_type(),
            );
        }
        Ok(())
    }

    /// Transform the data as a `ndarray::Array`.
    pub fn to_array_view<D: Datum>(&self) -> anyhow::Result<ArrayViewD<'_, D>> {
        self.check_for_access::<D>()?;
        unsafe { Ok(self.to_array_view_unchecked()) }
    }

    /// Transform the data as a mutable `ndarray::Array`.
    pub fn to_array_view_mut<D: Datum>(&mut self) -> anyhow::Result<ArrayViewMutD<'_, D>> {
        self.check_for_access::<D>()?;
        unsafe { Ok(self.to_array_view_mut_unchecked()) }
    }

    /// Transform the data as a `ndarray::Array`.
    ///
    /// # Safety
    ///
    /// `D` must be the storage type of the tensor.
    pub unsafe fn to_array_view_unchecked<D: Datum>(&self) -> ArrayViewD<'_, D> {
        unsafe { ArrayViewD::from_shape_ptr(&*self.shape, self.buffer.as_ptr() as *const D) }
    }

    /// Transform the data as a mutable `ndarray::Array`.
    ///
    /// # Safety
    ///
    /// `D` must be the storage type of the tensor.
    pub unsafe fn to_array_view_mut_unchecked<D: Datum>(&mut self) -> ArrayViewMutD<'_, D> {
        unsafe { ArrayViewMutD::from_shape_ptr(&*self.shape, self.buffer.as_mut_ptr() as *mut D) }
    }

    /// Access the data as a pointer.
    pub fn as_ptr<D: Datum>(&self) -> anyhow::Result<*const D> {
        self.check_for_access::<D>()?;
        Ok(self.buffer.as_ptr() as *const D)
    }

    /// Access the data as a mutable pointer.
    pub fn as_ptr_mut<D: Datum>(&mut self) -> anyhow::Result<*mut D> {
        self.check_for_access::<D>()?;
        Ok(self.buffer.as_mut_ptr() as *mut D)
    }

    /// Access the data as a slice.
    pub fn as_slice<D: Datum>(&self) -> anyhow::Result<&[D]> {
        self.check_for_access::<D>()?;
        unsafe { Ok(self.as_slice_unchecked()) }
    }

    /// Access the data as a mutable slice.
    pub fn as_slice_mut<D: Datum>(&mut self) -> anyhow::Result<&mut [D]> {
        self.check_for_access::<D>()?;
        unsafe { Ok(self.as_slice_mut_unchecked()) }
    }

    /// Access the data as a slice.
    ///
    /// # Safety
    ///
    /// `D` must be the storage type of the tensor.
    pub unsafe fn as_slice_unchecked<D: Datum>(&self) -> &[D] {
        unsafe { std::slice::from_raw_parts::<D>(self.buffer.as_ptr() as *const D, self.len()) }
    }

    /// Access the data as a mutable slice.
    ///
    /// # Safety
    ///
    /// `D` must be the storage type of the tensor.
    pub unsafe fn as_slice_mut_unchecked<D: Datum>(&mut self) -> &mut [D] {
        unsafe {
            std::slice::from_raw_parts_mut::<D>(self.buffer.as_mut_ptr() as *mut D, self.len())
        }
    }

    /// Access the data as a scalar.
    pub fn to_scalar<D: Datum>(&self) -> anyhow::Result<&D> {
        self.check_for_access::<D>()?;
        if self.len() == 0 {
            anyhow::bail!("to_scalar called on empty tensor ({:?})", self)
        }
        unsafe { Ok(&self.as_slice_unchecked::<D>()[0]) }
    }

    /// Raw content, as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_bytes()
    }

    /// Raw content, as mutable bytes.
    ///
    /// # Safety
    ///
    /// Written bytes must form valid values of the datum type (0 or 1 for
    /// booleans).
    pub unsafe fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.buffer.as_bytes_mut()
    }

    fn eq_dt(&self, other: &Tensor) -> bool {
        unsafe fn eq_t<D: Datum>(me: &Tensor, other: &Tensor) -> bool {
            unsafe { me.as_slice_unchecked::<D>() == other.as_slice_unchecked::<D>() }
        }
        unsafe {
            self.datum_type() == other.datum_type()
                && self.shape() == other.shape()
                && dispatch_copy!(eq_t(self.dt)(self, other))
        }
    }

    /// Optionnaly convert data to a tensor with a new DatumType.
    pub fn cast_to<D: Datum>(&self) -> anyhow::Result<Cow<'_, Tensor>> {
        self.cast_to_dt(D::datum_type())
    }

    /// Optionnaly convert data to a tensor with a new DatumType.
    ///
    /// Quantized sources are dequantized, quantized destinations are
    /// quantized with rounding to nearest and saturation. Float to integer
    /// casts saturate.
    pub fn cast_to_dt(&self, dst_dt: DatumType) -> anyhow::Result<Cow<'_, Tensor>> {
        if self.dt == dst_dt {
            return Ok(Cow::Borrowed(self));
        }
        if let Some(qp) = self.dt.qparams() {
            let real = dispatch_quantized!(dequantize_t(self.dt)(self, qp))?;
            return if dst_dt == DatumType::F32 {
                Ok(Cow::Owned(real))
            } else {
                Ok(Cow::Owned(real.cast_to_dt(dst_dt)?.into_owned()))
            };
        }
        if let Some(qp) = dst_dt.qparams() {
            let real = self.cast_to::<f32>()?;
            let real = real.as_slice::<f32>()?;
            return dispatch_quantized!(quantize_t(dst_dt)(self.shape(), real, dst_dt, qp))
                .map(Cow::Owned);
        }
        let mut result = Tensor::zero_dt(dst_dt, self.shape());
        unsafe {
            match self.dt {
                DatumType::Bool => {
                    let src = self.as_slice_unchecked::<bool>();
                    match dst_dt {
                        DatumType::U8 => cast_from_bool::<u8>(src, result.as_slice_mut_unchecked()),
                        DatumType::I8 => cast_from_bool::<i8>(src, result.as_slice_mut_unchecked()),
                        DatumType::I32 => {
                            cast_from_bool::<i32>(src, result.as_slice_mut_unchecked())
                        }
                        DatumType::F32 => {
                            cast_from_bool::<f32>(src, result.as_slice_mut_unchecked())
                        }
                        _ => anyhow::bail!("Unsupported cast from {:?} to {:?}", self.dt, dst_dt),
                    }
                }
                DatumType::U8 => cast_number::<u8>(self, &mut result)?,
                DatumType::I8 => cast_number::<i8>(self, &mut result)?,
                DatumType::I32 => cast_number::<i32>(self, &mut result)?,
                DatumType::F32 => cast_number::<f32>(self, &mut result)?,
                _ => anyhow::bail!("Unsupported cast from {:?} to {:?}", self.dt, dst_dt),
            }
        }
        Ok(Cow::Owned(result))
    }

    /// Access the data as a scalar, after a cast.
    pub fn cast_to_scalar<D: Datum>(&self) -> anyhow::Result<D> {
        let casted = self.cast_to::<D>()?;
        casted.to_scalar::<D>().copied()
    }

    pub fn deep_clone(&self) -> Tensor {
        Tensor {
            dt: self.dt,
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            len: self.len,
            buffer: self.buffer.clone(),
        }
    }

    pub fn view(&self) -> view::TensorView<'_> {
        unsafe { view::TensorView::at_prefix_unchecked(self, &[]) }
    }

    pub fn view_at_prefix(&self, prefix: &[usize]) -> anyhow::Result<view::TensorView<'_>> {
        view::TensorView::at_prefix(self, prefix)
    }
}

fn dequantize_t<T: Datum + Into<i32>>(t: &Tensor, qp: QParams) -> anyhow::Result<Tensor> {
    let mut result = Tensor::zero::<f32>(t.shape());
    for (d, s) in result.as_slice_mut::<f32>()?.iter_mut().zip(t.as_slice::<T>()?) {
        *d = qp.dequantize((*s).into());
    }
    Ok(result)
}

fn quantize_t<T: crate::datum::QuantizedDatum>(
    shape: &[usize],
    real: &[f32],
    dt: DatumType,
    qp: QParams,
) -> anyhow::Result<Tensor> {
    let mut result = Tensor::zero_dt(dt, shape);
    for (d, s) in result.as_slice_mut::<T>()?.iter_mut().zip(real) {
        *d = qp.quantize::<T>(*s);
    }
    Ok(result)
}

fn cast_from_bool<B: Datum + Zero + One>(src: &[bool], dst: &mut [B]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = if *s { B::one() } else { B::zero() }
    }
}

fn cast_slice<A: Datum + AsPrimitive<B>, B: Datum>(src: &[A], dst: &mut [B]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = s.as_();
    }
}

unsafe fn cast_number<A>(src: &Tensor, dst: &mut Tensor) -> anyhow::Result<()>
where
    A: Datum + Zero + AsPrimitive<u8> + AsPrimitive<i8> + AsPrimitive<i32> + AsPrimitive<f32>,
{
    unsafe {
        let s = src.as_slice_unchecked::<A>();
        match dst.dt {
            DatumType::Bool => {
                for (d, s) in dst.as_slice_mut_unchecked::<bool>().iter_mut().zip(s) {
                    *d = !s.is_zero();
                }
            }
            DatumType::U8 => cast_slice::<A, u8>(s, dst.as_slice_mut_unchecked()),
            DatumType::I8 => cast_slice::<A, i8>(s, dst.as_slice_mut_unchecked()),
            DatumType::I32 => cast_slice::<A, i32>(s, dst.as_slice_mut_unchecked()),
            DatumType::F32 => cast_slice::<A, f32>(s, dst.as_slice_mut_unchecked()),
            _ => anyhow::bail!("Unsupported cast from {:?} to {:?}", src.dt, dst.dt),
        }
    }
    Ok(())
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Tensor) -> bool {
        if self.dt != other.dt || self.shape != other.shape {
            return false;
        }
        self.eq_dt(other)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        let content = self.dump(false).unwrap_or_else(|e| format!("Error : {e:?}"));
        write!(formatter, "{content}")
    }
}

pub fn natural_strides(shape: &[usize]) -> TVec<isize> {
    let mut strides = tvec!();
    compute_natural_stride_to(&mut strides, shape);
    strides
}

fn compute_natural_stride_to(strides: &mut TVec<isize>, shape: &[usize]) {
    match shape.len() {
        0 => (),
        1 => strides.push(1),
        2 => strides.extend_from_slice(&[shape[1] as isize, 1]),
        3 => strides.extend_from_slice(&[(shape[1] * shape[2]) as isize, shape[2] as _, 1]),
        4 => strides.extend_from_slice(&[
            (shape[1] * shape[2] * shape[3]) as isize,
            (shape[2] * shape[3]) as _,
            shape[3] as _,
            1,
        ]),
        _ => {
            let mut acc = 1isize;
            strides.push(1);
            for dim in shape.iter().skip(1).rev() {
                acc *= *dim as isize;
                strides.push(acc);
            }
            strides.reverse();
        }
    }
}

impl<D: ::ndarray::Dimension, T: Datum> From<Array<T, D>> for Tensor {
    fn from(it: Array<T, D>) -> Tensor {
        let it = it.into_dyn();
        unsafe {
            let mut t = Tensor::uninitialized::<T>(it.shape());
            for (d, s) in t.as_slice_mut_unchecked::<T>().iter_mut().zip(it.iter()) {
                *d = *s;
            }
            t
        }
    }
}

/// Convenient conversion to Tensor.
pub trait IntoTensor: Sized {
    /// Convert Self to a Tensor.
    ///
    /// May perform a copy
    fn into_tensor(self) -> Tensor;
}

/// Convenient conversion to Arc<Tensor>.
pub trait IntoArcTensor: Sized {
    /// Convert Self to a Arc<Tensor>.
    ///
    /// May perform a copy
    fn into_arc_tensor(self) -> Arc<Tensor>;
}

impl<D: ::ndarray::Dimension, T: Datum> IntoTensor for Array<T, D> {
    fn into_tensor(self) -> Tensor {
        Tensor::from(self)
    }
}

impl<D: ::ndarray::Dimension, T: Datum> IntoArcTensor for Array<T, D> {
    fn into_arc_tensor(self) -> Arc<Tensor> {
        Arc::new(Tensor::from(self))
    }
}

impl IntoTensor for Tensor {
    fn into_tensor(self) -> Tensor {
        self
    }
}

impl IntoTensor for Arc<Tensor> {
    fn into_tensor(self) -> Tensor {
        Arc::try_unwrap(self).unwrap_or_else(|t| (*t).clone())
    }
}

impl IntoArcTensor for Tensor {
    fn into_arc_tensor(self) -> Arc<Tensor> {
        Arc::new(self)
    }
}

impl IntoArcTensor for Arc<Tensor> {
    fn into_arc_tensor(self) -> Arc<Tensor> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::*;
    use proptest::prelude::*;

    #[test]
    fn strides_and_len() {
        let t = Tensor::zero::<f32>(&[2, 3, 4, 5, 6]);
        assert_eq!(t.strides(), &[360, 120, 30, 6, 1]);
        assert_eq!(t.len(), 720);
        assert_eq!(t.byte_len(), 720 * 4);
        assert_eq!(Tensor::zero::<i8>(&[]).len(), 1);
        assert_eq!(Tensor::zero::<i8>(&[3, 0]).len(), 0);
    }

    #[test]
    fn zero_is_zero() {
        let t = Tensor::zero::<i32>(&[17]);
        assert!(t.as_slice::<i32>().unwrap().iter().all(|x| *x == 0));
        assert_eq!(t.as_bytes().as_ptr() as usize % BUFFER_ALIGNMENT, 0);
    }

    #[test]
    fn from_shape_checks_len() {
        assert!(Tensor::from_shape(&[2, 2], &[1f32, 2., 3.]).is_err());
        let t = Tensor::from_shape(&[2, 2], &[1f32, 2., 3., 4.]).unwrap();
        assert_eq!(t, tensor2(&[[1f32, 2.], [3., 4.]]));
    }

    #[test]
    fn buffer_round_trip() {
        let t = tensor1(&[1i32, 2, 3]);
        let buffer = t.into_buffer();
        assert!(Tensor::from_buffer(DatumType::I32, &[4], buffer.clone()).is_err());
        let t = Tensor::from_buffer(DatumType::I32, &[3, 1], buffer).unwrap();
        assert_eq!(t.as_slice::<i32>().unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn typed_access_is_checked() {
        let t = tensor1(&[1f32]);
        assert!(t.as_slice::<i32>().is_err());
        let q = tensor1(&[1u8]).into_quantized(QParams::new(0, 0.1)).unwrap();
        assert_eq!(q.as_slice::<u8>().unwrap(), &[1]);
    }

    #[test]
    fn reshape() {
        let mut t = tensor1(&[1f32, 2., 3., 4., 5., 6.]);
        t.set_shape(&[2, 3]).unwrap();
        assert_eq!(t.strides(), &[3, 1]);
        assert!(t.set_shape(&[4]).is_err());
    }

    #[test]
    fn cast_numbers() {
        let t = tensor1(&[-1.6f32, 0.0, 2.4, 300.0]);
        assert_eq!(*t.cast_to::<i32>().unwrap(), tensor1(&[-1i32, 0, 2, 300]));
        assert_eq!(*t.cast_to::<u8>().unwrap(), tensor1(&[0u8, 0, 2, 255]));
        assert_eq!(*t.cast_to::<bool>().unwrap(), tensor1(&[true, false, true, true]));
        let b = tensor1(&[true, false]);
        assert_eq!(*b.cast_to::<f32>().unwrap(), tensor1(&[1f32, 0.]));
    }

    #[test]
    fn cast_quantized() {
        let qp = QParams::new(128, 0.5);
        let t = tensor1(&[-1f32, 0.0, 1.25, 1000.0]);
        let q = t.cast_to_dt(DatumType::QU8(qp)).unwrap().into_owned();
        assert_eq!(q.as_slice::<u8>().unwrap(), &[126, 128, 131, 255]);
        let back = q.cast_to::<f32>().unwrap();
        assert_eq!(back.as_slice::<f32>().unwrap(), &[-1.0, 0.0, 1.5, 63.5]);
    }

    #[test]
    fn close_enough_tolerances() {
        let a = tensor1(&[1.0f32, 2.0]);
        let b = tensor1(&[1.0f32, 2.0001]);
        assert!(a.close_enough(&b, Approximation::Exact).is_err());
        assert!(a.close_enough(&b, Approximation::Close).is_ok());
        let c = tensor1(&[1.0f32, 2.01]);
        assert!(a.close_enough(&c, Approximation::Approximate).is_err());
        assert!(a.close_enough(&tensor1(&[1.0f32]), true).is_err());
    }

    #[test]
    fn close_enough_allows_one_quantization_step() {
        let qp = QParams::new(0, 0.1);
        let q = tensor1(&[10u8, 21]).into_quantized(qp).unwrap();
        let f = tensor1(&[1.0f32, 2.0]);
        assert!(q.close_enough(&f, Approximation::Close).is_ok());
        let far = tensor1(&[1.0f32, 1.85]);
        assert!(q.close_enough(&far, Approximation::Close).is_err());
    }

    #[test]
    fn dump_truncates() {
        let t = Tensor::zero::<u8>(&[20]);
        assert!(t.dump(false).unwrap().ends_with("..."));
        assert!(!t.dump(true).unwrap().ends_with("..."));
    }

    proptest! {
        #[test]
        fn clone_is_deep(data in proptest::collection::vec(any::<i32>(), 0..64)) {
            let t = Tensor::from_shape(&[data.len()], &data).unwrap();
            let mut c = t.clone();
            prop_assert_eq!(&t, &c);
            if !data.is_empty() {
                c.as_slice_mut::<i32>().unwrap()[0] = data[0].wrapping_add(1);
                prop_assert_ne!(&t, &c);
            }
        }

        #[test]
        fn array_conversion_is_row_major(rows in 1usize..5, cols in 1usize..5) {
            let a = ndarray::Array2::from_shape_fn((rows, cols), |(i, j)| (i * 10 + j) as i32);
            let t = Tensor::from(a.t().to_owned());
            prop_assert_eq!(t.shape(), &[cols, rows]);
            let view = t.to_array_view::<i32>().unwrap();
            prop_assert_eq!(view, a.t().into_dyn());
        }
    }
}
