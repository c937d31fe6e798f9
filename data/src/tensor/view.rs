use crate::datum::{Datum, DatumType};
use crate::tensor::Tensor;

/// Read-only window on the trailing axes of a tensor, at a fixed prefix of
/// leading coordinates (e.g. one image of an NHWC batch).
#[derive(Clone, Copy)]
pub struct TensorView<'a> {
    tensor: &'a Tensor,
    offset: usize,
    prefix_len: usize,
}

impl<'a> TensorView<'a> {
    pub fn at_prefix(tensor: &'a Tensor, prefix: &[usize]) -> anyhow::Result<TensorView<'a>> {
        anyhow::ensure!(
            prefix.len() <= tensor.rank()
                && prefix.iter().zip(tensor.shape()).all(|(p, d)| p < d),
            "Invalid prefix {:?} for shape {:?}",
            prefix,
            tensor.shape()
        );
        Ok(unsafe { Self::at_prefix_unchecked(tensor, prefix) })
    }

    /// # Safety
    ///
    /// Prefix must be in bounds.
    pub unsafe fn at_prefix_unchecked(tensor: &'a Tensor, prefix: &[usize]) -> TensorView<'a> {
        let offset =
            prefix.iter().zip(tensor.strides()).map(|(a, b)| *a as isize * b).sum::<isize>();
        TensorView { tensor, prefix_len: prefix.len(), offset: offset as usize }
    }

    pub fn datum_type(&self) -> DatumType {
        self.tensor.datum_type()
    }

    pub fn rank(&self) -> usize {
        self.tensor.rank() - self.prefix_len
    }

    pub fn shape(&self) -> &[usize] {
        &self.tensor.shape()[self.prefix_len..]
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Access the data as a slice.
    pub fn as_slice<D: Datum>(&self) -> anyhow::Result<&'a [D]> {
        self.tensor.check_for_access::<D>()?;
        unsafe { Ok(&self.tensor.as_slice_unchecked::<D>()[self.offset..][..self.len()]) }
    }
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    #[test]
    fn view_at_prefix() {
        let t = tensor3(&[[[1i32, 2], [3, 4]], [[5, 6], [7, 8]]]);
        let v = t.view_at_prefix(&[1]).unwrap();
        assert_eq!(v.shape(), &[2, 2]);
        assert_eq!(v.as_slice::<i32>().unwrap(), &[5, 6, 7, 8]);
        let v = t.view_at_prefix(&[1, 0]).unwrap();
        assert_eq!(v.as_slice::<i32>().unwrap(), &[5, 6]);
        assert!(t.view_at_prefix(&[2]).is_err());
        assert_eq!(t.view().len(), 8);
    }
}
