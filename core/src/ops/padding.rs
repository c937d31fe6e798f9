use kestrel_data::prelude::*;

use crate::errors::KestrelResult;

/// Spatial padding policy of convolutions and poolings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PaddingMode {
    /// No padding, only fully covered windows.
    #[default]
    Valid,
    /// `ceil(input / stride)` outputs, extra padding after.
    Same,
    /// Every window touching at least one input.
    Full,
}

use PaddingMode::*;

#[derive(Debug, Clone, Copy, new, PartialEq, Eq)]
pub struct ComputedPaddedDim {
    pub input: usize,
    pub output: usize,
    pub pad_before: usize,
    pub pad_after: usize,
}

impl PaddingMode {
    pub fn compute(
        &self,
        input_spatial_shape: &[usize],
        kernel_spatial_shape: &[usize],
        dilations: &[usize],
        strides: &[usize],
    ) -> KestrelResult<TVec<ComputedPaddedDim>> {
        (0..input_spatial_shape.len())
            .map(|d| {
                self.compute_one(
                    input_spatial_shape[d],
                    kernel_spatial_shape[d],
                    dilations[d],
                    strides[d],
                )
            })
            .collect()
    }

    pub fn compute_one(
        &self,
        input: usize,
        kernel: usize,
        dilation: usize,
        stride: usize,
    ) -> KestrelResult<ComputedPaddedDim> {
        ensure_shape!(
            kernel > 0 && dilation > 0 && stride > 0,
            "kernel ({}), dilation ({}) and stride ({}) must be positive",
            kernel,
            dilation,
            stride
        );
        let kernel_field = (kernel - 1) * dilation + 1;
        Ok(match self {
            Valid => Self::valid(input, kernel_field, stride)?,
            Same => Self::same(input, kernel_field, stride),
            Full => Self::full(input, kernel_field, stride),
        })
    }

    fn valid(input: usize, kernel_field: usize, stride: usize) -> KestrelResult<ComputedPaddedDim> {
        ensure_shape!(
            input >= kernel_field,
            "valid padding needs input ({}) at least as wide as the kernel field ({})",
            input,
            kernel_field
        );
        let output = (input - kernel_field) / stride + 1;
        Ok(ComputedPaddedDim::new(input, output, 0, 0))
    }

    fn same(input: usize, kernel_field: usize, stride: usize) -> ComputedPaddedDim {
        let output = input.div_ceil(stride);
        let total = ((output.saturating_sub(1)) * stride + kernel_field).saturating_sub(input);
        let pad_before = total / 2;
        ComputedPaddedDim::new(input, output, pad_before, total - pad_before)
    }

    fn full(input: usize, kernel_field: usize, stride: usize) -> ComputedPaddedDim {
        let output =
            if input + kernel_field < 2 { 0 } else { (input + kernel_field - 2) / stride + 1 };
        ComputedPaddedDim::new(input, output, kernel_field - 1, kernel_field - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::KestrelError;

    #[test]
    fn same_stride_1() {
        assert_eq!(Same.compute_one(1, 2, 1, 1).unwrap(), ComputedPaddedDim::new(1, 1, 0, 1));
        assert_eq!(Same.compute_one(2, 2, 1, 1).unwrap(), ComputedPaddedDim::new(2, 2, 0, 1));
        assert_eq!(Same.compute_one(3, 3, 1, 1).unwrap(), ComputedPaddedDim::new(3, 3, 1, 1));
        assert_eq!(Same.compute_one(5, 5, 1, 1).unwrap(), ComputedPaddedDim::new(5, 5, 2, 2));
    }

    #[test]
    fn same_stride_2() {
        assert_eq!(Same.compute_one(7, 3, 1, 2).unwrap(), ComputedPaddedDim::new(7, 4, 1, 1));
        assert_eq!(Same.compute_one(6, 3, 1, 2).unwrap(), ComputedPaddedDim::new(6, 3, 0, 1));
        assert_eq!(Same.compute_one(1, 3, 1, 2).unwrap(), ComputedPaddedDim::new(1, 1, 1, 1));
    }

    #[test]
    fn valid() {
        assert_eq!(Valid.compute_one(10, 3, 1, 1).unwrap(), ComputedPaddedDim::new(10, 8, 0, 0));
        assert_eq!(Valid.compute_one(10, 3, 1, 2).unwrap(), ComputedPaddedDim::new(10, 4, 0, 0));
        assert_eq!(Valid.compute_one(10, 3, 2, 1).unwrap(), ComputedPaddedDim::new(10, 6, 0, 0));
    }

    #[test]
    fn valid_kernel_too_wide() {
        let err = Valid.compute_one(2, 3, 1, 1).unwrap_err();
        assert!(matches!(KestrelError::of(&err), Some(KestrelError::ShapeMismatch(_))));
    }

    #[test]
    fn full() {
        assert_eq!(Full.compute_one(5, 3, 1, 1).unwrap(), ComputedPaddedDim::new(5, 7, 2, 2));
        assert_eq!(Full.compute_one(5, 3, 1, 2).unwrap(), ComputedPaddedDim::new(5, 4, 2, 2));
    }

    #[test]
    fn zero_stride() {
        assert!(Same.compute_one(5, 3, 1, 0).is_err());
    }
}
