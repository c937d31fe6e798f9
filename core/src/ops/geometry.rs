use kestrel_data::prelude::*;

use crate::errors::KestrelResult;
use crate::ops::ConvParams;

/// Resolved geometry of a 2D convolution or pooling over an NHWC input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvGeometry {
    pub batch: usize,
    pub input_h: usize,
    pub input_w: usize,
    pub channels: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub output_h: usize,
    pub output_w: usize,
    pub strides: [usize; 2],
    pub dilations: [usize; 2],
    pub pad_top: usize,
    pub pad_left: usize,
}

impl ConvGeometry {
    pub fn new(
        input_shape: &[usize],
        kernel: [usize; 2],
        params: &ConvParams,
    ) -> KestrelResult<ConvGeometry> {
        ensure_shape!(input_shape.len() == 4, "expected a NHWC input, got {:?}", input_shape);
        let padded = params.padding.compute(
            &input_shape[1..3],
            &kernel,
            &params.dilations,
            &params.strides,
        )?;
        Ok(ConvGeometry {
            batch: input_shape[0],
            input_h: input_shape[1],
            input_w: input_shape[2],
            channels: input_shape[3],
            kernel_h: kernel[0],
            kernel_w: kernel[1],
            output_h: padded[0].output,
            output_w: padded[1].output,
            strides: params.strides,
            dilations: params.dilations,
            pad_top: padded[0].pad_before,
            pad_left: padded[1].pad_before,
        })
    }

    /// Input row read by output row `oy` at kernel row `ky`, if not in the
    /// padding.
    #[inline]
    pub fn input_y(&self, oy: usize, ky: usize) -> Option<usize> {
        (oy * self.strides[0] + ky * self.dilations[0])
            .checked_sub(self.pad_top)
            .filter(|&y| y < self.input_h)
    }

    #[inline]
    pub fn input_x(&self, ox: usize, kx: usize) -> Option<usize> {
        (ox * self.strides[1] + kx * self.dilations[1])
            .checked_sub(self.pad_left)
            .filter(|&x| x < self.input_w)
    }

    /// Number of output pixels over the whole batch.
    pub fn output_pixels(&self) -> usize {
        self.batch * self.output_h * self.output_w
    }

    pub fn patch_len(&self) -> usize {
        self.kernel_h * self.kernel_w * self.channels
    }

    /// Lay the input patches out as the rows of a
    /// `[batch * output_h * output_w, kernel_h * kernel_w * channels]`
    /// matrix, so that a HWIO filter becomes its right hand side.
    pub fn im2col<T: Datum>(&self, input: &[T], pad: T) -> Vec<T> {
        let c = self.channels;
        let mut patches = Vec::with_capacity(self.output_pixels() * self.patch_len());
        for n in 0..self.batch {
            let image = &input[n * self.input_h * self.input_w * c..];
            for oy in 0..self.output_h {
                for ox in 0..self.output_w {
                    for ky in 0..self.kernel_h {
                        let y = self.input_y(oy, ky);
                        for kx in 0..self.kernel_w {
                            match (y, self.input_x(ox, kx)) {
                                (Some(y), Some(x)) => patches.extend_from_slice(
                                    &image[(y * self.input_w + x) * c..][..c],
                                ),
                                _ => patches.extend(std::iter::repeat_n(pad, c)),
                            }
                        }
                    }
                }
            }
        }
        patches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::PaddingMode;

    #[test]
    fn im2col_valid_3x3() {
        let geo = ConvGeometry::new(&[1, 3, 3, 1], [2, 2], &ConvParams::default()).unwrap();
        assert_eq!((geo.output_h, geo.output_w), (2, 2));
        let input: Vec<f32> = (0..9).map(|x| x as f32).collect();
        let patches = geo.im2col(&input, 0.0);
        assert_eq!(
            patches,
            vec![0., 1., 3., 4., 1., 2., 4., 5., 3., 4., 6., 7., 4., 5., 7., 8.]
        );
    }

    #[test]
    fn im2col_same_pads() {
        let params = ConvParams::new([1, 1], [1, 1], PaddingMode::Same);
        let geo = ConvGeometry::new(&[1, 2, 2, 1], [3, 3], &params).unwrap();
        assert_eq!((geo.output_h, geo.output_w, geo.pad_top, geo.pad_left), (2, 2, 1, 1));
        let patches = geo.im2col(&[1i32, 2, 3, 4], -1);
        assert_eq!(&patches[..9], &[-1, -1, -1, -1, 1, 2, -1, 3, 4]);
    }

    #[test]
    fn rank_must_be_4() {
        assert!(ConvGeometry::new(&[3, 3, 1], [1, 1], &ConvParams::default()).is_err());
    }
}
