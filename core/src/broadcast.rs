//! N-way tensor broadcast
use kestrel_data::prelude::*;

use crate::errors::KestrelResult;

/// Computes a shape, if any, to which all shapes can be broadcasted.
pub fn multi_broadcast(shapes: &[impl AsRef<[usize]>]) -> KestrelResult<TVec<usize>> {
    let Some(len) = shapes.iter().map(|shape| shape.as_ref().len()).max() else {
        return Ok(tvec!());
    };
    let mut shape: TVec<usize> = tvec!();
    for i in 0..len {
        let mut wanted_size = 1;
        for s in shapes {
            let s = s.as_ref();
            let dim = if i < s.len() { s[s.len() - i - 1] } else { 1 };
            if dim != 1 {
                ensure_shape!(
                    wanted_size == 1 || wanted_size == dim,
                    "can not broadcast {:?}",
                    shapes.iter().map(|s| s.as_ref()).collect::<Vec<_>>()
                );
                wanted_size = dim;
            }
        }
        shape.push(wanted_size)
    }
    shape.reverse();
    Ok(shape)
}
