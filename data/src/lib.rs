#[macro_use]
mod macros;

/// A Smallvec instantiation with 4 embeddable values.
///
/// Used about everywhere in kestrel, for node inputs and outputs, or
/// tensor dimensions.
pub type TVec<T> = smallvec::SmallVec<[T; 4]>;

pub mod prelude {
    pub use crate::datum::{Datum, DatumKind, DatumType, QParams, QuantizedDatum};
    pub use crate::tensor::litteral::*;
    pub use crate::tensor::{
        natural_strides, Approximation, Buffer, IntoArcTensor, IntoTensor, Tensor, BUFFER_ALIGNMENT,
    };
    pub use crate::tvec;
    pub use crate::TVec;
    pub use crate::{dispatch_copy, dispatch_numbers, dispatch_quantized};
}

pub mod internal {
    pub use crate::prelude::*;
    pub use crate::tensor::view::TensorView;
    pub use ndarray as kestrel_ndarray;
    pub use smallvec as kestrel_smallvec;
}

pub use anyhow;

mod datum;
mod tensor;
