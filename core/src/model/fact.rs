use std::fmt;

use itertools::Itertools;
use kestrel_data::prelude::*;

/// Datum type and shape of a value, known before it is computed.
#[derive(Clone, PartialEq, Eq, Hash, new)]
pub struct TypedFact {
    pub datum_type: DatumType,
    pub shape: TVec<usize>,
}

impl TypedFact {
    pub fn dt_shape<T: Datum>(shape: &[usize]) -> TypedFact {
        TypedFact::new(T::datum_type(), shape.into())
    }

    pub fn shape_and_dt_of(t: &Tensor) -> TypedFact {
        TypedFact::new(t.datum_type(), t.shape().into())
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn volume(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_len(&self) -> usize {
        self.volume() * self.datum_type.size_of()
    }

    pub fn with_datum_type(&self, datum_type: DatumType) -> TypedFact {
        TypedFact { datum_type, shape: self.shape.clone() }
    }

    pub fn with_shape(&self, shape: impl Into<TVec<usize>>) -> TypedFact {
        TypedFact { datum_type: self.datum_type, shape: shape.into() }
    }

    pub fn matches(&self, t: &Tensor) -> bool {
        self.datum_type == t.datum_type() && &*self.shape == t.shape()
    }
}

impl From<&Tensor> for TypedFact {
    fn from(t: &Tensor) -> TypedFact {
        TypedFact::shape_and_dt_of(t)
    }
}

impl fmt::Debug for TypedFact {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.shape.is_empty() {
            write!(f, "{:?}", self.datum_type)
        } else {
            write!(f, "{},{:?}", self.shape.iter().join(","), self.datum_type)
        }
    }
}

impl fmt::Display for TypedFact {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
