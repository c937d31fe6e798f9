//! Kernel sets bundled with kestrel-core.
//!
//! * `reference`: portable, straightforward loops for every operator kind
//!   on `F32` (and the integer-safe kinds on `I32`).
//! * `neon`: element-wise, activation and product kernels plugged on the
//!   arm64 NEON primitives of kestrel-linalg.
//! * `quantized`: 8-bit affine kernels with fixed-point requantization.
use kestrel_data::prelude::*;

use crate::errors::KestrelResult;
use crate::model::TypedFact;

pub mod array;
pub mod reference;

#[cfg(feature = "neon")]
pub mod neon;
#[cfg(feature = "quantize")]
pub mod quantized;

/// Kernels are registered for the type of their first input.
pub(crate) fn check_datum(
    kernel: &str,
    datum: DatumKind,
    inputs: &[&TypedFact],
) -> KestrelResult<()> {
    if let Some(first) = inputs.first() {
        ensure_type!(
            first.datum_type.kind() == datum,
            "{} works on {}, got {:?}",
            kernel,
            datum,
            first.datum_type
        );
    }
    Ok(())
}
