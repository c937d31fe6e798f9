//! The contract every backend implements.
use std::borrow::Cow;
use std::fmt;

use kestrel_data::prelude::*;

use crate::backend::{Backend, Location};
use crate::errors::{KestrelError, KestrelResult};
use crate::model::TypedFact;
use crate::value::Value;

/// One backend implementation of one operator, instantiated with its
/// parameters.
pub trait Kernel: fmt::Debug + Send + Sync {
    fn name(&self) -> Cow<'_, str>;

    fn backend(&self) -> Backend;

    /// Where inputs are expected and outputs produced.
    fn location(&self) -> Location {
        self.backend().location()
    }

    /// Compatibility predicate and output shape inference.
    ///
    /// Fails with `ShapeMismatch` or `TypeMismatch` when the inputs can not
    /// be handled.
    fn output_facts(&self, inputs: &[&TypedFact]) -> KestrelResult<TVec<TypedFact>>;

    /// Compute into pre-allocated outputs. Inputs and outputs match facts
    /// previously accepted by `output_facts`, and live at `location()`.
    fn execute(&self, inputs: &[Value], outputs: &mut [Value]) -> KestrelResult<()>;
}

/// Borrow the host tensors of a single-output kernel invocation.
pub fn host_io<'v>(
    inputs: &'v [Value],
    outputs: &'v mut [Value],
) -> KestrelResult<(TVec<&'v Tensor>, &'v mut Tensor)> {
    let inputs = inputs.iter().map(|v| v.as_host()).collect::<KestrelResult<TVec<_>>>()?;
    let [output] = outputs else {
        anyhow::bail!(KestrelError::InvalidTensorState(format!(
            "expected one output, got {}",
            outputs.len()
        )))
    };
    Ok((inputs, output.as_host_mut()?))
}
