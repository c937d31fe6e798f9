//! Error taxonomy.
//!
//! Errors travel as `anyhow::Error` so that every layer can add context
//! (which node, which kernel). The typed kind stays reachable through
//! [`KestrelError::of`].
use thiserror::Error;

use crate::registry::KernelKey;
use crate::backend::Backend;
use crate::ops::OpKind;
use kestrel_data::prelude::DatumKind;

pub type KestrelResult<T> = anyhow::Result<T>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KestrelError {
    /// No kernel registered for the requested kind, backend and datum.
    #[error("No kernel for {0}")]
    UnsupportedCombination(KernelKey),
    /// A second factory registered for an existing key.
    #[error("A kernel is already registered for {0}")]
    DuplicateRegistration(KernelKey),
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),
    #[error("Allocation failure: {0}")]
    AllocationFailure(String),
    /// Every backend of the preference list was tried.
    #[error("No available kernel for {kind:?} on {datum} (tried {tried:?})")]
    NoAvailableKernel { kind: OpKind, datum: DatumKind, tried: Vec<Backend> },
    #[error("Invalid tensor state: {0}")]
    InvalidTensorState(String),
    #[error("Run cancelled")]
    Cancelled,
    /// Dangling wire, cycle, or missing outputs.
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),
}

impl KestrelError {
    /// The typed error at the root of (or anywhere inside) a context chain.
    pub fn of(error: &anyhow::Error) -> Option<&KestrelError> {
        error.chain().find_map(|e| e.downcast_ref::<KestrelError>())
    }

    /// Errors a caller can act on: retry later, shrink the graph, fix its
    /// construction.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            KestrelError::ShapeMismatch(_)
                | KestrelError::TypeMismatch(_)
                | KestrelError::AllocationFailure(_)
                | KestrelError::Cancelled
        )
    }
}

#[macro_export]
macro_rules! bail_shape {
    ($($arg:tt)*) => {
        return Err($crate::anyhow::Error::from($crate::errors::KestrelError::ShapeMismatch(format!($($arg)*))))
    };
}

#[macro_export]
macro_rules! bail_type {
    ($($arg:tt)*) => {
        return Err($crate::anyhow::Error::from($crate::errors::KestrelError::TypeMismatch(format!($($arg)*))))
    };
}

#[macro_export]
macro_rules! ensure_shape {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::bail_shape!($($arg)*)
        }
    };
}

#[macro_export]
macro_rules! ensure_type {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::bail_type!($($arg)*)
        }
    };
}

/// Bail out of a kernel factory that can not handle the requested
/// parameters, so that the dispatcher falls back to the next backend.
#[macro_export]
macro_rules! unsupported_combination {
    ($kind:expr, $backend:expr, $datum:expr) => {
        return Err($crate::anyhow::Error::from($crate::errors::KestrelError::UnsupportedCombination(
            $crate::registry::KernelKey::new($kind, $backend, $datum),
        )))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn typed_kind_survives_context() {
        let err: anyhow::Error = KestrelError::ShapeMismatch("2 vs 3".into()).into();
        let err = Err::<(), _>(err).context("Evaluating #4 \"conv\"").unwrap_err();
        assert_eq!(KestrelError::of(&err), Some(&KestrelError::ShapeMismatch("2 vs 3".into())));
        assert!(format!("{err:?}").contains("conv"));
    }

    #[test]
    fn plain_errors_have_no_kind() {
        let err = anyhow::anyhow!("something else");
        assert!(KestrelError::of(&err).is_none());
    }

    #[test]
    fn macros_build_typed_errors() {
        fn check(x: usize) -> KestrelResult<()> {
            ensure_shape!(x == 2, "expected 2, got {}", x);
            Ok(())
        }
        assert!(check(2).is_ok());
        let err = check(3).unwrap_err();
        assert!(matches!(KestrelError::of(&err), Some(KestrelError::ShapeMismatch(_))));
    }
}
