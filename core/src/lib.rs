//! # Kestrel core
//!
//! Operator dispatch and kernel selection for mobile neural network
//! inference.
//!
//! A [`model::Graph`] declares operators by kind and parameters. A
//! [`plan::Plan`] resolves every operator to a concrete [`kernel::Kernel`]
//! by walking a [`backend::BackendPreference`] through a
//! [`registry::KernelRegistry`], then a [`plan::Session`] executes the graph,
//! allocating intermediate tensors and releasing them once their last
//! consumer ran.
//!
//! ## Example
//!
//! ```
//! use kestrel_core::internal::*;
//!
//! let mut graph = Graph::default();
//! let input = graph.add_source("input", TypedFact::dt_shape::<f32>(&[3])).unwrap();
//! let three = graph.add_const("three", tensor1(&[3f32, 3., 3.])).unwrap();
//! let add = graph.add_node("add", EltwiseType::Sum, &[input, three]).unwrap();
//! graph.set_outputs(&[add]).unwrap();
//!
//! let outputs = kestrel_core::run(&graph, tvec!(tensor1(&[1.0f32, 2.5, 5.0])), BackendPreference::default()).unwrap();
//! assert_eq!(*outputs[0], tensor1(&[4.0f32, 5.5, 8.0]));
//! ```
#![allow(clippy::len_zero)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::type_complexity)]

#[macro_use]
extern crate derive_new;
#[macro_use]
pub extern crate log;

#[macro_use]
pub mod errors;
pub mod backend;
pub mod broadcast;
pub mod config;
pub mod kernel;
pub mod kernels;
pub mod memory;
pub mod model;
pub mod operator;
pub mod ops;
pub mod plan;
pub mod registry;
pub mod value;

pub use kestrel_data;
pub use kestrel_data::anyhow;
pub use kestrel_linalg;

pub use errors::{KestrelError, KestrelResult};

/// This prelude is meant for code using kestrel.
pub mod prelude {
    pub use crate::backend::{Backend, BackendPreference, Location};
    pub use crate::config::RuntimeConfig;
    pub use crate::errors::{KestrelError, KestrelResult};
    pub use crate::model::{Graph, OutletId, TypedFact};
    pub use crate::ops::{
        ActivationType, ConvParams, EltwiseType, OpDef, OpKind, OpParams, PaddingMode,
        PoolParams, PoolingType,
    };
    pub use crate::plan::{CancellationToken, Plan, RunStats, Session};
    pub use crate::registry::{default_registry, KernelKey, KernelRegistry, RegistryBuilder};
    pub use crate::run;
    pub use kestrel_data::prelude::*;
    pub use std::sync::Arc;
}

/// This prelude is meant for code extending kestrel (kernel providers,
/// device backends).
pub mod internal {
    pub use crate::broadcast::multi_broadcast;
    pub use crate::kernel::{host_io, Kernel};
    pub use crate::memory::{AllocatorStats, HostAllocator, TensorArena, TensorHandle};
    pub use crate::model::{InletId, Node, NodeOp};
    pub use crate::operator::{Operator, OperatorState};
    pub use crate::ops::infer::output_facts;
    pub use crate::ops::{
        ConcatParams, ConvGeometry, MatMulParams, PadParams, ReshapeParams, ResizeParams,
    };
    pub use crate::prelude::*;
    pub use crate::registry::{KernelFactory, KernelProvider};
    pub use crate::value::{DeviceBridge, DeviceValue, Value};
    pub use crate::{
        bail_shape, bail_type, ensure_shape, ensure_type, unsupported_combination,
    };
    pub use anyhow::{anyhow, bail, ensure, format_err, Context as _};
    pub use kestrel_data::internal::*;
    pub use std::borrow::Cow;
    pub use std::fmt;
}

use prelude::*;

/// Run `graph` once on `inputs` with the process wide default registry.
///
/// Sessions should be preferred for repeated runs: they keep operators
/// validated and recycle intermediate buffers.
pub fn run(
    graph: &Graph,
    inputs: TVec<Tensor>,
    preference: BackendPreference,
) -> KestrelResult<TVec<Arc<Tensor>>> {
    let config = RuntimeConfig::default().with_preference(preference);
    Plan::new(graph.clone(), default_registry()?, config)?.run(inputs)
}

#[cfg(test)]
pub(crate) fn setup_test_logger() {
    let _ = env_logger::Builder::from_env("KESTREL_LOG").is_test(true).try_init();
}
