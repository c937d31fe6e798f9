//! # Kestrel GPU
//!
//! OpenCL backend for kestrel: device tensors, an in-order command queue,
//! a pooled device allocator, and float kernels written as work item
//! functions.
//!
//! This implementation emulates the device on host threads: the queue is a
//! worker thread and work groups run on rayon. It keeps the asynchronous
//! contract of a real device (every launch and transfer returns an event,
//! host reads wait for it), so the dispatcher synchronization is exercised
//! the same way.
//!
//! ```
//! use kestrel_core::internal::*;
//! use kestrel_gpu::OpenClKernels;
//!
//! let registry = RegistryBuilder::new()
//!     .with_default_providers()?
//!     .with_provider(&OpenClKernels::default())?
//!     .build();
//! assert!(registry.capabilities().contains(&Backend::GpuOpenCl));
//! # Ok::<(), anyhow::Error>(())
//! ```
#[macro_use]
extern crate derive_new;
#[macro_use]
extern crate log;

pub mod bridge;
pub mod device;
pub mod kernels;
pub mod memory;
pub mod queue;
pub mod tensor;

pub use bridge::OpenClBridge;
pub use device::{get_context, set_context, OpenClConfig, OpenClContext};
pub use kernels::OpenClKernels;
pub use queue::{CommandQueue, Event};
pub use tensor::DeviceTensor;

#[cfg(test)]
pub(crate) fn setup_test_logger() {
    let _ = env_logger::Builder::from_env("KESTREL_LOG").is_test(true).try_init();
}
