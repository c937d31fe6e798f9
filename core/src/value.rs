//! Values flowing between operators, on the host or on a device.
use std::fmt;
use std::sync::Arc;

use downcast_rs::{impl_downcast, DowncastSync};
use kestrel_data::prelude::*;

use crate::backend::{Backend, Location};
use crate::errors::{KestrelError, KestrelResult};
use crate::model::TypedFact;

/// A tensor living in a device memory space.
///
/// Device work is asynchronous: `to_host` must wait for every pending
/// command writing the value before copying it.
pub trait DeviceValue: DowncastSync + fmt::Debug {
    fn backend(&self) -> Backend;
    fn datum_type(&self) -> DatumType;
    fn shape(&self) -> &[usize];
    /// Synchronous download.
    fn to_host(&self) -> KestrelResult<Tensor>;
}

impl_downcast!(sync DeviceValue);

/// Memory services of a device backend, registered next to its kernels.
///
/// Device storage is returned to its pool when the last reference to a
/// value is dropped.
pub trait DeviceBridge: fmt::Debug + Send + Sync {
    fn backend(&self) -> Backend;
    /// Zero-initialized device storage.
    fn allocate(&self, fact: &TypedFact) -> KestrelResult<Arc<dyn DeviceValue>>;
    fn upload(&self, tensor: &Tensor) -> KestrelResult<Arc<dyn DeviceValue>>;
    /// Wait for every command enqueued so far.
    fn synchronize(&self) -> KestrelResult<()>;
}

#[derive(Clone)]
pub enum Value {
    Host(Arc<Tensor>),
    Device(Arc<dyn DeviceValue>),
}

impl Value {
    pub fn fact(&self) -> TypedFact {
        match self {
            Value::Host(t) => TypedFact::shape_and_dt_of(t),
            Value::Device(d) => TypedFact::new(d.datum_type(), d.shape().into()),
        }
    }

    pub fn location(&self) -> Location {
        match self {
            Value::Host(_) => Location::Host,
            Value::Device(d) => Location::Device(d.backend()),
        }
    }

    pub fn as_host(&self) -> KestrelResult<&Tensor> {
        match self {
            Value::Host(t) => Ok(t),
            Value::Device(d) => anyhow::bail!(KestrelError::InvalidTensorState(format!(
                "{:?} value read from the host without synchronization",
                d.backend()
            ))),
        }
    }

    /// Write access, for a value nobody else references.
    pub fn as_host_mut(&mut self) -> KestrelResult<&mut Tensor> {
        match self {
            Value::Host(t) => Arc::get_mut(t).ok_or_else(|| {
                KestrelError::InvalidTensorState("write to a shared tensor".into()).into()
            }),
            Value::Device(d) => anyhow::bail!(KestrelError::InvalidTensorState(format!(
                "{:?} value written from the host",
                d.backend()
            ))),
        }
    }

    pub fn as_device(&self) -> KestrelResult<&Arc<dyn DeviceValue>> {
        match self {
            Value::Device(d) => Ok(d),
            Value::Host(_) => anyhow::bail!(KestrelError::InvalidTensorState(
                "host value handed to a device kernel".into()
            )),
        }
    }

    /// Host copy, downloading (and waiting for) device values.
    pub fn to_host(&self) -> KestrelResult<Arc<Tensor>> {
        match self {
            Value::Host(t) => Ok(t.clone()),
            Value::Device(d) => Ok(Arc::new(d.to_host()?)),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.fact().byte_len()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}@{}", self.fact(), self.location())
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Value {
        Value::Host(Arc::new(t))
    }
}

impl From<Arc<Tensor>> for Value {
    fn from(t: Arc<Tensor>) -> Value {
        Value::Host(t)
    }
}
