use std::sync::Arc;

use kestrel_core::internal::*;
use parking_lot::{Mutex, RwLock};

use crate::device::OpenClContext;
use crate::memory::DeviceBuffer;
use crate::queue::Event;

/// A tensor in device memory.
///
/// `ready` is the event of the last command writing the storage. Host reads
/// wait for it, device commands are ordered after it by the queue.
#[derive(Clone)]
pub struct DeviceTensor {
    context: Arc<OpenClContext>,
    datum_type: DatumType,
    shape: TVec<usize>,
    storage: Arc<RwLock<DeviceBuffer>>,
    ready: Arc<Mutex<Event>>,
}

impl DeviceTensor {
    pub(crate) fn zeroed(
        context: &Arc<OpenClContext>,
        datum_type: DatumType,
        shape: &[usize],
    ) -> KestrelResult<DeviceTensor> {
        let bytes = shape
            .iter()
            .try_fold(datum_type.size_of(), |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| {
                KestrelError::AllocationFailure(format!("{datum_type:?} {shape:?} overflows"))
            })?;
        let storage = context.pool().allocate(bytes)?;
        Ok(DeviceTensor {
            context: context.clone(),
            datum_type,
            shape: shape.into(),
            storage: Arc::new(RwLock::new(storage)),
            ready: Arc::new(Mutex::new(Event::complete())),
        })
    }

    /// Recover the device tensor behind a value.
    pub fn from_value(value: &Value) -> KestrelResult<&DeviceTensor> {
        let device = value.as_device()?;
        device.downcast_ref::<DeviceTensor>().ok_or_else(|| {
            KestrelError::InvalidTensorState(format!(
                "{:?} value is not an OpenCL tensor",
                device.backend()
            ))
            .into()
        })
    }

    pub fn context(&self) -> &Arc<OpenClContext> {
        &self.context
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn storage(&self) -> &RwLock<DeviceBuffer> {
        &self.storage
    }

    pub fn ready(&self) -> Event {
        self.ready.lock().clone()
    }

    pub(crate) fn set_ready(&self, event: Event) {
        *self.ready.lock() = event;
    }
}

impl fmt::Debug for DeviceTensor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DeviceTensor({:?} {:?}, {:?})", self.datum_type, self.shape, self.ready())
    }
}

impl DeviceValue for DeviceTensor {
    fn backend(&self) -> Backend {
        Backend::GpuOpenCl
    }

    fn datum_type(&self) -> DatumType {
        self.datum_type
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn to_host(&self) -> KestrelResult<Tensor> {
        self.ready().wait()?;
        let storage = self.storage.read();
        let mut buffer = Buffer::zeroed(storage.len());
        buffer.as_bytes_mut().copy_from_slice(storage.as_bytes());
        Tensor::from_buffer(self.datum_type, &self.shape, buffer)
    }
}
