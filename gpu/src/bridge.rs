use std::sync::Arc;

use kestrel_core::internal::*;

use crate::device::OpenClContext;

/// Lets plans allocate, upload to and wait for an OpenCL context.
#[derive(Debug, Clone, new)]
pub struct OpenClBridge {
    context: Arc<OpenClContext>,
}

impl DeviceBridge for OpenClBridge {
    fn backend(&self) -> Backend {
        Backend::GpuOpenCl
    }

    fn allocate(&self, fact: &TypedFact) -> KestrelResult<Arc<dyn DeviceValue>> {
        Ok(Arc::new(self.context.allocate(fact.datum_type, &fact.shape)?))
    }

    fn upload(&self, tensor: &Tensor) -> KestrelResult<Arc<dyn DeviceValue>> {
        Ok(Arc::new(self.context.upload(tensor)?))
    }

    fn synchronize(&self) -> KestrelResult<()> {
        self.context.synchronize()
    }
}
