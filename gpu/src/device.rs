use std::sync::Arc;

use kestrel_core::internal::*;
use parking_lot::Mutex;

use crate::memory::{DeviceMemoryPool, DeviceMemoryStats};
use crate::queue::CommandQueue;
use crate::tensor::DeviceTensor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenClConfig {
    /// Upper bound on live device bytes.
    pub memory_budget: Option<usize>,
    /// Work items per work group when a kernel is launched.
    pub work_group_size: usize,
}

impl Default for OpenClConfig {
    fn default() -> OpenClConfig {
        OpenClConfig { memory_budget: None, work_group_size: 64 }
    }
}

impl OpenClConfig {
    /// Defaults overridden by `KESTREL_OPENCL_MEMORY_BUDGET` and
    /// `KESTREL_OPENCL_WORK_GROUP`.
    pub fn from_env() -> KestrelResult<OpenClConfig> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> KestrelResult<OpenClConfig> {
        let mut config = OpenClConfig::default();
        if let Some(budget) = lookup("KESTREL_OPENCL_MEMORY_BUDGET") {
            config.memory_budget =
                Some(budget.trim().parse().context("Parsing KESTREL_OPENCL_MEMORY_BUDGET")?);
        }
        if let Some(wg) = lookup("KESTREL_OPENCL_WORK_GROUP") {
            config.work_group_size = wg.trim().parse().context("Parsing KESTREL_OPENCL_WORK_GROUP")?;
            ensure!(config.work_group_size > 0, "KESTREL_OPENCL_WORK_GROUP must be positive");
        }
        Ok(config)
    }
}

/// One device: a command queue and the memory it allocates from.
#[derive(Debug)]
pub struct OpenClContext {
    config: OpenClConfig,
    queue: CommandQueue,
    pool: Arc<DeviceMemoryPool>,
}

impl OpenClContext {
    pub fn new(config: OpenClConfig) -> KestrelResult<Arc<OpenClContext>> {
        debug!("Creating OpenCL context with {:?}", config);
        Ok(Arc::new(OpenClContext {
            queue: CommandQueue::new("opencl")?,
            pool: DeviceMemoryPool::new(config.memory_budget),
            config,
        }))
    }

    pub fn config(&self) -> &OpenClConfig {
        &self.config
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn pool(&self) -> &Arc<DeviceMemoryPool> {
        &self.pool
    }

    pub fn memory_stats(&self) -> DeviceMemoryStats {
        self.pool.stats()
    }

    pub fn synchronize(&self) -> KestrelResult<()> {
        self.queue.finish()
    }

    /// Zero-filled device tensor.
    pub fn allocate(
        self: &Arc<Self>,
        datum_type: DatumType,
        shape: &[usize],
    ) -> KestrelResult<DeviceTensor> {
        DeviceTensor::zeroed(self, datum_type, shape)
    }

    /// Asynchronous copy of `tensor` to the device.
    pub fn upload(self: &Arc<Self>, tensor: &Tensor) -> KestrelResult<DeviceTensor> {
        let device = DeviceTensor::zeroed(self, tensor.datum_type(), tensor.shape())?;
        let host = tensor.clone();
        let target = device.clone();
        let event = self.queue.enqueue("upload", move || {
            target.storage().write().as_bytes_mut().copy_from_slice(host.as_bytes());
            Ok(())
        })?;
        device.set_ready(event);
        Ok(device)
    }
}

static DEVICE_CONTEXT: Mutex<Option<Arc<OpenClContext>>> = parking_lot::const_mutex(None);

/// Install the process wide context. Fails if one is already in use.
pub fn set_context(context: Arc<OpenClContext>) -> KestrelResult<()> {
    let mut current = DEVICE_CONTEXT.lock();
    if current.is_some() {
        bail!("OpenCL context is already set")
    }
    *current = Some(context);
    Ok(())
}

/// The process wide context, created from the environment on first use.
pub fn get_context() -> KestrelResult<Arc<OpenClContext>> {
    let mut current = DEVICE_CONTEXT.lock();
    if let Some(context) = current.as_ref() {
        return Ok(context.clone());
    }
    let context = OpenClContext::new(OpenClConfig::from_env()?)?;
    *current = Some(context.clone());
    Ok(context)
}
