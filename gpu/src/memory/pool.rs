use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use kestrel_core::internal::*;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceMemoryStats {
    /// Bytes held by live device buffers.
    pub in_use: usize,
    pub peak: usize,
    /// Bytes kept for reuse.
    pub pooled: usize,
    pub allocations: usize,
    pub reused: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    free: HashMap<usize, Vec<Buffer>>,
    stats: DeviceMemoryStats,
}

/// Device memory, bucketed by exact byte size.
///
/// Buffers go back to the pool when their [`DeviceBuffer`] handle is
/// dropped, so a device value is recycled once its last reference goes.
#[derive(Debug, Default)]
pub struct DeviceMemoryPool {
    budget: Option<usize>,
    state: Mutex<PoolState>,
}

impl DeviceMemoryPool {
    pub fn new(budget: Option<usize>) -> Arc<DeviceMemoryPool> {
        Arc::new(DeviceMemoryPool { budget, state: Mutex::default() })
    }

    /// Zero-filled device storage of `bytes` bytes.
    pub fn allocate(self: &Arc<Self>, bytes: usize) -> KestrelResult<DeviceBuffer> {
        let mut state = self.state.lock();
        if let Some(budget) = self.budget {
            if state.stats.in_use + bytes > budget {
                bail!(KestrelError::AllocationFailure(format!(
                    "{} device bytes with {} of {} bytes in use",
                    bytes, state.stats.in_use, budget
                )))
            }
        }
        let storage = match state.free.get_mut(&bytes).and_then(|list| list.pop()) {
            Some(mut buffer) => {
                buffer.clear();
                state.stats.pooled -= bytes;
                state.stats.reused += 1;
                buffer
            }
            None => Buffer::zeroed(bytes),
        };
        state.stats.allocations += 1;
        state.stats.in_use += bytes;
        state.stats.peak = state.stats.peak.max(state.stats.in_use);
        Ok(DeviceBuffer { storage: Some(storage), pool: self.clone() })
    }

    fn give_back(&self, buffer: Buffer) {
        let bytes = buffer.len();
        let mut state = self.state.lock();
        state.stats.in_use = state.stats.in_use.saturating_sub(bytes);
        if bytes > 0 {
            state.free.entry(bytes).or_default().push(buffer);
            state.stats.pooled += bytes;
        }
    }

    pub fn stats(&self) -> DeviceMemoryStats {
        self.state.lock().stats
    }

    pub fn budget(&self) -> Option<usize> {
        self.budget
    }

    /// Drop the pooled buffers.
    pub fn trim(&self) {
        let mut state = self.state.lock();
        state.free.clear();
        state.stats.pooled = 0;
    }
}

/// Storage handed out by a [`DeviceMemoryPool`].
pub struct DeviceBuffer {
    storage: Option<Buffer>,
    pool: Arc<DeviceMemoryPool>,
}

impl DeviceBuffer {
    pub fn len(&self) -> usize {
        self.storage.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.storage.as_ref().map(|b| b.as_bytes()).unwrap_or(&[])
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.storage.as_mut().map(|b| b.as_bytes_mut()).unwrap_or(&mut [])
    }

    /// Typed view over the storage.
    pub fn as_slice<T: Datum>(&self) -> KestrelResult<&[T]> {
        let bytes = self.as_bytes();
        ensure!(bytes.len() % T::datum_type().size_of() == 0, "misaligned device buffer");
        let (head, data, tail) = unsafe { bytes.align_to::<T>() };
        ensure!(head.is_empty() && tail.is_empty(), "misaligned device buffer");
        Ok(data)
    }

    pub fn as_slice_mut<T: Datum>(&mut self) -> KestrelResult<&mut [T]> {
        let bytes = self.as_bytes_mut();
        ensure!(bytes.len() % T::datum_type().size_of() == 0, "misaligned device buffer");
        let (head, data, tail) = unsafe { bytes.align_to_mut::<T>() };
        ensure!(head.is_empty() && tail.is_empty(), "misaligned device buffer");
        Ok(data)
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DeviceBuffer({} bytes)", self.len())
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            self.pool.give_back(storage);
        }
    }
}
