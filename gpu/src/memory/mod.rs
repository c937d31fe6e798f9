mod pool;

pub use pool::{DeviceBuffer, DeviceMemoryPool, DeviceMemoryStats};
