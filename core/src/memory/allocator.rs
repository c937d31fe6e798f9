use std::collections::HashMap;

use kestrel_data::prelude::*;

use crate::errors::{KestrelError, KestrelResult};
use crate::model::TypedFact;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Bytes held by live tensors.
    pub in_use: usize,
    /// High water mark of `in_use`.
    pub peak: usize,
    /// Bytes waiting in the free lists.
    pub pooled: usize,
    pub allocations: usize,
    /// Allocations served from the free lists.
    pub reused: usize,
}

/// Host tensor allocator with exact-size free lists.
///
/// Every tensor it hands out is zero-filled, whether its storage is fresh or
/// recycled.
#[derive(Debug, Default)]
pub struct HostAllocator {
    budget: Option<usize>,
    free: HashMap<usize, Vec<Buffer>>,
    stats: AllocatorStats,
}

impl HostAllocator {
    pub fn new() -> HostAllocator {
        HostAllocator::default()
    }

    /// Fail allocations that would take live bytes over `bytes`.
    pub fn with_budget(bytes: usize) -> HostAllocator {
        HostAllocator { budget: Some(bytes), ..HostAllocator::default() }
    }

    pub fn budget(&self) -> Option<usize> {
        self.budget
    }

    pub fn allocate(&mut self, fact: &TypedFact) -> KestrelResult<Tensor> {
        let bytes = fact
            .volume()
            .checked_mul(fact.datum_type.size_of())
            .ok_or_else(|| KestrelError::AllocationFailure(format!("{fact:?} overflows")))?;
        if let Some(budget) = self.budget {
            if self.stats.in_use + bytes > budget {
                anyhow::bail!(KestrelError::AllocationFailure(format!(
                    "{} bytes for {:?} with {} of {} bytes in use",
                    bytes, fact, self.stats.in_use, budget
                )))
            }
        }
        let buffer = match self.free.get_mut(&bytes).and_then(|list| list.pop()) {
            Some(mut buffer) => {
                buffer.clear();
                self.stats.pooled -= bytes;
                self.stats.reused += 1;
                buffer
            }
            None => Buffer::zeroed(bytes),
        };
        self.stats.allocations += 1;
        self.stats.in_use += bytes;
        self.stats.peak = self.stats.peak.max(self.stats.in_use);
        Tensor::from_buffer(fact.datum_type, &fact.shape, buffer)
    }

    /// Take back the storage of a tensor this allocator handed out.
    pub fn release(&mut self, tensor: Tensor) -> KestrelResult<()> {
        let bytes = tensor.byte_len();
        if bytes > self.stats.in_use {
            anyhow::bail!(KestrelError::InvalidTensorState(format!(
                "releasing {} bytes with only {} in use",
                bytes, self.stats.in_use
            )))
        }
        self.stats.in_use -= bytes;
        if bytes > 0 {
            self.free.entry(bytes).or_default().push(tensor.into_buffer());
            self.stats.pooled += bytes;
        }
        Ok(())
    }

    /// Stop accounting for a tensor leaving the allocator for good.
    pub fn forget(&mut self, tensor: &Tensor) {
        self.stats.in_use = self.stats.in_use.saturating_sub(tensor.byte_len());
    }

    /// Drop the pooled buffers.
    pub fn trim(&mut self) {
        self.free.clear();
        self.stats.pooled = 0;
    }

    pub fn stats(&self) -> AllocatorStats {
        self.stats
    }

    pub fn reset_peak(&mut self) {
        self.stats.peak = self.stats.in_use;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_storage_is_zeroed() {
        let mut alloc = HostAllocator::new();
        let fact = TypedFact::dt_shape::<f32>(&[2, 3]);
        let mut t = alloc.allocate(&fact).unwrap();
        t.as_slice_mut::<f32>().unwrap().iter_mut().for_each(|x| *x = 7.0);
        alloc.release(t).unwrap();
        assert_eq!(alloc.stats().pooled, 24);
        let again = alloc.allocate(&TypedFact::dt_shape::<i32>(&[6])).unwrap();
        assert_eq!(again, Tensor::zero::<i32>(&[6]));
        let stats = alloc.stats();
        assert_eq!((stats.reused, stats.allocations, stats.pooled, stats.in_use), (1, 2, 0, 24));
    }

    #[test]
    fn budget_is_enforced() {
        let mut alloc = HostAllocator::with_budget(100);
        let a = alloc.allocate(&TypedFact::dt_shape::<f32>(&[20])).unwrap();
        let err = alloc.allocate(&TypedFact::dt_shape::<f32>(&[10])).unwrap_err();
        assert!(matches!(KestrelError::of(&err), Some(KestrelError::AllocationFailure(_))));
        alloc.release(a).unwrap();
        assert!(alloc.allocate(&TypedFact::dt_shape::<f32>(&[10])).is_ok());
        assert_eq!(alloc.stats().peak, 80);
    }

    #[test]
    fn foreign_release_is_detected() {
        let mut alloc = HostAllocator::new();
        let err = alloc.release(Tensor::zero::<f32>(&[4])).unwrap_err();
        assert!(matches!(KestrelError::of(&err), Some(KestrelError::InvalidTensorState(_))));
    }

    #[test]
    fn quantized_types() {
        let mut alloc = HostAllocator::new();
        let dt = DatumType::QU8(QParams::new(128, 0.5));
        let t = alloc.allocate(&TypedFact::new(dt, tvec!(3))).unwrap();
        assert_eq!(t.datum_type(), dt);
        assert_eq!(t.byte_len(), 3);
    }
}
