use std::sync::Arc;

use crate::errors::{KestrelError, KestrelResult};
use crate::memory::{AllocatorStats, HostAllocator};
use crate::model::TypedFact;
use crate::value::{DeviceBridge, Value};

/// Index of a value slot in a [`TensorArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorHandle(usize);

#[derive(Debug)]
enum Slot {
    /// `pooled` values were allocated by this arena.
    Live { value: Value, pooled: bool },
    Released,
}

/// Slots of values with an explicit lifecycle.
///
/// Slots are never reused during the arena lifetime, so reading or
/// releasing a released handle is always reported as `InvalidTensorState`.
/// Host storage goes back to the arena allocator; device storage goes back
/// to its pool once the last reference is dropped.
#[derive(Debug, Default)]
pub struct TensorArena {
    host: HostAllocator,
    slots: Vec<Slot>,
}

impl TensorArena {
    pub fn new(host: HostAllocator) -> TensorArena {
        TensorArena { host, slots: vec![] }
    }

    /// Zero-initialized host tensor, not tracked yet.
    pub fn allocate_host(&mut self, fact: &TypedFact) -> KestrelResult<Value> {
        Ok(Value::Host(Arc::new(self.host.allocate(fact)?)))
    }

    pub fn allocate_device(
        &mut self,
        fact: &TypedFact,
        bridge: &dyn DeviceBridge,
    ) -> KestrelResult<Value> {
        Ok(Value::Device(bridge.allocate(fact)?))
    }

    /// Allocate a host tensor and track it.
    pub fn allocate(&mut self, fact: &TypedFact) -> KestrelResult<TensorHandle> {
        let value = self.allocate_host(fact)?;
        Ok(self.adopt_allocated(value))
    }

    /// Track a value produced elsewhere (graph inputs, constants). Its
    /// storage is not recycled on release.
    pub fn adopt(&mut self, value: Value) -> TensorHandle {
        self.push(value, false)
    }

    /// Track a value obtained from `allocate_host` or `allocate_device`.
    pub fn adopt_allocated(&mut self, value: Value) -> TensorHandle {
        self.push(value, true)
    }

    fn push(&mut self, value: Value, pooled: bool) -> TensorHandle {
        self.slots.push(Slot::Live { value, pooled });
        TensorHandle(self.slots.len() - 1)
    }

    fn slot(&self, handle: TensorHandle) -> KestrelResult<&Slot> {
        self.slots.get(handle.0).ok_or_else(|| {
            KestrelError::InvalidTensorState(format!("{handle:?} does not belong to this arena"))
                .into()
        })
    }

    pub fn get(&self, handle: TensorHandle) -> KestrelResult<&Value> {
        match self.slot(handle)? {
            Slot::Live { value, .. } => Ok(value),
            Slot::Released => anyhow::bail!(KestrelError::InvalidTensorState(format!(
                "{handle:?} read after release"
            ))),
        }
    }

    pub fn is_live(&self, handle: TensorHandle) -> bool {
        matches!(self.slots.get(handle.0), Some(Slot::Live { .. }))
    }

    fn take_slot(&mut self, handle: TensorHandle) -> KestrelResult<(Value, bool)> {
        self.slot(handle)?;
        match std::mem::replace(&mut self.slots[handle.0], Slot::Released) {
            Slot::Live { value, pooled } => Ok((value, pooled)),
            Slot::Released => anyhow::bail!(KestrelError::InvalidTensorState(format!(
                "{handle:?} used after release"
            ))),
        }
    }

    /// Move the value out, marking the slot released. The value leaves the
    /// arena accounting.
    pub fn take(&mut self, handle: TensorHandle) -> KestrelResult<Value> {
        let (value, pooled) = self.take_slot(handle)?;
        if let (Value::Host(t), true) = (&value, pooled) {
            self.host.forget(t);
        }
        Ok(value)
    }

    pub fn release(&mut self, handle: TensorHandle) -> KestrelResult<()> {
        if matches!(self.slot(handle)?, Slot::Released) {
            anyhow::bail!(KestrelError::InvalidTensorState(format!("{handle:?} released twice")))
        }
        let (value, pooled) = self.take_slot(handle)?;
        self.recycle(value, pooled)
    }

    /// Host storage nobody else references goes back to the free lists,
    /// the rest is only dropped.
    fn recycle(&mut self, value: Value, pooled: bool) -> KestrelResult<()> {
        if let (Value::Host(t), true) = (value, pooled) {
            match Arc::try_unwrap(t) {
                Ok(t) => return self.host.release(t),
                Err(shared) => self.host.forget(&shared),
            }
        }
        Ok(())
    }

    /// Release every live slot and forget all handles.
    pub fn clear(&mut self) -> KestrelResult<()> {
        let slots = std::mem::take(&mut self.slots);
        for slot in slots {
            if let Slot::Live { value, pooled } = slot {
                self.recycle(value, pooled)?;
            }
        }
        Ok(())
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s, Slot::Live { .. })).count()
    }

    pub fn host_stats(&self) -> AllocatorStats {
        self.host.stats()
    }

    pub fn host_allocator_mut(&mut self) -> &mut HostAllocator {
        &mut self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_data::prelude::*;

    fn is_invalid_state(err: anyhow::Error) -> bool {
        matches!(KestrelError::of(&err), Some(KestrelError::InvalidTensorState(_)))
    }

    #[test]
    fn double_release() {
        let mut arena = TensorArena::default();
        let fact = TypedFact::dt_shape::<f32>(&[4]);
        let a = arena.allocate(&fact).unwrap();
        let b = arena.allocate(&fact).unwrap();
        arena.release(a).unwrap();
        assert!(is_invalid_state(arena.release(a).unwrap_err()));
        assert!(is_invalid_state(arena.get(a).unwrap_err()));
        assert_eq!(*arena.get(b).unwrap().as_host().unwrap(), Tensor::zero::<f32>(&[4]));
        assert_eq!(arena.live(), 1);
    }

    #[test]
    fn released_storage_is_recycled() {
        let mut arena = TensorArena::default();
        let fact = TypedFact::dt_shape::<u8>(&[64]);
        let a = arena.allocate(&fact).unwrap();
        arena.release(a).unwrap();
        let _b = arena.allocate(&fact).unwrap();
        let stats = arena.host_stats();
        assert_eq!((stats.reused, stats.in_use, stats.peak), (1, 64, 64));
    }

    #[test]
    fn shared_values_are_not_recycled() {
        let mut arena = TensorArena::default();
        let shared = Arc::new(tensor1(&[1f32, 2.]));
        let h = arena.adopt(Value::Host(shared.clone()));
        arena.release(h).unwrap();
        assert_eq!(*shared, tensor1(&[1f32, 2.]));
        assert_eq!(arena.host_stats().pooled, 0);
    }

    #[test]
    fn foreign_handle() {
        let mut arena = TensorArena::default();
        let mut other = TensorArena::default();
        other.allocate(&TypedFact::dt_shape::<f32>(&[1])).unwrap();
        let h = other.allocate(&TypedFact::dt_shape::<f32>(&[1])).unwrap();
        assert!(is_invalid_state(arena.release(h).unwrap_err()));
    }
}
