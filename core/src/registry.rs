//! Kernel registry: `(operator kind, backend, datum kind) -> factory`.
//!
//! A [`RegistryBuilder`] is filled by explicit [`KernelProvider`]s, then
//! frozen into an immutable [`KernelRegistry`] that is shared between plans
//! and read without locking.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use kestrel_data::prelude::*;

use crate::backend::Backend;
use crate::errors::{KestrelError, KestrelResult};
use crate::kernel::Kernel;
use crate::ops::{OpDef, OpKind};
use crate::value::DeviceBridge;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, new)]
pub struct KernelKey {
    pub kind: OpKind,
    pub backend: Backend,
    pub datum: DatumKind,
}

impl fmt::Display for KernelKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} on {} with {}", self.kind, self.backend, self.datum)
    }
}

/// Instantiates a kernel for an operator definition. Fails with
/// `UnsupportedCombination` when the parameters are not covered, letting
/// the dispatcher fall back to the next backend.
pub type KernelFactory = Arc<dyn Fn(&OpDef) -> KestrelResult<Box<dyn Kernel>> + Send + Sync>;

/// A compiled-in kernel set.
pub trait KernelProvider: fmt::Debug {
    fn name(&self) -> &'static str;
    fn register(&self, registry: &mut RegistryBuilder) -> KestrelResult<()>;
}

#[derive(Default)]
pub struct RegistryBuilder {
    factories: HashMap<KernelKey, KernelFactory>,
    bridges: HashMap<Backend, Arc<dyn DeviceBridge>>,
    providers: Vec<&'static str>,
}

impl RegistryBuilder {
    pub fn new() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn register<F>(
        &mut self,
        kind: OpKind,
        backend: Backend,
        datum: DatumKind,
        factory: F,
    ) -> KestrelResult<()>
    where
        F: Fn(&OpDef) -> KestrelResult<Box<dyn Kernel>> + Send + Sync + 'static,
    {
        let key = KernelKey::new(kind, backend, datum);
        if self.factories.contains_key(&key) {
            anyhow::bail!(KestrelError::DuplicateRegistration(key))
        }
        self.factories.insert(key, Arc::new(factory));
        Ok(())
    }

    pub fn register_bridge(&mut self, bridge: Arc<dyn DeviceBridge>) -> KestrelResult<()> {
        let backend = bridge.backend();
        anyhow::ensure!(
            !self.bridges.contains_key(&backend),
            "A device bridge is already registered for {}",
            backend
        );
        self.bridges.insert(backend, bridge);
        Ok(())
    }

    pub fn add_provider(&mut self, provider: &dyn KernelProvider) -> KestrelResult<()> {
        let before = self.factories.len();
        provider.register(self)?;
        log::info!(
            "Kernel provider {} registered {} kernels",
            provider.name(),
            self.factories.len() - before
        );
        self.providers.push(provider.name());
        Ok(())
    }

    pub fn with_provider(mut self, provider: &dyn KernelProvider) -> KestrelResult<RegistryBuilder> {
        self.add_provider(provider)?;
        Ok(self)
    }

    /// Every kernel set compiled into this crate.
    pub fn with_default_providers(self) -> KestrelResult<RegistryBuilder> {
        #[allow(unused_mut)]
        let mut builder = self.with_provider(&crate::kernels::reference::ReferenceKernels)?;
        #[cfg(feature = "neon")]
        {
            builder = builder.with_provider(&crate::kernels::neon::NeonKernels::default())?;
        }
        #[cfg(feature = "quantize")]
        {
            builder = builder.with_provider(&crate::kernels::quantized::QuantizedKernels)?;
        }
        Ok(builder)
    }

    pub fn build(self) -> KernelRegistry {
        KernelRegistry { factories: self.factories, bridges: self.bridges, providers: self.providers }
    }
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RegistryBuilder({} kernels)", self.factories.len())
    }
}

pub struct KernelRegistry {
    factories: HashMap<KernelKey, KernelFactory>,
    bridges: HashMap<Backend, Arc<dyn DeviceBridge>>,
    providers: Vec<&'static str>,
}

impl KernelRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn lookup(
        &self,
        kind: OpKind,
        backend: Backend,
        datum: DatumKind,
    ) -> KestrelResult<&KernelFactory> {
        let key = KernelKey::new(kind, backend, datum);
        self.factories
            .get(&key)
            .ok_or_else(|| KestrelError::UnsupportedCombination(key).into())
    }

    pub fn instantiate(
        &self,
        backend: Backend,
        datum: DatumKind,
        op: &OpDef,
    ) -> KestrelResult<Box<dyn Kernel>> {
        let factory = self.lookup(op.kind(), backend, datum)?;
        factory(op)
    }

    pub fn contains(&self, kind: OpKind, backend: Backend, datum: DatumKind) -> bool {
        self.factories.contains_key(&KernelKey::new(kind, backend, datum))
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<KernelKey> {
        let mut keys: Vec<KernelKey> = self.factories.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Backends with at least one kernel.
    pub fn capabilities(&self) -> Vec<Backend> {
        let mut backends: Vec<Backend> = self.factories.keys().map(|k| k.backend).collect();
        backends.sort();
        backends.dedup();
        backends
    }

    pub fn bridge(&self, backend: Backend) -> KestrelResult<&Arc<dyn DeviceBridge>> {
        self.bridges
            .get(&backend)
            .ok_or_else(|| anyhow::anyhow!("No device bridge registered for {}", backend))
    }

    pub fn providers(&self) -> &[&'static str] {
        &self.providers
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "KernelRegistry({} kernels from {:?})", self.factories.len(), self.providers)
    }
}

lazy_static::lazy_static! {
    static ref DEFAULT_REGISTRY: Result<Arc<KernelRegistry>, String> = {
        RegistryBuilder::new()
            .with_default_providers()
            .map(|b| Arc::new(b.build()))
            .map_err(|e| format!("{e:?}"))
    };
}

/// Process wide registry holding every kernel set compiled into this crate.
pub fn default_registry() -> KestrelResult<Arc<KernelRegistry>> {
    match &*DEFAULT_REGISTRY {
        Ok(registry) => Ok(registry.clone()),
        Err(e) => anyhow::bail!("Default registry initialization failed: {}", e),
    }
}
