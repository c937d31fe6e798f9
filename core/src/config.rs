//! Runtime configuration.
use crate::backend::BackendPreference;
use crate::errors::KestrelResult;

use anyhow::Context;

/// How a plan resolves and executes its graph.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub preference: BackendPreference,
    /// Run independent operators concurrently.
    pub parallel: bool,
    /// Worker threads in parallel mode. Defaults to the number of cores.
    pub threads: Option<usize>,
    /// Upper bound on live host tensor bytes during a run.
    pub memory_budget: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> RuntimeConfig {
        RuntimeConfig {
            preference: BackendPreference::default(),
            parallel: false,
            threads: None,
            memory_budget: None,
        }
    }
}

impl RuntimeConfig {
    pub fn with_preference(self, preference: BackendPreference) -> RuntimeConfig {
        RuntimeConfig { preference, ..self }
    }

    pub fn with_parallel(self, parallel: bool) -> RuntimeConfig {
        RuntimeConfig { parallel, ..self }
    }

    pub fn with_threads(self, threads: usize) -> RuntimeConfig {
        RuntimeConfig { threads: Some(threads), ..self }
    }

    pub fn with_memory_budget(self, bytes: usize) -> RuntimeConfig {
        RuntimeConfig { memory_budget: Some(bytes), ..self }
    }

    pub fn worker_threads(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Defaults overridden by `KESTREL_BACKENDS`, `KESTREL_PARALLEL`,
    /// `KESTREL_THREADS` and `KESTREL_MEMORY_BUDGET`.
    pub fn from_env() -> KestrelResult<RuntimeConfig> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> KestrelResult<RuntimeConfig> {
        let mut config = RuntimeConfig::default();
        if let Some(backends) = lookup("KESTREL_BACKENDS") {
            config.preference =
                BackendPreference::parse(&backends).context("Parsing KESTREL_BACKENDS")?;
        }
        if let Some(parallel) = lookup("KESTREL_PARALLEL") {
            config.parallel = match parallel.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                other => anyhow::bail!("Invalid KESTREL_PARALLEL value {:?}", other),
            };
        }
        if let Some(threads) = lookup("KESTREL_THREADS") {
            let threads: usize = threads.trim().parse().context("Parsing KESTREL_THREADS")?;
            anyhow::ensure!(threads > 0, "KESTREL_THREADS must be positive");
            config.threads = Some(threads);
        }
        if let Some(budget) = lookup("KESTREL_MEMORY_BUDGET") {
            config.memory_budget =
                Some(budget.trim().parse().context("Parsing KESTREL_MEMORY_BUDGET")?);
        }
        log::debug!("Runtime configuration: {:?}", config);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = RuntimeConfig::from_lookup(env(&[])).unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert!(config.worker_threads() >= 1);
    }

    #[test]
    fn read_every_variable() {
        let config = RuntimeConfig::from_lookup(env(&[
            ("KESTREL_BACKENDS", "quantized,reference"),
            ("KESTREL_PARALLEL", "true"),
            ("KESTREL_THREADS", "3"),
            ("KESTREL_MEMORY_BUDGET", "1048576"),
        ]))
        .unwrap();
        assert_eq!(config.preference.backends(), &[Backend::CpuQuantized, Backend::CpuReference]);
        assert!(config.parallel);
        assert_eq!(config.worker_threads(), 3);
        assert_eq!(config.memory_budget, Some(1 << 20));
    }

    #[test]
    fn reject_garbage() {
        assert!(RuntimeConfig::from_lookup(env(&[("KESTREL_THREADS", "0")])).is_err());
        assert!(RuntimeConfig::from_lookup(env(&[("KESTREL_PARALLEL", "maybe")])).is_err());
        assert!(RuntimeConfig::from_lookup(env(&[("KESTREL_BACKENDS", "tpu")])).is_err());
    }
}
