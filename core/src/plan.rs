//! Dispatcher: kernel resolution, scheduling and execution.
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use kestrel_data::prelude::*;
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::backend::{Backend, Location};
use crate::config::RuntimeConfig;
use crate::errors::{KestrelError, KestrelResult};
use crate::kernel::Kernel;
use crate::memory::{HostAllocator, TensorArena, TensorHandle};
use crate::model::{Graph, NodeOp, OutletId, TypedFact};
use crate::operator::Operator;
use crate::registry::{KernelKey, KernelRegistry};
use crate::value::Value;

/// Cooperative cancellation flag, checked between operators.
///
/// A cancelled token stays cancelled until `reset`.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst)
    }

    fn check(&self) -> KestrelResult<()> {
        if self.is_cancelled() {
            anyhow::bail!(KestrelError::Cancelled)
        }
        Ok(())
    }
}

/// Counters of the last run of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub executed: usize,
    /// Operators whose kernel predicate ran again because input facts
    /// changed.
    pub revalidated: usize,
    pub peak_host_bytes: usize,
    pub uploads: usize,
    pub downloads: usize,
}

/// Kernel selected for a node.
#[derive(Clone)]
pub struct ResolvedKernel {
    pub key: KernelKey,
    pub kernel: Arc<dyn Kernel>,
}

impl fmt::Debug for ResolvedKernel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.kernel.name(), self.key)
    }
}

/// A graph with kernels resolved and its schedule computed.
///
/// Plans are immutable and can be shared between sessions.
#[derive(Debug)]
pub struct Plan {
    graph: Arc<Graph>,
    registry: Arc<KernelRegistry>,
    config: RuntimeConfig,
    order: Vec<usize>,
    kernels: Vec<Option<ResolvedKernel>>,
    facts: Vec<Option<TypedFact>>,
    /// Outlets to release once the step at the same index ran.
    flush_lists: Vec<TVec<usize>>,
    /// Operator nodes grouped by dependency depth, each wave only
    /// depending on previous ones.
    waves: Vec<Vec<usize>>,
    wave_flush_lists: Vec<TVec<usize>>,
    pool: Option<Arc<ThreadPool>>,
}

impl Plan {
    pub fn new(
        graph: impl Into<Arc<Graph>>,
        registry: Arc<KernelRegistry>,
        config: RuntimeConfig,
    ) -> KestrelResult<Plan> {
        let graph = graph.into();
        let order = graph.eval_order()?;
        let nodes = graph.nodes();
        let mut kernels: Vec<Option<ResolvedKernel>> = vec![None; nodes.len()];
        let mut facts: Vec<Option<TypedFact>> = vec![None; nodes.len()];
        for &n in &order {
            let node = &nodes[n];
            let fact = match &node.op {
                NodeOp::Source(fact) => fact.clone(),
                NodeOp::Const(t) => TypedFact::shape_and_dt_of(t),
                NodeOp::Op(def) => {
                    let inputs: TVec<&TypedFact> = node
                        .inputs
                        .iter()
                        .map(|i| facts[i.node].as_ref().context("Input fact not computed"))
                        .collect::<KestrelResult<_>>()?;
                    let resolved = Self::resolve(&registry, &config, node, def, &inputs)
                        .with_context(|| format!("Resolving kernel for {node}"))?;
                    let mut outputs = resolved
                        .kernel
                        .output_facts(&inputs)
                        .with_context(|| format!("Validating {node} ({})", resolved.kernel.name()))?;
                    anyhow::ensure!(outputs.len() == 1, "{} must have exactly one output", node);
                    kernels[n] = Some(resolved);
                    outputs.remove(0)
                }
            };
            log::trace!("{} -> {:?}", node, fact);
            facts[n] = Some(fact);
        }

        let outputs: Vec<usize> = graph.output_outlets().iter().map(|o| o.node).collect();
        let mut depth: Vec<usize> = vec![0; nodes.len()];
        for &n in &order {
            if kernels[n].is_some() {
                depth[n] = 1 + nodes[n].inputs.iter().map(|i| depth[i.node]).max().unwrap_or(0);
            }
        }
        let wave_count = order.iter().map(|&n| depth[n]).max().unwrap_or(0);
        let mut waves: Vec<Vec<usize>> = vec![vec![]; wave_count];
        for &n in &order {
            if depth[n] > 0 {
                waves[depth[n] - 1].push(n);
            }
        }
        waves.iter_mut().for_each(|w| w.sort());

        // last step and last wave consuming each node output
        let mut last_step: Vec<Option<usize>> = vec![None; nodes.len()];
        let mut last_wave: Vec<usize> = vec![0; nodes.len()];
        for (step, &n) in order.iter().enumerate() {
            for input in &nodes[n].inputs {
                last_step[input.node] = Some(step);
                last_wave[input.node] = last_wave[input.node].max(depth[n]);
            }
        }
        let mut flush_lists: Vec<TVec<usize>> = vec![tvec!(); order.len()];
        let mut wave_flush_lists: Vec<TVec<usize>> = vec![tvec!(); wave_count];
        for n in 0..nodes.len() {
            if outputs.contains(&n) {
                continue;
            }
            if let Some(step) = last_step[n] {
                flush_lists[step].push(n);
                wave_flush_lists[last_wave[n] - 1].push(n);
            }
        }

        let pool = if config.parallel {
            let threads = config.worker_threads();
            let pool = rayon::ThreadPoolBuilder::new()
                .thread_name(|n| format!("kestrel-worker-{n}"))
                .num_threads(threads)
                .build()?;
            log::debug!("Parallel mode with {} workers over {} waves", threads, wave_count);
            Some(Arc::new(pool))
        } else {
            None
        };

        Ok(Plan {
            graph,
            registry,
            config,
            order,
            kernels,
            facts,
            flush_lists,
            waves,
            wave_flush_lists,
            pool,
        })
    }

    /// First backend of the preference with a kernel for the node. Factories
    /// declining the parameters count as a missing kernel.
    fn resolve(
        registry: &KernelRegistry,
        config: &RuntimeConfig,
        node: &crate::model::Node,
        def: &crate::ops::OpDef,
        inputs: &[&TypedFact],
    ) -> KestrelResult<ResolvedKernel> {
        let datum = inputs[0].datum_type.kind();
        let mut tried = vec![];
        for backend in config.preference.iter() {
            tried.push(backend);
            let key = KernelKey::new(def.kind(), backend, datum);
            match registry.lookup(key.kind, key.backend, key.datum).and_then(|f| f(def)) {
                Ok(kernel) => {
                    if let Location::Device(device) = kernel.location() {
                        registry.bridge(device)?;
                    }
                    log::debug!("{} runs on {} ({})", node, backend, kernel.name());
                    return Ok(ResolvedKernel { key, kernel: kernel.into() });
                }
                Err(e) if matches!(
                    KestrelError::of(&e),
                    Some(KestrelError::UnsupportedCombination(_))
                ) =>
                {
                    log::debug!("{} can not run on {}: {}", node, backend, e);
                }
                Err(e) => return Err(e),
            }
        }
        anyhow::bail!(KestrelError::NoAvailableKernel { kind: def.kind(), datum, tried })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn registry(&self) -> &Arc<KernelRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn waves(&self) -> &[Vec<usize>] {
        &self.waves
    }

    pub fn resolved(&self, node: usize) -> Option<&ResolvedKernel> {
        self.kernels.get(node).and_then(|k| k.as_ref())
    }

    /// Backend selected for a node, by node name.
    pub fn backend_of(&self, name: &str) -> KestrelResult<Backend> {
        let node = self.graph.node_by_name(name)?;
        self.resolved(node.id)
            .map(|r| r.key.backend)
            .with_context(|| format!("{node} is not an operator"))
    }

    pub fn output_fact(&self, outlet: OutletId) -> Option<&TypedFact> {
        self.facts.get(outlet.node).and_then(|f| f.as_ref())
    }

    pub fn session(&self) -> KestrelResult<Session<'_>> {
        Session::new(self)
    }

    pub fn run(&self, inputs: TVec<Tensor>) -> KestrelResult<TVec<Arc<Tensor>>> {
        self.session()?.run(inputs)
    }
}

/// Execution state of a plan: operators, live values, allocator.
#[derive(Debug)]
pub struct Session<'p> {
    plan: &'p Plan,
    operators: Vec<Option<Operator>>,
    facts: Vec<Option<TypedFact>>,
    arena: TensorArena,
    handles: Vec<Option<TensorHandle>>,
    cancel: CancellationToken,
    stats: RunStats,
}

struct Job {
    node: usize,
    inputs: TVec<Value>,
    outputs: TVec<Value>,
}

impl<'p> Session<'p> {
    pub fn new(plan: &'p Plan) -> KestrelResult<Session<'p>> {
        let nodes = plan.graph.nodes();
        let mut operators: Vec<Option<Operator>> = vec![None; nodes.len()];
        for &n in &plan.order {
            if let Some(resolved) = &plan.kernels[n] {
                let mut op = Operator::new(n, &nodes[n].name, resolved.kernel.clone());
                let inputs: TVec<&TypedFact> =
                    nodes[n].inputs.iter().filter_map(|i| plan.facts[i.node].as_ref()).collect();
                op.validate(&inputs)?;
                operators[n] = Some(op);
            }
        }
        let allocator = match plan.config.memory_budget {
            Some(budget) => HostAllocator::with_budget(budget),
            None => HostAllocator::new(),
        };
        Ok(Session {
            plan,
            operators,
            facts: plan.facts.clone(),
            arena: TensorArena::new(allocator),
            handles: vec![None; nodes.len()],
            cancel: CancellationToken::new(),
            stats: RunStats::default(),
        })
    }

    pub fn plan(&self) -> &Plan {
        self.plan
    }

    pub fn operator(&self, node: usize) -> Option<&Operator> {
        self.operators.get(node).and_then(|o| o.as_ref())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Share an external token, to cancel several sessions at once.
    pub fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    pub fn last_run_stats(&self) -> RunStats {
        self.stats
    }

    pub fn run(&mut self, inputs: TVec<Tensor>) -> KestrelResult<TVec<Arc<Tensor>>> {
        self.stats = RunStats::default();
        self.arena.host_allocator_mut().reset_peak();
        let result = self.run_inner(inputs);
        let cleanup = self.reset_values();
        let outputs = result?;
        cleanup?;
        Ok(outputs)
    }

    fn reset_values(&mut self) -> KestrelResult<()> {
        self.handles.iter_mut().for_each(|h| *h = None);
        self.arena.clear()
    }

    fn run_inner(&mut self, inputs: TVec<Tensor>) -> KestrelResult<TVec<Arc<Tensor>>> {
        let plan = self.plan;
        let graph = &plan.graph;
        let sources = graph.input_outlets();
        if inputs.len() != sources.len() {
            anyhow::bail!(
                "Graph expects {} inputs, got {}",
                sources.len(),
                inputs.len()
            )
        }
        self.refresh_facts(&inputs)?;
        for (outlet, input) in sources.iter().zip(inputs) {
            self.assign(outlet.node, Value::Host(Arc::new(input)), false)?;
        }
        for &n in &plan.order {
            if let NodeOp::Const(t) = &graph.node(n).op {
                self.assign(n, Value::Host(t.clone()), false)?;
            }
        }

        if let Some(pool) = &plan.pool {
            self.run_waves(pool)?;
        } else {
            self.run_sequential()?;
        }

        let mut outputs = tvec!();
        for outlet in graph.output_outlets() {
            let value = self.value(outlet.node)?.clone();
            if let Value::Device(_) = value {
                self.stats.downloads += 1;
            }
            outputs.push(value.to_host()?);
        }
        self.stats.peak_host_bytes = self.arena.host_stats().peak;
        Ok(outputs)
    }

    /// Check inputs against the sources and re-validate operators whose
    /// input facts changed.
    fn refresh_facts(&mut self, inputs: &[Tensor]) -> KestrelResult<()> {
        let plan = self.plan;
        let nodes = plan.graph.nodes();
        for (outlet, input) in plan.graph.input_outlets().iter().zip(inputs) {
            let fact = TypedFact::shape_and_dt_of(input);
            if let Some(declared) = &plan.facts[outlet.node] {
                ensure_type!(
                    declared.datum_type == fact.datum_type,
                    "Input {} declared {:?}, got {:?}",
                    nodes[outlet.node],
                    declared.datum_type,
                    fact.datum_type
                );
            }
            self.facts[outlet.node] = Some(fact);
        }
        for &n in &plan.order {
            if let Some(op) = self.operators[n].as_mut() {
                let inputs: TVec<&TypedFact> = nodes[n]
                    .inputs
                    .iter()
                    .map(|i| self.facts[i.node].as_ref().context("Input fact not computed"))
                    .collect::<KestrelResult<_>>()?;
                let revalidated = op.rearm(&inputs)?;
                if revalidated {
                    log::debug!("Re-validated {:?} for {:?}", op, inputs);
                }
                drop(inputs);
                if revalidated {
                    self.stats.revalidated += 1;
                }
                self.facts[n] = op.output_facts().first().cloned();
            }
        }
        Ok(())
    }

    fn value(&self, node: usize) -> KestrelResult<&Value> {
        let handle = self.handles[node].ok_or_else(|| {
            KestrelError::InvalidTensorState(format!(
                "{} read before being computed",
                self.plan.graph.node(node)
            ))
        })?;
        self.arena.get(handle)
    }

    /// Bind a value to a node output. Every output is written once per run.
    fn assign(&mut self, node: usize, value: Value, pooled: bool) -> KestrelResult<()> {
        if self.handles[node].is_some() {
            anyhow::bail!(KestrelError::InvalidTensorState(format!(
                "{} written twice",
                self.plan.graph.node(node)
            )))
        }
        let handle =
            if pooled { self.arena.adopt_allocated(value) } else { self.arena.adopt(value) };
        self.handles[node] = Some(handle);
        Ok(())
    }

    fn release(&mut self, nodes: &[usize]) -> KestrelResult<()> {
        for &n in nodes {
            if let Some(handle) = self.handles[n] {
                log::trace!("Releasing {}", self.plan.graph.node(n));
                self.arena.release(handle)?;
            }
        }
        Ok(())
    }

    /// Move a value to where a kernel expects it. This is the
    /// synchronization point between host and device work.
    fn to_location(&mut self, value: Value, location: Location) -> KestrelResult<Value> {
        match (value, location) {
            (Value::Device(d), Location::Host) => {
                self.stats.downloads += 1;
                Ok(Value::Host(Arc::new(d.to_host()?)))
            }
            (Value::Host(t), Location::Device(backend)) => {
                self.stats.uploads += 1;
                Ok(Value::Device(self.plan.registry.bridge(backend)?.upload(&t)?))
            }
            (Value::Device(d), Location::Device(backend)) if d.backend() != backend => {
                self.stats.downloads += 1;
                self.stats.uploads += 1;
                let host = d.to_host()?;
                Ok(Value::Device(self.plan.registry.bridge(backend)?.upload(&host)?))
            }
            (value, _) => Ok(value),
        }
    }

    fn prepare(&mut self, node: usize) -> KestrelResult<Job> {
        let plan = self.plan;
        let Some(op) = self.operators[node].as_ref() else {
            anyhow::bail!("{} has no operator", plan.graph.node(node))
        };
        let location = op.kernel().location();
        let output_facts = op.output_facts().to_vec();
        let mut inputs = tvec!();
        for input in &plan.graph.node(node).inputs {
            let value = self.value(input.node)?.clone();
            inputs.push(self.to_location(value, location)?);
        }
        let mut outputs = tvec!();
        for fact in &output_facts {
            let value = match location {
                Location::Host => self.arena.allocate_host(fact)?,
                Location::Device(backend) => {
                    self.arena.allocate_device(fact, &**plan.registry.bridge(backend)?)?
                }
            };
            outputs.push(value);
        }
        Ok(Job { node, inputs, outputs })
    }

    fn finish(&mut self, job: Job) -> KestrelResult<()> {
        let Job { node, inputs, mut outputs } = job;
        drop(inputs);
        self.stats.executed += 1;
        self.assign(node, outputs.remove(0), true)
    }

    fn run_sequential(&mut self) -> KestrelResult<()> {
        let plan = self.plan;
        for (step, &n) in plan.order.iter().enumerate() {
            if plan.kernels[n].is_some() {
                self.cancel.check()?;
                let mut job = self.prepare(n)?;
                let node = plan.graph.node(n);
                let Some(op) = self.operators[n].as_mut() else {
                    anyhow::bail!("{} has no operator", node)
                };
                op.execute(&job.inputs, &mut job.outputs)
                    .with_context(|| format!("Evaluating {node}"))?;
                self.finish(job)?;
            }
            self.release(&plan.flush_lists[step])?;
        }
        Ok(())
    }

    fn run_waves(&mut self, pool: &ThreadPool) -> KestrelResult<()> {
        let plan = self.plan;
        for (wave, nodes) in plan.waves.iter().enumerate() {
            self.cancel.check()?;
            let jobs = nodes.iter().map(|&n| self.prepare(n)).collect::<KestrelResult<Vec<_>>>()?;
            let operators: Vec<&mut Operator> = self
                .operators
                .iter_mut()
                .enumerate()
                .filter(|(ix, _)| nodes.binary_search(ix).is_ok())
                .filter_map(|(_, op)| op.as_mut())
                .collect();
            let cancel = &self.cancel;
            let graph = &plan.graph;
            log::trace!("Wave {} runs {:?}", wave, nodes);
            let done: Vec<KestrelResult<Job>> = pool.install(|| {
                jobs.into_par_iter()
                    .zip(operators)
                    .map(|(mut job, op)| -> KestrelResult<Job> {
                        cancel.check()?;
                        op.execute(&job.inputs, &mut job.outputs)
                            .with_context(|| format!("Evaluating {}", graph.node(job.node)))?;
                        Ok(job)
                    })
                    .collect()
            });
            for job in done {
                self.finish(job?)?;
            }
            self.release(&plan.wave_flush_lists[wave])?;
        }
        Ok(())
    }
}
