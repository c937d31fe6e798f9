use criterion::*;
use kestrel_core::internal::*;

fn chain(len: usize, width: usize) -> Graph {
    let mut g = Graph::default();
    let mut wire = g.add_source("x", TypedFact::dt_shape::<f32>(&[width])).unwrap();
    for i in 0..len {
        wire = g.add_node(format!("relu{i}"), ActivationType::ReluX(6.0), &[wire]).unwrap();
    }
    g.set_outputs(&[wire]).unwrap();
    g
}

/// Per operator overhead: tiny tensors so kernel time is negligible.
fn session_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_run");
    for len in [1usize, 16, 128] {
        group.throughput(Throughput::Elements(len as u64));
        for parallel in [false, true] {
            let config = RuntimeConfig::default().with_parallel(parallel);
            let plan = Plan::new(chain(len, 4), default_registry().unwrap(), config).unwrap();
            let mut session = plan.session().unwrap();
            let name = if parallel { "waves" } else { "sequential" };
            group.bench_with_input(BenchmarkId::new(name, len), &len, |b, _| {
                b.iter(|| session.run(tvec!(Tensor::zero::<f32>(&[4]))).unwrap())
            });
        }
    }
    group.finish();
}

fn plan_resolution(c: &mut Criterion) {
    let registry = default_registry().unwrap();
    let graph = Arc::new(chain(64, 4));
    c.bench_function("plan_resolution/64", |b| {
        b.iter(|| Plan::new(graph.clone(), registry.clone(), RuntimeConfig::default()).unwrap())
    });
}

fn registry_lookup(c: &mut Criterion) {
    let registry = default_registry().unwrap();
    let def = OpDef::from(ActivationType::Relu);
    c.bench_function("registry_instantiate", |b| {
        b.iter(|| registry.instantiate(Backend::CpuReference, DatumKind::F32, std::hint::black_box(&def)).unwrap())
    });
}

criterion_group!(benches, session_run, plan_resolution, registry_lookup);
criterion_main!(benches);
