use criterion::*;
use kestrel_data::prelude::*;

fn activations(c: &mut Criterion) {
    let mut group = c.benchmark_group("activations");
    for size in [64usize, 4096, 65536] {
        group.throughput(Throughput::Elements(size as u64));
        let input = tensor1(&(0..size).map(|x| (x as f32 / size as f32) * 8.0 - 4.0).collect::<Vec<_>>());
        for (name, ops) in [("generic", kestrel_linalg::generic_ops()), ("best", kestrel_linalg::ops())] {
            group.bench_with_input(BenchmarkId::new(format!("sigmoid/{name}"), size), &size, |b, _| {
                let mut t = input.clone();
                let ew = (ops.sigmoid_f32)();
                b.iter(|| ew.run(t.as_slice_mut::<f32>().unwrap()).unwrap())
            });
            group.bench_with_input(BenchmarkId::new(format!("add/{name}"), size), &size, |b, _| {
                let mut t = input.clone();
                let other = input.clone();
                let bin = (ops.add_f32)();
                b.iter(|| {
                    bin.run(t.as_slice_mut::<f32>().unwrap(), other.as_slice::<f32>().unwrap())
                        .unwrap()
                })
            });
        }
    }
}

criterion_group!(benches, activations);
criterion_main!(benches);
