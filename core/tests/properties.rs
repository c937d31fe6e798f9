use approx::assert_abs_diff_eq;
use kestrel_core::internal::*;
#[cfg(feature = "neon")]
use kestrel_core::kernels::neon::NeonKernels;
#[cfg(feature = "quantize")]
use kestrel_core::kernels::quantized::QuantizedKernels;
use kestrel_core::kernels::reference::ReferenceKernels;
use kestrel_core::ops::samples::sample;
#[cfg(feature = "neon")]
use proptest::collection::vec;
#[cfg(feature = "neon")]
use proptest::prelude::*;

fn full_registry() -> Arc<KernelRegistry> {
    #[allow(unused_mut)]
    let mut builder = RegistryBuilder::new().with_provider(&ReferenceKernels).unwrap();
    #[cfg(feature = "neon")]
    {
        builder = builder.with_provider(&NeonKernels::forced()).unwrap();
    }
    #[cfg(feature = "quantize")]
    {
        builder = builder.with_provider(&QuantizedKernels).unwrap();
    }
    Arc::new(builder.build())
}

fn only(backend: Backend) -> RuntimeConfig {
    RuntimeConfig::default().with_preference(BackendPreference::only(backend))
}

#[test]
fn every_registered_kernel_accepts_a_sample() {
    let registry = full_registry();
    assert!(!registry.is_empty());
    for key in registry.keys() {
        let sample = sample(key.kind, key.datum)
            .unwrap()
            .unwrap_or_else(|| panic!("no sample for {key}"));
        let kernel = registry
            .instantiate(key.backend, key.datum, &sample.def)
            .unwrap_or_else(|e| panic!("{key}: {e:?}"));
        assert_eq!(kernel.backend(), key.backend);
        let facts = sample.facts();
        let facts: TVec<&TypedFact> = facts.iter().collect();
        let outputs = kernel.output_facts(&facts).unwrap_or_else(|e| panic!("{key}: {e:?}"));
        assert_eq!(outputs.len(), 1, "{key}");
    }
}

#[test]
fn uncompiled_backend_is_unsupported() {
    let registry = full_registry();
    for backend in [Backend::GpuOpenCl, Backend::DspHexagon] {
        let err = registry.instantiate(backend, DatumKind::F32, &ActivationType::Relu.into());
        assert!(matches!(
            KestrelError::of(&err.unwrap_err()),
            Some(KestrelError::UnsupportedCombination(_))
        ));
        assert!(!registry.capabilities().contains(&backend));
    }
}

#[test]
fn double_release_does_not_touch_other_tensors() {
    let mut arena = TensorArena::default();
    let fact = TypedFact::dt_shape::<f32>(&[3]);
    let a = arena.allocate(&fact).unwrap();
    let b = arena.adopt(Value::from(tensor1(&[1f32, 2., 3.])));
    arena.release(a).unwrap();
    let err = arena.release(a).unwrap_err();
    assert!(matches!(KestrelError::of(&err), Some(KestrelError::InvalidTensorState(_))));
    let c = arena.allocate(&fact).unwrap();
    assert_eq!(*arena.get(b).unwrap().as_host().unwrap(), tensor1(&[1f32, 2., 3.]));
    assert_eq!(*arena.get(c).unwrap().as_host().unwrap(), Tensor::zero::<f32>(&[3]));
}

/// A -> B -> C, with D on a parallel branch joining at C.
fn diamond(width: usize) -> Graph {
    let mut g = Graph::default();
    let x = g.add_source("x", TypedFact::dt_shape::<f32>(&[2, width])).unwrap();
    let w = g.add_const("w", Tensor::from_shape(&[width, width], &ramp(width * width)).unwrap()).unwrap();
    let a = g.add_node("a", MatMulParams::default(), &[x, w]).unwrap();
    let b = g.add_node("b", ActivationType::Tanh, &[a]).unwrap();
    let d = g.add_node("d", ActivationType::Sigmoid, &[x]).unwrap();
    let c = g.add_node("c", EltwiseType::Prod, &[b, d]).unwrap();
    let s = g.add_node("s", OpParams::Softmax, &[c]).unwrap();
    g.set_outputs(&[s, d]).unwrap();
    g
}

fn ramp(len: usize) -> Vec<f32> {
    (0..len).map(|i| ((i * 7) % 17) as f32 / 8.0 - 1.0).collect()
}

#[test]
fn parallel_run_matches_sequential() {
    let registry = full_registry();
    let sequential = Plan::new(diamond(16), registry.clone(), only(Backend::CpuReference)).unwrap();
    let parallel = Plan::new(
        diamond(16),
        registry,
        only(Backend::CpuReference).with_parallel(true).with_threads(4),
    )
    .unwrap();
    assert!(parallel.waves().iter().any(|w| w.len() > 1));
    let mut s1 = sequential.session().unwrap();
    let mut s2 = parallel.session().unwrap();
    for round in 0..4 {
        let x = Tensor::from_shape(&[2, 16], &ramp(32 + round)[round..]).unwrap();
        let a = s1.run(tvec!(x.clone())).unwrap();
        let b = s2.run(tvec!(x)).unwrap();
        assert_eq!(a, b);
        assert_eq!(s1.last_run_stats().executed, s2.last_run_stats().executed);
    }
}

#[test]
fn rerun_with_new_data_is_stable() {
    let plan = Plan::new(diamond(8), full_registry(), RuntimeConfig::default()).unwrap();
    let mut session = plan.session().unwrap();
    for round in 0..3 {
        let x = Tensor::from_shape(&[2, 8], &ramp(16 + round)[round..]).unwrap();
        session.run(tvec!(x)).unwrap();
        assert_eq!(session.last_run_stats().revalidated, 0);
        for node in plan.order() {
            if let Some(op) = session.operator(*node) {
                assert_eq!(op.state(), OperatorState::Executed);
                assert_eq!(op.validations(), 1, "{}", op.name());
            }
        }
    }
}

fn empty_product(dt: DatumType, def: OpDef, a: &[usize], b: &[usize]) -> Graph {
    let mut g = Graph::default();
    let x = g.add_source("a", TypedFact::new(dt, a.into())).unwrap();
    let y = g.add_source("b", TypedFact::new(dt, b.into())).unwrap();
    let mm = g.add_node("mm", def, &[x, y]).unwrap();
    g.set_outputs(&[mm]).unwrap();
    g
}

fn run_empty_product(
    backend: Backend,
    dt: DatumType,
    def: OpDef,
    a: &[usize],
    b: &[usize],
) -> Arc<Tensor> {
    let plan = Plan::new(empty_product(dt, def, a, b), full_registry(), only(backend)).unwrap();
    assert_eq!(plan.backend_of("mm").unwrap(), backend);
    let mut y = plan.run(tvec!(Tensor::zero_dt(dt, a), Tensor::zero_dt(dt, b))).unwrap();
    y.remove(0)
}

#[test]
fn matmul_over_empty_inner_dimension() {
    let mut backends = vec![Backend::CpuReference];
    if cfg!(feature = "neon") {
        backends.push(Backend::CpuNeon);
    }
    let plain = MatMulParams::default();
    let transposed = MatMulParams::new(true, true);
    for backend in backends {
        let y = run_empty_product(backend, DatumType::F32, plain.into(), &[2, 0], &[0, 3]);
        assert_eq!(*y, Tensor::zero::<f32>(&[2, 3]), "{backend}");
        let y = run_empty_product(backend, DatumType::F32, transposed.into(), &[2, 0, 2], &[2, 3, 0]);
        assert_eq!(*y, Tensor::zero::<f32>(&[2, 2, 3]), "{backend}");
        let y = run_empty_product(backend, DatumType::F32, transposed.into(), &[3, 0], &[2, 3]);
        assert_eq!(y.shape(), &[0, 2], "{backend}");
    }
}

#[cfg(feature = "quantize")]
#[test]
fn quantized_matmul_over_empty_inner_dimension() {
    let dt = DatumType::QU8(QParams::new(128, 0.5));
    let qy = QParams::new(5, 0.25);
    let y = run_empty_product(
        Backend::CpuQuantized,
        dt,
        OpDef::quantized(MatMulParams::default(), qy),
        &[2, 0],
        &[0, 3],
    );
    assert_eq!(y.shape(), &[2, 3]);
    assert_eq!(y.as_slice::<u8>().unwrap(), &[5u8; 6]);
    let y = run_empty_product(
        Backend::CpuQuantized,
        dt,
        OpDef::quantized(MatMulParams::new(true, false), qy),
        &[3, 0],
        &[3, 2],
    );
    assert_eq!(y.shape(), &[0, 2]);
}

#[cfg(feature = "quantize")]
#[test]
fn quantized_i8_add_within_one_step() {
    let (qa, qb, qy) = (QParams::new(-10, 0.04), QParams::new(5, 0.07), QParams::new(0, 0.1));
    let mut g = Graph::default();
    let a = g.add_source("a", TypedFact::new(DatumType::QI8(qa), tvec!(64))).unwrap();
    let b = g.add_source("b", TypedFact::new(DatumType::QI8(qb), tvec!(64))).unwrap();
    let sum = g.add_node("sum", OpDef::quantized(EltwiseType::Sum, qy), &[a, b]).unwrap();
    g.set_outputs(&[sum]).unwrap();
    let plan = Plan::new(g, full_registry(), RuntimeConfig::default()).unwrap();
    assert_eq!(plan.backend_of("sum").unwrap(), Backend::CpuQuantized);

    let quantize = |data: Vec<f32>, qp| {
        Tensor::from_shape(&[64], &data).unwrap().cast_to_dt(DatumType::QI8(qp)).unwrap().into_owned()
    };
    let a = quantize((0..64).map(|i| (i as f32 * 0.3).sin() * 4.0).collect(), qa);
    let b = quantize((0..64).map(|i| (i as f32 * 0.17).cos() * 6.0).collect(), qb);
    let y = plan.run(tvec!(a.clone(), b.clone())).unwrap();
    let real = |t: &Tensor| t.cast_to::<f32>().unwrap().as_slice::<f32>().unwrap().to_vec();
    for ((a, b), y) in real(&a).iter().zip(real(&b)).zip(real(&y[0])) {
        let expected = (a + b).clamp(-128.0 * qy.scale, 127.0 * qy.scale);
        assert!((y - expected).abs() <= qy.scale, "{a} + {b} = {y}");
    }
}

#[cfg(feature = "neon")]
proptest! {
    #[test]
    fn neon_matches_reference(
        dims in vec(1usize..6, 1..4),
        op in prop_oneof![
            Just(EltwiseType::Sum),
            Just(EltwiseType::Sub),
            Just(EltwiseType::Prod),
            Just(EltwiseType::Min),
            Just(EltwiseType::Max),
        ],
        seed in 0usize..32,
    ) {
        let len: usize = dims.iter().product();
        let mut g = Graph::default();
        let x = g.add_source("x", TypedFact::dt_shape::<f32>(&dims)).unwrap();
        let last = *dims.last().unwrap();
        let bias = g.add_const("bias", tensor1(&ramp(last + seed)[seed..])).unwrap();
        let e = g.add_node("e", op, &[x, bias]).unwrap();
        let r = g.add_node("r", ActivationType::ReluX(0.5), &[e]).unwrap();
        let s = g.add_node("s", OpParams::AddN, &[r, e, x]).unwrap();
        g.set_outputs(&[s]).unwrap();

        let registry = full_registry();
        let input = Tensor::from_shape(&dims, &ramp(len + seed)[seed..]).unwrap();
        let reference = Plan::new(g.clone(), registry.clone(), only(Backend::CpuReference))
            .unwrap()
            .run(tvec!(input.clone()))
            .unwrap();
        let neon = Plan::new(g, registry, only(Backend::CpuNeon)).unwrap().run(tvec!(input)).unwrap();
        let (reference, neon) =
            (reference[0].as_slice::<f32>().unwrap(), neon[0].as_slice::<f32>().unwrap());
        for (r, n) in reference.iter().zip(neon) {
            assert_abs_diff_eq!(r, n, epsilon = 1e-5);
        }
    }
}
