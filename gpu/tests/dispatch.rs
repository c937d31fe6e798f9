use approx::assert_abs_diff_eq;
use kestrel_core::internal::*;
use kestrel_gpu::{OpenClConfig, OpenClContext, OpenClKernels};

fn registry(context: &Arc<OpenClContext>) -> Arc<KernelRegistry> {
    Arc::new(
        RegistryBuilder::new()
            .with_default_providers()
            .unwrap()
            .with_provider(&OpenClKernels::new(context.clone()))
            .unwrap()
            .build(),
    )
}

fn ramp(shape: &[usize], scale: f32) -> Tensor {
    let len: usize = shape.iter().product();
    let data: Vec<f32> = (0..len).map(|i| ((i * 5) % 11) as f32 * scale - 1.0).collect();
    Tensor::from_shape(shape, &data).unwrap()
}

/// conv -> pad -> relu -> softmax, pad having no device kernel.
fn graph() -> Graph {
    let mut g = Graph::default();
    let x = g.add_source("x", TypedFact::dt_shape::<f32>(&[1, 4, 4, 2])).unwrap();
    let w = g.add_const("w", ramp(&[3, 3, 2, 3], 0.1)).unwrap();
    let conv = g
        .add_node("conv", OpParams::Conv2D(ConvParams::new([1, 1], [1, 1], PaddingMode::Same)), &[x, w])
        .unwrap();
    let pad = g
        .add_node("pad", PadParams::new(tvec!((0, 0), (1, 0), (0, 1), (0, 0)), -0.5), &[conv])
        .unwrap();
    let relu = g.add_node("relu", ActivationType::Relu, &[pad]).unwrap();
    let softmax = g.add_node("softmax", OpParams::Softmax, &[relu]).unwrap();
    g.set_outputs(&[softmax]).unwrap();
    g
}

#[test]
fn falls_back_around_missing_device_kernels() {
    let context = OpenClContext::new(OpenClConfig::default()).unwrap();
    let registry = registry(&context);
    let preference = BackendPreference::new([Backend::GpuOpenCl, Backend::CpuReference]);
    let plan =
        Plan::new(graph(), registry.clone(), RuntimeConfig::default().with_preference(preference))
            .unwrap();
    assert_eq!(plan.backend_of("conv").unwrap(), Backend::GpuOpenCl);
    assert_eq!(plan.backend_of("pad").unwrap(), Backend::CpuReference);
    assert_eq!(plan.backend_of("softmax").unwrap(), Backend::GpuOpenCl);

    let cpu = Plan::new(
        graph(),
        registry,
        RuntimeConfig::default().with_preference(BackendPreference::only(Backend::CpuReference)),
    )
    .unwrap();

    let x = ramp(&[1, 4, 4, 2], 0.2);
    let mut session = plan.session().unwrap();
    let found = session.run(tvec!(x.clone())).unwrap();
    let expected = cpu.run(tvec!(x)).unwrap();
    assert_eq!(found[0].shape(), &[1, 5, 5, 3]);
    let (found, expected) =
        (found[0].as_slice::<f32>().unwrap(), expected[0].as_slice::<f32>().unwrap());
    for (f, e) in found.iter().zip(expected) {
        assert_abs_diff_eq!(f, e, epsilon = 1e-5);
    }

    let stats = session.last_run_stats();
    // x and w up, conv down for pad, pad up for relu, softmax down
    assert_eq!((stats.uploads, stats.downloads), (3, 2));
    assert_eq!(stats.executed, 4);
}

#[test]
fn device_only_preference_without_kernel() {
    let context = OpenClContext::new(OpenClConfig::default()).unwrap();
    let config =
        RuntimeConfig::default().with_preference(BackendPreference::only(Backend::GpuOpenCl));
    let err = Plan::new(graph(), registry(&context), config).unwrap_err();
    assert!(matches!(
        KestrelError::of(&err),
        Some(KestrelError::NoAvailableKernel { kind: OpKind::Pad, .. })
    ));
}

#[test]
fn device_memory_is_recycled_between_runs() {
    let context = OpenClContext::new(OpenClConfig::default()).unwrap();
    let mut g = Graph::default();
    let x = g.add_source("x", TypedFact::dt_shape::<f32>(&[2, 8])).unwrap();
    let y = g.add_source("y", TypedFact::dt_shape::<f32>(&[8, 4])).unwrap();
    let mm = g.add_node("mm", MatMulParams::default(), &[x, y]).unwrap();
    let tanh = g.add_node("tanh", ActivationType::Tanh, &[mm]).unwrap();
    let sum = g.add_node("sum", EltwiseType::Sum, &[tanh, mm]).unwrap();
    g.set_outputs(&[sum]).unwrap();
    let config =
        RuntimeConfig::default().with_preference(BackendPreference::only(Backend::GpuOpenCl));
    let plan = Plan::new(g, registry(&context), config).unwrap();
    let mut session = plan.session().unwrap();
    let (a, b) = (ramp(&[2, 8], 0.1), ramp(&[8, 4], 0.3));
    let first = session.run(tvec!(a.clone(), b.clone())).unwrap();
    context.synchronize().unwrap();
    let after_first = context.memory_stats();
    assert_eq!(after_first.in_use, 0);
    let second = session.run(tvec!(a, b)).unwrap();
    context.synchronize().unwrap();
    assert_eq!(first, second);
    let stats = context.memory_stats();
    assert_eq!(stats.in_use, 0);
    assert!(stats.reused >= after_first.allocations);
    assert!(stats.peak <= 64 + 128 + 3 * 32);
}

#[test]
fn device_budget_surfaces_allocation_failure() {
    let context =
        OpenClContext::new(OpenClConfig { memory_budget: Some(64), ..OpenClConfig::default() })
            .unwrap();
    let mut g = Graph::default();
    let x = g.add_source("x", TypedFact::dt_shape::<f32>(&[32])).unwrap();
    let relu = g.add_node("relu", ActivationType::Relu, &[x]).unwrap();
    g.set_outputs(&[relu]).unwrap();
    let config =
        RuntimeConfig::default().with_preference(BackendPreference::only(Backend::GpuOpenCl));
    let plan = Plan::new(g, registry(&context), config).unwrap();
    let err = plan.run(tvec!(ramp(&[32], 0.1))).unwrap_err();
    assert!(matches!(KestrelError::of(&err), Some(KestrelError::AllocationFailure(_))));
}
