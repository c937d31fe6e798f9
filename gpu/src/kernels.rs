//! Float kernels for the OpenCL backend.
//!
//! Every kernel is a work item function over the output NDRange, launched
//! in work groups on the context queue. Kinds without a device kernel
//! (concatenation, padding, resizing, space/depth shuffles) fall back to a
//! CPU backend, the dispatcher moving values across.
use std::sync::Arc;

use kestrel_core::internal::*;
use kestrel_core::ops::infer::mk;
use rayon::prelude::*;

use crate::bridge::OpenClBridge;
use crate::device::{get_context, OpenClContext};
use crate::tensor::DeviceTensor;

pub const KINDS: [OpKind; 12] = [
    OpKind::Conv2D,
    OpKind::DepthwiseConv2D,
    OpKind::Pooling,
    OpKind::Eltwise,
    OpKind::AddN,
    OpKind::Activation,
    OpKind::BiasAdd,
    OpKind::FoldedBatchNorm,
    OpKind::MatMul,
    OpKind::Softmax,
    OpKind::Reshape,
    OpKind::Identity,
];

/// Registers the OpenCL kernels and bridge of a context, the process wide
/// one unless given.
#[derive(Debug, Clone, Default)]
pub struct OpenClKernels {
    context: Option<Arc<OpenClContext>>,
}

impl OpenClKernels {
    pub fn new(context: Arc<OpenClContext>) -> OpenClKernels {
        OpenClKernels { context: Some(context) }
    }
}

impl KernelProvider for OpenClKernels {
    fn name(&self) -> &'static str {
        "opencl"
    }

    fn register(&self, registry: &mut RegistryBuilder) -> KestrelResult<()> {
        let context = match &self.context {
            Some(context) => context.clone(),
            None => get_context()?,
        };
        registry.register_bridge(Arc::new(OpenClBridge::new(context.clone())))?;
        for kind in KINDS {
            let context = context.clone();
            registry.register(kind, Backend::GpuOpenCl, DatumKind::F32, move |def| {
                OpenClKernel::instantiate(def, &context)
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct OpenClKernel {
    def: OpDef,
    context: Arc<OpenClContext>,
}

impl OpenClKernel {
    pub fn instantiate(
        def: &OpDef,
        context: &Arc<OpenClContext>,
    ) -> KestrelResult<Box<dyn Kernel>> {
        if !KINDS.contains(&def.kind()) || def.output_qparams.is_some() {
            unsupported_combination!(def.kind(), Backend::GpuOpenCl, DatumKind::F32)
        }
        Ok(Box::new(OpenClKernel { def: def.clone(), context: context.clone() }))
    }
}

impl Kernel for OpenClKernel {
    fn name(&self) -> Cow<'_, str> {
        format!("opencl.{:?}", self.def.kind()).into()
    }

    fn backend(&self) -> Backend {
        Backend::GpuOpenCl
    }

    fn output_facts(&self, inputs: &[&TypedFact]) -> KestrelResult<TVec<TypedFact>> {
        for input in inputs.iter().take(1) {
            ensure_type!(
                input.datum_type == DatumType::F32,
                "{} works on F32, got {:?}",
                self.name(),
                input.datum_type
            );
        }
        output_facts(&self.def, inputs)
    }

    fn execute(&self, inputs: &[Value], outputs: &mut [Value]) -> KestrelResult<()> {
        let inputs = inputs
            .iter()
            .map(|v| DeviceTensor::from_value(v).cloned())
            .collect::<KestrelResult<TVec<DeviceTensor>>>()?;
        let [output] = outputs else {
            bail!(KestrelError::InvalidTensorState(format!(
                "expected one output, got {}",
                outputs.len()
            )))
        };
        let output = DeviceTensor::from_value(output)?.clone();
        let def = self.def.clone();
        let work_group = self.context.config().work_group_size.max(1);
        let target = output.clone();
        let event = self
            .context
            .queue()
            .enqueue(self.name(), move || launch(&def, work_group, &inputs, &target))?;
        output.set_ready(event);
        Ok(())
    }
}

/// Run `item` for every output index, one work group at a time.
fn ndrange(y: &mut [f32], work_group: usize, item: impl Fn(usize) -> f32 + Sync) {
    y.par_chunks_mut(work_group).enumerate().for_each(|(group, items)| {
        let base = group * work_group;
        for (local, y) in items.iter_mut().enumerate() {
            *y = item(base + local);
        }
    })
}

/// Offset read in a `shape` tensor by output element `gid`, `shape` being
/// broadcast to `out`.
fn broadcast_offset(gid: usize, out: &[usize], shape: &[usize]) -> usize {
    let mut rem = gid;
    let mut offset = 0;
    let mut stride = 1;
    for axis in (0..out.len()).rev() {
        let coord = rem % out[axis];
        rem /= out[axis];
        let Some(in_axis) = (axis + shape.len()).checked_sub(out.len()) else { continue };
        let dim = shape[in_axis];
        if dim != 1 {
            offset += coord * stride;
        }
        stride *= dim;
    }
    offset
}

fn eltwise_fn(e: EltwiseType) -> fn(f32, f32) -> f32 {
    use EltwiseType::*;
    match e {
        Neg => |x, _| -x,
        Abs => |x, _| x.abs(),
        Sum => |a, b| a + b,
        Sub => |a, b| a - b,
        Prod => |a, b| a * b,
        Div => |a, b| a / b,
        Min => |a, b| a.min(b),
        Max => |a, b| a.max(b),
        SqrDiff => |a, b| (a - b) * (a - b),
        Pow => |a, b| a.powf(b),
    }
}

fn activate(a: ActivationType, x: f32) -> f32 {
    match a {
        ActivationType::Relu => x.max(0.0),
        ActivationType::ReluX(limit) => x.max(0.0).min(limit),
        ActivationType::Tanh => x.tanh(),
        ActivationType::Sigmoid => 1.0 / (1.0 + (-x).exp()),
    }
}

fn launch(
    def: &OpDef,
    work_group: usize,
    inputs: &[DeviceTensor],
    output: &DeviceTensor,
) -> KestrelResult<()> {
    let guards: TVec<_> = inputs.iter().map(|t| t.storage().read_recursive()).collect();
    let data = guards.iter().map(|g| g.as_slice::<f32>()).collect::<KestrelResult<TVec<_>>>()?;
    let shapes: TVec<&[usize]> = inputs.iter().map(|t| t.shape()).collect();
    let out: TVec<usize> = output.shape().into();
    let mut storage = output.storage().write();
    let y = storage.as_slice_mut::<f32>()?;
    match &def.params {
        OpParams::Reshape(_) | OpParams::Identity => {
            let x = data[0];
            ndrange(y, work_group, |gid| x[gid])
        }
        OpParams::Activation(a) => {
            let (a, x) = (*a, data[0]);
            ndrange(y, work_group, |gid| activate(a, x[gid]))
        }
        OpParams::Eltwise(e) if e.is_unary() => {
            let (f, x) = (eltwise_fn(*e), data[0]);
            ndrange(y, work_group, |gid| f(x[gid], 0.0))
        }
        OpParams::Eltwise(e) => {
            let f = eltwise_fn(*e);
            let (a, b) = (data[0], data[1]);
            ndrange(y, work_group, |gid| {
                f(a[broadcast_offset(gid, &out, shapes[0])], b[broadcast_offset(gid, &out, shapes[1])])
            })
        }
        OpParams::BiasAdd => {
            let (x, bias) = (data[0], data[1]);
            ndrange(y, work_group, |gid| {
                x[broadcast_offset(gid, &out, shapes[0])] + bias[broadcast_offset(gid, &out, shapes[1])]
            })
        }
        OpParams::FoldedBatchNorm => {
            let (x, scale, offset) = (data[0], data[1], data[2]);
            ndrange(y, work_group, |gid| {
                x[gid] * scale[broadcast_offset(gid, &out, shapes[1])]
                    + offset[broadcast_offset(gid, &out, shapes[2])]
            })
        }
        OpParams::AddN => ndrange(y, work_group, |gid| data.iter().fold(0.0, |acc, x| acc + x[gid])),
        OpParams::Softmax => {
            let lane = out.last().copied().unwrap_or(1);
            if lane > 0 {
                y.par_chunks_mut(lane).zip(data[0].par_chunks(lane)).for_each(|(y, x)| {
                    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let mut sum = 0.0;
                    for (y, x) in y.iter_mut().zip(x) {
                        *y = (x - max).exp();
                        sum += *y;
                    }
                    y.iter_mut().for_each(|y| *y /= sum);
                })
            }
        }
        OpParams::MatMul(params) => {
            let (m, k) = mk(shapes[0], params.transpose_a);
            let (_, n) = mk(shapes[1], params.transpose_b);
            let (a, b) = (data[0], data[1]);
            let (ta, tb) = (params.transpose_a, params.transpose_b);
            ndrange(y, work_group, |gid| {
                let (batch, i, j) = (gid / (m * n), gid % (m * n) / n, gid % n);
                let (a, b) = (&a[batch * m * k..], &b[batch * k * n..]);
                (0..k).fold(0.0, |acc, p| {
                    let a = if ta { a[p * m + i] } else { a[i * k + p] };
                    let b = if tb { b[j * k + p] } else { b[p * n + j] };
                    acc + a * b
                })
            })
        }
        OpParams::Conv2D(params) => {
            let w_shape = shapes[1];
            let geo = ConvGeometry::new(shapes[0], [w_shape[0], w_shape[1]], params)?;
            let (cin, cout) = (w_shape[2], w_shape[3]);
            let (x, w, bias) = (data[0], data[1], data.get(2).copied());
            ndrange(y, work_group, |gid| {
                let co = gid % cout;
                let (n, oy, ox) = pixel(&geo, gid / cout);
                let mut sum = bias.map(|b| b[co]).unwrap_or(0.0);
                for ky in 0..geo.kernel_h {
                    let Some(iy) = geo.input_y(oy, ky) else { continue };
                    for kx in 0..geo.kernel_w {
                        let Some(ix) = geo.input_x(ox, kx) else { continue };
                        let x = &x[((n * geo.input_h + iy) * geo.input_w + ix) * cin..];
                        let w = &w[(ky * geo.kernel_w + kx) * cin * cout..];
                        for ci in 0..cin {
                            sum += x[ci] * w[ci * cout + co];
                        }
                    }
                }
                sum
            })
        }
        OpParams::DepthwiseConv2D(params) => {
            let w_shape = shapes[1];
            let geo = ConvGeometry::new(shapes[0], [w_shape[0], w_shape[1]], params)?;
            let multiplier = w_shape[3];
            let c = geo.channels;
            let (x, w, bias) = (data[0], data[1], data.get(2).copied());
            ndrange(y, work_group, |gid| {
                let co = gid % (c * multiplier);
                let (ci, m) = (co / multiplier, co % multiplier);
                let (n, oy, ox) = pixel(&geo, gid / (c * multiplier));
                let mut sum = bias.map(|b| b[co]).unwrap_or(0.0);
                for ky in 0..geo.kernel_h {
                    let Some(iy) = geo.input_y(oy, ky) else { continue };
                    for kx in 0..geo.kernel_w {
                        let Some(ix) = geo.input_x(ox, kx) else { continue };
                        sum += x[((n * geo.input_h + iy) * geo.input_w + ix) * c + ci]
                            * w[((ky * geo.kernel_w + kx) * c + ci) * multiplier + m];
                    }
                }
                sum
            })
        }
        OpParams::Pooling(params) => {
            let geo = ConvGeometry::new(shapes[0], params.kernel, &params.as_conv())?;
            let (c, x, pooling) = (geo.channels, data[0], params.pooling);
            ndrange(y, work_group, |gid| {
                let ci = gid % c;
                let (n, oy, ox) = pixel(&geo, gid / c);
                let mut acc = match pooling {
                    PoolingType::Max => f32::NEG_INFINITY,
                    PoolingType::Avg => 0.0,
                };
                let mut count = 0usize;
                for ky in 0..geo.kernel_h {
                    let Some(iy) = geo.input_y(oy, ky) else { continue };
                    for kx in 0..geo.kernel_w {
                        let Some(ix) = geo.input_x(ox, kx) else { continue };
                        let v = x[((n * geo.input_h + iy) * geo.input_w + ix) * c + ci];
                        acc = match pooling {
                            PoolingType::Max => acc.max(v),
                            PoolingType::Avg => acc + v,
                        };
                        count += 1;
                    }
                }
                match pooling {
                    _ if count == 0 => 0.0,
                    PoolingType::Avg => acc / count as f32,
                    PoolingType::Max => acc,
                }
            })
        }
        other => unsupported_combination!(other.kind(), Backend::GpuOpenCl, DatumKind::F32),
    }
    Ok(())
}

/// `(batch, row, column)` of an output pixel index.
fn pixel(geo: &ConvGeometry, pixel: usize) -> (usize, usize, usize) {
    let ox = pixel % geo.output_w;
    let oy = pixel / geo.output_w % geo.output_h;
    (pixel / (geo.output_w * geo.output_h), oy, ox)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::OpenClConfig;
    use kestrel_core::kernels::reference::ReferenceKernels;
    use kestrel_core::ops::samples::sample;

    fn registry(context: &Arc<OpenClContext>) -> KernelRegistry {
        RegistryBuilder::new()
            .with_provider(&ReferenceKernels)
            .unwrap()
            .with_provider(&OpenClKernels::new(context.clone()))
            .unwrap()
            .build()
    }

    fn on_device(
        context: &Arc<OpenClContext>,
        registry: &KernelRegistry,
        def: &OpDef,
        inputs: &[Tensor],
    ) -> Tensor {
        let kernel = registry.instantiate(Backend::GpuOpenCl, DatumKind::F32, def).unwrap();
        let facts: TVec<TypedFact> = inputs.iter().map(TypedFact::from).collect();
        let facts: TVec<&TypedFact> = facts.iter().collect();
        let fact = kernel.output_facts(&facts).unwrap().remove(0);
        let inputs: TVec<Value> = inputs
            .iter()
            .map(|t| Value::Device(Arc::new(context.upload(t).unwrap())))
            .collect();
        let mut outputs =
            [Value::Device(Arc::new(context.allocate(fact.datum_type, &fact.shape).unwrap()))];
        kernel.execute(&inputs, &mut outputs).unwrap();
        outputs[0].to_host().unwrap().as_ref().clone()
    }

    fn on_host(registry: &KernelRegistry, def: &OpDef, inputs: &[Tensor]) -> Tensor {
        let kernel = registry.instantiate(Backend::CpuReference, DatumKind::F32, def).unwrap();
        let facts: TVec<TypedFact> = inputs.iter().map(TypedFact::from).collect();
        let facts: TVec<&TypedFact> = facts.iter().collect();
        let fact = kernel.output_facts(&facts).unwrap().remove(0);
        let inputs: TVec<Value> = inputs.iter().cloned().map(Value::from).collect();
        let mut outputs = [Value::from(Tensor::zero_dt(fact.datum_type, &fact.shape))];
        kernel.execute(&inputs, &mut outputs).unwrap();
        outputs[0].as_host().unwrap().clone()
    }

    #[test]
    fn matches_reference_on_samples() {
        crate::setup_test_logger();
        let context = OpenClContext::new(OpenClConfig { work_group_size: 7, ..Default::default() })
            .unwrap();
        let registry = registry(&context);
        for kind in KINDS {
            let sample = sample(kind, DatumKind::F32).unwrap().unwrap();
            let device = on_device(&context, &registry, &sample.def, &sample.inputs);
            let host = on_host(&registry, &sample.def, &sample.inputs);
            device
                .close_enough(&host, Approximation::Close)
                .unwrap_or_else(|e| panic!("{kind:?}: {e:?}"));
        }
        context.synchronize().unwrap();
        assert_eq!(context.memory_stats().in_use, 0);
    }

    #[test]
    fn every_eltwise_broadcasts() {
        let context = OpenClContext::new(OpenClConfig::default()).unwrap();
        let registry = registry(&context);
        let a = tensor2(&[[1f32, 2., 3.], [-4., 5., 0.5]]);
        let b = tensor1(&[2f32, 0.5, -1.]);
        for e in [
            EltwiseType::Sum,
            EltwiseType::Sub,
            EltwiseType::Prod,
            EltwiseType::Div,
            EltwiseType::Min,
            EltwiseType::Max,
            EltwiseType::SqrDiff,
            EltwiseType::Neg,
            EltwiseType::Abs,
        ] {
            let inputs = if e.is_unary() { vec![a.clone()] } else { vec![a.clone(), b.clone()] };
            let def = OpDef::from(e);
            let device = on_device(&context, &registry, &def, &inputs);
            let host = on_host(&registry, &def, &inputs);
            assert_eq!(device, host, "{e:?}");
        }
    }

    #[test]
    fn broadcast_offsets() {
        let out = [2, 3, 4];
        assert_eq!(broadcast_offset(23, &out, &[4]), 3);
        assert_eq!(broadcast_offset(23, &out, &[3, 1]), 2);
        assert_eq!(broadcast_offset(13, &out, &[2, 1, 4]), 5);
        assert_eq!(broadcast_offset(13, &out, &[]), 0);
    }

    #[test]
    fn declines_quantized_definitions() {
        let context = OpenClContext::new(OpenClConfig::default()).unwrap();
        let registry = registry(&context);
        let def = OpDef::quantized(EltwiseType::Sum, QParams::new(0, 0.5));
        let err = registry.instantiate(Backend::GpuOpenCl, DatumKind::F32, &def).unwrap_err();
        assert!(matches!(KestrelError::of(&err), Some(KestrelError::UnsupportedCombination(_))));
        assert!(!registry.contains(OpKind::Pad, Backend::GpuOpenCl, DatumKind::F32));
        assert!(registry.bridge(Backend::GpuOpenCl).is_ok());
    }
}
