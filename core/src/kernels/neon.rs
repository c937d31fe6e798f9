//! Kernels running on the kestrel-linalg primitive table, which plugs the
//! arm64 NEON implementations when the CPU has them.
//!
//! The set only registers on NEON capable CPUs, unless forced.
use std::borrow::Cow;

use kestrel_data::internal::*;
use kestrel_linalg::{BinOp, Ops};

use crate::backend::Backend;
use crate::errors::KestrelResult;
use crate::kernel::{host_io, Kernel};
use crate::kernels::check_datum;
use crate::model::TypedFact;
use crate::ops::infer::{mk, output_facts};
use crate::ops::{
    ActivationType, ConvGeometry, ConvParams, EltwiseType, MatMulParams, OpDef, OpKind, OpParams,
};
use crate::registry::{KernelProvider, RegistryBuilder};
use crate::value::Value;

const KINDS: [OpKind; 6] = [
    OpKind::Conv2D,
    OpKind::Eltwise,
    OpKind::AddN,
    OpKind::Activation,
    OpKind::BiasAdd,
    OpKind::MatMul,
];

#[derive(Debug, Clone, Copy, Default)]
pub struct NeonKernels {
    force: bool,
}

impl NeonKernels {
    /// Register even if the CPU lacks NEON: kernels then run the portable
    /// primitives through the same code paths.
    pub fn forced() -> NeonKernels {
        NeonKernels { force: true }
    }
}

impl KernelProvider for NeonKernels {
    fn name(&self) -> &'static str {
        "neon"
    }

    fn register(&self, registry: &mut RegistryBuilder) -> KestrelResult<()> {
        if !self.force && !kestrel_linalg::has_neon() {
            debug!("NEON not available, skipping the neon kernel set");
            return Ok(());
        }
        for kind in KINDS {
            registry.register(kind, Backend::CpuNeon, DatumKind::F32, NeonKernel::instantiate)?;
        }
        Ok(())
    }
}

fn bin_op(e: EltwiseType) -> Option<BinOp> {
    match e {
        EltwiseType::Sum => Some(BinOp::Add),
        EltwiseType::Sub => Some(BinOp::Sub),
        EltwiseType::Prod => Some(BinOp::Mul),
        EltwiseType::Min => Some(BinOp::Min),
        EltwiseType::Max => Some(BinOp::Max),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct NeonKernel {
    def: OpDef,
}

impl NeonKernel {
    pub fn instantiate(def: &OpDef) -> KestrelResult<Box<dyn Kernel>> {
        let supported = match &def.params {
            OpParams::Eltwise(e) => bin_op(*e).is_some(),
            OpParams::Conv2D(_)
            | OpParams::AddN
            | OpParams::Activation(_)
            | OpParams::BiasAdd
            | OpParams::MatMul(_) => true,
            _ => false,
        };
        if !supported {
            unsupported_combination!(def.kind(), Backend::CpuNeon, DatumKind::F32)
        }
        Ok(Box::new(NeonKernel { def: def.clone() }))
    }

    fn eval(&self, ops: &Ops, inputs: &[&Tensor], output: &mut Tensor) -> KestrelResult<()> {
        match &self.def.params {
            OpParams::Activation(a) => activation(ops, *a, inputs[0], output),
            OpParams::Eltwise(e) => {
                let Some(op) = bin_op(*e) else {
                    unsupported_combination!(OpKind::Eltwise, Backend::CpuNeon, DatumKind::F32)
                };
                binary(ops, op, inputs[0], inputs[1], output)
            }
            OpParams::BiasAdd => binary(ops, BinOp::Add, inputs[0], inputs[1], output),
            OpParams::AddN => {
                let add = ops.unicast_f32(BinOp::Add);
                let y = output.as_slice_mut::<f32>()?;
                y.copy_from_slice(inputs[0].as_slice::<f32>()?);
                for input in &inputs[1..] {
                    add.run(y, input.as_slice::<f32>()?)?;
                }
                Ok(())
            }
            OpParams::MatMul(params) => matmul(ops, params, inputs[0], inputs[1], output),
            OpParams::Conv2D(params) => conv2d(ops, params, inputs, output),
            _ => unsupported_combination!(self.def.kind(), Backend::CpuNeon, DatumKind::F32),
        }
    }
}

impl Kernel for NeonKernel {
    fn name(&self) -> Cow<'_, str> {
        format!("neon.{:?}", self.def.kind()).into()
    }

    fn backend(&self) -> Backend {
        Backend::CpuNeon
    }

    fn output_facts(&self, inputs: &[&TypedFact]) -> KestrelResult<TVec<TypedFact>> {
        check_datum(&self.name(), DatumKind::F32, inputs)?;
        output_facts(&self.def, inputs)
    }

    fn execute(&self, inputs: &[Value], outputs: &mut [Value]) -> KestrelResult<()> {
        let (inputs, output) = host_io(inputs, outputs)?;
        self.eval(kestrel_linalg::ops(), &inputs, output)
    }
}

fn activation(ops: &Ops, a: ActivationType, x: &Tensor, output: &mut Tensor) -> KestrelResult<()> {
    let y = output.as_slice_mut::<f32>()?;
    y.copy_from_slice(x.as_slice::<f32>()?);
    match a {
        ActivationType::Relu => (ops.relu_f32)().run_with_params(y, f32::INFINITY),
        ActivationType::ReluX(limit) => (ops.relu_f32)().run_with_params(y, limit),
        ActivationType::Sigmoid => (ops.sigmoid_f32)().run(y),
        ActivationType::Tanh => (ops.tanh_f32)().run(y),
    }
}

/// Broadcast both operands to the output shape, then combine them with a
/// unicast primitive.
fn binary(ops: &Ops, op: BinOp, a: &Tensor, b: &Tensor, output: &mut Tensor) -> KestrelResult<()> {
    let shape = output.shape().to_vec();
    let mut y = output.to_array_view_mut::<f32>()?;
    let Some(a) = a.to_array_view::<f32>()?.broadcast(&*shape).map(|a| a.to_owned()) else {
        bail_shape!("can not broadcast {:?} to {:?}", a.shape(), shape)
    };
    y.assign(&a);
    let b = if b.shape() == &*shape {
        Cow::Borrowed(b.as_slice::<f32>()?)
    } else {
        let Some(b) = b.to_array_view::<f32>()?.broadcast(&*shape).map(|b| b.to_owned()) else {
            bail_shape!("can not broadcast {:?} to {:?}", b.shape(), shape)
        };
        Cow::Owned(b.into_raw_vec_and_offset().0)
    };
    let y = output.as_slice_mut::<f32>()?;
    ops.unicast_f32(op).run(y, &b)
}

/// Row-major copy of the trailing matrices of `t`, transposed if asked.
fn matrices(t: &Tensor, transpose: bool) -> KestrelResult<Cow<'_, [f32]>> {
    let data = t.as_slice::<f32>()?;
    if !transpose {
        return Ok(Cow::Borrowed(data));
    }
    let (r, c) = mk(t.shape(), false);
    let batch: usize = t.shape()[..t.rank() - 2].iter().product();
    let mut out = Vec::with_capacity(data.len());
    for m in (0..batch).map(|i| &data[i * r * c..][..r * c]) {
        for j in 0..c {
            out.extend((0..r).map(|i| m[i * c + j]));
        }
    }
    Ok(Cow::Owned(out))
}

fn matmul(
    ops: &Ops,
    params: &MatMulParams,
    a: &Tensor,
    b: &Tensor,
    output: &mut Tensor,
) -> KestrelResult<()> {
    let (m, k) = mk(a.shape(), params.transpose_a);
    let (_, n) = mk(b.shape(), params.transpose_b);
    let a = matrices(a, params.transpose_a)?;
    let b = matrices(b, params.transpose_b)?;
    let mmm = (ops.mmm_f32)();
    let c = output.as_slice_mut::<f32>()?;
    if k == 0 {
        c.fill(0.0);
        return Ok(());
    }
    if m * n == 0 {
        return Ok(());
    }
    let batch = c.len() / (m * n);
    for i in 0..batch {
        mmm.run(m, k, n, &a[i * m * k..][..m * k], &b[i * k * n..][..k * n], &mut c[i * m * n..][..m * n])?;
    }
    Ok(())
}

/// im2col then a single matrix product against the HWIO filter.
fn conv2d(
    ops: &Ops,
    params: &ConvParams,
    inputs: &[&Tensor],
    output: &mut Tensor,
) -> KestrelResult<()> {
    let (x, filter) = (inputs[0], inputs[1]);
    let geo = ConvGeometry::new(x.shape(), [filter.shape()[0], filter.shape()[1]], params)?;
    let cout = filter.shape()[3];
    let patches = geo.im2col(x.as_slice::<f32>()?, 0.0);
    let y = output.as_slice_mut::<f32>()?;
    (ops.mmm_f32)().run(
        geo.output_pixels(),
        geo.patch_len(),
        cout,
        &patches,
        filter.as_slice::<f32>()?,
        y,
    )?;
    if let Some(bias) = inputs.get(2).filter(|_| cout > 0) {
        let add = ops.unicast_f32(BinOp::Add);
        let bias = bias.as_slice::<f32>()?;
        for pixel in y.chunks_mut(cout) {
            add.run(pixel, bias)?;
        }
    }
    Ok(())
}
