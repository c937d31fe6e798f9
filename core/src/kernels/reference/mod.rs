//! Portable kernels, the fallback of last resort and the yardstick other
//! sets are tested against.
use std::borrow::Cow;

use kestrel_data::internal::*;

use crate::backend::Backend;
use crate::errors::KestrelResult;
use crate::kernel::{host_io, Kernel};
use crate::kernels::{array, check_datum};
use crate::model::TypedFact;
use crate::ops::infer::{normalize_axis, output_facts};
use crate::ops::{EltwiseType, OpDef, OpKind, OpParams};
use crate::registry::{KernelProvider, RegistryBuilder};
use crate::value::Value;

mod cnn;
mod math;

pub use cnn::{conv2d, depthwise_conv2d, pool, resize_bilinear};
pub use math::{activation, add_n, batch_norm, bias_add, eltwise, matmul, softmax};
pub(crate) use math::binary_t;

/// Kinds that make sense on integers, with wrapping arithmetic.
const I32_KINDS: [OpKind; 10] = [
    OpKind::Eltwise,
    OpKind::AddN,
    OpKind::BiasAdd,
    OpKind::MatMul,
    OpKind::Reshape,
    OpKind::Identity,
    OpKind::Concat,
    OpKind::Pad,
    OpKind::SpaceToDepth,
    OpKind::DepthToSpace,
];

#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceKernels;

impl KernelProvider for ReferenceKernels {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn register(&self, registry: &mut RegistryBuilder) -> KestrelResult<()> {
        for kind in OpKind::ALL {
            registry.register(kind, Backend::CpuReference, DatumKind::F32, |def: &OpDef| {
                ReferenceKernel::instantiate(def, DatumKind::F32)
            })?;
        }
        for kind in I32_KINDS {
            registry.register(kind, Backend::CpuReference, DatumKind::I32, |def: &OpDef| {
                ReferenceKernel::instantiate(def, DatumKind::I32)
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceKernel {
    def: OpDef,
    datum: DatumKind,
}

impl ReferenceKernel {
    pub fn instantiate(def: &OpDef, datum: DatumKind) -> KestrelResult<Box<dyn Kernel>> {
        if datum == DatumKind::I32
            && matches!(def.params, OpParams::Eltwise(EltwiseType::Div | EltwiseType::Pow))
        {
            unsupported_combination!(def.kind(), Backend::CpuReference, datum)
        }
        Ok(Box::new(ReferenceKernel { def: def.clone(), datum }))
    }

    fn eval(&self, inputs: &[&Tensor], output: &mut Tensor) -> KestrelResult<()> {
        let x = inputs[0];
        match &self.def.params {
            OpParams::Conv2D(conv) => conv2d(inputs, conv, output),
            OpParams::DepthwiseConv2D(conv) => depthwise_conv2d(inputs, conv, output),
            OpParams::Pooling(params) => pool(x, params, output),
            OpParams::Eltwise(e) => eltwise(*e, inputs, output),
            OpParams::AddN => add_n(inputs, output),
            OpParams::Activation(a) => activation(*a, x, output),
            OpParams::BiasAdd => bias_add(x, inputs[1], output),
            OpParams::FoldedBatchNorm => batch_norm(x, inputs[1], inputs[2], output),
            OpParams::MatMul(params) => matmul(x, inputs[1], params, output),
            OpParams::Softmax => softmax(x, output),
            OpParams::Reshape(_) | OpParams::Identity => array::copy(x, output),
            OpParams::Concat(concat) => {
                array::concat(inputs, normalize_axis(concat.axis, x.rank())?, output)
            }
            OpParams::Pad(pad) => {
                let value = array::pad_value(pad.value, x.datum_type())?;
                array::pad(x, &pad.pads, &value, output)
            }
            OpParams::ResizeBilinear(resize) => resize_bilinear(x, resize, output),
            OpParams::SpaceToDepth(block) => array::space_to_depth(x, *block, output),
            OpParams::DepthToSpace(block) => array::depth_to_space(x, *block, output),
        }
    }
}

impl Kernel for ReferenceKernel {
    fn name(&self) -> Cow<'_, str> {
        format!("reference.{:?}.{}", self.def.kind(), self.datum).into()
    }

    fn backend(&self) -> Backend {
        Backend::CpuReference
    }

    fn output_facts(&self, inputs: &[&TypedFact]) -> KestrelResult<TVec<TypedFact>> {
        check_datum(&self.name(), self.datum, inputs)?;
        output_facts(&self.def, inputs)
    }

    fn execute(&self, inputs: &[Value], outputs: &mut [Value]) -> KestrelResult<()> {
        let (inputs, output) = host_io(inputs, outputs)?;
        self.eval(&inputs, output)
    }
}
