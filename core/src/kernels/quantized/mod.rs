//! 8-bit affine quantized kernels.
//!
//! Values are stored as `u8` or `i8` with `real = scale * (q - zero_point)`.
//! Products accumulate in `i32` and are rescaled to the output quantization
//! by a fixed-point [`Scaler`] rounding ties away from zero, then clamped
//! to the storage range. Convolution biases are `i32`, in the scale of
//! `input scale * filter scale` with a zero point of 0.
use std::borrow::Cow;

use kestrel_data::internal::*;
use kestrel_linalg::{RoundingPolicy, ScaleShiftAndRound, Scaler};

use crate::backend::Backend;
use crate::errors::KestrelResult;
use crate::kernel::{host_io, Kernel};
use crate::kernels::{array, check_datum};
use crate::model::TypedFact;
use crate::ops::infer::{normalize_axis, output_facts};
use crate::ops::{EltwiseType, OpDef, OpKind, OpParams};
use crate::registry::{KernelProvider, RegistryBuilder};
use crate::value::Value;

mod conv;
mod math;

const KINDS: [OpKind; 13] = [
    OpKind::Conv2D,
    OpKind::DepthwiseConv2D,
    OpKind::Pooling,
    OpKind::Eltwise,
    OpKind::AddN,
    OpKind::Activation,
    OpKind::MatMul,
    OpKind::Reshape,
    OpKind::Identity,
    OpKind::Concat,
    OpKind::Pad,
    OpKind::SpaceToDepth,
    OpKind::DepthToSpace,
];

#[derive(Debug, Clone, Copy, Default)]
pub struct QuantizedKernels;

impl KernelProvider for QuantizedKernels {
    fn name(&self) -> &'static str {
        "quantized"
    }

    fn register(&self, registry: &mut RegistryBuilder) -> KestrelResult<()> {
        for datum in [DatumKind::QU8, DatumKind::QI8] {
            for kind in KINDS {
                registry.register(kind, Backend::CpuQuantized, datum, move |def: &OpDef| {
                    QuantizedKernel::instantiate(def, datum)
                })?;
            }
        }
        Ok(())
    }
}

/// Fractional bits kept while values from several quantizations are summed.
const SHIFT: usize = 16;

pub(crate) fn scaler(scale: f32) -> Scaler {
    Scaler::new(scale, RoundingPolicy::Away)
}

pub(crate) fn qparams(dt: DatumType) -> KestrelResult<QParams> {
    let Some(qp) = dt.qparams() else { bail_type!("{:?} is not quantized", dt) };
    Ok(qp)
}

#[inline]
pub(crate) fn centered<T: QuantizedDatum>(q: T, zero_point: i32) -> i32 {
    q.into().saturating_sub(zero_point)
}

/// Rescale an accumulator to the output quantization and store it.
#[inline]
pub(crate) fn store<T: QuantizedDatum>(acc: i32, scaler: Scaler, zero_point: i32) -> T {
    T::saturate((acc * scaler).saturating_add(zero_point))
}

/// A centered value brought to another scale, with `SHIFT` fractional bits.
#[inline]
pub(crate) fn lift(centered: i32, scaler: Scaler) -> i32 {
    centered.saturating_mul(1 << SHIFT) * scaler
}

/// Drop the fractional bits of a lifted accumulator and store it.
#[inline]
pub(crate) fn settle<T: QuantizedDatum>(acc: i32, zero_point: i32) -> T {
    T::saturate(acc.q_shr(SHIFT, RoundingPolicy::Away).saturating_add(zero_point))
}

/// `x` with the quantization of `dt`, borrowed if it already has it.
pub(crate) fn requantized(x: &Tensor, dt: DatumType) -> KestrelResult<Cow<'_, Tensor>> {
    if x.datum_type() == dt {
        return Ok(Cow::Borrowed(x));
    }
    ensure_type!(
        x.datum_type().unquantized() == dt.unquantized(),
        "can not requantize {:?} to {:?}",
        x.datum_type(),
        dt
    );
    dispatch_quantized!(requantize_t(dt)(x, dt)).map(Cow::Owned)
}

fn requantize_t<T: QuantizedDatum>(x: &Tensor, dt: DatumType) -> KestrelResult<Tensor> {
    let (from, to) = (qparams(x.datum_type())?, qparams(dt)?);
    let s = scaler(from.scale / to.scale);
    let data: Vec<T> = x
        .as_slice::<T>()?
        .iter()
        .map(|&q| store::<T>(centered(q, from.zero_point), s, to.zero_point))
        .collect();
    Tensor::from_shape(x.shape(), &data)?.into_quantized(to)
}

#[derive(Debug, Clone)]
pub struct QuantizedKernel {
    def: OpDef,
    datum: DatumKind,
}

impl QuantizedKernel {
    pub fn instantiate(def: &OpDef, datum: DatumKind) -> KestrelResult<Box<dyn Kernel>> {
        if matches!(
            def.params,
            OpParams::Eltwise(EltwiseType::Div | EltwiseType::SqrDiff | EltwiseType::Pow)
        ) {
            unsupported_combination!(def.kind(), Backend::CpuQuantized, datum)
        }
        Ok(Box::new(QuantizedKernel { def: def.clone(), datum }))
    }

    fn eval(&self, inputs: &[&Tensor], output: &mut Tensor) -> KestrelResult<()> {
        let x = inputs[0];
        let dt = output.datum_type();
        match &self.def.params {
            OpParams::Conv2D(p) => dispatch_quantized!(conv::conv2d(dt)(inputs, p, output)),
            OpParams::DepthwiseConv2D(p) => {
                dispatch_quantized!(conv::depthwise_conv2d(dt)(inputs, p, output))
            }
            OpParams::MatMul(p) => dispatch_quantized!(conv::matmul(dt)(x, inputs[1], p, output)),
            OpParams::Pooling(p) => dispatch_quantized!(math::pool(dt)(x, p, output)),
            OpParams::Eltwise(e) => dispatch_quantized!(math::eltwise(dt)(*e, inputs, output)),
            OpParams::AddN => dispatch_quantized!(math::add_n(dt)(inputs, output)),
            OpParams::Activation(a) => dispatch_quantized!(math::activation(dt)(*a, x, output)),
            OpParams::Reshape(_) | OpParams::Identity => array::copy(&*requantized(x, dt)?, output),
            OpParams::Concat(concat) => {
                let parts =
                    inputs.iter().map(|i| requantized(i, dt)).collect::<KestrelResult<TVec<_>>>()?;
                let parts: TVec<&Tensor> = parts.iter().map(|p| p.as_ref()).collect();
                array::concat(&parts, normalize_axis(concat.axis, x.rank())?, output)
            }
            OpParams::Pad(pad) => {
                array::pad(&*requantized(x, dt)?, &pad.pads, &array::pad_value(pad.value, dt)?, output)
            }
            OpParams::SpaceToDepth(block) => {
                array::space_to_depth(&*requantized(x, dt)?, *block, output)
            }
            OpParams::DepthToSpace(block) => {
                array::depth_to_space(&*requantized(x, dt)?, *block, output)
            }
            _ => unsupported_combination!(self.def.kind(), Backend::CpuQuantized, self.datum),
        }
    }
}

impl Kernel for QuantizedKernel {
    fn name(&self) -> Cow<'_, str> {
        format!("quantized.{:?}.{}", self.def.kind(), self.datum).into()
    }

    fn backend(&self) -> Backend {
        Backend::CpuQuantized
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

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::KestrelError;
    use crate::kernels::reference::ReferenceKernels;
    use crate::ops::samples::sample;
    use crate::ops::ReshapeParams;
    use crate::registry::KernelRegistry;

    pub(crate) fn registry() -> KernelRegistry {
        RegistryBuilder::new()
            .with_provider(&ReferenceKernels)
            .unwrap()
            .with_provider(&QuantizedKernels)
            .unwrap()
            .build()
    }

    pub(crate) fn eval(
        registry: &KernelRegistry,
        backend: Backend,
        def: &OpDef,
        inputs: &[Tensor],
    ) -> KestrelResult<Tensor> {
        let datum = inputs[0].datum_type().kind();
        let kernel = registry.instantiate(backend, datum, def)?;
        let facts: TVec<TypedFact> = inputs.iter().map(TypedFact::from).collect();
        let facts: TVec<&TypedFact> = facts.iter().collect();
        let fact = kernel.output_facts(&facts)?.remove(0);
        let inputs: TVec<Value> = inputs.iter().cloned().map(Value::from).collect();
        let mut outputs = [Value::from(Tensor::zero_dt(fact.datum_type, &fact.shape))];
        kernel.execute(&inputs, &mut outputs)?;
        outputs[0].to_host().map(|t| (*t).clone())
    }

    pub(crate) fn qu8(data: &[f32], shape: &[usize], qp: QParams) -> Tensor {
        Tensor::from_shape(shape, data).unwrap().cast_to_dt(DatumType::QU8(qp)).unwrap().into_owned()
    }

    /// Float evaluation of the same operator on dequantized inputs, i32
    /// biases being brought back to their `input * filter` scale.
    pub(crate) fn float_eval(registry: &KernelRegistry, def: &OpDef, inputs: &[Tensor]) -> Tensor {
        let x_scale = inputs[0].datum_type().qparams().map(|qp| qp.scale).unwrap_or(1.0);
        let inputs: Vec<Tensor> = inputs
            .iter()
            .map(|t| {
                if t.datum_type() == DatumType::I32 {
                    let w_scale = inputs[1].datum_type().qparams().unwrap().scale;
                    let data: Vec<f32> = t
                        .as_slice::<i32>()
                        .unwrap()
                        .iter()
                        .map(|&b| b as f32 * x_scale * w_scale)
                        .collect();
                    Tensor::from_shape(t.shape(), &data).unwrap()
                } else {
                    t.cast_to::<f32>().unwrap().into_owned()
                }
            })
            .collect();
        let float_def = OpDef::new(def.params.clone());
        eval(registry, Backend::CpuReference, &float_def, &inputs).unwrap()
    }

    #[test]
    fn every_kind_close_to_float_on_samples() {
        crate::setup_test_logger();
        let registry = registry();
        for datum in [DatumKind::QU8, DatumKind::QI8] {
            for kind in KINDS {
                let sample = sample(kind, datum).unwrap().unwrap();
                let quantized =
                    eval(&registry, Backend::CpuQuantized, &sample.def, &sample.inputs).unwrap();
                let out_qp = quantized.datum_type().qparams().unwrap();
                let quantized = quantized.cast_to::<f32>().unwrap();
                let float = float_eval(&registry, &sample.def, &sample.inputs);
                // inputs are exact in their quantization, the result rounds once
                for (q, f) in
                    quantized.as_slice::<f32>().unwrap().iter().zip(float.as_slice::<f32>().unwrap())
                {
                    assert!(
                        (q - f).abs() <= out_qp.scale * 0.5 + 1e-5 || f.abs() > out_qp.scale * 120.0,
                        "{kind:?} {datum}: {q} vs {f}"
                    );
                }
            }
        }
    }

    #[test]
    fn declines_division() {
        let err = registry()
            .instantiate(Backend::CpuQuantized, DatumKind::QU8, &EltwiseType::Div.into())
            .unwrap_err();
        assert!(matches!(KestrelError::of(&err), Some(KestrelError::UnsupportedCombination(_))));
    }

    #[test]
    fn reshape_requantizes() {
        let x = qu8(&[-1.0, 0.5, 2.0, 3.0], &[2, 2], QParams::new(128, 0.5));
        let def = OpDef::quantized(ReshapeParams::new(tvec!(-1)), QParams::new(0, 0.25));
        let y = eval(&registry(), Backend::CpuQuantized, &def, &[x]).unwrap();
        assert_eq!(y.datum_type(), DatumType::QU8(QParams::new(0, 0.25)));
        assert_eq!(y.as_slice::<u8>().unwrap(), &[0, 2, 8, 12]);
    }

    #[test]
    fn settle_rounds_away_and_saturates() {
        assert_eq!(settle::<u8>(3 << (SHIFT - 1), 10), 12);
        assert_eq!(settle::<i8>(-(3 << (SHIFT - 1)), 0), -2);
        assert_eq!(settle::<u8>(300 << SHIFT, 0), 255);
        assert_eq!(settle::<i8>(-300 << SHIFT, 0), -128);
    }

    #[test]
    fn far_zero_points_saturate() {
        let unit = scaler(1.0);
        assert_eq!(lift(centered(255u8, -1_000_000), unit), i32::MAX);
        assert_eq!(lift(centered(0u8, 1_000_000), unit), i32::MIN);
        assert_eq!(centered(-128i8, i32::MAX), i32::MIN);
        assert_eq!(settle::<u8>(lift(centered(255u8, -1_000_000), unit), 0), 255);
        assert_eq!(lift(centered(3u8, 1), unit), 2 << SHIFT);
    }
}
