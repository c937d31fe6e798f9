#![allow(clippy::missing_safety_doc)]
#[macro_use]
extern crate derive_new;
#[macro_use]
extern crate pastey;

#[macro_use]
pub mod frame;
pub mod generic;
pub mod multithread;

#[cfg(all(target_arch = "aarch64", feature = "neon"))]
pub mod arm64;

pub use self::frame::{element_wise, mmm, unicast};
pub use generic::{RoundingPolicy, ScaleShiftAndRound, Scaler};
pub use multithread::Executor;

use element_wise::ElementWise;
use mmm::MatMatMul;
use unicast::Unicast;

use kestrel_data::prelude::*;

/// Datum types the linear algebra primitives operate on.
pub trait LADatum:
    Datum + Copy + num_traits::Zero + num_traits::One + std::ops::AddAssign + std::ops::Mul<Output = Self>
{
}

impl LADatum for f32 {}
impl LADatum for i32 {}

type EwFactory<T, P = ()> = Box<dyn Fn() -> Box<dyn ElementWise<T, P>> + Send + Sync>;
type UnicastFactory<T> = Box<dyn Fn() -> Box<dyn Unicast<T>> + Send + Sync>;
type MMMFactory<T> = Box<dyn Fn() -> Box<dyn MatMatMul<T>> + Send + Sync>;

/// Table of primitive implementations. `generic()` fills it with portable
/// code, `best()` plugs in whatever the target CPU does better.
pub struct Ops {
    /// Clamp to `[0, limit]`. Plain relu is `limit = f32::INFINITY`.
    pub relu_f32: EwFactory<f32, f32>,
    pub sigmoid_f32: EwFactory<f32>,
    pub tanh_f32: EwFactory<f32>,

    pub add_f32: UnicastFactory<f32>,
    pub sub_f32: UnicastFactory<f32>,
    pub mul_f32: UnicastFactory<f32>,
    pub min_f32: UnicastFactory<f32>,
    pub max_f32: UnicastFactory<f32>,

    pub mmm_f32: MMMFactory<f32>,
    pub mmm_i32: MMMFactory<i32>,
}

impl Ops {
    /// Look up the unicast implementation for a binary operation on f32.
    pub fn unicast_f32(&self, op: BinOp) -> Box<dyn Unicast<f32>> {
        match op {
            BinOp::Add => (self.add_f32)(),
            BinOp::Sub => (self.sub_f32)(),
            BinOp::Mul => (self.mul_f32)(),
            BinOp::Min => (self.min_f32)(),
            BinOp::Max => (self.max_f32)(),
        }
    }
}

/// Binary operations covered by the unicast frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Min,
    Max,
}

pub fn generic() -> Ops {
    use crate::frame::{ElementWiseKer, MatMatMulKer, UnicastKer};
    use generic::*;
    Ops {
        relu_f32: Box::new(|| SRelu4::ew()),
        sigmoid_f32: Box::new(|| SSigmoid4::ew()),
        tanh_f32: Box::new(|| STanh4::ew()),
        add_f32: Box::new(|| SUnicastAdd4::bin()),
        sub_f32: Box::new(|| SUnicastSub4::bin()),
        mul_f32: Box::new(|| SUnicastMul4::bin()),
        min_f32: Box::new(|| SUnicastMin4::bin()),
        max_f32: Box::new(|| SUnicastMax4::bin()),
        mmm_f32: Box::new(|| GenericMmmRow::<f32>::mmm()),
        mmm_i32: Box::new(|| GenericMmmRow::<i32>::mmm()),
    }
}

#[allow(unreachable_code, unused_mut)]
pub fn best() -> Ops {
    let mut ops = generic();
    #[cfg(all(target_arch = "aarch64", feature = "neon"))]
    arm64::plug(&mut ops);
    ops
}

/// True when NEON primitives are compiled in and the running CPU has them.
#[cfg(all(target_arch = "aarch64", feature = "neon"))]
pub fn has_neon() -> bool {
    arm64::has_neon()
}

/// True when NEON primitives are compiled in and the running CPU has them.
#[cfg(not(all(target_arch = "aarch64", feature = "neon")))]
pub fn has_neon() -> bool {
    false
}

lazy_static::lazy_static! {
    static ref OPS: Ops = {
        best()
    };
    static ref GENERIC_OPS: Ops = {
        generic()
    };
}

pub fn ops() -> &'static Ops {
    &OPS
}

/// The portable implementations, regardless of what the CPU supports.
pub fn generic_ops() -> &'static Ops {
    &GENERIC_OPS
}

#[cfg(test)]
pub(crate) fn setup_test_logger() {
    let _ = env_logger::Builder::from_env("KESTREL_LOG").is_test(true).try_init();
}
