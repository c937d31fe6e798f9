use std::hash::{Hash, Hasher};
use std::ops::Mul;

/// How to round a value that sits exactly between two integers after a
/// fixed-point rescale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RoundingPolicy {
    Zero,
    #[default]
    Away,
    MinusInf,
    PlusInf,
    Even,
    Odd,
}

/// A real multiplier expressed as a Q0.31 fixed-point mantissa and a right
/// shift, so that `x * scale` can be computed with integer arithmetic only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scaler {
    pub scale: f32,
    pub mult: Option<i32>,
    pub shift: isize,
    pub policy: RoundingPolicy,
}

impl Eq for Scaler {}

#[allow(clippy::derived_hash_with_manual_eq)]
impl Hash for Scaler {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        Hash::hash(&self.scale.to_bits(), state);
        self.policy.hash(state);
    }
}

impl Scaler {
    pub fn new(scale: f32, policy: RoundingPolicy) -> Self {
        let (mult, shift) = Self::convert_scale_to_mult_shift(scale);
        Self { scale, mult, shift, policy }
    }

    /// Split a positive scale into a mantissa in [0.5, 1) (as Q0.31) and a
    /// power of two. Exact powers of two need no mantissa.
    fn convert_scale_to_mult_shift(scale: f32) -> (Option<i32>, isize) {
        if scale == 0.0 {
            return (None, 0);
        }

        let scale_bits = scale.to_bits();
        let current_exponent = (scale_bits >> 23) & 0xff;
        let partial_frac = scale_bits & 0x007fffff;

        if partial_frac == 0 {
            let shift = 127 - current_exponent as isize;
            (None, shift)
        } else {
            // hidden bit restored: frac is Q8.23 in [1, 2), halved into Q0.31
            let frac = partial_frac | 0x800000;
            let half_frac = (frac << 7) as i32;
            let shift = 127 - current_exponent as isize - 1;
            (Some(half_frac), shift)
        }
    }
}

impl Mul<f32> for Scaler {
    type Output = f32;

    #[inline]
    fn mul(self, rhs: f32) -> Self::Output {
        self.scale * rhs
    }
}

impl Mul<Scaler> for f32 {
    type Output = f32;

    #[inline]
    fn mul(self, rhs: Scaler) -> Self::Output {
        rhs * self
    }
}

#[inline]
fn round_shift_i64(val: i64, shift: isize, policy: RoundingPolicy) -> i64 {
    use RoundingPolicy::*;
    if shift <= 0 {
        return val << -shift;
    }
    if shift > 62 {
        return 0;
    }
    let half: i64 = 1 << (shift - 1);
    let nudge: i64 = match policy {
        Zero => -1,
        MinusInf => -((val >= 0) as i64),
        PlusInf => -((val <= 0) as i64),
        Away => 0,
        Even => ((val.abs() >> shift) & 0x1) - 1,
        Odd => -((val.abs() >> shift) & 0x1),
    };
    val.signum() * ((val.abs() + half + nudge) >> shift)
}

impl Mul<i32> for Scaler {
    type Output = i32;

    #[inline]
    fn mul(self, rhs: i32) -> Self::Output {
        if self.scale == 0.0 {
            return 0;
        }
        let (val, shift) = if let Some(multiplier) = self.mult {
            (multiplier as i64 * rhs as i64, self.shift + 31)
        } else {
            (rhs as i64, self.shift)
        };
        round_shift_i64(val, shift, self.policy).clamp(i32::MIN as i64, i32::MAX as i64) as i32
    }
}

impl Mul<Scaler> for i32 {
    type Output = i32;

    #[inline]
    fn mul(self, rhs: Scaler) -> Self::Output {
        rhs * self
    }
}

pub trait ScaleShiftAndRound {
    fn q_scale(self, scaler: Scaler) -> Self;
    fn q_shl(self, shift: usize) -> Self;
    fn q_shr(self, shift: usize, rp: RoundingPolicy) -> Self;
}

impl ScaleShiftAndRound for f32 {
    fn q_scale(self, scaler: Scaler) -> Self {
        self * scaler
    }
    fn q_shl(self, shift: usize) -> Self {
        self * 2f32.powi(shift as i32)
    }
    fn q_shr(self, shift: usize, _rp: RoundingPolicy) -> Self {
        self * 2f32.powi(-(shift as i32))
    }
}

impl ScaleShiftAndRound for i32 {
    fn q_scale(self, scaler: Scaler) -> Self {
        self * scaler
    }
    fn q_shr(self, shift: usize, rp: RoundingPolicy) -> Self {
        if shift == 0 {
            return self;
        }
        round_shift_i64(self as i64, shift as isize, rp) as i32
    }
    fn q_shl(self, shift: usize) -> Self {
        self << shift
    }
}
