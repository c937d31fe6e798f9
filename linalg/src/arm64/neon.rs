#![allow(clippy::excessive_precision)]
use std::arch::aarch64::*;

use crate::frame::mmm::MatMatMulKer;

ew_impl_wrap!(
    f32,
    NeonRelu4,
    4,
    4,
    f32,
    fn run(xs: &mut [f32], limit: f32) {
        debug_assert!(xs.len() % Self::nr() == 0);
        unsafe {
            let zero = vdupq_n_f32(0.0);
            let limit = vdupq_n_f32(limit);
            for chunk in xs.chunks_exact_mut(4) {
                let x = vld1q_f32(chunk.as_ptr());
                vst1q_f32(chunk.as_mut_ptr(), vminq_f32(vmaxq_f32(x, zero), limit));
            }
        }
    }
);

/// Evaluate `p(x) / q(x)` for the odd/even rational approximations shared
/// by sigmoid and tanh, four lanes at a time.
#[inline(always)]
unsafe fn rational(x: float32x4_t, alpha: &[f32; 7], beta: &[f32; 4]) -> float32x4_t {
    unsafe {
        let x2 = vmulq_f32(x, x);
        let mut p = vdupq_n_f32(alpha[0]);
        for a in &alpha[1..] {
            p = vfmaq_f32(vdupq_n_f32(*a), x2, p);
        }
        let p = vmulq_f32(p, x);
        let mut q = vdupq_n_f32(beta[0]);
        for b in &beta[1..] {
            q = vfmaq_f32(vdupq_n_f32(*b), x2, q);
        }
        vdivq_f32(p, q)
    }
}

const SIGMOID_ALPHA: [f32; 7] = [
    -4.433153405e-18,
    1.169974371e-14,
    -1.875289645e-11,
    4.257889523e-8,
    0.00004811817576,
    0.008163842030,
    0.2499999971,
];
const SIGMOID_BETA: [f32; 4] = [3.922935744e-6, 0.001524872358, 0.1159886749, 1.0];

const TANH_ALPHA: [f32; 7] = [
    -8.488492677e-14,
    5.277853000e-11,
    -2.022500419e-8,
    0.00001115424833,
    0.003103950131,
    0.1308400453,
    0.9999999934,
];
const TANH_BETA: [f32; 4] = [0.0002546136580, 0.02449515379, 0.4641733162, 1.0];

ew_impl_wrap!(
    f32,
    NeonSigmoid4,
    4,
    4,
    (),
    fn run(xs: &mut [f32], _: ()) {
        debug_assert!(xs.len() % Self::nr() == 0);
        unsafe {
            let low = vdupq_n_f32(-18.6);
            let high = vdupq_n_f32(18.6);
            let half = vdupq_n_f32(0.5);
            for chunk in xs.chunks_exact_mut(4) {
                let x = vminq_f32(vmaxq_f32(vld1q_f32(chunk.as_ptr()), low), high);
                let y = vaddq_f32(rational(x, &SIGMOID_ALPHA, &SIGMOID_BETA), half);
                vst1q_f32(chunk.as_mut_ptr(), y);
            }
        }
    }
);

ew_impl_wrap!(
    f32,
    NeonTanh4,
    4,
    4,
    (),
    fn run(xs: &mut [f32], _: ()) {
        debug_assert!(xs.len() % Self::nr() == 0);
        unsafe {
            let low = vdupq_n_f32(-8.9);
            let high = vdupq_n_f32(8.9);
            for chunk in xs.chunks_exact_mut(4) {
                let x = vminq_f32(vmaxq_f32(vld1q_f32(chunk.as_ptr()), low), high);
                vst1q_f32(chunk.as_mut_ptr(), rational(x, &TANH_ALPHA, &TANH_BETA));
            }
        }
    }
);

macro_rules! neon_unicast {
    ($func: ident, $intr: ident) => {
        unicast_impl_wrap!(
            f32,
            $func,
            4,
            4,
            fn run(a: &mut [f32], b: &[f32]) {
                debug_assert!(a.len() == b.len());
                debug_assert!(a.len() % Self::nr() == 0);
                unsafe {
                    for (a, b) in a.chunks_exact_mut(4).zip(b.chunks_exact(4)) {
                        let x = vld1q_f32(a.as_ptr());
                        let y = vld1q_f32(b.as_ptr());
                        vst1q_f32(a.as_mut_ptr(), $intr(x, y));
                    }
                }
            }
        );
    };
}

neon_unicast!(NeonUnicastAdd4, vaddq_f32);
neon_unicast!(NeonUnicastSub4, vsubq_f32);
neon_unicast!(NeonUnicastMul4, vmulq_f32);
neon_unicast!(NeonUnicastMin4, vminq_f32);
neon_unicast!(NeonUnicastMax4, vmaxq_f32);

/// f32 row kernel: broadcast each `a[p]` and fuse-multiply-add it against
/// four columns of `B` at a time, scalar tail for the last columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeonMmmRowF32;

impl MatMatMulKer<f32> for NeonMmmRowF32 {
    fn name() -> &'static str {
        "neon"
    }

    fn run_row(a_row: &[f32], b: &[f32], n: usize, c_row: &mut [f32]) {
        let k = a_row.len();
        debug_assert!(b.len() >= k * n);
        let mut j = 0;
        while j + 4 <= n {
            unsafe {
                let mut acc = vdupq_n_f32(0.0);
                for (p, a) in a_row.iter().enumerate() {
                    let b_vec = vld1q_f32(b.as_ptr().add(p * n + j));
                    acc = vfmaq_f32(acc, vdupq_n_f32(*a), b_vec);
                }
                vst1q_f32(c_row.as_mut_ptr().add(j), acc);
            }
            j += 4;
        }
        while j < n {
            let mut acc = 0.0f32;
            for (p, a) in a_row.iter().enumerate() {
                acc += a * b[p * n + j];
            }
            c_row[j] = acc;
            j += 1;
        }
    }
}
