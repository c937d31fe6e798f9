mod neon;

pub use neon::*;

use crate::frame::element_wise::ElementWiseKer;
use crate::frame::mmm::MatMatMulKer;
use crate::frame::unicast::UnicastKer;
use crate::Ops;

pub fn has_neon() -> bool {
    std::arch::is_aarch64_feature_detected!("neon")
}

pub fn plug(ops: &mut Ops) {
    if !has_neon() {
        log::info!("arm64: no neon, keeping generic primitives");
        return;
    }
    log::info!("arm64 neon activated for activations, unicast and f32 matmul");
    ops.relu_f32 = Box::new(|| NeonRelu4::ew());
    ops.sigmoid_f32 = Box::new(|| NeonSigmoid4::ew());
    ops.tanh_f32 = Box::new(|| NeonTanh4::ew());
    ops.add_f32 = Box::new(|| NeonUnicastAdd4::bin());
    ops.sub_f32 = Box::new(|| NeonUnicastSub4::bin());
    ops.mul_f32 = Box::new(|| NeonUnicastMul4::bin());
    ops.min_f32 = Box::new(|| NeonUnicastMin4::bin());
    ops.max_f32 = Box::new(|| NeonUnicastMax4::bin());
    ops.mmm_f32 = Box::new(|| NeonMmmRowF32::mmm());
}

#[cfg(test)]
mod test {
    use super::*;

    crate::element_wise_frame_tests!(has_neon(), NeonRelu4, NeonSigmoid4, NeonTanh4);
    crate::unicast_frame_tests!(
        has_neon(),
        NeonUnicastAdd4,
        NeonUnicastSub4,
        NeonUnicastMul4,
        NeonUnicastMin4,
        NeonUnicastMax4
    );
    crate::mmm_frame_tests!(has_neon(), NeonMmmRowF32);
}
