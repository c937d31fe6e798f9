pub mod mmm;
pub mod relu;
pub mod rounding;
pub mod sigmoid;
pub mod tanh;
pub mod unicast;

pub use self::mmm::GenericMmmRow;
pub use self::relu::SRelu4;
pub use self::rounding::{RoundingPolicy, ScaleShiftAndRound, Scaler};
pub use self::sigmoid::{ssigmoid, SSigmoid4};
pub use self::tanh::{stanh, STanh4};
pub use self::unicast::{SUnicastAdd4, SUnicastMax4, SUnicastMin4, SUnicastMul4, SUnicastSub4};

#[cfg(test)]
mod test {
    use crate::generic::*;

    crate::element_wise_frame_tests!(true, SRelu4, SSigmoid4, STanh4);
    crate::unicast_frame_tests!(
        true,
        SUnicastAdd4,
        SUnicastSub4,
        SUnicastMul4,
        SUnicastMin4,
        SUnicastMax4
    );
    crate::mmm_frame_tests!(true, GenericMmmRow<f32>);
}
