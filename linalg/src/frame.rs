#[macro_use]
pub mod element_wise;
#[macro_use]
pub mod unicast;
pub mod element_wise_helper;
pub mod mmm;

pub use element_wise::{ElementWise, ElementWiseImpl, ElementWiseKer};
pub use mmm::{MatMatMul, MatMatMulImpl, MatMatMulKer};
pub use unicast::{Unicast, UnicastImpl, UnicastKer};
