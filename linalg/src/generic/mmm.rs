use crate::frame::mmm::MatMatMulKer;
use crate::LADatum;
use std::marker::PhantomData;

/// Portable row kernel, for any LADatum. Accumulates in `T`, so integer
/// products must be fed pre-widened to i32.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericMmmRow<T: LADatum>(PhantomData<T>);

impl<T: LADatum> MatMatMulKer<T> for GenericMmmRow<T> {
    fn name() -> &'static str {
        "generic"
    }

    fn run_row(a_row: &[T], b: &[T], n: usize, c_row: &mut [T]) {
        c_row.iter_mut().for_each(|c| *c = T::zero());
        for (p, a) in a_row.iter().enumerate() {
            let b_row = &b[p * n..][..n];
            for (c, b) in c_row.iter_mut().zip(b_row) {
                *c += *a * *b;
            }
        }
    }
}
