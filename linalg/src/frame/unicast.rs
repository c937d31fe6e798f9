use std::fmt::Debug;
use std::marker::PhantomData;

use kestrel_data::anyhow;

use crate::frame::element_wise_helper::TempBuffer;
use crate::LADatum;

macro_rules! unicast_impl_wrap {
    ($ti: ident, $func: ident, $nr: expr, $alignment_items: expr, $run: item) => {
        paste! {
            #[derive(Copy, Clone, Debug)]
            #[allow(non_camel_case_types)]
            pub struct $func;

            impl $crate::frame::unicast::UnicastKer<$ti> for $func {
                #[inline(always)]
                fn name() -> &'static str {
                    stringify!($func)
                }
                #[inline(always)]
                fn nr() -> usize {
                    $nr
                }
                #[inline(always)]
                fn alignment_items() -> usize {
                    $alignment_items
                }
                $run
            }
        }
    };
}

/// `a[i] = a[i] op b[i]` over two slices of the same length.
pub trait Unicast<T>: Send + Sync + Debug + dyn_clone::DynClone
where
    T: Copy + Debug + PartialEq + Send + Sync,
{
    fn name(&self) -> &'static str;
    fn run(&self, a: &mut [T], b: &[T]) -> anyhow::Result<()>;
}

dyn_clone::clone_trait_object!(<T> Unicast<T> where T: Copy);

#[derive(Debug, Clone, new)]
pub struct UnicastImpl<K, T>
where
    T: LADatum,
    K: UnicastKer<T> + Clone,
{
    phantom: PhantomData<(K, T)>,
}

impl<K, T> Unicast<T> for UnicastImpl<K, T>
where
    T: LADatum,
    K: UnicastKer<T> + Clone,
{
    fn name(&self) -> &'static str {
        K::name()
    }

    fn run(&self, a: &mut [T], b: &[T]) -> anyhow::Result<()> {
        anyhow::ensure!(
            a.len() == b.len(),
            "{}: operands length mismatch ({} vs {})",
            K::name(),
            a.len(),
            b.len()
        );
        let executor = crate::multithread::current_executor();
        let chunk = executor.chunk_len(a.len(), K::nr());
        executor.for_each_chunk(a, chunk, |ix, a| {
            let b = &b[ix * chunk..][..a.len()];
            unicast_with_alignment(a, b, |a, b| K::run(a, b), K::nr(), K::alignment_bytes())
        });
        Ok(())
    }
}

pub trait UnicastKer<T>: Send + Sync + Debug + dyn_clone::DynClone + Clone + 'static
where
    T: LADatum,
{
    fn name() -> &'static str;
    fn alignment_bytes() -> usize {
        Self::alignment_items() * T::datum_type().size_of()
    }
    fn alignment_items() -> usize;
    fn nr() -> usize;
    fn run(a: &mut [T], b: &[T]);
    fn bin() -> Box<dyn Unicast<T>> {
        Box::new(UnicastImpl::<Self, T>::new())
    }
}

std::thread_local! {
    static TMP: std::cell::RefCell<(TempBuffer, TempBuffer)> = std::cell::RefCell::new((TempBuffer::default(), TempBuffer::default()));
}

pub(crate) fn unicast_with_alignment<T>(
    a: &mut [T],
    b: &[T],
    f: impl Fn(&mut [T], &[T]),
    nr: usize,
    alignment_bytes: usize,
) where
    T: LADatum,
{
    if a.is_empty() {
        return;
    }
    TMP.with(|buffers| {
        let mut buffers = buffers.borrow_mut();
        buffers.0.ensure(nr * T::datum_type().size_of(), alignment_bytes);
        buffers.1.ensure(nr * T::datum_type().size_of(), alignment_bytes);
        let tmp_a = unsafe { std::slice::from_raw_parts_mut(buffers.0.buffer as *mut T, nr) };
        let tmp_b = unsafe { std::slice::from_raw_parts_mut(buffers.1.buffer as *mut T, nr) };
        let mut compute_via_temp_buffer = |a: &mut [T], b: &[T]| {
            tmp_a[..a.len()].copy_from_slice(a);
            tmp_b[..b.len()].copy_from_slice(b);
            tmp_a[a.len()..].fill(T::zero());
            tmp_b[b.len()..].fill(T::one());
            f(tmp_a, tmp_b);
            a.copy_from_slice(&tmp_a[..a.len()])
        };

        let a_prefix_len = a.as_ptr().align_offset(alignment_bytes).min(a.len());
        let b_prefix_len = b.as_ptr().align_offset(alignment_bytes).min(b.len());
        if a_prefix_len != b_prefix_len {
            // operands do not share alignment: every tile goes through scratch
            for (a, b) in a.chunks_mut(nr).zip(b.chunks(nr)) {
                compute_via_temp_buffer(a, b);
            }
            return;
        }
        if a_prefix_len > 0 {
            compute_via_temp_buffer(&mut a[..a_prefix_len], &b[..a_prefix_len]);
        }
        let aligned_len = (a.len() - a_prefix_len) / nr * nr;
        if aligned_len > 0 {
            f(&mut a[a_prefix_len..][..aligned_len], &b[a_prefix_len..][..aligned_len]);
        }
        let done = a_prefix_len + aligned_len;
        if done < a.len() {
            compute_via_temp_buffer(&mut a[done..], &b[done..]);
        }
    })
}

#[cfg(test)]
#[macro_use]
pub mod test {
    use super::*;
    use kestrel_data::internal::*;
    use proptest::test_runner::{TestCaseError, TestCaseResult};

    pub fn test_unicast<K: UnicastKer<f32>>(
        a: &[f32],
        b: &[f32],
        reference: impl Fn(f32, f32) -> f32,
    ) -> TestCaseResult {
        crate::setup_test_logger();
        let mut found = a.to_vec();
        let expected = a.iter().zip(b.iter()).map(|(a, b)| reference(*a, *b)).collect::<Vec<_>>();
        K::bin().run(&mut found, b).unwrap();
        tensor1(&found)
            .close_enough(&tensor1(&expected), Approximation::Close)
            .map_err(|e| TestCaseError::fail(e.root_cause().to_string()))?;
        Ok(())
    }

    #[test]
    fn length_mismatch_is_an_error() {
        let mut a = [1f32, 2.];
        assert!(crate::generic::SUnicastAdd4::bin().run(&mut a, &[1.0]).is_err());
    }

    #[test]
    fn unaligned_operands() {
        let a = tensor1(&(0..23).map(|x| x as f32).collect::<Vec<_>>());
        let b = tensor1(&(0..23).map(|x| 2.0 * x as f32).collect::<Vec<_>>());
        let mut a_slice = a.as_slice::<f32>().unwrap()[1..].to_vec();
        let b_slice = &b.as_slice::<f32>().unwrap()[2..];
        let expected = a_slice.iter().zip(b_slice).map(|(a, b)| a + b).collect::<Vec<_>>();
        let len = b_slice.len();
        a_slice.truncate(len);
        crate::generic::SUnicastAdd4::bin().run(&mut a_slice, b_slice).unwrap();
        assert_eq!(a_slice, expected[..len]);
    }
}

#[cfg(test)]
#[macro_export]
macro_rules! unicast_frame_tests {
    ($cond:expr, $add:ty, $sub:ty, $mul:ty, $min:ty, $max:ty) => {
        mod unicast {
            #[allow(unused_imports)]
            use super::*;
            use $crate::frame::unicast::test::*;

            fn operands() -> impl proptest::strategy::Strategy<Value = (Vec<f32>, Vec<f32>)> {
                use proptest::prelude::*;
                (0usize..100).prop_flat_map(|len| {
                    (
                        proptest::collection::vec(-25f32..25.0, len),
                        proptest::collection::vec(-25f32..25.0, len),
                    )
                })
            }

            proptest::proptest! {
                #[test]
                fn add((a, b) in operands()) {
                    if $cond { test_unicast::<$add>(&a, &b, |a, b| a + b)?; }
                }

                #[test]
                fn sub((a, b) in operands()) {
                    if $cond { test_unicast::<$sub>(&a, &b, |a, b| a - b)?; }
                }

                #[test]
                fn mul((a, b) in operands()) {
                    if $cond { test_unicast::<$mul>(&a, &b, |a, b| a * b)?; }
                }

                #[test]
                fn min((a, b) in operands()) {
                    if $cond { test_unicast::<$min>(&a, &b, f32::min)?; }
                }

                #[test]
                fn max((a, b) in operands()) {
                    if $cond { test_unicast::<$max>(&a, &b, f32::max)?; }
                }
            }
        }
    };
}
