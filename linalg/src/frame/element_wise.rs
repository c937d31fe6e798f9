use std::fmt::Debug;
use std::marker::PhantomData;

use kestrel_data::anyhow;

use crate::frame::element_wise_helper::map_slice_with_alignment;
use crate::LADatum;

macro_rules! ew_impl_wrap {
    ($ti: ident, $func: ident, $nr: expr, $alignment_items: expr, $params: ty, $run: item) => {
        paste! {
            #[derive(Copy, Clone, Debug)]
            #[allow(non_camel_case_types)]
            pub struct $func;

            impl $crate::frame::element_wise::ElementWiseKer<$ti, $params> for $func {
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

/// In-place transformation of a slice, optionally parameterized.
pub trait ElementWise<T, Params = ()>: Send + Sync + Debug + dyn_clone::DynClone
where
    Params: Copy + Send + Sync + Debug + 'static + Default,
    T: Copy + Debug + PartialEq + Send + Sync,
{
    fn name(&self) -> &'static str;
    fn run(&self, vec: &mut [T]) -> anyhow::Result<()> {
        self.run_with_params(vec, Params::default())
    }
    fn run_with_params(&self, vec: &mut [T], params: Params) -> anyhow::Result<()>;
}

dyn_clone::clone_trait_object!(<T, Params> ElementWise<T, Params> where T: Copy, Params: Copy);

#[derive(Debug, Clone, new)]
pub struct ElementWiseImpl<K, T, Params = ()>
where
    T: LADatum,
    Params: Copy + Send + Sync + Debug + 'static + Default,
    K: ElementWiseKer<T, Params> + Clone,
{
    phantom: PhantomData<(K, T, Params)>,
}

impl<K, T, Params> ElementWise<T, Params> for ElementWiseImpl<K, T, Params>
where
    T: LADatum,
    Params: Copy + Send + Sync + Debug + 'static + Default,
    K: ElementWiseKer<T, Params> + Clone,
{
    fn name(&self) -> &'static str {
        K::name()
    }

    fn run_with_params(&self, vec: &mut [T], params: Params) -> anyhow::Result<()> {
        let executor = crate::multithread::current_executor();
        let chunk = executor.chunk_len(vec.len(), K::nr());
        executor.for_each_chunk(vec, chunk, |_, chunk| {
            map_slice_with_alignment(chunk, |data| K::run(data, params), K::nr(), K::alignment_bytes())
        });
        Ok(())
    }
}

/// A kernel working on slices aligned on `alignment_bytes()` whose length
/// is a multiple of `nr()`.
pub trait ElementWiseKer<T, Params = ()>:
    Send + Sync + Debug + dyn_clone::DynClone + Clone + 'static
where
    Params: Copy + Send + Sync + Debug + 'static + Default,
    T: LADatum,
{
    fn name() -> &'static str;
    fn alignment_bytes() -> usize {
        Self::alignment_items() * T::datum_type().size_of()
    }
    fn alignment_items() -> usize;
    fn nr() -> usize;
    fn run(vec: &mut [T], params: Params);
    fn ew() -> Box<dyn ElementWise<T, Params>> {
        Box::new(ElementWiseImpl::<Self, T, Params>::new())
    }
}

#[cfg(test)]
#[macro_use]
pub mod test {
    use super::*;
    use kestrel_data::internal::*;
    use proptest::test_runner::{TestCaseError, TestCaseResult};

    pub fn test_element_wise<K: ElementWiseKer<f32, P>, P: Copy + Send + Sync + Debug + 'static + Default>(
        values: &[f32],
        params: P,
        reference: impl Fn(f32) -> f32,
    ) -> TestCaseResult {
        crate::setup_test_logger();
        let mut found = values.to_vec();
        let expected = values.iter().copied().map(reference).collect::<Vec<_>>();
        K::ew().run_with_params(&mut found, params).unwrap();
        tensor1(&found)
            .close_enough(&tensor1(&expected), Approximation::Approximate)
            .map_err(|e| TestCaseError::fail(e.root_cause().to_string()))?;
        Ok(())
    }

    /// Exercise a kernel on misaligned sub-slices of an aligned tensor.
    pub fn test_element_wise_offsets<K: ElementWiseKer<f32, P>, P: Copy + Send + Sync + Debug + 'static + Default>(
        params: P,
        reference: impl Fn(f32) -> f32,
    ) {
        let values = (0..37).map(|i| (i as f32 - 18.0) / 4.0).collect::<Vec<_>>();
        for offset in 0..5 {
            let mut t = tensor1(&values);
            let slice = &mut t.as_slice_mut::<f32>().unwrap()[offset..];
            K::ew().run_with_params(slice, params).unwrap();
            let expected = values[offset..].iter().copied().map(&reference).collect::<Vec<_>>();
            tensor1(&t.as_slice::<f32>().unwrap()[offset..])
                .close_enough(&tensor1(&expected), Approximation::Approximate)
                .unwrap();
            assert_eq!(&t.as_slice::<f32>().unwrap()[..offset], &values[..offset]);
        }
    }
}

#[cfg(test)]
#[macro_export]
macro_rules! element_wise_frame_tests {
    ($cond:expr, $relu:ty, $sigmoid:ty, $tanh:ty) => {
        mod element_wise {
            #[allow(unused_imports)]
            use super::*;
            use $crate::frame::element_wise::test::*;

            fn logistic(x: f32) -> f32 {
                1.0 / (1.0 + (-x).exp())
            }

            proptest::proptest! {
                #[test]
                fn relu(xs in proptest::collection::vec(-25f32..25.0, 0..100), limit in 0f32..30.0) {
                    if $cond {
                        test_element_wise::<$relu, f32>(&xs, limit, |x| x.max(0.0).min(limit))?;
                    }
                }

                #[test]
                fn sigmoid(xs in proptest::collection::vec(-25f32..25.0, 0..100)) {
                    if $cond {
                        test_element_wise::<$sigmoid, ()>(&xs, (), logistic)?;
                    }
                }

                #[test]
                fn tanh(xs in proptest::collection::vec(-25f32..25.0, 0..100)) {
                    if $cond {
                        test_element_wise::<$tanh, ()>(&xs, (), |x| x.tanh())?;
                    }
                }
            }

            #[test]
            fn relu_offsets() {
                if $cond {
                    test_element_wise_offsets::<$relu, f32>(f32::INFINITY, |x| x.max(0.0));
                    test_element_wise_offsets::<$relu, f32>(6.0, |x| x.max(0.0).min(6.0));
                }
            }

            #[test]
            fn sigmoid_offsets() {
                if $cond {
                    test_element_wise_offsets::<$sigmoid, ()>((), logistic);
                }
            }

            #[test]
            fn tanh_asymptots() {
                if $cond {
                    test_element_wise::<$tanh, ()>(&[-100f32, 100.0, 0.0], (), |x| x.tanh()).unwrap();
                }
            }
        }
    };
}
