use std::fmt::Debug;
use std::marker::PhantomData;

use kestrel_data::anyhow;

use crate::LADatum;

/// Row-major matrix product `C[m, n] = A[m, k] . B[k, n]`.
pub trait MatMatMul<T>: Send + Sync + Debug + dyn_clone::DynClone
where
    T: Copy + Debug + PartialEq + Send + Sync,
{
    fn name(&self) -> &'static str;
    fn run(&self, m: usize, k: usize, n: usize, a: &[T], b: &[T], c: &mut [T])
    -> anyhow::Result<()>;
}

dyn_clone::clone_trait_object!(<T> MatMatMul<T> where T: Copy);

/// Computes one output row: `c_row[n] = a_row[k] . B[k, n]`.
pub trait MatMatMulKer<T>: Send + Sync + Debug + dyn_clone::DynClone + Clone + 'static
where
    T: LADatum,
{
    fn name() -> &'static str;
    fn run_row(a_row: &[T], b: &[T], n: usize, c_row: &mut [T]);
    fn mmm() -> Box<dyn MatMatMul<T>> {
        Box::new(MatMatMulImpl::<Self, T>::new())
    }
}

#[derive(Debug, Clone, new)]
pub struct MatMatMulImpl<K, T>
where
    T: LADatum,
    K: MatMatMulKer<T>,
{
    phantom: PhantomData<(K, T)>,
}

impl<K, T> MatMatMul<T> for MatMatMulImpl<K, T>
where
    T: LADatum,
    K: MatMatMulKer<T>,
{
    fn name(&self) -> &'static str {
        K::name()
    }

    fn run(
        &self,
        m: usize,
        k: usize,
        n: usize,
        a: &[T],
        b: &[T],
        c: &mut [T],
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            a.len() == m * k && b.len() == k * n && c.len() == m * n,
            "{}: inconsistent operands for a {}x{}x{} product (a: {}, b: {}, c: {})",
            K::name(),
            m,
            k,
            n,
            a.len(),
            b.len(),
            c.len()
        );
        if m * n == 0 {
            return Ok(());
        }
        let executor = crate::multithread::current_executor();
        let rows_per_task = executor.chunk_len(m * n * k.max(1), n * k.max(1)) / (n * k.max(1));
        executor.for_each_chunk(c, rows_per_task.max(1) * n, |ix, c| {
            let first_row = ix * rows_per_task.max(1);
            for (r, c_row) in c.chunks_mut(n).enumerate() {
                let row = first_row + r;
                K::run_row(&a[row * k..][..k], b, n, c_row);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
#[macro_use]
pub mod test {
    use super::*;
    use kestrel_data::internal::*;
    use proptest::test_runner::TestCaseResult;
    use proptest::prelude::*;

    pub fn reference_f32(m: usize, k: usize, n: usize, a: &[f32], b: &[f32]) -> Vec<f32> {
        let mut c = vec![0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                for p in 0..k {
                    c[i * n + j] += a[i * k + p] * b[p * n + j];
                }
            }
        }
        c
    }

    #[derive(Debug, Clone)]
    pub struct MatMulProblem {
        pub m: usize,
        pub k: usize,
        pub n: usize,
        pub a: Vec<f32>,
        pub b: Vec<f32>,
    }

    pub fn strat_mat_mul() -> BoxedStrategy<MatMulProblem> {
        (1usize..9, 0usize..9, 1usize..11)
            .prop_flat_map(|(m, k, n)| {
                (
                    Just(m),
                    Just(k),
                    Just(n),
                    proptest::collection::vec(-5f32..5.0, m * k),
                    proptest::collection::vec(-5f32..5.0, k * n),
                )
            })
            .prop_map(|(m, k, n, a, b)| MatMulProblem { m, k, n, a, b })
            .boxed()
    }

    impl MatMulProblem {
        pub fn check<K: MatMatMulKer<f32>>(&self) -> TestCaseResult {
            crate::setup_test_logger();
            let mut c = vec![0f32; self.m * self.n];
            K::mmm().run(self.m, self.k, self.n, &self.a, &self.b, &mut c).unwrap();
            let expected = reference_f32(self.m, self.k, self.n, &self.a, &self.b);
            tensor1(&c)
                .close_enough(&tensor1(&expected), Approximation::Approximate)
                .map_err(|e| TestCaseError::fail(e.root_cause().to_string()))
        }
    }
}

#[cfg(test)]
#[macro_export]
macro_rules! mmm_frame_tests {
    ($cond:expr, $ker:ty) => {
        mod mmm {
            #[allow(unused_imports)]
            use super::*;
            use $crate::frame::mmm::test::*;

            proptest::proptest! {
                #[test]
                fn mat_mul(pb in strat_mat_mul()) {
                    if $cond {
                        pb.check::<$ker>()?;
                    }
                }
            }

            #[test]
            fn mat_vec() {
                if $cond {
                    let pb = MatMulProblem {
                        m: 5,
                        k: 7,
                        n: 1,
                        a: (0..35).map(|x| x as f32 / 10.0).collect(),
                        b: (0..7).map(|x| x as f32 - 3.0).collect(),
                    };
                    pb.check::<$ker>().unwrap();
                }
            }

            #[test]
            fn wide() {
                if $cond {
                    let pb = MatMulProblem {
                        m: 2,
                        k: 3,
                        n: 19,
                        a: vec![1.0, -1.0, 0.5, 2.0, 0.0, -3.0],
                        b: (0..57).map(|x| (x % 7) as f32).collect(),
                    };
                    pb.check::<$ker>().unwrap();
                }
            }
        }
    };
}
