use std::cell::RefCell;
#[allow(unused_imports)]
use std::sync::{Arc, Mutex};

#[cfg(feature = "multithread")]
use rayon::prelude::*;
#[cfg(feature = "multithread")]
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Below this many items, splitting a loop across threads costs more than
/// it saves.
pub const MIN_ITEMS_PER_TASK: usize = 4096;

/// Strategy for running the data-parallel loops of a primitive.
#[derive(Debug, Clone, Default)]
pub enum Executor {
    #[default]
    SingleThread,
    #[cfg(feature = "multithread")]
    MultiThread(Arc<ThreadPool>),
}

impl Executor {
    #[cfg(feature = "multithread")]
    pub fn multithread(n: usize) -> kestrel_data::anyhow::Result<Executor> {
        Executor::multithread_with_name(n, "kestrel-default")
    }

    #[cfg(feature = "multithread")]
    pub fn multithread_with_name(n: usize, name: &str) -> kestrel_data::anyhow::Result<Executor> {
        let name = name.to_string();
        let pool = ThreadPoolBuilder::new()
            .thread_name(move |n| format!("{name}-{n}"))
            .num_threads(n)
            .build()?;
        Ok(Executor::MultiThread(Arc::new(pool)))
    }

    pub fn threads(&self) -> usize {
        match self {
            Executor::SingleThread => 1,
            #[cfg(feature = "multithread")]
            Executor::MultiThread(pool) => pool.current_num_threads(),
        }
    }

    /// Chunk length to split `len` items in, keeping chunks a multiple of
    /// `nr` (except the last one).
    pub fn chunk_len(&self, len: usize, nr: usize) -> usize {
        let threads = self.threads();
        if threads == 1 || len < 2 * MIN_ITEMS_PER_TASK {
            return len.max(1);
        }
        let chunk = len.div_ceil(threads).max(MIN_ITEMS_PER_TASK);
        chunk.div_ceil(nr) * nr
    }

    /// Apply `f(chunk_index, chunk)` to every `chunk_len` long chunk of
    /// `data`, possibly concurrently.
    pub fn for_each_chunk<T, F>(&self, data: &mut [T], chunk_len: usize, f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Send + Sync,
    {
        match self {
            Executor::SingleThread => {
                data.chunks_mut(chunk_len.max(1)).enumerate().for_each(|(ix, c)| f(ix, c))
            }
            #[cfg(feature = "multithread")]
            Executor::MultiThread(pool) => pool.install(|| {
                data.par_chunks_mut(chunk_len.max(1)).enumerate().for_each(|(ix, c)| f(ix, c))
            }),
        }
    }
}

static DEFAULT_EXECUTOR: Mutex<Executor> = Mutex::new(Executor::SingleThread);

thread_local! {
    static TLS_EXECUTOR_OVERRIDE: RefCell<Option<Executor>> = Default::default();
}

pub fn current_executor() -> Executor {
    if let Some(over_ride) = TLS_EXECUTOR_OVERRIDE.with_borrow(|tls| tls.clone()) {
        over_ride
    } else {
        DEFAULT_EXECUTOR.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub fn set_default_executor(executor: Executor) {
    *DEFAULT_EXECUTOR.lock().unwrap_or_else(|e| e.into_inner()) = executor;
}

/// Run `f` with `executor` as the current executor of this thread.
pub fn executor_scope<R, F: FnOnce() -> R>(executor: Executor, f: F) -> R {
    let previous = TLS_EXECUTOR_OVERRIDE.replace(Some(executor));
    let result = f();
    TLS_EXECUTOR_OVERRIDE.set(previous);
    result
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_thread_is_one_chunk() {
        let e = Executor::SingleThread;
        assert_eq!(e.chunk_len(100_000, 4), 100_000);
        assert_eq!(e.chunk_len(0, 4), 1);
        let mut data = vec![0usize; 10];
        e.for_each_chunk(&mut data, 3, |ix, c| c.iter_mut().for_each(|x| *x = ix));
        assert_eq!(data, [0, 0, 0, 1, 1, 1, 2, 2, 2, 3]);
    }

    #[cfg(feature = "multithread")]
    #[test]
    fn multithread_covers_everything() {
        let e = Executor::multithread(3).unwrap();
        let len = 3 * MIN_ITEMS_PER_TASK + 5;
        let chunk = e.chunk_len(len, 4);
        assert_eq!(chunk % 4, 0);
        let mut data = vec![0u32; len];
        executor_scope(e.clone(), || {
            current_executor().for_each_chunk(&mut data, chunk, |_, c| {
                c.iter_mut().for_each(|x| *x += 1)
            })
        });
        assert!(data.iter().all(|x| *x == 1));
    }
}
