//! Bounded thread pool for independent, CPU-bound tasks.

use crate::error::{Error, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// What to do when one task fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Fail the whole map with the first error.
    #[default]
    Stop,
    /// Log the failure and yield `None` for that input.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub threads: usize,
    pub errors: ErrorPolicy,
    /// Log failures instead of stopping, regardless of policy.
    pub debug: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            threads: 10,
            errors: ErrorPolicy::Stop,
            debug: false,
        }
    }
}

impl PoolOptions {
    pub fn ignoring_errors(mut self) -> Self {
        self.errors = ErrorPolicy::Ignore;
        self
    }
}

/// Apply `f` to every input on a pool of `options.threads` threads.
///
/// Results are in input order. An ignored failure leaves `None` in its slot.
/// With one thread or fewer the inputs are processed on the calling thread.
pub fn parallel_map<T, R, F>(inputs: Vec<T>, f: F, options: &PoolOptions) -> Result<Vec<Option<R>>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> anyhow::Result<R> + Send + Sync,
{
    let settle = |index: usize, result: anyhow::Result<R>| -> Result<Option<R>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(cause) if options.errors == ErrorPolicy::Ignore || options.debug => {
                tracing::warn!("Task {} failed, skipping: {:#}", index, cause);
                Ok(None)
            }
            Err(cause) => Err(Error::Stage {
                stage: format!("pool task {}", index),
                cause,
            }),
        }
    };

    if options.threads <= 1 {
        return inputs
            .into_iter()
            .enumerate()
            .map(|(i, input)| settle(i, f(input)))
            .collect();
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.threads)
        .thread_name(|i| format!("pool-{}", i))
        .build()
        .map_err(|e| Error::Pipeline(format!("failed to build thread pool: {}", e)))?;

    tracing::debug!("Mapping {} tasks over {} threads", inputs.len(), options.threads);
    pool.install(|| {
        inputs
            .into_par_iter()
            .enumerate()
            .map(|(i, input)| settle(i, f(input)))
            .collect()
    })
}
