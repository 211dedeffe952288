//! Mapping and reducer stages.
//!
//! A [`Stage`] is a declaration. Each worker calls [`Stage::instantiate`] to get
//! its own [`StageInstance`], so reducer accumulators are never shared between
//! workers.

use crate::batch::Batch;
use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// Result of one reducer step.
pub enum Step<A> {
    /// Keep accumulating, emit nothing.
    Keep(A),
    /// Keep accumulating and emit a batch downstream.
    Emit(A, Batch),
}

/// Per-worker state of a stage.
pub trait StageInstance: Send {
    /// Process one batch, returning at most one batch for the next stage.
    fn apply(&mut self, batch: Batch) -> anyhow::Result<Option<Batch>>;

    /// Called once when the input is exhausted.
    fn flush(&mut self) -> anyhow::Result<Option<Batch>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Mapping,
    Reducer,
}

type Factory = Arc<dyn Fn() -> Box<dyn StageInstance> + Send + Sync>;

/// A named stage declaration.
#[derive(Clone)]
pub struct Stage {
    name: String,
    kind: StageKind,
    factory: Factory,
}

impl Stage {
    /// Stateless `batch -> batch | None` stage.
    pub fn mapping<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Batch) -> anyhow::Result<Option<Batch>> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self {
            name: name.into(),
            kind: StageKind::Mapping,
            factory: Arc::new(move || Box::new(MappingInstance { f: f.clone() })),
        }
    }

    /// Stateful stage folding batches into an accumulator.
    ///
    /// Every worker starts from a clone of `init`. `finish` turns the final
    /// accumulator into the batch emitted at end of input.
    pub fn reducer<A, S, F>(name: impl Into<String>, init: A, step: S, finish: F) -> Self
    where
        A: Clone + Send + Sync + 'static,
        S: Fn(A, Batch) -> anyhow::Result<Step<A>> + Send + Sync + 'static,
        F: Fn(A) -> anyhow::Result<Option<Batch>> + Send + Sync + 'static,
    {
        let step = Arc::new(step);
        let finish = Arc::new(finish);
        Self {
            name: name.into(),
            kind: StageKind::Reducer,
            factory: Arc::new(move || {
                Box::new(ReducerInstance {
                    acc: Some(init.clone()),
                    step: step.clone(),
                    finish: finish.clone(),
                })
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    /// Fresh per-worker state.
    pub fn instantiate(&self) -> Box<dyn StageInstance> {
        (self.factory)()
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

struct MappingInstance<F> {
    f: Arc<F>,
}

impl<F> StageInstance for MappingInstance<F>
where
    F: Fn(Batch) -> anyhow::Result<Option<Batch>> + Send + Sync,
{
    fn apply(&mut self, batch: Batch) -> anyhow::Result<Option<Batch>> {
        (self.f)(batch)
    }
}

struct ReducerInstance<A, S, F> {
    acc: Option<A>,
    step: Arc<S>,
    finish: Arc<F>,
}

impl<A, S, F> StageInstance for ReducerInstance<A, S, F>
where
    A: Send,
    S: Fn(A, Batch) -> anyhow::Result<Step<A>> + Send + Sync,
    F: Fn(A) -> anyhow::Result<Option<Batch>> + Send + Sync,
{
    fn apply(&mut self, batch: Batch) -> anyhow::Result<Option<Batch>> {
        let acc = self
            .acc
            .take()
            .ok_or_else(|| anyhow::anyhow!("accumulator lost after an earlier failure"))?;
        match (self.step)(acc, batch)? {
            Step::Keep(acc) => {
                self.acc = Some(acc);
                Ok(None)
            }
            Step::Emit(acc, out) => {
                self.acc = Some(acc);
                Ok(Some(out))
            }
        }
    }

    fn flush(&mut self) -> anyhow::Result<Option<Batch>> {
        match self.acc.take() {
            Some(acc) => (self.finish)(acc),
            None => Ok(None),
        }
    }
}

/// A worker's instantiated stages, run in order.
pub struct StageChain {
    stages: Vec<(String, Box<dyn StageInstance>)>,
}

impl StageChain {
    pub fn instantiate(stages: &[Stage]) -> Self {
        Self {
            stages: stages
                .iter()
                .map(|s| (s.name.clone(), s.instantiate()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run one batch through every stage. A stage returning `None` ends the chain.
    pub fn run(&mut self, batch: Batch) -> Result<Option<Batch>> {
        self.run_from(0, batch)
    }

    fn run_from(&mut self, start: usize, batch: Batch) -> Result<Option<Batch>> {
        let mut current = batch;
        for (name, stage) in self.stages.iter_mut().skip(start) {
            match stage.apply(current).map_err(|cause| Error::Stage {
                stage: name.clone(),
                cause,
            })? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Flush every stage in order, feeding each flushed batch through the stages after it.
    pub fn flush(&mut self) -> Result<Vec<Batch>> {
        let mut out = Vec::new();
        for i in 0..self.stages.len() {
            let (name, stage) = &mut self.stages[i];
            let flushed = stage.flush().map_err(|cause| Error::Stage {
                stage: name.clone(),
                cause,
            })?;
            if let Some(batch) = flushed {
                if let Some(batch) = self.run_from(i + 1, batch)? {
                    out.push(batch);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Value;

    fn sample() -> Batch {
        Batch::from_rows(
            ["id", "x"],
            vec![
                vec![Value::Int(1), Value::Int(5)],
                vec![Value::Int(2), Value::Int(15)],
            ],
        )
    }

    fn keep_large_x() -> Stage {
        Stage::mapping("keep x>10", |batch: Batch| {
            Ok(Some(batch.filter(|r| r.get("x").and_then(Value::as_i64).unwrap_or(0) > 10)))
        })
    }

    fn count_records() -> Stage {
        Stage::reducer(
            "count",
            0i64,
            |acc, batch: Batch| Ok(Step::Keep(acc + batch.len() as i64)),
            |acc| Ok(Some(Batch::from_rows(["count"], vec![vec![Value::Int(acc)]]))),
        )
    }

    #[test]
    fn test_mapping_then_reducer() {
        let mut chain = StageChain::instantiate(&[keep_large_x(), count_records()]);
        assert_eq!(chain.run(sample()).unwrap(), None);

        let flushed = chain.flush().unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].rows()[0], vec![Value::Int(1)]);
    }

    #[test]
    fn test_mapping_output() {
        let mut chain = StageChain::instantiate(&[keep_large_x()]);
        let out = chain.run(sample()).unwrap().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.record(0).unwrap().get("id"), Some(&Value::Int(2)));
        assert!(chain.flush().unwrap().is_empty());
    }

    #[test]
    fn test_none_short_circuits() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = calls.clone();
        let mut chain = StageChain::instantiate(&[
            Stage::mapping("drop", |_| Ok(None)),
            Stage::mapping("never", move |b| {
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(Some(b))
            }),
        ]);
        assert_eq!(chain.run(sample()).unwrap(), None);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reducer_emits_and_flushes_downstream() {
        // Emit every second batch, then feed the flushed total through the next stage.
        let pairs = Stage::reducer(
            "pairs",
            0usize,
            |seen, batch: Batch| {
                let seen = seen + 1;
                Ok(if seen % 2 == 0 {
                    Step::Emit(seen, batch)
                } else {
                    Step::Keep(seen)
                })
            },
            |seen| Ok(Some(Batch::from_rows(["seen"], vec![vec![Value::Int(seen as i64)]]))),
        );
        let tag = Stage::mapping("tag", |mut b: Batch| {
            let n = b.len();
            b.add_column("tagged", vec![Value::Bool(true); n]);
            Ok(Some(b))
        });

        let mut chain = StageChain::instantiate(&[pairs, tag]);
        assert!(chain.run(sample()).unwrap().is_none());
        let emitted = chain.run(sample()).unwrap().unwrap();
        assert_eq!(emitted.fields().last().map(String::as_str), Some("tagged"));

        let flushed = chain.flush().unwrap();
        assert_eq!(flushed[0].fields(), &["seen", "tagged"]);
        assert_eq!(flushed[0].rows()[0][0], Value::Int(2));
    }

    #[test]
    fn test_instances_do_not_share_accumulators() {
        let stage = count_records();
        let mut a = StageChain::instantiate(std::slice::from_ref(&stage));
        let mut b = StageChain::instantiate(std::slice::from_ref(&stage));
        a.run(sample()).unwrap();
        a.run(sample()).unwrap();
        b.run(sample()).unwrap();

        assert_eq!(a.flush().unwrap()[0].rows()[0][0], Value::Int(4));
        assert_eq!(b.flush().unwrap()[0].rows()[0][0], Value::Int(2));
    }

    #[test]
    fn test_stage_error_names_stage() {
        let mut chain = StageChain::instantiate(&[Stage::mapping("explode", |_| {
            anyhow::bail!("bad batch")
        })]);
        let err = chain.run(sample()).unwrap_err();
        assert!(matches!(err, Error::Stage { ref stage, .. } if stage == "explode"));
        assert_eq!(err.stage_cause().unwrap().to_string(), "bad batch");
    }
}
