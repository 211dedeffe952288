//! Map/reduce engine: one reader thread, W worker threads, one controller.
//!
//! ```text
//! ┌────────┐  input   ┌──────────┐  output  ┌────────────┐
//! │ reader │────────▶│ worker×W │────────▶│ controller │──▶ ChunkedWriter
//! └────────┘          └──────────┘          └────────────┘
//!      │                    │                      ▲
//!      └──────── errors ────┴──────────────────────┘
//! ```
//!
//! The reader sends one `EndOfStream` when the source is done. A worker that
//! receives it puts it back on the input queue for its siblings, flushes its
//! stage chain and exits; every worker exit sends exactly one `EndOfStream`
//! on the output queue. The controller completes once it has counted W of
//! them (1 when there are no stages and the worker tier is bypassed).

use super::metrics::{Metrics, MetricsReporter};
use super::queue::{ErrorQueue, Message, Queue};
use super::stage::{Stage, StageChain};
use crate::batch::Batch;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::io::{ChunkedReader, ChunkedWriter};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Cores left to the reader, controller and OS when sizing the worker pool.
pub const DEFAULT_RESERVE_CORES: usize = 2;

/// Worker count from available parallelism minus a reserve, at least 1.
pub fn default_workers(reserve: usize) -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(reserve)
        .max(1)
}

/// Engine sizing and behaviour.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Keep reading after another role failed, for diagnostics.
    pub debug: bool,
    pub metrics_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let workers = default_workers(DEFAULT_RESERVE_CORES);
        Self {
            workers,
            queue_capacity: workers,
            debug: false,
            metrics_interval: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        let workers = config.pipeline.effective_workers();
        Self {
            workers,
            queue_capacity: config.pipeline.queue_capacity.unwrap_or(workers),
            debug: config.debug.enabled,
            metrics_interval: Duration::from_secs(config.pipeline.metrics_interval_secs),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self.queue_capacity = workers;
        self
    }
}

/// Lifecycle of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub workers: usize,
    pub bypassed: bool,
    pub batches_read: u64,
    pub records_read: u64,
    pub batches_out: u64,
    pub end_of_stream_signals: u64,
    pub elapsed_secs: f64,
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records in {} batches read, {} batches out, {} workers{} in {:.1}s",
            self.records_read,
            self.batches_read,
            self.batches_out,
            self.workers,
            if self.bypassed { " (bypassed)" } else { "" },
            self.elapsed_secs
        )
    }
}

type Source = Box<dyn Iterator<Item = Result<Batch>> + Send>;

/// A pipeline that has not started yet.
pub struct Pipeline {
    source: Source,
    label: String,
    total_records: Option<u64>,
    stages: Vec<Stage>,
    config: EngineConfig,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    pub fn new(reader: ChunkedReader, config: EngineConfig) -> Self {
        let label = reader.descriptor().to_string();
        let total_records = reader.total();
        Self::from_source(reader, label, config).with_total(total_records)
    }

    /// Any batch iterator as the source, e.g. an in-memory one.
    pub fn from_source<I>(source: I, label: impl Into<String>, config: EngineConfig) -> Self
    where
        I: Iterator<Item = Result<Batch>> + Send + 'static,
    {
        Self {
            source: Box::new(source),
            label: label.into(),
            total_records: None,
            stages: Vec::new(),
            config,
            metrics: Metrics::new(),
        }
    }

    fn with_total(mut self, total: Option<u64>) -> Self {
        self.total_records = total;
        self
    }

    /// Append a stage to every worker's chain.
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::Idle
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Spawn the reader and workers and return the output side.
    pub fn start(self) -> Result<RunningPipeline> {
        let Pipeline {
            source,
            label,
            total_records,
            stages,
            config,
            metrics,
        } = self;

        let workers = config.workers.max(1);
        let capacity = config.queue_capacity.max(1);
        let bypassed = stages.is_empty();

        let input = Queue::bounded(capacity);
        let output = if bypassed { input.clone() } else { Queue::bounded(capacity) };
        let errors = ErrorQueue::bounded(workers + 2);

        tracing::info!(
            "Starting pipeline over {} with {} (queue capacity {})",
            label,
            if bypassed {
                "no stages, worker tier bypassed".to_string()
            } else {
                format!("{} workers x {} stages", workers, stages.len())
            },
            capacity
        );

        let mut handles = Vec::with_capacity(workers + 1);
        let reader_handle = {
            let input = input.clone();
            let errors = errors.clone();
            let metrics = metrics.clone();
            let debug = config.debug;
            thread::Builder::new()
                .name("reader".to_string())
                .spawn(move || read_routine(source, input, errors, metrics, debug))?
        };
        handles.push(("reader".to_string(), reader_handle));

        if !bypassed {
            let stages = Arc::new(stages);
            for id in 0..workers {
                let name = format!("worker-{}", id);
                let stages = stages.clone();
                let input = input.clone();
                let output = output.clone();
                let errors = errors.clone();
                let metrics = metrics.clone();
                let handle = thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || work_routine(&stages, input, output, errors, metrics))?;
                handles.push((name, handle));
            }
        }

        Ok(RunningPipeline {
            input,
            output,
            errors,
            handles,
            live: if bypassed { 1 } else { workers },
            workers,
            bypassed,
            state: PipelineState::Running,
            metrics,
            total_records,
            batches_out: 0,
            started: Instant::now(),
        })
    }

    /// Run to completion, writing every output batch from a dedicated writer thread.
    ///
    /// On failure the sink is still closed, so it holds only fully written
    /// batches, and the original error is returned.
    pub fn write_to(self, writer: ChunkedWriter) -> Result<PipelineStats> {
        let interval = self.config.metrics_interval;
        let running = self.start()?;
        let handle = thread::Builder::new()
            .name("writer".to_string())
            .spawn(move || write_routine(running, writer, interval))?;
        handle
            .join()
            .map_err(|_| Error::Pipeline("writer thread panicked".to_string()))?
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("label", &self.label)
            .field("stages", &self.stages)
            .field("config", &self.config)
            .finish()
    }
}

/// Pull batches from the source until it is exhausted or another role fails.
fn read_routine(source: Source, input: Queue, errors: ErrorQueue, metrics: Arc<Metrics>, debug: bool) {
    let mut source = source;
    loop {
        if !debug && errors.signalled() {
            tracing::debug!("Reader stopping: an error was reported");
            break;
        }
        match source.next() {
            None => break,
            Some(Ok(batch)) => {
                metrics.add_batch_read(batch.len());
                if input.send(Message::Batch(batch)).is_err() {
                    tracing::debug!("Input queue closed, reader stopping");
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::error!("Reader failed: {}", e);
                metrics.add_failure();
                errors.push(e);
                break;
            }
        }
    }
    // Release the source before signalling downstream.
    drop(source);
    let _ = input.send(Message::EndOfStream);
}

/// Sends this worker's single `EndOfStream` on every exit path, including panics.
struct EndOfStreamGuard(Queue);

impl Drop for EndOfStreamGuard {
    fn drop(&mut self) {
        let _ = self.0.send(Message::EndOfStream);
    }
}

fn work_routine(stages: &[Stage], input: Queue, output: Queue, errors: ErrorQueue, metrics: Arc<Metrics>) {
    let _end = EndOfStreamGuard(output.clone());
    let mut chain = StageChain::instantiate(stages);
    let name = thread::current().name().unwrap_or("worker").to_string();

    loop {
        if errors.signalled() {
            tracing::debug!("{} stopping: an error was reported", name);
            input.try_send(Message::EndOfStream);
            return;
        }
        let message = match input.recv() {
            Ok(message) => message,
            Err(_) => return,
        };

        match message {
            Message::EndOfStream => {
                let _ = input.send(Message::EndOfStream);
                match chain.flush() {
                    Ok(batches) => {
                        for batch in batches {
                            if output.send(Message::Batch(batch)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => fail(&name, e, &input, &errors, &metrics),
                }
                tracing::debug!("{} finished", name);
                return;
            }
            Message::Batch(batch) => {
                let start = Instant::now();
                match chain.run(batch) {
                    Ok(result) => {
                        metrics.add_batch_processed(start.elapsed());
                        if let Some(out) = result {
                            if output.send(Message::Batch(out)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        fail(&name, e, &input, &errors, &metrics);
                        return;
                    }
                }
            }
        }
    }
}

fn fail(worker: &str, error: Error, input: &Queue, errors: &ErrorQueue, metrics: &Metrics) {
    tracing::error!("{} failed: {}", worker, error);
    metrics.add_failure();
    errors.push(error);
    // Wake siblings blocked on an empty input queue.
    input.try_send(Message::EndOfStream);
}

fn write_routine(mut running: RunningPipeline, mut writer: ChunkedWriter, interval: Duration) -> Result<PipelineStats> {
    let metrics = running.metrics();
    let mut reporter = MetricsReporter::new(metrics.clone(), interval, running.total_records);

    while let Some(item) = running.next() {
        let batch = match item {
            Ok(batch) => batch,
            Err(e) => {
                if let Err(close_err) = writer.close() {
                    tracing::warn!("Failed to close {} after error: {}", writer.descriptor(), close_err);
                }
                return Err(e);
            }
        };

        let records = batch.len();
        let start = Instant::now();
        if let Err(e) = writer.write(batch) {
            running.abort();
            if let Err(close_err) = writer.close() {
                tracing::warn!("Failed to close {} after error: {}", writer.descriptor(), close_err);
            }
            return Err(e);
        }
        metrics.add_batch_written(records, start.elapsed());
        reporter.tick();
    }

    writer.close()?;
    reporter.finish();
    Ok(running.stats())
}

/// The output side of a started pipeline.
///
/// Iterating yields output batches until every worker has signalled the end
/// of its stream. The first reported error ends iteration with that error
/// after all threads have been stopped.
pub struct RunningPipeline {
    input: Queue,
    output: Queue,
    errors: ErrorQueue,
    handles: Vec<(String, JoinHandle<()>)>,
    live: usize,
    workers: usize,
    bypassed: bool,
    state: PipelineState,
    metrics: Arc<Metrics>,
    total_records: Option<u64>,
    batches_out: u64,
    started: Instant,
}

impl RunningPipeline {
    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Workers that have not yet signalled the end of their stream.
    pub fn live_workers(&self) -> usize {
        self.live
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    pub fn stats(&self) -> PipelineStats {
        let snapshot = self.metrics.snapshot();
        PipelineStats {
            workers: if self.bypassed { 0 } else { self.workers },
            bypassed: self.bypassed,
            batches_read: snapshot.batches_read,
            records_read: snapshot.records_read,
            batches_out: self.batches_out,
            end_of_stream_signals: snapshot.end_of_stream,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
        }
    }

    /// Stop all threads and mark the run failed.
    pub fn abort(&mut self) {
        if self.state == PipelineState::Running {
            tracing::warn!("Aborting pipeline");
            self.shutdown();
            self.state = PipelineState::Failed;
        }
    }

    fn shutdown(&mut self) -> Vec<String> {
        self.input.close();
        self.output.close();
        self.errors.close();
        self.join()
    }

    /// Join every thread, returning the names of those that panicked.
    fn join(&mut self) -> Vec<String> {
        self.handles
            .drain(..)
            .filter_map(|(name, handle)| handle.join().err().map(|_| name))
            .collect()
    }

    fn fail(&mut self, error: Error) -> Error {
        self.shutdown();
        while let Some(extra) = self.errors.take() {
            tracing::debug!("Additional error after failure: {}", extra);
        }
        self.state = PipelineState::Failed;
        tracing::error!("Pipeline failed: {}", error);
        error
    }

    fn complete(&mut self) -> Option<Error> {
        // Every worker is gone; a reader still blocked on a full input queue must not hang the join.
        self.input.close();
        let panicked = self.join();
        // Threads are gone, so anything reported is already queued.
        if let Some(err) = self.errors.take() {
            return Some(self.fail(err));
        }
        if !panicked.is_empty() {
            let err = Error::Pipeline(format!("threads panicked: {}", panicked.join(", ")));
            return Some(self.fail(err));
        }
        self.state = PipelineState::Completed;
        tracing::info!("Pipeline complete: {}", self.stats());
        None
    }
}

impl Iterator for RunningPipeline {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state != PipelineState::Running {
            return None;
        }
        loop {
            if self.errors.signalled() {
                self.input.close();
                self.output.close();
                let err = self
                    .errors
                    .take()
                    .unwrap_or_else(|| Error::Pipeline("error reported but not received".to_string()));
                return Some(Err(self.fail(err)));
            }

            match self.output.recv() {
                Ok(Message::Batch(batch)) => {
                    self.batches_out += 1;
                    return Some(Ok(batch));
                }
                Ok(Message::EndOfStream) => {
                    self.metrics.add_end_of_stream();
                    self.live = self.live.saturating_sub(1);
                    tracing::debug!("End of stream received, {} producers still live", self.live);
                    if self.live == 0 {
                        return self.complete().map(Err);
                    }
                }
                Err(_) => {
                    let err = self
                        .errors
                        .take()
                        .unwrap_or_else(|| Error::Pipeline("output queue closed unexpectedly".to_string()));
                    return Some(Err(self.fail(err)));
                }
            }
        }
    }
}

impl Drop for RunningPipeline {
    fn drop(&mut self) {
        if self.state == PipelineState::Running {
            self.shutdown();
        }
    }
}

impl fmt::Debug for RunningPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningPipeline")
            .field("state", &self.state)
            .field("live", &self.live)
            .field("workers", &self.workers)
            .field("bypassed", &self.bypassed)
            .finish()
    }
}
