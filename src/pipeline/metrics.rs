//! Throughput monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Counters shared by the reader, workers and writer of one run.
#[derive(Debug)]
pub struct Metrics {
    /// Batches pulled from the source
    pub batches_read: AtomicU64,

    /// Records pulled from the source
    pub records_read: AtomicU64,

    /// Batches that went through a worker's stage chain
    pub batches_processed: AtomicU64,

    /// Batches handed to the sink
    pub batches_written: AtomicU64,

    /// Records handed to the sink
    pub records_written: AtomicU64,

    /// End-of-stream signals seen by the controller
    pub end_of_stream: AtomicU64,

    /// Number of failed operations
    pub failures: AtomicU64,

    /// Time spent inside stage chains (microseconds, summed across workers)
    pub stage_us: AtomicU64,

    /// Time spent writing (microseconds)
    pub write_us: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            batches_read: AtomicU64::new(0),
            records_read: AtomicU64::new(0),
            batches_processed: AtomicU64::new(0),
            batches_written: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            end_of_stream: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            stage_us: AtomicU64::new(0),
            write_us: AtomicU64::new(0),
            start_time: Instant::now(),
        })
    }

    pub fn add_batch_read(&self, records: usize) {
        self.batches_read.fetch_add(1, Ordering::Relaxed);
        self.records_read.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn add_batch_processed(&self, duration: Duration) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
        self.stage_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_batch_written(&self, records: usize, duration: Duration) {
        self.batches_written.fetch_add(1, Ordering::Relaxed);
        self.records_written.fetch_add(records as u64, Ordering::Relaxed);
        self.write_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_end_of_stream(&self) {
        self.end_of_stream.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Records read per second since start.
    pub fn records_per_second(&self) -> f64 {
        let records = self.records_read.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            records as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches_read: self.batches_read.load(Ordering::Relaxed),
            records_read: self.records_read.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            end_of_stream: self.end_of_stream.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            records_per_second: self.records_per_second(),
            stage_secs: self.stage_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            write_secs: self.write_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub batches_read: u64,
    pub records_read: u64,
    pub batches_processed: u64,
    pub batches_written: u64,
    pub records_written: u64,
    pub end_of_stream: u64,
    pub failures: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub records_per_second: f64,
    /// Total time inside stage chains (seconds, summed across workers)
    pub stage_secs: f64,
    pub write_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Read: {} batches / {} records | Processed: {} | \
             Written: {} batches / {} records | Rate: {:.0} records/s | \
             Failures: {} | Elapsed: {:.1}s | Time: stages {:.1}s write {:.1}s",
            self.batches_read,
            self.records_read,
            self.batches_processed,
            self.batches_written,
            self.records_written,
            self.records_per_second,
            self.failures,
            self.elapsed.as_secs_f64(),
            self.stage_secs,
            self.write_secs,
        )
    }
}

/// Logs a snapshot at most once per interval.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval: Duration,
    last: Instant,
    total_records: Option<u64>,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<Metrics>, interval: Duration, total_records: Option<u64>) -> Self {
        Self {
            metrics,
            interval,
            last: Instant::now(),
            total_records,
        }
    }

    /// Log progress if the interval has elapsed since the last report.
    pub fn tick(&mut self) {
        if self.last.elapsed() < self.interval {
            return;
        }
        self.last = Instant::now();
        let snapshot = self.metrics.snapshot();
        match self.total_records {
            Some(total) if total > 0 => {
                let progress = snapshot.records_read as f64 / total as f64 * 100.0;
                tracing::info!("[{:.1}%] {}", progress, snapshot);
            }
            _ => tracing::info!("{}", snapshot),
        }
    }

    /// Log the final summary.
    pub fn finish(&self) {
        tracing::info!("Final: {}", self.metrics.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        metrics.add_batch_read(10);
        metrics.add_batch_read(5);
        metrics.add_batch_processed(Duration::from_millis(2));
        metrics.add_batch_written(15, Duration::from_millis(500));
        metrics.add_end_of_stream();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.batches_read, 2);
        assert_eq!(snapshot.records_read, 15);
        assert_eq!(snapshot.batches_processed, 1);
        assert_eq!(snapshot.records_written, 15);
        assert_eq!(snapshot.end_of_stream, 1);
        assert!((snapshot.write_secs - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = Metrics::new();
        metrics.add_failure();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["failures"], 1);
        assert!(json["elapsed"].is_f64());
        assert!(metrics.snapshot().to_string().contains("Failures: 1"));
    }
}
