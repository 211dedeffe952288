//! geobatch
//!
//! Streaming, chunked reading and writing of tabular and spatial datasets,
//! with a parallel map/reduce engine over record batches.
//!
//! # Architecture
//!
//! - **Batch**: record batches, values and inferred schemas
//! - **Drivers**: format backends (CSV/TSV, GeoJSON, SQLite) chosen by descriptor
//! - **I/O**: `ChunkedReader` with geometry filters and a lazily initialised `ChunkedWriter`
//! - **Pipeline**: reader → workers → controller over bounded queues, plus a pool helper
//!
//! # Usage
//!
//! ```no_run
//! use geobatch::{copy_dataset, Config, DriverRegistry};
//!
//! fn main() -> anyhow::Result<()> {
//!     let registry = DriverRegistry::with_defaults()?;
//!     let stats = copy_dataset(&Config::default(), &registry, "roads.csv", "roads.geojson", None)?;
//!     println!("{}", stats);
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
pub mod drivers;
pub mod error;
pub mod geometry;
pub mod io;
pub mod pipeline;

pub use batch::{Batch, Schema, Value};
pub use config::Config;
pub use drivers::{Descriptor, DriverRegistry};
pub use error::{Error, Result};
pub use io::{ChunkedReader, ChunkedWriter, GeometryFilter, ReaderOptions};
pub use pipeline::{EngineConfig, Pipeline, PipelineStats, Stage};

use anyhow::Context;
use drivers::DriverOptions;

/// Open `source` with the configured reader options and an optional filter source.
pub fn open_reader(
    config: &Config,
    registry: &DriverRegistry,
    source: &str,
    filter: Option<&str>,
) -> anyhow::Result<ChunkedReader> {
    let mut options = config.reader_options();
    if let Some(filter) = filter {
        let filter_reader = ChunkedReader::open(registry, filter, config.reader_options().with_skip(0))
            .with_context(|| format!("Failed to open filter source {}", filter))?;
        options = options.with_filter(GeometryFilter::from_reader(filter_reader));
    }
    ChunkedReader::open(registry, source, options).with_context(|| format!("Failed to open {}", source))
}

/// Run `stages` over `source` and write the result to `output`.
pub fn run_to(
    config: &Config,
    registry: &DriverRegistry,
    reader: ChunkedReader,
    stages: Vec<Stage>,
    output: &str,
) -> anyhow::Result<PipelineStats> {
    config.validate()?;
    let writer = ChunkedWriter::open(registry, output, &DriverOptions::default())
        .with_context(|| format!("Failed to open output {}", output))?;

    let pipeline = stages
        .into_iter()
        .fold(Pipeline::new(reader, EngineConfig::from_config(config)), Pipeline::stage);
    let metrics = pipeline.metrics();
    let stats = pipeline.write_to(writer)?;

    if let Some(path) = &config.pipeline.metrics_output_path {
        metrics.snapshot().save_to_file(path)?;
    }
    Ok(stats)
}

/// Stream `source` into `output` unchanged, optionally keeping only records
/// that intersect the geometries of `filter`.
pub fn copy_dataset(
    config: &Config,
    registry: &DriverRegistry,
    source: &str,
    output: &str,
    filter: Option<&str>,
) -> anyhow::Result<PipelineStats> {
    let reader = open_reader(config, registry, source, filter)?;
    run_to(config, registry, reader, Vec::new(), output)
}

/// Build point geometries from two coordinate columns of `source`.
pub fn points_dataset(
    config: &Config,
    registry: &DriverRegistry,
    source: &str,
    lon: &str,
    lat: &str,
    output: &str,
) -> anyhow::Result<PipelineStats> {
    let reader = open_reader(config, registry, source, None)?;
    let (lon, lat) = (lon.to_string(), lat.to_string());
    let stage = Stage::mapping("points", move |b| Ok(Some(batch::points_from_columns(b, &lon, &lat)?)));
    run_to(config, registry, reader, vec![stage], output)
}
