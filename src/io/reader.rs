//! Chunked reading with optional geometry filters.

use crate::batch::{Batch, Value, GEOMETRY_FIELD};
use crate::drivers::{Descriptor, DriverOptions, DriverRegistry, FormatReader};
use crate::error::Result;
use crate::geometry;
use geo_types::Geometry;
use std::fmt;
use tracing::{debug, info};

/// Default number of records per batch.
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

type FilterPasses = Box<dyn Iterator<Item = Result<Option<Geometry<f64>>>> + Send>;

/// Geometries a reader tests records against.
///
/// Every geometry in a collection or stream gets its own full pass over the
/// source, so records matching several filters are yielded once per match.
pub enum GeometryFilter {
    /// One pass, no spatial predicate.
    None,
    Single(Geometry<f64>),
    Many(Vec<Geometry<f64>>),
    /// Geometries pulled lazily, one pass each.
    Stream(Box<dyn Iterator<Item = Result<Geometry<f64>>> + Send>),
}

impl GeometryFilter {
    /// Use the geometries of another source as filters.
    pub fn from_reader(reader: ChunkedReader) -> Self {
        let geometries = reader.flat_map(|batch| -> Vec<Result<Geometry<f64>>> {
            match batch {
                Ok(batch) => {
                    let Some(idx) = batch.column_index(GEOMETRY_FIELD) else {
                        return Vec::new();
                    };
                    batch
                        .into_rows()
                        .into_iter()
                        .filter_map(|mut row| match std::mem::replace(&mut row[idx], Value::Null) {
                            Value::Geometry(g) => Some(Ok(g)),
                            _ => None,
                        })
                        .collect()
                }
                Err(e) => vec![Err(e)],
            }
        });
        GeometryFilter::Stream(Box::new(geometries))
    }

    fn into_passes(self) -> FilterPasses {
        match self {
            GeometryFilter::None => Box::new(std::iter::once(Ok(None))),
            GeometryFilter::Single(g) => Box::new(std::iter::once(Ok(Some(g)))),
            GeometryFilter::Many(gs) => Box::new(gs.into_iter().map(|g| Ok(Some(g)))),
            GeometryFilter::Stream(s) => Box::new(s.map(|r| r.map(Some))),
        }
    }
}

impl Default for GeometryFilter {
    fn default() -> Self {
        GeometryFilter::None
    }
}

impl fmt::Debug for GeometryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeometryFilter::None => f.write_str("None"),
            GeometryFilter::Single(_) => f.write_str("Single"),
            GeometryFilter::Many(gs) => write!(f, "Many({})", gs.len()),
            GeometryFilter::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<Geometry<f64>> for GeometryFilter {
    fn from(g: Geometry<f64>) -> Self {
        GeometryFilter::Single(g)
    }
}

impl From<Vec<Geometry<f64>>> for GeometryFilter {
    fn from(gs: Vec<Geometry<f64>>) -> Self {
        GeometryFilter::Many(gs)
    }
}

/// Options for opening a [`ChunkedReader`].
#[derive(Debug)]
pub struct ReaderOptions {
    pub chunk_size: usize,
    /// Leading batches to discard.
    pub skip: usize,
    pub filter: GeometryFilter,
    pub driver: DriverOptions,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            skip: 0,
            filter: GeometryFilter::None,
            driver: DriverOptions::default(),
        }
    }
}

impl ReaderOptions {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<GeometryFilter>) -> Self {
        self.filter = filter.into();
        self
    }
}

/// Lazy sequence of batches over one source.
///
/// Fields, CRS and the estimated total are known as soon as the reader is
/// open. Traversal is single-use; open a new reader for a second pass.
pub struct ChunkedReader {
    descriptor: String,
    inner: Option<Box<dyn FormatReader>>,
    fields: Vec<String>,
    geometry_index: Option<usize>,
    crs: Option<String>,
    total: Option<u64>,
    chunk_size: usize,
    skip: usize,
    passes: FilterPasses,
    /// Filter of the active pass; `None` between passes.
    current: Option<Option<Geometry<f64>>>,
    /// Set once the driver reports the end of the active pass.
    pass_exhausted: bool,
    pass_count: usize,
    batches_seen: usize,
}

impl ChunkedReader {
    /// Select a driver for `descriptor` and open it.
    pub fn open(registry: &DriverRegistry, descriptor: &str, options: ReaderOptions) -> Result<Self> {
        let parsed = Descriptor::parse(descriptor)?;
        let binding = registry.select(descriptor)?;
        let inner = binding.open_reader(&parsed, &options.driver)?;
        Ok(Self::from_reader(inner, descriptor, options))
    }

    /// Wrap an already opened format reader.
    pub fn from_reader(inner: Box<dyn FormatReader>, descriptor: impl Into<String>, options: ReaderOptions) -> Self {
        let descriptor = descriptor.into();
        let fields = inner.fields().to_vec();
        let geometry_index = fields.iter().position(|f| f == GEOMETRY_FIELD);
        let crs = inner.crs().map(str::to_string);
        let total = inner.total();
        info!(
            "Reading {} ({} fields, ~{} records, chunk size {})",
            descriptor,
            fields.len(),
            total.map_or("?".to_string(), |t| t.to_string()),
            options.chunk_size
        );

        Self {
            descriptor,
            inner: Some(inner),
            fields,
            geometry_index,
            crs,
            total,
            chunk_size: options.chunk_size.max(1),
            skip: options.skip,
            passes: options.filter.into_passes(),
            current: None,
            pass_exhausted: false,
            pass_count: 0,
            batches_seen: 0,
        }
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn crs(&self) -> Option<&str> {
        self.crs.as_deref()
    }

    /// Estimated record count of one unfiltered pass.
    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Whether the underlying handle has been released.
    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Release the underlying handle. Further iteration yields nothing.
    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            debug!("Closed {} after {} passes", self.descriptor, self.pass_count);
        }
    }

    fn start_pass(&mut self, filter: Option<Geometry<f64>>) -> Result<()> {
        if self.pass_count > 0 {
            if let Some(inner) = self.inner.as_mut() {
                inner.rewind()?;
            }
        }
        self.pass_count += 1;
        self.pass_exhausted = false;
        self.current = Some(filter);
        Ok(())
    }

    /// Collect up to `chunk_size` matching records from the active pass.
    fn fill_batch(&mut self) -> Result<Batch> {
        let mut batch = Batch::new(self.fields.iter().cloned()).with_crs(self.crs.clone());
        let Some(inner) = self.inner.as_mut() else {
            return Ok(batch);
        };
        let filter = self.current.as_ref().and_then(Option::as_ref);

        while batch.len() < self.chunk_size && !self.pass_exhausted {
            let Some(row) = inner.next_record()? else {
                self.pass_exhausted = true;
                break;
            };
            if let Some(filter) = filter {
                let hit = self
                    .geometry_index
                    .and_then(|i| row[i].as_geometry())
                    .is_some_and(|g| geometry::intersects(g, filter));
                if !hit {
                    continue;
                }
            }
            batch.push(row);
        }
        Ok(batch)
    }
}

impl Iterator for ChunkedReader {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.inner.is_none() {
                return None;
            }

            if self.current.is_none() {
                match self.passes.next() {
                    None => {
                        self.close();
                        return None;
                    }
                    Some(Err(e)) => {
                        self.close();
                        return Some(Err(e));
                    }
                    Some(Ok(filter)) => {
                        if let Err(e) = self.start_pass(filter) {
                            self.close();
                            return Some(Err(e));
                        }
                    }
                }
            }

            let batch = match self.fill_batch() {
                Ok(batch) => batch,
                Err(e) => {
                    self.close();
                    return Some(Err(e));
                }
            };
            if batch.is_empty() {
                // Only an exhausted pass yields an empty fill.
                self.current = None;
                continue;
            }

            self.batches_seen += 1;
            if self.batches_seen <= self.skip {
                debug!("Skipping batch {} of {}", self.batches_seen, self.descriptor);
                continue;
            }
            debug!(
                "Read batch {} ({} records) from {}",
                self.batches_seen,
                batch.len(),
                self.descriptor
            );
            return Some(Ok(batch));
        }
    }
}

impl fmt::Debug for ChunkedReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedReader")
            .field("descriptor", &self.descriptor)
            .field("fields", &self.fields)
            .field("chunk_size", &self.chunk_size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::geometry::parse_wkt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// In-memory source of points `(i, i)` with id `i`.
    struct GridSource {
        rows: Vec<Vec<Value>>,
        fields: Vec<String>,
        position: usize,
        /// Mimic drivers that restart after reporting the end once.
        restarts_after_end: bool,
        ended: bool,
        released: Option<Arc<AtomicBool>>,
        calls_after_end: Arc<AtomicUsize>,
    }

    impl GridSource {
        fn new(n: i64) -> Self {
            let rows = (0..n)
                .map(|i| {
                    vec![
                        Value::Int(i),
                        Value::Geometry(Geometry::Point((i as f64, i as f64).into())),
                    ]
                })
                .collect();
            Self {
                rows,
                fields: vec!["id".to_string(), GEOMETRY_FIELD.to_string()],
                position: 0,
                restarts_after_end: false,
                ended: false,
                released: None,
                calls_after_end: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Drop for GridSource {
        fn drop(&mut self) {
            if let Some(flag) = &self.released {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }

    impl FormatReader for GridSource {
        fn fields(&self) -> &[String] {
            &self.fields
        }

        fn total(&self) -> Option<u64> {
            Some(self.rows.len() as u64)
        }

        fn rewind(&mut self) -> Result<()> {
            self.position = 0;
            self.ended = false;
            Ok(())
        }

        fn next_record(&mut self) -> Result<Option<Vec<Value>>> {
            if self.ended {
                self.calls_after_end.fetch_add(1, Ordering::SeqCst);
                if self.restarts_after_end {
                    self.position = 0;
                    self.ended = false;
                }
            }
            match self.rows.get(self.position) {
                Some(row) => {
                    self.position += 1;
                    Ok(Some(row.clone()))
                }
                None => {
                    self.ended = true;
                    Ok(None)
                }
            }
        }
    }

    fn ids(reader: ChunkedReader) -> Vec<i64> {
        reader
            .map(|b| b.unwrap())
            .flat_map(|b| b.column("id").filter_map(Value::as_i64).collect::<Vec<_>>())
            .collect()
    }

    fn square(min: f64, max: f64) -> Geometry<f64> {
        parse_wkt(&format!(
            "POLYGON(({min} {min}, {max} {min}, {max} {max}, {min} {max}, {min} {min}))"
        ))
        .unwrap()
    }

    #[test]
    fn test_batch_count_and_sizes() {
        for (records, chunk) in [(10, 3), (9, 3), (1, 5), (0, 4)] {
            let reader = ChunkedReader::from_reader(
                Box::new(GridSource::new(records)),
                "grid",
                ReaderOptions::default().with_chunk_size(chunk),
            );
            let sizes: Vec<usize> = reader.map(|b| b.unwrap().len()).collect();
            let expected = (records as usize).div_ceil(chunk);
            assert_eq!(sizes.len(), expected, "R={} C={}", records, chunk);
            assert_eq!(sizes.iter().sum::<usize>(), records as usize);
            assert!(sizes.iter().all(|s| *s <= chunk));
        }
    }

    #[test]
    fn test_metadata_available_before_iteration() {
        let reader = ChunkedReader::from_reader(Box::new(GridSource::new(7)), "grid", ReaderOptions::default());
        assert_eq!(reader.fields(), &["id", "geometry"]);
        assert_eq!(reader.total(), Some(7));
        assert!(!reader.is_closed());
    }

    #[test]
    fn test_single_filter() {
        let reader = ChunkedReader::from_reader(
            Box::new(GridSource::new(10)),
            "grid",
            ReaderOptions::default().with_filter(square(2.5, 5.5)),
        );
        assert_eq!(ids(reader), vec![3, 4, 5]);
    }

    #[test]
    fn test_disjoint_filters_yield_each_record_once() {
        let reader = ChunkedReader::from_reader(
            Box::new(GridSource::new(10)),
            "grid",
            ReaderOptions::default()
                .with_chunk_size(2)
                .with_filter(vec![square(-0.5, 2.5), square(6.5, 8.5)]),
        );
        assert_eq!(ids(reader), vec![0, 1, 2, 7, 8]);
    }

    #[test]
    fn test_overlapping_filters_duplicate_records() {
        let reader = ChunkedReader::from_reader(
            Box::new(GridSource::new(10)),
            "grid",
            ReaderOptions::default().with_filter(vec![square(0.5, 4.5), square(2.5, 6.5), square(3.5, 4.5)]),
        );
        // Record 4 matches all three filters, 3 matches the first two.
        assert_eq!(ids(reader), vec![1, 2, 3, 4, 3, 4, 5, 6, 4]);
    }

    #[test]
    fn test_batches_do_not_span_passes() {
        let reader = ChunkedReader::from_reader(
            Box::new(GridSource::new(10)),
            "grid",
            ReaderOptions::default()
                .with_chunk_size(4)
                .with_filter(vec![square(-0.5, 2.5), square(-0.5, 2.5)]),
        );
        let sizes: Vec<usize> = reader.map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![3, 3]);
    }

    #[test]
    fn test_empty_filter_collection() {
        let reader = ChunkedReader::from_reader(
            Box::new(GridSource::new(10)),
            "grid",
            ReaderOptions::default().with_filter(Vec::new()),
        );
        assert!(ids(reader).is_empty());
    }

    #[test]
    fn test_filter_from_stream() {
        let filters = ChunkedReader::from_reader(
            Box::new(GridSource::new(3)),
            "filters",
            ReaderOptions::default().with_chunk_size(1),
        );
        let reader = ChunkedReader::from_reader(
            Box::new(GridSource::new(5)),
            "grid",
            ReaderOptions {
                filter: GeometryFilter::from_reader(filters),
                ..ReaderOptions::default()
            },
        );
        assert_eq!(ids(reader), vec![0, 1, 2]);
    }

    #[test]
    fn test_stream_filter_error_surfaces() {
        let failing = std::iter::once(Err(Error::Pipeline("filter source broke".to_string())));
        let mut reader = ChunkedReader::from_reader(
            Box::new(GridSource::new(5)),
            "grid",
            ReaderOptions {
                filter: GeometryFilter::Stream(Box::new(failing)),
                ..ReaderOptions::default()
            },
        );
        assert!(reader.next().unwrap().is_err());
        assert!(reader.is_closed());
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_skip_leading_batches() {
        let reader = ChunkedReader::from_reader(
            Box::new(GridSource::new(10)),
            "grid",
            ReaderOptions::default().with_chunk_size(3).with_skip(2),
        );
        assert_eq!(ids(reader), vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_restarting_driver_does_not_loop() {
        let mut source = GridSource::new(4);
        source.restarts_after_end = true;
        let calls_after_end = source.calls_after_end.clone();

        let reader = ChunkedReader::from_reader(
            Box::new(source),
            "quirky",
            ReaderOptions::default().with_chunk_size(2),
        );
        assert_eq!(ids(reader), vec![0, 1, 2, 3]);
        assert_eq!(calls_after_end.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handle_released_when_exhausted() {
        let released = Arc::new(AtomicBool::new(false));
        let mut source = GridSource::new(3);
        source.released = Some(released.clone());

        let mut reader = ChunkedReader::from_reader(Box::new(source), "grid", ReaderOptions::default());
        assert!(reader.next().is_some());
        assert!(!released.load(Ordering::SeqCst));
        assert!(reader.next().is_none());
        assert!(released.load(Ordering::SeqCst));
        assert!(reader.is_closed());
    }

    #[test]
    fn test_explicit_close() {
        let released = Arc::new(AtomicBool::new(false));
        let mut source = GridSource::new(30);
        source.released = Some(released.clone());

        let mut reader = ChunkedReader::from_reader(
            Box::new(source),
            "grid",
            ReaderOptions::default().with_chunk_size(5),
        );
        assert!(reader.next().is_some());
        reader.close();
        assert!(released.load(Ordering::SeqCst));
        assert!(reader.next().is_none());
    }
}
