//! Chunked writing with lazy sink initialisation.

use crate::batch::{normalize_multitypes, Batch, Schema};
use crate::drivers::{Descriptor, DriverOptions, DriverRegistry, FormatWriter};
use crate::error::{Error, Result};
use std::fmt;
use tracing::{debug, info, warn};

/// Appends batches to a sink.
///
/// The sink is created from the schema of the first non-empty batch. Later
/// batches are projected onto those fields. Closing a writer that never saw
/// data still creates an empty target.
pub struct ChunkedWriter {
    descriptor: String,
    inner: Option<Box<dyn FormatWriter>>,
    fields: Option<Vec<String>>,
    batches: u64,
    records: u64,
}

impl ChunkedWriter {
    /// Select a driver for `descriptor` and open a writer.
    pub fn open(registry: &DriverRegistry, descriptor: &str, options: &DriverOptions) -> Result<Self> {
        let parsed = Descriptor::parse(descriptor)?;
        let binding = registry.select(descriptor)?;
        let inner = binding.open_writer(&parsed, options)?;
        Ok(Self::from_writer(inner, descriptor))
    }

    pub fn from_writer(inner: Box<dyn FormatWriter>, descriptor: impl Into<String>) -> Self {
        Self {
            descriptor: descriptor.into(),
            inner: Some(inner),
            fields: None,
            batches: 0,
            records: 0,
        }
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Fields the sink was initialised with, once it has been.
    pub fn fields(&self) -> Option<&[String]> {
        self.fields.as_deref()
    }

    pub fn batches_written(&self) -> u64 {
        self.batches
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Append a batch. Empty batches are ignored.
    pub fn write(&mut self, batch: Batch) -> Result<()> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| Error::Pipeline(format!("write to closed writer {}", self.descriptor)))?;
        if batch.is_empty() {
            return Ok(());
        }

        let batch = normalize_multitypes(batch);
        if self.fields.is_none() {
            let schema = batch.schema();
            inner.init(&schema, batch.crs())?;
            debug!("Initialised {} with fields {:?}", self.descriptor, schema.field_names());
            self.fields = Some(schema.field_names());
        }
        let fields = self.fields.as_deref().unwrap_or_default();

        let len = batch.len() as u64;
        if batch.fields() == fields {
            inner.write_rows(&batch)?;
        } else {
            inner.write_rows(&batch.project(fields))?;
        }
        self.batches += 1;
        self.records += len;
        Ok(())
    }

    /// Finish the sink, initialising it empty if nothing was written.
    ///
    /// An empty sink is initialised with [`Schema::empty`], which has no
    /// fields and a point geometry. CSV and SQLite targets therefore end up
    /// with a single `geometry` column.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut inner) = self.inner.take() else {
            return Ok(());
        };
        if self.fields.is_none() {
            let schema = Schema::empty();
            inner.init(&schema, None)?;
            self.fields = Some(schema.field_names());
        }
        inner.finish()?;
        info!(
            "Wrote {} records in {} batches to {}",
            self.records, self.batches, self.descriptor
        );
        Ok(())
    }
}

impl Drop for ChunkedWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close {}: {}", self.descriptor, e);
        }
    }
}

impl fmt::Debug for ChunkedWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedWriter")
            .field("descriptor", &self.descriptor)
            .field("fields", &self.fields)
            .field("records", &self.records)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Value, GEOMETRY_FIELD};
    use crate::geometry::{parse_wkt, GeometryKind};
    use crate::io::{ChunkedReader, ReaderOptions};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorded {
        inits: Vec<Schema>,
        rows: Vec<Batch>,
        finished: bool,
    }

    struct RecordingSink(Arc<Mutex<Recorded>>);

    impl FormatWriter for RecordingSink {
        fn init(&mut self, schema: &Schema, _crs: Option<&str>) -> Result<()> {
            self.0.lock().unwrap().inits.push(schema.clone());
            Ok(())
        }

        fn write_rows(&mut self, batch: &Batch) -> Result<()> {
            self.0.lock().unwrap().rows.push(batch.clone());
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.0.lock().unwrap().finished = true;
            Ok(())
        }
    }

    fn recording() -> (ChunkedWriter, Arc<Mutex<Recorded>>) {
        let state = Arc::new(Mutex::new(Recorded::default()));
        let writer = ChunkedWriter::from_writer(Box::new(RecordingSink(state.clone())), "memory");
        (writer, state)
    }

    #[test]
    fn test_lazy_init_on_first_non_empty_batch() {
        let (mut writer, state) = recording();
        writer.write(Batch::new(["a"])).unwrap();
        assert!(state.lock().unwrap().inits.is_empty());

        writer
            .write(Batch::from_rows(["a", "b"], vec![vec![Value::Int(1), Value::Int(2)]]))
            .unwrap();
        writer
            .write(Batch::from_rows(["b"], vec![vec![Value::Int(3)]]))
            .unwrap();
        writer.close().unwrap();

        let state = state.lock().unwrap();
        assert_eq!(state.inits.len(), 1);
        assert_eq!(state.rows[1].fields(), &["a", "b"]);
        assert_eq!(state.rows[1].rows()[0], vec![Value::Null, Value::Int(3)]);
        assert!(state.finished);
    }

    #[test]
    fn test_extra_fields_are_dropped() {
        let (mut writer, state) = recording();
        writer
            .write(Batch::from_rows(["a"], vec![vec![Value::Int(1)]]))
            .unwrap();
        writer
            .write(Batch::from_rows(["a", "extra"], vec![vec![Value::Int(2), Value::from("x")]]))
            .unwrap();
        writer.close().unwrap();

        let state = state.lock().unwrap();
        assert_eq!(state.rows[1].fields(), &["a"]);
        assert_eq!(state.rows[1].rows()[0], vec![Value::Int(2)]);
        assert_eq!(writer.records_written(), 2);
    }

    #[test]
    fn test_close_without_data_initialises_empty_sink() {
        let (mut writer, state) = recording();
        writer.close().unwrap();
        writer.close().unwrap();

        let state = state.lock().unwrap();
        assert_eq!(state.inits, vec![Schema::empty()]);
        assert!(state.finished);
        assert!(writer.write(Batch::new(["a"])).is_err());
    }

    #[test]
    fn test_drop_closes_sink() {
        let (writer, state) = recording();
        drop(writer);
        assert!(state.lock().unwrap().finished);
    }

    #[test]
    fn test_mixed_geometry_types_are_promoted() {
        let (mut writer, state) = recording();
        writer
            .write(Batch::from_rows(
                [GEOMETRY_FIELD],
                vec![
                    vec![Value::Geometry(parse_wkt("POLYGON((0 0, 1 0, 1 1, 0 0))").unwrap())],
                    vec![Value::Geometry(
                        parse_wkt("MULTIPOLYGON(((2 2, 3 2, 3 3, 2 2)))").unwrap(),
                    )],
                ],
            ))
            .unwrap();
        writer.close().unwrap();
        assert_eq!(state.lock().unwrap().inits[0].geometry, Some(GeometryKind::MultiPolygon));
    }

    #[test]
    fn test_empty_csv_target_exists_after_close() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("empty.csv");
        let registry = DriverRegistry::with_defaults().unwrap();

        let mut writer =
            ChunkedWriter::open(&registry, target.to_str().unwrap(), &DriverOptions::default()).unwrap();
        writer.close().unwrap();

        assert!(target.exists());
        let reader = ChunkedReader::open(&registry, target.to_str().unwrap(), ReaderOptions::default()).unwrap();
        assert_eq!(reader.fields(), &[GEOMETRY_FIELD]);
        assert_eq!(reader.count(), 0);
    }

    #[test]
    fn test_overwrites_existing_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.csv");
        std::fs::write(&target, "old,header\n1,2\n3,4\n").unwrap();
        let registry = DriverRegistry::with_defaults().unwrap();

        let mut writer =
            ChunkedWriter::open(&registry, target.to_str().unwrap(), &DriverOptions::default()).unwrap();
        writer
            .write(Batch::from_rows(["id"], vec![vec![Value::Int(7)]]))
            .unwrap();
        writer.close().unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "id\n7\n");
    }
}
