//! Delimited text driver (`.csv`, `.tsv`).
//!
//! Cells are inferred as integer, float, text or null. A `geometry` or `WKT`
//! column is parsed as WKT and exposed as `geometry`; unparsable WKT is logged
//! and read as null. The reported total is exact for short files and
//! extrapolated from a leading sample otherwise.

use super::{Descriptor, Driver, DriverOptions, FormatReader, FormatWriter};
use crate::batch::{Batch, Schema, Value, GEOMETRY_FIELD};
use crate::error::{Error, Result};
use crate::geometry;
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct CsvDriver {
    delimiter: u8,
}

impl CsvDriver {
    pub fn comma() -> Self {
        Self { delimiter: b',' }
    }

    pub fn tab() -> Self {
        Self { delimiter: b'\t' }
    }
}

impl Driver for CsvDriver {
    fn name(&self) -> &'static str {
        if self.delimiter == b'\t' {
            "tsv"
        } else {
            "csv"
        }
    }

    fn open_reader(&self, descriptor: &Descriptor, options: &DriverOptions) -> Result<Box<dyn FormatReader>> {
        let delimiter = options.delimiter.unwrap_or(self.delimiter);
        Ok(Box::new(CsvReader::open(descriptor, delimiter)?))
    }

    fn open_writer(&self, descriptor: &Descriptor, options: &DriverOptions) -> Result<Box<dyn FormatWriter>> {
        Ok(Box::new(CsvWriter {
            path: descriptor.path().to_path_buf(),
            delimiter: options.delimiter.unwrap_or(self.delimiter),
            inner: None,
        }))
    }
}

/// Rows read when opening a file to estimate its length.
const COUNT_SAMPLE_ROWS: u64 = 1000;

fn is_geometry_header(name: &str) -> bool {
    name == GEOMETRY_FIELD || name.eq_ignore_ascii_case("wkt")
}

pub struct CsvReader {
    descriptor: String,
    path: PathBuf,
    delimiter: u8,
    fields: Vec<String>,
    geometry_index: Option<usize>,
    total: u64,
    reader: csv::Reader<File>,
    record: StringRecord,
    position: u64,
}

impl CsvReader {
    fn open(descriptor: &Descriptor, delimiter: u8) -> Result<Self> {
        descriptor.require_exists()?;
        let path = descriptor.path().to_path_buf();

        let mut reader = Self::open_inner(&path, delimiter)?;
        let headers = reader.headers()?.clone();
        let geometry_index = headers.iter().position(is_geometry_header);
        let fields = headers
            .iter()
            .enumerate()
            .map(|(i, h)| {
                if Some(i) == geometry_index {
                    GEOMETRY_FIELD.to_string()
                } else {
                    h.to_string()
                }
            })
            .collect();

        let total = Self::estimate_rows(&path, delimiter)?;
        debug!("Opened {} (~{} rows)", descriptor, total);

        Ok(Self {
            descriptor: descriptor.as_str().to_string(),
            path,
            delimiter,
            fields,
            geometry_index,
            total,
            reader,
            record: StringRecord::new(),
            position: 0,
        })
    }

    /// Count up to `COUNT_SAMPLE_ROWS` rows and extrapolate the rest from the
    /// file size. Exact for files no longer than the sample.
    fn estimate_rows(path: &PathBuf, delimiter: u8) -> Result<u64> {
        let mut counter = Self::open_inner(path, delimiter)?;
        counter.headers()?;
        let start = counter.position().byte();

        let mut record = StringRecord::new();
        let mut sampled = 0u64;
        while sampled < COUNT_SAMPLE_ROWS {
            if !counter.read_record(&mut record)? {
                return Ok(sampled);
            }
            sampled += 1;
        }

        let consumed = counter.position().byte();
        let remaining = std::fs::metadata(path)?.len().saturating_sub(consumed);
        let per_row = (consumed - start) as f64 / sampled as f64;
        Ok(sampled + (remaining as f64 / per_row).round() as u64)
    }

    fn open_inner(path: &PathBuf, delimiter: u8) -> Result<csv::Reader<File>> {
        Ok(ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .from_path(path)?)
    }
}

impl FormatReader for CsvReader {
    fn fields(&self) -> &[String] {
        &self.fields
    }

    fn total(&self) -> Option<u64> {
        Some(self.total)
    }

    fn rewind(&mut self) -> Result<()> {
        self.reader = Self::open_inner(&self.path, self.delimiter)?;
        self.position = 0;
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Vec<Value>>> {
        if !self.reader.read_record(&mut self.record)? {
            return Ok(None);
        }
        self.position += 1;

        let mut row = Vec::with_capacity(self.fields.len());
        for i in 0..self.fields.len() {
            let cell = self.record.get(i).unwrap_or("");
            let value = if Some(i) == self.geometry_index {
                if cell.trim().is_empty() {
                    Value::Null
                } else {
                    match geometry::parse_wkt(cell) {
                        Ok(g) => Value::Geometry(g),
                        Err(reason) => {
                            let err = Error::MalformedRecord {
                                descriptor: self.descriptor.clone(),
                                index: self.position,
                                reason,
                            };
                            warn!("{}", err);
                            Value::Null
                        }
                    }
                }
            } else {
                Value::infer(cell)
            };
            row.push(value);
        }
        Ok(Some(row))
    }
}

pub struct CsvWriter {
    path: PathBuf,
    delimiter: u8,
    inner: Option<csv::Writer<BufWriter<File>>>,
}

impl FormatWriter for CsvWriter {
    fn init(&mut self, schema: &Schema, _crs: Option<&str>) -> Result<()> {
        let mut header = schema.field_names();
        if header.is_empty() && schema.has_geometry() {
            header.push(GEOMETRY_FIELD.to_string());
        }

        let file = File::create(&self.path)?;
        let mut writer = WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_writer(BufWriter::new(file));
        writer.write_record(&header)?;
        self.inner = Some(writer);
        Ok(())
    }

    fn write_rows(&mut self, batch: &Batch) -> Result<()> {
        let writer = self
            .inner
            .as_mut()
            .ok_or_else(|| Error::Pipeline("CSV writer used before init".to_string()))?;
        for row in batch.rows() {
            writer.write_record(row.iter().map(|v| v.to_string()))?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.inner.take() {
            writer.flush()?;
        }
        Ok(())
    }
}
