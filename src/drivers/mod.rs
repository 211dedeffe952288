//! Format drivers and the registry that selects them.
//!
//! A driver turns a [`Descriptor`] into a [`FormatReader`] (record-at-a-time,
//! rewindable) or a [`FormatWriter`] (schema-initialised sink). Batching,
//! filtering and lazy sink initialisation live in [`crate::io`], not here.

pub mod csv;
pub mod geojson;
mod registry;
pub mod sqlite;

pub use registry::{resolve_layer, DriverBinding, DriverRegistry, Matcher};

use crate::batch::{Batch, Schema, Value};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Record-level access to a source.
pub trait FormatReader: Send {
    /// Field names, known before the first record is read.
    fn fields(&self) -> &[String];

    /// Spatial reference of the source, if declared.
    fn crs(&self) -> Option<&str> {
        None
    }

    /// Estimated number of records.
    fn total(&self) -> Option<u64> {
        None
    }

    /// Restart from the first record.
    fn rewind(&mut self) -> Result<()>;

    /// Next record, aligned with [`FormatReader::fields`]. `None` once exhausted.
    fn next_record(&mut self) -> Result<Option<Vec<Value>>>;
}

/// Sink for batches of a fixed schema.
pub trait FormatWriter: Send {
    /// Create or clear the target and prepare it for `schema`.
    fn init(&mut self, schema: &Schema, crs: Option<&str>) -> Result<()>;

    /// Append rows already projected onto the initialised fields.
    fn write_rows(&mut self, batch: &Batch) -> Result<()>;

    /// Flush and release the target.
    fn finish(&mut self) -> Result<()>;
}

/// A format implementation.
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    fn open_reader(&self, descriptor: &Descriptor, options: &DriverOptions) -> Result<Box<dyn FormatReader>>;

    fn open_writer(&self, descriptor: &Descriptor, options: &DriverOptions) -> Result<Box<dyn FormatWriter>>;
}

/// Format-specific options passed to driver constructors.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Records fetched per round trip by paged drivers.
    pub page_size: usize,
    /// Field delimiter override for delimited text formats.
    pub delimiter: Option<u8>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            page_size: 10_000,
            delimiter: None,
        }
    }
}

/// A parsed source or target string: `dir/name.ext` or `dir/name.ext:layer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    raw: String,
    path: PathBuf,
    layer: Option<String>,
}

impl Descriptor {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidDescriptor {
            descriptor: raw.to_string(),
            reason: reason.to_string(),
        };
        if raw.trim().is_empty() {
            return Err(invalid("empty descriptor"));
        }

        // A layer suffix only counts when the part before it names a file with an extension.
        let (path, layer) = match raw.rsplit_once(':') {
            Some((path, layer))
                if !layer.contains(&['/', '\\'][..]) && Path::new(path).extension().is_some() =>
            {
                if layer.is_empty() {
                    return Err(invalid("empty layer name after ':'"));
                }
                (path, Some(layer.to_string()))
            }
            _ => (raw, None),
        };

        Ok(Self {
            raw: raw.to_string(),
            path: PathBuf::from(path),
            layer,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layer(&self) -> Option<&str> {
        self.layer.as_deref()
    }

    /// File name without extension.
    pub fn stem(&self) -> Option<&str> {
        self.path.file_stem().and_then(|s| s.to_str())
    }

    /// Lower-cased extension.
    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .and_then(|s| s.to_str())
            .map(str::to_ascii_lowercase)
    }

    /// Fail with `SourceNotFound` when the backing file is missing.
    pub fn require_exists(&self) -> Result<()> {
        if self.path.exists() {
            Ok(())
        } else {
            Err(Error::SourceNotFound {
                descriptor: self.raw.clone(),
            })
        }
    }
}

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_path() {
        let d = Descriptor::parse("data/roads.csv").unwrap();
        assert_eq!(d.path(), Path::new("data/roads.csv"));
        assert_eq!(d.layer(), None);
        assert_eq!(d.stem(), Some("roads"));
        assert_eq!(d.extension().as_deref(), Some("csv"));
    }

    #[test]
    fn test_parse_layer() {
        let d = Descriptor::parse("/tmp/city.SQLITE:parcels").unwrap();
        assert_eq!(d.path(), Path::new("/tmp/city.SQLITE"));
        assert_eq!(d.layer(), Some("parcels"));
        assert_eq!(d.extension().as_deref(), Some("sqlite"));
        assert_eq!(d.to_string(), "/tmp/city.SQLITE:parcels");
    }

    #[test]
    fn test_colon_in_directory_is_not_a_layer() {
        let d = Descriptor::parse("host:dir/file.csv").unwrap();
        assert_eq!(d.layer(), None);
        assert_eq!(d.path(), Path::new("host:dir/file.csv"));
    }

    #[test]
    fn test_invalid_descriptors() {
        assert!(matches!(Descriptor::parse("  "), Err(Error::InvalidDescriptor { .. })));
        assert!(matches!(Descriptor::parse("a.sqlite:"), Err(Error::InvalidDescriptor { .. })));
    }

    #[test]
    fn test_require_exists() {
        let d = Descriptor::parse("/definitely/not/here.csv").unwrap();
        assert!(matches!(d.require_exists(), Err(Error::SourceNotFound { .. })));
    }
}
