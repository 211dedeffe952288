use super::csv::CsvDriver;
use super::geojson::GeoJsonDriver;
use super::sqlite::SqliteDriver;
use super::{Descriptor, Driver, DriverOptions, FormatReader, FormatWriter};
use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Predicate deciding whether a binding handles a descriptor string.
#[derive(Clone)]
pub enum Matcher {
    /// Case-insensitive `.ext` suffix.
    Extension(String),
    /// Regular expression over the whole descriptor.
    Pattern(Regex),
}

impl Matcher {
    /// Compile a pattern matcher.
    pub fn pattern(pattern: &str) -> Result<Matcher> {
        Regex::new(pattern)
            .map(Matcher::Pattern)
            .map_err(|e| Error::Config(format!("invalid driver pattern '{}': {}", pattern, e)))
    }

    pub fn matches(&self, descriptor: &str) -> bool {
        match self {
            Matcher::Extension(ext) => {
                let suffix = format!(".{}", ext.to_ascii_lowercase());
                descriptor.to_ascii_lowercase().ends_with(&suffix)
            }
            Matcher::Pattern(re) => re.is_match(descriptor),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Extension(ext) => write!(f, "Extension({})", ext),
            Matcher::Pattern(re) => write!(f, "Pattern({})", re.as_str()),
        }
    }
}

/// Immutable association of a matcher with a driver.
#[derive(Clone)]
pub struct DriverBinding {
    pub name: String,
    pub matcher: Matcher,
    driver: Arc<dyn Driver>,
}

impl DriverBinding {
    pub fn new(name: impl Into<String>, matcher: Matcher, driver: Arc<dyn Driver>) -> Self {
        Self {
            name: name.into(),
            matcher,
            driver,
        }
    }

    pub fn can_open(&self, descriptor: &str) -> bool {
        self.matcher.matches(descriptor)
    }

    pub fn open_reader(&self, descriptor: &Descriptor, options: &DriverOptions) -> Result<Box<dyn FormatReader>> {
        self.driver.open_reader(descriptor, options)
    }

    pub fn open_writer(&self, descriptor: &Descriptor, options: &DriverOptions) -> Result<Box<dyn FormatWriter>> {
        self.driver.open_writer(descriptor, options)
    }
}

impl fmt::Debug for DriverBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverBinding")
            .field("name", &self.name)
            .field("matcher", &self.matcher)
            .field("driver", &self.driver.name())
            .finish()
    }
}

/// Ordered list of driver bindings. First match wins.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    bindings: Vec<DriverBinding>,
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self { bindings: Vec::new() }
    }

    /// Registry with the built-in drivers: sqlite, csv, tsv, geojson.
    pub fn with_defaults() -> Result<Self> {
        Ok(Self::new()
            .register(DriverBinding::new(
                "sqlite",
                Matcher::pattern(r"(?i)^.*\.(sqlite|db)(:.*|)$")?,
                Arc::new(SqliteDriver),
            ))
            .register(DriverBinding::new(
                "csv",
                Matcher::Extension("csv".to_string()),
                Arc::new(CsvDriver::comma()),
            ))
            .register(DriverBinding::new(
                "tsv",
                Matcher::Extension("tsv".to_string()),
                Arc::new(CsvDriver::tab()),
            ))
            .register(DriverBinding::new(
                "geojson",
                Matcher::Extension("geojson".to_string()),
                Arc::new(GeoJsonDriver),
            )))
    }

    /// Append a binding with the lowest priority so far.
    pub fn register(mut self, binding: DriverBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn bindings(&self) -> &[DriverBinding] {
        &self.bindings
    }

    /// Find the first binding whose matcher accepts `descriptor`.
    pub fn select(&self, descriptor: &str) -> Result<&DriverBinding> {
        let binding = self
            .bindings
            .iter()
            .find(|b| b.can_open(descriptor))
            .ok_or_else(|| Error::NoDriverFound {
                descriptor: descriptor.to_string(),
            })?;
        debug!("Selected driver '{}' for {}", binding.name, descriptor);
        Ok(binding)
    }
}

/// Pick the layer to open from a multi-layer source.
///
/// Explicit layer, else the only layer, else the file stem when present,
/// else `AmbiguousLayer` listing what is available.
pub fn resolve_layer(descriptor: &Descriptor, available: &[String]) -> Result<String> {
    if let Some(layer) = descriptor.layer() {
        return Ok(layer.to_string());
    }
    if let [only] = available {
        return Ok(only.clone());
    }
    if let Some(stem) = descriptor.stem() {
        if available.iter().any(|l| l == stem) {
            return Ok(stem.to_string());
        }
    }
    Err(Error::AmbiguousLayer {
        descriptor: descriptor.as_str().to_string(),
        available: available.to_vec(),
    })
}
