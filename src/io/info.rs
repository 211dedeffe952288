//! Dataset summaries.

use crate::batch::{Batch, Value};
use crate::drivers::{Descriptor, DriverOptions, DriverRegistry};
use crate::error::Result;
use crate::pipeline::{parallel_map, PoolOptions};
use serde::Serialize;
use std::time::UNIX_EPOCH;

/// What can be learnt about a source without reading its records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetInfo {
    pub descriptor: String,
    pub driver: String,
    pub fields: Vec<String>,
    pub crs: Option<String>,
    /// Estimated record count, when the driver can tell.
    pub rows: Option<u64>,
    pub size_bytes: u64,
    /// Last modification, seconds since the Unix epoch.
    pub modified: Option<u64>,
}

impl DatasetInfo {
    pub fn gather(registry: &DriverRegistry, descriptor: &str) -> Result<Self> {
        let parsed = Descriptor::parse(descriptor)?;
        parsed.require_exists()?;
        let binding = registry.select(descriptor)?;
        let reader = binding.open_reader(&parsed, &DriverOptions::default())?;

        let metadata = std::fs::metadata(parsed.path())?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());

        Ok(Self {
            descriptor: descriptor.to_string(),
            driver: binding.name.clone(),
            fields: reader.fields().to_vec(),
            crs: reader.crs().map(str::to_string),
            rows: reader.total(),
            size_bytes: metadata.len(),
            modified,
        })
    }

    const FIELDS: [&'static str; 7] = ["descriptor", "driver", "fields", "crs", "rows", "size_bytes", "modified"];

    fn to_row(&self) -> Vec<Value> {
        vec![
            Value::from(self.descriptor.as_str()),
            Value::from(self.driver.as_str()),
            Value::from(self.fields.join(",")),
            Value::from(self.crs.clone()),
            Value::from(self.rows.map(|r| r as i64)),
            Value::Int(self.size_bytes as i64),
            Value::from(self.modified.map(|m| m as i64)),
        ]
    }
}

/// Gather info for several sources on the pool. Failed sources are `None`
/// when the pool ignores errors.
pub fn dataset_info(
    registry: &DriverRegistry,
    descriptors: &[String],
    options: &PoolOptions,
) -> Result<Vec<Option<DatasetInfo>>> {
    parallel_map(
        descriptors.to_vec(),
        |descriptor| Ok(DatasetInfo::gather(registry, &descriptor)?),
        options,
    )
}

/// One row per gathered source; missing entries are skipped.
pub fn info_batch(infos: &[Option<DatasetInfo>]) -> Batch {
    Batch::from_rows(
        DatasetInfo::FIELDS,
        infos.iter().flatten().map(DatasetInfo::to_row),
    )
}
