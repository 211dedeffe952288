//! GeoJSON FeatureCollection driver.
//!
//! The reader loads the whole document; properties become fields in first-seen
//! order with `geometry` last. The writer streams features as they arrive.

use super::{Descriptor, Driver, DriverOptions, FormatReader, FormatWriter};
use crate::batch::{Batch, Schema, Value, GEOMETRY_FIELD};
use crate::error::{Error, Result};
use crate::geometry;
use serde_json::{json, Map, Value as JsonValue};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct GeoJsonDriver;

impl Driver for GeoJsonDriver {
    fn name(&self) -> &'static str {
        "geojson"
    }

    fn open_reader(&self, descriptor: &Descriptor, _options: &DriverOptions) -> Result<Box<dyn FormatReader>> {
        Ok(Box::new(GeoJsonReader::open(descriptor)?))
    }

    fn open_writer(&self, descriptor: &Descriptor, _options: &DriverOptions) -> Result<Box<dyn FormatWriter>> {
        Ok(Box::new(GeoJsonWriter {
            path: descriptor.path().to_path_buf(),
            fields: Vec::new(),
            out: None,
            written: 0,
        }))
    }
}

fn json_to_value(v: &JsonValue) -> Value {
    match v {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .or_else(|| n.as_f64().map(Value::Float))
            .unwrap_or(Value::Null),
        JsonValue::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

fn value_to_json(v: &Value) -> JsonValue {
    match v {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Int(i) => json!(i),
        Value::Float(f) => serde_json::Number::from_f64(*f).map_or(JsonValue::Null, JsonValue::Number),
        Value::Text(s) => JsonValue::String(s.clone()),
        Value::Geometry(g) => geometry::to_geojson(g),
    }
}

pub struct GeoJsonReader {
    fields: Vec<String>,
    crs: Option<String>,
    features: Vec<JsonValue>,
    position: usize,
    descriptor: String,
}

impl GeoJsonReader {
    fn open(descriptor: &Descriptor) -> Result<Self> {
        descriptor.require_exists()?;
        let text = fs::read_to_string(descriptor.path())?;
        let mut doc: JsonValue = serde_json::from_str(&text)?;

        let malformed = |reason: &str| Error::MalformedRecord {
            descriptor: descriptor.as_str().to_string(),
            index: 0,
            reason: reason.to_string(),
        };
        if doc.get("type").and_then(JsonValue::as_str) != Some("FeatureCollection") {
            return Err(malformed("document is not a FeatureCollection"));
        }

        let crs = doc
            .pointer("/crs/properties/name")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        let features = match doc.get_mut("features").map(JsonValue::take) {
            Some(JsonValue::Array(features)) => features,
            _ => return Err(malformed("FeatureCollection without a features array")),
        };

        let mut fields: Vec<String> = Vec::new();
        for feature in &features {
            if let Some(props) = feature.get("properties").and_then(JsonValue::as_object) {
                for key in props.keys() {
                    if key != GEOMETRY_FIELD && !fields.contains(key) {
                        fields.push(key.clone());
                    }
                }
            }
        }
        fields.push(GEOMETRY_FIELD.to_string());
        debug!("Opened {} ({} features)", descriptor, features.len());

        Ok(Self {
            fields,
            crs,
            features,
            position: 0,
            descriptor: descriptor.as_str().to_string(),
        })
    }
}

impl FormatReader for GeoJsonReader {
    fn fields(&self) -> &[String] {
        &self.fields
    }

    fn crs(&self) -> Option<&str> {
        self.crs.as_deref()
    }

    fn total(&self) -> Option<u64> {
        Some(self.features.len() as u64)
    }

    fn rewind(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Vec<Value>>> {
        let Some(feature) = self.features.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;

        let props = feature.get("properties").and_then(JsonValue::as_object);
        let last = self.fields.len() - 1;
        let mut row: Vec<Value> = self.fields[..last]
            .iter()
            .map(|name| props.and_then(|p| p.get(name)).map_or(Value::Null, json_to_value))
            .collect();

        let geom = match feature.get("geometry").map(geometry::from_geojson) {
            Some(Ok(Some(g))) => Value::Geometry(g),
            Some(Err(reason)) => {
                warn!(
                    "{}",
                    Error::MalformedRecord {
                        descriptor: self.descriptor.clone(),
                        index: self.position as u64,
                        reason,
                    }
                );
                Value::Null
            }
            _ => Value::Null,
        };
        row.push(geom);
        Ok(Some(row))
    }
}

pub struct GeoJsonWriter {
    path: PathBuf,
    fields: Vec<String>,
    out: Option<BufWriter<File>>,
    written: u64,
}

impl FormatWriter for GeoJsonWriter {
    fn init(&mut self, schema: &Schema, crs: Option<&str>) -> Result<()> {
        self.fields = schema.field_names();
        let mut out = BufWriter::new(File::create(&self.path)?);
        out.write_all(b"{\"type\":\"FeatureCollection\",")?;
        if let Some(crs) = crs {
            let member = json!({"type": "name", "properties": {"name": crs}});
            write!(out, "\"crs\":{},", member)?;
        }
        out.write_all(b"\"features\":[\n")?;
        self.out = Some(out);
        self.written = 0;
        Ok(())
    }

    fn write_rows(&mut self, batch: &Batch) -> Result<()> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| Error::Pipeline("GeoJSON writer used before init".to_string()))?;

        for row in batch.rows() {
            let mut properties = Map::new();
            let mut geom = JsonValue::Null;
            for (name, value) in self.fields.iter().zip(row) {
                if name == GEOMETRY_FIELD {
                    geom = value_to_json(value);
                } else {
                    properties.insert(name.clone(), value_to_json(value));
                }
            }
            let feature = json!({"type": "Feature", "properties": properties, "geometry": geom});
            if self.written > 0 {
                out.write_all(b",\n")?;
            }
            serde_json::to_writer(&mut *out, &feature)?;
            self.written += 1;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut out) = self.out.take() {
            out.write_all(b"\n]}\n")?;
            out.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_feature_collection() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.geojson");
        fs::write(
            &path,
            r#"{
                "type": "FeatureCollection",
                "crs": {"type": "name", "properties": {"name": "EPSG:4326"}},
                "features": [
                    {"type": "Feature", "properties": {"id": 1, "name": "a"},
                     "geometry": {"type": "Point", "coordinates": [1.5, 2.5]}},
                    {"type": "Feature", "properties": {"id": 2, "extra": true},
                     "geometry": null}
                ]
            }"#,
        )
        .unwrap();

        let d = Descriptor::parse(path.to_str().unwrap()).unwrap();
        let mut reader = GeoJsonDriver.open_reader(&d, &DriverOptions::default()).unwrap();
        assert_eq!(reader.fields(), &["id", "name", "extra", "geometry"]);
        assert_eq!(reader.crs(), Some("EPSG:4326"));
        assert_eq!(reader.total(), Some(2));

        let first = reader.next_record().unwrap().unwrap();
        assert_eq!(first[0], Value::Int(1));
        assert_eq!(first[2], Value::Null);
        assert!(first[3].as_geometry().is_some());

        let second = reader.next_record().unwrap().unwrap();
        assert_eq!(second[2], Value::Bool(true));
        assert_eq!(second[3], Value::Null);
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_rejects_non_collection() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b.geojson");
        fs::write(&path, r#"{"type": "Feature"}"#).unwrap();

        let d = Descriptor::parse(path.to_str().unwrap()).unwrap();
        let err = GeoJsonDriver
            .open_reader(&d, &DriverOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::MalformedRecord { .. }));
    }

    #[test]
    fn test_empty_writer_is_valid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.geojson");

        let d = Descriptor::parse(path.to_str().unwrap()).unwrap();
        let mut writer = GeoJsonDriver.open_writer(&d, &DriverOptions::default()).unwrap();
        writer.init(&Schema::empty(), Some("EPSG:3857")).unwrap();
        writer.finish().unwrap();

        let doc: JsonValue = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["features"].as_array().unwrap().len(), 0);
        assert_eq!(doc["crs"]["properties"]["name"], "EPSG:3857");
    }
}
