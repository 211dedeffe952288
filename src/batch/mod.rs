//! Record batches: the unit of data moved through readers, the engine and writers.
//!
//! A [`Batch`] is row-major. All rows share the batch's field list; rows that
//! are pushed with the wrong arity are padded with [`Value::Null`] or truncated.

mod schema;

pub use schema::{Field, FieldKind, Schema};

use crate::geometry::{self, GeometryKind};
use geo_types::{Geometry, Point};
use std::collections::HashSet;
use std::fmt;
use tracing::warn;

/// Name of the column holding record geometries.
pub const GEOMETRY_FIELD: &str = "geometry";

/// A single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Geometry(Geometry<f64>),
}

impl Value {
    /// Infer a value from a text cell: empty → Null, then integer, float, text.
    pub fn infer(cell: &str) -> Value {
        if cell.is_empty() {
            Value::Null
        } else if let Ok(i) = cell.parse::<i64>() {
            Value::Int(i)
        } else if let Ok(f) = cell.parse::<f64>() {
            Value::Float(f)
        } else {
            Value::Text(cell.to_string())
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view; integers widen to `f64`, numeric text is parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_geometry(&self) -> Option<&Geometry<f64>> {
        match self {
            Value::Geometry(g) => Some(g),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            // Whole floats keep a fractional part so text formats read them back as floats.
            Value::Float(x) if x.is_finite() && x.fract() == 0.0 => write!(f, "{:.1}", x),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => f.write_str(s),
            Value::Geometry(g) => f.write_str(&geometry::to_wkt(g)),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Geometry<f64>> for Value {
    fn from(v: Geometry<f64>) -> Self {
        Value::Geometry(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Borrowed view of one row.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    fields: &'a [String],
    values: &'a [Value],
}

impl<'a> Record<'a> {
    pub fn get(&self, name: &str) -> Option<&'a Value> {
        self.fields.iter().position(|f| f == name).map(|i| &self.values[i])
    }

    pub fn values(&self) -> &'a [Value] {
        self.values
    }

    pub fn geometry(&self) -> Option<&'a Geometry<f64>> {
        self.get(GEOMETRY_FIELD).and_then(Value::as_geometry)
    }
}

/// An ordered, homogeneous group of records with an optional spatial reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    fields: Vec<String>,
    rows: Vec<Vec<Value>>,
    crs: Option<String>,
}

impl Batch {
    /// Create an empty batch with the given fields.
    pub fn new<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
            crs: None,
        }
    }

    /// Create a batch from fields and rows.
    pub fn from_rows<S: Into<String>>(
        fields: impl IntoIterator<Item = S>,
        rows: impl IntoIterator<Item = Vec<Value>>,
    ) -> Self {
        let mut batch = Self::new(fields);
        for row in rows {
            batch.push(row);
        }
        batch
    }

    pub fn with_crs(mut self, crs: Option<String>) -> Self {
        self.crs = crs;
        self
    }

    /// Append a row, padding or truncating it to the field count.
    pub fn push(&mut self, mut row: Vec<Value>) {
        row.resize(self.fields.len(), Value::Null);
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<Value>> {
        self.rows
    }

    pub fn crs(&self) -> Option<&str> {
        self.crs.as_deref()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }

    /// Iterate over the values of one column.
    pub fn column<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a Value> + 'a {
        let idx = self.column_index(name);
        self.rows.iter().filter_map(move |row| idx.map(|i| &row[i]))
    }

    pub fn record(&self, index: usize) -> Option<Record<'_>> {
        self.rows.get(index).map(|values| Record {
            fields: &self.fields,
            values,
        })
    }

    pub fn records(&self) -> impl Iterator<Item = Record<'_>> {
        self.rows.iter().map(move |values| Record {
            fields: &self.fields,
            values,
        })
    }

    /// Keep only the records for which `keep` returns true.
    pub fn filter(self, mut keep: impl FnMut(Record<'_>) -> bool) -> Batch {
        let Batch { fields, rows, crs } = self;
        let rows = rows
            .into_iter()
            .filter(|values| {
                keep(Record {
                    fields: &fields,
                    values,
                })
            })
            .collect();
        Batch { fields, rows, crs }
    }

    /// Project rows onto `fields`; unknown fields become Null and extra fields are dropped.
    pub fn project(&self, fields: &[String]) -> Batch {
        let mapping: Vec<Option<usize>> = fields.iter().map(|f| self.column_index(f)).collect();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                mapping
                    .iter()
                    .map(|idx| idx.map_or(Value::Null, |i| row[i].clone()))
                    .collect()
            })
            .collect();
        Batch {
            fields: fields.to_vec(),
            rows,
            crs: self.crs.clone(),
        }
    }

    /// Append a column, filling it from `values` (Null when exhausted).
    pub fn add_column(&mut self, name: impl Into<String>, values: impl IntoIterator<Item = Value>) {
        self.fields.push(name.into());
        let mut values = values.into_iter();
        for row in &mut self.rows {
            row.push(values.next().unwrap_or(Value::Null));
        }
    }

    /// Remove a column by name, returning whether it existed.
    pub fn drop_column(&mut self, name: &str) -> bool {
        match self.column_index(name) {
            Some(i) => {
                self.fields.remove(i);
                for row in &mut self.rows {
                    row.remove(i);
                }
                true
            }
            None => false,
        }
    }

    /// Append all rows of `other`, projected onto this batch's fields.
    pub fn extend(&mut self, other: &Batch) {
        let projected = other.project(&self.fields);
        self.rows.extend(projected.rows);
    }

    pub fn schema(&self) -> Schema {
        Schema::infer(self)
    }
}

/// Promote single-part geometries when a batch mixes one single type with its multi form.
///
/// Mixes of unrelated geometry types are left untouched.
pub fn normalize_multitypes(mut batch: Batch) -> Batch {
    let Some(idx) = batch.column_index(GEOMETRY_FIELD) else {
        return batch;
    };

    let kinds: HashSet<GeometryKind> = batch
        .rows
        .iter()
        .filter_map(|row| row[idx].as_geometry().map(GeometryKind::of))
        .collect();
    if kinds.len() < 2 {
        return batch;
    }
    if kinds.len() == 2 {
        let single = kinds.iter().copied().find(|k| k.multi().is_some());
        if let Some(single) = single {
            if single.multi().is_some_and(|m| kinds.contains(&m)) {
                for row in &mut batch.rows {
                    if let Value::Geometry(g) = std::mem::replace(&mut row[idx], Value::Null) {
                        row[idx] = Value::Geometry(geometry::to_multi(g));
                    }
                }
                return batch;
            }
        }
    }
    let mut names: Vec<&str> = kinds.iter().map(GeometryKind::as_str).collect();
    names.sort_unstable();
    warn!("Batch mixes geometry types {}; leaving them as-is", names.join(", "));
    batch
}

/// Build a point `geometry` column from two numeric columns, dropping them.
///
/// Rows with missing or non-numeric coordinates get a Null geometry.
pub fn points_from_columns(mut batch: Batch, lon: &str, lat: &str) -> anyhow::Result<Batch> {
    let lon_idx = batch
        .column_index(lon)
        .ok_or_else(|| anyhow::anyhow!("column '{}' not found", lon))?;
    let lat_idx = batch
        .column_index(lat)
        .ok_or_else(|| anyhow::anyhow!("column '{}' not found", lat))?;

    let mut skipped = 0usize;
    let points: Vec<Value> = batch
        .rows
        .iter()
        .map(|row| match (row[lon_idx].as_f64(), row[lat_idx].as_f64()) {
            (Some(x), Some(y)) => Value::Geometry(Geometry::Point(Point::new(x, y))),
            _ => {
                skipped += 1;
                Value::Null
            }
        })
        .collect();
    if skipped > 0 {
        warn!("{} records without usable '{}'/'{}' coordinates", skipped, lon, lat);
    }

    batch.drop_column(lon);
    batch.drop_column(lat);
    batch.drop_column(GEOMETRY_FIELD);
    batch.add_column(GEOMETRY_FIELD, points);
    Ok(batch)
}
