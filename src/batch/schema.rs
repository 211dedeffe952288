use super::{Batch, Value, GEOMETRY_FIELD};
use crate::geometry::GeometryKind;

/// Scalar kind of a non-geometry column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    Text,
    Geometry,
}

impl FieldKind {
    /// SQL column type used by the SQLite driver.
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldKind::Bool => "BOOLEAN",
            FieldKind::Int => "INTEGER",
            FieldKind::Float => "REAL",
            FieldKind::Text | FieldKind::Geometry => "TEXT",
        }
    }

    fn of(value: &Value) -> Option<FieldKind> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(FieldKind::Bool),
            Value::Int(_) => Some(FieldKind::Int),
            Value::Float(_) => Some(FieldKind::Float),
            Value::Text(_) => Some(FieldKind::Text),
            Value::Geometry(_) => Some(FieldKind::Geometry),
        }
    }

    fn widen(self, other: FieldKind) -> FieldKind {
        match (self, other) {
            (a, b) if a == b => a,
            (FieldKind::Int, FieldKind::Float) | (FieldKind::Float, FieldKind::Int) => FieldKind::Float,
            _ => FieldKind::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
}

/// Field names and kinds plus the geometry type, used to initialise sinks.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub fields: Vec<Field>,
    pub geometry: Option<GeometryKind>,
}

impl Schema {
    /// Schema used when a sink is closed without any data: no fields, point geometry.
    ///
    /// Drivers that write a header for the geometry column (CSV, SQLite) therefore
    /// create a target with a single `geometry` column.
    pub fn empty() -> Self {
        Self {
            fields: Vec::new(),
            geometry: Some(GeometryKind::Point),
        }
    }

    /// Infer from a batch. All-null columns become Text; mixed numeric columns Float.
    pub fn infer(batch: &Batch) -> Self {
        let mut fields = Vec::with_capacity(batch.fields().len());
        let mut geometry = None;

        for (i, name) in batch.fields().iter().enumerate() {
            let kind = batch
                .rows()
                .iter()
                .filter_map(|row| FieldKind::of(&row[i]))
                .reduce(FieldKind::widen)
                .unwrap_or(if name == GEOMETRY_FIELD {
                    FieldKind::Geometry
                } else {
                    FieldKind::Text
                });

            if name == GEOMETRY_FIELD {
                geometry = infer_geometry_kind(batch, i);
            }
            fields.push(Field {
                name: name.clone(),
                kind,
            });
        }

        Self { fields, geometry }
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn has_geometry(&self) -> bool {
        self.geometry.is_some()
    }
}

fn infer_geometry_kind(batch: &Batch, idx: usize) -> Option<GeometryKind> {
    let mut kinds = batch
        .rows()
        .iter()
        .filter_map(|row| row[idx].as_geometry().map(GeometryKind::of));
    let first = kinds.next()?;
    Some(kinds.fold(first, |acc, k| {
        if acc == k {
            acc
        } else if acc.multi() == Some(k) {
            k
        } else if k.multi() == Some(acc) {
            acc
        } else {
            GeometryKind::GeometryCollection
        }
    }))
}
