//! Geometry helpers: WKT and GeoJSON conversion and the intersection predicate
//! used by geometry filters.
//!
//! Geometries are always `geo_types::Geometry<f64>`. Text encodings only exist
//! at the driver boundary.

use geo::{BoundingRect, Intersects};
use geo_types::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon, Rect,
};
use serde_json::{json, Value as JsonValue};
use std::fmt;
use wkt::{ToWkt, TryFromWkt};

/// Geometry type discriminator, used in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryKind {
    Point,
    LineString,
    Polygon,
    MultiPoint,
    MultiLineString,
    MultiPolygon,
    GeometryCollection,
}

impl GeometryKind {
    /// Classify a geometry.
    pub fn of(geom: &Geometry<f64>) -> Self {
        match geom {
            Geometry::Point(_) => GeometryKind::Point,
            Geometry::LineString(_) | Geometry::Line(_) => GeometryKind::LineString,
            Geometry::Polygon(_) | Geometry::Rect(_) | Geometry::Triangle(_) => GeometryKind::Polygon,
            Geometry::MultiPoint(_) => GeometryKind::MultiPoint,
            Geometry::MultiLineString(_) => GeometryKind::MultiLineString,
            Geometry::MultiPolygon(_) => GeometryKind::MultiPolygon,
            Geometry::GeometryCollection(_) => GeometryKind::GeometryCollection,
        }
    }

    /// Multi counterpart of a single-part kind.
    pub fn multi(self) -> Option<GeometryKind> {
        match self {
            GeometryKind::Point => Some(GeometryKind::MultiPoint),
            GeometryKind::LineString => Some(GeometryKind::MultiLineString),
            GeometryKind::Polygon => Some(GeometryKind::MultiPolygon),
            _ => None,
        }
    }

    /// Name as used by GeoJSON and WKT.
    pub fn as_str(&self) -> &'static str {
        match self {
            GeometryKind::Point => "Point",
            GeometryKind::LineString => "LineString",
            GeometryKind::Polygon => "Polygon",
            GeometryKind::MultiPoint => "MultiPoint",
            GeometryKind::MultiLineString => "MultiLineString",
            GeometryKind::MultiPolygon => "MultiPolygon",
            GeometryKind::GeometryCollection => "GeometryCollection",
        }
    }
}

impl fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse WKT text into a geometry.
pub fn parse_wkt(text: &str) -> Result<Geometry<f64>, String> {
    Geometry::<f64>::try_from_wkt_str(text.trim()).map_err(|e| format!("invalid WKT: {}", e))
}

/// Format a geometry as WKT.
pub fn to_wkt(geom: &Geometry<f64>) -> String {
    geom.wkt_string()
}

/// Intersection test with a bounding-box precheck.
pub fn intersects(candidate: &Geometry<f64>, filter: &Geometry<f64>) -> bool {
    match (candidate.bounding_rect(), filter.bounding_rect()) {
        (Some(a), Some(b)) if !a.intersects(&b) => false,
        (None, _) | (_, None) => false,
        _ => candidate.intersects(filter),
    }
}

/// Bounding rectangle as `[min_x, min_y, max_x, max_y]`.
pub fn bounds(geom: &Geometry<f64>) -> Option<[f64; 4]> {
    geom.bounding_rect().map(|r: Rect<f64>| [r.min().x, r.min().y, r.max().x, r.max().y])
}

/// Promote a single-part geometry to its multi counterpart.
pub fn to_multi(geom: Geometry<f64>) -> Geometry<f64> {
    match geom {
        Geometry::Point(p) => Geometry::MultiPoint(MultiPoint(vec![p])),
        Geometry::LineString(l) => Geometry::MultiLineString(MultiLineString(vec![l])),
        Geometry::Polygon(p) => Geometry::MultiPolygon(MultiPolygon(vec![p])),
        other => other,
    }
}

// ── GeoJSON ─────────────────────────────────────────────────────────────────

fn coord_json(c: &Coord<f64>) -> JsonValue {
    json!([c.x, c.y])
}

fn line_json(l: &LineString<f64>) -> JsonValue {
    JsonValue::Array(l.0.iter().map(coord_json).collect())
}

fn polygon_json(p: &Polygon<f64>) -> JsonValue {
    let mut rings = vec![line_json(p.exterior())];
    rings.extend(p.interiors().iter().map(line_json));
    JsonValue::Array(rings)
}

/// Convert a geometry to a GeoJSON geometry object.
pub fn to_geojson(geom: &Geometry<f64>) -> JsonValue {
    match geom {
        Geometry::Point(p) => json!({"type": "Point", "coordinates": coord_json(&p.0)}),
        Geometry::Line(l) => json!({
            "type": "LineString",
            "coordinates": [coord_json(&l.start), coord_json(&l.end)],
        }),
        Geometry::LineString(l) => json!({"type": "LineString", "coordinates": line_json(l)}),
        Geometry::Polygon(p) => json!({"type": "Polygon", "coordinates": polygon_json(p)}),
        Geometry::Rect(r) => to_geojson(&Geometry::Polygon(r.to_polygon())),
        Geometry::Triangle(t) => to_geojson(&Geometry::Polygon(t.to_polygon())),
        Geometry::MultiPoint(mp) => json!({
            "type": "MultiPoint",
            "coordinates": mp.0.iter().map(|p| coord_json(&p.0)).collect::<Vec<_>>(),
        }),
        Geometry::MultiLineString(ml) => json!({
            "type": "MultiLineString",
            "coordinates": ml.0.iter().map(line_json).collect::<Vec<_>>(),
        }),
        Geometry::MultiPolygon(mp) => json!({
            "type": "MultiPolygon",
            "coordinates": mp.0.iter().map(polygon_json).collect::<Vec<_>>(),
        }),
        Geometry::GeometryCollection(gc) => json!({
            "type": "GeometryCollection",
            "geometries": gc.0.iter().map(to_geojson).collect::<Vec<_>>(),
        }),
    }
}

fn json_coord(v: &JsonValue) -> Result<Coord<f64>, String> {
    let arr = v.as_array().ok_or("coordinate must be an array")?;
    match (arr.first().and_then(JsonValue::as_f64), arr.get(1).and_then(JsonValue::as_f64)) {
        (Some(x), Some(y)) => Ok(Coord { x, y }),
        _ => Err("coordinate must hold two numbers".to_string()),
    }
}

fn json_line(v: &JsonValue) -> Result<LineString<f64>, String> {
    let arr = v.as_array().ok_or("line must be an array of coordinates")?;
    arr.iter().map(json_coord).collect::<Result<Vec<_>, _>>().map(LineString::from)
}

fn json_polygon(v: &JsonValue) -> Result<Polygon<f64>, String> {
    let rings = v.as_array().ok_or("polygon must be an array of rings")?;
    let mut rings = rings.iter().map(json_line);
    let exterior = rings.next().ok_or("polygon without exterior ring")??;
    let interiors = rings.collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn json_array<'a>(v: &'a JsonValue, what: &str) -> Result<&'a Vec<JsonValue>, String> {
    v.as_array().ok_or_else(|| format!("{} must be an array", what))
}

/// Convert a GeoJSON geometry object. `null` yields `Ok(None)`.
pub fn from_geojson(v: &JsonValue) -> Result<Option<Geometry<f64>>, String> {
    if v.is_null() {
        return Ok(None);
    }
    let kind = v.get("type").and_then(JsonValue::as_str).ok_or("geometry without type")?;
    if kind == "GeometryCollection" {
        let members = json_array(v.get("geometries").unwrap_or(&JsonValue::Null), "geometries")?;
        let geoms = members
            .iter()
            .filter_map(|m| from_geojson(m).transpose())
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Some(Geometry::GeometryCollection(GeometryCollection(geoms))));
    }

    let coords = v.get("coordinates").ok_or("geometry without coordinates")?;
    let geom = match kind {
        "Point" => Geometry::Point(Point(json_coord(coords)?)),
        "LineString" => Geometry::LineString(json_line(coords)?),
        "Polygon" => Geometry::Polygon(json_polygon(coords)?),
        "MultiPoint" => Geometry::MultiPoint(MultiPoint(
            json_array(coords, "coordinates")?
                .iter()
                .map(|c| json_coord(c).map(Point))
                .collect::<Result<_, _>>()?,
        )),
        "MultiLineString" => Geometry::MultiLineString(MultiLineString(
            json_array(coords, "coordinates")?
                .iter()
                .map(json_line)
                .collect::<Result<_, _>>()?,
        )),
        "MultiPolygon" => Geometry::MultiPolygon(MultiPolygon(
            json_array(coords, "coordinates")?
                .iter()
                .map(json_polygon)
                .collect::<Result<_, _>>()?,
        )),
        other => return Err(format!("unsupported geometry type '{}'", other)),
    };
    Ok(Some(geom))
}
