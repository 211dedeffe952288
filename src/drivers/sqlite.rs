//! SQLite driver: `name.sqlite[:table]` or `name.db[:table]`.
//!
//! Each table is a layer. Reads are paged by `rowid`; geometries are stored as
//! WKT text in a `geometry` column. Writing replaces only the named table.
//! Booleans are stored in `BOOLEAN` columns and read back as booleans.

use super::{resolve_layer, Descriptor, Driver, DriverOptions, FormatReader, FormatWriter};
use crate::batch::{Batch, Schema, Value, GEOMETRY_FIELD};
use crate::error::{Error, Result};
use crate::geometry;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection, OpenFlags};
use std::collections::VecDeque;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct SqliteDriver;

impl Driver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn open_reader(&self, descriptor: &Descriptor, options: &DriverOptions) -> Result<Box<dyn FormatReader>> {
        Ok(Box::new(SqliteReader::open(descriptor, options.page_size)?))
    }

    fn open_writer(&self, descriptor: &Descriptor, _options: &DriverOptions) -> Result<Box<dyn FormatWriter>> {
        let table = descriptor
            .layer()
            .or_else(|| descriptor.stem())
            .ok_or_else(|| Error::InvalidDescriptor {
                descriptor: descriptor.as_str().to_string(),
                reason: "cannot derive a table name".to_string(),
            })?
            .to_string();
        Ok(Box::new(SqliteWriter {
            path: descriptor.as_str().to_string(),
            conn: Some(Connection::open(descriptor.path())?),
            table,
            fields: Vec::new(),
        }))
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Table names of a database, excluding SQLite internals.
pub fn list_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names)
}

pub struct SqliteReader {
    descriptor: String,
    conn: Connection,
    table: String,
    fields: Vec<String>,
    /// Columns declared `BOOLEAN`, whose integers are read back as booleans.
    boolean: Vec<bool>,
    total: u64,
    page_size: usize,
    buffer: VecDeque<Vec<Value>>,
    last_rowid: Option<i64>,
    drained: bool,
}

impl SqliteReader {
    fn open(descriptor: &Descriptor, page_size: usize) -> Result<Self> {
        descriptor.require_exists()?;
        let conn = Connection::open_with_flags(descriptor.path(), OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let table = resolve_layer(descriptor, &list_tables(&conn)?)?;

        let columns = {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(&table)))?;
            let columns = stmt.query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?;
            columns.collect::<std::result::Result<Vec<_>, _>>()?
        };
        let boolean = columns
            .iter()
            .map(|(_, decl)| decl.eq_ignore_ascii_case("BOOLEAN"))
            .collect();
        let fields: Vec<String> = columns.into_iter().map(|(name, _)| name).collect();
        if fields.is_empty() {
            return Err(Error::SourceNotFound {
                descriptor: format!("{} (table '{}')", descriptor, table),
            });
        }

        let total: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(&table)), [], |row| {
            row.get(0)
        })?;
        debug!("Opened {} table '{}' ({} rows)", descriptor, table, total);

        Ok(Self {
            descriptor: descriptor.as_str().to_string(),
            conn,
            table,
            fields,
            boolean,
            total: total.max(0) as u64,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            last_rowid: None,
            drained: false,
        })
    }

    fn convert(&self, column: usize, value: ValueRef<'_>, rowid: i64) -> Value {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) if self.boolean[column] => Value::Bool(i != 0),
            ValueRef::Integer(i) => Value::Int(i),
            ValueRef::Real(f) => Value::Float(f),
            ValueRef::Text(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                if self.fields[column] != GEOMETRY_FIELD {
                    return Value::Text(text.into_owned());
                }
                match geometry::parse_wkt(&text) {
                    Ok(g) => Value::Geometry(g),
                    Err(reason) => {
                        warn!(
                            "{}",
                            Error::MalformedRecord {
                                descriptor: self.descriptor.clone(),
                                index: rowid.max(0) as u64,
                                reason,
                            }
                        );
                        Value::Null
                    }
                }
            }
            ValueRef::Blob(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    fn fetch_page(&mut self) -> Result<()> {
        let table = quote_ident(&self.table);
        let sql = match self.last_rowid {
            Some(_) => format!("SELECT rowid, * FROM {} WHERE rowid > ?1 ORDER BY rowid LIMIT ?2", table),
            None => format!("SELECT rowid, * FROM {} ORDER BY rowid LIMIT ?1", table),
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let limit = self.page_size as i64;
        let mut rows = match self.last_rowid {
            Some(last) => stmt.query(params![last, limit])?,
            None => stmt.query(params![limit])?,
        };

        let mut page = Vec::new();
        let mut last = self.last_rowid;
        while let Some(row) = rows.next()? {
            let rowid: i64 = row.get(0)?;
            let mut record = Vec::with_capacity(self.fields.len());
            for i in 0..self.fields.len() {
                record.push(self.convert(i, row.get_ref(i + 1)?, rowid));
            }
            page.push(record);
            last = Some(rowid);
        }
        drop(rows);
        drop(stmt);

        self.drained = page.len() < self.page_size;
        self.last_rowid = last;
        self.buffer.extend(page);
        Ok(())
    }
}

impl FormatReader for SqliteReader {
    fn fields(&self) -> &[String] {
        &self.fields
    }

    fn total(&self) -> Option<u64> {
        Some(self.total)
    }

    fn rewind(&mut self) -> Result<()> {
        self.buffer.clear();
        self.last_rowid = None;
        self.drained = false;
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Vec<Value>>> {
        if self.buffer.is_empty() && !self.drained {
            self.fetch_page()?;
        }
        Ok(self.buffer.pop_front())
    }
}

pub struct SqliteWriter {
    path: String,
    conn: Option<Connection>,
    table: String,
    fields: Vec<String>,
}

impl SqliteWriter {
    fn conn(&mut self) -> Result<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::Pipeline(format!("SQLite writer for {} already closed", self.path)))
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Geometry(g) => SqlValue::Text(geometry::to_wkt(g)),
    }
}

impl FormatWriter for SqliteWriter {
    fn init(&mut self, schema: &Schema, _crs: Option<&str>) -> Result<()> {
        let mut columns: Vec<String> = schema
            .fields
            .iter()
            .map(|f| format!("{} {}", quote_ident(&f.name), f.kind.sql_type()))
            .collect();
        self.fields = schema.field_names();
        if columns.is_empty() && schema.has_geometry() {
            columns.push(format!("{} TEXT", quote_ident(GEOMETRY_FIELD)));
            self.fields.push(GEOMETRY_FIELD.to_string());
        }

        let table = quote_ident(&self.table);
        let sql = format!(
            "DROP TABLE IF EXISTS {table};\nCREATE TABLE {table} ({});",
            columns.join(", ")
        );
        self.conn()?.execute_batch(&sql)?;
        debug!("Created table {} in {}", self.table, self.path);
        Ok(())
    }

    fn write_rows(&mut self, batch: &Batch) -> Result<()> {
        if self.fields.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&self.table),
            self.fields.iter().map(|f| quote_ident(f)).collect::<Vec<_>>().join(", "),
            (1..=self.fields.len()).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", "),
        );

        let tx = self.conn()?.transaction()?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for row in batch.rows() {
                stmt.execute(rusqlite::params_from_iter(row.iter().map(to_sql)))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| Error::Sqlite(e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed(path: &std::path::Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE roads (id INTEGER, name TEXT, geometry TEXT);
             INSERT INTO roads VALUES (1, 'a', 'LINESTRING(0 0, 1 1)');
             INSERT INTO roads VALUES (2, 'b', 'garbage');
             INSERT INTO roads VALUES (3, 'c', NULL);
             CREATE TABLE rivers (id INTEGER);",
        )
        .unwrap();
    }

    #[test]
    fn test_paged_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("city.sqlite");
        seed(&path);

        let d = Descriptor::parse(&format!("{}:roads", path.display())).unwrap();
        let options = DriverOptions {
            page_size: 2,
            ..DriverOptions::default()
        };
        let mut reader = SqliteDriver.open_reader(&d, &options).unwrap();
        assert_eq!(reader.fields(), &["id", "name", "geometry"]);
        assert_eq!(reader.total(), Some(3));

        let mut rows = Vec::new();
        while let Some(row) = reader.next_record().unwrap() {
            rows.push(row);
        }
        assert_eq!(rows.len(), 3);
        assert!(rows[0][2].as_geometry().is_some());
        assert_eq!(rows[1][2], Value::Null);
        assert_eq!(rows[2][1], Value::from("c"));

        reader.rewind().unwrap();
        assert_eq!(reader.next_record().unwrap().unwrap()[0], Value::Int(1));
    }

    #[test]
    fn test_ambiguous_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("city.sqlite");
        seed(&path);

        let d = Descriptor::parse(path.to_str().unwrap()).unwrap();
        let err = SqliteDriver
            .open_reader(&d, &DriverOptions::default())
            .err()
            .unwrap();
        match err {
            Error::AmbiguousLayer { available, .. } => assert_eq!(available, vec!["rivers", "roads"]),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_writer_replaces_only_named_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("city.sqlite");
        seed(&path);

        let d = Descriptor::parse(&format!("{}:roads", path.display())).unwrap();
        let mut writer = SqliteDriver.open_writer(&d, &DriverOptions::default()).unwrap();
        let batch = Batch::from_rows(["id", "flag"], vec![vec![Value::Int(9), Value::Bool(true)]]);
        writer.init(&batch.schema(), None).unwrap();
        writer.write_rows(&batch).unwrap();
        writer.finish().unwrap();

        let conn = Connection::open(&path).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM roads", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
        let flag: i64 = conn.query_row("SELECT flag FROM roads", [], |r| r.get(0)).unwrap();
        assert_eq!(flag, 1);
        assert_eq!(list_tables(&conn).unwrap(), vec!["rivers", "roads"]);
    }

    #[test]
    fn test_booleans_survive_a_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flags.sqlite");
        let d = Descriptor::parse(&format!("{}:flags", path.display())).unwrap();

        let batch = Batch::from_rows(
            ["id", "active", "score"],
            vec![
                vec![Value::Int(1), Value::Bool(true), Value::Float(2.0)],
                vec![Value::Int(2), Value::Bool(false), Value::Null],
            ],
        );
        let mut writer = SqliteDriver.open_writer(&d, &DriverOptions::default()).unwrap();
        writer.init(&batch.schema(), None).unwrap();
        writer.write_rows(&batch).unwrap();
        writer.finish().unwrap();

        let mut reader = SqliteDriver.open_reader(&d, &DriverOptions::default()).unwrap();
        let mut rows = Vec::new();
        while let Some(row) = reader.next_record().unwrap() {
            rows.push(row);
        }
        assert_eq!(rows, batch.rows());
    }
}
