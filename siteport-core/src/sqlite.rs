//! `Database` over a SQLite file, so a migration can run without a server.
//!
//! Blog tables follow the multisite naming: `<prefix>` for the main blog,
//! `<prefix><id>_` for the others, all in one database.

use std::fmt::Write as _;
use std::path::Path;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, params};
use tracing::debug;

use crate::config::MIB;
use crate::error::{Result, SiteportError};
use crate::restore::dump::quote_ident;
use crate::services::{Database, RewriteBatch};

pub struct SqliteDatabase {
    conn: Connection,
    base_prefix: String,
    max_packet: u64,
    privileged: bool,
}

impl SqliteDatabase {
    pub fn open(path: &Path, base_prefix: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA busy_timeout = 3000;")?;
        Ok(Self::with_connection(conn, base_prefix))
    }

    pub fn open_in_memory(base_prefix: &str) -> Result<Self> {
        Ok(Self::with_connection(Connection::open_in_memory()?, base_prefix))
    }

    fn with_connection(conn: Connection, base_prefix: &str) -> Self {
        Self {
            conn,
            base_prefix: base_prefix.to_string(),
            max_packet: 64 * MIB,
            privileged: false,
        }
    }

    /// Emulated server packet limit and whether it may be raised.
    pub fn with_packet_limit(mut self, bytes: u64, privileged: bool) -> Self {
        self.max_packet = bytes;
        self.privileged = privileged;
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn columns(&self, table: &str) -> Result<Vec<Column>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1)")?;
        let cols = stmt
            .query_map(params![table], |r| {
                Ok(Column {
                    name: r.get(0)?,
                    ty: r.get(1)?,
                    not_null: r.get::<_, i64>(2)? != 0,
                    default: r.get(3)?,
                    pk: r.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if cols.is_empty() {
            return Err(SiteportError::Database(format!("no such table: {table}")));
        }
        Ok(cols)
    }
}

struct Column {
    name: String,
    ty: String,
    not_null: bool,
    default: Option<String>,
    pk: i64,
}

impl Database for SqliteDatabase {
    fn query(&mut self, sql: &str) -> Result<u64> {
        let mut stmt = self.conn.prepare(sql)?;
        if stmt.column_count() > 0 {
            let mut rows = stmt.query([])?;
            while rows.next()?.is_some() {}
            return Ok(0);
        }
        Ok(stmt.execute([])? as u64)
    }

    fn get_var(&mut self, sql: &str) -> Result<Option<String>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(value_text(row.get_ref(0)?)),
            None => Ok(None),
        }
    }

    fn prefix_of(&self, blog_id: u64) -> String {
        if blog_id <= 1 {
            self.base_prefix.clone()
        } else {
            format!("{}{blog_id}_", self.base_prefix)
        }
    }

    fn show_tables(&mut self, prefix: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names.into_iter().filter(|n| n.starts_with(prefix)).collect())
    }

    /// Rebuilt from column metadata so the table name is always backtick-quoted.
    fn table_schema(&mut self, table: &str) -> Result<String> {
        let cols = self.columns(table)?;
        let mut defs: Vec<String> = cols
            .iter()
            .map(|c| {
                let mut d = quote_ident(&c.name);
                if !c.ty.is_empty() {
                    let _ = write!(d, " {}", c.ty);
                }
                if c.not_null {
                    d.push_str(" NOT NULL");
                }
                if let Some(v) = &c.default {
                    let _ = write!(d, " DEFAULT {v}");
                }
                d
            })
            .collect();
        let mut pk: Vec<&Column> = cols.iter().filter(|c| c.pk > 0).collect();
        pk.sort_by_key(|c| c.pk);
        if !pk.is_empty() {
            let names: Vec<String> = pk.iter().map(|c| quote_ident(&c.name)).collect();
            defs.push(format!("PRIMARY KEY ({})", names.join(", ")));
        }
        Ok(format!(
            "CREATE TABLE {} (\n  {}\n)",
            quote_ident(table),
            defs.join(",\n  ")
        ))
    }

    fn insert_statements(&mut self, table: &str, offset: u64, limit: u64) -> Result<Vec<String>> {
        let cols = self.columns(table)?;
        let names: Vec<String> = cols.iter().map(|c| quote_ident(&c.name)).collect();
        let sql = format!(
            "SELECT {} FROM {} ORDER BY rowid LIMIT ?1 OFFSET ?2",
            names.join(", "),
            quote_ident(table)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![limit as i64, offset as i64])?;
        let head = format!("INSERT INTO {} ({}) VALUES (", quote_ident(table), names.join(", "));
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut line = head.clone();
            for i in 0..cols.len() {
                if i > 0 {
                    line.push_str(", ");
                }
                line.push_str(&sql_literal(row.get_ref(i)?));
            }
            line.push_str(");");
            out.push(line);
        }
        Ok(out)
    }

    fn replace_in_table(
        &mut self,
        table: &str,
        pairs: &[(String, String)],
        offset: u64,
        limit: u64,
    ) -> Result<RewriteBatch> {
        let cols = self.columns(table)?;
        let names: Vec<String> = cols.iter().map(|c| quote_ident(&c.name)).collect();
        let sql = format!(
            "SELECT rowid, {} FROM {} ORDER BY rowid LIMIT ?1 OFFSET ?2",
            names.join(", "),
            quote_ident(table)
        );

        let mut updates: Vec<(i64, usize, String)> = Vec::new();
        let mut batch = RewriteBatch::default();
        {
            let mut stmt = self.conn.prepare(&sql)?;
            let mut rows = stmt.query(params![limit as i64, offset as i64])?;
            while let Some(row) = rows.next()? {
                batch.rows_seen += 1;
                let rowid: i64 = row.get(0)?;
                let mut changed = false;
                for i in 0..cols.len() {
                    if let ValueRef::Text(t) = row.get_ref(i + 1)? {
                        let Ok(text) = std::str::from_utf8(t) else {
                            continue;
                        };
                        let mut new = text.to_string();
                        for (from, to) in pairs {
                            if !from.is_empty() && new.contains(from.as_str()) {
                                new = new.replace(from.as_str(), to);
                            }
                        }
                        if new != text {
                            updates.push((rowid, i, new));
                            changed = true;
                        }
                    }
                }
                if changed {
                    batch.rows_changed += 1;
                }
            }
        }

        for (rowid, col, value) in &updates {
            let sql = format!(
                "UPDATE {} SET {} = ?1 WHERE rowid = ?2",
                quote_ident(table),
                names[*col]
            );
            self.conn.execute(&sql, params![value, rowid])?;
        }
        debug!(table, seen = batch.rows_seen, changed = batch.rows_changed, "rewrite window");
        Ok(batch)
    }

    fn max_allowed_packet(&mut self) -> Result<u64> {
        Ok(self.max_packet)
    }

    fn set_max_allowed_packet(&mut self, bytes: u64) -> Result<()> {
        self.max_packet = bytes;
        Ok(())
    }

    fn has_elevated_privileges(&mut self) -> bool {
        self.privileged
    }
}

fn value_text(v: ValueRef<'_>) -> Option<String> {
    match v {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(r) => Some(r.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Some(hex::encode(b)),
    }
}

/// Render a value as a single-line SQL literal.
fn sql_literal(v: ValueRef<'_>) -> String {
    match v {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(r) => format!("{r:?}"),
        ValueRef::Text(t) => quote_text(&String::from_utf8_lossy(t)),
        ValueRef::Blob(b) => format!("X'{}'", hex::encode(b)),
    }
}

/// Quote text; line breaks become `char()` concatenations so the literal
/// stays on one line.
fn quote_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        match ch {
            '\'' => out.push_str("''"),
            '\n' => out.push_str("' || char(10) || '"),
            '\r' => out.push_str("' || char(13) || '"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}
