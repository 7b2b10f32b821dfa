//! SQL dump writer used by the export chain.
//!
//! Output is one statement per line so the restore reader's line splitter
//! never sees a statement boundary inside a value.

use std::fs::OpenOptions;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::budget::TimeBudget;
use crate::crypto::aead::LineCipher;
use crate::error::{Result, SiteportError};
use crate::services::Database;
use crate::state::ProgressState;

/// Tables belonging to `blog_id`. The main blog shares its prefix with every
/// other blog's tables (`wp_` vs `wp_2_`), so numbered ones are excluded.
pub fn blog_tables(db: &mut dyn Database, blog_id: u64) -> Result<Vec<String>> {
    let prefix = db.prefix_of(blog_id);
    let mut tables = db.show_tables(&prefix)?;
    if blog_id == 1 {
        tables.retain(|t| !belongs_to_sub_blog(&t[prefix.len()..]));
    }
    tables.sort();
    Ok(tables)
}

fn belongs_to_sub_blog(rest: &str) -> bool {
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    digits > 0 && rest.as_bytes().get(digits) == Some(&b'_')
}

pub struct DumpWriter {
    rows_per_batch: u64,
    cipher: Option<LineCipher>,
}

/// Where the next dump batch starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DumpCursor {
    pub table_index: u64,
    pub row_offset: u64,
    pub file_size: u64,
}

impl DumpCursor {
    pub fn from_state(s: &ProgressState) -> Self {
        Self {
            table_index: s.dump.dump_table_index.unwrap_or(0),
            row_offset: s.dump.dump_row_offset.unwrap_or(0),
            file_size: s.dump.dump_file_size.unwrap_or(0),
        }
    }

    pub fn apply(&self, s: &mut ProgressState) {
        s.dump.dump_table_index = Some(self.table_index);
        s.dump.dump_row_offset = Some(self.row_offset);
        s.dump.dump_file_size = Some(self.file_size);
    }
}

/// Appends lines, sealing each one with its own byte offset when a cipher is set.
struct LineSink<'a, W: Write> {
    w: W,
    len: u64,
    cipher: Option<&'a LineCipher>,
}

impl<W: Write> LineSink<'_, W> {
    fn line(&mut self, text: &str) -> Result<()> {
        let out = match self.cipher {
            Some(c) if !text.starts_with("--") => c.seal_line(self.len, text)?,
            _ => text.to_string(),
        };
        self.w.write_all(out.as_bytes())?;
        self.w.write_all(b"\n")?;
        self.len += out.len() as u64 + 1;
        Ok(())
    }
}

impl DumpWriter {
    pub fn new(rows_per_batch: u64) -> Self {
        Self {
            rows_per_batch: rows_per_batch.max(1),
            cipher: None,
        }
    }

    pub fn with_cipher(mut self, cipher: LineCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Dump `tables` into `out` from the saved cursor; `true` once all are written.
    pub fn run(
        &self,
        db: &mut dyn Database,
        tables: &[String],
        out: &Path,
        state: &mut ProgressState,
        budget: &TimeBudget,
    ) -> Result<bool> {
        let mut cur = DumpCursor::from_state(state);
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(out)
            .map_err(|e| SiteportError::FileOpen {
                path: out.display().to_string(),
                reason: e.to_string(),
            })?;
        f.set_len(cur.file_size)?;
        f.seek(SeekFrom::End(0))?;
        let mut sink = LineSink {
            w: BufWriter::new(f),
            len: cur.file_size,
            cipher: self.cipher.as_ref(),
        };

        if cur.file_size == 0 {
            sink.line(&format!("-- siteport dump, {} tables", tables.len()))?;
        }

        while let Some(table) = tables.get(cur.table_index as usize) {
            let quoted = quote_ident(table);
            if cur.row_offset == 0 {
                sink.line(&format!("-- table {quoted}"))?;
                sink.line(&format!("DROP TABLE IF EXISTS {quoted};"))?;
                let schema = db.table_schema(table)?;
                let schema = format!("{};", schema.trim_end().trim_end_matches(';'));
                for l in schema.lines() {
                    sink.line(l)?;
                }
            }

            let rows = db.insert_statements(table, cur.row_offset, self.rows_per_batch)?;
            for stmt in &rows {
                sink.line(stmt)?;
            }
            if (rows.len() as u64) < self.rows_per_batch {
                cur.table_index += 1;
                cur.row_offset = 0;
            } else {
                cur.row_offset += rows.len() as u64;
            }

            sink.w.flush()?;
            cur.file_size = sink.len;
            cur.apply(state);
            if budget.exceeded() && (cur.table_index as usize) < tables.len() {
                debug!(table = %table, rows = cur.row_offset, bytes = cur.file_size, "dump batch ended");
                return Ok(false);
            }
        }

        sink.w.flush()?;
        sink.w.get_ref().sync_data()?;
        info!(tables = tables.len(), bytes = sink.len, "database dump complete");
        state.dump = Default::default();
        Ok(true)
    }
}

/// Backtick-quote an identifier, doubling embedded backticks.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}
