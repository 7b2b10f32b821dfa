use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use tracing::{debug, info};

use crate::budget::TimeBudget;
use crate::crypto::aead::LineCipher;
use crate::error::{Result, SiteportError};
use crate::restore::packet::{PacketDecision, PacketStage};
use crate::restore::{ends_statement, is_skippable};
use crate::services::Database;
use crate::state::ProgressState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreStatus {
    /// End of dump reached; restore slots cleared.
    Done,
    /// Budget spent; resume from the persisted offset.
    Partial,
    /// Packet limit raised; re-run the step before executing more.
    Restart,
}

/// Rewrites backtick-quoted table names from one prefix to another.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrefixRewrite {
    from: String,
    to: String,
}

impl PrefixRewrite {
    /// `None` when both prefixes are equal.
    pub fn new(from: &str, to: &str) -> Option<Self> {
        (from != to).then(|| Self {
            from: format!("`{from}"),
            to: format!("`{to}"),
        })
    }

    pub fn apply(&self, stmt: &str) -> String {
        stmt.replace(&self.from, &self.to)
    }
}

/// Streams a dump statement by statement, resumable by byte offset.
pub struct ChunkedRestoreReader {
    cipher: Option<LineCipher>,
    prefix: Option<PrefixRewrite>,
    packet_ceiling: u64,
}

impl ChunkedRestoreReader {
    pub fn new(packet_ceiling: u64) -> Self {
        Self {
            cipher: None,
            prefix: None,
            packet_ceiling,
        }
    }

    pub fn with_cipher(mut self, cipher: LineCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn with_prefix(mut self, rewrite: Option<PrefixRewrite>) -> Self {
        self.prefix = rewrite;
        self
    }

    /// Execute statements from the saved offset until EOF or budget exhaustion.
    ///
    /// Offset, bytes read and percentage are written to `state` after every
    /// executed statement; a failing statement leaves them at the previous one.
    pub fn run(
        &self,
        db: &mut dyn Database,
        dump: &Path,
        state: &mut ProgressState,
        budget: &TimeBudget,
    ) -> Result<RestoreStatus> {
        let file = File::open(dump).map_err(|e| SiteportError::FileOpen {
            path: dump.display().to_string(),
            reason: e.to_string(),
        })?;
        let final_size = match state.restore.database_final_size {
            Some(n) => n,
            None => {
                let n = file.metadata()?.len();
                state.restore.database_final_size = Some(n);
                n
            }
        };
        let start = state.restore.database_read_offset.unwrap_or(0);
        let mut r = BufReader::new(file);
        r.seek(SeekFrom::Start(start))?;

        let mut packet = PacketStage::from_state(state);
        let limit = packet.effective_limit(db)?;

        let mut pos = start;
        let mut stmt = String::new();
        let mut raw = Vec::new();
        let mut executed = 0u64;
        loop {
            raw.clear();
            let line_off = pos;
            let n = r.read_until(b'\n', &mut raw)?;
            let eof = n == 0;
            pos += n as u64;

            if !eof {
                let line = self.decode_line(line_off, &raw)?;
                if is_skippable(&line) {
                    continue;
                }
                stmt.push_str(&line);
                if !ends_statement(&line) {
                    stmt.push('\n');
                    continue;
                }
            } else if stmt.trim().is_empty() {
                break;
            }

            let sql = match &self.prefix {
                Some(p) => p.apply(stmt.trim_end()),
                None => stmt.trim_end().to_string(),
            };
            stmt.clear();
            if packet.admit(db, sql.len() as u64, limit, self.packet_ceiling)? == PacketDecision::Restart {
                packet.apply(state);
                info!(
                    size = sql.len(),
                    limit,
                    "max_allowed_packet raised, restarting restore"
                );
                return Ok(RestoreStatus::Restart);
            }
            db.query(&sql)?;
            executed += 1;
            record(state, pos, final_size);

            if eof {
                break;
            }
            if budget.exceeded() {
                if r.fill_buf()?.is_empty() {
                    break;
                }
                debug!(executed, offset = pos, final_size, "restore batch ended");
                return Ok(RestoreStatus::Partial);
            }
        }

        packet.restore_original(db)?;
        info!(executed, bytes = final_size, "database restore complete");
        state.restore = Default::default();
        Ok(RestoreStatus::Done)
    }

    fn decode_line(&self, offset: u64, raw: &[u8]) -> Result<String> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| SiteportError::Format(format!("dump line at {offset}: {e}")))?;
        let text = text.strip_suffix('\n').unwrap_or(text);
        let text = text.strip_suffix('\r').unwrap_or(text);
        match &self.cipher {
            Some(c) if !is_skippable(text) => c.open_line(offset, text),
            _ => Ok(text.to_string()),
        }
    }
}

/// Percentage of the dump consumed, rounded, never above 100.
pub fn percent_of(read: u64, final_size: u64) -> u8 {
    if final_size == 0 {
        return 100;
    }
    let p = (read as f64 / final_size as f64 * 100.0).round();
    p.min(100.0) as u8
}

fn record(state: &mut ProgressState, pos: u64, final_size: u64) {
    let r = &mut state.restore;
    r.database_read_offset = Some(pos);
    r.database_read_size = Some(pos);
    let pct = percent_of(pos, final_size);
    // a file that grew after sizing must not move the bar backwards
    r.percent_db_imported = Some(pct.max(r.percent_db_imported.unwrap_or(0)));
}
