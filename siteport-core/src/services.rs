//! Collaborators consumed by the step handlers.

use std::sync::Mutex;

use tracing::info;

use crate::error::Result;
use crate::sequence::Mode;

/// Rows touched by one search-replace batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RewriteBatch {
    pub rows_seen: u64,
    pub rows_changed: u64,
}

/// Database client for the blog being migrated.
pub trait Database {
    /// Execute one statement; returns affected rows.
    fn query(&mut self, sql: &str) -> Result<u64>;

    /// First column of the first row, rendered as text.
    fn get_var(&mut self, sql: &str) -> Result<Option<String>>;

    /// Table prefix of a blog (`wp_` for the main blog, `wp_<id>_` otherwise).
    fn prefix_of(&self, blog_id: u64) -> String;

    /// Tables whose name starts with `prefix`, sorted.
    fn show_tables(&mut self, prefix: &str) -> Result<Vec<String>>;

    /// `CREATE TABLE` statement of `table`, without the trailing `;`.
    fn table_schema(&mut self, table: &str) -> Result<String>;

    /// Single-line `INSERT` statements for a window of rows in primary order.
    fn insert_statements(&mut self, table: &str, offset: u64, limit: u64) -> Result<Vec<String>>;

    /// Apply `(from, to)` text replacements to a window of rows.
    fn replace_in_table(
        &mut self,
        table: &str,
        pairs: &[(String, String)],
        offset: u64,
        limit: u64,
    ) -> Result<RewriteBatch>;

    fn max_allowed_packet(&mut self) -> Result<u64>;

    fn set_max_allowed_packet(&mut self, bytes: u64) -> Result<()>;

    /// Whether the connection may raise server limits.
    fn has_elevated_privileges(&mut self) -> bool;
}

/// Ambient "current blog" of the host platform.
pub trait BlogContext {
    fn switch_to(&self, blog_id: u64);
    fn restore(&self);
}

/// Switches to a blog for its lifetime and restores on drop, error paths included.
pub struct BlogScope<'a> {
    ctx: &'a dyn BlogContext,
}

impl<'a> BlogScope<'a> {
    pub fn enter(ctx: &'a dyn BlogContext, blog_id: u64) -> Self {
        ctx.switch_to(blog_id);
        Self { ctx }
    }
}

impl Drop for BlogScope<'_> {
    fn drop(&mut self) {
        self.ctx.restore();
    }
}

/// Stack of switched-to blogs; `current` is the innermost.
#[derive(Debug, Default)]
pub struct BlogStack {
    stack: Mutex<Vec<u64>>,
}

impl BlogStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<u64> {
        self.stack.lock().ok().and_then(|s| s.last().copied())
    }

    pub fn depth(&self) -> usize {
        self.stack.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl BlogContext for BlogStack {
    fn switch_to(&self, blog_id: u64) {
        if let Ok(mut s) = self.stack.lock() {
            s.push(blog_id);
        }
    }

    fn restore(&self) {
        if let Ok(mut s) = self.stack.lock() {
            s.pop();
        }
    }
}

/// Fire-and-forget progress/event reporting. Implementations never fail.
pub trait EventSink {
    fn log_event(&self, message: &str, blog_id: u64, mode: Mode, step: &str, detail: Option<&str>);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn log_event(&self, message: &str, blog_id: u64, mode: Mode, step: &str, detail: Option<&str>) {
        match detail {
            Some(d) => info!(blog_id, mode = mode.as_str(), step, detail = d, "{message}"),
            None => info!(blog_id, mode = mode.as_str(), step, "{message}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub message: String,
    pub blog_id: u64,
    pub mode: Mode,
    pub step: String,
    pub detail: Option<String>,
}

/// Keeps every event; for tests and status output.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn log_event(&self, message: &str, blog_id: u64, mode: Mode, step: &str, detail: Option<&str>) {
        if let Ok(mut e) = self.events.lock() {
            e.push(Event {
                message: message.to_string(),
                blog_id,
                mode,
                step: step.to_string(),
                detail: detail.map(str::to_string),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing(ctx: &BlogStack) -> Result<()> {
        let _scope = BlogScope::enter(ctx, 7);
        assert_eq!(ctx.current(), Some(7));
        Err(crate::error::SiteportError::Database("boom".into()))
    }

    #[test]
    fn scope_restores_on_error_path() {
        let ctx = BlogStack::new();
        ctx.switch_to(1);
        assert!(failing(&ctx).is_err());
        assert_eq!(ctx.current(), Some(1));
        assert_eq!(ctx.depth(), 1);
    }

    #[test]
    fn memory_sink_records_fields() {
        let sink = MemorySink::new();
        sink.log_event("extracted", 3, Mode::Import, "import_extract", Some("12 files"));
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].step, "import_extract");
        assert_eq!(events[0].detail.as_deref(), Some("12 files"));
    }
}
