//! Site url rewrite over the restored tables.

use tracing::{debug, info};

use crate::error::Result;
use crate::pipeline::{Step, StepContext, StepOutcome};
use crate::restore::dump::blog_tables;
use crate::state::ProgressState;

/// `(from, to)` pairs for moving a site from `from` to `to`: the plain url and
/// its JSON-escaped form. Empty when either side is unknown or both match.
pub fn replacement_pairs(from: Option<&str>, to: Option<&str>) -> Vec<(String, String)> {
    let (Some(from), Some(to)) = (from, to) else {
        return Vec::new();
    };
    let from = from.trim_end_matches('/');
    let to = to.trim_end_matches('/');
    if from.is_empty() || from == to {
        return Vec::new();
    }
    let escape = |s: &str| s.replace('/', "\\/");
    vec![
        (from.to_string(), to.to_string()),
        (escape(from), escape(to)),
    ]
}

pub struct SearchReplace;

impl Step for SearchReplace {
    fn name(&self) -> &'static str {
        "import_search_replace"
    }

    fn run(&self, ctx: &mut StepContext<'_>, state: &mut ProgressState) -> Result<StepOutcome> {
        let pairs = replacement_pairs(
            state.package.source_site_url.as_deref(),
            state.job()?.site_url.as_deref(),
        );
        if pairs.is_empty() {
            state.rewrite = Default::default();
            return Ok(StepOutcome::Advance);
        }

        let tables = blog_tables(ctx.db, ctx.blog_id)?;
        let rows = ctx.config.rewrite_rows_per_batch.max(1);
        let slots = &mut state.rewrite;
        let mut index = slots.search_replace_table_index.unwrap_or(0);
        let mut offset = slots.search_replace_row_offset.unwrap_or(0);
        let mut changed = slots.search_replace_rows.unwrap_or(0);

        while let Some(table) = tables.get(index as usize) {
            let batch = ctx.db.replace_in_table(table, &pairs, offset, rows)?;
            changed += batch.rows_changed;
            if batch.rows_seen < rows {
                index += 1;
                offset = 0;
            } else {
                offset += batch.rows_seen;
            }
            slots.search_replace_table_index = Some(index);
            slots.search_replace_row_offset = Some(offset);
            slots.search_replace_rows = Some(changed);

            if (index as usize) < tables.len() && ctx.budget.exceeded() {
                debug!(table = %table, offset, changed, "rewrite batch ended");
                return Ok(StepOutcome::Retry);
            }
        }

        info!(tables = tables.len(), rows = changed, "site url rewritten");
        ctx.event("site url rewritten", Some(&format!("{changed} rows changed")));
        state.rewrite = Default::default();
        Ok(StepOutcome::Advance)
    }
}
