//! Import chain: package in, blog tables and uploads out.

use std::fs;

use tracing::info;

use crate::batch::BatchPolicy;
use crate::copy::delete::{delete_tree, DeleteOutcome};
use crate::copy::exclude::ExcludeRules;
use crate::copy::{ChunkedDirectoryCopier, CopyCursor};
use crate::error::{Result, SiteportError};
use crate::pipeline::rewrite::SearchReplace;
use crate::pipeline::{dump_cipher, Layout, Step, StepContext, StepOutcome, StepRegistry};
use crate::read::extract::{ChunkedArchiveExtractor, ExtractResume};
use crate::read::opened::Opened;
use crate::restore::reader::{ChunkedRestoreReader, PrefixRewrite, RestoreStatus};
use crate::state::ProgressState;

pub fn registry() -> StepRegistry {
    StepRegistry::new()
        .register(Validate)
        .register(Extract)
        .register(RestoreDatabase)
        .register(SearchReplace)
        .register(CopyMedia)
        .register(Cleanup)
}

/// Opens the package once and records what later steps need from its meta.
pub struct Validate;

impl Step for Validate {
    fn name(&self) -> &'static str {
        "import_validate"
    }

    fn run(&self, ctx: &mut StepContext<'_>, state: &mut ProgressState) -> Result<StepOutcome> {
        let job = state.job()?.clone();
        let pkg = Opened::open(&job.package)?;
        let meta = &pkg.meta;
        if meta.dump_salt.is_some() && ctx.config.dump_key.is_none() {
            return Err(SiteportError::Crypto(
                "package dump is encrypted; set SITEPORT_KEY or SITEPORT_PASSPHRASE".into(),
            ));
        }
        fs::create_dir_all(&job.work_dir)?;

        let p = &mut state.package;
        p.source_table_prefix = Some(meta.table_prefix.clone());
        p.source_site_url = meta.site_url.clone();
        p.dump_salt = meta.dump_salt.clone();
        p.package_kind = Some(meta.kind);

        info!(
            package = %job.package.display(),
            entries = pkg.tail.entry_count,
            bytes = pkg.tail.total_u,
            source_blog = meta.blog_id,
            "package accepted"
        );
        ctx.event(
            "package validated",
            Some(&format!("{} entries, {} bytes", pkg.tail.entry_count, pkg.tail.total_u)),
        );
        Ok(StepOutcome::Advance)
    }
}

pub struct Extract;

impl Step for Extract {
    fn name(&self) -> &'static str {
        "import_extract"
    }

    fn run(&self, ctx: &mut StepContext<'_>, state: &mut ProgressState) -> Result<StepOutcome> {
        let job = state.job()?.clone();
        let layout = Layout::of(&job);
        let policy = BatchPolicy::from_config(ctx.config, state.package.package_kind.unwrap_or_default());

        let cur = ChunkedArchiveExtractor::new(policy).run(
            &job.package,
            &layout.stage,
            &ExtractResume::from_state(state),
            ctx.budget,
        )?;
        if let Some(e) = &cur.error {
            ctx.event("entry skipped", Some(e));
        }
        if !cur.done {
            cur.apply(state);
            return Ok(StepOutcome::Retry);
        }

        ctx.event(
            "package extracted",
            Some(&format!(
                "{} of {} entries, {} failed",
                cur.extracted, cur.total_files, cur.failed
            )),
        );
        state.archive = Default::default();
        state.tar = Default::default();
        Ok(StepOutcome::Advance)
    }
}

pub struct RestoreDatabase;

impl Step for RestoreDatabase {
    fn name(&self) -> &'static str {
        "import_restore_database"
    }

    fn run(&self, ctx: &mut StepContext<'_>, state: &mut ProgressState) -> Result<StepOutcome> {
        let layout = Layout::of(state.job()?);
        if !layout.dump.is_file() {
            if state.restore.database_read_offset.is_some() {
                return Err(SiteportError::MissingResumeData(format!(
                    "dump {} vanished mid-restore",
                    layout.dump.display()
                )));
            }
            ctx.event("package has no database", None);
            return Ok(StepOutcome::Advance);
        }

        let from = state
            .package
            .source_table_prefix
            .clone()
            .unwrap_or_else(|| ctx.config.table_prefix.clone());
        let to = ctx.db.prefix_of(ctx.blog_id);
        let mut reader = ChunkedRestoreReader::new(ctx.config.max_packet_ceiling)
            .with_prefix(PrefixRewrite::new(&from, &to));
        if let Some(c) = dump_cipher(ctx.config, state.package.dump_salt.as_deref())? {
            reader = reader.with_cipher(c);
        }

        match reader.run(ctx.db, &layout.dump, state, ctx.budget)? {
            RestoreStatus::Done => {
                ctx.event("database restored", None);
                Ok(StepOutcome::Advance)
            }
            RestoreStatus::Partial | RestoreStatus::Restart => Ok(StepOutcome::Retry),
        }
    }
}

pub struct CopyMedia;

impl Step for CopyMedia {
    fn name(&self) -> &'static str {
        "import_copy_media"
    }

    fn run(&self, ctx: &mut StepContext<'_>, state: &mut ProgressState) -> Result<StepOutcome> {
        let job = state.job()?.clone();
        let layout = Layout::of(&job);
        if !layout.media.is_dir() {
            state.copy = Default::default();
            return Ok(StepOutcome::Advance);
        }

        let policy = BatchPolicy::from_config(ctx.config, state.package.package_kind.unwrap_or_default());
        let copier = ChunkedDirectoryCopier::new(policy, ExcludeRules::new(&job.exclude));
        let cur = copier.run(&layout.media, &job.media_dir, &CopyCursor::from_state(state), ctx.budget)?;
        if let Some(e) = &cur.error {
            ctx.event("file not copied", Some(e));
        }
        cur.apply(state);
        if cur.done {
            ctx.event(
                "uploads copied",
                Some(&format!("{} files, {} failed", cur.processed, cur.failed)),
            );
            Ok(StepOutcome::Advance)
        } else {
            Ok(StepOutcome::Retry)
        }
    }
}

pub struct Cleanup;

impl Step for Cleanup {
    fn name(&self) -> &'static str {
        "import_cleanup"
    }

    fn run(&self, ctx: &mut StepContext<'_>, state: &mut ProgressState) -> Result<StepOutcome> {
        let layout = Layout::of(state.job()?);
        if delete_tree(&layout.stage, ctx.budget)? == DeleteOutcome::Retry {
            return Ok(StepOutcome::Retry);
        }
        Ok(StepOutcome::Advance)
    }
}
