//! Export chain: blog tables and uploads in, package out.

use std::fs;

use time::OffsetDateTime;
use tracing::info;

use crate::batch::BatchPolicy;
use crate::container::meta::PackageMeta;
use crate::copy::delete::{delete_tree, DeleteOutcome};
use crate::copy::exclude::ExcludeRules;
use crate::copy::{ChunkedDirectoryCopier, CopyCursor};
use crate::crypto::hex::salt_to_hex;
use crate::crypto::kdf::random_salt;
use crate::error::{Result, SiteportError};
use crate::pack::walker::{write_file_list, ListCursor};
use crate::pack::writer::{ArchiveWriter, WriteResume};
use crate::pipeline::{dump_cipher, Layout, Step, StepContext, StepOutcome, StepRegistry};
use crate::restore::dump::{blog_tables, DumpWriter};
use crate::state::ProgressState;

pub fn registry() -> StepRegistry {
    StepRegistry::new()
        .register(Prepare)
        .register(DumpDatabase)
        .register(CopyMedia)
        .register(ListFiles)
        .register(Archive)
        .register(Finalize)
}

/// Clears leftovers of an earlier attempt and fixes the package facts.
pub struct Prepare;

impl Step for Prepare {
    fn name(&self) -> &'static str {
        "export_prepare"
    }

    fn run(&self, ctx: &mut StepContext<'_>, state: &mut ProgressState) -> Result<StepOutcome> {
        let job = state.job()?.clone();
        let layout = Layout::of(&job);
        if job.encrypt_dump && ctx.config.dump_key.is_none() {
            return Err(SiteportError::Config(
                "dump encryption requested but neither SITEPORT_KEY nor SITEPORT_PASSPHRASE is set".into(),
            ));
        }
        if delete_tree(&layout.stage, ctx.budget)? == DeleteOutcome::Retry {
            return Ok(StepOutcome::Retry);
        }
        delete_tree(&layout.list, ctx.budget)?;
        fs::create_dir_all(&layout.stage)?;

        let p = &mut state.package;
        if job.encrypt_dump && p.dump_salt.is_none() {
            p.dump_salt = Some(salt_to_hex(&random_salt()?));
        }
        p.source_table_prefix = Some(ctx.db.prefix_of(ctx.blog_id));
        p.source_site_url = job.site_url.clone();
        p.package_kind = Some(job.kind);
        Ok(StepOutcome::Advance)
    }
}

pub struct DumpDatabase;

impl Step for DumpDatabase {
    fn name(&self) -> &'static str {
        "export_dump_database"
    }

    fn run(&self, ctx: &mut StepContext<'_>, state: &mut ProgressState) -> Result<StepOutcome> {
        let layout = Layout::of(state.job()?);
        let tables = blog_tables(ctx.db, ctx.blog_id)?;
        let mut writer = DumpWriter::new(ctx.config.dump_rows_per_batch);
        if let Some(c) = dump_cipher(ctx.config, state.package.dump_salt.as_deref())? {
            writer = writer.with_cipher(c);
        }
        if !writer.run(ctx.db, &tables, &layout.dump, state, ctx.budget)? {
            return Ok(StepOutcome::Retry);
        }
        ctx.event("database dumped", Some(&format!("{} tables", tables.len())));
        Ok(StepOutcome::Advance)
    }
}

pub struct CopyMedia;

impl Step for CopyMedia {
    fn name(&self) -> &'static str {
        "export_copy_media"
    }

    fn run(&self, ctx: &mut StepContext<'_>, state: &mut ProgressState) -> Result<StepOutcome> {
        let job = state.job()?.clone();
        if !job.media_dir.is_dir() {
            info!(media_dir = %job.media_dir.display(), "no uploads directory, skipping");
            return Ok(StepOutcome::Advance);
        }
        let layout = Layout::of(&job);
        let copier = ChunkedDirectoryCopier::new(
            BatchPolicy::from_config(ctx.config, job.kind),
            ExcludeRules::new(&job.exclude),
        );
        let cur = copier.run(&job.media_dir, &layout.media, &CopyCursor::from_state(state), ctx.budget)?;
        if let Some(e) = &cur.error {
            ctx.event("file not copied", Some(e));
        }
        cur.apply(state);
        Ok(if cur.done {
            StepOutcome::Advance
        } else {
            StepOutcome::Retry
        })
    }
}

/// Walks the staging tree into the list side file the archive step streams from.
pub struct ListFiles;

impl Step for ListFiles {
    fn name(&self) -> &'static str {
        "export_list_files"
    }

    fn run(&self, ctx: &mut StepContext<'_>, state: &mut ProgressState) -> Result<StepOutcome> {
        let layout = Layout::of(state.job()?);
        let cur = write_file_list(&layout.stage, &layout.list, &ListCursor::from_state(state), ctx.budget)?;
        cur.apply(state);
        Ok(if cur.done {
            StepOutcome::Advance
        } else {
            StepOutcome::Retry
        })
    }
}

pub struct Archive;

impl Step for Archive {
    fn name(&self) -> &'static str {
        "export_archive"
    }

    fn run(&self, ctx: &mut StepContext<'_>, state: &mut ProgressState) -> Result<StepOutcome> {
        let job = state.job()?.clone();
        let layout = Layout::of(&job);
        let meta = PackageMeta {
            blog_id: ctx.blog_id,
            table_prefix: state
                .package
                .source_table_prefix
                .clone()
                .unwrap_or_else(|| ctx.db.prefix_of(ctx.blog_id)),
            site_url: state.package.source_site_url.clone(),
            created: OffsetDateTime::now_utc().unix_timestamp(),
            tool: format!("siteport/{}", env!("CARGO_PKG_VERSION")),
            kind: job.kind,
            dump_salt: state.package.dump_salt.clone(),
        };

        let writer = ArchiveWriter::new(BatchPolicy::from_config(ctx.config, job.kind));
        let cur = writer.run(
            &job.package,
            &layout.stage,
            &layout.list,
            &meta,
            &WriteResume::from_state(state),
            ctx.budget,
        )?;
        if let Some(e) = &cur.error {
            ctx.event("file not archived", Some(e));
        }
        if !cur.done {
            cur.apply(state);
            return Ok(StepOutcome::Retry);
        }

        ctx.event(
            "package written",
            Some(&format!(
                "{} entries, {} bytes, {} failed",
                cur.committed.entry_count, cur.committed.total_u, cur.failed
            )),
        );
        state.archive = Default::default();
        Ok(StepOutcome::Advance)
    }
}

pub struct Finalize;

impl Step for Finalize {
    fn name(&self) -> &'static str {
        "export_finalize"
    }

    fn run(&self, ctx: &mut StepContext<'_>, state: &mut ProgressState) -> Result<StepOutcome> {
        let job = state.job()?;
        let layout = Layout::of(job);
        if delete_tree(&layout.stage, ctx.budget)? == DeleteOutcome::Retry {
            return Ok(StepOutcome::Retry);
        }
        delete_tree(&layout.list, ctx.budget)?;
        info!(package = %job.package.display(), "export complete");
        Ok(StepOutcome::Advance)
    }
}
