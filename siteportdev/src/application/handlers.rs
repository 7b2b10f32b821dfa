use std::path::{Path, PathBuf};

use siteport_core::container::entry::EntryKind;
use siteport_core::container::meta::ArchiveKind;
use siteport_core::error::{Result, SiteportError};
use siteport_core::services::{BlogStack, TracingSink};
use siteport_core::sqlite::SqliteDatabase;
use siteport_core::state::store::{FsStateStore, StateStore};
use siteport_core::{Config, Driver, MigrationJob, Mode, list, verify};
use tracing::info;

use crate::presentation::cli::JobArgs;

fn load_config(state_dir: Option<PathBuf>) -> Result<Config> {
    let mut config = Config::from_env()?;
    if let Some(dir) = state_dir {
        config.state_dir = dir;
    }
    Ok(config)
}

fn open_db(path: &Path, config: &Config) -> Result<SqliteDatabase> {
    SqliteDatabase::open(path, &config.table_prefix)
}

fn job_from_args(args: &JobArgs, encrypt_dump: bool, kind: ArchiveKind) -> MigrationJob {
    MigrationJob {
        package: args.package.clone(),
        work_dir: args.work_dir.clone(),
        media_dir: args.media_dir.clone(),
        exclude: args.exclude.clone(),
        site_url: args.site_url.clone(),
        encrypt_dump,
        kind,
    }
}

/// Start (or resume) a migration and call `run_once` until it finishes.
pub fn handle_migrate(
    state_dir: Option<PathBuf>,
    mode: Mode,
    args: JobArgs,
    encrypt_dump: bool,
    kind: ArchiveKind,
) -> Result<()> {
    let config = load_config(state_dir)?;
    let store = FsStateStore::new(&config.state_dir)?;
    let mut db = open_db(&args.db, &config)?;
    let blogs = BlogStack::new();
    let sink = TracingSink;
    let blog = args.blog;

    if args.restart {
        store.clear(blog, mode)?;
    }
    let resuming = store.load(blog, mode)?.is_some();

    let mut driver = Driver::new(config, &store, &mut db, &blogs, &sink);
    if resuming {
        info!(blog, mode = mode.as_str(), "resuming saved progress");
    } else {
        driver.start(mode, blog, job_from_args(&args, encrypt_dump, kind))?;
    }

    let max_calls = args.max_calls.unwrap_or(u64::MAX);
    let mut calls = 0u64;
    loop {
        let report = driver.run_once(mode, blog)?;
        calls += 1;
        if let Some(reason) = report.error {
            return Err(SiteportError::MigrationFailed {
                mode: mode.as_str(),
                blog_id: blog,
                reason,
            });
        }
        if report.finished {
            eprintln!("{}: done after {calls} calls", mode.as_str());
            return Ok(());
        }
        if let Some(step) = &report.step {
            eprintln!("{}: [{calls}] {step}", mode.as_str());
        }
        if calls >= max_calls {
            eprintln!(
                "{}: paused after {calls} calls; run again to continue",
                mode.as_str()
            );
            return Ok(());
        }
    }
}

/// One scheduler poll: exactly one step invocation.
pub fn handle_step(state_dir: Option<PathBuf>, mode: Mode, db_path: PathBuf, blog: u64) -> Result<()> {
    let config = load_config(state_dir)?;
    let store = FsStateStore::new(&config.state_dir)?;
    let mut db = open_db(&db_path, &config)?;
    let blogs = BlogStack::new();
    let sink = TracingSink;
    let report = Driver::new(config, &store, &mut db, &blogs, &sink).run_once(mode, blog)?;
    match (report.finished, report.error) {
        (_, Some(e)) => println!("failed: {e}"),
        (true, None) => println!("finished"),
        (false, None) => println!("next: {}", report.step.unwrap_or_default()),
    }
    Ok(())
}

pub fn handle_status(state_dir: Option<PathBuf>, mode: Mode, blog: u64) -> Result<()> {
    let config = load_config(state_dir)?;
    let store = FsStateStore::new(&config.state_dir)?;
    match store.load(blog, mode)? {
        Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
        None => println!("no {} in progress for blog {blog}", mode.as_str()),
    }
    Ok(())
}

pub fn handle_cancel(state_dir: Option<PathBuf>, mode: Mode, blog: u64) -> Result<()> {
    let config = load_config(state_dir)?;
    let store = FsStateStore::new(&config.state_dir)?;
    let Some(mut state) = store.load(blog, mode)? else {
        eprintln!("cancel: nothing to cancel");
        return Ok(());
    };
    state.control.cancelled = Some(true);
    store.save(blog, mode, &state)?;
    eprintln!("cancel: {} of blog {blog} flagged", mode.as_str());
    Ok(())
}

pub fn handle_list(package: PathBuf) -> Result<()> {
    let l = list(&package)?;
    println!(
        "blog={} prefix={} url={} kind={:?} encrypted={}",
        l.meta.blog_id,
        l.meta.table_prefix,
        l.meta.site_url.as_deref().unwrap_or("-"),
        l.meta.kind,
        l.meta.dump_salt.is_some()
    );
    for e in &l.entries {
        match e.kind {
            EntryKind::Dir => println!("{:>12}  {}/", "-", e.path),
            EntryKind::File => println!("{:>12}  {}", e.size, e.path),
        }
    }
    eprintln!("{} entries, {} bytes", l.entries.len(), l.total_bytes);
    Ok(())
}

pub fn handle_verify(package: PathBuf) -> Result<()> {
    let r = verify(&package)?;
    if !r.is_ok() {
        for p in &r.damaged {
            eprintln!("damaged: {p}");
        }
        return Err(SiteportError::Format(format!(
            "{} damaged entries",
            r.damaged.len()
        )));
    }
    eprintln!(
        "verify: OK ({} files, {} dirs, {} frames, {} bytes)",
        r.files, r.dirs, r.frames, r.bytes
    );
    Ok(())
}
