//! Step registry and the `run_once` driver.
//!
//! One call runs exactly one step for one `(blog_id, mode)` slot: load the
//! persisted state, run the current step under a time budget, pick the next
//! step, persist, return. Everything needed to continue lives in the state.

pub mod export;
pub mod import;
pub mod rewrite;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::budget::{Clock, SystemClock, TimeBudget};
use crate::config::{Config, RetryTimeout};
use crate::crypto::aead::LineCipher;
use crate::crypto::hex::parse_hex_array;
use crate::crypto::kdf::derive_key;
use crate::error::{Result, SiteportError};
use crate::sequence::{Mode, StepDescriptor, Transition};
use crate::services::{BlogContext, BlogScope, Database, EventSink};
use crate::state::store::StateStore;
use crate::state::{MigrationJob, ProgressState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Completion marker set; move to the next step.
    Advance,
    /// Work remains; run this step again.
    Retry,
}

/// Everything a step may touch during one invocation.
pub struct StepContext<'a> {
    pub blog_id: u64,
    pub mode: Mode,
    pub step: &'a str,
    pub config: &'a Config,
    pub budget: &'a TimeBudget,
    pub db: &'a mut dyn Database,
    pub events: &'a dyn EventSink,
}

impl StepContext<'_> {
    pub fn event(&self, message: &str, detail: Option<&str>) {
        self.events
            .log_event(message, self.blog_id, self.mode, self.step, detail);
    }
}

pub trait Step {
    fn name(&self) -> &'static str;

    fn run(&self, ctx: &mut StepContext<'_>, state: &mut ProgressState) -> Result<StepOutcome>;
}

/// Ordered, name-addressed step handlers for one mode.
#[derive(Default)]
pub struct StepRegistry {
    order: Vec<&'static str>,
    handlers: HashMap<&'static str, Box<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step; a second step with the same name replaces the first in place.
    pub fn register(mut self, step: impl Step + 'static) -> Self {
        let name = step.name();
        if self.handlers.insert(name, Box::new(step)).is_none() {
            self.order.push(name);
        }
        self
    }

    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Import => import::registry(),
            Mode::Export => export::registry(),
        }
    }

    pub fn descriptor(&self) -> StepDescriptor {
        StepDescriptor::new(self.order.iter().copied())
    }

    pub fn get(&self, name: &str) -> Result<&dyn Step> {
        self.handlers
            .get(name)
            .map(|b| b.as_ref())
            .ok_or_else(|| SiteportError::StepNotFound(name.to_string()))
    }
}

/// What one `run_once` call reports to the scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunReport {
    pub finished: bool,
    pub error: Option<String>,
    /// Step that ran (or would have run).
    pub step: Option<String>,
}

impl RunReport {
    fn pending(step: &str) -> Self {
        Self {
            finished: false,
            error: None,
            step: Some(step.to_string()),
        }
    }

    fn failed(step: Option<String>, error: String) -> Self {
        Self {
            finished: true,
            error: Some(error),
            step,
        }
    }
}

/// Scratch layout inside a job's work directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub stage: PathBuf,
    pub dump: PathBuf,
    pub media: PathBuf,
    pub list: PathBuf,
}

impl Layout {
    pub fn of(job: &MigrationJob) -> Self {
        let stage = job.work_dir.join("stage");
        Self {
            dump: stage.join(crate::container::meta::DUMP_ENTRY),
            media: stage.join(crate::container::meta::MEDIA_PREFIX),
            list: job.work_dir.join("filelist.txt"),
            stage,
        }
    }
}

/// Line cipher for a dump sealed under `salt_hex`; `None` for a plain dump.
pub fn dump_cipher(config: &Config, salt_hex: Option<&str>) -> Result<Option<LineCipher>> {
    let Some(salt_hex) = salt_hex else {
        return Ok(None);
    };
    let key = config.dump_key.as_ref().ok_or_else(|| {
        SiteportError::Crypto("dump is encrypted; set SITEPORT_KEY or SITEPORT_PASSPHRASE".into())
    })?;
    let salt: [u8; 32] = parse_hex_array(salt_hex)?;
    Ok(Some(LineCipher::new(derive_key(key, &salt)?, salt)))
}

pub struct Driver<'a> {
    config: Config,
    clock: Arc<dyn Clock>,
    store: &'a dyn StateStore,
    db: &'a mut dyn Database,
    blogs: &'a dyn BlogContext,
    events: &'a dyn EventSink,
    import: StepRegistry,
    export: StepRegistry,
}

impl<'a> Driver<'a> {
    pub fn new(
        config: Config,
        store: &'a dyn StateStore,
        db: &'a mut dyn Database,
        blogs: &'a dyn BlogContext,
        events: &'a dyn EventSink,
    ) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            store,
            db,
            blogs,
            events,
            import: StepRegistry::for_mode(Mode::Import),
            export: StepRegistry::for_mode(Mode::Export),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_registry(mut self, mode: Mode, registry: StepRegistry) -> Self {
        match mode {
            Mode::Import => self.import = registry,
            Mode::Export => self.export = registry,
        }
        self
    }

    fn registry(&self, mode: Mode) -> &StepRegistry {
        match mode {
            Mode::Import => &self.import,
            Mode::Export => &self.export,
        }
    }

    /// Persist a fresh state for `job`. Refuses to overwrite a live migration.
    pub fn start(&mut self, mode: Mode, blog_id: u64, job: MigrationJob) -> Result<()> {
        if let Some(existing) = self.store.load(blog_id, mode)? {
            if !existing.failed() && existing.control.cancelled != Some(true) {
                return Err(SiteportError::Config(format!(
                    "blog {blog_id} already has a {} in progress",
                    mode.as_str()
                )));
            }
        }
        let first = self
            .registry(mode)
            .descriptor()
            .first()
            .map(str::to_string)
            .ok_or_else(|| SiteportError::StepNotFound("<empty chain>".into()))?;
        let mut state = ProgressState::new(job);
        state.control.current_method = Some(first.clone());
        state.control.ongoing = Some(true);
        self.store.save(blog_id, mode, &state)?;
        info!(blog_id, mode = mode.as_str(), step = %first, "migration started");
        Ok(())
    }

    /// Flag the slot as cancelled; the next `run_once` clears it.
    pub fn cancel(&mut self, mode: Mode, blog_id: u64) -> Result<bool> {
        let Some(mut state) = self.store.load(blog_id, mode)? else {
            return Ok(false);
        };
        state.control.cancelled = Some(true);
        self.store.save(blog_id, mode, &state)?;
        info!(blog_id, mode = mode.as_str(), "cancel requested");
        Ok(true)
    }

    pub fn status(&self, mode: Mode, blog_id: u64) -> Result<Option<ProgressState>> {
        self.store.load(blog_id, mode)
    }

    /// Run the current step once.
    pub fn run_once(&mut self, mode: Mode, blog_id: u64) -> Result<RunReport> {
        let mut state = self.store.load(blog_id, mode)?.unwrap_or_default();

        if let Some(err) = &state.control.error {
            return Ok(RunReport::failed(state.control.current_method.clone(), err.clone()));
        }
        if state.control.cancelled == Some(true) {
            self.store.clear(blog_id, mode)?;
            self.events
                .log_event("migration cancelled", blog_id, mode, "", None);
            return Ok(RunReport::failed(None, SiteportError::Cancelled.to_string()));
        }

        let registry = match mode {
            Mode::Import => &self.import,
            Mode::Export => &self.export,
        };
        let descriptor = registry.descriptor();
        let current = match &state.control.current_method {
            Some(c) => c.clone(),
            None => descriptor
                .first()
                .map(str::to_string)
                .ok_or_else(|| SiteportError::StepNotFound("<empty chain>".into()))?,
        };

        let outcome = descriptor.resolve(&current).and_then(|resolved| {
            let step = registry.get(&current)?;
            let budget = TimeBudget::start(self.clock.clone(), self.config.retry_timeout(&current));
            debug!(blog_id, mode = mode.as_str(), step = %current, timeout = budget.timeout(), "running step");
            let _scope = BlogScope::enter(self.blogs, blog_id);
            let mut ctx = StepContext {
                blog_id,
                mode,
                step: &current,
                config: &self.config,
                budget: &budget,
                db: &mut *self.db,
                events: self.events,
            };
            step.run(&mut ctx, &mut state).map(|o| (resolved, o))
        });

        let (resolved, outcome) = match outcome {
            Ok(v) => v,
            Err(e) => {
                let msg = e.to_string();
                error!(blog_id, mode = mode.as_str(), step = %current, error = %msg, "step failed");
                state.control.current_method = Some(current.clone());
                state.control.error = Some(msg.clone());
                state.control.ongoing = Some(false);
                self.store.save(blog_id, mode, &state)?;
                self.events
                    .log_event("step failed", blog_id, mode, &current, Some(&msg));
                return Ok(RunReport::failed(Some(current), msg));
            }
        };

        if outcome == StepOutcome::Advance && resolved.is_last() {
            self.store.clear(blog_id, mode)?;
            info!(blog_id, mode = mode.as_str(), "migration complete");
            self.events
                .log_event("migration complete", blog_id, mode, &current, None);
            return Ok(RunReport {
                finished: true,
                error: None,
                step: Some(current),
            });
        }

        let t = match outcome {
            StepOutcome::Advance => Transition::advance(&resolved),
            StepOutcome::Retry => Transition::retry(&resolved),
        };
        let next = descriptor.resolve(&t.run_next)?.next;
        state.control.current_method = Some(t.run_next.clone());
        state.control.previous_method = Some(t.previous).filter(|p| !p.is_empty());
        state.control.next_method = Some(next).filter(|n| !n.is_empty());
        state.control.ongoing = Some(true);
        self.store.save(blog_id, mode, &state)?;
        if outcome == StepOutcome::Advance {
            self.events
                .log_event("step complete", blog_id, mode, &current, None);
        }
        Ok(RunReport::pending(&t.run_next))
    }

    /// CLI scheduling: call `run_once` until the chain finishes.
    pub fn run_until_done(&mut self, mode: Mode, blog_id: u64, max_calls: u64) -> Result<(RunReport, u64)> {
        let mut calls = 0;
        loop {
            let report = self.run_once(mode, blog_id)?;
            calls += 1;
            if report.finished || calls >= max_calls {
                return Ok((report, calls));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{BlogStack, MemorySink, RewriteBatch};
    use crate::state::store::MemoryStateStore;
    use std::cell::Cell;
    use std::rc::Rc;

    struct NoDb;

    impl Database for NoDb {
        fn query(&mut self, _sql: &str) -> Result<u64> {
            Ok(0)
        }
        fn get_var(&mut self, _sql: &str) -> Result<Option<String>> {
            Ok(None)
        }
        fn prefix_of(&self, _blog_id: u64) -> String {
            "wp_".into()
        }
        fn show_tables(&mut self, _prefix: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }
        fn table_schema(&mut self, _table: &str) -> Result<String> {
            Ok(String::new())
        }
        fn insert_statements(&mut self, _t: &str, _o: u64, _l: u64) -> Result<Vec<String>> {
            Ok(vec![])
        }
        fn replace_in_table(
            &mut self,
            _t: &str,
            _p: &[(String, String)],
            _o: u64,
            _l: u64,
        ) -> Result<RewriteBatch> {
            Ok(RewriteBatch::default())
        }
        fn max_allowed_packet(&mut self) -> Result<u64> {
            Ok(u64::MAX)
        }
        fn set_max_allowed_packet(&mut self, _bytes: u64) -> Result<()> {
            Ok(())
        }
        fn has_elevated_privileges(&mut self) -> bool {
            false
        }
    }

    /// Needs `rounds` invocations before it advances; fails instead when told to.
    struct Scripted {
        name: &'static str,
        rounds: u64,
        fail: bool,
        seen_blog: Rc<Cell<Option<u64>>>,
        blogs: Rc<BlogStack>,
    }

    impl Step for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        fn run(&self, ctx: &mut StepContext<'_>, state: &mut ProgressState) -> Result<StepOutcome> {
            self.seen_blog.set(self.blogs.current());
            assert_eq!(ctx.step, self.name);
            if self.fail {
                return Err(SiteportError::Database("table is locked".into()));
            }
            let key = format!("{}_rounds", self.name);
            let n = state.get(&key).and_then(|v| v.as_u64()).unwrap_or(0) + 1;
            if n >= self.rounds {
                state.remove(&key)?;
                Ok(StepOutcome::Advance)
            } else {
                state.set(&key, serde_json::json!(n))?;
                Ok(StepOutcome::Retry)
            }
        }
    }

    struct Harness {
        store: MemoryStateStore,
        sink: MemorySink,
        blogs: Rc<BlogStack>,
        seen: Rc<Cell<Option<u64>>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: MemoryStateStore::new(),
                sink: MemorySink::new(),
                blogs: Rc::new(BlogStack::new()),
                seen: Rc::new(Cell::new(None)),
            }
        }

        fn step(&self, name: &'static str, rounds: u64, fail: bool) -> Scripted {
            Scripted {
                name,
                rounds,
                fail,
                seen_blog: self.seen.clone(),
                blogs: self.blogs.clone(),
            }
        }
    }

    #[test]
    fn chain_advances_retries_and_clears_on_success() {
        let h = Harness::new();
        let reg = StepRegistry::new()
            .register(h.step("a", 1, false))
            .register(h.step("b", 3, false))
            .register(h.step("c", 1, false));
        let mut db = NoDb;
        let mut d = Driver::new(Config::default(), &h.store, &mut db, h.blogs.as_ref(), &h.sink)
            .with_registry(Mode::Import, reg);

        d.start(Mode::Import, 4, MigrationJob::default()).unwrap();
        let mut trail = Vec::new();
        loop {
            let r = d.run_once(Mode::Import, 4).unwrap();
            if r.finished {
                assert_eq!(r.error, None);
                break;
            }
            let s = d.status(Mode::Import, 4).unwrap().unwrap();
            trail.push((
                s.control.current_method.unwrap(),
                s.control.previous_method.unwrap_or_default(),
            ));
        }
        assert_eq!(
            trail,
            vec![
                ("b".to_string(), "a".to_string()),
                ("b".to_string(), "a".to_string()),
                ("b".to_string(), "a".to_string()),
                ("c".to_string(), "b".to_string()),
            ]
        );
        assert_eq!(d.status(Mode::Import, 4).unwrap(), None);
        assert_eq!(h.seen.get(), Some(4));
        assert_eq!(h.blogs.depth(), 0);
    }

    #[test]
    fn failure_is_persisted_and_short_circuits() {
        let h = Harness::new();
        let reg = StepRegistry::new()
            .register(h.step("a", 1, false))
            .register(h.step("b", 1, true));
        let mut db = NoDb;
        let mut d = Driver::new(Config::default(), &h.store, &mut db, h.blogs.as_ref(), &h.sink)
            .with_registry(Mode::Export, reg);

        assert!(!d.run_once(Mode::Export, 2).unwrap().finished);
        let r = d.run_once(Mode::Export, 2).unwrap();
        assert!(r.finished);
        assert!(r.error.as_deref().unwrap().contains("table is locked"));
        assert_eq!(h.blogs.depth(), 0);

        let s = d.status(Mode::Export, 2).unwrap().unwrap();
        assert_eq!(s.control.current_method.as_deref(), Some("b"));
        assert!(s.failed());

        // not re-run: same error, step not invoked again
        h.seen.set(None);
        let again = d.run_once(Mode::Export, 2).unwrap();
        assert_eq!(again.error, r.error);
        assert_eq!(h.seen.get(), None);
    }

    #[test]
    fn missing_state_starts_at_first_step() {
        let h = Harness::new();
        let reg = StepRegistry::new()
            .register(h.step("first", 2, false))
            .register(h.step("second", 1, false));
        let mut db = NoDb;
        let mut d = Driver::new(Config::default(), &h.store, &mut db, h.blogs.as_ref(), &h.sink)
            .with_registry(Mode::Import, reg);
        let r = d.run_once(Mode::Import, 9).unwrap();
        assert_eq!(r.step.as_deref(), Some("first"));
        let s = d.status(Mode::Import, 9).unwrap().unwrap();
        assert_eq!(s.control.previous_method, None);
        assert_eq!(s.control.next_method.as_deref(), Some("second"));
    }

    #[test]
    fn unknown_current_step_fails_the_chain() {
        let h = Harness::new();
        let mut s = ProgressState::default();
        s.control.current_method = Some("import_teleport".into());
        h.store.save(1, Mode::Import, &s).unwrap();
        let mut db = NoDb;
        let mut d = Driver::new(Config::default(), &h.store, &mut db, h.blogs.as_ref(), &h.sink);
        let r = d.run_once(Mode::Import, 1).unwrap();
        assert!(r.finished);
        assert!(r.error.unwrap().contains("import_teleport"));
    }

    #[test]
    fn cancel_clears_between_chunks() {
        let h = Harness::new();
        let reg = StepRegistry::new().register(h.step("slow", 100, false));
        let mut db = NoDb;
        let mut d = Driver::new(Config::default(), &h.store, &mut db, h.blogs.as_ref(), &h.sink)
            .with_registry(Mode::Import, reg);
        d.start(Mode::Import, 3, MigrationJob::default()).unwrap();
        d.run_once(Mode::Import, 3).unwrap();
        assert!(d.cancel(Mode::Import, 3).unwrap());
        let r = d.run_once(Mode::Import, 3).unwrap();
        assert!(r.finished);
        assert_eq!(r.error.as_deref(), Some("migration cancelled"));
        assert_eq!(d.status(Mode::Import, 3).unwrap(), None);
        assert!(!d.cancel(Mode::Import, 3).unwrap());
    }

    #[test]
    fn blogs_do_not_share_state() {
        let h = Harness::new();
        let reg = || {
            StepRegistry::new()
                .register(h.step("a", 2, false))
                .register(h.step("b", 1, false))
        };
        let mut db = NoDb;
        let mut d = Driver::new(Config::default(), &h.store, &mut db, h.blogs.as_ref(), &h.sink)
            .with_registry(Mode::Import, reg());
        d.run_once(Mode::Import, 1).unwrap();
        d.run_once(Mode::Import, 2).unwrap();
        d.run_once(Mode::Import, 1).unwrap();
        let one = d.status(Mode::Import, 1).unwrap().unwrap();
        let two = d.status(Mode::Import, 2).unwrap().unwrap();
        assert_eq!(one.control.current_method.as_deref(), Some("b"));
        assert_eq!(two.control.current_method.as_deref(), Some("a"));
    }

    #[test]
    fn registry_order_matches_step_lists() {
        for mode in [Mode::Import, Mode::Export] {
            assert_eq!(
                StepRegistry::for_mode(mode).descriptor(),
                StepDescriptor::for_mode(mode)
            );
        }
    }
}
