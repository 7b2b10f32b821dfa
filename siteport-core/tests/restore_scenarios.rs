use std::fs;
use std::sync::Arc;

use siteport_core::config::MIB;
use siteport_core::error::Result;
use siteport_core::pipeline::import::RestoreDatabase;
use siteport_core::pipeline::Layout;
use siteport_core::services::{BlogStack, Database, MemorySink, RewriteBatch};
use siteport_core::state::store::{MemoryStateStore, StateStore};
use siteport_core::{Config, Driver, MigrationJob, Mode, StepRegistry, TickClock};

/// Records every executed statement; the packet limit is fully scriptable.
struct Recorder {
    executed: Vec<String>,
    packet: u64,
    privileged: bool,
}

impl Recorder {
    fn new(packet: u64, privileged: bool) -> Self {
        Self {
            executed: Vec::new(),
            packet,
            privileged,
        }
    }
}

impl Database for Recorder {
    fn query(&mut self, sql: &str) -> Result<u64> {
        self.executed.push(sql.to_string());
        Ok(1)
    }
    fn get_var(&mut self, _sql: &str) -> Result<Option<String>> {
        Ok(None)
    }
    fn prefix_of(&self, blog_id: u64) -> String {
        if blog_id <= 1 {
            "wp_".into()
        } else {
            format!("wp_{blog_id}_")
        }
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
    fn replace_in_table(&mut self, _t: &str, _p: &[(String, String)], _o: u64, _l: u64) -> Result<RewriteBatch> {
        Ok(RewriteBatch::default())
    }
    fn max_allowed_packet(&mut self) -> Result<u64> {
        Ok(self.packet)
    }
    fn set_max_allowed_packet(&mut self, bytes: u64) -> Result<()> {
        self.packet = bytes;
        Ok(())
    }
    fn has_elevated_privileges(&mut self) -> bool {
        self.privileged
    }
}

fn restore_only() -> StepRegistry {
    StepRegistry::new().register(RestoreDatabase)
}

fn job(dir: &std::path::Path) -> MigrationJob {
    MigrationJob {
        package: dir.join("unused.spkg"),
        work_dir: dir.join("work"),
        media_dir: dir.join("uploads"),
        ..Default::default()
    }
}

#[test]
fn ten_thousand_statements_in_exactly_one_hundred_calls() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path());
    let layout = Layout::of(&job);
    fs::create_dir_all(&layout.stage).unwrap();
    let statements: Vec<String> = (0..10_000)
        .map(|i| format!("INSERT INTO `wp_posts` (`id`) VALUES ({i});"))
        .collect();
    fs::write(&layout.dump, statements.join("\n") + "\n").unwrap();

    let store = MemoryStateStore::new();
    let blogs = BlogStack::new();
    let sink = MemorySink::new();
    let mut db = Recorder::new(64 * MIB, false);
    // the 100th statement of a call is the first to see the budget spent
    let config = Config::default().with_step_timeout("import_restore_database", 99.5);
    let mut driver = Driver::new(config, &store, &mut db, &blogs, &sink)
        .with_clock(Arc::new(TickClock::new(1.0)))
        .with_registry(Mode::Import, restore_only());
    driver.start(Mode::Import, 1, job).unwrap();

    let mut calls = 0;
    let mut last_percent = 0;
    loop {
        let r = driver.run_once(Mode::Import, 1).unwrap();
        calls += 1;
        assert_eq!(r.error, None);
        if r.finished {
            break;
        }
        let s = driver.status(Mode::Import, 1).unwrap().unwrap();
        let pct = s.restore.percent_db_imported.unwrap();
        assert!(pct >= last_percent);
        last_percent = pct;
        assert!(calls < 200);
    }
    drop(driver);

    assert_eq!(calls, 100);
    assert_eq!(db.executed, statements);
    assert_eq!(store.load(1, Mode::Import).unwrap(), None);
}

#[test]
fn oversize_statement_after_one_raise_fails_instead_of_looping() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path());
    let layout = Layout::of(&job);
    fs::create_dir_all(&layout.stage).unwrap();
    let first = format!("INSERT INTO `wp_options` VALUES ('{}');", "a".repeat(1500));
    let second = format!("INSERT INTO `wp_options` VALUES ('{}');", "b".repeat(3 * MIB as usize));
    fs::write(&layout.dump, format!("{first}\n{second}\n")).unwrap();

    let store = MemoryStateStore::new();
    let blogs = BlogStack::new();
    let sink = MemorySink::new();
    let mut db = Recorder::new(1000, true);
    let mut driver = Driver::new(Config::default(), &store, &mut db, &blogs, &sink)
        .with_registry(Mode::Import, restore_only());
    driver.start(Mode::Import, 1, job).unwrap();

    // raise requested, step restarts
    let r = driver.run_once(Mode::Import, 1).unwrap();
    assert!(!r.finished);
    let s = driver.status(Mode::Import, 1).unwrap().unwrap();
    assert_eq!(s.restore.max_allowed_packet_original, Some(1000));
    assert_eq!(s.restore.max_allowed_packet_target, Some(first.len() as u64 + MIB));

    // first statement now fits; the second exceeds the raised limit
    let r = driver.run_once(Mode::Import, 1).unwrap();
    assert!(r.finished);
    assert!(r.error.unwrap().contains("exceeds max_allowed_packet"));

    // failure is sticky: nothing else executes
    let again = driver.run_once(Mode::Import, 1).unwrap();
    assert!(again.finished);
    drop(driver);
    assert_eq!(db.executed, vec![first]);
}

#[test]
fn vanished_dump_mid_restore_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path());
    let layout = Layout::of(&job);
    fs::create_dir_all(&layout.stage).unwrap();
    let lines: Vec<String> = (0..10).map(|i| format!("DELETE FROM `wp_posts` WHERE id = {i};")).collect();
    fs::write(&layout.dump, lines.join("\n")).unwrap();

    let store = MemoryStateStore::new();
    let blogs = BlogStack::new();
    let sink = MemorySink::new();
    let mut db = Recorder::new(64 * MIB, false);
    let config = Config::default().with_step_timeout("import_restore_database", 2.5);
    let mut driver = Driver::new(config, &store, &mut db, &blogs, &sink)
        .with_clock(Arc::new(TickClock::new(1.0)))
        .with_registry(Mode::Import, restore_only());
    driver.start(Mode::Import, 1, job).unwrap();

    assert!(!driver.run_once(Mode::Import, 1).unwrap().finished);
    fs::remove_file(&layout.dump).unwrap();
    let r = driver.run_once(Mode::Import, 1).unwrap();
    assert!(r.finished);
    assert!(r.error.unwrap().contains("missing resume data"));
}
