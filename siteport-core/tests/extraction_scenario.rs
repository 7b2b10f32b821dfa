use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use siteport_core::batch::BatchPolicy;
use siteport_core::container::entry::{EntryHeader, EntryKind};
use siteport_core::container::meta::PackageMeta;
use siteport_core::pack::writer::PackageFile;
use siteport_core::read::extract::{ChunkedArchiveExtractor, ExtractResume};
use siteport_core::{Clock, ProgressState, TickClock, TimeBudget};

const DIRS: usize = 300;
const SMALL_FILES: usize = 970;
const FRAME: usize = 16 * 1024;

fn policy() -> BatchPolicy {
    BatchPolicy {
        large_file_bytes: 10 * 1024,
        first_run_batch_bytes: 1 << 40,
        min_batch_bytes: 1 << 40,
        frame_bytes: FRAME as u64,
    }
}

/// Small files in package order.
fn small_files() -> Vec<String> {
    (0..DIRS)
        .flat_map(|d| (d..SMALL_FILES).step_by(DIRS).map(move |f| format!("d{d:03}/f{f:04}.txt")))
        .collect()
}

/// Reads as the number of small files already on disk: only file entries
/// spend time, directories and the large file are free.
struct FilesWritten {
    paths: Vec<PathBuf>,
    seen: Mutex<usize>,
}

impl FilesWritten {
    fn new(dest: &Path) -> Self {
        Self {
            paths: small_files().iter().map(|f| dest.join(f)).collect(),
            seen: Mutex::new(0),
        }
    }
}

impl Clock for FilesWritten {
    fn now(&self) -> f64 {
        let mut seen = self.seen.lock().unwrap();
        while *seen < self.paths.len() && self.paths[*seen].exists() {
            *seen += 1;
        }
        *seen as f64
    }
}

fn huge() -> Vec<u8> {
    (0..50 * 1024u32).map(|i| (i % 253) as u8).collect()
}

fn add_file(pkg: &mut PackageFile, path: &str, data: &[u8]) {
    pkg.write_header(&EntryHeader {
        path: path.to_string(),
        kind: EntryKind::File,
        size: data.len() as u64,
        mode: 0o644,
        mtime: 0,
    })
    .unwrap();
    for c in data.chunks(FRAME) {
        pkg.write_frame(c).unwrap();
    }
    pkg.end_file(data.len() as u64);
}

/// 300 directories holding 970 small files, then one oversized file last.
fn build(dir: &Path) -> PathBuf {
    let p = dir.join("uploads.spkg");
    let mut pkg = PackageFile::create(&p, &PackageMeta::default()).unwrap();
    for d in 0..DIRS {
        pkg.write_dir(&format!("d{d:03}"), 0o755, 0).unwrap();
        for f in (d..SMALL_FILES).step_by(DIRS) {
            add_file(&mut pkg, &format!("d{d:03}/f{f:04}.txt"), format!("file {f}").as_bytes());
        }
    }
    add_file(&mut pkg, "d299/huge.bin", &huge());
    pkg.finish().unwrap();
    p
}

#[test]
fn fifty_entries_per_call_and_one_call_for_the_large_file() {
    let dir = tempfile::tempdir().unwrap();
    let package = build(dir.path());
    let dest = dir.path().join("stage");
    let extractor = ChunkedArchiveExtractor::new(policy());
    let clock = Arc::new(FilesWritten::new(&dest));

    let mut state = ProgressState::default();
    let mut calls = 0usize;
    let mut seen_indexes = Vec::new();
    let cur = loop {
        // budget runs out with the 50th file of the call
        let budget = TimeBudget::start(clock.clone(), 49.5);
        let cur = extractor
            .run(&package, &dest, &ExtractResume::from_state(&state), &budget)
            .unwrap();
        calls += 1;
        assert!(calls <= 100, "extraction does not converge");
        seen_indexes.push(cur.last_index);
        if cur.done {
            break cur;
        }
        cur.apply(&mut state);
    };

    assert_eq!(calls, SMALL_FILES.div_ceil(50) + 1);
    assert_eq!(cur.total_files, (DIRS + SMALL_FILES + 1) as u64);
    assert_eq!(cur.extracted, (DIRS + SMALL_FILES + 1) as u64);
    assert_eq!(cur.failed, 0);
    assert!(seen_indexes.windows(2).all(|w| w[0] < w[1]));

    for f in [0usize, 299, 300, 969] {
        let d = f % DIRS;
        let body = fs::read_to_string(dest.join(format!("d{d:03}/f{f:04}.txt"))).unwrap();
        assert_eq!(body, format!("file {f}"));
    }
    assert_eq!(fs::read(dest.join("d299/huge.bin")).unwrap(), huge());
    let dirs = fs::read_dir(&dest).unwrap().count();
    assert_eq!(dirs, DIRS);
}

#[test]
fn interrupted_batches_match_a_single_pass() {
    let dir = tempfile::tempdir().unwrap();
    let package = build(dir.path());

    let one_shot = dir.path().join("one");
    let cur = ChunkedArchiveExtractor::new(BatchPolicy {
        large_file_bytes: u64::MAX,
        ..policy()
    })
    .run(&package, &one_shot, &ExtractResume::default(), &TimeBudget::unlimited())
    .unwrap();
    assert!(cur.done);

    let chunked = dir.path().join("chunked");
    let extractor = ChunkedArchiveExtractor::new(policy());
    let mut state = ProgressState::default();
    loop {
        let budget = TimeBudget::start(Arc::new(TickClock::new(1.0)), 6.5);
        let cur = extractor
            .run(&package, &chunked, &ExtractResume::from_state(&state), &budget)
            .unwrap();
        if cur.done {
            assert_eq!(cur.extracted, (DIRS + SMALL_FILES + 1) as u64);
            break;
        }
        cur.apply(&mut state);
    }

    for entry in walkdir::WalkDir::new(&one_shot).min_depth(1) {
        let entry = entry.unwrap();
        let rel = entry.path().strip_prefix(&one_shot).unwrap();
        let other = chunked.join(rel);
        if entry.file_type().is_dir() {
            assert!(other.is_dir(), "{}", rel.display());
        } else {
            assert_eq!(fs::read(entry.path()).unwrap(), fs::read(&other).unwrap());
        }
    }
}
