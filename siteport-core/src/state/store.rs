// siteport_core/src/state/store.rs
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Result, SiteportError};
use crate::sequence::Mode;
use crate::state::ProgressState;

/// Persisted checkpoint slot per `(blog_id, mode)`.
///
/// Every call reads or writes the whole blob; callers never cache a loaded
/// state across invocations.
pub trait StateStore: Send + Sync {
    fn load(&self, blog_id: u64, mode: Mode) -> Result<Option<ProgressState>>;

    fn save(&self, blog_id: u64, mode: Mode, state: &ProgressState) -> Result<()>;

    fn clear(&self, blog_id: u64, mode: Mode) -> Result<()>;
}

/// One JSON file per slot, replaced atomically.
pub struct FsStateStore {
    dir: PathBuf,
}

impl FsStateStore {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn slot_path(&self, blog_id: u64, mode: Mode) -> PathBuf {
        self.dir
            .join(format!("blog-{blog_id}-{}.json", mode.as_str()))
    }
}

impl StateStore for FsStateStore {
    fn load(&self, blog_id: u64, mode: Mode) -> Result<Option<ProgressState>> {
        let path = self.slot_path(blog_id, mode);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(ProgressState::from_json(&s)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, blog_id: u64, mode: Mode, state: &ProgressState) -> Result<()> {
        let path = self.slot_path(blog_id, mode);
        let json = state.to_json()?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| SiteportError::Io(e.error))?;
        debug!(blog_id, mode = mode.as_str(), bytes = json.len(), "state saved");
        Ok(())
    }

    fn clear(&self, blog_id: u64, mode: Mode) -> Result<()> {
        match fs::remove_file(self.slot_path(blog_id, mode)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps serialized blobs in memory, so round-trip losses still show up.
#[derive(Default)]
pub struct MemoryStateStore {
    slots: Mutex<HashMap<(u64, Mode), String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(u64, Mode), String>>> {
        self.slots
            .lock()
            .map_err(|e| SiteportError::Format(format!("state store poisoned: {e}")))
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, blog_id: u64, mode: Mode) -> Result<Option<ProgressState>> {
        match self.slots()?.get(&(blog_id, mode)) {
            Some(s) => Ok(Some(ProgressState::from_json(s)?)),
            None => Ok(None),
        }
    }

    fn save(&self, blog_id: u64, mode: Mode, state: &ProgressState) -> Result<()> {
        let json = state.to_json()?;
        self.slots()?.insert((blog_id, mode), json);
        Ok(())
    }

    fn clear(&self, blog_id: u64, mode: Mode) -> Result<()> {
        self.slots()?.remove(&(blog_id, mode));
        Ok(())
    }
}

pub enum Backend {
    Fs(PathBuf),
    Memory,
}

pub fn open_store(backend: Backend) -> Result<Box<dyn StateStore>> {
    match backend {
        Backend::Fs(dir) => Ok(Box::new(FsStateStore::new(&dir)?)),
        Backend::Memory => Ok(Box::new(MemoryStateStore::new())),
    }
}
