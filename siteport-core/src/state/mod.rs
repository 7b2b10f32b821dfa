//! Checkpoint record threaded through every step.
//!
//! Each subsystem owns a disjoint set of keys. Every slot is an `Option` so
//! that "absent" (not started) stays distinct from a present zero or `false`;
//! absent slots are never written out, not even as `null`.

pub mod store;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::container::meta::ArchiveKind;
use crate::error::Result;

/// Driver bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSlots {
    /// Step to run on the next invocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ongoing: Option<bool>,
    /// Presence means the chain failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<bool>,
}

/// Archive extractor / writer cursor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSlots {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_zip_last_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_zip_extraction_done: Option<bool>,
    /// Package offset of the next entry (extract) or committed package length (write).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_bytes_offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_numfiles_zip: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_bytes: Option<u64>,
    /// Byte offset inside the file list side file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_reading_position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_file_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_bytes_total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_failed_count: Option<u64>,
    /// Bytes of the current source file already framed into the package.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_source_offset: Option<u64>,
    /// Package offset of the entry header of the file being framed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_entry_offset: Option<u64>,
}

/// Mid-entry extraction cursor for large files.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TarSlots {
    /// Package offset of the next frame to read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tar_extract_offset: Option<u64>,
    /// Package offset of the entry header being extracted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tar_extract_base_offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tar_extract_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tar_extract_written: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreSlots {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_read_offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_read_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_final_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent_db_imported: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_allowed_packet_original: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_allowed_packet_target: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopySlots {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copydir_processed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copydir_failed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copychunked_offset: Option<u64>,
    /// Relative path of the last file handled (or the file mid-copy when
    /// `copychunked_offset` is present).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copychunked_under_copy: Option<String>,
    /// Files behind the resume point whose copy failed; retried on the next pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copydir_retry: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpSlots {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dump_table_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dump_row_offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dump_file_size: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListSlots {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_entries_written: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_file_size: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriteSlots {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_replace_table_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_replace_row_offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_replace_rows: Option<u64>,
}

/// Facts read from the package during import validation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageSlots {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_table_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_site_url: Option<String>,
    /// Hex salt of an encrypted dump.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dump_salt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_kind: Option<ArchiveKind>,
}

/// Parameters of one migration, fixed when the job is started.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationJob {
    /// Export: package to produce. Import: package to consume.
    pub package: PathBuf,
    /// Scratch directory owned by the migration.
    pub work_dir: PathBuf,
    /// Export: uploads to copy from. Import: uploads to copy into.
    pub media_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    /// Export: url recorded in the package. Import: url to rewrite to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_url: Option<String>,
    #[serde(default)]
    pub encrypt_dump: bool,
    /// Export: what the package carries.
    #[serde(default)]
    pub kind: ArchiveKind,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    #[serde(flatten)]
    pub control: ControlSlots,
    #[serde(flatten)]
    pub archive: ArchiveSlots,
    #[serde(flatten)]
    pub tar: TarSlots,
    #[serde(flatten)]
    pub restore: RestoreSlots,
    #[serde(flatten)]
    pub copy: CopySlots,
    #[serde(flatten)]
    pub dump: DumpSlots,
    #[serde(flatten)]
    pub list: ListSlots,
    #[serde(flatten)]
    pub rewrite: RewriteSlots,
    #[serde(flatten)]
    pub package: PackageSlots,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<MigrationJob>,
    /// Keys no subsystem claims.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ProgressState {
    pub fn new(job: MigrationJob) -> Self {
        Self {
            job: Some(job),
            ..Default::default()
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    fn to_map(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(m) => Ok(m),
            _ => Ok(Map::new()),
        }
    }

    fn replace_from_map(&mut self, map: Map<String, Value>) -> Result<()> {
        *self = serde_json::from_value(Value::Object(map))?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.to_map().ok()?.remove(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Set a slot by name. Typed slots reject values of the wrong shape;
    /// `null` removes the key.
    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        let mut map = self.to_map()?;
        if value.is_null() {
            map.remove(key);
        } else {
            map.insert(key.to_string(), value);
        }
        self.replace_from_map(map)
    }

    pub fn remove(&mut self, key: &str) -> Result<()> {
        let mut map = self.to_map()?;
        if map.remove(key).is_some() {
            self.replace_from_map(map)?;
        }
        Ok(())
    }

    pub fn merge(&mut self, partial: Map<String, Value>) -> Result<()> {
        let mut map = self.to_map()?;
        for (k, v) in partial {
            if v.is_null() {
                map.remove(&k);
            } else {
                map.insert(k, v);
            }
        }
        self.replace_from_map(map)
    }

    pub fn job(&self) -> Result<&MigrationJob> {
        self.job
            .as_ref()
            .ok_or_else(|| crate::error::SiteportError::MissingResumeData("job".into()))
    }

    pub fn failed(&self) -> bool {
        self.control.error.is_some()
    }

    /// Drop every per-subsystem resume slot; control slots and the job stay.
    pub fn clear_resume_slots(&mut self) {
        self.archive = ArchiveSlots::default();
        self.tar = TarSlots::default();
        self.restore = RestoreSlots::default();
        self.copy = CopySlots::default();
        self.dump = DumpSlots::default();
        self.list = ListSlots::default();
        self.rewrite = RewriteSlots::default();
    }
}
