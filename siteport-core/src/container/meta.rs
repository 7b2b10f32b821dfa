use serde::{Deserialize, Serialize};

/// What a package carries; picks the first-run batch threshold on extraction.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveKind {
    #[default]
    Media,
    /// Plugin or theme trees: many small files.
    Plugin,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageMeta {
    pub blog_id: u64,
    pub table_prefix: String,
    pub site_url: Option<String>,
    pub created: i64,
    pub tool: String,
    pub kind: ArchiveKind,
    /// Hex salt when the SQL dump lines are sealed.
    pub dump_salt: Option<String>,
}

pub const DUMP_ENTRY: &str = "database.sql";
pub const MEDIA_PREFIX: &str = "media";
