use thiserror::Error;

#[derive(Error, Debug)]
pub enum SiteportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Format(String),

    #[error("step not found: {0}")]
    StepNotFound(String),

    #[error("cannot open archive {path}: {reason}")]
    ArchiveOpen { path: String, reason: String },

    #[error("cannot open directory {path}: {reason}")]
    DirOpen { path: String, reason: String },

    #[error("cannot open file {path}: {reason}")]
    FileOpen { path: String, reason: String },

    #[error("statement of {size} bytes exceeds max_allowed_packet of {limit} bytes")]
    PacketTooLarge { size: u64, limit: u64 },

    #[error("database error: {0}")]
    Database(String),

    #[error("missing resume data: {0}")]
    MissingResumeData(String),

    #[error("state encoding error: {0}")]
    State(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("migration cancelled")]
    Cancelled,

    #[error("{mode} of blog {blog_id} failed: {reason}")]
    MigrationFailed {
        mode: &'static str,
        blog_id: u64,
        reason: String,
    },
}

impl From<rusqlite::Error> for SiteportError {
    fn from(e: rusqlite::Error) -> Self {
        SiteportError::Database(e.to_string())
    }
}

// Convenient crate-wide result type
pub type Result<T> = std::result::Result<T, SiteportError>;
