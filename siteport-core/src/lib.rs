#![forbid(unsafe_code)]

pub mod batch;
pub mod budget;
pub mod config;
pub mod error;
pub mod sequence;
pub mod services;
pub mod sqlite;
pub mod state;

pub mod util {
    pub mod varint;
}

pub mod codec;

pub mod crypto {
    pub mod aead;
    pub mod hex;
    pub mod kdf;
}

pub mod container {
    pub mod entry;
    pub mod meta;
    pub mod superblock;
    pub mod tail;
}

pub mod pack {
    pub mod walker;
    pub mod writer;
}

pub mod read {
    pub mod extract;
    pub mod opened;
}

pub mod copy;
pub mod list;
pub mod pipeline;
pub mod restore;

// Re-exports: stable API surface
pub use budget::{Clock, SystemClock, TickClock, TimeBudget};
pub use config::Config;
pub use error::{Result, SiteportError};
pub use list::{list, verify};
pub use pipeline::{Driver, RunReport, Step, StepContext, StepOutcome, StepRegistry};
pub use sequence::{Mode, StepDescriptor};
pub use state::{MigrationJob, ProgressState};
