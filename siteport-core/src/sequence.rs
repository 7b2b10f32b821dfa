//! Step ordering and the `(current, previous, next)` transition function.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SiteportError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Import,
    Export,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Import => "import",
            Mode::Export => "export",
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = SiteportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "import" => Ok(Mode::Import),
            "export" => Ok(Mode::Export),
            other => Err(SiteportError::Config(format!("unknown mode: {other}"))),
        }
    }
}

pub const IMPORT_STEPS: &[&str] = &[
    "import_validate",
    "import_extract",
    "import_restore_database",
    "import_search_replace",
    "import_copy_media",
    "import_cleanup",
];

pub const EXPORT_STEPS: &[&str] = &[
    "export_prepare",
    "export_dump_database",
    "export_copy_media",
    "export_list_files",
    "export_archive",
    "export_finalize",
];

/// Immutable ordered step names for one mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepDescriptor {
    steps: Vec<String>,
}

impl StepDescriptor {
    pub fn new<S: Into<String>>(steps: impl IntoIterator<Item = S>) -> Self {
        Self {
            steps: steps.into_iter().map(Into::into).collect(),
        }
    }

    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Import => Self::new(IMPORT_STEPS.iter().copied()),
            Mode::Export => Self::new(EXPORT_STEPS.iter().copied()),
        }
    }

    pub fn first(&self) -> Option<&str> {
        self.steps.first().map(String::as_str)
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    pub fn resolve(&self, current: &str) -> Result<Resolved> {
        resolve(&self.steps, current)
    }
}

/// Neighbors of the current step. Empty strings mark the chain boundaries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolved {
    pub current: String,
    pub previous: String,
    pub next: String,
}

impl Resolved {
    pub fn is_last(&self) -> bool {
        self.next.is_empty()
    }
}

pub fn resolve<S: AsRef<str>>(steps: &[S], current: &str) -> Result<Resolved> {
    let position = steps
        .iter()
        .position(|s| s.as_ref() == current)
        .ok_or_else(|| SiteportError::StepNotFound(current.to_string()))?;
    let previous = if position == 0 {
        String::new()
    } else {
        steps[position - 1].as_ref().to_string()
    };
    let next = steps
        .get(position + 1)
        .map(|s| s.as_ref().to_string())
        .unwrap_or_default();
    Ok(Resolved {
        current: current.to_string(),
        previous,
        next,
    })
}

/// What a step asks the driver to persist: the step to run next time and
/// the step remembered as its predecessor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub run_next: String,
    pub previous: String,
}

impl Transition {
    /// Work complete: run `next`, remember `current` as previous.
    pub fn advance(r: &Resolved) -> Self {
        Self {
            run_next: r.next.clone(),
            previous: r.current.clone(),
        }
    }

    /// Work pending: re-run `current`, previous stays anchored.
    pub fn retry(r: &Resolved) -> Self {
        Self {
            run_next: r.current.clone(),
            previous: r.previous.clone(),
        }
    }
}
