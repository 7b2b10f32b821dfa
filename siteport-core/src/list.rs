use std::path::Path;

use serde::Serialize;

use crate::container::entry::EntryHeader;
use crate::container::meta::PackageMeta;
use crate::error::{Result, SiteportError};
use crate::read::opened::Opened;

#[derive(Clone, Debug, Serialize)]
pub struct Listing {
    pub meta: PackageMeta,
    pub entries: Vec<EntryHeader>,
    pub total_bytes: u64,
}

/// Entry headers in package order, without decoding any payload.
pub fn list(package: &Path) -> Result<Listing> {
    let mut pkg = Opened::open(package)?;
    let mut entries = Vec::new();
    while let Some(h) = pkg.next_header()? {
        if !h.is_dir() {
            pkg.skip_payload(h.size)?;
        }
        entries.push(h);
    }
    Ok(Listing {
        meta: pkg.meta.clone(),
        entries,
        total_bytes: pkg.tail.total_u,
    })
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub files: u64,
    pub dirs: u64,
    pub frames: u64,
    pub bytes: u64,
    /// Entries with at least one frame that failed to decode or hash.
    pub damaged: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.damaged.is_empty()
    }
}

/// Decode every frame, check its hash, and compare totals with the tail.
pub fn verify(package: &Path) -> Result<VerifyReport> {
    let mut pkg = Opened::open(package)?;
    let mut r = VerifyReport::default();
    while let Some(h) = pkg.next_header()? {
        if h.is_dir() {
            r.dirs += 1;
            continue;
        }
        r.files += 1;
        let mut left = h.size;
        let mut bad = false;
        while left > 0 {
            let frame = pkg.read_frame(left)?;
            left -= frame.u_len;
            r.frames += 1;
            bad |= frame.data.is_err();
        }
        r.bytes += h.size;
        if bad {
            r.damaged.push(h.path);
        }
    }
    let count = r.files + r.dirs;
    if count != pkg.tail.entry_count || r.bytes != pkg.tail.total_u {
        return Err(SiteportError::Format(format!(
            "tail records {} entries / {} bytes, found {count} / {}",
            pkg.tail.entry_count, pkg.tail.total_u, r.bytes
        )));
    }
    Ok(r)
}
