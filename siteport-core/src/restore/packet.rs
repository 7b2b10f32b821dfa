//! One-shot renegotiation of the server packet limit.
//!
//! `Normal` may move to `AdjustRequested` once; a later run sees `Adjusted`
//! and can only fit or fail.

use crate::config::MIB;
use crate::error::{Result, SiteportError};
use crate::services::Database;
use crate::state::ProgressState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketStage {
    Normal,
    AdjustRequested { original: u64, target: u64 },
    Adjusted { original: u64, target: u64 },
}

/// What to do with a statement of a given size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketDecision {
    Fits,
    /// Limit raised; the step must restart before executing anything else.
    Restart,
}

impl PacketStage {
    /// Once both slots are recorded the adjustment has been spent.
    pub fn from_state(s: &ProgressState) -> Self {
        match (
            s.restore.max_allowed_packet_original,
            s.restore.max_allowed_packet_target,
        ) {
            (Some(original), Some(target)) => PacketStage::Adjusted { original, target },
            _ => PacketStage::Normal,
        }
    }

    pub fn apply(&self, s: &mut ProgressState) {
        match *self {
            PacketStage::Normal => {
                s.restore.max_allowed_packet_original = None;
                s.restore.max_allowed_packet_target = None;
            }
            PacketStage::AdjustRequested { original, target }
            | PacketStage::Adjusted { original, target } => {
                s.restore.max_allowed_packet_original = Some(original);
                s.restore.max_allowed_packet_target = Some(target);
            }
        }
    }

    /// Re-apply a raised limit on a fresh connection; returns the effective limit.
    pub fn effective_limit(&self, db: &mut dyn Database) -> Result<u64> {
        let limit = db.max_allowed_packet()?;
        match *self {
            PacketStage::Adjusted { target, .. } if limit < target => {
                db.set_max_allowed_packet(target)?;
                Ok(target)
            }
            _ => Ok(limit),
        }
    }

    /// Check a statement against `limit`, raising the limit at most once.
    pub fn admit(
        &mut self,
        db: &mut dyn Database,
        size: u64,
        limit: u64,
        ceiling: u64,
    ) -> Result<PacketDecision> {
        if size <= limit {
            return Ok(PacketDecision::Fits);
        }
        match *self {
            PacketStage::Normal if db.has_elevated_privileges() => {
                let target = raised_target(size, limit, ceiling);
                if target < size {
                    return Err(SiteportError::PacketTooLarge { size, limit });
                }
                db.set_max_allowed_packet(target)?;
                *self = PacketStage::AdjustRequested {
                    original: limit,
                    target,
                };
                Ok(PacketDecision::Restart)
            }
            _ => Err(SiteportError::PacketTooLarge { size, limit }),
        }
    }

    /// Put the server back the way it was found.
    pub fn restore_original(&self, db: &mut dyn Database) -> Result<()> {
        match *self {
            PacketStage::Normal => Ok(()),
            PacketStage::AdjustRequested { original, .. } | PacketStage::Adjusted { original, .. } => {
                db.set_max_allowed_packet(original)
            }
        }
    }
}

fn raised_target(size: u64, limit: u64, ceiling: u64) -> u64 {
    let wanted = (size + MIB).max(limit.saturating_mul(2));
    wanted.min(ceiling)
}
