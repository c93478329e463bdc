//! Per-cycle summaries surfaced to callers.

use crate::entity::{EntityKind, SyncDirection};
use serde::{Deserialize, Serialize};

/// Counts for one (direction, entity kind) in one sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Direction scanned.
    pub direction: SyncDirection,
    /// Entity kind scanned.
    pub kind: EntityKind,
    /// Records listed from the source.
    pub scanned: u64,
    /// Target records created.
    pub created: u64,
    /// Target records updated.
    pub updated: u64,
    /// Records skipped as unchanged.
    pub skipped: u64,
    /// Records that failed mapping or application.
    pub failed: u64,
    /// Bilateral edits detected.
    pub conflicts: u64,
    /// Wall-clock duration of the direction's scan.
    pub duration_ms: u64,
}

impl CycleReport {
    /// Empty report for one (direction, kind).
    pub fn new(direction: SyncDirection, kind: EntityKind) -> CycleReport {
        CycleReport {
            direction,
            kind,
            scanned: 0,
            created: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            conflicts: 0,
            duration_ms: 0,
        }
    }

    /// Records that produced a target write.
    pub fn written(&self) -> u64 {
        self.created + self.updated
    }

    /// Folds another report for the same (direction, kind) into this one.
    pub fn absorb(&mut self, other: &CycleReport) {
        self.scanned += other.scanned;
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.conflicts += other.conflicts;
        self.duration_ms = self.duration_ms.max(other.duration_ms);
    }
}
