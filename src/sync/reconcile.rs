//! Last-write-wins reconciliation of synced entries
//!
//! Each incoming entry is compared against the local copy on its
//! `modifiedAt` stamp. Equal stamps with different versions mean both sides
//! edited independently; that is reported, never merged.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The two values reconciliation looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordStamp {
    pub modified_at: i64,
    pub sync_version: u64,
}

/// What to do with one incoming entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeDecision {
    /// Not present locally; store it
    Import,
    /// Remote is newer; replace the local row
    Overwrite,
    /// Same timestamp, diverged versions; local row is left untouched
    Conflict,
    /// Local is newer or identical
    KeepLocal,
}

impl MergeDecision {
    /// Whether the decision writes to the local store
    pub fn is_merge(self) -> bool {
        matches!(self, MergeDecision::Import | MergeDecision::Overwrite)
    }
}

/// Decide how a remote entry lands on top of the local one
pub fn reconcile(local: Option<RecordStamp>, remote: RecordStamp) -> MergeDecision {
    let local = match local {
        Some(local) => local,
        None => return MergeDecision::Import,
    };

    match remote.modified_at.cmp(&local.modified_at) {
        Ordering::Greater => MergeDecision::Overwrite,
        Ordering::Less => MergeDecision::KeepLocal,
        Ordering::Equal if remote.sync_version != local.sync_version => MergeDecision::Conflict,
        Ordering::Equal => MergeDecision::KeepLocal,
    }
}

/// Running totals for one applied delta
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub imported: usize,
    pub overwritten: usize,
    pub conflicts: usize,
    pub kept: usize,
}

impl MergeSummary {
    /// Count a decision
    pub fn record(&mut self, decision: MergeDecision) {
        match decision {
            MergeDecision::Import => self.imported += 1,
            MergeDecision::Overwrite => self.overwritten += 1,
            MergeDecision::Conflict => self.conflicts += 1,
            MergeDecision::KeepLocal => self.kept += 1,
        }
    }

    /// Entries that changed the local store
    pub fn merged(&self) -> usize {
        self.imported + self.overwritten
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(modified_at: i64, sync_version: u64) -> RecordStamp {
        RecordStamp {
            modified_at,
            sync_version,
        }
    }

    #[test]
    fn test_absent_locally_imports() {
        assert_eq!(reconcile(None, stamp(1, 0)), MergeDecision::Import);
    }

    #[test]
    fn test_remote_newer_overwrites() {
        assert_eq!(
            reconcile(Some(stamp(100, 5)), stamp(200, 1)),
            MergeDecision::Overwrite
        );
    }

    #[test]
    fn test_remote_older_keeps_local() {
        assert_eq!(
            reconcile(Some(stamp(200, 1)), stamp(100, 9)),
            MergeDecision::KeepLocal
        );
    }

    #[test]
    fn test_equal_timestamp_different_version_conflicts() {
        assert_eq!(
            reconcile(Some(stamp(100, 2)), stamp(100, 3)),
            MergeDecision::Conflict
        );
    }

    #[test]
    fn test_identical_keeps_local() {
        assert_eq!(
            reconcile(Some(stamp(100, 2)), stamp(100, 2)),
            MergeDecision::KeepLocal
        );
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = MergeSummary::default();
        for decision in [
            MergeDecision::Import,
            MergeDecision::Import,
            MergeDecision::Overwrite,
            MergeDecision::Conflict,
            MergeDecision::KeepLocal,
        ] {
            summary.record(decision);
        }
        assert_eq!(summary.merged(), 3);
        assert_eq!(summary.conflicts, 1);
        assert_eq!(summary.kept, 1);
        assert!(MergeDecision::Overwrite.is_merge());
        assert!(!MergeDecision::Conflict.is_merge());
    }
}
