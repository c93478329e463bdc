//! Conflict policy for bilateral edits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side's edit survives when both systems changed independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The scanning (source) side always wins.
    #[default]
    SourceWins,
    /// The target side always wins; the scanned edit is dropped.
    TargetWins,
    /// The side with the later last-modified timestamp wins.
    ///
    /// Ties, and an unknown target timestamp, resolve to the source side as
    /// the deterministic default.
    NewestWins,
}

impl ConflictPolicy {
    /// Resolves a detected bilateral edit.
    ///
    /// `source_modified_at` is the timestamp of the edit currently being
    /// scanned; `target_modified_at` is the counterpart side's last observed
    /// edit, if known.
    pub fn resolve(
        &self,
        source_modified_at: DateTime<Utc>,
        target_modified_at: Option<DateTime<Utc>>,
    ) -> ConflictWinner {
        match self {
            ConflictPolicy::SourceWins => ConflictWinner::Source,
            ConflictPolicy::TargetWins => ConflictWinner::Target,
            ConflictPolicy::NewestWins => match target_modified_at {
                Some(target) if target > source_modified_at => ConflictWinner::Target,
                _ => ConflictWinner::Source,
            },
        }
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::SourceWins => "source_wins",
            ConflictPolicy::TargetWins => "target_wins",
            ConflictPolicy::NewestWins => "newest_wins",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictWinner {
    /// Apply the scanning side's edit; any opposing pending write is stale.
    Source,
    /// Keep the target side's edit; the scanned change is dropped.
    Target,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn fixed_policies_ignore_timestamps() {
        assert_eq!(
            ConflictPolicy::SourceWins.resolve(utc(1), Some(utc(100))),
            ConflictWinner::Source
        );
        assert_eq!(
            ConflictPolicy::TargetWins.resolve(utc(100), Some(utc(1))),
            ConflictWinner::Target
        );
    }

    #[test]
    fn newest_wins_compares_timestamps() {
        let policy = ConflictPolicy::NewestWins;
        assert_eq!(policy.resolve(utc(10), Some(utc(20))), ConflictWinner::Target);
        assert_eq!(policy.resolve(utc(20), Some(utc(10))), ConflictWinner::Source);
    }

    #[test]
    fn newest_wins_tie_goes_to_source() {
        assert_eq!(
            ConflictPolicy::NewestWins.resolve(utc(10), Some(utc(10))),
            ConflictWinner::Source
        );
    }

    #[test]
    fn newest_wins_unknown_target_goes_to_source() {
        assert_eq!(
            ConflictPolicy::NewestWins.resolve(utc(10), None),
            ConflictWinner::Source
        );
    }
}
