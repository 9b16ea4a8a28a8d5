//! Bridge types shared between the engine and its front-ends
//!
//! Everything here is plain data with serde derives so a report can be
//! printed as JSON by the CLI or handed to a host client unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Match status of one declared payload file
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    /// No piece touching this file has been searched yet
    #[default]
    NotChecked,
    /// Searched at least once without a hash match; a later piece may still match it
    CheckedWithNoMatch,
    /// Positively matched by a piece hash. Terminal.
    MatchFound,
    /// A piece touching this file had a contributor with no candidates
    Unverifiable,
}

impl MatchStatus {
    pub fn is_match(self) -> bool {
        self == MatchStatus::MatchFound
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::NotChecked => "NOT_CHECKED",
            MatchStatus::CheckedWithNoMatch => "CHECKED_WITH_NO_MATCH",
            MatchStatus::MatchFound => "MATCH_FOUND",
            MatchStatus::Unverifiable => "UNVERIFIABLE",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Final verdict for one declared file
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FileReport {
    /// 1-based position in the metafile
    pub index: usize,
    /// Path as declared by the metafile (payload directory included)
    pub path: PathBuf,
    pub size: u64,
    pub status: MatchStatus,
    /// Resolved location on disk, only set for `MATCH_FOUND`
    pub matched_path: Option<PathBuf>,
    /// Number of same-size candidates that were considered
    pub candidates: usize,
}

/// Outcome of one finder run
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MatchReport {
    pub name: String,
    pub files: Vec<FileReport>,
    /// Share of the payload covered by verified pieces, 0.0 to 100.0
    pub percent_matched: f64,
    pub verified_pieces: usize,
    pub total_pieces: usize,
    /// Verified pieces as a hex-encoded MSB-first bitfield
    pub verified_bitfield: String,
    /// The run stopped early on request; unprocessed pieces are unverified
    pub cancelled: bool,
}

impl MatchReport {
    pub fn is_complete(&self) -> bool {
        self.total_pieces > 0 && self.verified_pieces == self.total_pieces
    }

    pub fn matched_files(&self) -> impl Iterator<Item = &FileReport> {
        self.files.iter().filter(|f| f.status.is_match())
    }
}

/// Search-space size for a single piece
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct PieceEstimate {
    /// 1-based piece index
    pub piece: usize,
    pub contributors: usize,
    /// Product of the contributors' candidate counts (saturating)
    pub combinations: u64,
}

/// Pre-flight estimate of the hash search cost
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct SearchEstimate {
    pub pieces: Vec<PieceEstimate>,
    /// Sum of all per-piece combinations (saturating)
    pub total_combinations: u64,
}

impl SearchEstimate {
    pub fn largest(&self) -> Option<&PieceEstimate> {
        self.pieces.iter().max_by_key(|p| p.combinations)
    }

    /// Pieces that cannot be searched because a contributor has no candidates
    pub fn unverifiable(&self) -> impl Iterator<Item = &PieceEstimate> {
        self.pieces.iter().filter(|p| p.combinations == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_in_screaming_case() {
        let json = serde_json::to_string(&MatchStatus::CheckedWithNoMatch).unwrap();
        assert_eq!(json, "\"CHECKED_WITH_NO_MATCH\"");

        let back: MatchStatus = serde_json::from_str("\"MATCH_FOUND\"").unwrap();
        assert_eq!(back, MatchStatus::MatchFound);
        assert_eq!(MatchStatus::Unverifiable.to_string(), "UNVERIFIABLE");
    }

    #[test]
    fn files_start_unchecked() {
        assert_eq!(MatchStatus::default(), MatchStatus::NotChecked);
    }

    #[test]
    fn estimate_helpers() {
        let estimate = SearchEstimate {
            pieces: vec![
                PieceEstimate { piece: 1, contributors: 1, combinations: 3 },
                PieceEstimate { piece: 2, contributors: 2, combinations: 0 },
                PieceEstimate { piece: 3, contributors: 2, combinations: 6 },
            ],
            total_combinations: 9,
        };
        assert_eq!(estimate.largest().map(|p| p.piece), Some(3));
        assert_eq!(estimate.unverifiable().count(), 1);
    }

    #[test]
    fn report_completion() {
        let report = MatchReport {
            name: "x".into(),
            files: vec![],
            percent_matched: 100.0,
            verified_pieces: 2,
            total_pieces: 2,
            verified_bitfield: "c0".into(),
            cancelled: false,
        };
        assert!(report.is_complete());
    }
}
