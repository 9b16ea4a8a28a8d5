//! Structured matching events
//!
//! The finder and the per-piece search never log directly; they report what
//! happened to an [`EventSink`] handed to them by the caller.

use bridge::MatchStatus;
use parking_lot::Mutex;
use std::path::PathBuf;
use tracing::{debug, info, trace, warn};

/// Something observable that happened during a finder run.
///
/// `file` and `piece` fields are 1-based, as printed to users.
#[derive(Debug, Clone, PartialEq)]
pub enum FinderEvent {
    CandidatesConnected {
        file: usize,
        candidates: usize,
    },
    SearchStarted {
        piece: usize,
        contributors: usize,
        combinations: u64,
    },
    /// A contributor had no candidates, so the piece was not searched
    PieceUnverifiable {
        piece: usize,
    },
    /// Every contributor was already matched; hashing skipped
    PieceFastVerified {
        piece: usize,
    },
    CandidateUnreadable {
        piece: usize,
        path: PathBuf,
        error: String,
    },
    CombinationRejected {
        piece: usize,
        attempt: u64,
    },
    PieceMatched {
        piece: usize,
        attempts: u64,
    },
    PieceExhausted {
        piece: usize,
        attempts: u64,
    },
    StatusChanged {
        file: usize,
        from: MatchStatus,
        to: MatchStatus,
    },
    FileMatched {
        file: usize,
        path: PathBuf,
    },
    Progress {
        piece: usize,
        verified: bool,
        percent: f64,
    },
    Cancelled {
        before_piece: usize,
    },
}

/// Receiver for [`FinderEvent`]s
pub trait EventSink: Send + Sync {
    fn record(&self, event: FinderEvent);
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: FinderEvent) {
        match event {
            FinderEvent::CandidatesConnected { file, candidates } => {
                info!(file, candidates, "Connected same-size candidates")
            }
            FinderEvent::SearchStarted {
                piece,
                contributors,
                combinations,
            } => debug!(piece, contributors, combinations, "Searching piece"),
            FinderEvent::PieceUnverifiable { piece } => {
                debug!(piece, "Piece is not verifiable, a contributor has no candidates")
            }
            FinderEvent::PieceFastVerified { piece } => {
                debug!(piece, "All contributors already matched, skipping verification")
            }
            FinderEvent::CandidateUnreadable { piece, path, error } => {
                warn!(piece, path = %path.display(), %error, "Candidate could not be read")
            }
            FinderEvent::CombinationRejected { piece, attempt } => {
                trace!(piece, attempt, "Combination does not match")
            }
            FinderEvent::PieceMatched { piece, attempts } => {
                debug!(piece, attempts, "Combination found")
            }
            FinderEvent::PieceExhausted { piece, attempts } => {
                debug!(piece, attempts, "No combination matches")
            }
            FinderEvent::StatusChanged { file, from, to } => {
                trace!(file, %from, %to, "File status updated")
            }
            FinderEvent::FileMatched { file, path } => {
                info!(file, path = %path.display(), "Positive match")
            }
            FinderEvent::Progress {
                piece,
                verified,
                percent,
            } => debug!(piece, verified, percent, "Piece processed"),
            FinderEvent::Cancelled { before_piece } => {
                warn!(before_piece, "Matching cancelled")
            }
        }
    }
}

/// Keeps every event in memory, for hosts that want to inspect a run
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<FinderEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FinderEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<FinderEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: FinderEvent) {
        self.events.lock().push(event);
    }
}

impl<S: EventSink + ?Sized> EventSink for std::sync::Arc<S> {
    fn record(&self, event: FinderEvent) {
        (**self).record(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn recording_sink_keeps_order() {
        let sink = Arc::new(RecordingSink::new());
        let shared: Arc<dyn EventSink> = sink.clone();
        shared.record(FinderEvent::PieceUnverifiable { piece: 1 });
        shared.record(FinderEvent::PieceFastVerified { piece: 2 });

        assert_eq!(
            sink.take(),
            vec![
                FinderEvent::PieceUnverifiable { piece: 1 },
                FinderEvent::PieceFastVerified { piece: 2 },
            ]
        );
        assert!(sink.events().is_empty());
    }
}
