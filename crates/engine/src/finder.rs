//! Matching orchestrator
//!
//! [`LocalFileFinder`] ties a decoded payload to candidate files and walks
//! the pieces in order, letting each piece search narrow down which
//! candidate holds which declared file.

use crate::cache::ContentIndex;
use crate::config::Config;
use crate::events::{EventSink, FinderEvent, TracingSink};
use crate::metafile::MetafileError;
use crate::payload::Payload;
use bitvec::prelude::*;
use bridge::{MatchReport, SearchEstimate};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum FinderError {
    #[error(transparent)]
    Metafile(#[from] MetafileError),
    #[error("No file at position {position}, the payload has {files} files")]
    UnknownFile { position: usize, files: usize },
    #[error("Piece #{piece} needs {combinations} combinations, over the limit of {limit}")]
    SearchSpaceTooLarge {
        piece: usize,
        combinations: u64,
        limit: u64,
    },
}

pub struct LocalFileFinder {
    payload: Payload,
    fast_verification: bool,
    max_combinations: Option<u64>,
    cancel: Option<Arc<AtomicBool>>,
    sink: Arc<dyn EventSink>,
    cancelled: bool,
}

impl LocalFileFinder {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            fast_verification: false,
            max_combinations: None,
            cancel: None,
            sink: Arc::new(TracingSink),
            cancelled: false,
        }
    }

    pub fn from_path(metafile: &Path) -> Result<Self, FinderError> {
        Ok(Self::new(Payload::from_path(metafile)?))
    }

    /// Trust earlier matches instead of re-hashing pieces whose files are
    /// all matched
    pub fn with_fast_verification(mut self, enabled: bool) -> Self {
        self.fast_verification = enabled;
        self
    }

    /// Fail [`run`](Self::run) up front when any piece has more than
    /// `limit` combinations to try
    pub fn with_search_limit(mut self, limit: Option<u64>) -> Self {
        self.max_combinations = limit;
        self
    }

    /// Stop between pieces once `flag` is set
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_config(self, config: &Config) -> Self {
        self.with_fast_verification(config.fast_verification)
            .with_search_limit(config.max_combinations)
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Set the candidates for the file at `position` (0-based)
    pub fn connect_candidates(
        &mut self,
        position: usize,
        candidates: Vec<PathBuf>,
    ) -> Result<(), FinderError> {
        let files = self.payload.files().len();
        let file = self
            .payload
            .file_mut(position)
            .ok_or(FinderError::UnknownFile { position, files })?;

        self.sink.record(FinderEvent::CandidatesConnected {
            file: file.index,
            candidates: candidates.len(),
        });
        file.candidates = candidates;
        Ok(())
    }

    /// Give every file the same-size files known to `source`
    pub fn connect_candidates_from<C: ContentIndex + ?Sized>(&mut self, source: &C) {
        let (files, _) = self.payload.split_mut();
        for file in files.iter_mut() {
            file.candidates = source.files_of_size(file.size);
            self.sink.record(FinderEvent::CandidatesConnected {
                file: file.index,
                candidates: file.candidates.len(),
            });
        }
    }

    pub fn estimate(&self) -> SearchEstimate {
        self.payload.estimate()
    }

    /// Verify every piece in order and report the outcome
    pub fn run(&mut self) -> Result<MatchReport, FinderError> {
        if let Some(limit) = self.max_combinations {
            let estimate = self.estimate();
            if let Some(worst) = estimate.pieces.iter().find(|p| p.combinations > limit) {
                return Err(FinderError::SearchSpaceTooLarge {
                    piece: worst.piece,
                    combinations: worst.combinations,
                    limit,
                });
            }
        }

        info!(
            "Matching {} ({} files, {} pieces)",
            self.payload.name,
            self.payload.files().len(),
            self.payload.pieces().len()
        );

        let sink = Arc::clone(&self.sink);
        let cancel = self.cancel.clone();
        let fast = self.fast_verification;
        let payload_size = self.payload.payload_size();
        let mut verified_bytes = self.payload.verified_bytes();
        self.cancelled = false;

        let (files, pieces) = self.payload.split_mut();
        for piece in pieces.iter_mut() {
            if cancel.as_ref().is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                sink.record(FinderEvent::Cancelled {
                    before_piece: piece.index,
                });
                self.cancelled = true;
                break;
            }

            let was_verified = piece.verified;
            let verified = piece.find_match(files, fast, sink.as_ref());
            if verified && !was_verified {
                verified_bytes += piece.size;
            }
            sink.record(FinderEvent::Progress {
                piece: piece.index,
                verified,
                percent: percent(verified_bytes, payload_size),
            });
        }

        let report = self.report();
        info!(
            "Matched {:.2}% of {} ({}/{} pieces)",
            report.percent_matched, report.name, report.verified_pieces, report.total_pieces
        );
        Ok(report)
    }

    /// Share of the payload covered by verified pieces, 0 to 100
    pub fn percent_matched(&self) -> f64 {
        percent(self.payload.verified_bytes(), self.payload.payload_size())
    }

    pub fn report(&self) -> MatchReport {
        let pieces = self.payload.pieces();
        let mut bitfield: BitVec<u8, Msb0> = BitVec::repeat(false, pieces.len());
        for (i, piece) in pieces.iter().enumerate() {
            bitfield.set(i, piece.verified);
        }

        MatchReport {
            name: self.payload.name.clone(),
            files: self.payload.files().iter().map(|f| f.report()).collect(),
            percent_matched: self.percent_matched(),
            verified_pieces: bitfield.count_ones(),
            total_pieces: pieces.len(),
            verified_bitfield: hex::encode(bitfield.as_raw_slice()),
            cancelled: self.cancelled,
        }
    }
}

fn percent(verified: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    verified as f64 / total as f64 * 100.0
}

/// Match a metafile against explicit candidate lists, one list per declared
/// file in metafile order. Returns the resolved path of every file, `None`
/// where no match was proven.
pub fn find_matches(
    metafile: &[u8],
    candidates: Vec<Vec<PathBuf>>,
    fast_verification: bool,
) -> Result<Vec<Option<PathBuf>>, FinderError> {
    let payload = Payload::from_bytes(metafile)?;
    let mut finder = LocalFileFinder::new(payload).with_fast_verification(fast_verification);
    for (position, paths) in candidates.into_iter().enumerate() {
        finder.connect_candidates(position, paths)?;
    }
    let report = finder.run()?;
    Ok(report.files.into_iter().map(|f| f.matched_path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::metafile::create_metafile;
    use bridge::MatchStatus;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        metafile: Vec<u8>,
        a: PathBuf,
        b: PathBuf,
        decoy: PathBuf,
    }

    /// A (10,000 B) and B (5,000 B) with 8 KiB pieces, moved away from the
    /// layout the metafile describes
    fn two_files() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let mut a = vec![0u8; 10_000];
        let mut b = vec![0u8; 5_000];
        rng.fill_bytes(&mut a);
        rng.fill_bytes(&mut b);

        let source = dir.path().join("release");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("a.bin"), &a).unwrap();
        fs::write(source.join("b.bin"), &b).unwrap();
        let metafile = create_metafile(&source, 8192).unwrap();

        let moved = dir.path().join("moved");
        fs::create_dir_all(&moved).unwrap();
        fs::rename(source.join("a.bin"), moved.join("renamed-a")).unwrap();
        fs::rename(source.join("b.bin"), moved.join("renamed-b")).unwrap();
        let decoy = moved.join("decoy-a");
        a[0] ^= 0xFF;
        fs::write(&decoy, &a).unwrap();

        Fixture {
            metafile,
            a: moved.join("renamed-a"),
            b: moved.join("renamed-b"),
            decoy,
            _dir: dir,
        }
    }

    #[test]
    fn matches_relocated_files() {
        let fx = two_files();
        let sink = Arc::new(RecordingSink::new());
        let mut finder = LocalFileFinder::new(Payload::from_bytes(&fx.metafile).unwrap())
            .with_event_sink(sink.clone());
        finder
            .connect_candidates(0, vec![fx.decoy.clone(), fx.a.clone()])
            .unwrap();
        finder.connect_candidates(1, vec![fx.b.clone()]).unwrap();
        assert_eq!(finder.estimate().total_combinations, 2 + 2);

        let report = finder.run().unwrap();
        assert!(report.is_complete());
        assert_eq!(report.percent_matched, 100.0);
        assert_eq!(report.verified_bitfield, "c0");
        assert_eq!(report.files[0].matched_path.as_deref(), Some(fx.a.as_path()));
        assert_eq!(report.files[1].matched_path.as_deref(), Some(fx.b.as_path()));
        assert_eq!(report.files[0].path, PathBuf::from("release/a.bin"));
        assert!(!report.cancelled);

        // The decoy is rejected by piece 1, then piece 2 only tries A's match
        let events = sink.events();
        assert!(events.contains(&FinderEvent::PieceMatched { piece: 1, attempts: 2 }));
        assert!(events.contains(&FinderEvent::PieceMatched { piece: 2, attempts: 1 }));
    }

    #[test]
    fn missing_candidates_leave_files_unverifiable() {
        let fx = two_files();
        let mut finder = LocalFileFinder::new(Payload::from_bytes(&fx.metafile).unwrap());
        finder.connect_candidates(0, vec![fx.a.clone()]).unwrap();

        let report = finder.run().unwrap();
        assert_eq!(report.files[0].status, MatchStatus::MatchFound);
        assert_eq!(report.files[1].status, MatchStatus::Unverifiable);
        assert_eq!(report.files[1].matched_path, None);
        assert_eq!(report.verified_bitfield, "80");
        assert!((report.percent_matched - 8192.0 / 15_000.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn search_limit_fails_before_hashing() {
        let fx = two_files();
        let sink = Arc::new(RecordingSink::new());
        let mut finder = LocalFileFinder::new(Payload::from_bytes(&fx.metafile).unwrap())
            .with_search_limit(Some(1))
            .with_event_sink(sink.clone());
        finder
            .connect_candidates(0, vec![fx.decoy.clone(), fx.a.clone()])
            .unwrap();
        finder.connect_candidates(1, vec![fx.b.clone()]).unwrap();

        let err = finder.run().unwrap_err();
        assert!(matches!(
            err,
            FinderError::SearchSpaceTooLarge { piece: 1, combinations: 2, limit: 1 }
        ));
        assert!(!sink
            .events()
            .iter()
            .any(|e| matches!(e, FinderEvent::SearchStarted { .. })));
        assert!(finder
            .payload()
            .files()
            .iter()
            .all(|f| f.status == MatchStatus::NotChecked));
    }

    #[test]
    fn cancellation_stops_between_pieces() {
        let fx = two_files();
        let flag = Arc::new(AtomicBool::new(true));
        let sink = Arc::new(RecordingSink::new());
        let mut finder = LocalFileFinder::new(Payload::from_bytes(&fx.metafile).unwrap())
            .with_cancel_flag(flag)
            .with_event_sink(sink.clone());
        finder.connect_candidates(0, vec![fx.a.clone()]).unwrap();
        finder.connect_candidates(1, vec![fx.b.clone()]).unwrap();

        let report = finder.run().unwrap();
        assert!(report.cancelled);
        assert_eq!(report.verified_pieces, 0);
        assert_eq!(report.percent_matched, 0.0);
        assert!(sink
            .events()
            .contains(&FinderEvent::Cancelled { before_piece: 1 }));
    }

    #[test]
    fn unknown_position_is_rejected() {
        let fx = two_files();
        let mut finder = LocalFileFinder::new(Payload::from_bytes(&fx.metafile).unwrap());
        assert!(matches!(
            finder.connect_candidates(2, vec![]),
            Err(FinderError::UnknownFile { position: 2, files: 2 })
        ));
    }

    #[test]
    fn batch_api_returns_paths_in_file_order() {
        let fx = two_files();
        let found = find_matches(
            &fx.metafile,
            vec![vec![fx.a.clone(), fx.decoy.clone()], vec![fx.b.clone()]],
            true,
        )
        .unwrap();
        assert_eq!(found, vec![Some(fx.a.clone()), Some(fx.b.clone())]);

        let found = find_matches(&fx.metafile, vec![vec![fx.decoy.clone()]], false).unwrap();
        assert_eq!(found, vec![None, None]);
    }
}
