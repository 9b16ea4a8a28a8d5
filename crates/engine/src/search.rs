//! Combinatorial hash search for one piece
//!
//! Every file feeding a piece brings a list of possible paths. The search
//! walks the Cartesian product of those lists, first contributor slowest,
//! hashing the concatenated substreams of each combination until one
//! reproduces the piece digest.

use crate::events::{EventSink, FinderEvent};
use crate::overlap::Substream;
use crate::payload::{PayloadFile, PIECE_HASH_LEN};
use bridge::MatchStatus;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// The bytes one file gives to one piece
#[derive(Debug, Clone)]
pub struct Contribution {
    /// Position of the file in the payload's file table
    pub file: usize,
    /// Offset within the file where the contribution starts
    pub seek: u64,
    /// Number of bytes contributed
    pub length: u64,
    /// Path tried for this file by the current combination
    assigned: Option<PathBuf>,
}

impl Contribution {
    pub fn new(file: usize, substream: Substream) -> Self {
        Self {
            file,
            seek: substream.seek,
            length: substream.length,
            assigned: None,
        }
    }

    pub fn assigned_path(&self) -> Option<&Path> {
        self.assigned.as_deref()
    }

    /// Read this contribution's window from `path` into the hasher. The file
    /// handle is closed before returning, whatever the outcome.
    fn hash_from(&self, path: &Path, hasher: &mut Sha1) -> io::Result<()> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(self.seek))?;

        let length = usize::try_from(self.length)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "contribution too large"))?;
        let mut buffer = vec![0u8; length];
        file.read_exact(&mut buffer)?;

        hasher.update(&buffer);
        Ok(())
    }
}

/// Files feeding one piece, in stream order
#[derive(Debug, Clone, Default)]
pub struct ContributingFiles {
    members: Vec<Contribution>,
    last_search_matched: Option<bool>,
}

impl ContributingFiles {
    pub fn push(&mut self, contribution: Contribution) {
        self.members.push(contribution);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contribution> {
        self.members.iter()
    }

    /// Outcome of the most recent search, `None` if none ran
    pub fn last_search_matched(&self) -> Option<bool> {
        self.last_search_matched
    }

    /// Size of the search space: product of every contributor's possible
    /// path count, saturating at `u64::MAX`
    pub fn combinations(&self, files: &[PayloadFile]) -> u64 {
        self.members.iter().fold(1u64, |acc, c| {
            acc.saturating_mul(files[c.file].possible_paths().len() as u64)
        })
    }

    pub fn all_matched(&self, files: &[PayloadFile]) -> bool {
        self.members.iter().all(|c| files[c.file].has_been_matched())
    }

    /// Set `status` on every contributing file that is not already matched
    pub fn update_statuses(
        &self,
        files: &mut [PayloadFile],
        status: MatchStatus,
        sink: &dyn EventSink,
    ) {
        for member in &self.members {
            let file = &mut files[member.file];
            if let Some(from) = file.update_status(status) {
                sink.record(FinderEvent::StatusChanged {
                    file: file.index,
                    from,
                    to: status,
                });
            }
        }
    }

    /// Search the product of possible paths for a combination hashing to
    /// `expected`. On success the assigned paths become the files' matches.
    pub fn search(
        &mut self,
        files: &mut [PayloadFile],
        piece: usize,
        expected: &[u8; PIECE_HASH_LEN],
        sink: &dyn EventSink,
    ) -> bool {
        let path_sets: Vec<Vec<PathBuf>> = self
            .members
            .iter()
            .map(|c| files[c.file].possible_paths().to_vec())
            .collect();

        sink.record(FinderEvent::SearchStarted {
            piece,
            contributors: self.members.len(),
            combinations: self.combinations(files),
        });

        let radices = path_sets.iter().map(Vec::len).collect();
        let mut attempts = 0u64;
        let mut matched = false;

        for combination in Combinations::new(radices) {
            attempts += 1;
            for (member, (&choice, paths)) in self
                .members
                .iter_mut()
                .zip(combination.iter().zip(&path_sets))
            {
                member.assigned = Some(paths[choice].clone());
            }

            match self.hash_assigned() {
                Ok(digest) if digest == *expected => {
                    matched = true;
                    break;
                }
                Ok(_) => sink.record(FinderEvent::CombinationRejected {
                    piece,
                    attempt: attempts,
                }),
                Err((path, err)) => sink.record(FinderEvent::CandidateUnreadable {
                    piece,
                    path,
                    error: err.to_string(),
                }),
            }
        }

        if matched {
            sink.record(FinderEvent::PieceMatched { piece, attempts });
            self.commit(files, sink);
        } else {
            sink.record(FinderEvent::PieceExhausted { piece, attempts });
            self.update_statuses(files, MatchStatus::CheckedWithNoMatch, sink);
        }

        self.last_search_matched = Some(matched);
        matched
    }

    /// Hash the current combination. A failed read reports the offending path.
    fn hash_assigned(&self) -> Result<[u8; PIECE_HASH_LEN], (PathBuf, io::Error)> {
        let mut hasher = Sha1::new();
        for member in &self.members {
            let Some(path) = member.assigned.as_deref() else {
                continue;
            };
            member
                .hash_from(path, &mut hasher)
                .map_err(|e| (path.to_path_buf(), e))?;
        }
        Ok(hasher.finalize().into())
    }

    fn commit(&self, files: &mut [PayloadFile], sink: &dyn EventSink) {
        for member in &self.members {
            let file = &mut files[member.file];
            if file.has_been_matched() {
                continue;
            }
            if let Some(path) = &member.assigned {
                file.matched_path = Some(path.clone());
                sink.record(FinderEvent::FileMatched {
                    file: file.index,
                    path: path.clone(),
                });
            }
        }
        self.update_statuses(files, MatchStatus::MatchFound, sink);
    }
}

/// Odometer over index tuples, last position turning fastest
struct Combinations {
    radices: Vec<usize>,
    current: Vec<usize>,
    done: bool,
}

impl Combinations {
    fn new(radices: Vec<usize>) -> Self {
        let done = radices.contains(&0);
        Self {
            current: vec![0; radices.len()],
            radices,
            done,
        }
    }
}

impl Iterator for Combinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let out = self.current.clone();

        self.done = true;
        for i in (0..self.radices.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.radices[i] {
                self.done = false;
                break;
            }
            self.current[i] = 0;
        }
        Some(out)
    }
}
