//! Payload geometry: declared files and hashed pieces
//!
//! The payload is the concatenation of every declared file in metafile
//! order. Pieces slice that stream into fixed-size hashed chunks. Each piece
//! keeps the list of files feeding it, referring to them by position in the
//! file table so several pieces can update the same file.

use crate::events::{EventSink, FinderEvent};
use crate::metafile::MetafileError;
use crate::overlap::{classify, overlaps, ByteRange};
use crate::search::{Contribution, ContributingFiles};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bridge::{FileReport, MatchStatus, PieceEstimate, SearchEstimate};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Length of a SHA-1 piece digest
pub const PIECE_HASH_LEN: usize = 20;

/// One declared file of the payload
#[derive(Debug, Clone)]
pub struct PayloadFile {
    /// 1-based position in the metafile
    pub index: usize,
    /// Directory declared by the metafile, relative, payload name included
    pub directory: PathBuf,
    pub filename: String,
    pub size: u64,
    /// Offset of the first byte in the payload stream
    pub stream_offset: u64,
    pub status: MatchStatus,
    pub matched_path: Option<PathBuf>,
    /// Same-size files on disk that could hold this file's content
    pub candidates: Vec<PathBuf>,
}

impl PayloadFile {
    pub fn new(
        index: usize,
        directory: PathBuf,
        filename: String,
        size: u64,
        stream_offset: u64,
    ) -> Self {
        Self {
            index,
            directory,
            filename,
            size,
            stream_offset,
            status: MatchStatus::NotChecked,
            matched_path: None,
            candidates: Vec::new(),
        }
    }

    pub fn ending_offset(&self) -> u64 {
        self.stream_offset + self.size
    }

    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.stream_offset, self.size)
    }

    /// Path of this file as laid out by the metafile
    pub fn metafile_path(&self) -> PathBuf {
        self.directory.join(&self.filename)
    }

    pub fn matched_path(&self) -> Option<&Path> {
        self.matched_path.as_deref()
    }

    pub fn has_been_matched(&self) -> bool {
        self.status.is_match()
    }

    /// Paths a search may try for this file: the confirmed match once there
    /// is one, otherwise every candidate
    pub fn possible_paths(&self) -> &[PathBuf] {
        match (&self.status, &self.matched_path) {
            (MatchStatus::MatchFound, Some(path)) => std::slice::from_ref(path),
            _ => &self.candidates,
        }
    }

    /// Move to `status` unless already matched. Returns the previous status
    /// when something changed.
    pub(crate) fn update_status(&mut self, status: MatchStatus) -> Option<MatchStatus> {
        if self.status.is_match() || self.status == status {
            return None;
        }
        Some(std::mem::replace(&mut self.status, status))
    }

    pub fn report(&self) -> FileReport {
        FileReport {
            index: self.index,
            path: self.metafile_path(),
            size: self.size,
            status: self.status,
            matched_path: self.matched_path.clone().filter(|_| self.has_been_matched()),
            candidates: self.candidates.len(),
        }
    }
}

impl fmt::Display for PayloadFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PayloadFile #{} => {}:{}B:PayloadSubstream={}:Status={}",
            self.index,
            self.metafile_path().display(),
            self.size,
            self.range(),
            self.status
        )?;
        if let Some(path) = &self.matched_path {
            write!(f, "~{}", path.display())?;
        }
        Ok(())
    }
}

/// One hashed slice of the payload stream
#[derive(Debug, Clone)]
pub struct PayloadPiece {
    /// 1-based position in the metafile
    pub index: usize,
    pub size: u64,
    pub stream_offset: u64,
    pub hash: [u8; PIECE_HASH_LEN],
    pub verified: bool,
    contributors: ContributingFiles,
}

impl PayloadPiece {
    pub fn new(index: usize, size: u64, stream_offset: u64, hash: [u8; PIECE_HASH_LEN]) -> Self {
        Self {
            index,
            size,
            stream_offset,
            hash,
            verified: false,
            contributors: ContributingFiles::default(),
        }
    }

    pub fn ending_offset(&self) -> u64 {
        self.stream_offset + self.size
    }

    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.stream_offset, self.size)
    }

    pub fn hash_base64(&self) -> String {
        BASE64.encode(self.hash)
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn contributors(&self) -> &ContributingFiles {
        &self.contributors
    }

    /// Attach every file overlapping this piece, in declaration order.
    /// `files` must be sorted by stream offset.
    fn attach_contributors(&mut self, files: &[PayloadFile]) -> Result<(), MetafileError> {
        let piece = self.range();
        let first = files.partition_point(|f| f.ending_offset() <= piece.start);

        for (position, file) in files.iter().enumerate().skip(first) {
            if file.stream_offset >= piece.end {
                break;
            }
            if !overlaps(file.range(), piece) {
                continue;
            }
            let case = classify(file.range(), piece).ok_or(MetafileError::InconsistentGeometry {
                file: file.index,
                piece: self.index,
            })?;
            let substream = case.substream(file.range(), piece);
            debug!(
                piece = self.index,
                file = file.index,
                seek = substream.seek,
                read = substream.length,
                "Contribution: {}",
                case
            );
            self.contributors.push(Contribution::new(position, substream));
        }
        Ok(())
    }

    /// Whether every contributor has at least one path to try
    pub fn is_verifiable(&self, files: &[PayloadFile]) -> bool {
        self.contributors.combinations(files) > 0
    }

    /// Try to verify this piece against the candidates of its contributors,
    /// updating the files' statuses. Returns whether the piece is verified.
    pub fn find_match(
        &mut self,
        files: &mut [PayloadFile],
        fast_verification: bool,
        sink: &dyn EventSink,
    ) -> bool {
        if !self.is_verifiable(files) {
            sink.record(FinderEvent::PieceUnverifiable { piece: self.index });
            self.contributors
                .update_statuses(files, MatchStatus::Unverifiable, sink);
            return self.verified;
        }

        if fast_verification && self.contributors.all_matched(files) {
            sink.record(FinderEvent::PieceFastVerified { piece: self.index });
            self.verified = true;
            return true;
        }

        if self
            .contributors
            .search(files, self.index, &self.hash, sink)
        {
            self.verified = true;
        }
        self.verified
    }
}

impl fmt::Display for PayloadPiece {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PayloadPiece #{}:{} (HASH={})",
            self.index,
            self.range(),
            self.hash_base64()
        )
    }
}

/// Declared files and pieces of one metafile
#[derive(Debug, Clone)]
pub struct Payload {
    /// Name from the metafile: the file name in single-file mode, the
    /// top-level directory otherwise
    pub name: String,
    pub piece_length: u64,
    files: Vec<PayloadFile>,
    pieces: Vec<PayloadPiece>,
}

impl Payload {
    /// Lay pieces over the files and work out which files feed which piece.
    ///
    /// Files must be contiguous and in stream order, starting at 0.
    pub fn from_layout(
        name: String,
        piece_length: u64,
        files: Vec<PayloadFile>,
        hashes: Vec<[u8; PIECE_HASH_LEN]>,
    ) -> Result<Self, MetafileError> {
        if piece_length == 0 {
            return Err(MetafileError::ZeroPieceLength);
        }
        let payload_size = files.last().map(PayloadFile::ending_offset).unwrap_or(0);
        if payload_size == 0 {
            return Err(MetafileError::EmptyPayload);
        }
        let expected = payload_size.div_ceil(piece_length);
        if hashes.len() as u64 != expected {
            return Err(MetafileError::PieceCountMismatch {
                expected,
                found: hashes.len(),
            });
        }

        let num_pieces = hashes.len();
        let final_size = match payload_size % piece_length {
            0 => piece_length,
            remainder => remainder,
        };

        let mut pieces = Vec::with_capacity(num_pieces);
        let mut stream_offset = 0u64;
        for (i, hash) in hashes.into_iter().enumerate() {
            let size = if i + 1 == num_pieces {
                final_size
            } else {
                piece_length
            };
            let mut piece = PayloadPiece::new(i + 1, size, stream_offset, hash);
            piece.attach_contributors(&files)?;
            pieces.push(piece);
            stream_offset += size;
        }

        debug!(
            name = %name,
            payload_size,
            piece_length,
            final_size,
            num_pieces,
            num_files = files.len(),
            "Payload geometry built"
        );

        Ok(Self {
            name,
            piece_length,
            files,
            pieces,
        })
    }

    pub fn files(&self) -> &[PayloadFile] {
        &self.files
    }

    pub fn pieces(&self) -> &[PayloadPiece] {
        &self.pieces
    }

    pub fn file_mut(&mut self, position: usize) -> Option<&mut PayloadFile> {
        self.files.get_mut(position)
    }

    /// Both tables at once, so pieces can update files while being searched
    pub fn split_mut(&mut self) -> (&mut [PayloadFile], &mut [PayloadPiece]) {
        (&mut self.files, &mut self.pieces)
    }

    pub fn payload_size(&self) -> u64 {
        self.files.last().map(PayloadFile::ending_offset).unwrap_or(0)
    }

    pub fn final_piece_size(&self) -> u64 {
        self.pieces.last().map(|p| p.size).unwrap_or(0)
    }

    pub fn is_single_file(&self) -> bool {
        self.files.len() == 1 && self.files[0].directory.as_os_str().is_empty()
    }

    /// Bytes covered by verified pieces
    pub fn verified_bytes(&self) -> u64 {
        self.pieces.iter().filter(|p| p.verified).map(|p| p.size).sum()
    }

    /// Search-space size of every piece given the current candidates
    pub fn estimate(&self) -> SearchEstimate {
        let pieces: Vec<PieceEstimate> = self
            .pieces
            .iter()
            .map(|piece| PieceEstimate {
                piece: piece.index,
                contributors: piece.contributors.len(),
                combinations: piece.contributors.combinations(&self.files),
            })
            .collect();
        let total_combinations = pieces
            .iter()
            .fold(0u64, |acc, p| acc.saturating_add(p.combinations));
        SearchEstimate {
            pieces,
            total_combinations,
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Payload {}", self.name)?;
        writeln!(f, "Payload size => {} Bytes", self.payload_size())?;
        writeln!(f, "Number of files => {}", self.files.len())?;
        for file in &self.files {
            writeln!(f, "  {}", file)?;
        }
        writeln!(f, "Number of pieces => {}", self.pieces.len())?;
        writeln!(f, "Piece size => {} Bytes", self.piece_length)?;
        writeln!(f, "Final piece size => {} Bytes", self.final_piece_size())?;
        for piece in &self.pieces {
            writeln!(f, "  {}", piece)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(sizes: &[u64]) -> Vec<PayloadFile> {
        let mut offset = 0;
        sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                let file = PayloadFile::new(
                    i + 1,
                    PathBuf::from("payload"),
                    format!("file{}", i + 1),
                    size,
                    offset,
                );
                offset += size;
                file
            })
            .collect()
    }

    fn payload(sizes: &[u64], piece_length: u64) -> Payload {
        let total: u64 = sizes.iter().sum();
        let count = total.div_ceil(piece_length) as usize;
        Payload::from_layout("payload".into(), piece_length, layout(sizes), vec![[0u8; 20]; count])
            .unwrap()
    }

    #[test]
    fn two_file_example_geometry() {
        let payload = payload(&[10_000, 5_000], 8192);
        let pieces = payload.pieces();
        assert_eq!(pieces.len(), 2);

        assert_eq!(pieces[0].range(), ByteRange { start: 0, end: 8192 });
        let first: Vec<_> = pieces[0].contributors().iter().collect();
        assert_eq!(first.len(), 1);
        assert_eq!((first[0].file, first[0].seek, first[0].length), (0, 0, 8192));

        assert_eq!(pieces[1].range(), ByteRange { start: 8192, end: 15_000 });
        let second: Vec<_> = pieces[1]
            .contributors()
            .iter()
            .map(|c| (c.file, c.seek, c.length))
            .collect();
        assert_eq!(second, vec![(0, 8192, 1808), (1, 0, 5000)]);
    }

    #[test]
    fn files_and_pieces_tile_the_payload() {
        let payload = payload(&[1, 700, 0, 33, 4096, 2, 999], 256);
        let size = payload.payload_size();
        assert_eq!(size, 1 + 700 + 33 + 4096 + 2 + 999);

        let mut cursor = 0;
        for file in payload.files() {
            assert_eq!(file.stream_offset, cursor);
            cursor = file.ending_offset();
        }
        assert_eq!(cursor, size);

        let mut cursor = 0;
        let pieces = payload.pieces();
        for (i, piece) in pieces.iter().enumerate() {
            assert_eq!(piece.stream_offset, cursor);
            if i + 1 < pieces.len() {
                assert_eq!(piece.size, 256);
            }
            let fed: u64 = piece.contributors().iter().map(|c| c.length).sum();
            assert_eq!(fed, piece.size, "piece {}", piece.index);
            cursor = piece.ending_offset();
        }
        assert_eq!(cursor, size);
    }

    #[test]
    fn exact_multiple_gives_full_final_piece() {
        let payload = payload(&[4096], 1024);
        assert_eq!(payload.pieces().len(), 4);
        assert_eq!(payload.final_piece_size(), 1024);
    }

    #[test]
    fn zero_length_files_feed_no_piece() {
        // One empty file on a piece boundary, one strictly inside a piece
        let payload = payload(&[64, 0, 36, 0, 100], 64);
        assert_eq!(payload.files()[3].stream_offset, 100);
        let feeds_empty = payload
            .pieces()
            .iter()
            .flat_map(|p| p.contributors().iter())
            .any(|c| c.file == 1 || c.file == 3);
        assert!(!feeds_empty);
        assert!(payload
            .pieces()
            .iter()
            .all(|p| p.contributors().iter().all(|c| c.length > 0)));
    }

    #[test]
    fn piece_count_must_match_payload() {
        let err = Payload::from_layout("x".into(), 1024, layout(&[3000]), vec![[0u8; 20]; 2])
            .unwrap_err();
        assert!(matches!(
            err,
            MetafileError::PieceCountMismatch { expected: 3, found: 2 }
        ));
    }

    #[test]
    fn status_never_leaves_match_found() {
        let mut file = layout(&[10]).remove(0);
        assert_eq!(
            file.update_status(MatchStatus::CheckedWithNoMatch),
            Some(MatchStatus::NotChecked)
        );
        file.update_status(MatchStatus::MatchFound);
        assert_eq!(file.update_status(MatchStatus::Unverifiable), None);
        assert_eq!(file.status, MatchStatus::MatchFound);
    }

    #[test]
    fn display_shows_base64_hash() {
        let payload = payload(&[10], 16);
        let line = payload.pieces()[0].to_string();
        assert_eq!(line, "PayloadPiece #1:(0B, 10B) (HASH=AAAAAAAAAAAAAAAAAAAAAAAAAAA=)");
    }
}
