//! File/piece overlap geometry
//!
//! Pure functions over half-open byte ranges of the payload stream. A file
//! that overlaps a piece falls into exactly one of four cases, and each case
//! yields the (seek, length) window of the file that feeds the piece.

use std::fmt;

/// Half-open range `[start, end)` in the logical payload stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start + len,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}B, {}B)", self.start, self.end)
    }
}

/// How a file overlaps a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    /// The piece lies entirely within the file
    FileContainsPiece,
    /// The file starts before the piece and ends inside it
    FileEndsInsidePiece,
    /// The file starts inside the piece and ends after it
    FileStartsInsidePiece,
    /// The whole file lies inside the piece
    PieceContainsFile,
}

/// Window of a file that contributes to a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Substream {
    /// Offset within the file to start reading from
    pub seek: u64,
    /// Number of bytes to read
    pub length: u64,
}

/// Whether the two ranges share at least one byte. An empty file shares
/// none, wherever it sits.
pub fn overlaps(file: ByteRange, piece: ByteRange) -> bool {
    !file.is_empty() && file.start < piece.end && piece.start < file.end
}

/// Classify an overlapping pair. Cases are tested in priority order; `None`
/// means the pair fits none of them.
pub fn classify(file: ByteRange, piece: ByteRange) -> Option<Overlap> {
    if file.start <= piece.start && file.end >= piece.end {
        Some(Overlap::FileContainsPiece)
    } else if file.start < piece.start && file.end > piece.start && file.end < piece.end {
        Some(Overlap::FileEndsInsidePiece)
    } else if file.start > piece.start && file.start < piece.end && file.end > piece.end {
        Some(Overlap::FileStartsInsidePiece)
    } else if file.start >= piece.start && file.end <= piece.end {
        Some(Overlap::PieceContainsFile)
    } else {
        None
    }
}

impl Overlap {
    pub fn substream(self, file: ByteRange, piece: ByteRange) -> Substream {
        match self {
            Overlap::FileContainsPiece => Substream {
                seek: piece.start - file.start,
                length: piece.len(),
            },
            Overlap::FileEndsInsidePiece => Substream {
                seek: piece.start - file.start,
                length: file.end - piece.start,
            },
            Overlap::FileStartsInsidePiece => Substream {
                seek: 0,
                length: piece.end - file.start,
            },
            Overlap::PieceContainsFile => Substream {
                seek: 0,
                length: file.len(),
            },
        }
    }
}

impl fmt::Display for Overlap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Overlap::FileContainsPiece => "piece only has one file",
            Overlap::FileEndsInsidePiece => "file begins before piece and ends inside piece",
            Overlap::FileStartsInsidePiece => "file begins inside piece and ends after piece ends",
            Overlap::PieceContainsFile => "entire file is held within piece",
        };
        f.write_str(text)
    }
}
