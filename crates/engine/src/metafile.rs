//! Metafile parsing into payload geometry
//!
//! Also builds metafiles from local content, which is how fixtures and the
//! `create` command produce torrents to match against.

use crate::bencode::{BencodeError, BencodeValue};
use crate::payload::{Payload, PayloadFile, PIECE_HASH_LEN};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum MetafileError {
    #[error("Bencode parse error: {0}")]
    Bencode(#[from] BencodeError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid value for field: {0}")]
    InvalidField(&'static str),
    #[error("Piece hash blob of {0} bytes is not a multiple of 20")]
    HashBlobLength(usize),
    #[error("Piece length must be positive")]
    ZeroPieceLength,
    #[error("Payload is empty")]
    EmptyPayload,
    #[error("Payload needs {expected} pieces but the metafile lists {found}")]
    PieceCountMismatch { expected: u64, found: usize },
    #[error("File #{file} overlaps piece #{piece} in no known way")]
    InconsistentGeometry { file: usize, piece: usize },
}

impl Payload {
    /// Parse a metafile from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetafileError> {
        let root = BencodeValue::decode(data)?;
        Self::from_bencode(&root)
    }

    /// Read and parse a metafile from disk
    pub fn from_path(path: &Path) -> Result<Self, MetafileError> {
        info!("Loading metafile from {}", path.display());
        let data = fs::read(path).map_err(|e| {
            error!("Metafile {} is not readable: {}", path.display(), e);
            error!("Perhaps change the file permissions: chmod +r '{}'", path.display());
            e
        })?;
        Self::from_bytes(&data)
    }

    /// Build the payload from a decoded metafile dictionary
    pub fn from_bencode(root: &BencodeValue) -> Result<Self, MetafileError> {
        root.as_dict().ok_or(MetafileError::InvalidField("root"))?;
        let info = root.get("info").ok_or(MetafileError::MissingField("info"))?;
        info.as_dict().ok_or(MetafileError::InvalidField("info"))?;

        let name = info
            .get("name")
            .ok_or(MetafileError::MissingField("name"))?
            .as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .ok_or(MetafileError::InvalidField("name"))?;

        let piece_length = unsigned_field(info, "piece length")?;

        let blob = info
            .get("pieces")
            .ok_or(MetafileError::MissingField("pieces"))?
            .as_bytes()
            .ok_or(MetafileError::InvalidField("pieces"))?;
        let hashes = split_hashes(blob)?;

        let files = if info.get("length").is_some() {
            debug!("Metafile is in single-file mode");
            let size = unsigned_field(info, "length")?;
            vec![PayloadFile::new(1, PathBuf::new(), name.clone(), size, 0)]
        } else {
            debug!("Metafile is in multi-file mode");
            let entries = info
                .get("files")
                .ok_or(MetafileError::MissingField("length or files"))?
                .as_list()
                .ok_or(MetafileError::InvalidField("files"))?;
            multi_file_layout(&name, entries)?
        };

        Payload::from_layout(name, piece_length, files, hashes)
    }
}

fn unsigned_field(dict: &BencodeValue, key: &'static str) -> Result<u64, MetafileError> {
    let value = dict
        .get(key)
        .ok_or(MetafileError::MissingField(key))?
        .as_integer()
        .ok_or(MetafileError::InvalidField(key))?;
    u64::try_from(value).map_err(|_| MetafileError::InvalidField(key))
}

fn split_hashes(blob: &[u8]) -> Result<Vec<[u8; PIECE_HASH_LEN]>, MetafileError> {
    if blob.len() % PIECE_HASH_LEN != 0 {
        return Err(MetafileError::HashBlobLength(blob.len()));
    }
    Ok(blob
        .chunks_exact(PIECE_HASH_LEN)
        .map(|chunk| {
            let mut hash = [0u8; PIECE_HASH_LEN];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

fn multi_file_layout(
    name: &str,
    entries: &[BencodeValue],
) -> Result<Vec<PayloadFile>, MetafileError> {
    let mut files = Vec::with_capacity(entries.len());
    let mut stream_offset = 0u64;

    for (i, entry) in entries.iter().enumerate() {
        entry.as_dict().ok_or(MetafileError::InvalidField("files"))?;
        let size = unsigned_field(entry, "length")?;

        let segments = entry
            .get("path")
            .ok_or(MetafileError::MissingField("path"))?
            .as_list()
            .ok_or(MetafileError::InvalidField("path"))?
            .iter()
            .map(|segment| {
                segment
                    .as_bytes()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .filter(|s| is_plain_segment(s))
                    .ok_or(MetafileError::InvalidField("path"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let Some((filename, parents)) = segments.split_last() else {
            return Err(MetafileError::InvalidField("path"));
        };
        let directory: PathBuf = std::iter::once(name)
            .chain(parents.iter().map(String::as_str))
            .collect();

        debug!(
            file = i + 1,
            path = %directory.join(filename).display(),
            size,
            stream_offset,
            "Decoded file entry"
        );
        files.push(PayloadFile::new(
            i + 1,
            directory,
            filename.clone(),
            size,
            stream_offset,
        ));
        stream_offset = stream_offset
            .checked_add(size)
            .ok_or(MetafileError::InvalidField("length"))?;
    }

    Ok(files)
}

/// A path segment that names exactly one normal component
fn is_plain_segment(segment: &str) -> bool {
    let mut components = Path::new(segment).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Accumulates payload bytes into piece digests
struct PieceHasher {
    piece_length: usize,
    buffer: Vec<u8>,
    digests: Vec<u8>,
}

impl PieceHasher {
    fn new(piece_length: usize) -> Self {
        Self {
            piece_length,
            buffer: Vec::with_capacity(piece_length),
            digests: Vec::new(),
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (self.piece_length - self.buffer.len()).min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buffer.len() == self.piece_length {
                self.flush();
            }
        }
    }

    fn hash_file(&mut self, path: &Path) -> io::Result<()> {
        let mut file = fs::File::open(path)?;
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut chunk)?;
            if n == 0 {
                return Ok(());
            }
            self.update(&chunk[..n]);
        }
    }

    fn flush(&mut self) {
        self.digests.extend_from_slice(&Sha1::digest(&self.buffer));
        self.buffer.clear();
    }

    fn finish(mut self) -> Vec<u8> {
        if !self.buffer.is_empty() {
            self.flush();
        }
        self.digests
    }
}

/// Create a bencoded metafile describing `source`, a file or a directory.
///
/// Directory entries are visited in file-name order so the same tree always
/// produces the same metafile.
pub fn create_metafile(source: &Path, piece_length: u64) -> Result<Vec<u8>, MetafileError> {
    let piece_len = usize::try_from(piece_length)
        .ok()
        .filter(|&n| n > 0)
        .ok_or(MetafileError::ZeroPieceLength)?;
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or(MetafileError::InvalidField("name"))?;

    let mut info: BTreeMap<Vec<u8>, BencodeValue> = BTreeMap::new();
    info.insert(b"name".to_vec(), BencodeValue::string(name));
    info.insert(
        b"piece length".to_vec(),
        BencodeValue::Integer(piece_length as i64),
    );

    let mut hasher = PieceHasher::new(piece_len);
    let mut total_size = 0u64;

    if source.is_file() {
        total_size = fs::metadata(source)?.len();
        hasher.hash_file(source)?;
        info.insert(b"length".to_vec(), BencodeValue::Integer(total_size as i64));
    } else if source.is_dir() {
        let mut files_list = Vec::new();
        for entry in WalkDir::new(source).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let len = entry.metadata().map_err(io::Error::from)?.len();
            let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
            let path: Vec<BencodeValue> = relative
                .components()
                .filter_map(|c| match c {
                    Component::Normal(s) => {
                        Some(BencodeValue::string(s.to_string_lossy().into_owned()))
                    }
                    _ => None,
                })
                .collect();

            let mut file_dict = BTreeMap::new();
            file_dict.insert(b"length".to_vec(), BencodeValue::Integer(len as i64));
            file_dict.insert(b"path".to_vec(), BencodeValue::List(path));
            files_list.push(BencodeValue::Dict(file_dict));

            hasher.hash_file(entry.path())?;
            total_size += len;
        }
        info.insert(b"files".to_vec(), BencodeValue::List(files_list));
    } else {
        return Err(MetafileError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is neither a file nor a directory", source.display()),
        )));
    }

    if total_size == 0 {
        return Err(MetafileError::EmptyPayload);
    }
    info.insert(b"pieces".to_vec(), BencodeValue::String(hasher.finish()));

    let creation_date = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let mut root: BTreeMap<Vec<u8>, BencodeValue> = BTreeMap::new();
    root.insert(b"created by".to_vec(), BencodeValue::string("refind"));
    root.insert(b"creation date".to_vec(), BencodeValue::Integer(creation_date));
    root.insert(b"info".to_vec(), BencodeValue::Dict(info));

    Ok(BencodeValue::Dict(root).encode())
}
