//! Persistence backends for the content cache

use super::{CacheEntry, CacheError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const SNAPSHOT_VERSION: u32 = 1;

/// Where the cache index is persisted
pub trait CacheStore: Send + Sync {
    /// The last saved snapshot, `None` if nothing was ever saved
    fn load(&self) -> Result<Option<Vec<CacheEntry>>, CacheError>;
    fn save(&self, entries: &[CacheEntry]) -> Result<(), CacheError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: Vec<CacheEntry>,
}

/// JSON snapshot on disk, replaced atomically on every save
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CacheStore for JsonFileStore {
    fn load(&self) -> Result<Option<Vec<CacheEntry>>, CacheError> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_reader(BufReader::new(file))?;
        if snapshot.version != SNAPSHOT_VERSION {
            warn!(
                "Ignoring cache snapshot {} with unknown version {}",
                self.path.display(),
                snapshot.version
            );
            return Ok(None);
        }
        debug!(path = %self.path.display(), entries = snapshot.entries.len(), "Loaded cache snapshot");
        Ok(Some(snapshot.entries))
    }

    fn save(&self, entries: &[CacheEntry]) -> Result<(), CacheError> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let tmp = NamedTempFile::new_in(parent)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer(
                &mut writer,
                &Snapshot {
                    version: SNAPSHOT_VERSION,
                    entries: entries.to_vec(),
                },
            )?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;

        debug!(path = %self.path.display(), entries = entries.len(), "Saved cache snapshot");
        Ok(())
    }
}

/// Keeps the snapshot in memory; for tests and throwaway caches
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<Vec<CacheEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<CacheEntry>) -> Self {
        Self {
            snapshot: Mutex::new(Some(entries)),
        }
    }

    pub fn snapshot(&self) -> Option<Vec<CacheEntry>> {
        self.snapshot.lock().clone()
    }
}

impl CacheStore for MemoryStore {
    fn load(&self) -> Result<Option<Vec<CacheEntry>>, CacheError> {
        Ok(self.snapshot())
    }

    fn save(&self, entries: &[CacheEntry]) -> Result<(), CacheError> {
        *self.snapshot.lock() = Some(entries.to_vec());
        Ok(())
    }
}

impl<S: CacheStore + ?Sized> CacheStore for std::sync::Arc<S> {
    fn load(&self) -> Result<Option<Vec<CacheEntry>>, CacheError> {
        (**self).load()
    }

    fn save(&self, entries: &[CacheEntry]) -> Result<(), CacheError> {
        (**self).save(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(dir: &str, name: &str, size: u64) -> CacheEntry {
        CacheEntry {
            directory: PathBuf::from(dir),
            filename: name.into(),
            size,
        }
    }

    #[test]
    fn json_store_round_trips_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested/cache.json"));
        assert!(store.load().unwrap().is_none());

        let entries = vec![entry("/data", "a.bin", 10), entry("/data/sub", "b.bin", 0)];
        store.save(&entries).unwrap();
        assert_eq!(store.load().unwrap(), Some(entries));

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["entries"][0]["filename"], "a.bin");
    }

    #[test]
    fn unknown_version_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, r#"{"version":99,"entries":[]}"#).unwrap();
        assert!(JsonFileStore::new(&path).load().unwrap().is_none());
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            JsonFileStore::new(&path).load(),
            Err(CacheError::Json(_))
        ));
    }
}
