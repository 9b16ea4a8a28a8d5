//! Content directory cache
//!
//! Indexes every readable file under a set of content directories by size,
//! so candidates for a payload file can be looked up without touching the
//! disk. The index lives in memory and every mutation is written through to
//! a [`CacheStore`] before it becomes visible.

mod encoded;
mod store;
mod walk;

pub use store::{CacheStore, JsonFileStore, MemoryStore};
pub use walk::{unique_roots, walk_directory};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Cache snapshot error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to replace cache snapshot: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
}

/// One indexed file. Names are kept as the OS reports them, UTF-8 or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(with = "encoded")]
    pub directory: PathBuf,
    #[serde(with = "encoded")]
    pub filename: OsString,
    pub size: u64,
}

impl CacheEntry {
    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.filename)
    }
}

/// Source of same-size candidates for payload files
pub trait ContentIndex {
    /// Readable files of exactly `size` bytes, sorted by path
    fn files_of_size(&self, size: u64) -> Vec<PathBuf>;

    /// Index every file below `path`. Returns the number of files found.
    fn add_directory(&self, path: &Path) -> Result<usize, CacheError>;

    /// Forget every file at or below `path`. Returns the number removed.
    fn remove_directory(&self, path: &Path) -> Result<usize, CacheError>;
}

#[derive(Debug, Clone, Default)]
struct Index {
    by_key: BTreeMap<(PathBuf, OsString), u64>,
    by_size: BTreeMap<u64, BTreeSet<PathBuf>>,
}

impl Index {
    fn from_entries(entries: impl IntoIterator<Item = CacheEntry>) -> Self {
        let mut index = Self::default();
        for entry in entries {
            index.insert(entry);
        }
        index
    }

    /// Insert, replacing any entry with the same directory and filename
    fn insert(&mut self, entry: CacheEntry) {
        let path = entry.path();
        let key = (entry.directory, entry.filename);
        if let Some(old_size) = self.by_key.insert(key, entry.size) {
            self.unlink(old_size, &path);
        }
        self.by_size.entry(entry.size).or_default().insert(path);
    }

    fn unlink(&mut self, size: u64, path: &Path) {
        if let Some(paths) = self.by_size.get_mut(&size) {
            paths.remove(path);
            if paths.is_empty() {
                self.by_size.remove(&size);
            }
        }
    }

    /// Remove entries whose directory is `root` or below it
    fn remove_under(&mut self, root: &Path) -> usize {
        let doomed: Vec<((PathBuf, OsString), u64)> = self
            .by_key
            .iter()
            .filter(|((dir, _), _)| dir.starts_with(root))
            .map(|(key, &size)| (key.clone(), size))
            .collect();

        for ((dir, name), size) in &doomed {
            self.by_key.remove(&(dir.clone(), name.clone()));
            self.unlink(*size, &dir.join(name));
        }
        doomed.len()
    }

    fn paths_of_size(&self, size: u64) -> Vec<PathBuf> {
        self.by_size
            .get(&size)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn entries(&self) -> Vec<CacheEntry> {
        self.by_key
            .iter()
            .map(|((directory, filename), &size)| CacheEntry {
                directory: directory.clone(),
                filename: filename.clone(),
                size,
            })
            .collect()
    }
}

/// In-memory size index over content directories, persisted through a
/// [`CacheStore`]
pub struct ContentDirectoryCache {
    index: RwLock<Index>,
    store: Box<dyn CacheStore>,
}

impl ContentDirectoryCache {
    /// Load the index from `store`. When the store holds no snapshot yet,
    /// build one by walking `directories`.
    pub fn open(
        directories: &[PathBuf],
        store: impl CacheStore + 'static,
    ) -> Result<Self, CacheError> {
        let store: Box<dyn CacheStore> = Box::new(store);

        if let Some(entries) = store.load()? {
            info!("Loaded content cache with {} files", entries.len());
            return Ok(Self {
                index: RwLock::new(Index::from_entries(entries)),
                store,
            });
        }

        let roots = unique_roots(directories);
        info!("Building content cache from {} directories", roots.len());
        let mut index = Index::default();
        for root in &roots {
            if !root.is_dir() {
                warn!("Skipping {}, not a directory", root.display());
                continue;
            }
            for entry in walk_directory(root) {
                index.insert(entry);
            }
        }
        store.save(&index.entries())?;

        Ok(Self {
            index: RwLock::new(index),
            store,
        })
    }

    /// An empty cache kept only in memory
    pub fn in_memory() -> Self {
        Self {
            index: RwLock::new(Index::default()),
            store: Box::new(MemoryStore::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.index.read().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every indexed file, sorted by directory then filename
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.index.read().entries()
    }

    /// Apply `change` to a copy of the index, persist it, then publish it
    fn mutate<T>(&self, change: impl FnOnce(&mut Index) -> T) -> Result<T, CacheError> {
        let mut guard = self.index.write();
        let mut next = guard.clone();
        let out = change(&mut next);
        self.store.save(&next.entries())?;
        *guard = next;
        Ok(out)
    }
}

impl ContentIndex for ContentDirectoryCache {
    fn files_of_size(&self, size: u64) -> Vec<PathBuf> {
        let paths = self.index.read().paths_of_size(size);
        paths
            .into_iter()
            .filter(|path| {
                let readable = path.is_file() && File::open(path).is_ok();
                if !readable {
                    warn!("Cached file {} is not readable, skipping", path.display());
                    warn!("Perhaps change the permissions: chmod +r '{}'", path.display());
                }
                readable
            })
            .collect()
    }

    fn add_directory(&self, path: &Path) -> Result<usize, CacheError> {
        let root = walk::resolve(path)?;
        if !root.is_dir() {
            return Err(CacheError::NotADirectory(root));
        }

        let found = walk_directory(&root);
        let count = found.len();
        let replaced = self.mutate(|index| {
            let stale = index.remove_under(&root);
            for entry in found {
                index.insert(entry);
            }
            stale
        })?;

        info!("Indexed {} files under {}", count, root.display());
        debug!(root = %root.display(), replaced, "Re-indexed subtree");
        Ok(count)
    }

    fn remove_directory(&self, path: &Path) -> Result<usize, CacheError> {
        let root = walk::resolve(path)?;
        let removed = self.mutate(|index| index.remove_under(&root))?;
        info!("Removed {} files under {}", removed, root.display());
        Ok(removed)
    }
}

impl<C: ContentIndex + ?Sized> ContentIndex for std::sync::Arc<C> {
    fn files_of_size(&self, size: u64) -> Vec<PathBuf> {
        (**self).files_of_size(size)
    }

    fn add_directory(&self, path: &Path) -> Result<usize, CacheError> {
        (**self).add_directory(path)
    }

    fn remove_directory(&self, path: &Path) -> Result<usize, CacheError> {
        (**self).remove_directory(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        (dir, root)
    }

    fn write(path: &Path, len: usize) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![0x5A; len]).unwrap();
    }

    #[test]
    fn files_are_grouped_by_size() {
        let (_dir, root) = scratch();
        write(&root.join("b.bin"), 5);
        write(&root.join("sub/a.bin"), 5);
        write(&root.join("c.bin"), 9);

        let cache = ContentDirectoryCache::in_memory();
        assert_eq!(cache.add_directory(&root).unwrap(), 3);
        assert_eq!(
            cache.files_of_size(5),
            vec![root.join("b.bin"), root.join("sub/a.bin")]
        );
        assert_eq!(cache.files_of_size(9), vec![root.join("c.bin")]);
        assert!(cache.files_of_size(1).is_empty());
    }

    #[test]
    fn removal_respects_component_boundaries() {
        let (_dir, root) = scratch();
        write(&root.join("foo/x.bin"), 4);
        write(&root.join("foo/deeper/y.bin"), 4);
        write(&root.join("foo2/z.bin"), 4);

        let cache = ContentDirectoryCache::in_memory();
        cache.add_directory(&root.join("foo")).unwrap();
        cache.add_directory(&root.join("foo2")).unwrap();
        assert_eq!(cache.files_of_size(4).len(), 3);

        assert_eq!(cache.remove_directory(&root.join("foo")).unwrap(), 2);
        assert_eq!(cache.files_of_size(4), vec![root.join("foo2/z.bin")]);
    }

    #[test]
    fn readding_replaces_stale_entries() {
        let (_dir, root) = scratch();
        write(&root.join("grow.bin"), 3);
        write(&root.join("gone.bin"), 3);

        let cache = ContentDirectoryCache::in_memory();
        cache.add_directory(&root).unwrap();
        write(&root.join("grow.bin"), 8);
        fs::remove_file(root.join("gone.bin")).unwrap();
        cache.add_directory(&root).unwrap();

        assert_eq!(cache.len(), 1);
        assert!(cache.files_of_size(3).is_empty());
        assert_eq!(cache.files_of_size(8), vec![root.join("grow.bin")]);
    }

    #[test]
    fn vanished_files_are_filtered_but_kept() {
        let (_dir, root) = scratch();
        write(&root.join("here.bin"), 6);
        write(&root.join("later.bin"), 6);

        let cache = ContentDirectoryCache::in_memory();
        cache.add_directory(&root).unwrap();
        fs::remove_file(root.join("later.bin")).unwrap();

        assert_eq!(cache.files_of_size(6), vec![root.join("here.bin")]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn adding_a_file_is_rejected() {
        let (_dir, root) = scratch();
        write(&root.join("plain.bin"), 1);
        let cache = ContentDirectoryCache::in_memory();
        assert!(matches!(
            cache.add_directory(&root.join("plain.bin")),
            Err(CacheError::NotADirectory(_))
        ));
    }

    #[test]
    fn mutations_are_written_through() {
        let (_dir, root) = scratch();
        write(&root.join("one.bin"), 2);

        let store = Arc::new(MemoryStore::new());
        let cache = ContentDirectoryCache::open(&[], store.clone()).unwrap();
        assert_eq!(store.snapshot(), Some(Vec::new()));

        cache.add_directory(&root).unwrap();
        assert_eq!(store.snapshot().unwrap(), cache.entries());

        cache.remove_directory(&root).unwrap();
        assert_eq!(store.snapshot(), Some(Vec::new()));
    }

    #[test]
    fn fresh_store_walks_unique_roots_once() {
        let (_dir, root) = scratch();
        write(&root.join("media/tv/ep.mkv"), 11);
        write(&root.join("media/film.mkv"), 12);

        let store = Arc::new(MemoryStore::new());
        let cache = ContentDirectoryCache::open(
            &[root.join("media"), root.join("media/tv")],
            store.clone(),
        )
        .unwrap();
        assert_eq!(cache.len(), 2);

        // A stored snapshot wins over the directory list
        let reopened = ContentDirectoryCache::open(&[root.join("elsewhere")], store).unwrap();
        assert_eq!(reopened.entries(), cache.entries());
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_names_are_indexed_and_persisted() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let (_dir, root) = scratch();
        let content = root.join("content");
        let odd_dir = content.join(OsStr::from_bytes(b"d\xff"));
        let odd_file = content.join(OsStr::from_bytes(b"caf\xe9.bin"));
        write(&content.join("ok.bin"), 9);
        write(&odd_dir.join("x.bin"), 9);
        write(&odd_file, 33);

        let store_path = root.join("cache.json");
        let cache = ContentDirectoryCache::open(&[], JsonFileStore::new(&store_path)).unwrap();
        assert_eq!(cache.add_directory(&content).unwrap(), 3);
        assert_eq!(cache.files_of_size(33), vec![odd_file.clone()]);
        assert_eq!(cache.files_of_size(9).len(), 2);
        assert!(cache.files_of_size(9).contains(&odd_dir.join("x.bin")));

        let reopened = ContentDirectoryCache::open(&[], JsonFileStore::new(&store_path)).unwrap();
        assert_eq!(reopened.entries(), cache.entries());
        assert_eq!(reopened.files_of_size(33), vec![odd_file]);
    }
}
