//! Directory walking for the content cache

use super::CacheEntry;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Absolute form of `path`, resolving symlinks when it exists
pub(crate) fn resolve(path: &Path) -> io::Result<PathBuf> {
    match path.canonicalize() {
        Ok(p) => Ok(p),
        Err(_) => std::path::absolute(path),
    }
}

/// Every readable regular file below `root`, following symlinks.
///
/// Entries that cannot be visited are logged and skipped.
pub fn walk_directory(root: &Path) -> Vec<CacheEntry> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let at = e.path().unwrap_or(root);
                warn!("Cannot walk {}: {}", at.display(), e);
                warn!("Perhaps change the permissions: chmod -R +rx '{}'", at.display());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if let Err(e) = File::open(path) {
            warn!("Cannot read {}: {}", path.display(), e);
            warn!("Perhaps change the permissions: chmod +r '{}'", path.display());
            continue;
        }
        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!("Cannot stat {}: {}", path.display(), e);
                continue;
            }
        };
        let Some(directory) = path.parent() else {
            continue;
        };

        entries.push(CacheEntry {
            directory: directory.to_path_buf(),
            filename: entry.file_name().to_os_string(),
            size,
        });
    }

    if entries.is_empty() {
        warn!("No readable files found in {}", root.display());
    } else {
        debug!(root = %root.display(), files = entries.len(), "Walked directory");
    }
    entries
}

/// Drop duplicates and any directory nested inside another listed one
pub fn unique_roots(directories: &[PathBuf]) -> Vec<PathBuf> {
    let mut resolved: Vec<PathBuf> = directories
        .iter()
        .filter_map(|dir| match resolve(dir) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Skipping content directory {}: {}", dir.display(), e);
                None
            }
        })
        .collect();
    resolved.sort();
    resolved.dedup();

    let mut roots: Vec<PathBuf> = Vec::new();
    for dir in resolved {
        if !roots.iter().any(|root| dir.starts_with(root)) {
            roots.push(dir);
        }
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn walks_nested_files() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("top.bin"), [0u8; 3]).unwrap();
        fs::write(root.join("a/b/deep.bin"), [0u8; 7]).unwrap();

        let mut entries = walk_directory(&root);
        entries.sort_by(|x, y| x.path().cmp(&y.path()));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].directory, root.join("a/b"));
        assert_eq!(entries[0].filename, "deep.bin");
        assert_eq!(entries[0].size, 7);
        assert_eq!(entries[1].path(), root.join("top.bin"));
    }

    #[test]
    fn nested_roots_collapse_into_ancestor() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        for sub in ["media", "media/tv", "media2"] {
            fs::create_dir_all(root.join(sub)).unwrap();
        }

        let roots = unique_roots(&[
            root.join("media/tv"),
            root.join("media2"),
            root.join("media"),
            root.join("media"),
        ]);
        assert_eq!(roots, vec![root.join("media"), root.join("media2")]);
    }
}
