//! Store directory management.
//!
//! This module handles the file system layout of a store:
//!
//! ```text
//! <dir>/
//! ├─ folio.index                  # Durable handle index
//! ├─ db.lock                      # Advisory lock for single-writer
//! ├─ data000/data-000-000.p04     # Page files
//! └─ ...                          # Auxiliary files (copied into backups)
//! ```
//!
//! The lock file ensures only one process can open the store at a time.

use crate::error::{CoreError, CoreResult};
use crate::page::parse_page_file_name;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the durable index file.
pub const INDEX_FILE: &str = "folio.index";

/// Name of the process lock file.
pub const LOCK_FILE: &str = "db.lock";

/// Manages the store directory structure and file locking.
///
/// # Thread Safety
///
/// The `StoreDir` holds an exclusive lock on the directory for as long as it
/// lives. Only one `StoreDir` instance can exist per directory at a time.
#[derive(Debug)]
pub struct StoreDir {
    /// Root directory path.
    path: PathBuf,
    /// Lock file handle (held for exclusive access).
    _lock_file: File,
}

impl StoreDir {
    /// Opens or creates a store directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `Locked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_config(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_config(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        // Non-blocking: a held lock fails the open right away
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::Locked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path to the index file.
    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.path.join(INDEX_FILE)
    }

    /// Finds every page file under the `dataNNN` subdirectories.
    ///
    /// Returns `(file_id, page_size)` pairs in no particular order. Files
    /// whose names don't parse are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Format` if a page file sits in the wrong `dataNNN`
    /// directory, or an I/O error if the directory cannot be read.
    pub fn page_files(&self) -> CoreResult<Vec<(u32, u32)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(group) = name.strip_prefix("data").and_then(|g| g.parse::<u32>().ok())
            else {
                continue;
            };
            if !entry.file_type()?.is_dir() {
                continue;
            }

            for file in fs::read_dir(entry.path())? {
                let file = file?;
                let file_name = file.file_name();
                let Some((file_id, page_size)) =
                    file_name.to_str().and_then(parse_page_file_name)
                else {
                    continue;
                };
                if file_id / 1000 != group {
                    return Err(CoreError::format(format!(
                        "page file {} is in the wrong directory {name}",
                        file_name.to_string_lossy()
                    )));
                }
                found.push((file_id, page_size));
            }
        }
        debug!(count = found.len(), "found page files");
        Ok(found)
    }

    /// Lists auxiliary files in the store directory. See [`aux_files`].
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be read.
    pub fn aux_files(&self) -> CoreResult<Vec<String>> {
        aux_files(&self.path)
    }
}

/// Lists auxiliary files: plain files in the directory root that the store
/// doesn't manage itself.
///
/// Skips names starting with `folio`, `backup` or `.`, and the lock file.
/// Returned sorted by name.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be read.
pub fn aux_files(root: &Path) -> CoreResult<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if is_aux_name(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn is_aux_name(name: &str) -> bool {
    !(name.starts_with("folio")
        || name.starts_with("backup")
        || name.starts_with('.')
        || name == LOCK_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_new_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");

        let dir = StoreDir::open(&path, true).unwrap();
        assert!(path.exists());
        assert!(path.join(LOCK_FILE).exists());
        assert_eq!(dir.index_path(), path.join("folio.index"));
    }

    #[test]
    fn fail_if_missing_and_no_create() {
        let temp = tempdir().unwrap();
        let result = StoreDir::open(&temp.path().join("absent"), false);
        assert!(matches!(result, Err(CoreError::InvalidConfig { .. })));
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let _first = StoreDir::open(temp.path(), true).unwrap();
        assert!(matches!(
            StoreDir::open(temp.path(), true),
            Err(CoreError::Locked)
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        {
            let _dir = StoreDir::open(temp.path(), true).unwrap();
        }
        StoreDir::open(temp.path(), true).unwrap();
    }

    #[test]
    fn finds_page_files() {
        let temp = tempdir().unwrap();
        let dir = StoreDir::open(temp.path(), true).unwrap();
        fs::create_dir_all(temp.path().join("data000")).unwrap();
        fs::create_dir_all(temp.path().join("data001")).unwrap();
        fs::write(temp.path().join("data000/data-000-000.p04"), b"").unwrap();
        fs::write(temp.path().join("data001/data-001-002.p10"), b"").unwrap();
        fs::write(temp.path().join("data000/stray.txt"), b"").unwrap();

        let mut files = dir.page_files().unwrap();
        files.sort_unstable();
        assert_eq!(files, vec![(0, 16), (1002, 1024)]);
    }

    #[test]
    fn misplaced_page_file_is_format_error() {
        let temp = tempdir().unwrap();
        let dir = StoreDir::open(temp.path(), true).unwrap();
        fs::create_dir_all(temp.path().join("data000")).unwrap();
        fs::write(temp.path().join("data000/data-001-000.p04"), b"").unwrap();
        assert!(matches!(dir.page_files(), Err(CoreError::Format { .. })));
    }

    #[test]
    fn aux_files_skip_managed_names() {
        let temp = tempdir().unwrap();
        let dir = StoreDir::open(temp.path(), true).unwrap();
        for name in ["folio.index", "backup.zst", ".hidden", "notes.txt", "app.cfg"] {
            fs::write(temp.path().join(name), b"x").unwrap();
        }
        fs::create_dir_all(temp.path().join("subdir")).unwrap();

        assert_eq!(dir.aux_files().unwrap(), vec!["app.cfg", "notes.txt"]);
    }
}
