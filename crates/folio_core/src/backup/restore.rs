//! Extracting a backup archive into a store directory.

use super::ArchiveReader;
use crate::error::{CoreError, CoreResult};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};
use tracing::info;

/// Extracts `archive` into `dir`, stripping the archive's path prefix.
///
/// `dir` must be missing or empty. Afterwards it can be opened as a store.
/// Returns the number of files written.
///
/// # Errors
///
/// Returns `InvalidState` if `dir` holds files, and `Format` if the archive
/// is damaged or an entry path leaves the target directory.
pub fn restore(archive: &Path, dir: &Path) -> CoreResult<usize> {
    if dir.exists() && fs::read_dir(dir)?.next().is_some() {
        return Err(CoreError::invalid_state(format!(
            "restore target {} is not empty",
            dir.display()
        )));
    }
    fs::create_dir_all(dir)?;

    let mut reader = ArchiveReader::new(BufReader::new(File::open(archive)?))?;
    let prefix = reader.prefix().to_string();

    let mut count = 0;
    while let Some(entry) = reader.next_entry()? {
        let target = dir.join(entry_path(&entry.path, &prefix)?);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &entry.data)?;
        count += 1;
    }

    info!(
        archive = %archive.display(),
        dir = %dir.display(),
        files = count,
        "restored backup"
    );
    Ok(count)
}

fn entry_path(path: &str, prefix: &str) -> CoreResult<PathBuf> {
    let relative = path
        .strip_prefix(prefix)
        .ok_or_else(|| CoreError::format(format!("entry {path} lacks prefix {prefix}")))?;

    let relative = Path::new(relative);
    let normal = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !normal || relative.as_os_str().is_empty() {
        return Err(CoreError::format(format!("unsafe entry path {path}")));
    }
    Ok(relative.to_path_buf())
}
