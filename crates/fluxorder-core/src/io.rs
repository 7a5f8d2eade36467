use crate::error::Result;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

fn parent_dir(path: &Path) -> Result<&Path> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent)?;
            Ok(parent)
        }
        _ => Ok(Path::new(".")),
    }
}

/// Atomically write `data` to `path` using a tempfile in the same directory.
/// A reader never observes a half-written manifest or config file.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(parent_dir(path)?)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Write every `(path, data)` pair or none of them.
///
/// All contents are staged in tempfiles before the first rename. If a
/// rename fails, files already replaced get their previous content back
/// (or are removed when they did not exist).
pub fn atomic_write_all(writes: &[(PathBuf, Vec<u8>)]) -> Result<()> {
    let mut staged = Vec::with_capacity(writes.len());
    for (path, data) in writes {
        let previous = match std::fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let mut tmp = NamedTempFile::new_in(parent_dir(path)?)?;
        tmp.write_all(data)?;
        staged.push((path, tmp, previous));
    }

    let mut committed: Vec<(&PathBuf, Option<Vec<u8>>)> = Vec::with_capacity(staged.len());
    for (path, tmp, previous) in staged {
        if let Err(e) = tmp.persist(path) {
            for (done, prior) in committed.into_iter().rev() {
                let restored = match prior {
                    Some(bytes) => atomic_write(done, &bytes),
                    None => std::fs::remove_file(done).map_err(Into::into),
                };
                if let Err(err) = restored {
                    tracing::warn!(file = %done.display(), error = %err, "rollback failed");
                }
            }
            return Err(e.error.into());
        }
        committed.push((path, previous));
    }
    Ok(())
}

/// Create a directory and all parents, idempotent.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// Write a file only if it does not already exist. Returns true if written.
pub fn write_if_missing(path: &Path, data: &[u8]) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    atomic_write(path, data)?;
    Ok(true)
}

/// Remove a file if present, then prune now-empty parent directories up to
/// (but not including) `stop_at`.
pub fn remove_file_and_empty_parents(path: &Path, stop_at: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == stop_at || !d.starts_with(stop_at) {
            break;
        }
        let empty = std::fs::read_dir(d)
            .map(|mut it| it.next().is_none())
            .unwrap_or(false);
        if !empty {
            break;
        }
        std::fs::remove_dir(d)?;
        dir = d.parent();
    }
    Ok(())
}
