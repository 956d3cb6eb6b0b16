use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};


/// Cooperative cancellation flag handed to every public entry point.
///
/// The engine has no suspension points of its own; the token is checked at
/// the natural boundaries (before fetches, between per-package merges) and
/// signalling it makes the current call return [`Error::Cancelled`] once the
/// in-flight step observes the flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` if the token has been signalled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Default mode bits for files the engine creates.
pub const DEFAULT_FILE_MODE: u32 = 0o600;
/// Default mode bits for directories the engine creates.
pub const DEFAULT_DIR_MODE: u32 = 0o700;

/// Makes `path` absolute without requiring it to exist.
pub fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path))
}

/// Canonicalizes an existing path. MacOs temp folders are symlinks between
/// /var/private and /private, so plain paths don't compare equal without this.
pub fn canonicalize(path: &Path) -> Result<PathBuf> {
    Ok(dunce::canonicalize(path)?)
}

/// Recursively copies the contents of `src` into `dest`, creating `dest` if
/// needed. Regular files keep their executable bit; everything else gets the
/// 0600/0700 defaults. File symlinks are followed for content; directory
/// symlinks are not traversed.
pub fn copy_dir_contents(src: &Path, dest: &Path) -> Result<()> {
    create_dir_with_mode(dest)?;
    for entry in sorted_entries(src)? {
        let path = entry.path();
        let target = dest.join(entry.file_name());
        // entry.file_type() reports the link itself; metadata() resolves it.
        if entry.file_type()?.is_symlink() {
            if std::fs::metadata(&path)?.is_file() {
                copy_file_with_mode(&path, &target)?;
            }
            continue;
        }
        if path.is_dir() {
            copy_dir_contents(&path, &target)?;
        } else {
            copy_file_with_mode(&path, &target)?;
        }
    }
    Ok(())
}

/// Replaces the contents of `dest` with the contents of `staged`, leaving
/// `dest` untouched if materializing the staged tree fails. The staged tree
/// is copied next to `dest` first so the final step is a pair of renames.
pub fn swap_dir_contents(staged: &Path, dest: &Path) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| Error::Internal(format!("destination `{}` has no parent", dest.display())))?;
    let incoming = tempfile::Builder::new()
        .prefix(".krmpkg-incoming-")
        .tempdir_in(parent)?;
    let incoming_tree = incoming.path().join("new");
    copy_dir_contents(staged, &incoming_tree)?;

    let outgoing = tempfile::Builder::new()
        .prefix(".krmpkg-outgoing-")
        .tempdir_in(parent)?;
    let graveyard = outgoing.path().join("old");
    std::fs::rename(dest, &graveyard)?;
    if let Err(err) = std::fs::rename(&incoming_tree, dest) {
        // Roll the original back before surfacing the error.
        let _ = std::fs::rename(&graveyard, dest);
        return Err(err.into());
    }
    Ok(())
}

pub fn create_dir_with_mode(dir: &Path) -> Result<()> {
    if dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;
    set_mode(dir, DEFAULT_DIR_MODE)?;
    Ok(())
}

fn copy_file_with_mode(src: &Path, dest: &Path) -> Result<()> {
    let contents = std::fs::read(src)?;
    std::fs::write(dest, contents)?;
    let mode = if is_executable(src)? {
        0o700
    } else {
        DEFAULT_FILE_MODE
    };
    set_mode(dest, mode)?;
    Ok(())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(path)?.permissions().mode();
    Ok(mode & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> Result<bool> {
    Ok(false)
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Directory entries in name order, so walks and copies are deterministic.
pub fn sorted_entries(dir: &Path) -> Result<Vec<std::fs::DirEntry>> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

/// True when `dir` exists and holds at least one entry.
pub fn dir_is_non_empty(dir: &Path) -> Result<bool> {
    if !dir.exists() {
        return Ok(false);
    }
    Ok(std::fs::read_dir(dir)?.next().is_some())
}

/// The platform-independent relative path (forward slashes) of `path` under
/// `root`, as used in path annotations.
pub fn rel_string(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        Error::Internal(format!(
            "`{}` is not under `{}`",
            path.display(),
            root.display()
        ))
    })?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}
