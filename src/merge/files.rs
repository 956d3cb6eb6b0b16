use std::collections::BTreeSet;
use std::path::Path;

use crate::error::Result;
use crate::utils;

/// Three-way presence/content rules for the files the resource merger
/// ignores. Local edits are conservative winners: a file changed on both
/// sides keeps the local bytes.
pub fn merge_companion_files(
    origin_dir: &Path,
    updated_dir: &Path,
    dest_dir: &Path,
    paths: &BTreeSet<String>,
) -> Result<()> {
    for rel in paths {
        let origin = read_opt(&origin_dir.join(rel))?;
        let updated = read_opt(&updated_dir.join(rel))?;
        let local = read_opt(&dest_dir.join(rel))?;

        match (&origin, &updated, &local) {
            (_, None, None) => {}
            // Added only upstream, or present upstream after a local delete.
            (origin, Some(updated), None) => {
                if origin.is_none() {
                    write_new(dest_dir, rel, updated)?;
                }
            }
            // Deleted upstream: only an untouched local copy goes with it.
            (Some(origin), None, Some(local)) => {
                if origin == local {
                    std::fs::remove_file(dest_dir.join(rel))?;
                }
            }
            // Added or still present locally only: keep.
            (None, None, Some(_)) => {}
            // Added on both sides: conservative, the local bytes stay.
            (None, Some(_), Some(_)) => {}
            (Some(origin), Some(updated), Some(local)) => {
                if local == origin && updated != origin {
                    std::fs::write(dest_dir.join(rel), updated)?;
                }
                // Local changed (or nothing changed): the local bytes stay.
            }
        }
    }
    Ok(())
}

fn read_opt(path: &Path) -> Result<Option<Vec<u8>>> {
    if path.is_file() {
        Ok(Some(std::fs::read(path)?))
    } else {
        Ok(None)
    }
}

fn write_new(dest_dir: &Path, rel: &str, contents: &[u8]) -> Result<()> {
    let target = dest_dir.join(rel);
    if let Some(parent) = target.parent() {
        utils::create_dir_with_mode(parent)?;
    }
    std::fs::write(&target, contents)?;
    utils::set_mode(&target, utils::DEFAULT_FILE_MODE)?;
    Ok(())
}
