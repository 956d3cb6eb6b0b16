use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tempfile::TempDir;
use tracing::debug;

use crate::error::{Error, Result};
use crate::manifest::{Upstream, UpstreamLock, UpstreamType};
use crate::utils::{self, CancelToken};

pub mod git;
pub mod oci;

/// Resolves `upstream` into `dest`: after this call `dest` holds exactly the
/// content under the reference's directory, and the returned lock pins it.
pub async fn fetch_upstream(
    upstream: &Upstream,
    dest: &Path,
    cancel: &CancelToken,
) -> Result<UpstreamLock> {
    cancel.check()?;
    match upstream.type_ {
        UpstreamType::Git => {
            let git_ref = upstream
                .git
                .as_ref()
                .ok_or_else(|| Error::Internal("git upstream without git section".to_string()))?;
            let lock = git::fetch(git_ref, dest, cancel)?;
            Ok(UpstreamLock {
                type_: UpstreamType::Git,
                git: Some(lock),
                oci: None,
            })
        }
        UpstreamType::Oci => {
            let oci_ref = upstream
                .oci
                .as_ref()
                .ok_or_else(|| Error::Internal("oci upstream without oci section".to_string()))?;
            let lock = oci::fetch(oci_ref, dest, cancel).await?;
            Ok(UpstreamLock {
                type_: UpstreamType::Oci,
                git: None,
                oci: Some(lock),
            })
        }
    }
}

/// Resolves a lock into `dest`. Locks are immutable, so results are served
/// from the process-wide cache when the same pin was fetched before.
pub async fn fetch_lock(lock: &UpstreamLock, dest: &Path, cancel: &CancelToken) -> Result<()> {
    cancel.check()?;
    let key = cache_key(lock);
    if let Some(cached) = cache().lookup(&key) {
        debug!(%key, "serving origin snapshot from fetch cache");
        utils::copy_dir_contents(&cached, dest)?;
        return Ok(());
    }
    match (&lock.git, &lock.oci) {
        (Some(git_lock), _) => git::fetch_lock(git_lock, dest, cancel)?,
        (_, Some(oci_lock)) => oci::fetch_lock(oci_lock, dest, cancel).await?,
        _ => return Err(Error::Internal("upstream lock without coordinates".to_string())),
    }
    cache().store(&key, dest)?;
    Ok(())
}

fn cache_key(lock: &UpstreamLock) -> String {
    match (&lock.git, &lock.oci) {
        (Some(git), _) => format!("git:{}:{}:{}", git.repo, git.directory, git.commit),
        (_, Some(oci)) => format!("oci:{}:{}:{}", oci.image, oci.directory, oci.digest),
        _ => String::new(),
    }
}

/// Process-wide snapshot cache, keyed by lock. Only locks are cached: they
/// are immutable by contract, so a hit is equivalent to a fresh fetch.
struct FetchCache {
    root: TempDir,
    entries: Mutex<HashMap<String, PathBuf>>,
}

impl FetchCache {
    fn lookup(&self, key: &str) -> Option<PathBuf> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn store(&self, key: &str, snapshot: &Path) -> Result<()> {
        let Ok(mut entries) = self.entries.lock() else {
            return Ok(());
        };
        if entries.contains_key(key) {
            return Ok(());
        }
        let slot = self.root.path().join(entries.len().to_string());
        utils::copy_dir_contents(snapshot, &slot)?;
        entries.insert(key.to_string(), slot);
        Ok(())
    }
}

fn cache() -> &'static FetchCache {
    static CACHE: OnceLock<FetchCache> = OnceLock::new();
    CACHE.get_or_init(|| FetchCache {
        root: tempfile::Builder::new()
            .prefix("krmpkg-fetch-cache-")
            .tempdir()
            .expect("failed to create fetch cache dir"),
        entries: Mutex::new(HashMap::new()),
    })
}
