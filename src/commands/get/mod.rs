use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::error::{Error, MergeConflict, Result};
use crate::fetch;
use crate::manifest::{Manifest, Upstream, UpstreamLock};
use crate::strategy::UpdateStrategy;
use crate::utils::{self, CancelToken};

#[derive(Debug, Parser, Default)]
#[command(about = "Fetch a package from a git or OCI upstream into a local directory.")]
pub struct Options {
    /// Git repository URL of the upstream package
    #[arg(long, conflicts_with = "image")]
    pub repo: Option<String>,
    /// OCI image holding the upstream package
    #[arg(long)]
    pub image: Option<String>,
    /// Directory within the repository or image
    #[arg(long, default_value = "")]
    pub directory: String,
    /// Branch, tag, or commit to fetch
    #[arg(long = "ref")]
    pub reference: Option<String>,
    /// Update strategy to record for future updates
    #[arg(long)]
    pub strategy: Option<UpdateStrategy>,
    /// Remove existing destination contents before fetching
    #[arg(long)]
    pub clean: bool,
    /// Destination directory
    pub destination: PathBuf,
}

impl Options {
    fn upstream(&self) -> anyhow::Result<Upstream> {
        match (&self.repo, &self.image) {
            (Some(repo), None) => Ok(Upstream::new_git(
                repo,
                &self.directory,
                self.reference.as_deref().unwrap_or(""),
            )),
            (None, Some(image)) => Ok(Upstream::new_oci(image, &self.directory)),
            _ => anyhow::bail!("exactly one of --repo or --image is required"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GetResult {
    pub package: String,
    pub destination: PathBuf,
    pub pin: String,
    pub packages_fetched: Vec<String>,
}

impl fmt::Display for GetResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetched {} into {} ({} package(s), pinned at {})",
            self.package,
            self.destination.display(),
            self.packages_fetched.len(),
            self.pin,
        )
    }
}

pub async fn get(options: &Options, cancel: &CancelToken) -> anyhow::Result<GetResult> {
    let upstream = options.upstream()?;
    let destination = utils::absolutize(&options.destination)?;
    let (lock, packages_fetched) =
        fetch_into(&upstream, &destination, options.strategy, options.clean, cancel)
            .await
            .with_context(|| format!("could not fetch into `{}`", destination.display()))?;
    Ok(GetResult {
        package: destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        destination,
        pin: lock.pin().unwrap_or_default().to_string(),
        packages_fetched,
    })
}

/// Populates `destination` from `upstream` and records the provenance in the
/// manifest. Remote subpackages referenced through the legacy `subpackages`
/// list are fetched recursively into their `localDir`s.
pub async fn fetch_into(
    upstream: &Upstream,
    destination: &Path,
    strategy: Option<UpdateStrategy>,
    clean: bool,
    cancel: &CancelToken,
) -> Result<(UpstreamLock, Vec<String>)> {
    if !destination.is_absolute() {
        return Err(Error::Internal(format!(
            "destination `{}` must be absolute",
            destination.display()
        )));
    }
    if clean && destination.is_dir() {
        for entry in utils::sorted_entries(destination)? {
            let path = entry.path();
            if path.is_dir() {
                std::fs::remove_dir_all(path)?;
            } else {
                std::fs::remove_file(path)?;
            }
        }
    }

    let mut root_upstream = upstream.clone();
    root_upstream
        .update_strategy
        .get_or_insert(strategy.unwrap_or_default());

    let mut fetched = Vec::new();
    let mut root_lock = None;
    let mut queue = VecDeque::from([(root_upstream, destination.to_path_buf(), Vec::new())]);
    while let Some((upstream, dest, ancestry)) = queue.pop_front() {
        cancel.check()?;
        // A subpackage chain that leads back to one of its own ancestors
        // would recurse forever; the graph must stay a tree.
        let upstream_key = upstream_key(&upstream);
        if ancestry.contains(&upstream_key) {
            return Err(MergeConflict::IncompatibleStructure {
                subject: dest.display().to_string(),
                field_path: "subpackages".to_string(),
            }
            .into());
        }
        if utils::dir_is_non_empty(&dest)? {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("destination `{}` exists and is not empty", dest.display()),
            )));
        }

        let scratch = tempfile::Builder::new().prefix("krmpkg-get-").tempdir()?;
        let lock = fetch::fetch_upstream(&upstream, scratch.path(), cancel).await?;
        info!(
            source = %upstream.source_name(),
            pin = lock.pin().unwrap_or_default(),
            destination = %dest.display(),
            "fetched upstream content"
        );
        utils::copy_dir_contents(scratch.path(), &dest)?;

        // Adopt the fetched manifest when the upstream is a package;
        // synthesize a minimal one otherwise.
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut manifest = if Manifest::exists_in(&dest) {
            Manifest::load(&dest)?
        } else {
            Manifest::new(&name)
        };
        let mut recorded = upstream.clone();
        recorded.update_strategy.get_or_insert(UpdateStrategy::default());
        manifest.set_upstream(recorded);
        manifest.set_upstream_lock(lock.clone());
        manifest.save(&dest)?;
        fetched.push(name);
        if root_lock.is_none() {
            root_lock = Some(lock);
        }

        for entry in manifest.subpackages() {
            let Some(sub_upstream) = entry.upstream() else {
                continue;
            };
            let target = dest.join(&entry.local_dir);
            if Manifest::exists_in(&target) {
                // Already materialized, e.g. committed alongside the parent.
                continue;
            }
            let mut chain = ancestry.clone();
            chain.push(upstream_key.clone());
            queue.push_back((sub_upstream, target, chain));
        }
    }

    let lock = root_lock
        .ok_or_else(|| Error::Internal("fetch queue finished without a root lock".to_string()))?;
    Ok((lock, fetched))
}

/// Identity of a remote location, for cycle detection across the
/// subpackage graph.
fn upstream_key(upstream: &Upstream) -> String {
    match (&upstream.git, &upstream.oci) {
        (Some(git), _) => format!("git:{}:{}", git.repo, git.directory),
        (_, Some(oci)) => format!("oci:{}:{}", oci.image, oci.directory),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::MANIFEST_FILENAME;
    use crate::utils::test::{commit_all, init_repo, write_deployment, write_file, write_kptfile};

    fn remote_fixture() -> (assert_fs::TempDir, PathBuf, String) {
        let dir = assert_fs::TempDir::new().unwrap();
        let remote = dir.path().join("remote");
        init_repo(&remote);
        write_kptfile(&remote.join("wordpress"), "wordpress");
        write_deployment(&remote.join("wordpress"), "deploy.yaml", "wp", 3);
        write_deployment(&remote.join("plain"), "deploy.yaml", "plain", 1);
        let commit = commit_all(&remote, "publish packages");
        (dir, remote, commit)
    }

    fn git_upstream(remote: &Path, directory: &str) -> Upstream {
        Upstream::new_git(&remote.to_string_lossy(), directory, "master")
    }

    #[tokio::test]
    async fn test_get_adopts_manifest_and_writes_lock() {
        let (dir, remote, commit) = remote_fixture();
        let dest = dir.path().join("my-wordpress");
        let (lock, fetched) = fetch_into(
            &git_upstream(&remote, "/wordpress"),
            &dest,
            None,
            false,
            &CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(lock.pin().unwrap(), commit);
        assert_eq!(fetched, vec!["my-wordpress"]);
        assert!(dest.join("deploy.yaml").is_file());

        let manifest = Manifest::load(&dest).unwrap();
        // The manifest is renamed to the destination basename.
        assert_eq!(manifest.metadata.name, "my-wordpress");
        let upstream = manifest.upstream().unwrap();
        assert_eq!(upstream.git.as_ref().unwrap().directory, "/wordpress");
        assert_eq!(
            upstream.update_strategy,
            Some(UpdateStrategy::ResourceMerge)
        );
        assert_eq!(manifest.upstream_lock().unwrap().pin().unwrap(), commit);
    }

    #[tokio::test]
    async fn test_get_synthesizes_manifest_for_plain_directories() {
        let (dir, remote, _commit) = remote_fixture();
        let dest = dir.path().join("plain-copy");
        fetch_into(
            &git_upstream(&remote, "/plain"),
            &dest,
            None,
            false,
            &CancelToken::new(),
        )
        .await
        .unwrap();
        let manifest = Manifest::load(&dest).unwrap();
        assert_eq!(manifest.metadata.name, "plain-copy");
        assert!(manifest.upstream().is_some());
    }

    #[tokio::test]
    async fn test_get_rejects_non_empty_destination_unless_clean() {
        let (dir, remote, _commit) = remote_fixture();
        let dest = dir.path().join("occupied");
        write_file(&dest, "leftover.txt", "old junk");

        let err = fetch_into(
            &git_upstream(&remote, "/wordpress"),
            &dest,
            None,
            false,
            &CancelToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Io(_)));

        fetch_into(
            &git_upstream(&remote, "/wordpress"),
            &dest,
            None,
            true,
            &CancelToken::new(),
        )
        .await
        .unwrap();
        assert!(!dest.join("leftover.txt").exists());
        assert!(dest.join("deploy.yaml").is_file());
    }

    #[tokio::test]
    async fn test_get_requires_absolute_destination() {
        let (_dir, remote, _commit) = remote_fixture();
        let err = fetch_into(
            &git_upstream(&remote, "/wordpress"),
            Path::new("relative/dest"),
            None,
            false,
            &CancelToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_get_rejects_cyclic_subpackage_references() {
        let dir = assert_fs::TempDir::new().unwrap();
        let remote = dir.path().join("remote");
        init_repo(&remote);
        // The package references itself as a subpackage.
        let looped = remote.join("looped");
        write_file(
            &looped,
            MANIFEST_FILENAME,
            &format!(
                concat!(
                    "apiVersion: kpt.dev/v1\n",
                    "kind: Kptfile\n",
                    "metadata:\n",
                    "  name: looped\n",
                    "subpackages:\n",
                    "- localDir: again\n",
                    "  git:\n",
                    "    repo: {}\n",
                    "    directory: /looped\n",
                    "    ref: master\n",
                ),
                remote.to_string_lossy()
            ),
        );
        commit_all(&remote, "publish cycle");

        let err = fetch_into(
            &git_upstream(&remote, "/looped"),
            &dir.path().join("looped"),
            None,
            false,
            &CancelToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            Error::MergeConflict(crate::error::MergeConflict::IncompatibleStructure { .. })
        ));
    }

    #[tokio::test]
    async fn test_get_recurses_into_legacy_subpackages() {
        let dir = assert_fs::TempDir::new().unwrap();
        let remote = dir.path().join("remote");
        init_repo(&remote);
        write_deployment(&remote.join("db"), "statefulset.yaml", "db", 1);
        let parent = remote.join("parent");
        write_deployment(&parent, "deploy.yaml", "app", 2);
        write_file(
            &parent,
            MANIFEST_FILENAME,
            &format!(
                concat!(
                    "apiVersion: kpt.dev/v1\n",
                    "kind: Kptfile\n",
                    "metadata:\n",
                    "  name: parent\n",
                    "subpackages:\n",
                    "- localDir: db\n",
                    "  git:\n",
                    "    repo: {}\n",
                    "    directory: /db\n",
                    "    ref: master\n",
                ),
                remote.to_string_lossy()
            ),
        );
        commit_all(&remote, "publish");

        let dest = dir.path().join("app");
        let (_lock, fetched) = fetch_into(
            &git_upstream(&remote, "/parent"),
            &dest,
            None,
            false,
            &CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(fetched, vec!["app", "db"]);
        assert!(dest.join("db/statefulset.yaml").is_file());
        let sub_manifest = Manifest::load(&dest.join("db")).unwrap();
        assert_eq!(
            sub_manifest.upstream().unwrap().git.as_ref().unwrap().directory,
            "/db"
        );
    }
}
