use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, MergeConflict, Result};
use crate::fetch;
use crate::manifest::{Manifest, Upstream, UpstreamType};
use crate::pkg;
use crate::strategy::{self, StrategyContext, UpdateStrategy};
use crate::utils::{self, CancelToken};

#[derive(Debug, Parser, Default)]
#[command(about = "Pull upstream changes into a local package, keeping local edits.")]
pub struct Options {
    /// Path to the local package
    #[arg(default_value = ".")]
    pub package: PathBuf,
    /// Update to this upstream ref instead of the recorded one
    #[arg(long = "ref")]
    pub new_ref: Option<String>,
    /// Update strategy override
    #[arg(long)]
    pub strategy: Option<UpdateStrategy>,
}

#[derive(Debug, Serialize)]
pub struct UpdateResult {
    pub package: String,
    pub packages_updated: Vec<String>,
}

impl fmt::Display for UpdateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "updated {} ({} package(s): {})",
            self.package,
            self.packages_updated.len(),
            self.packages_updated.join(", ")
        )
    }
}

pub async fn update(options: &Options, cancel: &CancelToken) -> anyhow::Result<UpdateResult> {
    let root = utils::absolutize(&options.package)?;
    let mut manifest = Manifest::load(&root)?;
    // Temp trees on macOS live behind /var -> /private/var symlinks; all
    // later path arithmetic needs one canonical spelling.
    let root = utils::canonicalize(&root)?;

    if let Some(new_ref) = &options.new_ref {
        let upstream = manifest
            .upstream
            .as_mut()
            .ok_or_else(|| Error::NoUpstream(root.clone()))?;
        set_ref(upstream, new_ref);
        manifest.save(&root)?;
    } else if manifest.upstream().is_none() {
        return Err(Error::NoUpstream(root.clone()).into());
    }

    let mut packages_updated = Vec::new();
    update_tree(
        &root,
        options.new_ref.as_deref(),
        options.strategy,
        cancel,
        &mut packages_updated,
    )
    .await
    .with_context(|| format!("could not update `{}`", root.display()))?;

    Ok(UpdateResult {
        package: root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        packages_updated,
    })
}

/// Points `upstream` at a new ref: the git ref, or the image tag for OCI.
pub(crate) fn set_ref(upstream: &mut Upstream, new_ref: &str) {
    match upstream.type_ {
        UpstreamType::Git => {
            if let Some(git) = &mut upstream.git {
                git.r#ref = new_ref.to_string();
            }
        }
        UpstreamType::Oci => {
            if let Some(oci) = &mut upstream.oci {
                oci.image = retag(&oci.image, new_ref);
            }
        }
    }
}

fn retag(image: &str, tag: &str) -> String {
    if let Some(at) = image.find('@') {
        return format!("{}:{tag}", &image[..at]);
    }
    match image.rfind(':') {
        // A colon before the last slash is a registry port, not a tag.
        Some(colon) if colon > image.rfind('/').unwrap_or(0) => {
            format!("{}:{tag}", &image[..colon])
        }
        _ => format!("{image}:{tag}"),
    }
}

/// Updates one independent package: fetches its updated and origin
/// snapshots, merges every package directory found on any of the three
/// trees, swaps the result in, then recurses into independent subpackages.
async fn update_tree(
    pkg_path: &Path,
    new_ref: Option<&str>,
    strategy_override: Option<UpdateStrategy>,
    cancel: &CancelToken,
    packages_updated: &mut Vec<String>,
) -> Result<()> {
    cancel.check()?;
    let manifest = Manifest::load(pkg_path)?;
    let upstream = manifest
        .upstream()
        .cloned()
        .ok_or_else(|| Error::NoUpstream(pkg_path.to_path_buf()))?;
    info!(
        package = %pkg_path.display(),
        source = %upstream.source_name(),
        "updating package"
    );

    let root_strategy = strategy::resolve_strategy(strategy_override, &manifest);
    if root_strategy == UpdateStrategy::FastForward && manifest.upstream_lock().is_none() {
        return Err(Error::StrategyRejected(
            "fast-forward needs a resolved upstream lock to compare against".to_string(),
        ));
    }

    let updated_dir = tempfile::Builder::new()
        .prefix("krmpkg-updated-")
        .tempdir()?;
    let origin_dir = tempfile::Builder::new().prefix("krmpkg-origin-").tempdir()?;
    let lock = fetch::fetch_upstream(&upstream, updated_dir.path(), cancel).await?;
    if let Some(previous_lock) = manifest.upstream_lock() {
        fetch::fetch_lock(previous_lock, origin_dir.path(), cancel).await?;
    }

    // All merging happens against a staged copy; the real package is only
    // touched by the final swap, so failures leave it as it was.
    let staging = tempfile::Builder::new().prefix("krmpkg-staged-").tempdir()?;
    let staged = staging.path().join(
        pkg_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pkg".to_string()),
    );
    utils::copy_dir_contents(pkg_path, &staged)?;

    let independent = independent_subpackages(&staged)?;
    let merge_dirs = merge_units(&staged, updated_dir.path(), origin_dir.path(), &independent)?;

    let mut deletions: Vec<String> = Vec::new();
    let mut copied: Vec<String> = Vec::new();
    for rel in &merge_dirs {
        cancel.check()?;
        if under_any(rel, &copied) {
            continue;
        }
        let local_dir = join_rel(&staged, rel);
        let u_dir = join_rel(updated_dir.path(), rel);
        let o_dir = join_rel(origin_dir.path(), rel);

        if rel.is_empty() {
            // The root is always merged; origin may be empty when the
            // package has never been resolved before.
            run_strategy(
                &manifest,
                rel,
                root_strategy,
                strategy_override,
                &local_dir,
                &u_dir,
                &o_dir,
                cancel,
            )?;
            continue;
        }

        match (local_dir.is_dir(), u_dir.is_dir(), o_dir.is_dir()) {
            (false, false, _) => {}
            (false, true, false) => {
                debug!(subpackage = %rel, "new upstream subpackage");
                utils::copy_dir_contents(&u_dir, &local_dir)?;
                copied.push(rel.clone());
            }
            (true, false, false) => {
                // Local-only subpackage: keep.
            }
            (true, false, true) => {
                if pkg::diff(&o_dir, &local_dir)?.is_empty() {
                    debug!(subpackage = %rel, "removed upstream, no local changes");
                    deletions.push(rel.clone());
                }
            }
            (false, true, true) => {
                // Deleted locally: stays deleted.
            }
            (true, true, false) => {
                return Err(MergeConflict::BothAddedSubpackage(PathBuf::from(rel)).into());
            }
            (true, true, true) => {
                run_strategy(
                    &manifest,
                    rel,
                    root_strategy,
                    strategy_override,
                    &local_dir,
                    &u_dir,
                    &o_dir,
                    cancel,
                )?;
            }
        }
    }

    // Deletions run last, leaves first, so origin content stayed readable
    // for every diff above.
    deletions.sort_by(|a, b| {
        b.split('/')
            .count()
            .cmp(&a.split('/').count())
            .then_with(|| b.cmp(a))
    });
    for rel in &deletions {
        let dir = join_rel(&staged, rel);
        for file in pkg::package_files(&dir)? {
            std::fs::remove_file(dir.join(file))?;
        }
        prune_empty_dirs(&dir)?;
    }

    // The manifest write is last: a failure anywhere above leaves the
    // recorded lock untouched.
    let mut staged_manifest = Manifest::load(&staged)?;
    staged_manifest.set_upstream(upstream.clone());
    staged_manifest.set_upstream_lock(lock);
    staged_manifest.save(&staged)?;

    utils::swap_dir_contents(&staged, pkg_path)?;
    packages_updated.push(
        pkg_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );

    // Independent subpackages are their own update roots. Ref and strategy
    // changes propagate only when their upstream still points within the
    // parent's upstream directory tree.
    for rel in &independent {
        cancel.check()?;
        let sp_path = join_rel(pkg_path, rel);
        if !sp_path.is_dir() {
            continue;
        }
        let mut sp_manifest = Manifest::load(&sp_path)?;
        let Some(sp_upstream) = sp_manifest.upstream.as_mut() else {
            continue;
        };
        if inherits_from(&upstream, sp_upstream) {
            if let Some(new_ref) = new_ref {
                set_ref(sp_upstream, new_ref);
            }
            if let Some(strategy) = strategy_override {
                sp_upstream.update_strategy = Some(strategy);
            }
            if new_ref.is_some() || strategy_override.is_some() {
                sp_manifest.save(&sp_path)?;
            }
        }
        Box::pin(update_tree(
            &sp_path,
            new_ref,
            strategy_override,
            cancel,
            packages_updated,
        ))
        .await?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_strategy(
    parent_manifest: &Manifest,
    rel: &str,
    root_strategy: UpdateStrategy,
    strategy_override: Option<UpdateStrategy>,
    local_dir: &Path,
    updated_dir: &Path,
    origin_dir: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    let strategy = subpackage_strategy(
        parent_manifest,
        rel,
        root_strategy,
        strategy_override,
        local_dir,
    )?;
    debug!(directory = rel, %strategy, "merging package directory");
    strategy::registry().get(strategy).update(&StrategyContext {
        local: local_dir,
        updated: updated_dir,
        origin: origin_dir,
        is_root: rel.is_empty(),
        cancel,
    })
}

/// Strategy precedence for one merge unit: caller override, the directory's
/// own manifest, the parent's legacy `subpackages` entry, then the root's
/// resolved strategy. A disagreement between the directory's manifest and
/// the legacy entry is surfaced as a warning, never silently resolved.
fn subpackage_strategy(
    parent_manifest: &Manifest,
    rel: &str,
    root_strategy: UpdateStrategy,
    strategy_override: Option<UpdateStrategy>,
    local_dir: &Path,
) -> Result<UpdateStrategy> {
    if rel.is_empty() {
        return Ok(root_strategy);
    }
    let own = if Manifest::exists_in(local_dir) {
        Manifest::load(local_dir)?
            .upstream()
            .and_then(|u| u.update_strategy)
    } else {
        None
    };
    let legacy = parent_manifest
        .subpackages()
        .iter()
        .find(|e| e.local_dir == rel)
        .and_then(|e| e.update_strategy);
    if let (Some(own), Some(legacy)) = (own, legacy)
        && own != legacy
    {
        warn!(
            subpackage = rel,
            manifest_strategy = %own,
            parent_entry_strategy = %legacy,
            "conflicting update strategies declared for subpackage; using its own manifest"
        );
    }
    Ok(strategy_override
        .or(own)
        .or(legacy)
        .unwrap_or(root_strategy))
}

/// Relative paths of subpackages that carry their own upstream. Only the
/// topmost of a nested chain is listed; deeper ones belong to its walk.
fn independent_subpackages(root: &Path) -> Result<Vec<String>> {
    let mut independent: Vec<String> = Vec::new();
    for path in pkg::find_packages(root)? {
        let rel = utils::rel_string(root, &path)?;
        if rel.is_empty() || under_any(&rel, &independent) {
            continue;
        }
        if Manifest::load(&path)?.upstream().is_some() {
            independent.push(rel);
        }
    }
    Ok(independent)
}

/// Every directory that is a package on any of the three trees, root-first,
/// with independent subpackage subtrees excluded.
fn merge_units(
    local: &Path,
    updated: &Path,
    origin: &Path,
    independent: &[String],
) -> Result<Vec<String>> {
    let mut rels: BTreeSet<String> = BTreeSet::new();
    rels.insert(String::new());
    for root in [local, updated, origin] {
        if !root.is_dir() {
            continue;
        }
        for path in pkg::find_packages(root)? {
            let rel = utils::rel_string(root, &path)?;
            if !rel.is_empty() {
                rels.insert(rel);
            }
        }
    }
    let mut units: Vec<String> = rels
        .into_iter()
        .filter(|rel| !under_any(rel, independent) && !independent.contains(rel))
        .collect();
    units.sort_by(|a, b| {
        a.split('/')
            .count()
            .cmp(&b.split('/').count())
            .then_with(|| a.cmp(b))
    });
    Ok(units)
}

/// Removes directories that became empty after their owned files were
/// deleted, bottom-up, including `dir` itself.
fn prune_empty_dirs(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in utils::sorted_entries(dir)? {
        if entry.file_type()?.is_dir() {
            prune_empty_dirs(&entry.path())?;
        }
    }
    if std::fs::read_dir(dir)?.next().is_none() {
        std::fs::remove_dir(dir)?;
    }
    Ok(())
}

fn under_any(rel: &str, prefixes: &[String]) -> bool {
    prefixes
        .iter()
        .any(|p| rel == p || rel.starts_with(&format!("{p}/")))
}

fn join_rel(root: &Path, rel: &str) -> PathBuf {
    if rel.is_empty() {
        root.to_path_buf()
    } else {
        root.join(rel)
    }
}

/// True when `child` points within `parent`'s upstream directory tree: same
/// remote, and the relative path between the directories does not escape.
fn inherits_from(parent: &Upstream, child: &Upstream) -> bool {
    match (parent.type_, child.type_) {
        (UpstreamType::Git, UpstreamType::Git) => {
            let (Some(parent_git), Some(child_git)) = (&parent.git, &child.git) else {
                return false;
            };
            parent_git.repo == child_git.repo
                && non_escaping(&parent_git.directory, &child_git.directory)
        }
        (UpstreamType::Oci, UpstreamType::Oci) => {
            let (Some(parent_oci), Some(child_oci)) = (&parent.oci, &child.oci) else {
                return false;
            };
            image_base(&parent_oci.image) == image_base(&child_oci.image)
                && non_escaping(&parent_oci.directory, &child_oci.directory)
        }
        _ => false,
    }
}

fn non_escaping(parent_dir: &str, child_dir: &str) -> bool {
    match pathdiff::diff_paths(Path::new(child_dir), Path::new(parent_dir)) {
        Some(rel) => !rel.starts_with(".."),
        None => false,
    }
}

fn image_base(image: &str) -> &str {
    image.split_once('@').map(|(b, _)| b).unwrap_or_else(|| {
        match image.rsplit_once(':') {
            Some((base, _)) if image.rfind(':') > image.rfind('/') => base,
            _ => image,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::get::fetch_into;
    use crate::manifest::MANIFEST_FILENAME;
    use crate::utils::test::{commit_all, init_repo, write_deployment, write_file, write_kptfile};

    struct Fixture {
        _dir: assert_fs::TempDir,
        remote: PathBuf,
        local: PathBuf,
    }

    /// Publishes a package at `/app` in a fixture remote and fetches it into
    /// a local working copy, so updates have a recorded origin.
    async fn fixture() -> Fixture {
        let dir = assert_fs::TempDir::new().unwrap();
        let remote = dir.path().join("remote");
        init_repo(&remote);
        write_kptfile(&remote.join("app"), "app");
        write_deployment(&remote.join("app"), "deploy.yaml", "web", 3);
        commit_all(&remote, "publish app");

        let local = dir.path().join("app");
        fetch_into(
            &Upstream::new_git(&remote.to_string_lossy(), "/app", "master"),
            &local,
            None,
            false,
            &CancelToken::new(),
        )
        .await
        .unwrap();
        Fixture {
            _dir: dir,
            remote,
            local,
        }
    }

    async fn run_update(fixture: &Fixture, options: Options) -> anyhow::Result<UpdateResult> {
        let options = Options {
            package: fixture.local.clone(),
            ..options
        };
        update(&options, &CancelToken::new()).await
    }

    #[tokio::test]
    async fn test_noop_update_refreshes_the_lock() {
        let fixture = fixture().await;
        let before = std::fs::read_to_string(fixture.local.join("deploy.yaml")).unwrap();
        // A new commit that does not touch the package content.
        write_file(&fixture.remote, "unrelated.txt", "elsewhere\n");
        let new_commit = commit_all(&fixture.remote, "unrelated change");

        run_update(&fixture, Options::default()).await.unwrap();

        let after = std::fs::read_to_string(fixture.local.join("deploy.yaml")).unwrap();
        assert_eq!(
            serde_yml::from_str::<serde_yml::Value>(&before).unwrap(),
            serde_yml::from_str::<serde_yml::Value>(&after).unwrap()
        );
        let manifest = Manifest::load(&fixture.local).unwrap();
        assert_eq!(manifest.upstream_lock().unwrap().pin().unwrap(), new_commit);
    }

    #[tokio::test]
    async fn test_upstream_and_local_edits_compose() {
        let fixture = fixture().await;
        // Upstream bumps replicas; local adds a field of its own.
        write_deployment(&fixture.remote.join("app"), "deploy.yaml", "web", 5);
        commit_all(&fixture.remote, "scale up");
        let local_deploy = fixture.local.join("deploy.yaml");
        let mut edited = std::fs::read_to_string(&local_deploy).unwrap();
        edited.push_str("  paused: true\n");
        std::fs::write(&local_deploy, edited).unwrap();

        run_update(&fixture, Options::default()).await.unwrap();

        let merged = std::fs::read_to_string(&local_deploy).unwrap();
        assert!(merged.contains("replicas: 5"), "upstream change adopted");
        assert!(merged.contains("paused: true"), "local change kept");
    }

    #[tokio::test]
    async fn test_fast_forward_rejection_leaves_package_untouched() {
        let fixture = fixture().await;
        write_deployment(&fixture.remote.join("app"), "deploy.yaml", "web", 5);
        commit_all(&fixture.remote, "scale up");
        write_deployment(&fixture.local, "deploy.yaml", "web", 4);
        let lock_before = Manifest::load(&fixture.local)
            .unwrap()
            .upstream_lock()
            .unwrap()
            .clone();

        let err = run_update(
            &fixture,
            Options {
                strategy: Some(UpdateStrategy::FastForward),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::LocalModified(_))
        ));

        let manifest = Manifest::load(&fixture.local).unwrap();
        assert_eq!(manifest.upstream_lock(), Some(&lock_before));
        let contents = std::fs::read_to_string(fixture.local.join("deploy.yaml")).unwrap();
        assert!(contents.contains("replicas: 4"));
    }

    #[tokio::test]
    async fn test_subpackage_added_in_both_is_an_error() {
        let fixture = fixture().await;
        // Both sides invent a subpackage named `abc`.
        write_kptfile(&fixture.remote.join("app/abc"), "abc");
        write_deployment(&fixture.remote.join("app/abc"), "deploy.yaml", "abc", 1);
        commit_all(&fixture.remote, "add abc upstream");
        write_kptfile(&fixture.local.join("abc"), "abc");
        write_deployment(&fixture.local.join("abc"), "deploy.yaml", "abc", 2);

        let err = run_update(&fixture, Options::default()).await.unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::MergeConflict(MergeConflict::BothAddedSubpackage(path))) => {
                assert_eq!(path, &PathBuf::from("abc"));
            }
            other => panic!("expected BothAddedSubpackage, got {other:?}"),
        }
        // On-disk content unchanged.
        let contents =
            std::fs::read_to_string(fixture.local.join("abc/deploy.yaml")).unwrap();
        assert!(contents.contains("replicas: 2"));
    }

    #[tokio::test]
    async fn test_new_upstream_subpackage_is_copied() {
        let fixture = fixture().await;
        write_kptfile(&fixture.remote.join("app/addon"), "addon");
        write_deployment(&fixture.remote.join("app/addon"), "deploy.yaml", "addon", 1);
        commit_all(&fixture.remote, "add addon");

        run_update(&fixture, Options::default()).await.unwrap();
        assert!(fixture.local.join("addon/deploy.yaml").is_file());
    }

    #[tokio::test]
    async fn test_subpackage_removed_upstream_is_deleted_when_clean() {
        let dir = assert_fs::TempDir::new().unwrap();
        let remote = dir.path().join("remote");
        init_repo(&remote);
        write_kptfile(&remote.join("app"), "app");
        write_deployment(&remote.join("app"), "deploy.yaml", "web", 3);
        write_kptfile(&remote.join("app/extra"), "extra");
        write_deployment(&remote.join("app/extra"), "deploy.yaml", "extra", 1);
        commit_all(&remote, "publish with extra");

        let local = dir.path().join("app");
        fetch_into(
            &Upstream::new_git(&remote.to_string_lossy(), "/app", "master"),
            &local,
            None,
            false,
            &CancelToken::new(),
        )
        .await
        .unwrap();
        assert!(local.join("extra").is_dir());

        std::fs::remove_dir_all(remote.join("app/extra")).unwrap();
        commit_all(&remote, "drop extra");

        let options = Options {
            package: local.clone(),
            ..Default::default()
        };
        update(&options, &CancelToken::new()).await.unwrap();
        assert!(!local.join("extra").is_dir());
    }

    #[tokio::test]
    async fn test_update_with_new_ref_moves_the_package() {
        let fixture = fixture().await;
        // Publish v2 on a branch.
        let repo = git2::Repository::open(&fixture.remote).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("v2", &head, false).unwrap();
        repo.set_head("refs/heads/v2").unwrap();
        drop(head);
        drop(repo);
        write_deployment(&fixture.remote.join("app"), "deploy.yaml", "web", 7);
        commit_all(&fixture.remote, "v2 content");

        run_update(
            &fixture,
            Options {
                new_ref: Some("v2".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let contents = std::fs::read_to_string(fixture.local.join("deploy.yaml")).unwrap();
        assert!(contents.contains("replicas: 7"));
        let manifest = Manifest::load(&fixture.local).unwrap();
        assert_eq!(
            manifest.upstream().unwrap().git.as_ref().unwrap().r#ref,
            "v2"
        );
    }

    #[tokio::test]
    async fn test_fast_forward_without_lock_is_rejected() {
        let dir = assert_fs::TempDir::new().unwrap();
        let remote = dir.path().join("remote");
        init_repo(&remote);
        write_kptfile(&remote.join("app"), "app");
        commit_all(&remote, "publish");

        // A manifest authored by hand: upstream set, but never resolved.
        let local = dir.path().join("app");
        write_kptfile(&local, "app");
        let mut manifest = Manifest::load(&local).unwrap();
        manifest.set_upstream(Upstream::new_git(&remote.to_string_lossy(), "/app", "master"));
        manifest.save(&local).unwrap();

        let options = Options {
            package: local,
            strategy: Some(UpdateStrategy::FastForward),
            ..Default::default()
        };
        let err = update(&options, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::StrategyRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_update_without_upstream_fails() {
        let dir = assert_fs::TempDir::new().unwrap();
        let local = dir.path().join("pkg");
        write_kptfile(&local, "pkg");
        let options = Options {
            package: local,
            ..Default::default()
        };
        let err = update(&options, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::NoUpstream(_))
        ));
    }

    #[tokio::test]
    async fn test_independent_subpackage_updates_with_its_own_upstream() {
        let dir = assert_fs::TempDir::new().unwrap();
        let remote = dir.path().join("remote");
        init_repo(&remote);
        write_kptfile(&remote.join("app"), "app");
        write_deployment(&remote.join("app"), "deploy.yaml", "web", 3);
        write_kptfile(&remote.join("db"), "db");
        write_deployment(&remote.join("db"), "statefulset.yaml", "db", 1);
        commit_all(&remote, "publish");

        let local = dir.path().join("app");
        fetch_into(
            &Upstream::new_git(&remote.to_string_lossy(), "/app", "master"),
            &local,
            None,
            false,
            &CancelToken::new(),
        )
        .await
        .unwrap();
        // An independent subpackage fetched from the same remote.
        fetch_into(
            &Upstream::new_git(&remote.to_string_lossy(), "/db", "master"),
            &local.join("db"),
            None,
            false,
            &CancelToken::new(),
        )
        .await
        .unwrap();

        write_deployment(&remote.join("db"), "statefulset.yaml", "db", 9);
        commit_all(&remote, "scale db");

        let options = Options {
            package: local.clone(),
            ..Default::default()
        };
        let result = update(&options, &CancelToken::new()).await.unwrap();
        assert_eq!(result.packages_updated.len(), 2);
        let contents =
            std::fs::read_to_string(local.join("db/statefulset.yaml")).unwrap();
        assert!(contents.contains("replicas: 9"));
    }

    #[test]
    fn test_retag_handles_ports_and_existing_tags() {
        assert_eq!(retag("registry.example.com/pkg:v1", "v2"), "registry.example.com/pkg:v2");
        assert_eq!(retag("registry.example.com/pkg", "v2"), "registry.example.com/pkg:v2");
        assert_eq!(
            retag("registry.example.com:5000/pkg", "v2"),
            "registry.example.com:5000/pkg:v2"
        );
    }

    #[test]
    fn test_inherits_from_rejects_escaping_paths() {
        let parent = Upstream::new_git("https://example.com/r.git", "/app", "main");
        let inside = Upstream::new_git("https://example.com/r.git", "/app/db", "main");
        let outside = Upstream::new_git("https://example.com/r.git", "/elsewhere", "main");
        let other_repo = Upstream::new_git("https://example.com/other.git", "/app/db", "main");
        assert!(inherits_from(&parent, &inside));
        assert!(!inherits_from(&parent, &outside));
        assert!(!inherits_from(&parent, &other_repo));
    }

    #[test]
    fn test_merge_units_excludes_independent_subtrees() {
        let dir = assert_fs::TempDir::new().unwrap();
        let local = dir.path().join("local");
        write_kptfile(&local, "root");
        write_kptfile(&local.join("dep"), "dep");
        write_kptfile(&local.join("indep"), "indep");
        write_kptfile(&local.join("indep/below"), "below");
        let updated = dir.path().join("updated");
        write_kptfile(&updated, "root");
        write_kptfile(&updated.join("up-only"), "up-only");

        let independent = vec!["indep".to_string()];
        let units = merge_units(&local, &updated, &dir.path().join("missing"), &independent)
            .unwrap();
        assert_eq!(units, vec!["", "dep", "up-only"]);
    }

    #[test]
    fn test_subpackage_strategy_warns_on_conflict_and_prefers_manifest() {
        let dir = assert_fs::TempDir::new().unwrap();
        let sub = dir.path().join("db");
        write_file(
            &sub,
            MANIFEST_FILENAME,
            concat!(
                "apiVersion: kpt.dev/v1\n",
                "kind: Kptfile\n",
                "metadata:\n",
                "  name: db\n",
                "upstream:\n",
                "  type: git\n",
                "  git:\n",
                "    repo: https://example.com/r.git\n",
                "    directory: /db\n",
                "    ref: main\n",
                "  updateStrategy: fast-forward\n",
            ),
        );
        let mut parent = Manifest::new("app");
        parent.subpackages = Some(vec![crate::manifest::SubpackageEntry {
            local_dir: "db".to_string(),
            git: None,
            oci: None,
            update_strategy: Some(UpdateStrategy::ForceDeleteReplace),
        }]);

        let strategy = subpackage_strategy(
            &parent,
            "db",
            UpdateStrategy::ResourceMerge,
            None,
            &sub,
        )
        .unwrap();
        assert_eq!(strategy, UpdateStrategy::FastForward);
    }
}
