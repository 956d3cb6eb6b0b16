use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::merge::files::merge_companion_files;
use crate::merge::manifest::merge_manifests;
use crate::merge::resource::{apply_setter_stickiness, merge_sets};
use crate::pkg;
use crate::resource::set::ResourceSet;
use crate::utils::{self, CancelToken};

/// How a package absorbs upstream changes.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStrategy {
    /// Only move forward when the local package has no changes of its own.
    FastForward,
    /// Replace the local package wholesale, discarding local edits.
    ForceDeleteReplace,
    /// Structured three-way merge of resources, manifest, and companions.
    #[default]
    ResourceMerge,
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateStrategy::FastForward => "fast-forward",
            UpdateStrategy::ForceDeleteReplace => "force-delete-replace",
            UpdateStrategy::ResourceMerge => "resource-merge",
        };
        write!(f, "{name}")
    }
}

impl FromStr for UpdateStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fast-forward" => Ok(UpdateStrategy::FastForward),
            "force-delete-replace" => Ok(UpdateStrategy::ForceDeleteReplace),
            "resource-merge" => Ok(UpdateStrategy::ResourceMerge),
            other => Err(Error::StrategyUnknown(other.to_string())),
        }
    }
}

/// Precedence: caller override, then the manifest's `updateStrategy`, then
/// the default.
pub fn resolve_strategy(
    override_strategy: Option<UpdateStrategy>,
    manifest: &Manifest,
) -> UpdateStrategy {
    override_strategy
        .or_else(|| manifest.upstream().and_then(|u| u.update_strategy))
        .unwrap_or_default()
}

/// One merge unit handed to a strategy: the staged local directory and the
/// matching updated/origin snapshot directories.
pub struct StrategyContext<'a> {
    pub local: &'a Path,
    pub updated: &'a Path,
    pub origin: &'a Path,
    pub is_root: bool,
    pub cancel: &'a CancelToken,
}

pub trait PackageUpdater: Send + Sync {
    fn update(&self, ctx: &StrategyContext<'_>) -> Result<()>;
}

/// Read-only process-wide registry of the built-in strategies.
pub struct StrategyRegistry {
    strategies: HashMap<UpdateStrategy, Box<dyn PackageUpdater>>,
}

impl StrategyRegistry {
    fn builtin() -> Self {
        let mut strategies: HashMap<UpdateStrategy, Box<dyn PackageUpdater>> = HashMap::new();
        strategies.insert(UpdateStrategy::FastForward, Box::new(FastForward));
        strategies.insert(UpdateStrategy::ForceDeleteReplace, Box::new(ForceDeleteReplace));
        strategies.insert(UpdateStrategy::ResourceMerge, Box::new(ResourceMerge));
        Self { strategies }
    }

    pub fn get(&self, strategy: UpdateStrategy) -> &dyn PackageUpdater {
        self.strategies
            .get(&strategy)
            .expect("all built-in strategies are registered")
            .as_ref()
    }
}

pub fn registry() -> &'static StrategyRegistry {
    static REGISTRY: OnceLock<StrategyRegistry> = OnceLock::new();
    REGISTRY.get_or_init(StrategyRegistry::builtin)
}

struct FastForward;

impl PackageUpdater for FastForward {
    fn update(&self, ctx: &StrategyContext<'_>) -> Result<()> {
        ctx.cancel.check()?;
        let diffs = pkg::diff(ctx.origin, ctx.local)?;
        if !diffs.is_empty() {
            debug!(
                package = %ctx.local.display(),
                files = ?diffs.iter().map(|d| d.path.clone()).collect::<Vec<_>>(),
                "fast-forward rejected"
            );
            return Err(Error::LocalModified(ctx.local.to_path_buf()));
        }
        replace_owned_files(ctx)
    }
}

struct ForceDeleteReplace;

impl PackageUpdater for ForceDeleteReplace {
    fn update(&self, ctx: &StrategyContext<'_>) -> Result<()> {
        ctx.cancel.check()?;
        replace_owned_files(ctx)
    }
}

/// Replaces the files the package directly owns with the updated snapshot's,
/// keeping the sections of the local manifest that belong to this clone
/// (upstream, upstreamLock, inventory). Subpackage subtrees are separate
/// merge units and are left alone.
fn replace_owned_files(ctx: &StrategyContext<'_>) -> Result<()> {
    let local_manifest = if Manifest::exists_in(ctx.local) {
        Some(Manifest::load(ctx.local)?)
    } else {
        None
    };

    if ctx.local.is_dir() {
        for rel in pkg::package_files(ctx.local)? {
            std::fs::remove_file(ctx.local.join(rel))?;
        }
    }
    utils::create_dir_with_mode(ctx.local)?;
    for rel in pkg::package_files(ctx.updated)? {
        let target = ctx.local.join(&rel);
        if let Some(parent) = target.parent() {
            utils::create_dir_with_mode(parent)?;
        }
        std::fs::copy(ctx.updated.join(&rel), &target)?;
    }

    if let Some(previous) = local_manifest
        && Manifest::exists_in(ctx.local)
    {
        let mut manifest = Manifest::load(ctx.local)?;
        manifest.upstream = previous.upstream;
        manifest.upstream_lock = previous.upstream_lock;
        manifest.inventory = previous.inventory;
        manifest.save(ctx.local)?;
    }
    Ok(())
}

struct ResourceMerge;

impl PackageUpdater for ResourceMerge {
    fn update(&self, ctx: &StrategyContext<'_>) -> Result<()> {
        ctx.cancel.check()?;
        debug!(package = %ctx.local.display(), is_root = ctx.is_root, "resource merge");

        let local_manifest = if Manifest::exists_in(ctx.local) {
            Some(Manifest::load(ctx.local)?)
        } else {
            None
        };
        let mut updated_manifest = if Manifest::exists_in(ctx.updated) {
            Some(Manifest::load(ctx.updated)?)
        } else {
            None
        };
        let origin_manifest = if Manifest::exists_in(ctx.origin) {
            Some(Manifest::load(ctx.origin)?)
        } else {
            None
        };

        let origin_set = ResourceSet::load(ctx.origin)?;
        let mut updated_set = ResourceSet::load(ctx.updated)?;
        let local_set = ResourceSet::load(ctx.local)?;

        if let (Some(updated), Some(local)) = (&mut updated_manifest, &local_manifest) {
            apply_setter_stickiness(&mut updated_set, updated, local);
        }

        let merged = merge_sets(&origin_set, &updated_set, &local_set)?;
        merged.write(ctx.local)?;
        // Deletions come after the in-place merges so origin stays readable
        // while diffs are computed.
        let merged_paths = merged.krm_paths();
        for stale in local_set.krm_paths().difference(&merged_paths) {
            let path = ctx.local.join(stale);
            if path.is_file() {
                std::fs::remove_file(path)?;
            }
        }

        let mut companions: BTreeSet<String> = BTreeSet::new();
        for set in [&origin_set, &updated_set, &local_set] {
            companions.extend(set.non_krm_paths().iter().cloned());
        }
        merge_companion_files(ctx.origin, ctx.updated, ctx.local, &companions)?;

        match (updated_manifest, local_manifest) {
            (Some(updated), Some(local)) => {
                let mut merged =
                    merge_manifests(origin_manifest.as_ref(), &updated, &local)?;
                merged.save(ctx.local)?;
            }
            (Some(mut updated), None) => {
                updated.save(ctx.local)?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test::{write_deployment, write_file, write_kptfile};

    fn triple() -> (assert_fs::TempDir, StrategyDirs) {
        let dir = assert_fs::TempDir::new().unwrap();
        let dirs = StrategyDirs {
            local: dir.path().join("local"),
            updated: dir.path().join("updated"),
            origin: dir.path().join("origin"),
        };
        for d in [&dirs.local, &dirs.updated, &dirs.origin] {
            write_kptfile(d, "pkg");
        }
        (dir, dirs)
    }

    struct StrategyDirs {
        local: std::path::PathBuf,
        updated: std::path::PathBuf,
        origin: std::path::PathBuf,
    }

    impl StrategyDirs {
        fn ctx<'a>(&'a self, cancel: &'a CancelToken) -> StrategyContext<'a> {
            StrategyContext {
                local: &self.local,
                updated: &self.updated,
                origin: &self.origin,
                is_root: true,
                cancel,
            }
        }
    }

    #[test]
    fn test_strategy_names_round_trip() {
        for strategy in [
            UpdateStrategy::FastForward,
            UpdateStrategy::ForceDeleteReplace,
            UpdateStrategy::ResourceMerge,
        ] {
            assert_eq!(strategy.to_string().parse::<UpdateStrategy>().unwrap(), strategy);
        }
        assert!(matches!(
            "yolo-merge".parse::<UpdateStrategy>(),
            Err(Error::StrategyUnknown(_))
        ));
    }

    #[test]
    fn test_resolve_strategy_precedence() {
        let mut manifest = Manifest::new("pkg");
        let mut upstream =
            crate::manifest::Upstream::new_git("https://example.com/r.git", "/", "main");
        upstream.update_strategy = Some(UpdateStrategy::FastForward);
        manifest.set_upstream(upstream);

        assert_eq!(
            resolve_strategy(Some(UpdateStrategy::ForceDeleteReplace), &manifest),
            UpdateStrategy::ForceDeleteReplace
        );
        assert_eq!(
            resolve_strategy(None, &manifest),
            UpdateStrategy::FastForward
        );
        assert_eq!(
            resolve_strategy(None, &Manifest::new("pkg")),
            UpdateStrategy::ResourceMerge
        );
    }

    #[test]
    fn test_fast_forward_rejects_local_changes() {
        let (_dir, dirs) = triple();
        write_deployment(&dirs.origin, "deploy.yaml", "foo", 3);
        write_deployment(&dirs.updated, "deploy.yaml", "foo", 5);
        write_deployment(&dirs.local, "deploy.yaml", "foo", 4);

        let cancel = CancelToken::new();
        let err = registry()
            .get(UpdateStrategy::FastForward)
            .update(&dirs.ctx(&cancel))
            .unwrap_err();
        assert!(matches!(err, Error::LocalModified(_)));
        // The local tree is untouched after the rejection.
        let contents = std::fs::read_to_string(dirs.local.join("deploy.yaml")).unwrap();
        assert!(contents.contains("replicas: 4"));
    }

    #[test]
    fn test_fast_forward_moves_clean_package_forward() {
        let (_dir, dirs) = triple();
        write_deployment(&dirs.origin, "deploy.yaml", "foo", 3);
        write_deployment(&dirs.updated, "deploy.yaml", "foo", 5);
        write_deployment(&dirs.local, "deploy.yaml", "foo", 3);

        let cancel = CancelToken::new();
        registry()
            .get(UpdateStrategy::FastForward)
            .update(&dirs.ctx(&cancel))
            .unwrap();
        let contents = std::fs::read_to_string(dirs.local.join("deploy.yaml")).unwrap();
        assert!(contents.contains("replicas: 5"));
    }

    #[test]
    fn test_force_delete_replace_discards_local_edits() {
        let (_dir, dirs) = triple();
        write_deployment(&dirs.origin, "deploy.yaml", "foo", 3);
        write_deployment(&dirs.updated, "deploy.yaml", "foo", 5);
        write_deployment(&dirs.local, "deploy.yaml", "foo", 4);
        write_file(&dirs.local, "local-only.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: mine\n");

        let cancel = CancelToken::new();
        registry()
            .get(UpdateStrategy::ForceDeleteReplace)
            .update(&dirs.ctx(&cancel))
            .unwrap();
        let contents = std::fs::read_to_string(dirs.local.join("deploy.yaml")).unwrap();
        assert!(contents.contains("replicas: 5"));
        assert!(!dirs.local.join("local-only.yaml").exists());
    }

    #[test]
    fn test_replace_keeps_local_upstream_sections() {
        let (_dir, dirs) = triple();
        write_deployment(&dirs.updated, "deploy.yaml", "foo", 5);
        let mut manifest = Manifest::load(&dirs.local).unwrap();
        manifest.set_upstream(crate::manifest::Upstream::new_git(
            "https://example.com/r.git",
            "/pkg",
            "main",
        ));
        manifest.save(&dirs.local).unwrap();

        let cancel = CancelToken::new();
        registry()
            .get(UpdateStrategy::ForceDeleteReplace)
            .update(&dirs.ctx(&cancel))
            .unwrap();
        let manifest = Manifest::load(&dirs.local).unwrap();
        assert_eq!(
            manifest.upstream().unwrap().git.as_ref().unwrap().repo,
            "https://example.com/r.git"
        );
    }

    #[test]
    fn test_resource_merge_composes_and_deletes_stale_files() {
        let (_dir, dirs) = triple();
        write_deployment(&dirs.origin, "deploy.yaml", "foo", 3);
        write_deployment(&dirs.origin, "dropped.yaml", "gone", 1);
        write_deployment(&dirs.updated, "deploy.yaml", "foo", 5);
        write_deployment(&dirs.local, "deploy.yaml", "foo", 3);
        write_deployment(&dirs.local, "dropped.yaml", "gone", 1);

        let cancel = CancelToken::new();
        registry()
            .get(UpdateStrategy::ResourceMerge)
            .update(&dirs.ctx(&cancel))
            .unwrap();
        let contents = std::fs::read_to_string(dirs.local.join("deploy.yaml")).unwrap();
        assert!(contents.contains("replicas: 5"));
        // `gone` was removed upstream and untouched locally.
        assert!(!dirs.local.join("dropped.yaml").exists());
    }

    #[test]
    fn test_fast_forward_equals_resource_merge_when_local_is_clean() {
        let cancel = CancelToken::new();
        let run = |strategy: UpdateStrategy| {
            let (dir, dirs) = triple();
            write_deployment(&dirs.origin, "deploy.yaml", "foo", 3);
            write_deployment(&dirs.updated, "deploy.yaml", "foo", 5);
            write_deployment(&dirs.local, "deploy.yaml", "foo", 3);
            registry().get(strategy).update(&dirs.ctx(&cancel)).unwrap();
            let rendered = std::fs::read_to_string(dirs.local.join("deploy.yaml")).unwrap();
            drop(dir);
            serde_yml::from_str::<serde_yml::Value>(&rendered).unwrap()
        };
        assert_eq!(
            run(UpdateStrategy::FastForward),
            run(UpdateStrategy::ResourceMerge)
        );
    }
}
