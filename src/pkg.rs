use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::manifest::{MANIFEST_FILENAME, Manifest};
use crate::utils;

/// A directory containing a manifest file and a set of KRM resources.
#[derive(Clone, Debug)]
pub struct Package {
    pub path: PathBuf,
    pub manifest: Manifest,
}

impl Package {
    pub fn load(path: &Path) -> Result<Self> {
        let manifest = Manifest::load(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            manifest,
        })
    }

    pub fn name(&self) -> &str {
        &self.manifest.metadata.name
    }
}

pub fn is_package(dir: &Path) -> bool {
    Manifest::exists_in(dir)
}

/// All package directories under `root` (including `root` itself when it is
/// a package), in root-first order. `.git` and hidden subtrees are skipped.
pub fn find_packages(root: &Path) -> Result<Vec<PathBuf>> {
    let mut packages = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if !entry.file_type().is_dir() {
                return false;
            }
            if entry.depth() == 0 {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            name != ".git" && !name.starts_with('.')
        });
    for entry in walker {
        let entry = entry.map_err(|e| Error::Internal(format!("walk failed: {e}")))?;
        if is_package(entry.path()) {
            packages.push(entry.path().to_path_buf());
        }
    }
    sort_root_first(&mut packages);
    Ok(packages)
}

/// Root-first: parents before their subpackages.
pub fn sort_root_first(packages: &mut [PathBuf]) {
    packages.sort_by(|a, b| {
        a.components()
            .count()
            .cmp(&b.components().count())
            .then_with(|| a.cmp(b))
    });
}

/// Leaves-first: subpackages before their parents, for deletion and cleanup.
pub fn sort_leaves_first(packages: &mut [PathBuf]) {
    sort_root_first(packages);
    packages.reverse();
}

/// The immediate subpackages of `pkg`: the nearest descendant directories
/// that carry a manifest. Recursion stops at each boundary, so a package
/// nested inside a subpackage belongs to that subpackage, not to `pkg`.
pub fn subpackages(pkg: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    collect_subpackages(pkg, &mut found)?;
    Ok(found)
}

fn collect_subpackages(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    for entry in utils::sorted_entries(dir)? {
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == ".git" || name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if is_package(&path) {
            found.push(path);
        } else {
            collect_subpackages(&path, found)?;
        }
    }
    Ok(())
}

/// The files a package directly owns, as forward-slash relative paths:
/// every non-hidden file under `pkg` excluding `.git` subtrees and the
/// subtrees of nested packages. Directory symlinks are not traversed;
/// file symlinks are listed (their content is followed on read).
pub fn package_files(pkg: &Path) -> Result<Vec<String>> {
    let root = pkg.to_path_buf();
    let walker = WalkBuilder::new(pkg)
        .standard_filters(false)
        .hidden(true)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(move |entry| {
            let Some(file_type) = entry.file_type() else {
                return false;
            };
            if !file_type.is_dir() {
                return true;
            }
            if entry.path() == root {
                return true;
            }
            if entry.file_name() == ".git" {
                return false;
            }
            // A nested manifest marks a subpackage boundary; that subtree
            // belongs to the subpackage.
            !is_package(entry.path())
        })
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| Error::Internal(format!("walk failed: {e}")))?;
        let Some(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            continue;
        }
        if file_type.is_symlink() && entry.path().metadata().map(|m| m.is_dir()).unwrap_or(false) {
            continue;
        }
        files.push(utils::rel_string(pkg, entry.path())?);
    }
    files.sort();
    Ok(files)
}

/// One differing file between two package snapshots.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    Added,
    Removed,
    Modified,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct FileDiff {
    pub path: String,
    pub kind: DiffKind,
}

/// Compares the owned files of two package snapshots byte-wise. Manifests
/// are compared with their `upstream`/`upstreamLock` sections cleared, since
/// those are rewritten by every update and are not user content.
pub fn diff(a: &Path, b: &Path) -> Result<Vec<FileDiff>> {
    let a_files = if a.is_dir() {
        package_files(a)?
    } else {
        Vec::new()
    };
    let b_files = if b.is_dir() {
        package_files(b)?
    } else {
        Vec::new()
    };

    let mut diffs = Vec::new();
    for path in &a_files {
        if !b_files.contains(path) {
            diffs.push(FileDiff {
                path: path.clone(),
                kind: DiffKind::Removed,
            });
        }
    }
    for path in &b_files {
        let b_contents = std::fs::read(b.join(path))?;
        if !a_files.contains(path) {
            diffs.push(FileDiff {
                path: path.clone(),
                kind: DiffKind::Added,
            });
            continue;
        }
        let a_contents = std::fs::read(a.join(path))?;
        let equal = if path == MANIFEST_FILENAME {
            manifests_equal_modulo_upstream(&a_contents, &b_contents)
        } else {
            a_contents == b_contents
        };
        if !equal {
            diffs.push(FileDiff {
                path: path.clone(),
                kind: DiffKind::Modified,
            });
        }
    }
    diffs.sort_by(|x, y| x.path.cmp(&y.path));
    Ok(diffs)
}

fn manifests_equal_modulo_upstream(a: &[u8], b: &[u8]) -> bool {
    let parse = |bytes: &[u8]| -> Option<Manifest> {
        let mut manifest: Manifest = serde_yml::from_slice(bytes).ok()?;
        manifest.upstream = None;
        manifest.upstream_lock = None;
        Some(manifest)
    };
    match (parse(a), parse(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}
