use std::collections::BTreeSet;
use std::path::Path;

use indexmap::IndexMap;
use tracing::warn;

use crate::error::Result;
use crate::manifest::MANIFEST_FILENAME;
use crate::pkg;
use crate::utils;

use super::{Resource, ResourceId};

/// The KRM documents of one package, keyed by RID, plus the paths of the
/// package's companion files that are not KRM.
#[derive(Clone, Debug, Default)]
pub struct ResourceSet {
    resources: IndexMap<ResourceId, Resource>,
    non_krm: BTreeSet<String>,
}

impl ResourceSet {
    /// Reads every file the package at `pkg_dir` directly owns. Files that
    /// do not parse as KRM are recorded as companion files for the non-KRM
    /// merger. A missing directory loads as the empty set.
    pub fn load(pkg_dir: &Path) -> Result<Self> {
        let mut set = Self::default();
        if !pkg_dir.is_dir() {
            return Ok(set);
        }
        for rel in pkg::package_files(pkg_dir)? {
            if rel == MANIFEST_FILENAME {
                continue;
            }
            let raw = std::fs::read(pkg_dir.join(&rel))?;
            let parsed = String::from_utf8(raw)
                .ok()
                .and_then(|contents| Resource::parse_file(&rel, &contents));
            match parsed {
                Some(resources) => {
                    for resource in resources {
                        let Some(id) = resource.identity() else {
                            continue;
                        };
                        if set.resources.insert(id.clone(), resource).is_some() {
                            warn!("duplicate resource {id} in package, keeping the last one");
                        }
                    }
                }
                None => {
                    set.non_krm.insert(rel);
                }
            }
        }
        Ok(set)
    }

    pub fn resources(&self) -> &IndexMap<ResourceId, Resource> {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut IndexMap<ResourceId, Resource> {
        &mut self.resources
    }

    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.resources.get(id)
    }

    pub fn insert(&mut self, resource: Resource) {
        if let Some(id) = resource.identity() {
            self.resources.insert(id, resource);
        }
    }

    /// Re-keys the map after in-place mutations that may have changed
    /// resource identities (e.g. a namespace rewrite).
    pub fn reindex(&mut self) {
        let resources: Vec<Resource> = self.resources.drain(..).map(|(_, r)| r).collect();
        for resource in resources {
            self.insert(resource);
        }
    }

    /// Paths of the companion (non-KRM) files seen during load.
    pub fn non_krm_paths(&self) -> &BTreeSet<String> {
        &self.non_krm
    }

    /// The file paths the KRM resources of this set occupy.
    pub fn krm_paths(&self) -> BTreeSet<String> {
        self.resources
            .values()
            .filter_map(|r| r.path())
            .collect()
    }

    /// Writes the set back into `pkg_dir`, grouping documents by their path
    /// annotation and restoring multi-document files in index order. Files
    /// created here get the 0600 default mode; existing files keep theirs.
    pub fn write(&self, pkg_dir: &Path) -> Result<()> {
        let mut by_path: IndexMap<String, Vec<&Resource>> = IndexMap::new();
        for resource in self.resources.values() {
            let path = resource.path().unwrap_or_else(|| "resources.yaml".to_string());
            by_path.entry(path).or_default().push(resource);
        }
        for (rel, mut docs) in by_path {
            docs.sort_by_key(|r| r.index());
            let mut rendered = String::new();
            for (i, doc) in docs.iter().enumerate() {
                if i > 0 {
                    rendered.push_str("---\n");
                }
                rendered.push_str(&doc.serialize()?);
            }
            let target = pkg_dir.join(&rel);
            if let Some(parent) = target.parent() {
                utils::create_dir_with_mode(parent)?;
            }
            let existed = target.exists();
            std::fs::write(&target, rendered)?;
            if !existed {
                utils::set_mode(&target, utils::DEFAULT_FILE_MODE)?;
            }
        }
        Ok(())
    }
}
