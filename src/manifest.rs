use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::strategy::UpdateStrategy;

/// File name of the package manifest, fixed for wire compatibility.
pub const MANIFEST_FILENAME: &str = "Kptfile";
pub const MANIFEST_API_VERSION: &str = "kpt.dev/v1";
pub const MANIFEST_KIND: &str = "Kptfile";

/// Key prefix of setter definitions under `openAPI.definitions`.
pub const SETTER_PREFIX: &str = "io.k8s.cli.setters.";

/// Typed view over the package manifest.
///
/// Field order here is the wire order; a manifest written by this model
/// round-trips byte-identically.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<Info>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Upstream>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_lock: Option<UpstreamLock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Pipeline>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory: Option<Inventory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subpackages: Option<Vec<SubpackageEntry>>,
    #[serde(rename = "openAPI", skip_serializing_if = "Option::is_none")]
    pub open_api: Option<OpenApi>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(skip_serializing_if = "IndexMap::is_empty", default)]
    pub annotations: IndexMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Info {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub emails: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamType {
    Git,
    Oci,
}

/// A reference to the source of a package: a git repo+ref+directory or an
/// OCI image+directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upstream {
    #[serde(rename = "type")]
    pub type_: UpstreamType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git: Option<GitRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<UpdateStrategy>,
}

impl Upstream {
    pub fn new_git(repo: &str, directory: &str, reference: &str) -> Self {
        let mut upstream = Self {
            type_: UpstreamType::Git,
            git: Some(GitRef {
                repo: repo.to_string(),
                directory: directory.to_string(),
                r#ref: reference.to_string(),
            }),
            oci: None,
            update_strategy: None,
        };
        upstream.normalize();
        upstream
    }

    pub fn new_oci(image: &str, directory: &str) -> Self {
        let mut upstream = Self {
            type_: UpstreamType::Oci,
            git: None,
            oci: Some(OciRef {
                image: image.to_string(),
                directory: directory.to_string(),
            }),
            update_strategy: None,
        };
        upstream.normalize();
        upstream
    }

    /// Applies the directory normalization of the wire format: git
    /// directories are absolute-within-repo (`""` means `"/"`), OCI
    /// directories are relative (`""` means `"."`).
    pub fn normalize(&mut self) {
        if let Some(git) = &mut self.git {
            if git.directory.is_empty() {
                git.directory = "/".to_string();
            }
            if git.r#ref.is_empty() {
                // Legacy callers may omit the ref entirely.
                git.r#ref = "master".to_string();
            }
        }
        if let Some(oci) = &mut self.oci
            && oci.directory.is_empty()
        {
            oci.directory = ".".to_string();
        }
    }

    /// Human-readable name of the remote, used in errors.
    pub fn source_name(&self) -> String {
        match (&self.git, &self.oci) {
            (Some(git), _) => git.repo.clone(),
            (_, Some(oci)) => oci.image.clone(),
            _ => "<unset>".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GitRef {
    pub repo: String,
    pub directory: String,
    pub r#ref: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OciRef {
    pub image: String,
    pub directory: String,
}

/// The immutable resolved form of an [`Upstream`]: the same coordinates plus
/// a commit or digest. Resolving a lock twice yields byte-identical content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamLock {
    #[serde(rename = "type")]
    pub type_: UpstreamType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git: Option<GitLock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciLock>,
}

impl UpstreamLock {
    /// The pinned identity: a 40-hex commit or a registry digest.
    pub fn pin(&self) -> Option<&str> {
        match (&self.git, &self.oci) {
            (Some(git), _) => Some(&git.commit),
            (_, Some(oci)) => Some(&oci.digest),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GitLock {
    pub repo: String,
    pub directory: String,
    pub r#ref: String,
    pub commit: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OciLock {
    pub image: String,
    pub directory: String,
    pub digest: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub mutators: Vec<Function>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub validators: Vec<Function>,
}

impl Pipeline {
    pub fn is_empty(&self) -> bool {
        self.mutators.is_empty() && self.validators.is_empty()
    }
}

/// One pipeline entry: an `image` (OCI function) xor an `exec` (command).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Function {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_map: Option<IndexMap<String, serde_yml::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
}

/// Inventory identity used by the live-cluster subsystem; opaque here.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(rename = "inventoryID", skip_serializing_if = "Option::is_none")]
    pub inventory_id: Option<String>,
}

impl Inventory {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.namespace.is_none() && self.inventory_id.is_none()
    }
}

/// Legacy layout: a remote subpackage referenced from the parent manifest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubpackageEntry {
    pub local_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git: Option<GitRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<UpdateStrategy>,
}

impl SubpackageEntry {
    /// The entry expressed as an [`Upstream`], if it names a remote.
    pub fn upstream(&self) -> Option<Upstream> {
        let mut upstream = match (&self.git, &self.oci) {
            (Some(git), _) => Upstream {
                type_: UpstreamType::Git,
                git: Some(git.clone()),
                oci: None,
                update_strategy: self.update_strategy,
            },
            (_, Some(oci)) => Upstream {
                type_: UpstreamType::Oci,
                git: None,
                oci: Some(oci.clone()),
                update_strategy: self.update_strategy,
            },
            _ => return None,
        };
        upstream.normalize();
        Some(upstream)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenApi {
    #[serde(skip_serializing_if = "IndexMap::is_empty", default)]
    pub definitions: IndexMap<String, Definition>,
}

/// One `openAPI.definitions` entry. Only the setter extension is
/// interpreted; everything else rides along untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    #[serde(rename = "x-k8s-cli", default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<CliExtension>,
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_yml::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CliExtension {
    pub setter: Setter,
}

/// A named placeholder whose value is substituted into the resource fields
/// listed in `fieldPaths`. The field-path list is the structured-metadata
/// form of the reference markers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setter {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_by: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub field_paths: Vec<String>,
}

impl Manifest {
    /// A minimal manifest for a freshly-authored package.
    pub fn new(name: &str) -> Self {
        Self {
            api_version: MANIFEST_API_VERSION.to_string(),
            kind: MANIFEST_KIND.to_string(),
            metadata: Metadata {
                name: name.to_string(),
                annotations: IndexMap::new(),
            },
            ..Default::default()
        }
    }

    pub fn exists_in(pkg_dir: &Path) -> bool {
        pkg_dir.join(MANIFEST_FILENAME).is_file()
    }

    /// Loads the manifest of the package rooted at `pkg_dir`.
    pub fn load(pkg_dir: &Path) -> Result<Self> {
        if !pkg_dir.is_dir() {
            return Err(Error::PackageNotFound(pkg_dir.to_path_buf()));
        }
        let path = pkg_dir.join(MANIFEST_FILENAME);
        if !path.is_file() {
            return Err(Error::ManifestMissing(pkg_dir.to_path_buf()));
        }
        let contents = std::fs::read_to_string(&path)?;
        let mut manifest: Manifest =
            serde_yml::from_str(&contents).map_err(|e| Error::ManifestMalformed {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if manifest.kind != MANIFEST_KIND {
            return Err(Error::ManifestMalformed {
                path,
                reason: format!("kind is `{}`, expected `{MANIFEST_KIND}`", manifest.kind),
            });
        }
        if let Some(upstream) = &mut manifest.upstream {
            upstream.normalize();
        }
        Ok(manifest)
    }

    /// Writes the manifest into `pkg_dir`, maintaining the invariant that
    /// `metadata.name` equals the directory name.
    pub fn save(&mut self, pkg_dir: &Path) -> Result<()> {
        if let Some(name) = pkg_dir.file_name() {
            self.metadata.name = name.to_string_lossy().into_owned();
        }
        std::fs::write(pkg_dir.join(MANIFEST_FILENAME), self.to_yaml()?)?;
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yml::to_string(self)
            .map_err(|e| Error::Internal(format!("manifest serialization failed: {e}")))
    }

    pub fn upstream(&self) -> Option<&Upstream> {
        self.upstream.as_ref()
    }

    pub fn set_upstream(&mut self, mut upstream: Upstream) {
        upstream.normalize();
        self.upstream = Some(upstream);
    }

    pub fn upstream_lock(&self) -> Option<&UpstreamLock> {
        self.upstream_lock.as_ref()
    }

    pub fn set_upstream_lock(&mut self, lock: UpstreamLock) {
        self.upstream_lock = Some(lock);
    }

    pub fn pipeline(&self) -> Option<&Pipeline> {
        self.pipeline.as_ref()
    }

    pub fn subpackages(&self) -> &[SubpackageEntry] {
        self.subpackages.as_deref().unwrap_or(&[])
    }

    pub fn is_inventory_empty(&self) -> bool {
        self.inventory.as_ref().is_none_or(Inventory::is_empty)
    }

    /// Setter definitions keyed by short name.
    pub fn setters(&self) -> IndexMap<String, Setter> {
        let mut setters = IndexMap::new();
        if let Some(open_api) = &self.open_api {
            for (key, definition) in &open_api.definitions {
                if let Some(name) = key.strip_prefix(SETTER_PREFIX)
                    && let Some(cli) = &definition.cli
                {
                    setters.insert(name.to_string(), cli.setter.clone());
                }
            }
        }
        setters
    }

    pub fn set_setter_value(&mut self, name: &str, value: &str) {
        if let Some(open_api) = &mut self.open_api
            && let Some(definition) = open_api.definitions.get_mut(&format!("{SETTER_PREFIX}{name}"))
            && let Some(cli) = &mut definition.cli
        {
            cli.setter.value = value.to_string();
        }
    }
}
