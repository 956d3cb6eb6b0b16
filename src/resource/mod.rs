use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_yml::{Mapping, Value};

use crate::error::{Error, Result};

pub mod set;

/// Annotation recording the source-relative file path of a resource.
pub const PATH_ANNOTATION: &str = "internal.config.kubernetes.io/path";
/// Annotation recording the document index when a file holds several documents.
pub const INDEX_ANNOTATION: &str = "internal.config.kubernetes.io/index";
/// User annotation carrying field-level merge directives as `path=directive`
/// pairs, e.g. `spec.template=replace,spec.args=keep-local`.
pub const MERGE_ANNOTATION: &str = "merge.config.dev/directives";
/// User annotation overriding associative list keys as `path=key` pairs.
pub const LIST_KEY_ANNOTATION: &str = "merge.config.dev/list-keys";

/// Associative-key candidates, in priority order. The first field found on a
/// mapping element of a sequence keys that sequence during merge.
pub const ASSOCIATIVE_KEYS: &[&str] = &[
    "mountPath",
    "devicePath",
    "ip",
    "type",
    "topologyKey",
    "name",
    "containerPort",
    "port",
];

/// The identity tuple a resource is keyed by during merge.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{} {}", self.api_version, self.kind, self.name)
        } else {
            write!(
                f,
                "{}/{} {}/{}",
                self.api_version, self.kind, self.namespace, self.name
            )
        }
    }
}

/// Encoding of the file a resource came from; it is written back the same way.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocFormat {
    Yaml,
    Json,
}

/// One step of a field path: a mapping field or a `[key=value]` list selector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathStep {
    Field(String),
    Select { key: String, value: String },
}

/// Parses `spec.containers[name=app].image` into path steps.
pub fn parse_path(path: &str) -> Vec<PathStep> {
    let mut steps = Vec::new();
    let mut field = String::new();
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !field.is_empty() {
                    steps.push(PathStep::Field(std::mem::take(&mut field)));
                }
            }
            '[' => {
                if !field.is_empty() {
                    steps.push(PathStep::Field(std::mem::take(&mut field)));
                }
                let mut selector = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    selector.push(c);
                }
                if let Some((key, value)) = selector.split_once('=') {
                    steps.push(PathStep::Select {
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() {
        steps.push(PathStep::Field(field));
    }
    steps
}

/// Field-level merge directives, read from [`MERGE_ANNOTATION`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeDirective {
    /// Recursive merge (the default for mappings).
    Merge,
    /// Overwrite the destination with the source, do not descend.
    Replace,
    /// A null-valued source removes the destination.
    Delete,
    /// The local value wins even against an upstream change.
    KeepLocal,
}

impl FromStr for MergeDirective {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "merge" => Ok(Self::Merge),
            "replace" => Ok(Self::Replace),
            "delete" => Ok(Self::Delete),
            "keep-local" => Ok(Self::KeepLocal),
            other => Err(Error::Internal(format!("unknown merge directive `{other}`"))),
        }
    }
}

/// A single KRM document with its source placement.
#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    body: Value,
    format: DocFormat,
}

impl Resource {
    /// Parses every KRM document in `contents`. Returns `None` when the file
    /// is not KRM (wrong extension, parse failure, or documents without an
    /// apiVersion/kind/name triple) so the caller can route it to the
    /// non-KRM merger instead.
    pub fn parse_file(rel_path: &str, contents: &str) -> Option<Vec<Resource>> {
        let format = match rel_path.rsplit_once('.').map(|(_, ext)| ext) {
            Some("yaml") | Some("yml") => DocFormat::Yaml,
            Some("json") => DocFormat::Json,
            _ => return None,
        };
        let mut docs = Vec::new();
        for document in serde_yml::Deserializer::from_str(contents) {
            match Value::deserialize(document) {
                Ok(Value::Null) => continue,
                Ok(value) => docs.push(value),
                Err(_) => return None,
            }
        }
        if docs.is_empty() {
            // An empty YAML file is a companion file, not a resource.
            return None;
        }
        let multi = docs.len() > 1;
        let mut resources = Vec::new();
        for (index, body) in docs.into_iter().enumerate() {
            let mut resource = Resource { body, format };
            resource.identity()?;
            resource.set_annotation(PATH_ANNOTATION, rel_path);
            if multi {
                resource.set_annotation(INDEX_ANNOTATION, &index.to_string());
            }
            resources.push(resource);
        }
        Some(resources)
    }

    pub fn from_value(body: Value, format: DocFormat) -> Self {
        Self { body, format }
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn format(&self) -> DocFormat {
        self.format
    }

    /// The RID, with the namespace defaulted to the empty string.
    pub fn identity(&self) -> Option<ResourceId> {
        let api_version = self.get_str(&[PathStep::Field("apiVersion".into())])?;
        let kind = self.get_str(&[PathStep::Field("kind".into())])?;
        let name = self.get_str(&parse_path("metadata.name"))?;
        let namespace = self
            .get_str(&parse_path("metadata.namespace"))
            .unwrap_or_default();
        Some(ResourceId {
            api_version,
            kind,
            namespace,
            name,
        })
    }

    pub fn get(&self, path: &[PathStep]) -> Option<&Value> {
        get_path(&self.body, path)
    }

    fn get_str(&self, path: &[PathStep]) -> Option<String> {
        self.get(path).and_then(scalar_string)
    }

    pub fn set(&mut self, path: &[PathStep], value: Value) {
        set_path(&mut self.body, path, value);
    }

    pub fn remove(&mut self, path: &[PathStep]) -> bool {
        remove_path(&mut self.body, path)
    }

    pub fn annotation(&self, key: &str) -> Option<String> {
        self.get_str(&[
            PathStep::Field("metadata".into()),
            PathStep::Field("annotations".into()),
            PathStep::Field(key.into()),
        ])
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.set(
            &[
                PathStep::Field("metadata".into()),
                PathStep::Field("annotations".into()),
                PathStep::Field(key.into()),
            ],
            Value::String(value.to_string()),
        );
    }

    /// Source-relative file path this resource is written back to.
    pub fn path(&self) -> Option<String> {
        self.annotation(PATH_ANNOTATION)
    }

    pub fn set_path_annotation(&mut self, rel_path: &str) {
        self.set_annotation(PATH_ANNOTATION, rel_path);
    }

    pub fn index(&self) -> usize {
        self.annotation(INDEX_ANNOTATION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Field-path → directive map from the merge annotation. Unknown
    /// directives are skipped rather than failing the whole resource.
    pub fn merge_directives(&self) -> IndexMap<String, MergeDirective> {
        let mut directives = IndexMap::new();
        if let Some(raw) = self.annotation(MERGE_ANNOTATION) {
            for pair in raw.split(',') {
                if let Some((path, directive)) = pair.split_once('=')
                    && let Ok(directive) = directive.trim().parse()
                {
                    directives.insert(path.trim().to_string(), directive);
                }
            }
        }
        directives
    }

    /// Field-path → key-field map from the list-key override annotation.
    pub fn list_key_overrides(&self) -> IndexMap<String, String> {
        let mut overrides = IndexMap::new();
        if let Some(raw) = self.annotation(LIST_KEY_ANNOTATION) {
            for pair in raw.split(',') {
                if let Some((path, key)) = pair.split_once('=') {
                    overrides.insert(path.trim().to_string(), key.trim().to_string());
                }
            }
        }
        overrides
    }

    /// The document minus the tool-internal annotations: what actually gets
    /// written to disk and what equality during merge is judged on.
    pub fn content(&self) -> Value {
        let mut body = self.body.clone();
        if let Value::Mapping(root) = &mut body
            && let Some(Value::Mapping(metadata)) = root.get_mut(Value::from("metadata"))
        {
            let annotations_key = Value::from("annotations");
            let mut drop_annotations = false;
            if let Some(Value::Mapping(annotations)) = metadata.get_mut(annotations_key.clone()) {
                annotations.retain(|k, _| {
                    !matches!(k, Value::String(s) if s.starts_with("internal.config.kubernetes.io/"))
                });
                drop_annotations = annotations.is_empty();
            }
            if drop_annotations {
                metadata.remove(annotations_key);
            }
        }
        body
    }

    /// Byte rendering of [`Resource::content`] in the source encoding.
    pub fn serialize(&self) -> Result<String> {
        let content = self.content();
        match self.format {
            DocFormat::Yaml => serde_yml::to_string(&content)
                .map_err(|e| Error::Internal(format!("yaml serialization failed: {e}"))),
            DocFormat::Json => {
                let mut rendered = serde_json::to_string_pretty(&content)
                    .map_err(|e| Error::Internal(format!("json serialization failed: {e}")))?;
                rendered.push('\n');
                Ok(rendered)
            }
        }
    }
}

pub fn get_path<'a>(value: &'a Value, path: &[PathStep]) -> Option<&'a Value> {
    let mut current = value;
    for step in path {
        current = match step {
            PathStep::Field(name) => match current {
                Value::Mapping(map) => map.get(Value::from(name.as_str()))?,
                _ => return None,
            },
            PathStep::Select { key, value } => match current {
                Value::Sequence(seq) => seq.iter().find(|elem| {
                    element_key(elem, key).as_deref() == Some(value.as_str())
                })?,
                _ => return None,
            },
        };
    }
    Some(current)
}

/// Sets the value at `path`, creating intermediate mappings for field steps.
/// Selector steps never create elements; a selector that matches nothing
/// makes the set a no-op.
pub fn set_path(value: &mut Value, path: &[PathStep], new: Value) {
    let Some((last, parents)) = path.split_last() else {
        *value = new;
        return;
    };
    let mut current = value;
    for step in parents {
        current = match step {
            PathStep::Field(name) => {
                if !matches!(current, Value::Mapping(_)) {
                    *current = Value::Mapping(Mapping::new());
                }
                let Value::Mapping(map) = current else {
                    unreachable!()
                };
                let key = Value::from(name.as_str());
                if !map.contains_key(&key) {
                    map.insert(key.clone(), Value::Mapping(Mapping::new()));
                }
                map.get_mut(&key).expect("key inserted above")
            }
            PathStep::Select { key, value } => {
                let Value::Sequence(seq) = current else {
                    return;
                };
                match seq
                    .iter_mut()
                    .find(|elem| element_key(elem, key).as_deref() == Some(value.as_str()))
                {
                    Some(elem) => elem,
                    None => return,
                }
            }
        };
    }
    match last {
        PathStep::Field(name) => {
            if !matches!(current, Value::Mapping(_)) {
                *current = Value::Mapping(Mapping::new());
            }
            let Value::Mapping(map) = current else {
                unreachable!()
            };
            map.insert(Value::from(name.as_str()), new);
        }
        PathStep::Select { key, value } => {
            if let Value::Sequence(seq) = current
                && let Some(elem) = seq
                    .iter_mut()
                    .find(|elem| element_key(elem, key).as_deref() == Some(value.as_str()))
            {
                *elem = new;
            }
        }
    }
}

pub fn remove_path(value: &mut Value, path: &[PathStep]) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };
    let mut current = value;
    for step in parents {
        current = match step {
            PathStep::Field(name) => match current {
                Value::Mapping(map) => match map.get_mut(Value::from(name.as_str())) {
                    Some(v) => v,
                    None => return false,
                },
                _ => return false,
            },
            PathStep::Select { key, value } => match current {
                Value::Sequence(seq) => {
                    match seq
                        .iter_mut()
                        .find(|elem| element_key(elem, key).as_deref() == Some(value.as_str()))
                    {
                        Some(elem) => elem,
                        None => return false,
                    }
                }
                _ => return false,
            },
        };
    }
    match last {
        PathStep::Field(name) => match current {
            Value::Mapping(map) => map.remove(Value::from(name.as_str())).is_some(),
            _ => false,
        },
        PathStep::Select { key, value } => match current {
            Value::Sequence(seq) => {
                let before = seq.len();
                seq.retain(|elem| element_key(elem, key).as_deref() != Some(value.as_str()));
                seq.len() != before
            }
            _ => false,
        },
    }
}

/// The associative-key value of a sequence element under `key`. Null and
/// missing are equivalent (unkeyed); the empty string is a distinct key.
pub fn element_key(element: &Value, key: &str) -> Option<String> {
    match element {
        Value::Mapping(map) => match map.get(Value::from(key)) {
            Some(Value::Null) | None => None,
            Some(v) => scalar_string(v),
        },
        _ => None,
    }
}

/// Picks the associative key for a set of sequences being merged: the first
/// candidate from [`ASSOCIATIVE_KEYS`] carried by any mapping element.
pub fn associative_key(sequences: &[&[Value]]) -> Option<&'static str> {
    ASSOCIATIVE_KEYS.iter().copied().find(|candidate| {
        sequences
            .iter()
            .flat_map(|seq| seq.iter())
            .any(|elem| element_key(elem, candidate).is_some())
    })
}

/// Scalar rendering used for key comparison and identity fields.
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Coarse kind of a value, used in structure-conflict errors.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Mapping(_) => "mapping",
        Value::Sequence(_) => "sequence",
        Value::Tagged(_) => "tagged",
        _ => "scalar",
    }
}
