use indexmap::IndexMap;
use serde_yml::{Mapping, Value};

use crate::error::{MergeConflict, Result};
use crate::manifest::Manifest;
use crate::resource::set::ResourceSet;
use crate::resource::{
    MergeDirective, Resource, ResourceId, associative_key, element_key, parse_path, scalar_string,
    value_kind,
};

/// Per-resource merge context: the directive and key-override annotations of
/// the two sides, plus the identity for error reporting.
struct MergeCtx {
    id: ResourceId,
    updated_directives: IndexMap<String, MergeDirective>,
    local_directives: IndexMap<String, MergeDirective>,
    key_overrides: IndexMap<String, String>,
}

impl MergeCtx {
    fn new(id: ResourceId, updated: &Resource, local: &Resource) -> Self {
        let mut key_overrides = updated.list_key_overrides();
        key_overrides.extend(local.list_key_overrides());
        Self {
            id,
            updated_directives: updated.merge_directives(),
            local_directives: local.merge_directives(),
            key_overrides,
        }
    }

    fn keep_local(&self, path: &str) -> bool {
        self.local_directives.get(path) == Some(&MergeDirective::KeepLocal)
    }

    fn upstream_directive(&self, path: &str) -> Option<MergeDirective> {
        self.updated_directives.get(path).copied()
    }

    fn list_key(&self, path: &str) -> Option<&str> {
        self.key_overrides.get(path).map(String::as_str)
    }
}

/// Merges three views of a package's resources into the new destination set.
///
/// The output order is upstream's appearance order followed by local-only
/// resources, so repeated updates stay stable.
pub fn merge_sets(
    origin: &ResourceSet,
    updated: &ResourceSet,
    local: &ResourceSet,
) -> Result<ResourceSet> {
    let mut merged = ResourceSet::default();

    for (id, u) in updated.resources() {
        let o = origin.get(id);
        let l = local.get(id);
        match l {
            None => {
                if o.is_none() {
                    // New upstream resource.
                    merged.insert(u.clone());
                }
                // Present in O and U but not L: the user removed it; don't
                // resurrect it.
            }
            Some(l) => {
                let resource = merge_resource(o, u, l, id)?;
                merged.insert(resource);
            }
        }
    }

    for (id, l) in local.resources() {
        if updated.get(id).is_some() {
            continue;
        }
        match origin.get(id) {
            None => {
                // New local resource.
                merged.insert(l.clone());
            }
            Some(o) => {
                // Removed upstream: dropped only if the user left it alone.
                if o.content() != l.content() {
                    merged.insert(l.clone());
                }
            }
        }
    }

    Ok(merged)
}

/// Field-wise three-way merge of a single resource. The result keeps local's
/// file placement and encoding; upstream's are used when local has none.
fn merge_resource(
    origin: Option<&Resource>,
    updated: &Resource,
    local: &Resource,
    id: &ResourceId,
) -> Result<Resource> {
    let ctx = MergeCtx::new(id.clone(), updated, local);
    let body = merge_values(
        origin.map(Resource::body),
        Some(updated.body()),
        Some(local.body()),
        "",
        &ctx,
    )?
    .unwrap_or(Value::Null);

    let mut resource = Resource::from_value(body, local.format());
    if let Some(path) = local.path().or_else(|| updated.path()) {
        resource.set_path_annotation(&path);
    }
    Ok(resource)
}

/// The recursive three-way rules of one field position. `None` means the
/// field is absent on that side; a `None` return removes it from the output.
fn merge_values(
    origin: Option<&Value>,
    updated: Option<&Value>,
    local: Option<&Value>,
    path: &str,
    ctx: &MergeCtx,
) -> Result<Option<Value>> {
    match (updated, local) {
        (None, None) => Ok(None),
        // Present upstream only: an addition unless the user deleted it.
        (Some(u), None) => {
            if origin.is_none() {
                Ok(Some(u.clone()))
            } else {
                Ok(None)
            }
        }
        // Present locally only: a local addition, or an upstream deletion
        // that only applies when the user did not touch the field.
        (None, Some(l)) => match origin {
            None => Ok(Some(l.clone())),
            Some(o) if o == l => Ok(None),
            Some(_) => Ok(Some(l.clone())),
        },
        (Some(u), Some(l)) => {
            if ctx.keep_local(path) {
                return Ok(Some(l.clone()));
            }
            match ctx.upstream_directive(path) {
                Some(MergeDirective::Replace) => return Ok(Some(u.clone())),
                Some(MergeDirective::Delete) if u.is_null() => return Ok(None),
                _ => {}
            }
            if u == l {
                return Ok(Some(l.clone()));
            }
            if origin == Some(u) {
                // Upstream unchanged: local edits survive.
                return Ok(Some(l.clone()));
            }
            if origin == Some(l) {
                // Local unchanged: adopt upstream.
                return Ok(Some(u.clone()));
            }
            // Both sides changed; compose field-wise where the shapes agree.
            match (u, l) {
                (Value::Mapping(u_map), Value::Mapping(l_map)) => {
                    let o_map = match origin {
                        Some(Value::Mapping(m)) => Some(m),
                        _ => None,
                    };
                    Ok(Some(Value::Mapping(merge_mappings(
                        o_map, u_map, l_map, path, ctx,
                    )?)))
                }
                (Value::Sequence(u_seq), Value::Sequence(l_seq)) => {
                    let o_seq = match origin {
                        Some(Value::Sequence(s)) => Some(s.as_slice()),
                        _ => None,
                    };
                    merge_sequences(o_seq, u_seq, l_seq, path, ctx).map(Some)
                }
                (u, l) if value_kind(u) == value_kind(l) => {
                    // Scalars changed on both sides: upstream precedence.
                    Ok(Some(u.clone()))
                }
                _ => Err(MergeConflict::IncompatibleStructure {
                    subject: ctx.id.to_string(),
                    field_path: path.to_string(),
                }
                .into()),
            }
        }
    }
}

fn merge_mappings(
    origin: Option<&Mapping>,
    updated: &Mapping,
    local: &Mapping,
    path: &str,
    ctx: &MergeCtx,
) -> Result<Mapping> {
    let mut merged = Mapping::new();
    let get = |map: Option<&Mapping>, key: &Value| map.and_then(|m| m.get(key)).cloned();

    for (key, u_value) in updated {
        let child_path = child_path(path, key);
        let merged_value = merge_values(
            get(origin, key).as_ref(),
            Some(u_value),
            local.get(key),
            &child_path,
            ctx,
        )?;
        if let Some(value) = merged_value {
            merged.insert(key.clone(), value);
        }
    }
    // Local-only keys keep their local order after upstream's.
    for (key, l_value) in local {
        if updated.contains_key(key) {
            continue;
        }
        let child_path = child_path(path, key);
        let merged_value = merge_values(
            get(origin, key).as_ref(),
            None,
            Some(l_value),
            &child_path,
            ctx,
        )?;
        if let Some(value) = merged_value {
            merged.insert(key.clone(), value);
        }
    }
    Ok(merged)
}

fn child_path(path: &str, key: &Value) -> String {
    let key = scalar_string(key).unwrap_or_default();
    if path.is_empty() {
        key
    } else {
        format!("{path}.{key}")
    }
}

fn merge_sequences(
    origin: Option<&[Value]>,
    updated: &[Value],
    local: &[Value],
    path: &str,
    ctx: &MergeCtx,
) -> Result<Value> {
    let origin = origin.unwrap_or(&[]);
    let key = ctx
        .list_key(path)
        .or_else(|| associative_key(&[origin, updated, local]));

    let Some(key) = key else {
        return merge_positional(origin, updated, local, path, ctx);
    };

    let o_keyed = keyed_elements(origin, key, path, ctx)?;
    let u_keyed = keyed_elements(updated, key, path, ctx)?;
    let l_keyed = keyed_elements(local, key, path, ctx)?;

    let mut merged = Vec::new();
    // Keyed elements, upstream appearance order first.
    for (k, u_elem) in &u_keyed {
        let value = merge_values(
            o_keyed.get(k).copied(),
            Some(*u_elem),
            l_keyed.get(k).copied(),
            path,
            ctx,
        )?;
        if let Some(value) = value {
            merged.push(value);
        }
    }
    for (k, l_elem) in &l_keyed {
        if u_keyed.contains_key(k) {
            continue;
        }
        let value = merge_values(o_keyed.get(k).copied(), None, Some(*l_elem), path, ctx)?;
        if let Some(value) = value {
            merged.push(value);
        }
    }
    // Unkeyed elements: upstream's in order, then local's new-only entries.
    let o_unkeyed: Vec<&Value> = unkeyed_elements(origin, key);
    let u_unkeyed: Vec<&Value> = unkeyed_elements(updated, key);
    for elem in &u_unkeyed {
        merged.push((*elem).clone());
    }
    for elem in unkeyed_elements(local, key) {
        let seen = o_unkeyed.iter().chain(u_unkeyed.iter()).any(|e| *e == elem);
        if !seen {
            merged.push(elem.clone());
        }
    }
    Ok(Value::Sequence(merged))
}

/// Positional three-way merge for sequences without an associative key:
/// element i of each side lines up, with the scalar rules applied per slot.
fn merge_positional(
    origin: &[Value],
    updated: &[Value],
    local: &[Value],
    path: &str,
    ctx: &MergeCtx,
) -> Result<Value> {
    let len = updated.len().max(local.len()).max(origin.len());
    let mut merged = Vec::new();
    for i in 0..len {
        let value = merge_values(origin.get(i), updated.get(i), local.get(i), path, ctx)?;
        if let Some(value) = value {
            merged.push(value);
        }
    }
    Ok(Value::Sequence(merged))
}

fn keyed_elements<'a>(
    elements: &'a [Value],
    key: &str,
    path: &str,
    ctx: &MergeCtx,
) -> Result<IndexMap<String, &'a Value>> {
    let mut keyed = IndexMap::new();
    for element in elements {
        if let Some(value) = element_key(element, key) {
            if keyed.insert(value.clone(), element).is_some() {
                return Err(MergeConflict::AmbiguousListKey {
                    id: ctx.id.clone(),
                    field_path: path.to_string(),
                    key: format!("{key}={value}"),
                }
                .into());
            }
        }
    }
    Ok(keyed)
}

fn unkeyed_elements<'a>(elements: &'a [Value], key: &str) -> Vec<&'a Value> {
    elements
        .iter()
        .filter(|e| element_key(e, key).is_none())
        .collect()
}

/// Setter stickiness: before the merge, upstream's setter placeholders are
/// resolved with the local values for setters both sides define, so a value
/// the user set survives upstream updates that still carry the placeholder.
pub fn apply_setter_stickiness(
    updated_set: &mut ResourceSet,
    updated_manifest: &mut Manifest,
    local_manifest: &Manifest,
) {
    let local_setters = local_manifest.setters();
    for (name, u_setter) in updated_manifest.setters() {
        let Some(l_setter) = local_setters.get(&name) else {
            continue;
        };
        if l_setter.value == u_setter.value {
            continue;
        }
        let mut field_paths = u_setter.field_paths.clone();
        for p in &l_setter.field_paths {
            if !field_paths.contains(p) {
                field_paths.push(p.clone());
            }
        }
        for path in &field_paths {
            let steps = parse_path(path);
            for resource in updated_set.resources_mut().values_mut() {
                let matches = resource
                    .get(&steps)
                    .and_then(scalar_string)
                    .is_some_and(|v| v == u_setter.value);
                if matches {
                    resource.set(&steps, Value::String(l_setter.value.clone()));
                }
            }
        }
        updated_manifest.set_setter_value(&name, &l_setter.value);
    }
    // Substitution can touch identity fields such as metadata.namespace.
    updated_set.reindex();
}
