use indexmap::IndexMap;

use crate::error::{MergeConflict, Result};
use crate::manifest::{
    Definition, Function, GitRef, Info, Manifest, OciRef, OpenApi, Pipeline, SubpackageEntry,
};

/// Three-way merge of manifests. `upstream`/`upstreamLock` are never merged
/// here; the update coordinator owns them and overwrites both at the end.
pub fn merge_manifests(
    origin: Option<&Manifest>,
    updated: &Manifest,
    local: &Manifest,
) -> Result<Manifest> {
    let empty = Manifest::default();
    let origin = origin.unwrap_or(&empty);

    let mut merged = local.clone();
    merged.info = merge_info(origin.info.as_ref(), updated.info.as_ref(), local.info.as_ref());
    merged.pipeline = merge_pipeline(
        origin.pipeline.as_ref(),
        updated.pipeline.as_ref(),
        local.pipeline.as_ref(),
    );
    // Inventory belongs to the deployment: local wins entirely (already in
    // the clone).
    merged.open_api = merge_open_api(
        origin.open_api.as_ref(),
        updated.open_api.as_ref(),
        local.open_api.as_ref(),
    );
    merged.subpackages = merge_subpackages(
        origin.subpackages.as_deref().unwrap_or(&[]),
        updated.subpackages.as_deref().unwrap_or(&[]),
        local.subpackages.as_deref().unwrap_or(&[]),
    )?;
    Ok(merged)
}

/// Local wins on conflict: the value is the user's unless they left it alone.
fn local_wins<T: Clone + PartialEq>(origin: Option<&T>, updated: Option<&T>, local: Option<&T>) -> Option<T> {
    if local != origin {
        local.cloned()
    } else {
        updated.cloned()
    }
}

/// Upstream wins on conflict, the same precedence resources get.
fn upstream_wins<T: Clone + PartialEq>(
    origin: Option<&T>,
    updated: Option<&T>,
    local: Option<&T>,
) -> Option<T> {
    if updated != origin {
        updated.cloned()
    } else {
        local.cloned()
    }
}

/// Info is user-owned prose: field-wise with local precedence.
fn merge_info(origin: Option<&Info>, updated: Option<&Info>, local: Option<&Info>) -> Option<Info> {
    if updated.is_none() && local.is_none() {
        return None;
    }
    let empty = Info::default();
    let o = origin.unwrap_or(&empty);
    let u = updated.unwrap_or(&empty);
    let l = local.unwrap_or(&empty);
    let merged = Info {
        site: local_wins(o.site.as_ref(), u.site.as_ref(), l.site.as_ref()),
        emails: local_wins(Some(&o.emails), Some(&u.emails), Some(&l.emails)).unwrap_or_default(),
        license: local_wins(o.license.as_ref(), u.license.as_ref(), l.license.as_ref()),
        keywords: local_wins(Some(&o.keywords), Some(&u.keywords), Some(&l.keywords))
            .unwrap_or_default(),
        description: local_wins(
            o.description.as_ref(),
            u.description.as_ref(),
            l.description.as_ref(),
        ),
    };
    if merged == Info::default() {
        None
    } else {
        Some(merged)
    }
}

/// The in-memory key of a pipeline entry: its declared name, or a synthetic
/// key from the image (tag stripped) or exec line. Synthetic keys exist only
/// for matching and are never written back.
fn function_key(function: &Function) -> String {
    if let Some(name) = &function.name {
        return format!("name:{name}");
    }
    if let Some(image) = &function.image {
        let stripped = image
            .split_once('@')
            .map(|(repo, _)| repo)
            .unwrap_or_else(|| image.split_once(':').map(|(repo, _)| repo).unwrap_or(image));
        return format!("image:{stripped}");
    }
    if let Some(exec) = &function.exec {
        return format!("exec:{exec}");
    }
    String::new()
}

fn merge_pipeline(
    origin: Option<&Pipeline>,
    updated: Option<&Pipeline>,
    local: Option<&Pipeline>,
) -> Option<Pipeline> {
    if updated.is_none() && local.is_none() {
        return None;
    }
    let empty = Pipeline::default();
    let o = origin.unwrap_or(&empty);
    let u = updated.unwrap_or(&empty);
    let l = local.unwrap_or(&empty);
    let merged = Pipeline {
        mutators: merge_function_list(&o.mutators, &u.mutators, &l.mutators),
        validators: merge_function_list(&o.validators, &u.validators, &l.validators),
    };
    if merged.is_empty() { None } else { Some(merged) }
}

fn merge_function_list(origin: &[Function], updated: &[Function], local: &[Function]) -> Vec<Function> {
    let key_map = |functions: &[Function]| -> Option<IndexMap<String, Function>> {
        let mut map = IndexMap::new();
        for function in functions {
            let key = function_key(function);
            if key.is_empty() || map.insert(key, function.clone()).is_some() {
                // Unkeyable or duplicate entries: the list cannot be merged
                // element-wise.
                return None;
            }
        }
        Some(map)
    };
    let (Some(o), Some(u), Some(l)) = (key_map(origin), key_map(updated), key_map(local)) else {
        // Fall back to whole-list precedence: upstream's list if it changed,
        // local's otherwise.
        return if updated != origin {
            updated.to_vec()
        } else {
            local.to_vec()
        };
    };

    let mut merged = Vec::new();
    for (key, u_fn) in &u {
        match l.get(key) {
            Some(l_fn) => merged.push(merge_function(o.get(key), u_fn, l_fn)),
            None => {
                if !o.contains_key(key) {
                    merged.push(u_fn.clone());
                }
                // In O and U but not L: removed by the user.
            }
        }
    }
    for (key, l_fn) in &l {
        if u.contains_key(key) {
            continue;
        }
        match o.get(key) {
            None => merged.push(l_fn.clone()),
            Some(o_fn) => {
                if o_fn != l_fn {
                    merged.push(l_fn.clone());
                }
                // Unchanged and removed upstream: dropped.
            }
        }
    }
    merged
}

fn merge_function(origin: Option<&Function>, updated: &Function, local: &Function) -> Function {
    let empty = Function::default();
    let o = origin.unwrap_or(&empty);
    Function {
        name: local.name.clone().or_else(|| updated.name.clone()),
        image: upstream_wins(o.image.as_ref(), updated.image.as_ref(), local.image.as_ref()),
        exec: upstream_wins(o.exec.as_ref(), updated.exec.as_ref(), local.exec.as_ref()),
        config_map: local_wins(
            o.config_map.as_ref(),
            updated.config_map.as_ref(),
            local.config_map.as_ref(),
        ),
        config_path: local_wins(
            o.config_path.as_ref(),
            updated.config_path.as_ref(),
            local.config_path.as_ref(),
        ),
    }
}

/// Setter values are user-owned: keys follow upstream presence, values
/// follow the local edit when there is one.
fn merge_open_api(
    origin: Option<&OpenApi>,
    updated: Option<&OpenApi>,
    local: Option<&OpenApi>,
) -> Option<OpenApi> {
    if updated.is_none() && local.is_none() {
        return None;
    }
    let empty = OpenApi::default();
    let o = &origin.unwrap_or(&empty).definitions;
    let u = &updated.unwrap_or(&empty).definitions;
    let l = &local.unwrap_or(&empty).definitions;

    let mut definitions: IndexMap<String, Definition> = IndexMap::new();
    for (key, u_def) in u {
        match l.get(key) {
            Some(l_def) => {
                let merged = local_wins(o.get(key), Some(u_def), Some(l_def));
                if let Some(def) = merged {
                    definitions.insert(key.clone(), def);
                }
            }
            None => {
                if !o.contains_key(key) {
                    definitions.insert(key.clone(), u_def.clone());
                }
            }
        }
    }
    for (key, l_def) in l {
        if u.contains_key(key) {
            continue;
        }
        match o.get(key) {
            None => {
                definitions.insert(key.clone(), l_def.clone());
            }
            Some(o_def) => {
                if o_def != l_def {
                    definitions.insert(key.clone(), l_def.clone());
                }
            }
        }
    }
    if definitions.is_empty() {
        None
    } else {
        Some(OpenApi { definitions })
    }
}

fn merge_subpackages(
    origin: &[SubpackageEntry],
    updated: &[SubpackageEntry],
    local: &[SubpackageEntry],
) -> Result<Option<Vec<SubpackageEntry>>> {
    let key_map = |entries: &[SubpackageEntry]| -> IndexMap<String, SubpackageEntry> {
        entries
            .iter()
            .map(|e| (e.local_dir.clone(), e.clone()))
            .collect()
    };
    let o = key_map(origin);
    let u = key_map(updated);
    let l = key_map(local);

    let mut merged = Vec::new();
    for (dir, u_entry) in &u {
        match (o.get(dir), l.get(dir)) {
            (o_entry @ Some(_), Some(l_entry)) => {
                merged.push(merge_subpackage_entry(o_entry, u_entry, l_entry));
            }
            (None, Some(l_entry)) => {
                if l_entry == u_entry {
                    merged.push(l_entry.clone());
                } else {
                    // Both sides invented the same localDir with different
                    // remotes; guessing would fetch the wrong content.
                    return Err(MergeConflict::BothAddedSubpackage(dir.into()).into());
                }
            }
            (None, None) => merged.push(u_entry.clone()),
            (Some(_), None) => {
                // Removed by the user.
            }
        }
    }
    for (dir, l_entry) in &l {
        if u.contains_key(dir) {
            continue;
        }
        match o.get(dir) {
            None => merged.push(l_entry.clone()),
            Some(o_entry) => {
                if o_entry != l_entry {
                    merged.push(l_entry.clone());
                }
            }
        }
    }
    Ok(if merged.is_empty() { None } else { Some(merged) })
}

/// Per-entry rule: the `ref` and `updateStrategy` fields are user-owned
/// (local wins); the remote coordinates follow upstream.
fn merge_subpackage_entry(
    origin: Option<&SubpackageEntry>,
    updated: &SubpackageEntry,
    local: &SubpackageEntry,
) -> SubpackageEntry {
    let o_git = origin.and_then(|o| o.git.as_ref());
    let o_oci = origin.and_then(|o| o.oci.as_ref());
    let git = match (&updated.git, &local.git) {
        (Some(u_git), Some(l_git)) => Some(GitRef {
            repo: upstream_wins(
                o_git.map(|g| &g.repo),
                Some(&u_git.repo),
                Some(&l_git.repo),
            )
            .unwrap_or_default(),
            directory: upstream_wins(
                o_git.map(|g| &g.directory),
                Some(&u_git.directory),
                Some(&l_git.directory),
            )
            .unwrap_or_default(),
            r#ref: local_wins(
                o_git.map(|g| &g.r#ref),
                Some(&u_git.r#ref),
                Some(&l_git.r#ref),
            )
            .unwrap_or_default(),
        }),
        (u_git, l_git) => l_git.clone().or_else(|| u_git.clone()),
    };
    let oci = match (&updated.oci, &local.oci) {
        (Some(u_oci), Some(l_oci)) => Some(OciRef {
            image: upstream_wins(
                o_oci.map(|o| &o.image),
                Some(&u_oci.image),
                Some(&l_oci.image),
            )
            .unwrap_or_default(),
            directory: upstream_wins(
                o_oci.map(|o| &o.directory),
                Some(&u_oci.directory),
                Some(&l_oci.directory),
            )
            .unwrap_or_default(),
        }),
        (u_oci, l_oci) => l_oci.clone().or_else(|| u_oci.clone()),
    };
    SubpackageEntry {
        local_dir: local.local_dir.clone(),
        git,
        oci,
        update_strategy: local_wins(
            origin.and_then(|o| o.update_strategy.as_ref()),
            updated.update_strategy.as_ref(),
            local.update_strategy.as_ref(),
        ),
    }
}
