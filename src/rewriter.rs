//! Content and manifest rewriting for applying repair plans.
//!
//! Replacement is textual and line based: each line holding a reference has
//! its most specific broken token swapped for the planned replacement. The
//! result must still parse as JSON. Inline scene elements that cannot be
//! blanked out textually are excised from the parsed tree instead.

use crate::analyzer::RepairPlan;
use crate::archive::{self, MANIFEST};
use crate::error::{Result, VarError};
use crate::package::{self, Package};
use crate::scanner;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

/// Inline scene elements, removable only through atom removal.
pub const ELEMENT_EXTENSIONS: [&str; 2] = ["vmi", "vam"];

/// References that can be blanked out in place.
pub const STRIPPABLE_EXTENSIONS: [&str; 9] = [
    "vap", "json", "jpg", "png", "tif", "jpeg", "cs", "cslist", "dll",
];

const DEFAULT_LICENSE: &str = "FC";

const REFERENCE_MARKERS: [&str; 3] = [":/", "Custom/", "Saves/"];

/// Geometry lists and the field that identifies their entries. Entries of
/// lists flagged `true` own storables keyed by their `internalId`.
const GEOMETRY_LISTS: [(&str, &str, bool); 3] = [
    ("morphs", "uid", false),
    ("clothing", "id", true),
    ("hair", "id", true),
];

pub fn is_element(token: &str) -> bool {
    has_extension_in(token, &ELEMENT_EXTENSIONS)
}

pub fn is_strippable(token: &str) -> bool {
    has_extension_in(token, &STRIPPABLE_EXTENSIONS)
}

fn has_extension_in(token: &str, extensions: &[&str]) -> bool {
    package::extension(token).is_some_and(|ext| extensions.contains(&ext.as_str()))
}

/// Applies the longest replacement key found in `line`.
///
/// A `None` replacement blanks the token out when it is strippable and
/// otherwise leaves the line for atom removal. Lines already holding the
/// replacement, or holding the key only as the path of a namespaced
/// reference, are left alone.
pub fn replace_line(line: &str, replacements: &BTreeMap<String, Option<String>>) -> String {
    let Some((key, replacement)) = replacements
        .iter()
        .filter(|(key, _)| line.contains(key.as_str()))
        .max_by_key(|(key, _)| key.len())
    else {
        return line.to_string();
    };

    let bare_key_in_namespaced_path =
        !key.contains(":/") && line.contains(&format!(":/{}", key));

    let Some(replacement) = replacement else {
        if is_strippable(key) && !bare_key_in_namespaced_path {
            return line.replace(key.as_str(), "");
        }
        return line.to_string();
    };

    if line.contains(replacement.as_str()) || bare_key_in_namespaced_path {
        return line.to_string();
    }
    line.replace(key.as_str(), replacement)
}

/// Runs [`replace_line`] over every reference-bearing line, keeping line endings.
pub fn replace_contents(text: &str, replacements: &BTreeMap<String, Option<String>>) -> String {
    text.split_inclusive('\n')
        .map(|line| {
            if REFERENCE_MARKERS.iter().any(|m| line.contains(m)) {
                replace_line(line, replacements)
            } else {
                line.to_string()
            }
        })
        .collect()
}

/// Returns `atom` with geometry entries named in `elements` removed, along
/// with every storable whose id contains the `internalId` of a removed
/// clothing or hair entry.
pub fn remove_from_atom(atom: &Value, elements: &BTreeSet<String>) -> Value {
    let Some(storables) = atom.get("storables").and_then(Value::as_array) else {
        return atom.clone();
    };
    let Some(geometry_index) = storables.iter().position(|s| s["id"] == "geometry") else {
        return atom.clone();
    };

    let mut geometry = storables[geometry_index].clone();
    let mut internal_ids = Vec::new();
    for (list, id_field, owns_storables) in GEOMETRY_LISTS {
        let Some(entries) = geometry.get(list).and_then(Value::as_array) else {
            continue;
        };
        let (removed, kept): (Vec<&Value>, Vec<&Value>) = entries.iter().partition(|entry| {
            entry[id_field]
                .as_str()
                .is_some_and(|id| elements.contains(id))
        });
        if owns_storables {
            internal_ids.extend(
                removed
                    .iter()
                    .filter_map(|entry| entry["internalId"].as_str())
                    .map(str::to_lowercase),
            );
        }
        let kept: Vec<Value> = kept.into_iter().cloned().collect();
        geometry[list] = Value::Array(kept);
    }

    let storables: Vec<Value> = storables
        .iter()
        .enumerate()
        .filter_map(|(i, storable)| {
            if i == geometry_index {
                return Some(geometry.clone());
            }
            let id = storable["id"].as_str().unwrap_or_default().to_lowercase();
            if internal_ids.iter().any(|internal| id.contains(internal.as_str())) {
                None
            } else {
                Some(storable.clone())
            }
        })
        .collect();

    let mut atom = atom.clone();
    atom["storables"] = Value::Array(storables);
    atom
}

/// Applies [`remove_from_atom`] to a document: the document itself when it
/// is a single atom, otherwise every `Person` atom of a scene.
pub fn remove_elements(document: &Value, elements: &BTreeSet<String>) -> Value {
    if document.get("storables").is_some() {
        return remove_from_atom(document, elements);
    }
    let Some(atoms) = document.get("atoms").and_then(Value::as_array) else {
        return document.clone();
    };
    let atoms: Vec<Value> = atoms
        .iter()
        .map(|atom| {
            if atom["type"] == "Person" {
                remove_from_atom(atom, elements)
            } else {
                atom.clone()
            }
        })
        .collect();
    let mut document = document.clone();
    document["atoms"] = Value::Array(atoms);
    document
}

/// Rewrites one content file, validating that the result is still JSON.
pub fn rewrite_content(
    package_id: &str,
    file: &str,
    text: &str,
    replacements: &BTreeMap<String, Option<String>>,
    elements: &BTreeSet<String>,
) -> Result<String> {
    let replaced = replace_contents(scanner::strip_bom(text), replacements);
    let mut document: Value =
        serde_json::from_str(&replaced).map_err(|source| VarError::ContentRewriteCorruption {
            package: package_id.to_string(),
            file: file.to_string(),
            source,
        })?;
    if !elements.is_empty() {
        document = remove_elements(&document, elements);
    }
    Ok(serde_json::to_string_pretty(&document)?)
}

/// Builds the manifest `dependencies` object for `dependencies`, keeping the
/// license of entries already present in `previous`.
pub fn dependencies_manifest(dependencies: &BTreeSet<String>, previous: &Value) -> Value {
    let map: Map<String, Value> = dependencies
        .iter()
        .map(|id| {
            let license = previous
                .get(id)
                .and_then(|entry| entry.get("licenseType"))
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_LICENSE);
            (id.clone(), json!({ "licenseType": license, "dependencies": {} }))
        })
        .collect();
    Value::Object(map)
}

/// Replaces the manifest's `contentList` and `dependencies`, keeping every other field.
pub fn rewrite_manifest(
    package_id: &str,
    text: &str,
    content_list: &[&str],
    dependencies: &BTreeSet<String>,
) -> Result<String> {
    let mut manifest: Value = serde_json::from_str(scanner::strip_bom(text)).map_err(|source| {
        VarError::ManifestParse {
            package: package_id.to_string(),
            source,
        }
    })?;
    if !manifest.is_object() {
        manifest = json!({});
    }
    manifest["contentList"] = json!(content_list);
    let previous = manifest["dependencies"].take();
    manifest["dependencies"] = dependencies_manifest(dependencies, &previous);
    Ok(serde_json::to_string_pretty(&manifest)?)
}

/// Applies `plan` to the package archive at `archive_path`.
///
/// Every JSON-like file is rewritten and revalidated; the manifest lists the
/// plan's used packages. Nothing on disk changes if any file fails.
pub fn apply_plan(archive_path: &Path, package: &Package, plan: &RepairPlan) -> Result<()> {
    let package_id = package.package_id();
    let content_list: Vec<&str> = package.includes().into_iter().map(|(p, _)| p).collect();
    let elements = plan.element_removals();

    archive::rewrite_archive(archive_path, |name, bytes| {
        if name == MANIFEST {
            let text = String::from_utf8_lossy(&bytes);
            let manifest =
                rewrite_manifest(&package_id, &text, &content_list, &plan.used_packages)?;
            return Ok(manifest.into_bytes());
        }
        if !archive::is_json_like(name) {
            return Ok(bytes);
        }
        let text = String::from_utf8_lossy(&bytes);
        let rewritten = rewrite_content(&package_id, name, &text, &plan.replacements, &elements)?;
        debug!(package = %package_id, file = name, "rewrote content");
        Ok(rewritten.into_bytes())
    })
}

/// Rewrites only the manifest so it declares exactly `dependencies`.
pub fn apply_metadata(
    archive_path: &Path,
    package: &Package,
    dependencies: &BTreeSet<String>,
) -> Result<()> {
    let package_id = package.package_id();
    let content_list: Vec<&str> = package.includes().into_iter().map(|(p, _)| p).collect();

    archive::rewrite_archive(archive_path, |name, bytes| {
        if name != MANIFEST {
            return Ok(bytes);
        }
        let text = String::from_utf8_lossy(&bytes);
        Ok(rewrite_manifest(&package_id, &text, &content_list, dependencies)?.into_bytes())
    })
}
