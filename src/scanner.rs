//! Reference scanner.
//!
//! Walks the lines of a JSON-like content file and extracts cross-package
//! references of the form `"author.name.version:/Custom/Path/file.ext"`.
//! Same-package references written without any namespace (bare `Custom/...`
//! or `Saves/...` paths) are collected under [`SELF_UNREF`].

use crate::error::{Result, VarError};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Namespace tag for a correctly written same-package reference.
pub const SELF_REF: &str = "SELF";
/// Synthetic key for same-package paths that omit the namespace entirely.
pub const SELF_UNREF: &str = "SELF_UNREF";

const NAMESPACE_SEPARATOR: &str = ":/";
const ROOT_MARKERS: [&str; 2] = ["Custom/", "Saves/"];

/// Referenced package id (or `SELF`/`SELF_UNREF`) to the set of referenced paths.
pub type ReferenceMap = BTreeMap<String, BTreeSet<String>>;

/// A single `(target, path)` reference pulled from a [`ReferenceMap`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Reference {
    /// Package id, `SELF` or `SELF_UNREF`.
    pub target: String,
    /// Path inside the target package.
    pub path: String,
}

impl Reference {
    /// Returns the literal text this reference occupies in a content file.
    pub fn token(&self) -> String {
        if self.target == SELF_UNREF {
            self.path.clone()
        } else {
            format!("{}{}{}", self.target, NAMESPACE_SEPARATOR, self.path)
        }
    }

    pub fn is_self(&self) -> bool {
        self.target == SELF_REF || self.target == SELF_UNREF
    }
}

/// Flattens a reference map into individual references, in map order.
pub fn references(map: &ReferenceMap) -> Vec<Reference> {
    map.iter()
        .flat_map(|(target, paths)| {
            paths.iter().map(move |path| Reference {
                target: target.clone(),
                path: path.clone(),
            })
        })
        .collect()
}

/// Merges `other` into `into`.
pub fn merge(into: &mut ReferenceMap, other: ReferenceMap) {
    for (target, paths) in other {
        into.entry(target).or_default().extend(paths);
    }
}

/// Scans one content file.
///
/// The text must be valid JSON: a file that does not parse would silently
/// under-report references, so it aborts the scan with [`VarError::ContentParse`].
pub fn scan_content(package: &str, file: &str, text: &str) -> Result<ReferenceMap> {
    let text = strip_bom(text);
    serde_json::from_str::<serde::de::IgnoredAny>(text).map_err(|source| {
        VarError::ContentParse {
            package: package.to_string(),
            file: file.to_string(),
            source,
        }
    })?;
    Ok(scan_lines(text.lines()))
}

/// Extracts references from raw lines without validating the document.
pub fn scan_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> ReferenceMap {
    let mut refs = ReferenceMap::new();

    for line in lines {
        if line.contains(NAMESPACE_SEPARATOR) {
            if is_url_line(line) {
                continue;
            }
            if let Some((target, path)) = parse_namespaced(line) {
                refs.entry(target).or_default().insert(path);
            }
        } else if let Some(path) = parse_unreferenced(line) {
            refs.entry(SELF_UNREF.to_string()).or_default().insert(path);
        }
    }

    refs
}

pub(crate) fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

fn is_url_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("https://") || lower.contains("http://")
}

/// Splits the first quoted token holding `:/` into `(target, path)`.
///
/// When `:/` repeats, everything before the last separator is the target.
/// `A_`-tagged targets on a line carrying a `name`/`displayName` hint are
/// display metadata; the tag is stripped. `:True`/`:False` suffixes are
/// dropped from the path.
fn parse_namespaced(line: &str) -> Option<(String, String)> {
    let token = line.split('"').find(|word| word.contains(NAMESPACE_SEPARATOR))?;
    let parts: Vec<&str> = token.split(NAMESPACE_SEPARATOR).collect();
    let (path, head) = parts.split_last()?;
    let mut target = head.join(NAMESPACE_SEPARATOR);

    if target.starts_with("A_") && line.to_lowercase().contains("name") {
        target = match target.split(':').nth(1) {
            Some(inner) => inner.to_string(),
            None => target[2..].to_string(),
        };
    }

    let path = path.replace(":False", "").replace(":True", "");
    Some((target, path))
}

fn parse_unreferenced(line: &str) -> Option<String> {
    let marker = ROOT_MARKERS.iter().find(|m| line.contains(*m))?;
    let word = line.split('"').find(|word| word.contains(marker))?;
    if word.starts_with("A_") {
        if let Some(inner) = word.split(':').nth(1) {
            return Some(inner.to_string());
        }
    }
    Some(word.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn extracts_plugin_reference() {
        let refs = scan_lines([r#""plugin#0":"Author.Pkg.1:/Scripts/x.cs""#]);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs["Author.Pkg.1"], set(&["Scripts/x.cs"]));
    }

    #[test]
    fn groups_paths_by_target() {
        let source = r#"{
            "id" : "Roac.Arty_ponytail.latest:/Custom/Hair/Female/Roac/ROAC/Roac Arty pony.vam",
            "id" : "Roac.Arty_ponytail.latest:/Custom/Hair/Female/Roac/ROAC/Roac Arty ponytail tuck.vam",
            "uid" : "Spacedog.Import_Reloaded_Lite.latest:/Custom/Atom/Person/Morphs/female/Aureola.vmi"
        }"#;
        let refs = scan_lines(source.lines());
        assert_eq!(
            refs["Roac.Arty_ponytail.latest"],
            set(&[
                "Custom/Hair/Female/Roac/ROAC/Roac Arty pony.vam",
                "Custom/Hair/Female/Roac/ROAC/Roac Arty ponytail tuck.vam",
            ])
        );
        assert_eq!(
            refs["Spacedog.Import_Reloaded_Lite.latest"],
            set(&["Custom/Atom/Person/Morphs/female/Aureola.vmi"])
        );
    }

    #[test]
    fn skips_urls() {
        let refs = scan_lines([r#""link" : "https://example.com/Custom/thing""#]);
        assert!(refs.is_empty());
    }

    #[test]
    fn strips_boolean_suffix() {
        let refs = scan_lines([r#""morph" : "A.B.2:/Custom/Atom/Person/Morphs/m.vmi:True""#]);
        assert_eq!(refs["A.B.2"], set(&["Custom/Atom/Person/Morphs/m.vmi"]));
    }

    #[test]
    fn strips_display_tag_with_inner_target() {
        let line = r#""displayName" : "A_Thing:Author.Pkg.3:/Custom/Clothing/c.vam""#;
        let refs = scan_lines([line]);
        assert_eq!(refs["Author.Pkg.3"], set(&["Custom/Clothing/c.vam"]));
    }

    #[test]
    fn strips_bare_display_tag() {
        let line = r#""name" : "A_Author.Pkg.3:/Custom/Clothing/c.vam""#;
        let refs = scan_lines([line]);
        assert_eq!(refs["Author.Pkg.3"], set(&["Custom/Clothing/c.vam"]));
    }

    #[test]
    fn keeps_tag_without_name_hint() {
        let line = r#""id" : "A_Author.Pkg.3:/Custom/Clothing/c.vam""#;
        let refs = scan_lines([line]);
        assert!(refs.contains_key("A_Author.Pkg.3"));
    }

    #[test]
    fn joins_repeated_separators_into_target() {
        let refs = scan_lines([r#""id" : "Outer.Pkg.1:/Inner:/Custom/x.vam""#]);
        assert_eq!(refs["Outer.Pkg.1:/Inner"], set(&["Custom/x.vam"]));
    }

    #[test]
    fn records_unnamespaced_paths_as_self_unref() {
        let source = [
            r#""texture" : "Custom/Atom/Person/Textures/skin.png","#,
            r#""scene" : "Saves/scene/other.json""#,
        ];
        let refs = scan_lines(source);
        assert_eq!(
            refs[SELF_UNREF],
            set(&["Custom/Atom/Person/Textures/skin.png", "Saves/scene/other.json"])
        );
    }

    #[test]
    fn self_reference_is_recorded_under_self() {
        let refs = scan_lines([r#""img" : "SELF:/Custom/img.jpg""#]);
        assert_eq!(refs[SELF_REF], set(&["Custom/img.jpg"]));
    }

    #[test]
    fn scan_content_rejects_invalid_json() {
        let err = scan_content("A.B.1", "Saves/scene/a.json", "{ \"a\": ").unwrap_err();
        assert!(matches!(err, VarError::ContentParse { .. }));
    }

    #[test]
    fn scan_content_accepts_bom() {
        let text = "\u{feff}{\n\"id\" : \"A.B.1:/Custom/x.jpg\"\n}";
        let refs = scan_content("C.D.1", "Saves/scene/a.json", text).unwrap();
        assert_eq!(refs["A.B.1"], set(&["Custom/x.jpg"]));
    }

    #[test]
    fn reference_token_round_trips_namespace() {
        let external = Reference {
            target: "A.B.1".into(),
            path: "Custom/x.jpg".into(),
        };
        let bare = Reference {
            target: SELF_UNREF.into(),
            path: "Custom/x.jpg".into(),
        };
        insta::assert_snapshot!(external.token(), @"A.B.1:/Custom/x.jpg");
        insta::assert_snapshot!(bare.token(), @"Custom/x.jpg");
    }
}
