//! Repair index and fuzzy matching.
//!
//! The index lists every file of every stored package, ordered so that the
//! first hit of a linear scan is the preferred replacement for a broken
//! reference: foundational content types first, then packages already
//! required by someone, then packages by highly referenced authors, then
//! newer versions.

use crate::graph::DependencyGraph;
use crate::package::{self, Package};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashMap;

/// One file of one package.
#[derive(Debug, Clone, Serialize)]
pub struct IndexEntry {
    pub package_id: String,
    pub path: String,
    pub basename: String,
    #[serde(skip)]
    path_lower: String,
    #[serde(skip)]
    basename_lower: String,
}

/// A replacement location for a broken reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub package_id: String,
    pub path: String,
}

impl From<&IndexEntry> for Candidate {
    fn from(entry: &IndexEntry) -> Self {
        Candidate {
            package_id: entry.package_id.clone(),
            path: entry.path.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RepairIndex {
    entries: Vec<IndexEntry>,
}

impl RepairIndex {
    /// Sorts packages by `(reference priority, required, author rank,
    /// duplicate id, newest version)` and flattens their listings.
    ///
    /// Authors outside the `top_authors` most referenced rank `top_authors + 1`.
    pub fn build<'a>(
        packages: impl IntoIterator<Item = &'a Package>,
        graph: &DependencyGraph,
        top_authors: usize,
    ) -> Self {
        let ranking: HashMap<String, usize> = graph
            .top_authors(top_authors)
            .into_iter()
            .enumerate()
            .map(|(rank, author)| (author, rank))
            .collect();

        let mut ordered: Vec<_> = packages
            .into_iter()
            .map(|package| {
                let id = package.package_id();
                let key = (
                    package.content_type.reference_priority(),
                    if graph.is_required(&id) { 0 } else { 1 },
                    ranking
                        .get(package.author())
                        .copied()
                        .unwrap_or(top_authors + 1),
                    package.duplicate_id(),
                    Reverse(package.version()),
                );
                (key, package)
            })
            .collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));

        let entries = ordered
            .into_iter()
            .flat_map(|(_, package)| {
                let id = package.package_id();
                package
                    .includes()
                    .into_iter()
                    .map(move |(path, basename)| IndexEntry {
                        package_id: id.clone(),
                        path: path.to_string(),
                        basename: basename.to_string(),
                        path_lower: path.to_lowercase(),
                        basename_lower: basename.to_lowercase(),
                    })
            })
            .collect();

        RepairIndex { entries }
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry whose path equals `path`, ignoring case.
    pub fn find_exact(&self, path: &str) -> Option<&IndexEntry> {
        let needle = path.to_lowercase();
        self.entries.iter().find(|e| e.path_lower == needle)
    }

    /// Entries sharing the basename of `path`, ignoring case, in index order.
    pub fn find_by_basename(&self, path: &str) -> Vec<&IndexEntry> {
        let needle = package::basename(path).to_lowercase();
        self.entries
            .iter()
            .filter(|e| e.basename_lower == needle)
            .collect()
    }

    /// Best replacement for a broken `path`: an exact path match if one
    /// exists, otherwise the closest basename match.
    pub fn find_replacement(&self, path: &str) -> Option<Candidate> {
        if let Some(entry) = self.find_exact(path) {
            return Some(entry.into());
        }
        let found: Vec<Candidate> = self
            .find_by_basename(path)
            .into_iter()
            .map(Candidate::from)
            .collect();
        select_fuzzy_match(path, found)
    }
}

/// Character-frequency distance between two strings.
///
/// Sums, over every character, the absolute difference of its occurrence
/// counts. Order-insensitive, so it is a heuristic and not an edit distance;
/// lower is closer.
pub fn fuzzy_distance(a: &str, b: &str) -> usize {
    let mut counts: HashMap<char, i64> = HashMap::new();
    for c in a.chars() {
        *counts.entry(c).or_default() += 1;
    }
    for c in b.chars() {
        *counts.entry(c).or_default() -= 1;
    }
    counts.values().map(|n| n.unsigned_abs() as usize).sum()
}

/// Picks the candidate whose path is closest to `path`. Ties go to the
/// earliest candidate.
pub fn select_fuzzy_match(path: &str, found: Vec<Candidate>) -> Option<Candidate> {
    if found.len() <= 1 {
        return found.into_iter().next();
    }
    found
        .into_iter()
        .enumerate()
        .min_by_key(|(i, c)| (fuzzy_distance(path, &c.path), *i))
        .map(|(_, c)| c)
}

/// Looks for a same-extension file of one package whose name is within
/// `threshold` (exclusive) of `path`.
///
/// Whole-path matches win over basename matches; within a tier the closest
/// path wins.
pub fn find_fuzzy_file_match(
    path: &str,
    package_id: &str,
    includes: &[(&str, &str)],
    threshold: usize,
) -> Option<Candidate> {
    let wanted_ext = package::extension(path);
    let wanted_basename = package::basename(path);

    let mut by_path = Vec::new();
    let mut by_basename = Vec::new();
    for (candidate, basename) in includes {
        if package::extension(basename) != wanted_ext {
            continue;
        }
        let found = Candidate {
            package_id: package_id.to_string(),
            path: candidate.to_string(),
        };
        if fuzzy_distance(path, candidate) < threshold {
            by_path.push(found);
        } else if fuzzy_distance(wanted_basename, basename) < threshold {
            by_basename.push(found);
        }
    }

    if by_path.is_empty() {
        select_fuzzy_match(path, by_basename)
    } else {
        select_fuzzy_match(path, by_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ClosureMode;
    use crate::test_support::package;

    fn index(packages: &[Package]) -> RepairIndex {
        let graph = DependencyGraph::build(packages, ClosureMode::Full);
        RepairIndex::build(packages, &graph, 50)
    }

    fn ids(index: &RepairIndex) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for entry in index.entries() {
            if ids.last() != Some(&entry.package_id.as_str()) {
                ids.push(&entry.package_id);
            }
        }
        ids
    }

    // ============================================================================
    // Ordering
    // ============================================================================

    #[test]
    fn required_package_comes_first_on_priority_tie() {
        let packages = [
            package("Alpha.Tex.1", &["Custom/Atom/Person/Textures/skin.png"], &[]),
            package("Zeta.Tex.1", &["Custom/Atom/Person/Textures/skin.png"], &[]),
            package(
                "User.Scene.1",
                &["Saves/scene/a.json"],
                &[("Zeta.Tex.1", "Custom/Atom/Person/Textures/skin.png")],
            ),
        ];
        let index = index(&packages);
        let hit = index
            .find_exact("Custom/Atom/Person/Textures/skin.png")
            .unwrap();
        assert_eq!(hit.package_id, "Zeta.Tex.1");
        assert_eq!(ids(&index), vec!["Zeta.Tex.1", "Alpha.Tex.1", "User.Scene.1"]);
    }

    #[test]
    fn content_type_priority_dominates() {
        let packages = [
            package("A.Scene.1", &["Saves/scene/a.json", "Custom/Atom/Person/Textures/t.png"], &[]),
            package("B.Tex.1", &["Custom/Atom/Person/Textures/t.png"], &[]),
        ];
        let index = index(&packages);
        assert_eq!(
            index.find_exact("Custom/Atom/Person/Textures/t.png").unwrap().package_id,
            "B.Tex.1"
        );
    }

    #[test]
    fn newer_versions_first() {
        let packages = [
            package("A.Tex.1", &["Custom/Atom/Person/Textures/t.png"], &[]),
            package("A.Tex.3", &["Custom/Atom/Person/Textures/t.png"], &[]),
            package("A.Tex.2", &["Custom/Atom/Person/Textures/t.png"], &[]),
        ];
        assert_eq!(ids(&index(&packages)), vec!["A.Tex.3", "A.Tex.2", "A.Tex.1"]);
    }

    #[test]
    fn top_authors_outrank_alphabetical_order() {
        let packages = [
            package("Aaa.Tex.1", &["Custom/Atom/Person/Textures/t.png"], &[]),
            package("Zzz.Tex.1", &["Custom/Atom/Person/Textures/t.png"], &[]),
            package(
                "User.Scene.1",
                &["Saves/scene/a.json"],
                &[("Zzz.Other.1", "Custom/Atom/Person/Textures/o.png")],
            ),
        ];
        assert_eq!(
            ids(&index(&packages)),
            vec!["Zzz.Tex.1", "Aaa.Tex.1", "User.Scene.1"]
        );
    }

    #[test]
    fn manifest_and_extensionless_entries_are_not_indexed() {
        let packages = [package("A.B.1", &["meta.json", "Custom/readme", "Custom/a.jpg"], &[])];
        let index = index(&packages);
        assert_eq!(index.len(), 1);
        assert_eq!(index.entries()[0].basename, "a.jpg");
    }

    // ============================================================================
    // Lookup
    // ============================================================================

    #[test]
    fn exact_lookup_ignores_case() {
        let packages = [package("A.B.1", &["Custom/Hair/Long.vam"], &[])];
        let index = index(&packages);
        assert!(index.find_exact("custom/hair/long.VAM").is_some());
    }

    #[test]
    fn basename_fallback_picks_closest_path() {
        let packages = [
            package("A.Hair.1", &["Custom/Hair/Female/Other/long.vam"], &[]),
            package("B.Hair.1", &["Custom/Hair/Female/Me/long.vam"], &[]),
        ];
        let index = index(&packages);
        let found = index
            .find_replacement("Custom/Hair/Female/Mee/long.vam")
            .unwrap();
        assert_eq!(
            found,
            Candidate {
                package_id: "B.Hair.1".into(),
                path: "Custom/Hair/Female/Me/long.vam".into()
            }
        );
        assert!(index.find_replacement("Custom/Hair/short.vam").is_none());
    }

    // ============================================================================
    // Fuzzy matching
    // ============================================================================

    #[test]
    fn distance_counts_frequency_differences() {
        assert_eq!(fuzzy_distance("abc", "abc"), 0);
        assert_eq!(fuzzy_distance("abc", "cba"), 0);
        assert_eq!(fuzzy_distance("abc", "abd"), 2);
        assert_eq!(fuzzy_distance("abc", "abcc"), 1);
    }

    #[test]
    fn select_prefers_first_on_tie() {
        let found = vec![
            Candidate {
                package_id: "A.A.1".into(),
                path: "x/ab.jpg".into(),
            },
            Candidate {
                package_id: "B.B.1".into(),
                path: "x/ba.jpg".into(),
            },
        ];
        assert_eq!(select_fuzzy_match("x/ab.jpg", found).unwrap().package_id, "A.A.1");
        assert!(select_fuzzy_match("x", vec![]).is_none());
    }

    #[test]
    fn same_package_typo_is_matched() {
        let includes = [
            ("Saves/scene/Textures/skin.png", "skin.png"),
            ("Saves/scene/Textures/skin.jpg", "skin.jpg"),
        ];
        let found =
            find_fuzzy_file_match("Saves/scene/Textures/skni.png", "Me.Scene.1", &includes, 3)
                .unwrap();
        assert_eq!(found.path, "Saves/scene/Textures/skin.png");
    }

    #[test]
    fn fuzzy_match_requires_same_extension_and_threshold() {
        let includes = [("Saves/scene/a.jpg", "a.jpg"), ("Saves/scene/abcdef.png", "abcdef.png")];
        assert!(find_fuzzy_file_match("Saves/scene/a.png", "Me.Scene.1", &includes, 3).is_none());
        assert!(find_fuzzy_file_match("Saves/scene/b.jpg", "Me.Scene.1", &includes, 2).is_none());
        assert!(find_fuzzy_file_match("Saves/scene/b.jpg", "Me.Scene.1", &includes, 3).is_some());
    }

    #[test]
    fn fuzzy_match_falls_back_to_basename() {
        let includes = [("Custom/Deep/Other/Place/tex.png", "tex.png")];
        let found = find_fuzzy_file_match("Saves/tez.png", "Me.Scene.1", &includes, 3).unwrap();
        assert_eq!(found.path, "Custom/Deep/Other/Place/tex.png");
    }
}
