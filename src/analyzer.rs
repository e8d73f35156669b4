//! Reference analysis and replacement planning.
//!
//! Classifies every reference of a freshly scanned package as correct,
//! needing a `SELF` tag, valid external, or broken. Broken references get a
//! replacement from the repair index or a same-package fuzzy match; anything
//! left over is marked for removal. Version pinning and multi-version
//! consolidation then decide the exact text each reference is rewritten to.

use crate::content_type::ContentType;
use crate::graph::DependencyGraph;
use crate::package::{self, Package, VersionSpec};
use crate::repair_index::{self, Candidate, RepairIndex};
use crate::rewriter;
use crate::scanner::{Reference, SELF_REF};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_FUZZY_THRESHOLD: usize = 3;

/// Plugin authors whose code stays backward compatible across versions.
pub const BACKWARD_COMPATIBLE_AUTHORS: [&str; 3] = ["AcidBubbles", "Hunting-Succubus", "MacGruber"];

const CODE_EXTENSIONS: [&str; 3] = ["cs", "cslist", "dll"];

/// Where a reference should point after repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    /// A file inside the package under repair.
    Local { path: String },
    External {
        duplicate_id: String,
        #[serde(serialize_with = "serialize_display")]
        version: VersionSpec,
        path: String,
    },
    /// Nothing satisfies the reference; strip it.
    Remove,
}

fn serialize_display<S: serde::Serializer>(
    version: &VersionSpec,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(version)
}

impl Resolution {
    /// Literal text the reference is rewritten to, or `None` for removal.
    pub fn replacement(&self) -> Option<String> {
        match self {
            Resolution::Local { path } => Some(format!("{}:/{}", SELF_REF, path)),
            Resolution::External {
                duplicate_id,
                version,
                path,
            } => Some(format!("{}.{}:/{}", duplicate_id, version, path)),
            Resolution::Remove => None,
        }
    }
}

/// One analyzed reference. `key` is the token to replace, or `None` when the
/// reference is valid as written and only tracked for version consolidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub key: Option<String>,
    pub resolution: Resolution,
}

/// Everything needed to rewrite one package.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairPlan {
    pub package_id: String,
    /// Token to replacement text; `None` strips the reference.
    pub replacements: BTreeMap<String, Option<String>>,
    /// Package ids the content references once repaired.
    pub used_packages: BTreeSet<String>,
}

impl RepairPlan {
    pub fn is_empty(&self) -> bool {
        self.replacements.is_empty()
    }

    /// Tokens that will be stripped.
    pub fn removals(&self) -> Vec<&str> {
        self.replacements
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Stripped tokens naming inline scene elements, which need atom removal.
    pub fn element_removals(&self) -> BTreeSet<String> {
        self.removals()
            .into_iter()
            .filter(|key| rewriter::is_element(key))
            .map(str::to_string)
            .collect()
    }

    /// Stripped tokens that cannot be removed safely.
    pub fn unsupported(&self) -> Vec<String> {
        self.removals()
            .into_iter()
            .filter(|key| !rewriter::is_element(key) && !rewriter::is_strippable(key))
            .map(str::to_string)
            .collect()
    }
}

pub struct Analyzer<'a> {
    packages: &'a BTreeMap<String, Package>,
    graph: &'a DependencyGraph,
    index: &'a RepairIndex,
    fuzzy_threshold: usize,
    compatible_authors: Vec<String>,
}

impl<'a> Analyzer<'a> {
    pub fn new(
        packages: &'a BTreeMap<String, Package>,
        graph: &'a DependencyGraph,
        index: &'a RepairIndex,
    ) -> Self {
        Analyzer {
            packages,
            graph,
            index,
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
            compatible_authors: BACKWARD_COMPATIBLE_AUTHORS
                .iter()
                .map(|a| a.to_string())
                .collect(),
        }
    }

    pub fn fuzzy_threshold(mut self, threshold: usize) -> Self {
        self.fuzzy_threshold = threshold;
        self
    }

    pub fn compatible_authors(mut self, authors: &[String]) -> Self {
        self.compatible_authors = authors.to_vec();
        self
    }

    /// Builds the repair plan for `package`, which must come from a full scan.
    pub fn plan(&self, package: &Package) -> RepairPlan {
        let mut mappings = self.classify(package);
        let package_versions = versions_by_package(&mappings);
        for (duplicate_id, versions) in &package_versions {
            if versions.len() > 1 {
                self.consolidate(&mut mappings, duplicate_id, versions);
            }
        }

        let mut plan = RepairPlan {
            package_id: package.package_id(),
            ..RepairPlan::default()
        };
        for mapping in mappings {
            if let Resolution::External {
                duplicate_id,
                version,
                ..
            } = &mapping.resolution
            {
                plan.used_packages
                    .insert(format!("{}.{}", duplicate_id, version));
            }
            let Some(key) = mapping.key else {
                continue;
            };
            let replacement = mapping.resolution.replacement();
            if replacement.as_deref() != Some(key.as_str()) {
                plan.replacements.insert(key, replacement);
            }
        }
        plan
    }

    /// Maps every reference of `package` to its resolution.
    pub fn classify(&self, package: &Package) -> Vec<Mapping> {
        package
            .references()
            .into_iter()
            .filter_map(|reference| self.classify_reference(package, reference))
            .collect()
    }

    fn classify_reference(&self, package: &Package, reference: Reference) -> Option<Mapping> {
        let own_id = package.package_id();
        let key = reference.token();
        let is_self = reference.is_self();
        let path = reference.path;

        if package.contains_path(&path) {
            if reference.target == SELF_REF || reference.target == own_id {
                return None;
            }
            return Some(Mapping {
                key: Some(key),
                resolution: Resolution::Local { path },
            });
        }

        if let Some(target) = self.lookup(&reference.target)
            && target.contains_path(&path)
        {
            let (key, version) = if self.pin_version(target) {
                (Some(key), VersionSpec::Exact(target.version()))
            } else if self.promote_to_latest(&reference.target, &path) {
                (Some(key), VersionSpec::Latest)
            } else if package::split_reference(&reference.target)
                .is_some_and(|(_, v)| v == VersionSpec::Latest)
            {
                (None, VersionSpec::Latest)
            } else {
                (None, VersionSpec::Exact(target.version()))
            };
            return Some(Mapping {
                key,
                resolution: Resolution::External {
                    duplicate_id: target.duplicate_id(),
                    version,
                    path,
                },
            });
        }

        let resolution = match self.find_replacement(package, &path, is_self) {
            None => Resolution::Remove,
            Some(found) if found.package_id == own_id => Resolution::Local { path: found.path },
            Some(found) => match package::split_reference(&found.package_id) {
                Some((duplicate_id, VersionSpec::Exact(v))) => {
                    let version = if self.promote_to_latest(&found.package_id, &found.path) {
                        VersionSpec::Latest
                    } else {
                        VersionSpec::Exact(v)
                    };
                    Resolution::External {
                        duplicate_id: duplicate_id.to_string(),
                        version,
                        path: found.path,
                    }
                }
                _ => Resolution::Remove,
            },
        };
        Some(Mapping {
            key: Some(key),
            resolution,
        })
    }

    /// Repair-index match first, then, for same-package references only, a
    /// typo match among the package's own files.
    fn find_replacement(&self, package: &Package, path: &str, is_self: bool) -> Option<Candidate> {
        self.index.find_replacement(path).or_else(|| {
            if !is_self {
                return None;
            }
            repair_index::find_fuzzy_file_match(
                path,
                &package.package_id(),
                &package.includes(),
                self.fuzzy_threshold,
            )
        })
    }

    fn lookup(&self, dependency: &str) -> Option<&'a Package> {
        let id = self.graph.resolve(dependency)?;
        self.packages.get(&id)
    }

    /// Plugin code is not assumed compatible across versions unless its
    /// author is allow-listed.
    fn pin_version(&self, target: &Package) -> bool {
        target.content_type == ContentType::Plugin
            && !self.compatible_authors.iter().any(|a| a == target.author())
    }

    /// An exact reference may become `.latest` when the newest stored
    /// version still ships the file.
    fn promote_to_latest(&self, dependency: &str, path: &str) -> bool {
        let Some((_, VersionSpec::Exact(_))) = package::split_reference(dependency) else {
            return false;
        };
        let Some(target) = self.lookup(dependency) else {
            return false;
        };
        if self.pin_version(target) {
            return false;
        }
        self.graph
            .resolve(&package::as_latest(dependency))
            .and_then(|id| self.packages.get(&id))
            .is_some_and(|latest| latest.contains_path(path))
    }

    /// Collapses every reference to `duplicate_id` onto one version when a
    /// single stored version ships all referenced files.
    fn consolidate(
        &self,
        mappings: &mut [Mapping],
        duplicate_id: &str,
        versions: &BTreeSet<VersionSpec>,
    ) {
        let files: BTreeSet<&str> = mappings
            .iter()
            .filter_map(|m| match &m.resolution {
                Resolution::External {
                    duplicate_id: d,
                    path,
                    ..
                } if d == duplicate_id => Some(path.as_str()),
                _ => None,
            })
            .collect();

        let mut ordered: Vec<(u32, VersionSpec)> = versions
            .iter()
            .filter_map(|v| {
                let id = self.graph.resolve(&format!("{}.{}", duplicate_id, v))?;
                Some((self.packages.get(&id)?.version(), *v))
            })
            .collect();
        ordered.sort();

        let has_code = files.iter().any(|f| is_code(f));
        let candidates: Vec<(u32, VersionSpec)> = if has_code {
            let author = duplicate_id.split('.').next().unwrap_or_default();
            if self.compatible_authors.iter().any(|a| a == author) {
                ordered
            } else {
                ordered.into_iter().rev().collect()
            }
        } else {
            ordered.into_iter().next_back().into_iter().collect()
        };

        let chosen = candidates.into_iter().find(|(version, _)| {
            let id = format!("{}.{}", duplicate_id, version);
            self.packages
                .get(&id)
                .is_some_and(|p| files.iter().all(|f| p.contains_path(f)))
        });
        let Some((_, chosen)) = chosen else {
            return;
        };

        for mapping in mappings.iter_mut() {
            let Resolution::External {
                duplicate_id: d,
                version,
                path,
            } = &mut mapping.resolution
            else {
                continue;
            };
            if d.as_str() != duplicate_id {
                continue;
            }
            if mapping.key.is_none() {
                mapping.key = Some(format!("{}.{}:/{}", d, version, path));
            }
            *version = chosen;
        }
    }
}

fn versions_by_package(mappings: &[Mapping]) -> BTreeMap<String, BTreeSet<VersionSpec>> {
    let mut versions: BTreeMap<String, BTreeSet<VersionSpec>> = BTreeMap::new();
    for mapping in mappings {
        if let Resolution::External {
            duplicate_id,
            version,
            ..
        } = &mapping.resolution
        {
            versions
                .entry(duplicate_id.clone())
                .or_default()
                .insert(*version);
        }
    }
    versions
}

fn is_code(path: &str) -> bool {
    package::extension(path).is_some_and(|ext| CODE_EXTENSIONS.contains(&ext.as_str()))
}
