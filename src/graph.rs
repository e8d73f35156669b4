//! Dependency graph over a set of packages.
//!
//! Built once from an immutable view of the store. Resolves `.latest`
//! references, computes per-package dependency closures, the reverse
//! "required by" index, and reference usage statistics.

use crate::package::{self, Package, VersionSpec};
use crate::scanner::{SELF_REF, SELF_UNREF};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// How `required_dependencies` is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureMode {
    /// The package's own declared dependencies, unexpanded.
    Shallow,
    /// Fixpoint closure over used dependencies.
    Full,
}

#[derive(Debug)]
pub struct DependencyGraph {
    mode: ClosureMode,
    versions: HashMap<String, BTreeSet<u32>>,
    used: BTreeMap<String, BTreeSet<String>>,
    required: BTreeMap<String, BTreeSet<String>>,
    required_by: BTreeMap<String, BTreeSet<String>>,
    file_uses: BTreeMap<(String, String), usize>,
}

impl DependencyGraph {
    pub fn build<'a>(packages: impl IntoIterator<Item = &'a Package>, mode: ClosureMode) -> Self {
        let mut graph = DependencyGraph {
            mode,
            versions: HashMap::new(),
            used: BTreeMap::new(),
            required: BTreeMap::new(),
            required_by: BTreeMap::new(),
            file_uses: BTreeMap::new(),
        };

        let mut declared = BTreeMap::new();
        for package in packages {
            let id = package.package_id();
            graph
                .versions
                .entry(package.duplicate_id())
                .or_default()
                .insert(package.version());
            graph.used.insert(id.clone(), package.used_dependencies());
            declared.insert(id, package.declared_dependencies.clone());

            for reference in package.references() {
                if reference.target == SELF_REF || reference.target == SELF_UNREF {
                    continue;
                }
                *graph
                    .file_uses
                    .entry((reference.target, reference.path))
                    .or_default() += 1;
            }
        }

        let ids: Vec<String> = graph.used.keys().cloned().collect();
        for id in ids {
            let required = match mode {
                ClosureMode::Shallow => declared.get(&id).cloned().unwrap_or_default(),
                ClosureMode::Full => graph.closure(&id),
            };
            graph.required.insert(id, required);
        }

        let edges = match mode {
            ClosureMode::Shallow => &declared,
            ClosureMode::Full => &graph.used,
        };
        let mut required_by: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (id, deps) in edges {
            for dep in deps {
                let target = graph.resolve(dep).unwrap_or_else(|| dep.clone());
                required_by.entry(target).or_default().insert(id.clone());
            }
        }
        graph.required_by = required_by;

        graph
    }

    pub fn mode(&self) -> ClosureMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    pub fn contains(&self, package_id: &str) -> bool {
        self.used.contains_key(package_id)
    }

    pub fn max_version(&self, duplicate_id: &str) -> Option<u32> {
        self.versions.get(duplicate_id)?.last().copied()
    }

    /// Resolves a dependency id to a stored package id.
    ///
    /// `author.name.latest` becomes the highest stored version. Returns `None`
    /// for anything that does not name a stored package.
    pub fn resolve(&self, dependency: &str) -> Option<String> {
        let (duplicate_id, version) = package::split_reference(dependency)?;
        let id = match version {
            VersionSpec::Latest => format!("{}.{}", duplicate_id, self.max_version(duplicate_id)?),
            VersionSpec::Exact(_) => dependency.to_string(),
        };
        self.contains(&id).then_some(id)
    }

    /// Expands used dependencies until no new ids appear. Unresolvable ids
    /// stay in the set but are not expanded.
    fn closure(&self, package_id: &str) -> BTreeSet<String> {
        let mut dependencies = self.used.get(package_id).cloned().unwrap_or_default();
        loop {
            let mut additional = BTreeSet::new();
            for dependency in &dependencies {
                let Some(resolved) = self.resolve(dependency) else {
                    continue;
                };
                if let Some(used) = self.used.get(&resolved) {
                    additional.extend(used.iter().cloned());
                }
            }
            let before = dependencies.len();
            dependencies.extend(additional);
            if dependencies.len() == before {
                return dependencies;
            }
        }
    }

    /// Dependencies required by `package_id` in this graph's [`ClosureMode`].
    pub fn required_dependencies(&self, package_id: &str) -> Option<&BTreeSet<String>> {
        self.required.get(package_id)
    }

    /// Packages whose dependency edges point at `package_id`.
    pub fn required_by(&self, package_id: &str) -> Option<&BTreeSet<String>> {
        self.required_by.get(package_id)
    }

    pub fn is_required(&self, package_id: &str) -> bool {
        self.required_by
            .get(package_id)
            .is_some_and(|users| !users.is_empty())
    }

    /// Every dependency required by any package, `.latest` ids resolved to
    /// concrete versions. Unresolvable `.latest` ids are left out.
    pub fn unique_referenced(&self) -> BTreeSet<String> {
        let mut referenced = BTreeSet::new();
        for dependencies in self.required.values() {
            for dependency in dependencies {
                match package::split_reference(dependency) {
                    Some((_, VersionSpec::Latest)) => {
                        if let Some(resolved) = self.resolve(dependency) {
                            referenced.insert(resolved);
                        }
                    }
                    _ => {
                        referenced.insert(dependency.clone());
                    }
                }
            }
        }
        referenced
    }

    /// Required dependency ids that resolve to nothing in the store.
    pub fn missing(&self) -> BTreeSet<String> {
        self.required
            .values()
            .flatten()
            .filter(|dependency| self.resolve(dependency).is_none())
            .cloned()
            .collect()
    }

    /// Stored packages in nobody's required set.
    ///
    /// `favorites` entries match an author, a duplicate id or a package id.
    pub fn unused(&self, favorites: &[String]) -> BTreeSet<String> {
        let referenced = self.unique_referenced();
        self.used
            .keys()
            .filter(|id| !referenced.contains(*id))
            .filter(|id| !is_favorite(id, favorites))
            .cloned()
            .collect()
    }

    /// Drops redundant members of `{exact, latest}` pairs naming the same package.
    ///
    /// When the exact version is the newest stored one the `.latest` entry
    /// goes; otherwise the exact entry goes. With no stored versions the
    /// exact entry is kept.
    pub fn dedupe(&self, dependencies: &BTreeSet<String>) -> BTreeSet<String> {
        let mut drop = BTreeSet::new();
        for dependency in dependencies {
            let Some((duplicate_id, VersionSpec::Exact(version))) =
                package::split_reference(dependency)
            else {
                continue;
            };
            let latest = package::as_latest(dependency);
            if !dependencies.contains(&latest) {
                continue;
            }
            match self.max_version(duplicate_id) {
                Some(max) if version < max => drop.insert(dependency.clone()),
                _ => drop.insert(latest),
            };
        }
        dependencies.difference(&drop).cloned().collect()
    }

    /// `(target, path)` reference counts, most used first.
    pub fn reference_file_uses(&self) -> Vec<((String, String), usize)> {
        sorted_by_count(self.file_uses.iter().map(|(k, v)| (k.clone(), *v)))
    }

    pub fn reference_package_uses(&self) -> Vec<(String, usize)> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for ((target, _), uses) in &self.file_uses {
            *counts.entry(target.clone()).or_default() += uses;
        }
        sorted_by_count(counts)
    }

    pub fn reference_author_uses(&self) -> Vec<(String, usize)> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for ((target, _), uses) in &self.file_uses {
            let author = target.split('.').next().unwrap_or(target);
            *counts.entry(author.to_string()).or_default() += uses;
        }
        sorted_by_count(counts)
    }

    /// The `n` most referenced authors, best first.
    pub fn top_authors(&self, n: usize) -> Vec<String> {
        self.reference_author_uses()
            .into_iter()
            .take(n)
            .map(|(author, _)| author)
            .collect()
    }
}

fn is_favorite(package_id: &str, favorites: &[String]) -> bool {
    let author = package_id.split('.').next().unwrap_or_default();
    let duplicate_id = package_id.rsplit_once('.').map_or(package_id, |(d, _)| d);
    favorites
        .iter()
        .any(|f| f == author || f == duplicate_id || f == package_id)
}

/// Descending by count; ties keep key order.
fn sorted_by_count<K: Ord>(counts: impl IntoIterator<Item = (K, usize)>) -> Vec<(K, usize)> {
    let mut items: Vec<(K, usize)> = counts.into_iter().collect();
    items.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    items
}
