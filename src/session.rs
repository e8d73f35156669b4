//! Repair sessions.
//!
//! A [`Session`] freezes the dependency graph and repair index for one pass
//! over the store. Repairs rewrite archives on disk but never touch the
//! session's snapshot; refresh the store afterwards to pick the changes up.

use crate::analyzer::{Analyzer, BACKWARD_COMPATIBLE_AUTHORS, DEFAULT_FUZZY_THRESHOLD, RepairPlan};
use crate::error::{Result, VarError};
use crate::graph::{ClosureMode, DependencyGraph};
use crate::package::{Package, ScanDepth};
use crate::repair_index::RepairIndex;
use crate::rewriter;
use crate::store::PackageStore;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, error, info, warn};

pub const DEFAULT_TOP_AUTHORS: usize = 50;

/// Entries kept in each most-referenced list of a [`HealthReport`].
pub const HEALTH_TOP_REFERENCES: usize = 10;

/// What to do when a repair would strip references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemovalPolicy {
    /// Ask through [`Confirm`].
    #[default]
    Confirm,
    /// Remove without asking.
    Allow,
    /// Leave the package untouched.
    Skip,
}

#[derive(Debug, Clone)]
pub struct RepairSettings {
    pub fuzzy_threshold: usize,
    pub top_authors: usize,
    pub backward_compatible_authors: Vec<String>,
    pub removal: RemovalPolicy,
    /// Never reported as unused.
    pub favorites: Vec<String>,
}

impl Default for RepairSettings {
    fn default() -> Self {
        RepairSettings {
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
            top_authors: DEFAULT_TOP_AUTHORS,
            backward_compatible_authors: BACKWARD_COMPATIBLE_AUTHORS
                .iter()
                .map(|a| a.to_string())
                .collect(),
            removal: RemovalPolicy::default(),
            favorites: Vec::new(),
        }
    }
}

/// Yes/no gate before references are stripped from a package.
pub trait Confirm {
    fn confirm(&self, package_id: &str, removals: &[&str]) -> bool;
}

/// Accepts every removal.
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _package_id: &str, _removals: &[&str]) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Removal was refused at the confirmation prompt.
    Declined,
    /// Removals are disabled by [`RemovalPolicy::Skip`].
    RemovalsSkipped,
    /// The package type carries no JSON content to repair.
    NotRepairable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::Declined => "removal declined",
            SkipReason::RemovalsSkipped => "removals disabled",
            SkipReason::NotRepairable => "content type is not repairable",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepairOutcome {
    Unchanged,
    Repaired { replaced: usize, removed: usize },
    MetadataUpdated { added: usize, removed: usize },
    Skipped { reason: SkipReason },
}

impl fmt::Display for RepairOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepairOutcome::Unchanged => f.write_str("nothing to do"),
            RepairOutcome::Repaired { replaced, removed } => {
                write!(f, "replaced {}, removed {}", replaced, removed)
            }
            RepairOutcome::MetadataUpdated { added, removed } => {
                write!(f, "adding {}, removing {}", added, removed)
            }
            RepairOutcome::Skipped { reason } => write!(f, "skipped: {}", reason),
        }
    }
}

/// Per-package results of a batch repair.
#[derive(Debug, Default, Serialize)]
pub struct RepairSummary {
    pub repaired: Vec<String>,
    pub unchanged: Vec<String>,
    pub skipped: Vec<(String, SkipReason)>,
    pub failed: Vec<(String, String)>,
}

impl RepairSummary {
    fn record(&mut self, package_id: &str, result: Result<RepairOutcome>) {
        let id = package_id.to_string();
        match result {
            Ok(RepairOutcome::Unchanged) => self.unchanged.push(id),
            Ok(RepairOutcome::Skipped { reason }) => self.skipped.push((id, reason)),
            Ok(_) => self.repaired.push(id),
            Err(err) => {
                error!(package = %package_id, error = %err, "repair failed");
                self.failed.push((id, err.to_string()));
            }
        }
    }
}

/// Store-wide report.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub packages: usize,
    pub total_size: u64,
    /// Missing dependency to the packages that use it.
    pub missing: BTreeMap<String, BTreeSet<String>>,
    pub unversioned_duplicates: BTreeSet<String>,
    pub unoptimized: BTreeSet<String>,
    pub broken: BTreeSet<String>,
    pub unused: BTreeSet<String>,
    /// Most referenced packages with their reference counts.
    pub top_packages: Vec<(String, usize)>,
    /// Most referenced `(package, path)` files with their reference counts.
    pub top_files: Vec<((String, String), usize)>,
}

pub struct Session<'a> {
    store: &'a PackageStore,
    settings: RepairSettings,
    graph: DependencyGraph,
    index: RepairIndex,
}

impl<'a> Session<'a> {
    /// Builds the graph and repair index from the store's current state.
    ///
    /// A quick-scanned store has no used dependencies, so the graph falls
    /// back to declared dependencies.
    pub fn new(store: &'a PackageStore, settings: RepairSettings) -> Self {
        let mode = match store.depth() {
            ScanDepth::Full => ClosureMode::Full,
            ScanDepth::Quick => ClosureMode::Shallow,
        };
        let graph = DependencyGraph::build(store.iter(), mode);
        let index = RepairIndex::build(store.iter(), &graph, settings.top_authors);
        debug!(packages = graph.len(), entries = index.len(), "session ready");
        Session {
            store,
            settings,
            graph,
            index,
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn index(&self) -> &RepairIndex {
        &self.index
    }

    fn analyzer(&self) -> Analyzer<'_> {
        Analyzer::new(self.store.packages(), &self.graph, &self.index)
            .fuzzy_threshold(self.settings.fuzzy_threshold)
            .compatible_authors(&self.settings.backward_compatible_authors)
    }

    /// Plans a repair from a fresh scan of the archive.
    pub fn plan(&self, package_id: &str) -> Result<RepairPlan> {
        let package = self.store.rescan(package_id)?;
        Ok(self.analyzer().plan(&package))
    }

    /// Repairable packages with a non-empty plan. Packages that fail to scan
    /// are logged and left out.
    pub fn find_broken(&self) -> BTreeMap<String, RepairPlan> {
        let mut broken = BTreeMap::new();
        for package in self.store.iter().filter(|p| p.content_type.is_repairable()) {
            let id = package.package_id();
            match self.plan(&id) {
                Ok(plan) if !plan.is_empty() => {
                    broken.insert(id, plan);
                }
                Ok(_) => {}
                Err(err) => warn!(package = %id, error = %err, "could not analyze"),
            }
        }
        broken
    }

    /// Repairs one package in place.
    ///
    /// Fails with [`VarError::UnsupportedRepair`] when a reference that must
    /// go cannot be stripped safely; the archive is then left untouched.
    pub fn repair(&self, package_id: &str, confirm: &dyn Confirm) -> Result<RepairOutcome> {
        let package = self.store.rescan(package_id)?;
        if !package.content_type.is_repairable() {
            return Ok(RepairOutcome::Skipped {
                reason: SkipReason::NotRepairable,
            });
        }

        let plan = self.analyzer().plan(&package);
        if plan.is_empty() {
            return Ok(RepairOutcome::Unchanged);
        }

        let unsupported = plan.unsupported();
        if !unsupported.is_empty() {
            return Err(VarError::UnsupportedRepair {
                package: package_id.to_string(),
                references: unsupported,
            });
        }

        let removals = plan.removals();
        if !removals.is_empty() {
            for reference in &removals {
                warn!(package = %package_id, reference = %reference, "reference will be removed");
            }
            let proceed = match self.settings.removal {
                RemovalPolicy::Allow => true,
                RemovalPolicy::Skip => {
                    return Ok(RepairOutcome::Skipped {
                        reason: SkipReason::RemovalsSkipped,
                    });
                }
                RemovalPolicy::Confirm => confirm.confirm(package_id, &removals),
            };
            if !proceed {
                info!(package = %package_id, "repair declined");
                return Ok(RepairOutcome::Skipped {
                    reason: SkipReason::Declined,
                });
            }
        }

        self.commit(&package, &plan)?;
        let removed = removals.len();
        let outcome = RepairOutcome::Repaired {
            replaced: plan.replacements.len() - removed,
            removed,
        };
        info!(package = %package_id, "{}", outcome);
        Ok(outcome)
    }

    fn commit(&self, package: &Package, plan: &RepairPlan) -> Result<()> {
        for (key, replacement) in &plan.replacements {
            debug!(
                package = %plan.package_id,
                from = %key,
                to = replacement.as_deref().unwrap_or(""),
                "replacing reference"
            );
        }
        rewriter::apply_plan(&package.file_path(self.store.root()), package, plan)
    }

    /// Rewrites the manifest so its dependency list equals the package's
    /// used dependencies.
    pub fn repair_metadata(&self, package_id: &str) -> Result<RepairOutcome> {
        let package = self.store.rescan(package_id)?;
        let used = package.used_dependencies();
        let added = used.difference(&package.declared_dependencies).count();
        let removed = package.declared_dependencies.difference(&used).count();
        if added == 0 && removed == 0 {
            return Ok(RepairOutcome::Unchanged);
        }

        rewriter::apply_metadata(&package.file_path(self.store.root()), &package, &used)?;
        let outcome = RepairOutcome::MetadataUpdated { added, removed };
        info!(package = %package_id, "updating dependencies: {}", outcome);
        Ok(outcome)
    }

    /// Repairs each package, logging failures and carrying on.
    pub fn repair_many<'i>(
        &self,
        package_ids: impl IntoIterator<Item = &'i str>,
        confirm: &dyn Confirm,
    ) -> RepairSummary {
        let mut summary = RepairSummary::default();
        for id in package_ids {
            summary.record(id, self.repair(id, confirm));
        }
        summary
    }

    pub fn repair_metadata_many<'i>(
        &self,
        package_ids: impl IntoIterator<Item = &'i str>,
    ) -> RepairSummary {
        let mut summary = RepairSummary::default();
        for id in package_ids {
            summary.record(id, self.repair_metadata(id));
        }
        summary
    }

    /// Missing dependencies and the packages that use them.
    pub fn missing(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.graph
            .missing()
            .into_iter()
            .map(|dependency| {
                let users = self
                    .graph
                    .required_by(&dependency)
                    .cloned()
                    .unwrap_or_default();
                (dependency, users)
            })
            .collect()
    }

    /// Unused packages, favorites excluded. Non-empty `filters` keep only
    /// ids containing one of them.
    pub fn unused(&self, filters: &[String]) -> BTreeSet<String> {
        self.graph
            .unused(&self.settings.favorites)
            .into_iter()
            .filter(|id| filters.is_empty() || filters.iter().any(|f| id.contains(f.as_str())))
            .collect()
    }

    /// Dependencies of `package_id`: the declared list when `shallow`,
    /// otherwise the session closure with redundant versions dropped.
    pub fn dependencies(&self, package_id: &str, shallow: bool) -> Result<BTreeSet<String>> {
        let package = self.store.require(package_id)?;
        if shallow {
            return Ok(package.declared_dependencies.clone());
        }
        Ok(self
            .graph
            .required_dependencies(package_id)
            .map(|deps| self.graph.dedupe(deps))
            .unwrap_or_default())
    }

    /// Packages that depend on `package_id`.
    pub fn users(&self, package_id: &str) -> BTreeSet<String> {
        self.graph
            .required_by(package_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            packages: self.store.len(),
            total_size: self.store.total_size(),
            missing: self.missing(),
            unversioned_duplicates: self.store.find_unversioned_duplicates(),
            unoptimized: self.store.find_unoptimized(),
            broken: self.find_broken().into_keys().collect(),
            unused: self.unused(&[]),
            top_packages: truncated(self.graph.reference_package_uses(), HEALTH_TOP_REFERENCES),
            top_files: truncated(self.graph.reference_file_uses(), HEALTH_TOP_REFERENCES),
        }
    }
}

fn truncated<T>(mut items: Vec<T>, n: usize) -> Vec<T> {
    items.truncate(n);
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreOptions;
    use crate::test_support::{VarBuilder, read_entry};
    use std::path::Path;

    struct Refuse;

    impl Confirm for Refuse {
        fn confirm(&self, _package_id: &str, _removals: &[&str]) -> bool {
            false
        }
    }

    fn store(root: &Path) -> PackageStore {
        let mut store = PackageStore::open(root, StoreOptions::default()).unwrap();
        store.refresh().unwrap();
        store
    }

    fn settings(removal: RemovalPolicy) -> RepairSettings {
        RepairSettings {
            removal,
            ..RepairSettings::default()
        }
    }

    fn scene_with_missing_plugin(root: &Path) -> std::path::PathBuf {
        VarBuilder::new("Me.Scene.1")
            .dependency("Author.Pkg.1")
            .file(
                "Saves/scene/a.json",
                "{\n\"plugin#0\":\"Author.Pkg.1:/Scripts/x.cs\"\n}",
            )
            .write_in(root)
    }

    // ============================================================================
    // Repair
    // ============================================================================

    #[test]
    fn unresolvable_plugin_reference_is_blanked() {
        let dir = tempfile::tempdir().unwrap();
        let path = scene_with_missing_plugin(dir.path());
        let store = store(dir.path());
        let session = Session::new(&store, settings(RemovalPolicy::Allow));

        let outcome = session.repair("Me.Scene.1", &AssumeYes).unwrap();
        assert_eq!(
            outcome,
            RepairOutcome::Repaired {
                replaced: 0,
                removed: 1
            }
        );

        let content: serde_json::Value =
            serde_json::from_str(&read_entry(&path, "Saves/scene/a.json")).unwrap();
        assert_eq!(content["plugin#0"], "");
        let manifest: serde_json::Value =
            serde_json::from_str(&read_entry(&path, "meta.json")).unwrap();
        assert_eq!(manifest["dependencies"], serde_json::json!({}));
    }

    #[test]
    fn declined_removal_leaves_archive_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = scene_with_missing_plugin(dir.path());
        let before = std::fs::read(&path).unwrap();
        let store = store(dir.path());

        let session = Session::new(&store, settings(RemovalPolicy::Confirm));
        assert_eq!(
            session.repair("Me.Scene.1", &Refuse).unwrap(),
            RepairOutcome::Skipped {
                reason: SkipReason::Declined
            }
        );

        let session = Session::new(&store, settings(RemovalPolicy::Skip));
        assert_eq!(
            session.repair("Me.Scene.1", &AssumeYes).unwrap(),
            RepairOutcome::Skipped {
                reason: SkipReason::RemovalsSkipped
            }
        );
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn unsupported_removal_aborts_repair() {
        let dir = tempfile::tempdir().unwrap();
        let path = VarBuilder::new("Me.Scene.1")
            .file(
                "Saves/scene/a.json",
                "{\n\"asset\":\"Gone.Pkg.1:/Custom/Assets/x.assetbundle\"\n}",
            )
            .write_in(dir.path());
        let before = std::fs::read(&path).unwrap();
        let store = store(dir.path());
        let session = Session::new(&store, settings(RemovalPolicy::Allow));

        let err = session.repair("Me.Scene.1", &AssumeYes).unwrap_err();
        assert!(matches!(err, VarError::UnsupportedRepair { ref references, .. }
            if references == &["Gone.Pkg.1:/Custom/Assets/x.assetbundle".to_string()]));
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn relocated_reference_is_rewritten_and_repair_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        VarBuilder::new("Tex.Pack.2")
            .file("Custom/Atom/Person/Textures/skin.png", "png")
            .write_in(dir.path());
        let path = VarBuilder::new("Me.Scene.1")
            .dependency("Old.Pack.1")
            .file(
                "Saves/scene/a.json",
                "{\n\"texture\":\"Old.Pack.1:/Custom/Atom/Person/Textures/skin.png\"\n}",
            )
            .write_in(dir.path());

        let mut store = store(dir.path());
        let session = Session::new(&store, RepairSettings::default());
        let plan = session.plan("Me.Scene.1").unwrap();
        assert_eq!(
            plan.replacements["Old.Pack.1:/Custom/Atom/Person/Textures/skin.png"].as_deref(),
            Some("Tex.Pack.latest:/Custom/Atom/Person/Textures/skin.png")
        );
        session.repair("Me.Scene.1", &AssumeYes).unwrap();

        let manifest: serde_json::Value =
            serde_json::from_str(&read_entry(&path, "meta.json")).unwrap();
        assert_eq!(
            manifest["dependencies"].as_object().unwrap().keys().collect::<Vec<_>>(),
            vec!["Tex.Pack.latest"]
        );

        store.refresh().unwrap();
        let session = Session::new(&store, RepairSettings::default());
        assert!(session.plan("Me.Scene.1").unwrap().is_empty());
        assert_eq!(
            session.repair("Me.Scene.1", &AssumeYes).unwrap(),
            RepairOutcome::Unchanged
        );
    }

    #[test]
    fn non_repairable_package_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        VarBuilder::new("Tex.Pack.1")
            .file("Custom/Atom/Person/Textures/skin.png", "png")
            .write_in(dir.path());
        let store = store(dir.path());
        let session = Session::new(&store, RepairSettings::default());
        assert_eq!(
            session.repair("Tex.Pack.1", &AssumeYes).unwrap(),
            RepairOutcome::Skipped {
                reason: SkipReason::NotRepairable
            }
        );
    }

    #[test]
    fn batch_repair_collects_failures() {
        let dir = tempfile::tempdir().unwrap();
        scene_with_missing_plugin(dir.path());
        let store = store(dir.path());
        let session = Session::new(&store, settings(RemovalPolicy::Allow));

        let summary = session.repair_many(["Me.Scene.1", "No.Such.1"], &AssumeYes);
        assert_eq!(summary.repaired, vec!["Me.Scene.1"]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "No.Such.1");
    }

    // ============================================================================
    // Metadata
    // ============================================================================

    #[test]
    fn metadata_repair_matches_used_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let path = VarBuilder::new("Me.Scene.1")
            .dependency("X.Y.1")
            .file(
                "Saves/scene/a.json",
                "{\n\"a\": \"X.Y.1:/Custom/a.jpg\",\n\"b\": \"Z.W.latest:/Custom/b.jpg\"\n}",
            )
            .write_in(dir.path());
        let store = store(dir.path());
        let session = Session::new(&store, RepairSettings::default());

        let outcome = session.repair_metadata("Me.Scene.1").unwrap();
        assert_eq!(outcome.to_string(), "adding 1, removing 0");

        let manifest: serde_json::Value =
            serde_json::from_str(&read_entry(&path, "meta.json")).unwrap();
        assert_eq!(
            manifest["dependencies"].as_object().unwrap().keys().collect::<Vec<_>>(),
            vec!["X.Y.1", "Z.W.latest"]
        );
        assert_eq!(
            manifest["contentList"],
            serde_json::json!(["Saves/scene/a.json"])
        );
        assert_eq!(
            session.repair_metadata("Me.Scene.1").unwrap(),
            RepairOutcome::Unchanged
        );
    }

    // ============================================================================
    // Reports
    // ============================================================================

    #[test]
    fn health_reports_missing_and_unused() {
        let dir = tempfile::tempdir().unwrap();
        scene_with_missing_plugin(dir.path());
        VarBuilder::new("Lonely.Tex.1")
            .file("Custom/Atom/Person/Textures/t.png", "png")
            .write_in(dir.path());
        VarBuilder::new("Fav.Tex.1")
            .file("Custom/Atom/Person/Textures/f.png", "png")
            .write_in(dir.path());
        let store = store(dir.path());
        let session = Session::new(
            &store,
            RepairSettings {
                favorites: vec!["Fav".to_string()],
                ..RepairSettings::default()
            },
        );

        let report = session.health();
        assert_eq!(report.packages, 3);
        assert_eq!(
            report.missing,
            BTreeMap::from([(
                "Author.Pkg.1".to_string(),
                BTreeSet::from(["Me.Scene.1".to_string()])
            )])
        );
        assert!(report.broken.contains("Me.Scene.1"));
        assert!(report.unused.contains("Lonely.Tex.1"));
        assert!(!report.unused.contains("Fav.Tex.1"));
        assert_eq!(report.top_packages, vec![("Author.Pkg.1".to_string(), 1)]);
        assert_eq!(
            report.top_files,
            vec![(
                ("Author.Pkg.1".to_string(), "Scripts/x.cs".to_string()),
                1
            )]
        );
        assert_eq!(
            session.unused(&["Scene".to_string()]),
            BTreeSet::from(["Me.Scene.1".to_string()])
        );
    }

    #[test]
    fn dependencies_and_users() {
        let dir = tempfile::tempdir().unwrap();
        VarBuilder::new("Tex.Pack.1")
            .file("Custom/Atom/Person/Textures/skin.png", "png")
            .write_in(dir.path());
        VarBuilder::new("Me.Scene.1")
            .dependency("Stale.Dep.1")
            .file(
                "Saves/scene/a.json",
                "{\n\"t\":\"Tex.Pack.latest:/Custom/Atom/Person/Textures/skin.png\"\n}",
            )
            .write_in(dir.path());
        let store = store(dir.path());
        let session = Session::new(&store, RepairSettings::default());

        assert_eq!(
            session.dependencies("Me.Scene.1", false).unwrap(),
            BTreeSet::from(["Tex.Pack.latest".to_string()])
        );
        assert_eq!(
            session.dependencies("Me.Scene.1", true).unwrap(),
            BTreeSet::from(["Stale.Dep.1".to_string()])
        );
        assert_eq!(
            session.users("Tex.Pack.1"),
            BTreeSet::from(["Me.Scene.1".to_string()])
        );
        assert!(matches!(
            session.dependencies("No.Such.1", false),
            Err(VarError::UnknownPackage(_))
        ));
    }

    #[test]
    fn quick_store_uses_declared_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        VarBuilder::new("Me.Scene.1")
            .dependency("Tex.Pack.1")
            .file(
                "Saves/scene/a.json",
                "{\n\"t\":\"Other.Pack.1:/Custom/Atom/Person/Textures/skin.png\"\n}",
            )
            .write_in(dir.path());
        let options = StoreOptions {
            depth: ScanDepth::Quick,
            ..StoreOptions::default()
        };
        let mut store = PackageStore::open(dir.path(), options).unwrap();
        store.refresh().unwrap();

        let session = Session::new(&store, RepairSettings::default());
        assert_eq!(session.graph().mode(), ClosureMode::Shallow);
        assert_eq!(
            session.dependencies("Me.Scene.1", false).unwrap(),
            BTreeSet::from(["Tex.Pack.1".to_string()])
        );
        assert_eq!(
            session.missing().into_keys().collect::<Vec<_>>(),
            vec!["Tex.Pack.1"]
        );
    }
}
