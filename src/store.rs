//! Package store.
//!
//! Owns the in-memory index of every package under a root directory,
//! persisted as a JSON snapshot for fast reloads. A refresh compares the
//! directory listing against the index: new archives are opened, archives
//! whose modification time or size changed are reopened, and vanished ones
//! are dropped. Moves and tagging rename archives and update their entry in
//! place.

use crate::archive::TEMP_ARCHIVE_NAME;
use crate::error::{Result, VarError};
use crate::package::{FileInfo, Package, PackageId, ScanDepth, VAR_EXTENSION};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

pub const DEFAULT_INDEX_FILE: &str = "remote_db.json";

/// Directory-name globs skipped while walking the store.
pub const DEFAULT_IGNORE: [&str; 4] = ["_image_lib", "repair_lib", "*_ignore*", ".*"];

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Snapshot file name under the root.
    pub index_file: String,
    pub depth: ScanDepth,
    pub ignore: Vec<String>,
    pub disable_save: bool,
    /// Draw a progress bar during refreshes.
    pub progress: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            index_file: DEFAULT_INDEX_FILE.to_string(),
            depth: ScanDepth::Full,
            ignore: DEFAULT_IGNORE.iter().map(|s| s.to_string()).collect(),
            disable_save: false,
            progress: false,
        }
    }
}

/// How [`PackageStore::relocate`] derives a package's new sub-directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubdirChange {
    /// Prepend a tag unless the sub-directory already contains it.
    Prefix(String),
    /// Append `_tag` unless the sub-directory already contains it.
    Suffix(String),
    /// Remove a tag from the sub-directory.
    Strip(String),
    /// Move to a fixed sub-directory.
    Set(String),
    /// Move to [`Package::preferred_subdirectory`].
    Preferred,
}

impl SubdirChange {
    /// New sub-directory for `package`, or `None` when it stays put.
    pub fn apply(&self, package: &Package) -> Option<String> {
        let current = package.sub_directory_str();
        let target = match self {
            SubdirChange::Prefix(tag) if !current.contains(tag.as_str()) => {
                format!("{}{}", tag, current)
            }
            SubdirChange::Suffix(tag) if !current.contains(tag.as_str()) => {
                format!("{}_{}", current, tag)
            }
            SubdirChange::Strip(tag) if current.contains(tag.as_str()) => {
                current.replace(tag.as_str(), "")
            }
            SubdirChange::Set(dir) => dir.clone(),
            SubdirChange::Preferred => package.preferred_subdirectory(),
            _ => return None,
        };
        (target != current).then_some(target)
    }
}

/// What a refresh changed.
#[derive(Debug, Default, Serialize)]
pub struct RefreshReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// `(file, error)` for archives that could not be indexed.
    pub failed: Vec<(String, String)>,
    pub temp_files_removed: usize,
}

impl RefreshReport {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.updated.is_empty() || !self.removed.is_empty()
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    rootpath: &'a Path,
    vars: Vec<&'a Package>,
}

#[derive(Deserialize)]
struct Snapshot {
    rootpath: PathBuf,
    vars: Vec<Package>,
}

#[derive(Debug)]
pub struct PackageStore {
    root: PathBuf,
    options: StoreOptions,
    ignore: Vec<glob::Pattern>,
    packages: BTreeMap<String, Package>,
}

impl PackageStore {
    /// Opens the store at `root`, loading the snapshot when one exists.
    ///
    /// A corrupt snapshot is discarded with a warning; the next refresh
    /// rebuilds the index from disk.
    pub fn open(root: impl Into<PathBuf>, options: StoreOptions) -> Result<Self> {
        let ignore = options
            .ignore
            .iter()
            .map(|pattern| {
                glob::Pattern::new(pattern).map_err(|source| VarError::IgnorePattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut store = PackageStore {
            root: root.into(),
            options,
            ignore,
            packages: BTreeMap::new(),
        };
        store.load();
        Ok(store)
    }

    fn load(&mut self) {
        let path = self.index_path();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                warn!(file = %path.display(), error = %err, "could not read store index");
                return;
            }
        };
        match serde_json::from_str::<Snapshot>(&text) {
            Ok(snapshot) => {
                if snapshot.rootpath != self.root {
                    debug!(
                        saved = %snapshot.rootpath.display(),
                        root = %self.root.display(),
                        "store index was saved for another root"
                    );
                }
                self.packages = snapshot
                    .vars
                    .into_iter()
                    .map(|p| (p.package_id(), p))
                    .collect();
                debug!(packages = self.packages.len(), "loaded store index");
            }
            Err(err) => {
                warn!(file = %path.display(), error = %err, "discarding corrupt store index");
            }
        }
    }

    /// Writes the snapshot unless saving is disabled.
    pub fn save(&self) -> Result<()> {
        if self.options.disable_save {
            return Ok(());
        }
        let snapshot = SnapshotRef {
            rootpath: &self.root,
            vars: self.packages.values().collect(),
        };
        std::fs::write(self.index_path(), serde_json::to_string(&snapshot)?)?;
        debug!(packages = self.packages.len(), "saved store index");
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(&self.options.index_file)
    }

    pub fn depth(&self) -> ScanDepth {
        self.options.depth
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn get(&self, package_id: &str) -> Option<&Package> {
        self.packages.get(package_id)
    }

    pub fn require(&self, package_id: &str) -> Result<&Package> {
        self.get(package_id)
            .ok_or_else(|| VarError::UnknownPackage(package_id.to_string()))
    }

    pub fn packages(&self) -> &BTreeMap<String, Package> {
        &self.packages
    }

    pub fn iter(&self) -> impl Iterator<Item = &Package> {
        self.packages.values()
    }

    pub fn total_size(&self) -> u64 {
        self.iter().map(|p| p.info.size).sum()
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.ignore.iter().any(|pattern| pattern.matches(name))
    }

    /// Every `.var` file under the root, ignored directories skipped.
    pub fn collect_var_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let walker = WalkDir::new(&self.root).into_iter().filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !entry.file_name().to_str().is_some_and(|n| self.is_ignored(n))
        });
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable store entry");
                    continue;
                }
            };
            if entry.file_type().is_file()
                && entry
                    .path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(VAR_EXTENSION))
            {
                files.push(entry.into_path());
            }
        }
        files.sort();
        files
    }

    /// Synchronizes the index with the directory tree.
    ///
    /// Per-archive failures are logged and collected in the report; they
    /// never stop the refresh.
    pub fn refresh(&mut self) -> Result<RefreshReport> {
        let mut report = RefreshReport::default();
        let mut files = self.collect_var_files();

        files.retain(|file| {
            if file.file_name().and_then(|n| n.to_str()) != Some(TEMP_ARCHIVE_NAME) {
                return true;
            }
            warn!(file = %file.display(), "removing leftover temp archive");
            match std::fs::remove_file(file) {
                Ok(()) => report.temp_files_removed += 1,
                Err(err) => error!(file = %file.display(), error = %err, "could not remove temp archive"),
            }
            false
        });

        let stats: Vec<(PathBuf, Result<FileInfo>)> = files
            .par_iter()
            .map(|file| (file.clone(), FileInfo::stat(file)))
            .collect();

        let on_disk: HashMap<PathBuf, FileInfo> = stats
            .into_iter()
            .filter_map(|(file, info)| match info {
                Ok(info) => Some((self.relative(&file), info)),
                Err(err) => {
                    report
                        .failed
                        .push((file.display().to_string(), err.to_string()));
                    None
                }
            })
            .collect();

        let vanished: Vec<String> = self
            .packages
            .iter()
            .filter(|(_, p)| !on_disk.contains_key(&p.relative_path))
            .map(|(id, _)| id.clone())
            .collect();
        for id in vanished {
            info!(package = %id, "removed from store");
            self.packages.remove(&id);
            report.removed.push(id);
        }

        let progress = self.progress_bar(on_disk.len() as u64);
        let mut relative_paths: Vec<&PathBuf> = on_disk.keys().collect();
        relative_paths.sort();
        for relative in relative_paths {
            progress.inc(1);
            let info = on_disk[relative];
            if let Err(err) = self.index_file(relative, info, &mut report) {
                warn!(file = %relative.display(), error = %err, "could not index archive");
                report
                    .failed
                    .push((relative.display().to_string(), err.to_string()));
            }
        }
        progress.finish_and_clear();

        if report.changed() {
            self.save()?;
        }
        info!(
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "store refreshed"
        );
        Ok(report)
    }

    fn index_file(&mut self, relative: &Path, info: FileInfo, report: &mut RefreshReport) -> Result<()> {
        let filename = relative
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| VarError::MalformedIdentifier(relative.display().to_string()))?;
        let id = PackageId::from_filename(filename)?.to_string();

        if let Some(existing) = self.packages.get(&id) {
            if existing.relative_path != relative {
                return Err(VarError::Collision {
                    id,
                    existing: existing.relative_path.clone(),
                    duplicate: relative.to_path_buf(),
                });
            }
            if !existing.info.differs(info.modified, info.size) {
                return Ok(());
            }
            info!(package = %id, "updating");
            let package = Package::open(&self.root, &self.root.join(relative), self.options.depth)?;
            self.packages.insert(id.clone(), package);
            report.updated.push(id);
            return Ok(());
        }

        let package = Package::open(&self.root, &self.root.join(relative), self.options.depth)?;
        debug!(package = %id, "added");
        self.packages.insert(id.clone(), package);
        report.added.push(id);
        Ok(())
    }

    fn relative(&self, file: &Path) -> PathBuf {
        file.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| file.to_path_buf())
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.options.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style);
        }
        bar.set_message("scanning vars");
        bar
    }

    /// Opens `package_id` from disk with a full content scan, bypassing the index.
    pub fn rescan(&self, package_id: &str) -> Result<Package> {
        let package = self.require(package_id)?;
        Package::open(&self.root, &package.file_path(&self.root), ScanDepth::Full)
    }

    /// Re-reads one archive into the index after it was rewritten.
    pub fn reload(&mut self, package_id: &str) -> Result<()> {
        let path = self.require(package_id)?.file_path(&self.root);
        let package = Package::open(&self.root, &path, self.options.depth)?;
        self.packages.insert(package_id.to_string(), package);
        Ok(())
    }

    /// Moves an archive to `sub_directory` (relative to the root), keeping
    /// its identity.
    pub fn move_package(&mut self, package_id: &str, sub_directory: &Path) -> Result<PathBuf> {
        let package = self.require(package_id)?;
        let source = package.file_path(&self.root);
        let relative = sub_directory.join(package.filename());
        if relative == package.relative_path {
            return Ok(source);
        }

        let dest = self.root.join(&relative);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&source, &dest)?;
        let info = FileInfo::stat(&dest)?;
        let moved = package.relocated(relative, info);
        self.packages.insert(package_id.to_string(), moved);
        debug!(package = %package_id, to = %dest.display(), "moved");
        Ok(dest)
    }

    /// Applies `change` to each package. Failed moves are logged and
    /// skipped. Empty directories left behind are removed and the index is
    /// saved. Returns the ids that moved.
    pub fn relocate<'a>(
        &mut self,
        package_ids: impl IntoIterator<Item = &'a str>,
        change: &SubdirChange,
    ) -> Result<Vec<String>> {
        let mut moved = Vec::new();
        for id in package_ids {
            let Some(package) = self.get(id) else {
                warn!(package = %id, "not in store index");
                continue;
            };
            let Some(target) = change.apply(package) else {
                continue;
            };
            match self.move_package(id, Path::new(&target)) {
                Ok(_) => moved.push(id.to_string()),
                Err(err) => error!(package = %id, error = %err, "move failed"),
            }
        }
        if !moved.is_empty() {
            self.remove_empty_dirs();
            self.save()?;
        }
        Ok(moved)
    }

    /// Deletes empty directories under the root. Returns how many were removed.
    pub fn remove_empty_dirs(&self) -> usize {
        let mut removed = 0;
        let dirs: Vec<PathBuf> = WalkDir::new(&self.root)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .map(|e| e.into_path())
            .collect();
        for dir in dirs {
            let empty = std::fs::read_dir(&dir).is_ok_and(|mut entries| entries.next().is_none());
            if empty && std::fs::remove_dir(&dir).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Older versions of multi-version packages not filed under a
    /// `versioned` directory.
    pub fn find_unversioned_duplicates(&self) -> BTreeSet<String> {
        let mut versions: BTreeMap<String, Vec<&Package>> = BTreeMap::new();
        for package in self.iter() {
            versions.entry(package.duplicate_id()).or_default().push(package);
        }

        let mut duplicates = BTreeSet::new();
        for packages in versions.values().filter(|v| v.len() > 1) {
            let max = packages.iter().map(|p| p.version()).max().unwrap_or_default();
            for package in packages {
                if package.version() < max {
                    if !package.is_versioned() {
                        duplicates.insert(package.package_id());
                    }
                } else if package.is_versioned() {
                    warn!(package = %package.package_id(), "latest version is in a versioned directory");
                }
            }
        }
        duplicates
    }

    /// Packages whose manifest dependency list differs from what their
    /// content uses.
    pub fn find_unoptimized(&self) -> BTreeSet<String> {
        if self.options.depth == ScanDepth::Quick {
            warn!("unoptimized check needs a full scan; used dependencies are unknown");
        }
        self.iter()
            .filter(|p| p.is_unoptimized())
            .map(|p| p.package_id())
            .collect()
    }
}
