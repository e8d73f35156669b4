//! Package identity and metadata.
//!
//! A package ("var") is a zip archive named `author.name.version.var`. Its
//! identity is parsed from the filename; its metadata (content listing,
//! declared and used dependencies, classification) comes from the archive or
//! from a persisted index record.

use crate::archive::{self, MANIFEST};
use crate::content_type::{self, ContentType};
use crate::error::{Result, VarError};
use crate::scanner::{self, Reference, ReferenceMap, SELF_REF, SELF_UNREF};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::UNIX_EPOCH;

pub const VAR_EXTENSION: &str = "var";
const LATEST: &str = "latest";
const MEBIBYTE: u64 = 1024 * 1024;
const SCENE_DIRECTORIES: [&str; 2] = ["scenes", "looks"];

/// How much of an archive to read when building a [`Package`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDepth {
    /// Manifest and listing only; `used_packages` stays empty.
    Quick,
    /// Every JSON-like content file is scanned for references.
    Full,
}

/// Version part of a dependency reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VersionSpec {
    Exact(u32),
    Latest,
}

impl FromStr for VersionSpec {
    type Err = VarError;

    fn from_str(s: &str) -> Result<Self> {
        if s == LATEST {
            return Ok(VersionSpec::Latest);
        }
        s.parse::<u32>()
            .ok()
            .filter(|v| *v > 0)
            .map(VersionSpec::Exact)
            .ok_or_else(|| VarError::MalformedIdentifier(s.to_string()))
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSpec::Exact(v) => write!(f, "{}", v),
            VersionSpec::Latest => f.write_str(LATEST),
        }
    }
}

/// Splits a dependency id `author.name.version|latest` into its duplicate id
/// and version. Returns `None` for anything that is not three dot-separated
/// segments with a valid version.
pub fn split_reference(id: &str) -> Option<(&str, VersionSpec)> {
    if id.split('.').count() != 3 {
        return None;
    }
    let (duplicate_id, version) = id.rsplit_once('.')?;
    Some((duplicate_id, version.parse().ok()?))
}

/// `author.name.latest` for any `author.name.version` id.
pub fn as_latest(id: &str) -> String {
    match id.rsplit_once('.') {
        Some((duplicate_id, _)) => format!("{}.{}", duplicate_id, LATEST),
        None => format!("{}.{}", id, LATEST),
    }
}

/// Identity of a stored package. Stored packages always carry a concrete version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageId {
    pub author: String,
    pub name: String,
    pub version: u32,
}

impl PackageId {
    /// Parses `author.name.version.ext`.
    pub fn from_filename(filename: &str) -> Result<Self> {
        let parts: Vec<&str> = filename.split('.').collect();
        if parts.len() != 4 {
            return Err(VarError::MalformedIdentifier(filename.to_string()));
        }
        Self::from_parts(parts[0], parts[1], parts[2], filename)
    }

    fn from_parts(author: &str, name: &str, version: &str, original: &str) -> Result<Self> {
        if author.is_empty() || name.is_empty() {
            return Err(VarError::MalformedIdentifier(original.to_string()));
        }
        match version.parse::<VersionSpec>() {
            Ok(VersionSpec::Exact(version)) => Ok(PackageId {
                author: author.to_string(),
                name: name.to_string(),
                version,
            }),
            _ => Err(VarError::MalformedIdentifier(original.to_string())),
        }
    }

    /// `author.name`, shared by every version of the package.
    pub fn duplicate_id(&self) -> String {
        format!("{}.{}", self.author, self.name)
    }

    pub fn latest_id(&self) -> String {
        format!("{}.{}.{}", self.author, self.name, LATEST)
    }

    pub fn filename(&self) -> String {
        format!("{}.{}", self, VAR_EXTENSION)
    }
}

impl FromStr for PackageId {
    type Err = VarError;

    /// Parses `author.name.version`; `latest` is rejected.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(VarError::MalformedIdentifier(s.to_string()));
        }
        Self::from_parts(parts[0], parts[1], parts[2], s)
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.author, self.name, self.version)
    }
}

/// Filesystem stamp used to detect modified archives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub created: Option<u64>,
    /// Milliseconds since the unix epoch.
    pub modified: u64,
    pub size: u64,
}

impl FileInfo {
    pub fn stat(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path)?;
        let millis = |t: std::time::SystemTime| {
            t.duration_since(UNIX_EPOCH)
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or(0)
        };
        Ok(FileInfo {
            created: meta.created().ok().map(millis),
            modified: meta.modified().map(millis).unwrap_or(0),
            size: meta.len(),
        })
    }

    pub fn differs(&self, modified: u64, size: u64) -> bool {
        self.modified != modified || self.size != size
    }
}

/// One entry of an archive's content listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub path: String,
    pub size: u64,
}

/// An indexed package archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "PackageRecord", into = "PackageRecord")]
pub struct Package {
    pub id: PackageId,
    /// Path of the archive relative to the store root.
    pub relative_path: PathBuf,
    pub info: FileInfo,
    pub contains: BTreeSet<ContentType>,
    pub content_type: ContentType,
    pub contents: Vec<ContentEntry>,
    /// Dependencies listed in `meta.json`, nested ones included.
    pub declared_dependencies: BTreeSet<String>,
    /// References found by scanning content files.
    pub used_packages: ReferenceMap,
    paths: HashSet<String>,
}

impl Package {
    pub fn new(
        id: PackageId,
        relative_path: PathBuf,
        info: FileInfo,
        contents: Vec<ContentEntry>,
        declared_dependencies: BTreeSet<String>,
        used_packages: ReferenceMap,
    ) -> Self {
        let contains = ContentType::detect(contents.iter().map(|e| e.path.as_str()));
        let content_type = ContentType::classify(&contains);
        let paths = contents.iter().map(|e| e.path.clone()).collect();
        Package {
            id,
            relative_path,
            info,
            contains,
            content_type,
            contents,
            declared_dependencies,
            used_packages,
            paths,
        }
    }

    /// Reads an archive from disk. `root` is the store root used to derive
    /// the relative path.
    pub fn open(root: &Path, file_path: &Path, depth: ScanDepth) -> Result<Self> {
        let filename = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| VarError::MalformedIdentifier(file_path.display().to_string()))?;
        let id = PackageId::from_filename(filename)?;
        let info = FileInfo::stat(file_path)?;
        let scan = archive::scan_archive(file_path, &id.to_string(), depth)?;
        let relative_path = file_path
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| file_path.to_path_buf());

        Ok(Package::new(
            id,
            relative_path,
            info,
            scan.contents,
            scan.declared_dependencies,
            scan.references,
        ))
    }

    /// Returns a copy located at a new relative path, keeping scanned data.
    pub fn relocated(&self, relative_path: PathBuf, info: FileInfo) -> Self {
        Package {
            relative_path,
            info,
            ..self.clone()
        }
    }

    pub fn package_id(&self) -> String {
        self.id.to_string()
    }

    pub fn duplicate_id(&self) -> String {
        self.id.duplicate_id()
    }

    pub fn author(&self) -> &str {
        &self.id.author
    }

    pub fn version(&self) -> u32 {
        self.id.version
    }

    pub fn file_path(&self, root: &Path) -> PathBuf {
        root.join(&self.relative_path)
    }

    pub fn filename(&self) -> String {
        self.id.filename()
    }

    /// Directory of the archive relative to the store root.
    pub fn sub_directory(&self) -> PathBuf {
        self.relative_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    pub fn sub_directory_str(&self) -> String {
        self.sub_directory().to_string_lossy().replace('\\', "/")
    }

    pub fn contains_path(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.contents.iter().map(|e| e.path.as_str())
    }

    /// Content files that may hold references, the manifest excluded.
    pub fn json_like_files(&self) -> Vec<&str> {
        self.names()
            .filter(|name| *name != MANIFEST && archive::is_json_like(name))
            .collect()
    }

    /// `(path, basename)` for every non-manifest entry that has an extension.
    pub fn includes(&self) -> Vec<(&str, &str)> {
        self.names()
            .filter(|name| *name != MANIFEST && has_extension(name))
            .map(|name| (name, basename(name)))
            .collect()
    }

    /// Every referenced package id, own and same-package targets excluded.
    pub fn used_dependencies(&self) -> BTreeSet<String> {
        let own = self.package_id();
        let own_latest = self.id.latest_id();
        self.used_packages
            .keys()
            .filter(|k| {
                k.as_str() != SELF_REF
                    && k.as_str() != SELF_UNREF
                    && **k != own
                    && **k != own_latest
            })
            .cloned()
            .collect()
    }

    pub fn references(&self) -> Vec<Reference> {
        scanner::references(&self.used_packages)
    }

    /// Declared dependency list disagrees with what the content actually uses.
    pub fn is_unoptimized(&self) -> bool {
        self.declared_dependencies != self.used_dependencies()
    }

    pub fn is_versioned(&self) -> bool {
        self.sub_directory_str().contains("versioned")
    }

    /// Sub-directory this package belongs in by content type. Versioned
    /// packages stay put, as do JSON content packages already filed under a
    /// scene or look directory.
    pub fn preferred_subdirectory(&self) -> String {
        let current = self.sub_directory_str();
        if self.is_versioned() {
            return current;
        }
        if self.content_type.is_repairable()
            && SCENE_DIRECTORIES.iter().any(|d| current.contains(d))
        {
            return current;
        }
        self.content_type.subdirectory()
    }

    pub fn prefer_symlink(&self) -> bool {
        content_type::is_symlink_eligible(&self.contains) && self.info.size < 100 * MEBIBYTE
    }
}

pub fn has_extension(path: &str) -> bool {
    extension(path).is_some_and(|ext| !ext.is_empty())
}

/// Lowercased extension without the dot.
pub fn extension(path: &str) -> Option<String> {
    let name = basename(path);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// On-disk shape of a package inside the persisted store index.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PackageRecord {
    file_path: PathBuf,
    info: FileInfo,
    contains: BTreeSet<ContentType>,
    infolist: Vec<(String, u64)>,
    dependencies: BTreeSet<String>,
    used_packages: ReferenceMap,
}

impl TryFrom<PackageRecord> for Package {
    type Error = VarError;

    fn try_from(record: PackageRecord) -> Result<Self> {
        let filename = record
            .file_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| VarError::MalformedIdentifier(record.file_path.display().to_string()))?;
        let id = PackageId::from_filename(filename)?;
        let contents = record
            .infolist
            .into_iter()
            .map(|(path, size)| ContentEntry { path, size })
            .collect();
        let mut package = Package::new(
            id,
            record.file_path,
            record.info,
            contents,
            record.dependencies,
            record.used_packages,
        );
        if !record.contains.is_empty() {
            package.content_type = ContentType::classify(&record.contains);
            package.contains = record.contains;
        }
        Ok(package)
    }
}

impl From<Package> for PackageRecord {
    fn from(package: Package) -> Self {
        PackageRecord {
            file_path: package.relative_path,
            info: package.info,
            contains: package.contains,
            infolist: package
                .contents
                .into_iter()
                .map(|e| (e.path, e.size))
                .collect(),
            dependencies: package.declared_dependencies,
            used_packages: package.used_packages,
        }
    }
}
