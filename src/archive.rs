//! Zip archive access.
//!
//! Reads a package's listing, manifest and content files, and rewrites an
//! archive through a temp file that replaces the original only once every
//! entry has been written.

use crate::error::{Result, VarError};
use crate::package::{self, ScanDepth};
use crate::scanner::{self, ReferenceMap};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Manifest entry present in every package.
pub const MANIFEST: &str = "meta.json";
/// Name of the scratch archive written during a rewrite. Any file with this
/// name found in the store is garbage from an interrupted commit.
pub const TEMP_ARCHIVE_NAME: &str = "temp.temp.1.var";

const JSON_LIKE: [&str; 3] = ["json", "vap", "vaj"];

/// Everything read from one archive.
#[derive(Debug, Default)]
pub struct ArchiveScan {
    pub contents: Vec<package::ContentEntry>,
    pub declared_dependencies: BTreeSet<String>,
    pub references: ReferenceMap,
}

pub fn is_json_like(name: &str) -> bool {
    package::extension(name).is_some_and(|ext| JSON_LIKE.contains(&ext.as_str()))
}

/// Reads the listing and manifest, and with [`ScanDepth::Full`] scans every
/// JSON-like content file for references.
pub fn scan_archive(path: &Path, package_id: &str, depth: ScanDepth) -> Result<ArchiveScan> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let mut scan = ArchiveScan::default();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        scan.contents.push(package::ContentEntry {
            path: name.clone(),
            size: entry.size(),
        });

        if entry.is_dir() || !is_json_like(&name) {
            continue;
        }
        if name == MANIFEST {
            let text = read_text(&mut entry)?;
            scan.declared_dependencies = parse_manifest_dependencies(package_id, &text)?;
        } else if depth == ScanDepth::Full {
            let text = read_text(&mut entry)?;
            let refs = scanner::scan_content(package_id, &name, &text)?;
            scanner::merge(&mut scan.references, refs);
        }
    }

    debug!(
        package = package_id,
        entries = scan.contents.len(),
        "scanned archive"
    );
    Ok(scan)
}

/// Collects every dependency key of the manifest, nested ones included.
pub fn parse_manifest_dependencies(package_id: &str, text: &str) -> Result<BTreeSet<String>> {
    let manifest: serde_json::Value =
        serde_json::from_str(scanner::strip_bom(text)).map_err(|source| {
            VarError::ManifestParse {
                package: package_id.to_string(),
                source,
            }
        })?;
    let mut dependencies = BTreeSet::new();
    collect_dependency_keys(manifest.get("dependencies"), &mut dependencies);
    Ok(dependencies)
}

fn collect_dependency_keys(value: Option<&serde_json::Value>, into: &mut BTreeSet<String>) {
    let Some(serde_json::Value::Object(map)) = value else {
        return;
    };
    for (key, nested) in map {
        collect_dependency_keys(nested.get("dependencies"), into);
        into.insert(key.clone());
    }
}

fn read_text(entry: &mut impl Read) -> Result<String> {
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Reads one entry as text.
pub fn read_entry(path: &Path, name: &str) -> Result<String> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let mut entry = archive.by_name(name)?;
    read_text(&mut entry)
}

/// Rewrites every entry of the archive at `path` through `transform`.
///
/// `transform` receives the entry name and its bytes and returns the bytes to
/// store. Output goes to [`TEMP_ARCHIVE_NAME`] next to the original; if any
/// entry fails, the temp file is discarded and the original is untouched.
/// Otherwise the original is deleted and the temp file renamed over it.
pub fn rewrite_archive<F>(path: &Path, transform: F) -> Result<()>
where
    F: FnMut(&str, Vec<u8>) -> Result<Vec<u8>>,
{
    let temp = temp_path(path);
    if let Err(err) = write_transformed(path, &temp, transform) {
        if let Err(cleanup) = std::fs::remove_file(&temp) {
            warn!(file = %temp.display(), error = %cleanup, "could not remove temp archive");
        }
        return Err(err);
    }

    std::fs::remove_file(path)?;
    std::fs::rename(&temp, path)?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    path.parent()
        .unwrap_or_else(|| Path::new("."))
        .join(TEMP_ARCHIVE_NAME)
}

fn write_transformed<F>(source: &Path, dest: &Path, mut transform: F) -> Result<()>
where
    F: FnMut(&str, Vec<u8>) -> Result<Vec<u8>>,
{
    let mut archive = ZipArchive::new(File::open(source)?)?;
    let mut writer = ZipWriter::new(File::create(dest)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        if entry.is_dir() {
            writer.add_directory(name, options)?;
            continue;
        }
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        drop(entry);

        let output = transform(&name, bytes)?;
        writer.start_file(name, options)?;
        writer.write_all(&output)?;
    }

    writer.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, VarBuilder};

    #[test]
    fn json_like_extensions() {
        assert!(is_json_like("Saves/scene/a.json"));
        assert!(is_json_like("Custom/Atom/Person/Appearance/a.VAP"));
        assert!(is_json_like("Custom/Clothing/c.vaj"));
        assert!(!is_json_like("Custom/Clothing/c.vam"));
        assert!(!is_json_like("Custom/Scripts/x.cs"));
    }

    #[test]
    fn manifest_dependencies_include_nested() {
        let text = r#"{
            "dependencies": {
                "A.B.1": { "licenseType": "FC", "dependencies": {
                    "C.D.latest": { "dependencies": {} }
                } },
                "E.F.2": {}
            }
        }"#;
        let deps = parse_manifest_dependencies("X.Y.1", text).unwrap();
        assert_eq!(
            deps.into_iter().collect::<Vec<_>>(),
            vec!["A.B.1", "C.D.latest", "E.F.2"]
        );
    }

    #[test]
    fn manifest_without_dependencies_is_empty() {
        let deps = parse_manifest_dependencies("X.Y.1", "{}").unwrap();
        assert!(deps.is_empty());
    }

    #[test]
    fn invalid_manifest_is_an_error() {
        let err = parse_manifest_dependencies("X.Y.1", "{ nope").unwrap_err();
        assert!(matches!(err, VarError::ManifestParse { .. }));
    }

    #[test]
    fn scan_fails_on_invalid_manifest_in_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = VarBuilder::new("A.B.1")
            .raw_manifest("{ broken")
            .write_in(dir.path());
        let err = scan_archive(&path, "A.B.1", ScanDepth::Quick).unwrap_err();
        assert!(matches!(err, VarError::ManifestParse { .. }));
    }

    #[test]
    fn scan_fails_on_invalid_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = VarBuilder::new("A.B.1")
            .file("Saves/scene/a.json", "{ \"id\": \"X.Y.1:/Custom/a.jpg\"")
            .write_in(dir.path());
        assert!(scan_archive(&path, "A.B.1", ScanDepth::Quick).is_ok());
        let err = scan_archive(&path, "A.B.1", ScanDepth::Full).unwrap_err();
        assert!(matches!(err, VarError::ContentParse { .. }));
    }

    #[test]
    fn rewrite_replaces_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = VarBuilder::new("A.B.1")
            .file("Saves/scene/a.json", "{}")
            .file("Saves/scene/a.jpg", "img")
            .write_in(dir.path());

        rewrite_archive(&path, |name, bytes| {
            if name == "Saves/scene/a.json" {
                Ok(b"{\"x\": 1}".to_vec())
            } else {
                Ok(bytes)
            }
        })
        .unwrap();

        assert_eq!(
            test_support::read_entry(&path, "Saves/scene/a.json"),
            "{\"x\": 1}"
        );
        assert_eq!(test_support::read_entry(&path, "Saves/scene/a.jpg"), "img");
        assert!(!dir.path().join(TEMP_ARCHIVE_NAME).exists());
    }

    #[test]
    fn failed_rewrite_leaves_original_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = VarBuilder::new("A.B.1")
            .file("Saves/scene/a.json", "{}")
            .write_in(dir.path());
        let before = std::fs::read(&path).unwrap();

        let result = rewrite_archive(&path, |name, bytes| {
            if name == "Saves/scene/a.json" {
                Err(VarError::UnknownPackage("boom".into()))
            } else {
                Ok(bytes)
            }
        });

        assert!(result.is_err());
        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert!(!dir.path().join(TEMP_ARCHIVE_NAME).exists());
    }
}
