//! Builders for throwaway var archives used by unit tests.

use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;

pub struct VarBuilder {
    id: String,
    dependencies: Vec<String>,
    files: Vec<(String, Vec<u8>)>,
    manifest: Option<String>,
}

impl VarBuilder {
    pub fn new(id: &str) -> Self {
        VarBuilder {
            id: id.to_string(),
            dependencies: Vec::new(),
            files: Vec::new(),
            manifest: None,
        }
    }

    pub fn dependency(mut self, id: &str) -> Self {
        self.dependencies.push(id.to_string());
        self
    }

    pub fn file(mut self, path: &str, contents: &str) -> Self {
        self.files.push((path.to_string(), contents.as_bytes().to_vec()));
        self
    }

    /// Replaces the generated `meta.json` with raw text.
    pub fn raw_manifest(mut self, text: &str) -> Self {
        self.manifest = Some(text.to_string());
        self
    }

    pub fn manifest_text(&self) -> String {
        if let Some(text) = &self.manifest {
            return text.clone();
        }
        let dependencies: serde_json::Map<String, serde_json::Value> = self
            .dependencies
            .iter()
            .map(|d| (d.clone(), json!({ "licenseType": "FC", "dependencies": {} })))
            .collect();
        let content_list: Vec<&str> = self.files.iter().map(|(p, _)| p.as_str()).collect();
        serde_json::to_string_pretty(&json!({
            "licenseType": "CC BY",
            "creatorName": self.id.split('.').next().unwrap_or_default(),
            "dependencies": dependencies,
            "contentList": content_list,
        }))
        .unwrap()
    }

    /// Writes `<dir>/<id>.var`, creating `dir` if needed.
    pub fn write_in(&self, dir: &Path) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(format!("{}.var", self.id));
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        writer.start_file("meta.json", options).unwrap();
        writer.write_all(self.manifest_text().as_bytes()).unwrap();
        for (name, contents) in &self.files {
            writer.start_file(name.as_str(), options).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap();
        path
    }
}

/// Reads one entry of an archive as text.
pub fn read_entry(path: &Path, name: &str) -> String {
    crate::archive::read_entry(path, name).unwrap()
}

/// In-memory package with the given listing and `(target, path)` references.
pub fn package(id: &str, files: &[&str], used: &[(&str, &str)]) -> crate::package::Package {
    package_in("", id, files, used)
}

/// Same as [`package`], located under `sub_directory`.
pub fn package_in(
    sub_directory: &str,
    id: &str,
    files: &[&str],
    used: &[(&str, &str)],
) -> crate::package::Package {
    use crate::package::{ContentEntry, FileInfo, Package};
    use crate::scanner::ReferenceMap;

    let mut used_packages = ReferenceMap::new();
    for (target, path) in used {
        used_packages
            .entry(target.to_string())
            .or_default()
            .insert(path.to_string());
    }
    let contents = files
        .iter()
        .map(|path| ContentEntry {
            path: path.to_string(),
            size: 1,
        })
        .collect();
    let mut package = Package::new(
        id.parse().unwrap(),
        Path::new(sub_directory).join(format!("{}.var", id)),
        FileInfo::default(),
        contents,
        Default::default(),
        used_packages,
    );
    package.declared_dependencies = package.used_dependencies();
    package
}
