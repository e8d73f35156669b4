//! JSON configuration file.

use crate::analyzer::{BACKWARD_COMPATIBLE_AUTHORS, DEFAULT_FUZZY_THRESHOLD};
use crate::package::ScanDepth;
use crate::session::{DEFAULT_TOP_AUTHORS, RemovalPolicy, RepairSettings};
use crate::store::{DEFAULT_IGNORE, DEFAULT_INDEX_FILE, StoreOptions};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "var-repair.json";

/// Overrides `root_path` from the file.
pub const ROOT_ENV: &str = "VAR_REPAIR_ROOT";

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub root_path: Option<PathBuf>,
    pub index_file: String,
    /// Read manifests and listings only.
    pub quick_scan: bool,
    pub disable_save: bool,
    /// Directory-name globs skipped while walking the store.
    pub ignore: Vec<String>,
    /// Authors, `author.name` or package ids never reported as unused.
    pub favorites: Vec<String>,
    pub repair_auto_skip_on_missing: bool,
    pub repair_auto_fix_on_missing: bool,
    pub fuzzy_threshold: usize,
    pub top_authors: usize,
    pub backward_compatible_authors: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_path: None,
            index_file: DEFAULT_INDEX_FILE.to_string(),
            quick_scan: false,
            disable_save: false,
            ignore: DEFAULT_IGNORE.iter().map(|s| s.to_string()).collect(),
            favorites: Vec::new(),
            repair_auto_skip_on_missing: false,
            repair_auto_fix_on_missing: false,
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
            top_authors: DEFAULT_TOP_AUTHORS,
            backward_compatible_authors: BACKWARD_COMPATIBLE_AUTHORS
                .iter()
                .map(|a| a.to_string())
                .collect(),
        }
    }
}

impl Config {
    /// Loads `path`, or [`DEFAULT_CONFIG_FILE`] when `None`. A missing
    /// default file gives the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        if let Some(root) = std::env::var_os(ROOT_ENV) {
            config.root_path = Some(PathBuf::from(root));
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn store_options(&self, progress: bool) -> StoreOptions {
        StoreOptions {
            index_file: self.index_file.clone(),
            depth: if self.quick_scan {
                ScanDepth::Quick
            } else {
                ScanDepth::Full
            },
            ignore: self.ignore.clone(),
            disable_save: self.disable_save,
            progress,
        }
    }

    /// Skipping wins over fixing when both are set.
    pub fn removal_policy(&self) -> RemovalPolicy {
        if self.repair_auto_skip_on_missing {
            RemovalPolicy::Skip
        } else if self.repair_auto_fix_on_missing {
            RemovalPolicy::Allow
        } else {
            RemovalPolicy::Confirm
        }
    }

    pub fn repair_settings(&self) -> RepairSettings {
        RepairSettings {
            fuzzy_threshold: self.fuzzy_threshold,
            top_authors: self.top_authors,
            backward_compatible_authors: self.backward_compatible_authors.clone(),
            removal: self.removal_policy(),
            favorites: self.favorites.clone(),
        }
    }
}
