//! Error taxonomy for store scans and package repairs.
//!
//! Every variant is local to a single package: store-wide loops log the error
//! and move on to the next archive.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VarError {
    /// Archive filename does not split into `author.name.version.var`.
    #[error("malformed package identifier '{0}'")]
    MalformedIdentifier(String),

    #[error("meta.json of {package} cannot be parsed: {source}")]
    ManifestParse {
        package: String,
        #[source]
        source: serde_json::Error,
    },

    /// A content file that must be JSON is not. Aborts that package's scan.
    #[error("{file} in {package} is not valid JSON: {source}")]
    ContentParse {
        package: String,
        file: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("repairs not supported for {package}: cannot strip {}", .references.join(", "))]
    UnsupportedRepair {
        package: String,
        references: Vec<String>,
    },

    #[error("{file} in {package} is no longer valid JSON after rewrite: {source}")]
    ContentRewriteCorruption {
        package: String,
        file: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("package id {id} is provided by both {} and {}", .existing.display(), .duplicate.display())]
    Collision {
        id: String,
        existing: PathBuf,
        duplicate: PathBuf,
    },

    #[error("invalid ignore pattern '{pattern}': {source}")]
    IgnorePattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("unknown package '{0}'")]
    UnknownPackage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VarError>;
