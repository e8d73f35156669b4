//! Command-line interface definitions.
//!
//! Defines the argument parser and subcommands using clap's derive API.
//! Every subcommand works on one package store: scanning it, reporting on
//! it, repairing packages in it, or moving packages around inside it.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Resolve dependencies and repair broken references in var packages.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Configuration file. Defaults to `var-repair.json` when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Store root. Overrides the config file and `VAR_REPAIR_ROOT`.
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Log debug output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Refresh the store index and report what changed.
    Scan {
        /// Read manifests only; skip the content scan.
        #[arg(long)]
        quick: bool,
    },

    /// Summarize missing, duplicate, unoptimized, broken and unused packages.
    Health {
        /// Emit JSON instead of human-readable output.
        #[arg(long)]
        json: bool,
    },

    /// List packages with references that need repair, and the planned fixes.
    Broken {
        /// Emit JSON instead of human-readable output.
        #[arg(long)]
        json: bool,
    },

    /// Repair broken references. Defaults to every broken package.
    Repair {
        /// Package ids to repair.
        ids: Vec<String>,

        /// Archives to repair, by path.
        #[arg(short, long)]
        file: Vec<PathBuf>,

        /// Remove unrecoverable references without asking.
        #[arg(short, long)]
        yes: bool,

        /// Print the planned changes without writing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Rewrite manifests so declared dependencies match actual usage.
    /// Defaults to every unoptimized package.
    Optimize {
        /// Package ids to update.
        ids: Vec<String>,

        /// Print the planned changes without writing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the dependencies of a package.
    Deps {
        id: String,

        /// Only the dependencies listed in the package manifest.
        #[arg(long)]
        shallow: bool,
    },

    /// Print the packages that depend on a package.
    Uses { id: String },

    /// Print dependencies not present in the store, with their users.
    Missing,

    /// Print packages no other package depends on.
    Unused {
        /// Keep only ids containing one of these substrings.
        #[arg(long)]
        filter: Vec<String>,
    },

    /// Move unused packages into `unused_` directories.
    TagUnused,

    /// Move packages back out of `unused_` directories.
    UntagUnused,

    /// Move older versions of duplicated packages into `_versioned`.
    VersionDuplicates,

    /// Move packages into the directory matching their content type.
    Organize {
        /// Package ids to move. Defaults to every package.
        ids: Vec<String>,
    },
}
