//! var-repair library for resolving dependencies between var packages and
//! repairing their broken cross-package references.
//!
//! A var is a zip archive named `author.name.version.var` whose JSON content
//! files point into other packages with `author.name.version:/path` strings.
//! The core workflow has three phases:
//!
//! 1. **Scanning**: [`store::PackageStore`] indexes every archive under a root
//!    and [`scanner`] extracts the references each one makes
//! 2. **Analysis**: a [`session::Session`] builds the dependency graph and the
//!    repair index once, then plans replacements for broken references
//! 3. **Rewriting**: [`rewriter`] applies a plan to the archive through a
//!    temp-file swap
//!
//! # Example
//!
//! ```no_run
//! use var_repair::session::{AssumeYes, RepairSettings, Session};
//! use var_repair::store::{PackageStore, StoreOptions};
//!
//! let mut store = PackageStore::open("/games/vam/AddonPackages", StoreOptions::default()).unwrap();
//! store.refresh().unwrap();
//!
//! let session = Session::new(&store, RepairSettings::default());
//! for (id, plan) in session.find_broken() {
//!     println!("{}: {} reference(s) to fix", id, plan.replacements.len());
//! }
//! let summary = session.repair_many(["Me.Scene.1"], &AssumeYes);
//! println!("repaired {}", summary.repaired.len());
//! ```

pub mod analyzer;
pub mod archive;
pub mod cli;
pub mod config;
pub mod content_type;
pub mod error;
pub mod graph;
pub mod package;
pub mod repair_index;
pub mod rewriter;
pub mod scanner;
pub mod session;
pub mod store;

#[cfg(test)]
mod test_support;

// Re-export commonly used types at crate root
pub use analyzer::{RepairPlan, Resolution};
pub use error::{Result, VarError};
pub use package::{Package, PackageId};
pub use session::{RepairOutcome, Session};
pub use store::PackageStore;
