//! var-repair: resolve dependencies and repair broken references in var packages.
//!
//! Indexes a directory of var archives, reports missing, duplicated, unused and
//! broken packages, and rewrites archives in place to fix their references.

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::collections::BTreeSet;
use var_repair::cli::{Args, Commands};
use var_repair::config::Config;
use var_repair::package::PackageId;
use var_repair::session::{Confirm, HealthReport, RemovalPolicy, RepairSummary, Session};
use var_repair::store::{PackageStore, RefreshReport, SubdirChange};
use var_repair::RepairPlan;

const UNUSED_TAG: &str = "unused_";
const VERSIONED_DIRECTORY: &str = "_versioned";

/// Asks on the terminal before references are stripped.
struct PromptConfirm;

impl Confirm for PromptConfirm {
    fn confirm(&self, package_id: &str, removals: &[&str]) -> bool {
        println!(
            "\n{} {} will lose {} reference(s):",
            "warn:".yellow().bold(),
            package_id,
            removals.len()
        );
        for removal in removals {
            println!("  {}", removal.red());
        }
        dialoguer::Confirm::new()
            .with_prompt("Remove them?")
            .default(false)
            .interact()
            .unwrap_or(false)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(root) = args.root {
        config.root_path = Some(root);
    }

    match args.command {
        Commands::Scan { quick } => {
            config.quick_scan |= quick;
            cmd_scan(&config)
        }
        Commands::Health { json } => cmd_health(&config, json),
        Commands::Broken { json } => cmd_broken(&config, json),
        Commands::Repair {
            ids,
            file,
            yes,
            dry_run,
        } => cmd_repair(&config, ids, file, yes, dry_run),
        Commands::Optimize { ids, dry_run } => cmd_optimize(&config, ids, dry_run),
        Commands::Deps { id, shallow } => cmd_deps(&config, &id, shallow),
        Commands::Uses { id } => cmd_uses(&config, &id),
        Commands::Missing => cmd_missing(&config),
        Commands::Unused { filter } => cmd_unused(&config, &filter),
        Commands::TagUnused => cmd_tag_unused(&config),
        Commands::UntagUnused => {
            cmd_relocate(&config, None, SubdirChange::Strip(UNUSED_TAG.to_string()))
        }
        Commands::VersionDuplicates => cmd_version_duplicates(&config),
        Commands::Organize { ids } => cmd_relocate(&config, Some(ids), SubdirChange::Preferred),
    }
}

/// Opens the configured store and brings its index up to date.
fn open_store(config: &Config) -> Result<(PackageStore, RefreshReport)> {
    let root = config
        .root_path
        .clone()
        .context("No store root configured (use --root, VAR_REPAIR_ROOT or root_path)")?;
    let mut store = PackageStore::open(&root, config.store_options(true))
        .with_context(|| format!("Failed to open store at {}", root.display()))?;
    let report = store
        .refresh()
        .with_context(|| format!("Failed to scan {}", root.display()))?;
    Ok((store, report))
}

fn cmd_scan(config: &Config) -> Result<()> {
    let (store, report) = open_store(config)?;

    for (file, error) in &report.failed {
        println!("  {} {} {}", "failed:".red(), file, format!("({})", error).dimmed());
    }
    println!(
        "{} {} packages ({} added, {} updated, {} removed, {} failed)",
        "ok:".green().bold(),
        store.len(),
        report.added.len(),
        report.updated.len(),
        report.removed.len(),
        report.failed.len()
    );
    Ok(())
}

fn cmd_health(config: &Config, json: bool) -> Result<()> {
    let (store, _) = open_store(config)?;
    let session = Session::new(&store, config.repair_settings());
    let report = session.health();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_health(&report);
    }
    Ok(())
}

fn cmd_broken(config: &Config, json: bool) -> Result<()> {
    let (store, _) = open_store(config)?;
    let session = Session::new(&store, config.repair_settings());
    let broken = session.find_broken();

    if json {
        let plans: Vec<&RepairPlan> = broken.values().collect();
        println!("{}", serde_json::to_string_pretty(&plans)?);
        return Ok(());
    }

    if broken.is_empty() {
        println!("{} No broken packages found", "ok:".green().bold());
        return Ok(());
    }
    println!(
        "\n{} {} broken package(s):",
        "Found".red().bold(),
        broken.len()
    );
    for plan in broken.values() {
        print_plan(plan);
    }
    Ok(())
}

fn cmd_repair(
    config: &Config,
    ids: Vec<String>,
    files: Vec<std::path::PathBuf>,
    yes: bool,
    dry_run: bool,
) -> Result<()> {
    let (mut store, _) = open_store(config)?;

    let mut targets: BTreeSet<String> = ids.into_iter().collect();
    for file in &files {
        let filename = file
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Not a package file: {}", file.display()))?;
        targets.insert(PackageId::from_filename(filename)?.to_string());
    }

    let mut settings = config.repair_settings();
    if yes && settings.removal == RemovalPolicy::Confirm {
        settings.removal = RemovalPolicy::Allow;
    }

    let summary = {
        let session = Session::new(&store, settings);
        if targets.is_empty() {
            targets = session.find_broken().into_keys().collect();
        }
        if targets.is_empty() {
            println!("{} No broken packages found", "ok:".green().bold());
            return Ok(());
        }

        if dry_run {
            for id in &targets {
                match session.plan(id) {
                    Ok(plan) if plan.is_empty() => {
                        println!("{} {} needs no changes", "info:".blue().bold(), id)
                    }
                    Ok(plan) => print_plan(&plan),
                    Err(err) => println!("{} {}: {}", "warn:".yellow().bold(), id, err),
                }
            }
            println!("\n{} Run without --dry-run to apply changes", "hint:".cyan().bold());
            return Ok(());
        }

        session.repair_many(targets.iter().map(String::as_str), &PromptConfirm)
    };

    print_summary("repair", &summary);
    if !summary.repaired.is_empty() {
        for id in &summary.repaired {
            store.reload(id)?;
        }
        store.save()?;
    }
    Ok(())
}

fn cmd_optimize(config: &Config, ids: Vec<String>, dry_run: bool) -> Result<()> {
    let (mut store, _) = open_store(config)?;
    let targets: BTreeSet<String> = if ids.is_empty() {
        store.find_unoptimized()
    } else {
        ids.into_iter().collect()
    };
    if targets.is_empty() {
        println!("{} All manifests match their content", "ok:".green().bold());
        return Ok(());
    }

    if dry_run {
        for id in &targets {
            let package = store.require(id)?;
            let used = package.used_dependencies();
            println!("\n{} {}", "Would update:".yellow().bold(), id);
            for added in used.difference(&package.declared_dependencies) {
                println!("  {} {}", "+".green(), added.green());
            }
            for removed in package.declared_dependencies.difference(&used) {
                println!("  {} {}", "-".red(), removed.red());
            }
        }
        println!("\n{} Run without --dry-run to apply changes", "hint:".cyan().bold());
        return Ok(());
    }

    let summary = {
        let session = Session::new(&store, config.repair_settings());
        session.repair_metadata_many(targets.iter().map(String::as_str))
    };
    print_summary("optimize", &summary);
    if !summary.repaired.is_empty() {
        for id in &summary.repaired {
            store.reload(id)?;
        }
        store.save()?;
    }
    Ok(())
}

fn cmd_deps(config: &Config, id: &str, shallow: bool) -> Result<()> {
    let (store, _) = open_store(config)?;
    let session = Session::new(&store, config.repair_settings());
    let dependencies = session.dependencies(id, shallow)?;
    print_ids(&format!("{} dependencies of {}", dependencies.len(), id), &dependencies);
    Ok(())
}

fn cmd_uses(config: &Config, id: &str) -> Result<()> {
    let (store, _) = open_store(config)?;
    let session = Session::new(&store, config.repair_settings());
    let users = session.users(id);
    print_ids(&format!("{} package(s) use {}", users.len(), id), &users);
    Ok(())
}

fn cmd_missing(config: &Config) -> Result<()> {
    let (store, _) = open_store(config)?;
    let session = Session::new(&store, config.repair_settings());
    let missing = session.missing();

    if missing.is_empty() {
        println!("{} No missing dependencies", "ok:".green().bold());
        return Ok(());
    }
    println!("\n{} {} missing dependencies:", "Found".red().bold(), missing.len());
    for (dependency, users) in &missing {
        println!("  {}", dependency.red());
        for user in users {
            println!("    {} {}", "used by".dimmed(), user);
        }
    }
    Ok(())
}

fn cmd_unused(config: &Config, filters: &[String]) -> Result<()> {
    let (store, _) = open_store(config)?;
    let session = Session::new(&store, config.repair_settings());
    let unused = session.unused(filters);
    print_ids(&format!("{} unused package(s)", unused.len()), &unused);
    Ok(())
}

fn cmd_tag_unused(config: &Config) -> Result<()> {
    let (mut store, _) = open_store(config)?;
    let unused = Session::new(&store, config.repair_settings()).unused(&[]);
    let moved = store.relocate(
        unused.iter().map(String::as_str),
        &SubdirChange::Prefix(UNUSED_TAG.to_string()),
    )?;
    print_moved(&moved);
    Ok(())
}

fn cmd_version_duplicates(config: &Config) -> Result<()> {
    let (mut store, _) = open_store(config)?;
    let duplicates = store.find_unversioned_duplicates();
    let moved = store.relocate(
        duplicates.iter().map(String::as_str),
        &SubdirChange::Set(VERSIONED_DIRECTORY.to_string()),
    )?;
    print_moved(&moved);
    Ok(())
}

/// Applies `change` to `ids`, or to every package when `ids` is absent or empty.
fn cmd_relocate(config: &Config, ids: Option<Vec<String>>, change: SubdirChange) -> Result<()> {
    let (mut store, _) = open_store(config)?;
    let ids: Vec<String> = match ids {
        Some(ids) if !ids.is_empty() => ids,
        _ => store.packages().keys().cloned().collect(),
    };
    let moved = store.relocate(ids.iter().map(String::as_str), &change)?;
    print_moved(&moved);
    Ok(())
}

fn print_plan(plan: &RepairPlan) {
    println!("\n{} {}", "Would update:".yellow().bold(), plan.package_id);
    for (from, to) in &plan.replacements {
        match to {
            Some(to) => {
                println!("  {}", from.red());
                println!("    {} {}", "->".green(), to.green());
            }
            None => println!("  {} {}", from.red(), "(remove)".dimmed()),
        }
    }
}

fn print_summary(operation: &str, summary: &RepairSummary) {
    for (id, reason) in &summary.skipped {
        println!("  {} {} {}", "skipped:".yellow(), id, format!("({})", reason).dimmed());
    }
    for (id, error) in &summary.failed {
        println!("  {} {} {}", "failed:".red(), id, format!("({})", error).dimmed());
    }
    println!(
        "\n{} {}: {} updated, {} unchanged, {} skipped, {} failed",
        "ok:".green().bold(),
        operation,
        summary.repaired.len(),
        summary.unchanged.len(),
        summary.skipped.len(),
        summary.failed.len()
    );
}

fn print_health(report: &HealthReport) {
    println!(
        "{} {} packages, {:.1} GiB",
        "info:".blue().bold(),
        report.packages,
        report.total_size as f64 / (1024.0 * 1024.0 * 1024.0)
    );

    let sections: [(&str, &BTreeSet<String>); 4] = [
        ("unversioned duplicate(s)", &report.unversioned_duplicates),
        ("unoptimized manifest(s)", &report.unoptimized),
        ("broken package(s)", &report.broken),
        ("unused package(s)", &report.unused),
    ];
    println!("  {} missing dependencies", report.missing.len());
    for (dependency, users) in &report.missing {
        println!(
            "    {} {}",
            dependency.red(),
            format!("(used by {})", users.len()).dimmed()
        );
    }
    for (label, ids) in sections {
        println!("  {} {}", ids.len(), label);
    }
    if !report.top_packages.is_empty() {
        println!("  most referenced packages");
        for (id, uses) in &report.top_packages {
            println!("    {} {}", id, format!("({} references)", uses).dimmed());
        }
    }
    if !report.top_files.is_empty() {
        println!("  most referenced files");
        for ((id, path), uses) in &report.top_files {
            println!("    {}:/{} {}", id, path, format!("({} references)", uses).dimmed());
        }
    }

    if report.missing.is_empty() && report.broken.is_empty() {
        println!("{} No missing or broken packages", "ok:".green().bold());
    } else {
        println!(
            "\n{} Use `broken` and `repair --dry-run` to inspect fixes",
            "hint:".cyan().bold()
        );
    }
}

fn print_ids(title: &str, ids: &BTreeSet<String>) {
    println!("{} {}", "info:".blue().bold(), title);
    for id in ids {
        println!("  {}", id);
    }
}

fn print_moved(moved: &[String]) {
    if moved.is_empty() {
        println!("{} No packages to move", "info:".blue().bold());
        return;
    }
    for id in moved {
        println!("  {} {}", "moved".dimmed(), id);
    }
    println!("{} Moved {} package(s)", "ok:".green().bold(), moved.len());
}
