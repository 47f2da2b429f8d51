//! Clean command implementation.
//!
//! Rounds write their batches under `<root>/<scope id>/<round id>`. A
//! committed round removes its directory; a failed one leaves it behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};
use uuid::Uuid;

/// Outcome of a clean pass.
#[derive(Debug, Default)]
pub struct CleanReport {
    /// Round directories removed (or that would be).
    pub removed: Vec<PathBuf>,
    /// Round directories younger than the threshold.
    pub kept: usize,
    /// Bytes held by the removed directories.
    pub bytes: u64,
}

/// Runs the clean command.
pub fn run(root: &Path, older_than: Duration, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !root.is_dir() {
        return Err(format!("Batch directory not found: {:?}", root).into());
    }

    println!("Cleaning batches at {:?}", root);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let report = clean(root, older_than, dry_run)?;
    for dir in &report.removed {
        println!("  {} {}", if dry_run { "would remove" } else { "removed" }, dir.display());
    }
    println!();
    println!("Rounds removed: {}", report.removed.len());
    println!("Rounds kept:    {}", report.kept);
    println!("Space freed:    {} bytes", report.bytes);

    Ok(())
}

/// Removes round directories idle for at least `older_than`.
pub fn clean(root: &Path, older_than: Duration, dry_run: bool) -> std::io::Result<CleanReport> {
    let now = SystemTime::now();
    let mut report = CleanReport::default();

    for scope in fs::read_dir(root)? {
        let scope = scope?.path();
        if !is_id_dir(&scope) {
            debug!(path = %scope.display(), "skipping unknown entry");
            continue;
        }

        for round in fs::read_dir(&scope)? {
            let round = round?.path();
            if !is_id_dir(&round) {
                continue;
            }
            let idle = now
                .duration_since(last_modified(&round)?)
                .unwrap_or_default();
            if idle < older_than {
                report.kept += 1;
                continue;
            }
            report.bytes += dir_size(&round)?;
            if !dry_run {
                fs::remove_dir_all(&round)?;
                info!(path = %round.display(), "round directory removed");
            }
            report.removed.push(round);
        }

        if !dry_run && fs::read_dir(&scope)?.next().is_none() {
            fs::remove_dir(&scope)?;
        }
    }

    Ok(report)
}

fn is_id_dir(path: &Path) -> bool {
    path.is_dir()
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| Uuid::parse_str(name).is_ok())
}

fn last_modified(dir: &Path) -> std::io::Result<SystemTime> {
    let mut latest = fs::metadata(dir)?.modified()?;
    for entry in fs::read_dir(dir)? {
        let modified = entry?.metadata()?.modified()?;
        latest = latest.max(modified);
    }
    Ok(latest)
}

fn dir_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let metadata = entry?.metadata()?;
        if metadata.is_file() {
            total += metadata.len();
        }
    }
    Ok(total)
}
