//! Package-metadata path rewriting.
//!
//! `.pth` path-list files and legacy `.egg-link` files may record absolute
//! paths into the environment. Rewriting them relative to their own directory
//! keeps them valid after the tree moves. Only path representation changes;
//! comments, import lines and already-relative entries are preserved
//! verbatim.

use log::{debug, info, warn};
use std::path::Path;

use super::{PatchOutcome, RelocationReport, SkipReason};
use crate::runtime::{Runtime, relative_to};

/// Fix every path-list and link file in the library directories. Unwritable
/// files are reported and skipped; nothing aborts the pass.
pub fn fix_metadata_paths<R: Runtime>(
    runtime: &R,
    lib_dirs: &[std::path::PathBuf],
    report: &mut RelocationReport,
) {
    for dir in lib_dirs {
        if !runtime.is_dir(dir) {
            debug!("Skipping missing library directory {}", dir.display());
            continue;
        }
        let mut entries = runtime.read_dir(dir).unwrap_or_default();
        entries.sort();
        for entry in entries {
            if !runtime.is_file(&entry) {
                continue;
            }
            let Some(name) = entry.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let outcome = if name.ends_with(".pth") {
                fix_path_list_file(runtime, &entry)
            } else if name.ends_with(".egg-link") {
                fix_link_file(runtime, &entry)
            } else {
                continue;
            };
            report.record(&name, outcome);
        }
    }
}

/// Rewrite the absolute-path lines of a `.pth` file. Returns `Unchanged`
/// without writing when every line was already relative (or non-path).
pub fn fix_path_list_file<R: Runtime>(runtime: &R, path: &Path) -> PatchOutcome {
    if !runtime.is_writable(path) {
        warn!("Cannot write .pth file {}, skipping", path.display());
        return PatchOutcome::Skipped(SkipReason::Unwritable);
    }
    let content = match runtime.read_to_string(path) {
        Ok(content) => content,
        Err(e) => return PatchOutcome::Failed(e.to_string()),
    };

    let mut changed = false;
    let mut lines: Vec<String> = Vec::new();
    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty()
            || line.starts_with('#')
            || line.starts_with("import ")
            || line.starts_with("import\t")
            || !Path::new(line).is_absolute()
        {
            lines.push(line.to_string());
            continue;
        }
        let relative = relative_to(path, Path::new(line), true);
        if relative != line {
            debug!("Rewriting path {} as {} (in {})", line, relative, path.display());
            changed = true;
        }
        lines.push(relative);
    }

    if !changed {
        debug!("No changes to .pth file {}", path.display());
        return PatchOutcome::Unchanged;
    }

    info!("Making paths in .pth file {} relative", path.display());
    match runtime.write(path, format!("{}\n", lines.join("\n")).as_bytes()) {
        Ok(()) => PatchOutcome::Patched,
        Err(e) => {
            warn!("Could not rewrite {}: {:#}", path.display(), e);
            PatchOutcome::Failed(e.to_string())
        }
    }
}

/// Rewrite the single path recorded in a `.egg-link` file.
pub fn fix_link_file<R: Runtime>(runtime: &R, path: &Path) -> PatchOutcome {
    if !runtime.is_writable(path) {
        warn!("Cannot write link file {}, skipping", path.display());
        return PatchOutcome::Skipped(SkipReason::Unwritable);
    }
    let content = match runtime.read_to_string(path) {
        Ok(content) => content,
        Err(e) => return PatchOutcome::Failed(e.to_string()),
    };

    let link = content.lines().next().unwrap_or("").trim();
    if !Path::new(link).is_absolute() {
        debug!("Link in {} already relative", path.display());
        return PatchOutcome::Unchanged;
    }

    let relative = relative_to(path, Path::new(link), true);
    info!("Rewriting link {} in {} as {}", link, path.display(), relative);
    match runtime.write(path, relative.as_bytes()) {
        Ok(()) => PatchOutcome::Patched,
        Err(e) => {
            warn!("Could not rewrite {}: {:#}", path.display(), e);
            PatchOutcome::Failed(e.to_string())
        }
    }
}
