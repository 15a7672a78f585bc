//! Installed entry-point enumeration and materialization.
//!
//! Distributions record their console and GUI scripts in an
//! `entry_points.txt` file inside their `.dist-info` (or legacy `.egg-info`)
//! directory. Enumeration parses those files; materialization copies the
//! corresponding launcher artifacts out of the binary directory and patches
//! the copies in place, so the copies self-locate wherever they land.

use anyhow::Result;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::interpreter::{expand_suffixes, find_in_dirs};
use crate::layout::{EnvLayout, Platform};
use crate::patch::{self, PatchOutcome, RelocationReport, SkipReason};
use crate::runtime::Runtime;

const ENTRY_POINTS_FILE: &str = "entry_points.txt";
const SCRIPT_SECTIONS: &[&str] = &["console_scripts", "gui_scripts"];

/// Launcher suffixes tried when resolving an entry point to a file on disk.
const WINDOWS_SUFFIXES: &[&str] = &[".exe", ".bat", ".py"];

/// List script entry points per distribution, sorted by distribution name.
/// `package` filters to a single distribution (name-normalized comparison,
/// so `My-Pkg` matches `my_pkg`).
pub fn list_entry_points<R: Runtime>(
    runtime: &R,
    lib_dirs: &[PathBuf],
    package: Option<&str>,
) -> BTreeMap<String, Vec<String>> {
    let mut result = BTreeMap::new();
    for dir in lib_dirs {
        let mut entries = runtime.read_dir(dir).unwrap_or_default();
        entries.sort();
        for entry in entries {
            let Some(name) = entry.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if !name.ends_with(".dist-info") && !name.ends_with(".egg-info") {
                continue;
            }
            if !runtime.is_dir(&entry) {
                continue;
            }
            let dist = dist_name(&name);
            if let Some(wanted) = package
                && normalize(wanted) != normalize(&dist)
            {
                continue;
            }
            let manifest = entry.join(ENTRY_POINTS_FILE);
            let Ok(content) = runtime.read_to_string(&manifest) else {
                debug!("{} has no {}", entry.display(), ENTRY_POINTS_FILE);
                continue;
            };
            let scripts = parse_script_names(&content);
            if !scripts.is_empty() {
                result.insert(dist, scripts);
            }
        }
    }
    result
}

/// Copy the launcher artifacts behind the selected entry points into
/// `target_dir` and patch each copy. Reports one outcome per entry point;
/// names with no resolvable artifact are recorded as skipped.
pub fn materialize_entry_points<R: Runtime>(
    runtime: &R,
    layout: &EnvLayout,
    package: Option<&str>,
    target_dir: &Path,
) -> Result<RelocationReport> {
    runtime.create_dir_all(target_dir)?;

    let mut report = RelocationReport::default();
    let bin_dirs = vec![layout.bin_dir.clone()];
    for scripts in list_entry_points(runtime, &layout.lib_dirs, package).values() {
        for script in scripts {
            let names = candidate_names(script, layout.platform);
            let Some(source) = find_in_dirs(&names, &bin_dirs, |p| is_launcher(runtime, layout, p))
            else {
                warn!("No launcher found for entry point {}", script);
                report.record(script, PatchOutcome::Skipped(SkipReason::Missing));
                continue;
            };
            let outcome = match copy_and_patch(runtime, layout, &source, target_dir) {
                Ok(outcome) => outcome,
                Err(e) => PatchOutcome::Failed(e.to_string()),
            };
            report.record(script, outcome);
        }
    }
    Ok(report)
}

fn copy_and_patch<R: Runtime>(
    runtime: &R,
    layout: &EnvLayout,
    source: &Path,
    target_dir: &Path,
) -> Result<PatchOutcome> {
    let Some(file_name) = source.file_name() else {
        return Ok(PatchOutcome::Skipped(SkipReason::Missing));
    };
    let target = target_dir.join(file_name);
    debug!("Materializing {} as {}", source.display(), target.display());
    runtime.copy(source, &target)?;
    if let Some(mode) = runtime.file_mode(source)? {
        runtime.set_permissions(&target, mode)?;
    }
    Ok(patch::patch_artifact(runtime, layout, &target))
}

fn is_launcher<R: Runtime>(runtime: &R, layout: &EnvLayout, path: &Path) -> bool {
    match layout.platform {
        Platform::Posix => runtime.is_executable(path),
        Platform::Windows => runtime.is_file(path),
    }
}

fn candidate_names(script: &str, platform: Platform) -> Vec<String> {
    match platform {
        Platform::Posix => vec![script.to_string()],
        Platform::Windows => expand_suffixes(script, WINDOWS_SUFFIXES),
    }
}

/// `pip-23.1.dist-info` and `pip.egg-info` both name the `pip` distribution.
fn dist_name(dir_name: &str) -> String {
    let stem = dir_name
        .strip_suffix(".dist-info")
        .or_else(|| dir_name.strip_suffix(".egg-info"))
        .unwrap_or(dir_name);
    stem.split('-').next().unwrap_or(stem).to_string()
}

fn normalize(name: &str) -> String {
    name.to_lowercase().replace('-', "_")
}

/// Script names from the `[console_scripts]` and `[gui_scripts]` sections of
/// an `entry_points.txt` manifest, in file order.
fn parse_script_names(content: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut in_script_section = false;
    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            in_script_section = SCRIPT_SECTIONS.contains(&section.trim());
            continue;
        }
        if !in_script_section {
            continue;
        }
        if let Some((name, _target)) = line.split_once('=') {
            names.push(name.trim().to_string());
        }
    }
    names
}
