//! The relocation engine.
//!
//! `make_relocatable` is the public entry point: it sequences the script,
//! launcher, activation and metadata patchers over one environment and
//! accumulates per-artifact outcomes into a report. Re-running the pass on an
//! already-patched environment is a pure no-op; every sub-step detects its
//! own "already patched" state through a sentinel substring, which keeps the
//! engine stateless between runs.

pub mod activate;
pub mod launcher;
pub mod metadata;
pub mod script;

use anyhow::{Result, bail};
use log::debug;
use serde::Serialize;
use std::io::Cursor;
use std::path::Path;

use crate::layout::EnvLayout;
use crate::runtime::Runtime;

pub use activate::{Dialect, patch_activation_file, patch_activation_scripts};
pub use launcher::LauncherPatcher;
pub use metadata::{fix_link_file, fix_metadata_paths, fix_path_list_file};
pub use script::ScriptPatcher;

/// Why an artifact was left alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// Interpreter copies, activation scripts, the bootstrap file.
    Exempt,
    /// First line is not the environment's own interpreter path.
    UnrecognizedShebang,
    /// Neither a text script nor an archive launcher.
    Opaque,
    /// No write permission.
    Unwritable,
    /// Zero-length file.
    Empty,
    /// Named artifact does not exist.
    Missing,
}

/// Outcome of one patch decision, as reported per artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchOutcome {
    Patched,
    AlreadyPatched,
    /// Inspected and found to need no rewrite (metadata files).
    Unchanged,
    Skipped(SkipReason),
    /// The dialect has no self-location primitive.
    Unsupported,
    /// The dialect is implemented but the expected literal was not found.
    PatternNotFound,
    Failed(String),
}

impl std::fmt::Display for PatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchOutcome::Patched => write!(f, "patched"),
            PatchOutcome::AlreadyPatched => write!(f, "already patched"),
            PatchOutcome::Unchanged => write!(f, "unchanged"),
            PatchOutcome::Skipped(reason) => write!(f, "skipped ({:?})", reason),
            PatchOutcome::Unsupported => write!(f, "unsupported"),
            PatchOutcome::PatternNotFound => write!(f, "pattern not found"),
            PatchOutcome::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Shape of one artifact, decided once before any mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    TextScript,
    BinaryLauncher,
    Opaque,
}

/// Classify raw artifact bytes: valid UTF-8 is a text script, an openable
/// zip tail is an archive launcher, anything else is opaque.
pub fn classify(bytes: &[u8]) -> ArtifactKind {
    if std::str::from_utf8(bytes).is_ok() {
        ArtifactKind::TextScript
    } else if zip::ZipArchive::new(Cursor::new(bytes)).is_ok() {
        ArtifactKind::BinaryLauncher
    } else {
        ArtifactKind::Opaque
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactOutcome {
    pub name: String,
    pub outcome: PatchOutcome,
}

/// Per-artifact outcomes of one relocation pass.
#[derive(Debug, Default, Serialize)]
pub struct RelocationReport {
    pub artifacts: Vec<ArtifactOutcome>,
}

/// Outcome totals, used for summaries and exit decisions.
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub patched: usize,
    pub already_patched: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub unsupported: usize,
    pub pattern_not_found: usize,
    pub failed: usize,
}

impl RelocationReport {
    pub fn record(&mut self, name: &str, outcome: PatchOutcome) {
        self.artifacts.push(ArtifactOutcome {
            name: name.to_string(),
            outcome,
        });
    }

    pub fn outcome_of(&self, name: &str) -> Option<&PatchOutcome> {
        self.artifacts
            .iter()
            .find(|a| a.name == name)
            .map(|a| &a.outcome)
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for artifact in &self.artifacts {
            match &artifact.outcome {
                PatchOutcome::Patched => counts.patched += 1,
                PatchOutcome::AlreadyPatched => counts.already_patched += 1,
                PatchOutcome::Unchanged => counts.unchanged += 1,
                PatchOutcome::Skipped(_) => counts.skipped += 1,
                PatchOutcome::Unsupported => counts.unsupported += 1,
                PatchOutcome::PatternNotFound => counts.pattern_not_found += 1,
                PatchOutcome::Failed(_) => counts.failed += 1,
            }
        }
        counts
    }

    /// True when the pass mutated nothing: every artifact either reported
    /// its patched state or needed no rewrite.
    pub fn is_noop(&self) -> bool {
        self.artifacts.iter().all(|a| {
            matches!(
                a.outcome,
                PatchOutcome::AlreadyPatched
                    | PatchOutcome::Unchanged
                    | PatchOutcome::Skipped(_)
                    | PatchOutcome::Unsupported
            )
        })
    }
}

/// Leftovers of an interrupted launcher replacement; never patched.
fn is_transient_name(name: &str) -> bool {
    name.ends_with(".deleteme") || name.ends_with(".new") || name.ends_with(".tmp")
}

/// Run the full relocation pass over one environment.
///
/// Per-artifact problems are accumulated into the report; the only fatal
/// condition is a missing bootstrap file, without which no patched artifact
/// could run.
pub fn make_relocatable<R: Runtime>(runtime: &R, layout: &EnvLayout) -> Result<RelocationReport> {
    let bootstrap = layout.bootstrap_path();
    if !runtime.is_file(&bootstrap) {
        bail!(
            "The environment doesn't have a bootstrap file at {} -- \
             run `relocenv bootstrap {}` to create it before relocating",
            bootstrap.display(),
            layout.root.display()
        );
    }

    let mut report = RelocationReport::default();
    let scripts = ScriptPatcher::new(runtime, layout);
    let launchers = LauncherPatcher::new(runtime, layout);
    let exempt = layout.exempt_names();
    let activation_names: Vec<&str> = activate::DIALECT_FILES.iter().map(|(n, _)| *n).collect();

    let mut entries = runtime.read_dir(&layout.bin_dir)?;
    entries.sort();
    for entry in entries {
        if !runtime.is_file(&entry) {
            // Ignore child directories, e.g. __pycache__
            continue;
        }
        let Some(name) = entry.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if activation_names.contains(&name.as_str()) {
            // Patched below by the per-dialect pass
            continue;
        }
        if is_transient_name(&name) {
            debug!("Ignoring transient file {}", entry.display());
            continue;
        }
        if exempt.contains(&name) {
            report.record(&name, PatchOutcome::Skipped(SkipReason::Exempt));
            continue;
        }
        let outcome = match runtime.read(&entry) {
            Ok(bytes) => match classify(&bytes) {
                ArtifactKind::TextScript => scripts.patch_file(&entry),
                ArtifactKind::BinaryLauncher => launchers.patch_file(&entry),
                ArtifactKind::Opaque => {
                    debug!("{} is neither a script nor a launcher", entry.display());
                    PatchOutcome::Skipped(SkipReason::Opaque)
                }
            },
            Err(e) => PatchOutcome::Failed(e.to_string()),
        };
        report.record(&name, outcome);
    }

    patch_activation_scripts(runtime, layout, &mut report);
    fix_metadata_paths(runtime, &layout.lib_dirs, &mut report);

    Ok(report)
}

/// Patch one artifact outside the standard pass, classifying it first. Used
/// for launchers materialized via copy-and-patch.
pub fn patch_artifact<R: Runtime>(runtime: &R, layout: &EnvLayout, path: &Path) -> PatchOutcome {
    let bytes = match runtime.read(path) {
        Ok(bytes) => bytes,
        Err(e) => return PatchOutcome::Failed(e.to_string()),
    };
    match classify(&bytes) {
        ArtifactKind::TextScript => ScriptPatcher::new(runtime, layout).patch_file(path),
        ArtifactKind::BinaryLauncher => LauncherPatcher::new(runtime, layout).patch_file(path),
        ArtifactKind::Opaque => PatchOutcome::Skipped(SkipReason::Opaque),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RealRuntime;
    use crate::test_utils::scaffold_posix_env;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_classify_variants() {
        assert_eq!(classify(b"#!/usr/bin/python\nprint()\n"), ArtifactKind::TextScript);
        assert_eq!(classify(b"\x7fELF\x02\x01\x01\x00"), ArtifactKind::Opaque);

        // A launcher tail is enough for zip detection
        let mut launcher = b"MZ\x90\x00\xff\xfe".to_vec();
        launcher.extend_from_slice(&crate::test_utils::tiny_zip(b"print()"));
        assert_eq!(classify(&launcher), ArtifactKind::BinaryLauncher);
    }

    #[test]
    fn test_make_relocatable_requires_bootstrap() {
        let dir = tempdir().unwrap();
        let layout = scaffold_posix_env(dir.path());
        fs::remove_file(layout.bootstrap_path()).unwrap();

        let result = make_relocatable(&RealRuntime, &layout);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("bootstrap file"));
    }

    #[test]
    fn test_make_relocatable_full_pass() {
        let dir = tempdir().unwrap();
        let layout = scaffold_posix_env(dir.path());

        let report = make_relocatable(&RealRuntime, &layout).unwrap();

        assert_eq!(report.outcome_of("console-tool"), Some(&PatchOutcome::Patched));
        assert_eq!(report.outcome_of("activate"), Some(&PatchOutcome::Patched));
        assert_eq!(report.outcome_of("pkg.pth"), Some(&PatchOutcome::Patched));
        assert_eq!(
            report.outcome_of("python"),
            Some(&PatchOutcome::Skipped(SkipReason::Exempt))
        );
        assert_eq!(report.counts().failed, 0);
    }

    #[test]
    fn test_make_relocatable_is_idempotent() {
        let dir = tempdir().unwrap();
        let layout = scaffold_posix_env(dir.path());

        make_relocatable(&RealRuntime, &layout).unwrap();
        let snapshot: Vec<(std::path::PathBuf, Vec<u8>)> = fs::read_dir(&layout.bin_dir)
            .unwrap()
            .map(|e| {
                let p = e.unwrap().path();
                let content = fs::read(&p).unwrap();
                (p, content)
            })
            .collect();

        let second = make_relocatable(&RealRuntime, &layout).unwrap();
        assert!(second.is_noop(), "second pass must be a pure no-op: {:?}", second);
        for (path, content) in snapshot {
            assert_eq!(fs::read(&path).unwrap(), content, "{} changed", path.display());
        }
    }

    #[test]
    fn test_report_counts_and_serialization() {
        let mut report = RelocationReport::default();
        report.record("a", PatchOutcome::Patched);
        report.record("b", PatchOutcome::Skipped(SkipReason::Exempt));
        report.record("c", PatchOutcome::Failed("busy".to_string()));

        let counts = report.counts();
        assert_eq!(counts.patched, 1);
        assert_eq!(counts.skipped, 1);
        assert_eq!(counts.failed, 1);
        assert!(!report.is_noop());

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains(r#""outcome":"patched""#));
        assert!(json.contains(r#""skipped":"exempt""#));
    }
}
