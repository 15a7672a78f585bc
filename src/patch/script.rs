//! Text launcher script patching.
//!
//! Console and GUI entry-point scripts are written at install time with an
//! absolute shebang pointing at the environment's interpreter. Patching
//! replaces that header with a portable one and splices in a statement that
//! resolves `activate_this.py` next to the script itself at run time.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::path::Path;

use super::{PatchOutcome, SkipReason};
use crate::layout::{EnvLayout, Platform};
use crate::runtime::Runtime;

/// Sentinel substring marking an artifact as already patched. The bootstrap
/// invocation always contains it, so one content scan is enough.
pub(crate) const SENTINEL: &str = "activate_this";

/// Bootstrap invocation spliced into plain text scripts. The script resolves
/// its own location, executes the bootstrap file in place, and discards the
/// temporary names it introduced.
const ACTIVATE: &str = "import os; \
activate_this=os.path.join(os.path.dirname(os.path.realpath(__file__)), 'activate_this.py'); \
exec(compile(open(activate_this).read(), activate_this, 'exec'), { '__file__': activate_this}); \
del os, activate_this";

/// Variant for scripts embedded in a launcher archive, where `__file__` on
/// Windows points inside the archive rather than at the launcher.
const ACTIVATE_EMBEDDED: &str = "import os; import sys; \
file=os.path.dirname(os.path.realpath(__file__)) if sys.platform=='win32' else os.path.realpath(__file__); \
activate_this=os.path.join(os.path.dirname(file), 'activate_this.py'); \
exec(compile(open(activate_this).read(), activate_this, 'exec'), { '__file__': activate_this}); \
del os, sys, file, activate_this";

pub struct ScriptPatcher<'a, R: Runtime> {
    runtime: &'a R,
    layout: &'a EnvLayout,
}

impl<'a, R: Runtime> ScriptPatcher<'a, R> {
    pub fn new(runtime: &'a R, layout: &'a EnvLayout) -> Self {
        ScriptPatcher { runtime, layout }
    }

    /// The header every unpatched script is expected to start with: the
    /// environment's own interpreter path. Matched as a prefix so that
    /// `python`, `python3` and `pythonX.Y` variants are all recognized.
    fn expected_shebang(&self) -> String {
        format!(
            "#!{}",
            normcase(&self.layout.bin_dir.join("python").display().to_string())
        )
    }

    /// Relocation-agnostic replacement header: the interpreter is resolved
    /// through the system's generic lookup mechanism instead of a baked path.
    pub(crate) fn portable_shebang(&self) -> String {
        match self.layout.platform {
            Platform::Posix => format!("#!/usr/bin/env {}", self.layout.versioned_interpreter()),
            Platform::Windows => {
                let comspec = self
                    .runtime
                    .env_var("COMSPEC")
                    .unwrap_or_else(|_| "cmd.exe".to_string());
                format!("#!{} /c python.exe", normcase(&comspec))
            }
        }
    }

    /// Patch one script file in place.
    pub fn patch_file(&self, path: &Path) -> PatchOutcome {
        let name = file_name(path);
        let content = match self.runtime.read(path) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(content) => content,
                // A binary artifact; launcher handling takes over.
                Err(_) => return PatchOutcome::Skipped(SkipReason::Opaque),
            },
            Err(e) => return PatchOutcome::Failed(e.to_string()),
        };

        match self.patch_source(&name, &content) {
            Outcome::Done(patched) => match self.write_preserving_mode(path, patched.as_bytes()) {
                Ok(()) => {
                    info!("Made script {} relative", path.display());
                    PatchOutcome::Patched
                }
                Err(e) => {
                    warn!("Could not rewrite {}: {:#}", path.display(), e);
                    PatchOutcome::Failed(e.to_string())
                }
            },
            Outcome::Report(outcome) => outcome,
        }
    }

    /// Content-level transformation, shared with the binary launcher patcher.
    fn patch_source(&self, name: &str, content: &str) -> Outcome {
        if content.contains(SENTINEL) {
            debug!("Script {} has already been patched", name);
            return Outcome::Report(PatchOutcome::AlreadyPatched);
        }

        let lines: Vec<&str> = content.lines().collect();
        let Some(first) = lines.first() else {
            warn!("Script {} is an empty file", name);
            return Outcome::Report(PatchOutcome::Skipped(SkipReason::Empty));
        };

        let new_shebang = self.portable_shebang();
        let old_shebang = normcase_shebang(first.trim());
        if !old_shebang.starts_with(&self.expected_shebang()) {
            if self.layout.exempt_names().iter().any(|n| n == name) {
                // Interpreter copies and activation scripts keep their headers;
                // activation scripts are handled by their own patch pass.
                return Outcome::Report(PatchOutcome::Skipped(SkipReason::Exempt));
            }
            if first.trim() == new_shebang {
                debug!("Script {} has already been made relative", name);
                return Outcome::Report(PatchOutcome::AlreadyPatched);
            }
            warn!(
                "Script {} cannot be made relative (it's not a normal script that starts with {})",
                name,
                self.expected_shebang()
            );
            return Outcome::Report(PatchOutcome::Skipped(SkipReason::UnrecognizedShebang));
        }

        let mut patched: Vec<String> = Vec::with_capacity(lines.len() + 3);
        patched.push(new_shebang);
        patched.extend(lines[1..].iter().map(|l| l.to_string()));
        let at = insertion_point(&patched);
        patched.splice(at..at, ["".to_string(), ACTIVATE.to_string(), "".to_string()]);

        Outcome::Done(patched.join("\n"))
    }

    /// Transform the body of a launcher-embedded script: the shebang lives in
    /// the launcher itself, so any header line is dropped and the bootstrap
    /// invocation is prepended before the first statement.
    pub(crate) fn patch_embedded(&self, name: &str, content: &str) -> Option<String> {
        if content.contains(SENTINEL) {
            debug!("Embedded script in {} has already been patched", name);
            return None;
        }
        let body: Vec<&str> = content
            .lines()
            .filter(|line| !line.starts_with("#!"))
            .collect();
        Some(format!("{}\n{}", ACTIVATE_EMBEDDED, body.join("\n")))
    }

    /// Atomic write: temp sibling plus rename, keeping the original mode so
    /// the executable bit survives the rewrite.
    fn write_preserving_mode(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let mode = self.runtime.file_mode(path)?;
        let tmp = path.with_file_name(format!("{}.tmp", file_name(path)));
        self.runtime
            .write(&tmp, contents)
            .with_context(|| format!("Failed to stage rewrite of {}", path.display()))?;
        if let Some(mode) = mode {
            self.runtime.set_permissions(&tmp, mode)?;
        }
        self.runtime
            .rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

enum Outcome {
    /// Patched content ready to be written back.
    Done(String),
    Report(PatchOutcome),
}

/// Index at which the bootstrap invocation may be inserted: after the shebang,
/// but never before a `from __future__ import` line, which must stay first.
fn insertion_point(lines: &[String]) -> usize {
    for (idx, line) in lines.iter().enumerate().rev() {
        let words: Vec<&str> = line.split_whitespace().take(3).collect();
        if words == ["from", "__future__", "import"] {
            return idx + 1;
        }
    }
    1
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Case-normalize the path part of a shebang, keeping the `#!` marker intact.
fn normcase_shebang(line: &str) -> String {
    match line.strip_prefix("#!") {
        Some(rest) => format!("#!{}", normcase(rest)),
        None => line.to_string(),
    }
}

#[cfg(windows)]
fn normcase(path: &str) -> String {
    path.to_lowercase()
}

#[cfg(not(windows))]
fn normcase(path: &str) -> String {
    path.to_string()
}
