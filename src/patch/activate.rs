//! Shell activation script patching.
//!
//! Each supported shell dialect gets its own transformation that swaps the
//! creation-time `VIRTUAL_ENV` string literal for a dialect-native lookup of
//! the sourced script's own location. Dialects without a reliable
//! self-location primitive are reported as unsupported rather than silently
//! left un-relocatable.

use log::{debug, error, info, warn};
use std::path::Path;

use super::{PatchOutcome, RelocationReport};
use crate::layout::EnvLayout;
use crate::runtime::Runtime;

/// One strategy per dialect, selected once from the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// bash, sh, ksh, zsh, dash
    Posix,
    /// cmd.exe batch
    Bat,
    Fish,
    Csh,
    /// xonsh: no self-location primitive is known
    Xonsh,
    /// nushell: no self-location primitive is known
    Nushell,
}

/// Activation files by name, in the order they are visited.
pub const DIALECT_FILES: &[(&str, Dialect)] = &[
    ("activate", Dialect::Posix),
    ("activate.sh", Dialect::Posix),
    ("activate.bat", Dialect::Bat),
    ("activate.fish", Dialect::Fish),
    ("activate.csh", Dialect::Csh),
    ("activate.xsh", Dialect::Xonsh),
    ("activate.nu", Dialect::Nushell),
];

impl Dialect {
    /// Substring that marks a file as already patched.
    fn sentinel(self) -> Option<&'static str> {
        match self {
            Dialect::Posix => Some("ACTIVATE_PATH_FALLBACK"),
            Dialect::Bat => Some("~dp0"),
            Dialect::Fish | Dialect::Csh => Some("dirname"),
            Dialect::Xonsh | Dialect::Nushell => None,
        }
    }
}

/// Patch every activation script present in the binary directory, recording
/// one outcome per file.
pub fn patch_activation_scripts<R: Runtime>(
    runtime: &R,
    layout: &EnvLayout,
    report: &mut RelocationReport,
) {
    for (name, dialect) in DIALECT_FILES {
        let path = layout.bin_dir.join(name);
        if !runtime.is_file(&path) {
            continue;
        }
        let outcome = patch_activation_file(runtime, &path, *dialect);
        report.record(name, outcome);
    }
}

/// Patch a single activation script with the given dialect strategy.
pub fn patch_activation_file<R: Runtime>(
    runtime: &R,
    path: &Path,
    dialect: Dialect,
) -> PatchOutcome {
    if matches!(dialect, Dialect::Xonsh | Dialect::Nushell) {
        error!(
            "No patch algorithm for {:?} is available to patch {}. Unable to make relocatable.",
            dialect,
            path.display()
        );
        return PatchOutcome::Unsupported;
    }

    let content = match runtime.read_to_string(path) {
        Ok(content) => content,
        Err(e) => return PatchOutcome::Failed(e.to_string()),
    };

    if let Some(sentinel) = dialect.sentinel()
        && content.contains(sentinel)
    {
        debug!("{} has already been made relocatable", path.display());
        return PatchOutcome::AlreadyPatched;
    }

    let transformed = match dialect {
        Dialect::Posix => patch_posix(&content),
        Dialect::Bat => patch_bat(&content),
        Dialect::Fish => patch_fish(&content),
        Dialect::Csh => patch_csh(&content),
        Dialect::Xonsh | Dialect::Nushell => unreachable!(),
    };

    match transformed {
        Some(patched) => match runtime.write(path, patched.as_bytes()) {
            Ok(()) => {
                info!("Made {} relocatable", path.display());
                PatchOutcome::Patched
            }
            Err(e) => {
                warn!("Could not rewrite {}: {:#}", path.display(), e);
                PatchOutcome::Failed(e.to_string())
            }
        },
        None => {
            warn!(
                "Could not find the VIRTUAL_ENV assignment in {}; its format may have changed",
                path.display()
            );
            PatchOutcome::PatternNotFound
        }
    }
}

/// Replace one matching line and return the full content; `None` when no
/// line matched the predicate.
fn replace_line<F>(content: &str, matches: F, replacement: impl Fn(&str) -> String) -> Option<String>
where
    F: Fn(&str) -> bool,
{
    let mut replaced = false;
    let mut lines: Vec<String> = Vec::new();
    for line in content.lines() {
        if !replaced && matches(line) {
            lines.push(replacement(line));
            replaced = true;
        } else {
            lines.push(line.to_string());
        }
    }
    if !replaced {
        return None;
    }
    let mut result = lines.join("\n");
    if content.ends_with('\n') {
        result.push('\n');
    }
    Some(result)
}

/// The literal between the first pair of double quotes on a line.
fn quoted_value(line: &str) -> &str {
    let Some(start) = line.find('"') else { return "" };
    let rest = &line[start + 1..];
    match rest.find('"') {
        Some(end) => &rest[..end],
        None => "",
    }
}

fn patch_posix(content: &str) -> Option<String> {
    // The fallback capture must run before anything else in the script
    // clobbers `$_`, so it is anchored to the `deactivate` definition.
    let with_fallback = replace_line(
        content,
        |line| line.trim_end() == "deactivate () {",
        |line| format!("ACTIVATE_PATH_FALLBACK=\"$_\"\n{}", line),
    )?;

    replace_line(
        &with_fallback,
        |line| line.starts_with("VIRTUAL_ENV=\"") && line.trim_end().ends_with('"'),
        |line| {
            let baked = quoted_value(line);
            format!(
                r#"# Attempt to determine VIRTUAL_ENV in relocatable way
if [ ! -z "${{BASH_SOURCE:-}}" ]; then
    # bash
    ACTIVATE_PATH="${{BASH_SOURCE}}"
elif [ ! -z "${{DASH_SOURCE:-}}" ]; then
    # dash
    ACTIVATE_PATH="${{DASH_SOURCE}}"
elif [ ! -z "${{ZSH_VERSION:-}}" ]; then
    # zsh
    ACTIVATE_PATH="$0"
elif [ ! -z "${{KSH_VERSION:-}}" ] || [ ! -z "${{.sh.version:}}" ]; then
    # ksh - we have to use history, and unescape spaces before quoting
    ACTIVATE_PATH="$(history -r -l -n | head -1 | sed -e 's/^[\t ]*\(\.\|source\) *//;s/\\ / /g')"
elif [ "$(basename "$ACTIVATE_PATH_FALLBACK")" = "activate.sh" ]; then
    ACTIVATE_PATH="${{ACTIVATE_PATH_FALLBACK}}"
else
    ACTIVATE_PATH=""
fi

# Default to non-relocatable path
VIRTUAL_ENV="{baked}"
if [ ! -z "${{ACTIVATE_PATH:-}}" ]; then
    VIRTUAL_ENV="$(cd "$(dirname "${{ACTIVATE_PATH}}")/.."; pwd)"
fi
unset ACTIVATE_PATH
unset ACTIVATE_PATH_FALLBACK"#
            )
        },
    )
}

fn patch_bat(content: &str) -> Option<String> {
    // venv writes `set "VIRTUAL_ENV=..."`, virtualenv writes it unquoted
    replace_line(
        content,
        |line| line.starts_with("set \"VIRTUAL_ENV=") || line.starts_with("set VIRTUAL_ENV="),
        |_| "pushd %~dp0..\nset \"VIRTUAL_ENV=%CD%\"\npopd".to_string(),
    )
}

fn patch_fish(content: &str) -> Option<String> {
    replace_line(
        content,
        |line| line.starts_with("set -gx VIRTUAL_ENV \""),
        |_| "set -gx VIRTUAL_ENV (cd (dirname (status -f)); cd ..; pwd)".to_string(),
    )
}

fn patch_csh(content: &str) -> Option<String> {
    replace_line(
        content,
        |line| line.starts_with("setenv VIRTUAL_ENV \""),
        |_| {
            "set scriptpath=`find /proc/$$/fd -type l -lname '*activate.csh' -printf '%l' | xargs dirname`\n\
             setenv VIRTUAL_ENV `cd $scriptpath/.. && pwd`"
                .to_string()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Platform;
    use crate::runtime::RealRuntime;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn posix_activate(root: &str) -> String {
        format!(
            r#"# This file must be used with "source bin/activate"

deactivate () {{
    unset VIRTUAL_ENV
}}

VIRTUAL_ENV="{root}"
export VIRTUAL_ENV
PATH="$VIRTUAL_ENV/bin:$PATH"
export PATH
"#
        )
    }

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_patch_posix_replaces_assignment() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "activate", &posix_activate("/old/env"));

        let outcome = patch_activation_file(&RealRuntime, &path, Dialect::Posix);
        assert_eq!(outcome, PatchOutcome::Patched);

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("ACTIVATE_PATH_FALLBACK=\"$_\""));
        assert!(content.contains("BASH_SOURCE"));
        // Baked path survives only as the non-relocatable fallback
        assert!(content.contains("VIRTUAL_ENV=\"/old/env\""));
        assert!(content.contains(r#"VIRTUAL_ENV="$(cd "$(dirname "${ACTIVATE_PATH}")/.."; pwd)""#));
        // Downstream logic still reads the same variable
        assert!(content.contains("PATH=\"$VIRTUAL_ENV/bin:$PATH\""));
    }

    #[test]
    fn test_patch_posix_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "activate", &posix_activate("/old/env"));

        assert_eq!(
            patch_activation_file(&RealRuntime, &path, Dialect::Posix),
            PatchOutcome::Patched
        );
        let first = fs::read_to_string(&path).unwrap();
        assert_eq!(
            patch_activation_file(&RealRuntime, &path, Dialect::Posix),
            PatchOutcome::AlreadyPatched
        );
        assert_eq!(fs::read_to_string(&path).unwrap(), first);
    }

    #[test]
    fn test_patch_posix_pattern_not_found() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "activate", "# not a venv activation script\n");

        assert_eq!(
            patch_activation_file(&RealRuntime, &path, Dialect::Posix),
            PatchOutcome::PatternNotFound
        );
    }

    #[test]
    fn test_patch_bat_both_quote_styles() {
        let dir = tempdir().unwrap();
        for content in [
            "@echo off\nset \"VIRTUAL_ENV=C:\\old\\env\"\nset PATH=%VIRTUAL_ENV%\\Scripts;%PATH%\n",
            "@echo off\nset VIRTUAL_ENV=C:\\old\\env\nset PATH=%VIRTUAL_ENV%\\Scripts;%PATH%\n",
        ] {
            let path = write(dir.path(), "activate.bat", content);
            assert_eq!(
                patch_activation_file(&RealRuntime, &path, Dialect::Bat),
                PatchOutcome::Patched
            );
            let patched = fs::read_to_string(&path).unwrap();
            assert!(patched.contains("pushd %~dp0.."));
            assert!(patched.contains("set \"VIRTUAL_ENV=%CD%\""));
            assert!(!patched.contains("C:\\old\\env"));
        }
    }

    #[test]
    fn test_patch_fish_replaces_assignment() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "activate.fish",
            "set -gx VIRTUAL_ENV \"/old/env\"\nset -gx PATH \"$VIRTUAL_ENV/bin\" $PATH\n",
        );

        assert_eq!(
            patch_activation_file(&RealRuntime, &path, Dialect::Fish),
            PatchOutcome::Patched
        );
        let patched = fs::read_to_string(&path).unwrap();
        assert!(patched.contains("set -gx VIRTUAL_ENV (cd (dirname (status -f)); cd ..; pwd)"));
        assert!(!patched.contains("/old/env"));
    }

    #[test]
    fn test_patch_csh_replaces_assignment() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "activate.csh",
            "setenv VIRTUAL_ENV \"/old/env\"\nset path = ($VIRTUAL_ENV/bin $path)\n",
        );

        assert_eq!(
            patch_activation_file(&RealRuntime, &path, Dialect::Csh),
            PatchOutcome::Patched
        );
        let patched = fs::read_to_string(&path).unwrap();
        assert!(patched.contains("/proc/$$/fd"));
        assert!(!patched.contains("setenv VIRTUAL_ENV \"/old/env\""));
    }

    #[test]
    fn test_unsupported_dialects_are_surfaced() {
        let dir = tempdir().unwrap();
        let xsh = write(dir.path(), "activate.xsh", "$VIRTUAL_ENV = '/old/env'\n");
        let nu = write(dir.path(), "activate.nu", "let virtual_env = '/old/env'\n");

        assert_eq!(
            patch_activation_file(&RealRuntime, &xsh, Dialect::Xonsh),
            PatchOutcome::Unsupported
        );
        assert_eq!(
            patch_activation_file(&RealRuntime, &nu, Dialect::Nushell),
            PatchOutcome::Unsupported
        );
        // Files are left untouched
        assert_eq!(fs::read_to_string(&xsh).unwrap(), "$VIRTUAL_ENV = '/old/env'\n");
    }

    #[test]
    fn test_patch_activation_scripts_records_per_file_outcomes() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let layout = EnvLayout::from_parts(
            root.to_path_buf(),
            Platform::Posix,
            vec![],
            Some((3, 11)),
        );
        fs::create_dir_all(&layout.bin_dir).unwrap();
        write(&layout.bin_dir, "activate", &posix_activate("/old/env"));
        write(&layout.bin_dir, "activate.nu", "let virtual_env = '/old/env'\n");

        let mut report = RelocationReport::default();
        patch_activation_scripts(&RealRuntime, &layout, &mut report);

        assert_eq!(report.outcome_of("activate"), Some(&PatchOutcome::Patched));
        assert_eq!(report.outcome_of("activate.nu"), Some(&PatchOutcome::Unsupported));
    }
}
