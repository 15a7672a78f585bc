//! Virtual environment directory layout.
//!
//! A managed environment is a plain directory tree produced by the host
//! interpreter's `venv` facility. The layout differs per platform (`bin` vs
//! `Scripts`, `lib/pythonX.Y/site-packages` vs `Lib\site-packages`); the
//! target platform is chosen once and carried on the layout rather than
//! re-checked inside every patcher.

use anyhow::{Result, bail};
use log::debug;
use std::path::{Path, PathBuf};

use crate::runtime::Runtime;

/// Name of the bootstrap file every patched artifact resolves at run time.
/// Its position relative to the binary directory is fixed by convention.
pub const BOOTSTRAP_NAME: &str = "activate_this.py";

/// Target platform conventions, selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Posix,
    Windows,
}

impl Platform {
    pub fn host() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Posix
        }
    }

    /// Name of the directory holding launcher artifacts.
    pub fn bin_dir_name(self) -> &'static str {
        match self {
            Platform::Posix => "bin",
            Platform::Windows => "Scripts",
        }
    }

    /// Separator used in generated path-list strings (`os.pathsep`).
    pub fn path_list_separator(self) -> char {
        match self {
            Platform::Posix => ':',
            Platform::Windows => ';',
        }
    }
}

/// Resolved locations inside one environment.
#[derive(Debug, Clone)]
pub struct EnvLayout {
    pub root: PathBuf,
    pub platform: Platform,
    pub bin_dir: PathBuf,
    pub lib_dirs: Vec<PathBuf>,
    /// Interpreter major.minor, recovered from the environment itself.
    pub python_version: Option<(u32, u32)>,
}

impl EnvLayout {
    /// Probe an existing environment directory. The engine never creates the
    /// tree; a root without the conventional binary directory is rejected.
    pub fn discover<R: Runtime>(runtime: &R, root: &Path, platform: Platform) -> Result<Self> {
        let bin_dir = root.join(platform.bin_dir_name());
        if !runtime.is_dir(&bin_dir) {
            bail!(
                "{} does not look like a virtual environment (no {} directory)",
                root.display(),
                platform.bin_dir_name()
            );
        }

        let mut python_version = version_from_cfg(runtime, root);
        let lib_dirs = match platform {
            Platform::Windows => vec![root.join("Lib").join("site-packages")],
            Platform::Posix => {
                let lib = root.join("lib");
                let mut dirs = Vec::new();
                for entry in runtime.read_dir(&lib).unwrap_or_default() {
                    let Some(name) = entry.file_name().map(|n| n.to_string_lossy().into_owned())
                    else {
                        continue;
                    };
                    if !name.starts_with("python") || !runtime.is_dir(&entry) {
                        continue;
                    }
                    if python_version.is_none() {
                        python_version = parse_version(&name["python".len()..]);
                    }
                    dirs.push(entry.join("site-packages"));
                }
                dirs.sort();
                dirs
            }
        };

        if lib_dirs.is_empty() {
            debug!("No library directories found under {}", root.display());
        }

        Ok(EnvLayout {
            root: root.to_path_buf(),
            platform,
            bin_dir,
            lib_dirs,
            python_version,
        })
    }

    /// Construct a layout from explicit parts, without probing. Used by tests
    /// and callers that already know the tree shape.
    pub fn from_parts(
        root: PathBuf,
        platform: Platform,
        lib_dirs: Vec<PathBuf>,
        python_version: Option<(u32, u32)>,
    ) -> Self {
        let bin_dir = root.join(platform.bin_dir_name());
        EnvLayout {
            root,
            platform,
            bin_dir,
            lib_dirs,
            python_version,
        }
    }

    pub fn bootstrap_path(&self) -> PathBuf {
        self.bin_dir.join(BOOTSTRAP_NAME)
    }

    /// `pythonX.Y` when the version is known, plain `python` otherwise.
    pub fn versioned_interpreter(&self) -> String {
        match self.python_version {
            Some((major, minor)) => format!("python{}.{}", major, minor),
            None => "python".to_string(),
        }
    }

    /// File names inside the binary directory that must never get their
    /// interpreter-selection header rewritten: the interpreter itself, the
    /// activation scripts, and the bootstrap file.
    pub fn exempt_names(&self) -> Vec<String> {
        let mut names = vec![
            "python".to_string(),
            "python3".to_string(),
            "python.exe".to_string(),
            "python3.exe".to_string(),
            "pythonw.exe".to_string(),
            "activate".to_string(),
            "activate.sh".to_string(),
            "activate.bat".to_string(),
            BOOTSTRAP_NAME.to_string(),
            "activate.fish".to_string(),
            "activate.csh".to_string(),
            "activate.xsh".to_string(),
            "activate.nu".to_string(),
            "Activate.ps1".to_string(),
            "deactivate.bat".to_string(),
        ];
        let versioned = self.versioned_interpreter();
        if !names.contains(&versioned) {
            names.push(versioned);
        }
        names
    }
}

/// Read `version = X.Y.Z` out of `pyvenv.cfg`, the key both `venv` and
/// `virtualenv` write at creation time.
fn version_from_cfg<R: Runtime>(runtime: &R, root: &Path) -> Option<(u32, u32)> {
    let cfg = root.join("pyvenv.cfg");
    let content = runtime.read_to_string(&cfg).ok()?;
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if matches!(key.trim(), "version" | "version_info") {
            return parse_version(value.trim());
        }
    }
    None
}

fn parse_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}
