//! Binary launcher patching.
//!
//! Windows entry points are a native stub executable followed by a shebang
//! line and a zip archive holding the real script (`__main__.py`). Patching
//! unpacks the archive, rewrites the embedded script, and reassembles the
//! launcher with a fresh stub and a portable shebang. The launcher may be
//! running while it is replaced, so the rewrite falls back to a rename-based
//! sequence that never leaves the target path missing or half-written.

use anyhow::{Context, Result, anyhow};
use chrono::{Datelike, Timelike};
use log::{debug, info, warn};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::script::ScriptPatcher;
use super::{PatchOutcome, SkipReason};
use crate::layout::EnvLayout;
use crate::runtime::Runtime;

/// Zip local-file-header signature; marks where the embedded archive begins.
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

pub struct LauncherPatcher<'a, R: Runtime> {
    runtime: &'a R,
    layout: &'a EnvLayout,
}

impl<'a, R: Runtime> LauncherPatcher<'a, R> {
    pub fn new(runtime: &'a R, layout: &'a EnvLayout) -> Self {
        LauncherPatcher { runtime, layout }
    }

    /// Patch one launcher executable in place.
    pub fn patch_file(&self, path: &Path) -> PatchOutcome {
        let name = file_name(path);
        let bytes = match self.runtime.read(path) {
            Ok(bytes) => bytes,
            Err(e) => return PatchOutcome::Failed(e.to_string()),
        };

        // Detection is one archive-open attempt; anything unreadable as an
        // archive launcher is opaque and left alone.
        let script = match read_embedded_script(&bytes) {
            Ok(script) => script,
            Err(e) => {
                debug!("{} is not an archive launcher: {:#}", path.display(), e);
                return PatchOutcome::Skipped(SkipReason::Opaque);
            }
        };

        let script_patcher = ScriptPatcher::new(self.runtime, self.layout);
        let Some(patched) = script_patcher.patch_embedded(&name, &script) else {
            return PatchOutcome::AlreadyPatched;
        };

        match self.reassemble(&bytes, patched.as_bytes(), &script_patcher) {
            Ok(launcher) => match self.replace_file(path, &launcher) {
                Ok(()) => {
                    info!("Made launcher {} relative", path.display());
                    PatchOutcome::Patched
                }
                Err(e) => {
                    warn!("Could not replace launcher {}: {:#}", path.display(), e);
                    PatchOutcome::Failed(e.to_string())
                }
            },
            Err(e) => {
                warn!("Could not rebuild launcher {}: {:#}", path.display(), e);
                PatchOutcome::Failed(e.to_string())
            }
        }
    }

    /// Stub, portable shebang, then a deterministic single-entry archive.
    fn reassemble(
        &self,
        original: &[u8],
        script: &[u8],
        script_patcher: &ScriptPatcher<'_, R>,
    ) -> Result<Vec<u8>> {
        let stub = self.select_stub(original);
        let shebang = format!("{}\r\n", script_patcher.portable_shebang());
        let archive = build_archive(script, self.source_date_epoch())?;

        let mut launcher = Vec::with_capacity(stub.len() + shebang.len() + archive.len());
        launcher.extend_from_slice(&stub);
        launcher.extend_from_slice(shebang.as_bytes());
        launcher.extend_from_slice(&archive);
        Ok(launcher)
    }

    /// A fresh stub matching the original's bit-width and console/GUI kind,
    /// taken from the environment's own vendored launcher resources. When no
    /// fresh stub can be located (or the original stub defies inspection),
    /// the original stub is reused unchanged.
    fn select_stub(&self, original: &[u8]) -> Vec<u8> {
        let stub = existing_stub(original);
        if let Some(kind) = StubKind::inspect(stub) {
            if let Some(fresh) = self.fresh_stub(&kind) {
                return fresh;
            }
            debug!("No vendored {} stub found, reusing existing stub", kind.resource_name());
        }
        stub.to_vec()
    }

    fn fresh_stub(&self, kind: &StubKind) -> Option<Vec<u8>> {
        let name = kind.resource_name();
        for lib_dir in &self.layout.lib_dirs {
            let candidate = lib_dir.join("pip/_vendor/distlib").join(&name);
            if self.runtime.is_file(&candidate) {
                debug!("Using launcher stub {}", candidate.display());
                return self.runtime.read(&candidate).ok();
            }
        }
        None
    }

    fn source_date_epoch(&self) -> Option<i64> {
        self.runtime
            .env_var("SOURCE_DATE_EPOCH")
            .ok()
            .and_then(|value| value.parse().ok())
    }

    /// Replace the launcher on disk. A direct write is attempted first; when
    /// the file is held open by a running process the original is displaced
    /// to a `.deleteme` sibling instead of overwritten, so a failure at any
    /// step leaves a runnable launcher at the target path.
    fn replace_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let mode = self.runtime.file_mode(path)?;
        if let Err(first) = self.runtime.write(path, contents) {
            warn!(
                "Failed to write launcher {} ({:#}); retrying with .deleteme rename",
                path.display(),
                first
            );
            let staged = sibling(path, ".new");
            let displaced = sibling(path, ".deleteme");
            self.runtime
                .write(&staged, contents)
                .context("Failed to stage replacement launcher")?;
            if self.runtime.exists(&displaced) {
                // Stale leftover from an earlier failed attempt
                self.runtime.remove_file(&displaced)?;
            }
            self.runtime.rename(path, &displaced)?;
            self.runtime.rename(&staged, path)?;
            if let Err(e) = self.runtime.remove_file(&displaced) {
                // Still in use; it will be gone on the next pass
                debug!("Could not delete displaced launcher {}: {:#}", displaced.display(), e);
            }
        }
        if let Some(mode) = mode {
            self.runtime.set_permissions(path, mode)?;
        }
        Ok(())
    }
}

/// Bit-width and subsystem of a launcher stub, recovered from its PE header.
#[derive(Debug, PartialEq, Eq)]
struct StubKind {
    is_64: bool,
    is_gui: bool,
    is_arm: bool,
}

impl StubKind {
    fn inspect(stub: &[u8]) -> Option<Self> {
        let pe = goblin::pe::PE::parse(stub).ok()?;
        let optional = pe.header.optional_header?;
        // IMAGE_SUBSYSTEM_WINDOWS_GUI = 2
        let is_gui = optional.windows_fields.subsystem == 2;
        // IMAGE_FILE_MACHINE_ARM64 = 0xaa64
        let is_arm = pe.header.coff_header.machine == 0xaa64;
        Some(StubKind {
            is_64: pe.is_64,
            is_gui,
            is_arm,
        })
    }

    /// Stub file name as vendored by distlib: `t`/`w` for console/GUI,
    /// bit-width, optional `-arm` suffix.
    fn resource_name(&self) -> String {
        format!(
            "{}{}{}.exe",
            if self.is_gui { 'w' } else { 't' },
            if self.is_64 { "64" } else { "32" },
            if self.is_arm { "-arm" } else { "" },
        )
    }
}

/// Everything before the shebang that precedes the embedded archive. The zip
/// central directory sits at the end of the file, so the archive itself is
/// found by its first local-file-header signature.
fn existing_stub(bytes: &[u8]) -> &[u8] {
    let Some(zip_start) = find(bytes, ZIP_MAGIC) else {
        return bytes;
    };
    let head = &bytes[..zip_start];
    match rfind(head, b"#!") {
        Some(shebang_start) => &bytes[..shebang_start],
        None => head,
    }
}

fn read_embedded_script(bytes: &[u8]) -> Result<String> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).context("not a zip archive")?;
    let mut entry = archive
        .by_name("__main__.py")
        .map_err(|e| anyhow!("no __main__.py entry: {}", e))?;
    let mut script = String::new();
    entry
        .read_to_string(&mut script)
        .context("embedded script is not text")?;
    Ok(script)
}

/// Deterministic single-entry archive. The entry timestamp honors
/// `SOURCE_DATE_EPOCH` for reproducible output and falls back to now.
fn build_archive(script: &[u8], epoch: Option<i64>) -> Result<Vec<u8>> {
    let timestamp = epoch
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(chrono::Utc::now)
        .naive_utc();
    let mut options: FileOptions<()> =
        FileOptions::default().compression_method(CompressionMethod::Deflated);
    if let Ok(modified) = zip::DateTime::from_date_and_time(
        timestamp.year() as u16,
        timestamp.month() as u8,
        timestamp.day() as u8,
        timestamp.hour() as u8,
        timestamp.minute() as u8,
        timestamp.second() as u8,
    ) {
        options = options.last_modified_time(modified);
    }

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer.start_file("__main__.py", options)?;
    writer.write_all(script)?;
    let cursor = writer.finish().context("Failed to finish launcher archive")?;
    Ok(cursor.into_inner())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    path.with_file_name(format!("{}{}", file_name(path), suffix))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Platform;
    use crate::runtime::{MockRuntime, RealRuntime};
    use mockall::predicate::eq;
    use std::fs;
    use tempfile::tempdir;

    const FAKE_STUB: &[u8] = b"MZ\x90\x00fake-stub-bytes";

    fn windows_layout(root: &Path) -> EnvLayout {
        EnvLayout::from_parts(
            root.to_path_buf(),
            Platform::Windows,
            vec![root.join("Lib").join("site-packages")],
            Some((3, 11)),
        )
    }

    fn fake_launcher(script: &str) -> Vec<u8> {
        let archive = build_archive(script.as_bytes(), Some(0)).unwrap();
        let mut bytes = FAKE_STUB.to_vec();
        bytes.extend_from_slice(b"#!C:\\env\\Scripts\\python.exe\r\n");
        bytes.extend_from_slice(&archive);
        bytes
    }

    #[test]
    fn test_patch_file_rewrites_embedded_script() {
        let dir = tempdir().unwrap();
        let layout = windows_layout(dir.path());
        fs::create_dir_all(&layout.bin_dir).unwrap();
        let path = layout.bin_dir.join("tool.exe");
        fs::write(&path, fake_launcher("import tool\ntool.main()")).unwrap();

        let patcher = LauncherPatcher::new(&RealRuntime, &layout);
        assert_eq!(patcher.patch_file(&path), PatchOutcome::Patched);

        let bytes = fs::read(&path).unwrap();
        // The fake stub is not a parseable PE, so it is carried over verbatim
        assert!(bytes.starts_with(FAKE_STUB));
        let script = read_embedded_script(&bytes).unwrap();
        assert!(script.starts_with("import os; import sys;"));
        assert!(script.contains("import tool"));
    }

    #[test]
    fn test_patch_file_is_idempotent() {
        let dir = tempdir().unwrap();
        let layout = windows_layout(dir.path());
        fs::create_dir_all(&layout.bin_dir).unwrap();
        let path = layout.bin_dir.join("tool.exe");
        fs::write(&path, fake_launcher("import tool")).unwrap();

        let patcher = LauncherPatcher::new(&RealRuntime, &layout);
        assert_eq!(patcher.patch_file(&path), PatchOutcome::Patched);
        let first = fs::read(&path).unwrap();
        assert_eq!(patcher.patch_file(&path), PatchOutcome::AlreadyPatched);
        assert_eq!(fs::read(&path).unwrap(), first);
    }

    #[test]
    fn test_patch_file_skips_opaque_binary() {
        let dir = tempdir().unwrap();
        let layout = windows_layout(dir.path());
        fs::create_dir_all(&layout.bin_dir).unwrap();
        let path = layout.bin_dir.join("blob.exe");
        fs::write(&path, b"\x7fELF not actually a launcher").unwrap();

        let patcher = LauncherPatcher::new(&RealRuntime, &layout);
        assert_eq!(
            patcher.patch_file(&path),
            PatchOutcome::Skipped(SkipReason::Opaque)
        );
        // Opaque artifacts are never modified
        assert_eq!(fs::read(&path).unwrap(), b"\x7fELF not actually a launcher");
    }

    #[test]
    fn test_build_archive_honors_source_date_epoch() {
        let a = build_archive(b"print()", Some(315_532_800)).unwrap();
        let b = build_archive(b"print()", Some(315_532_800)).unwrap();
        assert_eq!(a, b, "same epoch must produce identical archives");
    }

    #[test]
    fn test_existing_stub_splits_before_shebang() {
        let launcher = fake_launcher("import tool");
        assert_eq!(existing_stub(&launcher), FAKE_STUB);
    }

    #[test]
    fn test_existing_stub_without_archive_is_whole_file() {
        let bytes = b"MZ just a plain executable";
        assert_eq!(existing_stub(bytes), bytes.as_slice());
    }

    #[test]
    fn test_stub_resource_names() {
        let console64 = StubKind { is_64: true, is_gui: false, is_arm: false };
        assert_eq!(console64.resource_name(), "t64.exe");
        let gui32 = StubKind { is_64: false, is_gui: true, is_arm: false };
        assert_eq!(gui32.resource_name(), "w32.exe");
        let console_arm = StubKind { is_64: true, is_gui: false, is_arm: true };
        assert_eq!(console_arm.resource_name(), "t64-arm.exe");
    }

    #[test]
    fn test_replace_file_busy_fallback_sequence() {
        let dir = tempdir().unwrap();
        let layout = windows_layout(dir.path());
        let target = layout.bin_dir.join("tool.exe");
        let staged = layout.bin_dir.join("tool.exe.new");
        let displaced = layout.bin_dir.join("tool.exe.deleteme");

        let mut runtime = MockRuntime::new();
        runtime
            .expect_file_mode()
            .with(eq(target.clone()))
            .returning(|_| Ok(None));
        // Direct write fails: the launcher is held open by a running process
        runtime
            .expect_write()
            .with(eq(target.clone()), eq(b"new".to_vec()))
            .times(1)
            .returning(|_, _| Err(anyhow!("text file busy")));
        runtime
            .expect_write()
            .with(eq(staged.clone()), eq(b"new".to_vec()))
            .times(1)
            .returning(|_, _| Ok(()));
        // A stale .deleteme from a previous failed attempt is cleared first
        runtime
            .expect_exists()
            .with(eq(displaced.clone()))
            .times(1)
            .returning(|_| true);
        runtime
            .expect_remove_file()
            .with(eq(displaced.clone()))
            .times(1)
            .returning(|_| Ok(()));
        runtime
            .expect_rename()
            .with(eq(target.clone()), eq(displaced.clone()))
            .times(1)
            .returning(|_, _| Ok(()));
        runtime
            .expect_rename()
            .with(eq(staged.clone()), eq(target.clone()))
            .times(1)
            .returning(|_, _| Ok(()));
        // Best-effort delete of the displaced original may still fail
        runtime
            .expect_remove_file()
            .with(eq(displaced.clone()))
            .times(1)
            .returning(|_| Err(anyhow!("still in use")));

        let patcher = LauncherPatcher::new(&runtime, &layout);
        patcher.replace_file(&target, b"new").unwrap();
    }
}
