//! Generation of the bootstrap file (`activate_this.py`).
//!
//! `venv` does not create this file; `virtualenv` does. Every patched
//! launcher resolves it one relative hop away from its own location, so the
//! relocation pass refuses to run without it. The generated code derives the
//! environment root from its own `__file__` at execution time.

use anyhow::{Context, Result};
use log::{debug, info};
use std::path::PathBuf;

use crate::layout::EnvLayout;
use crate::runtime::Runtime;

/// Write the bootstrap file into the environment's binary directory.
/// Regenerates only when the library paths baked into it have changed.
/// Returns the path written (or left untouched).
pub fn write_bootstrap<R: Runtime>(runtime: &R, layout: &EnvLayout) -> Result<PathBuf> {
    let path = layout.bootstrap_path();
    let contents = render(layout);

    if runtime.is_file(&path)
        && runtime.read_to_string(&path).map(|c| c == contents).unwrap_or(false)
    {
        debug!("Bootstrap file {} is up to date", path.display());
        return Ok(path);
    }

    runtime
        .write(&path, contents.as_bytes())
        .with_context(|| format!("Failed to write bootstrap file {}", path.display()))?;
    info!("Wrote bootstrap file {}", path.display());
    Ok(path)
}

fn render(layout: &EnvLayout) -> String {
    let separator = layout.platform.path_list_separator();
    let lib_hops: Vec<String> = layout
        .lib_dirs
        .iter()
        .map(|lib| {
            pathdiff::diff_paths(lib, &layout.bin_dir)
                .unwrap_or_else(|| lib.clone())
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    let lib_dirs = lib_hops.join(&separator.to_string());
    let bin_name = layout.platform.bin_dir_name();

    format!(
        r#"import os
import site
import sys

try:
    abs_file = os.path.abspath(__file__)
except NameError:
    raise AssertionError("You must use exec(open(this_file).read(), {{'__file__': this_file}})")

bin_dir = os.path.dirname(abs_file)
base = bin_dir[: -len("{bin_name}") - 1]  # strip away the bin part from the __file__, plus the path separator

# prepend bin to PATH (this file is inside the bin directory)
os.environ["PATH"] = os.pathsep.join([bin_dir] + os.environ.get("PATH", "").split(os.pathsep))
os.environ["VIRTUAL_ENV"] = base  # virtual env is right above bin directory

# add the virtual environment's libraries to the host python import mechanism
prev_length = len(sys.path)
for lib in "{lib_dirs}".split(os.pathsep):
    path = os.path.realpath(os.path.join(bin_dir, lib))
    site.addsitedir(path)
sys.path[:] = sys.path[prev_length:] + sys.path[0:prev_length]

sys.real_prefix = sys.prefix
sys.prefix = base
"#
    )
}
