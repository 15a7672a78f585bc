//! Interpreter and launcher lookup.
//!
//! A `which`-style search over explicit candidate names and directories. All
//! inputs are parameters (including the executability predicate), so the
//! search carries no hidden process-global state and can be exercised in
//! isolation.

use std::path::{Path, PathBuf};

/// Find the first candidate name that exists in the candidate directories,
/// trying every name in every directory in order. `is_candidate` decides
/// whether a path counts as a hit (typically an executable-file check).
pub fn find_in_dirs<F>(names: &[String], dirs: &[PathBuf], is_candidate: F) -> Option<PathBuf>
where
    F: Fn(&Path) -> bool,
{
    for dir in dirs {
        for name in names {
            let candidate = dir.join(name);
            if is_candidate(&candidate) {
                return Some(candidate);
            }
        }
    }
    None
}

/// Expand a command name with executable suffixes, `PATHEXT`-style. A name
/// that already carries one of the suffixes is checked as-is; the suffix list
/// is an explicit parameter rather than an environment read.
pub fn expand_suffixes(name: &str, suffixes: &[&str]) -> Vec<String> {
    let lower = name.to_lowercase();
    if suffixes.iter().any(|ext| lower.ends_with(&ext.to_lowercase())) {
        return vec![name.to_string()];
    }
    let mut expanded = vec![name.to_string()];
    expanded.extend(suffixes.iter().map(|ext| format!("{}{}", name, ext)));
    expanded
}
