//! Path utility functions for normalization and relativization.

use std::path::{Component, Path, PathBuf};

/// Normalize a path by processing `.` and `..` components lexically.
/// This does not access the filesystem and does not follow symlinks.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {
                // Skip `.` components
            }
            Component::ParentDir => {
                // Pop the last component if possible
                if !result.pop() {
                    // If we can't pop (e.g., at root), keep the `..`
                    result.push(component);
                }
            }
            _ => {
                result.push(component);
            }
        }
    }
    result
}

/// Split a normalized path into case-normalized segments, dropping the root
/// and any drive prefix. Case folding only applies on case-insensitive
/// filesystems (Windows), mirroring `os.path.normcase`.
fn segments(path: &Path) -> Vec<String> {
    normalize_path(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(normcase(&s.to_string_lossy())),
            _ => None,
        })
        .collect()
}

#[cfg(windows)]
fn normcase(segment: &str) -> String {
    segment.to_lowercase()
}

#[cfg(not(windows))]
fn normcase(segment: &str) -> String {
    segment.to_string()
}

/// Compute the path of `dest` relative to the directory containing `source`.
///
/// `source` is the file the result will be written into (a `.pth` file, a
/// launcher script); only its parent directory matters. When
/// `dest_is_directory` is false the final component of `dest` is re-appended
/// after the directory walk.
///
/// Purely lexical: neither path is required to exist. When the two sides
/// share all their segments the result is the `./` current-directory token,
/// never the empty string.
///
/// ```
/// use relocenv::runtime::relative_to;
/// use std::path::Path;
///
/// assert_eq!(
///     relative_to(
///         Path::new("/usr/share/something/a-file.pth"),
///         Path::new("/usr/share/another-place/src"),
///         true,
///     ),
///     "../another-place/src"
/// );
/// ```
pub fn relative_to(source: &Path, dest: &Path, dest_is_directory: bool) -> String {
    let source_dir = source.parent().unwrap_or_else(|| Path::new(""));
    let (dest_dir, dest_name) = if dest_is_directory {
        (dest.to_path_buf(), None)
    } else {
        (
            dest.parent().unwrap_or_else(|| Path::new("")).to_path_buf(),
            dest.file_name().map(|n| n.to_string_lossy().into_owned()),
        )
    };

    let mut source_parts = segments(source_dir);
    let mut dest_parts = segments(&dest_dir);

    // Strip the longest common prefix
    while !source_parts.is_empty()
        && !dest_parts.is_empty()
        && source_parts[0] == dest_parts[0]
    {
        source_parts.remove(0);
        dest_parts.remove(0);
    }

    let mut full_parts: Vec<String> = std::iter::repeat_n("..".to_string(), source_parts.len())
        .chain(dest_parts)
        .collect();
    if let Some(name) = dest_name {
        full_parts.push(name);
    }

    if full_parts.is_empty() {
        // Special case for the current directory (otherwise it'd be '')
        return format!(".{}", std::path::MAIN_SEPARATOR);
    }
    full_parts.join(std::path::MAIN_SEPARATOR_STR)
}
