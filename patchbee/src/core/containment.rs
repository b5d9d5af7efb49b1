//! Lexical containment checks for model-proposed paths.

use std::path::{Component, Path, PathBuf};

/// Normalize a model-supplied relative path without touching the filesystem.
///
/// Returns `Err` with a short reason when the path is empty, absolute, or
/// climbs above the root through `..` components.
pub fn normalize_relative(path: &str) -> Result<PathBuf, String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err("empty path".to_string());
    }
    let candidate = Path::new(trimmed);
    let mut out = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err("path escapes the output root".to_string());
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err("absolute paths are not allowed".to_string());
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err("path resolves to the output root itself".to_string());
    }
    Ok(out)
}
