//! File listing for context accumulation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use ignore::WalkBuilder;
use tracing::debug;

use crate::io::git::Git;

/// Resolve the project root: the git top-level containing `start`.
pub fn project_root(start: &Path) -> Result<PathBuf> {
    Git::new(start)
        .toplevel()
        .with_context(|| format!("locate git repository containing {}", start.display()))
}

/// List files to accumulate, relative to `root`.
///
/// Without `scope` this is `git ls-files`. With `scope` (relative to `root`),
/// the path is walked honoring `.gitignore`; a file scope yields that file.
pub fn list_files(root: &Path, scope: Option<&Path>) -> Result<Vec<PathBuf>> {
    let files = match scope {
        None => Git::new(root).ls_files()?,
        Some(scope) => walk_scope(root, scope)?,
    };
    debug!(count = files.len(), scoped = scope.is_some(), "listed files");
    Ok(files)
}

fn walk_scope(root: &Path, scope: &Path) -> Result<Vec<PathBuf>> {
    let target = if scope.is_absolute() {
        scope.to_path_buf()
    } else {
        root.join(scope)
    };
    if !target.exists() {
        return Err(anyhow!("path {} does not exist", target.display()));
    }

    let mut builder = WalkBuilder::new(&target);
    builder
        .hidden(true)
        .follow_links(false)
        .git_ignore(true)
        .git_exclude(true)
        .require_git(false);

    let mut files = Vec::new();
    for entry in builder.build() {
        let Ok(entry) = entry else {
            continue;
        };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        files.push(rel.to_path_buf());
    }
    files.sort();
    Ok(files)
}
