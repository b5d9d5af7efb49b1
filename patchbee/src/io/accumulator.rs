//! Builds a [`CodeContext`] from files on disk.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::context::{CodeContext, ContextFile};
use crate::core::scrub::scrub_comments;
use crate::io::files::list_files;

/// Options for one accumulation pass.
#[derive(Debug, Clone, Default)]
pub struct AccumulateOptions {
    /// Restrict accumulation to this path (relative to the root).
    pub scope: Option<PathBuf>,
    pub scrub_comments: bool,
}

/// List and read every file in scope under `root`.
pub fn accumulate(root: &Path, options: &AccumulateOptions) -> Result<CodeContext> {
    let files = list_files(root, options.scope.as_deref())?;
    Ok(accumulate_files(root, &files, options.scrub_comments))
}

/// Read `files` (relative to `root`) in order, skipping unreadable ones.
#[instrument(skip_all, fields(file_count = files.len(), scrub = scrub))]
pub fn accumulate_files(root: &Path, files: &[PathBuf], scrub: bool) -> CodeContext {
    let mut captured = Vec::with_capacity(files.len());
    for rel in files {
        let full = root.join(rel);
        let Some(text) = read_text(&full) else {
            continue;
        };
        let text = if scrub {
            let ext = rel
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default();
            scrub_comments(&text, &ext)
        } else {
            text
        };
        captured.push(ContextFile {
            path: rel.clone(),
            text,
        });
    }
    info!(
        requested = files.len(),
        captured = captured.len(),
        "accumulated code context"
    );
    CodeContext::new(captured)
}

fn read_text(path: &Path) -> Option<String> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "skipping unreadable file");
            return None;
        }
    };
    if bytes.contains(&0) {
        debug!(path = %path.display(), "skipping binary file");
        return None;
    }
    match String::from_utf8(bytes) {
        Ok(text) => Some(text),
        Err(_) => {
            warn!(path = %path.display(), "skipping non-UTF-8 file");
            None
        }
    }
}
