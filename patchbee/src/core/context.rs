//! In-memory code context handed to the model.

use std::path::{Path, PathBuf};

/// One source file captured for the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFile {
    /// Path relative to the project root.
    pub path: PathBuf,
    pub text: String,
}

/// Ordered source files, rendered with `FILE:` markers between them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeContext {
    files: Vec<ContextFile>,
}

impl CodeContext {
    pub fn new(files: Vec<ContextFile>) -> Self {
        Self { files }
    }

    pub fn files(&self) -> &[ContextFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// True when no file contributed any non-whitespace text.
    pub fn is_blank(&self) -> bool {
        self.files.iter().all(|f| f.text.trim().is_empty())
    }

    /// Concatenate all files, each preceded by a `--- FILE: <path> ---` line.
    pub fn render(&self) -> String {
        let mut buf = String::new();
        for file in &self.files {
            buf.push_str(&file_marker(&file.path));
            buf.push_str(&file.text);
        }
        buf
    }
}

fn file_marker(path: &Path) -> String {
    // Forward slashes regardless of platform so prompts are stable.
    let display = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    format!("\n--- FILE: {display} ---\n")
}
