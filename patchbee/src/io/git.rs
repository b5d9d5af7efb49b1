//! Git adapter for the workflow.
//!
//! Project discovery, file listing, patch application and worktree reverts all
//! go through a small wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::{ProcessLimits, run_with_timeout};

const APPLY_TIMEOUT: Duration = Duration::from_secs(120);
const APPLY_OUTPUT_LIMIT_BYTES: usize = 64_000;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Outcome of `git apply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutput {
    pub success: bool,
    pub stderr: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Absolute path of the repository's top-level directory.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Tracked files relative to the workdir, in git's order.
    pub fn ls_files(&self) -> Result<Vec<PathBuf>> {
        let out = self.run_capture(&["ls-files", "-z"])?;
        Ok(out
            .split('\0')
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure the worktree is clean, allowing entries with any of the given prefixes.
    #[instrument(skip_all)]
    pub fn ensure_clean_except_prefixes(&self, allowed_prefixes: &[&str]) -> Result<()> {
        let disallowed: Vec<StatusEntry> = self
            .status_porcelain()?
            .into_iter()
            .filter(|entry| {
                !allowed_prefixes
                    .iter()
                    .any(|prefix| entry.path.starts_with(prefix))
            })
            .collect();
        if disallowed.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(disallowed_count = disallowed.len(), "worktree not clean");
        let mut msg = String::from("working tree not clean (commit or stash first):\n");
        for entry in disallowed {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Apply a unified diff from memory, tolerating whitespace differences.
    #[instrument(skip_all, fields(patch_bytes = patch.len()))]
    pub fn apply_patch(&self, patch: &str) -> Result<ApplyOutput> {
        let mut cmd = Command::new("git");
        cmd.args(["apply", "--ignore-whitespace", "-"])
            .current_dir(&self.workdir);
        let mut input = patch.to_string();
        if !input.ends_with('\n') {
            // git apply treats a missing final newline as a corrupt patch.
            input.push('\n');
        }
        let output = run_with_timeout(
            cmd,
            Some(input.as_bytes()),
            ProcessLimits {
                timeout: APPLY_TIMEOUT,
                output_limit_bytes: APPLY_OUTPUT_LIMIT_BYTES,
            },
        )
        .context("run git apply")?;
        let success = output.status.success() && !output.timed_out;
        debug!(success, "git apply finished");
        Ok(ApplyOutput {
            success,
            stderr: output.stderr_text(),
        })
    }

    /// Discard tracked modifications and untracked files, keeping `keep_prefix`.
    ///
    /// Ignored files are left alone.
    #[instrument(skip_all)]
    pub fn discard_changes(&self, keep_prefix: &str) -> Result<()> {
        self.run_checked(&["checkout", "--", "."])?;
        let exclude = format!("--exclude={keep_prefix}");
        self.run_checked(&["clean", "-fd", &exclude])?;
        debug!("worktree changes discarded");
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;
    use std::fs;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn apply_patch_updates_tracked_file() {
        let repo = TestRepo::with_files(&[("hello.txt", "hello\n")]).expect("repo");
        let git = Git::new(repo.path());
        let patch = "--- a/hello.txt\n+++ b/hello.txt\n@@ -1 +1 @@\n-hello\n+world";

        let out = git.apply_patch(patch).expect("apply");
        assert!(out.success, "stderr: {}", out.stderr);
        assert_eq!(repo.read("hello.txt"), "world\n");
    }

    #[test]
    fn apply_patch_reports_rejection() {
        let repo = TestRepo::with_files(&[("hello.txt", "hello\n")]).expect("repo");
        let git = Git::new(repo.path());
        let patch = "--- a/hello.txt\n+++ b/hello.txt\n@@ -1 +1 @@\n-goodbye\n+world\n";

        let out = git.apply_patch(patch).expect("apply");
        assert!(!out.success);
        assert!(!out.stderr.is_empty());
    }

    #[test]
    fn discard_changes_keeps_excluded_prefix() {
        let repo = TestRepo::with_files(&[("a.txt", "a\n")]).expect("repo");
        let root = repo.path();
        fs::write(root.join("a.txt"), "changed\n").expect("write");
        fs::write(root.join("new.txt"), "new\n").expect("write");
        fs::create_dir_all(root.join(".patchbee")).expect("mkdir");
        fs::write(root.join(".patchbee/keep.txt"), "log\n").expect("write");

        Git::new(root).discard_changes(".patchbee/").expect("discard");

        assert_eq!(repo.read("a.txt"), "a\n");
        assert!(!root.join("new.txt").exists());
        assert!(root.join(".patchbee/keep.txt").exists());
    }

    #[test]
    fn ls_files_lists_tracked_only() {
        let repo = TestRepo::with_files(&[("a.txt", "a\n"), ("src/b.rs", "b\n")]).expect("repo");
        fs::write(repo.path().join("untracked.txt"), "x").expect("write");
        let files = Git::new(repo.path()).ls_files().expect("ls");
        assert_eq!(files, vec![PathBuf::from("a.txt"), PathBuf::from("src/b.rs")]);
    }
}
