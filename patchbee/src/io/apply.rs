//! Commit proposals to the working tree and undo them.
//!
//! Direct writes are non-transactional: edits land one by one, and a failed
//! iteration is cleaned up by [`Applier::revert`] rather than rolled back here.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::containment::normalize_relative;
use crate::core::types::{EditBatch, PatchDocument, Proposal};
use crate::error::{ApplyError, SecurityViolation};
use crate::io::git::Git;

/// Directory at the project root that holds run logs; never reverted.
pub const STATE_DIR: &str = ".patchbee";

/// What a single apply did to the tree. Filled incrementally so that a
/// partially failed apply can still be reverted precisely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Paths written, relative to the output root.
    pub written: Vec<PathBuf>,
    /// Subset of `written` that did not exist before.
    pub created: Vec<PathBuf>,
    /// Prior bytes of every overwritten file, captured before the first write.
    pub previous: Vec<(PathBuf, Vec<u8>)>,
    pub rejected: Vec<SecurityViolation>,
}

/// Write every contained edit of `batch` under `root`, recording progress in `report`.
///
/// Uncontained paths are skipped with a warning. Fails when nothing could be
/// written or when a write fails.
#[instrument(skip_all, fields(root = %root.display(), edits = batch.len()))]
pub fn write_edits(
    root: &Path,
    batch: &EditBatch,
    report: &mut ApplyReport,
) -> Result<(), ApplyError> {
    if batch.is_empty() {
        return Err(ApplyError::NothingWritten("the edit list is empty".to_string()));
    }
    fs::create_dir_all(root).map_err(|err| io_error(root, err))?;
    let canonical_root = root.canonicalize().map_err(|err| io_error(root, err))?;

    for edit in batch.edits() {
        let relative = match resolve_contained(&canonical_root, &edit.path) {
            Ok(relative) => relative,
            Err(violation) => {
                warn!(path = %violation.path, reason = %violation.reason, "skipping edit outside output root");
                report.rejected.push(violation);
                continue;
            }
        };
        let target = canonical_root.join(&relative);
        let existed = fs::symlink_metadata(&target).is_ok();
        if existed && !report.previous.iter().any(|(path, _)| *path == relative) {
            let bytes = fs::read(&target).map_err(|err| io_error(&target, err))?;
            report.previous.push((relative.clone(), bytes));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
        }
        fs::write(&target, &edit.content).map_err(|err| io_error(&target, err))?;
        debug!(path = %relative.display(), created = !existed, "wrote edit");
        if !existed {
            report.created.push(relative.clone());
        }
        report.written.push(relative);
    }

    if report.written.is_empty() {
        return Err(ApplyError::NothingWritten(format!(
            "all {} edits were rejected",
            report.rejected.len()
        )));
    }
    info!(
        written = report.written.len(),
        rejected = report.rejected.len(),
        "edits applied"
    );
    Ok(())
}

/// Lexically normalize `raw`, then make sure the deepest existing ancestor of
/// the target does not resolve (through symlinks) outside `canonical_root`.
fn resolve_contained(canonical_root: &Path, raw: &str) -> Result<PathBuf, SecurityViolation> {
    let violation = |reason: String| SecurityViolation {
        path: raw.to_string(),
        reason,
    };
    let relative = normalize_relative(raw).map_err(violation)?;
    if relative
        .components()
        .next()
        .is_some_and(|first| first.as_os_str() == ".git")
    {
        return Err(violation("writes into .git are not allowed".to_string()));
    }

    let target = canonical_root.join(&relative);
    let existing = target
        .ancestors()
        .find(|p| fs::symlink_metadata(p).is_ok())
        .unwrap_or(canonical_root);
    let resolved = existing
        .canonicalize()
        .map_err(|err| violation(format!("cannot resolve {}: {err}", existing.display())))?;
    if !resolved.starts_with(canonical_root) {
        return Err(violation(format!(
            "resolves outside the output root via {}",
            existing.display()
        )));
    }
    Ok(relative)
}

fn io_error(path: &Path, err: std::io::Error) -> ApplyError {
    ApplyError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Applies proposals inside a git project and reverts them.
#[derive(Debug, Clone)]
pub struct Applier {
    root: PathBuf,
    git: Git,
}

impl Applier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            git: Git::new(&root),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn apply(&self, proposal: &Proposal, report: &mut ApplyReport) -> Result<(), ApplyError> {
        match proposal {
            Proposal::Edits(batch) => write_edits(&self.root, batch, report),
            Proposal::Patch(patch) => self.apply_patch(patch),
        }
    }

    fn apply_patch(&self, patch: &PatchDocument) -> Result<(), ApplyError> {
        let output = self
            .git
            .apply_patch(patch.as_str())
            .map_err(|err| ApplyError::PatchRejected(format!("{err:#}")))?;
        if !output.success {
            warn!(stderr = %output.stderr.trim(), "git apply rejected the patch");
            return Err(ApplyError::PatchRejected(output.stderr.trim().to_string()));
        }
        info!("patch applied");
        Ok(())
    }

    /// Restore the pre-workflow tree, keeping the state directory.
    ///
    /// Git restores tracked and removes untracked files; overwritten and
    /// created files that git ignores are handled from `report`.
    #[instrument(skip_all, fields(created = report.created.len(), overwritten = report.previous.len()))]
    pub fn revert(&self, report: &ApplyReport) -> Result<()> {
        self.git
            .discard_changes(&format!("{STATE_DIR}/"))
            .context("discard worktree changes")?;
        for (relative, bytes) in &report.previous {
            let path = self.root.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            fs::write(&path, bytes).with_context(|| format!("restore {}", path.display()))?;
            debug!(path = %relative.display(), "restored previous content");
        }
        // Created files that git leaves behind are the ignored ones.
        for relative in &report.created {
            let path = self.root.join(relative);
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %relative.display(), "removed ignored file"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("remove {}", path.display()));
                }
            }
        }
        info!("worktree reverted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FileEdit;
    use crate::test_support::TestRepo;

    fn batch(edits: &[(&str, &str)]) -> EditBatch {
        EditBatch::new(
            edits
                .iter()
                .map(|(path, content)| FileEdit {
                    path: path.to_string(),
                    content: content.to_string(),
                })
                .collect(),
        )
    }

    fn snapshot(dir: &Path) -> Vec<(PathBuf, String)> {
        let mut out = Vec::new();
        for entry in ignore::WalkBuilder::new(dir).hidden(false).build() {
            let entry = entry.expect("walk");
            if entry.file_type().is_some_and(|t| t.is_file()) {
                let text = fs::read_to_string(entry.path()).unwrap_or_default();
                out.push((entry.path().to_path_buf(), text));
            }
        }
        out.sort();
        out
    }

    #[test]
    fn writes_nested_files_and_reports_created() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.py"), "x=1").expect("write");
        let mut report = ApplyReport::default();

        write_edits(temp.path(), &batch(&[("a.py", "x=2"), ("pkg/b.py", "y=1")]), &mut report)
            .expect("apply");

        assert_eq!(fs::read_to_string(temp.path().join("a.py")).expect("read"), "x=2");
        assert_eq!(fs::read_to_string(temp.path().join("pkg/b.py")).expect("read"), "y=1");
        assert_eq!(report.written, vec![PathBuf::from("a.py"), PathBuf::from("pkg/b.py")]);
        assert_eq!(report.created, vec![PathBuf::from("pkg/b.py")]);
        assert_eq!(report.previous, vec![(PathBuf::from("a.py"), b"x=1".to_vec())]);
    }

    #[test]
    fn escaping_paths_have_no_side_effects_outside_root() {
        let outer = tempfile::tempdir().expect("tempdir");
        let root = outer.path().join("out");
        fs::create_dir_all(&root).expect("mkdir");
        let before = snapshot(outer.path());
        let mut report = ApplyReport::default();

        let err = write_edits(
            &root,
            &batch(&[
                ("../escape.txt", "x"),
                ("sub/../../escape2.txt", "x"),
                ("/tmp/patchbee-abs.txt", "x"),
                (".git/config", "x"),
            ]),
            &mut report,
        )
        .unwrap_err();

        assert!(matches!(err, ApplyError::NothingWritten(_)));
        assert_eq!(report.rejected.len(), 4);
        assert_eq!(snapshot(outer.path()), before);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directory_cannot_escape_root() {
        let outer = tempfile::tempdir().expect("tempdir");
        let root = outer.path().join("out");
        let elsewhere = outer.path().join("elsewhere");
        fs::create_dir_all(&root).expect("mkdir");
        fs::create_dir_all(&elsewhere).expect("mkdir");
        std::os::unix::fs::symlink(&elsewhere, root.join("link")).expect("symlink");
        let mut report = ApplyReport::default();

        write_edits(
            &root,
            &batch(&[("link/evil.txt", "x"), ("ok.txt", "fine")]),
            &mut report,
        )
        .expect("apply contained edit");

        assert!(!elsewhere.join("evil.txt").exists());
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].path, "link/evil.txt");
        assert_eq!(report.written, vec![PathBuf::from("ok.txt")]);
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let edits = batch(&[("a.txt", "one"), ("dir/b.txt", "two")]);

        write_edits(temp.path(), &edits, &mut ApplyReport::default()).expect("first");
        let first = snapshot(temp.path());
        write_edits(temp.path(), &edits, &mut ApplyReport::default()).expect("second");

        assert_eq!(snapshot(temp.path()), first);
    }

    #[test]
    fn empty_batch_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = write_edits(temp.path(), &EditBatch::default(), &mut ApplyReport::default())
            .unwrap_err();
        assert!(matches!(err, ApplyError::NothingWritten(_)));
    }

    #[test]
    fn creates_missing_output_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join(".beecode.d");
        write_edits(&root, &batch(&[("main.py", "print(1)")]), &mut ApplyReport::default())
            .expect("apply");
        assert!(root.join("main.py").is_file());
    }

    #[test]
    fn rejected_patch_carries_git_stderr() {
        let repo = TestRepo::with_files(&[("a.py", "x=1\n")]).expect("repo");
        let applier = Applier::new(repo.path());
        let patch = Proposal::Patch(PatchDocument(
            "--- a/a.py\n+++ b/a.py\n@@ -1 +1 @@\n-x=9\n+x=2\n".to_string(),
        ));

        let err = applier
            .apply(&patch, &mut ApplyReport::default())
            .unwrap_err();
        match err {
            ApplyError::PatchRejected(stderr) => assert!(stderr.contains("a.py")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(repo.read("a.py"), "x=1\n");
    }

    #[test]
    fn revert_restores_tracked_and_removes_created_ignored_files() {
        let repo = TestRepo::with_files(&[("a.py", "x=1\n"), (".gitignore", "build/\n")])
            .expect("repo");
        let applier = Applier::new(repo.path());
        let mut report = ApplyReport::default();
        let proposal = Proposal::Edits(batch(&[
            ("a.py", "x=2\n"),
            ("new.py", "y\n"),
            ("build/out.txt", "generated\n"),
        ]));
        applier.apply(&proposal, &mut report).expect("apply");
        repo.write(".patchbee/runs/keep.txt", "log").expect("log");

        applier.revert(&report).expect("revert");

        assert_eq!(repo.read("a.py"), "x=1\n");
        assert!(!repo.path().join("new.py").exists());
        assert!(!repo.path().join("build/out.txt").exists());
        assert!(repo.path().join(".patchbee/runs/keep.txt").exists());
    }

    #[test]
    fn revert_restores_overwritten_ignored_files() {
        let repo = TestRepo::with_files(&[("a.py", "x=1\n"), (".gitignore", "secret.env\n")])
            .expect("repo");
        repo.write("secret.env", "TOKEN=orig\n").expect("secret");
        let applier = Applier::new(repo.path());
        let mut report = ApplyReport::default();
        let proposal = Proposal::Edits(batch(&[("secret.env", "TOKEN=model\n"), ("a.py", "x=2\n")]));
        applier.apply(&proposal, &mut report).expect("apply");
        assert_eq!(repo.read("secret.env"), "TOKEN=model\n");

        applier.revert(&report).expect("revert");

        assert_eq!(repo.read("secret.env"), "TOKEN=orig\n");
        assert_eq!(repo.read("a.py"), "x=1\n");
    }
}
