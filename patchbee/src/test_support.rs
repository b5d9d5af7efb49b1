//! Test-only helpers: scripted backends and verifiers plus throwaway git repos.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use tempfile::TempDir;

use crate::core::types::VerificationResult;
use crate::error::{BackendError, VerificationExecError};
use crate::io::backend::EditBackend;
use crate::io::verify::Verifier;

/// Backend returning queued responses in order and recording every prompt.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    responses: RefCell<VecDeque<Result<String, BackendError>>>,
    prompts: RefCell<Vec<(String, String)>>,
}

impl ScriptedBackend {
    pub fn new(responses: Vec<Result<String, BackendError>>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    /// Convenience constructor for all-success scripts.
    pub fn replies<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self::new(replies.into_iter().map(|r| Ok(r.into())).collect())
    }

    pub fn calls(&self) -> usize {
        self.prompts.borrow().len()
    }

    /// `(system, user)` prompt pairs in call order.
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.borrow().clone()
    }
}

impl EditBackend for ScriptedBackend {
    fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, BackendError> {
        self.prompts
            .borrow_mut()
            .push((system_prompt.to_string(), user_prompt.to_string()));
        self.responses.borrow_mut().pop_front().unwrap_or_else(|| {
            Err(BackendError::InvalidResponse(
                "scripted backend has no responses left".to_string(),
            ))
        })
    }
}

/// Verifier returning queued results; optionally snapshots a file per call.
#[derive(Debug, Default)]
pub struct ScriptedVerifier {
    results: RefCell<VecDeque<Result<VerificationResult, VerificationExecError>>>,
    watch: Option<String>,
    snapshots: RefCell<Vec<Option<String>>>,
}

impl ScriptedVerifier {
    pub fn new(results: Vec<Result<VerificationResult, VerificationExecError>>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            watch: None,
            snapshots: RefCell::new(Vec::new()),
        }
    }

    /// Results with the given exit codes and canned output.
    pub fn exit_codes(codes: &[i32]) -> Self {
        Self::new(
            codes
                .iter()
                .map(|code| Ok(result(*code, &format!("exit {code}"))))
                .collect(),
        )
    }

    /// Record the content of `rel_path` each time verification runs.
    pub fn watching(mut self, rel_path: &str) -> Self {
        self.watch = Some(rel_path.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.snapshots.borrow().len()
    }

    /// Watched file contents observed at each verification, in call order.
    pub fn snapshots(&self) -> Vec<Option<String>> {
        self.snapshots.borrow().clone()
    }
}

impl Verifier for ScriptedVerifier {
    fn verify(&self, root: &Path) -> Result<VerificationResult, VerificationExecError> {
        let snapshot = self
            .watch
            .as_ref()
            .and_then(|rel| fs::read_to_string(root.join(rel)).ok());
        self.snapshots.borrow_mut().push(snapshot);
        self.results.borrow_mut().pop_front().unwrap_or_else(|| {
            Err(VerificationExecError {
                command: vec!["scripted".to_string()],
                message: "scripted verifier has no results left".to_string(),
            })
        })
    }
}

/// Verification result with `stderr` text and empty stdout.
pub fn result(exit_code: i32, stderr: &str) -> VerificationResult {
    VerificationResult {
        exit_code,
        stdout: String::new(),
        stderr: stderr.to_string(),
        timed_out: false,
    }
}

/// Git repository in a temp dir with an initial commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    /// Create a repo whose first commit contains exactly `files`.
    pub fn with_files(files: &[(&str, &str)]) -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "user.name", "test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        for (rel, content) in files {
            repo.write(rel, content)?;
        }
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-q", "--allow-empty", "-m", "chore: init"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file relative to the repo root, creating parents.
    pub fn write(&self, rel: &str, content: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, content).with_context(|| format!("write {}", path.display()))
    }

    /// Read a file relative to the repo root; panics when missing.
    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path().join(rel))
            .unwrap_or_else(|err| panic!("read {rel}: {err}"))
    }

    fn git(&self, args: &[&str]) -> Result<()> {
        let status = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .status()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !status.success() {
            bail!("git {} failed", args.join(" "));
        }
        Ok(())
    }
}
