//! Run logging under `.patchbee/`.
//!
//! Product artifacts, written regardless of `RUST_LOG`:
//!
//! ```text
//! .patchbee/
//! ├── .gitignore                 # "*", keeps logs out of the user's repo
//! ├── runs/<run-id>/
//! │   ├── <iter>/{meta.json, prompt.md, response.txt, fixer_response.txt,
//! │   │           proposal.patch | proposal.json, verify.log}
//! │   └── report.json
//! └── assist/<run-id>/...
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{
    ApplyMode, Iteration, IterationFailure, IterationOutcome, Proposal, VerificationResult,
    WorkflowState,
};
use crate::io::apply::STATE_DIR;

/// Create `.patchbee/` with a catch-all `.gitignore`.
pub fn ensure_state_dir(root: &Path) -> Result<PathBuf> {
    let dir = root.join(STATE_DIR);
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let ignore = dir.join(".gitignore");
    if !ignore.exists() {
        write_text(&ignore, "*\n")?;
    }
    Ok(dir)
}

/// Per-iteration metadata persisted to `meta.json`.
#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub run_id: String,
    pub iter: u32,
    pub mode: ApplyMode,
    pub outcome: IterationOutcome,
    /// `decode`, `apply` or `verification` when the iteration failed.
    pub failure_stage: Option<&'static str>,
    pub failure_reason: Option<String>,
    /// The fixer model's output was used to decode the response.
    pub repaired: bool,
    pub exit_code: Option<i32>,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

impl IterationMeta {
    pub fn new(
        run_id: &str,
        mode: ApplyMode,
        iteration: &Iteration,
        repaired: bool,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        let (failure_stage, failure_reason) = match &iteration.failure {
            None => (None, None),
            Some(IterationFailure::Decode { reason, .. }) => (Some("decode"), Some(reason.clone())),
            Some(IterationFailure::Apply { reason }) => (Some("apply"), Some(reason.clone())),
            Some(IterationFailure::Verification(result)) => (
                Some("verification"),
                Some(format!("exit code {}", result.exit_code)),
            ),
        };
        Self {
            run_id: run_id.to_string(),
            iter: iteration.index,
            mode,
            outcome: iteration.outcome,
            failure_stage,
            failure_reason,
            repaired,
            exit_code: iteration.verification.as_ref().map(|v| v.exit_code),
            started_at: started_at.to_rfc3339(),
            ended_at: ended_at.to_rfc3339(),
            duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub prompt_path: PathBuf,
    pub response_path: PathBuf,
    pub fixer_response_path: PathBuf,
    pub patch_path: PathBuf,
    pub edits_path: PathBuf,
    pub verify_log_path: PathBuf,
}

impl IterationPaths {
    pub fn new(run_dir: &Path, iter: u32) -> Self {
        let dir = run_dir.join(iter.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            prompt_path: dir.join("prompt.md"),
            response_path: dir.join("response.txt"),
            fixer_response_path: dir.join("fixer_response.txt"),
            patch_path: dir.join("proposal.patch"),
            edits_path: dir.join("proposal.json"),
            verify_log_path: dir.join("verify.log"),
            dir,
        }
    }
}

/// Everything recorded about one iteration.
pub struct IterationRecord<'a> {
    pub meta: &'a IterationMeta,
    pub prompt: &'a str,
    pub response: Option<&'a str>,
    pub fixer_response: Option<&'a str>,
    pub proposal: Option<&'a Proposal>,
    pub verification: Option<&'a VerificationResult>,
}

/// Final report persisted to `report.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport<'a> {
    pub run_id: &'a str,
    pub mode: ApplyMode,
    pub command: &'a [String],
    pub started_at: String,
    pub finished_at: String,
    pub state: &'a WorkflowState,
    /// Set when a fatal error ended the run.
    pub aborted: Option<String>,
}

/// Log directory for one run.
#[derive(Debug, Clone)]
pub struct RunLog {
    run_id: String,
    dir: PathBuf,
}

impl RunLog {
    /// Create `.patchbee/<kind>/<run-id>/` with a fresh, timestamped run id.
    pub fn create(root: &Path, kind: &str) -> Result<Self> {
        let base = ensure_state_dir(root)?.join(kind);
        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let mut run_id = format!("run-{stamp}");
        let mut suffix = 2u32;
        while base.join(&run_id).exists() {
            run_id = format!("run-{stamp}-{suffix}");
            suffix += 1;
        }
        let dir = base.join(&run_id);
        fs::create_dir_all(&dir).with_context(|| format!("create run dir {}", dir.display()))?;
        debug!(%run_id, dir = %dir.display(), "created run log");
        Ok(Self { run_id, dir })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_iteration(&self, record: &IterationRecord<'_>) -> Result<IterationPaths> {
        let paths = IterationPaths::new(&self.dir, record.meta.iter);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;

        write_json(&paths.meta_path, record.meta)?;
        write_text(&paths.prompt_path, record.prompt)?;
        if let Some(response) = record.response {
            write_text(&paths.response_path, response)?;
        }
        if let Some(fixer) = record.fixer_response {
            write_text(&paths.fixer_response_path, fixer)?;
        }
        match record.proposal {
            Some(Proposal::Patch(patch)) => write_text(&paths.patch_path, patch.as_str())?,
            Some(Proposal::Edits(batch)) => write_json(&paths.edits_path, batch)?,
            None => {}
        }
        if let Some(verification) = record.verification {
            write_text(&paths.verify_log_path, &verification.combined_output())?;
        }
        Ok(paths)
    }

    /// Write an arbitrary artifact into the run directory (used by `assist`).
    pub fn write_artifact(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.dir.join(name);
        write_text(&path, contents)?;
        Ok(path)
    }

    pub fn write_report(&self, report: &RunReport<'_>) -> Result<PathBuf> {
        let path = self.dir.join("report.json");
        write_json(&path, report)?;
        Ok(path)
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    write_text(path, &buf)
}
