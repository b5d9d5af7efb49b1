//! Shared value types for the patch workflow.
//!
//! These types are the contracts between the accumulator, decoder, applier,
//! verifier and the workflow controller. They carry no I/O.

use serde::{Deserialize, Serialize};

/// How a proposal is committed to the working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApplyMode {
    /// The model returns a unified diff applied with `git apply`.
    #[default]
    Patch,
    /// The model returns whole-file replacements written directly.
    Direct,
}

impl ApplyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ApplyMode::Patch => "patch",
            ApplyMode::Direct => "direct",
        }
    }
}

/// A whole-file replacement proposed by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    /// Path relative to the output root.
    #[serde(alias = "file_path")]
    pub path: String,
    /// Full replacement text.
    #[serde(alias = "code_content", alias = "code")]
    pub content: String,
}

/// Ordered set of file edits, unique by path.
///
/// Duplicate paths collapse into one entry: the entry stays at the position of
/// the first occurrence and takes the content of the last one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EditBatch {
    edits: Vec<FileEdit>,
}

impl EditBatch {
    pub fn new(edits: Vec<FileEdit>) -> Self {
        let mut batch = Self::default();
        for edit in edits {
            batch.push(edit);
        }
        batch
    }

    /// Insert an edit, replacing the content of an existing entry with the same path.
    pub fn push(&mut self, edit: FileEdit) {
        match self.edits.iter_mut().find(|e| e.path == edit.path) {
            Some(existing) => existing.content = edit.content,
            None => self.edits.push(edit),
        }
    }

    pub fn edits(&self) -> &[FileEdit] {
        &self.edits
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }
}

impl<'de> Deserialize<'de> for EditBatch {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let edits = Vec::<FileEdit>::deserialize(deserializer)?;
        Ok(EditBatch::new(edits))
    }
}

/// Unified diff text scoped to the project root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchDocument(pub String);

impl PatchDocument {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A decoded model proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "body", rename_all = "lowercase")]
pub enum Proposal {
    Edits(EditBatch),
    Patch(PatchDocument),
}

impl Proposal {
    /// Render the proposal the way it is fed back to the model on retry.
    pub fn render(&self) -> String {
        match self {
            Proposal::Patch(patch) => patch.as_str().to_string(),
            Proposal::Edits(batch) => {
                serde_json::to_string_pretty(batch).unwrap_or_else(|_| String::from("[]"))
            }
        }
    }
}

/// Exit code recorded when the verification command was killed on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Captured result of one verification run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub timed_out: bool,
}

impl VerificationResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Combined stdout/stderr in the layout used for logs and retry prompts.
    pub fn combined_output(&self) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&self.stdout);
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&self.stderr);
        if self.timed_out {
            buf.push_str("\n[verification timed out]\n");
        }
        buf
    }
}

/// Why an iteration did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum IterationFailure {
    /// The model output could not be decoded, even after the fixer pass.
    Decode { reason: String, raw: String },
    /// The proposal could not be applied to the working tree.
    Apply { reason: String },
    /// The verification command ran and reported failure.
    Verification(VerificationResult),
}

impl IterationFailure {
    /// Text fed back to the model on the next attempt.
    pub fn feedback(&self) -> String {
        match self {
            IterationFailure::Decode { reason, .. } => {
                format!("Your previous response could not be parsed: {reason}")
            }
            IterationFailure::Apply { reason } => {
                format!("Your previous change could not be applied: {reason}")
            }
            IterationFailure::Verification(result) => result.combined_output(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationOutcome {
    Success,
    Retry,
    Exhausted,
}

/// Record of one generate/apply/verify cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Iteration {
    /// 1-based iteration index.
    pub index: u32,
    pub proposal: Option<Proposal>,
    pub failure: Option<IterationFailure>,
    /// Set whenever the verification command ran, including on success.
    pub verification: Option<VerificationResult>,
    pub outcome: IterationOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Succeeded,
    Failed,
}

/// Mutable state of one workflow run, owned by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowState {
    pub status: WorkflowStatus,
    pub iterations: Vec<Iteration>,
    pub max_iterations: u32,
}

impl WorkflowState {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            status: WorkflowStatus::Running,
            iterations: Vec::new(),
            max_iterations,
        }
    }

    pub fn last(&self) -> Option<&Iteration> {
        self.iterations.last()
    }
}
