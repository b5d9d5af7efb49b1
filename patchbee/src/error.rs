//! Error taxonomy for the patch workflow.
//!
//! Only [`BackendError`] and [`VerificationExecError`] abort a running
//! workflow. Decode and apply failures are absorbed into the retry loop and
//! surface in the final report.

use std::path::PathBuf;

use thiserror::Error;

/// Failure talking to a generative backend. Never retried inside the loop.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("backend rejected credentials (status {status}): {message}")]
    Authentication { status: u16, message: String },

    #[error("backend returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("backend response could not be parsed: {0}")]
    InvalidResponse(String),

    #[error("backend returned an empty response")]
    EmptyResponse,
}

/// Model output that could not be decoded, even after the fixer pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("could not decode model output: {reason}")]
pub struct DecodeError {
    pub reason: String,
    /// The original, unmodified model output.
    pub raw: String,
}

/// A proposal that could not be committed to the working tree.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("patch rejected by git apply: {0}")]
    PatchRejected(String),

    #[error("no edits were written: {0}")]
    NothingWritten(String),

    #[error("failed to write {path}: {message}")]
    Io { path: PathBuf, message: String },
}

/// A proposed path that would land outside the output root.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("refusing to write '{path}': {reason}")]
pub struct SecurityViolation {
    pub path: String,
    pub reason: String,
}

/// The verification command itself could not be executed.
#[derive(Error, Debug)]
#[error("verification command {command:?} could not be executed: {message}")]
pub struct VerificationExecError {
    pub command: Vec<String>,
    pub message: String,
}

/// Errors that end a workflow without a normal terminal state.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    VerificationExec(#[from] VerificationExecError),

    #[error("workspace error: {0:#}")]
    Workspace(#[from] anyhow::Error),
}
