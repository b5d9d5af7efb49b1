//! Resilient decoding of model output into proposals.
//!
//! Decoding is two explicit stages: parse the raw text, and if that fails for
//! structured output, parse the fixer model's repair of it exactly once. The
//! result is a tagged [`DecodeOutcome`]; only backend failures are errors.

use anyhow::{Context, Result};
use jsonschema::{Draft, Validator};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::fence::strip_code_fence;
use crate::core::types::{ApplyMode, EditBatch, PatchDocument, Proposal};
use crate::error::{BackendError, DecodeError};
use crate::io::backend::EditBackend;
use crate::io::prompt::Prompts;

const EDIT_BATCH_SCHEMA: &str = include_str!("../../schemas/edit_batch.schema.json");

/// Object keys that models commonly wrap the edit list in.
const WRAPPER_KEYS: [&str; 3] = ["scripts", "files", "edits"];

/// Result of decoding one model response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    Decoded {
        proposal: Proposal,
        /// True when the fixer model's output was needed.
        repaired: bool,
        fixer_response: Option<String>,
    },
    Failed {
        reason: String,
        /// The original model output, kept for diagnostics.
        raw: String,
        fixer_response: Option<String>,
    },
}

impl DecodeOutcome {
    pub fn fixer_response(&self) -> Option<&str> {
        match self {
            DecodeOutcome::Decoded { fixer_response, .. }
            | DecodeOutcome::Failed { fixer_response, .. } => fixer_response.as_deref(),
        }
    }

    pub fn into_result(self) -> Result<Proposal, DecodeError> {
        match self {
            DecodeOutcome::Decoded { proposal, .. } => Ok(proposal),
            DecodeOutcome::Failed { reason, raw, .. } => Err(DecodeError { reason, raw }),
        }
    }
}

/// Decoder holding the fixer backend and the compiled edit-batch schema.
pub struct Decoder<'a, F: EditBackend> {
    fixer: F,
    prompts: &'a Prompts,
    schema: Validator,
}

impl<'a, F: EditBackend> Decoder<'a, F> {
    pub fn new(fixer: F, prompts: &'a Prompts) -> Result<Self> {
        let schema_json: Value =
            serde_json::from_str(EDIT_BATCH_SCHEMA).context("parse edit batch schema")?;
        let schema = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema_json)
            .context("compile edit batch schema")?;
        Ok(Self {
            fixer,
            prompts,
            schema,
        })
    }

    /// Decode `raw` for `mode`, calling the fixer at most once.
    #[instrument(skip_all, fields(mode = mode.as_str(), raw_bytes = raw.len()))]
    pub fn decode(&self, mode: ApplyMode, raw: &str) -> Result<DecodeOutcome, BackendError> {
        match mode {
            ApplyMode::Patch => Ok(match parse_patch(raw) {
                Ok(patch) => DecodeOutcome::Decoded {
                    proposal: Proposal::Patch(patch),
                    repaired: false,
                    fixer_response: None,
                },
                Err(reason) => {
                    warn!(%reason, "model output is not a usable patch");
                    DecodeOutcome::Failed {
                        reason,
                        raw: raw.to_string(),
                        fixer_response: None,
                    }
                }
            }),
            ApplyMode::Direct => self.decode_edits(raw),
        }
    }

    fn decode_edits(&self, raw: &str) -> Result<DecodeOutcome, BackendError> {
        let first_error = match parse_edit_batch(raw, &self.schema) {
            Ok(batch) => {
                debug!(edits = batch.len(), "decoded edit batch");
                return Ok(DecodeOutcome::Decoded {
                    proposal: Proposal::Edits(batch),
                    repaired: false,
                    fixer_response: None,
                });
            }
            Err(reason) => reason,
        };

        info!(reason = %first_error, "structured output malformed, asking fixer");
        let prompt = self
            .prompts
            .fixer(raw)
            .map_err(|err| BackendError::InvalidResponse(format!("{err:#}")))?;
        let repaired = self.fixer.complete(&prompt.system, &prompt.user)?;

        Ok(match parse_edit_batch(&repaired, &self.schema) {
            Ok(batch) => {
                info!(edits = batch.len(), "fixer repaired structured output");
                DecodeOutcome::Decoded {
                    proposal: Proposal::Edits(batch),
                    repaired: true,
                    fixer_response: Some(repaired),
                }
            }
            Err(second_error) => {
                warn!(%first_error, %second_error, "fixer output still malformed");
                DecodeOutcome::Failed {
                    reason: format!("{first_error}; after repair: {second_error}"),
                    raw: raw.to_string(),
                    fixer_response: Some(repaired),
                }
            }
        })
    }
}

/// Parse fenced or bare JSON into an [`EditBatch`].
pub fn parse_edit_batch(text: &str, schema: &Validator) -> Result<EditBatch, String> {
    let body = strip_code_fence(text);
    let value: Value = serde_json::from_str(body).map_err(|err| format!("invalid JSON: {err}"))?;
    let value = unwrap_known_wrapper(value);

    let messages: Vec<String> = schema.iter_errors(&value).map(|e| e.to_string()).collect();
    if !messages.is_empty() {
        return Err(format!(
            "edit list does not match the expected shape: {}",
            messages.join("; ")
        ));
    }
    serde_json::from_value(value).map_err(|err| format!("invalid edit list: {err}"))
}

fn unwrap_known_wrapper(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.len() == 1 => {
            let key = map.keys().next().cloned().unwrap_or_default();
            if WRAPPER_KEYS.contains(&key.as_str()) {
                map.remove(&key).unwrap_or(Value::Null)
            } else {
                Value::Object(map)
            }
        }
        other => other,
    }
}

/// Extract a unified diff, dropping a fence and any prose before the first header.
pub fn parse_patch(text: &str) -> Result<PatchDocument, String> {
    let body = strip_code_fence(text);
    let mut offset = None;
    let mut pos = 0usize;
    for line in body.split_inclusive('\n') {
        if line.starts_with("diff --git ") || line.starts_with("--- ") {
            offset = Some(pos);
            break;
        }
        pos += line.len();
    }
    let Some(offset) = offset else {
        return Err("no diff header ('diff --git' or '--- ') found".to_string());
    };

    let patch = until_closing_fence(&body[offset..]);
    if !patch.lines().any(|l| l.starts_with("+++ ")) {
        return Err("diff has no '+++ ' header".to_string());
    }
    if !patch.lines().any(|l| l.starts_with("@@")) {
        return Err("diff has no hunks".to_string());
    }

    let mut patch = patch.trim_end().to_string();
    patch.push('\n');
    Ok(PatchDocument(patch))
}

/// Cut at the first fence marker line; diff lines never start with one.
fn until_closing_fence(patch: &str) -> &str {
    let mut end = 0usize;
    for line in patch.split_inclusive('\n') {
        if line.trim_start().starts_with("```") {
            break;
        }
        end += line.len();
    }
    &patch[..end]
}
