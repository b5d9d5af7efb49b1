//! Single-shot `patchbee assist`: one request, one decode, direct writes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::core::context::CodeContext;
use crate::core::types::{ApplyMode, Proposal};
use crate::io::apply::{ApplyReport, write_edits};
use crate::io::backend::EditBackend;
use crate::io::decoder::{DecodeOutcome, Decoder};
use crate::io::prompt::Prompts;
use crate::io::run_log::RunLog;

#[derive(Debug, Clone, Copy)]
pub struct AssistRequest<'a> {
    /// Project root; logs go to `.patchbee/assist/` below it.
    pub root: &'a Path,
    /// Directory the generated files are written into.
    pub output_dir: &'a Path,
    pub context: &'a CodeContext,
    pub instructions: &'a str,
}

#[derive(Debug, Clone)]
pub struct AssistOutcome {
    pub run_id: String,
    pub output_dir: PathBuf,
    pub report: ApplyReport,
    pub repaired: bool,
}

/// Ask once, decode with the fixer fallback, write the files.
///
/// Unlike the iterative workflow there is nothing to retry, so a decode
/// failure is returned as an error.
#[instrument(skip_all, fields(output_dir = %request.output_dir.display()))]
pub fn run_assist<B, F>(
    request: &AssistRequest<'_>,
    prompts: &Prompts,
    backend: &B,
    decoder: &Decoder<'_, F>,
) -> Result<AssistOutcome>
where
    B: EditBackend,
    F: EditBackend,
{
    let run_log = RunLog::create(request.root, "assist")?;
    let prompt = prompts.assist(&request.context.render(), request.instructions)?;
    run_log.write_artifact("prompt.md", &prompt.render())?;

    let response = backend.complete(&prompt.system, &prompt.user)?;
    run_log.write_artifact("response.txt", &response)?;

    let decoded = decoder.decode(ApplyMode::Direct, &response)?;
    if let Some(fixer) = decoded.fixer_response() {
        run_log.write_artifact("fixer_response.txt", fixer)?;
    }
    let repaired = matches!(decoded, DecodeOutcome::Decoded { repaired: true, .. });
    let batch = match decoded.into_result()? {
        Proposal::Edits(batch) => batch,
        Proposal::Patch(_) => anyhow::bail!("assist expects file edits, got a patch"),
    };
    let listing = serde_json::to_string_pretty(&batch).context("serialize edits")?;
    run_log.write_artifact("proposal.json", &listing)?;

    let mut report = ApplyReport::default();
    write_edits(request.output_dir, &batch, &mut report)?;
    info!(
        run_id = run_log.run_id(),
        written = report.written.len(),
        rejected = report.rejected.len(),
        "assist finished"
    );
    Ok(AssistOutcome {
        run_id: run_log.run_id().to_string(),
        output_dir: request.output_dir.to_path_buf(),
        report,
        repaired,
    })
}
