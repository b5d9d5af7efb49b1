//! Iteration controller for `patchbee auto`.
//!
//! Each iteration asks the backend for a proposal, decodes it, applies it and
//! runs the verification command. A failed iteration is reverted and its
//! failure fed into the next prompt. The loop stops on the first passing
//! verification or after `max_iterations` attempts.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::context::CodeContext;
use crate::core::types::{
    ApplyMode, Iteration, IterationFailure, IterationOutcome, WorkflowState, WorkflowStatus,
};
use crate::error::WorkflowError;
use crate::io::apply::{Applier, ApplyReport, STATE_DIR};
use crate::io::backend::EditBackend;
use crate::io::decoder::{DecodeOutcome, Decoder};
use crate::io::git::Git;
use crate::io::prompt::{Prompts, TaskDescription};
use crate::io::run_log::{IterationMeta, IterationRecord, RunLog, RunReport};
use crate::io::verify::Verifier;

/// Knobs for one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowConfig {
    pub mode: ApplyMode,
    pub max_iterations: u32,
}

/// Inputs that stay fixed for every iteration.
#[derive(Debug, Clone, Copy)]
pub struct WorkflowRequest<'a> {
    pub root: &'a Path,
    pub config: WorkflowConfig,
    pub context: &'a CodeContext,
    pub task: &'a TaskDescription,
    /// Verification argv, recorded in the report.
    pub command: &'a [String],
}

/// The generative and verification collaborators.
pub struct Collaborators<'a, B, F, V>
where
    F: EditBackend,
{
    pub prompts: &'a Prompts,
    pub backend: B,
    pub decoder: &'a Decoder<'a, F>,
    pub verifier: V,
}

/// Terminal result of a workflow that was not aborted.
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub run_id: String,
    pub state: WorkflowState,
    pub report_path: PathBuf,
}

impl WorkflowOutcome {
    pub fn succeeded(&self) -> bool {
        self.state.status == WorkflowStatus::Succeeded
    }
}

/// Run the generate/apply/verify loop until success or exhaustion.
///
/// Backend failures and an unrunnable verification command abort the run;
/// the tree is reverted and the report still written before returning.
#[instrument(skip_all, fields(mode = request.config.mode.as_str(), max_iterations = request.config.max_iterations))]
pub fn run_workflow<B, F, V, C>(
    request: &WorkflowRequest<'_>,
    collaborators: &Collaborators<'_, B, F, V>,
    mut on_iteration: C,
) -> Result<WorkflowOutcome, WorkflowError>
where
    B: EditBackend,
    F: EditBackend,
    V: Verifier,
    C: FnMut(&Iteration),
{
    let config = request.config;
    if config.max_iterations == 0 {
        return Err(WorkflowError::Config(
            "max_iterations must be at least 1".to_string(),
        ));
    }
    let root = request.root;
    let state_prefix = format!("{STATE_DIR}/");
    Git::new(root).ensure_clean_except_prefixes(&[state_prefix.as_str()])?;
    let run_log = RunLog::create(root, "runs")?;
    let applier = Applier::new(root);
    let code = request.context.render();
    let started_at = Utc::now();
    let mut state = WorkflowState::new(config.max_iterations);
    info!(run_id = run_log.run_id(), files = request.context.len(), "workflow started");

    let run = Run {
        request,
        run_log: &run_log,
        started_at: started_at.to_rfc3339(),
    };

    for index in 1..=config.max_iterations {
        let iter_started = Utc::now();
        let prompt = match state.last() {
            None => collaborators.prompts.initial(config.mode, &code, request.task),
            Some(previous) => {
                collaborators
                    .prompts
                    .retry(config.mode, &code, request.task, previous)
            }
        };
        let prompt = match prompt {
            Ok(prompt) => prompt,
            Err(err) => return Err(run.abort(&mut state, None, &applier, err.into())),
        };

        let response = match collaborators.backend.complete(&prompt.system, &prompt.user) {
            Ok(response) => response,
            Err(err) => return Err(run.abort(&mut state, None, &applier, err.into())),
        };
        let decoded = match collaborators.decoder.decode(config.mode, &response) {
            Ok(decoded) => decoded,
            Err(err) => return Err(run.abort(&mut state, None, &applier, err.into())),
        };
        let fixer_response = decoded.fixer_response().map(str::to_string);

        let mut iteration = Iteration {
            index,
            proposal: None,
            failure: None,
            verification: None,
            outcome: IterationOutcome::Retry,
        };
        let mut repaired = false;
        let mut report = ApplyReport::default();

        match decoded {
            DecodeOutcome::Failed { reason, raw, .. } => {
                iteration.failure = Some(IterationFailure::Decode { reason, raw });
            }
            DecodeOutcome::Decoded {
                proposal,
                repaired: was_repaired,
                ..
            } => {
                repaired = was_repaired;
                let applied = applier.apply(&proposal, &mut report);
                iteration.proposal = Some(proposal);
                match applied {
                    Err(err) => {
                        iteration.failure = Some(IterationFailure::Apply {
                            reason: err.to_string(),
                        });
                    }
                    Ok(()) => match collaborators.verifier.verify(root) {
                        Ok(result) => {
                            if !result.passed() {
                                iteration.failure =
                                    Some(IterationFailure::Verification(result.clone()));
                            }
                            iteration.verification = Some(result);
                        }
                        Err(err) => {
                            return Err(run.abort(&mut state, Some(&report), &applier, err.into()));
                        }
                    },
                }
            }
        }

        if iteration.failure.is_none() {
            iteration.outcome = IterationOutcome::Success;
        } else {
            if iteration.proposal.is_some()
                && let Err(err) = applier.revert(&report)
            {
                state.iterations.push(iteration);
                return Err(run.abort(&mut state, None, &applier, err.into()));
            }
            if index == config.max_iterations {
                iteration.outcome = IterationOutcome::Exhausted;
            }
        }
        info!(index, outcome = ?iteration.outcome, "iteration finished");

        let meta = IterationMeta::new(
            run_log.run_id(),
            config.mode,
            &iteration,
            repaired,
            iter_started,
            Utc::now(),
        );
        let logged = run_log.write_iteration(&IterationRecord {
            meta: &meta,
            prompt: &prompt.render(),
            response: Some(&response),
            fixer_response: fixer_response.as_deref(),
            proposal: iteration.proposal.as_ref(),
            verification: iteration.verification.as_ref(),
        });
        if let Err(err) = logged {
            let applied = (iteration.outcome == IterationOutcome::Success).then_some(&report);
            state.iterations.push(iteration);
            return Err(run.abort(&mut state, applied, &applier, err.into()));
        }
        on_iteration(&iteration);

        let outcome = iteration.outcome;
        state.iterations.push(iteration);
        match outcome {
            IterationOutcome::Success => {
                state.status = WorkflowStatus::Succeeded;
                break;
            }
            IterationOutcome::Exhausted => state.status = WorkflowStatus::Failed,
            IterationOutcome::Retry => {}
        }
    }

    let report_path = run.write_report(&state, None)?;
    info!(status = ?state.status, iterations = state.iterations.len(), "workflow finished");
    Ok(WorkflowOutcome {
        run_id: run_log.run_id().to_string(),
        state,
        report_path,
    })
}

struct Run<'r, 'a> {
    request: &'r WorkflowRequest<'a>,
    run_log: &'r RunLog,
    started_at: String,
}

impl Run<'_, '_> {
    fn write_report(
        &self,
        state: &WorkflowState,
        aborted: Option<String>,
    ) -> anyhow::Result<PathBuf> {
        self.run_log.write_report(&RunReport {
            run_id: self.run_log.run_id(),
            mode: self.request.config.mode,
            command: self.request.command,
            started_at: self.started_at.clone(),
            finished_at: Utc::now().to_rfc3339(),
            state,
            aborted,
        })
    }

    /// Revert anything applied, persist the failed state and hand back `err`.
    fn abort(
        &self,
        state: &mut WorkflowState,
        applied: Option<&ApplyReport>,
        applier: &Applier,
        err: WorkflowError,
    ) -> WorkflowError {
        warn!(error = %err, "workflow aborted");
        if let Some(report) = applied
            && let Err(revert_err) = applier.revert(report)
        {
            warn!(error = %format!("{revert_err:#}"), "revert after fatal error failed");
        }
        state.status = WorkflowStatus::Failed;
        if let Err(log_err) = self.write_report(state, Some(err.to_string())) {
            warn!(error = %format!("{log_err:#}"), "failed to write run report");
        }
        err
    }
}
