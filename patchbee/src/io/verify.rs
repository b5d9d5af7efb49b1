//! Verification runner for `patchbee auto`.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tracing::{info, instrument};

use crate::core::types::{TIMEOUT_EXIT_CODE, VerificationResult};
use crate::error::VerificationExecError;
use crate::io::process::{ProcessLimits, collect_with_timeout, spawn_piped};

/// Exit code recorded when the process ended without one (killed by a signal).
pub const SIGNAL_EXIT_CODE: i32 = -1;

/// Largest script file embedded into prompts.
const MAX_SCRIPT_BYTES: u64 = 64 * 1024;

/// Runs the user's verification command against the project root.
pub trait Verifier {
    fn verify(&self, root: &Path) -> Result<VerificationResult, VerificationExecError>;
}

impl<V: Verifier + ?Sized> Verifier for &V {
    fn verify(&self, root: &Path) -> Result<VerificationResult, VerificationExecError> {
        (**self).verify(root)
    }
}

/// Runs an argv vector with the project root as working directory.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    command: Vec<String>,
    limits: ProcessLimits,
}

impl CommandVerifier {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            limits: ProcessLimits {
                timeout,
                output_limit_bytes,
            },
        }
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    fn exec_error(&self, message: impl Into<String>) -> VerificationExecError {
        VerificationExecError {
            command: self.command.clone(),
            message: message.into(),
        }
    }
}

impl Verifier for CommandVerifier {
    #[instrument(skip_all, fields(command = ?self.command))]
    fn verify(&self, root: &Path) -> Result<VerificationResult, VerificationExecError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| self.exec_error("verification command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(root);

        let child = spawn_piped(cmd, None).map_err(|err| self.exec_error(err.to_string()))?;
        let output = collect_with_timeout(child, self.limits)
            .map_err(|err| self.exec_error(format!("{err:#}")))?;

        let exit_code = if output.timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            output.status.code().unwrap_or(SIGNAL_EXIT_CODE)
        };
        info!(exit_code, timed_out = output.timed_out, "verification finished");
        Ok(VerificationResult {
            exit_code,
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            timed_out: output.timed_out,
        })
    }
}

/// Text of the verification script when the command's program or first
/// argument names a readable file under `root` (e.g. `./test.sh`, `sh test.sh`).
pub fn read_script(root: &Path, command: &[String]) -> Option<String> {
    command.iter().take(2).find_map(|arg| {
        if Path::new(arg).is_absolute() {
            return None;
        }
        let path = root.join(arg);
        let meta = fs::metadata(&path).ok()?;
        if !meta.is_file() || meta.len() > MAX_SCRIPT_BYTES {
            return None;
        }
        fs::read_to_string(&path).ok()
    })
}

/// Command line as shown to the model and in logs.
pub fn display_command(command: &[String]) -> String {
    command
        .iter()
        .map(|arg| {
            if arg.is_empty() || arg.chars().any(char::is_whitespace) {
                format!("'{arg}'")
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
