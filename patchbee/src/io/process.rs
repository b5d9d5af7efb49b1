//! Child process helpers with a wall-clock bound and capped output capture.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// How long pipe readers may keep draining once the child has exited or been killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Bounds applied to a child process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    pub timeout: Duration,
    /// Bytes of stdout/stderr kept in memory; the rest is drained and counted.
    pub output_limit_bytes: usize,
}

/// Captured child process output.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl ProcessOutput {
    /// Stdout as text, with a marker when bytes were dropped.
    pub fn stdout_text(&self) -> String {
        with_truncation_notice(&self.stdout, self.stdout_truncated, "stdout")
    }

    /// Stderr as text, with a marker when bytes were dropped.
    pub fn stderr_text(&self) -> String {
        with_truncation_notice(&self.stderr, self.stderr_truncated, "stderr")
    }
}

fn with_truncation_notice(bytes: &[u8], truncated: usize, label: &str) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if truncated > 0 {
        text.push_str(&format!("\n[{label} truncated {truncated} bytes]\n"));
    }
    text
}

/// Spawn `cmd` with piped stdout/stderr, feeding `stdin` if given.
///
/// Spawn failures are returned as raw I/O errors so callers can tell
/// "could not start" apart from "ran and failed". On unix the child leads
/// its own process group so a timeout can kill everything it started.
pub fn spawn_piped(mut cmd: Command, stdin: Option<&[u8]>) -> std::io::Result<Child> {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn()?;

    if let Some(input) = stdin
        && let Some(mut child_stdin) = child.stdin.take()
    {
        // Dropping the handle closes the pipe so the child sees EOF.
        child_stdin.write_all(input)?;
    }
    Ok(child)
}

/// Wait for `child` within `limits`, draining both pipes on reader threads.
///
/// On timeout the child's process group is killed and `timed_out` is set.
/// Readers get [`DRAIN_GRACE`] after exit; a pipe still held open by a
/// background process past that is abandoned.
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs()))]
pub fn collect_with_timeout(mut child: Child, limits: ProcessLimits) -> Result<ProcessOutput> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = limits.output_limit_bytes;
    let stdout_rx = spawn_reader(stdout, limit);
    let stderr_rx = spawn_reader(stderr, limit);

    let mut timed_out = false;
    let status = match child
        .wait_timeout(limits.timeout)
        .context("wait for command")?
    {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = limits.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_group(&child);
            // Covers platforms or failures where the group kill did nothing.
            if let Err(err) = child.kill() {
                debug!(error = %err, "kill after group kill");
            }
            child.wait().context("wait command after kill")?
        }
    };

    let deadline = Instant::now() + DRAIN_GRACE;
    let (stdout, stdout_truncated) = recv_output(&stdout_rx, deadline, "stdout")?;
    let (stderr, stderr_truncated) = recv_output(&stderr_rx, deadline, "stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Spawn and collect in one call; spawn errors become `anyhow` errors.
pub fn run_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    limits: ProcessLimits,
) -> Result<ProcessOutput> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let child = spawn_piped(cmd, stdin).with_context(|| format!("spawn {program}"))?;
    collect_with_timeout(child, limits)
}

type ReaderResult = Result<(Vec<u8>, usize)>;

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> Receiver<ReaderResult> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // The receiver is gone once the drain grace has passed.
        let _ = tx.send(read_stream_limited(reader, limit));
    });
    rx
}

fn recv_output(rx: &Receiver<ReaderResult>, deadline: Instant, label: &str) -> ReaderResult {
    let wait = deadline.saturating_duration_since(Instant::now());
    match rx.recv_timeout(wait) {
        Ok(result) => result.with_context(|| format!("read {label}")),
        Err(RecvTimeoutError::Timeout) => {
            warn!(stream = label, "pipe still open after exit, output abandoned");
            let notice =
                format!("[{label} not collected: pipe held open by a background process]\n");
            Ok((notice.into_bytes(), 0))
        }
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("{label} reader thread panicked")),
    }
}

#[cfg(unix)]
fn kill_process_group(child: &Child) {
    let group = format!("-{}", child.id());
    match Command::new("kill")
        .args(["-KILL", "--", &group])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => debug!(?status, "process group kill failed"),
        Err(err) => debug!(error = %err, "spawn kill for process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(output_limit_bytes: usize) -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_secs(10),
            output_limit_bytes,
        }
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        let output = run_with_timeout(cmd, None, limits(1000)).expect("run");
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stdout_text().trim(), "out");
        assert_eq!(output.stderr_text().trim(), "err");
        assert!(!output.timed_out);
    }

    #[test]
    fn feeds_stdin() {
        let cmd = Command::new("cat");
        let output = run_with_timeout(cmd, Some(b"piped"), limits(1000)).expect("run");
        assert_eq!(output.stdout_text(), "piped");
    }

    #[test]
    fn truncates_beyond_limit() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 0123456789"]);
        let output = run_with_timeout(cmd, None, limits(4)).expect("run");
        assert_eq!(output.stdout, b"0123");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.stdout_text().contains("[stdout truncated 6 bytes]"));
    }

    #[test]
    fn kills_on_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let output = run_with_timeout(
            cmd,
            None,
            ProcessLimits {
                timeout: Duration::from_millis(100),
                output_limit_bytes: 100,
            },
        )
        .expect("run");
        assert!(output.timed_out);
    }

    #[test]
    fn timeout_is_bounded_when_grandchildren_hold_the_pipes() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 6; echo done"]);
        let started = Instant::now();
        let output = run_with_timeout(
            cmd,
            None,
            ProcessLimits {
                timeout: Duration::from_millis(300),
                output_limit_bytes: 100,
            },
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!output.stdout_text().contains("done"));
    }

    #[cfg(unix)]
    #[test]
    fn background_writer_does_not_block_collection() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo early; (sleep 6) & exit 0"]);
        let started = Instant::now();
        let output = run_with_timeout(cmd, None, limits(1000)).expect("run");
        assert_eq!(output.status.code(), Some(0));
        assert!(!output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn spawn_failure_is_reported() {
        let cmd = Command::new("definitely-not-a-real-binary-xyz");
        assert!(spawn_piped(cmd, None).is_err());
    }
}
