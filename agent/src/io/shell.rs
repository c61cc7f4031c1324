//! Shell command execution with timeouts and bounded output capture.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::types::ExecResult;
use crate::io::clock::CancelToken;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1024 * 1024;

/// Runs external commands on behalf of shell steps.
pub trait Shell {
    fn run(
        &self,
        cancel: &CancelToken,
        work_dir: &Path,
        command: &str,
        args: &[String],
    ) -> Result<ExecResult>;
}

/// Production [`Shell`]: spawns the command in the work dir, drains
/// stdout/stderr concurrently to avoid pipe deadlocks, and kills the child
/// when the timeout expires.
#[derive(Debug, Clone, Copy)]
pub struct SystemShell {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl Default for SystemShell {
    fn default() -> Self {
        SystemShell {
            timeout: DEFAULT_COMMAND_TIMEOUT,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl Shell for SystemShell {
    #[instrument(skip_all, fields(command, timeout_secs = self.timeout.as_secs()))]
    fn run(
        &self,
        cancel: &CancelToken,
        work_dir: &Path,
        command: &str,
        args: &[String],
    ) -> Result<ExecResult> {
        cancel.err_if_cancelled()?;

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !work_dir.as_os_str().is_empty() {
            cmd.current_dir(work_dir);
        }

        debug!("spawning child process");
        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "failed to spawn command");
                return Err(e).with_context(|| format!("spawn command {command:?}"));
            }
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let limit = self.output_limit_bytes;
        let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
        let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

        let status = match child.wait_timeout(self.timeout).context("wait for command")? {
            Some(status) => status,
            None => {
                warn!(timeout_secs = self.timeout.as_secs(), "command timed out, killing");
                child.kill().context("kill command")?;
                child.wait().context("wait command after kill")?;
                // Let the readers drain whatever the child managed to emit.
                let _ = join_output(stdout_handle);
                let _ = join_output(stderr_handle);
                bail!("command timed out after {:?}: {command}", self.timeout);
            }
        };

        let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
        let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
        if stdout_truncated > 0 || stderr_truncated > 0 {
            warn!(stdout_truncated, stderr_truncated, "output truncated");
        }

        let exit_code = status.code().unwrap_or(-1);
        debug!(exit_code, "command finished");
        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
            duration: started.elapsed(),
        })
    }
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Reads a stream to EOF, keeping at most `limit` bytes and counting the
/// rest as truncated while still draining the pipe.
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
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
