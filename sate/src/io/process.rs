//! Helpers for running external tools with timeouts, bounded output, and
//! cooperative kill support.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::sched::cancel::KillSwitch;

/// How often a running tool is checked for kill requests and timeouts.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub killed: bool,
}

impl CommandOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Last few lines of stderr for error messages.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let stderr = self.stderr_str();
        let tail: Vec<&str> = stderr.lines().rev().take(lines).collect();
        tail.into_iter().rev().collect::<Vec<_>>().join("\n")
    }

    /// Turn an unsuccessful run into an error naming `tool`.
    pub fn ensure_success(&self, tool: &str) -> Result<()> {
        if self.killed {
            return Err(anyhow!("{tool} was killed"));
        }
        if self.timed_out {
            return Err(anyhow!("{tool} timed out"));
        }
        if !self.status.success() {
            return Err(anyhow!(
                "{tool} failed with status {:?}: {}",
                self.status.code(),
                self.stderr_tail(5)
            ));
        }
        Ok(())
    }
}

/// Limits applied to one tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// The child runs in its own process group so a kill reaches everything it
/// spawned. Tripping `kill` terminates the group; the call then returns with
/// `killed = true`. `output_limit_bytes` bounds the stdout/stderr kept in memory
/// (bytes beyond this are discarded while still draining the pipe).
#[instrument(
    skip_all,
    fields(program = ?cmd.get_program(), timeout_secs = limits.timeout.as_secs())
)]
pub fn run_command(
    mut cmd: Command,
    limits: ProcessLimits,
    kill: &KillSwitch,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    if kill.is_tripped() {
        return Err(anyhow!("kill requested before spawn"));
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };
    let mut killed = !kill.attach(child.id());

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = limits.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let started = Instant::now();
    let mut timed_out = false;
    let status = loop {
        if killed {
            terminate(&mut child)?;
            break child.wait().context("wait command after kill")?;
        }
        if let Some(status) = child.wait_timeout(POLL_INTERVAL).context("wait for command")? {
            break status;
        }
        if kill.is_tripped() {
            warn!("kill requested, terminating tool");
            killed = true;
            continue;
        }
        if started.elapsed() >= limits.timeout {
            warn!(
                timeout_secs = limits.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            terminate(&mut child)?;
            break child.wait().context("wait command after kill")?;
        }
    };
    // The trip may have killed the group before the poll loop noticed it.
    killed |= kill.is_tripped();
    kill.detach();

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, killed, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        killed,
    })
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

fn terminate(child: &mut Child) -> Result<()> {
    terminate_process_group(child.id());
    child.kill().context("kill command")
}

/// Send SIGKILL to the process group led by `pid`. Best effort.
#[cfg(unix)]
pub fn terminate_process_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if raw <= 1 {
        return;
    }
    let _ = killpg(Pid::from_raw(raw), Signal::SIGKILL);
}

/// Without process groups the poll loop in [`run_command`] kills the child.
#[cfg(not(unix))]
pub fn terminate_process_group(_pid: u32) {}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

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
