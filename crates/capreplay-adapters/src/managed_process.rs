//! A single external process with join-with-timeout and forced termination.
//!
//! Output, when captured, is drained on a background task so a chatty child
//! can never block on a full pipe while we wait on it. Stdout and stderr lines
//! land in one buffer in the order they arrive. Termination is SIGTERM
//! first with a short grace period, then SIGKILL.

use crate::CommandSpec;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader, Split};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long a terminated child gets to exit before it is SIGKILLed.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Exit status and captured output of a finished process.
#[derive(Debug)]
pub struct ProcessExit {
    /// Exit code; `None` if the process died from a signal.
    pub code: Option<i32>,
    /// Whether the process exited with code 0.
    pub success: bool,
    /// Stdout and stderr merged line by line. Empty when not captured.
    pub output: String,
}

/// Why joining a process did not yield an exit status.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("Process did not exit within {0:?}")]
    TimedOut(Duration),

    #[error("Failed to wait for process: {0}")]
    Io(#[from] io::Error),
}

/// Handle to a running child process.
#[derive(Debug)]
pub struct ManagedProcess {
    child: Child,
    pid: u32,
    output: Option<JoinHandle<io::Result<String>>>,
    exited: bool,
}

impl ManagedProcess {
    /// Launches `spec` directly, without an intermediate shell.
    pub fn start(spec: &CommandSpec) -> io::Result<Self> {
        let mut child = spec.to_command().spawn()?;
        let pid = child.id().unwrap_or_default();

        let output = if spec.captures_output() {
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            Some(tokio::spawn(collect_output(stdout, stderr)))
        } else {
            None
        };

        debug!(pid, command = %spec, "Spawned process");
        Ok(Self {
            child,
            pid,
            output,
            exited: false,
        })
    }

    /// OS process id assigned at spawn.
    pub fn id(&self) -> u32 {
        self.pid
    }

    /// Waits for the process to exit, giving up after `timeout`.
    ///
    /// On timeout the process is left running; the caller decides whether to
    /// [`kill`](Self::kill) it.
    pub async fn join(&mut self, timeout: Option<Duration>) -> Result<ProcessExit, WaitError> {
        debug!(pid = self.pid, ?timeout, "Joining with process");
        let wait = async {
            let output = match self.output.take() {
                Some(handle) => handle.await.map_err(io::Error::other)??,
                None => String::new(),
            };
            let status = self.child.wait().await?;
            Ok::<_, io::Error>((status, output))
        };

        let (status, output) = match timeout {
            Some(duration) => match tokio::time::timeout(duration, wait).await {
                Ok(result) => result?,
                Err(_) => return Err(WaitError::TimedOut(duration)),
            },
            None => wait.await?,
        };

        self.exited = true;
        Ok(ProcessExit {
            code: status.code(),
            success: status.success(),
            output,
        })
    }

    /// Terminates the process and waits for it to die.
    ///
    /// Safe to call repeatedly and on a process that already exited.
    pub async fn kill(&mut self) -> io::Result<()> {
        if self.exited {
            return Ok(());
        }
        if let Some(output) = self.output.take() {
            output.abort();
        }
        if self.child.try_wait()?.is_some() {
            self.exited = true;
            return Ok(());
        }

        terminate(&mut self.child);
        match tokio::time::timeout(KILL_GRACE, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(pid = self.pid, ?status, "Process terminated");
            }
            Err(_) => {
                warn!(pid = self.pid, "Grace period expired, sending SIGKILL");
                self.child.kill().await?;
            }
        }
        self.exited = true;
        Ok(())
    }
}

/// Sends SIGTERM so the child can flush and clean up before exiting.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let pid = Pid::from_raw(pid as i32);
        debug!(%pid, "Sending SIGTERM to child process");
        let _ = kill(pid, Signal::SIGTERM);
    }
}

/// No SIGTERM equivalent, so the child is killed outright.
#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Failed to kill child process");
    }
}

async fn collect_output<O, E>(stdout: Option<O>, stderr: Option<E>) -> io::Result<String>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut stdout = stdout.map(|r| BufReader::new(r).split(b'\n'));
    let mut stderr = stderr.map(|r| BufReader::new(r).split(b'\n'));
    let mut merged = String::new();

    // Both pipes are read concurrently so neither can fill up and stall the child.
    while stdout.is_some() || stderr.is_some() {
        let (line, from_stdout) = tokio::select! {
            line = next_line(&mut stdout), if stdout.is_some() => (line?, true),
            line = next_line(&mut stderr), if stderr.is_some() => (line?, false),
        };
        match line {
            Some(bytes) => {
                merged.push_str(&String::from_utf8_lossy(&bytes));
                merged.push('\n');
            }
            None if from_stdout => stdout = None,
            None => stderr = None,
        }
    }
    Ok(merged)
}

async fn next_line<R: AsyncBufRead + Unpin>(
    lines: &mut Option<Split<R>>,
) -> io::Result<Option<Vec<u8>>> {
    match lines {
        Some(lines) => lines.next_segment().await,
        None => Ok(None),
    }
}
