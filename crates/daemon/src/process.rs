//! Process-group supervision for transcoder subprocesses.
//!
//! Each transcode runs as the leader of its own process group so the whole
//! tree (the transcoder plus anything it forks) can be signaled at once.
//! Termination is SIGTERM to the group, a bounded grace period, then SIGKILL
//! to the group, followed by reaping the leader.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Bytes of stderr retained for diagnostics.
pub const STDERR_TAIL_BYTES: usize = 4096;

/// How long to wait for the stderr reader once the group is gone.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How a supervised process ended.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// The leader exited on its own.
    Exited {
        status: ExitStatus,
        stderr_tail: String,
    },
    /// The deadline passed and the group was torn down.
    TimedOut { stderr_tail: String },
}

/// A running subprocess that leads its own process group.
#[derive(Debug)]
pub struct SupervisedProcess {
    child: Child,
    pgid: i32,
    stderr_task: Option<JoinHandle<String>>,
}

/// Send `signal` to every process in the group. A group that no longer
/// exists is not an error.
pub fn signal_group(pgid: i32, signal: Signal) -> bool {
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pgid, ?signal, error = %e, "failed to signal process group");
            false
        }
    }
}

/// Spawn `argv` as the leader of a new process group.
///
/// stdin and stdout are discarded; stderr is captured into a bounded tail.
pub fn spawn_in_group(argv: &[String]) -> io::Result<SupervisedProcess> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argument vector"))?;

    let mut child = Command::new(program)
        .args(args)
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let pid = child
        .id()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child exited before its pid was read"))?;
    let pgid = pid as i32;

    let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(read_tail(stderr)));

    debug!(program = %program, pgid, "spawned supervised process");

    Ok(SupervisedProcess {
        child,
        pgid,
        stderr_task,
    })
}

async fn read_tail(mut stderr: ChildStderr) -> String {
    let mut tail: Vec<u8> = Vec::with_capacity(STDERR_TAIL_BYTES);
    let mut buf = [0u8; 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_TAIL_BYTES {
                    let excess = tail.len() - STDERR_TAIL_BYTES;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

impl SupervisedProcess {
    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Wait for the leader up to `timeout`, tearing the group down on expiry.
    ///
    /// # Requirements
    ///
    /// - On expiry the group gets SIGTERM, then SIGKILL after `kill_grace`,
    ///   and the leader is reaped before this returns.
    /// - On a normal exit any descendants left behind are killed.
    pub async fn wait_with_timeout(
        mut self,
        timeout: Duration,
        kill_grace: Duration,
    ) -> io::Result<ProcessOutcome> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                signal_group(self.pgid, Signal::SIGKILL);
                let stderr_tail = self.drain_stderr().await;
                Ok(ProcessOutcome::Exited {
                    status,
                    stderr_tail,
                })
            }
            Err(_) => {
                warn!(pgid = self.pgid, ?timeout, "deadline exceeded; terminating process group");
                self.terminate(kill_grace).await?;
                let stderr_tail = self.drain_stderr().await;
                Ok(ProcessOutcome::TimedOut { stderr_tail })
            }
        }
    }

    /// SIGTERM the group, wait up to `grace`, then SIGKILL and reap.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        signal_group(self.pgid, Signal::SIGTERM);

        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                debug!(pgid = self.pgid, "grace period elapsed; sending SIGKILL");
                signal_group(self.pgid, Signal::SIGKILL);
                self.child.wait().await?
            }
        };

        // Descendants that ignored SIGTERM outlive the leader.
        signal_group(self.pgid, Signal::SIGKILL);
        Ok(status)
    }

    async fn drain_stderr(&mut self) -> String {
        let Some(task) = self.stderr_task.take() else {
            return String::new();
        };
        match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await {
            Ok(Ok(tail)) => tail,
            _ => String::new(),
        }
    }
}
