//! Subprocess execution: spawn, capture, timeout, termination.
//!
//! Commands carry an explicit program and argv, so spawning goes through
//! std::process rather than a shell.  The wait loop polls so that one
//! blocked worker can still observe cancellation and per-command
//! timeouts; on unix a cancelled child first gets SIGTERM and a grace
//! period before the hard kill.

use crate::signal;
use std::fs::File;
use std::io::Read;
use std::process::{Child, Command as OsCommand, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// How a subprocess ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Termination {
    Success,
    /// Non-zero exit code.
    Failure(i32),
    /// Killed by a signal (unix only).
    Signaled(i32),
    TimedOut,
    Cancelled,
}

/// Everything needed to spawn one command, borrowed from the Command.
pub struct Invocation<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub cwd: Option<&'a str>,
    pub env: &'a [(String, String)],
    pub env_remove: &'a [&'a str],
    pub stdin: Option<&'a str>,
    pub stdout: Option<&'a str>,
    pub stderr: Option<&'a str>,
}

pub struct ProcessResult {
    pub termination: Termination,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub fn run(
    inv: &Invocation,
    cancel: &AtomicBool,
    timeout: Option<Duration>,
    grace: Duration,
) -> std::io::Result<ProcessResult> {
    let mut cmd = OsCommand::new(inv.program);
    cmd.args(inv.args);
    if let Some(cwd) = inv.cwd {
        cmd.current_dir(cwd);
    }
    for (k, v) in inv.env {
        cmd.env(k, v);
    }
    for k in inv.env_remove {
        cmd.env_remove(k);
    }

    cmd.stdin(match inv.stdin {
        Some(path) => Stdio::from(File::open(path)?),
        None => Stdio::null(),
    });
    cmd.stdout(match inv.stdout {
        Some(path) => Stdio::from(File::create(path)?),
        None => Stdio::piped(),
    });
    cmd.stderr(match inv.stderr {
        Some(path) => Stdio::from(File::create(path)?),
        None => Stdio::piped(),
    });

    let mut child = cmd.spawn()?;

    // Drain pipes on their own threads so a chatty child can't fill a
    // pipe and deadlock against our wait loop.
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let deadline = timeout.map(|t| Instant::now() + t);
    let forced = loop {
        if let Some(status) = child.try_wait()? {
            break status_termination(status);
        }
        if cancel.load(Ordering::Relaxed) || signal::was_interrupted() {
            terminate(&mut child, grace)?;
            break Termination::Cancelled;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                terminate(&mut child, grace)?;
                break Termination::TimedOut;
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    let stdout = join_reader(stdout_reader);
    let stderr = join_reader(stderr_reader);

    Ok(ProcessResult {
        termination: forced,
        stdout,
        stderr,
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut r: R) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = r.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<std::thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default()
}

fn status_termination(status: std::process::ExitStatus) -> Termination {
    if status.success() {
        return Termination::Success;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return Termination::Signaled(sig);
        }
    }
    Termination::Failure(status.code().unwrap_or(-1))
}

/// Ask the child to exit, give it `grace` to comply, then kill it.
fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        // Safety: plain kill(2) on the pid we just spawned.
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if child.try_wait()?.is_some() {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
    #[cfg(not(unix))]
    let _ = grace;
    match child.kill() {
        Ok(()) => {
            let _ = child.wait()?;
            Ok(())
        }
        // Already exited between try_wait and kill.
        Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(err) => Err(err),
    }
}
