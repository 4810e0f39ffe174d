//! Helper process ownership: spawn, and the staged shutdown that keeps an
//! uncooperative helper from blocking anyone.
//!
//! Shutdown ladder, one grace budget per stage:
//!
//! 1. close the helper's stdin and wait for it to exit by itself;
//! 2. send a termination signal and wait;
//! 3. force kill and wait;
//! 4. give up and let the caller continue, whatever the helper is doing.

use crate::broker::BrokeredProcess;
use crate::error::{BridgeError, Result};
use crate::manifest::CallerContext;
use std::{future::Future, io, path::Path, process::Stdio, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    process::{Child, Command},
    time::{timeout, timeout_at, Instant},
};
use tracing::{debug, info, warn};

pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// The three standard streams of a helper, from the bridge's side.
pub struct Pipes {
    pub stdin: BoxedWrite,
    pub stdout: BoxedRead,
    pub stderr: BoxedRead,
}

/// Who owns the helper process for a session.
pub enum ProcessHandle {
    /// Startup has not produced a process (still starting, or failed).
    Uninitialized,
    /// We spawned the helper and must tear it down ourselves.
    Direct(DirectProcess),
    /// A broker owns the helper; teardown is delegated to it.
    Brokered(BrokeredProcess),
}

/// Something that can be waited on and signalled during shutdown.
pub trait Terminable: Send {
    fn id(&self) -> Option<u32>;

    /// Resolve once the process has exited, with its exit code if it has one.
    fn wait(&mut self) -> impl Future<Output = io::Result<Option<i32>>> + Send;

    /// Polite kill (`SIGTERM` on Unix).
    fn terminate(&mut self) -> io::Result<()>;

    /// Forced kill (`SIGKILL` / `TerminateProcess`).
    fn force_kill(&mut self) -> io::Result<()>;
}

/// A helper we spawned ourselves.
#[derive(Debug)]
pub struct DirectProcess {
    child: Child,
}

impl Terminable for DirectProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn wait(&mut self) -> impl Future<Output = io::Result<Option<i32>>> + Send {
        async move { self.child.wait().await.map(|status| status.code()) }
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match self.child.id() {
            #[allow(clippy::cast_possible_wrap)]
            Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from),
            // Already reaped.
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn force_kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

/// Spawn a stdio helper.
///
/// The helper gets `[manifest_path, caller_id]` as arguments and runs in the
/// directory containing the executable. All three standard streams are piped.
pub fn spawn_helper(
    name: &str,
    command: &Path,
    manifest_path: &Path,
    caller: &CallerContext,
) -> Result<(DirectProcess, Pipes)> {
    let mut cmd = Command::new(command);
    cmd.arg(manifest_path)
        .arg(&caller.extension_id)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);
    if let Some(dir) = command.parent().filter(|d| !d.as_os_str().is_empty()) {
        cmd.current_dir(dir);
    }

    let spawn_err = |source: io::Error| BridgeError::Spawn {
        name: name.to_string(),
        source,
    };
    let mut child = cmd.spawn().map_err(spawn_err)?;
    let missing = || spawn_err(io::Error::other("child stdio was not captured"));
    let stdin = child.stdin.take().ok_or_else(missing)?;
    let stdout = child.stdout.take().ok_or_else(missing)?;
    let stderr = child.stderr.take().ok_or_else(missing)?;

    info!(app = name, pid = ?child.id(), command = %command.display(), "started native application");
    Ok((
        DirectProcess { child },
        Pipes {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        },
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStage {
    InputClosed,
    Terminated,
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Exited {
        stage: ShutdownStage,
        code: Option<i32>,
    },
    /// The helper outlived every stage; it is left running.
    GaveUp,
}

fn exited(name: &str, stage: ShutdownStage, code: Option<i32>) -> Option<ShutdownOutcome> {
    info!(app = name, ?stage, ?code, "native application exited");
    Some(ShutdownOutcome::Exited { stage, code })
}

async fn wait_stage<P: Terminable>(
    name: &str,
    proc: &mut P,
    grace: Duration,
    stage: ShutdownStage,
) -> Option<ShutdownOutcome> {
    match timeout(grace, proc.wait()).await {
        Ok(Ok(code)) => exited(name, stage, code),
        Ok(Err(e)) => {
            warn!(app = name, ?stage, error = %e, "waiting for native application failed");
            None
        }
        Err(_) => {
            debug!(app = name, ?stage, "native application still running");
            None
        }
    }
}

/// Run the shutdown ladder. Total time is bounded by three grace budgets.
///
/// `close_input` is the first stage's action; it shares that stage's budget
/// with the wait for a voluntary exit. Signal failures are logged and
/// otherwise ignored.
pub async fn staged_shutdown<P, F>(
    name: &str,
    proc: &mut P,
    close_input: F,
    grace: Duration,
) -> ShutdownOutcome
where
    P: Terminable,
    F: Future<Output = ()> + Send,
{
    let deadline = Instant::now() + grace;
    let first = async {
        close_input.await;
        proc.wait().await
    };
    match timeout_at(deadline, first).await {
        Ok(Ok(code)) => {
            if let Some(done) = exited(name, ShutdownStage::InputClosed, code) {
                return done;
            }
        }
        Ok(Err(e)) => {
            warn!(app = name, error = %e, "waiting for native application failed");
        }
        Err(_) => {
            debug!(app = name, "native application ignored stdin close");
        }
    }

    info!(app = name, pid = ?proc.id(), "sending termination signal");
    if let Err(e) = proc.terminate() {
        warn!(app = name, error = %e, "termination signal failed");
    }
    if let Some(done) = wait_stage(name, proc, grace, ShutdownStage::Terminated).await {
        return done;
    }

    warn!(app = name, pid = ?proc.id(), "force killing native application");
    if let Err(e) = proc.force_kill() {
        warn!(app = name, error = %e, "force kill failed");
    }
    if let Some(done) = wait_stage(name, proc, grace, ShutdownStage::Killed).await {
        return done;
    }

    warn!(app = name, pid = ?proc.id(), "native application did not exit, giving up");
    ShutdownOutcome::GaveUp
}
