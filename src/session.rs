//! One connection to one helper.
//!
//! Every session runs a driver task that owns the process handle. The driver
//! starts the helper, runs three loops (frame reader, frame writer, stderr
//! logger) and waits for the first cleanup request. Cleanup happens at most
//! once, whoever asks first: the caller closing the port, the helper closing
//! stdout, or a transport error.

use crate::broker::{self, Broker};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::manifest::{self, CallerContext, ManifestLocator, ManifestType, PathStyle};
use crate::port::{Disconnect, Port};
use crate::process::{self, BoxedRead, BoxedWrite, Pipes, ProcessHandle, ShutdownOutcome};
use crate::wire;
use serde_json::Value;
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};

/// Why a session is being torn down.
#[derive(Debug)]
pub(crate) enum CleanupCause {
    /// The caller closed the port. No disconnect notification is sent.
    Caller,
    /// The helper closed stdout on a frame boundary.
    EndOfStream,
    /// Startup or transport failure.
    Failed(BridgeError),
}

/// State shared between the driver, its loops and the caller's port.
pub(crate) struct Shared {
    name: String,
    cleanup_started: AtomicBool,
    cleanup_tx: Mutex<Option<oneshot::Sender<CleanupCause>>>,
}

impl Shared {
    fn new(name: String, cleanup_tx: oneshot::Sender<CleanupCause>) -> Self {
        Self {
            name,
            cleanup_started: AtomicBool::new(false),
            cleanup_tx: Mutex::new(Some(cleanup_tx)),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_cleaning_up(&self) -> bool {
        self.cleanup_started.load(Ordering::Acquire)
    }

    /// Latch cleanup. Only the first caller's cause is delivered; returns
    /// whether this call was the one that won.
    pub(crate) fn begin_cleanup(&self, cause: CleanupCause) -> bool {
        if self.cleanup_started.swap(true, Ordering::AcqRel) {
            debug!(app = %self.name, ?cause, "cleanup already started");
            return false;
        }
        let tx = self
            .cleanup_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(cause);
        }
        true
    }
}

pub(crate) struct SessionParams {
    pub name: String,
    pub caller: CallerContext,
    pub config: BridgeConfig,
    pub locator: Arc<dyn ManifestLocator>,
    pub broker: Option<Arc<dyn Broker>>,
}

struct Driver {
    params: SessionParams,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    inbound: mpsc::UnboundedSender<Value>,
    disconnect: oneshot::Sender<Disconnect>,
    cleanup: oneshot::Receiver<CleanupCause>,
}

struct Loops {
    reader: JoinHandle<()>,
    writer: JoinHandle<Option<BoxedWrite>>,
    stderr: JoinHandle<()>,
    stop_writer: Option<oneshot::Sender<()>>,
}

impl Loops {
    /// Stop the writer between frames and close the helper's stdin.
    async fn close_input(&mut self) {
        if let Some(stop) = self.stop_writer.take() {
            let _ = stop.send(());
        }
        if let Ok(Some(mut stdin)) = (&mut self.writer).await {
            if let Err(e) = stdin.shutdown().await {
                debug!(error = %e, "closing helper stdin failed");
            }
        }
    }
}

/// The bridge's handle on a running session driver.
pub(crate) struct SessionTask {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl SessionTask {
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub(crate) fn close(&self) {
        self.shared.begin_cleanup(CleanupCause::Caller);
    }

    /// Wait for teardown to complete.
    pub(crate) async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(app = %self.shared.name, error = %e, "session driver did not finish cleanly");
        }
    }
}

/// Open a session and return the caller's end immediately. Startup continues
/// in the background; messages posted meanwhile are queued.
pub(crate) fn open(params: SessionParams) -> (Port, SessionTask) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (disc_tx, disc_rx) = oneshot::channel();
    let (cleanup_tx, cleanup_rx) = oneshot::channel();

    let shared = Arc::new(Shared::new(params.name.clone(), cleanup_tx));
    let max_write = params.config.limits.max_write;
    let driver = Driver {
        params,
        shared: shared.clone(),
        outbound: out_rx,
        inbound: in_tx,
        disconnect: disc_tx,
        cleanup: cleanup_rx,
    };
    let task = SessionTask {
        shared: shared.clone(),
        task: tokio::spawn(driver.run()),
    };
    (Port::new(shared, out_tx, in_rx, disc_rx, max_write), task)
}

async fn start(params: &SessionParams) -> Result<(ProcessHandle, Pipes)> {
    let SessionParams {
        name,
        caller,
        locator,
        broker,
        ..
    } = params;

    if let Some(broker) = broker.as_ref().filter(|b| b.should_use()) {
        let (process, pipes) = broker::start_brokered(broker.clone(), name, caller).await?;
        return Ok((ProcessHandle::Brokered(process), pipes));
    }

    let resolved = {
        let (locator, name, caller) = (locator.clone(), name.clone(), caller.clone());
        tokio::task::spawn_blocking(move || locator.lookup(ManifestType::Stdio, &name, &caller))
            .await
            .map_err(|e| BridgeError::Io(io::Error::other(e)))?
    };
    let generic = || BridgeError::NoSuchNativeApplication(name.clone());
    let resolved = resolved.ok_or_else(generic)?;
    let exe = resolved.manifest.path.as_deref().ok_or_else(generic)?;
    let command = manifest::resolve_command(
        PathStyle::native(),
        &resolved.path.to_string_lossy(),
        exe,
    );
    let (process, pipes) = process::spawn_helper(name, &command, &resolved.path, caller)?;
    Ok((ProcessHandle::Direct(process), pipes))
}

impl Driver {
    async fn run(self) {
        let started = start(&self.params).await;
        let Driver {
            params,
            shared,
            outbound,
            inbound,
            disconnect,
            cleanup,
        } = self;
        let name = params.name;
        let grace = params.config.shutdown_grace;

        let (handle, mut loops) = match started {
            Ok((handle, pipes)) if !shared.is_cleaning_up() => {
                let max_read = params.config.limits.max_read;
                let loops = start_loops(&shared, pipes, outbound, inbound, max_read);
                (handle, Some(loops))
            }
            Ok((handle, pipes)) => {
                // Closed while starting: never start the loops, close stdin now.
                drop((pipes, outbound, inbound));
                (handle, None)
            }
            Err(e) => {
                drop((outbound, inbound));
                error!(app = %name, error = %e, "native application failed to start");
                shared.begin_cleanup(CleanupCause::Failed(e));
                (ProcessHandle::Uninitialized, None)
            }
        };

        let cause = cleanup.await.unwrap_or(CleanupCause::Caller);
        info!(app = %name, ?cause, "cleaning up native application session");
        match cause {
            CleanupCause::Caller => {}
            CleanupCause::EndOfStream => {
                let _ = disconnect.send(Disconnect::Clean);
            }
            CleanupCause::Failed(e) => {
                let _ = disconnect.send(Disconnect::Error(e));
            }
        }
        if let Some(loops) = &loops {
            loops.reader.abort();
        }

        teardown(&name, handle, loops.as_mut(), grace).await;
        if let Some(loops) = loops {
            loops.writer.abort();
        }
        debug!(app = %name, "session terminated");
    }
}

fn start_loops(
    shared: &Arc<Shared>,
    pipes: Pipes,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    inbound: mpsc::UnboundedSender<Value>,
    max_read: u32,
) -> Loops {
    let (stop_tx, stop_rx) = oneshot::channel();
    Loops {
        reader: tokio::spawn(read_loop(shared.clone(), pipes.stdout, max_read, inbound)),
        writer: tokio::spawn(write_loop(shared.clone(), pipes.stdin, outbound, stop_rx)),
        stderr: tokio::spawn(stderr_loop(shared.name.clone(), pipes.stderr)),
        stop_writer: Some(stop_tx),
    }
}

async fn teardown(name: &str, handle: ProcessHandle, loops: Option<&mut Loops>, grace: Duration) {
    match handle {
        ProcessHandle::Uninitialized => {}
        ProcessHandle::Direct(mut proc) => {
            let mut loops = loops;
            let close_input = async {
                if let Some(loops) = loops.as_deref_mut() {
                    loops.close_input().await;
                }
            };
            let outcome = process::staged_shutdown(name, &mut proc, close_input, grace).await;
            if outcome == ShutdownOutcome::GaveUp {
                if let Some(loops) = loops {
                    loops.stderr.abort();
                }
            }
        }
        ProcessHandle::Brokered(brokered) => {
            if let Some(loops) = loops {
                // Let an in-flight write land before the broker tears the helper down.
                if timeout(grace, loops.close_input()).await.is_err() {
                    warn!(app = name, "pending write did not finish before broker teardown");
                }
                loops.stderr.abort();
            }
            brokered.close().await;
        }
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut stdout: BoxedRead,
    max_read: u32,
    inbound: mpsc::UnboundedSender<Value>,
) {
    loop {
        match wire::read_message(&mut stdout, max_read).await {
            Ok(Some(msg)) => {
                if inbound.send(msg).is_err() {
                    debug!(app = %shared.name, "message dropped, port receiver is gone");
                }
            }
            Ok(None) => {
                debug!(app = %shared.name, "native application closed stdout");
                shared.begin_cleanup(CleanupCause::EndOfStream);
                return;
            }
            Err(e) => {
                error!(app = %shared.name, error = %e, "reading from native application failed");
                shared.begin_cleanup(CleanupCause::Failed(e));
                return;
            }
        }
    }
}

/// Drains the send queue one frame at a time. Returns stdin so the driver can
/// close it, or `None` after a write error.
async fn write_loop(
    shared: Arc<Shared>,
    mut stdin: BoxedWrite,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    mut stop: oneshot::Receiver<()>,
) -> Option<BoxedWrite> {
    loop {
        let buffer = tokio::select! {
            biased;
            _ = &mut stop => return Some(stdin),
            next = queue.recv() => match next {
                Some(buffer) => buffer,
                None => return Some(stdin),
            },
        };
        if let Err(e) = wire::write_frame(&mut stdin, &buffer).await {
            error!(app = %shared.name, error = %e, "writing to native application failed");
            shared.begin_cleanup(CleanupCause::Failed(e));
            return None;
        }
    }
}

/// Splits helper stderr into lines, keeping partial lines across reads.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.partial.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    pub(crate) fn finish(self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.partial).into_owned())
        }
    }
}

fn log_stderr(app: &str, line: &str) {
    info!(target: "native_bridge::stderr", app, "stderr output from native app {app}: {line}");
}

async fn stderr_loop(app: String, mut stderr: BoxedRead) {
    let mut lines = LineBuffer::default();
    let mut buf = [0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in lines.push(&buf[..n]) {
                    log_stderr(&app, &line);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(app = %app, error = %e, "stderr read failed");
                break;
            }
        }
    }
    if let Some(rest) = lines.finish() {
        log_stderr(&app, &rest);
    }
}
