//! Worker Handle
//!
//! Wraps one spawned worker process. The process talks newline-delimited JSON
//! on stdin/stdout; stderr carries free-form diagnostics that are logged and
//! never relayed.
//!
//! # Architecture
//!
//! ```text
//!                 WorkerHandle (clone-able control side)
//!                   send() ──► input queue ──► [writer task] ──► stdin
//!                   kill() ──► kill signal ──► [exit task] ──► child.kill()
//!
//!                 WorkerEvents (single consumer)
//!   stdout ──► [reader task + FrameDecoder] ──► next_output()
//!   child.wait() ──► [exit task] ──────────────► wait_exit() / next_before_exit()
//!   stderr ──► [diagnostics task] ──► tracing + recent tail
//! ```
//!
//! Dropping every `WorkerHandle` clone counts as a kill request, so a handle
//! that falls out of the registry can never leave its process running.
//!
//! The input queue is unbounded: a worker that reads slower than its client
//! writes accumulates buffered requests.

use std::collections::VecDeque;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::WorkerError;
use crate::framer::{encode, Frame, FrameDecoder, MAX_LINE_SIZE};
use crate::session::SessionKind;

/// Capacity of the decoded-output channel
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Read buffer size for worker stdout
const READ_BUFFER_SIZE: usize = 8192;

/// Number of stderr lines kept for crash reports
const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// How to start one worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    /// Program to execute
    pub program: String,
    /// Arguments, store path included
    pub args: Vec<String>,
    /// Longest accepted stdout line in bytes
    pub max_line_bytes: usize,
}

impl WorkerCommand {
    /// Create a command with the default line limit
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            max_line_bytes: MAX_LINE_SIZE,
        }
    }

    /// Set the stdout line limit
    #[must_use]
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }
}

/// Starts worker processes for the supervisor
///
/// The supervisor only ever talks to this trait, so tests can observe or
/// script every spawn.
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker of the given kind
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::SpawnFailure` if the program cannot be launched.
    fn launch(
        &self,
        kind: SessionKind,
        command: &WorkerCommand,
    ) -> Result<(WorkerHandle, WorkerEvents), WorkerError>;
}

/// Launcher that spawns real OS processes
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        kind: SessionKind,
        command: &WorkerCommand,
    ) -> Result<(WorkerHandle, WorkerEvents), WorkerError> {
        WorkerHandle::start(kind, command)
    }
}

/// One item from a worker's output stream
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutput {
    /// A complete JSON message
    Message(serde_json::Value),
    /// A line that was not valid JSON; the stream continues
    DecodeError {
        /// Raw line preview
        line: String,
        /// Parse error description
        error: String,
    },
    /// Stdout closed; no more output will arrive
    End,
}

impl From<Frame<serde_json::Value>> for WorkerOutput {
    fn from(frame: Frame<serde_json::Value>) -> Self {
        match frame {
            Frame::Message(value) => Self::Message(value),
            Frame::Malformed { line, error } => Self::DecodeError { line, error },
        }
    }
}

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitNotice {
    /// Exit code, `None` if terminated by a signal
    pub code: Option<i32>,
    /// Whether termination was requested through `kill()`
    pub requested: bool,
}

impl ExitNotice {
    /// True if the worker died on its own
    #[must_use]
    pub fn is_spontaneous(&self) -> bool {
        !self.requested
    }
}

/// Reported when the exit task is gone without sending a notice
const REQUESTED_EXIT: ExitNotice = ExitNotice {
    code: None,
    requested: true,
};

/// State shared between a handle and its background tasks
#[derive(Debug)]
struct WorkerState {
    alive: AtomicBool,
    kill_requested: AtomicBool,
    diagnostics: Mutex<VecDeque<String>>,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            kill_requested: AtomicBool::new(false),
            diagnostics: Mutex::new(VecDeque::with_capacity(DIAGNOSTIC_TAIL_LINES)),
        }
    }

    fn record_diagnostic(&self, line: String) {
        let mut tail = self.diagnostics.lock();
        if tail.len() == DIAGNOSTIC_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

struct HandleInner {
    pid: Option<u32>,
    kind: SessionKind,
    input: mpsc::UnboundedSender<Vec<u8>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    state: Arc<WorkerState>,
}

/// Control side of a running worker
///
/// Cheap to clone; all clones refer to the same process.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("pid", &self.inner.pid)
            .field("kind", &self.inner.kind)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    /// Spawn a worker process
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::SpawnFailure` if the program cannot be launched.
    pub fn start(
        kind: SessionKind,
        command: &WorkerCommand,
    ) -> Result<(Self, WorkerEvents), WorkerError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // On Linux, the worker gets SIGTERM if the bridge dies first
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|source| WorkerError::SpawnFailure {
            program: command.program.clone(),
            source,
        })?;
        let pid = child.id();

        // A missing pipe drops `child`, which kills it
        let stdin = child
            .stdin
            .take()
            .ok_or(WorkerError::MissingPipe { pid, stream: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(WorkerError::MissingPipe { pid, stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(WorkerError::MissingPipe { pid, stream: "stderr" })?;

        let state = Arc::new(WorkerState::new());
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(write_input(stdin, input_rx, pid));
        tokio::spawn(read_output(stdout, output_tx, command.max_line_bytes, pid));
        tokio::spawn(read_diagnostics(stderr, Arc::clone(&state), kind, pid));
        tokio::spawn(wait_for_exit(child, kill_rx, exit_tx, Arc::clone(&state), pid));

        info!(
            pid = ?pid,
            kind = %kind,
            program = %command.program,
            "Worker started"
        );

        let handle = Self {
            inner: Arc::new(HandleInner {
                pid,
                kind,
                input: input_tx,
                kill: Mutex::new(Some(kill_tx)),
                state,
            }),
        };
        let events = WorkerEvents {
            pid,
            output: output_rx,
            exit: exit_rx,
            exited: None,
        };

        Ok((handle, events))
    }

    /// Serialize a message and queue it for the worker's stdin
    ///
    /// Writing to a worker that has already exited is not an error for the
    /// caller: the message is dropped and logged. Returns whether the message
    /// was queued.
    pub fn send<T: Serialize>(&self, message: &T) -> bool {
        if !self.is_alive() {
            debug!(pid = ?self.inner.pid, "Worker not alive, dropping input");
            return false;
        }

        let bytes = match encode(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(pid = ?self.inner.pid, error = %e, "Failed to encode worker input");
                return false;
            }
        };

        if self.inner.input.send(bytes).is_err() {
            debug!(pid = ?self.inner.pid, "Worker input closed, dropping input");
            return false;
        }
        true
    }

    /// Request termination
    ///
    /// Idempotent, and safe after the process has already exited.
    pub fn kill(&self) {
        let state = &self.inner.state;
        state.kill_requested.store(true, Ordering::SeqCst);
        state.alive.store(false, Ordering::SeqCst);

        if let Some(tx) = self.inner.kill.lock().take() {
            debug!(pid = ?self.inner.pid, "Killing worker");
            // Exit task may already be gone
            let _ = tx.send(());
        }
    }

    /// Whether the worker may still accept input
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.state.alive.load(Ordering::SeqCst)
    }

    /// Whether `kill()` has been called on any clone of this handle
    #[must_use]
    pub fn termination_requested(&self) -> bool {
        self.inner.state.kill_requested.load(Ordering::SeqCst)
    }

    /// OS process id
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// Kind of Session this worker serves
    #[must_use]
    pub fn kind(&self) -> SessionKind {
        self.inner.kind
    }

    /// Most recent stderr lines, oldest first
    #[must_use]
    pub fn recent_diagnostics(&self) -> Vec<String> {
        self.inner.state.diagnostics.lock().iter().cloned().collect()
    }
}

/// Consumer side of a running worker: decoded output and the exit notice
#[derive(Debug)]
pub struct WorkerEvents {
    pid: Option<u32>,
    output: mpsc::Receiver<WorkerOutput>,
    exit: oneshot::Receiver<ExitNotice>,
    exited: Option<ExitNotice>,
}

impl WorkerEvents {
    /// Await the next decoded output item
    ///
    /// Returns `WorkerOutput::End` once stdout has closed, including after a
    /// kill, and on every call after that.
    pub async fn next_output(&mut self) -> WorkerOutput {
        self.output.recv().await.unwrap_or(WorkerOutput::End)
    }

    /// Await the next output item, or process exit if that comes first
    ///
    /// Returns `None` once the process has exited, even while a descendant
    /// still holds stdout open. Output already queued is returned before the
    /// exit is reported.
    pub async fn next_before_exit(&mut self) -> Option<WorkerOutput> {
        if self.exited.is_some() {
            return None;
        }

        tokio::select! {
            biased;
            item = self.output.recv() => Some(item.unwrap_or(WorkerOutput::End)),
            notice = &mut self.exit => {
                self.exited = Some(notice.unwrap_or(REQUESTED_EXIT));
                None
            }
        }
    }

    /// Await process exit
    ///
    /// Every call after the first returns the same notice.
    pub async fn wait_exit(&mut self) -> ExitNotice {
        if let Some(notice) = self.exited {
            return notice;
        }
        let notice = (&mut self.exit).await.unwrap_or(REQUESTED_EXIT);
        self.exited = Some(notice);
        notice
    }

    /// OS process id
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Drain the input queue into the worker's stdin
async fn write_input(
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pid: Option<u32>,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = stdin.write_all(&bytes).await {
            debug!(pid = ?pid, error = %e, "Worker stdin closed");
            break;
        }
        if let Err(e) = stdin.flush().await {
            debug!(pid = ?pid, error = %e, "Failed to flush worker stdin");
            break;
        }
    }
}

/// Decode stdout into output items until EOF
async fn read_output(
    mut stdout: ChildStdout,
    tx: mpsc::Sender<WorkerOutput>,
    max_line: usize,
    pid: Option<u32>,
) {
    let mut decoder = FrameDecoder::with_max_line(max_line);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(pid = ?pid, error = %e, "Worker stdout read error");
                break;
            }
        };

        decoder.push(&buf[..n]);
        while let Some(frame) = decoder.next_frame::<serde_json::Value>() {
            if tx.send(frame.into()).await.is_err() {
                debug!(pid = ?pid, "Worker output receiver dropped");
                return;
            }
        }
    }

    if let Some(frame) = decoder.finish::<serde_json::Value>() {
        let _ = tx.send(frame.into()).await;
    }
    debug!(pid = ?pid, "Worker stdout closed");
}

/// Log stderr line by line and keep a short tail
async fn read_diagnostics(
    stderr: ChildStderr,
    state: Arc<WorkerState>,
    kind: SessionKind,
    pid: Option<u32>,
) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                debug!(target: "worker_diagnostics", pid = ?pid, kind = %kind, "{line}");
                state.record_diagnostic(line);
            }
            Err(e) => {
                debug!(pid = ?pid, error = %e, "Worker stderr read error");
                break;
            }
        }
    }
}

/// Wait for the process to end, killing it on request
async fn wait_for_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<ExitNotice>,
    state: Arc<WorkerState>,
    pid: Option<u32>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        // Fires on kill() and when the last handle is dropped
        _ = kill_rx => {
            state.kill_requested.store(true, Ordering::SeqCst);
            if let Err(e) = child.start_kill() {
                debug!(pid = ?pid, error = %e, "Worker already gone");
            }
            child.wait().await
        }
    };

    state.alive.store(false, Ordering::SeqCst);

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(pid = ?pid, error = %e, "Error waiting for worker");
            None
        }
    };
    let notice = ExitNotice {
        code,
        requested: state.kill_requested.load(Ordering::SeqCst),
    };

    info!(
        pid = ?pid,
        code = ?code,
        requested = notice.requested,
        "Worker exited"
    );

    // Receiver is gone if the Session was torn down first
    let _ = exit_tx.send(notice);
}
