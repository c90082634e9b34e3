//! Session Management
//!
//! A Session pairs one client connection with one worker process. Sessions
//! are created by the [`WorkerSupervisor`](crate::supervisor::WorkerSupervisor),
//! which is also the only owner of the registry they live in.
//!
//! # Lifecycle
//!
//! ```text
//! starting ──► running ──► (restarting ──► running)* ──► stopped
//!    │                                                      ▲
//!    └────────────────── spawn failure ─────────────────────┘
//! ```
//!
//! The id is assigned when the connection is accepted and never changes, even
//! when a chat worker is replaced. Once a Session is stopped its id is never
//! registered again.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::protocol::ServerMessage;
use crate::worker::WorkerHandle;

/// Unique identifier for a Session
///
/// Doubles as the connection identity: one connection, one Session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random Session id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

/// What a Session's worker does
///
/// Fixed at creation. Determines the accepted client message and the restart
/// policy on a spontaneous worker exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Face recognition on streamed frames; never restarted
    Recognition,
    /// Conversational retrieval; restarted after a fixed backoff
    Chat,
}

impl SessionKind {
    /// Whether a spontaneous worker exit should be followed by a restart
    #[must_use]
    pub fn restarts_on_crash(self) -> bool {
        matches!(self, Self::Chat)
    }

    /// Lowercase name used in logs and notices
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recognition => "recognition",
            Self::Chat => "chat",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervision state of a Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Worker spawn requested
    Starting,
    /// Worker alive, relay active in both directions
    Running,
    /// Worker exited spontaneously; waiting out the backoff before respawning
    Restarting,
    /// Terminal
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Outbound half of a client connection
///
/// The gateway owns the transport; this sink only queues messages for it.
/// Sending never waits: once the transport has gone away, messages are
/// discarded and `send` reports `false`.
#[derive(Debug, Clone)]
pub struct ClientSink {
    tx: mpsc::UnboundedSender<serde_json::Value>,
}

impl ClientSink {
    /// Create a sink and the receiver the transport writer drains
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<serde_json::Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a message for the client
    ///
    /// Returns false if the client transport is closed.
    pub fn send(&self, message: serde_json::Value) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Queue a gateway notice for the client
    pub fn notify(&self, message: &ServerMessage) -> bool {
        self.send(message.to_value())
    }
}

/// A live Session as stored in the supervisor's registry
#[derive(Debug)]
pub struct Session {
    /// Registry key
    pub id: SessionId,
    /// Session kind
    pub kind: SessionKind,
    /// Current worker; replaced in place on a chat restart
    pub worker: WorkerHandle,
    /// Supervision state
    pub state: SessionState,
    /// Number of times the worker has been replaced
    pub restarts: u32,
    /// When the Session was created
    pub created_at: Instant,
    /// Handle to abort the Session's supervision task
    pub(crate) task: Option<AbortHandle>,
}

impl Session {
    /// Create a Session around a freshly started worker
    #[must_use]
    pub fn new(id: SessionId, kind: SessionKind, worker: WorkerHandle) -> Self {
        Self {
            id,
            kind,
            worker,
            state: SessionState::Starting,
            restarts: 0,
            created_at: Instant::now(),
            task: None,
        }
    }

    /// Point-in-time view of this Session
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            kind: self.kind,
            state: self.state,
            restarts: self.restarts,
            worker_pid: self.worker.pid(),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

/// Read-only snapshot of a registered Session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Session id
    pub id: SessionId,
    /// Session kind
    pub kind: SessionKind,
    /// Supervision state
    pub state: SessionState,
    /// Worker replacements so far
    pub restarts: u32,
    /// OS process id of the current worker
    pub worker_pid: Option<u32>,
    /// Seconds since the Session was created
    pub uptime_secs: u64,
}
