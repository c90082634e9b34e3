//! Worker Supervisor
//!
//! Owns the registry of live Sessions and runs the per-Session state machine:
//! spawn, relay worker output, react to worker exit, tear down.
//!
//! # Architecture
//!
//! ```text
//!   Gateway ──open_session()──►┌──────────────────────────────────────┐
//!           ──send()──────────►│ WorkerSupervisor                     │
//!           ──teardown()──────►│   DashMap<SessionId, Session>        │
//!                              │   Arc<dyn WorkerLauncher>            │
//!                              └──────────────┬───────────────────────┘
//!                                             │ one task per Session
//!                                             ▼
//!                        relay output ──► wait exit ──► policy
//!                              ▲                          │
//!                              └── chat: notice, backoff, respawn
//!                                  recognition: remove entry
//! ```
//!
//! # Concurrency
//!
//! The registry is the only state shared across Sessions. Every access goes
//! through the map's per-key locking and no entry guard is ever held across
//! an await point, so a slow Session never stalls another.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::SupervisorError;
use crate::framer::MAX_LINE_SIZE;
use crate::protocol::{ServerMessage, WorkerRequest};
use crate::session::{ClientSink, Session, SessionId, SessionInfo, SessionKind, SessionState};
use crate::worker::{ProcessLauncher, WorkerCommand, WorkerEvents, WorkerLauncher, WorkerOutput};

/// Default delay before a crashed chat worker is replaced
pub const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_millis(1000);

/// How long output produced before an exit may keep arriving
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Program and leading arguments for one kind of worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProgram {
    /// Program to execute
    pub program: String,
    /// Arguments placed before the store path
    pub args: Vec<String>,
}

impl WorkerProgram {
    /// Create a worker program description
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// Supervisor settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Shared persistent store, passed to every worker as its last argument
    pub store_path: PathBuf,
    /// Recognition worker
    pub recognition: WorkerProgram,
    /// Chat worker
    pub chat: WorkerProgram,
    /// Fixed delay before a crashed chat worker is replaced
    pub restart_backoff: Duration,
    /// Longest accepted worker output line in bytes
    pub max_line_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("faces.db"),
            recognition: WorkerProgram::new(
                "python3",
                vec!["face_recognition_server.py".to_string()],
            ),
            chat: WorkerProgram::new("python3", vec!["chat_rag.py".to_string()]),
            restart_backoff: DEFAULT_RESTART_BACKOFF,
            max_line_bytes: MAX_LINE_SIZE,
        }
    }
}

impl SupervisorConfig {
    /// Full command line for a worker of the given kind
    #[must_use]
    pub fn command_for(&self, kind: SessionKind) -> WorkerCommand {
        let program = match kind {
            SessionKind::Recognition => &self.recognition,
            SessionKind::Chat => &self.chat,
        };
        let mut args = program.args.clone();
        args.push(self.store_path.to_string_lossy().into_owned());
        WorkerCommand::new(program.program.clone(), args).with_max_line_bytes(self.max_line_bytes)
    }
}

/// Count of live Sessions by kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Live recognition Sessions
    pub recognition: usize,
    /// Live chat Sessions
    pub chat: usize,
    /// Sessions currently waiting out a restart backoff
    pub restarting: usize,
}

impl SessionSummary {
    /// Total live Sessions
    #[must_use]
    pub fn total(&self) -> usize {
        self.recognition + self.chat
    }
}

struct Inner {
    sessions: DashMap<SessionId, Session>,
    launcher: Arc<dyn WorkerLauncher>,
    config: RwLock<SupervisorConfig>,
}

/// Owner of all live Sessions
///
/// Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct WorkerSupervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("sessions", &self.inner.sessions.len())
            .finish_non_exhaustive()
    }
}

impl WorkerSupervisor {
    /// Create a supervisor with a custom launcher
    #[must_use]
    pub fn new(config: SupervisorConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                launcher,
                config: RwLock::new(config),
            }),
        }
    }

    /// Create a supervisor that spawns real worker processes
    #[must_use]
    pub fn with_process_launcher(config: SupervisorConfig) -> Self {
        Self::new(config, Arc::new(ProcessLauncher))
    }

    /// Start a worker and register a Session for one client connection
    ///
    /// On success the client has already been sent a `connected` notice. On
    /// spawn failure the client is sent a generic `error` notice and nothing
    /// is registered.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::Worker` if the worker cannot be started.
    pub fn open_session(
        &self,
        kind: SessionKind,
        client: ClientSink,
    ) -> Result<SessionId, SupervisorError> {
        let id = SessionId::new();
        let command = self.inner.config.read().command_for(kind);

        let (worker, events) = match self.inner.launcher.launch(kind, &command) {
            Ok(pair) => pair,
            Err(e) => {
                error!(session = %id, kind = %kind, error = %e, "Failed to start worker");
                client.notify(&ServerMessage::unavailable());
                return Err(e.into());
            }
        };

        let pid = worker.pid();
        client.notify(&ServerMessage::connected(kind));

        let mut session = Session::new(id, kind, worker);
        session.state = SessionState::Running;
        self.inner.sessions.insert(id, session);

        let span = info_span!("session", id = %id, kind = %kind);
        let task = tokio::spawn(
            supervise(Arc::clone(&self.inner), id, kind, client, events).instrument(span),
        );

        // The task may already have removed a worker that died instantly
        if let Some(mut session) = self.inner.sessions.get_mut(&id) {
            session.task = Some(task.abort_handle());
        }

        info!(session = %id, kind = %kind, pid = ?pid, "Session opened");
        Ok(id)
    }

    /// Forward one request to a Session's current worker
    ///
    /// A worker that has exited, or is being replaced, silently drops the
    /// request.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::UnknownSession` if no live Session has this id.
    pub fn send(&self, id: SessionId, request: &WorkerRequest) -> Result<(), SupervisorError> {
        let worker = self
            .inner
            .sessions
            .get(&id)
            .map(|session| session.worker.clone())
            .ok_or(SupervisorError::UnknownSession(id))?;

        if !worker.send(request) {
            debug!(session = %id, "Request dropped, worker unavailable");
        }
        Ok(())
    }

    /// Stop a Session: kill its worker and remove it from the registry
    ///
    /// Idempotent. Returns whether a live Session was removed.
    pub fn teardown(&self, id: SessionId) -> bool {
        let Some((_, mut session)) = self.inner.sessions.remove(&id) else {
            debug!(session = %id, "Teardown of unknown session ignored");
            return false;
        };

        session.state = SessionState::Stopped;
        session.worker.kill();
        if let Some(task) = session.task.take() {
            task.abort();
        }

        info!(
            session = %id,
            kind = %session.kind,
            restarts = session.restarts,
            "Session stopped"
        );
        true
    }

    /// Tear down every live Session
    ///
    /// Returns the number of Sessions stopped.
    pub fn shutdown(&self) -> usize {
        let count = self
            .session_ids()
            .into_iter()
            .filter(|id| self.teardown(*id))
            .count();
        info!(count, "Supervisor shut down");
        count
    }

    /// Number of live Sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Whether a live Session has this id
    #[must_use]
    pub fn contains(&self, id: SessionId) -> bool {
        self.inner.sessions.contains_key(&id)
    }

    /// Ids of all live Sessions
    #[must_use]
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Snapshot of one Session
    #[must_use]
    pub fn session_info(&self, id: SessionId) -> Option<SessionInfo> {
        self.inner.sessions.get(&id).map(|session| session.info())
    }

    /// Live Sessions counted by kind
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        let mut summary = SessionSummary::default();
        for entry in self.inner.sessions.iter() {
            match entry.kind {
                SessionKind::Recognition => summary.recognition += 1,
                SessionKind::Chat => summary.chat += 1,
            }
            if entry.state == SessionState::Restarting {
                summary.restarting += 1;
            }
        }
        summary
    }

    /// Current settings
    #[must_use]
    pub fn config(&self) -> SupervisorConfig {
        self.inner.config.read().clone()
    }

    /// Replace settings for workers started from now on
    ///
    /// Running workers are left alone.
    pub fn update_config(&self, config: SupervisorConfig) {
        *self.inner.config.write() = config;
        info!("Supervisor configuration updated");
    }
}

/// Per-Session supervision loop
async fn supervise(
    inner: Arc<Inner>,
    id: SessionId,
    kind: SessionKind,
    client: ClientSink,
    mut events: WorkerEvents,
) {
    loop {
        relay_output(id, &client, &mut events).await;
        let pid = events.pid();
        let notice = events.wait_exit().await;

        if notice.requested {
            debug!(pid = ?pid, "Worker terminated on request");
            return;
        }

        let diagnostics = inner
            .sessions
            .get(&id)
            .map(|session| session.worker.recent_diagnostics())
            .unwrap_or_default();
        warn!(
            pid = ?pid,
            code = ?notice.code,
            diagnostics = ?diagnostics,
            "Worker exited unexpectedly"
        );

        if !kind.restarts_on_crash() {
            if inner.sessions.remove(&id).is_some() {
                info!("Session stopped after worker exit");
            }
            return;
        }

        match restart_worker(&inner, id, kind, &client).await {
            Some(next) => events = next,
            None => return,
        }
    }
}

/// Forward worker output to the client until the worker exits
///
/// Stdout is not required to close: a descendant may still hold it. After
/// the exit, output already produced is relayed for up to `EXIT_DRAIN_TIMEOUT`.
async fn relay_output(id: SessionId, client: &ClientSink, events: &mut WorkerEvents) {
    loop {
        match events.next_before_exit().await {
            Some(WorkerOutput::End) => return,
            Some(output) => relay_item(id, client, output),
            None => break,
        }
    }

    let drained = tokio::time::timeout(EXIT_DRAIN_TIMEOUT, async {
        loop {
            match events.next_output().await {
                WorkerOutput::End => return,
                output => relay_item(id, client, output),
            }
        }
    })
    .await;
    if drained.is_err() {
        debug!(session = %id, "Worker stdout still open after exit");
    }
}

fn relay_item(id: SessionId, client: &ClientSink, output: WorkerOutput) {
    match output {
        WorkerOutput::Message(value) => {
            if !client.send(value) {
                debug!(session = %id, "Client transport closed, dropping worker output");
            }
        }
        WorkerOutput::DecodeError { line, error } => {
            warn!(
                session = %id,
                line = %line,
                error = %error,
                "Failed to decode worker output"
            );
        }
        WorkerOutput::End => {}
    }
}

/// Replace a crashed chat worker after the backoff
///
/// Returns the new worker's events, or `None` if the Session is gone or no
/// worker could be started.
async fn restart_worker(
    inner: &Inner,
    id: SessionId,
    kind: SessionKind,
    client: &ClientSink,
) -> Option<WorkerEvents> {
    match inner.sessions.get_mut(&id) {
        Some(mut session) => session.state = SessionState::Restarting,
        None => return None,
    }

    client.notify(&ServerMessage::restarting());
    let (command, backoff) = {
        let config = inner.config.read();
        (config.command_for(kind), config.restart_backoff)
    };
    info!(backoff_ms = backoff.as_millis() as u64, "Restarting worker");
    tokio::time::sleep(backoff).await;

    if !inner.sessions.contains_key(&id) {
        debug!("Session torn down during backoff");
        return None;
    }

    match inner.launcher.launch(kind, &command) {
        Ok((worker, events)) => {
            let Some(mut session) = inner.sessions.get_mut(&id) else {
                worker.kill();
                return None;
            };
            session.worker = worker;
            session.state = SessionState::Running;
            session.restarts += 1;
            info!(
                pid = ?events.pid(),
                restarts = session.restarts,
                "Worker restarted"
            );
            Some(events)
        }
        Err(e) => {
            error!(error = %e, "Failed to restart worker");
            client.notify(&ServerMessage::unavailable());
            if let Some((_, mut session)) = inner.sessions.remove(&id) {
                session.state = SessionState::Stopped;
            }
            None
        }
    }
}
