//! Error Types
//!
//! Failures are split by how far they are allowed to travel:
//!
//! - [`WorkerError`]: the worker process could not be launched. Fatal to the
//!   Session that asked for it, surfaced to the client only as a generic notice.
//! - [`SupervisorError`]: a registry operation could not be completed.
//! - [`InboundError`]: one client message could not be turned into a worker
//!   request. Logged and dropped, the connection stays open.
//! - [`FrameError`]: a worker message could not be encoded, or a worker line
//!   exceeded the configured maximum.
//! - [`GatewayError`]: a client connection could not be upgraded.
//!
//! Decode failures of individual worker output lines are not errors at all:
//! they travel through the output stream as
//! [`WorkerOutput::DecodeError`](crate::worker::WorkerOutput::DecodeError).

use thiserror::Error;

use crate::session::{SessionId, SessionKind};

/// Errors raised while starting a worker process
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker program could not be launched
    #[error("Failed to spawn worker program {program}: {source}")]
    SpawnFailure {
        /// Program that was attempted
        program: String,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// The process started but one of its standard streams was not captured
    #[error("Worker process {pid:?} is missing its {stream} pipe")]
    MissingPipe {
        /// Process id, if the OS reported one
        pid: Option<u32>,
        /// Name of the missing stream
        stream: &'static str,
    },
}

/// Errors raised by the worker supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Starting the worker failed
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// No live Session is registered under this id
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),
}

/// Errors raised while classifying an inbound client message
#[derive(Debug, Error)]
pub enum InboundError {
    /// The message was not valid JSON
    #[error("Malformed client message: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Valid JSON, but not a message this Session accepts
    #[error("Unexpected {message_type} message for a {kind} session")]
    UnexpectedShape {
        /// Kind of the Session the message arrived on
        kind: SessionKind,
        /// The `type` field of the message, or `<missing>`
        message_type: String,
    },
}

/// Errors raised by the line framer
#[derive(Debug, Error)]
pub enum FrameError {
    /// The message could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A line grew past the configured maximum before a terminator arrived
    #[error("Line too long: {len} bytes (max: {max})")]
    LineTooLong {
        /// Bytes seen so far for the offending line
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// A line was not valid UTF-8, so it cannot be JSON
    #[error("Invalid UTF-8 in line: {source}")]
    InvalidUtf8 {
        /// Lossy preview of the offending line
        line: String,
        /// Position of the first invalid byte
        source: std::str::Utf8Error,
    },
}

/// Errors raised while accepting a client connection
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The WebSocket upgrade did not complete
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[source] tokio_tungstenite::tungstenite::Error),
}
