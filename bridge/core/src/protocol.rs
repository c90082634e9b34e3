//! Wire Protocol
//!
//! Messages exchanged on both legs of the bridge. Every message is one JSON
//! object whose `type` field names its shape.
//!
//! # Client ⇄ Gateway
//!
//! ```text
//! in  (recognition)  {"type":"frame","image":"data:image/jpeg;base64,..."}
//! in  (chat)         {"type":"query","query":"Who is registered?"}
//! out                {"type":"recognition_result","faces":[...]}
//! out                {"type":"response","answer":"..."}
//! out                {"type":"system","message":"..."}
//! out                {"type":"error","message":"..."}
//! ```
//!
//! # Gateway ⇄ Worker
//!
//! Worker input carries the payload plus a server-side timestamp
//! (`{"image":...,"timestamp":...}` or `{"query":...,"timestamp":...}`).
//! Worker output is relayed to the client verbatim, so it travels as a
//! [`serde_json::Value`] rather than a [`ServerMessage`].

use serde::{Deserialize, Serialize};

use crate::session::SessionKind;

/// Text of the notice sent when a chat worker is being replaced
pub const RESTART_NOTICE: &str = "Chat service restarting...";

/// Text of the notice sent when a worker cannot be started
///
/// Deliberately generic: spawn diagnostics stay in the logs.
pub const UNAVAILABLE_NOTICE: &str = "Service unavailable. Please try again later.";

/// Messages from a client to the gateway
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// One still image to analyze
    Frame {
        /// Data-URI encoded image
        image: String,
    },
    /// One question for the chat worker
    Query {
        /// Question text
        query: String,
    },
}

impl ClientMessage {
    /// The `type` tag of this message
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Frame { .. } => "frame",
            Self::Query { .. } => "query",
        }
    }

    /// Session kind this message belongs to
    #[must_use]
    pub fn expected_kind(&self) -> SessionKind {
        match self {
            Self::Frame { .. } => SessionKind::Recognition,
            Self::Query { .. } => SessionKind::Chat,
        }
    }
}

/// Messages the gateway itself produces for a client
///
/// Worker output is not converted into this type; it is forwarded as-is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Status or lifecycle notice
    System {
        /// Notice text
        message: String,
    },
    /// Recoverable error, safe for display
    Error {
        /// Error text
        message: String,
    },
}

impl ServerMessage {
    /// Build a `system` notice
    #[must_use]
    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// Build an `error` notice
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Notice sent once a Session's worker is running
    #[must_use]
    pub fn connected(kind: SessionKind) -> Self {
        Self::system(format!("Connected to {kind} service"))
    }

    /// Notice sent before a chat worker is replaced
    #[must_use]
    pub fn restarting() -> Self {
        Self::system(RESTART_NOTICE)
    }

    /// Notice sent when no worker could be started
    #[must_use]
    pub fn unavailable() -> Self {
        Self::error(UNAVAILABLE_NOTICE)
    }

    /// Convert to a JSON value for the outbound relay
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        // Every variant is a plain struct of strings
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// One request written to a worker's standard input
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerRequest {
    /// Frame for a recognition worker
    Recognition {
        /// Data-URI encoded image
        image: String,
        /// Milliseconds since the Unix epoch, attached by the gateway
        timestamp: i64,
    },
    /// Question for a chat worker
    Chat {
        /// Question text
        query: String,
        /// Milliseconds since the Unix epoch, attached by the gateway
        timestamp: i64,
    },
}

impl WorkerRequest {
    /// Build the worker request for a client message, stamped with `timestamp`
    #[must_use]
    pub fn from_client(message: ClientMessage, timestamp: i64) -> Self {
        match message {
            ClientMessage::Frame { image } => Self::Recognition { image, timestamp },
            ClientMessage::Query { query } => Self::Chat { query, timestamp },
        }
    }

    /// Server-side timestamp in milliseconds
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        match self {
            Self::Recognition { timestamp, .. } | Self::Chat { timestamp, .. } => *timestamp,
        }
    }
}
