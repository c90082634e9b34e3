//! Connection Gateway
//!
//! Accepts one client WebSocket connection, picks the Session kind from the
//! request path, opens a Session through the supervisor and relays messages
//! in both directions until the client goes away.
//!
//! # Relay
//!
//! ```text
//!   client ──Text──► classify_inbound() ──► supervisor.send() ──► worker stdin
//!   client ◄─Text─── writer task ◄── ClientSink ◄── supervision task ◄── stdout
//! ```
//!
//! Inbound messages of the wrong shape are logged and dropped; the connection
//! stays open. When the client disconnects for any reason the Session is torn
//! down.
//!
//! An unrecognized path falls back to a recognition Session.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, InboundError};
use crate::framer::preview;
use crate::protocol::{ClientMessage, WorkerRequest};
use crate::session::{ClientSink, SessionId, SessionKind};
use crate::supervisor::WorkerSupervisor;

/// Default path for recognition connections
pub const DEFAULT_RECOGNITION_PATH: &str = "/recognition";

/// Default path for chat connections
pub const DEFAULT_CHAT_PATH: &str = "/chat";

/// Default largest accepted client message (16MB, room for a large frame)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Connection targets and the Session kind each selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routes {
    /// Path that opens a recognition Session
    pub recognition_path: String,
    /// Path that opens a chat Session
    pub chat_path: String,
}

impl Default for Routes {
    fn default() -> Self {
        Self {
            recognition_path: DEFAULT_RECOGNITION_PATH.to_string(),
            chat_path: DEFAULT_CHAT_PATH.to_string(),
        }
    }
}

impl Routes {
    /// Match a request target exactly, ignoring query string and trailing slash
    #[must_use]
    pub fn classify(&self, target: &str) -> Option<SessionKind> {
        let path = normalize(target);
        if path == normalize(&self.chat_path) {
            Some(SessionKind::Chat)
        } else if path == normalize(&self.recognition_path) {
            Some(SessionKind::Recognition)
        } else {
            None
        }
    }

    /// Session kind for a request target, falling back to recognition
    #[must_use]
    pub fn kind_for(&self, target: &str) -> SessionKind {
        self.classify(target).unwrap_or_else(|| {
            warn!(target_path = %target, "Unrecognized connection target, using recognition");
            SessionKind::Recognition
        })
    }
}

fn normalize(target: &str) -> &str {
    let path = target.split_once('?').map_or(target, |(path, _)| path);
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// Gateway settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Connection targets
    pub routes: Routes,
    /// Largest accepted client message in bytes
    pub max_message_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            routes: Routes::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl GatewayConfig {
    fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }
}

/// Turn one client text message into a worker request
///
/// # Errors
///
/// Returns `InboundError::Malformed` for invalid JSON, and
/// `InboundError::UnexpectedShape` for anything other than a `frame` on a
/// recognition Session or a `query` on a chat Session.
pub fn classify_inbound(
    kind: SessionKind,
    text: &str,
    timestamp: i64,
) -> Result<WorkerRequest, InboundError> {
    let value: Value = serde_json::from_str(text).map_err(InboundError::Malformed)?;
    let message_type = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("<missing>")
        .to_string();

    let message: ClientMessage = serde_json::from_value(value)
        .map_err(|_| InboundError::UnexpectedShape { kind, message_type })?;

    if message.expected_kind() != kind {
        return Err(InboundError::UnexpectedShape {
            kind,
            message_type: message.type_name().to_string(),
        });
    }

    Ok(WorkerRequest::from_client(message, timestamp))
}

/// Accepts client connections and binds each one to a Session
#[derive(Debug, Clone)]
pub struct Gateway {
    supervisor: WorkerSupervisor,
    config: Arc<GatewayConfig>,
}

impl Gateway {
    /// Create a gateway in front of a supervisor
    #[must_use]
    pub fn new(supervisor: WorkerSupervisor, config: GatewayConfig) -> Self {
        Self {
            supervisor,
            config: Arc::new(config),
        }
    }

    /// The supervisor Sessions are opened through
    #[must_use]
    pub fn supervisor(&self) -> &WorkerSupervisor {
        &self.supervisor
    }

    /// Current settings
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Serve one client connection to completion
    ///
    /// Returns once the client has disconnected and its Session is torn down.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Handshake` if the WebSocket upgrade fails. No
    /// Session is created in that case.
    pub async fn serve_connection<S>(&self, stream: S) -> Result<(), GatewayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut target = String::new();
        let capture_target =
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                target = request.uri().to_string();
                Ok(response)
            };

        let ws = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            capture_target,
            Some(self.config.websocket_config()),
        )
        .await
        .map_err(GatewayError::Handshake)?;

        let kind = self.config.routes.kind_for(&target);
        let (client, mut outbound) = ClientSink::channel();
        let (mut sink, mut source) = ws.split();

        let id = match self.supervisor.open_session(kind, client) {
            Ok(id) => id,
            Err(e) => {
                debug!(kind = %kind, error = %e, "Closing connection without a session");
                // Deliver the queued unavailable notice, then close
                while let Ok(value) = outbound.try_recv() {
                    if sink.send(Message::Text(value.to_string())).await.is_err() {
                        break;
                    }
                }
                let _ = sink.close().await;
                return Ok(());
            }
        };

        // Ends without closing the transport when the Session goes away, so a
        // crashed recognition worker leaves the connection open
        let writer = tokio::spawn(async move {
            while let Some(value) = outbound.recv().await {
                if let Err(e) = sink.send(Message::Text(value.to_string())).await {
                    debug!(error = %e, "Client transport closed");
                    break;
                }
            }
        });

        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => self.forward_inbound(id, kind, &text),
                Ok(Message::Binary(data)) => {
                    debug!(session = %id, len = data.len(), "Ignoring binary client message");
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(session = %id, error = %e, "Client transport error");
                    break;
                }
            }
        }

        self.supervisor.teardown(id);
        writer.abort();
        info!(session = %id, kind = %kind, "Client disconnected");
        Ok(())
    }

    fn forward_inbound(&self, id: SessionId, kind: SessionKind, text: &str) {
        let timestamp = chrono::Utc::now().timestamp_millis();
        match classify_inbound(kind, text, timestamp) {
            Ok(request) => {
                if let Err(e) = self.supervisor.send(id, &request) {
                    debug!(session = %id, error = %e, "Dropping client message");
                }
            }
            Err(e @ InboundError::Malformed(_)) => {
                warn!(
                    session = %id,
                    error = %e,
                    message = %preview(text),
                    "Dropping malformed client message"
                );
            }
            Err(e) => {
                warn!(session = %id, error = %e, "Dropping client message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_routes_classify_known_targets() {
        let routes = Routes::default();
        assert_eq!(routes.classify("/chat"), Some(SessionKind::Chat));
        assert_eq!(routes.classify("/recognition"), Some(SessionKind::Recognition));
        assert_eq!(routes.classify("/chat?token=abc"), Some(SessionKind::Chat));
        assert_eq!(routes.classify("/chat/"), Some(SessionKind::Chat));
    }

    #[test]
    fn test_routes_fallback_to_recognition() {
        let routes = Routes::default();
        assert_eq!(routes.classify("/"), None);
        assert_eq!(routes.classify("/chatty"), None);
        assert_eq!(routes.kind_for("/anything"), SessionKind::Recognition);
        assert_eq!(routes.kind_for("/"), SessionKind::Recognition);
    }

    #[test]
    fn test_classify_frame_for_recognition() {
        let request = classify_inbound(
            SessionKind::Recognition,
            r#"{"type":"frame","image":"data:image/jpeg;base64,AAAA"}"#,
            1_700_000_000_123,
        )
        .unwrap();
        assert_eq!(
            request,
            WorkerRequest::Recognition {
                image: "data:image/jpeg;base64,AAAA".to_string(),
                timestamp: 1_700_000_000_123,
            }
        );
    }

    #[test]
    fn test_classify_query_for_chat() {
        let request =
            classify_inbound(SessionKind::Chat, r#"{"type":"query","query":"hi"}"#, 9).unwrap();
        assert_eq!(request.timestamp(), 9);
    }

    #[test]
    fn test_classify_rejects_wrong_kind() {
        let err = classify_inbound(SessionKind::Chat, r#"{"type":"frame","image":"x"}"#, 0)
            .unwrap_err();
        assert_eq!(err.to_string(), "Unexpected frame message for a chat session");
    }

    #[test]
    fn test_classify_rejects_unknown_or_missing_type() {
        let err =
            classify_inbound(SessionKind::Recognition, r#"{"type":"hello"}"#, 0).unwrap_err();
        assert!(matches!(
            err,
            InboundError::UnexpectedShape { ref message_type, .. } if message_type == "hello"
        ));

        let err = classify_inbound(SessionKind::Recognition, r#"{"image":"x"}"#, 0).unwrap_err();
        assert!(matches!(
            err,
            InboundError::UnexpectedShape { ref message_type, .. } if message_type == "<missing>"
        ));

        // Right type, missing payload
        let err = classify_inbound(SessionKind::Recognition, r#"{"type":"frame"}"#, 0).unwrap_err();
        assert!(matches!(err, InboundError::UnexpectedShape { .. }));
    }

    #[test]
    fn test_classify_rejects_invalid_json() {
        let err = classify_inbound(SessionKind::Chat, "not json", 0).unwrap_err();
        assert!(matches!(err, InboundError::Malformed(_)));
    }

    #[test]
    fn test_connection_future_is_send() {
        fn assert_send<T: Send>(_: T) {}

        let gateway = Gateway::new(
            WorkerSupervisor::with_process_launcher(crate::SupervisorConfig::default()),
            GatewayConfig::default(),
        );
        let (stream, _client) = tokio::io::duplex(1024);
        assert_send(gateway.serve_connection(stream));
    }

    #[test]
    fn test_websocket_config_limits() {
        let config = GatewayConfig {
            max_message_size: 1024,
            ..GatewayConfig::default()
        };
        let ws = config.websocket_config();
        assert_eq!(ws.max_message_size, Some(1024));
    }
}
