//! Bridge Core - Connection-to-Worker Stream Supervision
//!
//! This crate pairs each client WebSocket connection with its own long-running
//! worker process (face recognition or conversational retrieval), frames the
//! byte streams in both directions into JSON messages, and guarantees that no
//! worker outlives the connection it serves.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Clients                                  │
//! │     ws://host/recognition              ws://host/chat            │
//! └───────────────┬─────────────────────────────────┬────────────────┘
//!                 │ frame ▲ recognition_result      │ query ▲ response
//! ┌───────────────┼─────────────────────────────────┼────────────────┐
//! │               ▼          BRIDGE CORE            ▼                │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │                        Gateway                             │  │
//! │  └─────────────────────────────┬──────────────────────────────┘  │
//! │  ┌─────────────────────────────┴──────────────────────────────┐  │
//! │  │                   WorkerSupervisor                         │  │
//! │  │    registry: SessionId ──► Session { kind, WorkerHandle }  │  │
//! │  └──────┬───────────────────────┬──────────────────────┬──────┘  │
//! │         │ stdin/stdout (NDJSON) │                      │         │
//! │    ┌────▼─────┐           ┌─────▼────┐           ┌─────▼────┐    │
//! │    │ worker 1 │           │ worker 2 │    ...    │ worker n │    │
//! │    └──────────┘           └──────────┘           └──────────┘    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Gateway`]: Accepts one connection and relays it to a Session
//! - [`WorkerSupervisor`]: Owns the Session registry, restart policy and teardown
//! - [`WorkerHandle`]: Control side of one worker process
//! - [`FrameDecoder`]: Chunk-invariant newline-delimited JSON decoder
//! - [`BridgeConfig`]: TOML + environment configuration
//!
//! # Quick Start
//!
//! ```ignore
//! use bridge_core::{load_config, Gateway, WorkerSupervisor};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let supervisor = WorkerSupervisor::with_process_launcher(config.supervisor_config());
//!     let gateway = Gateway::new(supervisor, config.gateway_config());
//!
//!     let listener = TcpListener::bind(&config.bind_address).await?;
//!     loop {
//!         let (stream, _) = listener.accept().await?;
//!         let gateway = gateway.clone();
//!         tokio::spawn(async move { gateway.serve_connection(stream).await });
//!     }
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`framer`]: Line framing and JSON decoding of byte streams
//! - [`protocol`]: Client, gateway and worker message shapes
//! - [`worker`]: Worker process handle and launcher seam
//! - [`session`]: Session identity, kind and state
//! - [`supervisor`]: Session registry and the spawn/restart/teardown state machine
//! - [`gateway`]: WebSocket connection handling
//! - [`config`]: Configuration loading
//! - [`error`]: Error types

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod framer;
pub mod gateway;
pub mod protocol;
pub mod session;
pub mod supervisor;
pub mod worker;

pub use config::{
    default_config_path, load_config, load_config_from_path, BridgeConfig, ConfigError,
    ConfigOverrides, ConfigSource,
};
pub use error::{FrameError, GatewayError, InboundError, SupervisorError, WorkerError};
pub use framer::{encode, Frame, FrameDecoder, LineDecoder, MAX_LINE_SIZE};
pub use gateway::{classify_inbound, Gateway, GatewayConfig, Routes};
pub use protocol::{ClientMessage, ServerMessage, WorkerRequest};
pub use session::{ClientSink, Session, SessionId, SessionInfo, SessionKind, SessionState};
pub use supervisor::{SessionSummary, SupervisorConfig, WorkerProgram, WorkerSupervisor};
pub use worker::{
    ExitNotice, ProcessLauncher, WorkerCommand, WorkerEvents, WorkerHandle, WorkerLauncher,
    WorkerOutput,
};
