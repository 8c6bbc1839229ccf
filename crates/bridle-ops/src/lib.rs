//! Ops wire protocol and transport.
//!
//! Implements the relay control channel: a versioned JSON frame protocol
//! over websockets with an explicit handshake, request/response correlation,
//! transparent chunking of oversized payloads, application-level heartbeats,
//! and capped-backoff reconnection.
//!
//! The layering is deliberate:
//!
//! - [`frames`] defines the wire shapes and nothing else.
//! - [`conn`] is a transport-agnostic connection state machine driven by
//!   [`conn::OpsConnection::handle_frame`]; it owns correlation, chunk
//!   reassembly, and pending-request bookkeeping.
//! - [`client`] binds a connection to a real websocket and runs the
//!   writer/reader/heartbeat tasks.
//!
//! Servers reuse [`frames`], [`chunk`], and [`codes`] directly and drive
//! their own accept loop.

#![deny(unsafe_code)]

pub mod chunk;
pub mod client;
pub mod codes;
pub mod conn;
pub mod error;
pub mod frames;
pub mod heartbeat;
pub mod reconnect;

pub use chunk::{ChunkAssembly, ChunkError, DEFAULT_CHUNK_BYTES, split};
pub use client::{CloseReason, OpsClient, OpsClientConfig, PROTOCOL_VERSION};
pub use conn::{ConnState, OpsConnection, PushEvent};
pub use error::OpsError;
pub use frames::{OpsErrorBody, OpsFrame};
pub use heartbeat::{HeartbeatConfig, HeartbeatOutcome, run_heartbeat};
pub use reconnect::{ReconnectState, Reconnector, ScheduledAttempt};
